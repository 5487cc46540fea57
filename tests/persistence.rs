//! Persistence and recovery tests for the kgrl engine.
//!
//! These verify that the graph, including retired edges and evidence counts,
//! survives a persist + reopen cycle, and that a corrupt snapshot fails the
//! whole load instead of producing a partial graph.

use kgrl_engine::config::EngineConfig;
use kgrl_engine::engine::Engine;
use kgrl_engine::error::{KgError, StoreError};
use kgrl_engine::graph::store::GraphStore;
use kgrl_engine::graph::{FactKey, NodeSpec, Relation};
use kgrl_engine::retrieve::Query;
use kgrl_engine::store::durable::SnapshotStore;
use kgrl_engine::store::snapshot::{GraphSnapshot, json_versions};
use kgrl_engine::update::CandidateFact;

fn persistent_config(dir: &std::path::Path) -> EngineConfig {
    let mut config = EngineConfig::default();
    config.data_dir = Some(dir.to_path_buf());
    config.update.decay_factor = 0.1;
    config
}

fn contains(s: &str, o: &str, confidence: f32) -> CandidateFact {
    CandidateFact::new(
        NodeSpec::entity(s),
        Relation::Contains,
        NodeSpec::entity(o),
        confidence,
    )
}

fn key(s: &str, o: &str) -> FactKey {
    FactKey {
        subject: s.into(),
        relation: Relation::Contains,
        object: o.into(),
    }
}

#[test]
fn graph_survives_restart() {
    let dir = tempfile::TempDir::new().unwrap();

    // First session: build a graph with one retired edge and persist.
    {
        let engine = Engine::open(persistent_config(dir.path())).unwrap();
        engine.submit_evidence(&contains("kitchen", "fridge", 0.9)).unwrap();
        engine.submit_evidence(&contains("kitchen", "fridge", 0.7)).unwrap();
        engine.submit_evidence(&contains("garden", "shovel", 0.6)).unwrap();
        engine.decay_sweep(); // fridge 0.08, shovel 0.06
        engine.decay_sweep(); // both retired
        engine.submit_evidence(&contains("kitchen", "oven", 0.8)).unwrap();
        assert_eq!(engine.persist().unwrap(), Some(1));
    }

    // Second session: everything restored, retired edges stay retired.
    let engine = Engine::open(persistent_config(dir.path())).unwrap();
    let fridge = engine.fact(&key("kitchen", "fridge")).unwrap();
    assert!(fridge.retired);
    assert_eq!(fridge.evidence_count, 2);
    let oven = engine.fact(&key("kitchen", "oven")).unwrap();
    assert!(!oven.retired);
    assert!((oven.confidence - 0.8).abs() < 1e-6);

    let ranked = engine.retrieve(&Query::keyword(&["kitchen"])).unwrap();
    assert_eq!(ranked.len(), 1);
    assert_eq!(ranked.top().unwrap().object.as_str(), "oven");

    // New edges continue the id sequence instead of reusing ids.
    let outcome = engine.submit_evidence(&contains("hallway", "lamp", 0.9)).unwrap();
    let lamp = outcome.fact().unwrap();
    assert!(lamp.edge_id > oven.edge_id);
    assert!(lamp.edge_id > fridge.edge_id);
    assert_eq!(engine.persist().unwrap(), Some(2));
}

#[test]
fn json_and_durable_snapshots_agree() {
    let dir = tempfile::TempDir::new().unwrap();
    let engine = Engine::open(persistent_config(dir.path())).unwrap();
    engine.submit_evidence(&contains("kitchen", "fridge", 0.9)).unwrap();
    engine.persist().unwrap();
    engine.submit_evidence(&contains("kitchen", "oven", 0.9)).unwrap();
    engine.persist().unwrap();
    drop(engine);

    assert_eq!(json_versions(dir.path()).unwrap(), vec![1, 2]);
    let durable = SnapshotStore::open(dir.path()).unwrap();
    assert_eq!(durable.versions().unwrap(), vec![1, 2]);
    for version in [1, 2] {
        let from_json = GraphSnapshot::load_version(dir.path(), version).unwrap();
        assert_eq!(durable.get(version).unwrap(), from_json);
    }
    assert_eq!(durable.get(1).unwrap().edges.len(), 1);
    assert_eq!(durable.latest().unwrap().unwrap().edges.len(), 2);
}

#[test]
fn dangling_edge_fails_whole_load() {
    let dir = tempfile::TempDir::new().unwrap();
    let store = GraphStore::new();
    store.upsert_node(NodeSpec::entity("kitchen")).unwrap();
    store.upsert_node(NodeSpec::entity("fridge")).unwrap();
    store
        .upsert_edge(kgrl_engine::graph::EdgeSpec::new(
            "kitchen",
            Relation::Contains,
            "fridge",
        ))
        .unwrap();
    let mut snapshot = store.snapshot(3);
    snapshot.nodes.retain(|n| n.id.as_str() == "kitchen");
    let path = snapshot.save_json(dir.path()).unwrap();

    let loaded = GraphSnapshot::load_json(&path).unwrap();
    assert!(matches!(
        GraphStore::from_snapshot(&loaded),
        Err(StoreError::ConsistencyViolation { .. })
    ));
    assert!(matches!(
        Engine::open(persistent_config(dir.path())),
        Err(KgError::Store(StoreError::ConsistencyViolation { .. }))
    ));
}

#[test]
fn missing_version_reported() {
    let dir = tempfile::TempDir::new().unwrap();
    assert!(matches!(
        GraphSnapshot::load_version(dir.path(), 5),
        Err(StoreError::SnapshotNotFound { version: 5 })
    ));
    // An empty data dir opens as an empty engine.
    let engine = Engine::open(persistent_config(dir.path())).unwrap();
    assert_eq!(engine.info().node_count, 0);
    assert_eq!(engine.info().version, 0);
}
