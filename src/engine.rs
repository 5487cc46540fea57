//! Engine facade: top-level API for the kgrl knowledge engine.
//!
//! The `Engine` owns the shared subsystems (graph store, indexer, retriever,
//! updater, snapshot persistence). It is created at experiment start, shared
//! between controllers as a [`GraphStoreHandle`], and dropped at the end.

use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::EngineConfig;
use crate::error::{ConfigError, KgResult};
use crate::graph::store::{DecayReport, GraphStore};
use crate::graph::traverse::{GraphPath, find_paths};
use crate::graph::{Fact, FactKey, NodeId, NodeSpec};
use crate::index::{EmbeddingProvider, HashingEmbedder, Indexer};
use crate::retrieve::{Query, RankedFacts, Retriever};
use crate::store::durable::SnapshotStore;
use crate::store::snapshot::{GraphSnapshot, json_versions};
use crate::update::{CandidateFact, UpdateOutcome, Updater};

/// Shared handle to one engine instance.
pub type GraphStoreHandle = Arc<Engine>;

/// The knowledge graph engine.
pub struct Engine {
    config: EngineConfig,
    graph: Arc<GraphStore>,
    indexer: Arc<Indexer>,
    retriever: Retriever,
    updater: Updater,
    durable: Option<SnapshotStore>,
    /// Version of the last snapshot written or loaded.
    version: AtomicU64,
}

impl Engine {
    /// Create an empty engine. The configured `hashing_dimension`, if any,
    /// selects the built-in embedder.
    pub fn new(config: EngineConfig) -> KgResult<Self> {
        let embedder = config
            .index
            .hashing_dimension
            .map(|dim| Arc::new(HashingEmbedder::new(dim)) as Arc<dyn EmbeddingProvider>);
        Self::build(config, embedder, GraphStore::new(), 0)
    }

    /// Create an empty engine with an explicit embedding provider.
    pub fn with_embedder(
        config: EngineConfig,
        embedder: Arc<dyn EmbeddingProvider>,
    ) -> KgResult<Self> {
        Self::build(config, Some(embedder), GraphStore::new(), 0)
    }

    /// Create an engine from the newest snapshot in `data_dir`.
    ///
    /// The redb store is consulted first, then JSON files. With no
    /// `data_dir`, or no snapshot yet, the engine starts empty.
    pub fn open(config: EngineConfig) -> KgResult<Self> {
        let embedder = config
            .index
            .hashing_dimension
            .map(|dim| Arc::new(HashingEmbedder::new(dim)) as Arc<dyn EmbeddingProvider>);
        let Some(dir) = config.data_dir.clone() else {
            return Self::build(config, embedder, GraphStore::new(), 0);
        };
        match Self::latest_snapshot(&dir)? {
            Some(snapshot) => {
                let graph = GraphStore::from_snapshot(&snapshot)?;
                tracing::info!(
                    version = snapshot.version,
                    nodes = snapshot.nodes.len(),
                    edges = snapshot.edges.len(),
                    "restored graph from snapshot"
                );
                Self::build(config, embedder, graph, snapshot.version)
            }
            None => Self::build(config, embedder, GraphStore::new(), 0),
        }
    }

    fn latest_snapshot(dir: &Path) -> KgResult<Option<GraphSnapshot>> {
        let durable = SnapshotStore::open(dir)?;
        if let Some(snapshot) = durable.latest()? {
            return Ok(Some(snapshot));
        }
        match json_versions(dir)?.last() {
            Some(&version) => Ok(Some(GraphSnapshot::load_version(dir, version)?)),
            None => Ok(None),
        }
    }

    fn build(
        config: EngineConfig,
        embedder: Option<Arc<dyn EmbeddingProvider>>,
        graph: GraphStore,
        version: u64,
    ) -> KgResult<Self> {
        config.validate()?;
        if let (Some(dim), Some(provider)) = (config.index.hashing_dimension, embedder.as_ref()) {
            if dim != provider.dimension() {
                return Err(ConfigError::Invalid {
                    message: format!(
                        "index.hashing_dimension is {dim} but the embedder produces {} dimensions",
                        provider.dimension()
                    ),
                }
                .into());
            }
        }

        let durable = match config.data_dir {
            Some(ref dir) => Some(SnapshotStore::open(dir)?),
            None => None,
        };

        tracing::info!(
            persistent = durable.is_some(),
            dimension = embedder.as_ref().map(|e| e.dimension()).unwrap_or(0),
            accept_threshold = config.update.accept_threshold,
            floor = config.update.soft_retire_floor,
            "initializing kgrl engine"
        );

        let graph = Arc::new(graph);
        let indexer = Arc::new(Indexer::new(embedder, config.index.rebuild_tombstone_ratio));
        indexer.reindex_all(&graph);
        let retriever = Retriever::new(
            Arc::clone(&graph),
            Arc::clone(&indexer),
            config.retrieval.clone(),
            config.update.soft_retire_floor,
        );
        let updater = Updater::new(
            Arc::clone(&graph),
            Arc::clone(&indexer),
            config.update.clone(),
        );

        Ok(Self {
            config,
            graph,
            indexer,
            retriever,
            updater,
            durable,
            version: AtomicU64::new(version),
        })
    }

    /// Retrieve with the configured `max_results`.
    pub fn retrieve(&self, query: &Query) -> KgResult<RankedFacts> {
        Ok(self.retriever.retrieve(query)?)
    }

    /// Retrieve at most `k` facts.
    pub fn retrieve_k(&self, query: &Query, k: usize) -> KgResult<RankedFacts> {
        Ok(self.retriever.retrieve_k(query, k)?)
    }

    /// Submit one piece of evidence.
    pub fn submit_evidence(&self, candidate: &CandidateFact) -> KgResult<UpdateOutcome> {
        Ok(self.updater.submit_evidence(candidate)?)
    }

    /// Create or update a node; a relabel re-indexes the node's facts.
    pub fn upsert_node(&self, spec: NodeSpec) -> KgResult<NodeId> {
        Ok(self.updater.upsert_node(spec)?)
    }

    /// Decay every live edge once.
    pub fn decay_sweep(&self) -> DecayReport {
        self.updater.decay_sweep()
    }

    /// Simple paths between two nodes over live edges.
    pub fn find_paths(
        &self,
        source: &NodeId,
        target: &NodeId,
        max_len: usize,
        limit: usize,
    ) -> KgResult<Vec<GraphPath>> {
        let floor = self.config.update.soft_retire_floor;
        Ok(self
            .graph
            .read(|g| find_paths(g, source, target, max_len, limit, floor))?)
    }

    /// Current copy of a fact, retired or not.
    pub fn fact(&self, key: &FactKey) -> Option<Fact> {
        self.graph.find_fact(key)
    }

    /// Capture the graph at the current version without writing it anywhere.
    pub fn snapshot(&self) -> GraphSnapshot {
        self.graph.snapshot(self.version.load(Ordering::SeqCst))
    }

    /// Write a new snapshot version to `data_dir`, both as JSON and into the
    /// durable store. Returns the new version, or `None` for a memory-only
    /// engine.
    pub fn persist(&self) -> KgResult<Option<u64>> {
        let (Some(dir), Some(durable)) = (self.config.data_dir.as_ref(), self.durable.as_ref())
        else {
            return Ok(None);
        };
        let version = self.version.fetch_add(1, Ordering::SeqCst) + 1;
        let snapshot = self.graph.snapshot(version);
        snapshot.save_json(dir)?;
        durable.put(&snapshot)?;
        tracing::info!(version, "engine state persisted");
        Ok(Some(version))
    }

    /// Get the graph store handle.
    pub fn graph(&self) -> &Arc<GraphStore> {
        &self.graph
    }

    /// Get the indexer handle.
    pub fn indexer(&self) -> &Arc<Indexer> {
        &self.indexer
    }

    pub fn retriever(&self) -> &Retriever {
        &self.retriever
    }

    pub fn updater(&self) -> &Updater {
        &self.updater
    }

    /// Get the engine configuration.
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Summary counters across subsystems.
    pub fn info(&self) -> EngineInfo {
        let graph = self.graph.stats();
        let index = self.indexer.stats();
        let updates = self.updater.stats();
        let retrievals = self.retriever.stats();
        EngineInfo {
            node_count: graph.node_count,
            live_edge_count: graph.live_edge_count,
            retired_edge_count: graph.retired_edge_count,
            indexed_facts: index.indexed,
            tombstones: index.tombstones,
            dimension: self.indexer.dimension(),
            accepted: updates.accepted,
            merged: updates.merged,
            conflicted: updates.conflicted,
            rejected: updates.rejected,
            queries: retrievals.queries,
            version: self.version.load(Ordering::SeqCst),
            persistent: self.durable.is_some(),
        }
    }
}

/// Summary information about the engine state.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineInfo {
    pub node_count: usize,
    pub live_edge_count: usize,
    pub retired_edge_count: usize,
    pub indexed_facts: usize,
    pub tombstones: usize,
    pub dimension: Option<usize>,
    pub accepted: u64,
    pub merged: u64,
    pub conflicted: u64,
    pub rejected: u64,
    pub queries: u64,
    pub version: u64,
    pub persistent: bool,
}

impl std::fmt::Display for EngineInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "kgrl engine info")?;
        writeln!(f, "  nodes:        {}", self.node_count)?;
        writeln!(
            f,
            "  edges:        {} live, {} retired",
            self.live_edge_count, self.retired_edge_count
        )?;
        writeln!(
            f,
            "  index:        {} facts, {} tombstones",
            self.indexed_facts, self.tombstones
        )?;
        match self.dimension {
            Some(dim) => writeln!(f, "  embeddings:   {dim} dims")?,
            None => writeln!(f, "  embeddings:   off")?,
        }
        writeln!(
            f,
            "  updates:      {} accepted, {} merged, {} conflicted, {} rejected",
            self.accepted, self.merged, self.conflicted, self.rejected
        )?;
        writeln!(f, "  queries:      {}", self.queries)?;
        writeln!(f, "  version:      {}", self.version)?;
        writeln!(f, "  persistent:   {}", self.persistent)?;
        Ok(())
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("config", &self.config)
            .field("graph", &self.graph)
            .field("indexer", &self.indexer)
            .field("version", &self.version.load(Ordering::SeqCst))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{KgError, StoreError};
    use crate::graph::Relation;

    fn config() -> EngineConfig {
        let mut config = EngineConfig::default();
        config.index.hashing_dimension = Some(32);
        config
    }

    fn seed(engine: &Engine) {
        for (s, o) in [("kitchen", "fridge"), ("hallway", "lamp")] {
            let outcome = engine
                .submit_evidence(&CandidateFact::new(
                    NodeSpec::entity(s),
                    Relation::Contains,
                    NodeSpec::entity(o),
                    0.9,
                ))
                .unwrap();
            assert_eq!(outcome.tag(), "accepted");
        }
    }

    #[test]
    fn create_memory_only_engine() {
        let engine = Engine::new(config()).unwrap();
        let info = engine.info();
        assert_eq!(info.dimension, Some(32));
        assert!(!info.persistent);
        assert_eq!(engine.persist().unwrap(), None);
    }

    #[test]
    fn relabeled_node_found_by_new_label() {
        let engine = Engine::new(config()).unwrap();
        seed(&engine);
        engine
            .upsert_node(NodeSpec::entity("fridge").with_label("refrigerator"))
            .unwrap();
        let ranked = engine
            .retrieve(&Query::keyword(&["refrigerator"]))
            .unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked.top().unwrap().object_label, "refrigerator");
    }

    #[test]
    fn invalid_config_rejected() {
        let mut bad = config();
        bad.update.accept_threshold = 2.0;
        assert!(matches!(Engine::new(bad), Err(KgError::Config(_))));
    }

    #[test]
    fn mismatched_embedder_rejected() {
        let result = Engine::with_embedder(config(), Arc::new(HashingEmbedder::new(16)));
        assert!(matches!(result, Err(KgError::Config(_))));
    }

    #[test]
    fn submit_then_retrieve() {
        let engine = Engine::new(config()).unwrap();
        seed(&engine);
        let ranked = engine.retrieve(&Query::keyword(&["fridge"])).unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked.top().unwrap().object, NodeId::from("fridge"));

        let info = engine.info();
        assert_eq!(info.node_count, 4);
        assert_eq!(info.live_edge_count, 2);
        assert_eq!(info.accepted, 2);
        assert_eq!(info.queries, 1);
        assert!(info.to_string().contains("2 live"));
    }

    #[test]
    fn persist_and_reopen() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut cfg = config();
        cfg.data_dir = Some(dir.path().to_path_buf());
        {
            let engine = Engine::new(cfg.clone()).unwrap();
            seed(&engine);
            assert_eq!(engine.persist().unwrap(), Some(1));
            assert_eq!(engine.persist().unwrap(), Some(2));
        }
        assert!(dir.path().join("graph_v2.json").exists());

        let engine = Engine::open(cfg).unwrap();
        let info = engine.info();
        assert_eq!(info.version, 2);
        assert_eq!(info.live_edge_count, 2);
        assert_eq!(info.indexed_facts, 2);
        let ranked = engine.retrieve(&Query::keyword(&["lamp"])).unwrap();
        assert_eq!(ranked.len(), 1);
    }

    #[test]
    fn open_falls_back_to_json() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = Engine::new(config()).unwrap();
        seed(&source);
        source.graph().snapshot(7).save_json(dir.path()).unwrap();

        let mut cfg = config();
        cfg.data_dir = Some(dir.path().to_path_buf());
        let engine = Engine::open(cfg).unwrap();
        assert_eq!(engine.info().version, 7);
        assert_eq!(engine.graph().edge_count(), 2);
    }

    #[test]
    fn open_rejects_dangling_snapshot() {
        let dir = tempfile::TempDir::new().unwrap();
        let source = Engine::new(config()).unwrap();
        seed(&source);
        let mut snapshot = source.graph().snapshot(1);
        snapshot.nodes.retain(|n| n.id.as_str() != "fridge");
        snapshot.save_json(dir.path()).unwrap();

        let mut cfg = config();
        cfg.data_dir = Some(dir.path().to_path_buf());
        assert!(matches!(
            Engine::open(cfg),
            Err(KgError::Store(StoreError::ConsistencyViolation { .. }))
        ));
    }

    #[test]
    fn find_paths_uses_live_edges() {
        let engine = Engine::new(config()).unwrap();
        seed(&engine);
        let paths = engine
            .find_paths(&"kitchen".into(), &"fridge".into(), 3, 5)
            .unwrap();
        assert_eq!(paths.len(), 1);
        assert!(engine.find_paths(&"nowhere".into(), &"fridge".into(), 3, 5).is_err());
    }
}
