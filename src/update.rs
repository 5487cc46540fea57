//! Evidence intake: validation, aggregation, conflict arbitration, and decay.
//!
//! Every submission runs inside one graph write transaction, behind a gate
//! that serializes submissions so arbitration for a key is never
//! interleaved. Touched edges are re-indexed before the gate is released.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::config::UpdateConfig;
use crate::error::{GraphError, ValidationError};
use crate::graph::store::{DecayReport, GraphState, GraphStore};
use crate::graph::{
    EdgeId, EdgeSpec, Fact, FactKey, NodeId, NodeSpec, Provenance, Relation, check_confidence,
};
use crate::index::Indexer;

/// Edges whose fact text changes when `specs` are upserted.
fn relabeled_edges(g: &GraphState, specs: &[&NodeSpec]) -> Vec<EdgeId> {
    let mut ids: Vec<EdgeId> = specs
        .iter()
        .filter(|spec| g.get_node(&spec.id).is_some_and(|n| n.label != spec.label))
        .flat_map(|spec| g.incident_edges(&spec.id).map(|e| e.id))
        .collect();
    ids.sort();
    ids.dedup();
    ids
}

/// One end of a candidate fact.
#[derive(Debug, Clone, PartialEq)]
pub enum Endpoint {
    /// A node that must already exist.
    Existing(NodeId),
    /// A node to create or update alongside the edge.
    Upsert(NodeSpec),
}

impl Endpoint {
    pub fn id(&self) -> &NodeId {
        match self {
            Endpoint::Existing(id) => id,
            Endpoint::Upsert(spec) => &spec.id,
        }
    }

    fn spec(&self) -> Option<&NodeSpec> {
        match self {
            Endpoint::Existing(_) => None,
            Endpoint::Upsert(spec) => Some(spec),
        }
    }
}

impl From<&str> for Endpoint {
    fn from(id: &str) -> Self {
        Endpoint::Existing(id.into())
    }
}

impl From<NodeId> for Endpoint {
    fn from(id: NodeId) -> Self {
        Endpoint::Existing(id)
    }
}

impl From<NodeSpec> for Endpoint {
    fn from(spec: NodeSpec) -> Self {
        Endpoint::Upsert(spec)
    }
}

/// Evidence for one fact, as extracted by the agent.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateFact {
    pub subject: Endpoint,
    pub relation: Relation,
    pub object: Endpoint,
    /// Source confidence of this piece of evidence.
    pub confidence: f32,
    pub provenance: Provenance,
}

impl CandidateFact {
    pub fn new(
        subject: impl Into<Endpoint>,
        relation: Relation,
        object: impl Into<Endpoint>,
        confidence: f32,
    ) -> Self {
        Self {
            subject: subject.into(),
            relation,
            object: object.into(),
            confidence,
            provenance: Provenance::Inferred,
        }
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }

    pub fn key(&self) -> FactKey {
        FactKey::new(self.subject.id().clone(), self.relation, self.object.id().clone())
    }

    fn edge_spec(&self) -> EdgeSpec {
        EdgeSpec::new(self.subject.id().clone(), self.relation, self.object.id().clone())
            .with_confidence(self.confidence)
            .with_provenance(self.provenance)
    }
}

/// Why a submission changed nothing.
#[derive(Debug, Clone, PartialEq)]
pub enum RejectReason {
    Invalid(ValidationError),
    /// A new fact whose source confidence is under the accept threshold.
    BelowThreshold { confidence: f32, threshold: f32 },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RejectReason::Invalid(e) => write!(f, "invalid: {e}"),
            RejectReason::BelowThreshold {
                confidence,
                threshold,
            } => write!(f, "confidence {confidence} below accept threshold {threshold}"),
        }
    }
}

/// Explicit outcome of every evidence submission.
#[derive(Debug, Clone, PartialEq)]
pub enum UpdateOutcome {
    /// A new edge was created.
    Accepted(Fact),
    /// Evidence was aggregated into an existing edge.
    Merged(Fact),
    Rejected(RejectReason),
    /// A single-valued relation had competing objects. The losers were
    /// halved (and retired if that took them under the floor).
    Conflicted { survivor: Fact, losers: Vec<Fact> },
}

impl UpdateOutcome {
    pub fn tag(&self) -> &'static str {
        match self {
            UpdateOutcome::Accepted(_) => "accepted",
            UpdateOutcome::Merged(_) => "merged",
            UpdateOutcome::Rejected(_) => "rejected",
            UpdateOutcome::Conflicted { .. } => "conflicted",
        }
    }

    pub fn is_rejected(&self) -> bool {
        matches!(self, UpdateOutcome::Rejected(_))
    }

    /// The fact left standing by this submission, if any.
    pub fn fact(&self) -> Option<&Fact> {
        match self {
            UpdateOutcome::Accepted(f) | UpdateOutcome::Merged(f) => Some(f),
            UpdateOutcome::Conflicted { survivor, .. } => Some(survivor),
            UpdateOutcome::Rejected(_) => None,
        }
    }
}

/// Counters over the updater's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpdateStats {
    pub accepted: u64,
    pub merged: u64,
    pub rejected: u64,
    pub conflicted: u64,
    pub retired: u64,
    pub decay_sweeps: u64,
}

#[derive(Debug, Default)]
struct Counters {
    accepted: AtomicU64,
    merged: AtomicU64,
    rejected: AtomicU64,
    conflicted: AtomicU64,
    retired: AtomicU64,
    decay_sweeps: AtomicU64,
}

/// Result of the in-transaction part of a submission.
struct Applied {
    outcome: UpdateOutcome,
    touched: Vec<EdgeId>,
    retired: usize,
}

/// Applies evidence to the graph and keeps the index in step.
pub struct Updater {
    graph: Arc<GraphStore>,
    indexer: Arc<Indexer>,
    config: UpdateConfig,
    gate: Mutex<()>,
    counters: Counters,
}

impl Updater {
    pub fn new(graph: Arc<GraphStore>, indexer: Arc<Indexer>, config: UpdateConfig) -> Self {
        Self {
            graph,
            indexer,
            config,
            gate: Mutex::new(()),
            counters: Counters::default(),
        }
    }

    pub fn config(&self) -> &UpdateConfig {
        &self.config
    }

    /// Submit one piece of evidence.
    ///
    /// Validation failures come back as `Rejected`; a reference to a missing
    /// node is an error. Neither mutates anything.
    pub fn submit_evidence(&self, candidate: &CandidateFact) -> Result<UpdateOutcome, GraphError> {
        let _gate = self.gate.lock().expect("update gate poisoned");
        let applied = self.graph.write(|g| self.apply(g, candidate))?;

        for id in &applied.touched {
            if let Some(fact) = self.graph.fact(*id) {
                self.indexer.index_fact(&fact);
            }
        }
        if applied.retired > 0 {
            self.indexer.maybe_compact();
        }

        let counter = match &applied.outcome {
            UpdateOutcome::Accepted(_) => &self.counters.accepted,
            UpdateOutcome::Merged(_) => &self.counters.merged,
            UpdateOutcome::Rejected(_) => &self.counters.rejected,
            UpdateOutcome::Conflicted { .. } => &self.counters.conflicted,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        self.counters
            .retired
            .fetch_add(applied.retired as u64, Ordering::Relaxed);

        tracing::debug!(
            fact = %candidate.key(),
            confidence = candidate.confidence,
            outcome = applied.outcome.tag(),
            "evidence applied"
        );
        Ok(applied.outcome)
    }

    fn apply(&self, g: &mut GraphState, candidate: &CandidateFact) -> Result<Applied, GraphError> {
        let rejected = |reason| Applied {
            outcome: UpdateOutcome::Rejected(reason),
            touched: Vec::new(),
            retired: 0,
        };

        // 1. validate everything before touching the graph
        if let Err(e) = check_confidence(candidate.confidence) {
            return Ok(rejected(RejectReason::Invalid(e)));
        }
        let pending: Vec<&NodeSpec> = [&candidate.subject, &candidate.object]
            .into_iter()
            .filter_map(Endpoint::spec)
            .collect();
        for spec in &pending {
            if let Err(e) = g.check_node_spec(spec) {
                return Ok(rejected(RejectReason::Invalid(e)));
            }
        }
        let spec = candidate.edge_spec();
        match g.check_edge(&spec, &pending) {
            Ok(()) => {}
            Err(GraphError::Validation(e)) => return Ok(rejected(RejectReason::Invalid(e))),
            Err(other) => return Err(other),
        }

        // 2-3. new facts must clear the accept threshold
        let key = candidate.key();
        if g.find_edge(&key).is_none() && candidate.confidence < self.config.accept_threshold {
            return Ok(rejected(RejectReason::BelowThreshold {
                confidence: candidate.confidence,
                threshold: self.config.accept_threshold,
            }));
        }

        // a relabel changes the text of every fact on the node
        let relabeled = relabeled_edges(g, &pending);
        for node in pending {
            g.upsert_node(node.clone())?;
        }

        // 4. create or aggregate
        let floor = self.config.soft_retire_floor;
        let upsert = g.upsert_edge(spec)?;
        let mut retired = 0;
        let mut revived = false;
        if !upsert.created {
            let was_retired = g.get_edge(upsert.id).is_some_and(|e| e.retired);
            if upsert.confidence < floor && !was_retired {
                g.remove_edge_soft(upsert.id)?;
                retired += 1;
                tracing::warn!(edge = %upsert.id, fact = %key, confidence = upsert.confidence, "edge retired below floor");
            } else if upsert.confidence >= floor && was_retired {
                g.revive_edge(upsert.id)?;
                revived = true;
                tracing::debug!(edge = %upsert.id, fact = %key, "retired edge revived");
            }
        }
        let mut touched = vec![upsert.id];
        for id in relabeled {
            if !touched.contains(&id) {
                touched.push(id);
            }
        }

        // 5. single-valued arbitration, only when this submission can change
        // the standing: a new or revived edge, or one that moved past (or
        // fell behind) a live contender
        let live = g.get_edge(upsert.id).is_some_and(|e| e.is_live(floor));
        if live && self.config.is_single_valued(candidate.relation) {
            let mut contenders: Vec<(EdgeId, f32)> = g
                .edges_from(&key.subject, key.relation)
                .into_iter()
                .filter(|e| e.is_live(floor))
                .map(|e| (e.id, e.confidence))
                .collect();
            let rank_changed = contenders.iter().any(|&(id, confidence)| {
                id != upsert.id
                    && (upsert.previous_confidence > confidence) != (upsert.confidence > confidence)
            });
            if contenders.len() > 1 && (upsert.created || revived || rank_changed) {
                // highest confidence first; on ties incumbents beat the
                // submitted edge, older beats newer
                contenders.sort_by(|a, b| {
                    b.1.partial_cmp(&a.1)
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then((a.0 == upsert.id).cmp(&(b.0 == upsert.id)))
                        .then(a.0.cmp(&b.0))
                });
                let winner = contenders[0].0;
                let mut losers = Vec::new();
                for &(id, confidence) in &contenders[1..] {
                    let halved = confidence / 2.0;
                    g.set_confidence(id, halved)?;
                    if halved < floor {
                        g.remove_edge_soft(id)?;
                        retired += 1;
                        tracing::warn!(edge = %id, confidence = halved, "conflict loser retired below floor");
                    }
                    if !touched.contains(&id) {
                        touched.push(id);
                    }
                    losers.push(id);
                }
                let survivor = g
                    .fact(winner)
                    .ok_or(GraphError::EdgeNotFound { edge_id: winner.get() })?;
                let losers = losers.into_iter().filter_map(|id| g.fact(id)).collect();
                return Ok(Applied {
                    outcome: UpdateOutcome::Conflicted { survivor, losers },
                    touched,
                    retired,
                });
            }
        }

        let fact = g
            .fact(upsert.id)
            .ok_or(GraphError::EdgeNotFound { edge_id: upsert.id.get() })?;
        let outcome = if upsert.created {
            UpdateOutcome::Accepted(fact)
        } else {
            UpdateOutcome::Merged(fact)
        };
        Ok(Applied {
            outcome,
            touched,
            retired,
        })
    }

    /// Create or update a node outside of any fact. A relabel re-indexes
    /// every edge on the node.
    pub fn upsert_node(&self, spec: NodeSpec) -> Result<NodeId, GraphError> {
        let _gate = self.gate.lock().expect("update gate poisoned");
        let (id, touched) = self.graph.write(|g| {
            let touched = relabeled_edges(g, &[&spec]);
            g.upsert_node(spec.clone()).map(|id| (id, touched))
        })?;
        for edge_id in touched {
            if let Some(fact) = self.graph.fact(edge_id) {
                self.indexer.index_fact(&fact);
            }
        }
        Ok(id)
    }

    /// Multiply every live edge's confidence by the decay factor and retire
    /// those crossing the floor. Never runs on a timer; callers trigger it.
    pub fn decay_sweep(&self) -> DecayReport {
        let _gate = self.gate.lock().expect("update gate poisoned");
        let report = self.graph.write(|g| {
            g.decay_live_edges(self.config.decay_factor, self.config.soft_retire_floor)
        });
        for id in &report.retired {
            self.indexer.mark_retired(*id);
        }
        if !report.retired.is_empty() {
            self.indexer.maybe_compact();
            tracing::warn!(count = report.retired.len(), "decay retired edges below floor");
        }
        self.counters.decay_sweeps.fetch_add(1, Ordering::Relaxed);
        self.counters
            .retired
            .fetch_add(report.retired.len() as u64, Ordering::Relaxed);
        tracing::info!(
            decayed = report.decayed,
            retired = report.retired.len(),
            factor = self.config.decay_factor,
            "decay sweep"
        );
        report
    }

    pub fn stats(&self) -> UpdateStats {
        let c = &self.counters;
        UpdateStats {
            accepted: c.accepted.load(Ordering::Relaxed),
            merged: c.merged.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            conflicted: c.conflicted.load(Ordering::Relaxed),
            retired: c.retired.load(Ordering::Relaxed),
            decay_sweeps: c.decay_sweeps.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Updater {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Updater")
            .field("config", &self.config)
            .field("stats", &self.stats())
            .finish()
    }
}
