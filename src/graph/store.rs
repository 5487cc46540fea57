//! The graph store: ground truth for nodes and edges.
//!
//! Uses a petgraph `StableDiGraph` for adjacency plus hash tables for node,
//! edge, and triple lookups. Everything lives in one [`GraphState`] behind a
//! single `RwLock`, so a reader never observes a half-written edge: adjacency,
//! the edge table, and the triple index always change together.

use std::collections::{BTreeMap, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use petgraph::Direction;
use petgraph::stable_graph::{EdgeIndex, NodeIndex, StableDiGraph};
use petgraph::unionfind::UnionFind;
use petgraph::visit::{EdgeRef, NodeIndexable};

use crate::error::{ConflictError, GraphError, StoreError, ValidationError};
use crate::store::snapshot::GraphSnapshot;

use super::{
    Edge, EdgeId, EdgeSpec, Fact, FactKey, Node, NodeId, NodeSpec, NodeType, Provenance,
    Relation, ENTITY_ATTR, check_confidence, now_millis,
};

/// Result type for graph operations.
pub type GraphResult<T> = std::result::Result<T, GraphError>;

#[derive(Debug, Clone)]
struct NodeEntry {
    index: NodeIndex,
    node: Node,
}

#[derive(Debug, Clone)]
struct EdgeEntry {
    index: EdgeIndex,
    edge: Edge,
}

/// Outcome of an edge upsert.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EdgeUpsert {
    pub id: EdgeId,
    /// `true` when a new edge was created, `false` when evidence was aggregated.
    pub created: bool,
    /// Confidence before aggregation (equal to the new one when created).
    pub previous_confidence: f32,
    pub confidence: f32,
}

/// One adjacent node reached through a non-retired edge.
#[derive(Debug, Clone, PartialEq)]
pub struct Neighbor {
    pub node: NodeId,
    pub edge: EdgeId,
    pub relation: Relation,
    /// `Outgoing` when the queried node is the edge's source.
    pub direction: Direction,
    pub confidence: f32,
}

/// Node query filter. Empty filter matches every node.
#[derive(Debug, Clone, Default)]
pub struct NodeFilter {
    pub node_type: Option<NodeType>,
    /// Every listed attribute must be present with an equal value.
    pub attributes: super::Attributes,
}

impl NodeFilter {
    fn matches(&self, node: &Node) -> bool {
        if self.node_type.is_some_and(|t| t != node.node_type) {
            return false;
        }
        self.attributes
            .iter()
            .all(|(k, v)| node.attributes.get(k) == Some(v))
    }
}

/// Edge query filter. Empty filter matches every non-retired edge.
#[derive(Debug, Clone, Default)]
pub struct EdgeFilter {
    pub relation: Option<Relation>,
    pub source: Option<NodeId>,
    pub target: Option<NodeId>,
    pub provenance: Option<Provenance>,
    pub min_confidence: Option<f32>,
    pub include_retired: bool,
}

impl EdgeFilter {
    fn matches(&self, edge: &Edge) -> bool {
        (self.include_retired || !edge.retired)
            && self.relation.is_none_or(|r| r == edge.relation)
            && self.source.as_ref().is_none_or(|s| *s == edge.source)
            && self.target.as_ref().is_none_or(|t| *t == edge.target)
            && self.provenance.is_none_or(|p| p == edge.provenance)
            && self.min_confidence.is_none_or(|c| edge.confidence >= c)
    }
}

/// Summary statistics of the graph.
#[derive(Debug, Clone, PartialEq)]
pub struct GraphStats {
    pub node_count: usize,
    pub live_edge_count: usize,
    pub retired_edge_count: usize,
    /// Live edges over `n * (n - 1)`.
    pub density: f64,
    /// Weakly connected components over live edges.
    pub component_count: usize,
    pub nodes_by_type: BTreeMap<NodeType, usize>,
    pub edges_by_relation: BTreeMap<Relation, usize>,
}

impl std::fmt::Display for GraphStats {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        writeln!(f, "knowledge graph")?;
        writeln!(f, "  nodes:        {}", self.node_count)?;
        writeln!(f, "  live edges:   {}", self.live_edge_count)?;
        writeln!(f, "  retired:      {}", self.retired_edge_count)?;
        writeln!(f, "  density:      {:.4}", self.density)?;
        writeln!(f, "  components:   {}", self.component_count)?;
        Ok(())
    }
}

/// Result of one decay pass over the live edges.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DecayReport {
    pub decayed: usize,
    /// Edges that crossed below the floor during this pass, in id order.
    pub retired: Vec<EdgeId>,
}

// ---------------------------------------------------------------------------
// GraphState
// ---------------------------------------------------------------------------

/// The lock-protected graph contents.
///
/// Obtained through [`GraphStore::read`] and [`GraphStore::write`]; every
/// method here runs under the store's lock.
#[derive(Debug, Default)]
pub struct GraphState {
    graph: StableDiGraph<NodeId, EdgeId>,
    nodes: HashMap<NodeId, NodeEntry>,
    edges: HashMap<EdgeId, EdgeEntry>,
    by_key: HashMap<FactKey, EdgeId>,
    next_edge_id: u64,
}

/// Type and `entity` attribute of an endpoint as it will be after pending upserts.
struct EndpointView<'a> {
    node_type: NodeType,
    entity: Option<&'a str>,
}

impl GraphState {
    fn new() -> Self {
        Self {
            next_edge_id: 1,
            ..Default::default()
        }
    }

    // -- nodes --------------------------------------------------------------

    /// Validate a node spec against the stored node of the same id, if any.
    pub fn check_node_spec(&self, spec: &NodeSpec) -> Result<(), ValidationError> {
        if spec.id.as_str().is_empty() {
            return Err(ValidationError::EmptyNodeId);
        }
        let Some(entry) = self.nodes.get(&spec.id) else {
            return Ok(());
        };
        if entry.node.node_type != spec.node_type {
            return Err(ValidationError::TypeMismatch {
                node: spec.id.to_string(),
                existing: entry.node.node_type.to_string(),
                requested: spec.node_type.to_string(),
            });
        }

        // A State node on a Transitions edge keeps its entity, retired edges
        // included: a snapshot holding them must still load.
        let Some(requested) = spec.attributes.get(ENTITY_ATTR) else {
            return Ok(());
        };
        let current = entry.node.entity();
        if requested.as_text() == current {
            return Ok(());
        }
        if let Some(edge) = self
            .incident_edges(&spec.id)
            .find(|e| e.relation == Relation::Transitions)
        {
            return Err(ValidationError::TransitionDiscipline {
                source_node: edge.source.to_string(),
                target_node: edge.target.to_string(),
                reason: format!(
                    "state \"{}\" cannot change entity from {} while on a transition",
                    spec.id,
                    current.unwrap_or("<none>")
                ),
            });
        }
        Ok(())
    }

    /// Every edge touching `id` in either direction, retired ones included.
    pub fn incident_edges<'a>(&'a self, id: &NodeId) -> impl Iterator<Item = &'a Edge> + 'a {
        let index = self.nodes.get(id).map(|e| e.index);
        index
            .into_iter()
            .flat_map(move |index| {
                self.graph
                    .edges_directed(index, Direction::Outgoing)
                    .chain(self.graph.edges_directed(index, Direction::Incoming))
            })
            .filter_map(move |e| self.edges.get(e.weight()).map(|entry| &entry.edge))
    }

    /// Create a node, or update label and attributes of an existing one.
    pub fn upsert_node(&mut self, spec: NodeSpec) -> GraphResult<NodeId> {
        self.check_node_spec(&spec)?;
        let now = now_millis();
        if let Some(entry) = self.nodes.get_mut(&spec.id) {
            let node = &mut entry.node;
            node.label = spec.label;
            node.attributes.extend(spec.attributes);
            node.updated_at = now;
            return Ok(spec.id);
        }

        let index = self.graph.add_node(spec.id.clone());
        let node = Node {
            id: spec.id.clone(),
            node_type: spec.node_type,
            label: spec.label,
            attributes: spec.attributes,
            created_at: now,
            updated_at: now,
        };
        self.nodes.insert(spec.id.clone(), NodeEntry { index, node });
        Ok(spec.id)
    }

    pub fn get_node(&self, id: &NodeId) -> Option<&Node> {
        self.nodes.get(id).map(|e| &e.node)
    }

    pub fn has_node(&self, id: &NodeId) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.values().map(|e| &e.node)
    }

    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    /// Hard-delete a node that no edge references.
    pub fn remove_node(&mut self, id: &NodeId) -> GraphResult<Node> {
        let entry = self.nodes.get(id).ok_or_else(|| GraphError::NodeNotFound {
            node: id.to_string(),
        })?;
        let edge_count = self
            .graph
            .edges_directed(entry.index, Direction::Outgoing)
            .count()
            + self
                .graph
                .edges_directed(entry.index, Direction::Incoming)
                .count();
        if edge_count > 0 {
            return Err(GraphError::NodeInUse {
                node: id.to_string(),
                edge_count,
            });
        }
        let entry = self
            .nodes
            .remove(id)
            .ok_or_else(|| GraphError::NodeNotFound {
                node: id.to_string(),
            })?;
        self.graph.remove_node(entry.index);
        Ok(entry.node)
    }

    pub fn query_nodes(&self, filter: &NodeFilter) -> Vec<Node> {
        let mut out: Vec<Node> = self
            .nodes()
            .filter(|n| filter.matches(n))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    // -- edges --------------------------------------------------------------

    fn endpoint_view<'a>(
        &'a self,
        id: &NodeId,
        pending: &[&'a NodeSpec],
    ) -> Option<EndpointView<'a>> {
        let stored = self.get_node(id);
        let spec = pending.iter().rev().find(|s| s.id == *id);
        match (stored, spec) {
            (None, None) => None,
            (Some(node), None) => Some(EndpointView {
                node_type: node.node_type,
                entity: node.entity(),
            }),
            (stored, Some(spec)) => Some(EndpointView {
                node_type: stored.map_or(spec.node_type, |n| n.node_type),
                entity: spec
                    .attributes
                    .get(super::ENTITY_ATTR)
                    .and_then(super::AttrValue::as_text)
                    .or_else(|| stored.and_then(Node::entity)),
            }),
        }
    }

    /// Check an edge write without applying it.
    ///
    /// `pending` lists node specs that will be upserted before the edge, so a
    /// caller can validate a whole submission up front and mutate nothing on
    /// failure.
    pub fn check_edge(&self, spec: &EdgeSpec, pending: &[&NodeSpec]) -> GraphResult<()> {
        check_confidence(spec.confidence)?;
        if spec.source == spec.target {
            return Err(ValidationError::SelfLoop {
                node: spec.source.to_string(),
            }
            .into());
        }
        let source = self
            .endpoint_view(&spec.source, pending)
            .ok_or_else(|| ConflictError::MissingNode {
                node: spec.source.to_string(),
                role: "source",
            })?;
        let target = self
            .endpoint_view(&spec.target, pending)
            .ok_or_else(|| ConflictError::MissingNode {
                node: spec.target.to_string(),
                role: "target",
            })?;

        if spec.relation == Relation::Transitions {
            let violation = |reason: &str| ValidationError::TransitionDiscipline {
                source_node: spec.source.to_string(),
                target_node: spec.target.to_string(),
                reason: reason.to_string(),
            };
            if source.node_type != NodeType::State || target.node_type != NodeType::State {
                return Err(violation("both endpoints must be State nodes").into());
            }
            match (source.entity, target.entity) {
                (Some(a), Some(b)) if a == b => {}
                (Some(_), Some(_)) => {
                    return Err(violation("endpoints describe different entities").into());
                }
                _ => return Err(violation("missing `entity` attribute").into()),
            }
        }
        Ok(())
    }

    /// Create an edge, or aggregate evidence into the existing edge for the
    /// same `(source, relation, target)` triple.
    ///
    /// Aggregation is the running average
    /// `(old * count + new) / (count + 1)`. Retirement is left to the caller.
    pub fn upsert_edge(&mut self, spec: EdgeSpec) -> GraphResult<EdgeUpsert> {
        self.check_edge(&spec, &[])?;
        let now = now_millis();
        let key = FactKey::new(spec.source.clone(), spec.relation, spec.target.clone());

        if let Some(&id) = self.by_key.get(&key) {
            let entry = self
                .edges
                .get_mut(&id)
                .ok_or(GraphError::EdgeNotFound { edge_id: id.get() })?;
            let edge = &mut entry.edge;
            let previous = edge.confidence;
            let count = edge.evidence_count as f32;
            edge.confidence = ((previous * count + spec.confidence) / (count + 1.0)).clamp(0.0, 1.0);
            edge.evidence_count = edge.evidence_count.saturating_add(1);
            edge.updated_at = now;
            return Ok(EdgeUpsert {
                id,
                created: false,
                previous_confidence: previous,
                confidence: edge.confidence,
            });
        }

        let (source_index, target_index) = match (
            self.nodes.get(&spec.source),
            self.nodes.get(&spec.target),
        ) {
            (Some(s), Some(t)) => (s.index, t.index),
            // check_edge with no pending specs already proved both exist
            _ => {
                return Err(ConflictError::MissingNode {
                    node: spec.source.to_string(),
                    role: "source",
                }
                .into());
            }
        };

        let id = EdgeId::new(self.next_edge_id).ok_or(GraphError::EdgeNotFound { edge_id: 0 })?;
        self.next_edge_id += 1;
        let index = self.graph.add_edge(source_index, target_index, id);
        let edge = Edge {
            id,
            source: spec.source,
            target: spec.target,
            relation: spec.relation,
            confidence: spec.confidence,
            provenance: spec.provenance,
            created_at: now,
            updated_at: now,
            evidence_count: 1,
            retired: false,
        };
        self.by_key.insert(key, id);
        self.edges.insert(id, EdgeEntry { index, edge });
        Ok(EdgeUpsert {
            id,
            created: true,
            previous_confidence: spec.confidence,
            confidence: spec.confidence,
        })
    }

    pub fn get_edge(&self, id: EdgeId) -> Option<&Edge> {
        self.edges.get(&id).map(|e| &e.edge)
    }

    pub fn find_edge(&self, key: &FactKey) -> Option<&Edge> {
        self.by_key.get(key).and_then(|id| self.get_edge(*id))
    }

    pub fn edges(&self) -> impl Iterator<Item = &Edge> {
        self.edges.values().map(|e| &e.edge)
    }

    pub fn edge_count(&self) -> usize {
        self.edges.len()
    }

    /// All edges (retired included) leaving `subject` with `relation`.
    pub fn edges_from(&self, subject: &NodeId, relation: Relation) -> Vec<&Edge> {
        let Some(entry) = self.nodes.get(subject) else {
            return Vec::new();
        };
        let mut out: Vec<&Edge> = self
            .graph
            .edges_directed(entry.index, Direction::Outgoing)
            .filter_map(|e| self.get_edge(*e.weight()))
            .filter(|e| e.relation == relation)
            .collect();
        out.sort_by_key(|e| e.id);
        out
    }

    fn edge_mut(&mut self, id: EdgeId) -> GraphResult<&mut Edge> {
        self.edges
            .get_mut(&id)
            .map(|e| &mut e.edge)
            .ok_or(GraphError::EdgeNotFound { edge_id: id.get() })
    }

    /// Overwrite an edge's confidence (range-checked).
    pub fn set_confidence(&mut self, id: EdgeId, confidence: f32) -> GraphResult<()> {
        check_confidence(confidence)?;
        let edge = self.edge_mut(id)?;
        edge.confidence = confidence;
        edge.updated_at = now_millis();
        Ok(())
    }

    /// Soft-retire an edge: it stays for audit but is never retrieved.
    pub fn remove_edge_soft(&mut self, id: EdgeId) -> GraphResult<()> {
        let edge = self.edge_mut(id)?;
        edge.retired = true;
        edge.updated_at = now_millis();
        Ok(())
    }

    /// Bring a retired edge back into retrieval.
    pub fn revive_edge(&mut self, id: EdgeId) -> GraphResult<()> {
        let edge = self.edge_mut(id)?;
        edge.retired = false;
        edge.updated_at = now_millis();
        Ok(())
    }

    /// Multiply every live edge's confidence by `factor`, retiring those that
    /// cross below `floor`. Retired edges are left untouched.
    pub fn decay_live_edges(&mut self, factor: f32, floor: f32) -> DecayReport {
        let now = now_millis();
        let mut report = DecayReport::default();
        for entry in self.edges.values_mut() {
            let edge = &mut entry.edge;
            if edge.retired {
                continue;
            }
            edge.confidence = (edge.confidence * factor).clamp(0.0, 1.0);
            edge.updated_at = now;
            report.decayed += 1;
            if edge.confidence < floor {
                edge.retired = true;
                report.retired.push(edge.id);
            }
        }
        report.retired.sort();
        report
    }

    pub fn query_edges(&self, filter: &EdgeFilter) -> Vec<Edge> {
        let mut out: Vec<Edge> = self
            .edges()
            .filter(|e| filter.matches(e))
            .cloned()
            .collect();
        out.sort_by_key(|e| e.id);
        out
    }

    // -- adjacency ----------------------------------------------------------

    /// Adjacent nodes over non-retired edges.
    ///
    /// `relation` restricts the edge relation; `direction` restricts to
    /// outgoing or incoming edges (`None` = both).
    pub fn neighbors(
        &self,
        id: &NodeId,
        relation: Option<Relation>,
        direction: Option<Direction>,
    ) -> GraphResult<Vec<Neighbor>> {
        let entry = self.nodes.get(id).ok_or_else(|| GraphError::NodeNotFound {
            node: id.to_string(),
        })?;
        let directions: &[Direction] = match direction {
            Some(Direction::Outgoing) => &[Direction::Outgoing],
            Some(Direction::Incoming) => &[Direction::Incoming],
            None => &[Direction::Outgoing, Direction::Incoming],
        };

        let mut out = Vec::new();
        for &dir in directions {
            for e in self.graph.edges_directed(entry.index, dir) {
                let Some(edge) = self.get_edge(*e.weight()) else {
                    continue;
                };
                if edge.retired || relation.is_some_and(|r| r != edge.relation) {
                    continue;
                }
                let other = match dir {
                    Direction::Outgoing => &edge.target,
                    Direction::Incoming => &edge.source,
                };
                out.push(Neighbor {
                    node: other.clone(),
                    edge: edge.id,
                    relation: edge.relation,
                    direction: dir,
                    confidence: edge.confidence,
                });
            }
        }
        out.sort_by(|a, b| a.edge.cmp(&b.edge).then(a.node.cmp(&b.node)));
        Ok(out)
    }

    // -- facts --------------------------------------------------------------

    /// Denormalize an edge into a fact.
    pub fn fact_of(&self, edge: &Edge) -> Fact {
        let label = |id: &NodeId| {
            self.get_node(id)
                .map(|n| n.label.clone())
                .unwrap_or_else(|| id.to_string())
        };
        Fact {
            edge_id: edge.id,
            subject: edge.source.clone(),
            subject_label: label(&edge.source),
            relation: edge.relation,
            object: edge.target.clone(),
            object_label: label(&edge.target),
            confidence: edge.confidence,
            evidence_count: edge.evidence_count,
            provenance: edge.provenance,
            created_at: edge.created_at,
            updated_at: edge.updated_at,
            retired: edge.retired,
        }
    }

    pub fn fact(&self, id: EdgeId) -> Option<Fact> {
        self.get_edge(id).map(|e| self.fact_of(e))
    }

    pub fn find_fact(&self, key: &FactKey) -> Option<Fact> {
        self.find_edge(key).map(|e| self.fact_of(e))
    }

    /// Every fact, in edge id order.
    pub fn facts(&self, include_retired: bool) -> Vec<Fact> {
        let mut edges: Vec<&Edge> = self
            .edges()
            .filter(|e| include_retired || !e.retired)
            .collect();
        edges.sort_by_key(|e| e.id);
        edges.into_iter().map(|e| self.fact_of(e)).collect()
    }

    // -- statistics ---------------------------------------------------------

    pub fn stats(&self) -> GraphStats {
        let node_count = self.nodes.len();
        let mut nodes_by_type = BTreeMap::new();
        for node in self.nodes() {
            *nodes_by_type.entry(node.node_type).or_insert(0) += 1;
        }

        let mut edges_by_relation = BTreeMap::new();
        let mut live = 0usize;
        let mut retired = 0usize;
        let mut components = UnionFind::<usize>::new(self.graph.node_bound());
        for entry in self.edges.values() {
            if entry.edge.retired {
                retired += 1;
                continue;
            }
            live += 1;
            *edges_by_relation.entry(entry.edge.relation).or_insert(0) += 1;
            if let Some((a, b)) = self.graph.edge_endpoints(entry.index) {
                components.union(a.index(), b.index());
            }
        }
        let mut roots: Vec<usize> = self
            .nodes
            .values()
            .map(|e| components.find(e.index.index()))
            .collect();
        roots.sort_unstable();
        roots.dedup();

        let density = if node_count > 1 {
            live as f64 / (node_count as f64 * (node_count as f64 - 1.0))
        } else {
            0.0
        };

        GraphStats {
            node_count,
            live_edge_count: live,
            retired_edge_count: retired,
            density,
            component_count: roots.len(),
            nodes_by_type,
            edges_by_relation,
        }
    }

    // -- snapshots ----------------------------------------------------------

    fn snapshot(&self, version: u64) -> GraphSnapshot {
        let mut nodes: Vec<Node> = self.nodes().cloned().collect();
        nodes.sort_by(|a, b| a.id.cmp(&b.id));
        let mut edges: Vec<Edge> = self.edges().cloned().collect();
        edges.sort_by_key(|e| e.id);
        GraphSnapshot {
            version,
            taken_at: now_millis(),
            nodes,
            edges,
        }
    }

    /// Rebuild a state from snapshot parts, verifying every invariant.
    fn from_snapshot(snapshot: &GraphSnapshot) -> Result<Self, StoreError> {
        let violation = |message: String| StoreError::ConsistencyViolation { message };
        let mut state = GraphState::new();

        for node in &snapshot.nodes {
            if node.id.as_str().is_empty() {
                return Err(violation("node with empty id".into()));
            }
            if state.nodes.contains_key(&node.id) {
                return Err(violation(format!("duplicate node \"{}\"", node.id)));
            }
            let index = state.graph.add_node(node.id.clone());
            state.nodes.insert(
                node.id.clone(),
                NodeEntry {
                    index,
                    node: node.clone(),
                },
            );
        }

        let mut max_id = 0u64;
        for edge in &snapshot.edges {
            let spec = EdgeSpec {
                source: edge.source.clone(),
                relation: edge.relation,
                target: edge.target.clone(),
                confidence: edge.confidence,
                provenance: edge.provenance,
            };
            state
                .check_edge(&spec, &[])
                .map_err(|e| violation(format!("{} {}: {e}", edge.id, edge.key())))?;
            if state.edges.contains_key(&edge.id) {
                return Err(violation(format!("duplicate edge id {}", edge.id)));
            }
            let key = edge.key();
            if state.by_key.contains_key(&key) {
                return Err(violation(format!("duplicate triple {key}")));
            }
            let (Some(s), Some(t)) = (state.nodes.get(&edge.source), state.nodes.get(&edge.target))
            else {
                return Err(violation(format!("{} has a dangling endpoint", edge.id)));
            };
            let index = state.graph.add_edge(s.index, t.index, edge.id);
            state.by_key.insert(key, edge.id);
            state.edges.insert(
                edge.id,
                EdgeEntry {
                    index,
                    edge: edge.clone(),
                },
            );
            max_id = max_id.max(edge.id.get());
        }
        state.next_edge_id = max_id + 1;
        Ok(state)
    }
}

// ---------------------------------------------------------------------------
// GraphStore
// ---------------------------------------------------------------------------

/// Concurrent graph store: many readers, one writer at a time.
pub struct GraphStore {
    state: RwLock<GraphState>,
}

impl GraphStore {
    /// Create an empty graph store.
    pub fn new() -> Self {
        Self {
            state: RwLock::new(GraphState::new()),
        }
    }

    /// Restore a store from a snapshot. Any invariant violation (for example
    /// a dangling edge) fails the whole load.
    pub fn from_snapshot(snapshot: &GraphSnapshot) -> Result<Self, StoreError> {
        Ok(Self {
            state: RwLock::new(GraphState::from_snapshot(snapshot)?),
        })
    }

    /// Capture every node and edge (retired edges included).
    pub fn snapshot(&self, version: u64) -> GraphSnapshot {
        self.state_read().snapshot(version)
    }

    fn state_read(&self) -> RwLockReadGuard<'_, GraphState> {
        self.state.read().expect("graph lock poisoned")
    }

    fn state_write(&self) -> RwLockWriteGuard<'_, GraphState> {
        self.state.write().expect("graph lock poisoned")
    }

    /// Run `f` under the read lock.
    pub fn read<R>(&self, f: impl FnOnce(&GraphState) -> R) -> R {
        f(&self.state_read())
    }

    /// Run `f` under the write lock. Readers observe all of `f`'s mutations
    /// or none of them.
    pub fn write<R>(&self, f: impl FnOnce(&mut GraphState) -> R) -> R {
        f(&mut self.state_write())
    }

    pub fn upsert_node(&self, spec: NodeSpec) -> GraphResult<NodeId> {
        self.state_write().upsert_node(spec)
    }

    pub fn upsert_edge(&self, spec: EdgeSpec) -> GraphResult<EdgeUpsert> {
        self.state_write().upsert_edge(spec)
    }

    pub fn get_node(&self, id: &NodeId) -> Option<Node> {
        self.state_read().get_node(id).cloned()
    }

    pub fn get_edge(&self, id: EdgeId) -> Option<Edge> {
        self.state_read().get_edge(id).cloned()
    }

    pub fn has_node(&self, id: &NodeId) -> bool {
        self.state_read().has_node(id)
    }

    pub fn neighbors(
        &self,
        id: &NodeId,
        relation: Option<Relation>,
        direction: Option<Direction>,
    ) -> GraphResult<Vec<Neighbor>> {
        self.state_read().neighbors(id, relation, direction)
    }

    pub fn remove_edge_soft(&self, id: EdgeId) -> GraphResult<()> {
        self.state_write().remove_edge_soft(id)
    }

    pub fn remove_node(&self, id: &NodeId) -> GraphResult<Node> {
        self.state_write().remove_node(id)
    }

    pub fn fact(&self, id: EdgeId) -> Option<Fact> {
        self.state_read().fact(id)
    }

    pub fn find_fact(&self, key: &FactKey) -> Option<Fact> {
        self.state_read().find_fact(key)
    }

    pub fn facts(&self, include_retired: bool) -> Vec<Fact> {
        self.state_read().facts(include_retired)
    }

    pub fn query_nodes(&self, filter: &NodeFilter) -> Vec<Node> {
        self.state_read().query_nodes(filter)
    }

    pub fn query_edges(&self, filter: &EdgeFilter) -> Vec<Edge> {
        self.state_read().query_edges(filter)
    }

    pub fn stats(&self) -> GraphStats {
        self.state_read().stats()
    }

    pub fn node_count(&self) -> usize {
        self.state_read().node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.state_read().edge_count()
    }
}

impl Default for GraphStore {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for GraphStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state_read();
        f.debug_struct("GraphStore")
            .field("nodes", &state.node_count())
            .field("edges", &state.edge_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::AttrValue;

    fn kitchen_store() -> GraphStore {
        let store = GraphStore::new();
        store.upsert_node(NodeSpec::entity("kitchen")).unwrap();
        store.upsert_node(NodeSpec::entity("fridge")).unwrap();
        store.upsert_node(NodeSpec::entity("hallway")).unwrap();
        store
    }

    #[test]
    fn upsert_node_merges_attributes() {
        let store = GraphStore::new();
        store
            .upsert_node(NodeSpec::entity("fridge").with_attr("color", "white"))
            .unwrap();
        store
            .upsert_node(
                NodeSpec::entity("fridge")
                    .with_label("big fridge")
                    .with_attr("open", false),
            )
            .unwrap();

        let node = store.get_node(&"fridge".into()).unwrap();
        assert_eq!(node.label, "big fridge");
        assert_eq!(node.attributes.len(), 2);
        assert_eq!(node.attributes.get("open"), Some(&AttrValue::Bool(false)));
        assert_eq!(store.node_count(), 1);
    }

    #[test]
    fn upsert_node_rejects_type_change() {
        let store = GraphStore::new();
        store.upsert_node(NodeSpec::entity("door")).unwrap();
        let err = store.upsert_node(NodeSpec::action("door")).unwrap_err();
        assert!(matches!(
            err,
            GraphError::Validation(ValidationError::TypeMismatch { .. })
        ));
    }

    #[test]
    fn upsert_edge_aggregates_existing_triple() {
        let store = kitchen_store();
        let first = store
            .upsert_edge(EdgeSpec::new("kitchen", Relation::Contains, "fridge").with_confidence(0.9))
            .unwrap();
        assert!(first.created);
        let second = store
            .upsert_edge(EdgeSpec::new("kitchen", Relation::Contains, "fridge").with_confidence(0.6))
            .unwrap();
        assert!(!second.created);
        assert_eq!(first.id, second.id);
        assert!((second.confidence - 0.75).abs() < 1e-6);

        let edge = store.get_edge(first.id).unwrap();
        assert_eq!(edge.evidence_count, 2);
        assert_eq!(store.edge_count(), 1);
    }

    #[test]
    fn multigraph_allows_distinct_relations() {
        let store = kitchen_store();
        store
            .upsert_edge(EdgeSpec::new("kitchen", Relation::Contains, "fridge"))
            .unwrap();
        store
            .upsert_edge(EdgeSpec::new("kitchen", Relation::Enables, "fridge"))
            .unwrap();
        assert_eq!(store.edge_count(), 2);
    }

    #[test]
    fn dangling_edge_is_a_conflict_and_mutates_nothing() {
        let store = kitchen_store();
        let err = store
            .upsert_edge(EdgeSpec::new("kitchen", Relation::Contains, "oven"))
            .unwrap_err();
        assert!(matches!(
            err,
            GraphError::Conflict(ConflictError::MissingNode { role: "target", .. })
        ));
        assert_eq!(store.edge_count(), 0);
    }

    #[test]
    fn invalid_edges_rejected() {
        let store = kitchen_store();
        assert!(matches!(
            store.upsert_edge(EdgeSpec::new("kitchen", Relation::Contains, "kitchen")),
            Err(GraphError::Validation(ValidationError::SelfLoop { .. }))
        ));
        assert!(matches!(
            store.upsert_edge(
                EdgeSpec::new("kitchen", Relation::Contains, "fridge").with_confidence(1.2)
            ),
            Err(GraphError::Validation(
                ValidationError::ConfidenceOutOfRange { .. }
            ))
        ));
        assert_eq!(store.edge_count(), 0);
    }

    #[test]
    fn transitions_require_matching_state_nodes() {
        let store = GraphStore::new();
        store.upsert_node(NodeSpec::state("door_locked", "door")).unwrap();
        store.upsert_node(NodeSpec::state("door_open", "door")).unwrap();
        store.upsert_node(NodeSpec::state("chest_open", "chest")).unwrap();
        store.upsert_node(NodeSpec::entity("key")).unwrap();

        store
            .upsert_edge(EdgeSpec::new("door_locked", Relation::Transitions, "door_open"))
            .unwrap();

        for target in ["chest_open", "key"] {
            let err = store
                .upsert_edge(EdgeSpec::new("door_locked", Relation::Transitions, target))
                .unwrap_err();
            assert!(matches!(
                err,
                GraphError::Validation(ValidationError::TransitionDiscipline { .. })
            ));
        }
    }

    #[test]
    fn transition_state_keeps_its_entity() {
        let store = GraphStore::new();
        store.upsert_node(NodeSpec::state("door_locked", "door")).unwrap();
        store.upsert_node(NodeSpec::state("door_open", "door")).unwrap();
        let e = store
            .upsert_edge(EdgeSpec::new("door_locked", Relation::Transitions, "door_open"))
            .unwrap();
        store.remove_edge_soft(e.id).unwrap();

        // retired edges still pin the entity
        let err = store
            .upsert_node(NodeSpec::state("door_open", "chest"))
            .unwrap_err();
        assert!(matches!(
            err,
            GraphError::Validation(ValidationError::TransitionDiscipline { .. })
        ));
        store
            .upsert_node(NodeSpec::state("door_open", "door").with_label("ajar"))
            .unwrap();

        let restored = GraphStore::from_snapshot(&store.snapshot(1)).unwrap();
        let node = restored.get_node(&"door_open".into()).unwrap();
        assert_eq!(node.entity(), Some("door"));
        assert_eq!(node.label, "ajar");

        store.upsert_node(NodeSpec::state("loose", "door")).unwrap();
        store
            .upsert_node(NodeSpec::state("loose", "chest"))
            .unwrap();
    }

    #[test]
    fn neighbors_respect_relation_direction_and_retirement() {
        let store = kitchen_store();
        let contains = store
            .upsert_edge(EdgeSpec::new("kitchen", Relation::Contains, "fridge"))
            .unwrap();
        store
            .upsert_edge(EdgeSpec::new("hallway", Relation::Enables, "kitchen"))
            .unwrap();

        let kitchen: NodeId = "kitchen".into();
        assert_eq!(store.neighbors(&kitchen, None, None).unwrap().len(), 2);
        let out = store
            .neighbors(&kitchen, None, Some(Direction::Outgoing))
            .unwrap();
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].node, NodeId::new("fridge"));
        let enables = store
            .neighbors(&kitchen, Some(Relation::Enables), None)
            .unwrap();
        assert_eq!(enables[0].direction, Direction::Incoming);

        store.remove_edge_soft(contains.id).unwrap();
        assert_eq!(store.neighbors(&kitchen, None, None).unwrap().len(), 1);
        assert!(store.get_edge(contains.id).unwrap().retired);
        assert!(store.neighbors(&"attic".into(), None, None).is_err());
    }

    #[test]
    fn remove_node_only_when_unreferenced() {
        let store = kitchen_store();
        let e = store
            .upsert_edge(EdgeSpec::new("kitchen", Relation::Contains, "fridge"))
            .unwrap();
        store.remove_edge_soft(e.id).unwrap();
        assert!(matches!(
            store.remove_node(&"fridge".into()),
            Err(GraphError::NodeInUse { edge_count: 1, .. })
        ));
        let removed = store.remove_node(&"hallway".into()).unwrap();
        assert_eq!(removed.id, NodeId::new("hallway"));
        assert!(!store.has_node(&"hallway".into()));
    }

    #[test]
    fn decay_retires_below_floor() {
        let store = kitchen_store();
        let strong = store
            .upsert_edge(EdgeSpec::new("kitchen", Relation::Contains, "fridge").with_confidence(0.9))
            .unwrap();
        let weak = store
            .upsert_edge(
                EdgeSpec::new("hallway", Relation::Enables, "kitchen").with_confidence(0.06),
            )
            .unwrap();

        let report = store.write(|g| g.decay_live_edges(0.5, 0.05));
        assert_eq!(report.decayed, 2);
        assert_eq!(report.retired, vec![weak.id]);
        let edge = store.get_edge(strong.id).unwrap();
        assert!((edge.confidence - 0.45).abs() < 1e-6);

        // retired edges are frozen
        let report = store.write(|g| g.decay_live_edges(0.5, 0.05));
        assert_eq!(report.decayed, 1);
        let retired = store.get_edge(weak.id).unwrap();
        assert!((retired.confidence - 0.03).abs() < 1e-6);
    }

    #[test]
    fn query_filters() {
        let store = kitchen_store();
        store.upsert_node(NodeSpec::state("fridge_open", "fridge")).unwrap();
        store
            .upsert_edge(EdgeSpec::new("kitchen", Relation::Contains, "fridge").with_confidence(0.9))
            .unwrap();
        store
            .upsert_edge(
                EdgeSpec::new("fridge", Relation::HasState, "fridge_open")
                    .with_confidence(0.4)
                    .with_provenance(Provenance::Inferred),
            )
            .unwrap();

        let states = store.query_nodes(&NodeFilter {
            node_type: Some(NodeType::State),
            ..Default::default()
        });
        assert_eq!(states.len(), 1);

        let mut attrs = crate::graph::Attributes::new();
        attrs.insert("entity".into(), AttrValue::Text("fridge".into()));
        let by_attr = store.query_nodes(&NodeFilter {
            node_type: None,
            attributes: attrs,
        });
        assert_eq!(by_attr[0].id, NodeId::new("fridge_open"));

        let confident = store.query_edges(&EdgeFilter {
            min_confidence: Some(0.5),
            ..Default::default()
        });
        assert_eq!(confident.len(), 1);
        let inferred = store.query_edges(&EdgeFilter {
            provenance: Some(Provenance::Inferred),
            ..Default::default()
        });
        assert_eq!(inferred[0].relation, Relation::HasState);
    }

    #[test]
    fn stats_count_components_over_live_edges() {
        let store = kitchen_store();
        store.upsert_node(NodeSpec::entity("garden")).unwrap();
        let e = store
            .upsert_edge(EdgeSpec::new("kitchen", Relation::Contains, "fridge"))
            .unwrap();
        store
            .upsert_edge(EdgeSpec::new("hallway", Relation::Enables, "kitchen"))
            .unwrap();

        let stats = store.stats();
        assert_eq!(stats.node_count, 4);
        assert_eq!(stats.live_edge_count, 2);
        assert_eq!(stats.component_count, 2);
        assert_eq!(stats.nodes_by_type.get(&NodeType::Entity), Some(&4));

        store.remove_edge_soft(e.id).unwrap();
        let stats = store.stats();
        assert_eq!(stats.retired_edge_count, 1);
        assert_eq!(stats.component_count, 3);
    }

    #[test]
    fn snapshot_round_trip_preserves_ids() {
        let store = kitchen_store();
        let e = store
            .upsert_edge(EdgeSpec::new("kitchen", Relation::Contains, "fridge"))
            .unwrap();
        let snapshot = store.snapshot(1);
        let restored = GraphStore::from_snapshot(&snapshot).unwrap();
        assert_eq!(restored.node_count(), 3);
        assert_eq!(restored.get_edge(e.id), store.get_edge(e.id));

        let next = restored
            .upsert_edge(EdgeSpec::new("hallway", Relation::Enables, "kitchen"))
            .unwrap();
        assert!(next.id > e.id);
    }

    #[test]
    fn snapshot_with_dangling_edge_fails_whole_load() {
        let store = kitchen_store();
        store
            .upsert_edge(EdgeSpec::new("kitchen", Relation::Contains, "fridge"))
            .unwrap();
        let mut snapshot = store.snapshot(1);
        snapshot.nodes.retain(|n| n.id.as_str() != "fridge");
        assert!(matches!(
            GraphStore::from_snapshot(&snapshot),
            Err(StoreError::ConsistencyViolation { .. })
        ));
    }
}
