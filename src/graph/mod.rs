//! Knowledge graph: typed nodes, confidence-weighted edges, and the fact view.
//!
//! - **Data model** (this module): [`Node`], [`Edge`], [`Fact`] and their specs
//! - **Store** ([`store::GraphStore`]): the ground truth, petgraph adjacency under a
//!   single readers-writer lock
//! - **Traversal** ([`traverse`]): bounded BFS and simple-path search
//!
//! The graph is a directed multigraph: different relations may connect the same
//! node pair, but each `(subject, relation, object)` triple has at most one edge.

pub mod store;
pub mod traverse;

use std::collections::BTreeMap;
use std::num::NonZeroU64;

use serde::{Deserialize, Serialize};

use crate::error::ValidationError;

/// Attribute key that ties a `State` node to the entity whose state it describes.
pub const ENTITY_ATTR: &str = "entity";

/// Milliseconds since UNIX epoch.
pub fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Reject confidences outside `[0, 1]` (and NaN) instead of clamping them.
pub fn check_confidence(value: f32) -> Result<f32, ValidationError> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(ValidationError::ConfidenceOutOfRange { value })
    }
}

// ---------------------------------------------------------------------------
// Identifiers
// ---------------------------------------------------------------------------

/// Stable, caller-chosen node identifier (e.g. `"kitchen"`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for NodeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Engine-allocated edge identifier.
///
/// Uses `NonZeroU64` so that `Option<EdgeId>` is the same size as `EdgeId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct EdgeId(NonZeroU64);

impl EdgeId {
    /// Returns `None` if `raw` is zero.
    pub fn new(raw: u64) -> Option<Self> {
        NonZeroU64::new(raw).map(EdgeId)
    }

    pub fn get(self) -> u64 {
        self.0.get()
    }
}

impl std::fmt::Display for EdgeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "edge:{}", self.0)
    }
}

// ---------------------------------------------------------------------------
// Node and relation vocabularies
// ---------------------------------------------------------------------------

/// What a node stands for in the agent's world model.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum NodeType {
    Action,
    Entity,
    State,
    Result,
    Condition,
    Rule,
}

impl NodeType {
    pub const ALL: [NodeType; 6] = [
        NodeType::Action,
        NodeType::Entity,
        NodeType::State,
        NodeType::Result,
        NodeType::Condition,
        NodeType::Rule,
    ];
}

impl std::fmt::Display for NodeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeType::Action => "Action",
            NodeType::Entity => "Entity",
            NodeType::State => "State",
            NodeType::Result => "Result",
            NodeType::Condition => "Condition",
            NodeType::Rule => "Rule",
        };
        f.write_str(s)
    }
}

/// Typed relation carried by an edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Relation {
    Requires,
    Produces,
    Modifies,
    Enables,
    Prevents,
    Transitions,
    Contains,
    HasState,
}

impl Relation {
    pub const ALL: [Relation; 8] = [
        Relation::Requires,
        Relation::Produces,
        Relation::Modifies,
        Relation::Enables,
        Relation::Prevents,
        Relation::Transitions,
        Relation::Contains,
        Relation::HasState,
    ];

    /// Lowercase name, as indexed for keyword search.
    pub fn name(self) -> &'static str {
        match self {
            Relation::Requires => "requires",
            Relation::Produces => "produces",
            Relation::Modifies => "modifies",
            Relation::Enables => "enables",
            Relation::Prevents => "prevents",
            Relation::Transitions => "transitions",
            Relation::Contains => "contains",
            Relation::HasState => "has_state",
        }
    }
}

impl std::fmt::Display for Relation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Where an edge's first piece of evidence came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Provenance {
    Manual,
    Retrieved,
    Inferred,
}

impl std::fmt::Display for Provenance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Provenance::Manual => write!(f, "manual"),
            Provenance::Retrieved => write!(f, "retrieved"),
            Provenance::Inferred => write!(f, "inferred"),
        }
    }
}

// ---------------------------------------------------------------------------
// Attributes
// ---------------------------------------------------------------------------

/// Scalar attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum AttrValue {
    Text(String),
    Number(f64),
    Bool(bool),
}

impl AttrValue {
    pub fn as_text(&self) -> Option<&str> {
        match self {
            AttrValue::Text(s) => Some(s),
            _ => None,
        }
    }
}

impl From<&str> for AttrValue {
    fn from(s: &str) -> Self {
        AttrValue::Text(s.to_string())
    }
}

impl From<String> for AttrValue {
    fn from(s: String) -> Self {
        AttrValue::Text(s)
    }
}

impl From<f64> for AttrValue {
    fn from(n: f64) -> Self {
        AttrValue::Number(n)
    }
}

impl From<bool> for AttrValue {
    fn from(b: bool) -> Self {
        AttrValue::Bool(b)
    }
}

/// Open attribute map. Ordered so snapshots serialize deterministically.
pub type Attributes = BTreeMap<String, AttrValue>;

// ---------------------------------------------------------------------------
// Nodes
// ---------------------------------------------------------------------------

/// A typed node in the knowledge graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Node {
    pub id: NodeId,
    pub node_type: NodeType,
    pub label: String,
    pub attributes: Attributes,
    /// Milliseconds since UNIX epoch.
    pub created_at: u64,
    pub updated_at: u64,
}

impl Node {
    /// The `entity` attribute of a `State` node, if set.
    pub fn entity(&self) -> Option<&str> {
        self.attributes.get(ENTITY_ATTR).and_then(AttrValue::as_text)
    }
}

/// Desired state of a node for [`GraphStore::upsert_node`](store::GraphStore::upsert_node).
///
/// Upserting an existing id keeps its type and creation time, replaces the label,
/// and overlays the given attributes onto the stored ones.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeSpec {
    pub id: NodeId,
    pub node_type: NodeType,
    pub label: String,
    pub attributes: Attributes,
}

impl NodeSpec {
    /// A node whose label equals its id.
    pub fn new(id: impl Into<NodeId>, node_type: NodeType) -> Self {
        let id = id.into();
        Self {
            label: id.as_str().to_string(),
            id,
            node_type,
            attributes: Attributes::new(),
        }
    }

    pub fn entity(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeType::Entity)
    }

    pub fn action(id: impl Into<NodeId>) -> Self {
        Self::new(id, NodeType::Action)
    }

    /// A `State` node describing `entity`.
    pub fn state(id: impl Into<NodeId>, entity: impl Into<String>) -> Self {
        Self::new(id, NodeType::State).with_attr(ENTITY_ATTR, entity.into())
    }

    pub fn with_label(mut self, label: impl Into<String>) -> Self {
        self.label = label.into();
        self
    }

    pub fn with_attr(mut self, key: impl Into<String>, value: impl Into<AttrValue>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Edges
// ---------------------------------------------------------------------------

/// A confidence-weighted, typed, directed edge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    pub id: EdgeId,
    pub source: NodeId,
    pub target: NodeId,
    pub relation: Relation,
    /// Confidence in `[0, 1]`.
    pub confidence: f32,
    pub provenance: Provenance,
    pub created_at: u64,
    pub updated_at: u64,
    /// Number of pieces of evidence aggregated into `confidence`.
    pub evidence_count: u32,
    /// Soft-retired edges stay for audit but are never retrieved.
    pub retired: bool,
}

impl Edge {
    pub fn key(&self) -> FactKey {
        FactKey::new(self.source.clone(), self.relation, self.target.clone())
    }

    /// Live edges are not retired and sit at or above the floor.
    pub fn is_live(&self, floor: f32) -> bool {
        !self.retired && self.confidence >= floor
    }
}

/// Input for [`GraphStore::upsert_edge`](store::GraphStore::upsert_edge).
#[derive(Debug, Clone, PartialEq)]
pub struct EdgeSpec {
    pub source: NodeId,
    pub relation: Relation,
    pub target: NodeId,
    pub confidence: f32,
    pub provenance: Provenance,
}

impl EdgeSpec {
    pub fn new(source: impl Into<NodeId>, relation: Relation, target: impl Into<NodeId>) -> Self {
        Self {
            source: source.into(),
            relation,
            target: target.into(),
            confidence: 1.0,
            provenance: Provenance::Manual,
        }
    }

    /// Set the confidence. Range is checked on write, not here.
    pub fn with_confidence(mut self, confidence: f32) -> Self {
        self.confidence = confidence;
        self
    }

    pub fn with_provenance(mut self, provenance: Provenance) -> Self {
        self.provenance = provenance;
        self
    }
}

// ---------------------------------------------------------------------------
// Facts
// ---------------------------------------------------------------------------

/// Identity of a fact: the `(subject, relation, object)` triple.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FactKey {
    pub subject: NodeId,
    pub relation: Relation,
    pub object: NodeId,
}

impl FactKey {
    pub fn new(subject: impl Into<NodeId>, relation: Relation, object: impl Into<NodeId>) -> Self {
        Self {
            subject: subject.into(),
            relation,
            object: object.into(),
        }
    }
}

impl std::fmt::Display for FactKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({} {} {})", self.subject, self.relation, self.object)
    }
}

/// Denormalized edge view exchanged with the agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Fact {
    pub edge_id: EdgeId,
    pub subject: NodeId,
    pub subject_label: String,
    pub relation: Relation,
    pub object: NodeId,
    pub object_label: String,
    pub confidence: f32,
    pub evidence_count: u32,
    pub provenance: Provenance,
    pub created_at: u64,
    pub updated_at: u64,
    pub retired: bool,
}

impl Fact {
    pub fn key(&self) -> FactKey {
        FactKey::new(self.subject.clone(), self.relation, self.object.clone())
    }

    pub fn is_live(&self, floor: f32) -> bool {
        !self.retired && self.confidence >= floor
    }

    /// Text used for keyword indexing and embedding.
    pub fn text(&self) -> String {
        let mut text = String::new();
        text.push_str(self.subject.as_str());
        if self.subject_label != self.subject.as_str() {
            text.push(' ');
            text.push_str(&self.subject_label);
        }
        text.push(' ');
        text.push_str(self.relation.name());
        text.push(' ');
        text.push_str(self.object.as_str());
        if self.object_label != self.object.as_str() {
            text.push(' ');
            text.push_str(&self.object_label);
        }
        text
    }
}

impl std::fmt::Display for Fact {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} {} {} ({:.2})",
            self.subject_label, self.relation, self.object_label, self.confidence
        )
    }
}
