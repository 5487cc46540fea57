//! Rich diagnostic error types for the kgrl engine.
//!
//! Each subsystem defines its own error type with miette `#[diagnostic]` derives,
//! providing error codes and help text so callers know exactly which operation
//! was refused and how to fix it.
//!
//! Contradicting evidence and slow retrievals are deliberately absent here:
//! the former is a normal [`UpdateOutcome`](crate::update::UpdateOutcome), the
//! latter a partial [`RankedFacts`](crate::retrieve::RankedFacts).

use miette::Diagnostic;
use thiserror::Error;

/// Top-level error type for the kgrl engine.
///
/// Each variant wraps a subsystem-specific error, preserving the full diagnostic
/// chain (error codes, help text) through to the caller.
#[derive(Debug, Error, Diagnostic)]
pub enum KgError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Conflict(#[from] ConflictError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Graph(#[from] GraphError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Controller(#[from] ControllerError),
}

// ---------------------------------------------------------------------------
// Validation errors
// ---------------------------------------------------------------------------

/// A malformed node, edge, fact, or query. Never partially applied.
#[derive(Debug, Clone, PartialEq, Error, Diagnostic)]
pub enum ValidationError {
    #[error("confidence {value} is outside [0, 1]")]
    #[diagnostic(
        code(kgrl::validation::confidence_range),
        help(
            "Confidence values are rejected, not clamped. Normalize the \
             extractor's score into [0, 1] before submitting it."
        )
    )]
    ConfidenceOutOfRange { value: f32 },

    #[error("self-loop on node \"{node}\" is not allowed")]
    #[diagnostic(
        code(kgrl::validation::self_loop),
        help("Edges must connect two distinct nodes.")
    )]
    SelfLoop { node: String },

    #[error("node id must not be empty")]
    #[diagnostic(
        code(kgrl::validation::empty_id),
        help("Give every node a stable, non-empty identifier such as \"kitchen\".")
    )]
    EmptyNodeId,

    #[error("node \"{node}\" is a {existing}, cannot be re-declared as {requested}")]
    #[diagnostic(
        code(kgrl::validation::type_mismatch),
        help(
            "A node's type is fixed when it is created. Use a different id \
             for the new concept, or reference the existing node as-is."
        )
    )]
    TypeMismatch {
        node: String,
        existing: String,
        requested: String,
    },

    #[error("Transitions edge {source_node} -> {target_node} violates state discipline: {reason}")]
    #[diagnostic(
        code(kgrl::validation::transition_discipline),
        help(
            "Both ends of a Transitions edge must be State nodes carrying the \
             same `entity` attribute."
        )
    )]
    TransitionDiscipline {
        source_node: String,
        target_node: String,
        reason: String,
    },

    #[error("embedding dimension mismatch: expected {expected}, got {actual}")]
    #[diagnostic(
        code(kgrl::validation::dim_mismatch),
        help(
            "Query embeddings must come from the same embedding provider the \
             indexer was built with."
        )
    )]
    DimensionMismatch { expected: usize, actual: usize },

    #[error("similarity threshold {value} is outside [-1, 1]")]
    #[diagnostic(
        code(kgrl::validation::threshold_range),
        help("Cosine similarity thresholds must lie in [-1, 1].")
    )]
    ThresholdOutOfRange { value: f32 },
}

// ---------------------------------------------------------------------------
// Conflict (dangling reference) errors
// ---------------------------------------------------------------------------

/// An edge write referencing a node that does not exist.
#[derive(Debug, Clone, PartialEq, Error, Diagnostic)]
pub enum ConflictError {
    #[error("edge {role} \"{node}\" does not exist")]
    #[diagnostic(
        code(kgrl::conflict::missing_node),
        help(
            "Create the node first (or submit the fact with a node spec for \
             this endpoint), then retry the edge write."
        )
    )]
    MissingNode { node: String, role: &'static str },
}

// ---------------------------------------------------------------------------
// Graph errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum GraphError {
    #[error(transparent)]
    #[diagnostic(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    #[diagnostic(transparent)]
    Conflict(#[from] ConflictError),

    #[error("node not found: \"{node}\"")]
    #[diagnostic(
        code(kgrl::graph::node_not_found),
        help("The node has never been created or was removed.")
    )]
    NodeNotFound { node: String },

    #[error("edge not found: {edge_id}")]
    #[diagnostic(
        code(kgrl::graph::edge_not_found),
        help("Edge ids are allocated by the graph store; check the id came from it.")
    )]
    EdgeNotFound { edge_id: u64 },

    #[error("node \"{node}\" is still referenced by {edge_count} edge(s)")]
    #[diagnostic(
        code(kgrl::graph::node_in_use),
        help(
            "Edges are retired, never deleted, so a node stays as long as any \
             edge (live or retired) points at it."
        )
    )]
    NodeInUse { node: String, edge_count: usize },
}

// ---------------------------------------------------------------------------
// Store errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum StoreError {
    #[error("I/O error: {source}")]
    #[diagnostic(
        code(kgrl::store::io),
        help(
            "A filesystem operation failed. Check that the data directory exists, \
             has correct permissions, and that the disk is not full."
        )
    )]
    Io {
        #[source]
        source: std::io::Error,
    },

    #[error("redb transaction error: {message}")]
    #[diagnostic(
        code(kgrl::store::redb),
        help(
            "The embedded database encountered a transaction error. \
             Try again with a fresh data directory if the problem persists."
        )
    )]
    Redb { message: String },

    #[error("serialization error: {message}")]
    #[diagnostic(
        code(kgrl::store::serde),
        help(
            "Failed to serialize or deserialize a snapshot. \
             The stored format may come from an incompatible version."
        )
    )]
    Serialization { message: String },

    #[error("snapshot version {version} not found")]
    #[diagnostic(
        code(kgrl::store::not_found),
        help("List stored versions with `SnapshotStore::versions()`.")
    )]
    SnapshotNotFound { version: u64 },

    #[error("consistency violation in snapshot: {message}")]
    #[diagnostic(
        code(kgrl::store::consistency),
        help(
            "The snapshot breaks a graph invariant (for example an edge whose \
             endpoint node is missing). The whole load was aborted; restore an \
             earlier snapshot instead of repairing this one by hand."
        )
    )]
    ConsistencyViolation { message: String },
}

// ---------------------------------------------------------------------------
// Config errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ConfigError {
    #[error("invalid configuration: {message}")]
    #[diagnostic(
        code(kgrl::config::invalid),
        help("Check the EngineConfig fields. {message}")
    )]
    Invalid { message: String },

    #[error("failed to read config {path}")]
    #[diagnostic(
        code(kgrl::config::read),
        help("Ensure the file exists and is readable.")
    )]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write config {path}")]
    #[diagnostic(
        code(kgrl::config::write),
        help("Ensure the parent directory is writable.")
    )]
    Write {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config {path}: {message}")]
    #[diagnostic(
        code(kgrl::config::parse),
        help("The file must be valid TOML matching the EngineConfig layout.")
    )]
    Parse { path: String, message: String },
}

// ---------------------------------------------------------------------------
// Controller errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error, Diagnostic)]
pub enum ControllerError {
    #[error("no step in progress")]
    #[diagnostic(
        code(kgrl::controller::no_step),
        help("Call `begin_step()` before retrieving or submitting evidence.")
    )]
    NoActiveStep,

    #[error("step {step} is still in progress")]
    #[diagnostic(
        code(kgrl::controller::step_open),
        help("Call `end_step()` before beginning the next step or ending the episode.")
    )]
    StepInProgress { step: u64 },

    #[error("mode is locked to {current} for the running episode")]
    #[diagnostic(
        code(kgrl::controller::mode_locked),
        help(
            "The retrieval/update mode is fixed per episode. Call `end_episode()` \
             before starting an episode with a different mode."
        )
    )]
    ModeLocked { current: String },

    #[error("no episode in progress")]
    #[diagnostic(
        code(kgrl::controller::no_episode),
        help("Call `start_episode(mode)` first.")
    )]
    NoActiveEpisode,
}

/// Convenience alias for functions returning kgrl results.
pub type KgResult<T> = std::result::Result<T, KgError>;

impl From<GraphError> for KgErrorKind {
    fn from(err: GraphError) -> Self {
        match err {
            GraphError::Validation(_) => KgErrorKind::Validation,
            GraphError::Conflict(_) => KgErrorKind::Conflict,
            _ => KgErrorKind::Graph,
        }
    }
}

/// Coarse classification used by callers that only branch on the taxonomy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KgErrorKind {
    Validation,
    Conflict,
    Graph,
    Store,
    Config,
    Controller,
}

impl KgError {
    /// Which branch of the error taxonomy this error belongs to.
    pub fn kind(&self) -> KgErrorKind {
        match self {
            KgError::Validation(_) => KgErrorKind::Validation,
            KgError::Conflict(_) => KgErrorKind::Conflict,
            KgError::Graph(GraphError::Validation(_)) => KgErrorKind::Validation,
            KgError::Graph(GraphError::Conflict(_)) => KgErrorKind::Conflict,
            KgError::Graph(_) => KgErrorKind::Graph,
            KgError::Store(_) => KgErrorKind::Store,
            KgError::Config(_) => KgErrorKind::Config,
            KgError::Controller(_) => KgErrorKind::Controller,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validation_error_converts_through_graph_error() {
        let err = ValidationError::ConfidenceOutOfRange { value: 1.5 };
        let graph: GraphError = err.into();
        let kg: KgError = graph.into();
        assert_eq!(kg.kind(), KgErrorKind::Validation);
    }

    #[test]
    fn conflict_error_kind() {
        let err = ConflictError::MissingNode {
            node: "fridge".into(),
            role: "target",
        };
        let kg: KgError = GraphError::from(err).into();
        assert_eq!(kg.kind(), KgErrorKind::Conflict);
        assert!(kg.to_string().contains("fridge"));
    }

    #[test]
    fn graph_error_kind_mapping() {
        let kind: KgErrorKind = GraphError::EdgeNotFound { edge_id: 7 }.into();
        assert_eq!(kind, KgErrorKind::Graph);
    }

    #[test]
    fn error_display_messages_are_descriptive() {
        let err = ValidationError::DimensionMismatch {
            expected: 64,
            actual: 32,
        };
        let msg = format!("{err}");
        assert!(msg.contains("64"));
        assert!(msg.contains("32"));
    }
}
