//! Bounded graph traversal: anchored BFS and simple-path search.
//!
//! Both walk only live edges (not retired, confidence at or above the floor).

use std::collections::{HashSet, VecDeque};
use std::time::Instant;

use petgraph::Direction;

use crate::error::GraphError;

use super::store::{GraphState, GraphStore};
use super::{EdgeId, NodeId, Relation};

/// Default cap on the number of paths returned by [`find_paths`].
pub const DEFAULT_PATH_LIMIT: usize = 10;

/// Configuration for an anchored traversal.
#[derive(Debug, Clone)]
pub struct TraversalConfig {
    /// Maximum hop depth from the anchor.
    pub max_hops: usize,
    /// Only follow edges with these relations (empty = follow all).
    pub relations: HashSet<Relation>,
    /// `None` follows edges in both directions.
    pub direction: Option<Direction>,
    /// Edges below this confidence are not followed.
    pub floor: f32,
    /// Stop gathering once this many edges are collected.
    pub max_edges: usize,
}

impl Default for TraversalConfig {
    fn default() -> Self {
        Self {
            max_hops: 2,
            relations: HashSet::new(),
            direction: None,
            floor: 0.05,
            max_edges: 10_000,
        }
    }
}

/// Result of an anchored traversal.
#[derive(Debug, Clone, Default)]
pub struct TraversalResult {
    /// Edges crossed, each at most once, in discovery order.
    pub edges: Vec<EdgeId>,
    /// Every node reached, anchor included, sorted by id.
    pub visited: Vec<NodeId>,
    pub depth_reached: usize,
    /// `true` if the deadline or the edge cap cut the walk short.
    pub truncated: bool,
}

/// Breadth-first traversal from `anchor`.
///
/// The visited set is keyed by node id, so cycles terminate. An unknown
/// anchor yields an empty result. `deadline` is soft: once passed, the walk
/// stops and returns what it has with `truncated = true`.
pub fn traverse_bfs(
    state: &GraphState,
    anchor: &NodeId,
    config: &TraversalConfig,
    deadline: Option<Instant>,
) -> TraversalResult {
    let mut result = TraversalResult::default();
    if !state.has_node(anchor) {
        return result;
    }

    let mut visited: HashSet<NodeId> = HashSet::new();
    let mut seen_edges: HashSet<EdgeId> = HashSet::new();
    let mut queue: VecDeque<(NodeId, usize)> = VecDeque::new();
    visited.insert(anchor.clone());
    queue.push_back((anchor.clone(), 0));

    'walk: while let Some((node, depth)) = queue.pop_front() {
        if depth >= config.max_hops {
            continue;
        }
        if deadline.is_some_and(|d| Instant::now() >= d) {
            result.truncated = true;
            break;
        }

        let Ok(neighbors) = state.neighbors(&node, None, config.direction) else {
            continue;
        };
        for n in neighbors {
            if n.confidence < config.floor {
                continue;
            }
            if !config.relations.is_empty() && !config.relations.contains(&n.relation) {
                continue;
            }
            if seen_edges.insert(n.edge) {
                if result.edges.len() >= config.max_edges {
                    result.truncated = true;
                    break 'walk;
                }
                result.edges.push(n.edge);
                result.depth_reached = result.depth_reached.max(depth + 1);
            }
            if visited.insert(n.node.clone()) {
                queue.push_back((n.node, depth + 1));
            }
        }
    }

    let mut visited: Vec<NodeId> = visited.into_iter().collect();
    visited.sort();
    result.visited = visited;
    result
}

/// One simple path: `nodes.len() == edges.len() + 1`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GraphPath {
    pub nodes: Vec<NodeId>,
    pub edges: Vec<EdgeId>,
}

impl GraphPath {
    pub fn len(&self) -> usize {
        self.edges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.edges.is_empty()
    }
}

/// Simple directed paths from `source` to `target` with at most `max_len`
/// edges, following outgoing live edges. Returns at most `limit` paths,
/// shortest first: depth-first search is rerun with a growing length bound
/// so the cap never drops a shorter path in favour of a longer one.
pub fn find_paths(
    state: &GraphState,
    source: &NodeId,
    target: &NodeId,
    max_len: usize,
    limit: usize,
    floor: f32,
) -> Result<Vec<GraphPath>, GraphError> {
    for id in [source, target] {
        if !state.has_node(id) {
            return Err(GraphError::NodeNotFound {
                node: id.to_string(),
            });
        }
    }

    let mut found = Vec::new();
    if source == target || limit == 0 {
        return Ok(found);
    }

    for depth in 1..=max_len {
        if found.len() >= limit {
            break;
        }
        let mut path = GraphPath {
            nodes: vec![source.clone()],
            edges: Vec::new(),
        };
        let mut on_path: HashSet<NodeId> = HashSet::from([source.clone()]);
        extend_paths(
            state,
            target,
            depth,
            limit,
            floor,
            &mut path,
            &mut on_path,
            &mut found,
        );
    }
    Ok(found)
}

/// Depth-first step that records only paths of exactly `depth` edges.
#[allow(clippy::too_many_arguments)]
fn extend_paths(
    state: &GraphState,
    target: &NodeId,
    depth: usize,
    limit: usize,
    floor: f32,
    path: &mut GraphPath,
    on_path: &mut HashSet<NodeId>,
    found: &mut Vec<GraphPath>,
) {
    if found.len() >= limit || path.len() >= depth {
        return;
    }
    let Some(tail) = path.nodes.last().cloned() else {
        return;
    };
    let Ok(neighbors) = state.neighbors(&tail, None, Some(Direction::Outgoing)) else {
        return;
    };

    for n in neighbors {
        if found.len() >= limit {
            return;
        }
        if n.confidence < floor || on_path.contains(&n.node) {
            continue;
        }
        path.nodes.push(n.node.clone());
        path.edges.push(n.edge);
        if n.node == *target {
            if path.len() == depth {
                found.push(path.clone());
            }
        } else {
            on_path.insert(n.node.clone());
            extend_paths(state, target, depth, limit, floor, path, on_path, found);
            on_path.remove(&n.node);
        }
        path.nodes.pop();
        path.edges.pop();
    }
}

impl GraphStore {
    /// Anchored BFS under the read lock.
    pub fn traverse(
        &self,
        anchor: &NodeId,
        config: &TraversalConfig,
        deadline: Option<Instant>,
    ) -> TraversalResult {
        self.read(|g| traverse_bfs(g, anchor, config, deadline))
    }

    /// Simple paths over non-retired edges.
    pub fn find_paths(
        &self,
        source: &NodeId,
        target: &NodeId,
        max_len: usize,
        limit: usize,
    ) -> Result<Vec<GraphPath>, GraphError> {
        self.read(|g| find_paths(g, source, target, max_len, limit, 0.0))
    }
}
