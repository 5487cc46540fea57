//! Retrieval: keyword, semantic, path, and hybrid queries over the graph.
//!
//! Every strategy produces candidate edge ids plus per-strategy signals. The
//! candidates are unioned by fact identity, re-read from the graph under one
//! read lock, filtered to live facts, and ranked by a weighted composite
//! score. A retrieval that overruns its time budget ranks what it gathered
//! and comes back `partial`.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use petgraph::Direction;

use crate::config::RetrievalConfig;
use crate::error::ValidationError;
use crate::graph::store::GraphStore;
use crate::graph::traverse::{TraversalConfig, traverse_bfs};
use crate::graph::{EdgeId, Fact, NodeId, Relation};
use crate::index::Indexer;

/// A structured retrieval query.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    /// Facts whose text shares keywords with `terms`.
    Keyword(Vec<String>),
    /// Facts whose embedding has cosine similarity `>= threshold`.
    Semantic { embedding: Vec<f32>, threshold: f32 },
    /// Facts within `max_hops` of `anchor`, optionally restricted to `relations`.
    Path {
        anchor: NodeId,
        max_hops: usize,
        relations: Vec<Relation>,
    },
    /// Union of several sub-queries.
    Hybrid(Vec<Query>),
}

impl Query {
    pub fn keyword<S: AsRef<str>>(terms: &[S]) -> Self {
        Query::Keyword(terms.iter().map(|t| t.as_ref().to_string()).collect())
    }

    pub fn semantic(embedding: Vec<f32>, threshold: f32) -> Self {
        Query::Semantic {
            embedding,
            threshold,
        }
    }

    pub fn path(anchor: impl Into<NodeId>, max_hops: usize) -> Self {
        Query::Path {
            anchor: anchor.into(),
            max_hops,
            relations: Vec::new(),
        }
    }

    /// Restrict a `Path` query to the given relations. No-op on other variants.
    pub fn with_relations(mut self, allowed: &[Relation]) -> Self {
        if let Query::Path { relations, .. } = &mut self {
            relations.extend_from_slice(allowed);
        }
        self
    }

    /// Leaf queries in order, with nested `Hybrid`s flattened.
    fn leaves(&self) -> Vec<&Query> {
        match self {
            Query::Hybrid(parts) => parts.iter().flat_map(Query::leaves).collect(),
            leaf => vec![leaf],
        }
    }
}

/// A ranked fact with the signals that produced its score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredFact {
    pub fact: Fact,
    pub score: f32,
    /// Best cosine similarity seen (0 when no semantic strategy matched).
    pub similarity: f32,
    /// Best keyword overlap seen (0 when no keyword strategy matched).
    pub keyword_overlap: f32,
}

/// Outcome of one retrieval.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RankedFacts {
    /// Highest score first.
    pub facts: Vec<ScoredFact>,
    /// Nodes reached by path strategies, deduplicated and sorted.
    pub visited: Vec<NodeId>,
    /// The soft deadline cut gathering short.
    pub partial: bool,
    /// Served from cached copies instead of the graph.
    pub from_memory: bool,
    pub elapsed: Duration,
}

impl RankedFacts {
    pub fn len(&self) -> usize {
        self.facts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.facts.is_empty()
    }

    pub fn top(&self) -> Option<&Fact> {
        self.facts.first().map(|s| &s.fact)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Fact> {
        self.facts.iter().map(|s| &s.fact)
    }

    /// One numbered line per fact, for the agent's prompt.
    pub fn render(&self, include_scores: bool) -> String {
        if self.facts.is_empty() {
            return "No relevant information found.".to_string();
        }
        self.facts
            .iter()
            .enumerate()
            .map(|(i, s)| {
                if include_scores {
                    format!("{}. {} (score: {:.3})", i + 1, s.fact, s.score)
                } else {
                    format!("{}. {}", i + 1, s.fact)
                }
            })
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// Counters over the retriever's lifetime.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RetrievalStats {
    pub queries: u64,
    pub partial: u64,
    pub facts_returned: u64,
}

#[derive(Debug, Default, Clone, Copy)]
struct Signals {
    similarity: f32,
    keyword: f32,
}

/// Answers [`Query`]s against the graph store and indexer.
pub struct Retriever {
    graph: Arc<GraphStore>,
    indexer: Arc<Indexer>,
    config: RetrievalConfig,
    floor: f32,
    queries: AtomicU64,
    partial: AtomicU64,
    facts_returned: AtomicU64,
}

impl Retriever {
    pub fn new(
        graph: Arc<GraphStore>,
        indexer: Arc<Indexer>,
        config: RetrievalConfig,
        floor: f32,
    ) -> Self {
        Self {
            graph,
            indexer,
            config,
            floor,
            queries: AtomicU64::new(0),
            partial: AtomicU64::new(0),
            facts_returned: AtomicU64::new(0),
        }
    }

    pub fn config(&self) -> &RetrievalConfig {
        &self.config
    }

    /// Retrieve with the configured `max_results`.
    pub fn retrieve(&self, query: &Query) -> Result<RankedFacts, ValidationError> {
        self.retrieve_k(query, self.config.max_results)
    }

    /// Retrieve at most `k` facts.
    ///
    /// Only malformed queries (embedding dimension, threshold range) fail.
    /// Empty results and unknown anchors are ordinary outcomes.
    pub fn retrieve_k(&self, query: &Query, k: usize) -> Result<RankedFacts, ValidationError> {
        let started = Instant::now();
        let deadline = started + Duration::from_millis(self.config.time_budget_ms);
        let leaves = query.leaves();

        // Reject malformed leaves before doing any work.
        for leaf in &leaves {
            if let Query::Semantic {
                embedding,
                threshold,
            } = leaf
            {
                self.indexer.search_vector(embedding, 0, *threshold)?;
            }
        }

        let mut candidates: HashMap<EdgeId, Signals> = HashMap::new();
        let mut visited: HashSet<NodeId> = HashSet::new();
        let mut partial = false;

        for leaf in leaves {
            if Instant::now() >= deadline {
                partial = true;
                break;
            }
            match leaf {
                Query::Keyword(terms) => {
                    for hit in self.indexer.search_keyword(terms, usize::MAX) {
                        let s = candidates.entry(hit.edge_id).or_default();
                        s.keyword = s.keyword.max(hit.score);
                    }
                }
                Query::Semantic {
                    embedding,
                    threshold,
                } => {
                    for hit in self.indexer.search_vector(embedding, usize::MAX, *threshold)? {
                        let s = candidates.entry(hit.edge_id).or_default();
                        s.similarity = s.similarity.max(hit.score);
                    }
                }
                Query::Path {
                    anchor,
                    max_hops,
                    relations,
                } => {
                    let config = TraversalConfig {
                        max_hops: *max_hops,
                        relations: relations.iter().copied().collect(),
                        direction: (!self.config.path_both_directions)
                            .then_some(Direction::Outgoing),
                        floor: self.floor,
                        ..Default::default()
                    };
                    let walk = self
                        .graph
                        .read(|g| traverse_bfs(g, anchor, &config, Some(deadline)));
                    partial |= walk.truncated;
                    for id in walk.edges {
                        candidates.entry(id).or_default();
                    }
                    visited.extend(walk.visited);
                }
                // flattened by `leaves`
                Query::Hybrid(_) => {}
            }
        }

        let facts = self.rank(candidates, k);
        let mut visited: Vec<NodeId> = visited.into_iter().collect();
        visited.sort();
        let elapsed = started.elapsed();

        if partial {
            tracing::warn!(
                budget_ms = self.config.time_budget_ms,
                elapsed_ms = elapsed.as_millis() as u64,
                returned = facts.len(),
                "retrieval exceeded time budget, returning partial results"
            );
            self.partial.fetch_add(1, Ordering::Relaxed);
        }
        self.queries.fetch_add(1, Ordering::Relaxed);
        self.facts_returned
            .fetch_add(facts.len() as u64, Ordering::Relaxed);

        Ok(RankedFacts {
            facts,
            visited,
            partial,
            from_memory: false,
            elapsed,
        })
    }

    fn rank(&self, candidates: HashMap<EdgeId, Signals>, k: usize) -> Vec<ScoredFact> {
        let live: Vec<(Fact, Signals)> = self.graph.read(|g| {
            candidates
                .into_iter()
                .filter_map(|(id, signals)| {
                    let fact = g.fact(id)?;
                    fact.is_live(self.floor).then_some((fact, signals))
                })
                .collect()
        });
        if live.is_empty() {
            return Vec::new();
        }

        let newest = live.iter().map(|(f, _)| f.updated_at).max().unwrap_or(0);
        let oldest = live.iter().map(|(f, _)| f.updated_at).min().unwrap_or(0);
        let span = newest.saturating_sub(oldest) as f32;
        let w = self.config.weights;

        let mut scored: Vec<ScoredFact> = live
            .into_iter()
            .map(|(fact, s)| {
                let age = if span > 0.0 {
                    newest.saturating_sub(fact.updated_at) as f32 / span
                } else {
                    0.0
                };
                let score = w.semantic * s.similarity + w.keyword * s.keyword
                    + w.confidence * fact.confidence
                    - w.age * age;
                ScoredFact {
                    fact,
                    score,
                    similarity: s.similarity,
                    keyword_overlap: s.keyword,
                }
            })
            .collect();

        scored.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.fact.evidence_count.cmp(&a.fact.evidence_count))
                .then_with(|| a.fact.subject.cmp(&b.fact.subject))
                .then(a.fact.relation.cmp(&b.fact.relation))
                .then_with(|| a.fact.object.cmp(&b.fact.object))
        });
        scored.truncate(k);
        scored
    }

    pub fn stats(&self) -> RetrievalStats {
        RetrievalStats {
            queries: self.queries.load(Ordering::Relaxed),
            partial: self.partial.load(Ordering::Relaxed),
            facts_returned: self.facts_returned.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for Retriever {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retriever")
            .field("config", &self.config)
            .field("floor", &self.floor)
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::{EdgeSpec, NodeSpec};
    use crate::index::HashingEmbedder;

    struct Fixture {
        graph: Arc<GraphStore>,
        indexer: Arc<Indexer>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                graph: Arc::new(GraphStore::new()),
                indexer: Arc::new(Indexer::new(Some(Arc::new(HashingEmbedder::new(32))), 0.2)),
            }
        }

        fn add(&self, s: &str, r: Relation, o: &str, conf: f32) -> EdgeId {
            for id in [s, o] {
                self.graph.upsert_node(NodeSpec::entity(id)).unwrap();
            }
            let up = self
                .graph
                .upsert_edge(EdgeSpec::new(s, r, o).with_confidence(conf))
                .unwrap();
            self.indexer.index_fact(&self.graph.fact(up.id).unwrap());
            up.id
        }

        fn retriever(&self, config: RetrievalConfig) -> Retriever {
            Retriever::new(self.graph.clone(), self.indexer.clone(), config, 0.05)
        }
    }

    #[test]
    fn keyword_top_hit() {
        let fx = Fixture::new();
        let id = fx.add("kitchen", Relation::Contains, "fridge", 0.9);
        fx.add("garden", Relation::Contains, "shovel", 0.9);
        let r = fx.retriever(RetrievalConfig::default());

        let ranked = r.retrieve(&Query::keyword(&["kitchen"])).unwrap();
        assert_eq!(ranked.len(), 1);
        assert_eq!(ranked.top().unwrap().edge_id, id);
        assert!(!ranked.partial);
    }

    #[test]
    fn hybrid_unions_by_identity() {
        let fx = Fixture::new();
        fx.add("kitchen", Relation::Contains, "fridge", 0.9);
        fx.add("hallway", Relation::Enables, "kitchen", 0.8);
        let r = fx.retriever(RetrievalConfig::default());

        let q = fx.indexer.embed("kitchen fridge").unwrap();
        let ranked = r
            .retrieve(&Query::Hybrid(vec![
                Query::keyword(&["kitchen"]),
                Query::semantic(q, 0.3),
                Query::path("kitchen", 1),
            ]))
            .unwrap();
        assert_eq!(ranked.len(), 2);
        let top = &ranked.facts[0];
        assert_eq!(top.fact.object, NodeId::new("fridge"));
        assert!(top.similarity > 0.5);
        assert!((top.keyword_overlap - 1.0).abs() < 1e-6);
        assert_eq!(ranked.visited.len(), 3);
    }

    #[test]
    fn ties_break_on_evidence_then_subject() {
        let fx = Fixture::new();
        fx.add("beta", Relation::Contains, "lamp", 0.8);
        fx.add("alpha", Relation::Contains, "lamp", 0.8);
        let config = RetrievalConfig {
            weights: crate::config::RetrievalWeights {
                semantic: 0.0,
                keyword: 1.0,
                confidence: 0.0,
                age: 0.0,
            },
            ..Default::default()
        };
        let r = fx.retriever(config);

        let ranked = r.retrieve(&Query::keyword(&["lamp"])).unwrap();
        let subjects: Vec<&str> = ranked.iter().map(|f| f.subject.as_str()).collect();
        assert_eq!(subjects, vec!["alpha", "beta"]);

        // more evidence wins the tie
        fx.graph
            .upsert_edge(EdgeSpec::new("beta", Relation::Contains, "lamp").with_confidence(0.8))
            .unwrap();
        let ranked = r.retrieve(&Query::keyword(&["lamp"])).unwrap();
        assert_eq!(ranked.top().unwrap().subject.as_str(), "beta");
    }

    #[test]
    fn retired_facts_excluded() {
        let fx = Fixture::new();
        let id = fx.add("kitchen", Relation::Contains, "fridge", 0.9);
        fx.graph.remove_edge_soft(id).unwrap();
        let r = fx.retriever(RetrievalConfig::default());
        assert!(r.retrieve(&Query::keyword(&["kitchen"])).unwrap().is_empty());
        assert!(r.retrieve(&Query::path("kitchen", 2)).unwrap().is_empty());
    }

    #[test]
    fn k_truncates_and_unknown_anchor_is_empty() {
        let fx = Fixture::new();
        for room in ["a1", "b2", "c3"] {
            fx.add(room, Relation::Contains, "chair", 0.9);
        }
        let r = fx.retriever(RetrievalConfig::default());
        assert_eq!(r.retrieve_k(&Query::keyword(&["chair"]), 2).unwrap().len(), 2);
        let ranked = r.retrieve(&Query::path("attic", 3)).unwrap();
        assert!(ranked.is_empty());
        assert!(ranked.visited.is_empty());
    }

    #[test]
    fn semantic_dimension_mismatch_is_an_error() {
        let fx = Fixture::new();
        fx.add("kitchen", Relation::Contains, "fridge", 0.9);
        let r = fx.retriever(RetrievalConfig::default());
        assert!(matches!(
            r.retrieve(&Query::semantic(vec![1.0, 0.0], 0.1)),
            Err(ValidationError::DimensionMismatch { .. })
        ));
    }

    #[test]
    fn zero_budget_returns_partial() {
        let fx = Fixture::new();
        fx.add("kitchen", Relation::Contains, "fridge", 0.9);
        let r = fx.retriever(RetrievalConfig {
            time_budget_ms: 0,
            ..Default::default()
        });
        let ranked = r.retrieve(&Query::keyword(&["kitchen"])).unwrap();
        assert!(ranked.partial);
        assert_eq!(r.stats().partial, 1);
    }

    #[test]
    fn render_formats_lines() {
        let fx = Fixture::new();
        fx.add("kitchen", Relation::Contains, "fridge", 0.9);
        let r = fx.retriever(RetrievalConfig::default());
        let ranked = r.retrieve(&Query::keyword(&["fridge"])).unwrap();
        assert_eq!(ranked.render(false), "1. kitchen contains fridge (0.90)");
        assert!(ranked.render(true).contains("score:"));
        assert_eq!(
            RankedFacts::default().render(false),
            "No relevant information found."
        );
    }
}
