//! Keyword and vector indices over the graph's facts.
//!
//! Postings and vectors live in `DashMap` shards so retrievals read them
//! concurrently with the updater's incremental refreshes. Retired edges are
//! tombstoned and filtered at query time; [`Indexer::maybe_compact`] drops
//! them once they make up too large a share of the index.

use std::collections::HashSet;
use std::sync::Arc;

use dashmap::{DashMap, DashSet};
use rayon::prelude::*;

use crate::error::ValidationError;
use crate::graph::store::GraphStore;
use crate::graph::{EdgeId, Fact};

/// Words dropped from fact text and keyword queries.
pub const STOP_WORDS: &[&str] = &[
    "the", "a", "an", "and", "or", "but", "in", "on", "at", "to", "for", "of", "with", "by", "is",
    "are", "was", "were", "be", "been", "being", "have", "has", "had", "do", "does", "did", "will",
    "would", "could", "should", "may", "might", "can", "must",
];

/// Tokens shorter than this are dropped.
pub const MIN_TOKEN_LEN: usize = 2;

/// Split text into lowercase keyword tokens.
///
/// Splits on every non-alphanumeric character, drops stop words and tokens
/// shorter than [`MIN_TOKEN_LEN`]. Order is preserved, duplicates are kept.
pub fn tokenize(text: &str) -> Vec<String> {
    text.split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.chars().count() >= MIN_TOKEN_LEN)
        .map(str::to_lowercase)
        .filter(|t| !STOP_WORDS.contains(&t.as_str()))
        .collect()
}

/// Distinct keyword tokens of a list of query terms.
pub fn query_terms<S: AsRef<str>>(terms: &[S]) -> Vec<String> {
    let mut seen = HashSet::new();
    terms
        .iter()
        .flat_map(|t| tokenize(t.as_ref()))
        .filter(|t| seen.insert(t.clone()))
        .collect()
}

/// Cosine similarity in `[-1, 1]`; 0 for mismatched or zero-length vectors.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;
    for (x, y) in a.iter().zip(b) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }
    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON { 0.0 } else { dot / denom }
}

// ---------------------------------------------------------------------------
// Embedding providers
// ---------------------------------------------------------------------------

/// Produces fixed-dimension embeddings for fact and query text.
///
/// The engine treats this as a pure function; retries are the provider's
/// business.
pub trait EmbeddingProvider: Send + Sync {
    fn dimension(&self) -> usize;
    fn embed(&self, text: &str) -> Vec<f32>;
}

/// Deterministic feature-hashing bag-of-words embedder.
///
/// Each keyword token is hashed (FNV-1a) into one of `dimension` buckets with
/// a hash-derived sign; the result is L2-normalized. Good enough for tests
/// and offline runs where no model is available.
#[derive(Debug, Clone)]
pub struct HashingEmbedder {
    dimension: usize,
}

impl HashingEmbedder {
    pub fn new(dimension: usize) -> Self {
        Self {
            dimension: dimension.max(1),
        }
    }
}

impl Default for HashingEmbedder {
    fn default() -> Self {
        Self::new(64)
    }
}

fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325;
    for b in bytes {
        hash ^= u64::from(*b);
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

impl EmbeddingProvider for HashingEmbedder {
    fn dimension(&self) -> usize {
        self.dimension
    }

    fn embed(&self, text: &str) -> Vec<f32> {
        let mut v = vec![0.0f32; self.dimension];
        for token in tokenize(text) {
            let h = fnv1a(token.as_bytes());
            let bucket = (h % self.dimension as u64) as usize;
            let sign = if (h >> 63) == 0 { 1.0 } else { -1.0 };
            v[bucket] += sign;
        }
        let norm = v.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > f32::EPSILON {
            v.iter_mut().for_each(|x| *x /= norm);
        }
        v
    }
}

// ---------------------------------------------------------------------------
// Indexer
// ---------------------------------------------------------------------------

/// A search hit: the edge id and its strategy-specific score.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FactRef {
    pub edge_id: EdgeId,
    /// Keyword overlap in `[0, 1]` or cosine similarity in `[-1, 1]`.
    pub score: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct IndexStats {
    pub indexed: usize,
    pub terms: usize,
    pub vectors: usize,
    pub tombstones: usize,
}

/// Keyword + vector index keyed by edge id.
pub struct Indexer {
    postings: DashMap<String, HashSet<EdgeId>>,
    /// Terms each edge was indexed under, so re-indexing can replace them.
    terms_of: DashMap<EdgeId, Vec<String>>,
    vectors: DashMap<EdgeId, Vec<f32>>,
    tombstones: DashSet<EdgeId>,
    embedder: Option<Arc<dyn EmbeddingProvider>>,
    rebuild_tombstone_ratio: f32,
}

impl Indexer {
    /// Without an embedder, vector search always comes back empty.
    pub fn new(embedder: Option<Arc<dyn EmbeddingProvider>>, rebuild_tombstone_ratio: f32) -> Self {
        Self {
            postings: DashMap::new(),
            terms_of: DashMap::new(),
            vectors: DashMap::new(),
            tombstones: DashSet::new(),
            embedder,
            rebuild_tombstone_ratio,
        }
    }

    pub fn embedder(&self) -> Option<&Arc<dyn EmbeddingProvider>> {
        self.embedder.as_ref()
    }

    pub fn dimension(&self) -> Option<usize> {
        self.embedder.as_ref().map(|e| e.dimension())
    }

    fn drop_entries(&self, id: EdgeId) {
        if let Some((_, terms)) = self.terms_of.remove(&id) {
            for term in terms {
                let now_empty = match self.postings.get_mut(&term) {
                    Some(mut set) => {
                        set.remove(&id);
                        set.is_empty()
                    }
                    None => false,
                };
                if now_empty {
                    self.postings.remove_if(&term, |_, set| set.is_empty());
                }
            }
        }
        self.vectors.remove(&id);
    }

    /// Index (or re-index) one fact, replacing any previous entries.
    ///
    /// A retired fact stays indexed but tombstoned; indexing a live fact
    /// clears its tombstone.
    pub fn index_fact(&self, fact: &Fact) {
        let id = fact.edge_id;
        self.drop_entries(id);

        let text = fact.text();
        let terms = query_terms(&[text.as_str()]);
        for term in &terms {
            self.postings.entry(term.clone()).or_default().insert(id);
        }
        self.terms_of.insert(id, terms);
        if let Some(embedder) = &self.embedder {
            self.vectors.insert(id, embedder.embed(&text));
        }

        if fact.retired {
            self.tombstones.insert(id);
        } else {
            self.tombstones.remove(&id);
        }
    }

    /// Tombstone a retired edge; its entries are filtered until compaction.
    pub fn mark_retired(&self, id: EdgeId) {
        if self.terms_of.contains_key(&id) {
            self.tombstones.insert(id);
        }
    }

    pub fn is_tombstoned(&self, id: EdgeId) -> bool {
        self.tombstones.contains(&id)
    }

    /// Keyword search. Score is matched query terms over distinct query terms.
    pub fn search_keyword<S: AsRef<str>>(&self, terms: &[S], k: usize) -> Vec<FactRef> {
        let terms = query_terms(terms);
        if terms.is_empty() || k == 0 {
            return Vec::new();
        }

        let mut matched: std::collections::HashMap<EdgeId, usize> = Default::default();
        for term in &terms {
            if let Some(set) = self.postings.get(term) {
                for id in set.iter() {
                    if !self.tombstones.contains(id) {
                        *matched.entry(*id).or_insert(0) += 1;
                    }
                }
            }
        }

        let total = terms.len() as f32;
        let mut hits: Vec<FactRef> = matched
            .into_iter()
            .map(|(edge_id, n)| FactRef {
                edge_id,
                score: n as f32 / total,
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(k);
        hits
    }

    /// Brute-force cosine search. Hits below `threshold` are dropped.
    pub fn search_vector(
        &self,
        embedding: &[f32],
        k: usize,
        threshold: f32,
    ) -> Result<Vec<FactRef>, ValidationError> {
        if !threshold.is_finite() || !(-1.0..=1.0).contains(&threshold) {
            return Err(ValidationError::ThresholdOutOfRange { value: threshold });
        }
        let Some(expected) = self.dimension() else {
            return Ok(Vec::new());
        };
        if embedding.len() != expected {
            return Err(ValidationError::DimensionMismatch {
                expected,
                actual: embedding.len(),
            });
        }
        if k == 0 {
            return Ok(Vec::new());
        }

        let ids: Vec<EdgeId> = self
            .vectors
            .iter()
            .map(|e| *e.key())
            .filter(|id| !self.tombstones.contains(id))
            .collect();
        let mut hits: Vec<FactRef> = ids
            .par_iter()
            .filter_map(|id| {
                let v = self.vectors.get(id)?;
                let score = cosine_similarity(embedding, v.value());
                (score >= threshold).then_some(FactRef {
                    edge_id: *id,
                    score,
                })
            })
            .collect();
        sort_hits(&mut hits);
        hits.truncate(k);
        Ok(hits)
    }

    /// Embed free text with the configured provider.
    pub fn embed(&self, text: &str) -> Option<Vec<f32>> {
        self.embedder.as_ref().map(|e| e.embed(text))
    }

    /// Drop every tombstoned entry.
    pub fn rebuild(&self) {
        let dead: Vec<EdgeId> = self.tombstones.iter().map(|id| *id).collect();
        for id in &dead {
            self.drop_entries(*id);
            self.tombstones.remove(id);
        }
        tracing::debug!(dropped = dead.len(), "index compacted");
    }

    /// Rebuild when tombstones exceed the configured share of indexed facts.
    /// Returns `true` if a rebuild ran.
    pub fn maybe_compact(&self) -> bool {
        let indexed = self.terms_of.len();
        if indexed == 0 || self.tombstones.is_empty() {
            return false;
        }
        let ratio = self.tombstones.len() as f32 / indexed as f32;
        if ratio > self.rebuild_tombstone_ratio {
            self.rebuild();
            true
        } else {
            false
        }
    }

    /// Discard everything and index the live facts of `store`.
    pub fn reindex_all(&self, store: &GraphStore) {
        self.postings.clear();
        self.terms_of.clear();
        self.vectors.clear();
        self.tombstones.clear();
        let facts = store.facts(false);
        for fact in &facts {
            self.index_fact(fact);
        }
        tracing::info!(facts = facts.len(), "index rebuilt from graph");
    }

    pub fn stats(&self) -> IndexStats {
        IndexStats {
            indexed: self.terms_of.len(),
            terms: self.postings.len(),
            vectors: self.vectors.len(),
            tombstones: self.tombstones.len(),
        }
    }
}

fn sort_hits(hits: &mut [FactRef]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then(a.edge_id.cmp(&b.edge_id))
    });
}

impl std::fmt::Debug for Indexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Indexer")
            .field("stats", &self.stats())
            .field("dimension", &self.dimension())
            .finish()
    }
}
