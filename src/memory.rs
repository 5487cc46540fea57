//! Tiered fact cache in front of the retriever.
//!
//! Three LRU tiers (short, medium, long) hold *copies* of facts keyed by
//! [`FactKey`]. A key lives in at most one tier. New copies enter the short
//! tier; overflow pushes the least-recently-used entry one tier down, and
//! long-tier overflow is discarded. A hit in a lower tier promotes the entry
//! back to short.
//!
//! The cache is never the system of record: anything it cannot answer falls
//! through to the retriever.

use std::collections::HashSet;
use std::num::NonZeroUsize;

use lru::LruCache;

use crate::config::MemoryConfig;
use crate::graph::store::GraphStore;
use crate::graph::{Fact, FactKey};
use crate::index::{query_terms, tokenize};
use crate::retrieve::Query;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tier {
    Short,
    Medium,
    Long,
}

/// A cached fact copy.
#[derive(Debug, Clone, PartialEq)]
pub struct MemoryEntry {
    pub fact: Fact,
    /// Episode step at which the copy was stored.
    pub stored_step: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemoryStats {
    pub short_len: usize,
    pub medium_len: usize,
    pub long_len: usize,
    pub short_hits: u64,
    pub medium_hits: u64,
    pub long_hits: u64,
    pub misses: u64,
}

/// Share of distinct query terms found in the fact's text.
fn overlap(terms: &[String], fact: &Fact) -> f32 {
    let words: HashSet<String> = tokenize(&fact.text()).into_iter().collect();
    let matched = terms.iter().filter(|t| words.contains(*t)).count();
    matched as f32 / terms.len() as f32
}

fn capacity(n: usize) -> NonZeroUsize {
    NonZeroUsize::new(n).unwrap_or(NonZeroUsize::MIN)
}

/// Per-agent short/medium/long cache. Not synchronized.
pub struct MemoryTiers {
    short: LruCache<FactKey, MemoryEntry>,
    medium: LruCache<FactKey, MemoryEntry>,
    long: LruCache<FactKey, MemoryEntry>,
    stats: MemoryStats,
}

impl MemoryTiers {
    pub fn new(config: &MemoryConfig) -> Self {
        Self {
            short: LruCache::new(capacity(config.short_capacity)),
            medium: LruCache::new(capacity(config.medium_capacity)),
            long: LruCache::new(capacity(config.long_capacity)),
            stats: MemoryStats::default(),
        }
    }

    fn remove(&mut self, key: &FactKey) -> Option<MemoryEntry> {
        self.short
            .pop(key)
            .or_else(|| self.medium.pop(key))
            .or_else(|| self.long.pop(key))
    }

    /// Insert into short, cascading the evicted LRU entry downwards.
    fn insert_short(&mut self, key: FactKey, entry: MemoryEntry) {
        if let Some((k, v)) = self.short.push(key.clone(), entry) {
            if k != key {
                self.insert_medium(k, v);
            }
        }
    }

    fn insert_medium(&mut self, key: FactKey, entry: MemoryEntry) {
        if let Some((k, v)) = self.medium.push(key.clone(), entry) {
            if k != key {
                // long-tier overflow is discarded
                self.long.push(k, v);
            }
        }
    }

    /// Which tier currently holds `key`, without touching recency.
    pub fn tier_of(&self, key: &FactKey) -> Option<Tier> {
        if self.short.contains(key) {
            Some(Tier::Short)
        } else if self.medium.contains(key) {
            Some(Tier::Medium)
        } else if self.long.contains(key) {
            Some(Tier::Long)
        } else {
            None
        }
    }

    /// Look up a copy, short tier first. Hits in lower tiers are promoted.
    pub fn lookup(&mut self, key: &FactKey) -> Option<Fact> {
        if let Some(entry) = self.short.get(key) {
            self.stats.short_hits += 1;
            return Some(entry.fact.clone());
        }
        let (entry, tier) = if let Some(e) = self.medium.pop(key) {
            (e, Tier::Medium)
        } else if let Some(e) = self.long.pop(key) {
            (e, Tier::Long)
        } else {
            self.stats.misses += 1;
            return None;
        };
        match tier {
            Tier::Medium => self.stats.medium_hits += 1,
            _ => self.stats.long_hits += 1,
        }
        let fact = entry.fact.clone();
        self.insert_short(key.clone(), entry);
        Some(fact)
    }

    /// Answer a keyword query from cached copies.
    ///
    /// Copies that share a keyword with the query are re-read from `store`
    /// under one read lock first: retired or vanished facts are dropped from
    /// every tier and changed ones replace their copy. Returns `Some` only
    /// when at least `k` live facts still match; those `k` best (by overlap,
    /// then confidence) are promoted and returned with their overlap. Every
    /// other query is a miss.
    pub fn recall(
        &mut self,
        store: &GraphStore,
        query: &Query,
        k: usize,
        floor: f32,
    ) -> Option<Vec<(Fact, f32)>> {
        let Query::Keyword(terms) = query else {
            self.stats.misses += 1;
            return None;
        };
        let terms = query_terms(terms);
        if terms.is_empty() || k == 0 {
            self.stats.misses += 1;
            return None;
        }

        let candidates: Vec<FactKey> = self
            .short
            .iter()
            .chain(self.medium.iter())
            .chain(self.long.iter())
            .filter(|(_, e)| e.fact.is_live(floor) && overlap(&terms, &e.fact) > 0.0)
            .map(|(key, _)| key.clone())
            .collect();
        if candidates.len() < k {
            self.stats.misses += 1;
            return None;
        }

        let current: Vec<(FactKey, Option<Fact>)> = store.read(|g| {
            candidates
                .into_iter()
                .map(|key| {
                    let fact = g.find_fact(&key);
                    (key, fact)
                })
                .collect()
        });
        let mut matches: Vec<(FactKey, f32, f32)> = Vec::new();
        for (key, fact) in current {
            match fact {
                Some(fact) if fact.is_live(floor) => {
                    let score = overlap(&terms, &fact);
                    let confidence = fact.confidence;
                    self.replace_copy(&key, fact);
                    if score > 0.0 {
                        matches.push((key, score, confidence));
                    }
                }
                _ => {
                    self.remove(&key);
                }
            }
        }
        if matches.len() < k {
            self.stats.misses += 1;
            return None;
        }

        matches.sort_by(|a, b| {
            b.1.partial_cmp(&a.1)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(b.2.partial_cmp(&a.2).unwrap_or(std::cmp::Ordering::Equal))
                .then_with(|| a.0.cmp(&b.0))
        });
        matches.truncate(k);
        Some(
            matches
                .into_iter()
                .filter_map(|(key, overlap, _)| self.lookup(&key).map(|f| (f, overlap)))
                .collect(),
        )
    }

    /// Swap in a fresh copy wherever `key` lives, keeping tier and recency.
    fn replace_copy(&mut self, key: &FactKey, fact: Fact) {
        for tier in [&mut self.short, &mut self.medium, &mut self.long] {
            if let Some(entry) = tier.peek_mut(key) {
                entry.fact = fact;
                return;
            }
        }
    }

    /// Store copies of `facts`, replacing stale ones. Retired facts are
    /// dropped from every tier instead.
    pub fn write_back(&mut self, facts: &[Fact], step: u64) {
        for fact in facts {
            let key = fact.key();
            self.remove(&key);
            if fact.retired {
                continue;
            }
            self.insert_short(
                key,
                MemoryEntry {
                    fact: fact.clone(),
                    stored_step: step,
                },
            );
        }
    }

    /// Re-read every copy from the graph; drop copies that are gone, retired,
    /// or below the floor.
    pub fn refresh(&mut self, store: &GraphStore, floor: f32) -> usize {
        let mut dropped = 0;
        for tier in [&mut self.short, &mut self.medium, &mut self.long] {
            let keys: Vec<FactKey> = tier.iter().map(|(k, _)| k.clone()).collect();
            for key in keys {
                match store.find_fact(&key) {
                    Some(fact) if fact.is_live(floor) => {
                        if let Some(entry) = tier.peek_mut(&key) {
                            entry.fact = fact;
                        }
                    }
                    _ => {
                        tier.pop(&key);
                        dropped += 1;
                    }
                }
            }
        }
        dropped
    }

    /// Demote every short-tier entry to medium, oldest first.
    pub fn end_episode(&mut self) {
        while let Some((key, entry)) = self.short.pop_lru() {
            self.insert_medium(key, entry);
        }
    }

    pub fn clear(&mut self) {
        self.short.clear();
        self.medium.clear();
        self.long.clear();
    }

    pub fn len(&self) -> usize {
        self.short.len() + self.medium.len() + self.long.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> MemoryStats {
        MemoryStats {
            short_len: self.short.len(),
            medium_len: self.medium.len(),
            long_len: self.long.len(),
            ..self.stats
        }
    }
}

impl std::fmt::Debug for MemoryTiers {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryTiers")
            .field("stats", &self.stats())
            .finish()
    }
}
