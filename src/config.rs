//! Engine configuration, persisted as TOML.
//!
//! Every field has a serde default, so a config file only needs the keys it
//! overrides. [`EngineConfig::validate`] runs before an engine is built.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::controller::ExecutionMode;
use crate::error::ConfigError;
use crate::graph::Relation;

pub type ConfigResult<T> = std::result::Result<T, ConfigError>;

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct EngineConfig {
    /// Directory for snapshots. `None` = in-memory only.
    #[serde(default)]
    pub data_dir: Option<PathBuf>,
    #[serde(default)]
    pub update: UpdateConfig,
    #[serde(default)]
    pub retrieval: RetrievalConfig,
    #[serde(default)]
    pub index: IndexConfig,
    #[serde(default)]
    pub memory: MemoryConfig,
    #[serde(default)]
    pub controller: ControllerConfig,
}

/// Evidence intake and decay.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateConfig {
    /// Minimum source confidence for creating a new edge.
    #[serde(default = "default_accept_threshold")]
    pub accept_threshold: f32,
    /// Edges below this confidence are retired.
    #[serde(default = "default_floor")]
    pub soft_retire_floor: f32,
    /// Multiplier applied by each decay sweep.
    #[serde(default = "default_decay_factor")]
    pub decay_factor: f32,
    /// Relations where a subject holds at most one live object.
    #[serde(default = "default_single_valued")]
    pub single_valued: Vec<Relation>,
}

fn default_accept_threshold() -> f32 {
    0.5
}
fn default_floor() -> f32 {
    0.05
}
fn default_decay_factor() -> f32 {
    0.95
}
fn default_single_valued() -> Vec<Relation> {
    vec![Relation::Transitions, Relation::HasState]
}

impl Default for UpdateConfig {
    fn default() -> Self {
        Self {
            accept_threshold: default_accept_threshold(),
            soft_retire_floor: default_floor(),
            decay_factor: default_decay_factor(),
            single_valued: default_single_valued(),
        }
    }
}

impl UpdateConfig {
    pub fn is_single_valued(&self, relation: Relation) -> bool {
        self.single_valued.contains(&relation)
    }
}

/// Weights of the composite retrieval score
/// `semantic*sim + keyword*overlap + confidence*conf - age*normalized_age`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetrievalWeights {
    pub semantic: f32,
    pub keyword: f32,
    pub confidence: f32,
    pub age: f32,
}

impl Default for RetrievalWeights {
    fn default() -> Self {
        Self {
            semantic: 0.4,
            keyword: 0.3,
            confidence: 0.2,
            age: 0.1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetrievalConfig {
    /// Default `k` for a retrieval.
    #[serde(default = "default_max_results")]
    pub max_results: usize,
    /// Soft deadline per retrieval, in milliseconds.
    #[serde(default = "default_time_budget_ms")]
    pub time_budget_ms: u64,
    /// Path queries follow incoming edges as well as outgoing ones.
    #[serde(default = "default_true")]
    pub path_both_directions: bool,
    #[serde(default)]
    pub weights: RetrievalWeights,
}

fn default_max_results() -> usize {
    10
}
fn default_time_budget_ms() -> u64 {
    50
}
fn default_true() -> bool {
    true
}

impl Default for RetrievalConfig {
    fn default() -> Self {
        Self {
            max_results: default_max_results(),
            time_budget_ms: default_time_budget_ms(),
            path_both_directions: true,
            weights: RetrievalWeights::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexConfig {
    /// Compact once tombstones exceed this share of indexed facts.
    #[serde(default = "default_tombstone_ratio")]
    pub rebuild_tombstone_ratio: f32,
    /// Dimension of the built-in hashing embedder; `None` disables vectors
    /// unless a provider is passed to the engine explicitly.
    #[serde(default)]
    pub hashing_dimension: Option<usize>,
}

fn default_tombstone_ratio() -> f32 {
    0.2
}

impl Default for IndexConfig {
    fn default() -> Self {
        Self {
            rebuild_tombstone_ratio: default_tombstone_ratio(),
            hashing_dimension: None,
        }
    }
}

/// Memory tier capacities.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryConfig {
    #[serde(default = "default_short")]
    pub short_capacity: usize,
    #[serde(default = "default_medium")]
    pub medium_capacity: usize,
    #[serde(default = "default_long")]
    pub long_capacity: usize,
}

fn default_short() -> usize {
    10
}
fn default_medium() -> usize {
    50
}
fn default_long() -> usize {
    100
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            short_capacity: default_short(),
            medium_capacity: default_medium(),
            long_capacity: default_long(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// Mode used when an episode is started without an explicit one.
    #[serde(default)]
    pub mode: ExecutionMode,
    /// Updates applied per window before the rest are held back.
    #[serde(default = "default_max_updates")]
    pub max_updates_per_window: usize,
    #[serde(default = "default_window_steps")]
    pub update_window_steps: u64,
    /// Run a decay sweep every N steps. `None` = never.
    #[serde(default)]
    pub decay_every_steps: Option<u64>,
}

fn default_max_updates() -> usize {
    10
}
fn default_window_steps() -> u64 {
    1
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            mode: ExecutionMode::default(),
            max_updates_per_window: default_max_updates(),
            update_window_steps: default_window_steps(),
            decay_every_steps: None,
        }
    }
}

fn unit_interval(name: &str, value: f32) -> ConfigResult<()> {
    if value.is_finite() && (0.0..=1.0).contains(&value) {
        Ok(())
    } else {
        Err(ConfigError::Invalid {
            message: format!("{name} must be in [0, 1], got {value}"),
        })
    }
}

fn positive(name: &str, value: u64) -> ConfigResult<()> {
    if value == 0 {
        Err(ConfigError::Invalid {
            message: format!("{name} must be at least 1"),
        })
    } else {
        Ok(())
    }
}

impl EngineConfig {
    /// Check ranges and capacities.
    pub fn validate(&self) -> ConfigResult<()> {
        let u = &self.update;
        unit_interval("update.accept_threshold", u.accept_threshold)?;
        unit_interval("update.soft_retire_floor", u.soft_retire_floor)?;
        unit_interval("update.decay_factor", u.decay_factor)?;
        unit_interval("index.rebuild_tombstone_ratio", self.index.rebuild_tombstone_ratio)?;

        let w = &self.retrieval.weights;
        for (name, value) in [
            ("retrieval.weights.semantic", w.semantic),
            ("retrieval.weights.keyword", w.keyword),
            ("retrieval.weights.confidence", w.confidence),
            ("retrieval.weights.age", w.age),
        ] {
            if !value.is_finite() || value < 0.0 {
                return Err(ConfigError::Invalid {
                    message: format!("{name} must be a non-negative number, got {value}"),
                });
            }
        }
        positive("retrieval.max_results", self.retrieval.max_results as u64)?;

        let m = &self.memory;
        positive("memory.short_capacity", m.short_capacity as u64)?;
        positive("memory.medium_capacity", m.medium_capacity as u64)?;
        positive("memory.long_capacity", m.long_capacity as u64)?;

        let c = &self.controller;
        positive("controller.max_updates_per_window", c.max_updates_per_window as u64)?;
        positive("controller.update_window_steps", c.update_window_steps)?;
        if let Some(n) = c.decay_every_steps {
            positive("controller.decay_every_steps", n)?;
        }
        if let Some(dim) = self.index.hashing_dimension {
            positive("index.hashing_dimension", dim as u64)?;
        }
        Ok(())
    }

    /// Load from a TOML file and validate.
    pub fn load(path: &Path) -> ConfigResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.display().to_string(),
            source: e,
        })?;
        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Save to a TOML file, creating the parent directory if needed.
    pub fn save(&self, path: &Path) -> ConfigResult<()> {
        let content = toml::to_string_pretty(self).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            message: e.to_string(),
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| ConfigError::Write {
                path: parent.display().to_string(),
                source: e,
            })?;
        }
        std::fs::write(path, content).map_err(|e| ConfigError::Write {
            path: path.display().to_string(),
            source: e,
        })
    }
}
