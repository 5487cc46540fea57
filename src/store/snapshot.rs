//! Graph snapshots: the node list plus the edge list, every field included.
//!
//! The JSON form is one file per version, `graph_v{N}.json`, inside a
//! directory. Loading a snapshot back into a store re-checks every graph
//! invariant (see [`GraphStore::from_snapshot`](crate::graph::store::GraphStore::from_snapshot)).

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::StoreError;
use crate::graph::{Edge, Node};

use super::StoreResult;

/// A point-in-time copy of the whole graph.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GraphSnapshot {
    pub version: u64,
    /// Milliseconds since UNIX epoch.
    pub taken_at: u64,
    /// Sorted by id.
    pub nodes: Vec<Node>,
    /// Sorted by id, retired edges included.
    pub edges: Vec<Edge>,
}

/// File name of the JSON snapshot for `version`.
pub fn json_file_name(version: u64) -> String {
    format!("graph_v{version}.json")
}

fn parse_version(file_name: &str) -> Option<u64> {
    file_name
        .strip_prefix("graph_v")?
        .strip_suffix(".json")?
        .parse()
        .ok()
}

impl GraphSnapshot {
    /// Write to `dir/graph_v{version}.json`, creating `dir` if needed.
    pub fn save_json(&self, dir: &Path) -> StoreResult<PathBuf> {
        std::fs::create_dir_all(dir).map_err(|e| StoreError::Io { source: e })?;
        let path = dir.join(json_file_name(self.version));
        let json = serde_json::to_string_pretty(self).map_err(|e| StoreError::Serialization {
            message: format!("snapshot v{}: {e}", self.version),
        })?;
        std::fs::write(&path, json).map_err(|e| StoreError::Io { source: e })?;
        tracing::info!(
            version = self.version,
            nodes = self.nodes.len(),
            edges = self.edges.len(),
            path = %path.display(),
            "snapshot written"
        );
        Ok(path)
    }

    /// Read a JSON snapshot file. Structural checks happen on store rebuild.
    pub fn load_json(path: &Path) -> StoreResult<Self> {
        let json = std::fs::read_to_string(path).map_err(|e| StoreError::Io { source: e })?;
        serde_json::from_str(&json).map_err(|e| StoreError::Serialization {
            message: format!("{}: {e}", path.display()),
        })
    }

    /// Read version `version` from `dir`.
    pub fn load_version(dir: &Path, version: u64) -> StoreResult<Self> {
        let path = dir.join(json_file_name(version));
        if !path.exists() {
            return Err(StoreError::SnapshotNotFound { version });
        }
        Self::load_json(&path)
    }
}

/// Snapshot versions present in `dir`, ascending. A missing directory has none.
pub fn json_versions(dir: &Path) -> StoreResult<Vec<u64>> {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(StoreError::Io { source: e }),
    };
    let mut versions = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| StoreError::Io { source: e })?;
        if let Some(v) = entry.file_name().to_str().and_then(parse_version) {
            versions.push(v);
        }
    }
    versions.sort_unstable();
    Ok(versions)
}
