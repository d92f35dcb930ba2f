//! # Persistence Module
//!
//! Keeps telemetry history across sessions. Each tracked metric is stored as
//! its own TOML file holding the ordered list of points, written by a single
//! background worker so two writes to the same file never overlap.
//!
//! ## Error Handling Strategy
//! Storage problems are never fatal. A missing or unreadable file loads as an
//! empty series and a failed write is logged; the in-memory buffer stays the
//! source of truth for the running session.

pub mod persistence_worker;
pub mod series_store;

use crate::telemetry::codec::Reading;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, thiserror::Error)]
pub enum PersistError {
    #[error("storage I/O failed for {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("stored series {path} is corrupt: {reason}")]
    Corrupt { path: PathBuf, reason: String },

    #[error("series could not be serialized: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("persistence worker is gone")]
    WorkerGone,
}

/// On-disk layout of one series
#[derive(Deserialize, Serialize, Clone, Debug, Default, PartialEq)]
pub struct SeriesFile {
    pub key: String,
    #[serde(default)]
    pub points: Vec<Reading>,
}

/// File holding the series `key` inside `dir`. Characters outside
/// `[A-Za-z0-9_-]` are replaced so any key maps to a single file name.
pub fn series_path(dir: &Path, key: &str) -> PathBuf {
    let name: String = key
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    dir.join(format!("{name}.toml"))
}
