//! Error types for recorder-core operations.
//!
//! Only `ConfigError` is ever fatal, and only at startup. Everything else is
//! recovered inside the supervisor or the retention worker.

use std::path::PathBuf;

// ═══════════════════════════════════════════════════════════════════════════════
// Startup Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// Invalid or unusable configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("rtsp_url is required")]
    MissingRtspUrl,

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },

    #[error("Configuration file malformed: {path}: {details}")]
    Malformed { path: PathBuf, details: String },

    #[error("Failed to read configuration file: {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Recording directory unusable: {path}: {source}")]
    RecordDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Session Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// The encoder subprocess could not be started.
#[derive(Debug, thiserror::Error)]
pub enum LaunchError {
    #[error("Failed to spawn encoder {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to prepare recording directory {path}: {source}")]
    RecordDir {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

// ═══════════════════════════════════════════════════════════════════════════════
// Retention Errors
// ═══════════════════════════════════════════════════════════════════════════════

/// A single listing or deletion failure inside a retention sweep.
#[derive(Debug, thiserror::Error)]
pub enum RetentionError {
    #[error("Failed to list recording directory {path}: {source}")]
    List {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to stat segment {path}: {source}")]
    Stat {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to delete segment {path}: {source}")]
    Delete {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}
