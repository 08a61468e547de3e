//! Error types for the monitor pipeline.
//!
//! Components absorb transient and extraction errors at their boundary and log
//! them; only configuration errors are fatal, and only at startup.

use std::path::PathBuf;

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    // ─────────────────────────────────────────────────────────────────────
    // CAD source
    // ─────────────────────────────────────────────────────────────────────
    #[error("CAD source unavailable: {0}")]
    TransientSource(String),

    #[error("BOM extraction failed for {path}: {reason}")]
    Extraction { path: String, reason: String },

    // ─────────────────────────────────────────────────────────────────────
    // Version store
    // ─────────────────────────────────────────────────────────────────────
    #[error("version conflict for {assembly_key} after {attempts} attempts")]
    VersionConflict { assembly_key: String, attempts: u32 },

    #[error("storage error: {0}")]
    Storage(String),

    #[error("version {version} not found for {assembly_key}")]
    VersionNotFound { assembly_key: String, version: u32 },

    // ─────────────────────────────────────────────────────────────────────
    // Input and configuration
    // ─────────────────────────────────────────────────────────────────────
    #[error("invalid BOM item: {0}")]
    Validation(#[from] bomwatch_model::ItemRejection),

    #[error("configuration error: {0}")]
    Configuration(String),

    #[error("configuration file malformed: {path}: {details}")]
    ConfigMalformed { path: PathBuf, details: String },

    // ─────────────────────────────────────────────────────────────────────
    // Machine directory
    // ─────────────────────────────────────────────────────────────────────
    #[error("machine directory error: {0}")]
    Directory(String),
}

impl MonitorError {
    pub fn extraction(path: &str, reason: impl Into<String>) -> Self {
        MonitorError::Extraction {
            path: path.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<rusqlite::Error> for MonitorError {
    fn from(err: rusqlite::Error) -> Self {
        MonitorError::Storage(err.to_string())
    }
}

/// Convenience type alias for Results using MonitorError.
pub type Result<T> = std::result::Result<T, MonitorError>;
