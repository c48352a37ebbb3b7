//! Distinct failure signals callers may want to match on.
//!
//! Everything else travels as a plain `anyhow::Error` with context attached.

use std::path::PathBuf;

use thiserror::Error;


#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested engine was not compiled into this build.
    #[error("{engine} storage engine is not available in this build")]
    EngineUnavailable { engine: &'static str },

    /// A migration or column-evolution source file does not exist.
    #[error("database not found: {}", .0.display())]
    SourceMissing(PathBuf),

    #[error("invalid storage mode '{0}' (expected 'aggregate' or 'full')")]
    InvalidStorageMode(String),

    #[error("invalid storage format '{0}' (expected 'sqlite' or 'duckdb')")]
    InvalidStorageFormat(String),
}
