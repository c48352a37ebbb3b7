//! Goblin Store - snapshot storage for Claude Code usage history.
//!
//! Persists usage events and daily ledgers in SQLite or DuckDB, tracks
//! which source logs changed since the last ingestion cycle, and migrates
//! history between engines and schema versions.

pub mod aggregation;
pub mod config;
pub mod error;
pub mod ingest;
pub mod migration;
pub mod models;
pub mod replica;
pub mod storage;

pub use config::{DeviceIdentity, StorageConfig, StorageFormat, StorageMode};
pub use error::StorageError;
pub use storage::{open_store, SnapshotStore};
