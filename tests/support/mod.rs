#![allow(dead_code)]

use std::path::{Path, PathBuf};

use goblin_store::config::{DeviceIdentity, StorageConfig, StorageFormat};
use goblin_store::models::{DeviceTag, TokenUsage, UsageRecord};
use goblin_store::storage::{open_store, SnapshotStore};
use tempfile::TempDir;
use tracing_subscriber::EnvFilter;

pub const SONNET: &str = "claude-sonnet-4-20250514";

pub struct TestStore {
    pub _dir: TempDir,
    pub store: Box<dyn SnapshotStore>,
    pub path: PathBuf,
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Engines compiled into this build.
pub fn formats() -> Vec<StorageFormat> {
    let mut formats = vec![StorageFormat::Sqlite];
    if cfg!(feature = "duckdb") {
        formats.push(StorageFormat::DuckDb);
    }
    formats
}

pub fn setup_store(format: StorageFormat) -> TestStore {
    init_tracing();
    let dir = tempfile::tempdir().expect("temp dir");
    let config = StorageConfig {
        storage_format: format,
        ..StorageConfig::in_dir(dir.path())
    };
    let path = config.db_path();
    let store = open_store(&config).expect("open store");
    TestStore {
        _dir: dir,
        store,
        path,
    }
}

pub fn device(id: &str) -> DeviceIdentity {
    DeviceIdentity::new(id, format!("{id}-host"), "linux")
}

/// A record timestamped at midday UTC on `day` (YYYY-MM-DD).
pub fn make_record(
    session: &str,
    uuid: &str,
    message_type: &str,
    day: &str,
    usage: Option<TokenUsage>,
) -> UsageRecord {
    UsageRecord {
        timestamp: format!("{day}T12:00:00Z").parse().expect("timestamp"),
        session_id: session.to_string(),
        message_uuid: uuid.to_string(),
        message_type: message_type.to_string(),
        model: usage.map(|_| SONNET.to_string()),
        folder: "/work/project".to_string(),
        git_branch: Some("main".to_string()),
        version: "2.0.0".to_string(),
        token_usage: usage,
        device: DeviceTag::default(),
    }
}

pub fn prompt(session: &str, uuid: &str, day: &str) -> UsageRecord {
    make_record(session, uuid, "user", day, None)
}

pub fn response(session: &str, uuid: &str, day: &str, input: i64, output: i64) -> UsageRecord {
    make_record(
        session,
        uuid,
        "assistant",
        day,
        Some(TokenUsage {
            input_tokens: input,
            output_tokens: output,
            ..Default::default()
        }),
    )
}

pub fn with_model(mut record: UsageRecord, model: &str) -> UsageRecord {
    record.model = Some(model.to_string());
    record
}

/// Write a source log file and return its path.
pub fn write_source(dir: &Path, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("write source file");
    path
}
