//! Storage settings and database path resolution.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::config::DeviceIdentity;
use crate::error::StorageError;
use crate::storage::PriceList;


/// File stem used when no device identity is configured.
pub const LEGACY_DB_STEM: &str = "usage_history";


/// Get the default per-user data directory.
pub fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".claude")
        .join("usage")
}


/// Physical storage engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageFormat {
    #[default]
    Sqlite,
    DuckDb,
}

impl StorageFormat {
    /// File extension for this engine, including the dot.
    pub fn extension(self) -> &'static str {
        match self {
            Self::Sqlite => ".db",
            Self::DuckDb => ".duckdb",
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Sqlite => "sqlite",
            Self::DuckDb => "duckdb",
        }
    }
}

impl fmt::Display for StorageFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageFormat {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "duckdb" => Ok(Self::DuckDb),
            other => Err(StorageError::InvalidStorageFormat(other.to_string())),
        }
    }
}


/// How much detail a save keeps.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageMode {
    /// Daily totals only.
    #[default]
    Aggregate,
    /// Individual records plus recomputed daily totals.
    Full,
}

impl StorageMode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Aggregate => "aggregate",
            Self::Full => "full",
        }
    }
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for StorageMode {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "aggregate" => Ok(Self::Aggregate),
            "full" => Ok(Self::Full),
            other => Err(StorageError::InvalidStorageMode(other.to_string())),
        }
    }
}


/// Everything the storage layer needs to locate and populate a database.
///
/// Produced by an external config loader; every entry point takes it
/// explicitly instead of reading global defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub data_dir: PathBuf,
    pub storage_format: StorageFormat,
    pub storage_mode: StorageMode,
    pub device: Option<DeviceIdentity>,
    /// JSON price list replacing the built-in table.
    pub pricing_file: Option<PathBuf>,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dir: default_data_dir(),
            storage_format: StorageFormat::default(),
            storage_mode: StorageMode::default(),
            device: None,
            pricing_file: None,
        }
    }
}

impl StorageConfig {
    /// Config rooted at a specific directory, with defaults elsewhere.
    pub fn in_dir(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            ..Self::default()
        }
    }

    /// Database path for the configured engine.
    pub fn db_path(&self) -> PathBuf {
        self.db_path_for(self.storage_format)
    }

    /// Database path for a given engine.
    ///
    /// `<device-id><ext>` when a device is configured, otherwise the
    /// legacy `usage_history<ext>`.
    pub fn db_path_for(&self, format: StorageFormat) -> PathBuf {
        let stem = match &self.device {
            Some(device) if !device.id.is_empty() => device.id.as_str(),
            _ => LEGACY_DB_STEM,
        };
        self.data_dir.join(format!("{stem}{}", format.extension()))
    }

    /// Path of the pre-sync SQLite database.
    pub fn legacy_db_path(&self) -> PathBuf {
        self.data_dir
            .join(format!("{LEGACY_DB_STEM}{}", StorageFormat::Sqlite.extension()))
    }

    /// Price list to seed `model_pricing` with.
    pub fn price_list(&self) -> PriceList {
        match &self.pricing_file {
            Some(path) => PriceList::load_or_default(path),
            None => PriceList::builtin(),
        }
    }
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legacy_path_without_device() {
        let config = StorageConfig::in_dir("/data");
        assert_eq!(config.db_path(), PathBuf::from("/data/usage_history.db"));
        assert_eq!(
            config.db_path_for(StorageFormat::DuckDb),
            PathBuf::from("/data/usage_history.duckdb")
        );
    }

    #[test]
    fn test_per_device_path() {
        let config = StorageConfig {
            device: Some(DeviceIdentity::new("a1b2c3d4", "laptop", "linux")),
            storage_format: StorageFormat::DuckDb,
            ..StorageConfig::in_dir("/data")
        };
        assert_eq!(config.db_path(), PathBuf::from("/data/a1b2c3d4.duckdb"));
        assert_eq!(config.legacy_db_path(), PathBuf::from("/data/usage_history.db"));
    }

    #[test]
    fn test_parse_format_and_mode() {
        assert_eq!("DuckDB".parse::<StorageFormat>().unwrap(), StorageFormat::DuckDb);
        assert_eq!("full".parse::<StorageMode>().unwrap(), StorageMode::Full);
        assert!(matches!(
            "parquet".parse::<StorageFormat>(),
            Err(StorageError::InvalidStorageFormat(_))
        ));
        assert!(matches!(
            "partial".parse::<StorageMode>(),
            Err(StorageError::InvalidStorageMode(_))
        ));
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: StorageConfig = serde_json::from_str(
            r#"{"data_dir": "/tmp/usage", "storage_format": "duckdb", "storage_mode": "full"}"#,
        )
        .unwrap();
        assert_eq!(config.storage_format, StorageFormat::DuckDb);
        assert_eq!(config.storage_mode, StorageMode::Full);
        assert!(config.device.is_none());
    }

    #[test]
    fn test_default_data_dir() {
        let dir = default_data_dir();
        assert!(dir.to_string_lossy().contains(".claude"));
        assert!(dir.to_string_lossy().ends_with("usage"));
    }
}
