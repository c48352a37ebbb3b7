//! Configuration for the storage layer.

mod device;
mod settings;

pub use device::{sanitize_device_id, DeviceIdentity};
pub use settings::{
    default_data_dir,
    StorageConfig,
    StorageFormat,
    StorageMode,
    LEGACY_DB_STEM,
};
