//! Device identity stamped on every row for multi-device history.

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};


const MAX_DEVICE_ID_LEN: usize = 64;


fn is_valid_device_id(id: &str) -> bool {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_-]{0,63}$").ok())
        .as_ref()
        .is_some_and(|pattern| pattern.is_match(id))
}


/// (id, display name, platform kind) triple.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceIdentity {
    pub id: String,
    pub name: String,
    pub device_type: String,
}

impl DeviceIdentity {
    pub fn new(id: impl Into<String>, name: impl Into<String>, device_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            device_type: device_type.into(),
        }
    }

    /// Placeholder identity used to backfill rows when none is configured.
    pub fn unknown() -> Self {
        Self::new("unknown", "unknown", "unknown")
    }

    /// Fresh identity for this machine: random short id, hostname, platform.
    pub fn detect() -> Self {
        let id = generate_device_id();
        let name = hostname().unwrap_or_else(|| format!("device-{id}"));
        Self {
            id,
            name,
            device_type: current_device_type(),
        }
    }

    /// True when the id is safe to use as a file stem and SQL parameter.
    pub fn has_valid_id(&self) -> bool {
        is_valid_device_id(&self.id)
    }
}


/// Generate an 8-character device id.
pub fn generate_device_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()[..8].to_string()
}


/// Make an arbitrary string usable as a device id.
///
/// Invalid characters become underscores, a leading non-alphanumeric gets
/// an `x` prefix, and the result is capped at 64 characters. Falls back to
/// a generated id if nothing usable is left.
pub fn sanitize_device_id(device_id: &str) -> String {
    if device_id.is_empty() {
        return generate_device_id();
    }

    let mut sanitized: String = device_id
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
        .collect();

    if !sanitized.starts_with(|c: char| c.is_ascii_alphanumeric()) {
        sanitized.insert(0, 'x');
    }
    sanitized.truncate(MAX_DEVICE_ID_LEN);

    if is_valid_device_id(&sanitized) {
        sanitized
    } else {
        generate_device_id()
    }
}


fn current_device_type() -> String {
    match std::env::consts::OS {
        "macos" => "macos".to_string(),
        "windows" => "windows".to_string(),
        "linux" => "linux".to_string(),
        other => other.to_string(),
    }
}


fn hostname() -> Option<String> {
    let name = gethostname::gethostname().to_string_lossy().trim().to_string();
    if !name.is_empty() {
        return Some(name);
    }

    ["HOSTNAME", "COMPUTERNAME"]
        .iter()
        .filter_map(|var| std::env::var(var).ok())
        .map(|name| name.trim().to_string())
        .find(|name| !name.is_empty())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_id_is_valid() {
        let id = generate_device_id();
        assert_eq!(id.len(), 8);
        assert!(DeviceIdentity::new(id, "x", "linux").has_valid_id());
    }

    #[test]
    fn test_sanitize_device_id() {
        assert_eq!(sanitize_device_id("work-laptop_2"), "work-laptop_2");
        assert_eq!(sanitize_device_id("my laptop!"), "my_laptop_");
        assert_eq!(sanitize_device_id("_hidden"), "x_hidden");
        assert_eq!(sanitize_device_id(&"a".repeat(100)).len(), 64);
        assert_eq!(sanitize_device_id("").len(), 8);
    }

    #[test]
    fn test_detect_fills_every_field() {
        let device = DeviceIdentity::detect();
        assert!(device.has_valid_id());
        assert!(!device.name.is_empty());
        assert!(!device.device_type.is_empty());
    }

    #[test]
    fn test_detect_uses_os_hostname() {
        let os_name = gethostname::gethostname().to_string_lossy().trim().to_string();
        if os_name.is_empty() {
            return;
        }
        assert_eq!(hostname().as_deref(), Some(os_name.as_str()));
        assert_eq!(DeviceIdentity::detect().name, os_name);
    }
}
