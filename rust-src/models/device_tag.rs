//! Per-row device columns.

use serde::{Deserialize, Serialize};

use crate::config::DeviceIdentity;


/// The three nullable device columns as stored on a row.
///
/// Rows written before multi-device support have all three unset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceTag {
    pub device_id: Option<String>,
    pub device_name: Option<String>,
    pub device_type: Option<String>,
}

impl DeviceTag {
    /// Tag for rows written on behalf of `device`, or an empty tag.
    pub fn stamp(device: Option<&DeviceIdentity>) -> Self {
        device.map(Self::from).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.device_id.is_none() && self.device_name.is_none() && self.device_type.is_none()
    }

    /// Fill each unset column from `fallback`, keeping values already present.
    pub fn or_identity(self, fallback: Option<&DeviceIdentity>) -> Self {
        let Some(fallback) = fallback else {
            return self;
        };
        Self {
            device_id: non_empty(self.device_id).or_else(|| Some(fallback.id.clone())),
            device_name: non_empty(self.device_name).or_else(|| Some(fallback.name.clone())),
            device_type: non_empty(self.device_type).or_else(|| Some(fallback.device_type.clone())),
        }
    }
}

impl From<&DeviceIdentity> for DeviceTag {
    fn from(device: &DeviceIdentity) -> Self {
        Self {
            device_id: Some(device.id.clone()),
            device_name: Some(device.name.clone()),
            device_type: Some(device.device_type.clone()),
        }
    }
}


fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.is_empty())
}


#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_or_identity_keeps_existing_values() {
        let tag = DeviceTag {
            device_id: Some("abc".to_string()),
            device_name: None,
            device_type: Some(String::new()),
        };
        let filled = tag.or_identity(Some(&DeviceIdentity::new("zzz", "desk", "linux")));

        assert_eq!(filled.device_id.as_deref(), Some("abc"));
        assert_eq!(filled.device_name.as_deref(), Some("desk"));
        assert_eq!(filled.device_type.as_deref(), Some("linux"));
    }

    #[test]
    fn test_or_identity_without_fallback() {
        let tag = DeviceTag::default().or_identity(None);
        assert!(tag.is_empty());
    }
}
