//! Usage record models for Claude Code events.

use anyhow::{Context, Result};
use chrono::{DateTime, Local, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::DeviceTag;


/// Token usage for a single API call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct TokenUsage {
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_creation_tokens: i64,
    pub cache_read_tokens: i64,
}


impl TokenUsage {
    /// Calculate total tokens across all categories.
    pub fn total_tokens(&self) -> i64 {
        self.input_tokens
            + self.output_tokens
            + self.cache_creation_tokens
            + self.cache_read_tokens
    }

    pub fn is_zero(&self) -> bool {
        *self == Self::default()
    }
}


/// A single usage event from Claude Code.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageRecord {
    pub timestamp: DateTime<Utc>,
    pub session_id: String,
    pub message_uuid: String,
    pub message_type: String,
    pub model: Option<String>,
    pub folder: String,
    pub git_branch: Option<String>,
    pub version: String,
    pub token_usage: Option<TokenUsage>,
    #[serde(default)]
    pub device: DeviceTag,
}


impl UsageRecord {
    /// Get date string in YYYY-MM-DD format for grouping.
    ///
    /// Converts UTC timestamp to local timezone before extracting date.
    pub fn date_key(&self) -> String {
        let local: DateTime<Local> = self.timestamp.into();
        local.format("%Y-%m-%d").to_string()
    }

    /// Check if this is a user prompt message.
    pub fn is_user_prompt(&self) -> bool {
        self.message_type == "user"
    }

    /// Check if this is an assistant response message.
    pub fn is_assistant_response(&self) -> bool {
        self.message_type == "assistant"
    }

    /// Get total tokens for this record (0 if no token usage).
    pub fn total_tokens(&self) -> i64 {
        self.token_usage.map(|t| t.total_tokens()).unwrap_or(0)
    }
}


/// A row of the `usage_records` table.
///
/// Keeps the stored `date` and `timestamp` text as-is so migrations never
/// re-derive them under a different local timezone.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub date: String,
    pub timestamp: String,
    pub session_id: String,
    pub message_uuid: String,
    pub message_type: String,
    pub model: Option<String>,
    pub folder: String,
    pub git_branch: Option<String>,
    pub version: String,
    pub tokens: TokenUsage,
    pub total_tokens: i64,
    pub device: DeviceTag,
}


impl StoredRecord {
    /// Build the row written for `record`; user prompts store zero tokens.
    pub fn from_record(record: &UsageRecord, device: &DeviceTag) -> Self {
        let tokens = record.token_usage.unwrap_or_default();
        Self {
            date: record.date_key(),
            timestamp: record.timestamp.to_rfc3339(),
            session_id: record.session_id.clone(),
            message_uuid: record.message_uuid.clone(),
            message_type: record.message_type.clone(),
            model: record.model.clone(),
            folder: record.folder.clone(),
            git_branch: record.git_branch.clone(),
            version: record.version.clone(),
            tokens,
            total_tokens: tokens.total_tokens(),
            device: device.clone(),
        }
    }

    /// Convert back into an event; all-zero token rows have no usage.
    pub fn into_record(self) -> Result<UsageRecord> {
        let timestamp = parse_stored_timestamp(&self.timestamp).with_context(|| {
            format!(
                "Invalid timestamp '{}' for message {}/{}",
                self.timestamp, self.session_id, self.message_uuid
            )
        })?;

        Ok(UsageRecord {
            timestamp,
            session_id: self.session_id,
            message_uuid: self.message_uuid,
            message_type: self.message_type,
            model: self.model,
            folder: self.folder,
            git_branch: self.git_branch,
            version: self.version,
            token_usage: (!self.tokens.is_zero()).then_some(self.tokens),
            device: self.device,
        })
    }
}


/// Parse an RFC 3339 timestamp, accepting offset-less values as UTC.
fn parse_stored_timestamp(s: &str) -> Option<DateTime<Utc>> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(s) {
        return Some(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S%.f")
        .ok()
        .map(|naive| naive.and_utc())
}


#[cfg(test)]
mod tests {
    use super::*;

    fn record(message_type: &str, usage: Option<TokenUsage>) -> UsageRecord {
        UsageRecord {
            timestamp: "2025-03-01T12:00:00Z".parse().unwrap(),
            session_id: "test".to_string(),
            message_uuid: "uuid".to_string(),
            message_type: message_type.to_string(),
            model: None,
            folder: "/test".to_string(),
            git_branch: None,
            version: "1.0".to_string(),
            token_usage: usage,
            device: DeviceTag::default(),
        }
    }

    #[test]
    fn test_token_usage_total() {
        let usage = TokenUsage {
            input_tokens: 100,
            output_tokens: 200,
            cache_creation_tokens: 50,
            cache_read_tokens: 25,
        };
        assert_eq!(usage.total_tokens(), 375);
    }

    #[test]
    fn test_message_type_checks() {
        let record = record("user", None);
        assert!(record.is_user_prompt());
        assert!(!record.is_assistant_response());
        assert_eq!(record.total_tokens(), 0);
    }

    #[test]
    fn test_stored_record_keeps_usage() {
        let usage = TokenUsage {
            input_tokens: 0,
            output_tokens: 0,
            cache_creation_tokens: 0,
            cache_read_tokens: 40,
        };
        let stored = StoredRecord::from_record(&record("assistant", Some(usage)), &DeviceTag::default());
        assert_eq!(stored.total_tokens, 40);

        let back = stored.into_record().unwrap();
        assert_eq!(back.token_usage, Some(usage));
        assert_eq!(back.timestamp.to_rfc3339(), "2025-03-01T12:00:00+00:00");
    }

    #[test]
    fn test_parse_naive_timestamp() {
        let ts = parse_stored_timestamp("2025-03-01T08:15:30.250000").unwrap();
        assert_eq!(ts.to_rfc3339(), "2025-03-01T08:15:30.250+00:00");
        assert!(parse_stored_timestamp("yesterday").is_none());
    }
}
