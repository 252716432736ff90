//! Sync Data Models
//!
//! Configuration, outbox payloads and the batch wire format exchanged with
//! the remote authority.
//!
//! - SyncConfig: endpoint, batch size and timeouts
//! - OutboxPayload: snapshot of a pending change, one variant per operation
//! - BatchSyncRequest / BatchSyncResponse: the `/batch` exchange
//! - SyncResult / StatusSummary: what callers get back

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ============================================================================
// Sync Configuration
// ============================================================================

pub const DEFAULT_API_BASE_URL: &str = "http://localhost:3000/api";
pub const DEFAULT_BATCH_SIZE: usize = 50;
pub const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
pub const DEFAULT_HEALTH_TIMEOUT_MS: u64 = 5_000;

/// Sync engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Base URL of the remote authority (`{base}/batch`, `{base}/health`)
    pub api_base_url: String,

    /// Maximum outbox entries per batch call
    pub batch_size: usize,

    /// Timeout for a single batch call
    pub request_timeout_ms: u64,

    /// Timeout for the connectivity probe
    pub health_timeout_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            batch_size: DEFAULT_BATCH_SIZE,
            request_timeout_ms: DEFAULT_REQUEST_TIMEOUT_MS,
            health_timeout_ms: DEFAULT_HEALTH_TIMEOUT_MS,
        }
    }
}

impl SyncConfig {
    /// Build from environment variables, falling back to defaults.
    ///
    /// Reads `API_BASE_URL`, `SYNC_BATCH_SIZE`, `SYNC_REQUEST_TIMEOUT_MS` and
    /// `SYNC_HEALTH_TIMEOUT_MS`. Unparseable numbers keep the default.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            api_base_url: std::env::var("API_BASE_URL").unwrap_or(defaults.api_base_url),
            batch_size: env_number("SYNC_BATCH_SIZE").unwrap_or(defaults.batch_size),
            request_timeout_ms: env_number("SYNC_REQUEST_TIMEOUT_MS")
                .unwrap_or(defaults.request_timeout_ms),
            health_timeout_ms: env_number("SYNC_HEALTH_TIMEOUT_MS")
                .unwrap_or(defaults.health_timeout_ms),
        }
    }

    /// Check the configuration is usable
    pub fn validate(&self) -> Result<(), String> {
        if self.batch_size == 0 {
            return Err("batch_size must be at least 1".to_string());
        }
        if self.request_timeout_ms == 0 || self.health_timeout_ms == 0 {
            return Err("timeouts must be non-zero".to_string());
        }

        let url = url::Url::parse(&self.api_base_url)
            .map_err(|e| format!("invalid api_base_url '{}': {}", self.api_base_url, e))?;
        match url.scheme() {
            "http" | "https" => Ok(()),
            other => Err(format!("unsupported api_base_url scheme: {}", other)),
        }
    }

    /// Base URL without a trailing slash
    pub fn base_url(&self) -> &str {
        self.api_base_url.trim_end_matches('/')
    }
}

fn env_number<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("Ignoring unparseable {}={:?}", key, raw);
            None
        }
    }
}

// ============================================================================
// Entity Sync Status
// ============================================================================

/// Per-entity sync status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    /// Local change not yet confirmed remotely
    Pending,
    /// Last known state matches the remote authority
    Synced,
    /// Last reconciliation attempt failed
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Synced => "synced",
            Self::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "synced" => Some(Self::Synced),
            "error" => Some(Self::Error),
            _ => None,
        }
    }
}

// ============================================================================
// Outbox Payloads
// ============================================================================

/// Kind of pending mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Create,
    Update,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Create => "create",
            Self::Update => "update",
            Self::Delete => "delete",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "create" => Some(Self::Create),
            "update" => Some(Self::Update),
            "delete" => Some(Self::Delete),
            _ => None,
        }
    }
}

impl std::fmt::Display for Operation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of a change, taken at enqueue time.
///
/// Serialized adjacently tagged, so a batch item carries
/// `"operation": "update", "payload": { ... }`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "operation", content = "payload", rename_all = "lowercase")]
pub enum OutboxPayload {
    Create {
        id: String,
        title: String,
        description: Option<String>,
        completed: bool,
        is_deleted: bool,
    },
    Update {
        title: String,
        description: Option<String>,
        completed: bool,
    },
    Delete {
        id: String,
    },
}

impl OutboxPayload {
    pub fn operation(&self) -> Operation {
        match self {
            Self::Create { .. } => Operation::Create,
            Self::Update { .. } => Operation::Update,
            Self::Delete { .. } => Operation::Delete,
        }
    }
}

// ============================================================================
// Batch Wire Format
// ============================================================================

/// Request body for `POST {base}/batch`
#[derive(Debug, Clone, Serialize)]
pub struct BatchSyncRequest {
    pub items: Vec<BatchItem>,
    pub client_timestamp: DateTime<Utc>,
}

/// One outbox entry as sent to the remote authority
#[derive(Debug, Clone, Serialize)]
pub struct BatchItem {
    pub entity_id: String,

    #[serde(flatten)]
    pub change: OutboxPayload,

    pub retry_count: u32,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Response body of `POST {base}/batch`
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BatchSyncResponse {
    #[serde(default)]
    pub processed_items: Vec<ProcessedItem>,
}

/// Outcome for one item, keyed by the entity id the client sent
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessedItem {
    pub client_id: String,
    pub status: ItemStatus,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_id: Option<String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ItemStatus {
    Success,
    Failure,
}

// ============================================================================
// Results
// ============================================================================

/// Structured record of a failed item within a pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncErrorRecord {
    pub task_id: String,
    pub operation: Operation,
    pub error: String,
    pub timestamp: DateTime<Utc>,
}

/// Summary of one reconciliation pass
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncResult {
    pub success: bool,
    pub synced_items: u32,
    pub failed_items: u32,
    pub errors: Vec<SyncErrorRecord>,
}

impl Default for SyncResult {
    fn default() -> Self {
        Self {
            success: true,
            synced_items: 0,
            failed_items: 0,
            errors: Vec::new(),
        }
    }
}

impl SyncResult {
    pub(crate) fn record_synced(&mut self) {
        self.synced_items += 1;
    }

    pub(crate) fn record_failed(&mut self, task_id: &str, operation: Operation, error: &str) {
        self.failed_items += 1;
        self.success = false;
        self.errors.push(SyncErrorRecord {
            task_id: task_id.to_string(),
            operation,
            error: error.to_string(),
            timestamp: Utc::now(),
        });
    }
}

/// Sync status as shown to callers, available even before any pass ran
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusSummary {
    pub pending_sync: i64,
    pub last_synced_at: Option<DateTime<Utc>>,
    pub online: bool,
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_sync_config_default() {
        let config = SyncConfig::default();
        assert_eq!(config.batch_size, 50);
        assert_eq!(config.api_base_url, "http://localhost:3000/api");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_sync_config_validation() {
        let mut config = SyncConfig::default();
        config.batch_size = 0;
        assert!(config.validate().is_err());

        let mut config = SyncConfig::default();
        config.api_base_url = "ftp://example.com".to_string();
        assert!(config.validate().is_err());

        let mut config = SyncConfig::default();
        config.api_base_url = "not a url".to_string();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_base_url_trims_trailing_slash() {
        let mut config = SyncConfig::default();
        config.api_base_url = "http://example.com/api/".to_string();
        assert_eq!(config.base_url(), "http://example.com/api");
    }

    #[test]
    fn test_batch_item_wire_shape() {
        let item = BatchItem {
            entity_id: "e2".to_string(),
            change: OutboxPayload::Update {
                title: "Buy milk".to_string(),
                description: None,
                completed: true,
            },
            retry_count: 1,
            error_message: Some("timeout".to_string()),
        };

        let value = serde_json::to_value(&item).unwrap();
        assert_eq!(
            value,
            json!({
                "entity_id": "e2",
                "operation": "update",
                "payload": { "title": "Buy milk", "description": null, "completed": true },
                "retry_count": 1,
                "error_message": "timeout"
            })
        );
    }

    #[test]
    fn test_batch_item_omits_missing_error() {
        let item = BatchItem {
            entity_id: "e1".to_string(),
            change: OutboxPayload::Delete { id: "e1".to_string() },
            retry_count: 0,
            error_message: None,
        };

        let value = serde_json::to_value(&item).unwrap();
        assert!(value.get("error_message").is_none());
        assert_eq!(value["operation"], "delete");
    }

    #[test]
    fn test_batch_response_parsing() {
        let body = r#"{
            "processed_items": [
                { "client_id": "e1", "status": "success", "server_id": "srv-1" },
                { "client_id": "e2", "status": "failure", "error": "validation" }
            ]
        }"#;

        let response: BatchSyncResponse = serde_json::from_str(body).unwrap();
        assert_eq!(response.processed_items.len(), 2);
        assert_eq!(response.processed_items[0].status, ItemStatus::Success);
        assert_eq!(response.processed_items[0].server_id.as_deref(), Some("srv-1"));
        assert_eq!(response.processed_items[1].status, ItemStatus::Failure);
        assert_eq!(response.processed_items[1].error.as_deref(), Some("validation"));
    }

    #[test]
    fn test_empty_batch_response() {
        let response: BatchSyncResponse = serde_json::from_str("{}").unwrap();
        assert!(response.processed_items.is_empty());
    }

    #[test]
    fn test_status_strings() {
        for status in [SyncStatus::Pending, SyncStatus::Synced, SyncStatus::Error] {
            assert_eq!(SyncStatus::parse(status.as_str()), Some(status));
        }
        assert_eq!(SyncStatus::parse("unknown"), None);
        assert_eq!(Operation::parse("delete"), Some(Operation::Delete));
    }

    #[test]
    fn test_sync_result_accounting() {
        let mut result = SyncResult::default();
        assert!(result.success);

        result.record_synced();
        result.record_failed("e2", Operation::Update, "validation");

        assert!(!result.success);
        assert_eq!(result.synced_items, 1);
        assert_eq!(result.failed_items, 1);
        assert_eq!(result.errors[0].task_id, "e2");
        assert_eq!(result.errors[0].error, "validation");
    }
}
