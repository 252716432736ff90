//! Sync API Client - HTTP communication with the remote authority
//!
//! Two calls:
//! - `POST {base}/batch` carrying a batch of outbox entries
//! - `GET {base}/health` liveness probe

use super::models::{BatchSyncRequest, BatchSyncResponse, SyncConfig};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use std::time::Duration;

/// The remote side of reconciliation
#[async_trait]
pub trait RemoteAuthority: Send + Sync {
    /// Submit one batch and return the per-item outcomes
    async fn batch_sync(&self, request: &BatchSyncRequest) -> Result<BatchSyncResponse, SyncApiError>;

    /// Liveness probe; `Ok` means reachable
    async fn health_check(&self) -> Result<(), SyncApiError>;
}

/// API client for the remote authority
pub struct SyncApiClient {
    client: Client,
    base_url: String,
    request_timeout: Duration,
    health_timeout: Duration,
}

impl SyncApiClient {
    /// Create new API client from the sync configuration
    pub fn new(config: &SyncConfig) -> Result<Self, SyncApiError> {
        let client = Client::builder()
            .connect_timeout(Duration::from_millis(config.health_timeout_ms))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url().to_string(),
            request_timeout: Duration::from_millis(config.request_timeout_ms),
            health_timeout: Duration::from_millis(config.health_timeout_ms),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }
}

#[async_trait]
impl RemoteAuthority for SyncApiClient {
    async fn batch_sync(&self, request: &BatchSyncRequest) -> Result<BatchSyncResponse, SyncApiError> {
        log::debug!("POST {}/batch ({} items)", self.base_url, request.items.len());

        let response = self.client
            .post(format!("{}/batch", self.base_url))
            .timeout(self.request_timeout)
            .json(request)
            .send()
            .await?;

        handle_response(response).await
    }

    async fn health_check(&self) -> Result<(), SyncApiError> {
        let response = self.client
            .get(format!("{}/health", self.base_url))
            .timeout(self.health_timeout)
            .send()
            .await?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(handle_error(response).await)
        }
    }
}

// ============================================================================
// Error Handling
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncApiError {
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Request timed out after {0} ms")]
    Timeout(u64),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Rate limit exceeded")]
    RateLimitExceeded,

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Unexpected response {0}")]
    UnexpectedStatus(String),

    #[error("Invalid response from server")]
    InvalidResponse,
}

/// Handle successful JSON response
async fn handle_response<T: serde::de::DeserializeOwned>(
    response: reqwest::Response,
) -> Result<T, SyncApiError> {
    let status = response.status();

    if status.is_success() {
        response.json::<T>().await
            .map_err(|_| SyncApiError::InvalidResponse)
    } else {
        Err(handle_error(response).await)
    }
}

/// Convert error response to SyncApiError
async fn handle_error(response: reqwest::Response) -> SyncApiError {
    let status = response.status();

    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => SyncApiError::Unauthorized,
        StatusCode::TOO_MANY_REQUESTS => SyncApiError::RateLimitExceeded,
        s if s.is_server_error() => {
            let msg = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            SyncApiError::ServerError(format!("{}: {}", status, msg))
        }
        _ => {
            let msg = response.text().await.unwrap_or_else(|_| "Unknown error".to_string());
            SyncApiError::UnexpectedStatus(format!("{}: {}", status, msg))
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::models::{BatchItem, ItemStatus, OutboxPayload};
    use mockito::{Matcher, Server};
    use serde_json::json;

    fn client_for(url: &str) -> SyncApiClient {
        let config = SyncConfig {
            api_base_url: url.to_string(),
            ..SyncConfig::default()
        };
        SyncApiClient::new(&config).expect("Failed to create client")
    }

    fn request() -> BatchSyncRequest {
        BatchSyncRequest {
            items: vec![BatchItem {
                entity_id: "e1".to_string(),
                change: OutboxPayload::Delete { id: "e1".to_string() },
                retry_count: 0,
                error_message: None,
            }],
            client_timestamp: chrono::Utc::now(),
        }
    }

    #[test]
    fn test_client_trims_base_url() {
        let client = client_for("http://localhost:3000/api/");
        assert_eq!(client.base_url(), "http://localhost:3000/api");
    }

    #[tokio::test]
    async fn test_batch_sync_posts_items() {
        let mut server = Server::new_async().await;

        let mock = server.mock("POST", "/batch")
            .match_body(Matcher::PartialJson(json!({
                "items": [{ "entity_id": "e1", "operation": "delete", "payload": { "id": "e1" } }]
            })))
            .with_status(200)
            .with_header("content-type", "application/json")
            .with_body(r#"{"processed_items":[{"client_id":"e1","status":"success","server_id":"srv-1"}]}"#)
            .create_async()
            .await;

        let client = client_for(&server.url());
        let response = client.batch_sync(&request()).await.unwrap();

        assert_eq!(response.processed_items.len(), 1);
        assert_eq!(response.processed_items[0].status, ItemStatus::Success);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_batch_sync_server_error() {
        let mut server = Server::new_async().await;

        let _mock = server.mock("POST", "/batch")
            .with_status(500)
            .with_body("boom")
            .create_async()
            .await;

        let client = client_for(&server.url());
        let err = client.batch_sync(&request()).await.unwrap_err();
        assert!(matches!(err, SyncApiError::ServerError(ref msg) if msg.contains("boom")));
    }

    #[tokio::test]
    async fn test_batch_sync_invalid_body() {
        let mut server = Server::new_async().await;

        let _mock = server.mock("POST", "/batch")
            .with_status(200)
            .with_body("not json")
            .create_async()
            .await;

        let client = client_for(&server.url());
        let err = client.batch_sync(&request()).await.unwrap_err();
        assert!(matches!(err, SyncApiError::InvalidResponse));
    }

    #[tokio::test]
    async fn test_rate_limit_handling() {
        let mut server = Server::new_async().await;

        let _mock = server.mock("POST", "/batch")
            .with_status(429)
            .create_async()
            .await;

        let client = client_for(&server.url());
        let err = client.batch_sync(&request()).await.unwrap_err();
        assert!(matches!(err, SyncApiError::RateLimitExceeded));
    }

    #[tokio::test]
    async fn test_health_check() {
        let mut server = Server::new_async().await;

        let _ok = server.mock("GET", "/health")
            .with_status(200)
            .with_body(r#"{"status":"ok"}"#)
            .create_async()
            .await;

        let client = client_for(&server.url());
        assert!(client.health_check().await.is_ok());
    }

    #[tokio::test]
    async fn test_health_check_non_success() {
        let mut server = Server::new_async().await;

        let _down = server.mock("GET", "/health")
            .with_status(503)
            .create_async()
            .await;

        let client = client_for(&server.url());
        assert!(client.health_check().await.is_err());
    }
}
