//! Sync Manager - Orchestrates reconciliation passes
//!
//! Coordinates the outbox, the task store and the remote authority:
//! - Connectivity gating before any pass
//! - Draining the outbox in creation-ordered batches, one batch at a time
//! - Applying per-item outcomes to task status and outbox in one transaction
//! - Converting whole-batch transport failures into per-item failures
//! - Aggregating a `SyncResult` for the caller

use super::api::{RemoteAuthority, SyncApiClient, SyncApiError};
use super::models::{
    BatchSyncRequest, ItemStatus, OutboxPayload, StatusSummary, SyncConfig, SyncResult,
};
use super::queue::{Outbox, OutboxEntry, QueueError, QueueStats};
use crate::db::{Database, DbError};
use crate::ids::{IdGenerator, UuidGenerator};
use crate::tasks::TaskStore;
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, RwLock};

const UNKNOWN_ERROR: &str = "Unknown error";

/// What a pass knows about the snapshot it drained
#[derive(Debug, Default)]
struct PassState {
    /// Highest drained seq per entity; outcomes apply to entries up to it
    bounds: HashMap<String, i64>,
    /// Entities that already received an outcome in this pass
    settled: HashSet<String>,
}

impl PassState {
    fn new(batches: &[Vec<OutboxEntry>]) -> Self {
        let mut bounds = HashMap::new();
        for entry in batches.iter().flatten() {
            let bound = bounds.entry(entry.task_id.clone()).or_insert(entry.seq);
            *bound = (*bound).max(entry.seq);
        }

        Self {
            bounds,
            settled: HashSet::new(),
        }
    }
}

/// Sync manager - main orchestrator
#[derive(Clone)]
pub struct SyncManager {
    api_client: Arc<RwLock<Arc<dyn RemoteAuthority>>>,
    /// Whether `api_client` was built from the config and follows its changes
    owns_client: bool,
    config: Arc<RwLock<SyncConfig>>,
    db: Arc<Database>,
    outbox: Arc<Outbox>,
    ids: Arc<dyn IdGenerator>,
    /// Held for the whole of a pass so passes never interleave
    pass_lock: Arc<Mutex<()>>,
}

impl SyncManager {
    /// Create a manager talking HTTP to `config.api_base_url`
    pub fn new(db: Arc<Database>, config: SyncConfig) -> Result<Self, SyncManagerError> {
        let api_client = SyncApiClient::new(&config)?;

        let mut manager = Self::with_remote(db, config, Arc::new(api_client), Arc::new(UuidGenerator))?;
        manager.owns_client = true;
        Ok(manager)
    }

    /// Create a manager with an explicit remote and id generator
    pub fn with_remote(
        db: Arc<Database>,
        config: SyncConfig,
        api_client: Arc<dyn RemoteAuthority>,
        ids: Arc<dyn IdGenerator>,
    ) -> Result<Self, SyncManagerError> {
        config.validate().map_err(SyncManagerError::InvalidConfig)?;
        let outbox = Outbox::new(db.clone(), ids.clone())?;

        Ok(Self {
            api_client: Arc::new(RwLock::new(api_client)),
            owns_client: false,
            config: Arc::new(RwLock::new(config)),
            db,
            outbox: Arc::new(outbox),
            ids,
            pass_lock: Arc::new(Mutex::new(())),
        })
    }

    /// Task store sharing this manager's database and id generator
    pub fn task_store(&self) -> TaskStore {
        TaskStore::new(self.db.clone(), self.ids.clone())
    }

    pub fn outbox(&self) -> &Outbox {
        &self.outbox
    }

    // ========================================================================
    // Configuration
    // ========================================================================

    /// Get current configuration
    pub async fn get_config(&self) -> SyncConfig {
        self.config.read().await.clone()
    }

    /// Replace the configuration; takes effect from the next pass.
    ///
    /// A manager created with [`SyncManager::new`] rebuilds its HTTP client
    /// when the endpoint or timeouts change.
    pub async fn update_config(&self, config: SyncConfig) -> Result<(), SyncManagerError> {
        config.validate().map_err(SyncManagerError::InvalidConfig)?;

        if self.owns_client {
            let current = self.config.read().await.clone();
            if current.base_url() != config.base_url()
                || current.request_timeout_ms != config.request_timeout_ms
                || current.health_timeout_ms != config.health_timeout_ms
            {
                let client = SyncApiClient::new(&config)?;
                *self.api_client.write().await = Arc::new(client);
            }
        }

        log::info!(
            "Sync config updated: endpoint={}, batch_size={}",
            config.base_url(),
            config.batch_size
        );
        *self.config.write().await = config;
        Ok(())
    }

    // ========================================================================
    // Connectivity
    // ========================================================================

    /// Probe the remote authority. Never fails: errors and timeouts read as
    /// unreachable.
    pub async fn check_connectivity(&self) -> bool {
        let timeout_ms = self.config.read().await.health_timeout_ms;
        let api_client = self.api_client.read().await.clone();

        match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            api_client.health_check(),
        ).await {
            Ok(Ok(())) => true,
            Ok(Err(e)) => {
                log::info!("Remote authority unreachable: {}", e);
                false
            }
            Err(_) => {
                log::info!("Remote authority health check timed out after {} ms", timeout_ms);
                false
            }
        }
    }

    // ========================================================================
    // Reconciliation
    // ========================================================================

    /// Run one reconciliation pass.
    ///
    /// Returns [`SyncManagerError::Unreachable`] without touching the outbox
    /// when the probe fails. Store errors abort the pass; transport and item
    /// failures are reported in the result.
    pub async fn run_sync_pass(&self) -> Result<SyncResult, SyncManagerError> {
        if !self.check_connectivity().await {
            return Err(SyncManagerError::Unreachable);
        }

        let _guard = self.pass_lock.lock().await;
        self.reconcile().await
    }

    async fn reconcile(&self) -> Result<SyncResult, SyncManagerError> {
        let config = self.config.read().await.clone();
        let api_client = self.api_client.read().await.clone();

        let batches = self.outbox.drain(config.batch_size)?;
        let mut result = SyncResult::default();

        if batches.is_empty() {
            log::info!("Outbox is empty, nothing to sync");
            return Ok(result);
        }

        log::info!(
            "Starting sync pass: {} batches (batch size {})",
            batches.len(),
            config.batch_size
        );

        let mut state = PassState::new(&batches);

        for (index, batch) in batches.iter().enumerate() {
            // Entries of entities that already got an outcome were coalesced
            // with it and are not sent again this pass
            let batch: Vec<OutboxEntry> = batch
                .iter()
                .filter(|e| !state.settled.contains(&e.task_id))
                .cloned()
                .collect();
            if batch.is_empty() {
                log::debug!("Batch {}/{} already settled, skipping", index + 1, batches.len());
                continue;
            }

            log::debug!("Processing batch {}/{} ({} entries)", index + 1, batches.len(), batch.len());
            self.process_batch(
                api_client.as_ref(),
                config.request_timeout_ms,
                &batch,
                &mut state,
                &mut result,
            ).await?;
        }

        log::info!(
            "Sync pass complete: {} synced, {} failed",
            result.synced_items,
            result.failed_items
        );

        Ok(result)
    }

    async fn process_batch(
        &self,
        api_client: &dyn RemoteAuthority,
        timeout_ms: u64,
        batch: &[OutboxEntry],
        state: &mut PassState,
        result: &mut SyncResult,
    ) -> Result<(), SyncManagerError> {
        let request = BatchSyncRequest {
            items: batch.iter().map(OutboxEntry::to_batch_item).collect(),
            client_timestamp: Utc::now(),
        };

        let response = match tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            api_client.batch_sync(&request),
        ).await {
            Ok(response) => response,
            Err(_) => Err(SyncApiError::Timeout(timeout_ms)),
        };

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                let error = e.to_string();
                log::error!("Batch of {} entries failed: {}", batch.len(), error);

                for entry in batch {
                    self.apply_entry_failure(entry, &error)?;
                    result.record_failed(&entry.task_id, entry.operation(), &error);
                }
                return Ok(());
            }
        };

        for processed in response.processed_items {
            let Some(first) = batch.iter().find(|e| e.task_id == processed.client_id) else {
                log::warn!("Ignoring outcome for unknown client id {}", processed.client_id);
                continue;
            };
            let through_seq = state.bounds.get(&first.task_id).copied().unwrap_or(first.seq);
            state.settled.insert(first.task_id.clone());

            match processed.status {
                ItemStatus::Success => {
                    self.apply_success(&processed.client_id, through_seq, processed.server_id.as_deref())?;
                    result.record_synced();
                }
                ItemStatus::Failure => {
                    let error = processed.error.as_deref().unwrap_or(UNKNOWN_ERROR);
                    self.apply_item_failure(&processed.client_id, through_seq, error)?;
                    result.record_failed(&processed.client_id, first.operation(), error);
                }
            }
        }

        Ok(())
    }

    /// Confirmed: drop every entry of the entity the pass drained and stamp it.
    ///
    /// Entries appended after the pass took its snapshot survive, and the
    /// entity then stays `pending`.
    fn apply_success(
        &self,
        task_id: &str,
        through_seq: i64,
        server_id: Option<&str>,
    ) -> Result<(), SyncManagerError> {
        let synced_at = Utc::now();

        let still_pending = self.db.transaction(|tx| {
            Outbox::remove_by_entity_in(tx, task_id, Some(through_seq))?;
            let newer = Outbox::count_newer_in(tx, task_id, through_seq)?;
            TaskStore::mark_synced_in(tx, task_id, server_id, &synced_at, newer > 0)?;
            Ok(newer > 0)
        })?;

        if still_pending {
            log::info!("Task {} confirmed, newer changes still queued", task_id);
        } else {
            log::debug!("Task {} synced", task_id);
        }
        Ok(())
    }

    /// Rejected by the authority: every entry of the entity the pass drained
    /// records the failure.
    fn apply_item_failure(
        &self,
        task_id: &str,
        through_seq: i64,
        error: &str,
    ) -> Result<(), SyncManagerError> {
        self.db.transaction(|tx| {
            Outbox::record_entity_failure_in(tx, task_id, through_seq, error)?;
            TaskStore::mark_error_in(tx, task_id)?;
            Ok(())
        })?;
        Ok(())
    }

    /// Transport failure for one entry of a failed batch
    fn apply_entry_failure(&self, entry: &OutboxEntry, error: &str) -> Result<(), SyncManagerError> {
        self.db.transaction(|tx| {
            Outbox::record_failure_in(tx, &entry.id, error)?;
            TaskStore::mark_error_in(tx, &entry.task_id)?;
            Ok(())
        })?;
        Ok(())
    }

    // ========================================================================
    // Status & Queue
    // ========================================================================

    /// Pending count, last confirmation time and current reachability
    pub async fn get_status_summary(&self) -> Result<StatusSummary, SyncManagerError> {
        let store = self.task_store();
        let pending_sync = store.pending_count()?;
        let last_synced_at = store.last_synced_at()?;
        let online = self.check_connectivity().await;

        Ok(StatusSummary {
            pending_sync,
            last_synced_at,
            online,
        })
    }

    /// Queue an intent for `task_id` outside a local mutation
    pub fn enqueue(&self, task_id: &str, payload: OutboxPayload) -> Result<OutboxEntry, SyncManagerError> {
        Ok(self.outbox.append(task_id, payload)?)
    }

    /// Get outbox statistics
    pub fn get_queue_stats(&self) -> Result<QueueStats, SyncManagerError> {
        Ok(self.outbox.get_stats()?)
    }

    /// Clear retry counters on failed entries (manual trigger)
    pub fn retry_failed(&self) -> Result<usize, SyncManagerError> {
        Ok(self.outbox.reset_failures()?)
    }
}

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum SyncManagerError {
    #[error("Remote authority unreachable")]
    Unreachable,

    #[error("Invalid sync configuration: {0}")]
    InvalidConfig(String),

    #[error("API error: {0}")]
    ApiError(#[from] SyncApiError),

    #[error("Queue error: {0}")]
    QueueError(#[from] QueueError),

    #[error("Database error: {0}")]
    DatabaseError(#[from] DbError),
}

// ============================================================================
// Tests
// ============================================================================
