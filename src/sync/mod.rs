//! Sync Module - Outbox reconciliation with the remote authority
//!
//! Local mutations append intents to the outbox in the same transaction as
//! the task write. A reconciliation pass:
//! - Probes the remote authority and stops early when it is unreachable
//! - Drains the outbox in creation-ordered batches, one batch at a time
//! - Applies per-item outcomes to task status and the outbox
//!
//! Conflict Resolution: last-write-wins on `updated_at`, ties keep local

pub mod models;
pub mod queue;
pub mod api;
pub mod conflict;
pub mod manager;
pub mod scheduler;

#[cfg(test)]
pub(crate) mod fake_remote;


// Re-export commonly used types
pub use models::{
    SyncConfig,
    SyncStatus, Operation, OutboxPayload,
    BatchSyncRequest, BatchItem, BatchSyncResponse, ProcessedItem, ItemStatus,
    SyncResult, SyncErrorRecord, StatusSummary,
};

pub use api::{RemoteAuthority, SyncApiClient, SyncApiError};
pub use conflict::{resolve, winner, Winner};
pub use manager::{SyncManager, SyncManagerError};
pub use queue::{Outbox, OutboxEntry, QueueStats, QueueError};
pub use scheduler::{BackgroundScheduler, SchedulerConfig, SchedulerError};
