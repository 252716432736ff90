//! Background Sync Scheduler
//!
//! Runs a reconciliation pass at a configurable interval.
//! Uses Tokio tasks for non-blocking background execution.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{Notify, RwLock};
use chrono::{DateTime, Utc};
use crate::db::Database;
use super::manager::{SyncManager, SyncManagerError};

const CONFIG_KEY: &str = "scheduler_config";
const MIN_INTERVAL_MINUTES: u64 = 1;
const MAX_INTERVAL_MINUTES: u64 = 1440;

/// Scheduler configuration stored in settings table
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub struct SchedulerConfig {
    pub enabled: bool,
    pub interval_minutes: u64,
    pub last_run: Option<DateTime<Utc>>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            interval_minutes: 30,
            last_run: None,
        }
    }
}

/// Background scheduler for periodic reconciliation passes
#[derive(Clone)]
pub struct BackgroundScheduler {
    db: Arc<Database>,
    manager: SyncManager,
    config: Arc<RwLock<SchedulerConfig>>,
    running: Arc<AtomicBool>,
    /// Shutdown signal of the current loop
    shutdown: Arc<StdMutex<Option<Arc<Notify>>>>,
}

/// Scheduler errors
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("Database error: {0}")]
    Database(String),

    #[error("Scheduler is already running")]
    AlreadyRunning,

    #[error("Scheduler is not running")]
    NotRunning,

    #[error("Invalid interval: {0}")]
    InvalidInterval(String),
}

fn validate_interval(interval_minutes: u64) -> Result<(), SchedulerError> {
    if !(MIN_INTERVAL_MINUTES..=MAX_INTERVAL_MINUTES).contains(&interval_minutes) {
        return Err(SchedulerError::InvalidInterval(format!(
            "Interval must be {}-{} minutes, got {}",
            MIN_INTERVAL_MINUTES, MAX_INTERVAL_MINUTES, interval_minutes
        )));
    }
    Ok(())
}

impl BackgroundScheduler {
    /// Create new scheduler instance
    pub fn new(db: Arc<Database>, manager: SyncManager) -> Self {
        Self {
            db,
            manager,
            config: Arc::new(RwLock::new(SchedulerConfig::default())),
            running: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(StdMutex::new(None)),
        }
    }

    /// Load configuration from database settings table
    pub async fn load_config(&self) -> Result<(), SchedulerError> {
        let config: SchedulerConfig = self.db
            .get_setting(CONFIG_KEY)
            .map_err(|e| SchedulerError::Database(e.to_string()))?
            .unwrap_or_default();

        *self.config.write().await = config;
        Ok(())
    }

    /// Save configuration to database settings table
    pub async fn save_config(&self) -> Result<(), SchedulerError> {
        let config = self.config.read().await.clone();
        self.db
            .set_setting(CONFIG_KEY, &config)
            .map_err(|e| SchedulerError::Database(e.to_string()))?;
        Ok(())
    }

    /// Start background scheduler task
    pub async fn start(&self) -> Result<(), SchedulerError> {
        let interval_minutes = self.config.read().await.interval_minutes;
        validate_interval(interval_minutes)?;

        if self.running.swap(true, Ordering::SeqCst) {
            return Err(SchedulerError::AlreadyRunning);
        }

        let shutdown = Arc::new(Notify::new());
        tokio::spawn(Self::scheduler_loop(
            shutdown.clone(),
            self.db.clone(),
            self.config.clone(),
            self.manager.clone(),
            Duration::from_secs(60 * interval_minutes),
        ));

        let mut slot = self.shutdown.lock().unwrap_or_else(|e| e.into_inner());
        *slot = Some(shutdown);

        log::info!("Background scheduler started (interval: {} minutes)", interval_minutes);
        Ok(())
    }

    /// Stop background scheduler task.
    ///
    /// A pass already in flight runs to completion; the loop exits before
    /// its next tick.
    pub async fn stop(&self) -> Result<(), SchedulerError> {
        if !self.running.swap(false, Ordering::SeqCst) {
            return Err(SchedulerError::NotRunning);
        }

        let shutdown = self.shutdown.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(shutdown) = shutdown {
            // Stores a permit when the loop is mid-pass
            shutdown.notify_one();
        }

        log::info!("Background scheduler stopped");
        Ok(())
    }

    /// Check if scheduler is currently running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get current configuration
    pub async fn get_config(&self) -> SchedulerConfig {
        self.config.read().await.clone()
    }

    /// Update and persist configuration, restarting the loop as needed
    pub async fn update_config(&self, enabled: bool, interval_minutes: u64) -> Result<(), SchedulerError> {
        validate_interval(interval_minutes)?;

        {
            let mut config = self.config.write().await;
            config.enabled = enabled;
            config.interval_minutes = interval_minutes;
        }
        self.save_config().await?;

        if self.is_running() {
            // Another caller may have stopped it in between
            let _ = self.stop().await;
        }
        if enabled {
            self.start().await?;
        }

        log::info!("Scheduler config updated: enabled={}, interval={} minutes", enabled, interval_minutes);
        Ok(())
    }

    /// Run one scheduled pass and record `last_run` when it was attempted
    async fn run_once(
        db: &Database,
        config: &RwLock<SchedulerConfig>,
        manager: &SyncManager,
    ) {
        match manager.run_sync_pass().await {
            Ok(result) => {
                log::info!(
                    "Scheduled sync completed: synced={}, failed={}",
                    result.synced_items,
                    result.failed_items
                );
                if !result.errors.is_empty() {
                    log::warn!("Scheduled sync had {} errors: {:?}", result.errors.len(), result.errors);
                }

                let snapshot = {
                    let mut cfg = config.write().await;
                    cfg.last_run = Some(Utc::now());
                    cfg.clone()
                };
                if let Err(e) = db.set_setting(CONFIG_KEY, &snapshot) {
                    log::error!("Failed to save last_run timestamp: {}", e);
                }
            }
            Err(SyncManagerError::Unreachable) => {
                log::info!("Remote authority unreachable, skipping scheduled sync");
            }
            Err(e) => {
                log::error!("Scheduled sync failed: {}", e);
            }
        }
    }

    /// Background scheduler loop (runs in spawned task)
    async fn scheduler_loop(
        shutdown: Arc<Notify>,
        db: Arc<Database>,
        config: Arc<RwLock<SchedulerConfig>>,
        manager: SyncManager,
        period: Duration,
    ) {
        let mut interval = tokio::time::interval(period);
        // The first tick completes immediately
        interval.tick().await;

        loop {
            tokio::select! {
                biased;
                _ = shutdown.notified() => break,
                _ = interval.tick() => {}
            }

            log::info!("Background sync triggered by scheduler");
            Self::run_once(&db, &config, &manager).await;
        }

        log::info!("Scheduler loop exited");
    }
}

// ============================================================================
// Tests
// ============================================================================
