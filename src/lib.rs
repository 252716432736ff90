//! # Taskbox
//!
//! Offline-first task store. Local edits land in SQLite together with an
//! outbox intent; reconciliation passes drain the outbox to a remote
//! authority over HTTP.

pub mod db;
pub mod ids;
pub mod sync;
pub mod tasks;

use db::Database;
use std::path::PathBuf;
use std::sync::Arc;
use sync::{BackgroundScheduler, SyncConfig, SyncManager, SyncManagerError};

/// Resolve the database location: `TASKBOX_DB_PATH` or the platform data dir
fn database_path() -> Result<PathBuf, String> {
    if let Ok(path) = std::env::var("TASKBOX_DB_PATH") {
        return Ok(PathBuf::from(path));
    }

    let app_dir = directories::ProjectDirs::from("com", "taskbox", "taskbox")
        .ok_or("Failed to get app directories. Please ensure HOME environment variable is set.")?;

    let data_dir = app_dir.data_dir();
    std::fs::create_dir_all(data_dir)
        .map_err(|e| format!("Failed to create data directory at {:?}: {}", data_dir, e))?;

    Ok(data_dir.join("taskbox.db"))
}

/// Scheduler interval from `SYNC_INTERVAL_MINUTES`; unset or invalid means off
fn interval_from_env() -> Option<u64> {
    std::env::var("SYNC_INTERVAL_MINUTES").ok()?.parse().ok()
}

pub async fn run() {
    // Load .env file for endpoint and tuning overrides
    dotenvy::dotenv().ok();

    // Initialize logger
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let db_path = match database_path() {
        Ok(path) => path,
        Err(e) => {
            log::error!("Cannot determine data location: {}", e);
            eprintln!("FATAL: {}", e);
            std::process::exit(1);
        }
    };
    log::info!("Database path: {:?}", db_path);

    let db = match Database::new(db_path) {
        Ok(db) => Arc::new(db),
        Err(e) => {
            log::error!("Failed to initialize database: {}", e);
            eprintln!("FATAL: Database initialization failed: {}", e);
            std::process::exit(1);
        }
    };
    log::info!("Database initialized successfully");

    let config = SyncConfig::from_env();
    let manager = match SyncManager::new(db.clone(), config) {
        Ok(manager) => manager,
        Err(e) => {
            log::error!("Failed to initialize sync manager: {}", e);
            eprintln!("FATAL: {}", e);
            std::process::exit(1);
        }
    };

    match manager.get_status_summary().await {
        Ok(summary) => log::info!(
            "Sync status: pending={}, last_synced_at={:?}, online={}",
            summary.pending_sync,
            summary.last_synced_at,
            summary.online
        ),
        Err(e) => log::error!("Failed to read sync status: {}", e),
    }

    match manager.run_sync_pass().await {
        Ok(result) => log::info!(
            "Initial sync: success={}, synced={}, failed={}",
            result.success,
            result.synced_items,
            result.failed_items
        ),
        Err(SyncManagerError::Unreachable) => log::info!("Remote authority unreachable, working offline"),
        Err(e) => log::error!("Initial sync failed: {}", e),
    }

    let scheduler = BackgroundScheduler::new(db, manager);
    if let Err(e) = scheduler.load_config().await {
        log::warn!("Failed to load scheduler config: {}", e);
    }

    let stored = scheduler.get_config().await;
    let (enabled, interval) = match interval_from_env() {
        Some(minutes) => (true, minutes),
        None => (stored.enabled, stored.interval_minutes),
    };
    if enabled {
        if let Err(e) = scheduler.update_config(true, interval).await {
            log::error!("Failed to start scheduler: {}", e);
        }
    }

    log::info!("Taskbox running, press Ctrl-C to exit");
    if let Err(e) = tokio::signal::ctrl_c().await {
        log::error!("Failed to listen for shutdown signal: {}", e);
    }

    if scheduler.is_running() {
        let _ = scheduler.stop().await;
    }
    log::info!("Shutting down");
}
