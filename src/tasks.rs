//! Task record store
//!
//! Local mutations write the task row and append the matching outbox entry in
//! one transaction, so a concurrent reconciliation pass sees either both or
//! neither. Every mutation resets the task's sync status to `pending`.

use crate::db::{format_timestamp, parse_timestamp, Database, DbError, DbResult};
use crate::ids::IdGenerator;
use crate::sync::models::{OutboxPayload, SyncStatus};
use crate::sync::queue::Outbox;
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A task and its sync metadata
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub server_id: Option<String>,
    pub title: String,
    pub description: Option<String>,
    pub completed: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub is_deleted: bool,
    pub sync_status: SyncStatus,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Fields for a new task
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NewTask {
    pub title: String,
    pub description: Option<String>,
    pub completed: bool,
}

/// Partial update; `None` keeps the current value
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TaskUpdate {
    pub title: Option<String>,
    pub description: Option<String>,
    pub completed: Option<bool>,
}

const SELECT_TASK: &str = r#"
    SELECT id, server_id, title, description, completed, created_at, updated_at,
           is_deleted, sync_status, last_synced_at
    FROM tasks
"#;

fn map_task(row: &rusqlite::Row<'_>) -> rusqlite::Result<Task> {
    let status: String = row.get(8)?;
    let sync_status = SyncStatus::parse(&status).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            8,
            rusqlite::types::Type::Text,
            format!("unknown sync status '{}'", status).into(),
        )
    })?;

    Ok(Task {
        id: row.get(0)?,
        server_id: row.get(1)?,
        title: row.get(2)?,
        description: row.get(3)?,
        completed: row.get(4)?,
        created_at: parse_timestamp(5, &row.get::<_, String>(5)?)?,
        updated_at: parse_timestamp(6, &row.get::<_, String>(6)?)?,
        is_deleted: row.get(7)?,
        sync_status,
        last_synced_at: row
            .get::<_, Option<String>>(9)?
            .map(|raw| parse_timestamp(9, &raw))
            .transpose()?,
    })
}

fn load_task(conn: &Connection, id: &str) -> DbResult<Option<Task>> {
    let sql = format!("{} WHERE id = ?1", SELECT_TASK);
    Ok(conn.query_row(&sql, params![id], map_task).optional()?)
}

/// Local task store
#[derive(Clone)]
pub struct TaskStore {
    db: Arc<Database>,
    ids: Arc<dyn IdGenerator>,
}

impl TaskStore {
    pub fn new(db: Arc<Database>, ids: Arc<dyn IdGenerator>) -> Self {
        Self { db, ids }
    }

    /// Create a task and queue its `create` intent
    pub fn create_task(&self, new_task: NewTask) -> DbResult<Task> {
        if new_task.title.trim().is_empty() {
            return Err(DbError::Constraint("title is required".to_string()));
        }

        let now = Utc::now();
        let task = Task {
            id: self.ids.next_id(),
            server_id: None,
            title: new_task.title,
            description: new_task.description,
            completed: new_task.completed,
            created_at: now,
            updated_at: now,
            is_deleted: false,
            sync_status: SyncStatus::Pending,
            last_synced_at: None,
        };
        let entry_id = self.ids.next_id();

        self.db.transaction(|tx| {
            tx.execute(
                r#"
                INSERT INTO tasks (id, title, description, completed, created_at, updated_at,
                                   is_deleted, sync_status)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0, 'pending')
                "#,
                params![
                    task.id,
                    task.title,
                    task.description,
                    task.completed,
                    format_timestamp(&task.created_at),
                    format_timestamp(&task.updated_at),
                ],
            )?;

            let payload = OutboxPayload::Create {
                id: task.id.clone(),
                title: task.title.clone(),
                description: task.description.clone(),
                completed: task.completed,
                is_deleted: false,
            };
            Outbox::append_in(tx, &entry_id, &task.id, &payload)?;
            Ok(())
        })?;

        log::info!("Created task {}", task.id);
        Ok(task)
    }

    /// Apply a partial update and queue an `update` intent.
    ///
    /// Returns `None` when the task does not exist.
    pub fn update_task(&self, id: &str, update: TaskUpdate) -> DbResult<Option<Task>> {
        let entry_id = self.ids.next_id();

        let updated = self.db.transaction(|tx| {
            let Some(existing) = load_task(tx, id)? else {
                return Ok(None);
            };

            let now = Utc::now();
            let task = Task {
                title: update.title.unwrap_or(existing.title.clone()),
                description: update.description.or(existing.description.clone()),
                completed: update.completed.unwrap_or(existing.completed),
                updated_at: now,
                sync_status: SyncStatus::Pending,
                ..existing
            };

            tx.execute(
                r#"
                UPDATE tasks
                SET title = ?1, description = ?2, completed = ?3, updated_at = ?4,
                    sync_status = 'pending'
                WHERE id = ?5
                "#,
                params![
                    task.title,
                    task.description,
                    task.completed,
                    format_timestamp(&now),
                    id,
                ],
            )?;

            let payload = OutboxPayload::Update {
                title: task.title.clone(),
                description: task.description.clone(),
                completed: task.completed,
            };
            Outbox::append_in(tx, &entry_id, id, &payload)?;
            Ok(Some(task))
        })?;

        if updated.is_some() {
            log::info!("Updated task {}", id);
        }
        Ok(updated)
    }

    /// Soft-delete a task and queue a `delete` intent.
    ///
    /// Returns `false` when the task does not exist.
    pub fn delete_task(&self, id: &str) -> DbResult<bool> {
        let entry_id = self.ids.next_id();

        let deleted = self.db.transaction(|tx| {
            let affected = tx.execute(
                r#"
                UPDATE tasks
                SET is_deleted = 1, updated_at = ?1, sync_status = 'pending'
                WHERE id = ?2
                "#,
                params![format_timestamp(&Utc::now()), id],
            )?;
            if affected == 0 {
                return Ok(false);
            }

            let payload = OutboxPayload::Delete { id: id.to_string() };
            Outbox::append_in(tx, &entry_id, id, &payload)?;
            Ok(true)
        })?;

        if deleted {
            log::info!("Deleted task {}", id);
        }
        Ok(deleted)
    }

    /// Get a non-deleted task
    pub fn get_task(&self, id: &str) -> DbResult<Option<Task>> {
        Ok(self.get_task_record(id)?.filter(|task| !task.is_deleted))
    }

    /// Get a task including soft-deleted ones
    pub fn get_task_record(&self, id: &str) -> DbResult<Option<Task>> {
        let conn = self.db.get_conn()?;
        load_task(&conn, id)
    }

    /// All non-deleted tasks, oldest first
    pub fn get_all_tasks(&self) -> DbResult<Vec<Task>> {
        let sql = format!("{} WHERE is_deleted = 0 ORDER BY created_at ASC", SELECT_TASK);
        self.db.query(&sql, [], map_task)
    }

    /// Tasks whose local state is not confirmed remotely
    pub fn get_tasks_needing_sync(&self) -> DbResult<Vec<Task>> {
        let sql = format!(
            "{} WHERE sync_status IN ('pending', 'error') ORDER BY updated_at ASC",
            SELECT_TASK
        );
        self.db.query(&sql, [], map_task)
    }

    /// Number of tasks in `pending` or `error`
    pub fn pending_count(&self) -> DbResult<i64> {
        self.db.query_row(
            "SELECT COUNT(*) FROM tasks WHERE sync_status IN ('pending', 'error')",
            [],
            |row| row.get(0),
        )
    }

    /// Most recent confirmation time across all tasks
    pub fn last_synced_at(&self) -> DbResult<Option<DateTime<Utc>>> {
        let raw: Option<String> = self.db.query_row(
            "SELECT MAX(last_synced_at) FROM tasks",
            [],
            |row| row.get(0),
        )?;

        Ok(raw.map(|raw| parse_timestamp(0, &raw)).transpose()?)
    }

    /// Record a confirmed outcome.
    ///
    /// Stamps `last_synced_at` and fills `server_id` only when absent. The
    /// status becomes `synced` unless newer intents are still queued, in which
    /// case it stays `pending`.
    pub fn mark_synced_in(
        conn: &Connection,
        id: &str,
        server_id: Option<&str>,
        synced_at: &DateTime<Utc>,
        still_pending: bool,
    ) -> DbResult<usize> {
        let status = if still_pending {
            SyncStatus::Pending
        } else {
            SyncStatus::Synced
        };

        Ok(conn.execute(
            r#"
            UPDATE tasks
            SET sync_status = ?1, last_synced_at = ?2, server_id = COALESCE(server_id, ?3)
            WHERE id = ?4
            "#,
            params![status.as_str(), format_timestamp(synced_at), server_id, id],
        )?)
    }

    /// Record a failed outcome
    pub fn mark_error_in(conn: &Connection, id: &str) -> DbResult<usize> {
        Ok(conn.execute(
            "UPDATE tasks SET sync_status = 'error' WHERE id = ?1",
            params![id],
        )?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ids::SequentialIds;
    use crate::sync::models::Operation;

    fn setup() -> (TaskStore, Outbox) {
        let db = Arc::new(Database::in_memory().expect("Failed to create test database"));
        let ids: Arc<dyn IdGenerator> = Arc::new(SequentialIds::new("id"));
        let outbox = Outbox::new(db.clone(), ids.clone()).unwrap();
        (TaskStore::new(db, ids), outbox)
    }

    fn new_task(title: &str) -> NewTask {
        NewTask {
            title: title.to_string(),
            ..Default::default()
        }
    }

    fn force_status(store: &TaskStore, id: &str, status: SyncStatus) {
        store
            .db
            .execute(
                "UPDATE tasks SET sync_status = ?1, last_synced_at = ?2 WHERE id = ?3",
                params![status.as_str(), format_timestamp(&Utc::now()), id],
            )
            .unwrap();
    }

    #[test]
    fn test_create_task_queues_create() {
        let (store, outbox) = setup();

        let task = store.create_task(new_task("Write report")).unwrap();
        assert_eq!(task.sync_status, SyncStatus::Pending);
        assert!(!task.is_deleted);
        assert!(task.server_id.is_none());

        let entries = outbox.entries_for_entity(&task.id).unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].operation(), Operation::Create);
        match &entries[0].payload {
            OutboxPayload::Create { id, title, is_deleted, .. } => {
                assert_eq!(id, &task.id);
                assert_eq!(title, "Write report");
                assert!(!is_deleted);
            }
            other => panic!("Expected create payload, got {:?}", other),
        }

        let stored = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored, task_with_micros(&task));
    }

    fn task_with_micros(task: &Task) -> Task {
        use chrono::SubsecRound;
        Task {
            created_at: task.created_at.trunc_subsecs(6),
            updated_at: task.updated_at.trunc_subsecs(6),
            ..task.clone()
        }
    }

    #[test]
    fn test_create_task_requires_title() {
        let (store, outbox) = setup();

        let result = store.create_task(new_task("   "));
        assert!(matches!(result, Err(DbError::Constraint(_))));
        assert!(outbox.list_pending().unwrap().is_empty());
    }

    #[test]
    fn test_update_resets_status_from_synced_and_error() {
        let (store, outbox) = setup();
        let task = store.create_task(new_task("a")).unwrap();

        for prior in [SyncStatus::Synced, SyncStatus::Error] {
            force_status(&store, &task.id, prior);

            let updated = store
                .update_task(&task.id, TaskUpdate {
                    completed: Some(true),
                    ..Default::default()
                })
                .unwrap()
                .unwrap();
            assert_eq!(updated.sync_status, SyncStatus::Pending);

            let stored = store.get_task(&task.id).unwrap().unwrap();
            assert_eq!(stored.sync_status, SyncStatus::Pending);
        }

        let entries = outbox.entries_for_entity(&task.id).unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(
            entries[2].payload,
            OutboxPayload::Update {
                title: "a".to_string(),
                description: None,
                completed: true,
            }
        );
    }

    #[test]
    fn test_update_keeps_unspecified_fields() {
        let (store, _outbox) = setup();
        let task = store
            .create_task(NewTask {
                title: "a".to_string(),
                description: Some("details".to_string()),
                completed: false,
            })
            .unwrap();

        let updated = store
            .update_task(&task.id, TaskUpdate {
                title: Some("b".to_string()),
                ..Default::default()
            })
            .unwrap()
            .unwrap();

        assert_eq!(updated.title, "b");
        assert_eq!(updated.description.as_deref(), Some("details"));
        assert!(updated.updated_at >= task.updated_at);
    }

    #[test]
    fn test_update_unknown_task() {
        let (store, outbox) = setup();
        assert!(store.update_task("nope", TaskUpdate::default()).unwrap().is_none());
        assert!(outbox.list_pending().unwrap().is_empty());
    }

    #[test]
    fn test_delete_is_soft_and_queued() {
        let (store, outbox) = setup();
        let task = store.create_task(new_task("a")).unwrap();
        force_status(&store, &task.id, SyncStatus::Synced);

        assert!(store.delete_task(&task.id).unwrap());

        assert!(store.get_task(&task.id).unwrap().is_none());
        let record = store.get_task_record(&task.id).unwrap().unwrap();
        assert!(record.is_deleted);
        assert_eq!(record.sync_status, SyncStatus::Pending);

        let entries = outbox.entries_for_entity(&task.id).unwrap();
        assert_eq!(entries.last().unwrap().payload, OutboxPayload::Delete { id: task.id.clone() });

        // a later update never revives it
        store.update_task(&task.id, TaskUpdate::default()).unwrap();
        assert!(store.get_task_record(&task.id).unwrap().unwrap().is_deleted);

        assert!(!store.delete_task("nope").unwrap());
    }

    #[test]
    fn test_listing_and_counts() {
        let (store, _outbox) = setup();
        let a = store.create_task(new_task("a")).unwrap();
        let b = store.create_task(new_task("b")).unwrap();
        store.delete_task(&b.id).unwrap();

        assert_eq!(store.get_all_tasks().unwrap().len(), 1);
        assert_eq!(store.get_tasks_needing_sync().unwrap().len(), 2);
        assert_eq!(store.pending_count().unwrap(), 2);
        assert!(store.last_synced_at().unwrap().is_none());

        force_status(&store, &a.id, SyncStatus::Synced);
        assert_eq!(store.pending_count().unwrap(), 1);
        assert!(store.last_synced_at().unwrap().is_some());
    }

    #[test]
    fn test_mark_synced_never_overwrites_server_id() {
        let (store, _outbox) = setup();
        let task = store.create_task(new_task("a")).unwrap();
        let now = Utc::now();

        {
            let conn = store.db.get_conn().unwrap();
            TaskStore::mark_synced_in(&conn, &task.id, Some("srv-1"), &now, false).unwrap();
            TaskStore::mark_synced_in(&conn, &task.id, Some("srv-2"), &now, false).unwrap();
        }

        let stored = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored.server_id.as_deref(), Some("srv-1"));
        assert_eq!(stored.sync_status, SyncStatus::Synced);
        assert!(stored.last_synced_at.is_some());
    }

    #[test]
    fn test_mark_error() {
        let (store, _outbox) = setup();
        let task = store.create_task(new_task("a")).unwrap();

        {
            let conn = store.db.get_conn().unwrap();
            assert_eq!(TaskStore::mark_error_in(&conn, &task.id).unwrap(), 1);
        }

        let stored = store.get_task(&task.id).unwrap().unwrap();
        assert_eq!(stored.sync_status, SyncStatus::Error);
    }
}
