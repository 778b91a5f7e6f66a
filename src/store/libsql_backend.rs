//! libSQL-backed `Store` implementation.
//!
//! A single `libsql::Connection` is reused for all operations; it is
//! `Send + Sync` and safe for concurrent async use. Dequeue exclusivity
//! rests on single-statement `UPDATE … RETURNING` atomicity, not on any
//! in-process lock, so multiple worker processes can share one database
//! file without extra coordination.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::clock::Clock;
use crate::error::DatabaseError;
use crate::llm::{ChatMessage, Role, ToolCall};
use crate::queue::backoff::BackoffPolicy;
use crate::queue::recurrence::RecurrenceRule;
use crate::store::migrations;
use crate::store::task::{NewTask, RetryDisposition, Task, TaskStatus};
use crate::store::traits::{MessageOrigin, Note, Store};

const TASK_COLUMNS: &str = "id, task_type, payload, status, scheduled_for, attempts, \
     max_attempts, last_error, recurrence, lock_owner, lock_expiry, created_at, updated_at";

/// libSQL store backend.
pub struct LibSqlStore {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    clock: Arc<dyn Clock>,
    backoff: BackoffPolicy,
    lock_ttl: Duration,
}

impl LibSqlStore {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(
        path: &Path,
        clock: Arc<dyn Clock>,
        backoff: BackoffPolicy,
        lock_ttl: Duration,
    ) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Connection(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Connection(format!("Failed to open database: {e}")))?;

        let store = Self::from_db(db, clock, backoff, lock_ttl).await?;
        info!(path = %path.display(), "Database opened");
        Ok(store)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory(clock: Arc<dyn Clock>) -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Connection(format!("Failed to create in-memory database: {e}"))
            })?;

        Self::from_db(db, clock, BackoffPolicy::default(), Duration::from_secs(300)).await
    }

    async fn from_db(
        db: LibSqlDatabase,
        clock: Arc<dyn Clock>,
        backoff: BackoffPolicy,
        lock_ttl: Duration,
    ) -> Result<Self, DatabaseError> {
        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Connection(format!("Failed to create connection: {e}")))?;

        let store = Self {
            db: Arc::new(db),
            conn,
            clock,
            backoff,
            lock_ttl,
        };
        migrations::run_migrations(&store.conn).await?;
        Ok(store)
    }

    fn conn(&self) -> &Connection {
        &self.conn
    }

    /// Fetch a row and fail loudly when a status update matched nothing:
    /// either the task does not exist, or it is in a state the caller may
    /// not transition from.
    async fn transition_conflict(
        &self,
        task_id: Uuid,
        target: &'static str,
    ) -> DatabaseError {
        match self.get_task(task_id).await {
            Ok(Some(task)) => DatabaseError::InvalidTransition {
                id: task_id,
                actual: task.status.to_string(),
                target,
            },
            Ok(None) => DatabaseError::NotFound {
                entity: "task",
                id: task_id.to_string(),
            },
            Err(e) => e,
        }
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Fixed-width RFC 3339 so lexicographic comparison in SQL matches time
/// order.
fn fmt_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

fn parse_datetime(s: &str) -> DateTime<Utc> {
    DateTime::parse_from_rfc3339(s)
        .map(|dt| dt.with_timezone(&Utc))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

/// Map a libsql Row to a Task. Column order matches `TASK_COLUMNS`.
fn row_to_task(row: &libsql::Row) -> Result<Task, DatabaseError> {
    let id_str: String = row
        .get(0)
        .map_err(|e| DatabaseError::Query(format!("task id: {e}")))?;
    let task_type: String = row
        .get(1)
        .map_err(|e| DatabaseError::Query(format!("task_type: {e}")))?;
    let payload_str: String = row
        .get(2)
        .map_err(|e| DatabaseError::Query(format!("payload: {e}")))?;
    let status_str: String = row
        .get(3)
        .map_err(|e| DatabaseError::Query(format!("status: {e}")))?;
    let scheduled_str: String = row
        .get(4)
        .map_err(|e| DatabaseError::Query(format!("scheduled_for: {e}")))?;
    let attempts: i64 = row
        .get(5)
        .map_err(|e| DatabaseError::Query(format!("attempts: {e}")))?;
    let max_attempts: i64 = row
        .get(6)
        .map_err(|e| DatabaseError::Query(format!("max_attempts: {e}")))?;
    let last_error: Option<String> = row.get(7).ok();
    let recurrence_str: Option<String> = row.get(8).ok();
    let lock_owner: Option<String> = row.get(9).ok();
    let lock_expiry_str: Option<String> = row.get(10).ok();
    let created_str: String = row
        .get(11)
        .map_err(|e| DatabaseError::Query(format!("created_at: {e}")))?;
    let updated_str: String = row
        .get(12)
        .map_err(|e| DatabaseError::Query(format!("updated_at: {e}")))?;

    let recurrence = match recurrence_str {
        Some(ref s) => Some(
            s.parse::<RecurrenceRule>()
                .map_err(DatabaseError::Serialization)?,
        ),
        None => None,
    };

    Ok(Task {
        id: Uuid::parse_str(&id_str).unwrap_or_else(|_| Uuid::nil()),
        task_type,
        payload: serde_json::from_str(&payload_str)
            .map_err(|e| DatabaseError::Serialization(format!("task payload: {e}")))?,
        status: status_str
            .parse()
            .map_err(DatabaseError::Serialization)?,
        scheduled_for: parse_datetime(&scheduled_str),
        attempts: attempts as u32,
        max_attempts: max_attempts as u32,
        last_error,
        recurrence,
        lock_owner,
        lock_expiry: lock_expiry_str.as_deref().map(parse_datetime),
        created_at: parse_datetime(&created_str),
        updated_at: parse_datetime(&updated_str),
    })
}

#[async_trait]
impl Store for LibSqlStore {
    // ── Task queue ──────────────────────────────────────────────────

    async fn enqueue(&self, spec: NewTask) -> Result<Uuid, DatabaseError> {
        let id = Uuid::new_v4();
        let now = self.clock.now();
        let scheduled_for = spec.scheduled_for.unwrap_or(now);
        let payload = serde_json::to_string(&spec.payload)
            .map_err(|e| DatabaseError::Serialization(format!("task payload: {e}")))?;

        self.conn()
            .execute(
                "INSERT INTO tasks (id, task_type, payload, status, scheduled_for, attempts, \
                 max_attempts, last_error, recurrence, lock_owner, lock_expiry, created_at, updated_at) \
                 VALUES (?1, ?2, ?3, 'pending', ?4, 0, ?5, NULL, ?6, NULL, NULL, ?7, ?7)",
                params![
                    id.to_string(),
                    spec.task_type.clone(),
                    payload,
                    fmt_ts(scheduled_for),
                    spec.max_attempts as i64,
                    spec.recurrence.as_ref().map(|r| r.to_string()),
                    fmt_ts(now),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("enqueue: {e}")))?;

        debug!(task_id = %id, task_type = %spec.task_type, scheduled_for = %scheduled_for, "Enqueued task");
        Ok(id)
    }

    async fn dequeue_next(
        &self,
        current_time: DateTime<Utc>,
    ) -> Result<Option<Task>, DatabaseError> {
        let lock_owner = Uuid::new_v4().to_string();
        let lock_expiry = current_time
            + chrono::Duration::from_std(self.lock_ttl).unwrap_or_else(|_| chrono::Duration::zero());
        let now_str = fmt_ts(current_time);

        // An expired lock means the run it guarded never reported back, so
        // reclaiming spends one attempt. Tasks with no budget left go
        // failed here instead of being re-run forever.
        self.conn()
            .execute(
                "UPDATE tasks SET status = 'failed', attempts = attempts + 1, \
                 last_error = 'worker lock expired with retry budget exhausted', \
                 lock_owner = NULL, lock_expiry = NULL, updated_at = ?1 \
                 WHERE status = 'in_progress' AND lock_expiry IS NOT NULL \
                   AND lock_expiry <= ?1 AND attempts + 1 >= max_attempts",
                params![now_str.clone()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("dequeue_next expiry sweep: {e}")))?;

        // One statement: select the earliest eligible task and claim it.
        // Single-statement atomicity is what guarantees at-most-one-worker
        // per task under concurrent dequeue.
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "UPDATE tasks SET status = 'in_progress', lock_owner = ?1, \
                     lock_expiry = ?2, updated_at = ?3, \
                     attempts = attempts + (CASE WHEN status = 'in_progress' THEN 1 ELSE 0 END) \
                     WHERE id = ( \
                         SELECT id FROM tasks \
                         WHERE (status = 'pending' AND scheduled_for <= ?3) \
                            OR (status = 'in_progress' AND lock_expiry IS NOT NULL AND lock_expiry <= ?3) \
                         ORDER BY scheduled_for ASC, created_at ASC \
                         LIMIT 1 \
                     ) \
                     RETURNING {TASK_COLUMNS}"
                ),
                params![lock_owner, fmt_ts(lock_expiry), now_str],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("dequeue_next: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let task = row_to_task(&row)?;
                debug!(task_id = %task.id, task_type = %task.task_type, "Dequeued task");
                Ok(Some(task))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("dequeue_next: {e}"))),
        }
    }

    async fn mark_succeeded(&self, task_id: Uuid) -> Result<(), DatabaseError> {
        let task = self
            .get_task(task_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "task",
                id: task_id.to_string(),
            })?;

        if task.status != TaskStatus::InProgress {
            return Err(DatabaseError::InvalidTransition {
                id: task_id,
                actual: task.status.to_string(),
                target: "succeeded",
            });
        }

        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'succeeded', lock_owner = NULL, \
                 lock_expiry = NULL, updated_at = ?1 \
                 WHERE id = ?2 AND status = 'in_progress'",
                params![fmt_ts(self.clock.now()), task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_succeeded: {e}")))?;

        if changed == 0 {
            // Raced with another completer. The guard keeps the recurrence
            // from being enqueued twice.
            return Err(self.transition_conflict(task_id, "succeeded").await);
        }

        if let Some(rule) = task.recurrence {
            // Next occurrence is computed from now, not the original
            // scheduled_for: missed occurrences are skipped, not replayed.
            match rule.next_occurrence(self.clock.now()) {
                Some(next) => {
                    let next_id = self
                        .enqueue(
                            NewTask::new(task.task_type.clone(), task.payload.clone())
                                .at(next)
                                .recurring(rule)
                                .max_attempts(task.max_attempts),
                        )
                        .await?;
                    debug!(task_id = %task_id, next_id = %next_id, next = %next, "Enqueued next occurrence");
                }
                None => {
                    warn!(task_id = %task_id, "Recurrence rule yields no next occurrence");
                }
            }
        }

        Ok(())
    }

    async fn reschedule_for_retry(
        &self,
        task_id: Uuid,
        error: &str,
    ) -> Result<RetryDisposition, DatabaseError> {
        let task = self
            .get_task(task_id)
            .await?
            .ok_or_else(|| DatabaseError::NotFound {
                entity: "task",
                id: task_id.to_string(),
            })?;

        if task.status != TaskStatus::InProgress {
            return Err(DatabaseError::InvalidTransition {
                id: task_id,
                actual: task.status.to_string(),
                target: "pending",
            });
        }

        let now = self.clock.now();
        let attempts = task.attempts + 1;

        if attempts < task.max_attempts {
            let delay = self.backoff.delay(attempts);
            let next = now
                + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::zero());
            let changed = self
                .conn()
                .execute(
                    "UPDATE tasks SET status = 'pending', attempts = ?1, scheduled_for = ?2, \
                     last_error = ?3, lock_owner = NULL, lock_expiry = NULL, updated_at = ?4 \
                     WHERE id = ?5 AND status = 'in_progress'",
                    params![
                        attempts as i64,
                        fmt_ts(next),
                        error,
                        fmt_ts(now),
                        task_id.to_string()
                    ],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("reschedule_for_retry: {e}")))?;
            if changed == 0 {
                return Err(self.transition_conflict(task_id, "pending").await);
            }
            debug!(task_id = %task_id, attempts, next = %next, "Rescheduled for retry");
            Ok(RetryDisposition::Rescheduled(next))
        } else {
            let changed = self
                .conn()
                .execute(
                    "UPDATE tasks SET status = 'failed', attempts = ?1, last_error = ?2, \
                     lock_owner = NULL, lock_expiry = NULL, updated_at = ?3 \
                     WHERE id = ?4 AND status = 'in_progress'",
                    params![attempts as i64, error, fmt_ts(now), task_id.to_string()],
                )
                .await
                .map_err(|e| DatabaseError::Query(format!("reschedule_for_retry: {e}")))?;
            if changed == 0 {
                return Err(self.transition_conflict(task_id, "failed").await);
            }
            warn!(task_id = %task_id, attempts, error, "Attempt budget exhausted");
            Ok(RetryDisposition::Exhausted)
        }
    }

    async fn mark_failed(&self, task_id: Uuid, error: &str) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'failed', last_error = ?1, lock_owner = NULL, \
                 lock_expiry = NULL, updated_at = ?2 \
                 WHERE id = ?3 AND status IN ('pending', 'in_progress')",
                params![error, fmt_ts(self.clock.now()), task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("mark_failed: {e}")))?;

        if changed == 0 {
            return Err(self.transition_conflict(task_id, "failed").await);
        }
        Ok(())
    }

    async fn manually_retry(&self, task_id: Uuid) -> Result<(), DatabaseError> {
        let now = fmt_ts(self.clock.now());
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'pending', attempts = 0, scheduled_for = ?1, \
                 lock_owner = NULL, lock_expiry = NULL, updated_at = ?1 \
                 WHERE id = ?2 AND status = 'failed'",
                params![now, task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("manually_retry: {e}")))?;

        if changed == 0 {
            return Err(self.transition_conflict(task_id, "pending").await);
        }
        info!(task_id = %task_id, "Task manually reset to pending");
        Ok(())
    }

    async fn cancel(&self, task_id: Uuid) -> Result<(), DatabaseError> {
        let changed = self
            .conn()
            .execute(
                "UPDATE tasks SET status = 'cancelled', lock_owner = NULL, \
                 lock_expiry = NULL, updated_at = ?1 \
                 WHERE id = ?2 AND status = 'pending'",
                params![fmt_ts(self.clock.now()), task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("cancel: {e}")))?;

        if changed == 0 {
            return Err(self.transition_conflict(task_id, "cancelled").await);
        }
        Ok(())
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!(
                    "SELECT {TASK_COLUMNS} FROM tasks WHERE status = 'pending' \
                     ORDER BY scheduled_for ASC LIMIT ?1"
                ),
                params![limit as i64],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_pending: {e}")))?;

        let mut tasks = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            tasks.push(row_to_task(&row)?);
        }
        Ok(tasks)
    }

    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                &format!("SELECT {TASK_COLUMNS} FROM tasks WHERE id = ?1"),
                params![task_id.to_string()],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_task: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(row_to_task(&row)?)),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_task: {e}"))),
        }
    }

    // ── Conversation history ────────────────────────────────────────

    async fn add_message(
        &self,
        conversation_id: &str,
        message: &ChatMessage,
        origin: MessageOrigin,
    ) -> Result<(), DatabaseError> {
        let tool_calls = if message.tool_calls.is_empty() {
            None
        } else {
            Some(
                serde_json::to_string(&message.tool_calls)
                    .map_err(|e| DatabaseError::Serialization(format!("tool_calls: {e}")))?,
            )
        };

        self.conn()
            .execute(
                "INSERT INTO messages (id, conversation_id, role, content, tool_calls, \
                 tool_call_id, origin, created_at) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    Uuid::new_v4().to_string(),
                    conversation_id,
                    message.role.as_str(),
                    message.content.clone(),
                    tool_calls,
                    message.tool_call_id.clone(),
                    origin.as_str(),
                    fmt_ts(self.clock.now()),
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("add_message: {e}")))?;
        Ok(())
    }

    async fn list_messages(
        &self,
        conversation_id: &str,
    ) -> Result<Vec<ChatMessage>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT role, content, tool_calls, tool_call_id FROM messages \
                 WHERE conversation_id = ?1 ORDER BY created_at ASC, rowid ASC",
                params![conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_messages: {e}")))?;

        let mut messages = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let role_str: String = row
                .get(0)
                .map_err(|e| DatabaseError::Query(format!("role: {e}")))?;
            let content: String = row
                .get(1)
                .map_err(|e| DatabaseError::Query(format!("content: {e}")))?;
            let tool_calls_str: Option<String> = row.get(2).ok();
            let tool_call_id: Option<String> = row.get(3).ok();

            let role: Role = role_str.parse().map_err(DatabaseError::Serialization)?;
            let tool_calls: Vec<ToolCall> = match tool_calls_str {
                Some(ref s) => serde_json::from_str(s)
                    .map_err(|e| DatabaseError::Serialization(format!("tool_calls: {e}")))?,
                None => Vec::new(),
            };

            messages.push(ChatMessage {
                role,
                content,
                tool_calls,
                tool_call_id,
            });
        }
        Ok(messages)
    }

    async fn latest_user_message_at(
        &self,
        conversation_id: &str,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT MAX(created_at) FROM messages \
                 WHERE conversation_id = ?1 AND role = 'user' AND origin = 'external'",
                params![conversation_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("latest_user_message_at: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let ts: Option<String> = row.get(0).ok();
                Ok(ts.as_deref().map(parse_datetime))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("latest_user_message_at: {e}"))),
        }
    }

    // ── Notes ───────────────────────────────────────────────────────

    async fn upsert_note(&self, name: &str, content: &str) -> Result<(), DatabaseError> {
        self.conn()
            .execute(
                "INSERT INTO notes (name, content, updated_at) VALUES (?1, ?2, ?3) \
                 ON CONFLICT(name) DO UPDATE SET content = ?2, updated_at = ?3",
                params![name, content, fmt_ts(self.clock.now())],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("upsert_note: {e}")))?;
        Ok(())
    }

    async fn delete_note(&self, name: &str) -> Result<bool, DatabaseError> {
        let changed = self
            .conn()
            .execute("DELETE FROM notes WHERE name = ?1", params![name])
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_note: {e}")))?;
        Ok(changed > 0)
    }

    async fn get_note(&self, name: &str) -> Result<Option<Note>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT name, content, updated_at FROM notes WHERE name = ?1",
                params![name],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_note: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => Ok(Some(Note {
                name: row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("note name: {e}")))?,
                content: row
                    .get(1)
                    .map_err(|e| DatabaseError::Query(format!("note content: {e}")))?,
                updated_at: parse_datetime(
                    &row.get::<String>(2)
                        .map_err(|e| DatabaseError::Query(format!("note updated_at: {e}")))?,
                ),
            })),
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_note: {e}"))),
        }
    }

    async fn list_notes(&self) -> Result<Vec<Note>, DatabaseError> {
        let mut rows = self
            .conn()
            .query("SELECT name, content, updated_at FROM notes ORDER BY name", ())
            .await
            .map_err(|e| DatabaseError::Query(format!("list_notes: {e}")))?;

        let mut notes = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            notes.push(Note {
                name: row
                    .get(0)
                    .map_err(|e| DatabaseError::Query(format!("note name: {e}")))?,
                content: row
                    .get(1)
                    .map_err(|e| DatabaseError::Query(format!("note content: {e}")))?,
                updated_at: parse_datetime(
                    &row.get::<String>(2)
                        .map_err(|e| DatabaseError::Query(format!("note updated_at: {e}")))?,
                ),
            });
        }
        Ok(notes)
    }
}
