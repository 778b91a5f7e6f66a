//! The `Store` trait: the queue's durable contract plus conversation
//! history and notes.
//!
//! Handlers never mutate task status directly; the store's atomic
//! operations are the only path, and the task row is the single source of
//! truth for "is this being worked on".

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::DatabaseError;
use crate::llm::ChatMessage;
use crate::store::task::{NewTask, RetryDisposition, Task};

/// Where a message came from. Engine-written rows (scheduled callbacks,
/// delegated sub-turns) carry the user role on the wire but must not be
/// mistaken for the user actually writing something.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageOrigin {
    External,
    Engine,
}

impl MessageOrigin {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageOrigin::External => "external",
            MessageOrigin::Engine => "engine",
        }
    }
}

/// A saved note, the storage behind the note tools.
#[derive(Debug, Clone)]
pub struct Note {
    pub name: String,
    pub content: String,
    pub updated_at: DateTime<Utc>,
}

/// Backend-agnostic persistence trait.
#[async_trait]
pub trait Store: Send + Sync {
    // ── Task queue ──────────────────────────────────────────────────

    /// Insert a new pending task, returning its id.
    async fn enqueue(&self, spec: NewTask) -> Result<Uuid, DatabaseError>;

    /// Atomically claim the earliest eligible task: pending with
    /// `scheduled_for <= current_time`, or in_progress with an expired lock
    /// (crashed-worker reclaim). The claimed task is moved to in_progress
    /// with a fresh lock in the same statement; no two concurrent calls
    /// return the same task.
    async fn dequeue_next(&self, current_time: DateTime<Utc>)
        -> Result<Option<Task>, DatabaseError>;

    /// Terminal success. Only legal from in_progress; a terminal row fails
    /// loudly with `InvalidTransition` so a recurrence is never silently
    /// double-enqueued. If the task carries a recurrence rule, a new
    /// pending row is inserted for the next occurrence after the store
    /// clock's now; the completed row is never reused.
    async fn mark_succeeded(&self, task_id: Uuid) -> Result<(), DatabaseError>;

    /// Record a recoverable failure: increment attempts and either return
    /// the task to pending at now + backoff, or mark it failed once the
    /// attempt budget is exhausted. `last_error` is preserved either way.
    async fn reschedule_for_retry(
        &self,
        task_id: Uuid,
        error: &str,
    ) -> Result<RetryDisposition, DatabaseError>;

    /// Immediate terminal failure (fatal classification), from pending or
    /// in_progress.
    async fn mark_failed(&self, task_id: Uuid, error: &str) -> Result<(), DatabaseError>;

    /// Operator override: reset a failed task to pending at now with a
    /// fresh attempt budget, bypassing max_attempts.
    async fn manually_retry(&self, task_id: Uuid) -> Result<(), DatabaseError>;

    /// Cancel a pending task. In-flight tasks run to completion.
    async fn cancel(&self, task_id: Uuid) -> Result<(), DatabaseError>;

    /// Pending tasks ordered by scheduled_for, for admin visibility.
    async fn list_pending(&self, limit: usize) -> Result<Vec<Task>, DatabaseError>;

    /// Fetch one task row.
    async fn get_task(&self, task_id: Uuid) -> Result<Option<Task>, DatabaseError>;

    // ── Conversation history ────────────────────────────────────────

    /// Append a message to a conversation's history.
    async fn add_message(
        &self,
        conversation_id: &str,
        message: &ChatMessage,
        origin: MessageOrigin,
    ) -> Result<(), DatabaseError>;

    /// Full ordered history for a conversation.
    async fn list_messages(&self, conversation_id: &str)
        -> Result<Vec<ChatMessage>, DatabaseError>;

    /// Timestamp of the newest externally-written user message, used to
    /// suppress stale proactive callbacks. Engine-injected user-role rows
    /// do not count.
    async fn latest_user_message_at(
        &self,
        conversation_id: &str,
    ) -> Result<Option<DateTime<Utc>>, DatabaseError>;

    // ── Notes ───────────────────────────────────────────────────────

    async fn upsert_note(&self, name: &str, content: &str) -> Result<(), DatabaseError>;

    /// Returns whether a note with that name existed.
    async fn delete_note(&self, name: &str) -> Result<bool, DatabaseError>;

    async fn get_note(&self, name: &str) -> Result<Option<Note>, DatabaseError>;

    async fn list_notes(&self) -> Result<Vec<Note>, DatabaseError>;
}
