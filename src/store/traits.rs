//! Unified `Database` trait: single async interface for all persistence.
//!
//! Covers the reminder repository and the per-user settings store. The
//! engine only ever holds an `Arc<dyn Database>`, so tests and alternative
//! backends plug in without touching the reconciler or the delivery agent.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};

use crate::error::DatabaseError;
use crate::reminders::model::Reminder;

/// Backend-agnostic database trait covering reminders and settings.
#[async_trait]
pub trait Database: Send + Sync {
    /// Run all pending schema migrations.
    async fn run_migrations(&self) -> Result<(), DatabaseError>;

    // ── Reminders ───────────────────────────────────────────────────

    /// Replace the row with the same id: delete, then insert, atomically.
    async fn upsert_reminder(&self, reminder: &Reminder) -> Result<(), DatabaseError>;

    /// Delete every reminder of `user_id` and insert `reminders` in one
    /// transaction. Readers see either the old set or the new one.
    async fn replace_reminders_for_user(
        &self,
        user_id: &str,
        reminders: &[Reminder],
    ) -> Result<(), DatabaseError>;

    /// Get a reminder by id.
    async fn get_reminder(&self, id: &str) -> Result<Option<Reminder>, DatabaseError>;

    /// All reminders of a user, soonest first.
    async fn list_reminders(&self, user_id: &str) -> Result<Vec<Reminder>, DatabaseError>;

    /// Enabled reminders with a trigger in `[now - catchup, now + lookahead]`,
    /// soonest first.
    async fn list_due_reminders(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        lookahead: Duration,
        catchup: Duration,
    ) -> Result<Vec<Reminder>, DatabaseError>;

    /// Enabled reminders with a trigger strictly before `cutoff`.
    async fn list_stale_reminders(
        &self,
        user_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Reminder>, DatabaseError>;

    /// Move a reminder to its following slot, bump `trigger_count` and set
    /// `last_triggered = now`.
    ///
    /// `expected_trigger_count` is the count the caller saw when it listed the
    /// row. The write only applies if the stored count still matches, so two
    /// agents that listed the same row advance it once. Returns `None` when
    /// the row is gone or another writer advanced it first.
    async fn advance_reminder(
        &self,
        id: &str,
        expected_trigger_count: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<Reminder>, DatabaseError>;

    /// Delete every reminder of a user. Returns the number removed.
    async fn delete_reminders_for_user(&self, user_id: &str) -> Result<usize, DatabaseError>;

    // ── Settings ────────────────────────────────────────────────────

    /// Get a user's setting value.
    async fn get_setting(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError>;

    /// Insert or overwrite a user's setting value.
    async fn set_setting(
        &self,
        user_id: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError>;

    /// Delete a user's setting. Returns whether a row existed.
    async fn delete_setting(&self, user_id: &str, key: &str) -> Result<bool, DatabaseError>;

    /// Every `(user_id, value)` stored under `key`, ordered by user id.
    async fn list_settings_by_key(
        &self,
        key: &str,
    ) -> Result<Vec<(String, serde_json::Value)>, DatabaseError>;
}
