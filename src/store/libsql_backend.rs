//! libSQL backend: async `Database` trait implementation.
//!
//! Supports local file and in-memory databases. Timestamps are written as
//! fixed-width RFC 3339 UTC text at second precision so that comparing the
//! text columns in SQL orders them chronologically.

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, SecondsFormat, Timelike, Utc};
use libsql::{Connection, Database as LibSqlDatabase, params};
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::DatabaseError;
use crate::reminders::model::{NotificationPayload, Reminder, ReminderType};
use crate::reminders::trigger::{DaySet, Recurrence, RecurrenceKind, RecurringWindow, TimeOfDay};
use crate::store::migrations;
use crate::store::traits::Database;

/// libSQL database backend.
///
/// Stores a single connection that is reused for all operations.
/// `libsql::Connection` is `Send + Sync` and safe for concurrent async use.
/// Every write takes `write_lock`, so no statement can land inside another
/// caller's open transaction on the shared connection.
pub struct LibSqlBackend {
    #[allow(dead_code)]
    db: Arc<LibSqlDatabase>,
    conn: Connection,
    write_lock: Mutex<()>,
}

impl LibSqlBackend {
    /// Open (or create) a local database file and run migrations.
    pub async fn new_local(path: &Path) -> Result<Self, DatabaseError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                DatabaseError::Pool(format!("Failed to create database directory: {e}"))
            })?;
        }

        let db = libsql::Builder::new_local(path)
            .build()
            .await
            .map_err(|e| DatabaseError::Pool(format!("Failed to open libSQL database: {e}")))?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        };
        backend.run_migrations().await?;
        info!(path = %path.display(), "Database opened");
        Ok(backend)
    }

    /// Create an in-memory database (for tests).
    pub async fn new_memory() -> Result<Self, DatabaseError> {
        let db = libsql::Builder::new_local(":memory:")
            .build()
            .await
            .map_err(|e| {
                DatabaseError::Pool(format!("Failed to create in-memory database: {e}"))
            })?;

        let conn = db
            .connect()
            .map_err(|e| DatabaseError::Pool(format!("Failed to create connection: {e}")))?;

        let backend = Self {
            db: Arc::new(db),
            conn,
            write_lock: Mutex::new(()),
        };
        backend.run_migrations().await?;
        Ok(backend)
    }

    /// Get the connection.
    fn conn(&self) -> &Connection {
        &self.conn
    }

    async fn query_reminders(
        &self,
        op: &str,
        sql: &str,
        params: impl libsql::params::IntoParams,
    ) -> Result<Vec<Reminder>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(sql, params)
            .await
            .map_err(|e| DatabaseError::Query(format!("{op}: {e}")))?;

        let mut reminders = Vec::new();
        loop {
            match rows.next().await {
                Ok(Some(row)) => match row_to_reminder(&row) {
                    Ok(r) => reminders.push(r),
                    Err(e) => tracing::warn!("Skipping reminder row in {op}: {e}"),
                },
                Ok(None) => break,
                Err(e) => return Err(DatabaseError::Query(format!("{op}: {e}"))),
            }
        }
        Ok(reminders)
    }
}

// ── Helper functions ────────────────────────────────────────────────

/// Canonical write format: `2024-01-01T08:00:00Z`.
fn format_ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Secs, true)
}

/// Round a lower bound up to the next whole second.
///
/// Stored values have no fractional part, so `stored >= ceil(bound)` is
/// equivalent to `stored >= bound`.
fn ceil_to_second(dt: DateTime<Utc>) -> DateTime<Utc> {
    if dt.nanosecond() == 0 {
        dt
    } else {
        dt.with_nanosecond(0).unwrap_or(dt) + Duration::seconds(1)
    }
}

/// Parse an RFC 3339 or SQLite datetime string into DateTime<Utc>.
fn parse_datetime(column: &str, s: &str) -> Result<DateTime<Utc>, DatabaseError> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }
    // SQLite datetime() output, used by column defaults
    chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S")
        .map(|ndt| ndt.and_utc())
        .map_err(|e| DatabaseError::Serialization(format!("{column} '{s}': {e}")))
}

fn parse_optional_datetime(
    column: &str,
    s: Option<String>,
) -> Result<Option<DateTime<Utc>>, DatabaseError> {
    s.map(|s| parse_datetime(column, &s)).transpose()
}

/// Convert `Option<String>` to libsql Value.
fn opt_text_owned(s: Option<String>) -> libsql::Value {
    match s {
        Some(s) => libsql::Value::Text(s),
        None => libsql::Value::Null,
    }
}

fn opt_integer(n: Option<i64>) -> libsql::Value {
    match n {
        Some(n) => libsql::Value::Integer(n),
        None => libsql::Value::Null,
    }
}

/// Flattened recurrence columns:
/// `(time_of_day, days_of_week, interval_minutes, window_start, window_end)`.
type RecurrenceColumns = (
    Option<String>,
    Option<String>,
    Option<i64>,
    Option<String>,
    Option<String>,
);

fn recurrence_columns(recurrence: &Recurrence) -> RecurrenceColumns {
    match recurrence {
        Recurrence::Daily { time_of_day } => (Some(time_of_day.to_string()), None, None, None, None),
        Recurrence::Weekly { time_of_day, days } => (
            Some(time_of_day.to_string()),
            Some(days.to_string()),
            None,
            None,
            None,
        ),
        Recurrence::Recurring { window } => (
            None,
            None,
            Some(i64::from(window.interval_minutes())),
            Some(window.start().to_string()),
            Some(window.end().to_string()),
        ),
    }
}

fn missing(column: &str) -> DatabaseError {
    DatabaseError::Serialization(format!("reminder row is missing {column}"))
}

fn recurrence_from_row(row: &libsql::Row) -> Result<Recurrence, DatabaseError> {
    let kind_str: String = row
        .get(3)
        .map_err(|e| DatabaseError::Serialization(format!("recurrence_kind: {e}")))?;
    let kind: RecurrenceKind = kind_str.parse().map_err(DatabaseError::Serialization)?;

    let time_of_day = || -> Result<TimeOfDay, DatabaseError> {
        let s = row.get::<String>(4).ok().ok_or_else(|| missing("time_of_day"))?;
        TimeOfDay::parse(&s).map_err(|e| DatabaseError::Serialization(e.to_string()))
    };

    match kind {
        RecurrenceKind::Daily => Ok(Recurrence::Daily {
            time_of_day: time_of_day()?,
        }),
        RecurrenceKind::Weekly => {
            let days_str = row.get::<String>(5).ok().ok_or_else(|| missing("days_of_week"))?;
            let days: DaySet = days_str
                .parse()
                .map_err(|e: crate::error::ConfigError| DatabaseError::Serialization(e.to_string()))?;
            Ok(Recurrence::Weekly {
                time_of_day: time_of_day()?,
                days,
            })
        }
        RecurrenceKind::Recurring => {
            let interval = row.get::<i64>(6).ok().ok_or_else(|| missing("interval_minutes"))?;
            let start = row.get::<String>(7).ok().ok_or_else(|| missing("window_start"))?;
            let end = row.get::<String>(8).ok().ok_or_else(|| missing("window_end"))?;
            let window = TimeOfDay::parse(&start)
                .and_then(|start| Ok((start, TimeOfDay::parse(&end)?)))
                .and_then(|(start, end)| RecurringWindow::new(start, end, interval))
                .map_err(|e| DatabaseError::Serialization(e.to_string()))?;
            Ok(Recurrence::Recurring { window })
        }
    }
}

/// Map a row selected with [`REMINDER_COLUMNS`] to a `Reminder`.
fn row_to_reminder(row: &libsql::Row) -> Result<Reminder, DatabaseError> {
    let get_text = |idx: i32, name: &str| -> Result<String, DatabaseError> {
        row.get::<String>(idx)
            .map_err(|e| DatabaseError::Serialization(format!("{name}: {e}")))
    };

    let id = get_text(0, "id")?;
    let user_id = get_text(1, "user_id")?;
    let reminder_type: ReminderType = get_text(2, "reminder_type")?
        .parse()
        .map_err(DatabaseError::Serialization)?;
    let recurrence = recurrence_from_row(row)?;
    let utc_offset_minutes = row.get::<i64>(9).unwrap_or(0) as i32;
    let next_trigger_at = parse_datetime("next_trigger_at", &get_text(10, "next_trigger_at")?)?;

    let target_str: String = row.get(14).unwrap_or_else(|_| "null".to_string());
    let payload = NotificationPayload {
        title: get_text(11, "title")?,
        body: get_text(12, "body")?,
        tag: get_text(13, "tag")?,
        target_reference: serde_json::from_str(&target_str).unwrap_or(serde_json::Value::Null),
    };

    let enabled = row.get::<i64>(15).unwrap_or(1) != 0;
    let last_triggered = parse_optional_datetime("last_triggered", row.get::<String>(16).ok())?;
    let trigger_count = row.get::<i64>(17).unwrap_or(0).max(0) as u64;
    let created_at = parse_datetime("created_at", &get_text(18, "created_at")?)?;
    let updated_at = parse_datetime("updated_at", &get_text(19, "updated_at")?)?;

    Ok(Reminder {
        id,
        user_id,
        reminder_type,
        recurrence,
        utc_offset_minutes,
        next_trigger_at,
        payload,
        enabled,
        last_triggered,
        trigger_count,
        created_at,
        updated_at,
    })
}

async fn insert_reminder(conn: &Connection, reminder: &Reminder) -> Result<(), DatabaseError> {
    let (time_of_day, days_of_week, interval_minutes, window_start, window_end) =
        recurrence_columns(&reminder.recurrence);
    let target = serde_json::to_string(&reminder.payload.target_reference)
        .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

    conn.execute(
        &format!(
            "INSERT INTO reminders ({REMINDER_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)"
        ),
        params![
            reminder.id.as_str(),
            reminder.user_id.as_str(),
            reminder.reminder_type.as_str(),
            reminder.recurrence_kind().as_str(),
            opt_text_owned(time_of_day),
            opt_text_owned(days_of_week),
            opt_integer(interval_minutes),
            opt_text_owned(window_start),
            opt_text_owned(window_end),
            i64::from(reminder.utc_offset_minutes),
            format_ts(reminder.next_trigger_at),
            reminder.payload.title.as_str(),
            reminder.payload.body.as_str(),
            reminder.payload.tag.as_str(),
            target,
            i64::from(reminder.enabled),
            opt_text_owned(reminder.last_triggered.map(format_ts)),
            reminder.trigger_count as i64,
            format_ts(reminder.created_at),
            format_ts(reminder.updated_at),
        ],
    )
    .await
    .map_err(|e| DatabaseError::Query(format!("insert_reminder: {e}")))?;
    Ok(())
}

async fn begin(conn: &Connection, op: &str) -> Result<libsql::Transaction, DatabaseError> {
    conn.transaction()
        .await
        .map_err(|e| DatabaseError::Query(format!("{op} begin: {e}")))
}

/// Commit on success, roll back on failure.
async fn finish<T>(
    tx: libsql::Transaction,
    op: &str,
    result: Result<T, DatabaseError>,
) -> Result<T, DatabaseError> {
    match result {
        Ok(value) => {
            tx.commit()
                .await
                .map_err(|e| DatabaseError::Query(format!("{op} commit: {e}")))?;
            Ok(value)
        }
        Err(e) => {
            if let Err(rollback_err) = tx.rollback().await {
                tracing::error!("{op} rollback failed: {rollback_err}");
            }
            Err(e)
        }
    }
}

async fn delete_then_insert(
    conn: &Connection,
    delete_sql: &str,
    key: &str,
    reminders: &[Reminder],
) -> Result<(), DatabaseError> {
    conn.execute(delete_sql, params![key])
        .await
        .map_err(|e| DatabaseError::Query(format!("delete_then_insert: {e}")))?;
    for reminder in reminders {
        insert_reminder(conn, reminder).await?;
    }
    Ok(())
}

// ── Trait implementation ────────────────────────────────────────────

const REMINDER_COLUMNS: &str = "id, user_id, reminder_type, recurrence_kind, time_of_day, days_of_week, interval_minutes, window_start, window_end, utc_offset_minutes, next_trigger_at, title, body, tag, target_reference, enabled, last_triggered, trigger_count, created_at, updated_at";

#[async_trait]
impl Database for LibSqlBackend {
    async fn run_migrations(&self) -> Result<(), DatabaseError> {
        migrations::run_migrations(self.conn()).await
    }

    // ── Reminders ───────────────────────────────────────────────────

    async fn upsert_reminder(&self, reminder: &Reminder) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = begin(self.conn(), "upsert_reminder").await?;
        let result = delete_then_insert(
            &tx,
            "DELETE FROM reminders WHERE id = ?1",
            &reminder.id,
            std::slice::from_ref(reminder),
        )
        .await;
        finish(tx, "upsert_reminder", result).await?;

        debug!(reminder_id = %reminder.id, next_trigger_at = %reminder.next_trigger_at, "Reminder upserted");
        Ok(())
    }

    async fn replace_reminders_for_user(
        &self,
        user_id: &str,
        reminders: &[Reminder],
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let tx = begin(self.conn(), "replace_reminders_for_user").await?;
        let result = delete_then_insert(
            &tx,
            "DELETE FROM reminders WHERE user_id = ?1",
            user_id,
            reminders,
        )
        .await;
        finish(tx, "replace_reminders_for_user", result).await?;

        debug!(user_id, count = reminders.len(), "Reminder set replaced");
        Ok(())
    }

    async fn get_reminder(&self, id: &str) -> Result<Option<Reminder>, DatabaseError> {
        let mut reminders = self
            .query_reminders(
                "get_reminder",
                &format!("SELECT {REMINDER_COLUMNS} FROM reminders WHERE id = ?1"),
                params![id],
            )
            .await?;
        Ok(reminders.pop())
    }

    async fn list_reminders(&self, user_id: &str) -> Result<Vec<Reminder>, DatabaseError> {
        self.query_reminders(
            "list_reminders",
            &format!(
                "SELECT {REMINDER_COLUMNS} FROM reminders WHERE user_id = ?1 ORDER BY next_trigger_at ASC, id ASC"
            ),
            params![user_id],
        )
        .await
    }

    async fn list_due_reminders(
        &self,
        user_id: &str,
        now: DateTime<Utc>,
        lookahead: Duration,
        catchup: Duration,
    ) -> Result<Vec<Reminder>, DatabaseError> {
        let lower = format_ts(ceil_to_second(now - catchup));
        let upper = format_ts(now + lookahead);
        self.query_reminders(
            "list_due_reminders",
            &format!(
                "SELECT {REMINDER_COLUMNS} FROM reminders WHERE user_id = ?1 AND enabled = 1 AND next_trigger_at >= ?2 AND next_trigger_at <= ?3 ORDER BY next_trigger_at ASC, id ASC"
            ),
            params![user_id, lower, upper],
        )
        .await
    }

    async fn list_stale_reminders(
        &self,
        user_id: &str,
        cutoff: DateTime<Utc>,
    ) -> Result<Vec<Reminder>, DatabaseError> {
        self.query_reminders(
            "list_stale_reminders",
            &format!(
                "SELECT {REMINDER_COLUMNS} FROM reminders WHERE user_id = ?1 AND enabled = 1 AND next_trigger_at < ?2 ORDER BY next_trigger_at ASC, id ASC"
            ),
            params![user_id, format_ts(ceil_to_second(cutoff))],
        )
        .await
    }

    async fn advance_reminder(
        &self,
        id: &str,
        expected_trigger_count: u64,
        now: DateTime<Utc>,
    ) -> Result<Option<Reminder>, DatabaseError> {
        let _guard = self.write_lock.lock().await;

        let Some(current) = self.get_reminder(id).await? else {
            return Ok(None);
        };
        if current.trigger_count != expected_trigger_count {
            debug!(
                reminder_id = id,
                expected = expected_trigger_count,
                found = current.trigger_count,
                "Advance lost to a concurrent writer"
            );
            return Ok(None);
        }

        let next_trigger_at = current.following_trigger(now);
        let count = self
            .conn()
            .execute(
                "UPDATE reminders SET next_trigger_at = ?1, last_triggered = ?2, trigger_count = trigger_count + 1, updated_at = ?2 WHERE id = ?3 AND trigger_count = ?4",
                params![
                    format_ts(next_trigger_at),
                    format_ts(now),
                    id,
                    expected_trigger_count as i64
                ],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("advance_reminder: {e}")))?;

        if count == 0 {
            debug!(reminder_id = id, "Advance lost to a concurrent writer");
            return Ok(None);
        }

        debug!(reminder_id = id, next_trigger_at = %next_trigger_at, "Reminder advanced");
        Ok(Some(Reminder {
            next_trigger_at,
            last_triggered: Some(now),
            trigger_count: expected_trigger_count + 1,
            updated_at: now,
            ..current
        }))
    }

    async fn delete_reminders_for_user(&self, user_id: &str) -> Result<usize, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let count = self
            .conn()
            .execute(
                "DELETE FROM reminders WHERE user_id = ?1",
                params![user_id],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_reminders_for_user: {e}")))?;
        Ok(count as usize)
    }

    // ── Settings ────────────────────────────────────────────────────

    async fn get_setting(
        &self,
        user_id: &str,
        key: &str,
    ) -> Result<Option<serde_json::Value>, DatabaseError> {
        let conn = self.conn();
        let mut rows = conn
            .query(
                "SELECT value FROM settings WHERE user_id = ?1 AND key = ?2",
                params![user_id, key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("get_setting: {e}")))?;

        match rows.next().await {
            Ok(Some(row)) => {
                let value_str: String = row.get(0).unwrap_or_else(|_| "null".to_string());
                let value: serde_json::Value =
                    serde_json::from_str(&value_str).unwrap_or(serde_json::Value::Null);
                Ok(Some(value))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(DatabaseError::Query(format!("get_setting: {e}"))),
        }
    }

    async fn set_setting(
        &self,
        user_id: &str,
        key: &str,
        value: &serde_json::Value,
    ) -> Result<(), DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let conn = self.conn();
        let now = format_ts(Utc::now());
        let value_str = serde_json::to_string(value)
            .map_err(|e| DatabaseError::Serialization(e.to_string()))?;

        conn.execute(
            "INSERT INTO settings (user_id, key, value, updated_at) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT (user_id, key) DO UPDATE SET value = ?3, updated_at = ?4",
            params![user_id, key, value_str, now],
        )
        .await
        .map_err(|e| DatabaseError::Query(format!("set_setting: {e}")))?;

        Ok(())
    }

    async fn delete_setting(&self, user_id: &str, key: &str) -> Result<bool, DatabaseError> {
        let _guard = self.write_lock.lock().await;
        let conn = self.conn();
        let count = conn
            .execute(
                "DELETE FROM settings WHERE user_id = ?1 AND key = ?2",
                params![user_id, key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("delete_setting: {e}")))?;
        Ok(count > 0)
    }

    async fn list_settings_by_key(
        &self,
        key: &str,
    ) -> Result<Vec<(String, serde_json::Value)>, DatabaseError> {
        let mut rows = self
            .conn()
            .query(
                "SELECT user_id, value FROM settings WHERE key = ?1 ORDER BY user_id ASC",
                params![key],
            )
            .await
            .map_err(|e| DatabaseError::Query(format!("list_settings_by_key: {e}")))?;

        let mut out = Vec::new();
        while let Ok(Some(row)) = rows.next().await {
            let Ok(user_id) = row.get::<String>(0) else {
                continue;
            };
            let value_str: String = row.get(1).unwrap_or_else(|_| "null".to_string());
            let value = serde_json::from_str(&value_str).unwrap_or(serde_json::Value::Null);
            out.push((user_id, value));
        }
        Ok(out)
    }
}
