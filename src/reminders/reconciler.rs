//! Regenerates a user's reminder set from their settings.
//!
//! Every run deletes the user's rows and re-materializes one row per enabled
//! type, all in a single repository transaction. Running it twice with the
//! same settings and the same `now` produces the same rows.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use super::model::{NotificationPayload, Reminder, ReminderType};
use super::settings::{self, ReminderSettings};
use crate::error::{ConfigError, Error};
use crate::store::Database;

/// Outcome of reconciling one user.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ReconcileReport {
    pub user_id: String,
    /// Types that now have a materialized reminder.
    pub scheduled: Vec<ReminderType>,
    /// Types skipped because their schedule did not validate.
    pub errors: Vec<TypeError>,
}

impl ReconcileReport {
    pub fn is_clean(&self) -> bool {
        self.errors.is_empty()
    }
}

/// A schedule error scoped to one reminder type.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TypeError {
    pub reminder_type: ReminderType,
    pub message: String,
    #[serde(skip)]
    pub error: ConfigError,
}

/// Outcome of a batch run over every enabled user.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BatchReport {
    pub users: usize,
    pub reminders: usize,
    pub config_errors: usize,
    pub failed_users: Vec<String>,
}

/// Turns settings into materialized reminders.
#[derive(Clone)]
pub struct Reconciler {
    db: Arc<dyn Database>,
}

impl Reconciler {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Build the reminder rows for `settings` without touching storage.
    ///
    /// A disabled global flag yields an empty set. Types whose schedule fails
    /// validation are reported and left out; the rest are still built.
    pub fn plan(
        user_id: &str,
        settings: &ReminderSettings,
        now: DateTime<Utc>,
    ) -> (Vec<Reminder>, ReconcileReport) {
        let mut report = ReconcileReport {
            user_id: user_id.to_string(),
            ..Default::default()
        };
        if !settings.enabled {
            return (Vec::new(), report);
        }

        let mut reminders = Vec::new();
        for (reminder_type, type_settings) in settings.enabled_types() {
            let built = type_settings.schedule.to_recurrence().and_then(|recurrence| {
                Reminder::materialize(
                    user_id,
                    reminder_type,
                    recurrence,
                    settings.utc_offset_minutes,
                    NotificationPayload::default_for(reminder_type),
                    now,
                )
            });
            match built {
                Ok(reminder) => {
                    report.scheduled.push(reminder_type);
                    reminders.push(reminder);
                }
                Err(error) => {
                    warn!(user_id, reminder_type = %reminder_type, "Skipping reminder type: {error}");
                    report.errors.push(TypeError {
                        reminder_type,
                        message: error.to_string(),
                        error,
                    });
                }
            }
        }
        (reminders, report)
    }

    /// Replace the user's reminders with the set `settings` describes.
    pub async fn on_settings_change(
        &self,
        user_id: &str,
        settings: &ReminderSettings,
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport, Error> {
        let (reminders, report) = Self::plan(user_id, settings, now);
        self.db.replace_reminders_for_user(user_id, &reminders).await?;

        info!(
            user_id,
            enabled = settings.enabled,
            scheduled = report.scheduled.len(),
            errors = report.errors.len(),
            "Reminders reconciled"
        );
        Ok(report)
    }

    /// Persist settings, then reconcile.
    ///
    /// An unusable UTC offset would fail every type, so it rejects the whole
    /// document before anything is stored.
    pub async fn save_settings(
        &self,
        user_id: &str,
        settings: &ReminderSettings,
        now: DateTime<Utc>,
    ) -> Result<ReconcileReport, Error> {
        settings.timezone()?;
        settings::store_settings(self.db.as_ref(), user_id, settings).await?;
        self.on_settings_change(user_id, settings, now).await
    }

    /// Re-reconcile every user whose global flag is on.
    ///
    /// Used to repair drift after a change to the trigger arithmetic. A
    /// failure for one user is logged and recorded; the batch continues.
    pub async fn reconcile_all(&self, now: DateTime<Utc>) -> Result<BatchReport, Error> {
        let users = settings::list_enabled_users(self.db.as_ref()).await?;
        let mut batch = BatchReport::default();

        for user_id in users {
            let outcome = match settings::load_settings(self.db.as_ref(), &user_id).await {
                Ok(Some(user_settings)) => {
                    self.on_settings_change(&user_id, &user_settings, now).await
                }
                // Deleted between the listing and now.
                Ok(None) => continue,
                Err(e) => Err(e.into()),
            };
            match outcome {
                Ok(report) => {
                    batch.users += 1;
                    batch.reminders += report.scheduled.len();
                    batch.config_errors += report.errors.len();
                }
                Err(e) => {
                    tracing::error!(user_id = %user_id, "Batch reconcile failed: {e}");
                    batch.failed_users.push(user_id);
                }
            }
        }

        info!(
            users = batch.users,
            reminders = batch.reminders,
            failed = batch.failed_users.len(),
            "Batch reconciliation complete"
        );
        Ok(batch)
    }
}
