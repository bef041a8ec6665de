//! Per-user reminder settings, as saved by the settings UI.
//!
//! Settings are stored as a single JSON document per user in the `settings`
//! table under [`SETTINGS_KEY`]. Schedule fields stay as the raw strings the
//! user entered; they are validated when the reconciler turns them into a
//! [`Recurrence`], so one malformed type never blocks the others.

use std::collections::BTreeMap;

use chrono::FixedOffset;
use serde::{Deserialize, Serialize};

use super::model::{ReminderType, utc_offset};
use super::trigger::{DaySet, Recurrence, RecurringWindow, TimeOfDay};
use crate::error::{ConfigError, DatabaseError};
use crate::store::Database;

/// Settings key holding the reminder document.
pub const SETTINGS_KEY: &str = "reminders";

/// A user's reminder configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReminderSettings {
    /// Global switch. When off, the user has no reminders at all.
    pub enabled: bool,
    #[serde(default)]
    pub utc_offset_minutes: i32,
    #[serde(default)]
    pub types: BTreeMap<ReminderType, TypeSettings>,
}

/// Settings for one reminder type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TypeSettings {
    pub enabled: bool,
    #[serde(flatten)]
    pub schedule: ScheduleSettings,
}

/// Unvalidated schedule fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ScheduleSettings {
    Daily {
        time: String,
    },
    Weekly {
        time: String,
        days: Vec<u8>,
    },
    Recurring {
        window_start: String,
        window_end: String,
        interval_minutes: i64,
    },
}

impl ScheduleSettings {
    pub fn daily(time: &str) -> Self {
        ScheduleSettings::Daily {
            time: time.to_string(),
        }
    }

    pub fn weekly(time: &str, days: &[u8]) -> Self {
        ScheduleSettings::Weekly {
            time: time.to_string(),
            days: days.to_vec(),
        }
    }

    pub fn recurring(window_start: &str, window_end: &str, interval_minutes: i64) -> Self {
        ScheduleSettings::Recurring {
            window_start: window_start.to_string(),
            window_end: window_end.to_string(),
            interval_minutes,
        }
    }

    /// Validate and build the recurrence.
    pub fn to_recurrence(&self) -> Result<Recurrence, ConfigError> {
        match self {
            ScheduleSettings::Daily { time } => Ok(Recurrence::Daily {
                time_of_day: TimeOfDay::parse(time)?,
            }),
            ScheduleSettings::Weekly { time, days } => Ok(Recurrence::Weekly {
                time_of_day: TimeOfDay::parse(time)?,
                days: DaySet::from_days(days)?,
            }),
            ScheduleSettings::Recurring {
                window_start,
                window_end,
                interval_minutes,
            } => Ok(Recurrence::Recurring {
                window: RecurringWindow::new(
                    TimeOfDay::parse(window_start)?,
                    TimeOfDay::parse(window_end)?,
                    *interval_minutes,
                )?,
            }),
        }
    }
}

impl ReminderSettings {
    /// Default schedule for a reminder type.
    pub fn default_schedule(reminder_type: ReminderType) -> ScheduleSettings {
        match reminder_type {
            ReminderType::Meal => ScheduleSettings::daily("12:00"),
            ReminderType::Water => ScheduleSettings::recurring("08:00", "22:00", 120),
            ReminderType::Workout => ScheduleSettings::weekly("18:00", &[1, 3, 5]),
            ReminderType::Goal => ScheduleSettings::daily("09:00"),
            ReminderType::Streak => ScheduleSettings::daily("20:00"),
            ReminderType::Weight => ScheduleSettings::weekly("08:00", &[1]),
            ReminderType::Summary => ScheduleSettings::weekly("19:00", &[0]),
        }
    }

    /// The user's wall-clock offset, validated.
    pub fn timezone(&self) -> Result<FixedOffset, ConfigError> {
        utc_offset(self.utc_offset_minutes)
    }

    /// Types whose own flag is on, in a stable order.
    pub fn enabled_types(&self) -> impl Iterator<Item = (ReminderType, &TypeSettings)> {
        self.types
            .iter()
            .filter(|(_, settings)| settings.enabled)
            .map(|(t, settings)| (*t, settings))
    }
}

impl Default for ReminderSettings {
    /// Globally off, with every type pre-filled and switched on so that
    /// flipping the global flag yields a sensible set.
    fn default() -> Self {
        let types = ReminderType::ALL
            .into_iter()
            .map(|t| {
                (
                    t,
                    TypeSettings {
                        enabled: true,
                        schedule: Self::default_schedule(t),
                    },
                )
            })
            .collect();
        Self {
            enabled: false,
            utc_offset_minutes: 0,
            types,
        }
    }
}

/// Read a user's settings, `None` when nothing was ever saved.
pub async fn load_settings(
    db: &dyn Database,
    user_id: &str,
) -> Result<Option<ReminderSettings>, DatabaseError> {
    match db.get_setting(user_id, SETTINGS_KEY).await? {
        Some(value) => serde_json::from_value(value)
            .map(Some)
            .map_err(|e| DatabaseError::Serialization(format!("reminder settings for {user_id}: {e}"))),
        None => Ok(None),
    }
}

/// Persist a user's settings document.
pub async fn store_settings(
    db: &dyn Database,
    user_id: &str,
    settings: &ReminderSettings,
) -> Result<(), DatabaseError> {
    let value =
        serde_json::to_value(settings).map_err(|e| DatabaseError::Serialization(e.to_string()))?;
    db.set_setting(user_id, SETTINGS_KEY, &value).await
}

/// Every user whose stored settings have the global flag on.
///
/// Documents that fail to parse are skipped with a warning.
pub async fn list_enabled_users(db: &dyn Database) -> Result<Vec<String>, DatabaseError> {
    let documents = db.list_settings_by_key(SETTINGS_KEY).await?;
    let mut users = Vec::new();
    for (user_id, value) in documents {
        match serde_json::from_value::<ReminderSettings>(value) {
            Ok(settings) if settings.enabled => users.push(user_id),
            Ok(_) => {}
            Err(e) => tracing::warn!(user_id = %user_id, "Skipping unreadable reminder settings: {e}"),
        }
    }
    Ok(users)
}
