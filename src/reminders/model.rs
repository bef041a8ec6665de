//! Materialized reminder records.
//!
//! One [`Reminder`] exists per (user, reminder type). Its id is derived from
//! both, so a user can never hold two active records of the same type.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};

use super::trigger::{self, Recurrence, RecurrenceKind};
use crate::error::ConfigError;

/// Kinds of health reminder a user can enable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReminderType {
    Meal,
    Water,
    Workout,
    Goal,
    Streak,
    Weight,
    Summary,
}

impl ReminderType {
    pub const ALL: [ReminderType; 7] = [
        ReminderType::Meal,
        ReminderType::Water,
        ReminderType::Workout,
        ReminderType::Goal,
        ReminderType::Streak,
        ReminderType::Weight,
        ReminderType::Summary,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ReminderType::Meal => "meal",
            ReminderType::Water => "water",
            ReminderType::Workout => "workout",
            ReminderType::Goal => "goal",
            ReminderType::Streak => "streak",
            ReminderType::Weight => "weight",
            ReminderType::Summary => "summary",
        }
    }
}

impl fmt::Display for ReminderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ReminderType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ReminderType::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| format!("unknown reminder type: {s}"))
    }
}

/// What the platform shows when a reminder fires.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NotificationPayload {
    pub title: String,
    pub body: String,
    /// Platform grouping tag; a newer notification with the same tag
    /// replaces the older one.
    pub tag: String,
    /// Opaque routing data the foreground app resolves to a screen.
    pub target_reference: serde_json::Value,
}

impl NotificationPayload {
    /// Default copy for each reminder type.
    pub fn default_for(reminder_type: ReminderType) -> Self {
        let (title, body, route) = match reminder_type {
            ReminderType::Meal => (
                "Time to log your meal",
                "Keep your food diary up to date while it's fresh.",
                "/meals",
            ),
            ReminderType::Water => (
                "Stay hydrated",
                "Have a glass of water and log it.",
                "/water",
            ),
            ReminderType::Workout => (
                "Workout time",
                "Your scheduled workout is coming up.",
                "/workouts",
            ),
            ReminderType::Goal => (
                "Check in on your goals",
                "See how today is tracking against your targets.",
                "/goals",
            ),
            ReminderType::Streak => (
                "Keep your streak alive",
                "Log something today so your streak continues.",
                "/streaks",
            ),
            ReminderType::Weight => (
                "Weigh-in reminder",
                "Record your weight to keep your trend accurate.",
                "/weight",
            ),
            ReminderType::Summary => (
                "Your summary is ready",
                "Review your progress for the week.",
                "/summary",
            ),
        };
        Self {
            title: title.to_string(),
            body: body.to_string(),
            tag: format!("{reminder_type}-reminder"),
            target_reference: serde_json::json!({
                "route": route,
                "reminder_type": reminder_type.as_str(),
            }),
        }
    }
}

/// A notification handed to the platform sink.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    pub reminder_id: String,
    pub user_id: String,
    pub reminder_type: ReminderType,
    #[serde(flatten)]
    pub payload: NotificationPayload,
}

impl Notification {
    /// Navigation destination for a tap on the notification.
    ///
    /// Falls back to the home screen when the target carries no route.
    pub fn route(&self) -> String {
        self.payload
            .target_reference
            .get("route")
            .and_then(|v| v.as_str())
            .filter(|route| route.starts_with('/'))
            .unwrap_or("/")
            .to_string()
    }
}

/// A persisted, materialized reminder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Reminder {
    pub id: String,
    pub user_id: String,
    pub reminder_type: ReminderType,
    pub recurrence: Recurrence,
    /// Offset of the user's wall clock; times of day are read in it.
    pub utc_offset_minutes: i32,
    pub next_trigger_at: DateTime<Utc>,
    pub payload: NotificationPayload,

    // Runtime state
    pub enabled: bool,
    pub last_triggered: Option<DateTime<Utc>>,
    pub trigger_count: u64,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Reminder {
    /// Deterministic record id for a (type, user) pair.
    pub fn record_id(reminder_type: ReminderType, user_id: &str) -> String {
        format!("{reminder_type}:{user_id}")
    }

    /// Materialize a new reminder whose first trigger is the next occurrence
    /// after `now`.
    pub fn materialize(
        user_id: &str,
        reminder_type: ReminderType,
        recurrence: Recurrence,
        utc_offset_minutes: i32,
        payload: NotificationPayload,
        now: DateTime<Utc>,
    ) -> Result<Self, ConfigError> {
        let tz = utc_offset(utc_offset_minutes)?;
        let next_trigger_at = trigger::next_trigger(&recurrence, &now.with_timezone(&tz)).with_timezone(&Utc);
        Ok(Self {
            id: Self::record_id(reminder_type, user_id),
            user_id: user_id.to_string(),
            reminder_type,
            recurrence,
            utc_offset_minutes,
            next_trigger_at,
            payload,
            enabled: true,
            last_triggered: None,
            trigger_count: 0,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn recurrence_kind(&self) -> RecurrenceKind {
        self.recurrence.kind()
    }

    /// The slot after the current one.
    ///
    /// Computed from whichever is later of `now` and the current trigger, so
    /// a reminder delivered early (inside the lookahead) never lands on the
    /// slot it was just delivered for.
    pub fn following_trigger(&self, now: DateTime<Utc>) -> DateTime<Utc> {
        let tz = utc_offset(self.utc_offset_minutes).unwrap_or_else(|_| Utc.fix());
        let from = now.max(self.next_trigger_at).with_timezone(&tz);
        trigger::next_trigger(&self.recurrence, &from).with_timezone(&Utc)
    }

    pub fn notification(&self) -> Notification {
        Notification {
            reminder_id: self.id.clone(),
            user_id: self.user_id.clone(),
            reminder_type: self.reminder_type,
            payload: self.payload.clone(),
        }
    }
}

/// Validate a wall-clock offset in minutes.
pub fn utc_offset(minutes: i32) -> Result<FixedOffset, ConfigError> {
    minutes
        .checked_mul(60)
        .and_then(FixedOffset::east_opt)
        .ok_or(ConfigError::InvalidUtcOffset { minutes })
}
