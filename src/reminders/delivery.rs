//! Delivery agent: the background loop that fires due reminders.
//!
//! Each tick resolves the current identity, silently advances reminders that
//! fell out of the catch-up window, then notifies and advances every reminder
//! due within `[now - catchup, now + lookahead]`. A reminder is advanced
//! whether or not its notification went through, so a broken sink can never
//! pin the schedule to an expired slot.
//!
//! Every outcome is announced on a broadcast channel (the history mirror).
//! Nobody has to listen; sends to an empty channel are dropped.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::{ExposeSecret, SecretString};
use serde::Serialize;
use tokio::sync::{RwLock, broadcast};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::model::{Reminder, ReminderType};
use super::reconciler::{ReconcileReport, Reconciler};
use super::settings;
use super::sink::NotificationSink;
use crate::config::DeliveryConfig;
use crate::error::{DeliveryError, Error};
use crate::store::Database;

/// Capacity of the history broadcast channel.
const HISTORY_CAPACITY: usize = 256;

/// The signed-in user, pushed by the foreground app.
#[derive(Debug)]
pub struct Identity {
    pub user_id: String,
    /// Presented by history mirror clients to prove they belong to this user.
    pub access_token: SecretString,
}

impl Identity {
    pub fn new(user_id: impl Into<String>, access_token: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            access_token: SecretString::from(access_token.into()),
        }
    }
}

/// What the agent did with a user's reminders on handshake.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Handshake {
    /// Settings enabled, nothing materialized yet: reconciled now.
    Reconciled { report: ReconcileReport },
    /// Settings missing or disabled: reminder set emptied.
    Cleared { removed: usize },
    /// Reminders already in place.
    Ready { reminders: usize },
}

/// What happened to one reminder during a tick.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum DeliveryOutcome {
    Delivered,
    /// Too old to deliver; advanced without notifying.
    Skipped,
    /// The sink refused; advanced anyway.
    Failed { reason: String },
}

/// History entry announced after each processed reminder.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryEvent {
    pub id: Uuid,
    pub user_id: String,
    pub reminder_id: String,
    pub reminder_type: ReminderType,
    pub title: String,
    pub body: String,
    pub route: String,
    pub scheduled_for: DateTime<Utc>,
    pub processed_at: DateTime<Utc>,
    #[serde(flatten)]
    pub outcome: DeliveryOutcome,
}

impl DeliveryEvent {
    fn new(reminder: &Reminder, outcome: DeliveryOutcome, now: DateTime<Utc>) -> Self {
        let notification = reminder.notification();
        Self {
            id: Uuid::new_v4(),
            route: notification.route(),
            user_id: notification.user_id,
            reminder_id: notification.reminder_id,
            reminder_type: notification.reminder_type,
            title: notification.payload.title,
            body: notification.payload.body,
            scheduled_for: reminder.next_trigger_at,
            processed_at: now,
            outcome,
        }
    }
}

/// Counters for one tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TickSummary {
    pub delivered: usize,
    pub failed: usize,
    pub skipped: usize,
    /// Reminders another agent advanced first.
    pub lost_races: usize,
    /// Repository errors while advancing.
    pub errors: usize,
}

/// Polls the repository and fires due reminders for the current identity.
pub struct DeliveryAgent {
    db: Arc<dyn Database>,
    reconciler: Reconciler,
    sink: Arc<dyn NotificationSink>,
    config: DeliveryConfig,
    identity: RwLock<Option<Arc<Identity>>>,
    events: broadcast::Sender<DeliveryEvent>,
}

impl DeliveryAgent {
    pub fn new(
        db: Arc<dyn Database>,
        sink: Arc<dyn NotificationSink>,
        config: DeliveryConfig,
    ) -> Self {
        let (events, _) = broadcast::channel(HISTORY_CAPACITY);
        Self {
            reconciler: Reconciler::new(Arc::clone(&db)),
            db,
            sink,
            config,
            identity: RwLock::new(None),
            events,
        }
    }

    pub fn config(&self) -> &DeliveryConfig {
        &self.config
    }

    /// Subscribe to the delivery history.
    pub fn subscribe(&self) -> broadcast::Receiver<DeliveryEvent> {
        self.events.subscribe()
    }

    /// Id of the user the agent currently delivers for.
    pub async fn current_user(&self) -> Option<String> {
        self.identity
            .read()
            .await
            .as_ref()
            .map(|identity| identity.user_id.clone())
    }

    /// Match `token` against the current identity's access token. Returns
    /// the user id on a match. An empty token never matches.
    pub async fn authorize(&self, token: &str) -> Option<String> {
        let identity = self.identity.read().await;
        let identity = identity.as_ref()?;
        let expected = identity.access_token.expose_secret();
        (!token.is_empty() && token == expected).then(|| identity.user_id.clone())
    }

    /// Accept the identity from the foreground app and bring the user's
    /// reminder set in line with their stored settings.
    pub async fn set_identity(
        &self,
        identity: Identity,
        now: DateTime<Utc>,
    ) -> Result<Handshake, Error> {
        let user_id = identity.user_id.clone();
        *self.identity.write().await = Some(Arc::new(identity));
        info!(user_id = %user_id, sink = self.sink.name(), "Delivery identity set");

        let outcome = match settings::load_settings(self.db.as_ref(), &user_id).await? {
            Some(user_settings) if user_settings.enabled => {
                let existing = self.db.list_reminders(&user_id).await?;
                if existing.is_empty() {
                    let report = self
                        .reconciler
                        .on_settings_change(&user_id, &user_settings, now)
                        .await?;
                    Handshake::Reconciled { report }
                } else {
                    Handshake::Ready {
                        reminders: existing.len(),
                    }
                }
            }
            _ => {
                let removed = self.db.delete_reminders_for_user(&user_id).await?;
                Handshake::Cleared { removed }
            }
        };
        debug!(user_id = %user_id, ?outcome, "Handshake complete");
        Ok(outcome)
    }

    /// Forget the identity (logout). Later ticks are no-ops.
    pub async fn clear_identity(&self) -> bool {
        let previous = self.identity.write().await.take();
        if let Some(identity) = &previous {
            info!(user_id = %identity.user_id, "Delivery identity cleared");
        }
        previous.is_some()
    }

    /// Run one tick at the current wall-clock time.
    pub async fn tick(&self) -> Result<TickSummary, DeliveryError> {
        self.tick_at(Utc::now()).await
    }

    /// Run one tick as of `now`.
    ///
    /// Only failing to list reminders is an error; everything that goes wrong
    /// with an individual reminder is logged and counted.
    pub async fn tick_at(&self, now: DateTime<Utc>) -> Result<TickSummary, DeliveryError> {
        let Some(user_id) = self.current_user().await else {
            debug!("No identity, skipping tick");
            return Ok(TickSummary::default());
        };

        let mut summary = TickSummary::default();
        let catchup = self.config.catchup_chrono();

        let stale = self
            .db
            .list_stale_reminders(&user_id, now - catchup)
            .await?;
        for reminder in &stale {
            warn!(
                reminder_id = %reminder.id,
                scheduled_for = %reminder.next_trigger_at,
                "Reminder missed the catch-up window, advancing without notifying"
            );
            if self.advance(reminder, now, &mut summary).await {
                summary.skipped += 1;
                self.announce(reminder, DeliveryOutcome::Skipped, now);
            }
        }

        let due = self
            .db
            .list_due_reminders(&user_id, now, self.config.lookahead_chrono(), catchup)
            .await?;
        for reminder in &due {
            let outcome = match self.sink.notify(&reminder.notification()).await {
                Ok(()) => {
                    info!(
                        reminder_id = %reminder.id,
                        reminder_type = %reminder.reminder_type,
                        "Reminder delivered"
                    );
                    summary.delivered += 1;
                    DeliveryOutcome::Delivered
                }
                Err(e) => {
                    warn!(reminder_id = %reminder.id, "Reminder delivery failed: {e}");
                    summary.failed += 1;
                    DeliveryOutcome::Failed {
                        reason: e.to_string(),
                    }
                }
            };
            self.advance(reminder, now, &mut summary).await;
            self.announce(reminder, outcome, now);
        }

        if stale.len() + due.len() > 0 {
            debug!(user_id = %user_id, ?summary, "Tick complete");
        }
        Ok(summary)
    }

    /// Advance one reminder. Returns whether this agent did the advancing.
    async fn advance(&self, reminder: &Reminder, now: DateTime<Utc>, summary: &mut TickSummary) -> bool {
        match self
            .db
            .advance_reminder(&reminder.id, reminder.trigger_count, now)
            .await
        {
            Ok(Some(advanced)) => {
                debug!(
                    reminder_id = %reminder.id,
                    next_trigger_at = %advanced.next_trigger_at,
                    "Reminder advanced"
                );
                true
            }
            Ok(None) => {
                warn!(reminder_id = %reminder.id, "Reminder was advanced or removed elsewhere");
                summary.lost_races += 1;
                false
            }
            Err(e) => {
                error!(reminder_id = %reminder.id, "Failed to advance reminder: {e}");
                summary.errors += 1;
                false
            }
        }
    }

    fn announce(&self, reminder: &Reminder, outcome: DeliveryOutcome, now: DateTime<Utc>) {
        // Fire-and-forget: no receivers is fine.
        let _ = self.events.send(DeliveryEvent::new(reminder, outcome, now));
    }
}

/// Spawn the delivery loop. Runs until `cancel` fires.
///
/// The first tick runs immediately so a restarted agent catches up at once.
pub fn spawn_delivery_loop(
    agent: Arc<DeliveryAgent>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(agent.config().tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(
            interval_secs = agent.config().tick_interval.as_secs(),
            "Delivery loop started"
        );

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = agent.tick().await {
                        error!("Delivery tick failed: {e}");
                    }
                }
            }
        }

        info!("Delivery loop stopped");
    })
}
