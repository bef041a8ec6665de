//! Reminder scheduling and delivery engine.
//!
//! Data flows settings → [`Reconciler`] → repository ← [`DeliveryAgent`] →
//! [`NotificationSink`]. The trigger arithmetic in [`trigger`] is pure.

pub mod delivery;
pub mod model;
pub mod reconciler;
pub mod settings;
pub mod sink;
pub mod trigger;

pub use delivery::{
    DeliveryAgent, DeliveryEvent, DeliveryOutcome, Handshake, Identity, TickSummary,
    spawn_delivery_loop,
};
pub use model::{Notification, NotificationPayload, Reminder, ReminderType};
pub use reconciler::{BatchReport, ReconcileReport, Reconciler};
pub use settings::{ReminderSettings, ScheduleSettings, TypeSettings};
pub use sink::{ChannelSink, LogSink, NotificationSink};
pub use trigger::{DaySet, Recurrence, RecurrenceKind, RecurringWindow, TimeOfDay};
