//! Health reminders: scheduling and delivery engine.

pub mod api;
pub mod config;
pub mod error;
pub mod reminders;
pub mod store;
