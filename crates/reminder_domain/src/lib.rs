pub mod clock;
pub mod config;
pub mod error;
pub mod inbox;
pub mod kv;
pub mod memory;
pub mod model;
pub mod notifications;
pub mod reconcile;
pub mod remote;
pub mod scheduler;
pub mod service;
pub mod store;
pub mod time;

pub use crate::service::{ReconcileReport, ReminderService, ReminderServiceBuilder, SourceStatus};
