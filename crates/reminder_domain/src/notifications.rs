use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::DeliveryError,
    model::{NotificationRecord, Origin, ReminderPayload},
    time::WallTime,
};

/// Reminder keys under which immediate alerts are submitted.
pub const ALERT_KEY_PREFIX: &str = "alert:";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(tag = "mode", content = "at", rename_all = "snake_case")]
pub enum Trigger {
    /// Fires once at the instant.
    At(DateTime<Utc>),
    /// Fires every day when the device wall clock reads this time.
    Daily(WallTime),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeliveryRequest {
    pub reminder_key: String,
    pub ordinal: u8,
    pub record_type: String,
    pub trigger: Trigger,
    /// First delivery instant.
    pub fire_at: DateTime<Utc>,
    pub payload: ReminderPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScheduledNotification {
    pub id: String,
    pub fire_at: DateTime<Utc>,
    pub reminder_key: String,
    pub ordinal: u8,
    pub record_type: String,
    pub trigger: Trigger,
    pub payload: ReminderPayload,
}

impl ScheduledNotification {
    pub fn from_request(id: impl Into<String>, request: &DeliveryRequest) -> Self {
        Self {
            id: id.into(),
            fire_at: request.fire_at,
            reminder_key: request.reminder_key.clone(),
            ordinal: request.ordinal,
            record_type: request.record_type.clone(),
            trigger: request.trigger.clone(),
            payload: request.payload.clone(),
        }
    }

    pub fn is_alert(&self) -> bool {
        self.reminder_key.starts_with(ALERT_KEY_PREFIX)
    }

    pub fn to_record(&self) -> NotificationRecord {
        NotificationRecord {
            id: self.id.clone(),
            title: self.payload.title.clone(),
            body: self.payload.body.clone(),
            kind: self.record_type.clone(),
            created_at: self.fire_at,
            is_read: false,
            read_at: None,
            origin: Origin::Local,
        }
    }
}

/// Implemented by platform notification adapters.
#[async_trait]
pub trait DeliveryApi: Send + Sync {
    async fn schedule_at(&self, request: &DeliveryRequest) -> Result<String, DeliveryError>;
    /// Cancelling an unknown id succeeds.
    async fn cancel(&self, id: &str) -> Result<(), DeliveryError>;
    async fn list_scheduled(&self) -> Result<Vec<ScheduledNotification>, DeliveryError>;
}
