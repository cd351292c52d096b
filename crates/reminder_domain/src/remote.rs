use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    error::FeedError,
    model::{AppointmentStatus, NotificationRecord},
};

/// Server-side notification history for a user.
#[async_trait]
pub trait NotificationFeed: Send + Sync {
    /// Records created at or after `since`, newest first, at most `limit`.
    async fn fetch(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, FeedError>;
}

#[async_trait]
pub trait AppointmentStatusLookup: Send + Sync {
    async fn appointment_status(&self, appointment_id: &str)
        -> Result<AppointmentStatus, FeedError>;
}
