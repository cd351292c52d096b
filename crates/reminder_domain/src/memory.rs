//! In-process collaborators with failure injection, for tests and local runs.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::{
    error::{DeliveryError, FeedError},
    model::{AppointmentStatus, NotificationRecord},
    notifications::{DeliveryApi, DeliveryRequest, ScheduledNotification},
    remote::{AppointmentStatusLookup, NotificationFeed},
};

#[derive(Debug, Default)]
pub struct InMemoryDelivery {
    scheduled: Mutex<BTreeMap<u64, ScheduledNotification>>,
    next_id: AtomicU64,
    unavailable: AtomicBool,
    /// Remaining successful submissions before the next one fails.
    fail_after: Mutex<Option<usize>>,
    submissions: AtomicU64,
    cancellations: Mutex<Vec<String>>,
}

impl InMemoryDelivery {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Lets `successes` more submissions through, then rejects one.
    pub fn fail_after(&self, successes: usize) {
        *self.fail_after.lock() = Some(successes);
    }

    pub fn scheduled(&self) -> Vec<ScheduledNotification> {
        self.scheduled.lock().values().cloned().collect()
    }

    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::SeqCst)
    }

    pub fn cancellations(&self) -> Vec<String> {
        self.cancellations.lock().clone()
    }

    fn check_available(&self) -> Result<(), DeliveryError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(DeliveryError("delivery service offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl DeliveryApi for InMemoryDelivery {
    async fn schedule_at(&self, request: &DeliveryRequest) -> Result<String, DeliveryError> {
        self.check_available()?;
        {
            let mut budget = self.fail_after.lock();
            if let Some(remaining) = *budget {
                if remaining == 0 {
                    *budget = None;
                    return Err(DeliveryError("submission rejected".to_string()));
                }
                *budget = Some(remaining - 1);
            }
        }
        self.submissions.fetch_add(1, Ordering::SeqCst);
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let notification = ScheduledNotification::from_request(id.to_string(), request);
        self.scheduled.lock().insert(id, notification);
        Ok(id.to_string())
    }

    async fn cancel(&self, id: &str) -> Result<(), DeliveryError> {
        self.check_available()?;
        self.cancellations.lock().push(id.to_string());
        if let Ok(numeric) = id.parse::<u64>() {
            self.scheduled.lock().remove(&numeric);
        }
        Ok(())
    }

    async fn list_scheduled(&self) -> Result<Vec<ScheduledNotification>, DeliveryError> {
        self.check_available()?;
        Ok(self.scheduled())
    }
}

#[derive(Debug, Default)]
pub struct InMemoryFeed {
    records: Mutex<HashMap<String, Vec<NotificationRecord>>>,
    unavailable: AtomicBool,
    delay: Mutex<Option<Duration>>,
    fetches: AtomicU64,
}

impl InMemoryFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, user_id: &str, record: NotificationRecord) {
        let mut records = self.records.lock();
        let list = records.entry(user_id.to_string()).or_default();
        list.retain(|existing| existing.id != record.id);
        list.push(record);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Delays every fetch, to exercise caller timeouts.
    pub fn set_delay(&self, delay: Option<Duration>) {
        *self.delay.lock() = delay;
    }

    pub fn fetches(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl NotificationFeed for InMemoryFeed {
    async fn fetch(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, FeedError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(FeedError("notification feed offline".to_string()));
        }
        let mut records: Vec<NotificationRecord> = self
            .records
            .lock()
            .get(user_id)
            .map(|list| {
                list.iter()
                    .filter(|record| record.created_at >= since)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }
}

/// Unknown appointments report as pending.
#[derive(Debug, Default)]
pub struct InMemoryStatusLookup {
    statuses: Mutex<HashMap<String, AppointmentStatus>>,
    unavailable: AtomicBool,
}

impl InMemoryStatusLookup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self, appointment_id: &str, status: AppointmentStatus) {
        self.statuses
            .lock()
            .insert(appointment_id.to_string(), status);
    }

    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl AppointmentStatusLookup for InMemoryStatusLookup {
    async fn appointment_status(
        &self,
        appointment_id: &str,
    ) -> Result<AppointmentStatus, FeedError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(FeedError("status lookup offline".to_string()));
        }
        Ok(self
            .statuses
            .lock()
            .get(appointment_id)
            .copied()
            .unwrap_or(AppointmentStatus::Pending))
    }
}
