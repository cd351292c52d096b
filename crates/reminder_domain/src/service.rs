use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{instrument, warn};

use crate::{
    clock::{Clock, SystemClock},
    config::EngineConfig,
    error::{DeliveryError, ReconcileError, ScheduleError, StoreError},
    inbox::Inbox,
    kv::{KvStore, MemoryKvStore},
    memory::InMemoryStatusLookup,
    model::{Cadence, NotificationRecord, Reminder, ReminderPayload},
    notifications::{DeliveryApi, DeliveryRequest, Trigger, ALERT_KEY_PREFIX},
    reconcile,
    remote::{AppointmentStatusLookup, NotificationFeed},
    scheduler::ReminderScheduler,
    store::ReminderStore,
    time::{parse_time_or, WallTime},
};

/// Whether the last reconciliation reached its sources.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SourceStatus {
    Unknown,
    Connected,
    Disconnected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReconcileReport {
    pub records: Vec<NotificationRecord>,
    /// Records that were not part of the previous merged view.
    pub newly_observed: Vec<NotificationRecord>,
}

pub struct ReminderService {
    config: EngineConfig,
    clock: Arc<dyn Clock>,
    delivery: Arc<dyn DeliveryApi>,
    feed: Arc<dyn NotificationFeed>,
    store: Arc<ReminderStore>,
    scheduler: ReminderScheduler,
    inbox: Inbox,
    status: RwLock<SourceStatus>,
}

pub struct ReminderServiceBuilder {
    config: EngineConfig,
    kv: Option<Arc<dyn KvStore>>,
    clock: Option<Arc<dyn Clock>>,
    delivery: Option<Arc<dyn DeliveryApi>>,
    feed: Option<Arc<dyn NotificationFeed>>,
    status_lookup: Option<Arc<dyn AppointmentStatusLookup>>,
}

impl ReminderServiceBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            kv: None,
            clock: None,
            delivery: None,
            feed: None,
            status_lookup: None,
        }
    }

    pub fn with_config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_kv_store(mut self, kv: Arc<dyn KvStore>) -> Self {
        self.kv = Some(kv);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_delivery(mut self, delivery: Arc<dyn DeliveryApi>) -> Self {
        self.delivery = Some(delivery);
        self
    }

    pub fn with_feed(mut self, feed: Arc<dyn NotificationFeed>) -> Self {
        self.feed = Some(feed);
        self
    }

    pub fn with_status_lookup(mut self, lookup: Arc<dyn AppointmentStatusLookup>) -> Self {
        self.status_lookup = Some(lookup);
        self
    }

    pub fn build(self) -> Result<ReminderService> {
        let delivery = self
            .delivery
            .ok_or_else(|| anyhow!("a delivery api is required"))?;
        let feed = self
            .feed
            .ok_or_else(|| anyhow!("a notification feed is required"))?;
        let kv = self
            .kv
            .unwrap_or_else(|| Arc::new(MemoryKvStore::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let status_lookup = self
            .status_lookup
            .unwrap_or_else(|| Arc::new(InMemoryStatusLookup::new()));

        let store = Arc::new(ReminderStore::new(Arc::clone(&kv)));
        let scheduler = ReminderScheduler::new(
            Arc::clone(&store),
            Arc::clone(&delivery),
            status_lookup,
            Arc::clone(&clock),
            self.config.offset(),
        );
        Ok(ReminderService {
            config: self.config,
            clock,
            delivery,
            feed,
            store,
            scheduler,
            inbox: Inbox::new(kv),
            status: RwLock::new(SourceStatus::Unknown),
        })
    }
}

impl Default for ReminderServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ReminderService {
    pub fn builder() -> ReminderServiceBuilder {
        ReminderServiceBuilder::new()
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    #[instrument(skip(self, payload))]
    pub async fn schedule_appointment_reminder(
        &self,
        appointment_id: &str,
        appointment_at: DateTime<Utc>,
        lead_minutes: u32,
        payload: ReminderPayload,
    ) -> Result<Vec<String>, ScheduleError> {
        let reminder = Reminder::appointment(appointment_id, appointment_at, lead_minutes, payload);
        self.scheduler.schedule(&reminder).await
    }

    #[instrument(skip(self, payload))]
    pub async fn schedule_medicine_reminder(
        &self,
        medicine_id: &str,
        cadence: Cadence,
        base_time: WallTime,
        payload: ReminderPayload,
    ) -> Result<Vec<String>, ScheduleError> {
        let reminder = Reminder::medicine(medicine_id, cadence, base_time, payload);
        self.scheduler.schedule(&reminder).await
    }

    /// Accepts the time as typed by the user; unreadable text means the default time.
    pub async fn schedule_medicine_reminder_text(
        &self,
        medicine_id: &str,
        cadence: Cadence,
        time_text: &str,
        payload: ReminderPayload,
    ) -> Result<Vec<String>, ScheduleError> {
        let base_time = parse_time_or(time_text, self.config.default_time);
        self.schedule_medicine_reminder(medicine_id, cadence, base_time, payload)
            .await
    }

    #[instrument(skip(self))]
    pub async fn cancel_reminder(&self, key: &str) -> Result<(), StoreError> {
        self.scheduler.cancel(key).await
    }

    pub fn active_reminders(&self, key: &str) -> Result<Vec<String>, StoreError> {
        Ok(self
            .store
            .get(key)?
            .map(|entry| entry.ids)
            .unwrap_or_default())
    }

    /// Fetches both sources and merges them into the stored view.
    ///
    /// Nothing is written unless both fetches succeed.
    #[instrument(skip(self))]
    pub async fn try_reconcile(&self, user_id: &str) -> Result<ReconcileReport, ReconcileError> {
        let outcome = self.fetch_and_merge(user_id).await;
        match &outcome {
            Ok(_) => *self.status.write() = SourceStatus::Connected,
            Err(ReconcileError::SourceUnreachable { .. }) => {
                *self.status.write() = SourceStatus::Disconnected
            }
            Err(ReconcileError::Store(_)) => {}
        }
        outcome
    }

    /// Reconciles and returns the merged view, or the last good view on failure.
    pub async fn reconcile_now(&self, user_id: &str) -> Vec<NotificationRecord> {
        match self.try_reconcile(user_id).await {
            Ok(report) => report.records,
            Err(err) => {
                warn!(user_id, %err, "reconciliation failed; serving last merged view");
                self.notifications(user_id).unwrap_or_else(|err| {
                    warn!(user_id, %err, "merged view unreadable");
                    Vec::new()
                })
            }
        }
    }

    pub fn source_status(&self) -> SourceStatus {
        *self.status.read()
    }

    pub fn notifications(&self, user_id: &str) -> Result<Vec<NotificationRecord>, StoreError> {
        self.inbox.snapshot(user_id)
    }

    pub fn unread_count(&self, user_id: &str) -> Result<usize, StoreError> {
        self.inbox.unread_count(user_id)
    }

    pub fn mark_read(&self, user_id: &str, id: &str) -> Result<bool, StoreError> {
        self.inbox.mark_read(user_id, id, self.clock.now())
    }

    pub fn mark_all_read(&self, user_id: &str) -> Result<usize, StoreError> {
        self.inbox.mark_all_read(user_id, self.clock.now())
    }

    pub fn clear_all(&self, user_id: &str) -> Result<(), StoreError> {
        self.inbox.clear_all(user_id)
    }

    /// Presents `record` on the device right away.
    pub async fn forward_alert(&self, record: &NotificationRecord) -> Result<String, DeliveryError> {
        let now = self.clock.now();
        let request = DeliveryRequest {
            reminder_key: format!("{ALERT_KEY_PREFIX}{}", record.id),
            ordinal: 0,
            record_type: record.kind.clone(),
            trigger: Trigger::At(now),
            fire_at: now,
            payload: ReminderPayload::new(record.title.clone(), record.body.clone()),
        };
        self.delivery.schedule_at(&request).await
    }

    async fn fetch_and_merge(&self, user_id: &str) -> Result<ReconcileReport, ReconcileError> {
        let source_down = |source_name: &'static str, reason: String| ReconcileError::SourceUnreachable {
            source_name,
            user_id: user_id.to_string(),
            reason,
        };
        let since = self.clock.now() - self.config.fetch_window();
        let timeout = self.config.fetch_timeout();

        let server = tokio::time::timeout(
            timeout,
            self.feed.fetch(user_id, since, self.config.fetch_limit),
        )
        .await
        .map_err(|_| source_down("notification feed", format!("timed out after {timeout:?}")))?
        .map_err(|err| source_down("notification feed", err.to_string()))?;

        let scheduled = tokio::time::timeout(timeout, self.delivery.list_scheduled())
            .await
            .map_err(|_| source_down("delivery api", format!("timed out after {timeout:?}")))?
            .map_err(|err| source_down("delivery api", err.to_string()))?;
        let local: Vec<NotificationRecord> = scheduled
            .iter()
            .filter(|notification| !notification.is_alert())
            .map(|notification| notification.to_record())
            .collect();

        let report = self.inbox.update(user_id, |records| {
            let merged = reconcile::reconcile(&local, &server, records);
            let newly_observed = reconcile::newly_observed(records, &merged);
            *records = merged.clone();
            ReconcileReport {
                records: merged,
                newly_observed,
            }
        })?;
        Ok(report)
    }
}
