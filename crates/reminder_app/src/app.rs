use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use reminder_domain::{
    config::EngineConfig,
    error::{DeliveryError, FeedError, StoreError},
    kv::{self, FileKvStore, KvStore},
    memory::InMemoryFeed,
    model::NotificationRecord,
    notifications::{DeliveryApi, DeliveryRequest, ScheduledNotification, Trigger},
    remote::NotificationFeed,
    time::next_occurrence,
    ReminderService,
};
use reminder_sync::{LoopConfig, LoopEvent, LoopHandle, ReconciliationLoop};

const SCHEDULE_KEY: &str = "delivery:scheduled";
/// Highest id ever handed out; ids are never reused across restarts.
const LAST_ID_KEY: &str = "delivery:last_id";
const PRESENT_EVERY: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub data_dir: PathBuf,
    pub user_id: String,
    /// JSON file of server notifications keyed by user id.
    pub feed_path: Option<PathBuf>,
    pub engine: EngineConfig,
    pub loop_config: LoopConfig,
}

impl AppConfig {
    pub fn from_env() -> Result<Self> {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("REMINDER_DATA_DIR") {
            if !dir.trim().is_empty() {
                config.data_dir = PathBuf::from(dir);
            }
        }
        if let Ok(user) = std::env::var("REMINDER_USER_ID") {
            let user = user.trim();
            if !user.is_empty() {
                config.user_id = user.to_string();
            }
        }
        if let Ok(path) = std::env::var("REMINDER_FEED_PATH") {
            if !path.trim().is_empty() {
                config.feed_path = Some(PathBuf::from(path));
            }
        }
        config.engine = EngineConfig::from_env().context("reading engine configuration")?;
        config.loop_config = LoopConfig::from_env();
        Ok(config)
    }

    pub fn store_path(&self) -> PathBuf {
        self.data_dir.join("store.json")
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from(".reminders"),
            user_id: "local".to_string(),
            feed_path: None,
            engine: EngineConfig::default(),
            loop_config: LoopConfig::default(),
        }
    }
}

/// Delivery adapter for hosts without a notification center: entries are kept
/// in the KV store and "presented" by logging them when due.
pub struct LogDelivery {
    kv: Arc<dyn KvStore>,
    scheduled: Mutex<BTreeMap<u64, ScheduledNotification>>,
    last_id: Mutex<u64>,
}

impl LogDelivery {
    pub fn open(kv: Arc<dyn KvStore>) -> Result<Self, StoreError> {
        let scheduled: BTreeMap<u64, ScheduledNotification> =
            kv::get_json(kv.as_ref(), SCHEDULE_KEY)?.unwrap_or_default();
        let recorded: u64 = kv::get_json(kv.as_ref(), LAST_ID_KEY)?.unwrap_or(0);
        let last_id = scheduled
            .keys()
            .next_back()
            .copied()
            .unwrap_or(0)
            .max(recorded);
        Ok(Self {
            kv,
            scheduled: Mutex::new(scheduled),
            last_id: Mutex::new(last_id),
        })
    }

    pub fn pending(&self) -> Vec<ScheduledNotification> {
        self.scheduled.lock().values().cloned().collect()
    }

    /// Removes one-shot entries that are due and moves due daily entries to
    /// their next occurrence in `zone`. Returns what fired.
    pub fn take_due(
        &self,
        now: DateTime<Utc>,
        zone: FixedOffset,
    ) -> Result<Vec<ScheduledNotification>, StoreError> {
        let mut scheduled = self.scheduled.lock();
        let due: Vec<u64> = scheduled
            .iter()
            .filter(|(_, notification)| notification.fire_at <= now)
            .map(|(id, _)| *id)
            .collect();
        if due.is_empty() {
            return Ok(Vec::new());
        }
        let mut fired = Vec::with_capacity(due.len());
        for id in due {
            let Some(notification) = scheduled.get_mut(&id) else {
                continue;
            };
            fired.push(notification.clone());
            match notification.trigger.clone() {
                Trigger::At(_) => {
                    scheduled.remove(&id);
                }
                Trigger::Daily(time) => {
                    notification.fire_at =
                        next_occurrence(&now.with_timezone(&zone), time).with_timezone(&Utc);
                }
            }
        }
        kv::set_json(self.kv.as_ref(), SCHEDULE_KEY, &*scheduled)?;
        Ok(fired)
    }

    fn persist(&self, scheduled: &BTreeMap<u64, ScheduledNotification>) -> Result<(), DeliveryError> {
        kv::set_json(self.kv.as_ref(), SCHEDULE_KEY, scheduled)
            .map_err(|err| DeliveryError(err.to_string()))
    }
}

#[async_trait]
impl DeliveryApi for LogDelivery {
    async fn schedule_at(&self, request: &DeliveryRequest) -> Result<String, DeliveryError> {
        let id = {
            let mut last_id = self.last_id.lock();
            let id = *last_id + 1;
            kv::set_json(self.kv.as_ref(), LAST_ID_KEY, &id)
                .map_err(|err| DeliveryError(err.to_string()))?;
            *last_id = id;
            id
        };
        let notification = ScheduledNotification::from_request(id.to_string(), request);
        let mut scheduled = self.scheduled.lock();
        scheduled.insert(id, notification);
        if let Err(err) = self.persist(&scheduled) {
            scheduled.remove(&id);
            return Err(err);
        }
        debug!(id, key = %request.reminder_key, fire_at = %request.fire_at, "notification scheduled");
        Ok(id.to_string())
    }

    async fn cancel(&self, id: &str) -> Result<(), DeliveryError> {
        let Ok(numeric) = id.parse::<u64>() else {
            return Ok(());
        };
        let mut scheduled = self.scheduled.lock();
        if let Some(removed) = scheduled.remove(&numeric) {
            if let Err(err) = self.persist(&scheduled) {
                scheduled.insert(numeric, removed);
                return Err(err);
            }
            debug!(id, "notification cancelled");
        }
        Ok(())
    }

    async fn list_scheduled(&self) -> Result<Vec<ScheduledNotification>, DeliveryError> {
        Ok(self.pending())
    }
}

/// Reads server notifications from a JSON document of the form
/// `{ "<user id>": [record, ...] }`, re-read on every fetch.
pub struct JsonFileFeed {
    path: PathBuf,
}

impl JsonFileFeed {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl NotificationFeed for JsonFileFeed {
    async fn fetch(
        &self,
        user_id: &str,
        since: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<NotificationRecord>, FeedError> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .map_err(|err| FeedError(format!("{}: {err}", self.path.display())))?;
        let mut by_user: HashMap<String, Vec<NotificationRecord>> = serde_json::from_str(&raw)
            .map_err(|err| FeedError(format!("{}: {err}", self.path.display())))?;
        let mut records: Vec<NotificationRecord> = by_user
            .remove(user_id)
            .unwrap_or_default()
            .into_iter()
            .filter(|record| record.created_at >= since)
            .collect();
        records.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        records.truncate(limit);
        Ok(records)
    }
}

pub fn build_service(config: &AppConfig) -> Result<(Arc<ReminderService>, Arc<LogDelivery>)> {
    std::fs::create_dir_all(&config.data_dir)
        .with_context(|| format!("creating data directory {}", config.data_dir.display()))?;
    let store_path = config.store_path();
    let kv: Arc<dyn KvStore> = Arc::new(
        FileKvStore::open(&store_path)
            .with_context(|| format!("opening store {}", store_path.display()))?,
    );
    let delivery = Arc::new(LogDelivery::open(Arc::clone(&kv)).context("loading scheduled notifications")?);
    let feed: Arc<dyn NotificationFeed> = match &config.feed_path {
        Some(path) => Arc::new(JsonFileFeed::new(path.clone())),
        None => {
            info!("no feed configured; server notifications disabled");
            Arc::new(InMemoryFeed::new())
        }
    };
    let service = ReminderService::builder()
        .with_config(config.engine.clone())
        .with_kv_store(kv)
        .with_delivery(Arc::clone(&delivery) as Arc<dyn DeliveryApi>)
        .with_feed(feed)
        .build()?;
    Ok((Arc::new(service), delivery))
}

/// Logs due notifications and reports each one to the loop.
pub async fn present_due(
    delivery: Arc<LogDelivery>,
    service: Arc<ReminderService>,
    handle: LoopHandle,
) {
    let zone = service.config().offset();
    let mut interval = tokio::time::interval(PRESENT_EVERY);
    loop {
        tokio::select! {
            _ = handle.stopped() => break,
            _ = interval.tick() => {
                let fired = match delivery.take_due(service.now(), zone) {
                    Ok(fired) => fired,
                    Err(err) => {
                        warn!(%err, "failed to advance scheduled notifications");
                        continue;
                    }
                };
                for notification in fired {
                    info!(
                        id = %notification.id,
                        kind = %notification.record_type,
                        title = %notification.payload.title,
                        body = %notification.payload.body,
                        "notification"
                    );
                    if !handle.send(LoopEvent::Delivered { id: notification.id }).await {
                        return;
                    }
                }
            }
        }
    }
}

pub async fn run(config: AppConfig) -> Result<()> {
    info!(
        config = %serde_json::to_string(&config).unwrap_or_default(),
        "starting reminder daemon"
    );
    let (service, delivery) = build_service(&config)?;
    let (reconciliation, handle) = ReconciliationLoop::new(
        Arc::clone(&service),
        config.user_id.clone(),
        config.loop_config.clone(),
    );
    let loop_task = tokio::spawn(reconciliation.run());
    let presenter = tokio::spawn(present_due(delivery, Arc::clone(&service), handle.clone()));

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutdown requested");
    handle.shutdown();
    loop_task.await.context("reconciliation loop panicked")?;
    presenter.await.context("presenter panicked")?;
    Ok(())
}
