use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use reminder_domain::{model::NotificationRecord, ReminderService, SourceStatus};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoopConfig {
    pub tick_secs: u64,
    pub event_buffer: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            tick_secs: 30,
            event_buffer: 64,
        }
    }
}

impl LoopConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads overrides through `lookup`; unparseable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(raw) = lookup("REMINDER_TICK_SECS") {
            match raw.trim().parse::<u64>() {
                Ok(secs) if secs > 0 => config.tick_secs = secs,
                _ => warn!(value = %raw, "ignoring REMINDER_TICK_SECS"),
            }
        }
        config
    }

    pub fn tick(&self) -> Duration {
        Duration::from_secs(self.tick_secs.max(1))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopState {
    Idle,
    Reconciling,
}

/// Inbound signals from the platform notification layer and the UI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoopEvent {
    /// Explicit user refresh.
    Refresh,
    /// The OS presented a locally scheduled notification.
    Delivered { id: String },
    /// The user opened a notification.
    Opened { id: String },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TickReport {
    pub status: SourceStatus,
    pub records: usize,
    pub alerts_forwarded: Vec<String>,
}

/// Cloneable handle for feeding events to a running loop and stopping it.
#[derive(Debug, Clone)]
pub struct LoopHandle {
    events: mpsc::Sender<LoopEvent>,
    cancel: CancellationToken,
}

impl LoopHandle {
    /// Returns false once the loop has stopped.
    pub async fn send(&self, event: LoopEvent) -> bool {
        self.events.send(event).await.is_ok()
    }

    pub async fn refresh(&self) -> bool {
        self.send(LoopEvent::Refresh).await
    }

    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    pub fn is_shut_down(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Resolves once shutdown has been requested.
    pub async fn stopped(&self) {
        self.cancel.cancelled().await
    }
}

/// Periodically merges the remote feed with the device schedule for one user.
///
/// Failures never leave the loop: the service keeps serving the last merged
/// view and the next tick tries again.
pub struct ReconciliationLoop {
    service: Arc<ReminderService>,
    user_id: String,
    config: LoopConfig,
    state: LoopState,
    events: mpsc::Receiver<LoopEvent>,
    cancel: CancellationToken,
    pending_alerts: Vec<NotificationRecord>,
    forwarded: HashSet<String>,
}

impl ReconciliationLoop {
    pub fn new(
        service: Arc<ReminderService>,
        user_id: impl Into<String>,
        config: LoopConfig,
    ) -> (Self, LoopHandle) {
        let (tx, rx) = mpsc::channel(config.event_buffer.max(1));
        let cancel = CancellationToken::new();
        let handle = LoopHandle {
            events: tx,
            cancel: cancel.clone(),
        };
        let reconciliation = Self {
            service,
            user_id: user_id.into(),
            config,
            state: LoopState::Idle,
            events: rx,
            cancel,
            pending_alerts: Vec::new(),
            forwarded: HashSet::new(),
        };
        (reconciliation, handle)
    }

    pub fn state(&self) -> LoopState {
        self.state
    }

    pub fn user_id(&self) -> &str {
        &self.user_id
    }

    #[instrument(skip(self), fields(user_id = %self.user_id))]
    pub async fn tick(&mut self) -> TickReport {
        self.state = LoopState::Reconciling;
        let report = match self.service.try_reconcile(&self.user_id).await {
            Ok(outcome) => {
                self.forget_departed(&outcome.records);
                self.queue_urgent(outcome.newly_observed);
                let alerts_forwarded = self.forward_pending().await;
                TickReport {
                    status: SourceStatus::Connected,
                    records: outcome.records.len(),
                    alerts_forwarded,
                }
            }
            Err(err) => {
                warn!(%err, "reconciliation failed; keeping last merged view");
                TickReport {
                    status: self.service.source_status(),
                    records: 0,
                    alerts_forwarded: Vec::new(),
                }
            }
        };
        self.state = LoopState::Idle;
        debug!(status = ?report.status, records = report.records, "tick finished");
        report
    }

    pub async fn handle_event(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Refresh => {
                self.tick().await;
            }
            LoopEvent::Delivered { id } => {
                debug!(%id, "local notification delivered");
                self.tick().await;
            }
            LoopEvent::Opened { id } => match self.service.mark_read(&self.user_id, &id) {
                Ok(true) => debug!(%id, "marked read"),
                Ok(false) => debug!(%id, "opened notification not in merged view"),
                Err(err) => warn!(%id, %err, "failed to mark notification read"),
            },
        }
    }

    /// Runs until the handle requests shutdown.
    pub async fn run(mut self) {
        let mut interval = tokio::time::interval(self.config.tick());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(user_id = %self.user_id, every = ?self.config.tick(), "reconciliation loop started");
        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
                Some(event) = self.events.recv() => {
                    self.handle_event(event).await;
                }
            }
        }
        info!(user_id = %self.user_id, "reconciliation loop stopped");
    }

    /// Number of urgent ids remembered as forwarded or awaiting a retry.
    pub fn tracked_alerts(&self) -> usize {
        self.forwarded.len() + self.pending_alerts.len()
    }

    /// Drops alert bookkeeping for records that left the merged view.
    fn forget_departed(&mut self, records: &[NotificationRecord]) {
        let present: HashSet<&str> = records.iter().map(|record| record.id.as_str()).collect();
        self.forwarded.retain(|id| present.contains(id.as_str()));
        self.pending_alerts
            .retain(|record| present.contains(record.id.as_str()));
    }

    fn queue_urgent(&mut self, newly_observed: Vec<NotificationRecord>) {
        let config = self.service.config();
        for record in newly_observed {
            if record.is_read || !config.is_urgent(&record.kind) {
                continue;
            }
            if self.forwarded.contains(&record.id)
                || self.pending_alerts.iter().any(|pending| pending.id == record.id)
            {
                continue;
            }
            self.pending_alerts.push(record);
        }
    }

    async fn forward_pending(&mut self) -> Vec<String> {
        let mut forwarded = Vec::new();
        let mut retry = Vec::new();
        for record in std::mem::take(&mut self.pending_alerts) {
            match self.service.forward_alert(&record).await {
                Ok(delivery_id) => {
                    info!(id = %record.id, %delivery_id, kind = %record.kind, "forwarded urgent notification");
                    self.forwarded.insert(record.id.clone());
                    forwarded.push(record.id);
                }
                Err(err) => {
                    warn!(id = %record.id, %err, "urgent alert not delivered; will retry");
                    retry.push(record);
                }
            }
        }
        self.pending_alerts = retry;
        forwarded
    }
}
