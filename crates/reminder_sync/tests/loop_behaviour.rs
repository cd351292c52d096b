use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use reminder_domain::{
    clock::ManualClock,
    error::StoreError,
    kv::{KvStore, MemoryKvStore},
    memory::{InMemoryDelivery, InMemoryFeed},
    model::{Cadence, NotificationRecord, ReminderPayload},
    notifications::Trigger,
    time::WallTime,
    ReminderService, SourceStatus,
};
use reminder_sync::{LoopConfig, LoopEvent, LoopState, ReconciliationLoop};

struct Fixture {
    service: Arc<ReminderService>,
    delivery: Arc<InMemoryDelivery>,
    feed: Arc<InMemoryFeed>,
    clock: Arc<ManualClock>,
}

/// Reads as empty and refuses every write.
struct ReadOnlyKv;

impl KvStore for ReadOnlyKv {
    fn get(&self, _key: &str) -> Result<Option<String>, StoreError> {
        Ok(None)
    }

    fn set(&self, _key: &str, _value: String) -> Result<(), StoreError> {
        Err(StoreError::Io {
            path: "read-only".into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "read-only store"),
        })
    }

    fn delete(&self, _key: &str) -> Result<(), StoreError> {
        Ok(())
    }
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 1, 10, 8, 0, 0).unwrap()
}

fn fixture_with(kv: Arc<dyn KvStore>) -> Fixture {
    let delivery = Arc::new(InMemoryDelivery::new());
    let feed = Arc::new(InMemoryFeed::new());
    let clock = Arc::new(ManualClock::new(now()));
    let service = ReminderService::builder()
        .with_kv_store(kv)
        .with_delivery(delivery.clone())
        .with_feed(feed.clone())
        .with_clock(clock.clone())
        .build()
        .expect("build reminder service");
    Fixture {
        service: Arc::new(service),
        delivery,
        feed,
        clock,
    }
}

fn fixture() -> Fixture {
    fixture_with(Arc::new(MemoryKvStore::new()))
}

fn cancellation(id: &str) -> NotificationRecord {
    NotificationRecord::server(
        id,
        "appointment_cancelled",
        "Appointment cancelled",
        "Your 10:00 visit was cancelled",
        now() - chrono::Duration::minutes(5),
    )
}

#[tokio::test]
async fn tick_merges_sources_and_returns_to_idle() {
    let fx = fixture();
    fx.service
        .schedule_medicine_reminder(
            "med1",
            Cadence::Daily,
            WallTime::new(9, 0).unwrap(),
            ReminderPayload::new("Iron", "One capsule"),
        )
        .await
        .expect("schedule");
    fx.feed.push(
        "u1",
        NotificationRecord::server("srv-1", "general", "Welcome", "", now()),
    );

    let (mut reconciliation, _handle) =
        ReconciliationLoop::new(fx.service.clone(), "u1", LoopConfig::default());
    let report = reconciliation.tick().await;

    assert_eq!(report.status, SourceStatus::Connected);
    assert_eq!(report.records, 2);
    assert_eq!(reconciliation.state(), LoopState::Idle);
    assert_eq!(fx.service.notifications("u1").unwrap().len(), 2);
}

#[tokio::test]
async fn outage_keeps_last_view_and_recovers() {
    let fx = fixture();
    fx.feed.push(
        "u1",
        NotificationRecord::server("srv-1", "general", "Welcome", "", now()),
    );
    let (mut reconciliation, _handle) =
        ReconciliationLoop::new(fx.service.clone(), "u1", LoopConfig::default());
    reconciliation.tick().await;
    let good = fx.service.notifications("u1").unwrap();

    fx.feed.set_unavailable(true);
    let report = reconciliation.tick().await;
    assert_eq!(report.status, SourceStatus::Disconnected);
    assert_eq!(reconciliation.state(), LoopState::Idle);
    assert_eq!(fx.service.source_status(), SourceStatus::Disconnected);
    assert_eq!(fx.service.notifications("u1").unwrap(), good);

    fx.feed.set_unavailable(false);
    let report = reconciliation.tick().await;
    assert_eq!(report.status, SourceStatus::Connected);
    assert_eq!(fx.service.source_status(), SourceStatus::Connected);
}

#[tokio::test]
async fn urgent_records_are_forwarded_once() {
    let fx = fixture();
    fx.feed.push("u1", cancellation("srv-9"));
    let (mut reconciliation, _handle) =
        ReconciliationLoop::new(fx.service.clone(), "u1", LoopConfig::default());

    let first = reconciliation.tick().await;
    assert_eq!(first.alerts_forwarded, vec!["srv-9".to_string()]);
    let alerts = fx.delivery.scheduled();
    assert_eq!(alerts.len(), 1);
    assert_eq!(alerts[0].reminder_key, "alert:srv-9");
    assert_eq!(alerts[0].trigger, Trigger::At(now()));

    let second = reconciliation.tick().await;
    assert!(second.alerts_forwarded.is_empty());
    assert_eq!(fx.delivery.submissions(), 1);
    // the alert itself does not show up as a second local record
    assert_eq!(second.records, 1);
}

#[tokio::test]
async fn forwarded_ids_are_forgotten_once_out_of_window() {
    let fx = fixture();
    fx.feed.push("u1", cancellation("srv-9"));
    let (mut reconciliation, _handle) =
        ReconciliationLoop::new(fx.service.clone(), "u1", LoopConfig::default());

    reconciliation.tick().await;
    assert_eq!(reconciliation.tracked_alerts(), 1);

    fx.clock.advance(chrono::Duration::hours(73));
    let report = reconciliation.tick().await;
    assert_eq!(report.records, 0);
    assert_eq!(reconciliation.tracked_alerts(), 0);
    assert!(report.alerts_forwarded.is_empty());
    assert_eq!(fx.delivery.submissions(), 1);
}

#[tokio::test]
async fn store_failure_reports_the_service_status() {
    let fx = fixture_with(Arc::new(ReadOnlyKv));
    fx.feed.push(
        "u1",
        NotificationRecord::server("srv-1", "general", "Welcome", "", now()),
    );
    let (mut reconciliation, _handle) =
        ReconciliationLoop::new(fx.service.clone(), "u1", LoopConfig::default());

    let report = reconciliation.tick().await;
    assert_eq!(report.status, SourceStatus::Unknown);
    assert_eq!(report.status, fx.service.source_status());
    assert_eq!(reconciliation.state(), LoopState::Idle);
}

#[tokio::test]
async fn already_read_or_routine_records_are_not_forwarded() {
    let fx = fixture();
    let mut read = cancellation("srv-1");
    read.mark_read(now());
    fx.feed.push("u1", read);
    fx.feed.push(
        "u1",
        NotificationRecord::server("srv-2", "appointment_confirmed", "Confirmed", "", now()),
    );
    let (mut reconciliation, _handle) =
        ReconciliationLoop::new(fx.service.clone(), "u1", LoopConfig::default());
    let report = reconciliation.tick().await;
    assert!(report.alerts_forwarded.is_empty());
    assert_eq!(fx.delivery.submissions(), 0);
}

#[tokio::test]
async fn failed_alert_is_retried_next_tick() {
    let fx = fixture();
    fx.feed.push("u1", cancellation("srv-9"));
    fx.delivery.fail_after(0);
    let (mut reconciliation, _handle) =
        ReconciliationLoop::new(fx.service.clone(), "u1", LoopConfig::default());

    let first = reconciliation.tick().await;
    assert_eq!(first.status, SourceStatus::Connected);
    assert!(first.alerts_forwarded.is_empty());

    let second = reconciliation.tick().await;
    assert_eq!(second.alerts_forwarded, vec!["srv-9".to_string()]);
}

#[tokio::test]
async fn opened_event_marks_record_read() {
    let fx = fixture();
    fx.feed.push(
        "u1",
        NotificationRecord::server("srv-1", "general", "Welcome", "", now()),
    );
    let (mut reconciliation, _handle) =
        ReconciliationLoop::new(fx.service.clone(), "u1", LoopConfig::default());
    reconciliation.tick().await;

    reconciliation
        .handle_event(LoopEvent::Opened { id: "srv-1".into() })
        .await;
    assert_eq!(fx.service.unread_count("u1").unwrap(), 0);

    // a refetch reporting it unread does not undo the read mark
    reconciliation.handle_event(LoopEvent::Refresh).await;
    assert_eq!(fx.service.unread_count("u1").unwrap(), 0);
}

#[tokio::test(start_paused = true)]
async fn run_ticks_on_interval_and_on_demand_until_shutdown() {
    let fx = fixture();
    let (reconciliation, handle) =
        ReconciliationLoop::new(fx.service.clone(), "u1", LoopConfig::default());
    let task = tokio::spawn(reconciliation.run());

    tokio::time::sleep(Duration::from_millis(10)).await;
    let after_start = fx.feed.fetches();
    assert_eq!(after_start, 1, "first tick fires immediately");

    assert!(handle.refresh().await);
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert_eq!(fx.feed.fetches(), 2);

    tokio::time::sleep(Duration::from_secs(31)).await;
    assert_eq!(fx.feed.fetches(), 3);

    handle.shutdown();
    task.await.expect("loop task");
    assert!(handle.is_shut_down());
    assert!(!handle.refresh().await);
}
