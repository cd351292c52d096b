use std::sync::Arc;

use chrono::{DateTime, Duration, FixedOffset, Utc};
use tracing::{debug, info, warn};

use crate::{
    clock::Clock,
    error::{ScheduleError, StoreError},
    model::{Cadence, Reminder, ReminderKind},
    notifications::{DeliveryApi, DeliveryRequest, Trigger},
    remote::AppointmentStatusLookup,
    store::{ReminderSlot, ReminderStore, StoredReminder},
    time::{next_occurrence, WallTime},
};

/// Seconds granted to appointment reminders whose lead time has already passed.
pub const NEAR_DUE_GRACE_SECS: i64 = 60;

/// Fire instant for an appointment reminder, or `None` if the event is over.
pub fn appointment_fire_time(
    appointment_at: DateTime<Utc>,
    lead_minutes: u32,
    now: DateTime<Utc>,
) -> Option<DateTime<Utc>> {
    if appointment_at <= now {
        return None;
    }
    let fire_at = appointment_at - Duration::minutes(lead_minutes as i64);
    if fire_at <= now {
        Some(now + Duration::seconds(NEAR_DUE_GRACE_SECS))
    } else {
        Some(fire_at)
    }
}

/// Anchor times of each dose of `cadence`, in dose order.
pub fn dose_times(cadence: Cadence, base: WallTime) -> Vec<WallTime> {
    cadence
        .dose_offsets()
        .iter()
        .map(|offset| base.shifted_hours(*offset))
        .collect()
}

pub struct ReminderScheduler {
    store: Arc<ReminderStore>,
    delivery: Arc<dyn DeliveryApi>,
    status: Arc<dyn AppointmentStatusLookup>,
    clock: Arc<dyn Clock>,
    zone: FixedOffset,
}

impl ReminderScheduler {
    pub fn new(
        store: Arc<ReminderStore>,
        delivery: Arc<dyn DeliveryApi>,
        status: Arc<dyn AppointmentStatusLookup>,
        clock: Arc<dyn Clock>,
        zone: FixedOffset,
    ) -> Self {
        Self {
            store,
            delivery,
            status,
            clock,
            zone,
        }
    }

    /// Schedules `reminder` and returns the delivery ids now active for it.
    ///
    /// An equivalent request that is already scheduled returns the stored ids
    /// without touching the delivery api. On error the stored entry and the
    /// previously scheduled notifications are left as they were.
    pub async fn schedule(&self, reminder: &Reminder) -> Result<Vec<String>, ScheduleError> {
        let mut slot = self.store.lock(&reminder.key).await;
        let signature = reminder.signature();
        let existing = slot.current()?;
        if let Some(entry) = &existing {
            if !entry.ids.is_empty() && entry.signature == signature {
                debug!(key = %reminder.key, ids = ?entry.ids, "reminder unchanged; keeping ids");
                return Ok(entry.ids.clone());
            }
        }

        // A cancelled or completed appointment is skipped even when it is also past.
        if reminder.kind == ReminderKind::Appointment && self.appointment_is_stale(&reminder.key).await
        {
            info!(key = %reminder.key, "appointment no longer active; skipping reminder");
            self.release(&mut slot).await?;
            return Ok(Vec::new());
        }

        let now = self.clock.now();
        let requests = self.plan(reminder, now)?;

        let ids = self.submit_all(&reminder.key, &requests).await?;
        let entry = StoredReminder {
            signature,
            ids: ids.clone(),
            scheduled_at: now,
        };
        if let Err(err) = slot.replace(&entry) {
            self.cancel_ids(&reminder.key, &ids).await;
            return Err(err.into());
        }
        if let Some(previous) = existing {
            self.cancel_ids(&reminder.key, &previous.ids).await;
        }
        info!(
            key = %reminder.key,
            kind = %reminder.kind,
            cadence = %reminder.cadence,
            count = ids.len(),
            "scheduled reminder"
        );
        Ok(ids)
    }

    /// Cancels everything stored for `key` and forgets it.
    ///
    /// Delivery failures are logged and ignored; only a failure to clear the
    /// local entry is returned.
    pub async fn cancel(&self, key: &str) -> Result<(), StoreError> {
        let mut slot = self.store.lock(key).await;
        self.release(&mut slot).await?;
        info!(key, "cancelled reminder");
        Ok(())
    }

    /// Delivery requests for each dose, without side effects.
    pub fn plan(&self, reminder: &Reminder, now: DateTime<Utc>) -> Result<Vec<DeliveryRequest>, ScheduleError> {
        let request = |ordinal: u8, trigger: Trigger, fire_at: DateTime<Utc>| DeliveryRequest {
            reminder_key: reminder.key.clone(),
            ordinal,
            record_type: reminder.kind.record_type().to_string(),
            trigger,
            fire_at,
            payload: reminder.payload.clone(),
        };

        if let (ReminderKind::Appointment, Some(at)) = (reminder.kind, reminder.appointment_at) {
            let fire_at = appointment_fire_time(at, reminder.lead_minutes, now).ok_or_else(|| {
                ScheduleError::PastEvent {
                    key: reminder.key.clone(),
                    at,
                }
            })?;
            return Ok(vec![request(0, Trigger::At(fire_at), fire_at)]);
        }

        let local_now = now.with_timezone(&self.zone);
        let first_fire = |time: WallTime| next_occurrence(&local_now, time).with_timezone(&Utc);
        let requests = if reminder.cadence.is_recurring() {
            dose_times(reminder.cadence, reminder.base_time)
                .into_iter()
                .enumerate()
                .map(|(ordinal, time)| request(ordinal as u8, Trigger::Daily(time), first_fire(time)))
                .collect()
        } else {
            let fire_at = first_fire(reminder.base_time);
            vec![request(0, Trigger::At(fire_at), fire_at)]
        };
        Ok(requests)
    }

    async fn appointment_is_stale(&self, appointment_id: &str) -> bool {
        match self.status.appointment_status(appointment_id).await {
            Ok(status) => status.is_stale(),
            Err(err) => {
                warn!(key = appointment_id, %err, "status lookup failed; scheduling anyway");
                false
            }
        }
    }

    async fn submit_all(
        &self,
        key: &str,
        requests: &[DeliveryRequest],
    ) -> Result<Vec<String>, ScheduleError> {
        let mut ids = Vec::with_capacity(requests.len());
        for request in requests {
            match self.delivery.schedule_at(request).await {
                Ok(id) => {
                    debug!(key, %id, ordinal = request.ordinal, fire_at = %request.fire_at, "submitted");
                    ids.push(id);
                }
                Err(source) => {
                    self.cancel_ids(key, &ids).await;
                    return Err(ScheduleError::DeliveryUnavailable {
                        key: key.to_string(),
                        source,
                    });
                }
            }
        }
        Ok(ids)
    }

    async fn release(&self, slot: &mut ReminderSlot<'_>) -> Result<(), StoreError> {
        let previous = match slot.current() {
            Ok(entry) => entry,
            Err(err) => {
                warn!(key = slot.key(), %err, "unreadable reminder entry; clearing");
                None
            }
        };
        if let Some(entry) = previous {
            self.cancel_ids(slot.key(), &entry.ids).await;
        }
        slot.clear()
    }

    async fn cancel_ids(&self, key: &str, ids: &[String]) {
        for id in ids {
            if let Err(err) = self.delivery.cancel(id).await {
                warn!(key, %id, %err, "best-effort cancel failed");
            }
        }
    }
}
