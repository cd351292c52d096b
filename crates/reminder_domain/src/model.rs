use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::time::WallTime;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ReminderKind {
    Appointment,
    Medicine,
}

impl ReminderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Appointment => "appointment",
            Self::Medicine => "medicine",
        }
    }

    /// `type` carried by records derived from this kind of reminder.
    pub fn record_type(&self) -> &'static str {
        match self {
            Self::Appointment => "appointment_reminder",
            Self::Medicine => "medicine_reminder",
        }
    }
}

impl fmt::Display for ReminderKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Cadence {
    Once,
    Daily,
    TwiceDaily,
    ThriceDaily,
    Custom,
}

impl Cadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Once => "once",
            Self::Daily => "daily",
            Self::TwiceDaily => "twice_daily",
            Self::ThriceDaily => "thrice_daily",
            Self::Custom => "custom",
        }
    }

    /// Whether doses are delivered through a recurring daily trigger.
    pub fn is_recurring(&self) -> bool {
        matches!(self, Self::Daily | Self::TwiceDaily | Self::ThriceDaily)
    }

    /// Hour offsets of each dose from the anchor time.
    pub fn dose_offsets(&self) -> &'static [u8] {
        match self {
            Self::Once | Self::Custom | Self::Daily => &[0],
            Self::TwiceDaily => &[0, 12],
            Self::ThriceDaily => &[0, 6, 12],
        }
    }
}

impl FromStr for Cadence {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "once" => Ok(Self::Once),
            "daily" => Ok(Self::Daily),
            "twice_daily" => Ok(Self::TwiceDaily),
            "thrice_daily" => Ok(Self::ThriceDaily),
            "custom" => Ok(Self::Custom),
            other => Err(format!("unknown cadence: {other}")),
        }
    }
}

impl fmt::Display for Cadence {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Display content handed through to the delivery layer untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ReminderPayload {
    pub title: String,
    pub body: String,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub data: Map<String, Value>,
}

impl ReminderPayload {
    pub fn new(title: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            body: body.into(),
            data: Map::new(),
        }
    }

    pub fn with_data(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.data.insert(key.into(), value.into());
        self
    }
}

/// A logical request to be reminded about one entity.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Reminder {
    pub key: String,
    pub kind: ReminderKind,
    pub cadence: Cadence,
    pub base_time: WallTime,
    /// Event instant; only set for appointments.
    pub appointment_at: Option<DateTime<Utc>>,
    pub lead_minutes: u32,
    pub payload: ReminderPayload,
}

impl Reminder {
    pub fn appointment(
        key: impl Into<String>,
        appointment_at: DateTime<Utc>,
        lead_minutes: u32,
        payload: ReminderPayload,
    ) -> Self {
        Self {
            key: key.into(),
            kind: ReminderKind::Appointment,
            cadence: Cadence::Once,
            base_time: WallTime::from_naive(appointment_at.time()),
            appointment_at: Some(appointment_at),
            lead_minutes,
            payload,
        }
    }

    pub fn medicine(
        key: impl Into<String>,
        cadence: Cadence,
        base_time: WallTime,
        payload: ReminderPayload,
    ) -> Self {
        Self {
            key: key.into(),
            kind: ReminderKind::Medicine,
            cadence,
            base_time,
            appointment_at: None,
            lead_minutes: 0,
            payload,
        }
    }

    /// Everything that decides whether two requests would schedule the same thing.
    pub fn signature(&self) -> ReminderSignature {
        ReminderSignature {
            kind: self.kind,
            cadence: self.cadence,
            base_time: self.base_time,
            appointment_at: self.appointment_at,
            lead_minutes: self.lead_minutes,
            payload: self.payload.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReminderSignature {
    pub kind: ReminderKind,
    pub cadence: Cadence,
    pub base_time: WallTime,
    #[serde(default)]
    pub appointment_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub lead_minutes: u32,
    pub payload: ReminderPayload,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum AppointmentStatus {
    Pending,
    Confirmed,
    Rescheduled,
    Cancelled,
    Completed,
}

impl AppointmentStatus {
    /// Cancelled and completed appointments must not carry reminders.
    pub fn is_stale(&self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed)
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    Local,
    Server,
}

/// One item of the merged notification view.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct NotificationRecord {
    pub id: String,
    pub title: String,
    pub body: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub read_at: Option<DateTime<Utc>>,
    pub origin: Origin,
}

impl NotificationRecord {
    pub fn server(
        id: impl Into<String>,
        kind: impl Into<String>,
        title: impl Into<String>,
        body: impl Into<String>,
        created_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            body: body.into(),
            kind: kind.into(),
            created_at,
            is_read: false,
            read_at: None,
            origin: Origin::Server,
        }
    }

    /// Marks the record read once; a later call keeps the first `read_at`.
    pub fn mark_read(&mut self, at: DateTime<Utc>) -> bool {
        if self.is_read {
            return false;
        }
        self.is_read = true;
        self.read_at = Some(at);
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn cadence_round_trips_through_text() {
        for cadence in [
            Cadence::Once,
            Cadence::Daily,
            Cadence::TwiceDaily,
            Cadence::ThriceDaily,
            Cadence::Custom,
        ] {
            assert_eq!(cadence.to_string().parse::<Cadence>(), Ok(cadence));
        }
        assert!("hourly".parse::<Cadence>().is_err());
    }

    #[test]
    fn dose_offsets_match_cadence() {
        assert_eq!(Cadence::Daily.dose_offsets(), &[0]);
        assert_eq!(Cadence::TwiceDaily.dose_offsets(), &[0, 12]);
        assert_eq!(Cadence::ThriceDaily.dose_offsets(), &[0, 6, 12]);
        assert!(!Cadence::Custom.is_recurring());
    }

    #[test]
    fn rescheduled_appointment_changes_signature() {
        let payload = ReminderPayload::new("Dentist", "Checkup");
        let first = Reminder::appointment(
            "apt1",
            Utc.with_ymd_and_hms(2024, 1, 10, 10, 0, 0).unwrap(),
            60,
            payload.clone(),
        );
        let moved = Reminder::appointment(
            "apt1",
            Utc.with_ymd_and_hms(2024, 1, 11, 10, 0, 0).unwrap(),
            60,
            payload,
        );
        assert_eq!(first.base_time, moved.base_time);
        assert_ne!(first.signature(), moved.signature());
    }

    #[test]
    fn record_serializes_type_field() {
        let record = NotificationRecord::server(
            "n1",
            "appointment_cancelled",
            "Cancelled",
            "Your visit was cancelled",
            Utc.with_ymd_and_hms(2024, 1, 10, 8, 0, 0).unwrap(),
        );
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["type"], "appointment_cancelled");
        assert_eq!(json["isRead"], false);
        assert_eq!(json["origin"], "server");
    }

    #[test]
    fn mark_read_keeps_first_timestamp() {
        let mut record = NotificationRecord::server(
            "n1",
            "general",
            "t",
            "b",
            Utc.with_ymd_and_hms(2024, 1, 10, 8, 0, 0).unwrap(),
        );
        let first = Utc.with_ymd_and_hms(2024, 1, 10, 9, 0, 0).unwrap();
        assert!(record.mark_read(first));
        assert!(!record.mark_read(first + chrono::Duration::hours(1)));
        assert_eq!(record.read_at, Some(first));
    }
}
