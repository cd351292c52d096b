use std::time::Duration;

use anyhow::Result;
use chrono::{FixedOffset, Offset, Utc};
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::time::{parse_time, WallTime, DEFAULT_TIME};

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EngineConfig {
    /// Zone the wall-clock times of medicine reminders are read in.
    pub utc_offset_minutes: i32,
    pub default_time: WallTime,
    pub fetch_window_hours: u32,
    pub fetch_limit: usize,
    pub fetch_timeout_secs: u64,
    /// Server record types forwarded as immediate alerts.
    pub urgent_types: Vec<String>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            utc_offset_minutes: 0,
            default_time: DEFAULT_TIME,
            fetch_window_hours: 72,
            fetch_limit: 50,
            fetch_timeout_secs: 10,
            urgent_types: vec![
                "appointment_cancelled".to_string(),
                "appointment_rescheduled".to_string(),
            ],
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Reads overrides through `lookup`; unparseable values keep the default.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let mut config = Self::default();
        if let Some(minutes) = parsed::<i32>(&lookup, "REMINDER_UTC_OFFSET_MINUTES") {
            if zone_for(minutes).is_some() {
                config.utc_offset_minutes = minutes;
            } else {
                warn!(minutes, "ignoring out-of-range utc offset");
            }
        }
        if let Some(text) = lookup("REMINDER_DEFAULT_TIME") {
            match parse_time(&text) {
                Ok(time) => config.default_time = time,
                Err(err) => warn!(%err, "ignoring REMINDER_DEFAULT_TIME"),
            }
        }
        if let Some(hours) = parsed::<u32>(&lookup, "REMINDER_FETCH_WINDOW_HOURS") {
            config.fetch_window_hours = hours.max(1);
        }
        if let Some(limit) = parsed::<usize>(&lookup, "REMINDER_FETCH_LIMIT") {
            config.fetch_limit = limit.max(1);
        }
        if let Some(secs) = parsed::<u64>(&lookup, "REMINDER_FETCH_TIMEOUT_SECS") {
            config.fetch_timeout_secs = secs.max(1);
        }
        if let Some(list) = lookup("REMINDER_URGENT_TYPES") {
            config.urgent_types = list
                .split(',')
                .map(|item| item.trim().to_string())
                .filter(|item| !item.is_empty())
                .collect();
        }
        Ok(config)
    }

    pub fn offset(&self) -> FixedOffset {
        zone_for(self.utc_offset_minutes).unwrap_or_else(|| Utc.fix())
    }

    pub fn fetch_window(&self) -> chrono::Duration {
        chrono::Duration::hours(self.fetch_window_hours as i64)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_secs(self.fetch_timeout_secs)
    }

    pub fn is_urgent(&self, record_type: &str) -> bool {
        self.urgent_types.iter().any(|urgent| urgent == record_type)
    }
}

fn zone_for(minutes: i32) -> Option<FixedOffset> {
    minutes.checked_mul(60).and_then(FixedOffset::east_opt)
}

fn parsed<T: std::str::FromStr>(lookup: &impl Fn(&str) -> Option<String>, name: &str) -> Option<T> {
    let raw = lookup(name)?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            warn!(name, value = %raw, "ignoring unparseable setting");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| map.get(name).cloned()
    }

    #[test]
    fn overrides_apply_and_garbage_is_ignored() {
        let config = EngineConfig::from_lookup(lookup(&[
            ("REMINDER_UTC_OFFSET_MINUTES", "180"),
            ("REMINDER_DEFAULT_TIME", "07:30"),
            ("REMINDER_FETCH_LIMIT", "many"),
            ("REMINDER_URGENT_TYPES", "appointment_cancelled, lab_ready ,"),
        ]))
        .unwrap();
        assert_eq!(config.offset(), FixedOffset::east_opt(3 * 3600).unwrap());
        assert_eq!(config.default_time, WallTime::new(7, 30).unwrap());
        assert_eq!(config.fetch_limit, 50);
        assert!(config.is_urgent("lab_ready"));
        assert!(!config.is_urgent("appointment_rescheduled"));
    }

    #[test]
    fn out_of_range_offset_keeps_utc() {
        let config =
            EngineConfig::from_lookup(lookup(&[("REMINDER_UTC_OFFSET_MINUTES", "100000")])).unwrap();
        assert_eq!(config.utc_offset_minutes, 0);
    }
}
