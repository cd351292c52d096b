use std::fmt;

use chrono::{DateTime, Duration, NaiveDate, NaiveTime, TimeZone, Timelike};
use serde::{Deserialize, Serialize};

use crate::error::TimeError;

/// Wall-clock hour and minute, independent of any date or zone.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct WallTime {
    hour: u8,
    minute: u8,
}

impl WallTime {
    pub const fn new(hour: u8, minute: u8) -> Option<Self> {
        if hour < 24 && minute < 60 {
            Some(Self { hour, minute })
        } else {
            None
        }
    }

    /// Clamps out-of-range parts instead of rejecting them.
    pub fn clamped(hour: u32, minute: u32) -> Self {
        Self {
            hour: hour.min(23) as u8,
            minute: minute.min(59) as u8,
        }
    }

    pub const fn hour(&self) -> u8 {
        self.hour
    }

    pub const fn minute(&self) -> u8 {
        self.minute
    }

    /// Same minute, `hours` later on the 24-hour dial.
    pub fn shifted_hours(&self, hours: u8) -> Self {
        Self {
            hour: ((self.hour as u32 + hours as u32) % 24) as u8,
            minute: self.minute,
        }
    }

    pub fn from_naive(time: NaiveTime) -> Self {
        Self::clamped(time.hour(), time.minute())
    }

    pub fn to_naive(self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour as u32, self.minute as u32, 0).unwrap_or(NaiveTime::MIN)
    }
}

impl Default for WallTime {
    fn default() -> Self {
        DEFAULT_TIME
    }
}

impl fmt::Display for WallTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

pub const DEFAULT_TIME: WallTime = WallTime { hour: 9, minute: 0 };

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Meridiem {
    Ante,
    Post,
}

const MERIDIEM_TOKENS: &[(&str, Meridiem)] = &[
    ("a.m.", Meridiem::Ante),
    ("p.m.", Meridiem::Post),
    ("a.m", Meridiem::Ante),
    ("p.m", Meridiem::Post),
    ("am", Meridiem::Ante),
    ("pm", Meridiem::Post),
    ("ق.ظ", Meridiem::Ante),
    ("ب.ظ", Meridiem::Post),
    ("ص", Meridiem::Ante),
    ("م", Meridiem::Post),
    ("午前", Meridiem::Ante),
    ("午後", Meridiem::Post),
    ("오전", Meridiem::Ante),
    ("오후", Meridiem::Post),
];

/// Parses `H:MM` / `HH:MM` text written in any common digit script.
///
/// Whitespace, bidi marks and AM/PM markers are removed before the strict
/// pattern check. A PM marker moves hours 1..=11 into the afternoon and an AM
/// marker maps 12 to midnight. Out-of-range parts are clamped.
pub fn parse_time(text: &str) -> Result<WallTime, TimeError> {
    let invalid = || TimeError::InvalidTime(text.to_string());
    let normalized = normalize(text);
    let (bare, meridiem) = strip_meridiem(&normalized);
    let (hour_part, minute_part) = bare.split_once(':').ok_or_else(invalid)?;

    if !(1..=2).contains(&hour_part.len()) || minute_part.len() != 2 {
        return Err(invalid());
    }
    if !hour_part.bytes().chain(minute_part.bytes()).all(|b| b.is_ascii_digit()) {
        return Err(invalid());
    }
    let mut hour: u32 = hour_part.parse().map_err(|_| invalid())?;
    let minute: u32 = minute_part.parse().map_err(|_| invalid())?;

    match meridiem {
        Some(Meridiem::Post) if (1..12).contains(&hour) => hour += 12,
        Some(Meridiem::Ante) if hour == 12 => hour = 0,
        _ => {}
    }
    Ok(WallTime::clamped(hour, minute))
}

/// Like [`parse_time`] but falls back to `fallback` on invalid input.
pub fn parse_time_or(text: &str, fallback: WallTime) -> WallTime {
    match parse_time(text) {
        Ok(time) => time,
        Err(err) => {
            tracing::warn!(%err, %fallback, "using fallback reminder time");
            fallback
        }
    }
}

pub fn parse_time_or_default(text: &str) -> WallTime {
    parse_time_or(text, DEFAULT_TIME)
}

/// The first instant strictly after `now` at which the wall clock in `now`'s
/// zone reads `time`.
pub fn next_occurrence<Tz: TimeZone>(now: &DateTime<Tz>, time: WallTime) -> DateTime<Tz> {
    let zone = now.timezone();
    let today = now.date_naive();
    let candidate = at_wall_time(&zone, today, time);
    if candidate > *now {
        return candidate;
    }
    match today.succ_opt() {
        Some(tomorrow) => at_wall_time(&zone, tomorrow, time),
        None => candidate + Duration::days(1),
    }
}

fn at_wall_time<Tz: TimeZone>(zone: &Tz, date: NaiveDate, time: WallTime) -> DateTime<Tz> {
    let naive = date.and_time(time.to_naive());
    match zone.from_local_datetime(&naive).earliest() {
        Some(instant) => instant,
        // Skipped by a forward transition; fire at the first valid minute after.
        None => zone
            .from_local_datetime(&(naive + Duration::hours(1)))
            .earliest()
            .unwrap_or_else(|| zone.from_utc_datetime(&naive)),
    }
}

fn normalize(text: &str) -> String {
    text.chars()
        .filter(|c| !c.is_whitespace() && !is_direction_mark(*c))
        .map(|c| match ascii_digit(c) {
            Some(digit) => digit,
            None if c == '：' || c == '∶' => ':',
            None => c,
        })
        .flat_map(char::to_lowercase)
        .collect()
}

fn strip_meridiem(text: &str) -> (&str, Option<Meridiem>) {
    for (token, meridiem) in MERIDIEM_TOKENS {
        if let Some(rest) = text.strip_suffix(token) {
            return (rest, Some(*meridiem));
        }
        if let Some(rest) = text.strip_prefix(token) {
            return (rest, Some(*meridiem));
        }
    }
    (text, None)
}

fn is_direction_mark(c: char) -> bool {
    matches!(
        c,
        '\u{200E}' | '\u{200F}' | '\u{061C}' | '\u{202A}'..='\u{202E}' | '\u{2066}'..='\u{2069}'
    )
}

fn ascii_digit(c: char) -> Option<char> {
    const ZEROES: &[u32] = &[
        0x0660, // Arabic-Indic
        0x06F0, // Extended Arabic-Indic
        0x0966, // Devanagari
        0x09E6, // Bengali
        0x0E50, // Thai
        0xFF10, // Fullwidth
    ];
    let code = c as u32;
    ZEROES
        .iter()
        .find(|zero| (**zero..**zero + 10).contains(&code))
        .and_then(|zero| char::from_digit(code - zero, 10))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{FixedOffset, Utc};

    fn wall(hour: u8, minute: u8) -> WallTime {
        WallTime::new(hour, minute).unwrap()
    }

    #[test]
    fn parses_plain_and_padded_times() {
        assert_eq!(parse_time("8:30").unwrap(), wall(8, 30));
        assert_eq!(parse_time(" 08:05 ").unwrap(), wall(8, 5));
        assert_eq!(parse_time("23:59").unwrap(), wall(23, 59));
    }

    #[test]
    fn normalizes_digit_scripts_and_marks() {
        assert_eq!(parse_time("٠٨:٣٠").unwrap(), wall(8, 30));
        assert_eq!(parse_time("۱۴:۰۰").unwrap(), wall(14, 0));
        assert_eq!(parse_time("\u{200F}٩:١٥\u{200F}").unwrap(), wall(9, 15));
        assert_eq!(parse_time("０７：４５").unwrap(), wall(7, 45));
    }

    #[test]
    fn strips_meridiem_markers() {
        assert_eq!(parse_time("8:00 PM").unwrap(), wall(20, 0));
        assert_eq!(parse_time("8:00pm").unwrap(), wall(20, 0));
        assert_eq!(parse_time("12:15 a.m.").unwrap(), wall(0, 15));
        assert_eq!(parse_time("12:15 PM").unwrap(), wall(12, 15));
        assert_eq!(parse_time("٧:٠٠ م").unwrap(), wall(19, 0));
        assert_eq!(parse_time("午前9:10").unwrap(), wall(9, 10));
    }

    #[test]
    fn clamps_out_of_range_parts() {
        assert_eq!(parse_time("25:99").unwrap(), wall(23, 59));
        assert_eq!(parse_time("24:00").unwrap(), wall(23, 0));
    }

    #[test]
    fn rejects_loose_formats() {
        for text in ["8", "8:5", "123:00", "8:000", "ab:cd", "", "8.30", "-1:00"] {
            assert_eq!(
                parse_time(text),
                Err(TimeError::InvalidTime(text.to_string())),
                "{text:?} should be rejected"
            );
        }
    }

    #[test]
    fn invalid_text_falls_back_to_nine() {
        assert_eq!(parse_time_or_default("soon"), wall(9, 0));
        assert_eq!(parse_time_or("soon", wall(7, 0)), wall(7, 0));
    }

    #[test]
    fn next_occurrence_later_today() {
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 8, 0, 0).unwrap();
        let next = next_occurrence(&now, wall(9, 30));
        assert_eq!(next, Utc.with_ymd_and_hms(2024, 1, 10, 9, 30, 0).unwrap());
    }

    #[test]
    fn next_occurrence_rolls_to_tomorrow_when_due_or_past() {
        let now = Utc.with_ymd_and_hms(2024, 1, 10, 9, 30, 0).unwrap();
        assert_eq!(
            next_occurrence(&now, wall(9, 30)),
            Utc.with_ymd_and_hms(2024, 1, 11, 9, 30, 0).unwrap()
        );
        assert_eq!(
            next_occurrence(&now, wall(6, 0)),
            Utc.with_ymd_and_hms(2024, 1, 11, 6, 0, 0).unwrap()
        );
    }

    #[test]
    fn next_occurrence_uses_the_zone_of_now() {
        let zone = FixedOffset::east_opt(3 * 3600).unwrap();
        let now = Utc
            .with_ymd_and_hms(2024, 1, 10, 22, 0, 0)
            .unwrap()
            .with_timezone(&zone);
        let next = next_occurrence(&now, wall(8, 0));
        assert_eq!(
            next.with_timezone(&Utc),
            Utc.with_ymd_and_hms(2024, 1, 11, 5, 0, 0).unwrap()
        );
    }

    #[test]
    fn shifted_hours_wrap_around_midnight() {
        assert_eq!(wall(21, 15).shifted_hours(12), wall(9, 15));
        assert_eq!(wall(20, 0).shifted_hours(6), wall(2, 0));
    }
}
