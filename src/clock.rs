//! Facility wall clock: slot labels in the facility's civil timezone to UTC spans,
//! and the one ISO-8601 week rule every quota computation uses.
//!
//! DST policy: a wall-clock time that does not exist (spring-forward gap) is
//! rejected; one that occurs twice (fall-back) resolves to its first occurrence.

use std::fmt;

use chrono::{DateTime, Datelike, Days, NaiveDate, NaiveDateTime, TimeZone, Timelike, Utc, Weekday};
use chrono_tz::Tz;
use serde::{Deserialize, Serialize};

use crate::model::{Ms, Span};

const HOUR_MS: Ms = 3_600_000;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClockError {
    #[error("malformed slot label {0:?} (expected \"HH:MM - HH:MM\")")]
    MalformedLabel(String),
    #[error("slot boundaries must be on the hour grid")]
    NotOnHourGrid,
    #[error("slot {start:02}:00-{end:02}:00 is outside operating hours {open:02}:00-{close:02}:00")]
    OutsideOperatingHours { start: u32, end: u32, open: u32, close: u32 },
    #[error("slot lasts {actual_ms}ms, expected {expected_ms}ms")]
    WrongDuration { expected_ms: Ms, actual_ms: Ms },
    #[error("local time {0} does not exist in the facility timezone")]
    NonexistentLocalTime(NaiveDateTime),
    #[error("instant {0} is out of range")]
    OutOfRange(Ms),
    #[error("no such ISO week: {0}")]
    InvalidWeek(WeekId),
}

/// ISO-8601 week identifier, e.g. `2025-W19`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WeekId {
    pub year: i32,
    pub week: u32,
}

impl WeekId {
    /// ISO week of a calendar date.
    pub fn of_date(date: NaiveDate) -> Self {
        let iso = date.iso_week();
        WeekId {
            year: iso.year(),
            week: iso.week(),
        }
    }
}

impl fmt::Display for WeekId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-W{:02}", self.year, self.week)
    }
}

/// Fixed facility configuration: civil timezone and the hour grid slots live on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Facility {
    pub tz: Tz,
    /// First bookable hour (local).
    pub open_hour: u32,
    /// Hour at which the last slot must have ended (local, up to 24).
    pub close_hour: u32,
    pub slot_hours: u32,
}

impl Default for Facility {
    fn default() -> Self {
        Self {
            tz: chrono_tz::Europe::Berlin,
            open_hour: 8,
            close_hour: 22,
            slot_hours: 1,
        }
    }
}

impl Facility {
    pub fn slot_ms(&self) -> Ms {
        Ms::from(self.slot_hours) * HOUR_MS
    }

    /// Convert a local date plus a `HH:MM - HH:MM` label into a UTC span.
    pub fn normalize(&self, date: NaiveDate, label: &str) -> Result<Span, ClockError> {
        let (start_label, end_label) = label
            .split_once('-')
            .ok_or_else(|| ClockError::MalformedLabel(label.to_string()))?;
        let (start_hour, start_minute) = parse_clock(start_label.trim(), label)?;
        let (end_hour, end_minute) = parse_clock(end_label.trim(), label)?;
        if start_hour == 24 {
            return Err(ClockError::MalformedLabel(label.to_string()));
        }
        if start_minute != 0 || end_minute != 0 {
            return Err(ClockError::NotOnHourGrid);
        }
        if end_hour <= start_hour || end_hour - start_hour != self.slot_hours {
            let actual_ms = (Ms::from(end_hour) - Ms::from(start_hour)) * HOUR_MS;
            return Err(ClockError::WrongDuration {
                expected_ms: self.slot_ms(),
                actual_ms,
            });
        }
        self.check_grid(start_hour)?;

        let naive = date
            .and_hms_opt(start_hour, 0, 0)
            .ok_or_else(|| ClockError::MalformedLabel(label.to_string()))?;
        let start = self
            .tz
            .from_local_datetime(&naive)
            .earliest()
            .ok_or(ClockError::NonexistentLocalTime(naive))?
            .timestamp_millis();
        Ok(Span::new(start, start + self.slot_ms()))
    }

    /// Re-check a span that is supposed to have come out of [`Facility::normalize`].
    pub fn validate_span(&self, span: &Span) -> Result<(), ClockError> {
        if span.duration_ms() != self.slot_ms() {
            return Err(ClockError::WrongDuration {
                expected_ms: self.slot_ms(),
                actual_ms: span.duration_ms(),
            });
        }
        let local = self.local(span.start)?;
        if local.minute() != 0 || local.second() != 0 || local.nanosecond() != 0 {
            return Err(ClockError::NotOnHourGrid);
        }
        self.check_grid(local.hour())
    }

    /// ISO week containing `instant`, judged by the facility's local calendar.
    pub fn week_of(&self, instant: Ms) -> Result<WeekId, ClockError> {
        Ok(WeekId::of_date(self.local(instant)?.date_naive()))
    }

    /// UTC window `[Monday 00:00, next Monday 00:00)` local for `week`.
    pub fn week_window(&self, week: WeekId) -> Result<Span, ClockError> {
        let monday = NaiveDate::from_isoywd_opt(week.year, week.week, Weekday::Mon)
            .ok_or(ClockError::InvalidWeek(week))?;
        let next_monday = monday
            .checked_add_days(Days::new(7))
            .ok_or(ClockError::InvalidWeek(week))?;
        Ok(Span::new(
            self.local_midnight(monday)?,
            self.local_midnight(next_monday)?,
        ))
    }

    pub fn local(&self, instant: Ms) -> Result<DateTime<Tz>, ClockError> {
        Utc.timestamp_millis_opt(instant)
            .single()
            .map(|utc| utc.with_timezone(&self.tz))
            .ok_or(ClockError::OutOfRange(instant))
    }

    fn check_grid(&self, start_hour: u32) -> Result<(), ClockError> {
        let end_hour = start_hour + self.slot_hours;
        if start_hour < self.open_hour || end_hour > self.close_hour {
            return Err(ClockError::OutsideOperatingHours {
                start: start_hour,
                end: end_hour,
                open: self.open_hour,
                close: self.close_hour,
            });
        }
        if (start_hour - self.open_hour) % self.slot_hours != 0 {
            return Err(ClockError::NotOnHourGrid);
        }
        Ok(())
    }

    /// Start of the local day. Zones that skip midnight start the day at the
    /// first instant after the gap.
    fn local_midnight(&self, date: NaiveDate) -> Result<Ms, ClockError> {
        for hour in 0..3 {
            let Some(naive) = date.and_hms_opt(hour, 0, 0) else {
                break;
            };
            if let Some(dt) = self.tz.from_local_datetime(&naive).earliest() {
                return Ok(dt.timestamp_millis());
            }
        }
        Err(ClockError::NonexistentLocalTime(date.and_time(chrono::NaiveTime::MIN)))
    }
}

/// Parse exactly `HH:MM`. `24:00` is accepted so a slot may end at midnight.
fn parse_clock(part: &str, label: &str) -> Result<(u32, u32), ClockError> {
    let malformed = || ClockError::MalformedLabel(label.to_string());
    let (hh, mm) = part.split_once(':').ok_or_else(malformed)?;
    if hh.len() != 2 || mm.len() != 2 || !hh.bytes().chain(mm.bytes()).all(|b| b.is_ascii_digit()) {
        return Err(malformed());
    }
    let hour: u32 = hh.parse().map_err(|_| malformed())?;
    let minute: u32 = mm.parse().map_err(|_| malformed())?;
    if minute >= 60 || hour > 24 || (hour == 24 && minute != 0) {
        return Err(malformed());
    }
    Ok((hour, minute))
}
