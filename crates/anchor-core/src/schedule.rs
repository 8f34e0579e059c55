//! Focus schedules for lists in `scheduled` blocking mode.
//!
//! A schedule window is a set of days plus a time range. Overnight ranges
//! (end before start) belong to the day they start on, so a Friday 22:00-02:00
//! window is still active at 01:00 on Saturday.

use std::collections::HashSet;

use chrono::{DateTime, Datelike, Local, Timelike};
use serde::{Deserialize, Serialize};

/// Days of the week for schedule windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Weekday {
    Monday,
    Tuesday,
    Wednesday,
    Thursday,
    Friday,
    Saturday,
    Sunday,
}

impl Weekday {
    /// Returns Monday through Friday.
    pub fn weekdays() -> Vec<Weekday> {
        vec![
            Weekday::Monday,
            Weekday::Tuesday,
            Weekday::Wednesday,
            Weekday::Thursday,
            Weekday::Friday,
        ]
    }

    /// Converts from chrono's Weekday.
    pub fn from_chrono(weekday: chrono::Weekday) -> Self {
        match weekday {
            chrono::Weekday::Mon => Weekday::Monday,
            chrono::Weekday::Tue => Weekday::Tuesday,
            chrono::Weekday::Wed => Weekday::Wednesday,
            chrono::Weekday::Thu => Weekday::Thursday,
            chrono::Weekday::Fri => Weekday::Friday,
            chrono::Weekday::Sat => Weekday::Saturday,
            chrono::Weekday::Sun => Weekday::Sunday,
        }
    }

    fn previous(self) -> Weekday {
        match self {
            Weekday::Monday => Weekday::Sunday,
            Weekday::Tuesday => Weekday::Monday,
            Weekday::Wednesday => Weekday::Tuesday,
            Weekday::Thursday => Weekday::Wednesday,
            Weekday::Friday => Weekday::Thursday,
            Weekday::Saturday => Weekday::Friday,
            Weekday::Sunday => Weekday::Saturday,
        }
    }
}

/// Time of day as hour and minute.
///
/// Deserializing rejects an hour above 23 or a minute above 59.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "RawTimeOfDay")]
pub struct TimeOfDay {
    /// Hour (0-23).
    pub hour: u8,
    /// Minute (0-59).
    pub minute: u8,
}

impl TimeOfDay {
    /// Creates a new TimeOfDay, clamping out-of-range values.
    pub fn new(hour: u8, minute: u8) -> Self {
        Self {
            hour: hour.min(23),
            minute: minute.min(59),
        }
    }

    /// Converts to minutes since midnight.
    pub fn to_minutes(self) -> u16 {
        self.hour as u16 * 60 + self.minute as u16
    }

    /// Extracts the time of day from a local timestamp.
    pub fn from_local(now: &DateTime<Local>) -> Self {
        Self::new(now.hour() as u8, now.minute() as u8)
    }
}

#[derive(Deserialize)]
struct RawTimeOfDay {
    hour: u8,
    minute: u8,
}

impl TryFrom<RawTimeOfDay> for TimeOfDay {
    type Error = String;

    fn try_from(raw: RawTimeOfDay) -> Result<Self, Self::Error> {
        if raw.hour > 23 || raw.minute > 59 {
            return Err(format!("invalid time of day {:02}:{:02}", raw.hour, raw.minute));
        }
        Ok(Self {
            hour: raw.hour,
            minute: raw.minute,
        })
    }
}

impl PartialOrd for TimeOfDay {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for TimeOfDay {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        self.to_minutes().cmp(&other.to_minutes())
    }
}

/// A focus window.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduleWindow {
    /// Days the window starts on.
    pub days: HashSet<Weekday>,
    /// Window start.
    pub start: TimeOfDay,
    /// Window end (exclusive). Earlier than `start` means overnight.
    pub end: TimeOfDay,
    /// Disabled windows never match.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_enabled() -> bool {
    true
}

impl ScheduleWindow {
    /// Creates an enabled window.
    pub fn new(days: Vec<Weekday>, start: TimeOfDay, end: TimeOfDay) -> Self {
        Self {
            days: days.into_iter().collect(),
            start,
            end,
            enabled: true,
        }
    }

    /// Returns true if the window crosses midnight.
    pub fn is_overnight(&self) -> bool {
        self.end < self.start
    }

    /// Checks whether the window is open at the given day and time.
    pub fn is_active(&self, day: Weekday, time: TimeOfDay) -> bool {
        if !self.enabled || self.start == self.end {
            return false;
        }

        if self.is_overnight() {
            (time >= self.start && self.days.contains(&day))
                || (time < self.end && self.days.contains(&day.previous()))
        } else {
            self.days.contains(&day) && time >= self.start && time < self.end
        }
    }
}

/// Returns true if any window is open at `now`.
pub fn any_active_at(windows: &[ScheduleWindow], now: &DateTime<Local>) -> bool {
    let day = Weekday::from_chrono(now.weekday());
    let time = TimeOfDay::from_local(now);
    windows.iter().any(|w| w.is_active(day, time))
}
