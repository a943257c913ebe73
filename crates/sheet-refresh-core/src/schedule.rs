//! Daily times of day and next-occurrence arithmetic.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{Duration, NaiveDateTime, NaiveTime};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::error::ScheduleError;

static TIME_OF_DAY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([01]\d|2[0-3]):([0-5]\d)$").expect("valid regex"));

/// A wall-clock time in 24-hour `HH:MM` form.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TimeOfDay {
    hour: u32,
    minute: u32,
}

impl TimeOfDay {
    pub fn new(hour: u32, minute: u32) -> Result<Self, ScheduleError> {
        if hour > 23 || minute > 59 {
            return Err(ScheduleError::InvalidTime(format!("{hour}:{minute}")));
        }
        Ok(Self { hour, minute })
    }

    pub fn hour(&self) -> u32 {
        self.hour
    }

    pub fn minute(&self) -> u32 {
        self.minute
    }

    fn as_naive_time(&self) -> NaiveTime {
        NaiveTime::from_hms_opt(self.hour, self.minute, 0).unwrap_or(NaiveTime::MIN)
    }

    /// First occurrence strictly after `now`: today if still ahead, else tomorrow.
    pub fn next_after(&self, now: NaiveDateTime) -> NaiveDateTime {
        let today = now.date().and_time(self.as_naive_time());
        if today > now {
            today
        } else {
            today + Duration::days(1)
        }
    }
}

impl FromStr for TimeOfDay {
    type Err = ScheduleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let caps = TIME_OF_DAY
            .captures(trimmed)
            .ok_or_else(|| ScheduleError::InvalidTime(s.to_string()))?;
        let hour = caps[1]
            .parse()
            .map_err(|_| ScheduleError::InvalidTime(s.to_string()))?;
        let minute = caps[2]
            .parse()
            .map_err(|_| ScheduleError::InvalidTime(s.to_string()))?;
        Self::new(hour, minute)
    }
}

impl fmt::Display for TimeOfDay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:02}:{:02}", self.hour, self.minute)
    }
}

/// A non-empty set of daily fire times.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Schedule {
    times: BTreeSet<TimeOfDay>,
}

impl Schedule {
    pub fn daily(time: TimeOfDay) -> Self {
        Self {
            times: BTreeSet::from([time]),
        }
    }

    pub fn new(times: impl IntoIterator<Item = TimeOfDay>) -> Result<Self, ScheduleError> {
        let times: BTreeSet<_> = times.into_iter().collect();
        if times.is_empty() {
            return Err(ScheduleError::Empty);
        }
        Ok(Self { times })
    }

    /// Parse `HH:MM` strings; duplicates collapse, any invalid entry fails.
    pub fn parse<S: AsRef<str>>(times: impl IntoIterator<Item = S>) -> Result<Self, ScheduleError> {
        let parsed = times
            .into_iter()
            .map(|t| t.as_ref().parse())
            .collect::<Result<Vec<TimeOfDay>, _>>()?;
        Self::new(parsed)
    }

    pub fn times(&self) -> impl Iterator<Item = TimeOfDay> + '_ {
        self.times.iter().copied()
    }

    /// Earliest upcoming fire time strictly after `now`.
    pub fn next_after(&self, now: NaiveDateTime) -> NaiveDateTime {
        self.times
            .iter()
            .map(|t| t.next_after(now))
            .min()
            .unwrap_or_else(|| now + Duration::days(1))
    }
}

impl fmt::Display for Schedule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for time in &self.times {
            if !first {
                f.write_str(", ")?;
            }
            write!(f, "{time}")?;
            first = false;
        }
        Ok(())
    }
}
