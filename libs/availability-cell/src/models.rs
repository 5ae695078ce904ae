use chrono::{DateTime, Duration, NaiveDate, NaiveTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Half-open interval `[start, end)` with `start < end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawTimeInterval")]
pub struct TimeInterval {
    pub(crate) start: DateTime<Utc>,
    pub(crate) end: DateTime<Utc>,
}

#[derive(Deserialize)]
struct RawTimeInterval {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
}

impl TryFrom<RawTimeInterval> for TimeInterval {
    type Error = AvailabilityError;

    fn try_from(raw: RawTimeInterval) -> Result<Self, Self::Error> {
        TimeInterval::new(raw.start, raw.end)
    }
}

impl TimeInterval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>) -> Result<Self, AvailabilityError> {
        if start >= end {
            return Err(AvailabilityError::InvalidInterval { start, end });
        }
        Ok(Self { start, end })
    }

    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn duration(&self) -> Duration {
        self.end - self.start
    }

    /// Two half-open intervals overlap iff `start1 < end2 && start2 < end1`.
    pub fn overlaps(&self, other: &TimeInterval) -> bool {
        self.start < other.end && other.start < self.end
    }

    pub fn intersect(&self, other: &TimeInterval) -> Option<TimeInterval> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (start < end).then_some(TimeInterval { start, end })
    }
}

/// A proposed slot with the 1-based ordinal the patient replies with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSlot {
    pub ordinal: u32,
    pub interval: TimeInterval,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHours {
    pub start_of_day: NaiveTime,
    pub end_of_day: NaiveTime,
    pub days: Vec<Weekday>,
}

impl Default for WorkingHours {
    fn default() -> Self {
        Self {
            start_of_day: NaiveTime::from_hms_opt(9, 0, 0).unwrap_or_default(),
            end_of_day: NaiveTime::from_hms_opt(17, 0, 0).unwrap_or_default(),
            days: vec![Weekday::Mon, Weekday::Tue, Weekday::Wed, Weekday::Thu, Weekday::Fri],
        }
    }
}

impl WorkingHours {
    pub fn is_working_day(&self, weekday: Weekday) -> bool {
        self.days.contains(&weekday)
    }

    /// The open span of `date`, or `None` on a non-working day.
    pub fn span_for(&self, date: NaiveDate) -> Option<TimeInterval> {
        use chrono::Datelike;

        if !self.is_working_day(date.weekday()) {
            return None;
        }

        let start = date.and_time(self.start_of_day).and_utc();
        let end = date.and_time(self.end_of_day).and_utc();
        TimeInterval::new(start, end).ok()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalUnit {
    Days,
    Weeks,
    Months,
}

/// How far out the follow-up should happen, as extracted from clinical notes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum IntervalSpec {
    Relative { amount: u32, unit: IntervalUnit },
    /// "As needed".
    Unbounded,
    Unspecified,
}

/// Window used for `Unbounded` and `Unspecified` follow-ups, in weeks from today.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DefaultWindow {
    pub start_weeks: i64,
    pub end_weeks: i64,
}

impl Default for DefaultWindow {
    fn default() -> Self {
        Self {
            start_weeks: 2,
            end_weeks: 8,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DesiredWindow {
    pub interval: TimeInterval,
    /// Set when the interval was not stated at all; surfaced as telemetry.
    pub flagged_unspecified: bool,
}

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AvailabilityError {
    #[error("Invalid interval: start {start} is not before end {end}")]
    InvalidInterval {
        start: DateTime<Utc>,
        end: DateTime<Utc>,
    },

    #[error("Scheduling window out of range: {0}")]
    WindowOutOfRange(String),
}
