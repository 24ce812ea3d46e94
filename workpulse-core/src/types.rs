//! Core domain types for workpulse
//!
//! | Term | Definition |
//! |------|------------|
//! | **Interval** | A labeled (activity or pause) span of time with start, end and duration |
//! | **Mode** | What the tracker is currently timing: activity, pause, or nothing |
//! | **Checkpoint** | A periodic save of the still-open segment, keyed by its row id |
//! | **Pending list** | Closed intervals of the current process lifetime, not yet cleared by a flush |
//!
//! Timestamps are held in the local zone with millisecond precision. The
//! store persists them in UTC.

use crate::error::{Error, Result};
use chrono::{DateTime, Local, NaiveDate, NaiveTime, TimeDelta, TimeZone, Timelike};
use serde::{Deserialize, Serialize};

// ============================================
// Interval kind and mode
// ============================================

/// What an interval was spent on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IntervalKind {
    Activity,
    Pause,
}

impl IntervalKind {
    /// Stored type code
    pub fn code(&self) -> i64 {
        match self {
            IntervalKind::Activity => 0,
            IntervalKind::Pause => 1,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(IntervalKind::Activity),
            1 => Some(IntervalKind::Pause),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            IntervalKind::Activity => "activity",
            IntervalKind::Pause => "pause",
        }
    }
}

impl std::fmt::Display for IntervalKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for IntervalKind {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "activity" => Ok(IntervalKind::Activity),
            "pause" => Ok(IntervalKind::Pause),
            _ => Err(format!("unknown interval kind: {}", s)),
        }
    }
}

/// Engine mode. Exactly one is active at any instant; never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    Activity,
    Pause,
    #[default]
    Stopped,
}

impl Mode {
    /// Kind of the interval open in this mode, if any
    pub fn open_kind(&self) -> Option<IntervalKind> {
        match self {
            Mode::Activity => Some(IntervalKind::Activity),
            Mode::Pause => Some(IntervalKind::Pause),
            Mode::Stopped => None,
        }
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Mode::Activity => "activity",
            Mode::Pause => "pause",
            Mode::Stopped => "stopped",
        };
        f.write_str(name)
    }
}

// ============================================
// Interval
// ============================================

/// First instant of a local calendar day.
///
/// Falls back to reading the date as UTC when local midnight does not exist
/// (a DST gap at midnight).
pub fn local_midnight(date: NaiveDate) -> DateTime<Local> {
    let naive = date.and_time(NaiveTime::default());
    Local
        .from_local_datetime(&naive)
        .earliest()
        .unwrap_or_else(|| Local.from_utc_datetime(&naive))
}

/// Last millisecond of a local calendar day (`23:59:59.999`).
pub fn local_day_end(date: NaiveDate) -> DateTime<Local> {
    match date.succ_opt() {
        Some(next) => local_midnight(next) - TimeDelta::milliseconds(1),
        None => local_midnight(date),
    }
}

/// Truncate a timestamp to whole milliseconds.
pub fn truncate_ms(ts: DateTime<Local>) -> DateTime<Local> {
    let nanos = ts.nanosecond() / 1_000_000 * 1_000_000;
    ts.with_nanosecond(nanos).unwrap_or(ts)
}

/// A labeled span of time.
///
/// Intervals built in memory always carry `duration_ms == end - start`.
/// Only [`Interval::from_stored`] and the day-closing half of a midnight
/// split may carry a duration that differs from the span.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Interval {
    kind: IntervalKind,
    start: DateTime<Local>,
    end: DateTime<Local>,
    duration_ms: i64,
}

impl Interval {
    /// Build an interval, deriving its duration. Non-positive spans are rejected.
    pub fn new(kind: IntervalKind, start: DateTime<Local>, end: DateTime<Local>) -> Result<Self> {
        let start = truncate_ms(start);
        let end = truncate_ms(end);
        let duration_ms = (end - start).num_milliseconds();
        if duration_ms <= 0 {
            return Err(Error::InvalidInterval(format!(
                "{} interval from {} to {} has non-positive duration {}ms",
                kind, start, end, duration_ms
            )));
        }
        Ok(Self {
            kind,
            start,
            end,
            duration_ms,
        })
    }

    /// Build an interval of `duration_ms` ending at `end`.
    pub fn ending_at(kind: IntervalKind, end: DateTime<Local>, duration_ms: i64) -> Result<Self> {
        let end = truncate_ms(end);
        Self::new(kind, end - TimeDelta::milliseconds(duration_ms), end)
    }

    /// Rebuild an interval read back from storage, keeping the stored duration.
    pub fn from_stored(
        kind: IntervalKind,
        start: DateTime<Local>,
        end: DateTime<Local>,
        duration_ms: i64,
    ) -> Result<Self> {
        let computed = (end - start).num_milliseconds();
        if computed <= 0 || duration_ms <= 0 {
            return Err(Error::InvalidInterval(format!(
                "stored {} interval from {} to {} has non-positive duration",
                kind, start, end
            )));
        }
        Ok(Self {
            kind,
            start,
            end,
            duration_ms,
        })
    }

    /// Interval whose end is an inclusive day boundary (`23:59:59.999`), so
    /// its duration counts the final millisecond.
    pub(crate) fn closing_day(
        kind: IntervalKind,
        start: DateTime<Local>,
        end: DateTime<Local>,
        duration_ms: i64,
    ) -> Result<Self> {
        let start = truncate_ms(start);
        let end = truncate_ms(end);
        if duration_ms <= 0 || end < start {
            return Err(Error::InvalidInterval(format!(
                "{} interval from {} closing its day at {} is empty",
                kind, start, end
            )));
        }
        Ok(Self {
            kind,
            start,
            end,
            duration_ms,
        })
    }

    pub fn kind(&self) -> IntervalKind {
        self.kind
    }

    pub fn start(&self) -> DateTime<Local> {
        self.start
    }

    pub fn end(&self) -> DateTime<Local> {
        self.end
    }

    pub fn duration_ms(&self) -> i64 {
        self.duration_ms
    }

    /// Local calendar date the interval starts on
    pub fn date(&self) -> NaiveDate {
        self.start.date_naive()
    }

    /// Reclassify the interval
    pub fn set_kind(&mut self, kind: IntervalKind) {
        self.kind = kind;
    }

    /// Split at an instant strictly inside the interval.
    pub fn split_at(&self, at: DateTime<Local>) -> Result<(Interval, Interval)> {
        let at = truncate_ms(at);
        if at <= self.start || at >= self.end {
            return Err(Error::InvalidInterval(format!(
                "split point {} is not inside {}..{}",
                at, self.start, self.end
            )));
        }
        Ok((
            Interval::new(self.kind, self.start, at)?,
            Interval::new(self.kind, at, self.end)?,
        ))
    }

    pub(crate) fn set_end(&mut self, end: DateTime<Local>) {
        self.end = end;
    }

    pub(crate) fn set_duration_ms(&mut self, duration_ms: i64) {
        self.duration_ms = duration_ms;
    }
}

// ============================================
// Engine views
// ============================================

/// Row id of the store row written for the still-open segment.
///
/// `None` means the next checkpoint inserts a new row. The engine resets it
/// on every mode transition and after every successful flush.
pub type CheckpointId = Option<i64>;

/// Snapshot of the currently open interval
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct OngoingInterval {
    pub kind: IntervalKind,
    pub started_at: DateTime<Local>,
    /// Duration as of the moment the snapshot was taken
    pub duration_ms: i64,
}

/// Accumulated totals of the current process lifetime
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Totals {
    pub activity_ms: i64,
    pub pause_ms: i64,
}

impl Totals {
    pub fn add(&mut self, kind: IntervalKind, duration_ms: i64) {
        match kind {
            IntervalKind::Activity => self.activity_ms += duration_ms,
            IntervalKind::Pause => self.pause_ms += duration_ms,
        }
    }

    /// Totals of a set of intervals
    pub fn of(intervals: &[Interval]) -> Self {
        let mut totals = Totals::default();
        for interval in intervals {
            totals.add(interval.kind(), interval.duration_ms());
        }
        totals
    }
}

/// Daily activity warning level
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TimeWarning {
    /// Activity total passed the warning threshold
    Approaching,
    /// Activity total passed the limit
    Exceeded,
}

/// Lock-detection signal, already debounced upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockEvent {
    Lock,
    Unlock,
    /// The session has stayed locked for longer than the backpause window
    LongOngoingLock,
}
