//! Time sources
//!
//! The engine reads wall-clock time for interval boundaries and a monotonic
//! instant for the running clock, so elapsed durations survive wall-clock
//! adjustments.

use chrono::{DateTime, Local, TimeDelta};
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Source of wall-clock and monotonic time
pub trait Clock: Send + Sync {
    /// Current wall-clock time in the local zone
    fn now(&self) -> DateTime<Local>;

    /// Current monotonic instant
    fn instant(&self) -> Instant;
}

/// The operating system clocks
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Local> {
        Local::now()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }
}

/// A clock that only moves when told to.
///
/// Wall-clock and monotonic time advance together through [`ManualClock::advance`];
/// [`ManualClock::set_wall`] moves only the wall clock, mimicking a system
/// clock adjustment.
#[derive(Debug)]
pub struct ManualClock {
    base: Instant,
    inner: Mutex<ManualState>,
}

#[derive(Debug)]
struct ManualState {
    wall: DateTime<Local>,
    offset: Duration,
}

impl ManualClock {
    pub fn new(start: DateTime<Local>) -> Self {
        Self {
            base: Instant::now(),
            inner: Mutex::new(ManualState {
                wall: start,
                offset: Duration::ZERO,
            }),
        }
    }

    pub fn advance(&self, by: Duration) {
        let mut state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        state.offset += by;
        state.wall += TimeDelta::from_std(by).unwrap_or(TimeDelta::zero());
    }

    pub fn set_wall(&self, wall: DateTime<Local>) {
        let mut state = self.inner.lock().unwrap_or_else(|p| p.into_inner());
        state.wall = wall;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Local> {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).wall
    }

    fn instant(&self) -> Instant {
        self.base + self.inner.lock().unwrap_or_else(|p| p.into_inner()).offset
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_manual_clock_advances_both_clocks() {
        let start = Local::now();
        let clock = ManualClock::new(start);
        let before = clock.instant();

        clock.advance(Duration::from_millis(1500));

        assert_eq!(clock.instant() - before, Duration::from_millis(1500));
        assert_eq!((clock.now() - start).num_milliseconds(), 1500);
    }

    #[test]
    fn test_set_wall_leaves_monotonic_alone() {
        let start = Local::now();
        let clock = ManualClock::new(start);
        let before = clock.instant();

        clock.set_wall(start + TimeDelta::hours(2));

        assert_eq!(clock.instant(), before);
        assert_eq!((clock.now() - start).num_hours(), 2);
    }
}
