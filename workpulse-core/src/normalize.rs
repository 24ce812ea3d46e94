//! Interval normalization
//!
//! Sorts a collection of intervals and folds same-kind neighbours that are
//! near-duplicates, nested, overlapping, or separated by a small gap.
//!
//! Only one left-to-right pass is made. After a successful merge the cursor
//! stays on the extended interval, so chains of small gaps collapse, but a
//! merge is never re-checked against anything other than the next element.
//! Intervals of different kinds are never compared, which means two
//! activity runs separated by a pause stay apart even if they overlap.

use crate::types::Interval;
use chrono::{NaiveDate, TimeDelta};
use std::collections::BTreeMap;

/// End and duration differences below this are treated as the same interval.
pub const DUPLICATE_TOLERANCE_MS: i64 = 50;

/// Gaps shorter than this between same-kind intervals are closed.
pub const MAX_MERGE_GAP_MS: i64 = 500;

/// Overlaps shorter than this between same-kind intervals are folded.
pub const MAX_MERGE_OVERLAP_MS: i64 = 100;

/// Normalize intervals in a single sorted pass.
pub fn normalize(mut intervals: Vec<Interval>) -> Vec<Interval> {
    intervals.sort_by(|a, b| {
        a.start()
            .cmp(&b.start())
            .then(a.end().cmp(&b.end()))
            .then(a.duration_ms().cmp(&b.duration_ms()))
    });

    let mut i = 0;
    while i + 1 < intervals.len() {
        if intervals[i].kind() != intervals[i + 1].kind() {
            i += 1;
            continue;
        }

        let later = intervals[i + 1].clone();
        if absorb(&mut intervals[i], &later) {
            intervals.remove(i + 1);
        } else {
            i += 1;
        }
    }

    intervals
}

/// Normalize each local calendar day separately.
///
/// Keeps the two halves of a midnight split apart: they are only a
/// millisecond from each other and would otherwise be joined again.
pub fn normalize_by_day(intervals: Vec<Interval>) -> Vec<Interval> {
    let mut days: BTreeMap<NaiveDate, Vec<Interval>> = BTreeMap::new();
    for interval in intervals {
        days.entry(interval.date()).or_default().push(interval);
    }
    days.into_values().flat_map(normalize).collect()
}

/// Try to fold `later` into `earlier`. Returns true when `later` should be dropped.
fn absorb(earlier: &mut Interval, later: &Interval) -> bool {
    let end_diff = (later.end() - earlier.end()).num_milliseconds();
    let duration_diff = later.duration_ms() - earlier.duration_ms();

    if end_diff.abs() < DUPLICATE_TOLERANCE_MS && duration_diff.abs() < DUPLICATE_TOLERANCE_MS {
        return true;
    }

    // Nested
    if later.start() >= earlier.start() && later.end() <= earlier.end() {
        return true;
    }

    // The next two rules need `later` to start first, which the sort in
    // `normalize` rules out; they only fire for pairs passed in directly.

    // Later covers earlier entirely
    if later.start() < earlier.start() && earlier.end() <= later.end() {
        earlier.set_end(later.end());
        earlier.set_duration_ms(later.duration_ms());
        return true;
    }

    // Later overlaps earlier from the left: only the duration grows
    if later.start() < earlier.start() && later.end() >= earlier.start() && later.end() < earlier.end()
    {
        earlier.set_duration_ms((earlier.end() - later.start()).num_milliseconds());
        return true;
    }

    // Later starts inside earlier and runs past it
    if earlier.start() <= later.start()
        && later.start() <= earlier.end()
        && earlier.end() <= later.end()
    {
        union_with(earlier, later);
        return true;
    }

    let gap = (later.start() - earlier.end()).num_milliseconds();

    if (0..MAX_MERGE_GAP_MS).contains(&gap) {
        earlier.set_duration_ms(earlier.duration_ms() + later.duration_ms() + gap);
        earlier.set_end(later.end());
        return true;
    }

    if gap < 0 && gap > -MAX_MERGE_OVERLAP_MS {
        union_with(earlier, later);
        return true;
    }

    false
}

fn union_with(earlier: &mut Interval, later: &Interval) {
    let span: TimeDelta = later.end() - earlier.start();
    earlier.set_end(later.end());
    earlier.set_duration_ms(span.num_milliseconds());
}
