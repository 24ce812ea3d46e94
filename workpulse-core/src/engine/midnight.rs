//! Midnight splitting
//!
//! Daily totals never span two calendar dates, so an interval crossing local
//! midnight is cut at every day boundary it crosses.

use crate::error::Result;
use crate::types::{local_day_end, local_midnight, Interval};

/// Split an interval at each local midnight it crosses.
///
/// Every part but the last ends at `23:59:59.999` of its day and carries the
/// duration up to the following midnight, so the parts always sum to the
/// original duration. The last part starts at `00:00:00.000` of the end date.
/// An interval ending exactly at midnight yields no empty trailing part.
pub fn split_at_midnight(interval: Interval) -> Result<Vec<Interval>> {
    let end_date = interval.end().date_naive();
    if interval.date() == end_date {
        return Ok(vec![interval]);
    }

    let kind = interval.kind();
    let mut parts = Vec::new();
    let mut cursor = interval.start();

    while cursor.date_naive() < end_date {
        let day = cursor.date_naive();
        let Some(next_day) = day.succ_opt() else {
            break;
        };
        let next_midnight = local_midnight(next_day);
        let duration_ms = (next_midnight - cursor).num_milliseconds();

        parts.push(Interval::closing_day(
            kind,
            cursor,
            local_day_end(day),
            duration_ms,
        )?);
        cursor = next_midnight;
    }

    if interval.end() > cursor {
        parts.push(Interval::new(kind, cursor, interval.end())?);
    }

    tracing::debug!(
        kind = %kind,
        parts = parts.len(),
        "Split interval at midnight"
    );
    Ok(parts)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IntervalKind::{Activity, Pause};
    use chrono::{DateTime, Local, NaiveDate, TimeDelta, TimeZone};

    fn at(day: u32, h: u32, m: u32, s: u32) -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 7, day, h, m, s).unwrap()
    }

    #[test]
    fn test_same_day_is_untouched() {
        let iv = Interval::new(Activity, at(15, 9, 0, 0), at(15, 17, 0, 0)).unwrap();
        assert_eq!(split_at_midnight(iv.clone()).unwrap(), vec![iv]);
    }

    #[test]
    fn test_split_preserves_total_duration() {
        let iv = Interval::new(Activity, at(15, 23, 59, 58), at(16, 0, 0, 3)).unwrap();
        let parts = split_at_midnight(iv).unwrap();

        assert_eq!(parts.len(), 2);
        assert_eq!(parts[0].duration_ms(), 2000);
        assert_eq!(parts[1].duration_ms(), 3000);
        assert_eq!(
            parts[0].end(),
            at(15, 23, 59, 59) + TimeDelta::milliseconds(999)
        );
        assert_eq!(parts[1].start(), at(16, 0, 0, 0));
        assert_eq!(parts[0].date(), NaiveDate::from_ymd_opt(2024, 7, 15).unwrap());
        assert_eq!(parts[1].date(), NaiveDate::from_ymd_opt(2024, 7, 16).unwrap());
    }

    #[test]
    fn test_several_midnights_split_per_day() {
        let iv = Interval::new(Pause, at(14, 22, 0, 0), at(16, 1, 0, 0)).unwrap();
        let total = iv.duration_ms();
        let parts = split_at_midnight(iv).unwrap();

        assert_eq!(parts.len(), 3);
        assert_eq!(parts[1].start(), at(15, 0, 0, 0));
        assert_eq!(parts.iter().map(Interval::duration_ms).sum::<i64>(), total);
        assert!(parts.iter().all(|p| p.kind() == Pause));
    }

    #[test]
    fn test_ending_exactly_at_midnight_has_no_empty_part() {
        let iv = Interval::new(Activity, at(15, 23, 0, 0), at(16, 0, 0, 0)).unwrap();
        let parts = split_at_midnight(iv).unwrap();

        assert_eq!(parts.len(), 1);
        assert_eq!(parts[0].duration_ms(), 60 * 60_000);
    }
}
