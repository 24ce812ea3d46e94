//! History review and editing
//!
//! A [`ReviewSession`] is a detached, day-paged copy of the persisted history
//! plus the current session. Edits only touch the copy; nothing is written
//! until [`Engine::commit_review`]. Checkpoints stay paused for as long as a
//! review is open so they cannot race the edited rows.

use super::{Engine, EngineState};
use crate::db::START_MATCH_TOLERANCE_MS;
use crate::error::{Error, Result};
use crate::normalize::normalize;
use crate::types::{truncate_ms, Interval, IntervalKind, Totals};
use chrono::{DateTime, Local, NaiveDate, TimeDelta};
use std::collections::BTreeMap;

/// Where a reviewed interval came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EntryOrigin {
    /// Persisted by an earlier session (or saved earlier in this one)
    History,
    /// Closed during the current session
    Current,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReviewEntry {
    pub interval: Interval,
    pub origin: EntryOrigin,
}

/// Editable history, paged by local calendar day.
#[derive(Debug, Clone, Default)]
pub struct ReviewSession {
    days: BTreeMap<NaiveDate, Vec<ReviewEntry>>,
}

impl ReviewSession {
    fn build(history: Vec<Interval>, current: Vec<Interval>) -> Self {
        let mut days: BTreeMap<NaiveDate, Vec<ReviewEntry>> = BTreeMap::new();
        let entries = history
            .into_iter()
            .map(|interval| (interval, EntryOrigin::History))
            .chain(
                current
                    .into_iter()
                    .map(|interval| (interval, EntryOrigin::Current)),
            );
        for (interval, origin) in entries {
            days.entry(interval.date())
                .or_default()
                .push(ReviewEntry { interval, origin });
        }
        for page in days.values_mut() {
            page.sort_by(|a, b| {
                a.interval
                    .start()
                    .cmp(&b.interval.start())
                    .then(a.interval.end().cmp(&b.interval.end()))
            });
        }
        Self { days }
    }

    /// Dates with at least one interval, oldest first
    pub fn days(&self) -> Vec<NaiveDate> {
        self.days.keys().copied().collect()
    }

    /// Intervals of one day ordered by start
    pub fn page(&self, date: NaiveDate) -> Option<&[ReviewEntry]> {
        self.days.get(&date).map(Vec::as_slice)
    }

    pub fn day_totals(&self, date: NaiveDate) -> Totals {
        let mut totals = Totals::default();
        for entry in self.page(date).unwrap_or_default() {
            totals.add(entry.interval.kind(), entry.interval.duration_ms());
        }
        totals
    }

    /// Total number of intervals across all days
    pub fn len(&self) -> usize {
        self.days.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn entry_mut(&mut self, date: NaiveDate, index: usize) -> Result<&mut Vec<ReviewEntry>> {
        let page = self
            .days
            .get_mut(&date)
            .ok_or_else(|| Error::InvalidState(format!("no intervals on {date}")))?;
        if index >= page.len() {
            return Err(Error::IndexOutOfRange {
                index,
                len: page.len(),
            });
        }
        Ok(page)
    }

    /// Reclassify one interval of a day.
    pub fn set_kind(&mut self, date: NaiveDate, index: usize, kind: IntervalKind) -> Result<()> {
        let page = self.entry_mut(date, index)?;
        page[index].interval.set_kind(kind);
        Ok(())
    }

    /// Split one interval of a day at an instant strictly inside it.
    pub fn split(&mut self, date: NaiveDate, index: usize, at: DateTime<Local>) -> Result<()> {
        let page = self.entry_mut(date, index)?;
        let origin = page[index].origin;
        let (first, second) = page[index].interval.split_at(at)?;

        page[index].interval = first;
        page.insert(
            index + 1,
            ReviewEntry {
                interval: second,
                origin,
            },
        );
        Ok(())
    }

    /// Normalized history and current intervals.
    ///
    /// Each day and origin is normalized on its own, so the current session
    /// stays separable from the history it is written next to.
    fn into_parts(self) -> (Vec<Interval>, Vec<Interval>) {
        let mut history = Vec::new();
        let mut current = Vec::new();

        for page in self.days.into_values() {
            let (day_current, day_history): (Vec<_>, Vec<_>) = page
                .into_iter()
                .partition(|entry| entry.origin == EntryOrigin::Current);
            history.extend(normalize(
                day_history.into_iter().map(|e| e.interval).collect(),
            ));
            current.extend(normalize(
                day_current.into_iter().map(|e| e.interval).collect(),
            ));
        }

        (history, current)
    }
}

fn shadows(a: &Interval, kind: IntervalKind, start: DateTime<Local>) -> bool {
    a.kind() == kind && (a.start() - start).num_milliseconds().abs() <= START_MATCH_TOLERANCE_MS
}

impl Engine {
    /// Open a review of the full history, pausing checkpoints.
    ///
    /// Persisted rows that are also held in memory (the current session, the
    /// unsaved backlog or the checkpoint of the open segment) are shown once,
    /// from memory.
    pub fn begin_review(&self) -> Result<ReviewSession> {
        let _entered = self.span.enter();
        let mut st = self.state();
        st.checkpoints_paused = true;

        let rows = match self.store.load() {
            Ok(rows) => rows,
            Err(e) => {
                st.checkpoints_paused = false;
                tracing::warn!(error = %e, "Cannot load history for review");
                return Err(e);
            }
        };

        let open = self.open_segment(&st);
        let mut history: Vec<Interval> = rows
            .into_iter()
            .filter(|row| {
                let in_memory = st
                    .pending
                    .iter()
                    .chain(&st.backlog)
                    .any(|iv| shadows(row, iv.kind(), iv.start()));
                let is_open = open.is_some_and(|(kind, start)| shadows(row, kind, start));
                !in_memory && !is_open
            })
            .collect();
        history.extend(st.backlog.iter().cloned());

        let session = ReviewSession::build(history, st.pending.clone());
        tracing::info!(
            days = session.days.len(),
            intervals = session.len(),
            "Review started"
        );
        Ok(session)
    }

    /// Write a reviewed session back and resume checkpoints.
    ///
    /// The store is replaced with the edited history and current intervals,
    /// then the pending list is replaced with the edited current ones. On
    /// failure nothing changes and checkpoints stay paused, so the review can
    /// be retried or cancelled.
    pub fn commit_review(&self, session: ReviewSession) -> Result<()> {
        let _entered = self.span.enter();
        let mut st = self.state();

        let (history, current) = session.into_parts();
        let mut all = history;
        all.extend(current.iter().cloned());

        if let Err(e) = self.store.replace(&all) {
            tracing::warn!(error = %e, "Committing review failed");
            return Err(Error::Commit(e.to_string()));
        }

        tracing::info!(
            stored = all.len(),
            current = current.len(),
            "Review committed"
        );
        st.pending = current;
        st.backlog.clear();
        st.unsaved = false;
        // The replace removed every checkpoint row
        st.checkpoint_id = None;
        st.retired_checkpoints.clear();
        st.checkpoints_paused = false;
        Ok(())
    }

    /// Drop a review without writing anything.
    pub fn cancel_review(&self) {
        let _entered = self.span.enter();
        self.state().checkpoints_paused = false;
        tracing::debug!("Review cancelled");
    }

    /// Kind and start of the open segment
    fn open_segment(&self, st: &EngineState) -> Option<(IntervalKind, DateTime<Local>)> {
        let kind = st.mode.open_kind()?;
        let started = truncate_ms(self.clock.now()) - TimeDelta::milliseconds(self.elapsed_ms(st));
        Some((kind, started))
    }
}
