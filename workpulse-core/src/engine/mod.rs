//! Time segment engine
//!
//! The engine owns the `Activity | Pause | Stopped` state machine, the list
//! of intervals closed during this process lifetime and the running clock
//! of the open segment. Every public entry point takes one coarse lock, so
//! button intents, lock events and checkpoint ticks arriving from different
//! threads never interleave partial transitions.
//!
//! Storage failures never reach callers of the transitions. They are logged
//! and the affected intervals stay in memory, flagged unsaved, until a later
//! save succeeds.

mod midnight;
mod review;

pub use midnight::split_at_midnight;
pub use review::{EntryOrigin, ReviewEntry, ReviewSession};

use crate::clock::{Clock, SystemClock};
use crate::config::{clamp_backpause, Config, TrackingConfig, WarningConfig};
use crate::db::{Store, START_MATCH_TOLERANCE_MS};
use crate::error::{Error, Result};
use crate::logging::component_span;
use crate::normalize::normalize_by_day;
use crate::types::{
    local_midnight, truncate_ms, CheckpointId, Interval, IntervalKind, LockEvent, Mode, OngoingInterval,
    TimeWarning, Totals,
};
use chrono::TimeDelta;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use tracing::Span;

/// Mutable engine state, only ever touched under the engine lock.
#[derive(Debug, Default)]
struct EngineState {
    mode: Mode,
    /// Closed intervals of the current session
    pending: Vec<Interval>,
    /// Intervals of earlier sessions whose save failed, retried with every flush
    backlog: Vec<Interval>,
    unsaved: bool,
    checkpoint_id: CheckpointId,
    /// Checkpoint rows of closed segments, deleted by the next save unless reused
    retired_checkpoints: Vec<i64>,
    /// Whether today's stored rows were taken into the session
    history_adopted: bool,
    /// Monotonic start of the open segment
    running_since: Option<Instant>,
    locked: bool,
    checkpoints_paused: bool,
    /// Set when a long lock back-paused the engine, cleared on unlock
    auto_paused: bool,
}

/// The work/pause tracker.
pub struct Engine {
    state: Mutex<EngineState>,
    store: Store,
    tracking: TrackingConfig,
    warnings: WarningConfig,
    clock: Arc<dyn Clock>,
    span: Span,
}

impl Engine {
    /// Create a stopped engine persisting into `store`.
    pub fn new(store: Store, config: &Config) -> Self {
        Self {
            state: Mutex::new(EngineState::default()),
            store,
            tracking: config.tracking.clone(),
            warnings: config.warnings.clone(),
            clock: Arc::new(SystemClock),
            span: component_span("engine"),
        }
    }

    /// Engine over the store at the configured location
    pub fn from_config(config: &Config) -> Self {
        Self::new(Store::from_config(config), config)
    }

    /// Use `clock` for the engine and its store.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.store = self.store.with_clock(clock.clone());
        self.clock = clock;
        self
    }

    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    fn state(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    // ============================================
    // Transitions
    // ============================================

    /// Start or resume tracking activity.
    pub fn start(&self) {
        let _entered = self.span.enter();
        let mut st = self.state();
        self.start_locked(&mut st);
    }

    /// Pause an active segment and save the session so far.
    pub fn pause(&self) {
        let _entered = self.span.enter();
        let mut st = self.state();
        self.pause_locked(&mut st);
    }

    /// Stop tracking and save the session.
    pub fn stop(&self) {
        let _entered = self.span.enter();
        let mut st = self.state();
        self.stop_locked(&mut st);
    }

    /// Reclassify the last `threshold` of the active segment as a pause.
    ///
    /// Used when the user turns out to have been away; the threshold is
    /// clamped to between one second and one hour.
    pub fn back_pause(&self, threshold: Duration) {
        let _entered = self.span.enter();
        let mut st = self.state();
        self.back_pause_locked(&mut st, threshold);
    }

    pub fn handle_lock_event(&self, event: LockEvent) {
        let _entered = self.span.enter();
        let mut st = self.state();
        tracing::debug!(?event, mode = %st.mode, "Lock event");

        match event {
            LockEvent::Lock => {
                if st.mode == Mode::Activity {
                    self.checkpoint_locked(&mut st, true);
                }
                st.locked = true;
            }
            LockEvent::Unlock => {
                st.locked = false;
                if st.auto_paused {
                    st.auto_paused = false;
                    if self.tracking.autopause {
                        self.start_locked(&mut st);
                    }
                }
            }
            LockEvent::LongOngoingLock => {
                if self.tracking.autopause && st.mode == Mode::Activity {
                    st.auto_paused = true;
                    self.back_pause_locked(&mut st, self.tracking.autopause_threshold());
                }
            }
        }
    }

    /// Save the open activity segment. Driven by a periodic scheduler.
    pub fn checkpoint_tick(&self) {
        let _entered = self.span.enter();
        let mut st = self.state();
        self.checkpoint_locked(&mut st, false);
    }

    /// Suspend or resume checkpoint ticks, e.g. while the history is being edited.
    pub fn set_checkpoints_paused(&self, paused: bool) {
        let _entered = self.span.enter();
        self.state().checkpoints_paused = paused;
        tracing::debug!(paused, "Checkpoints paused state changed");
    }

    fn start_locked(&self, st: &mut EngineState) {
        match st.mode {
            Mode::Activity => tracing::debug!("Start ignored, already active"),
            Mode::Pause => {
                if let Some(pause) = self.close_open(st) {
                    self.push_interval(st, pause);
                }
                self.enter_mode(st, Mode::Activity);
                tracing::info!("Activity resumed");
            }
            Mode::Stopped => {
                if st.unsaved {
                    self.retry_unsaved(st);
                }
                st.pending.clear();
                if !st.history_adopted {
                    self.adopt_today(st);
                }
                self.seed_boot_time(st);
                self.enter_mode(st, Mode::Activity);
                tracing::info!("Activity started");
            }
        }
    }

    fn pause_locked(&self, st: &mut EngineState) {
        if st.mode != Mode::Activity {
            tracing::debug!(mode = %st.mode, "Pause ignored");
            return;
        }

        if let Some(activity) = self.close_open(st) {
            self.push_interval(st, activity);
        }
        self.enter_mode(st, Mode::Pause);
        self.persist(st);
        tracing::info!("Activity paused");
    }

    fn stop_locked(&self, st: &mut EngineState) {
        if st.mode == Mode::Stopped {
            tracing::debug!("Stop ignored, already stopped");
            return;
        }

        if let Some(last) = self.close_open(st) {
            self.push_interval(st, last);
        }
        self.enter_mode(st, Mode::Stopped);
        st.auto_paused = false;

        if self.persist(st) {
            st.pending.clear();
        }
        tracing::info!(unsaved = st.unsaved, "Tracking stopped");
    }

    fn back_pause_locked(&self, st: &mut EngineState, threshold: Duration) {
        if !self.tracking.autopause || st.mode != Mode::Activity {
            tracing::debug!(mode = %st.mode, "Back-pause ignored");
            return;
        }

        let threshold_ms = clamp_backpause(threshold).as_millis() as i64;
        let elapsed_ms = self.elapsed_ms(st);
        retire_checkpoint(st);
        let now = truncate_ms(self.clock.now());
        let segment_start = now - TimeDelta::milliseconds(elapsed_ms);
        let pause_start = (now - TimeDelta::milliseconds(threshold_ms)).max(segment_start);

        if let Ok(activity) = Interval::new(IntervalKind::Activity, segment_start, pause_start) {
            self.push_interval(st, activity);
        }
        match Interval::new(IntervalKind::Pause, pause_start, now) {
            Ok(pause) => self.push_interval(st, pause),
            Err(_) => tracing::debug!("Back-pause covered no time"),
        }

        self.enter_mode(st, Mode::Pause);
        self.persist(st);
        tracing::info!(threshold_ms, elapsed_ms, "Back-paused");
    }

    fn checkpoint_locked(&self, st: &mut EngineState, forced: bool) {
        if st.checkpoints_paused {
            tracing::debug!("Checkpoint skipped, checkpoints paused");
            return;
        }
        if st.locked && !forced {
            tracing::debug!("Checkpoint skipped, session locked");
            return;
        }
        if st.mode != Mode::Activity {
            return;
        }

        let elapsed_ms = self.elapsed_ms(st);
        let now = self.clock.now();
        if let Err(e) =
            self.store
                .upsert_checkpoint(IntervalKind::Activity, elapsed_ms, now, &mut st.checkpoint_id)
        {
            tracing::warn!(error = %e, elapsed_ms, "Checkpoint failed");
        }
    }

    // ============================================
    // Segment bookkeeping
    // ============================================

    fn enter_mode(&self, st: &mut EngineState, mode: Mode) {
        st.mode = mode;
        st.checkpoint_id = None;
        st.running_since = match mode {
            Mode::Stopped => None,
            Mode::Activity | Mode::Pause => Some(self.clock.instant()),
        };
    }

    fn elapsed_ms(&self, st: &EngineState) -> i64 {
        st.running_since
            .map(|since| {
                let elapsed = self.clock.instant().saturating_duration_since(since);
                i64::try_from(elapsed.as_millis()).unwrap_or(i64::MAX)
            })
            .unwrap_or(0)
    }

    /// Close the open segment. Its end is now and its start is derived from
    /// the monotonic elapsed time, so wall-clock jumps do not change it.
    fn close_open(&self, st: &mut EngineState) -> Option<Interval> {
        let kind = st.mode.open_kind()?;
        let elapsed_ms = self.elapsed_ms(st);
        st.running_since = None;
        retire_checkpoint(st);

        match Interval::ending_at(kind, self.clock.now(), elapsed_ms) {
            Ok(interval) => Some(interval),
            Err(_) => {
                tracing::debug!(kind = %kind, elapsed_ms, "Dropping empty segment");
                None
            }
        }
    }

    /// Append a closed interval, saving the parts of past days right away.
    fn push_interval(&self, st: &mut EngineState, interval: Interval) {
        let mut parts = match split_at_midnight(interval.clone()) {
            Ok(parts) => parts,
            Err(e) => {
                tracing::warn!(error = %e, "Midnight split failed, keeping interval whole");
                vec![interval]
            }
        };
        let Some(today) = parts.pop() else {
            return;
        };

        if !parts.is_empty() {
            match self
                .store
                .upsert_superseding(&parts, &[], &st.retired_checkpoints)
            {
                Ok(()) => st.retired_checkpoints.clear(),
                Err(e) => {
                    tracing::warn!(error = %e, count = parts.len(), "Saving past day failed");
                    st.backlog.extend(parts);
                    st.unsaved = true;
                }
            }
        }

        self.buffer(st, today);
    }

    fn buffer(&self, st: &mut EngineState, interval: Interval) {
        if st.pending.try_reserve(1).is_err() {
            tracing::error!(pending = st.pending.len(), "Cannot grow pending list, flushing");
            self.emergency_flush(st);
        }
        st.pending.push(interval);
    }

    /// Save what is pending and release the list's memory. On failure the
    /// list is kept and flagged unsaved.
    fn emergency_flush(&self, st: &mut EngineState) {
        match self.flush(st) {
            Ok(()) => {
                st.pending = Vec::new();
                st.unsaved = false;
            }
            Err(e) => {
                tracing::error!(error = %e, "Emergency flush failed");
                st.unsaved = true;
            }
        }
    }

    /// Take today's stored rows into the session on the first start.
    ///
    /// A previous process that died mid-segment leaves its last checkpoint
    /// behind as a row; adopting the day makes it count toward today's
    /// totals. Adopted rows carry their stored start, so the next save
    /// matches each one to its own row and updates it in place.
    fn adopt_today(&self, st: &mut EngineState) {
        let today = self.clock.now().date_naive();
        let from = local_midnight(today);
        let to = today
            .succ_opt()
            .map(local_midnight)
            .unwrap_or(from + TimeDelta::days(1));

        let rows = match self.store.load_range(from, to) {
            Ok(rows) => rows,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot load today's history, starting empty");
                return;
            }
        };
        st.history_adopted = true;

        // Backlog entries are saved from memory already
        let adopted: Vec<Interval> = rows
            .into_iter()
            .filter(|row| {
                !st.backlog.iter().any(|iv| {
                    iv.kind() == row.kind()
                        && (iv.start() - row.start()).num_milliseconds().abs()
                            <= START_MATCH_TOLERANCE_MS
                })
            })
            .collect();
        if !adopted.is_empty() {
            tracing::info!(count = adopted.len(), "Adopted today's stored intervals");
        }
        st.pending = adopted;
    }

    fn seed_boot_time(&self, st: &mut EngineState) {
        let boot = self.tracking.boot_time();
        if boot.is_zero() {
            return;
        }

        let now = self.clock.now();
        let today = now.date_naive();
        let known_today = st
            .pending
            .iter()
            .chain(&st.backlog)
            .any(|iv| iv.date() == today || iv.end().date_naive() == today);
        if known_today {
            return;
        }

        match self.store.has_entries_for_date(today) {
            Ok(false) => {}
            Ok(true) => return,
            Err(e) => {
                tracing::warn!(error = %e, "Cannot check today's history, not seeding boot time");
                return;
            }
        }

        let boot_ms = i64::try_from(boot.as_millis()).unwrap_or(i64::MAX);
        match Interval::ending_at(IntervalKind::Activity, now, boot_ms) {
            Ok(seed) => {
                tracing::info!(boot_ms, "Seeded boot time");
                self.push_interval(st, seed);
            }
            Err(e) => tracing::warn!(error = %e, "Invalid boot time"),
        }
    }

    // ============================================
    // Saving
    // ============================================

    /// Upsert backlog and pending intervals, normalized per day.
    ///
    /// Rows of intervals folded into a neighbour by normalization are removed
    /// in the same transaction, so earlier saves and checkpoints of them do
    /// not linger as duplicates.
    fn flush(&self, st: &mut EngineState) -> Result<()> {
        let raw: Vec<Interval> = st.backlog.iter().chain(&st.pending).cloned().collect();
        if raw.is_empty() && st.retired_checkpoints.is_empty() {
            return Ok(());
        }

        let cleaned = normalize_by_day(raw.clone());
        let superseded: Vec<Interval> = raw
            .into_iter()
            .filter(|r| {
                !cleaned
                    .iter()
                    .any(|c| c.kind() == r.kind() && c.start() == r.start())
            })
            .collect();

        self.store
            .upsert_superseding(&cleaned, &superseded, &st.retired_checkpoints)?;
        st.backlog.clear();
        st.retired_checkpoints.clear();
        Ok(())
    }

    /// Flush, flagging the session unsaved on failure. Returns true on success.
    fn persist(&self, st: &mut EngineState) -> bool {
        match self.flush(st) {
            Ok(()) => {
                st.unsaved = false;
                true
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    pending = st.pending.len(),
                    backlog = st.backlog.len(),
                    "Saving intervals failed, keeping them in memory"
                );
                st.unsaved = true;
                false
            }
        }
    }

    fn retry_unsaved(&self, st: &mut EngineState) {
        match self.flush(st) {
            Ok(()) => {
                st.unsaved = false;
                tracing::info!("Saved intervals of the previous session");
            }
            Err(e) => {
                let stranded = std::mem::take(&mut st.pending);
                tracing::warn!(
                    error = %e,
                    count = stranded.len(),
                    "Retry failed, keeping previous session for the next save"
                );
                st.backlog.extend(stranded);
            }
        }
    }

    // ============================================
    // Queries
    // ============================================

    pub fn mode(&self) -> Mode {
        self.state().mode
    }

    /// Closed intervals of the current session
    pub fn pending(&self) -> Vec<Interval> {
        self.state().pending.clone()
    }

    /// Activity and pause totals of the session, including the open segment.
    pub fn totals(&self) -> Totals {
        let st = self.state();
        let mut totals = Totals::of(&st.pending);
        if let Some(kind) = st.mode.open_kind() {
            totals.add(kind, self.elapsed_ms(&st));
        }
        totals
    }

    /// The open segment as of now, `None` when stopped
    pub fn ongoing(&self) -> Option<OngoingInterval> {
        let st = self.state();
        let kind = st.mode.open_kind()?;
        let duration_ms = self.elapsed_ms(&st);
        Some(OngoingInterval {
            kind,
            started_at: truncate_ms(self.clock.now()) - TimeDelta::milliseconds(duration_ms),
            duration_ms,
        })
    }

    /// Whether some intervals could not be saved yet
    pub fn has_unsaved(&self) -> bool {
        let st = self.state();
        st.unsaved || !st.backlog.is_empty()
    }

    pub fn is_locked(&self) -> bool {
        self.state().locked
    }

    pub fn checkpoints_paused(&self) -> bool {
        self.state().checkpoints_paused
    }

    /// Compare the session's activity total against the warning thresholds.
    ///
    /// A threshold of zero minutes is disabled.
    pub fn warning(&self) -> Option<TimeWarning> {
        let activity_ms = self.totals().activity_ms;
        let limit_ms = i64::from(self.warnings.activity_limit_minutes) * 60_000;
        let warning_ms = i64::from(self.warnings.activity_warning_minutes) * 60_000;

        if limit_ms > 0 && activity_ms >= limit_ms {
            Some(TimeWarning::Exceeded)
        } else if warning_ms > 0 && activity_ms >= warning_ms {
            Some(TimeWarning::Approaching)
        } else {
            None
        }
    }

    // ============================================
    // Direct mutation
    // ============================================

    /// Change the kind of one pending interval.
    pub fn set_pending_kind(&self, index: usize, kind: IntervalKind) -> Result<()> {
        let _entered = self.span.enter();
        let mut st = self.state();
        let len = st.pending.len();
        let interval = st
            .pending
            .get_mut(index)
            .ok_or(Error::IndexOutOfRange { index, len })?;
        interval.set_kind(kind);
        tracing::debug!(index, kind = %kind, "Pending interval reclassified");
        Ok(())
    }

    /// Overwrite the pending list without any transition logic.
    pub fn replace_pending(&self, intervals: Vec<Interval>) {
        let _entered = self.span.enter();
        let mut st = self.state();
        tracing::debug!(
            before = st.pending.len(),
            after = intervals.len(),
            "Pending list replaced"
        );
        st.pending = intervals;
    }
}

/// Hand the open segment's checkpoint row over to the next save.
///
/// The closed segment's start is derived again from the monotonic elapsed
/// time, so after a wall-clock adjustment it may no longer match the row by
/// start. Remembering the id lets that save delete the row instead.
fn retire_checkpoint(st: &mut EngineState) {
    if let Some(row_id) = st.checkpoint_id.take() {
        st.retired_checkpoints.push(row_id);
    }
}
