//! Integration tests for the engine and store working together
//!
//! Each test runs against a fresh store file in a temporary directory and
//! drives time with a `ManualClock`, except the concurrency test which uses
//! real clocks.

use chrono::{DateTime, Local, TimeDelta, TimeZone};
use rusqlite::Connection;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use tempfile::TempDir;
use workpulse_core::db::backup;
use workpulse_core::{
    Config, Engine, Interval, IntervalKind, LockEvent, ManualClock, Mode, Store,
};

fn morning() -> DateTime<Local> {
    Local.with_ymd_and_hms(2024, 7, 15, 9, 0, 0).unwrap()
}

fn store_path(dir: &TempDir) -> std::path::PathBuf {
    dir.path().join("data").join("workpulse.db")
}

/// Engine as a fresh process would build it over an existing store file.
fn engine(dir: &TempDir, clock: &Arc<ManualClock>, config: &Config) -> Engine {
    workpulse_core::logging::init_test();
    let store = Store::new(store_path(dir), config.tracking.retention_days)
        .with_backup_keep(config.tracking.backup_keep);
    Engine::new(store, config).with_clock(clock.clone())
}

fn advance_minutes(clock: &ManualClock, minutes: u64) {
    clock.advance(Duration::from_secs(minutes * 60));
}

fn minutes_of(intervals: &[Interval]) -> Vec<(IntervalKind, i64)> {
    intervals
        .iter()
        .map(|iv| (iv.kind(), iv.duration_ms() / 60_000))
        .collect()
}

// ============================================
// Session lifecycle
// ============================================

#[test]
fn test_activity_pause_activity_durations_match_elapsed() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(morning()));
    let engine = engine(&dir, &clock, &Config::default());

    engine.start();
    advance_minutes(&clock, 45);
    engine.pause();
    advance_minutes(&clock, 15);
    engine.start();
    advance_minutes(&clock, 60);
    engine.stop();

    let stored = engine.store().load().unwrap();
    assert_eq!(
        minutes_of(&stored),
        vec![
            (IntervalKind::Activity, 45),
            (IntervalKind::Pause, 15),
            (IntervalKind::Activity, 60),
        ]
    );
    assert_eq!(stored.first().unwrap().start(), morning());
    assert_eq!(
        stored.last().unwrap().end(),
        morning() + TimeDelta::minutes(120)
    );
}

#[test]
fn test_repeated_sessions_do_not_duplicate_rows() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(morning()));
    let engine = engine(&dir, &clock, &Config::default());

    engine.start();
    advance_minutes(&clock, 30);
    engine.pause();
    // A second save of the same session matches the rows by start time
    advance_minutes(&clock, 5);
    engine.stop();
    assert_eq!(engine.store().row_count().unwrap(), 2);

    advance_minutes(&clock, 60);
    engine.start();
    advance_minutes(&clock, 10);
    engine.stop();
    assert_eq!(
        minutes_of(&engine.store().load().unwrap()),
        vec![
            (IntervalKind::Activity, 30),
            (IntervalKind::Pause, 5),
            (IntervalKind::Activity, 10),
        ]
    );
}

// ============================================
// Crash resilience
// ============================================

#[test]
fn test_checkpoint_survives_crash() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(morning()));
    let mut config = Config::default();
    config.tracking.boot_time_seconds = 600;

    {
        let first = engine(&dir, &clock, &config);
        first.start();
        advance_minutes(&clock, 20);
        first.checkpoint_tick();
        advance_minutes(&clock, 3);
        // Process dies here without stopping
    }

    let restarted = engine(&dir, &clock, &config);
    let stored = restarted.store().load().unwrap();
    // Only checkpoints reach the store while a segment is open
    assert_eq!(minutes_of(&stored), vec![(IntervalKind::Activity, 20)]);
    assert_eq!(stored[0].start(), morning());

    // The orphaned checkpoint is adopted; today has history, so no boot seed
    restarted.start();
    assert_eq!(
        minutes_of(&restarted.pending()),
        vec![(IntervalKind::Activity, 20)]
    );
    advance_minutes(&clock, 5);
    assert_eq!(restarted.totals().activity_ms, 25 * 60_000);

    restarted.stop();
    assert_eq!(restarted.store().row_count().unwrap(), 2);
    assert_eq!(
        minutes_of(&restarted.store().load().unwrap()),
        vec![(IntervalKind::Activity, 20), (IntervalKind::Activity, 5)]
    );
}

#[test]
fn test_wall_clock_adjustment_does_not_double_count() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(morning()));
    let engine = engine(&dir, &clock, &Config::default());

    engine.start();
    advance_minutes(&clock, 5);
    engine.checkpoint_tick();
    // NTP step forward between checkpoint and close
    clock.set_wall(morning() + TimeDelta::minutes(5) + TimeDelta::seconds(30));
    advance_minutes(&clock, 5);
    engine.checkpoint_tick();
    advance_minutes(&clock, 5);
    engine.stop();

    let stored = engine.store().load().unwrap();
    assert_eq!(stored.len(), 1);
    let total: i64 = stored.iter().map(Interval::duration_ms).sum();
    assert_eq!(total, 15 * 60_000);
}

#[test]
fn test_checkpoint_row_deleted_externally_is_recreated() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(morning()));
    let engine = engine(&dir, &clock, &Config::default());

    engine.start();
    advance_minutes(&clock, 5);
    engine.checkpoint_tick();

    let conn = Connection::open(store_path(&dir)).unwrap();
    let old_id: i64 = conn
        .query_row("SELECT id FROM intervals", [], |r| r.get(0))
        .unwrap();
    conn.execute("DELETE FROM intervals", []).unwrap();

    advance_minutes(&clock, 5);
    engine.checkpoint_tick();

    let new_id: i64 = conn
        .query_row("SELECT id FROM intervals", [], |r| r.get(0))
        .unwrap();
    assert_ne!(old_id, new_id);
    assert_eq!(
        minutes_of(&engine.store().load().unwrap()),
        vec![(IntervalKind::Activity, 10)]
    );
}

#[test]
fn test_long_lock_corrects_checkpointed_activity() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(morning()));
    let engine = engine(&dir, &clock, &Config::default());

    engine.start();
    advance_minutes(&clock, 30);
    engine.handle_lock_event(LockEvent::Lock);
    advance_minutes(&clock, 12);
    engine.handle_lock_event(LockEvent::LongOngoingLock);
    advance_minutes(&clock, 8);
    engine.handle_lock_event(LockEvent::Unlock);
    advance_minutes(&clock, 10);
    engine.stop();

    // Default backpause window is ten minutes
    assert_eq!(
        minutes_of(&engine.store().load().unwrap()),
        vec![
            (IntervalKind::Activity, 32),
            (IntervalKind::Pause, 18),
            (IntervalKind::Activity, 10),
        ]
    );
    assert_eq!(engine.mode(), Mode::Stopped);
}

// ============================================
// Retention and backups
// ============================================

#[test]
fn test_rows_past_retention_are_pruned() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(morning()));
    let mut config = Config::default();
    config.tracking.retention_days = 3;
    let engine = engine(&dir, &clock, &config);

    engine.start();
    advance_minutes(&clock, 30);
    engine.stop();
    assert_eq!(engine.store().row_count().unwrap(), 1);

    clock.set_wall(morning() + TimeDelta::days(2));
    assert_eq!(engine.store().row_count().unwrap(), 1);

    clock.set_wall(morning() + TimeDelta::days(4));
    assert_eq!(engine.store().row_count().unwrap(), 0);
}

#[test]
fn test_zero_retention_never_touches_disk() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(morning()));
    let mut config = Config::default();
    config.tracking.retention_days = 0;
    let engine = engine(&dir, &clock, &config);

    engine.start();
    advance_minutes(&clock, 10);
    engine.checkpoint_tick();
    engine.pause();
    advance_minutes(&clock, 10);
    engine.stop();

    let session = engine.begin_review().unwrap();
    assert!(session.is_empty());
    engine.commit_review(session).unwrap();

    assert!(!engine.has_unsaved());
    assert!(!dir.path().join("data").exists());
}

#[test]
fn test_backups_are_rotated() {
    let dir = TempDir::new().unwrap();
    let clock = Arc::new(ManualClock::new(morning()));
    let store = Store::new(store_path(&dir), 30)
        .with_backup_keep(2)
        .with_clock(clock.clone());

    for i in 0..4 {
        let start = morning() + TimeDelta::hours(i);
        let iv = Interval::new(IntervalKind::Activity, start, start + TimeDelta::minutes(30)).unwrap();
        store.append(&[iv]).unwrap();
        clock.advance(Duration::from_secs(1));
    }

    let dumps: Vec<_> = std::fs::read_dir(backup::backup_dir(&store_path(&dir)))
        .unwrap()
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().is_some_and(|x| x == "txt"))
        .collect();
    assert_eq!(dumps.len(), 2);
    assert_eq!(store.row_count().unwrap(), 4);
}

// ============================================
// Concurrency
// ============================================

#[test]
fn test_concurrent_events_leave_consistent_history() {
    let dir = TempDir::new().unwrap();
    let store = Store::new(store_path(&dir), 30);
    let engine = Arc::new(Engine::new(store, &Config::default()));
    let started = std::time::Instant::now();

    let workers: Vec<_> = (0..4)
        .map(|worker| {
            let engine = engine.clone();
            thread::spawn(move || {
                for step in 0..25 {
                    match (worker + step) % 5 {
                        0 => engine.start(),
                        1 => engine.pause(),
                        2 => engine.checkpoint_tick(),
                        3 => {
                            let _ = engine.totals();
                            let _ = engine.ongoing();
                        }
                        _ => engine.handle_lock_event(LockEvent::Lock),
                    }
                    engine.handle_lock_event(LockEvent::Unlock);
                    thread::sleep(Duration::from_millis(1));
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().unwrap();
    }
    engine.stop();

    let wall_ms = started.elapsed().as_millis() as i64;
    let stored = engine.store().load().unwrap();
    assert!(stored.iter().all(|iv| iv.duration_ms() > 0));
    let total: i64 = stored.iter().map(Interval::duration_ms).sum();
    assert!(total <= wall_ms + 1_000, "stored {total}ms in {wall_ms}ms");
    assert!(!engine.has_unsaved());
}
