//! workpulse - work/pause time tracker
//!
//! Drives the tracking engine from stdin intents and inspects the store.
//!
//! Uses XDG Base Directory specification for file locations:
//! - Store: $XDG_DATA_HOME/workpulse/workpulse.db (~/.local/share/workpulse/workpulse.db)
//! - Logs: $XDG_STATE_HOME/workpulse/ (~/.local/state/workpulse/)
//! - Config: $XDG_CONFIG_HOME/workpulse/config.toml (~/.config/workpulse/config.toml)

mod process_lock;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Days, Local, NaiveDate};
use clap::{Parser, Subcommand};
use process_lock::acquire_run_guard;
use serde::Deserialize;
use std::collections::BTreeMap;
use std::io::{self, BufRead};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use workpulse_core::types::local_midnight;
use workpulse_core::{
    CheckpointTicker, Config, Engine, Interval, IntervalKind, LockEvent, Store, TimeWarning,
};

#[derive(Parser)]
#[command(name = "workpulse")]
#[command(about = "Crash-resilient work/pause time tracker")]
#[command(version)]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Track time, reading intents from stdin
    ///
    /// Intents: start, pause, stop, lock, unlock, long-lock, status, quit
    Run,

    /// List stored intervals day by day
    History {
        /// Number of days to show, counting today
        #[arg(short, long, default_value = "7")]
        days: u32,

        /// Print intervals as JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Check that the store was written by a compatible version
    CheckSchema,

    /// Append intervals from a JSON file
    Import {
        /// JSON array of `{ "kind", "start", "end" }` objects
        file: PathBuf,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();

    let config = Config::load().context("failed to load configuration")?;

    let _log_guard =
        workpulse_core::logging::init(&config.logging).context("failed to initialize logging")?;

    tracing::info!("workpulse starting");

    match args.command {
        Command::Run => run(&config),
        Command::History { days, json } => history(&config, days, json),
        Command::CheckSchema => check_schema(&config),
        Command::Import { file } => import(&config, &file),
    }
}

// ============================================
// run
// ============================================

/// Button and lock intents read from stdin
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Intent {
    Start,
    Pause,
    Stop,
    Lock,
    Unlock,
    LongLock,
    Status,
    Quit,
}

impl FromStr for Intent {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "start" => Ok(Intent::Start),
            "pause" => Ok(Intent::Pause),
            "stop" => Ok(Intent::Stop),
            "lock" => Ok(Intent::Lock),
            "unlock" => Ok(Intent::Unlock),
            "long-lock" => Ok(Intent::LongLock),
            "status" => Ok(Intent::Status),
            "quit" | "exit" => Ok(Intent::Quit),
            other => Err(format!("unknown command: {other}")),
        }
    }
}

fn run(config: &Config) -> Result<()> {
    let db_path = Config::database_path();
    let _run_guard = acquire_run_guard(&db_path).context("failed to acquire process lock")?;

    let engine = Arc::new(Engine::from_config(config));
    let report = engine
        .store()
        .check_schema()
        .context("failed to inspect store")?;
    if !report.is_compatible() {
        bail!(
            "store at {} is incompatible (missing columns: {})",
            db_path.display(),
            report.missing_columns.join(", ")
        );
    }

    let ticker = CheckpointTicker::spawn(engine.clone(), config.tracking.checkpoint_interval())
        .context("failed to start checkpoint ticker")?;

    // Set up signal handler for graceful shutdown
    let running = Arc::new(AtomicBool::new(true));
    let r = running.clone();
    ctrlc::set_handler(move || {
        r.store(false, Ordering::SeqCst);
    })
    .context("failed to set Ctrl+C handler")?;

    let (line_tx, line_rx) = mpsc::channel::<String>();
    thread::Builder::new()
        .name("workpulse-stdin".to_string())
        .spawn(move || {
            for line in io::stdin().lock().lines() {
                let Ok(line) = line else { break };
                if line_tx.send(line).is_err() {
                    break;
                }
            }
        })
        .context("failed to start input reader")?;

    println!("Store: {}", db_path.display());
    println!("Logs: {}", workpulse_core::logging::log_dir().display());
    println!("Commands: start, pause, stop, lock, unlock, long-lock, status, quit");

    while running.load(Ordering::SeqCst) {
        let line = match line_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(line) => line,
            Err(RecvTimeoutError::Timeout) => continue,
            // stdin closed
            Err(RecvTimeoutError::Disconnected) => break,
        };
        if line.trim().is_empty() {
            continue;
        }

        match line.parse::<Intent>() {
            Ok(Intent::Quit) => break,
            Ok(intent) => {
                apply(&engine, intent, config);
                print_status(&engine);
            }
            Err(e) => eprintln!("{e}"),
        }
    }

    ticker.stop();
    engine.stop();
    print_status(&engine);
    if engine.has_unsaved() {
        eprintln!("warning: some intervals could not be saved, see the log");
    }

    tracing::info!("workpulse run stopped");
    Ok(())
}

fn apply(engine: &Engine, intent: Intent, config: &Config) {
    tracing::debug!(?intent, "Intent received");
    match intent {
        Intent::Start => engine.start(),
        Intent::Pause => engine.pause(),
        Intent::Stop => engine.stop(),
        Intent::Lock => engine.handle_lock_event(LockEvent::Lock),
        Intent::Unlock => engine.handle_lock_event(LockEvent::Unlock),
        Intent::LongLock => {
            if !config.tracking.autopause {
                println!("autopause is disabled");
            }
            engine.handle_lock_event(LockEvent::LongOngoingLock);
        }
        Intent::Status | Intent::Quit => {}
    }
}

fn print_status(engine: &Engine) {
    let totals = engine.totals();
    let mut line = format!(
        "{:<8} activity {:>8}  pause {:>8}",
        engine.mode(),
        format_duration(totals.activity_ms),
        format_duration(totals.pause_ms)
    );
    match engine.warning() {
        Some(TimeWarning::Approaching) => line.push_str("  (approaching daily limit)"),
        Some(TimeWarning::Exceeded) => line.push_str("  (daily limit exceeded)"),
        None => {}
    }
    println!("{line}");
}

// ============================================
// history
// ============================================

fn history(config: &Config, days: u32, json: bool) -> Result<()> {
    let store = Store::from_config(config);
    let today = Local::now().date_naive();
    let first = today
        .checked_sub_days(Days::new(u64::from(days.max(1) - 1)))
        .unwrap_or(today);
    let after_today = today.succ_opt().unwrap_or(today);

    let intervals = store
        .load_range(local_midnight(first), local_midnight(after_today))
        .context("failed to load history")?;

    if json {
        let rendered =
            serde_json::to_string_pretty(&intervals).context("failed to serialize intervals")?;
        println!("{rendered}");
        return Ok(());
    }

    if intervals.is_empty() {
        println!("No intervals in the last {} day(s)", days.max(1));
        return Ok(());
    }

    let mut by_day: BTreeMap<NaiveDate, Vec<&Interval>> = BTreeMap::new();
    for interval in &intervals {
        by_day.entry(interval.date()).or_default().push(interval);
    }

    for (date, day) in by_day {
        let (activity, pause) = day.iter().fold((0, 0), |(a, p), iv| match iv.kind() {
            IntervalKind::Activity => (a + iv.duration_ms(), p),
            IntervalKind::Pause => (a, p + iv.duration_ms()),
        });
        println!(
            "{date}  activity {}  pause {}",
            format_duration(activity),
            format_duration(pause)
        );
        for iv in day {
            println!(
                "  {} - {}  {:<8} {:>8}",
                iv.start().format("%H:%M:%S"),
                iv.end().format("%H:%M:%S"),
                iv.kind(),
                format_duration(iv.duration_ms())
            );
        }
    }

    Ok(())
}

// ============================================
// check-schema
// ============================================

fn check_schema(config: &Config) -> Result<()> {
    let store = Store::from_config(config);
    let report = store.check_schema().context("failed to inspect store")?;

    println!("Store: {}", store.path().display());
    println!("  Schema version: {}", report.version);
    println!(
        "  intervals table: {}",
        if report.table_present { "present" } else { "absent" }
    );

    if !report.is_compatible() {
        if !report.missing_columns.is_empty() {
            println!("  Missing columns: {}", report.missing_columns.join(", "));
        }
        bail!("store schema is incompatible");
    }

    println!("  Status: compatible");
    Ok(())
}

// ============================================
// import
// ============================================

#[derive(Debug, Deserialize)]
struct ImportRecord {
    kind: IntervalKind,
    start: DateTime<Local>,
    end: DateTime<Local>,
}

fn import(config: &Config, file: &Path) -> Result<()> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("failed to read {}", file.display()))?;
    let records: Vec<ImportRecord> = serde_json::from_str(&content)
        .with_context(|| format!("failed to parse {}", file.display()))?;

    let intervals = records
        .into_iter()
        .enumerate()
        .map(|(i, r)| {
            Interval::new(r.kind, r.start, r.end)
                .with_context(|| format!("invalid interval at index {i}"))
        })
        .collect::<Result<Vec<_>>>()?;

    let store = Store::from_config(config);
    if !store.is_enabled() {
        println!("Retention is 0 days; nothing is stored");
        return Ok(());
    }

    store
        .append(&intervals)
        .context("failed to append intervals")?;

    tracing::info!(count = intervals.len(), file = %file.display(), "Imported intervals");
    println!("Imported {} interval(s)", intervals.len());
    Ok(())
}

/// Render milliseconds as `1h 05m` or `4m 09s`.
fn format_duration(ms: i64) -> String {
    let secs = ms.max(0) / 1000;
    let (hours, minutes, seconds) = (secs / 3600, (secs % 3600) / 60, secs % 60);
    if hours > 0 {
        format!("{hours}h {minutes:02}m")
    } else {
        format!("{minutes}m {seconds:02}s")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0), "0m 00s");
        assert_eq!(format_duration(249_000), "4m 09s");
        assert_eq!(format_duration(3_900_000), "1h 05m");
        assert_eq!(format_duration(-5), "0m 00s");
    }

    #[test]
    fn test_parse_intents() {
        assert_eq!("start".parse::<Intent>(), Ok(Intent::Start));
        assert_eq!(" Long-Lock ".parse::<Intent>(), Ok(Intent::LongLock));
        assert_eq!("exit".parse::<Intent>(), Ok(Intent::Quit));
        assert!("resume".parse::<Intent>().is_err());
    }
}
