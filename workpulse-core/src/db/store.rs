//! Durable interval store
//!
//! A [`Store`] never holds a connection between calls: every public
//! operation opens the SQLite file, applies migrations and retention, does
//! its work and closes it again, so other tools can read or copy the file
//! in between. With a retention horizon of zero days every operation is a
//! successful no-op.

use super::backup::{self, BackupMode};
use super::schema::{self, SchemaReport};
use crate::clock::{Clock, SystemClock};
use crate::config::Config;
use crate::error::{Error, Result};
use crate::logging::component_span;
use crate::types::{
    local_midnight, truncate_ms, CheckpointId, Interval, IntervalKind,
};
use chrono::{DateTime, Local, NaiveDate, NaiveDateTime, TimeDelta, TimeZone, Utc};
use rusqlite::{params, Connection, OpenFlags};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::Span;

/// Maximum distance between starts for two rows to be the same logical segment.
pub const START_MATCH_TOLERANCE_MS: i64 = 2_000;

const DATE_FORMAT: &str = "%Y-%m-%d";
const TIME_FORMAT: &str = "%H:%M:%S%.3f";
const BUSY_TIMEOUT: Duration = Duration::from_secs(2);

const SELECT_COLUMNS: &str =
    "SELECT id, type, duration, start_date, start_time, end_date, end_time FROM intervals";

/// Split a timestamp into its UTC date and time columns.
fn to_columns(ts: DateTime<Local>) -> (String, String) {
    let utc = ts.with_timezone(&Utc);
    (
        utc.format(DATE_FORMAT).to_string(),
        utc.format(TIME_FORMAT).to_string(),
    )
}

/// Comparable `YYYY-MM-DDTHH:MM:SS.mmm` UTC stamp, matching
/// `date || 'T' || time` in SQL.
fn to_stamp(ts: DateTime<Local>) -> String {
    let (date, time) = to_columns(ts);
    format!("{date}T{time}")
}

fn from_columns(date: &str, time: &str) -> Option<DateTime<Local>> {
    NaiveDateTime::parse_from_str(&format!("{date} {time}"), "%Y-%m-%d %H:%M:%S%.f")
        .ok()
        .map(|naive| Utc.from_utc_datetime(&naive).with_timezone(&Local))
}

/// A raw row, decoded leniently so bad rows can be skipped one by one.
struct RawRow {
    id: i64,
    kind: Option<i64>,
    duration: Option<i64>,
    start_date: Option<String>,
    start_time: Option<String>,
    end_date: Option<String>,
    end_time: Option<String>,
}

impl RawRow {
    fn from_row(row: &rusqlite::Row) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            kind: row.get(1).ok(),
            duration: row.get(2).ok(),
            start_date: row.get(3).ok(),
            start_time: row.get(4).ok(),
            end_date: row.get(5).ok(),
            end_time: row.get(6).ok(),
        })
    }

    fn into_interval(self) -> std::result::Result<Interval, String> {
        let kind = self
            .kind
            .and_then(IntervalKind::from_code)
            .ok_or_else(|| format!("invalid type code {:?}", self.kind))?;
        let duration = self.duration.ok_or("missing duration")?;
        let start = match (&self.start_date, &self.start_time) {
            (Some(d), Some(t)) => from_columns(d, t),
            _ => None,
        }
        .ok_or("unparseable start timestamp")?;
        let end = match (&self.end_date, &self.end_time) {
            (Some(d), Some(t)) => from_columns(d, t),
            _ => None,
        }
        .ok_or("unparseable end timestamp")?;

        Interval::from_stored(kind, start, end, duration).map_err(|e| e.to_string())
    }
}

/// Handle to the on-disk interval store
#[derive(Clone)]
pub struct Store {
    path: PathBuf,
    retention_days: u32,
    backup_keep: usize,
    clock: Arc<dyn Clock>,
    span: Span,
}

impl Store {
    /// Store at `path` keeping `retention_days` of history.
    pub fn new(path: impl Into<PathBuf>, retention_days: u32) -> Self {
        Self {
            path: path.into(),
            retention_days,
            backup_keep: 10,
            clock: Arc::new(SystemClock),
            span: component_span("store"),
        }
    }

    /// Store at the configured XDG location
    pub fn from_config(config: &Config) -> Self {
        Self::new(Config::database_path(), config.tracking.retention_days)
            .with_backup_keep(config.tracking.backup_keep)
    }

    pub fn with_backup_keep(mut self, keep: usize) -> Self {
        self.backup_keep = keep;
        self
    }

    /// Clock used for retention cut-offs and backup names
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Span the store logs under
    pub fn with_span(mut self, span: Span) -> Self {
        self.span = span;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn retention_days(&self) -> u32 {
        self.retention_days
    }

    /// False when the retention horizon is zero days
    pub fn is_enabled(&self) -> bool {
        self.retention_days > 0
    }

    // ============================================
    // Connection lifecycle
    // ============================================

    /// Open the store for one logical operation.
    fn open(&self) -> Result<Connection> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(&self.path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            ",
        )?;

        // Refuse incompatible stores before touching their version
        let report = schema::inspect(&conn)?;
        if !report.is_compatible() {
            return Err(Error::Schema(format!(
                "intervals table is missing columns: {}",
                report.missing_columns.join(", ")
            )));
        }

        schema::run_migrations(&conn)?;

        if let Err(e) = self.prune(&conn) {
            tracing::warn!(error = %e, "Retention cleanup failed");
        }

        Ok(conn)
    }

    /// Delete rows that ended before the retention horizon.
    fn prune(&self, conn: &Connection) -> Result<usize> {
        let today = self.clock.now().date_naive();
        let cutoff_date = today
            .checked_sub_days(chrono::Days::new(u64::from(self.retention_days)))
            .unwrap_or(NaiveDate::MIN);
        let cutoff = to_stamp(local_midnight(cutoff_date));

        let tx = conn.unchecked_transaction()?;
        let removed = tx.execute(
            "DELETE FROM intervals WHERE end_date || 'T' || end_time < ?1",
            [&cutoff],
        )?;
        tx.commit()?;

        if removed > 0 {
            tracing::info!(removed, cutoff = %cutoff, "Pruned rows past retention");
        }
        Ok(removed)
    }

    // ============================================
    // Bulk writes
    // ============================================

    /// Append intervals in one transaction, after a backup snapshot.
    pub fn append(&self, intervals: &[Interval]) -> Result<()> {
        let _entered = self.span.enter();
        if !self.is_enabled() || intervals.is_empty() {
            return Ok(());
        }

        self.backup(BackupMode::Append, intervals);

        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        for interval in intervals {
            insert_row(&tx, interval)?;
        }
        tx.commit()?;

        tracing::debug!(count = intervals.len(), "Appended intervals");
        Ok(())
    }

    /// Replace every stored row with `intervals`, after a backup snapshot.
    pub fn replace(&self, intervals: &[Interval]) -> Result<()> {
        let _entered = self.span.enter();
        if !self.is_enabled() {
            return Ok(());
        }

        self.backup(BackupMode::Replace, intervals);

        let mut conn = self.open()?;
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM intervals", [])?;
        for interval in intervals {
            insert_row(&tx, interval)?;
        }
        tx.commit()?;

        tracing::info!(count = intervals.len(), "Replaced stored intervals");
        Ok(())
    }

    fn backup(&self, mode: BackupMode, intervals: &[Interval]) {
        match backup::write_backup(
            &self.path,
            mode,
            intervals,
            self.clock.now(),
            self.backup_keep,
        ) {
            Ok(dump) => tracing::debug!(dump = %dump.display(), "Backup written"),
            Err(e) => tracing::warn!(error = %e, mode = mode.as_str(), "Backup failed, continuing"),
        }
    }

    // ============================================
    // Reads
    // ============================================

    /// All valid rows, ordered by end timestamp.
    pub fn load(&self) -> Result<Vec<Interval>> {
        let _entered = self.span.enter();
        if !self.is_enabled() {
            return Ok(Vec::new());
        }

        let conn = self.open()?;
        let sql = format!("{SELECT_COLUMNS} ORDER BY end_date, end_time, id");
        self.collect_rows(&conn, &sql, [])
    }

    /// Valid rows starting in `[from, to)`, ordered by end timestamp.
    pub fn load_range(&self, from: DateTime<Local>, to: DateTime<Local>) -> Result<Vec<Interval>> {
        let _entered = self.span.enter();
        if !self.is_enabled() {
            return Ok(Vec::new());
        }

        let conn = self.open()?;
        let sql = format!(
            "{SELECT_COLUMNS}
             WHERE start_date || 'T' || start_time >= ?1
               AND start_date || 'T' || start_time < ?2
             ORDER BY end_date, end_time, id"
        );
        self.collect_rows(&conn, &sql, [to_stamp(from), to_stamp(to)])
    }

    fn collect_rows<P: rusqlite::Params>(
        &self,
        conn: &Connection,
        sql: &str,
        params: P,
    ) -> Result<Vec<Interval>> {
        let mut stmt = conn.prepare(sql)?;
        let rows = stmt
            .query_map(params, RawRow::from_row)?
            .collect::<rusqlite::Result<Vec<_>>>()?;

        let mut intervals = Vec::with_capacity(rows.len());
        for row in rows {
            let id = row.id;
            match row.into_interval() {
                Ok(interval) => intervals.push(interval),
                Err(reason) => tracing::warn!(id, reason = %reason, "Skipping invalid row"),
            }
        }
        Ok(intervals)
    }

    /// Whether any row starts or ends on the given local date.
    pub fn has_entries_for_date(&self, date: NaiveDate) -> Result<bool> {
        let _entered = self.span.enter();
        if !self.is_enabled() {
            return Ok(false);
        }

        let from = to_stamp(local_midnight(date));
        let to = match date.succ_opt() {
            Some(next) => to_stamp(local_midnight(next)),
            None => to_stamp(local_midnight(date) + TimeDelta::days(1)),
        };

        let conn = self.open()?;
        let exists: bool = conn.query_row(
            "SELECT EXISTS(
                SELECT 1 FROM intervals
                WHERE (start_date || 'T' || start_time >= ?1 AND start_date || 'T' || start_time < ?2)
                   OR (end_date || 'T' || end_time >= ?1 AND end_date || 'T' || end_time < ?2)
             )",
            [&from, &to],
            |r| r.get(0),
        )?;
        Ok(exists)
    }

    /// Number of stored rows, valid or not
    pub fn row_count(&self) -> Result<usize> {
        let _entered = self.span.enter();
        if !self.is_enabled() {
            return Ok(0);
        }

        let conn = self.open()?;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM intervals", [], |r| r.get(0))?;
        Ok(count as usize)
    }

    // ============================================
    // Upserts
    // ============================================

    /// Save the still-open segment.
    ///
    /// The row's duration is always `elapsed_ms` as measured by the caller;
    /// its start is fixed when the row is inserted and kept on every update.
    /// A stale `id` (row pruned or deleted) is replaced by a fresh insert.
    pub fn upsert_checkpoint(
        &self,
        kind: IntervalKind,
        elapsed_ms: i64,
        now: DateTime<Local>,
        id: &mut CheckpointId,
    ) -> Result<()> {
        let _entered = self.span.enter();
        if !self.is_enabled() {
            return Ok(());
        }
        if elapsed_ms <= 0 {
            tracing::debug!(elapsed_ms, "Skipping empty checkpoint");
            return Ok(());
        }

        let now = truncate_ms(now);
        let (end_date, end_time) = to_columns(now);
        let conn = self.open()?;

        if let Some(row_id) = *id {
            let updated = conn.execute(
                "UPDATE intervals SET duration = ?1, end_date = ?2, end_time = ?3
                 WHERE id = ?4 AND type = ?5",
                params![elapsed_ms, end_date, end_time, row_id, kind.code()],
            )?;
            if updated > 0 {
                tracing::debug!(row_id, elapsed_ms, "Checkpoint updated");
                return Ok(());
            }
            tracing::info!(row_id, "Checkpoint row is gone, inserting a new one");
        }

        let (start_date, start_time) = to_columns(now - TimeDelta::milliseconds(elapsed_ms));
        let row_id: i64 = conn.query_row(
            "INSERT INTO intervals (type, duration, start_date, start_time, end_date, end_time)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)
             ON CONFLICT(start_date, start_time, type) DO UPDATE SET
                duration = excluded.duration,
                end_date = excluded.end_date,
                end_time = excluded.end_time
             RETURNING id",
            params![kind.code(), elapsed_ms, start_date, start_time, end_date, end_time],
            |r| r.get(0),
        )?;
        *id = Some(row_id);

        tracing::debug!(row_id, elapsed_ms, "Checkpoint inserted");
        Ok(())
    }

    /// Update-or-insert each interval, matching existing rows by kind and
    /// approximate start time.
    pub fn upsert_by_start_time(&self, intervals: &[Interval]) -> Result<()> {
        self.upsert_superseding(intervals, &[], &[])
    }

    /// Like [`Store::upsert_by_start_time`], additionally deleting in the
    /// same transaction:
    /// - the rows of `superseded` intervals (folded into others by
    ///   normalization)
    /// - the `retired` checkpoint rows of segments closed since their last
    ///   save, unless one of `intervals` claimed the row by start time
    ///
    /// A retired row no interval claims is one whose start drifted with the
    /// wall clock; the closed segment it stood for is among `intervals` or
    /// `superseded`.
    pub fn upsert_superseding(
        &self,
        intervals: &[Interval],
        superseded: &[Interval],
        retired: &[i64],
    ) -> Result<()> {
        let _entered = self.span.enter();
        if !self.is_enabled()
            || (intervals.is_empty() && superseded.is_empty() && retired.is_empty())
        {
            return Ok(());
        }

        let mut conn = self.open()?;
        let tx = conn.transaction()?;

        // Resolve every target row first; a row is claimed by at most one interval
        let mut targets: Vec<Option<i64>> = Vec::with_capacity(intervals.len());
        for interval in intervals {
            let target = find_by_start(&tx, interval)?.filter(|id| !targets.contains(&Some(*id)));
            targets.push(target);
        }

        let mut removed = 0;
        for old in superseded {
            if let Some(row_id) = find_by_start(&tx, old)? {
                if !targets.contains(&Some(row_id)) {
                    tx.execute("DELETE FROM intervals WHERE id = ?1", [row_id])?;
                    removed += 1;
                }
            }
        }
        for &row_id in retired {
            if !targets.contains(&Some(row_id)) {
                removed += tx.execute("DELETE FROM intervals WHERE id = ?1", [row_id])?;
            }
        }

        let mut updated = 0;
        for (interval, target) in intervals.iter().zip(targets) {
            match target {
                Some(row_id) => {
                    update_row(&tx, row_id, interval)?;
                    updated += 1;
                }
                None => upsert_row(&tx, interval)?,
            }
        }

        tx.commit()?;

        tracing::debug!(
            count = intervals.len(),
            updated,
            inserted = intervals.len() - updated,
            removed,
            "Upserted intervals by start time"
        );
        Ok(())
    }

    // ============================================
    // Schema inspection
    // ============================================

    /// Read-only check that the store can be written by this version.
    pub fn check_schema(&self) -> Result<SchemaReport> {
        let _entered = self.span.enter();
        if !self.path.exists() {
            return Ok(SchemaReport {
                version: 0,
                table_present: false,
                missing_columns: Vec::new(),
            });
        }

        let conn = Connection::open_with_flags(
            &self.path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        let report = schema::inspect(&conn)?;
        if !report.is_compatible() {
            tracing::warn!(
                version = report.version,
                missing = ?report.missing_columns,
                "Store schema is incompatible"
            );
        }
        Ok(report)
    }
}

fn insert_row(conn: &Connection, interval: &Interval) -> Result<i64> {
    let (start_date, start_time) = to_columns(interval.start());
    let (end_date, end_time) = to_columns(interval.end());
    conn.execute(
        "INSERT INTO intervals (type, duration, start_date, start_time, end_date, end_time)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
        params![
            interval.kind().code(),
            interval.duration_ms(),
            start_date,
            start_time,
            end_date,
            end_time
        ],
    )?;
    Ok(conn.last_insert_rowid())
}

fn upsert_row(conn: &Connection, interval: &Interval) -> Result<()> {
    let (start_date, start_time) = to_columns(interval.start());
    let (end_date, end_time) = to_columns(interval.end());
    conn.execute(
        "INSERT INTO intervals (type, duration, start_date, start_time, end_date, end_time)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(start_date, start_time, type) DO UPDATE SET
            duration = excluded.duration,
            end_date = excluded.end_date,
            end_time = excluded.end_time",
        params![
            interval.kind().code(),
            interval.duration_ms(),
            start_date,
            start_time,
            end_date,
            end_time
        ],
    )?;
    Ok(())
}

fn update_row(conn: &Connection, row_id: i64, interval: &Interval) -> Result<()> {
    let (start_date, start_time) = to_columns(interval.start());
    let (end_date, end_time) = to_columns(interval.end());
    conn.execute(
        "UPDATE intervals
         SET duration = ?1, start_date = ?2, start_time = ?3, end_date = ?4, end_time = ?5
         WHERE id = ?6",
        params![
            interval.duration_ms(),
            start_date,
            start_time,
            end_date,
            end_time,
            row_id
        ],
    )?;
    Ok(())
}

/// Row of the same kind whose start is nearest to the interval's, within tolerance.
///
/// Only rows starting on the same local date are matched, so the two halves
/// of a midnight split never collapse into one row.
fn find_by_start(conn: &Connection, interval: &Interval) -> Result<Option<i64>> {
    let window_start = to_columns(interval.start() - TimeDelta::days(1)).0;
    let window_end = to_columns(interval.start() + TimeDelta::days(1)).0;

    let mut stmt = conn.prepare_cached(
        "SELECT id, start_date, start_time FROM intervals
         WHERE type = ?1 AND start_date BETWEEN ?2 AND ?3",
    )?;
    let candidates = stmt
        .query_map(
            params![interval.kind().code(), window_start, window_end],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            },
        )?
        .collect::<rusqlite::Result<Vec<_>>>()?;

    let best = candidates
        .into_iter()
        .filter_map(|(id, date, time)| {
            let start = from_columns(&date, &time)?;
            if start.date_naive() != interval.date() {
                return None;
            }
            let distance = (start - interval.start()).num_milliseconds().abs();
            (distance <= START_MATCH_TOLERANCE_MS).then_some((distance, id))
        })
        .min();

    Ok(best.map(|(_, id)| id))
}
