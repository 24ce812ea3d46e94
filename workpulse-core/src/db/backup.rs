//! Backup snapshots written before bulk writes
//!
//! Each snapshot is a copy of the store file plus a text dump of the rows
//! about to be written, both under `<store dir>/backups/` and sharing a
//! timestamped stem. Only the newest `keep` snapshots are retained.

use crate::error::Result;
use crate::types::Interval;
use chrono::{DateTime, Local, Utc};
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

const BACKUP_DIR: &str = "backups";

/// Which bulk write the snapshot precedes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupMode {
    Append,
    Replace,
}

impl BackupMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupMode::Append => "append",
            BackupMode::Replace => "replace",
        }
    }
}

/// Directory holding snapshots for the store at `store_path`
pub fn backup_dir(store_path: &Path) -> PathBuf {
    store_path
        .parent()
        .map(|p| p.join(BACKUP_DIR))
        .unwrap_or_else(|| PathBuf::from(BACKUP_DIR))
}

fn store_stem(store_path: &Path) -> String {
    store_path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("store")
        .to_string()
}

/// Write a snapshot and return the path of its text dump.
pub fn write_backup(
    store_path: &Path,
    mode: BackupMode,
    intervals: &[Interval],
    now: DateTime<Local>,
    keep: usize,
) -> Result<PathBuf> {
    let dir = backup_dir(store_path);
    fs::create_dir_all(&dir)?;

    let stem = format!(
        "{}-{}",
        store_stem(store_path),
        now.with_timezone(&Utc).format("%Y%m%dT%H%M%S%3f")
    );

    let checksum = if store_path.exists() {
        let copy_path = dir.join(format!("{stem}.db"));
        fs::copy(store_path, &copy_path)?;
        Some(hex::encode(Sha256::digest(fs::read(&copy_path)?)))
    } else {
        None
    };

    let dump_path = dir.join(format!("{stem}.txt"));
    fs::write(&dump_path, render_dump(mode, intervals, checksum.as_deref()))?;

    prune_backups(store_path, keep)?;

    Ok(dump_path)
}

/// Human-readable dump of the rows about to be written
pub fn render_dump(mode: BackupMode, intervals: &[Interval], checksum: Option<&str>) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "mode: {}", mode.as_str());
    let _ = writeln!(out, "count: {}", intervals.len());
    let _ = writeln!(out, "store sha256: {}", checksum.unwrap_or("none"));
    for interval in intervals {
        let _ = writeln!(
            out,
            "{}\t{}\t{}\t{}",
            interval.kind(),
            interval.duration_ms(),
            interval.start().to_rfc3339(),
            interval.end().to_rfc3339()
        );
    }
    out
}

/// Remove all but the newest `keep` snapshots.
pub fn prune_backups(store_path: &Path, keep: usize) -> Result<usize> {
    let dir = backup_dir(store_path);
    let pattern = format!(
        "{}/{}-*.txt",
        glob::Pattern::escape(&dir.to_string_lossy()),
        glob::Pattern::escape(&store_stem(store_path))
    );

    let mut dumps: Vec<PathBuf> = match glob::glob(&pattern) {
        Ok(paths) => paths.filter_map(|p| p.ok()).collect(),
        Err(e) => {
            tracing::warn!(error = %e, "Invalid backup pattern");
            return Ok(0);
        }
    };
    dumps.sort();

    let excess = dumps.len().saturating_sub(keep);
    for dump in dumps.iter().take(excess) {
        fs::remove_file(dump)?;
        let copy = dump.with_extension("db");
        if copy.exists() {
            fs::remove_file(copy)?;
        }
    }

    Ok(excess)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IntervalKind;
    use chrono::{TimeDelta, TimeZone};
    use tempfile::TempDir;

    fn sample() -> Interval {
        let start = Local.with_ymd_and_hms(2024, 7, 15, 9, 0, 0).unwrap();
        Interval::new(IntervalKind::Activity, start, start + TimeDelta::minutes(30)).unwrap()
    }

    #[test]
    fn test_dump_lists_rows() {
        let dump = render_dump(BackupMode::Replace, &[sample()], Some("abc"));
        assert!(dump.starts_with("mode: replace\ncount: 1\n"));
        assert!(dump.contains("store sha256: abc"));
        assert!(dump.contains("activity\t1800000\t"));
    }

    #[test]
    fn test_backup_copies_store_and_writes_dump() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("workpulse.db");
        fs::write(&store, b"not really sqlite").unwrap();

        let now = Local.with_ymd_and_hms(2024, 7, 15, 10, 0, 0).unwrap();
        let dump = write_backup(&store, BackupMode::Append, &[sample()], now, 10).unwrap();

        assert!(dump.exists());
        let copy = dump.with_extension("db");
        assert_eq!(fs::read(copy).unwrap(), b"not really sqlite");

        let text = fs::read_to_string(dump).unwrap();
        assert!(text.contains(&hex::encode(Sha256::digest(b"not really sqlite"))));
    }

    #[test]
    fn test_backup_without_store_file_only_dumps() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("workpulse.db");

        let now = Local.with_ymd_and_hms(2024, 7, 15, 10, 0, 0).unwrap();
        let dump = write_backup(&store, BackupMode::Append, &[], now, 10).unwrap();

        assert!(dump.exists());
        assert!(!dump.with_extension("db").exists());
    }

    #[test]
    fn test_only_newest_backups_are_kept() {
        let dir = TempDir::new().unwrap();
        let store = dir.path().join("workpulse.db");
        fs::write(&store, b"x").unwrap();

        let base = Local.with_ymd_and_hms(2024, 7, 15, 10, 0, 0).unwrap();
        let mut dumps = Vec::new();
        for i in 0..5 {
            let now = base + TimeDelta::seconds(i);
            dumps.push(write_backup(&store, BackupMode::Append, &[], now, 3).unwrap());
        }

        assert!(!dumps[0].exists());
        assert!(!dumps[1].exists());
        assert!(!dumps[1].with_extension("db").exists());
        for dump in &dumps[2..] {
            assert!(dump.exists());
        }
    }
}
