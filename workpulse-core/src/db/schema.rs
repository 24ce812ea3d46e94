//! Database schema and migrations
//!
//! Uses SQLite with embedded migrations managed via PRAGMA user_version.

use rusqlite::{Connection, OptionalExtension};

/// Current schema version
pub const SCHEMA_VERSION: i32 = 2;

/// Columns every compatible `intervals` table must carry
pub const REQUIRED_COLUMNS: &[&str] = &[
    "id",
    "type",
    "duration",
    "start_date",
    "start_time",
    "end_date",
    "end_time",
];

/// SQL migrations, indexed by version number
const MIGRATIONS: &[&str] = &[
    // Version 1: start-keyed interval rows, all timestamps UTC
    r#"
    CREATE TABLE IF NOT EXISTS intervals (
        id               INTEGER PRIMARY KEY AUTOINCREMENT,
        type             INTEGER NOT NULL,   -- 0 = activity, 1 = pause
        duration         INTEGER NOT NULL,   -- milliseconds
        start_date       TEXT NOT NULL,      -- YYYY-MM-DD
        start_time       TEXT NOT NULL,      -- HH:MM:SS.mmm
        end_date         TEXT NOT NULL,
        end_time         TEXT NOT NULL,

        UNIQUE(start_date, start_time, type)
    );
    "#,
    // Version 2: ordering and retention both scan by end timestamp
    r#"
    CREATE INDEX IF NOT EXISTS idx_intervals_end ON intervals(end_date, end_time);
    "#,
];

/// Run all pending migrations
pub fn run_migrations(conn: &Connection) -> crate::error::Result<()> {
    let current_version = get_schema_version(conn)?;

    if current_version > SCHEMA_VERSION {
        return Err(crate::error::Error::Schema(format!(
            "store version {} is newer than supported version {}",
            current_version, SCHEMA_VERSION
        )));
    }

    for (i, migration) in MIGRATIONS.iter().enumerate() {
        let version = (i + 1) as i32;
        if version > current_version {
            tracing::info!(version, "Running migration");
            conn.execute_batch(migration)?;
            conn.execute_batch(&format!("PRAGMA user_version = {}", version))?;
        }
    }

    if current_version < SCHEMA_VERSION {
        tracing::info!(
            from = current_version,
            to = SCHEMA_VERSION,
            "Migrations complete"
        );
    }

    Ok(())
}

/// Get the current schema version from the database
pub fn get_schema_version(conn: &Connection) -> crate::error::Result<i32> {
    let version: i32 = conn.query_row("PRAGMA user_version", [], |r| r.get(0))?;
    Ok(version)
}

/// Result of a read-only schema inspection
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchemaReport {
    /// `PRAGMA user_version` of the store (0 for a missing file)
    pub version: i32,
    /// Whether the `intervals` table exists
    pub table_present: bool,
    /// Required columns absent from an existing `intervals` table
    pub missing_columns: Vec<String>,
}

impl SchemaReport {
    /// A store is writable when it has no table yet or carries every required column.
    pub fn is_compatible(&self) -> bool {
        self.missing_columns.is_empty() && self.version <= SCHEMA_VERSION
    }
}

/// Inspect the `intervals` table without modifying anything.
pub fn inspect(conn: &Connection) -> crate::error::Result<SchemaReport> {
    let version = get_schema_version(conn)?;

    let table: Option<String> = conn
        .query_row(
            "SELECT name FROM sqlite_master WHERE type = 'table' AND name = 'intervals'",
            [],
            |r| r.get(0),
        )
        .optional()?;

    if table.is_none() {
        return Ok(SchemaReport {
            version,
            table_present: false,
            missing_columns: Vec::new(),
        });
    }

    let columns: Vec<String> = conn
        .prepare("PRAGMA table_info(intervals)")?
        .query_map([], |row| row.get::<_, String>(1))?
        .collect::<rusqlite::Result<_>>()?;

    let missing_columns = REQUIRED_COLUMNS
        .iter()
        .filter(|required| !columns.iter().any(|c| c == *required))
        .map(|c| c.to_string())
        .collect();

    Ok(SchemaReport {
        version,
        table_present: true,
        missing_columns,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_idempotent() {
        let conn = Connection::open_in_memory().unwrap();

        run_migrations(&conn).unwrap();
        run_migrations(&conn).unwrap();

        let version = get_schema_version(&conn).unwrap();
        assert_eq!(version, SCHEMA_VERSION);
    }

    #[test]
    fn test_fresh_schema_is_compatible() {
        let conn = Connection::open_in_memory().unwrap();
        let report = inspect(&conn).unwrap();
        assert!(!report.table_present);
        assert!(report.is_compatible());

        run_migrations(&conn).unwrap();
        let report = inspect(&conn).unwrap();
        assert!(report.table_present);
        assert!(report.missing_columns.is_empty());
        assert_eq!(report.version, SCHEMA_VERSION);
    }

    #[test]
    fn test_end_keyed_legacy_table_is_flagged() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch(
            "CREATE TABLE intervals (
                id INTEGER PRIMARY KEY,
                type INTEGER,
                duration INTEGER,
                end_date TEXT,
                end_time TEXT
            );",
        )
        .unwrap();

        let report = inspect(&conn).unwrap();
        assert!(!report.is_compatible());
        assert_eq!(report.missing_columns, vec!["start_date", "start_time"]);
    }

    #[test]
    fn test_start_key_is_unique() {
        let conn = Connection::open_in_memory().unwrap();
        run_migrations(&conn).unwrap();

        let insert = "INSERT INTO intervals (type, duration, start_date, start_time, end_date, end_time)
                      VALUES (0, 1000, '2024-07-15', '09:00:00.000', '2024-07-15', '09:00:01.000')";
        conn.execute(insert, []).unwrap();
        assert!(conn.execute(insert, []).is_err());

        // Same start, other type is a different logical segment
        conn.execute(
            "INSERT INTO intervals (type, duration, start_date, start_time, end_date, end_time)
             VALUES (1, 1000, '2024-07-15', '09:00:00.000', '2024-07-15', '09:00:01.000')",
            [],
        )
        .unwrap();
    }

    #[test]
    fn test_newer_store_rejected() {
        let conn = Connection::open_in_memory().unwrap();
        conn.execute_batch("PRAGMA user_version = 99").unwrap();
        assert!(run_migrations(&conn).is_err());
    }
}
