//! SQLite layout of the run history database

use anyhow::{Result, bail};
use rusqlite::Connection;

/// Bumped whenever the `runs` table changes shape
pub const SCHEMA_VERSION: i64 = 1;

const CREATE_RUNS: &str = r#"
    CREATE TABLE IF NOT EXISTS runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        name TEXT NOT NULL,
        success INTEGER NOT NULL,
        exit_codes TEXT NOT NULL DEFAULT '[]',
        duration_ms INTEGER,
        detail TEXT,
        created_at TEXT NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_runs_name ON runs(name);
    CREATE INDEX IF NOT EXISTS idx_runs_created ON runs(created_at);
"#;

/// Create the history tables, refusing databases written by a newer build
pub fn init_schema(conn: &Connection) -> Result<()> {
    let found: i64 = conn.query_row("PRAGMA user_version", [], |row| row.get(0))?;
    if found > SCHEMA_VERSION {
        bail!("history database has schema v{found}, this build understands up to v{SCHEMA_VERSION}");
    }

    conn.execute_batch(CREATE_RUNS)?;
    conn.pragma_update(None, "user_version", SCHEMA_VERSION)?;
    Ok(())
}
