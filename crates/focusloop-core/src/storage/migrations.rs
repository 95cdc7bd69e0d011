//! Database schema migrations for the analytics store.
//!
//! Migrations are versioned and applied automatically when opening the database.
//! The `schema_version` table tracks the current migration version.

use indoc::indoc;
use rusqlite::{Connection, OptionalExtension, Result as SqliteResult};

/// Current schema version.
pub const SCHEMA_VERSION: i32 = 2;

/// Apply all pending migrations to bring the database to the current schema version.
///
/// # Errors
/// Returns an error if migration fails.
pub fn migrate(conn: &Connection) -> SqliteResult<()> {
    create_schema_version_table(conn)?;

    let current_version = get_schema_version(conn)?;

    if current_version < 1 {
        migrate_v1(conn)?;
    }
    if current_version < 2 {
        migrate_v2(conn)?;
    }

    Ok(())
}

fn create_schema_version_table(conn: &Connection) -> SqliteResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER PRIMARY KEY
        );",
    )
}

/// Returns 0 for a fresh database.
pub fn get_schema_version(conn: &Connection) -> SqliteResult<i32> {
    Ok(conn
        .query_row("SELECT version FROM schema_version", [], |row| {
            row.get::<_, i32>(0)
        })
        .optional()?
        .unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> SqliteResult<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?1)", [version])?;
    Ok(())
}

/// Migration v1: session log, per-key history, kv.
fn migrate_v1(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(indoc! {"
        CREATE TABLE IF NOT EXISTS session_records (
            id               INTEGER PRIMARY KEY AUTOINCREMENT,
            plan_id          TEXT NOT NULL,
            task_id          TEXT NOT NULL,
            task_description TEXT NOT NULL,
            category         TEXT NOT NULL,
            phase            TEXT NOT NULL,
            started_at       TEXT NOT NULL,
            ended_at         TEXT NOT NULL,
            elapsed_secs     INTEGER NOT NULL,
            completed        INTEGER NOT NULL
        );

        CREATE TABLE IF NOT EXISTS task_history (
            key               TEXT PRIMARY KEY,
            attempts          INTEGER NOT NULL DEFAULT 0,
            completions       INTEGER NOT NULL DEFAULT 0,
            duration_samples  TEXT NOT NULL DEFAULT '[]',
            last_completed_at TEXT
        );

        CREATE TABLE IF NOT EXISTS kv (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_records_plan_id ON session_records(plan_id);
    "})?;
    set_schema_version(&tx, 1)?;
    tx.commit()
}

/// Migration v2: folded activity summaries on study records.
fn migrate_v2(conn: &Connection) -> SqliteResult<()> {
    let tx = conn.unchecked_transaction()?;
    tx.execute_batch(indoc! {"
        ALTER TABLE session_records ADD COLUMN activity_summary TEXT;
        CREATE INDEX IF NOT EXISTS idx_records_task_id ON session_records(task_id);
    "})?;
    set_schema_version(&tx, 2)?;
    tx.commit()
}
