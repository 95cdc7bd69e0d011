//! SQLite-backed analytics store.
//!
//! Provides durable storage for:
//! - The append-only session record log
//! - Per-category and per-task [`TaskHistory`] aggregates
//! - A key-value table for estimator parameters and resume state
//!
//! Every `record` call runs in a single transaction behind the connection
//! mutex, so history counters are updated in the same order records are
//! appended.

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::{Mutex, MutexGuard};

use super::migrations;
use super::report::Report;
use crate::classifier::Category;
use crate::error::PersistenceError;
use crate::sampler::ActivitySummary;
use crate::session::Phase;

const RESUME_KEY: &str = "resume_state";

/// One finished or abandoned interval. Never mutated after it is written.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionRecord {
    pub plan_id: String,
    pub task_id: String,
    pub task_description: String,
    pub category: Category,
    pub phase: Phase,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    /// Countdown seconds actually ticked, extensions included.
    pub elapsed_secs: u64,
    pub completed: bool,
    #[serde(default)]
    pub activity_summary: Option<ActivitySummary>,
}

/// Key under which a [`TaskHistory`] is aggregated.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryKey {
    Category(Category),
    /// Normalized task description.
    Task(String),
}

impl HistoryKey {
    pub fn task(description: &str) -> Self {
        HistoryKey::Task(normalize_description(description))
    }

    pub fn encode(&self) -> String {
        match self {
            HistoryKey::Category(c) => format!("category:{c}"),
            HistoryKey::Task(d) => format!("task:{d}"),
        }
    }

    pub fn decode(s: &str) -> Option<Self> {
        if let Some(c) = s.strip_prefix("category:") {
            return Category::parse(c).map(HistoryKey::Category);
        }
        s.strip_prefix("task:").map(|d| HistoryKey::Task(d.to_string()))
    }
}

impl fmt::Display for HistoryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.encode())
    }
}

/// Lowercase with collapsed whitespace; task identity across plans.
pub fn normalize_description(description: &str) -> String {
    description
        .split_whitespace()
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join(" ")
}

/// Aggregated outcomes for one key.
///
/// Invariants: `completions <= attempts` and one duration sample per
/// completion. Abandoned attempts never contribute a sample.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TaskHistory {
    attempts: u64,
    completions: u64,
    duration_samples: Vec<u64>,
    last_completed_at: Option<DateTime<Utc>>,
}

impl TaskHistory {
    /// Rebuild from stored parts, rejecting inconsistent rows.
    pub fn from_parts(
        attempts: u64,
        completions: u64,
        duration_samples: Vec<u64>,
        last_completed_at: Option<DateTime<Utc>>,
    ) -> Result<Self, PersistenceError> {
        if completions > attempts || duration_samples.len() as u64 != completions {
            return Err(PersistenceError::Corrupt {
                column: "task_history".into(),
                message: format!(
                    "attempts={attempts} completions={completions} samples={}",
                    duration_samples.len()
                ),
            });
        }
        Ok(Self {
            attempts,
            completions,
            duration_samples,
            last_completed_at,
        })
    }

    pub fn attempts(&self) -> u64 {
        self.attempts
    }

    pub fn completions(&self) -> u64 {
        self.completions
    }

    /// Oldest first.
    pub fn duration_samples(&self) -> &[u64] {
        &self.duration_samples
    }

    pub fn last_completed_at(&self) -> Option<DateTime<Utc>> {
        self.last_completed_at
    }

    pub fn is_empty(&self) -> bool {
        self.attempts == 0
    }

    /// Fold one study outcome into the aggregate.
    pub fn apply(&mut self, completed: bool, elapsed_secs: u64, at: DateTime<Utc>) {
        self.attempts += 1;
        if completed {
            self.completions += 1;
            self.duration_samples.push(elapsed_secs);
            self.last_completed_at = Some(at);
        }
    }
}

/// Storage seam used by the scheduler and the estimator.
pub trait SessionStore: Send + Sync {
    /// Append a record and update the derived histories. Durable on return.
    fn record(&self, record: &SessionRecord) -> Result<i64, PersistenceError>;

    fn history_for(&self, key: &HistoryKey) -> Result<TaskHistory, PersistenceError>;

    fn all_histories(&self) -> Result<Vec<(HistoryKey, TaskHistory)>, PersistenceError>;

    fn records_for_plan(&self, plan_id: &str) -> Result<Vec<SessionRecord>, PersistenceError>;

    fn summarize(&self, plan_id: &str) -> Result<Report, PersistenceError> {
        let records = self.records_for_plan(plan_id)?;
        Ok(Report::from_records(plan_id, &records))
    }

    fn kv_get(&self, key: &str) -> Result<Option<String>, PersistenceError>;

    fn kv_set(&self, key: &str, value: &str) -> Result<(), PersistenceError>;
}

/// SQLite analytics store.
pub struct AnalyticsStore {
    conn: Mutex<Connection>,
}

impl AnalyticsStore {
    /// Open the database at `<data_dir>/focusloop.db`.
    ///
    /// Creates the database file and schema if they don't exist.
    pub fn open_default() -> crate::error::Result<Self> {
        let path = super::data_dir()?.join("focusloop.db");
        Ok(Self::open(&path)?)
    }

    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        let conn = Connection::open(path).map_err(|source| PersistenceError::OpenFailed {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_connection(conn)
    }

    /// Open an in-memory database (tests, dry runs).
    pub fn open_memory() -> Result<Self, PersistenceError> {
        Self::from_connection(Connection::open_in_memory()?)
    }

    fn from_connection(conn: Connection) -> Result<Self, PersistenceError> {
        migrations::migrate(&conn).map_err(|e| PersistenceError::MigrationFailed(e.to_string()))?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn lock(&self) -> Result<MutexGuard<'_, Connection>, PersistenceError> {
        self.conn.lock().map_err(|_| PersistenceError::Poisoned)
    }

    pub fn save_resume_state(&self, json: &str) -> Result<(), PersistenceError> {
        self.kv_set(RESUME_KEY, json)
    }

    pub fn load_resume_state(&self) -> Result<Option<String>, PersistenceError> {
        self.kv_get(RESUME_KEY)
    }

    pub fn clear_resume_state(&self) -> Result<(), PersistenceError> {
        let conn = self.lock()?;
        conn.execute("DELETE FROM kv WHERE key = ?1", params![RESUME_KEY])?;
        Ok(())
    }

    /// Number of records in the log.
    pub fn record_count(&self) -> Result<u64, PersistenceError> {
        let conn = self.lock()?;
        Ok(conn.query_row("SELECT COUNT(*) FROM session_records", [], |row| {
            row.get::<_, u64>(0)
        })?)
    }
}

impl SessionStore for AnalyticsStore {
    fn record(&self, record: &SessionRecord) -> Result<i64, PersistenceError> {
        let summary = record
            .activity_summary
            .as_ref()
            .map(serde_json::to_string)
            .transpose()
            .map_err(|e| PersistenceError::QueryFailed(e.to_string()))?;

        let mut conn = self.lock()?;
        let tx = conn.transaction()?;
        tx.execute(
            "INSERT INTO session_records (plan_id, task_id, task_description, category, phase,
                                          started_at, ended_at, elapsed_secs, completed, activity_summary)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
            params![
                record.plan_id,
                record.task_id,
                record.task_description,
                record.category.as_str(),
                record.phase.as_str(),
                record.started_at.to_rfc3339(),
                record.ended_at.to_rfc3339(),
                record.elapsed_secs,
                record.completed,
                summary,
            ],
        )?;
        let id = tx.last_insert_rowid();

        if record.phase == Phase::Study {
            for key in [
                HistoryKey::Category(record.category),
                HistoryKey::task(&record.task_description),
            ] {
                let mut history = read_history(&tx, &key)?.unwrap_or_default();
                history.apply(record.completed, record.elapsed_secs, record.ended_at);
                write_history(&tx, &key, &history)?;
            }
        }

        tx.commit()?;
        Ok(id)
    }

    fn history_for(&self, key: &HistoryKey) -> Result<TaskHistory, PersistenceError> {
        let conn = self.lock()?;
        Ok(read_history(&conn, key)?.unwrap_or_default())
    }

    fn all_histories(&self) -> Result<Vec<(HistoryKey, TaskHistory)>, PersistenceError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT key, attempts, completions, duration_samples, last_completed_at
             FROM task_history ORDER BY key",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((
                row.get::<_, String>(0)?,
                RawHistory {
                    attempts: row.get(1)?,
                    completions: row.get(2)?,
                    samples: row.get(3)?,
                    last_completed_at: row.get(4)?,
                },
            ))
        })?;

        let mut out = Vec::new();
        for row in rows {
            let (key, raw) = row?;
            let Some(key) = HistoryKey::decode(&key) else {
                tracing::warn!(key = %key, "skipping history row with unknown key");
                continue;
            };
            out.push((key, raw.into_history()?));
        }
        Ok(out)
    }

    fn records_for_plan(&self, plan_id: &str) -> Result<Vec<SessionRecord>, PersistenceError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT plan_id, task_id, task_description, category, phase, started_at, ended_at,
                    elapsed_secs, completed, activity_summary
             FROM session_records WHERE plan_id = ?1 ORDER BY id",
        )?;
        let rows = stmt.query_map(params![plan_id], |row| {
            Ok(RawRecord {
                plan_id: row.get(0)?,
                task_id: row.get(1)?,
                task_description: row.get(2)?,
                category: row.get(3)?,
                phase: row.get(4)?,
                started_at: row.get(5)?,
                ended_at: row.get(6)?,
                elapsed_secs: row.get(7)?,
                completed: row.get(8)?,
                activity_summary: row.get(9)?,
            })
        })?;

        let mut out = Vec::new();
        for row in rows {
            out.push(row?.into_record()?);
        }
        Ok(out)
    }

    fn kv_get(&self, key: &str) -> Result<Option<String>, PersistenceError> {
        let conn = self.lock()?;
        Ok(conn
            .query_row("SELECT value FROM kv WHERE key = ?1", params![key], |row| {
                row.get::<_, String>(0)
            })
            .optional()?)
    }

    fn kv_set(&self, key: &str, value: &str) -> Result<(), PersistenceError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR REPLACE INTO kv (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }
}

struct RawHistory {
    attempts: u64,
    completions: u64,
    samples: String,
    last_completed_at: Option<String>,
}

impl RawHistory {
    fn into_history(self) -> Result<TaskHistory, PersistenceError> {
        let samples: Vec<u64> =
            serde_json::from_str(&self.samples).map_err(|e| PersistenceError::Corrupt {
                column: "duration_samples".into(),
                message: e.to_string(),
            })?;
        let last = self
            .last_completed_at
            .as_deref()
            .map(|s| parse_time("last_completed_at", s))
            .transpose()?;
        TaskHistory::from_parts(self.attempts, self.completions, samples, last)
    }
}

struct RawRecord {
    plan_id: String,
    task_id: String,
    task_description: String,
    category: String,
    phase: String,
    started_at: String,
    ended_at: String,
    elapsed_secs: u64,
    completed: bool,
    activity_summary: Option<String>,
}

impl RawRecord {
    fn into_record(self) -> Result<SessionRecord, PersistenceError> {
        let category = Category::parse(&self.category).ok_or_else(|| PersistenceError::Corrupt {
            column: "category".into(),
            message: self.category.clone(),
        })?;
        let phase = Phase::parse(&self.phase).ok_or_else(|| PersistenceError::Corrupt {
            column: "phase".into(),
            message: self.phase.clone(),
        })?;
        let activity_summary = self
            .activity_summary
            .as_deref()
            .map(serde_json::from_str::<ActivitySummary>)
            .transpose()
            .map_err(|e| PersistenceError::Corrupt {
                column: "activity_summary".into(),
                message: e.to_string(),
            })?;
        Ok(SessionRecord {
            plan_id: self.plan_id,
            task_id: self.task_id,
            task_description: self.task_description,
            category,
            phase,
            started_at: parse_time("started_at", &self.started_at)?,
            ended_at: parse_time("ended_at", &self.ended_at)?,
            elapsed_secs: self.elapsed_secs,
            completed: self.completed,
            activity_summary,
        })
    }
}

fn parse_time(column: &str, s: &str) -> Result<DateTime<Utc>, PersistenceError> {
    DateTime::parse_from_rfc3339(s)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| PersistenceError::Corrupt {
            column: column.into(),
            message: e.to_string(),
        })
}

fn read_history(conn: &Connection, key: &HistoryKey) -> Result<Option<TaskHistory>, PersistenceError> {
    let raw = conn
        .query_row(
            "SELECT attempts, completions, duration_samples, last_completed_at
             FROM task_history WHERE key = ?1",
            params![key.encode()],
            |row| {
                Ok(RawHistory {
                    attempts: row.get(0)?,
                    completions: row.get(1)?,
                    samples: row.get(2)?,
                    last_completed_at: row.get(3)?,
                })
            },
        )
        .optional()?;
    raw.map(RawHistory::into_history).transpose()
}

fn write_history(conn: &Connection, key: &HistoryKey, history: &TaskHistory) -> Result<(), PersistenceError> {
    let samples = serde_json::to_string(history.duration_samples())
        .map_err(|e| PersistenceError::QueryFailed(e.to_string()))?;
    conn.execute(
        "INSERT INTO task_history (key, attempts, completions, duration_samples, last_completed_at)
         VALUES (?1, ?2, ?3, ?4, ?5)
         ON CONFLICT(key) DO UPDATE SET
            attempts = excluded.attempts,
            completions = excluded.completions,
            duration_samples = excluded.duration_samples,
            last_completed_at = excluded.last_completed_at",
        params![
            key.encode(),
            history.attempts(),
            history.completions(),
            samples,
            history.last_completed_at().map(|t| t.to_rfc3339()),
        ],
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn study(desc: &str, category: Category, secs: u64, completed: bool) -> SessionRecord {
        let now = Utc::now();
        SessionRecord {
            plan_id: "plan-a".into(),
            task_id: format!("task-{desc}"),
            task_description: desc.into(),
            category,
            phase: Phase::Study,
            started_at: now,
            ended_at: now,
            elapsed_secs: secs,
            completed,
            activity_summary: None,
        }
    }

    #[test]
    fn record_updates_category_and_task_history() {
        let store = AnalyticsStore::open_memory().unwrap();
        store.record(&study("Write report", Category::Doing, 1200, true)).unwrap();
        store.record(&study("write  REPORT", Category::Doing, 900, false)).unwrap();

        let by_cat = store.history_for(&HistoryKey::Category(Category::Doing)).unwrap();
        assert_eq!(by_cat.attempts(), 2);
        assert_eq!(by_cat.completions(), 1);
        assert_eq!(by_cat.duration_samples(), &[1200]);

        let by_task = store.history_for(&HistoryKey::task("Write Report")).unwrap();
        assert_eq!(by_task.attempts(), 2);
        assert!(by_task.last_completed_at().is_some());
    }

    #[test]
    fn break_records_do_not_touch_history() {
        let store = AnalyticsStore::open_memory().unwrap();
        let mut rec = study("Read paper", Category::Learning, 300, true);
        rec.phase = Phase::ShortBreak;
        store.record(&rec).unwrap();
        assert!(store
            .history_for(&HistoryKey::Category(Category::Learning))
            .unwrap()
            .is_empty());
        assert_eq!(store.record_count().unwrap(), 1);
    }

    #[test]
    fn records_round_trip_with_activity() {
        let store = AnalyticsStore::open_memory().unwrap();
        let mut rec = study("Read paper", Category::Learning, 1800, true);
        rec.activity_summary = Some(ActivitySummary::empty(30));
        store.record(&rec).unwrap();
        let back = store.records_for_plan("plan-a").unwrap();
        assert_eq!(back.len(), 1);
        assert_eq!(back[0].activity_summary, rec.activity_summary);
        assert_eq!(back[0].category, Category::Learning);
    }

    #[test]
    fn history_from_parts_rejects_inconsistent_counts() {
        assert!(TaskHistory::from_parts(1, 2, vec![1, 2], None).is_err());
        assert!(TaskHistory::from_parts(2, 1, vec![], None).is_err());
        assert!(TaskHistory::from_parts(2, 1, vec![60], None).is_ok());
    }

    #[test]
    fn history_key_encoding() {
        let key = HistoryKey::Category(Category::Learning);
        assert_eq!(HistoryKey::decode(&key.encode()), Some(key));
        let key = HistoryKey::task("  Write   Report ");
        assert_eq!(key.encode(), "task:write report");
        assert_eq!(HistoryKey::decode("bogus"), None);
    }

    #[test]
    fn resume_state_kv() {
        let store = AnalyticsStore::open_memory().unwrap();
        assert!(store.load_resume_state().unwrap().is_none());
        store.save_resume_state("{}").unwrap();
        assert_eq!(store.load_resume_state().unwrap().as_deref(), Some("{}"));
        store.clear_resume_state().unwrap();
        assert!(store.load_resume_state().unwrap().is_none());
    }
}
