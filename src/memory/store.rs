//! SQLite persistence for conversation summaries.
//!
//! Single table, insertion-ordered ids, one short-held connection. The only
//! query shapes are "insert" and "newest summary within a time window", so
//! there is no need for a pool or a writer thread here.

use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};

use crate::util::unix_now;

/// Persisted digest of recent conversation state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemorySummary {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    pub summary_text: String,
    pub mood_state: String,
    /// Side-car knobs (chaos/energy estimates and similar).
    pub metadata: serde_json::Value,
    pub ts: f64,
}

pub struct MemoryStore {
    conn: Mutex<Connection>,
}

impl MemoryStore {
    /// Open (or create) the database at `path` and ensure the schema exists.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open memory db at {}", path.display()))?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// In-memory store for tests.
    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("failed to open in-memory db")?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS mem_summaries (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                ts REAL NOT NULL,
                summary_text TEXT NOT NULL,
                mood_state TEXT NOT NULL,
                knobs_json TEXT NOT NULL
            )",
            [],
        )
        .context("failed to create mem_summaries table")?;
        Ok(())
    }

    /// Persist a summary, returning it with the assigned row id.
    pub fn save_summary(&self, mut summary: MemorySummary) -> Result<MemorySummary> {
        let knobs = serde_json::to_string(&summary.metadata)
            .context("failed to serialise summary metadata")?;
        let conn = self.conn.lock().expect("memory store lock poisoned");
        conn.execute(
            "INSERT INTO mem_summaries (ts, summary_text, mood_state, knobs_json) VALUES (?1, ?2, ?3, ?4)",
            params![summary.ts, summary.summary_text, summary.mood_state, knobs],
        )
        .context("failed to insert summary")?;
        summary.id = Some(conn.last_insert_rowid());
        Ok(summary)
    }

    /// Newest summary whose timestamp falls within the restore window.
    pub fn load_latest(&self, max_age_seconds: f64) -> Result<Option<MemorySummary>> {
        let cutoff = unix_now() - max_age_seconds;
        let conn = self.conn.lock().expect("memory store lock poisoned");
        let row = conn
            .query_row(
                "SELECT id, ts, summary_text, mood_state, knobs_json
                 FROM mem_summaries WHERE ts >= ?1 ORDER BY ts DESC LIMIT 1",
                params![cutoff],
                |row| {
                    Ok((
                        row.get::<_, i64>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                    ))
                },
            )
            .optional()
            .context("failed to query latest summary")?;

        Ok(row.map(|(id, ts, summary_text, mood_state, knobs)| {
            let metadata = serde_json::from_str(&knobs)
                .unwrap_or_else(|_| serde_json::Value::Object(Default::default()));
            MemorySummary {
                id: Some(id),
                summary_text,
                mood_state,
                metadata,
                ts,
            }
        }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn summary(text: &str, ts: f64) -> MemorySummary {
        MemorySummary {
            id: None,
            summary_text: text.into(),
            mood_state: "cheerful".into(),
            metadata: json!({"chaos": 0.1}),
            ts,
        }
    }

    #[test]
    fn save_assigns_increasing_ids() {
        let store = MemoryStore::open_in_memory().unwrap();
        let first = store.save_summary(summary("one", unix_now())).unwrap();
        let second = store.save_summary(summary("two", unix_now())).unwrap();
        assert!(second.id.unwrap() > first.id.unwrap());
    }

    #[test]
    fn load_latest_respects_the_window() {
        let store = MemoryStore::open_in_memory().unwrap();
        let now = unix_now();
        store.save_summary(summary("ancient", now - 10_000.0)).unwrap();
        store.save_summary(summary("recent", now - 5.0)).unwrap();

        let loaded = store.load_latest(60.0).unwrap().unwrap();
        assert_eq!(loaded.summary_text, "recent");
        assert_eq!(loaded.metadata["chaos"], 0.1);

        // Nothing inside a one-second window.
        assert!(store.load_latest(1.0).unwrap().is_none());
    }
}
