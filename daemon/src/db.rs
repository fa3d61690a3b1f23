//! SQLite verdict history

use crate::model::{SequencedVerdict, Verdict};
use rusqlite::{params, Connection};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> rusqlite::Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(path)?;
        Ok(Self { conn })
    }

    pub fn open_default() -> rusqlite::Result<Self> {
        Self::open(&Self::default_path())
    }

    pub fn default_path() -> PathBuf {
        directories::ProjectDirs::from("", "", "crashsense")
            .map(|dirs| dirs.data_dir().join("verdicts.db"))
            .unwrap_or_else(|| PathBuf::from("verdicts.db"))
    }

    pub fn init_schema(&self) -> rusqlite::Result<()> {
        self.conn.execute_batch(include_str!("../schema.sql"))
    }

    fn now() -> i64 {
        SystemTime::now().duration_since(UNIX_EPOCH).map(|d| d.as_secs() as i64).unwrap_or(0)
    }

    /// Re-inserting an already stored sequence is a no-op.
    pub fn insert_verdict(&self, entry: &SequencedVerdict) -> rusqlite::Result<()> {
        let verdict = &entry.verdict;
        let handle = &verdict.exit_event.process_handle;
        let payload = serde_json::to_string(verdict)
            .map_err(|e| rusqlite::Error::ToSqlConversionFailure(Box::new(e)))?;
        self.conn.execute(
            "INSERT OR IGNORE INTO verdicts (sequence, detected_at, pid, start_time, name, cmdline, classification, confidence, payload)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                entry.sequence as i64,
                verdict.exit_event.detected_at.timestamp(),
                handle.pid,
                handle.start_time.map(|s| s as i64),
                handle.name,
                handle.command_line,
                verdict.classification.as_str(),
                verdict.confidence,
                payload,
            ],
        )?;
        Ok(())
    }

    /// Verdicts after `since`, oldest first.
    pub fn get_verdicts(&self, since: u64, limit: u32) -> rusqlite::Result<Vec<SequencedVerdict>> {
        let mut stmt = self.conn.prepare(
            "SELECT sequence, payload FROM verdicts WHERE sequence > ?1 ORDER BY sequence ASC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![since as i64, limit], Self::map_verdict)?;
        rows.collect()
    }

    fn map_verdict(row: &rusqlite::Row) -> rusqlite::Result<SequencedVerdict> {
        let sequence: i64 = row.get(0)?;
        let payload: String = row.get(1)?;
        let verdict: Verdict = serde_json::from_str(&payload).map_err(|e| {
            rusqlite::Error::FromSqlConversionFailure(1, rusqlite::types::Type::Text, Box::new(e))
        })?;
        Ok(SequencedVerdict {
            sequence: sequence as u64,
            verdict,
        })
    }

    pub fn latest_sequence(&self) -> rusqlite::Result<u64> {
        let seq: Option<i64> =
            self.conn
                .query_row("SELECT MAX(sequence) FROM verdicts", [], |row| row.get(0))?;
        Ok(seq.unwrap_or(0) as u64)
    }

    /// Delete verdicts detected more than `days` ago. Returns rows removed.
    pub fn cleanup_old_verdicts(&self, days: u32) -> rusqlite::Result<usize> {
        let cutoff = Self::now() - (days as i64 * 86400);
        self.conn.execute("DELETE FROM verdicts WHERE detected_at < ?1", params![cutoff])
    }
}
