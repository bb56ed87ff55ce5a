//! History journal: one row per pipeline event, kept in SQLite.
//! Synchronous; callers on an async runtime hop through `spawn_blocking`.

#![forbid(unsafe_code)]

use std::sync::{Mutex, PoisonError};

use anyhow::{Context, Result};
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::debug;

pub const DEFAULT_KEEP: usize = 256;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub job_id: String,
    pub step: String,
    /// Milliseconds since the epoch.
    pub ts: i64,
    pub is_final: bool,
    pub payload: Json,
}

/// A job and the final event recorded for it, if any.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobOutcome {
    pub job_id: String,
    pub last_step: String,
    pub ts: i64,
    pub is_final: bool,
}

pub trait HistoryStore: Send + Sync {
    fn append(&self, entry: &HistoryEntry) -> Result<()>;
    /// Entries of `job_id`, oldest first.
    fn for_job(&self, job_id: &str) -> Result<Vec<HistoryEntry>>;
    /// Most recent jobs, newest first.
    fn recent_jobs(&self, limit: usize) -> Result<Vec<JobOutcome>>;
}

pub struct SqliteHistory {
    db: Mutex<rusqlite::Connection>,
    keep: usize,
}

impl SqliteHistory {
    /// Opens `PAAS_DB_PATH`, or `~/.paas/history.db`. `PAAS_HISTORY_KEEP`
    /// bounds the rows kept per job.
    pub fn open_default() -> Result<Self> {
        let path = std::env::var("PAAS_DB_PATH").unwrap_or_else(|_| default_db_path());
        let keep = std::env::var("PAAS_HISTORY_KEEP").ok().and_then(|s| s.parse().ok()).unwrap_or(DEFAULT_KEEP);
        Ok(Self::open(&path)?.with_keep(keep))
    }

    pub fn open(path: &str) -> Result<Self> {
        let started = std::time::Instant::now();
        let db = rusqlite::Connection::open(path).with_context(|| format!("opening sqlite db at {}", path))?;
        db.pragma_update(None, "journal_mode", "WAL").ok();
        db.pragma_update(None, "synchronous", "NORMAL").ok();
        db.execute(
            "CREATE TABLE IF NOT EXISTS history (
                job_id   TEXT NOT NULL,
                step     TEXT NOT NULL,
                ts       INTEGER NOT NULL,
                is_final INTEGER NOT NULL,
                payload  BLOB NOT NULL
            )",
            [],
        )
        .context("creating history table")?;
        db.execute("CREATE INDEX IF NOT EXISTS idx_history_job_ts ON history(job_id, ts)", []).ok();
        histogram!("persist_open_ms", started.elapsed().as_secs_f64() * 1000.0);
        debug!(path, "history store opened");
        Ok(Self { db: Mutex::new(db), keep: DEFAULT_KEEP })
    }

    pub fn with_keep(mut self, keep: usize) -> Self {
        self.keep = keep.max(1);
        self
    }
}

impl HistoryStore for SqliteHistory {
    fn append(&self, entry: &HistoryEntry) -> Result<()> {
        let started = std::time::Instant::now();
        let payload = maybe_compress(&serde_json::to_string(&entry.payload)?);
        let mut db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let tx = db.transaction()?;
        tx.execute(
            "INSERT INTO history(job_id, step, ts, is_final, payload) VALUES (?1, ?2, ?3, ?4, ?5)",
            (&entry.job_id, &entry.step, entry.ts, entry.is_final, &payload),
        )?;
        // Oldest rows of the job beyond `keep` go.
        tx.execute(
            "DELETE FROM history
             WHERE job_id = ?1
               AND rowid NOT IN (
                   SELECT rowid FROM history WHERE job_id = ?1 ORDER BY ts DESC, rowid DESC LIMIT ?2
               )",
            (&entry.job_id, self.keep as i64),
        )?;
        tx.commit()?;
        histogram!("persist_put_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_put_total", 1u64);
        Ok(())
    }

    fn for_job(&self, job_id: &str) -> Result<Vec<HistoryEntry>> {
        let started = std::time::Instant::now();
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = db.prepare("SELECT step, ts, is_final, payload FROM history WHERE job_id = ?1 ORDER BY ts, rowid")?;
        let mut rows = stmt.query([job_id])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            let blob: Vec<u8> = row.get(3)?;
            let payload = serde_json::from_str(&maybe_decompress(&blob))
                .with_context(|| format!("decoding history payload of {}", job_id))?;
            out.push(HistoryEntry {
                job_id: job_id.to_string(),
                step: row.get(0)?,
                ts: row.get(1)?,
                is_final: row.get(2)?,
                payload,
            });
        }
        histogram!("persist_get_ms", started.elapsed().as_secs_f64() * 1000.0);
        Ok(out)
    }

    fn recent_jobs(&self, limit: usize) -> Result<Vec<JobOutcome>> {
        let db = self.db.lock().unwrap_or_else(PoisonError::into_inner);
        let mut stmt = db.prepare(
            "SELECT h.job_id, h.step, h.ts, h.is_final FROM history h
             WHERE h.rowid = (SELECT rowid FROM history WHERE job_id = h.job_id ORDER BY ts DESC, rowid DESC LIMIT 1)
             ORDER BY h.ts DESC, h.rowid DESC LIMIT ?1",
        )?;
        let mut rows = stmt.query([limit as i64])?;
        let mut out = Vec::new();
        while let Some(row) = rows.next()? {
            out.push(JobOutcome { job_id: row.get(0)?, last_step: row.get(1)?, ts: row.get(2)?, is_final: row.get(3)? });
        }
        Ok(out)
    }
}

fn default_db_path() -> String {
    if let Some(home) = std::env::var_os("HOME") {
        let mut p = std::path::PathBuf::from(home);
        p.push(".paas");
        let _ = std::fs::create_dir_all(&p);
        p.push("history.db");
        return p.to_string_lossy().to_string();
    }
    "paas-history.db".to_string()
}

pub fn now_ms() -> i64 {
    let now = std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap_or_default();
    now.as_millis() as i64
}

pub fn maybe_compress(text: &str) -> Vec<u8> {
    #[cfg(feature = "zstd")]
    {
        let lvl: i32 = std::env::var("PAAS_ZSTD_LEVEL").ok().and_then(|s| s.parse().ok()).unwrap_or(3);
        return zstd::encode_all(text.as_bytes(), lvl).unwrap_or_else(|_| text.as_bytes().to_vec());
    }
    #[cfg(not(feature = "zstd"))]
    text.as_bytes().to_vec()
}

pub fn maybe_decompress(blob: &[u8]) -> String {
    #[cfg(feature = "zstd")]
    {
        if let Ok(de) = zstd::decode_all(std::io::Cursor::new(blob)) {
            return String::from_utf8_lossy(&de).to_string();
        }
    }
    String::from_utf8_lossy(blob).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn temp_db() -> String {
        let dir = std::env::temp_dir();
        let f = format!("paas-test-{}.db", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        dir.join(f).to_string_lossy().to_string()
    }

    fn entry(job: &str, step: &str, ts: i64, is_final: bool) -> HistoryEntry {
        HistoryEntry { job_id: job.into(), step: step.into(), ts, is_final, payload: json!({ "step": step }) }
    }

    #[test]
    fn append_read_rotate() {
        let s = SqliteHistory::open(&temp_db()).unwrap().with_keep(3);
        for i in 0..5 {
            s.append(&entry("j1", &format!("s{}", i), i, i == 4)).unwrap();
        }
        s.append(&entry("j2", "compile", 10, false)).unwrap();
        let rows = s.for_job("j1").unwrap();
        let steps: Vec<_> = rows.iter().map(|r| r.step.as_str()).collect();
        assert_eq!(steps, vec!["s2", "s3", "s4"]);
        assert!(rows[2].is_final);
        assert_eq!(rows[0].payload, json!({ "step": "s2" }));
        assert_eq!(s.for_job("j2").unwrap().len(), 1);
    }

    #[test]
    fn recent_jobs_show_last_event() {
        let s = SqliteHistory::open(&temp_db()).unwrap();
        s.append(&entry("a", "compile", 1, false)).unwrap();
        s.append(&entry("b", "deploy", 2, false)).unwrap();
        s.append(&entry("a", "send history", 3, true)).unwrap();
        let jobs = s.recent_jobs(10).unwrap();
        assert_eq!(jobs.len(), 2);
        assert_eq!(jobs[0].job_id, "a");
        assert_eq!(jobs[0].last_step, "send history");
        assert!(jobs[0].is_final);
        assert_eq!(jobs[1].last_step, "deploy");
        assert_eq!(s.recent_jobs(1).unwrap().len(), 1);
    }
}
