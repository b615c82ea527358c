use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension};
use tracing::{debug, info};

use crate::batch::BatchPlan;
use crate::detect::DetectionRecord;
use crate::error::PersistenceError;
use crate::urls::UrlEntry;

pub const LEDGER_FILE: &str = "progress.sqlite";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UrlStatus {
    Pending,
    InProgress,
    Done,
    Failed,
}

impl UrlStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UrlStatus::Pending => "pending",
            UrlStatus::InProgress => "in_progress",
            UrlStatus::Done => "done",
            UrlStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for UrlStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchStats {
    pub batch_id: usize,
    pub total: usize,
    pub done: usize,
    pub failed: usize,
    pub flushed: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LedgerStats {
    pub pending: usize,
    pub in_progress: usize,
    pub done: usize,
    pub failed: usize,
    pub batches: Vec<BatchStats>,
}

impl LedgerStats {
    pub fn total(&self) -> usize {
        self.pending + self.in_progress + self.done + self.failed
    }
}

/// Durable per-URL status for one session.
///
/// Status only moves pending → in_progress → done | failed. Every move is a
/// single SQLite transaction, and a finished URL carries its serialized
/// record in the same row, so the last committed checkpoint is always a
/// consistent resume point.
pub struct ProgressLedger {
    conn: Connection,
    path: PathBuf,
}

impl ProgressLedger {
    pub fn open(path: &Path) -> Result<Self, PersistenceError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|e| PersistenceError::io(parent, e))?;
            }
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=FULL;")?;
        init_schema(&conn)?;
        Ok(Self {
            conn,
            path: path.to_path_buf(),
        })
    }

    /// Open the ledger of an existing session without creating one.
    pub fn open_existing(session_dir: &Path) -> Result<Self, PersistenceError> {
        let path = session_dir.join(LEDGER_FILE);
        if !path.exists() {
            return Err(PersistenceError::io(
                &path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no ledger for this session"),
            ));
        }
        Self::open(&path)
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Batch size the session was created with.
    pub fn batch_size(&self) -> Result<Option<usize>, PersistenceError> {
        let value: Option<String> = self
            .conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'batch_size'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        Ok(value.and_then(|v| v.parse().ok()))
    }

    /// Record the universe and its batch layout. Rows that already exist
    /// keep their status, so registering again on resume is a no-op.
    pub fn register(
        &self,
        urls: &[UrlEntry],
        batches: &[BatchPlan],
        batch_size: usize,
    ) -> Result<usize, PersistenceError> {
        let tx = self.conn.unchecked_transaction()?;
        let mut added = 0;
        {
            tx.execute(
                "INSERT OR IGNORE INTO meta (key, value) VALUES ('batch_size', ?1)",
                params![batch_size.to_string()],
            )?;
            let mut batch_stmt = tx.prepare(
                "INSERT OR IGNORE INTO batches (batch_id, start_idx, end_idx) VALUES (?1, ?2, ?3)",
            )?;
            let mut url_stmt = tx.prepare(
                "INSERT OR IGNORE INTO urls (idx, url, batch_id, updated_at) VALUES (?1, ?2, ?3, ?4)",
            )?;
            let now = Utc::now().to_rfc3339();
            for plan in batches {
                batch_stmt.execute(params![plan.id as i64, plan.start as i64, plan.end as i64])?;
                for entry in &urls[plan.start..plan.end.min(urls.len())] {
                    added += url_stmt.execute(params![
                        entry.index as i64,
                        entry.url,
                        plan.id as i64,
                        now
                    ])?;
                }
            }
        }
        tx.commit()?;
        if added > 0 {
            info!(added, ledger = %self.path.display(), "Registered URLs");
        }
        Ok(added)
    }

    /// Force every URL left in_progress by a crash back to pending.
    pub fn resume(&self) -> Result<usize, PersistenceError> {
        let reset = self.conn.execute(
            "UPDATE urls SET status = 'pending', updated_at = ?1 WHERE status = 'in_progress'",
            params![Utc::now().to_rfc3339()],
        )?;
        if reset > 0 {
            info!(reset, "Reset interrupted URLs to pending");
        }
        Ok(reset)
    }

    pub fn pending_in_batch(&self, batch_id: usize) -> Result<Vec<usize>, PersistenceError> {
        let mut stmt = self.conn.prepare(
            "SELECT idx FROM urls WHERE batch_id = ?1 AND status = 'pending' ORDER BY idx",
        )?;
        let rows = stmt
            .query_map(params![batch_id as i64], |row| row.get::<_, i64>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows.into_iter().map(|i| i as usize).collect())
    }

    pub fn status_of(&self, idx: usize) -> Result<Option<UrlStatus>, PersistenceError> {
        let status: Option<String> = self
            .conn
            .query_row(
                "SELECT status FROM urls WHERE idx = ?1",
                params![idx as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(status.as_deref().and_then(parse_status))
    }

    pub fn mark_in_progress(&self, idx: usize) -> Result<(), PersistenceError> {
        let changed = self.conn.execute(
            "UPDATE urls SET status = 'in_progress', updated_at = ?2
             WHERE idx = ?1 AND status = 'pending'",
            params![idx as i64, Utc::now().to_rfc3339()],
        )?;
        if changed == 0 {
            return Err(self.illegal(idx, UrlStatus::InProgress));
        }
        Ok(())
    }

    pub fn mark_done(
        &self,
        idx: usize,
        record: &DetectionRecord,
        attempts: u32,
    ) -> Result<(), PersistenceError> {
        self.finish(idx, UrlStatus::Done, record, attempts)
    }

    pub fn mark_failed(
        &self,
        idx: usize,
        record: &DetectionRecord,
        attempts: u32,
    ) -> Result<(), PersistenceError> {
        self.finish(idx, UrlStatus::Failed, record, attempts)
    }

    /// in_progress → done | failed, storing the record and bumping the
    /// batch checkpoint in one transaction.
    fn finish(
        &self,
        idx: usize,
        to: UrlStatus,
        record: &DetectionRecord,
        attempts: u32,
    ) -> Result<(), PersistenceError> {
        let json = serde_json::to_string(record)?;
        let now = Utc::now().to_rfc3339();

        let tx = self.conn.unchecked_transaction()?;
        let changed = tx.execute(
            "UPDATE urls SET status = ?2, attempts = ?3, error = ?4, record = ?5, updated_at = ?6
             WHERE idx = ?1 AND status = 'in_progress'",
            params![idx as i64, to.as_str(), attempts, record.error, json, now],
        )?;
        if changed == 0 {
            drop(tx);
            return Err(self.illegal(idx, to));
        }
        tx.execute(
            "UPDATE batches SET last_checkpoint = ?2
             WHERE batch_id = (SELECT batch_id FROM urls WHERE idx = ?1)",
            params![idx as i64, now],
        )?;
        tx.commit()?;
        debug!(idx, status = %to, "Checkpoint");
        Ok(())
    }

    fn illegal(&self, idx: usize, to: UrlStatus) -> PersistenceError {
        let from = match self.status_of(idx) {
            Ok(Some(s)) => s.to_string(),
            Ok(None) => "unregistered".to_string(),
            Err(e) => format!("unknown ({e})"),
        };
        PersistenceError::IllegalTransition {
            index: idx,
            from,
            to: to.as_str(),
        }
    }

    /// Stored records of a batch, in universe order.
    pub fn batch_records(
        &self,
        batch_id: usize,
    ) -> Result<Vec<(usize, DetectionRecord)>, PersistenceError> {
        let mut stmt = self.conn.prepare(
            "SELECT idx, record FROM urls
             WHERE batch_id = ?1 AND record IS NOT NULL AND status IN ('done', 'failed')
             ORDER BY idx",
        )?;
        let rows = stmt
            .query_map(params![batch_id as i64], |row| {
                Ok((row.get::<_, i64>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        rows.into_iter()
            .map(|(idx, json)| -> Result<_, PersistenceError> {
                Ok((idx as usize, serde_json::from_str(&json)?))
            })
            .collect()
    }

    /// True when no URL of the batch is pending or in_progress.
    pub fn batch_complete(&self, batch_id: usize) -> Result<bool, PersistenceError> {
        let open: i64 = self.conn.query_row(
            "SELECT COUNT(*) FROM urls
             WHERE batch_id = ?1 AND status IN ('pending', 'in_progress')",
            params![batch_id as i64],
            |row| row.get(0),
        )?;
        Ok(open == 0)
    }

    pub fn mark_flushed(&self, batch_id: usize, output: &Path) -> Result<(), PersistenceError> {
        self.conn.execute(
            "UPDATE batches SET output_path = ?2, flushed_at = ?3 WHERE batch_id = ?1",
            params![
                batch_id as i64,
                output.display().to_string(),
                Utc::now().to_rfc3339()
            ],
        )?;
        Ok(())
    }

    pub fn is_flushed(&self, batch_id: usize) -> Result<bool, PersistenceError> {
        let flushed: Option<Option<String>> = self
            .conn
            .query_row(
                "SELECT flushed_at FROM batches WHERE batch_id = ?1",
                params![batch_id as i64],
                |row| row.get(0),
            )
            .optional()?;
        Ok(matches!(flushed, Some(Some(_))))
    }

    pub fn stats(&self) -> Result<LedgerStats, PersistenceError> {
        let mut stats = LedgerStats::default();
        {
            let mut stmt = self
                .conn
                .prepare("SELECT status, COUNT(*) FROM urls GROUP BY status")?;
            let rows = stmt
                .query_map([], |row| Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?)))?
                .collect::<Result<Vec<_>, _>>()?;
            for (status, count) in rows {
                let count = count as usize;
                match parse_status(&status) {
                    Some(UrlStatus::Pending) => stats.pending = count,
                    Some(UrlStatus::InProgress) => stats.in_progress = count,
                    Some(UrlStatus::Done) => stats.done = count,
                    Some(UrlStatus::Failed) => stats.failed = count,
                    None => {}
                }
            }
        }

        let mut stmt = self.conn.prepare(
            "SELECT b.batch_id,
                    COUNT(u.idx),
                    COALESCE(SUM(u.status = 'done'), 0),
                    COALESCE(SUM(u.status = 'failed'), 0),
                    b.flushed_at IS NOT NULL
             FROM batches b LEFT JOIN urls u ON u.batch_id = b.batch_id
             GROUP BY b.batch_id ORDER BY b.batch_id",
        )?;
        stats.batches = stmt
            .query_map([], |row| {
                Ok(BatchStats {
                    batch_id: row.get::<_, i64>(0)? as usize,
                    total: row.get::<_, i64>(1)? as usize,
                    done: row.get::<_, i64>(2)? as usize,
                    failed: row.get::<_, i64>(3)? as usize,
                    flushed: row.get(4)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(stats)
    }

    /// Terminally failed URLs, sorted.
    pub fn failed_urls(&self) -> Result<Vec<String>, PersistenceError> {
        let mut stmt = self
            .conn
            .prepare("SELECT url FROM urls WHERE status = 'failed' ORDER BY url")?;
        let rows = stmt
            .query_map([], |row| row.get(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn parse_status(s: &str) -> Option<UrlStatus> {
    match s {
        "pending" => Some(UrlStatus::Pending),
        "in_progress" => Some(UrlStatus::InProgress),
        "done" => Some(UrlStatus::Done),
        "failed" => Some(UrlStatus::Failed),
        _ => None,
    }
}

fn init_schema(conn: &Connection) -> Result<(), PersistenceError> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS meta (
            key   TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS batches (
            batch_id        INTEGER PRIMARY KEY,
            start_idx       INTEGER NOT NULL,
            end_idx         INTEGER NOT NULL,
            output_path     TEXT,
            flushed_at      TEXT,
            last_checkpoint TEXT
        );

        CREATE TABLE IF NOT EXISTS urls (
            idx        INTEGER PRIMARY KEY,
            url        TEXT NOT NULL,
            batch_id   INTEGER NOT NULL REFERENCES batches(batch_id),
            status     TEXT NOT NULL DEFAULT 'pending'
                       CHECK(status IN ('pending','in_progress','done','failed')),
            attempts   INTEGER NOT NULL DEFAULT 0,
            error      TEXT,
            record     TEXT,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_urls_batch_status ON urls(batch_id, status);
        ",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::batch::partition;
    use crate::detect::DetectionEngine;
    use crate::trackerdb::{SnapshotSource, TrackerSnapshot};

    fn universe(n: usize) -> Vec<UrlEntry> {
        (0..n)
            .map(|i| UrlEntry {
                index: i,
                url: format!("https://site{i}.example"),
                rank: i as u64 + 1,
                platform: None,
            })
            .collect()
    }

    fn record(entry: &UrlEntry) -> DetectionRecord {
        let snapshot = TrackerSnapshot::empty(SnapshotSource::Fallback, Utc::now());
        DetectionEngine::new(vec![]).failed(entry, "boom", 1, &snapshot)
    }

    fn open(dir: &tempfile::TempDir, urls: &[UrlEntry], size: usize) -> ProgressLedger {
        let ledger = ProgressLedger::open(&dir.path().join(LEDGER_FILE)).unwrap();
        ledger
            .register(urls, &partition(urls.len(), size), size)
            .unwrap();
        ledger
    }

    #[test]
    fn register_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let urls = universe(5);
        let ledger = open(&dir, &urls, 2);
        assert_eq!(ledger.register(&urls, &partition(5, 2), 2).unwrap(), 0);
        assert_eq!(ledger.stats().unwrap().pending, 5);
        assert_eq!(ledger.batch_size().unwrap(), Some(2));
        assert_eq!(ledger.pending_in_batch(3).unwrap(), vec![4]);
    }

    #[test]
    fn transitions_are_monotonic() {
        let dir = tempfile::tempdir().unwrap();
        let urls = universe(3);
        let ledger = open(&dir, &urls, 3);

        // pending -> done skips in_progress
        assert!(matches!(
            ledger.mark_done(0, &record(&urls[0]), 1),
            Err(PersistenceError::IllegalTransition { .. })
        ));

        ledger.mark_in_progress(0).unwrap();
        ledger.mark_done(0, &record(&urls[0]), 1).unwrap();
        assert_eq!(ledger.status_of(0).unwrap(), Some(UrlStatus::Done));

        assert!(ledger.mark_in_progress(0).is_err());
        assert!(ledger.mark_failed(0, &record(&urls[0]), 1).is_err());
        assert!(ledger.mark_in_progress(99).is_err());
    }

    #[test]
    fn resume_resets_in_progress_only() {
        let dir = tempfile::tempdir().unwrap();
        let urls = universe(4);
        {
            let ledger = open(&dir, &urls, 4);
            ledger.mark_in_progress(0).unwrap();
            ledger.mark_done(0, &record(&urls[0]), 1).unwrap();
            ledger.mark_in_progress(1).unwrap();
            // process dies here
        }

        let ledger = open(&dir, &urls, 4);
        assert_eq!(ledger.resume().unwrap(), 1);
        assert_eq!(ledger.status_of(0).unwrap(), Some(UrlStatus::Done));
        assert_eq!(ledger.status_of(1).unwrap(), Some(UrlStatus::Pending));
        assert_eq!(ledger.pending_in_batch(1).unwrap(), vec![1, 2, 3]);
        assert_eq!(ledger.batch_records(1).unwrap().len(), 1);
    }

    #[test]
    fn batch_completion_and_flush() {
        let dir = tempfile::tempdir().unwrap();
        let urls = universe(2);
        let ledger = open(&dir, &urls, 2);

        assert!(!ledger.batch_complete(1).unwrap());
        for entry in &urls {
            ledger.mark_in_progress(entry.index).unwrap();
        }
        ledger.mark_done(0, &record(&urls[0]), 1).unwrap();
        ledger.mark_failed(1, &record(&urls[1]), 3).unwrap();
        assert!(ledger.batch_complete(1).unwrap());

        assert!(!ledger.is_flushed(1).unwrap());
        ledger.mark_flushed(1, Path::new("batch_0001.jsonl")).unwrap();
        assert!(ledger.is_flushed(1).unwrap());

        let stats = ledger.stats().unwrap();
        assert_eq!((stats.done, stats.failed, stats.total()), (1, 1, 2));
        assert_eq!(
            stats.batches,
            vec![BatchStats {
                batch_id: 1,
                total: 2,
                done: 1,
                failed: 1,
                flushed: true
            }]
        );
        assert_eq!(ledger.failed_urls().unwrap(), vec!["https://site1.example"]);
    }

    #[test]
    fn open_existing_requires_a_session() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ProgressLedger::open_existing(&dir.path().join("nope")).is_err());
    }
}
