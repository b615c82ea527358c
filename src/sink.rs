use std::fs;
use std::path::{Path, PathBuf};

use tracing::{info, warn};

use crate::detect::DetectionRecord;
use crate::error::PersistenceError;
use crate::utils::write_atomic;

pub const BATCH_DIR: &str = "batches";
pub const COMBINED_FILE: &str = "combined.jsonl";

pub fn batch_file_name(batch_id: usize) -> String {
    format!("batch_{batch_id:04}.jsonl")
}

/// Buffers the records of the active batch and writes them out as one
/// JSON Lines file when the batch completes.
pub struct ResultSink {
    dir: PathBuf,
    active: Option<usize>,
    buffer: Vec<(usize, DetectionRecord)>,
    peak: usize,
}

impl ResultSink {
    pub fn new(session_dir: &Path) -> Self {
        Self {
            dir: session_dir.join(BATCH_DIR),
            active: None,
            buffer: Vec::new(),
            peak: 0,
        }
    }

    /// Start buffering `batch_id`, seeded with records already checkpointed
    /// for it. Anything left from another batch is dropped.
    pub fn begin(&mut self, batch_id: usize, rehydrated: Vec<(usize, DetectionRecord)>) {
        if !self.buffer.is_empty() && self.active != Some(batch_id) {
            warn!(
                dropped = self.buffer.len(),
                batch = ?self.active,
                "Discarding unflushed records of an aborted batch"
            );
        }
        self.active = Some(batch_id);
        self.buffer = rehydrated;
        self.track_peak();
    }

    pub fn push(&mut self, idx: usize, record: DetectionRecord) {
        self.buffer.push((idx, record));
        self.track_peak();
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Largest buffer size seen so far.
    pub fn peak(&self) -> usize {
        self.peak
    }

    pub fn output_path(&self, batch_id: usize) -> PathBuf {
        self.dir.join(batch_file_name(batch_id))
    }

    /// Write the buffered batch in universe order and clear the buffer.
    pub fn flush(&mut self) -> Result<PathBuf, PersistenceError> {
        let Some(batch_id) = self.active else {
            return Err(PersistenceError::io(
                &self.dir,
                std::io::Error::new(std::io::ErrorKind::InvalidInput, "no active batch to flush"),
            ));
        };

        self.buffer.sort_by_key(|(idx, _)| *idx);
        self.buffer.dedup_by_key(|(idx, _)| *idx);

        let mut out = Vec::new();
        for (_, record) in &self.buffer {
            serde_json::to_writer(&mut out, record)?;
            out.push(b'\n');
        }

        let path = self.output_path(batch_id);
        write_atomic(&path, &out)?;
        info!(
            batch = batch_id,
            records = self.buffer.len(),
            path = %path.display(),
            "Flushed batch"
        );

        self.buffer.clear();
        self.active = None;
        Ok(path)
    }

    fn track_peak(&mut self) {
        self.peak = self.peak.max(self.buffer.len());
    }
}

/// Concatenate every batch file of a session, in batch order, into
/// `combined.jsonl`. Unchanged inputs give byte-identical output.
pub fn combine(session_dir: &Path) -> Result<(PathBuf, usize), PersistenceError> {
    let dir = session_dir.join(BATCH_DIR);
    let entries = fs::read_dir(&dir).map_err(|e| PersistenceError::io(&dir, e))?;

    let mut files: Vec<PathBuf> = entries
        .filter_map(|e| e.ok().map(|e| e.path()))
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .is_some_and(|n| n.starts_with("batch_") && n.ends_with(".jsonl"))
        })
        .collect();
    files.sort();

    let mut combined = Vec::new();
    let mut lines = 0;
    for file in &files {
        let bytes = fs::read(file).map_err(|e| PersistenceError::io(file, e))?;
        lines += bytes.iter().filter(|&&b| b == b'\n').count();
        combined.extend_from_slice(&bytes);
        if !bytes.is_empty() && !bytes.ends_with(b"\n") {
            combined.push(b'\n');
            lines += 1;
        }
    }

    let out = session_dir.join(COMBINED_FILE);
    write_atomic(&out, &combined)?;
    info!(batches = files.len(), records = lines, path = %out.display(), "Combined batch outputs");
    Ok((out, lines))
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;
    use crate::detect::DetectionEngine;
    use crate::trackerdb::{SnapshotSource, TrackerSnapshot};
    use crate::urls::UrlEntry;

    fn record(i: usize) -> DetectionRecord {
        let entry = UrlEntry {
            index: i,
            url: format!("https://site{i}.example"),
            rank: i as u64 + 1,
            platform: None,
        };
        let snapshot = TrackerSnapshot::empty(SnapshotSource::Fallback, Utc::now());
        DetectionEngine::new(vec![]).failed(&entry, "timeout", 3, &snapshot)
    }

    #[test]
    fn flush_writes_in_universe_order_and_clears() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = ResultSink::new(dir.path());
        sink.begin(1, vec![(2, record(2))]);
        sink.push(0, record(0));
        sink.push(1, record(1));

        let path = sink.flush().unwrap();
        assert!(sink.is_empty());
        assert_eq!(path.file_name().unwrap(), "batch_0001.jsonl");

        let text = fs::read_to_string(&path).unwrap();
        let urls: Vec<String> = text
            .lines()
            .map(|l| serde_json::from_str::<DetectionRecord>(l).unwrap().url)
            .collect();
        assert_eq!(
            urls,
            vec!["https://site0.example", "https://site1.example", "https://site2.example"]
        );
    }

    #[test]
    fn buffer_never_exceeds_one_batch() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = ResultSink::new(dir.path());
        let batch_size = 5;
        for batch in 0..20 {
            sink.begin(batch + 1, Vec::new());
            for i in 0..batch_size {
                sink.push(batch * batch_size + i, record(batch * batch_size + i));
            }
            sink.flush().unwrap();
        }
        assert_eq!(sink.peak(), batch_size);
    }

    #[test]
    fn flush_without_batch_fails() {
        let dir = tempfile::tempdir().unwrap();
        assert!(ResultSink::new(dir.path()).flush().is_err());
    }

    #[test]
    fn combine_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let mut sink = ResultSink::new(dir.path());
        for batch in [2, 1, 10] {
            sink.begin(batch, Vec::new());
            sink.push(batch, record(batch));
            sink.flush().unwrap();
        }

        let (path, lines) = combine(dir.path()).unwrap();
        let first = fs::read(&path).unwrap();
        let (_, again) = combine(dir.path()).unwrap();
        let second = fs::read(&path).unwrap();

        assert_eq!(lines, 3);
        assert_eq!(again, 3);
        assert_eq!(first, second);

        let order: Vec<String> = String::from_utf8(first)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str::<DetectionRecord>(l).unwrap().url)
            .collect();
        assert_eq!(
            order,
            vec!["https://site1.example", "https://site2.example", "https://site10.example"]
        );
    }
}
