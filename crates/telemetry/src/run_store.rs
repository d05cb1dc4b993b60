//! JSON-lines persistence for run records.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};

use pacts_core_types::{ReqId, RunRecord};
use parking_lot::Mutex;
use tracing::warn;

use crate::TelemetryError;

/// Append-only store, one JSON object per line.
pub struct RunStore {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl RunStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Persist one record. Creates parent directories on first use.
    pub fn append(&self, record: &RunRecord) -> Result<(), TelemetryError> {
        let _guard = self.write_lock.lock();
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        let line = serde_json::to_string(record)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// Load every record. Lines that fail to parse are skipped with a
    /// warning rather than poisoning the whole store.
    pub fn load_all(&self) -> Result<Vec<RunRecord>, TelemetryError> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&self.path)?;
        let reader = BufReader::new(file);
        let mut records = Vec::new();
        for (lineno, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RunRecord>(&line) {
                Ok(record) => records.push(record),
                Err(err) => {
                    warn!(target: "pacts::telemetry", lineno, %err, "skipping malformed run record");
                }
            }
        }
        Ok(records)
    }

    pub fn find(&self, req_id: &ReqId) -> Result<Option<RunRecord>, TelemetryError> {
        Ok(self
            .load_all()?
            .into_iter()
            .find(|record| &record.req_id == req_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacts_core_types::Verdict;

    fn record(req_id: ReqId) -> RunRecord {
        RunRecord {
            req_id,
            start: chrono::Utc::now(),
            end: chrono::Utc::now(),
            verdict: Verdict::Pass,
            heal_rounds: 0,
            heal_events: Vec::new(),
            executed_steps: Vec::new(),
            rca_detail: None,
            artifacts: vec!["a.png".into()],
        }
    }

    #[test]
    fn records_round_trip_through_the_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path().join("runs.jsonl"));
        let first = record(ReqId::new());
        let second = record(ReqId::new());
        store.append(&first).unwrap();
        store.append(&second).unwrap();

        let loaded = store.load_all().unwrap();
        assert_eq!(loaded, vec![first.clone(), second]);
        assert_eq!(store.find(&first.req_id).unwrap(), Some(first));
        assert_eq!(store.find(&ReqId::new()).unwrap(), None);
    }

    #[test]
    fn malformed_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("runs.jsonl");
        let store = RunStore::new(&path);
        let good = record(ReqId::new());
        store.append(&good).unwrap();
        std::fs::write(
            &path,
            format!("{}\nnot json\n", serde_json::to_string(&good).unwrap()),
        )
        .unwrap();
        assert_eq!(store.load_all().unwrap(), vec![good]);
    }

    #[test]
    fn missing_file_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = RunStore::new(dir.path().join("absent.jsonl"));
        assert!(store.load_all().unwrap().is_empty());
    }
}
