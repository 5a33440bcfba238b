use std::{
    fs::{self, File, OpenOptions},
    io::Write,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::warn;

use crate::{
    dataset::DatasetId,
    ledger::{LedgerEntry, QueryId},
    mechanism::MechanismKind,
};

#[derive(Debug, Error)]
pub enum JournalError {
    #[error("journal io failure at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to encode journal record: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("corrupt journal record at {path}:{line}: {details}")]
    Decode {
        path: PathBuf,
        line: usize,
        details: String,
    },
}

/// Fixed-shape persisted form of one committed charge. Never carries answers.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct JournalRecord {
    pub dataset_id: DatasetId,
    pub seq: u64,
    pub query_id: QueryId,
    pub epsilon: f64,
    pub delta: f64,
    pub mechanism: MechanismKind,
    pub timestamp: DateTime<Utc>,
}

impl JournalRecord {
    pub fn from_entry(dataset_id: &DatasetId, entry: &LedgerEntry) -> Self {
        Self {
            dataset_id: dataset_id.clone(),
            seq: entry.seq,
            query_id: entry.query_id,
            epsilon: entry.cost.epsilon,
            delta: entry.cost.delta,
            mechanism: entry.mechanism,
            timestamp: entry.timestamp,
        }
    }
}

/// Append-only store of committed ledger entries, keyed by dataset.
pub trait LedgerJournal: Send + Sync {
    fn append(&self, record: &JournalRecord) -> Result<(), JournalError>;
    fn load(&self, dataset_id: &DatasetId) -> Result<Vec<JournalRecord>, JournalError>;
}

/// Journal that drops everything (in-memory only ledgers).
#[derive(Clone, Debug, Default)]
pub struct NoopJournal;

impl LedgerJournal for NoopJournal {
    fn append(&self, _record: &JournalRecord) -> Result<(), JournalError> {
        Ok(())
    }

    fn load(&self, _dataset_id: &DatasetId) -> Result<Vec<JournalRecord>, JournalError> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Default)]
pub struct MemoryJournal {
    records: Mutex<Vec<JournalRecord>>,
}

impl MemoryJournal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<JournalRecord> {
        self.records.lock().clone()
    }
}

impl LedgerJournal for MemoryJournal {
    fn append(&self, record: &JournalRecord) -> Result<(), JournalError> {
        self.records.lock().push(record.clone());
        Ok(())
    }

    fn load(&self, dataset_id: &DatasetId) -> Result<Vec<JournalRecord>, JournalError> {
        Ok(self
            .records
            .lock()
            .iter()
            .filter(|record| &record.dataset_id == dataset_id)
            .cloned()
            .collect())
    }
}

/// One JSON record per line, appended and synced on every commit.
///
/// A final line without its newline is a write that never completed: `open`
/// truncates it and `load` skips it. Corruption anywhere else is an error.
pub struct JsonLinesJournal {
    path: PathBuf,
    file: Mutex<File>,
}

impl JsonLinesJournal {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, JournalError> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|source| JournalError::Io {
                path: path.clone(),
                source,
            })?;
        let journal = Self {
            path,
            file: Mutex::new(file),
        };
        journal.truncate_torn_tail()?;
        Ok(journal)
    }

    fn truncate_torn_tail(&self) -> Result<(), JournalError> {
        let contents = fs::read(&self.path).map_err(|err| self.io_error(err))?;
        if contents.last().map_or(true, |byte| *byte == b'\n') {
            return Ok(());
        }
        let keep = contents
            .iter()
            .rposition(|byte| *byte == b'\n')
            .map_or(0, |newline| newline + 1);
        warn!(
            "truncating torn journal tail path={} dropped_bytes={}",
            self.path.display(),
            contents.len() - keep
        );
        let file = self.file.lock();
        file.set_len(keep as u64).map_err(|err| self.io_error(err))?;
        file.sync_data().map_err(|err| self.io_error(err))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn io_error(&self, source: std::io::Error) -> JournalError {
        JournalError::Io {
            path: self.path.clone(),
            source,
        }
    }
}

impl LedgerJournal for JsonLinesJournal {
    fn append(&self, record: &JournalRecord) -> Result<(), JournalError> {
        let mut line = serde_json::to_string(record)?;
        line.push('\n');
        let mut file = self.file.lock();
        let committed_len = file.metadata().map_err(|err| self.io_error(err))?.len();
        if let Err(err) = file.write_all(line.as_bytes()) {
            // Drop any partial line so the next append starts on a fresh one.
            if let Err(rollback) = file.set_len(committed_len) {
                warn!(
                    "journal rollback failed path={} error={}",
                    self.path.display(),
                    rollback
                );
            }
            return Err(self.io_error(err));
        }
        file.sync_data().map_err(|err| self.io_error(err))?;
        Ok(())
    }

    fn load(&self, dataset_id: &DatasetId) -> Result<Vec<JournalRecord>, JournalError> {
        let bytes = fs::read(&self.path).map_err(|err| self.io_error(err))?;
        // Lossy so a torn multi-byte character only spoils the tail it is in.
        let contents = String::from_utf8_lossy(&bytes);
        let torn_tail = !contents.is_empty() && !contents.ends_with('\n');
        let lines: Vec<&str> = contents.lines().collect();
        let last = lines.len().saturating_sub(1);
        let mut records = Vec::new();
        for (index, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<JournalRecord>(line) {
                Ok(record) => {
                    if &record.dataset_id == dataset_id {
                        records.push(record);
                    }
                }
                Err(err) if torn_tail && index == last => {
                    warn!(
                        "skipping torn journal tail path={} line={} error={}",
                        self.path.display(),
                        index + 1,
                        err
                    );
                }
                Err(err) => {
                    return Err(JournalError::Decode {
                        path: self.path.clone(),
                        line: index + 1,
                        details: err.to_string(),
                    })
                }
            }
        }
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn record(dataset: &str, seq: u64) -> JournalRecord {
        JournalRecord {
            dataset_id: DatasetId::new(dataset),
            seq,
            query_id: QueryId::derive(dataset, "count", seq),
            epsilon: 0.1,
            delta: 0.0,
            mechanism: MechanismKind::Laplace,
            timestamp: Utc::now(),
        }
    }

    #[test]
    fn memory_journal_filters_by_dataset() {
        let journal = MemoryJournal::new();
        journal.append(&record("a", 0)).unwrap();
        journal.append(&record("b", 0)).unwrap();
        journal.append(&record("a", 1)).unwrap();
        let loaded = journal.load(&DatasetId::new("a")).unwrap();
        assert_eq!(loaded.iter().map(|r| r.seq).collect::<Vec<_>>(), vec![0, 1]);
        assert_eq!(journal.records().len(), 3);
    }

    #[test]
    fn json_lines_journal_survives_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let first = record("survey", 0);
        let second = record("survey", 1);
        {
            let journal = JsonLinesJournal::open(&path).unwrap();
            journal.append(&first).unwrap();
            journal.append(&record("other", 0)).unwrap();
            journal.append(&second).unwrap();
        }
        let reopened = JsonLinesJournal::open(&path).unwrap();
        let loaded = reopened.load(&DatasetId::new("survey")).unwrap();
        assert_eq!(loaded, vec![first, second]);
    }

    fn encoded(records: &[JournalRecord]) -> String {
        records
            .iter()
            .map(|record| serde_json::to_string(record).unwrap() + "\n")
            .collect()
    }

    #[test]
    fn json_lines_journal_reports_corrupt_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let contents = format!("{{\"not\": \"a record\"}}\n{}", encoded(&[record("survey", 0)]));
        fs::write(&path, contents).unwrap();
        let journal = JsonLinesJournal::open(&path).unwrap();
        let err = journal.load(&DatasetId::new("survey")).unwrap_err();
        assert!(matches!(err, JournalError::Decode { line: 1, .. }));

        // A complete final line is not a torn write either.
        fs::write(&path, format!("{}{{\"not\": \"a record\"}}\n", encoded(&[record("survey", 0)])))
            .unwrap();
        let err = journal.load(&DatasetId::new("survey")).unwrap_err();
        assert!(matches!(err, JournalError::Decode { line: 2, .. }));
    }

    #[test]
    fn json_lines_journal_skips_torn_final_line() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let journal = JsonLinesJournal::open(&path).unwrap();
        let kept = [record("survey", 0), record("survey", 1)];
        let torn = serde_json::to_string(&record("survey", 2)).unwrap();
        fs::write(&path, format!("{}{}", encoded(&kept), &torn[..torn.len() / 2])).unwrap();

        let loaded = journal.load(&DatasetId::new("survey")).unwrap();
        assert_eq!(loaded, kept.to_vec());
    }

    #[test]
    fn reopen_truncates_torn_tail_before_appending() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("ledger.jsonl");
        let kept = [record("survey", 0), record("survey", 1)];
        fs::write(&path, format!("{}{{\"dataset_id\":\"sur", encoded(&kept))).unwrap();

        let journal = JsonLinesJournal::open(&path).unwrap();
        let next = record("survey", 2);
        journal.append(&next).unwrap();

        let loaded = JsonLinesJournal::open(&path)
            .unwrap()
            .load(&DatasetId::new("survey"))
            .unwrap();
        assert_eq!(loaded, vec![kept[0].clone(), kept[1].clone(), next]);
        assert!(fs::read_to_string(&path).unwrap().ends_with('\n'));
    }
}
