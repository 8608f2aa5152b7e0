//! Completed work-unit history.
//!
//! Ring buffer of [`WorkUnitRecord`]s deduplicated on `(project, assigned)`,
//! optionally appended to a JSONL file.

use anyhow::Result;
use fahmon_common::SlotIdentifier;
use fahmon_telemetry::{WorkUnitRecord, WorkUnitRecordKey, WorkUnitRepository};
use std::collections::{HashSet, VecDeque};
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};
use tokio::fs::OpenOptions as AsyncOpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

pub const DEFAULT_CAPACITY: usize = 1000;

#[derive(Debug, Default)]
struct Records {
    entries: VecDeque<WorkUnitRecord>,
    keys: HashSet<WorkUnitRecordKey>,
}

impl Records {
    /// Push unless the key is known. Returns whether the record was added.
    fn push(&mut self, record: WorkUnitRecord, capacity: usize) -> bool {
        if !self.keys.insert(record.key()) {
            return false;
        }
        if self.entries.len() >= capacity {
            if let Some(evicted) = self.entries.pop_front() {
                self.keys.remove(&evicted.key());
            }
        }
        self.entries.push_back(record);
        true
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HistoryStats {
    pub total: usize,
    pub finished: usize,
    pub failed: usize,
}

#[derive(Debug)]
pub struct WorkUnitHistory {
    records: RwLock<Records>,
    capacity: usize,
    persistence_path: Option<PathBuf>,
    /// Tail of the append chain; each append waits for the one before it.
    last_write: Mutex<Option<JoinHandle<()>>>,
}

impl WorkUnitHistory {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: RwLock::new(Records::default()),
            capacity: capacity.max(1),
            persistence_path: None,
            last_write: Mutex::new(None),
        }
    }

    pub fn with_persistence(mut self, path: PathBuf) -> Self {
        self.persistence_path = Some(path);
        self
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Records> {
        self.records.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Records> {
        self.records.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Most recent first.
    pub fn recent(&self, limit: usize) -> Vec<WorkUnitRecord> {
        self.read().entries.iter().rev().take(limit).cloned().collect()
    }

    pub fn stats(&self) -> HistoryStats {
        let records = self.read();
        HistoryStats {
            total: records.entries.len(),
            finished: records
                .entries
                .iter()
                .filter(|r| r.result == fahmon_telemetry::WorkUnitResult::FinishedUnit)
                .count(),
            failed: records.entries.iter().filter(|r| r.result.is_failure()).count(),
        }
    }

    pub fn len(&self) -> usize {
        self.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().entries.is_empty()
    }

    /// Load from a JSONL file, skipping lines that do not parse. The history
    /// keeps appending to the same file.
    pub fn load_from_file(path: &Path, capacity: usize) -> std::io::Result<Self> {
        let history = Self::new(capacity).with_persistence(path.to_path_buf());
        let reader = BufReader::new(File::open(path)?);
        {
            let mut records = history.write();
            for line in reader.lines() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<WorkUnitRecord>(&line) {
                    Ok(record) => {
                        records.push(record, history.capacity);
                    }
                    Err(e) => warn!(error = %e, "skipping invalid history line"),
                }
            }
        }
        debug!(count = history.len(), path = %path.display(), "loaded unit history");
        Ok(history)
    }

    /// Wait for every append started so far.
    pub async fn flush(&self) {
        let last = self
            .last_write
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(handle) = last {
            if let Err(e) = handle.await {
                warn!(error = %e, "unit history writer failed");
            }
        }
    }

    /// Rewrite the persistence file with only the retained records. Call
    /// [`flush`](Self::flush) first when appends may be in flight.
    pub fn compact(&self) -> std::io::Result<()> {
        let Some(path) = self.persistence_path.as_ref() else {
            return Ok(());
        };
        let temp_path = path.with_extension("tmp");
        {
            let records = self.read();
            let mut file = File::create(&temp_path)?;
            for record in &records.entries {
                writeln!(file, "{}", serde_json::to_string(record)?)?;
            }
        }
        std::fs::rename(&temp_path, path)?;
        debug!(path = %path.display(), "compacted unit history");
        Ok(())
    }

    async fn persist_record_async(path: &Path, line: &str) -> std::io::Result<()> {
        let mut file = AsyncOpenOptions::new()
            .create(true)
            .append(true)
            .open(path)
            .await?;
        file.write_all(format!("{line}\n").as_bytes()).await?;
        file.flush().await?;
        Ok(())
    }

    fn persist_record_blocking(path: &Path, line: &str) -> std::io::Result<()> {
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        writeln!(file, "{line}")
    }

    /// Append one line, on the runtime when there is one. Appends run in
    /// insertion order.
    fn persist(&self, record: &WorkUnitRecord) -> Result<()> {
        let Some(path) = self.persistence_path.clone() else {
            return Ok(());
        };
        let line = serde_json::to_string(record)?;
        let Ok(runtime) = tokio::runtime::Handle::try_current() else {
            Self::persist_record_blocking(&path, &line)?;
            return Ok(());
        };

        let mut last_write = self.last_write.lock().unwrap_or_else(PoisonError::into_inner);
        let previous = last_write.take();
        *last_write = Some(runtime.spawn(async move {
            if let Some(previous) = previous {
                let _ = previous.await;
            }
            if let Err(e) = Self::persist_record_async(&path, &line).await {
                warn!(error = %e, path = %path.display(), "failed to persist unit record");
            }
        }));
        Ok(())
    }
}

impl Default for WorkUnitHistory {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}

impl WorkUnitRepository for WorkUnitHistory {
    fn insert(&self, record: WorkUnitRecord) -> Result<bool> {
        let key = record.key();
        let persisted = record.clone();
        if !self.write().push(record, self.capacity) {
            trace!(project = %key.project, "unit already recorded");
            return Ok(false);
        }
        debug!(project = %key.project, slot = %persisted.slot, result = %persisted.result, "unit recorded");
        self.persist(&persisted)?;
        Ok(true)
    }

    fn contains(&self, key: &WorkUnitRecordKey) -> bool {
        self.read().keys.contains(key)
    }

    fn records_for_slot(&self, slot: &SlotIdentifier) -> Vec<WorkUnitRecord> {
        self.read()
            .entries
            .iter()
            .filter(|r| SlotIdentifier::identity_eq(&r.slot, slot))
            .cloned()
            .collect()
    }
}
