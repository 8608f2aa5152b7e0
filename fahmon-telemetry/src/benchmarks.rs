//! Historical frame-time benchmarks per (slot, protein).
//!
//! One sample is recorded per completed unit: the truncated average of that
//! unit's frame durations. The newest [`MAX_FRAME_TIMES`] samples are kept.

use crate::workunit::WorkUnit;
use anyhow::{Context, Result};
use fahmon_common::{ClientIdentifier, ProteinBenchmarkIdentifier, SlotIdentifier};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{PoisonError, RwLock};
use std::time::Duration;
use tracing::{debug, info};

pub const MAX_FRAME_TIMES: usize = 300;

/// Sum the durations, truncate to whole seconds, then integer-divide by the
/// count.
pub fn truncated_average(durations: &[Duration]) -> Duration {
    if durations.is_empty() {
        return Duration::ZERO;
    }
    let total: Duration = durations.iter().sum();
    Duration::from_secs(total.as_secs() / durations.len() as u64)
}

/// Frame-time history of one protein on one slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProteinBenchmark {
    pub slot: SlotIdentifier,
    pub benchmark: ProteinBenchmarkIdentifier,
    /// Newest first.
    frame_times: VecDeque<Duration>,
    minimum_frame_time: Option<Duration>,
}

impl ProteinBenchmark {
    pub fn new(slot: SlotIdentifier, benchmark: ProteinBenchmarkIdentifier) -> Self {
        Self {
            slot,
            benchmark,
            frame_times: VecDeque::new(),
            minimum_frame_time: None,
        }
    }

    pub fn add_frame_time(&mut self, frame_time: Duration) {
        if frame_time.is_zero() {
            return;
        }
        self.frame_times.push_front(frame_time);
        self.frame_times.truncate(MAX_FRAME_TIMES);
        self.minimum_frame_time = Some(
            self.minimum_frame_time
                .map_or(frame_time, |min| min.min(frame_time)),
        );
    }

    pub fn frame_times(&self) -> impl Iterator<Item = Duration> + '_ {
        self.frame_times.iter().copied()
    }

    pub fn sample_count(&self) -> usize {
        self.frame_times.len()
    }

    pub fn average_frame_time(&self) -> Option<Duration> {
        if self.frame_times.is_empty() {
            return None;
        }
        let samples: Vec<Duration> = self.frame_times.iter().copied().collect();
        Some(truncated_average(&samples))
    }

    pub fn minimum_frame_time(&self) -> Option<Duration> {
        self.minimum_frame_time
    }

    fn matches(&self, slot: &SlotIdentifier, benchmark: &ProteinBenchmarkIdentifier) -> bool {
        SlotIdentifier::benchmark_eq(&self.slot, slot) && self.benchmark == *benchmark
    }
}

/// A sample recorded by [`ProteinBenchmarkService::record_completion`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedSample {
    pub slot: SlotIdentifier,
    pub benchmark: ProteinBenchmarkIdentifier,
    pub frame_time: Duration,
}

/// Benchmark store shared by every client. Writes are serialized by its lock.
///
/// Mutations only mark the store dirty; callers persist with
/// [`save_if_dirty`](Self::save_if_dirty) off the async executor.
#[derive(Debug, Default)]
pub struct ProteinBenchmarkService {
    benchmarks: RwLock<Vec<ProteinBenchmark>>,
    persistence_path: Option<PathBuf>,
    dirty: AtomicBool,
}

impl ProteinBenchmarkService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_persistence(mut self, path: PathBuf) -> Self {
        self.persistence_path = Some(path);
        self
    }

    /// Load benchmarks from `path`; a missing file yields an empty service.
    /// The service persists back to the same path.
    pub fn load_from_file(path: &Path) -> Result<Self> {
        let benchmarks = if path.exists() {
            let text = std::fs::read_to_string(path)
                .with_context(|| format!("reading benchmarks from {}", path.display()))?;
            let benchmarks: Vec<ProteinBenchmark> = serde_json::from_str(&text)
                .with_context(|| format!("parsing benchmarks in {}", path.display()))?;
            info!(count = benchmarks.len(), path = %path.display(), "loaded benchmarks");
            benchmarks
        } else {
            debug!(path = %path.display(), "no benchmark file yet");
            Vec::new()
        };
        Ok(Self {
            benchmarks: RwLock::new(benchmarks),
            persistence_path: Some(path.to_path_buf()),
            dirty: AtomicBool::new(false),
        })
    }

    /// Whether anything changed since the last save.
    pub fn is_dirty(&self) -> bool {
        self.dirty.load(Ordering::SeqCst)
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::SeqCst);
    }

    /// Save only when something changed. Returns whether a save ran.
    pub fn save_if_dirty(&self) -> Result<bool> {
        if !self.dirty.swap(false, Ordering::SeqCst) {
            return Ok(false);
        }
        if let Err(e) = self.save() {
            self.mark_dirty();
            return Err(e);
        }
        Ok(true)
    }

    /// Write all benchmarks to the persistence path, if one is set.
    pub fn save(&self) -> Result<()> {
        let Some(path) = self.persistence_path.as_ref() else {
            return Ok(());
        };
        let json = serde_json::to_string_pretty(&*self.read())?;
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).with_context(|| format!("writing {}", tmp.display()))?;
        std::fs::rename(&tmp, path).with_context(|| format!("replacing {}", path.display()))?;
        Ok(())
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Vec<ProteinBenchmark>> {
        self.benchmarks.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Vec<ProteinBenchmark>> {
        self.benchmarks.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record one sample for a completed unit.
    ///
    /// Units without a project, without frames, or whose frame durations are
    /// all zero record nothing.
    pub fn record_completion(&self, unit: &WorkUnit) -> Option<RecordedSample> {
        let project = unit.project?;
        let frame_time = unit.average_frame_time()?;
        let platform = unit.platform.as_ref();
        let benchmark = ProteinBenchmarkIdentifier::new(
            project.project_id,
            platform.and_then(|p| p.processor()).unwrap_or_default(),
            platform.and_then(|p| p.threads()),
        );

        let mut benchmarks = self.write();
        let index = match benchmarks.iter().position(|b| b.matches(&unit.slot, &benchmark)) {
            Some(index) => index,
            None => {
                benchmarks.push(ProteinBenchmark::new(unit.slot.clone(), benchmark.clone()));
                benchmarks.len() - 1
            }
        };
        benchmarks[index].add_frame_time(frame_time);
        drop(benchmarks);
        self.mark_dirty();
        debug!(
            slot = %unit.slot,
            project = project.project_id,
            frame_time_secs = frame_time.as_secs(),
            "benchmark sample recorded"
        );

        Some(RecordedSample {
            slot: unit.slot.clone(),
            benchmark,
            frame_time,
        })
    }

    /// Store a benchmark, replacing any with the same slot and key.
    pub fn insert(&self, benchmark: ProteinBenchmark) {
        let mut benchmarks = self.write();
        benchmarks.retain(|b| !b.matches(&benchmark.slot, &benchmark.benchmark));
        benchmarks.push(benchmark);
        drop(benchmarks);
        self.mark_dirty();
    }

    pub fn get(
        &self,
        slot: &SlotIdentifier,
        benchmark: &ProteinBenchmarkIdentifier,
    ) -> Option<ProteinBenchmark> {
        self.read().iter().find(|b| b.matches(slot, benchmark)).cloned()
    }

    /// Benchmarks for a slot, ordered by project id.
    pub fn by_slot(&self, slot: &SlotIdentifier) -> Vec<ProteinBenchmark> {
        let mut found: Vec<_> = self
            .read()
            .iter()
            .filter(|b| SlotIdentifier::benchmark_eq(&b.slot, slot))
            .cloned()
            .collect();
        found.sort_by(|a, b| a.benchmark.cmp(&b.benchmark));
        found
    }

    /// Remove a slot's benchmarks. Returns how many were removed.
    pub fn remove_slot(&self, slot: &SlotIdentifier) -> usize {
        let mut benchmarks = self.write();
        let before = benchmarks.len();
        benchmarks.retain(|b| !SlotIdentifier::benchmark_eq(&b.slot, slot));
        let removed = before - benchmarks.len();
        drop(benchmarks);
        if removed > 0 {
            self.mark_dirty();
        }
        removed
    }

    /// Re-key every benchmark of `old` to `new`. Returns how many moved.
    pub fn rename_client(&self, old: &ClientIdentifier, new: &ClientIdentifier) -> usize {
        let mut moved = 0;
        for benchmark in self.write().iter_mut() {
            if ClientIdentifier::benchmark_eq(&benchmark.slot.client, old) {
                benchmark.slot.client = new.clone();
                moved += 1;
            }
        }
        if moved > 0 {
            self.mark_dirty();
            info!(from = %old, to = %new, moved, "benchmarks re-keyed");
        }
        moved
    }

    pub fn len(&self) -> usize {
        self.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().is_empty()
    }
}
