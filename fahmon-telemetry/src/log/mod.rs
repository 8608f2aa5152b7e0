//! Incremental parser for the client log.
//!
//! The log is segmented on two levels. Runs start at `*** Log Started ***`
//! markers; within a run, lines prefixed `WUqq:FSss:` belong to the work-item
//! segment keyed by `(slot, queue index)`. A slice that does not begin with a
//! marker produces an implicit run.
//!
//! Lines are never rejected: anything unrecognized is kept as text and
//! attached to its segment or run.

mod line;

pub use line::{FrameEvent, LogLine, LogLineData, LogLineKind, frame_duration};

use crate::workunit::WorkUnitResult;
use chrono::{DateTime, Utc};
use fahmon_common::ProjectIdentity;
use std::collections::BTreeMap;
use tracing::{debug, trace};

/// Largest restart snapshot parsed in full.
pub const DEFAULT_SNAPSHOT_CAP: usize = 512 * 1024;

/// One work item within a run.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkItemSegment {
    pub run_index: usize,
    pub slot_id: u32,
    pub queue_index: u32,
    /// Position within its slot run.
    pub ordinal: usize,
    /// A `Starting` line was seen for this segment.
    pub started: bool,
    /// First occurrence of each frame id wins.
    pub frames: BTreeMap<u32, FrameEvent>,
    pub project: Option<ProjectIdentity>,
    pub core_id: Option<String>,
    pub core_version: Option<String>,
    pub result: WorkUnitResult,
    pub final_credit: Option<f64>,
    pub closed: bool,
    /// Indices of the log lines attached to this segment.
    pub lines: Vec<usize>,
}

impl WorkItemSegment {
    fn new(run_index: usize, slot_id: u32, queue_index: u32, ordinal: usize) -> Self {
        Self {
            run_index,
            slot_id,
            queue_index,
            ordinal,
            started: false,
            frames: BTreeMap::new(),
            project: None,
            core_id: None,
            core_version: None,
            result: WorkUnitResult::Unknown,
            final_credit: None,
            closed: false,
            lines: Vec::new(),
        }
    }

    pub fn frames_observed(&self) -> usize {
        self.frames.len()
    }

    pub fn current_frame(&self) -> Option<&FrameEvent> {
        self.frames.values().next_back()
    }

    pub fn frame_list(&self) -> Vec<FrameEvent> {
        self.frames.values().copied().collect()
    }
}

/// Segments of one slot within a run.
#[derive(Debug, Clone, PartialEq)]
pub struct SlotRun {
    pub slot_id: u32,
    pub segments: Vec<WorkItemSegment>,
}

impl SlotRun {
    fn open_index(&self, queue_index: u32) -> Option<usize> {
        self.segments
            .iter()
            .rposition(|s| s.queue_index == queue_index && !s.closed)
    }

    fn open_new(&mut self, run_index: usize, queue_index: u32, started: bool) -> usize {
        let ordinal = self.segments.len();
        let mut segment = WorkItemSegment::new(run_index, self.slot_id, queue_index, ordinal);
        segment.started = started;
        self.segments.push(segment);
        ordinal
    }
}

/// One observed client lifetime.
#[derive(Debug, Clone, PartialEq)]
pub struct ClientRun {
    pub index: usize,
    /// Index of the marker line; `None` for an implicit run.
    pub start_line: Option<usize>,
    pub started_at: Option<DateTime<Utc>>,
    pub client_version: Option<String>,
    /// Total completed units as advertised by the client.
    pub total_completed: Option<u32>,
    pub slot_runs: BTreeMap<u32, SlotRun>,
    /// Lines not tied to a work item.
    pub lines: Vec<usize>,
}

impl ClientRun {
    fn new(index: usize, start_line: Option<usize>, started_at: Option<DateTime<Utc>>) -> Self {
        Self {
            index,
            start_line,
            started_at,
            client_version: None,
            total_completed: None,
            slot_runs: BTreeMap::new(),
            lines: Vec::new(),
        }
    }

    pub fn is_implicit(&self) -> bool {
        self.start_line.is_none()
    }

    pub fn segments(&self) -> impl Iterator<Item = &WorkItemSegment> {
        self.slot_runs.values().flat_map(|s| s.segments.iter())
    }

    pub fn completed(&self) -> usize {
        self.segments()
            .filter(|s| s.result == WorkUnitResult::FinishedUnit)
            .count()
    }

    pub fn failed(&self) -> usize {
        self.segments().filter(|s| s.result.is_failure()).count()
    }

    fn close_all(&mut self) {
        for segment in self.slot_runs.values_mut().flat_map(|s| s.segments.iter_mut()) {
            segment.closed = true;
        }
    }

    fn slot_run_mut(&mut self, slot_id: u32) -> &mut SlotRun {
        self.slot_runs.entry(slot_id).or_insert_with(|| SlotRun {
            slot_id,
            segments: Vec::new(),
        })
    }
}

/// Streaming log parser.
#[derive(Debug, Clone)]
pub struct LogParser {
    lines: Vec<LogLine>,
    runs: Vec<ClientRun>,
    pending: String,
    truncated: bool,
    snapshot_cap: usize,
}

impl Default for LogParser {
    fn default() -> Self {
        Self::new()
    }
}

impl LogParser {
    pub fn new() -> Self {
        Self::with_snapshot_cap(DEFAULT_SNAPSHOT_CAP)
    }

    pub fn with_snapshot_cap(snapshot_cap: usize) -> Self {
        Self {
            lines: Vec::new(),
            runs: Vec::new(),
            pending: String::new(),
            truncated: false,
            snapshot_cap,
        }
    }

    /// Discard all state and parse `text` as a fresh snapshot.
    ///
    /// Text longer than the snapshot cap is cut to its trailing slice, starting
    /// at the first line boundary inside the slice.
    pub fn restart(&mut self, text: &str) {
        self.lines.clear();
        self.runs.clear();
        self.pending.clear();
        self.truncated = false;

        let text = if text.len() > self.snapshot_cap {
            self.truncated = true;
            let mut cut = text.len() - self.snapshot_cap;
            while !text.is_char_boundary(cut) {
                cut += 1;
            }
            let slice = &text[cut..];
            let start = slice.find('\n').map_or(slice.len(), |nl| nl + 1);
            debug!(
                original = text.len(),
                kept = slice.len() - start,
                "log snapshot truncated"
            );
            &slice[start..]
        } else {
            text
        };
        self.append(text);
    }

    /// Feed a chunk. An incomplete trailing line waits for its newline.
    pub fn append(&mut self, text: &str) {
        self.pending.push_str(text);
        let Some(last_newline) = self.pending.rfind('\n') else {
            return;
        };
        let complete: String = self.pending.drain(..=last_newline).collect();
        for raw in complete.split('\n') {
            let raw = raw.trim_end_matches('\r');
            if raw.trim().is_empty() {
                continue;
            }
            self.process_line(raw);
        }
    }

    /// Parse any held partial line as if it were complete.
    pub fn flush(&mut self) {
        if self.pending.is_empty() {
            return;
        }
        self.pending.push('\n');
        self.append("");
    }

    pub fn is_truncated(&self) -> bool {
        self.truncated
    }

    pub fn has_content(&self) -> bool {
        !self.lines.is_empty()
    }

    pub fn lines(&self) -> &[LogLine] {
        &self.lines
    }

    pub fn runs(&self) -> &[ClientRun] {
        &self.runs
    }

    /// The live run.
    pub fn current_run(&self) -> Option<&ClientRun> {
        self.runs.last()
    }

    /// The live segment of a slot: its last started open segment, else its
    /// last segment.
    pub fn current_segment(&self, slot_id: u32) -> Option<&WorkItemSegment> {
        let slot_run = self.current_run()?.slot_runs.get(&slot_id)?;
        slot_run
            .segments
            .iter()
            .rev()
            .find(|s| s.started && !s.closed)
            .or_else(|| slot_run.segments.last())
    }

    /// Most recent segment for a slot and queue index, newest run first.
    ///
    /// When `project` is given, segments that know a different project are
    /// skipped.
    pub fn find_segment(
        &self,
        slot_id: u32,
        queue_index: u32,
        project: Option<&ProjectIdentity>,
    ) -> Option<&WorkItemSegment> {
        self.runs
            .iter()
            .rev()
            .filter_map(|run| run.slot_runs.get(&slot_id))
            .flat_map(|slot_run| slot_run.segments.iter().rev())
            .find(|s| {
                s.queue_index == queue_index
                    && match (project, s.project.as_ref()) {
                        (Some(wanted), Some(seen)) => wanted == seen,
                        _ => true,
                    }
            })
    }

    /// Newest closed segment carrying `project`, in any run.
    pub fn find_closed_segment(
        &self,
        slot_id: u32,
        project: &ProjectIdentity,
    ) -> Option<&WorkItemSegment> {
        self.runs
            .iter()
            .rev()
            .filter_map(|run| run.slot_runs.get(&slot_id))
            .flat_map(|slot_run| slot_run.segments.iter().rev())
            .find(|s| s.closed && s.project.as_ref() == Some(project))
    }

    /// Raw text of a segment's lines.
    pub fn segment_text(&self, segment: &WorkItemSegment) -> String {
        segment
            .lines
            .iter()
            .filter_map(|&i| self.lines.get(i))
            .map(|l| l.raw.as_str())
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn process_line(&mut self, raw: &str) {
        let index = self.lines.len();
        let line = LogLine::parse(index, raw);

        if let Some(LogLineData::RunStarted(started_at)) = &line.data {
            if let Some(run) = self.runs.last_mut() {
                run.close_all();
            }
            let run_index = self.runs.len();
            trace!(run_index, line = index, "run started");
            let mut run = ClientRun::new(run_index, Some(index), *started_at);
            run.lines.push(index);
            self.runs.push(run);
            self.lines.push(line);
            return;
        }

        if self.runs.is_empty() {
            self.runs.push(ClientRun::new(0, None, None));
        }
        let run_index = self.runs.len() - 1;
        let run = &mut self.runs[run_index];

        match line.kind {
            LogLineKind::WorkUnit {
                queue_index,
                slot_id,
            } => {
                if let Some(LogLineData::UnitsCompleted(n)) = line.data {
                    run.total_completed = Some(n);
                }
                let starting = matches!(line.data, Some(LogLineData::Starting));
                let slot_run = run.slot_run_mut(slot_id);
                let at = match (starting, slot_run.open_index(queue_index)) {
                    (true, Some(i)) if !slot_run.segments[i].started => {
                        slot_run.segments[i].started = true;
                        i
                    }
                    (true, Some(i)) => {
                        slot_run.segments[i].closed = true;
                        slot_run.open_new(run_index, queue_index, true)
                    }
                    (true, None) => slot_run.open_new(run_index, queue_index, true),
                    (false, Some(i)) => i,
                    (false, None) => slot_run.open_new(run_index, queue_index, false),
                };
                apply_to_segment(&mut slot_run.segments[at], &line);
            }
            LogLineKind::Client | LogLineKind::Text => {
                match &line.data {
                    Some(LogLineData::Version(version)) => {
                        run.client_version = Some(version.clone());
                    }
                    Some(LogLineData::UnitsCompleted(n)) => run.total_completed = Some(*n),
                    _ => {}
                }
                run.lines.push(index);
            }
            LogLineKind::RunStarted => run.lines.push(index),
        }

        self.lines.push(line);
    }
}

fn apply_to_segment(segment: &mut WorkItemSegment, line: &LogLine) {
    segment.lines.push(line.index);
    if segment.core_id.is_none() {
        segment.core_id = line.core_tag.clone();
    }

    match &line.data {
        Some(LogLineData::Received { project, core_id }) => {
            segment.project = Some(*project);
            if core_id.is_some() {
                segment.core_id = core_id.clone();
            }
        }
        Some(LogLineData::Project(project)) => segment.project = Some(*project),
        Some(LogLineData::Version(version)) if line.core_tag.is_some() => {
            segment.core_version = Some(version.clone());
        }
        Some(LogLineData::Frame {
            complete,
            total,
            percent,
        }) => {
            if let Some(timestamp) = line.time {
                segment.frames.entry(*percent).or_insert(FrameEvent {
                    frame_id: *percent,
                    timestamp,
                    raw_complete: *complete,
                    raw_total: *total,
                });
            }
        }
        Some(LogLineData::CoreShutdown(result)) | Some(LogLineData::CoreReturned(result)) => {
            segment.result = *result;
        }
        Some(LogLineData::FinalCredit(credit)) => segment.final_credit = Some(*credit),
        Some(LogLineData::CleaningUp) => segment.closed = true,
        _ => {}
    }
}
