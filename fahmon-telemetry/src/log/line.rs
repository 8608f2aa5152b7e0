//! Single-line grammar of the client log.

use crate::workunit::WorkUnitResult;
use chrono::{DateTime, NaiveTime, Utc};
use fahmon_common::ProjectIdentity;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::sync::LazyLock;
use std::time::Duration;
use tracing::debug;

const SECONDS_PER_DAY: i64 = 86_400;

static RUN_MARKER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\*+\s*Log Started\s+(\S+)\s*\*+\s*$").expect("valid regex")
});
static PREFIX_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^(\d{2}:\d{2}:\d{2}):(?:WU(\d{2}):FS(\d{2}):)?(?:(0x[0-9a-fA-F]+):)?(.*)$")
        .expect("valid regex")
});
static RECEIVED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^Received Unit: .*project:(\d+) run:(\d+) clone:(\d+) gen:(\d+)(?: core:(0x[0-9a-fA-F]+))?",
    )
    .expect("valid regex")
});
static PROJECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Project: (\d+) \(Run (\d+), Clone (\d+), Gen (\d+)\)").expect("valid regex")
});
static VERSION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Version:?\s+(\S+)").expect("valid regex"));
static COMPLETED_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Completed (\d+) out of (\d+) steps\s+\((\d+)%\)").expect("valid regex")
});
static SHUTDOWN_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Folding@home Core Shutdown: ([A-Z_]+)").expect("valid regex")
});
static RETURNED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^FahCore returned: ([A-Z_]+)").expect("valid regex"));
static CREDIT_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^Final credit estimate, ([0-9]+(?:\.[0-9]+)?) points").expect("valid regex")
});
static UNITS_COMPLETED_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^Number of Units Completed: (\d+)").expect("valid regex"));

/// One progress checkpoint of a work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameEvent {
    /// Percent complete, as printed by the core.
    pub frame_id: u32,
    /// Time of day; the log carries no date.
    pub timestamp: NaiveTime,
    pub raw_complete: u64,
    pub raw_total: u64,
}

impl FrameEvent {
    /// Elapsed time since `earlier`. A negative span is taken as one midnight
    /// crossing.
    pub fn duration_since(&self, earlier: &FrameEvent) -> Duration {
        frame_duration(earlier.timestamp, self.timestamp)
    }
}

/// `later - earlier`, plus 24 h when negative.
pub fn frame_duration(earlier: NaiveTime, later: NaiveTime) -> Duration {
    let mut seconds = (later - earlier).num_seconds();
    if seconds < 0 {
        debug!(%earlier, %later, "frame time crossed midnight");
        seconds += SECONDS_PER_DAY;
    }
    Duration::from_secs(u64::try_from(seconds).unwrap_or(0))
}

/// Where a line belongs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLineKind {
    /// `*** Log Started ... ***`
    RunStarted,
    /// Carries a `WUqq:FSss:` prefix.
    WorkUnit { queue_index: u32, slot_id: u32 },
    /// Timestamped but not tied to a work unit.
    Client,
    /// No recognizable prefix.
    Text,
}

/// Recognized payload of a line.
#[derive(Debug, Clone, PartialEq)]
pub enum LogLineData {
    RunStarted(Option<DateTime<Utc>>),
    Starting,
    Received {
        project: ProjectIdentity,
        core_id: Option<String>,
    },
    Project(ProjectIdentity),
    Version(String),
    Frame { complete: u64, total: u64, percent: u32 },
    CoreShutdown(WorkUnitResult),
    CoreReturned(WorkUnitResult),
    FinalCredit(f64),
    CleaningUp,
    UnitsCompleted(u32),
}

/// One parsed log line.
#[derive(Debug, Clone, PartialEq)]
pub struct LogLine {
    pub index: usize,
    pub raw: String,
    pub time: Option<NaiveTime>,
    pub kind: LogLineKind,
    /// Core tag such as `0xa8`, present on lines printed by the core.
    pub core_tag: Option<String>,
    pub data: Option<LogLineData>,
}

impl LogLine {
    pub fn parse(index: usize, raw: &str) -> Self {
        let raw = raw.trim_end_matches(['\r', '\n']);

        if let Some(caps) = RUN_MARKER_RE.captures(raw) {
            let started = DateTime::parse_from_rfc3339(&caps[1])
                .ok()
                .map(|dt| dt.with_timezone(&Utc));
            return Self {
                index,
                raw: raw.to_string(),
                time: None,
                kind: LogLineKind::RunStarted,
                core_tag: None,
                data: Some(LogLineData::RunStarted(started)),
            };
        }

        let Some(caps) = PREFIX_RE.captures(raw) else {
            return Self {
                index,
                raw: raw.to_string(),
                time: None,
                kind: LogLineKind::Text,
                core_tag: None,
                data: None,
            };
        };

        let time = NaiveTime::parse_from_str(&caps[1], "%H:%M:%S").ok();
        let kind = match (caps.get(2), caps.get(3)) {
            (Some(queue), Some(slot)) => match (queue.as_str().parse(), slot.as_str().parse()) {
                (Ok(queue_index), Ok(slot_id)) => LogLineKind::WorkUnit {
                    queue_index,
                    slot_id,
                },
                _ => LogLineKind::Client,
            },
            _ => LogLineKind::Client,
        };
        let core_tag = caps.get(4).map(|m| m.as_str().to_ascii_lowercase());
        let message = caps.get(5).map_or("", |m| m.as_str()).trim();
        let data = parse_data(message);

        Self {
            index,
            raw: raw.to_string(),
            time,
            kind,
            core_tag,
            data,
        }
    }

    pub fn is_run_marker(&self) -> bool {
        self.kind == LogLineKind::RunStarted
    }
}

fn parse_data(message: &str) -> Option<LogLineData> {
    if message == "Starting" {
        return Some(LogLineData::Starting);
    }
    if message.starts_with("Cleaning up") {
        return Some(LogLineData::CleaningUp);
    }
    if let Some(caps) = COMPLETED_RE.captures(message) {
        return Some(LogLineData::Frame {
            complete: caps[1].parse().ok()?,
            total: caps[2].parse().ok()?,
            percent: caps[3].parse().ok()?,
        });
    }
    if let Some(caps) = RECEIVED_RE.captures(message) {
        return Some(LogLineData::Received {
            project: project_from(&caps)?,
            core_id: caps.get(5).map(|m| m.as_str().to_ascii_lowercase()),
        });
    }
    if let Some(caps) = PROJECT_RE.captures(message) {
        return Some(LogLineData::Project(project_from(&caps)?));
    }
    if let Some(caps) = SHUTDOWN_RE.captures(message) {
        return Some(LogLineData::CoreShutdown(WorkUnitResult::parse(&caps[1])));
    }
    if let Some(caps) = RETURNED_RE.captures(message) {
        return Some(LogLineData::CoreReturned(WorkUnitResult::parse(&caps[1])));
    }
    if let Some(caps) = CREDIT_RE.captures(message) {
        return Some(LogLineData::FinalCredit(caps[1].parse().ok()?));
    }
    if let Some(caps) = UNITS_COMPLETED_RE.captures(message) {
        return Some(LogLineData::UnitsCompleted(caps[1].parse().ok()?));
    }
    if let Some(caps) = VERSION_RE.captures(message) {
        return Some(LogLineData::Version(caps[1].to_string()));
    }
    None
}

fn project_from(caps: &regex::Captures<'_>) -> Option<ProjectIdentity> {
    Some(ProjectIdentity::new(
        caps[1].parse().ok()?,
        caps[2].parse().ok()?,
        caps[3].parse().ok()?,
        caps[4].parse().ok()?,
    ))
}
