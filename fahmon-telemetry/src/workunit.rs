//! Work units as produced by the aggregator.

use crate::benchmarks::truncated_average;
use crate::log::FrameEvent;
use crate::protocol::messages::UnitState;
use chrono::{DateTime, Utc};
use fahmon_common::{ProjectIdentity, SlotIdentifier};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Terminal outcome of a work unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkUnitResult {
    /// No terminal result seen yet.
    #[default]
    Unknown,
    FinishedUnit,
    EarlyUnitEnd,
    UnstableMachine,
    Interrupted,
    BadWorkUnit,
    CoreOutdated,
    GpuMemtestError,
    BadFrameChecksum,
    ClientCoreError,
    /// A result token this monitor does not recognize.
    UnknownEnum,
}

impl WorkUnitResult {
    /// Parse the worker's upper-case result token, e.g. `FINISHED_UNIT`.
    pub fn parse(token: &str) -> Self {
        match token.trim() {
            "" => Self::Unknown,
            "FINISHED_UNIT" => Self::FinishedUnit,
            "EARLY_UNIT_END" => Self::EarlyUnitEnd,
            "UNSTABLE_MACHINE" => Self::UnstableMachine,
            "INTERRUPTED" => Self::Interrupted,
            "BAD_WORK_UNIT" => Self::BadWorkUnit,
            "CORE_OUTDATED" => Self::CoreOutdated,
            "GPU_MEMTEST_ERROR" => Self::GpuMemtestError,
            "BAD_FRAME_CHECKSUM" => Self::BadFrameChecksum,
            "CLIENT_CORE_ERROR" => Self::ClientCoreError,
            _ => Self::UnknownEnum,
        }
    }

    pub fn is_terminal(self) -> bool {
        self != Self::Unknown
    }

    /// Every terminal result except a finished or interrupted unit.
    pub fn is_failure(self) -> bool {
        !matches!(self, Self::Unknown | Self::FinishedUnit | Self::Interrupted)
    }
}

impl std::fmt::Display for WorkUnitResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let token = match self {
            Self::Unknown => "UNKNOWN",
            Self::FinishedUnit => "FINISHED_UNIT",
            Self::EarlyUnitEnd => "EARLY_UNIT_END",
            Self::UnstableMachine => "UNSTABLE_MACHINE",
            Self::Interrupted => "INTERRUPTED",
            Self::BadWorkUnit => "BAD_WORK_UNIT",
            Self::CoreOutdated => "CORE_OUTDATED",
            Self::GpuMemtestError => "GPU_MEMTEST_ERROR",
            Self::BadFrameChecksum => "BAD_FRAME_CHECKSUM",
            Self::ClientCoreError => "CLIENT_CORE_ERROR",
            Self::UnknownEnum => "UNKNOWN_ENUM",
        };
        f.write_str(token)
    }
}

/// Hardware a unit ran on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum WorkUnitPlatform {
    Cpu {
        processor: Option<String>,
        threads: Option<u32>,
    },
    Gpu {
        processor: Option<String>,
        bus: Option<u32>,
        slot: Option<u32>,
        driver_version: Option<String>,
        compute_version: Option<String>,
    },
}

impl WorkUnitPlatform {
    pub fn processor(&self) -> Option<&str> {
        match self {
            Self::Cpu { processor, .. } | Self::Gpu { processor, .. } => processor.as_deref(),
        }
    }

    pub fn threads(&self) -> Option<u32> {
        match self {
            Self::Cpu { threads, .. } => *threads,
            Self::Gpu { .. } => None,
        }
    }
}

/// Where a unit's log segment sits in the client log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogPosition {
    pub run_index: usize,
    pub ordinal: usize,
}

/// One unit of work on a slot, merged from the queue, options, info and log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnit {
    /// Queue id.
    pub id: u32,
    pub slot: SlotIdentifier,
    pub project: Option<ProjectIdentity>,
    pub assigned: Option<DateTime<Utc>>,
    pub timeout: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    /// `None` until an options message has been received.
    pub folding_id: Option<String>,
    pub team: Option<u32>,
    pub core_id: Option<String>,
    pub core_version: Option<String>,
    pub platform: Option<WorkUnitPlatform>,
    /// Frames seen in the log, ordered by frame id.
    pub frames: Vec<FrameEvent>,
    pub result: WorkUnitResult,
    pub retrieved_at: DateTime<Utc>,
    pub state: Option<UnitState>,
    pub percent_done: Option<f64>,
    pub total_frames: Option<u32>,
    pub base_credit: Option<f64>,
    pub credit_estimate: Option<f64>,
    pub final_credit: Option<f64>,
    pub work_server: Option<String>,
    pub log_position: Option<LogPosition>,
}

impl WorkUnit {
    pub fn new(id: u32, slot: SlotIdentifier, retrieved_at: DateTime<Utc>) -> Self {
        Self {
            id,
            slot,
            project: None,
            assigned: None,
            timeout: None,
            deadline: None,
            finished: None,
            folding_id: None,
            team: None,
            core_id: None,
            core_version: None,
            platform: None,
            frames: Vec::new(),
            result: WorkUnitResult::Unknown,
            retrieved_at,
            state: None,
            percent_done: None,
            total_frames: None,
            base_credit: None,
            credit_estimate: None,
            final_credit: None,
            work_server: None,
            log_position: None,
        }
    }

    pub fn frames_observed(&self) -> usize {
        self.frames.len()
    }

    /// Highest frame seen; `None` when progress is unknown.
    pub fn current_frame(&self) -> Option<&FrameEvent> {
        self.frames.last()
    }

    /// Durations between consecutive frames (`N-1` to `N`).
    pub fn frame_durations(&self) -> Vec<Duration> {
        self.frames
            .windows(2)
            .filter(|w| w[1].frame_id == w[0].frame_id + 1)
            .map(|w| w[1].duration_since(&w[0]))
            .collect()
    }

    /// Truncated average frame time; `None` without any non-zero duration.
    pub fn average_frame_time(&self) -> Option<Duration> {
        let durations = self.frame_durations();
        if durations.iter().all(Duration::is_zero) {
            return None;
        }
        Some(truncated_average(&durations))
    }

    pub fn is_same_unit(&self, other: &WorkUnit) -> bool {
        self.project.is_some() && self.project == other.project && self.assigned == other.assigned
    }

    pub fn is_running(&self) -> bool {
        self.state == Some(UnitState::Running)
    }
}

/// Units for one slot and which of them is current.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkUnitCollection {
    /// Queue entries, or the single synthetic entry.
    pub units: Vec<WorkUnit>,
    pub current_id: Option<u32>,
    /// A previous unit finalized during this build.
    pub finished: Option<WorkUnit>,
}

impl WorkUnitCollection {
    pub fn current(&self) -> Option<&WorkUnit> {
        let id = self.current_id?;
        self.units.iter().find(|u| u.id == id)
    }

    pub fn get(&self, id: u32) -> Option<&WorkUnit> {
        self.units.iter().find(|u| u.id == id)
    }

    /// Queue units followed by the finalized unit, if any.
    pub fn iter(&self) -> impl Iterator<Item = &WorkUnit> {
        self.units.iter().chain(self.finished.iter())
    }

    pub fn len(&self) -> usize {
        self.units.len() + usize::from(self.finished.is_some())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
