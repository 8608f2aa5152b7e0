//! Completed-unit records handed to long-term storage.

use crate::workunit::{WorkUnit, WorkUnitPlatform, WorkUnitResult};
use anyhow::Result;
use chrono::{DateTime, Utc};
use fahmon_common::{ProjectIdentity, SlotIdentifier};
use serde::{Deserialize, Serialize};

/// Uniqueness key of a stored unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct WorkUnitRecordKey {
    pub project: ProjectIdentity,
    pub assigned: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkUnitRecord {
    pub slot: SlotIdentifier,
    pub project: ProjectIdentity,
    pub folding_id: Option<String>,
    pub team: Option<u32>,
    pub result: WorkUnitResult,
    pub assigned: Option<DateTime<Utc>>,
    pub finished: Option<DateTime<Utc>>,
    pub frames_completed: u32,
    pub frame_time_secs: Option<u64>,
    pub platform: Option<WorkUnitPlatform>,
    pub core_version: Option<String>,
}

impl WorkUnitRecord {
    /// Build a record from a unit; `None` when the unit has no project.
    pub fn from_unit(unit: &WorkUnit) -> Option<Self> {
        Some(Self {
            slot: unit.slot.clone(),
            project: unit.project?,
            folding_id: unit.folding_id.clone(),
            team: unit.team,
            result: unit.result,
            assigned: unit.assigned,
            finished: unit.finished,
            frames_completed: unit.current_frame().map_or(0, |f| f.frame_id),
            frame_time_secs: unit.average_frame_time().map(|d| d.as_secs()),
            platform: unit.platform.clone(),
            core_version: unit.core_version.clone(),
        })
    }

    pub fn key(&self) -> WorkUnitRecordKey {
        WorkUnitRecordKey {
            project: self.project,
            assigned: self.assigned,
        }
    }
}

/// Sink for completed units.
pub trait WorkUnitRepository: Send + Sync {
    /// Store a record. Returns `false` when its key is already stored.
    fn insert(&self, record: WorkUnitRecord) -> Result<bool>;

    fn contains(&self, key: &WorkUnitRecordKey) -> bool;

    /// Records for a slot, oldest first.
    fn records_for_slot(&self, slot: &SlotIdentifier) -> Vec<WorkUnitRecord>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::log::FrameEvent;
    use chrono::NaiveTime;
    use fahmon_common::ClientIdentifier;

    #[test]
    fn test_record_from_finished_unit() {
        let slot = SlotIdentifier::new(ClientIdentifier::new("rig", "host", 36330, None), Some(1));
        let mut unit = WorkUnit::new(2, slot.clone(), Utc::now());
        assert!(WorkUnitRecord::from_unit(&unit).is_none());

        unit.project = Some(ProjectIdentity::new(18201, 0, 5, 12));
        unit.result = WorkUnitResult::FinishedUnit;
        unit.team = Some(234_980);
        for (id, secs) in [(98, 0), (99, 120), (100, 241)] {
            unit.frames.push(FrameEvent {
                frame_id: id,
                timestamp: NaiveTime::from_num_seconds_from_midnight_opt(secs, 0).unwrap(),
                raw_complete: u64::from(id),
                raw_total: 100,
            });
        }

        let record = WorkUnitRecord::from_unit(&unit).unwrap();
        assert_eq!(record.frames_completed, 100);
        assert_eq!(record.frame_time_secs, Some(120));
        assert_eq!(record.key().project, ProjectIdentity::new(18201, 0, 5, 12));
        assert_eq!(record.slot, slot);
    }
}
