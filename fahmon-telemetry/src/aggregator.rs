//! Reconciles the message store with parsed log segments into per-slot work units.
//!
//! The queue (`units` message) decides which units exist; the log supplies
//! frames, core version and terminal results. Options and info add donor and
//! hardware details. Any of these may be missing, in which case the matching
//! fields stay `None`.

use crate::log::WorkItemSegment;
use crate::protocol::messages::{GpuInfo, UnitInfo, UnitState};
use crate::store::MessageStore;
use crate::workunit::{LogPosition, WorkUnit, WorkUnitCollection, WorkUnitPlatform};
use chrono::{DateTime, Utc};
use fahmon_common::{SlotDescription, SlotIdentifier};
use tracing::{debug, trace};

/// Folding id reported by clients with no `user` option.
const ANONYMOUS: &str = "Anonymous";

pub struct WorkUnitCollectionBuilder<'a> {
    store: &'a MessageStore,
    retrieved_at: DateTime<Utc>,
}

impl<'a> WorkUnitCollectionBuilder<'a> {
    pub fn new(store: &'a MessageStore, retrieved_at: DateTime<Utc>) -> Self {
        Self {
            store,
            retrieved_at,
        }
    }

    /// Build the units of one slot.
    ///
    /// `previous` is the slot's current unit from the prior build; it seeds
    /// the log-only fallback and is finalized once another project becomes
    /// current and its log segment has closed. A finished unit may still sit
    /// in the queue while it uploads.
    pub fn build_for_slot(
        &self,
        slot: &SlotIdentifier,
        description: Option<&SlotDescription>,
        previous: Option<&WorkUnit>,
    ) -> WorkUnitCollection {
        let entries = self
            .store
            .units_for_slot(slot.slot_id)
            .filter(|entries| !entries.is_empty());
        let Some(entries) = entries else {
            trace!(slot = %slot, "no queue entries, building from log");
            return self.build_from_log(slot, description, previous);
        };

        let units: Vec<WorkUnit> = entries
            .iter()
            .map(|entry| self.unit_from_entry(slot, description, entry))
            .collect();
        let current_id = select_current(&entries, previous);
        let finished = previous.and_then(|p| self.finalize_previous(slot, p, &units, current_id));

        WorkUnitCollection {
            units,
            current_id,
            finished,
        }
    }

    fn log_slot(slot: &SlotIdentifier) -> u32 {
        slot.slot_id.unwrap_or(0)
    }

    fn unit_from_entry(
        &self,
        slot: &SlotIdentifier,
        description: Option<&SlotDescription>,
        entry: &UnitInfo,
    ) -> WorkUnit {
        let mut unit = WorkUnit::new(entry.id, slot.clone(), self.retrieved_at);
        unit.project = entry.project_identity();
        unit.assigned = entry.assigned;
        unit.timeout = entry.timeout;
        unit.deadline = entry.deadline;
        unit.core_id = entry.core.clone();
        unit.state = Some(entry.state);
        unit.percent_done = entry.percent_done;
        unit.total_frames = entry.total_frames;
        unit.base_credit = entry.base_credit;
        unit.credit_estimate = entry.credit_estimate;
        unit.work_server = entry.work_server.clone();

        self.apply_options(&mut unit);
        unit.platform = self.platform(slot, description);

        let segment = self.store.log().find_segment(
            Self::log_slot(slot),
            entry.id,
            unit.project.as_ref(),
        );
        if let Some(segment) = segment {
            merge_segment(&mut unit, segment);
        }
        unit
    }

    fn build_from_log(
        &self,
        slot: &SlotIdentifier,
        description: Option<&SlotDescription>,
        previous: Option<&WorkUnit>,
    ) -> WorkUnitCollection {
        let segment = self.store.log().current_segment(Self::log_slot(slot));

        let mut unit = match (previous, segment) {
            (Some(previous), Some(segment)) if !conflicts(previous, segment) => {
                let mut unit = previous.clone();
                merge_segment(&mut unit, segment);
                unit
            }
            (Some(previous), None) => previous.clone(),
            (_, Some(segment)) => {
                let mut unit = WorkUnit::new(segment.queue_index, slot.clone(), self.retrieved_at);
                merge_segment(&mut unit, segment);
                unit
            }
            (None, None) => return WorkUnitCollection::default(),
        };
        unit.retrieved_at = self.retrieved_at;
        self.apply_options(&mut unit);
        if unit.platform.is_none() {
            unit.platform = self.platform(slot, description);
        }

        WorkUnitCollection {
            current_id: Some(unit.id),
            units: vec![unit],
            finished: None,
        }
    }

    /// Options unknown leaves folding id and team `None`.
    fn apply_options(&self, unit: &mut WorkUnit) {
        if let Some(options) = self.store.options() {
            unit.folding_id = Some(options.user().unwrap_or(ANONYMOUS).to_string());
            unit.team = Some(options.team().unwrap_or(0));
        }
    }

    fn platform(
        &self,
        slot: &SlotIdentifier,
        description: Option<&SlotDescription>,
    ) -> Option<WorkUnitPlatform> {
        let info = self.store.info();
        match description? {
            SlotDescription::Cpu { threads } => Some(WorkUnitPlatform::Cpu {
                processor: info.and_then(|i| i.cpu.clone()),
                threads: threads.or_else(|| info.and_then(|i| i.cpus)),
            }),
            SlotDescription::Gpu {
                bus,
                slot: pci_slot,
                processor,
                ..
            } => {
                let gpu = info.and_then(|info| self.find_gpu(&info.gpus, slot, *bus, *pci_slot));
                Some(WorkUnitPlatform::Gpu {
                    processor: processor
                        .clone()
                        .or_else(|| gpu.and_then(|g| g.name.clone())),
                    bus: bus.or_else(|| gpu.and_then(|g| g.bus)),
                    slot: pci_slot.or_else(|| gpu.and_then(|g| g.slot)),
                    driver_version: gpu.and_then(|g| g.driver_version()).map(str::to_string),
                    compute_version: gpu.and_then(|g| g.compute_version()).map(str::to_string),
                })
            }
        }
    }

    /// Match by PCI bus and slot, else by the slot's configured gpu index.
    fn find_gpu<'g>(
        &self,
        gpus: &'g [GpuInfo],
        slot: &SlotIdentifier,
        bus: Option<u32>,
        pci_slot: Option<u32>,
    ) -> Option<&'g GpuInfo> {
        if let (Some(bus), Some(pci_slot)) = (bus, pci_slot) {
            return gpus
                .iter()
                .find(|g| g.bus == Some(bus) && g.slot == Some(pci_slot));
        }
        let index = slot
            .slot_id
            .and_then(|id| self.store.slot_options(id))
            .and_then(|options| options.gpu_index())?;
        gpus.iter().find(|g| g.index == index)
    }

    /// Finalize a unit that stopped being current in `collection`.
    ///
    /// `None` while its project is still current or before its log segment
    /// has closed.
    pub fn finalize(
        &self,
        slot: &SlotIdentifier,
        unit: &WorkUnit,
        collection: &WorkUnitCollection,
    ) -> Option<WorkUnit> {
        self.finalize_previous(slot, unit, &collection.units, collection.current_id)
    }

    fn finalize_previous(
        &self,
        slot: &SlotIdentifier,
        previous: &WorkUnit,
        units: &[WorkUnit],
        current_id: Option<u32>,
    ) -> Option<WorkUnit> {
        let project = previous.project?;
        let current_project = current_id
            .and_then(|id| units.iter().find(|u| u.id == id))
            .and_then(|u| u.project);
        if current_project == Some(project) {
            return None;
        }
        let segment = self
            .store
            .log()
            .find_closed_segment(Self::log_slot(slot), &project)?;

        let mut unit = previous.clone();
        merge_segment(&mut unit, segment);
        unit.finished.get_or_insert(self.retrieved_at);
        unit.state = Some(UnitState::Done);
        unit.retrieved_at = self.retrieved_at;
        debug!(slot = %slot, project = %project, result = %unit.result, "unit finalized");
        Some(unit)
    }
}

/// `RUNNING`, else lowest-id `READY`, else the previous unit's id when still
/// queued, else the first entry.
fn select_current(entries: &[&UnitInfo], previous: Option<&WorkUnit>) -> Option<u32> {
    entries
        .iter()
        .find(|e| e.state == UnitState::Running)
        .map(|e| e.id)
        .or_else(|| {
            entries
                .iter()
                .filter(|e| e.state == UnitState::Ready)
                .map(|e| e.id)
                .min()
        })
        .or_else(|| {
            previous
                .map(|p| p.id)
                .filter(|id| entries.iter().any(|e| e.id == *id))
        })
        .or_else(|| entries.first().map(|e| e.id))
}

fn conflicts(unit: &WorkUnit, segment: &WorkItemSegment) -> bool {
    match (unit.project, segment.project) {
        (Some(a), Some(b)) => a != b,
        _ => false,
    }
}

/// Copy log-derived facts onto a unit. Frames are kept when the segment has
/// none, since a truncated snapshot may have dropped them.
fn merge_segment(unit: &mut WorkUnit, segment: &WorkItemSegment) {
    if unit.project.is_none() {
        unit.project = segment.project;
    }
    if unit.core_id.is_none() {
        unit.core_id = segment.core_id.clone();
    }
    if segment.core_version.is_some() {
        unit.core_version = segment.core_version.clone();
    }
    if !segment.frames.is_empty() {
        unit.frames = segment.frame_list();
    }
    if segment.result.is_terminal() {
        unit.result = segment.result;
    }
    if segment.final_credit.is_some() {
        unit.final_credit = segment.final_credit;
    }
    unit.log_position = Some(LogPosition {
        run_index: segment.run_index,
        ordinal: segment.ordinal,
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{MessageKind, RawMessage};
    use crate::workunit::WorkUnitResult;
    use fahmon_common::{ClientIdentifier, ProjectIdentity};

    const LOG: &str = "\
*********************** Log Started 2021-05-29T14:04:22Z ***********************
14:04:25:WU00:FS00:Starting
14:04:26:WU00:FS00:0x22:    Version: 0.0.13
14:04:26:WU00:FS00:0x22:Project: 13406 (Run 1, Clone 26, Gen 148)
14:04:30:WU00:FS00:0x22:Completed 0 out of 1000 steps (0%)
14:09:30:WU00:FS00:0x22:Completed 10 out of 1000 steps (1%)
14:14:30:WU00:FS00:0x22:Completed 20 out of 1000 steps (2%)
14:20:00:WU00:FS00:0x22:Folding@home Core Shutdown: FINISHED_UNIT
14:20:01:WU00:FS00:FahCore returned: FINISHED_UNIT (100 = 0x64)
14:20:02:WU00:FS00:Cleaning up
14:20:05:WU01:FS00:Starting
14:20:06:WU01:FS00:0xa8:Project: 18201 (Run 0, Clone 5, Gen 7)
14:20:10:WU01:FS00:0xa8:Completed 0 out of 500 steps (0%)
14:25:10:WU01:FS00:0xa8:Completed 5 out of 500 steps (1%)
";

    fn message(type_name: &str, body: &str) -> RawMessage {
        RawMessage {
            version: 1,
            kind: MessageKind::parse(type_name),
            type_name: type_name.to_string(),
            body: body.to_string(),
        }
    }

    fn log_message(text: &str) -> RawMessage {
        message("log-restart", &serde_json::to_string(text).unwrap())
    }

    fn slot() -> SlotIdentifier {
        SlotIdentifier::new(ClientIdentifier::new("rig", "host", 36330, None), Some(0))
    }

    fn store(units: &str) -> MessageStore {
        let mut store = MessageStore::new();
        store.apply(&message("units", units)).unwrap();
        store.apply(&log_message(LOG)).unwrap();
        store
    }

    #[test]
    fn test_running_beats_ready() {
        let store = store(
            r#"[{"id": "00", "state": "READY", "slot": "00"},
                {"id": "01", "state": "RUNNING", "slot": "00", "project": 18201, "run": 0, "clone": 5, "gen": 7}]"#,
        );
        let collection =
            WorkUnitCollectionBuilder::new(&store, Utc::now()).build_for_slot(&slot(), None, None);
        assert_eq!(collection.current_id, Some(1));
        let current = collection.current().unwrap();
        assert_eq!(current.frames_observed(), 2);
        assert_eq!(current.average_frame_time(), Some(std::time::Duration::from_secs(300)));
    }

    #[test]
    fn test_lowest_ready_wins() {
        let store = store(
            r#"[{"id": "02", "state": "READY", "slot": "00"},
                {"id": "01", "state": "READY", "slot": "00"}]"#,
        );
        let collection =
            WorkUnitCollectionBuilder::new(&store, Utc::now()).build_for_slot(&slot(), None, None);
        assert_eq!(collection.current_id, Some(1));
    }

    #[test]
    fn test_previous_id_then_first_entry() {
        let store = store(
            r#"[{"id": "03", "state": "SEND", "slot": "00"},
                {"id": "04", "state": "DOWNLOAD", "slot": "00"}]"#,
        );
        let builder = WorkUnitCollectionBuilder::new(&store, Utc::now());
        let previous = WorkUnit::new(4, slot(), Utc::now());
        assert_eq!(builder.build_for_slot(&slot(), None, Some(&previous)).current_id, Some(4));
        assert_eq!(builder.build_for_slot(&slot(), None, None).current_id, Some(3));
    }

    #[test]
    fn test_missing_options_leave_donor_unknown() {
        let mut store = store(r#"[{"id": "01", "state": "RUNNING", "slot": "00"}]"#);
        let builder_unit = |store: &MessageStore| {
            WorkUnitCollectionBuilder::new(store, Utc::now())
                .build_for_slot(&slot(), None, None)
                .current()
                .cloned()
                .unwrap()
        };
        let unit = builder_unit(&store);
        assert_eq!(unit.folding_id, None);
        assert_eq!(unit.team, None);

        store.apply(&message("options", r#"{"team": "42"}"#)).unwrap();
        let unit = builder_unit(&store);
        assert_eq!(unit.folding_id.as_deref(), Some("Anonymous"));
        assert_eq!(unit.team, Some(42));
    }

    #[test]
    fn test_cpu_and_gpu_platforms() {
        let mut store = store(r#"[{"id": "01", "state": "RUNNING", "slot": "00"}]"#);
        store
            .apply(&message(
                "info",
                r#"[["System", ["CPU", "AMD Ryzen 9 5950X"], ["CPUs", "32"],
                    ["GPU 0", "Bus:8 Slot:0 Func:0 NVIDIA:8 TU116 [GeForce GTX 1660 Ti]"],
                    ["CUDA Device 0", "Platform:0 Device:0 Bus:8 Slot:0 Compute:7.5 Driver:11.4"]]]"#,
            ))
            .unwrap();
        let builder = WorkUnitCollectionBuilder::new(&store, Utc::now());

        let cpu = SlotDescription::parse("cpu:16");
        let unit = builder.build_for_slot(&slot(), cpu.as_ref(), None).units.remove(0);
        assert_eq!(
            unit.platform,
            Some(WorkUnitPlatform::Cpu {
                processor: Some("AMD Ryzen 9 5950X".into()),
                threads: Some(16),
            })
        );

        let gpu = SlotDescription::parse("gpu:8:0 TU116 [GeForce GTX 1660 Ti]");
        let unit = builder.build_for_slot(&slot(), gpu.as_ref(), None).units.remove(0);
        let Some(WorkUnitPlatform::Gpu { bus, driver_version, compute_version, .. }) = unit.platform else {
            panic!("expected gpu platform");
        };
        assert_eq!(bus, Some(8));
        assert_eq!(driver_version.as_deref(), Some("11.4"));
        assert_eq!(compute_version.as_deref(), Some("7.5"));
    }

    #[test]
    fn test_log_only_fallback_uses_live_segment() {
        let mut store = MessageStore::new();
        store.apply(&log_message(LOG)).unwrap();
        let collection =
            WorkUnitCollectionBuilder::new(&store, Utc::now()).build_for_slot(&slot(), None, None);
        assert_eq!(collection.current_id, Some(1));
        let unit = collection.current().unwrap();
        assert_eq!(unit.project, Some(ProjectIdentity::new(18201, 0, 5, 7)));
        assert_eq!(unit.log_position, Some(LogPosition { run_index: 0, ordinal: 1 }));
    }

    #[test]
    fn test_log_only_fallback_keeps_previous_id() {
        let mut store = MessageStore::new();
        store.apply(&message("units", "[]")).unwrap();
        store.apply(&log_message(LOG)).unwrap();
        let mut previous = WorkUnit::new(7, slot(), Utc::now());
        previous.project = Some(ProjectIdentity::new(18201, 0, 5, 7));
        let collection = WorkUnitCollectionBuilder::new(&store, Utc::now())
            .build_for_slot(&slot(), None, Some(&previous));
        assert_eq!(collection.current_id, Some(7));
        assert_eq!(collection.current().unwrap().frames_observed(), 2);
    }

    #[test]
    fn test_empty_store_builds_nothing() {
        let store = MessageStore::new();
        let collection =
            WorkUnitCollectionBuilder::new(&store, Utc::now()).build_for_slot(&slot(), None, None);
        assert!(collection.is_empty());
        assert_eq!(collection.current_id, None);
    }

    #[test]
    fn test_previous_unit_finalized_when_project_leaves_queue() {
        let store = store(
            r#"[{"id": "01", "state": "RUNNING", "slot": "00", "project": 18201, "run": 0, "clone": 5, "gen": 7}]"#,
        );
        let mut previous = WorkUnit::new(0, slot(), Utc::now());
        previous.project = Some(ProjectIdentity::new(13406, 1, 26, 148));

        let collection = WorkUnitCollectionBuilder::new(&store, Utc::now())
            .build_for_slot(&slot(), None, Some(&previous));
        let finished = collection.finished.as_ref().unwrap();
        assert_eq!(finished.result, WorkUnitResult::FinishedUnit);
        assert_eq!(finished.frames_observed(), 3);
        assert!(finished.finished.is_some());
        assert_eq!(collection.len(), 2);
    }

    #[test]
    fn test_previous_unit_finalized_while_uploading() {
        let store = store(
            r#"[{"id": "00", "state": "SEND", "slot": "00", "project": 13406, "run": 1, "clone": 26, "gen": 148},
                {"id": "01", "state": "RUNNING", "slot": "00", "project": 18201, "run": 0, "clone": 5, "gen": 7}]"#,
        );
        let mut previous = WorkUnit::new(0, slot(), Utc::now());
        previous.project = Some(ProjectIdentity::new(13406, 1, 26, 148));
        let builder = WorkUnitCollectionBuilder::new(&store, Utc::now());

        let first = builder.build_for_slot(&slot(), None, Some(&previous));
        assert_eq!(first.current_id, Some(1));
        let finished = first.finished.as_ref().unwrap();
        assert_eq!(finished.project, Some(ProjectIdentity::new(13406, 1, 26, 148)));
        assert_eq!(finished.result, WorkUnitResult::FinishedUnit);

        // the next build carries the new current unit and finalizes nothing
        let second = builder.build_for_slot(&slot(), None, first.current());
        assert!(second.finished.is_none());
    }

    #[test]
    fn test_finalize_waits_for_closed_segment() {
        let mut store = MessageStore::new();
        store
            .apply(&message(
                "units",
                r#"[{"id": "01", "state": "RUNNING", "slot": "00", "project": 18201, "run": 0, "clone": 5, "gen": 7}]"#,
            ))
            .unwrap();
        let open_log: String = LOG.lines().take(6).map(|l| format!("{l}\n")).collect();
        store.apply(&log_message(&open_log)).unwrap();

        let mut previous = WorkUnit::new(0, slot(), Utc::now());
        previous.project = Some(ProjectIdentity::new(13406, 1, 26, 148));
        let builder = WorkUnitCollectionBuilder::new(&store, Utc::now());
        let collection = builder.build_for_slot(&slot(), None, Some(&previous));
        assert!(collection.finished.is_none());
        assert!(builder.finalize(&slot(), &previous, &collection).is_none());

        store.apply(&log_message(LOG)).unwrap();
        let builder = WorkUnitCollectionBuilder::new(&store, Utc::now());
        let collection = builder.build_for_slot(&slot(), None, None);
        let done = builder.finalize(&slot(), &previous, &collection).unwrap();
        assert_eq!(done.result, WorkUnitResult::FinishedUnit);
        assert_eq!(done.frames_observed(), 3);
    }
}
