//! Typed views over decoded message bodies.
//!
//! The client is loose about types: numbers arrive as strings ("01",
//! "9405.00"), percentages carry a `%`, and unknown timestamps are
//! `"<invalid>"`. Every field is therefore optional and parsed leniently.

use chrono::{DateTime, Utc};
use fahmon_common::split_processor_name;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

fn value_str(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(s) => {
            let s = s.trim();
            (!s.is_empty()).then(|| s.to_string())
        }
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

fn value_u32(value: Option<&Value>) -> Option<u32> {
    match value? {
        Value::Number(n) => n.as_u64().and_then(|n| u32::try_from(n).ok()),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

fn value_f64(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().trim_end_matches('%').trim().parse().ok(),
        _ => None,
    }
}

fn value_bool(value: Option<&Value>) -> Option<bool> {
    match value? {
        Value::Bool(b) => Some(*b),
        Value::String(s) => match s.trim() {
            "true" | "True" | "1" => Some(true),
            "false" | "False" | "0" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

/// Parse a client timestamp. `<invalid>` and anything unparseable is unknown.
pub fn parse_timestamp(text: &str) -> Option<DateTime<Utc>> {
    let text = text.trim();
    if text.is_empty() || text == "<invalid>" {
        return None;
    }
    DateTime::parse_from_rfc3339(text)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}

fn value_timestamp(value: Option<&Value>) -> Option<DateTime<Utc>> {
    value_str(value).as_deref().and_then(parse_timestamp)
}

/// Split `Key:Value Key:Value ... rest` into its pairs and the trailing text.
fn key_values(text: &str) -> (BTreeMap<String, String>, String) {
    let mut pairs = BTreeMap::new();
    let mut rest = text.trim();
    loop {
        let (token, tail) = rest.split_once(char::is_whitespace).unwrap_or((rest, ""));
        match token.split_once(':') {
            Some((key, value)) if !key.is_empty() && !value.is_empty() => {
                pairs.insert(key.to_string(), value.to_string());
                rest = tail.trim_start();
            }
            _ => break,
        }
    }
    (pairs, rest.to_string())
}

/// A compute device as reported under `CUDA Device n` or `OpenCL Device n`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ComputeDevice {
    pub platform: Option<u32>,
    pub device: Option<u32>,
    pub bus: Option<u32>,
    pub slot: Option<u32>,
    pub compute: Option<String>,
    pub driver: Option<String>,
}

impl ComputeDevice {
    /// Parse `Platform:0 Device:0 Bus:8 Slot:0 Compute:7.5 Driver:11.4`.
    pub fn parse(text: &str) -> Self {
        let (pairs, _) = key_values(text);
        let num = |key: &str| pairs.get(key).and_then(|v| v.parse().ok());
        Self {
            platform: num("Platform"),
            device: num("Device"),
            bus: num("Bus"),
            slot: num("Slot"),
            compute: pairs.get("Compute").cloned(),
            driver: pairs.get("Driver").cloned(),
        }
    }
}

/// One `GPU n` entry of the info message plus its matching compute devices.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuInfo {
    pub index: u32,
    pub bus: Option<u32>,
    pub slot: Option<u32>,
    pub vendor: Option<String>,
    pub prefix: Option<String>,
    pub name: Option<String>,
    pub cuda: Option<ComputeDevice>,
    pub opencl: Option<ComputeDevice>,
}

impl GpuInfo {
    /// Parse `Bus:8 Slot:0 Func:0 NVIDIA:8 TU116 [GeForce GTX 1660 Ti]`.
    pub fn parse(index: u32, text: &str) -> Self {
        let (pairs, rest) = key_values(text);
        let vendor = pairs
            .keys()
            .find(|k| !matches!(k.as_str(), "Bus" | "Slot" | "Func"))
            .cloned();
        let (prefix, name) = split_processor_name(&rest);
        Self {
            index,
            bus: pairs.get("Bus").and_then(|v| v.parse().ok()),
            slot: pairs.get("Slot").and_then(|v| v.parse().ok()),
            vendor,
            prefix,
            name,
            cuda: None,
            opencl: None,
        }
    }

    fn device_matches(&self, device: &ComputeDevice) -> bool {
        self.bus.is_some() && self.bus == device.bus && self.slot == device.slot
    }

    /// Driver version, preferring CUDA over OpenCL.
    pub fn driver_version(&self) -> Option<&str> {
        self.cuda
            .as_ref()
            .and_then(|d| d.driver.as_deref())
            .or_else(|| self.opencl.as_ref().and_then(|d| d.driver.as_deref()))
    }

    pub fn compute_version(&self) -> Option<&str> {
        self.cuda
            .as_ref()
            .and_then(|d| d.compute.as_deref())
            .or_else(|| self.opencl.as_ref().and_then(|d| d.compute.as_deref()))
    }
}

/// The `info` message: client and host capabilities.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClientInfo {
    pub version: Option<String>,
    pub cpu: Option<String>,
    pub cpus: Option<u32>,
    pub os: Option<String>,
    pub gpus: Vec<GpuInfo>,
    /// Every section as `section -> key -> value`.
    pub sections: BTreeMap<String, BTreeMap<String, String>>,
}

impl ClientInfo {
    /// Build from `[[section, [key, value], ...], ...]`.
    pub fn from_value(value: &Value) -> Self {
        let mut sections: BTreeMap<String, BTreeMap<String, String>> = BTreeMap::new();
        for section in value.as_array().into_iter().flatten() {
            let Some(items) = section.as_array() else {
                continue;
            };
            let Some(name) = items.first().and_then(Value::as_str) else {
                continue;
            };
            let entries = sections.entry(name.to_string()).or_default();
            for pair in &items[1..] {
                let Some([key, value]) = pair.as_array().map(Vec::as_slice) else {
                    continue;
                };
                if let (Some(key), Some(value)) = (key.as_str(), value_str(Some(value))) {
                    entries.insert(key.to_string(), value);
                }
            }
        }

        let system = sections.get("System");
        let lookup = |key: &str| system.and_then(|s| s.get(key)).cloned();

        let mut gpus = Vec::new();
        let mut cuda = Vec::new();
        let mut opencl = Vec::new();
        for (key, value) in system.into_iter().flatten() {
            if let Some(index) = indexed(key, "GPU ") {
                gpus.push(GpuInfo::parse(index, value));
            } else if indexed(key, "CUDA Device ").is_some() {
                cuda.push(ComputeDevice::parse(value));
            } else if indexed(key, "OpenCL Device ").is_some() {
                opencl.push(ComputeDevice::parse(value));
            }
        }
        gpus.sort_by_key(|g| g.index);
        for gpu in &mut gpus {
            gpu.cuda = cuda.iter().find(|d| gpu.device_matches(d)).cloned();
            gpu.opencl = opencl.iter().find(|d| gpu.device_matches(d)).cloned();
        }

        Self {
            version: sections
                .get("FAH Client")
                .and_then(|s| s.get("Version"))
                .cloned(),
            cpu: lookup("CPU"),
            cpus: lookup("CPUs").and_then(|v| v.parse().ok()),
            os: lookup("OS"),
            gpus,
            sections,
        }
    }

    pub fn gpu_at(&self, bus: u32, slot: u32) -> Option<&GpuInfo> {
        self.gpus
            .iter()
            .find(|g| g.bus == Some(bus) && g.slot == Some(slot))
    }
}

fn indexed(key: &str, prefix: &str) -> Option<u32> {
    key.strip_prefix(prefix)?.trim().parse().ok()
}

/// The `options` message.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientOptions {
    pub values: BTreeMap<String, String>,
}

impl ClientOptions {
    pub fn from_value(value: &Value) -> Self {
        Self {
            values: string_map(value),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// Folding id (donor name).
    pub fn user(&self) -> Option<&str> {
        self.get("user")
    }

    pub fn team(&self) -> Option<u32> {
        self.get("team").and_then(|t| t.trim().parse().ok())
    }
}

/// The `slot-options` message for one slot.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotOptions {
    pub values: BTreeMap<String, String>,
}

impl SlotOptions {
    pub fn from_value(value: &Value) -> Self {
        Self {
            values: string_map(value),
        }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(String::as_str)
    }

    /// The slot id, carried as `machine-id`.
    pub fn slot_id(&self) -> Option<u32> {
        self.get("machine-id").and_then(|v| v.trim().parse().ok())
    }

    pub fn gpu_index(&self) -> Option<u32> {
        self.get("gpu-index").and_then(|v| v.trim().parse().ok())
    }
}

fn string_map(value: &Value) -> BTreeMap<String, String> {
    value
        .as_object()
        .into_iter()
        .flatten()
        .filter_map(|(k, v)| value_str(Some(v)).map(|v| (k.clone(), v)))
        .collect()
}

/// Slot status as reported in the `slots` message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    Paused,
    Running,
    Finishing,
    Ready,
    Stopping,
    Failed,
    Disabled,
    #[default]
    Unknown,
}

impl SlotStatus {
    pub fn parse(text: &str) -> Self {
        match text.trim().to_ascii_uppercase().as_str() {
            "PAUSED" => Self::Paused,
            "RUNNING" => Self::Running,
            "FINISHING" => Self::Finishing,
            "READY" => Self::Ready,
            "STOPPING" => Self::Stopping,
            "FAILED" => Self::Failed,
            "DISABLED" => Self::Disabled,
            _ => Self::Unknown,
        }
    }

    pub fn is_active(self) -> bool {
        matches!(self, Self::Running | Self::Finishing)
    }
}

/// One entry of the `slots` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotInfo {
    pub id: u32,
    pub status: SlotStatus,
    pub description: Option<String>,
    pub reason: Option<String>,
    pub idle: bool,
}

impl SlotInfo {
    pub fn from_value(value: &Value) -> Option<Self> {
        let id = value_u32(value.get("id"))?;
        Some(Self {
            id,
            status: value_str(value.get("status"))
                .map(|s| SlotStatus::parse(&s))
                .unwrap_or_default(),
            description: value_str(value.get("description")),
            reason: value_str(value.get("reason")),
            idle: value_bool(value.get("idle")).unwrap_or(false),
        })
    }

    pub fn list_from_value(value: &Value) -> Vec<Self> {
        value
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(Self::from_value)
            .collect()
    }
}

/// Queue entry state as reported in the `units` message.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Running,
    Ready,
    Download,
    Send,
    Paused,
    Finishing,
    Done,
    #[default]
    Unknown,
}

impl UnitState {
    pub fn parse(text: &str) -> Self {
        match text.trim().to_ascii_uppercase().as_str() {
            "RUNNING" => Self::Running,
            "READY" => Self::Ready,
            "DOWNLOAD" => Self::Download,
            "SEND" => Self::Send,
            "PAUSED" => Self::Paused,
            "FINISHING" => Self::Finishing,
            "DONE" => Self::Done,
            _ => Self::Unknown,
        }
    }
}

/// One entry of the `units` (queue-info) message.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitInfo {
    pub id: u32,
    pub state: UnitState,
    pub error: Option<String>,
    pub project: Option<u32>,
    pub run: Option<u32>,
    pub clone: Option<u32>,
    pub generation: Option<u32>,
    pub core: Option<String>,
    pub unit: Option<String>,
    pub percent_done: Option<f64>,
    pub eta: Option<String>,
    pub total_frames: Option<u32>,
    pub frames_done: Option<u32>,
    pub assigned: Option<DateTime<Utc>>,
    pub timeout: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
    pub work_server: Option<String>,
    pub collection_server: Option<String>,
    pub slot: Option<u32>,
    pub base_credit: Option<f64>,
    pub credit_estimate: Option<f64>,
}

impl UnitInfo {
    pub fn from_value(value: &Value) -> Option<Self> {
        let id = value_u32(value.get("id"))?;
        Some(Self {
            id,
            state: value_str(value.get("state"))
                .map(|s| UnitState::parse(&s))
                .unwrap_or_default(),
            error: value_str(value.get("error")),
            project: value_u32(value.get("project")),
            run: value_u32(value.get("run")),
            clone: value_u32(value.get("clone")),
            generation: value_u32(value.get("gen")),
            core: value_str(value.get("core")),
            unit: value_str(value.get("unit")),
            percent_done: value_f64(value.get("percentdone")),
            eta: value_str(value.get("eta")),
            total_frames: value_u32(value.get("totalframes")),
            frames_done: value_u32(value.get("framesdone")),
            assigned: value_timestamp(value.get("assigned")),
            timeout: value_timestamp(value.get("timeout")),
            deadline: value_timestamp(value.get("deadline")),
            work_server: value_str(value.get("ws")),
            collection_server: value_str(value.get("cs")),
            slot: value_u32(value.get("slot")),
            base_credit: value_f64(value.get("basecredit")),
            credit_estimate: value_f64(value.get("creditestimate")),
        })
    }

    pub fn list_from_value(value: &Value) -> Vec<Self> {
        value
            .as_array()
            .into_iter()
            .flatten()
            .filter_map(Self::from_value)
            .collect()
    }

    /// Project identity, when all four parts are known.
    pub fn project_identity(&self) -> Option<fahmon_common::ProjectIdentity> {
        Some(fahmon_common::ProjectIdentity::new(
            self.project?,
            self.run?,
            self.clone?,
            self.generation?,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_client_info_sections() {
        let value = json!([
            ["FAH Client", ["Version", "7.6.21"], ["Date", "Oct 20 2020"]],
            [
                "System",
                ["CPU", "AMD Ryzen 7 3700X 8-Core Processor"],
                ["CPUs", "16"],
                ["OS", "Linux 5.11.0"],
                ["GPUs", "1"],
                ["GPU 0", "Bus:8 Slot:0 Func:0 NVIDIA:8 TU116 [GeForce GTX 1660 Ti]"],
                ["CUDA Device 0", "Platform:0 Device:0 Bus:8 Slot:0 Compute:7.5 Driver:11.4"],
                ["OpenCL Device 0", "Platform:0 Device:0 Bus:8 Slot:0 Compute:1.2 Driver:470.57"]
            ]
        ]);
        let info = ClientInfo::from_value(&value);
        assert_eq!(info.version.as_deref(), Some("7.6.21"));
        assert_eq!(info.cpus, Some(16));
        assert_eq!(info.gpus.len(), 1);

        let gpu = info.gpu_at(8, 0).unwrap();
        assert_eq!(gpu.vendor.as_deref(), Some("NVIDIA"));
        assert_eq!(gpu.prefix.as_deref(), Some("TU116"));
        assert_eq!(gpu.name.as_deref(), Some("GeForce GTX 1660 Ti"));
        assert_eq!(gpu.driver_version(), Some("11.4"));
        assert_eq!(gpu.compute_version(), Some("7.5"));
        assert_eq!(gpu.opencl.as_ref().unwrap().driver.as_deref(), Some("470.57"));
    }

    #[test]
    fn test_client_info_tolerates_garbage() {
        let info = ClientInfo::from_value(&json!([1, ["System", "oops", ["CPUs"]], null]));
        assert_eq!(info.cpus, None);
        assert!(info.gpus.is_empty());
        let info = ClientInfo::from_value(&json!({"not": "an array"}));
        assert_eq!(info, ClientInfo::default());
    }

    #[test]
    fn test_options_user_and_team() {
        let options = ClientOptions::from_value(&json!({"user": "donor", "team": "223518", "power": null}));
        assert_eq!(options.user(), Some("donor"));
        assert_eq!(options.team(), Some(223518));
        assert_eq!(options.get("power"), None);
    }

    #[test]
    fn test_slot_options_machine_id() {
        let options = SlotOptions::from_value(&json!({"machine-id": "1", "gpu-index": "0"}));
        assert_eq!(options.slot_id(), Some(1));
        assert_eq!(options.gpu_index(), Some(0));
    }

    #[test]
    fn test_slots_list() {
        let slots = SlotInfo::list_from_value(&json!([
            {"id": "00", "status": "RUNNING", "description": "cpu:15", "reason": "", "idle": false},
            {"id": "01", "status": "PAUSED", "description": "gpu:8:0 TU116 [GeForce GTX 1660 Ti]", "reason": "paused", "idle": true},
            {"status": "READY"}
        ]));
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0].id, 0);
        assert_eq!(slots[0].status, SlotStatus::Running);
        assert_eq!(slots[0].reason, None);
        assert_eq!(slots[1].status, SlotStatus::Paused);
        assert!(slots[1].idle);
    }

    #[test]
    fn test_units_lenient_fields() {
        let units = UnitInfo::list_from_value(&json!([{
            "id": "01", "state": "RUNNING", "error": "NO_ERROR",
            "project": 13406, "run": "1", "clone": 26, "gen": "148",
            "core": "0x22", "percentdone": "45.20%", "totalframes": 100,
            "framesdone": "45", "assigned": "2021-05-29T14:05:00Z",
            "timeout": "<invalid>", "deadline": "2021-06-01T14:05:00Z",
            "ws": "128.252.203.10", "slot": "00", "basecredit": "9405",
            "creditestimate": "120345.67"
        }]));
        let unit = &units[0];
        assert_eq!(unit.id, 1);
        assert_eq!(unit.state, UnitState::Running);
        assert_eq!(
            unit.project_identity(),
            Some(fahmon_common::ProjectIdentity::new(13406, 1, 26, 148))
        );
        assert_eq!(unit.percent_done, Some(45.2));
        assert_eq!(unit.frames_done, Some(45));
        assert!(unit.assigned.is_some());
        assert_eq!(unit.timeout, None);
        assert_eq!(unit.slot, Some(0));
        assert_eq!(unit.base_credit, Some(9405.0));
    }

    #[test]
    fn test_unit_without_project_has_no_identity() {
        let unit = UnitInfo::from_value(&json!({"id": 2, "state": "DOWNLOAD"})).unwrap();
        assert_eq!(unit.state, UnitState::Download);
        assert_eq!(unit.project_identity(), None);
    }
}
