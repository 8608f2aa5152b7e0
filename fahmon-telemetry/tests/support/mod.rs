//! Shared fixtures for telemetry integration tests.

#![allow(dead_code)]

use fahmon_common::{ClientIdentifier, SlotIdentifier};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

/// A log with one finished unit on slot 0 and a second one in progress.
pub const SAMPLE_LOG: &str = "\
*********************** Log Started 2021-05-29T14:04:22Z ***********************
14:04:22:            Version: 7.6.21
14:04:22:******************************* System ********************************
14:04:22:            CPU: AMD Ryzen 9 5950X 16-Core Processor
14:04:23:WU00:FS00:Connecting to 65.254.110.245:8080
14:04:24:WU00:FS00:Received Unit: id:00 state:DOWNLOAD error:NO_ERROR project:13406 run:1 clone:26 gen:148 core:0x22 unit:0x01
14:04:25:WU00:FS00:Starting
14:04:26:WU00:FS00:0x22:    Version: 0.0.13
14:04:26:WU00:FS00:0x22:Project: 13406 (Run 1, Clone 26, Gen 148)
14:04:30:WU00:FS00:0x22:Completed 0 out of 1000 steps (0%)
14:09:30:WU00:FS00:0x22:Completed 10 out of 1000 steps (1%)
14:14:30:WU00:FS00:0x22:Completed 20 out of 1000 steps (2%)
14:19:31:WU00:FS00:0x22:Completed 30 out of 1000 steps (3%)
14:20:00:WU00:FS00:0x22:Folding@home Core Shutdown: FINISHED_UNIT
14:20:01:WU00:FS00:FahCore returned: FINISHED_UNIT (100 = 0x64)
14:20:02:WU00:FS00:Final credit estimate, 9405.00 points
14:20:02:WU00:FS00:Cleaning up
14:20:03:Number of Units Completed: 42
14:20:04:WU01:FS00:Received Unit: id:01 state:DOWNLOAD error:NO_ERROR project:18201 run:0 clone:5 gen:7 core:0xa8 unit:0x02
14:20:05:WU01:FS00:Starting
14:20:06:WU01:FS00:0xa8:    Version: 0.0.20
14:20:06:WU01:FS00:0xa8:Project: 18201 (Run 0, Clone 5, Gen 7)
14:20:10:WU01:FS00:0xa8:Completed 0 out of 500 steps (0%)
14:25:10:WU01:FS00:0xa8:Completed 5 out of 500 steps (1%)
";

pub const INFO_BODY: &str = r#"[
  ["FAH Client", ["Version", "7.6.21"]],
  ["System", ["CPU", "AMD Ryzen 9 5950X 16-Core Processor"], ["CPUs", "32"], ["OS", "Linux"],
   ["GPU 0", "Bus:8 Slot:0 Func:0 NVIDIA:8 TU116 [GeForce GTX 1660 Ti]"],
   ["CUDA Device 0", "Platform:0 Device:0 Bus:8 Slot:0 Compute:7.5 Driver:11.4"]]
]"#;

pub const OPTIONS_BODY: &str = r#"{"user": "donor", "team": "234980", "power": "full"}"#;

pub const SLOTS_BODY: &str = r#"[
  {"id": "00", "status": "RUNNING", "description": "cpu:16", "reason": "", "idle": False},
  {"id": "01", "status": "READY", "description": "gpu:8:0 TU116 [GeForce GTX 1660 Ti]", "reason": "", "idle": True}
]"#;

pub const UNITS_BODY: &str = r#"[
  {"id": "01", "state": "RUNNING", "error": "NO_ERROR", "project": 18201, "run": 0, "clone": 5, "gen": 7,
   "core": "0xa8", "unit": "0x02", "percentdone": "1.00%", "eta": "8 hours", "totalframes": 100,
   "framesdone": 1, "assigned": "2021-05-29T14:20:04Z", "timeout": "2021-05-30T14:20:04Z",
   "deadline": "2021-06-01T14:20:04Z", "ws": "65.254.110.245", "cs": "0.0.0.0", "slot": "00",
   "basecredit": "9405", "creditestimate": "11520"}
]"#;

/// One protocol frame carrying `body`.
pub fn frame(type_name: &str, body: &str) -> String {
    format!("PyON 1 {type_name}\n{body}\n---\n")
}

/// A `log-restart` or `log-update` frame; the body is a quoted string.
pub fn log_frame(type_name: &str, text: &str) -> String {
    let quoted = serde_json::to_string(text).expect("log text serializes");
    frame(type_name, &quoted)
}

/// Everything a freshly subscribed client sends, preceded by its banner.
pub fn initial_burst() -> String {
    let mut out = String::from("Welcome to the Folding@home Client command server.\n> ");
    out.push_str(&frame("heartbeat", "0"));
    out.push_str(&frame("info", INFO_BODY));
    out.push_str(&frame("options", OPTIONS_BODY));
    out.push_str(&frame("slots", SLOTS_BODY));
    out.push_str(&frame("units", UNITS_BODY));
    out.push_str(&log_frame("log-restart", SAMPLE_LOG));
    out
}

pub fn client(guid: Option<u128>) -> ClientIdentifier {
    ClientIdentifier::new("rig", "10.0.0.5", 36330, guid.map(Uuid::from_u128))
}

pub fn slot(slot_id: u32) -> SlotIdentifier {
    SlotIdentifier::new(client(Some(7)), Some(slot_id))
}

/// Route test logs through the test writer.
pub fn init_test_logging() {
    let _ = fmt()
        .with_test_writer()
        .with_env_filter(EnvFilter::new("fahmon_telemetry=debug"))
        .try_init();
}
