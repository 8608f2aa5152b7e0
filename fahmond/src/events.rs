//! Fleet change notifications over a broadcast channel.

use crate::client::{ConnectionState, RetrieveStatus};
use chrono::{DateTime, Utc};
use fahmon_common::{ClientIdentifier, SlotIdentifier};
use serde::Serialize;
use serde_json::json;
use tokio::sync::broadcast;
use tracing::{trace, warn};

const DEFAULT_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Add,
    Remove,
    Edit,
    Invalidate,
    Clear,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum FleetEvent {
    ClientChanged {
        change: ChangeKind,
        client: ClientIdentifier,
    },
    SlotsChanged {
        change: ChangeKind,
        client: ClientIdentifier,
        /// `None` when every slot of the client changed.
        slot: Option<SlotIdentifier>,
    },
    ConnectionChanged {
        client: ClientIdentifier,
        state: ConnectionState,
    },
    RetrieveFinished {
        client: ClientIdentifier,
        status: RetrieveStatus,
        retrieved_at: DateTime<Utc>,
    },
    BenchmarkRecorded {
        client: ClientIdentifier,
        slot: SlotIdentifier,
        project_id: u32,
        frame_time_secs: u64,
    },
}

impl FleetEvent {
    pub fn client(&self) -> &ClientIdentifier {
        match self {
            Self::ClientChanged { client, .. }
            | Self::SlotsChanged { client, .. }
            | Self::ConnectionChanged { client, .. }
            | Self::RetrieveFinished { client, .. }
            | Self::BenchmarkRecorded { client, .. } => client,
        }
    }

    /// One JSON line with an emission timestamp.
    pub fn to_json_line(&self) -> Option<String> {
        let mut value = match serde_json::to_value(self) {
            Ok(value) => value,
            Err(err) => {
                warn!(error = %err, "failed to serialize event");
                return None;
            }
        };
        if let Some(object) = value.as_object_mut() {
            object.insert("timestamp".into(), json!(Utc::now().to_rfc3339()));
        }
        Some(value.to_string())
    }
}

/// Broadcast channel for fleet events.
#[derive(Clone)]
pub struct EventBus {
    sender: broadcast::Sender<FleetEvent>,
}

impl EventBus {
    /// The effective buffer is clamped to at least `DEFAULT_BUFFER`.
    pub fn new(buffer: usize) -> Self {
        let buffer = buffer.max(DEFAULT_BUFFER);
        let (sender, _) = broadcast::channel(buffer);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<FleetEvent> {
        self.sender.subscribe()
    }

    /// Send to current subscribers; events with no subscriber are dropped.
    pub fn emit(&self, event: FleetEvent) {
        trace!(?event, "emit");
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER)
    }
}
