//! Per-client cache of the latest typed messages plus the live log parser.

use crate::error::ProtocolError;
use crate::log::LogParser;
use crate::protocol::messages::{ClientInfo, ClientOptions, SlotInfo, SlotOptions, UnitInfo};
use crate::protocol::{MessageKind, RawMessage};
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use tracing::{debug, trace, warn};

type ApplyFn = fn(&mut MessageStore, &RawMessage) -> Result<(), ProtocolError>;

/// Dispatch table from message kind to its decode-and-apply function.
/// Kinds without an entry are ignored.
static HANDLERS: &[(MessageKind, ApplyFn)] = &[
    (MessageKind::Heartbeat, apply_heartbeat),
    (MessageKind::Info, apply_info),
    (MessageKind::Options, apply_options),
    (MessageKind::SlotOptions, apply_slot_options),
    (MessageKind::Slots, apply_slots),
    (MessageKind::Units, apply_units),
    (MessageKind::LogRestart, apply_log_restart),
    (MessageKind::LogUpdate, apply_log_update),
];

/// What applying one message changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Applied {
    Updated(MessageKind),
    Ignored,
}

#[derive(Debug, Default)]
pub struct MessageStore {
    info: Option<ClientInfo>,
    options: Option<ClientOptions>,
    slot_options: BTreeMap<u32, SlotOptions>,
    slots: Option<Vec<SlotInfo>>,
    units: Option<Vec<UnitInfo>>,
    log: LogParser,
    log_received: bool,
    last_heartbeat: Option<DateTime<Utc>>,
    last_update: Option<DateTime<Utc>>,
}

impl MessageStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Apply one message. Decode failures leave prior state untouched.
    pub fn apply(&mut self, message: &RawMessage) -> Result<Applied, ProtocolError> {
        let Some((_, handler)) = HANDLERS.iter().find(|(kind, _)| *kind == message.kind) else {
            trace!(kind = %message.type_name, "ignoring message");
            return Ok(Applied::Ignored);
        };
        handler(self, message)?;
        self.last_update = Some(Utc::now());
        Ok(Applied::Updated(message.kind))
    }

    /// Apply a batch, logging and skipping messages that fail to decode.
    /// Returns the kinds that were applied, in order.
    pub fn apply_all<'a>(
        &mut self,
        messages: impl IntoIterator<Item = &'a RawMessage>,
    ) -> Vec<MessageKind> {
        let mut applied = Vec::new();
        for message in messages {
            match self.apply(message) {
                Ok(Applied::Updated(kind)) => applied.push(kind),
                Ok(Applied::Ignored) => {}
                Err(e) => warn!(error = %e, "skipping malformed message"),
            }
        }
        applied
    }

    pub fn info(&self) -> Option<&ClientInfo> {
        self.info.as_ref()
    }

    pub fn options(&self) -> Option<&ClientOptions> {
        self.options.as_ref()
    }

    pub fn slot_options(&self, slot_id: u32) -> Option<&SlotOptions> {
        self.slot_options.get(&slot_id)
    }

    pub fn slots(&self) -> Option<&[SlotInfo]> {
        self.slots.as_deref()
    }

    pub fn units(&self) -> Option<&[UnitInfo]> {
        self.units.as_deref()
    }

    /// Queue entries for one slot; `None` when no queue has arrived. A `None`
    /// slot id selects the whole queue.
    pub fn units_for_slot(&self, slot_id: Option<u32>) -> Option<Vec<&UnitInfo>> {
        let units = self.units.as_ref()?;
        Some(
            units
                .iter()
                .filter(|u| slot_id.is_none() || u.slot == slot_id)
                .collect(),
        )
    }

    pub fn log(&self) -> &LogParser {
        &self.log
    }

    pub fn last_heartbeat(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat
    }

    pub fn last_update(&self) -> Option<DateTime<Utc>> {
        self.last_update
    }

    /// Slots, queue and log have all arrived.
    pub fn is_populated(&self) -> bool {
        self.slots.is_some() && self.units.is_some() && self.log_received
    }
}

fn apply_heartbeat(store: &mut MessageStore, _message: &RawMessage) -> Result<(), ProtocolError> {
    store.last_heartbeat = Some(Utc::now());
    Ok(())
}

fn apply_info(store: &mut MessageStore, message: &RawMessage) -> Result<(), ProtocolError> {
    store.info = Some(ClientInfo::from_value(&message.json()?));
    Ok(())
}

fn apply_options(store: &mut MessageStore, message: &RawMessage) -> Result<(), ProtocolError> {
    store.options = Some(ClientOptions::from_value(&message.json()?));
    Ok(())
}

fn apply_slot_options(store: &mut MessageStore, message: &RawMessage) -> Result<(), ProtocolError> {
    let options = SlotOptions::from_value(&message.json()?);
    match options.slot_id() {
        Some(slot_id) => {
            store.slot_options.insert(slot_id, options);
        }
        None => debug!("slot-options without machine-id"),
    }
    Ok(())
}

fn apply_slots(store: &mut MessageStore, message: &RawMessage) -> Result<(), ProtocolError> {
    let slots = SlotInfo::list_from_value(&message.json()?);
    store
        .slot_options
        .retain(|id, _| slots.iter().any(|s| s.id == *id));
    store.slots = Some(slots);
    Ok(())
}

fn apply_units(store: &mut MessageStore, message: &RawMessage) -> Result<(), ProtocolError> {
    store.units = Some(UnitInfo::list_from_value(&message.json()?));
    Ok(())
}

fn apply_log_restart(store: &mut MessageStore, message: &RawMessage) -> Result<(), ProtocolError> {
    let text: String = message.decode()?;
    store.log.restart(&text);
    store.log_received = true;
    Ok(())
}

fn apply_log_update(store: &mut MessageStore, message: &RawMessage) -> Result<(), ProtocolError> {
    let text: String = message.decode()?;
    store.log.append(&text);
    store.log_received = true;
    Ok(())
}
