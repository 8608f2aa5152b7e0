//! Identity and settings types shared by fahmon components.
//!
//! Identities follow one rule throughout: a guid, when present on either side,
//! is a stronger identity signal than the name and address. Call sites choose
//! between strict identity (`identity_eq`) and the looser benchmark identity
//! (`benchmark_eq`) explicitly.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Default TCP port of the Folding@home client command server.
pub const DEFAULT_CLIENT_PORT: u16 = 36330;

/// Identity of one configured client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientIdentifier {
    /// Display name, unique within a fleet.
    pub name: String,
    /// Host name or address of the client.
    pub server: String,
    /// Command server port.
    pub port: u16,
    /// Stable guid; `None` or nil means "no guid".
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<Uuid>,
}

impl ClientIdentifier {
    pub fn new(
        name: impl Into<String>,
        server: impl Into<String>,
        port: u16,
        guid: Option<Uuid>,
    ) -> Self {
        Self {
            name: name.into(),
            server: server.into(),
            port,
            guid,
        }
    }

    /// The guid, if one is set and not nil.
    pub fn guid(&self) -> Option<Uuid> {
        self.guid.filter(|g| !g.is_nil())
    }

    pub fn has_guid(&self) -> bool {
        self.guid().is_some()
    }

    /// Strict identity: guid equality when either side has a guid, otherwise
    /// `(name, server, port)` equality.
    pub fn identity_eq(a: &Self, b: &Self) -> bool {
        match (a.guid(), b.guid()) {
            (Some(x), Some(y)) => x == y,
            (None, None) => a.address_eq(b),
            _ => false,
        }
    }

    /// Benchmark identity: guid equality when both sides have guids, otherwise
    /// `(name, server, port)` equality. A client re-added with a fresh guid keeps
    /// matching benchmarks recorded before it had one.
    pub fn benchmark_eq(a: &Self, b: &Self) -> bool {
        match (a.guid(), b.guid()) {
            (Some(x), Some(y)) => x == y,
            _ => a.address_eq(b),
        }
    }

    fn address_eq(&self, other: &Self) -> bool {
        self.name == other.name && self.server == other.server && self.port == other.port
    }

    /// `server:port` string used to open the connection.
    pub fn address(&self) -> String {
        format!("{}:{}", self.server, self.port)
    }
}

impl PartialEq for ClientIdentifier {
    fn eq(&self, other: &Self) -> bool {
        Self::identity_eq(self, other)
    }
}

impl Eq for ClientIdentifier {}

impl Hash for ClientIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self.guid() {
            Some(guid) => guid.hash(state),
            None => {
                self.name.hash(state);
                self.server.hash(state);
                self.port.hash(state);
            }
        }
    }
}

impl Ord for ClientIdentifier {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self.guid(), other.guid()) {
            (Some(x), Some(y)) => x.cmp(&y),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => (&self.name, &self.server, self.port).cmp(&(
                &other.name,
                &other.server,
                other.port,
            )),
        }
    }
}

impl PartialOrd for ClientIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for ClientIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.server.is_empty() {
            write!(f, "{}", self.name)
        } else {
            write!(f, "{} ({}:{})", self.name, self.server, self.port)
        }
    }
}

/// Identity of one compute slot on a client.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SlotIdentifier {
    pub client: ClientIdentifier,
    /// `None` for clients that predate multi-slot support.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub slot_id: Option<u32>,
}

impl SlotIdentifier {
    pub fn new(client: ClientIdentifier, slot_id: Option<u32>) -> Self {
        Self { client, slot_id }
    }

    pub fn identity_eq(a: &Self, b: &Self) -> bool {
        ClientIdentifier::identity_eq(&a.client, &b.client) && a.slot_id == b.slot_id
    }

    pub fn benchmark_eq(a: &Self, b: &Self) -> bool {
        ClientIdentifier::benchmark_eq(&a.client, &b.client) && a.slot_id == b.slot_id
    }

    /// Display name, e.g. `"rig Slot 01"`.
    pub fn name(&self) -> String {
        match self.slot_id {
            Some(id) => format!("{} Slot {:02}", self.client.name, id),
            None => self.client.name.clone(),
        }
    }
}

impl PartialEq for SlotIdentifier {
    fn eq(&self, other: &Self) -> bool {
        Self::identity_eq(self, other)
    }
}

impl Eq for SlotIdentifier {}

impl Hash for SlotIdentifier {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.client.hash(state);
        self.slot_id.hash(state);
    }
}

impl Ord for SlotIdentifier {
    fn cmp(&self, other: &Self) -> Ordering {
        self.client
            .cmp(&other.client)
            .then_with(|| self.slot_id.cmp(&other.slot_id))
    }
}

impl PartialOrd for SlotIdentifier {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl std::fmt::Display for SlotIdentifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Project/run/clone/gen quadruple identifying one work unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProjectIdentity {
    pub project_id: u32,
    pub run: u32,
    pub clone: u32,
    pub generation: u32,
}

impl ProjectIdentity {
    pub fn new(project_id: u32, run: u32, clone: u32, generation: u32) -> Self {
        Self {
            project_id,
            run,
            clone,
            generation,
        }
    }
}

impl std::fmt::Display for ProjectIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "P{} (R{}, C{}, G{})",
            self.project_id, self.run, self.clone, self.generation
        )
    }
}

/// Benchmark key within a slot: project plus the processor that ran it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ProteinBenchmarkIdentifier {
    pub project_id: u32,
    pub processor: String,
    /// CPU thread count; absent for GPU slots.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub threads: Option<u32>,
}

impl ProteinBenchmarkIdentifier {
    pub fn new(project_id: u32, processor: impl Into<String>, threads: Option<u32>) -> Self {
        Self {
            project_id,
            processor: processor.into(),
            threads,
        }
    }

    pub fn is_gpu(&self) -> bool {
        self.threads.is_none()
    }
}

/// Errors raised when client settings violate their contract.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("client name must not be empty")]
    EmptyName,

    #[error("client name '{0}' contains invalid characters")]
    InvalidName(String),

    #[error("client '{0}' has no server configured")]
    EmptyServer(String),
}

/// Connection settings for one client, as resolved from configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientSettings {
    pub name: String,
    pub server: String,
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub guid: Option<Uuid>,
}

fn default_port() -> u16 {
    DEFAULT_CLIENT_PORT
}

impl ClientSettings {
    pub fn new(name: impl Into<String>, server: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            server: server.into(),
            port,
            password: None,
            guid: None,
        }
    }

    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    pub fn with_guid(mut self, guid: Uuid) -> Self {
        self.guid = Some(guid);
        self
    }

    pub fn identifier(&self) -> ClientIdentifier {
        ClientIdentifier::new(self.name.clone(), self.server.clone(), self.port, self.guid)
    }

    pub fn validate(&self) -> Result<(), SettingsError> {
        let name = self.name.trim();
        if name.is_empty() {
            return Err(SettingsError::EmptyName);
        }
        if !is_valid_client_name(name) {
            return Err(SettingsError::InvalidName(self.name.clone()));
        }
        if self.server.trim().is_empty() {
            return Err(SettingsError::EmptyServer(self.name.clone()));
        }
        Ok(())
    }
}

/// Client names are limited to characters that are safe in file names and
/// log output.
pub fn is_valid_client_name(name: &str) -> bool {
    !name.is_empty()
        && name.chars().all(|c| {
            c.is_ascii_alphanumeric()
                || matches!(c, '+' | '=' | '-' | '_' | '$' | '&' | '^' | '[' | ']' | ' ' | '.')
        })
}
