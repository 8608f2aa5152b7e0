//! Configuration loading for the fahmon daemon.
//!
//! Loads client definitions from clients.toml and daemon settings from daemon.toml.

use crate::poller::DEFAULT_RETRIEVE_INTERVAL;
use anyhow::{Context, Result};
use fahmon_common::{ClientSettings, DEFAULT_CLIENT_PORT};
use fahmon_telemetry::BonusCalculation;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Default config directory name.
const CONFIG_DIR_NAME: &str = "fahmon";

/// Default clients config file name.
const CLIENTS_FILE_NAME: &str = "clients.toml";

/// Default daemon config file name.
const DAEMON_FILE_NAME: &str = "daemon.toml";

const HISTORY_FILE_NAME: &str = "history.jsonl";
const BENCHMARKS_FILE_NAME: &str = "benchmarks.json";

/// Daemon configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    /// Seconds between fleet retrieves.
    #[serde(default = "default_retrieve_interval")]
    pub retrieve_interval_secs: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// A connection with no heartbeat for this long is re-established.
    #[serde(default = "default_heartbeat_timeout")]
    pub heartbeat_timeout_secs: u64,

    /// Bonus policy used for production estimates.
    #[serde(default)]
    pub bonus: BonusCalculation,

    /// Completed units kept in memory.
    #[serde(default = "default_history_capacity")]
    pub history_capacity: usize,

    /// JSONL file for completed units. Defaults to the data directory.
    #[serde(default)]
    pub history_file: Option<PathBuf>,

    /// JSON file for protein benchmarks. Defaults to the data directory.
    #[serde(default)]
    pub benchmarks_file: Option<PathBuf>,

    /// Protein catalog (JSON array of project entries).
    #[serde(default)]
    pub project_summary: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error).
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Broadcast buffer for fleet events.
    #[serde(default = "default_event_buffer")]
    pub event_buffer: usize,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            retrieve_interval_secs: default_retrieve_interval(),
            connect_timeout_secs: default_connect_timeout(),
            heartbeat_timeout_secs: default_heartbeat_timeout(),
            bonus: BonusCalculation::default(),
            history_capacity: default_history_capacity(),
            history_file: None,
            benchmarks_file: None,
            project_summary: None,
            log_level: default_log_level(),
            event_buffer: default_event_buffer(),
        }
    }
}

impl DaemonConfig {
    pub fn retrieve_interval(&self) -> Duration {
        Duration::from_secs(self.retrieve_interval_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs)
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_secs(self.heartbeat_timeout_secs)
    }

    /// Configured history file, else `history.jsonl` in the data directory.
    pub fn history_path(&self) -> Option<PathBuf> {
        self.history_file
            .clone()
            .or_else(|| data_dir().map(|d| d.join(HISTORY_FILE_NAME)))
    }

    /// Configured benchmark file, else `benchmarks.json` in the data directory.
    pub fn benchmarks_path(&self) -> Option<PathBuf> {
        self.benchmarks_file
            .clone()
            .or_else(|| data_dir().map(|d| d.join(BENCHMARKS_FILE_NAME)))
    }
}

/// Clients configuration file structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ClientsConfig {
    #[serde(default)]
    pub clients: Vec<ClientEntry>,
}

/// Single client entry in configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientEntry {
    /// Unique display name.
    pub name: String,

    /// Host name or IP address of the client.
    pub server: String,

    #[serde(default = "default_port")]
    pub port: u16,

    #[serde(default)]
    pub password: Option<String>,

    /// Stable identity across renames and address changes.
    #[serde(default)]
    pub guid: Option<Uuid>,

    #[serde(default = "default_true")]
    pub enabled: bool,
}

impl From<ClientEntry> for ClientSettings {
    fn from(entry: ClientEntry) -> Self {
        let mut settings = ClientSettings::new(entry.name, entry.server, entry.port);
        if let Some(password) = entry.password.filter(|p| !p.is_empty()) {
            settings = settings.with_password(password);
        }
        if let Some(guid) = entry.guid {
            settings = settings.with_guid(guid);
        }
        settings
    }
}

fn default_retrieve_interval() -> u64 {
    DEFAULT_RETRIEVE_INTERVAL.as_secs()
}

fn default_connect_timeout() -> u64 {
    5
}

fn default_heartbeat_timeout() -> u64 {
    180
}

fn default_history_capacity() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_event_buffer() -> usize {
    256
}

fn default_port() -> u16 {
    DEFAULT_CLIENT_PORT
}

fn default_true() -> bool {
    true
}

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("org", "fahmon", CONFIG_DIR_NAME)
}

/// Get the configuration directory path.
pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.config_dir().to_path_buf())
}

/// Directory for history and benchmark files.
pub fn data_dir() -> Option<PathBuf> {
    project_dirs().map(|dirs| dirs.data_dir().to_path_buf())
}

fn resolve(path: Option<&Path>, file_name: &str) -> Result<PathBuf> {
    match path {
        Some(p) => Ok(p.to_path_buf()),
        None => {
            let dir = config_dir().context("Could not determine config directory")?;
            Ok(dir.join(file_name))
        }
    }
}

/// Load daemon configuration from file.
pub fn load_daemon_config(path: Option<&Path>) -> Result<DaemonConfig> {
    let config_path = resolve(path, DAEMON_FILE_NAME)?;

    if !config_path.exists() {
        debug!("Daemon config not found at {:?}, using defaults", config_path);
        return Ok(DaemonConfig::default());
    }

    info!("Loading daemon config from {:?}", config_path);
    let contents = std::fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read daemon config from {:?}", config_path))?;

    let config: DaemonConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse daemon config from {:?}", config_path))?;

    Ok(config)
}

/// Load clients configuration from file.
pub fn load_clients_config(path: Option<&Path>) -> Result<ClientsConfig> {
    let config_path = resolve(path, CLIENTS_FILE_NAME)?;

    if !config_path.exists() {
        warn!("Clients config not found at {:?}", config_path);
        return Ok(ClientsConfig::default());
    }

    info!("Loading clients config from {:?}", config_path);
    let contents = std::fs::read_to_string(&config_path)
        .with_context(|| format!("Failed to read clients config from {:?}", config_path))?;

    let config: ClientsConfig = toml::from_str(&contents)
        .with_context(|| format!("Failed to parse clients config from {:?}", config_path))?;

    info!("Loaded {} client definitions", config.clients.len());
    Ok(config)
}

/// Load enabled clients as settings.
pub fn load_clients(path: Option<&Path>) -> Result<Vec<ClientSettings>> {
    let config = load_clients_config(path)?;
    Ok(enabled_clients(config))
}

fn enabled_clients(config: ClientsConfig) -> Vec<ClientSettings> {
    let clients: Vec<ClientSettings> = config
        .clients
        .into_iter()
        .filter(|c| c.enabled)
        .map(ClientSettings::from)
        .collect();
    debug!("Loaded {} enabled clients", clients.len());
    clients
}

/// Generate an example clients.toml configuration.
pub fn example_clients_config() -> String {
    r#"# fahmon Clients Configuration
# Place this file at ~/.config/fahmon/clients.toml

[[clients]]
name = "workstation"
server = "192.168.1.20"
port = 36330
enabled = true

[[clients]]
name = "gpu-rig"
server = "192.168.1.21"
password = "secret"
guid = "4d1a7e0c-93b2-4f1e-9a55-2f1c6b0de812"

# Disabled client example
[[clients]]
name = "laptop"
server = "laptop.local"
enabled = false
"#
    .to_string()
}

/// Generate an example daemon.toml configuration.
pub fn example_daemon_config() -> String {
    r#"# fahmon Daemon Configuration
# Place this file at ~/.config/fahmon/daemon.toml

# Seconds between retrieves of every client
retrieve_interval_secs = 60

# Connect timeout (seconds)
connect_timeout_secs = 5

# Reconnect when no heartbeat arrived for this long (seconds)
heartbeat_timeout_secs = 180

# Bonus policy: none, frame_time, download_time
bonus = "download_time"

# Completed units kept in memory
history_capacity = 1000

# Protein catalog used for credit and PPD estimates
# project_summary = "~/.config/fahmon/psummary.json"

# Log level: trace, debug, info, warn, error
log_level = "info"
"#
    .to_string()
}
