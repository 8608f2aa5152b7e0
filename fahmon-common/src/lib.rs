//! fahmon common library
//!
//! Identity types, the slot description grammar, client settings and logging
//! setup used by fahmon-telemetry and fahmond.

#![forbid(unsafe_code)]

pub mod logging;
pub mod slot;
pub mod types;

pub use logging::{LogConfig, LogConsole, LogFormat, LoggingGuards, client_span, init_logging};
pub use slot::{SlotDescription, split_processor_name};
pub use types::{
    ClientIdentifier, ClientSettings, DEFAULT_CLIENT_PORT, ProjectIdentity,
    ProteinBenchmarkIdentifier, SettingsError, SlotIdentifier, is_valid_client_name,
};
