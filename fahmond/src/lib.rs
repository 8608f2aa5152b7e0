//! fahmon daemon library
//!
//! Client orchestration for a fleet of Folding@home clients: per-client
//! single-flight retrieval, the fleet registry and poller, fleet events,
//! completed-unit history and daemon configuration.

#![forbid(unsafe_code)]

pub mod client;
pub mod config;
pub mod error;
pub mod events;
pub mod fleet;
pub mod flight;
pub mod history;
pub mod poller;

pub use client::{
    ClientServices, ConnectionState, Connector, FahClient, RetrieveOutcome, RetrieveStatus,
    SlotModel, TcpConnector,
};
pub use error::FleetError;
pub use events::{ChangeKind, EventBus, FleetEvent};
pub use fleet::ClientFleet;
pub use history::WorkUnitHistory;
pub use poller::RetrievePoller;
