//! Telemetry for Folding@home clients.
//!
//! - [`protocol`]: connection, framing and typed messages
//! - [`log`]: run and work-item segmentation of the client log
//! - [`store`]: per-client cache of the latest messages
//! - [`aggregator`]: per-slot work units built from the store
//! - [`benchmarks`] and [`production`]: frame-time history and PPD estimates

#![forbid(unsafe_code)]

pub mod aggregator;
pub mod benchmarks;
pub mod error;
pub mod log;
pub mod production;
pub mod protocol;
pub mod record;
pub mod store;
pub mod workunit;

pub use aggregator::WorkUnitCollectionBuilder;
pub use benchmarks::{
    MAX_FRAME_TIMES, ProteinBenchmark, ProteinBenchmarkService, RecordedSample, truncated_average,
};
pub use error::ProtocolError;
pub use log::{ClientRun, FrameEvent, LogParser, SlotRun, WorkItemSegment};
pub use production::{
    BonusCalculation, ProductionValues, Protein, ProteinCatalog, UnitTimes, bonus_multiplier,
    get_production,
};
pub use protocol::{FahConnection, MessageDecoder, MessageKind, RawMessage};
pub use record::{WorkUnitRecord, WorkUnitRecordKey, WorkUnitRepository};
pub use store::{Applied, MessageStore};
pub use workunit::{
    LogPosition, WorkUnit, WorkUnitCollection, WorkUnitPlatform, WorkUnitResult,
};
