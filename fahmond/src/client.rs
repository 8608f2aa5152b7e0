//! One monitored Folding@home client.
//!
//! A [`FahClient`] owns its connection and message store behind a
//! [`SingleFlight`] guard. [`FahClient::retrieve`] connects when needed,
//! applies whatever the client pushed since the last call, and rebuilds the
//! slot model once slots, queue and log have all arrived.

use crate::events::{ChangeKind, EventBus, FleetEvent};
use crate::flight::SingleFlight;
use crate::history::WorkUnitHistory;
use chrono::{DateTime, Utc};
use fahmon_common::{
    ClientIdentifier, ClientSettings, ProteinBenchmarkIdentifier, SlotDescription, SlotIdentifier,
    client_span,
};
use fahmon_telemetry::protocol::messages::SlotStatus;
use fahmon_telemetry::protocol::{DEFAULT_CONNECT_TIMEOUT, DEFAULT_HEARTBEAT_TIMEOUT, slot_options_command};
use fahmon_telemetry::{
    BonusCalculation, FahConnection, MessageKind, MessageStore, ProductionValues,
    ProteinBenchmarkService, ProteinCatalog, ProtocolError, UnitTimes, WorkUnit,
    WorkUnitCollection, WorkUnitCollectionBuilder, WorkUnitRecord, WorkUnitRepository,
    WorkUnitResult, get_production,
};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tracing::{Instrument, Span, debug, info, trace, warn};

/// Opens connections for clients.
pub trait Connector: Send + Sync + 'static {
    fn connect(
        &self,
        settings: &ClientSettings,
    ) -> impl Future<Output = Result<FahConnection, ProtocolError>> + Send;
}

/// Plain TCP to `server:port`.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    pub connect_timeout: Duration,
    pub heartbeat_timeout: Duration,
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }
}

impl Connector for TcpConnector {
    async fn connect(&self, settings: &ClientSettings) -> Result<FahConnection, ProtocolError> {
        let connection =
            FahConnection::connect(&settings.server, settings.port, self.connect_timeout).await?;
        Ok(connection.with_heartbeat_timeout(self.heartbeat_timeout))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    #[default]
    Offline,
    Connecting,
    Connected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetrieveStatus {
    /// Slots were rebuilt.
    Success,
    /// Connected, but slots, queue or log have not all arrived yet.
    Waiting,
    ConnectFailed,
    Cancelled,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrieveOutcome {
    Executed(RetrieveStatus),
    /// Another retrieve was in flight.
    Dropped,
}

/// Collaborators shared by every client of a fleet.
#[derive(Clone)]
pub struct ClientServices {
    pub benchmarks: Arc<ProteinBenchmarkService>,
    pub repository: Arc<dyn WorkUnitRepository>,
    pub catalog: Arc<ProteinCatalog>,
    pub events: EventBus,
    pub bonus: BonusCalculation,
}

impl ClientServices {
    /// Nothing persisted, empty protein catalog.
    pub fn in_memory() -> Self {
        Self {
            benchmarks: Arc::new(ProteinBenchmarkService::new()),
            repository: Arc::new(WorkUnitHistory::default()),
            catalog: Arc::new(ProteinCatalog::new()),
            events: EventBus::default(),
            bonus: BonusCalculation::default(),
        }
    }

    /// Persist benchmarks on the blocking pool when they changed.
    pub async fn flush_benchmarks(&self) {
        let benchmarks = Arc::clone(&self.benchmarks);
        match tokio::task::spawn_blocking(move || benchmarks.save_if_dirty()).await {
            Ok(Ok(true)) => debug!("benchmarks saved"),
            Ok(Ok(false)) => {}
            Ok(Err(e)) => warn!(error = %e, "failed to save benchmarks"),
            Err(e) => warn!(error = %e, "benchmark save task failed"),
        }
    }
}

/// One slot as last built.
#[derive(Debug, Clone, Serialize)]
pub struct SlotModel {
    pub identifier: SlotIdentifier,
    pub status: SlotStatus,
    pub description: Option<SlotDescription>,
    pub reason: Option<String>,
    pub idle: bool,
    pub units: WorkUnitCollection,
    pub production: Option<ProductionValues>,
}

impl SlotModel {
    pub fn current_unit(&self) -> Option<&WorkUnit> {
        self.units.current()
    }
}

/// Most units per slot kept waiting for their log segment to close.
const MAX_AWAITING_UNITS: usize = 4;

/// State only the flight holder touches.
#[derive(Default)]
struct ClientSession {
    connection: Option<FahConnection>,
    store: MessageStore,
    /// Units that stopped being current before their log segment closed,
    /// by slot id.
    awaiting: HashMap<u32, Vec<WorkUnit>>,
}

pub struct FahClient<C: Connector = TcpConnector> {
    settings: ClientSettings,
    identifier: ClientIdentifier,
    connector: Arc<C>,
    services: ClientServices,
    flight: SingleFlight<ClientSession>,
    state: Mutex<ConnectionState>,
    slots: RwLock<Vec<SlotModel>>,
    last_retrieved: Mutex<Option<DateTime<Utc>>>,
    cancelled: AtomicBool,
    retired: AtomicBool,
    span: Span,
}

impl<C: Connector> FahClient<C> {
    pub fn new(settings: ClientSettings, connector: Arc<C>, services: ClientServices) -> Self {
        let identifier = settings.identifier();
        Self {
            span: client_span(&identifier),
            identifier,
            settings,
            connector,
            services,
            flight: SingleFlight::new(ClientSession::default()),
            state: Mutex::new(ConnectionState::Offline),
            slots: RwLock::new(Vec::new()),
            last_retrieved: Mutex::new(None),
            cancelled: AtomicBool::new(false),
            retired: AtomicBool::new(false),
        }
    }

    pub fn identifier(&self) -> &ClientIdentifier {
        &self.identifier
    }

    pub fn settings(&self) -> &ClientSettings {
        &self.settings
    }

    pub fn name(&self) -> &str {
        &self.settings.name
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn slots(&self) -> Vec<SlotModel> {
        self.slots
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn last_retrieved(&self) -> Option<DateTime<Utc>> {
        *self.last_retrieved.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Retrieves that ran, and those dropped because one was in flight.
    pub fn flight_counts(&self) -> (u64, u64) {
        (self.flight.executed(), self.flight.dropped())
    }

    /// Ask the in-flight retrieve to stop at its next checkpoint.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = {
            let mut current = self.state.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *current, state)
        };
        if previous != state {
            debug!(?state, "connection state changed");
            self.services.events.emit(FleetEvent::ConnectionChanged {
                client: self.identifier.clone(),
                state,
            });
        }
    }

    /// Run one retrieve unless one is already in flight.
    pub async fn retrieve(&self) -> RetrieveOutcome {
        self.retrieve_once().instrument(self.span.clone()).await
    }

    async fn retrieve_once(&self) -> RetrieveOutcome {
        let Some(mut session) = self.flight.try_enter() else {
            trace!("retrieve already in flight");
            return RetrieveOutcome::Dropped;
        };
        self.cancelled.store(false, Ordering::SeqCst);

        let status = if self.retired.load(Ordering::SeqCst) {
            trace!("client retired, not retrieving");
            RetrieveStatus::Cancelled
        } else {
            self.retrieve_in_flight(&mut session).await
        };
        let retrieved_at = Utc::now();
        *self.last_retrieved.lock().unwrap_or_else(PoisonError::into_inner) = Some(retrieved_at);
        self.services.events.emit(FleetEvent::RetrieveFinished {
            client: self.identifier.clone(),
            status,
            retrieved_at,
        });
        debug!(?status, "retrieve finished");
        RetrieveOutcome::Executed(status)
    }

    async fn retrieve_in_flight(&self, session: &mut ClientSession) -> RetrieveStatus {
        let stale = session
            .connection
            .as_ref()
            .is_some_and(|c| c.is_closed() || c.is_heartbeat_overdue());
        if stale {
            warn!("connection closed or heartbeat overdue, reconnecting");
            if let Some(mut connection) = session.connection.take() {
                connection.close();
            }
            session.store = MessageStore::new();
            self.set_state(ConnectionState::Offline);
        }

        if session.connection.is_none() {
            match self.open_connection().await {
                Ok(connection) => {
                    session.connection = Some(connection);
                    self.set_state(ConnectionState::Connected);
                }
                Err(e) => {
                    warn!(error = %e, "connect failed");
                    self.set_state(ConnectionState::Offline);
                    return RetrieveStatus::ConnectFailed;
                }
            }
        }
        if self.is_cancelled() {
            return RetrieveStatus::Cancelled;
        }

        let Some(connection) = session.connection.as_mut() else {
            return RetrieveStatus::ConnectFailed;
        };
        let messages = connection.drain();
        let applied = session.store.apply_all(&messages);
        if applied.contains(&MessageKind::Slots) {
            for slot in session.store.slots().unwrap_or_default() {
                if let Err(e) = connection.send_command(&slot_options_command(slot.id)).await {
                    warn!(slot = slot.id, error = %e, "slot-options request failed");
                }
            }
        }
        if self.is_cancelled() {
            return RetrieveStatus::Cancelled;
        }

        if !session.store.is_populated() {
            trace!("waiting for slots, queue and log");
            return RetrieveStatus::Waiting;
        }
        self.rebuild_slots(session)
    }

    async fn open_connection(&self) -> Result<FahConnection, ProtocolError> {
        self.set_state(ConnectionState::Connecting);
        let connection = self.connector.connect(&self.settings).await?;
        connection
            .subscribe(self.settings.password.as_deref())
            .await?;
        info!(address = connection.address(), "connected");
        Ok(connection)
    }

    fn rebuild_slots(&self, session: &mut ClientSession) -> RetrieveStatus {
        let retrieved_at = Utc::now();
        let store = &session.store;
        let builder = WorkUnitCollectionBuilder::new(store, retrieved_at);
        let previous = self.slots();

        let mut rebuilt = Vec::new();
        for info in store.slots().unwrap_or_default() {
            if self.is_cancelled() {
                return RetrieveStatus::Cancelled;
            }
            let identifier = SlotIdentifier::new(self.identifier.clone(), Some(info.id));
            let description = SlotDescription::parse(info.description.as_deref());
            let previous_unit = previous
                .iter()
                .find(|s| s.identifier.slot_id == Some(info.id))
                .and_then(SlotModel::current_unit);

            let units = builder.build_for_slot(&identifier, description.as_ref(), previous_unit);
            if let Some(finished) = units.finished.as_ref() {
                self.record_completion(finished);
            }

            let current_project = units.current().and_then(|u| u.project);
            let mut awaiting = session.awaiting.remove(&info.id).unwrap_or_default();
            if units.finished.is_none() {
                let left = previous_unit
                    .filter(|p| p.project.is_some() && p.project != current_project)
                    .filter(|p| !awaiting.iter().any(|a| a.project == p.project));
                if let Some(unit) = left {
                    trace!(slot = %identifier, "previous unit waiting for its log to close");
                    awaiting.push(unit.clone());
                }
            }
            awaiting.retain(|unit| match builder.finalize(&identifier, unit, &units) {
                Some(done) => {
                    self.record_completion(&done);
                    false
                }
                None => unit.project != current_project,
            });
            if awaiting.len() > MAX_AWAITING_UNITS {
                let excess = awaiting.len() - MAX_AWAITING_UNITS;
                debug!(slot = %identifier, excess, "dropping units whose log never closed");
                awaiting = awaiting.split_off(excess);
            }
            if !awaiting.is_empty() {
                session.awaiting.insert(info.id, awaiting);
            }

            let production = self.production(&identifier, &units, retrieved_at);

            rebuilt.push(SlotModel {
                identifier,
                status: info.status,
                description,
                reason: info.reason.clone(),
                idle: info.idle,
                units,
                production,
            });
        }

        self.emit_slot_changes(&previous, &rebuilt);
        *self.slots.write().unwrap_or_else(PoisonError::into_inner) = rebuilt;
        RetrieveStatus::Success
    }

    fn emit_slot_changes(&self, previous: &[SlotModel], rebuilt: &[SlotModel]) {
        let events = &self.services.events;
        for slot in rebuilt {
            if !previous.iter().any(|p| p.identifier.slot_id == slot.identifier.slot_id) {
                events.emit(FleetEvent::SlotsChanged {
                    change: ChangeKind::Add,
                    client: self.identifier.clone(),
                    slot: Some(slot.identifier.clone()),
                });
            }
        }
        for slot in previous {
            if !rebuilt.iter().any(|r| r.identifier.slot_id == slot.identifier.slot_id) {
                events.emit(FleetEvent::SlotsChanged {
                    change: ChangeKind::Remove,
                    client: self.identifier.clone(),
                    slot: Some(slot.identifier.clone()),
                });
            }
        }
        events.emit(FleetEvent::SlotsChanged {
            change: ChangeKind::Invalidate,
            client: self.identifier.clone(),
            slot: None,
        });
    }

    /// Benchmark sample for finished units, a history record for all.
    fn record_completion(&self, unit: &WorkUnit) {
        if unit.result == WorkUnitResult::FinishedUnit {
            if let Some(sample) = self.services.benchmarks.record_completion(unit) {
                self.services.events.emit(FleetEvent::BenchmarkRecorded {
                    client: self.identifier.clone(),
                    slot: sample.slot,
                    project_id: sample.benchmark.project_id,
                    frame_time_secs: sample.frame_time.as_secs(),
                });
            }
        }

        let Some(record) = WorkUnitRecord::from_unit(unit) else {
            return;
        };
        match self.services.repository.insert(record) {
            Ok(true) => info!(slot = %unit.slot, result = %unit.result, "unit completed"),
            Ok(false) => trace!(slot = %unit.slot, "unit already recorded"),
            Err(e) => warn!(slot = %unit.slot, error = %e, "failed to record unit"),
        }
    }

    /// Current unit's own frame time, else the slot's benchmark average.
    fn production(
        &self,
        slot: &SlotIdentifier,
        units: &WorkUnitCollection,
        now: DateTime<Utc>,
    ) -> Option<ProductionValues> {
        let unit = units.current()?;
        let project = unit.project?;
        let protein = self.services.catalog.get(project.project_id)?;
        let frame_time = unit.average_frame_time().or_else(|| {
            let platform = unit.platform.as_ref();
            let benchmark = ProteinBenchmarkIdentifier::new(
                project.project_id,
                platform.and_then(|p| p.processor()).unwrap_or_default(),
                platform.and_then(|p| p.threads()),
            );
            self.services
                .benchmarks
                .get(slot, &benchmark)
                .and_then(|b| b.average_frame_time())
        })?;
        let times = UnitTimes {
            assigned: unit.assigned,
            finished: unit.finished,
            frames_complete: unit.current_frame().map_or(0, |f| f.frame_id),
            now,
        };
        Some(get_production(frame_time, protein, self.services.bonus, &times))
    }

    /// Cancel any retrieve in flight, wait for it to land, then drop the
    /// connection.
    pub async fn close(&self) {
        self.close_session().instrument(self.span.clone()).await
    }

    async fn close_session(&self) {
        self.cancel();
        let mut session = self.flight.wait().await;
        if let Some(mut connection) = session.connection.take() {
            connection.close();
        }
        session.store = MessageStore::new();
        drop(session);
        self.set_state(ConnectionState::Offline);
    }

    /// Close for good: later retrieves return `Cancelled` without connecting.
    pub async fn retire(&self) {
        self.retired.store(true, Ordering::SeqCst);
        self.close().await;
    }
}

impl<C: Connector> std::fmt::Debug for FahClient<C> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FahClient")
            .field("identifier", &self.identifier)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    /// Connects to an in-memory peer that sends `burst` and then stays open.
    pub struct ScriptedConnector {
        pub burst: String,
        pub delay: Duration,
        pub fail: bool,
        pub connects: AtomicUsize,
    }

    impl ScriptedConnector {
        pub fn new(burst: impl Into<String>) -> Self {
            Self {
                burst: burst.into(),
                delay: Duration::ZERO,
                fail: false,
                connects: AtomicUsize::new(0),
            }
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = delay;
            self
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::new("")
            }
        }
    }

    impl Connector for ScriptedConnector {
        async fn connect(&self, settings: &ClientSettings) -> Result<FahConnection, ProtocolError> {
            self.connects.fetch_add(1, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            let address = format!("{}:{}", settings.server, settings.port);
            if self.fail {
                return Err(ProtocolError::Closed(address));
            }
            let (client_side, mut server_side) = tokio::io::duplex(64 * 1024);
            let burst = self.burst.clone();
            tokio::spawn(async move {
                let _ = server_side.write_all(burst.as_bytes()).await;
                let mut sink = vec![0u8; 1024];
                while let Ok(n) = server_side.read(&mut sink).await {
                    if n == 0 {
                        break;
                    }
                }
            });
            Ok(FahConnection::from_stream(address, client_side))
        }
    }

    pub const LOG: &str = "\
*********************** Log Started 2021-05-29T14:04:22Z ***********************
14:04:25:WU00:FS00:Starting
14:04:26:WU00:FS00:0x22:Project: 13406 (Run 1, Clone 26, Gen 148)
14:04:30:WU00:FS00:0x22:Completed 0 out of 1000 steps (0%)
14:09:30:WU00:FS00:0x22:Completed 10 out of 1000 steps (1%)
";

    fn frame(type_name: &str, body: &str) -> String {
        format!("PyON 1 {type_name}\n{body}\n---\n")
    }

    pub fn burst() -> String {
        let mut out = String::from("Welcome\n> ");
        out.push_str(&frame("heartbeat", "0"));
        out.push_str(&frame("options", r#"{"user": "donor", "team": "7"}"#));
        out.push_str(&frame(
            "slots",
            r#"[{"id": "00", "status": "RUNNING", "description": "cpu:8", "reason": "", "idle": False}]"#,
        ));
        out.push_str(&frame(
            "units",
            r#"[{"id": "00", "state": "RUNNING", "project": 13406, "run": 1, "clone": 26, "gen": 148, "slot": "00"}]"#,
        ));
        out.push_str(&frame(
            "log-restart",
            &serde_json::to_string(LOG).expect("log serializes"),
        ));
        out
    }

    pub fn init_test_logging() {
        let _ = tracing_subscriber::fmt()
            .with_test_writer()
            .with_max_level(tracing::Level::DEBUG)
            .try_init();
    }

    pub fn settings(name: &str) -> ClientSettings {
        ClientSettings::new(name, "10.0.0.5", 36330)
    }

    /// Retrieve until `Success`, or give up after two seconds.
    pub async fn retrieve_until_success<C: Connector>(client: &FahClient<C>) -> RetrieveOutcome {
        let mut outcome = client.retrieve().await;
        for _ in 0..200 {
            if outcome == RetrieveOutcome::Executed(RetrieveStatus::Success) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
            outcome = client.retrieve().await;
        }
        outcome
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use fahmon_common::ProjectIdentity;
    use tokio::sync::Barrier;

    fn client<C: Connector>(connector: C) -> (Arc<FahClient<C>>, ClientServices) {
        init_test_logging();
        let services = ClientServices::in_memory();
        let client = FahClient::new(settings("rig"), Arc::new(connector), services.clone());
        (Arc::new(client), services)
    }

    #[tokio::test]
    async fn test_retrieve_builds_slots() {
        let (client, _) = client(ScriptedConnector::new(burst()));
        let outcome = retrieve_until_success(&client).await;
        assert_eq!(outcome, RetrieveOutcome::Executed(RetrieveStatus::Success));
        assert_eq!(client.state(), ConnectionState::Connected);
        assert!(client.last_retrieved().is_some());

        let slots = client.slots();
        assert_eq!(slots.len(), 1);
        let unit = slots[0].current_unit().unwrap();
        assert_eq!(unit.project, Some(ProjectIdentity::new(13406, 1, 26, 148)));
        assert_eq!(unit.folding_id.as_deref(), Some("donor"));
        assert_eq!(slots[0].identifier.name(), "rig Slot 00");
    }

    #[tokio::test]
    async fn test_connect_failure_is_reported_not_returned() {
        let (client, services) = client(ScriptedConnector::failing());
        let mut events = services.events.subscribe();

        let outcome = client.retrieve().await;
        assert_eq!(outcome, RetrieveOutcome::Executed(RetrieveStatus::ConnectFailed));
        assert_eq!(client.state(), ConnectionState::Offline);
        assert!(client.slots().is_empty());

        let mut finished = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, FleetEvent::RetrieveFinished { .. }) {
                finished += 1;
            }
        }
        assert_eq!(finished, 1);
    }

    #[tokio::test]
    async fn test_one_retrieve_finished_event_per_retrieve() {
        let (client, services) = client(ScriptedConnector::new(burst()));
        let mut events = services.events.subscribe();
        for _ in 0..3 {
            client.retrieve().await;
        }
        let mut finished = 0;
        while let Ok(event) = events.try_recv() {
            if let FleetEvent::RetrieveFinished { client: id, .. } = event {
                assert_eq!(id.name, "rig");
                finished += 1;
            }
        }
        assert_eq!(finished, 3);
    }

    #[tokio::test]
    async fn test_cancel_during_connect() {
        let connector = ScriptedConnector::new(burst()).with_delay(Duration::from_millis(100));
        let (client, _) = client(connector);
        let task = {
            let client = Arc::clone(&client);
            tokio::spawn(async move { client.retrieve().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        client.cancel();
        assert_eq!(
            task.await.unwrap(),
            RetrieveOutcome::Executed(RetrieveStatus::Cancelled)
        );
        assert!(client.slots().is_empty());

        // The next retrieve starts with the flag cleared.
        assert_ne!(
            retrieve_until_success(&client).await,
            RetrieveOutcome::Executed(RetrieveStatus::Cancelled)
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_retrieves_are_single_flight() {
        let connector = ScriptedConnector::new(burst()).with_delay(Duration::from_millis(100));
        let (client, _) = client(connector);
        let barrier = Arc::new(Barrier::new(100));

        let mut handles = Vec::new();
        for _ in 0..100 {
            let client = Arc::clone(&client);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                client.retrieve().await
            }));
        }

        let mut executed = 0;
        let mut dropped = 0;
        for handle in handles {
            match handle.await.unwrap() {
                RetrieveOutcome::Executed(_) => executed += 1,
                RetrieveOutcome::Dropped => dropped += 1,
            }
        }
        assert_eq!(executed + dropped, 100);
        assert!(executed >= 1);
        assert!(dropped >= 1);
        assert_eq!(client.flight_counts(), (executed, dropped));
    }

    #[tokio::test]
    async fn test_close_goes_offline_and_reconnects_next_time() {
        let connector = Arc::new(ScriptedConnector::new(burst()));
        let services = ClientServices::in_memory();
        let client = FahClient::new(settings("rig"), Arc::clone(&connector), services);
        retrieve_until_success(&client).await;
        client.close().await;
        assert_eq!(client.state(), ConnectionState::Offline);

        client.retrieve().await;
        assert_eq!(connector.connects.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_production_uses_catalog() {
        let mut catalog = ProteinCatalog::new();
        catalog.insert(fahmon_telemetry::Protein::new(13406, 9405.0, 100));
        let services = ClientServices {
            catalog: Arc::new(catalog),
            bonus: BonusCalculation::None,
            ..ClientServices::in_memory()
        };
        let client = FahClient::new(
            settings("rig"),
            Arc::new(ScriptedConnector::new(burst())),
            services,
        );
        retrieve_until_success(&client).await;
        let production = client.slots()[0].production.unwrap();
        assert_eq!(production.frame_time, Duration::from_secs(300));
        assert!((production.ppd - 9405.0 * 86_400.0 / 30_000.0).abs() < 1e-6);
    }
}
