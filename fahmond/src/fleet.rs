//! Registry of monitored clients keyed by name.

use crate::client::{ClientServices, Connector, FahClient, RetrieveOutcome, TcpConnector};
use crate::error::FleetError;
use crate::events::{ChangeKind, FleetEvent};
use fahmon_common::{ClientIdentifier, ClientSettings};
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio::task::JoinSet;
use tracing::{info, warn};

pub struct ClientFleet<C: Connector = TcpConnector> {
    clients: RwLock<BTreeMap<String, Arc<FahClient<C>>>>,
    connector: Arc<C>,
    services: ClientServices,
}

impl<C: Connector> ClientFleet<C> {
    pub fn new(connector: C, services: ClientServices) -> Self {
        Self {
            clients: RwLock::new(BTreeMap::new()),
            connector: Arc::new(connector),
            services,
        }
    }

    pub fn services(&self) -> &ClientServices {
        &self.services
    }

    fn build(&self, settings: ClientSettings) -> Arc<FahClient<C>> {
        Arc::new(FahClient::new(
            settings,
            Arc::clone(&self.connector),
            self.services.clone(),
        ))
    }

    fn emit(&self, change: ChangeKind, client: ClientIdentifier) {
        self.services
            .events
            .emit(FleetEvent::ClientChanged { change, client });
    }

    /// Add a client.
    pub async fn add(&self, settings: ClientSettings) -> Result<Arc<FahClient<C>>, FleetError> {
        settings.validate()?;

        let mut clients = self.clients.write().await;
        if clients.contains_key(&settings.name) {
            return Err(FleetError::DuplicateClient(settings.name));
        }
        let client = self.build(settings);
        clients.insert(client.name().to_string(), Arc::clone(&client));
        drop(clients);

        info!(client = %client.identifier(), "client added");
        self.emit(ChangeKind::Add, client.identifier().clone());
        Ok(client)
    }

    /// Remove a client and close its connection.
    pub async fn remove(&self, name: &str) -> Result<(), FleetError> {
        let removed = self.clients.write().await.remove(name);
        let Some(client) = removed else {
            return Err(FleetError::ClientNotFound(name.to_string()));
        };
        client.retire().await;
        info!(client = %client.identifier(), "client removed");
        self.emit(ChangeKind::Remove, client.identifier().clone());
        Ok(())
    }

    /// Replace the settings of client `name`. A guid not given in `settings` is
    /// carried over. When name or address change, stored benchmarks move to
    /// the new identity.
    pub async fn edit(
        &self,
        name: &str,
        mut settings: ClientSettings,
    ) -> Result<Arc<FahClient<C>>, FleetError> {
        settings.validate()?;

        let mut clients = self.clients.write().await;
        let Some(existing) = clients.get(name).cloned() else {
            return Err(FleetError::ClientNotFound(name.to_string()));
        };
        if settings.name != name && clients.contains_key(&settings.name) {
            return Err(FleetError::NameInUse(settings.name));
        }
        if settings.guid.is_none() {
            settings.guid = existing.settings().guid;
        }

        // no sample lands under the old identity once it is retired
        existing.retire().await;

        let old_identity = existing.identifier().clone();
        let new_identity = settings.identifier();
        if old_identity.name != new_identity.name
            || old_identity.address() != new_identity.address()
        {
            self.services
                .benchmarks
                .rename_client(&old_identity, &new_identity);
        }

        clients.remove(name);
        let client = self.build(settings);
        clients.insert(client.name().to_string(), Arc::clone(&client));
        drop(clients);

        self.services.flush_benchmarks().await;
        info!(from = %old_identity, to = %new_identity, "client edited");
        self.emit(ChangeKind::Edit, new_identity);
        Ok(client)
    }

    /// Remove every client.
    pub async fn clear(&self) {
        let drained: Vec<_> = std::mem::take(&mut *self.clients.write().await)
            .into_values()
            .collect();
        for client in &drained {
            client.retire().await;
            self.emit(ChangeKind::Clear, client.identifier().clone());
        }
        info!(count = drained.len(), "fleet cleared");
    }

    pub async fn get(&self, name: &str) -> Option<Arc<FahClient<C>>> {
        self.clients.read().await.get(name).cloned()
    }

    /// Clients ordered by name.
    pub async fn clients(&self) -> Vec<Arc<FahClient<C>>> {
        self.clients.read().await.values().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.read().await.is_empty()
    }

    /// Retrieve every client concurrently. The registry lock is released
    /// before any retrieve starts.
    pub async fn retrieve_all(&self) -> Vec<(String, RetrieveOutcome)> {
        let snapshot = self.clients().await;
        let mut tasks = JoinSet::new();
        for client in snapshot {
            tasks.spawn(async move {
                let outcome = client.retrieve().await;
                (client.name().to_string(), outcome)
            });
        }

        let mut outcomes = Vec::with_capacity(tasks.len());
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok(outcome) => outcomes.push(outcome),
                Err(e) => warn!(error = %e, "retrieve task failed"),
            }
        }
        outcomes.sort_by(|a, b| a.0.cmp(&b.0));
        outcomes
    }
}
