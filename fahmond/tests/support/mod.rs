//! In-process fake of a Folding@home client for daemon integration tests.

#![allow(dead_code)]

use fahmon_common::ClientSettings;
use fahmon_telemetry::{FahConnection, ProtocolError};
use fahmond::client::{Connector, FahClient};
use std::time::Duration;
use tokio::io::{AsyncWriteExt, DuplexStream};
use tokio::sync::Mutex;

/// Hands out in-memory connections that start with `burst`. The server end
/// of the newest connection stays reachable through [`FakeConnector::push`].
pub struct FakeConnector {
    burst: String,
    delay: Duration,
    server: Mutex<Option<DuplexStream>>,
}

impl FakeConnector {
    pub fn new(burst: impl Into<String>) -> Self {
        Self {
            burst: burst.into(),
            delay: Duration::ZERO,
            server: Mutex::new(None),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Send more frames over the live connection.
    pub async fn push(&self, text: &str) {
        let mut server = self.server.lock().await;
        let stream = server.as_mut().expect("a live connection");
        stream.write_all(text.as_bytes()).await.unwrap();
    }
}

impl Connector for FakeConnector {
    async fn connect(&self, settings: &ClientSettings) -> Result<FahConnection, ProtocolError> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        let address = format!("{}:{}", settings.server, settings.port);
        let (client_side, mut server_side) = tokio::io::duplex(256 * 1024);
        server_side
            .write_all(self.burst.as_bytes())
            .await
            .map_err(|_| ProtocolError::Closed(address.clone()))?;
        *self.server.lock().await = Some(server_side);
        Ok(FahConnection::from_stream(address, client_side))
    }
}

pub fn frame(type_name: &str, body: &str) -> String {
    format!("PyON 1 {type_name}\n{body}\n---\n")
}

pub fn log_frame(type_name: &str, text: &str) -> String {
    frame(type_name, &serde_json::to_string(text).unwrap())
}

/// Retrieve until `done` holds, at most two seconds.
pub async fn retrieve_until<C, F>(client: &FahClient<C>, done: F) -> bool
where
    C: Connector,
    F: Fn(&FahClient<C>) -> bool,
{
    for _ in 0..200 {
        client.retrieve().await;
        if done(client) {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Project id of the current unit on slot `slot_id`.
pub fn current_project<C: Connector>(client: &FahClient<C>, slot_id: u32) -> Option<u32> {
    client
        .slots()
        .iter()
        .find(|s| s.identifier.slot_id == Some(slot_id))
        .and_then(|s| s.current_unit())
        .and_then(|u| u.project)
        .map(|p| p.project_id)
}
