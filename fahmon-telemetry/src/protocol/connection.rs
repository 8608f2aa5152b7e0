//! Socket connection to one Folding@home client.
//!
//! The stream is split into independent halves. A spawned reader task decodes
//! frames and forwards them over a channel; commands go straight to the write
//! half, so sending never waits on a frame that is still arriving.

use super::{MessageDecoder, MessageKind, RawMessage};
use crate::error::ProtocolError;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace, warn};

/// Three missed 60 s heartbeats.
pub const DEFAULT_HEARTBEAT_TIMEOUT: Duration = Duration::from_secs(180);

pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Keys requested for every slot after a slot collection arrives.
pub const SLOT_OPTION_KEYS: &[&str] = &[
    "cpu-usage",
    "client-type",
    "client-subtype",
    "machine-id",
    "max-packet-size",
    "core-priority",
    "next-unit-percentage",
    "max-units",
    "checkpoint",
    "pause-on-start",
    "gpu-index",
    "gpu-usage",
];

const READ_CHUNK: usize = 8 * 1024;

/// Commands sent right after connecting, in order.
pub fn subscription_commands(password: Option<&str>) -> Vec<String> {
    let mut commands = Vec::with_capacity(8);
    if let Some(password) = password.filter(|p| !p.is_empty()) {
        commands.push(format!("auth {password}"));
    }
    commands.extend(
        [
            "updates clear",
            "updates add 0 60 $heartbeat",
            "updates add 1 1 $info",
            "updates add 2 1 $(options -a)",
            "updates add 3 1 $queue-info",
            "updates add 4 1 $slot-info",
            "log-updates restart",
        ]
        .map(String::from),
    );
    commands
}

pub fn slot_options_command(slot_id: u32) -> String {
    format!("slot-options {slot_id:02} {}", SLOT_OPTION_KEYS.join(" "))
}

type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

/// State shared between the connection handle and its reader task.
#[derive(Debug)]
struct Shared {
    last_heartbeat: Mutex<Instant>,
    closed: AtomicBool,
}

impl Shared {
    fn touch(&self) {
        *self
            .last_heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    fn since_heartbeat(&self) -> Duration {
        self.last_heartbeat
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }
}

/// An open command connection.
pub struct FahConnection {
    address: String,
    writer: tokio::sync::Mutex<BoxedWriter>,
    inbox: mpsc::UnboundedReceiver<RawMessage>,
    shared: Arc<Shared>,
    reader: JoinHandle<()>,
    heartbeat_timeout: Duration,
}

impl std::fmt::Debug for FahConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FahConnection")
            .field("address", &self.address)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl FahConnection {
    /// Open a TCP connection to `server:port`.
    pub async fn connect(
        server: &str,
        port: u16,
        timeout: Duration,
    ) -> Result<Self, ProtocolError> {
        let address = format!("{server}:{port}");
        debug!(%address, "connecting");
        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&address)).await {
            Ok(Ok(stream)) => stream,
            Ok(Err(e)) => return Err(ProtocolError::io(address, e)),
            Err(_) => return Err(ProtocolError::ConnectTimeout { address, timeout }),
        };
        if let Err(e) = stream.set_nodelay(true) {
            trace!(%address, error = %e, "set_nodelay failed");
        }
        Ok(Self::from_stream(address, stream))
    }

    /// Wrap an already-open byte stream. Must be called inside a tokio runtime.
    pub fn from_stream<S>(address: impl Into<String>, stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let address = address.into();
        let (read_half, write_half) = tokio::io::split(stream);
        let (tx, inbox) = mpsc::unbounded_channel();
        let shared = Arc::new(Shared {
            last_heartbeat: Mutex::new(Instant::now()),
            closed: AtomicBool::new(false),
        });

        let reader = tokio::spawn(read_loop(
            address.clone(),
            read_half,
            tx,
            Arc::clone(&shared),
        ));
        let writer: BoxedWriter = Box::new(write_half);

        Self {
            address,
            writer: tokio::sync::Mutex::new(writer),
            inbox,
            shared,
            reader,
            heartbeat_timeout: DEFAULT_HEARTBEAT_TIMEOUT,
        }
    }

    pub fn with_heartbeat_timeout(mut self, timeout: Duration) -> Self {
        self.heartbeat_timeout = timeout;
        self
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    /// Write one command line.
    pub async fn send_command(&self, command: &str) -> Result<(), ProtocolError> {
        if self.is_closed() {
            return Err(ProtocolError::Closed(self.address.clone()));
        }
        trace!(address = %self.address, command = %redact(command), "send");
        let mut writer = self.writer.lock().await;
        let result = async {
            writer.write_all(command.as_bytes()).await?;
            writer.write_all(b"\n").await?;
            writer.flush().await
        }
        .await;
        result.map_err(|e| {
            self.shared.closed.store(true, Ordering::SeqCst);
            ProtocolError::io(self.address.clone(), e)
        })
    }

    /// Send the subscription sequence that makes the client push updates.
    pub async fn subscribe(&self, password: Option<&str>) -> Result<(), ProtocolError> {
        for command in subscription_commands(password) {
            self.send_command(&command).await?;
        }
        Ok(())
    }

    /// Take every frame received since the last drain.
    pub fn drain(&mut self) -> Vec<RawMessage> {
        let mut messages = Vec::new();
        loop {
            match self.inbox.try_recv() {
                Ok(message) => messages.push(message),
                Err(mpsc::error::TryRecvError::Empty) => break,
                Err(mpsc::error::TryRecvError::Disconnected) => {
                    self.shared.closed.store(true, Ordering::SeqCst);
                    break;
                }
            }
        }
        messages
    }

    /// Wait until at least one frame is available or `timeout` elapses.
    pub async fn wait_for_message(&mut self, timeout: Duration) -> Option<RawMessage> {
        match tokio::time::timeout(timeout, self.inbox.recv()).await {
            Ok(Some(message)) => Some(message),
            Ok(None) => {
                self.shared.closed.store(true, Ordering::SeqCst);
                None
            }
            Err(_) => None,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::SeqCst)
    }

    /// True once more than the heartbeat timeout has passed since the last
    /// heartbeat, or since connecting when none has arrived.
    pub fn is_heartbeat_overdue(&self) -> bool {
        self.shared.since_heartbeat() > self.heartbeat_timeout
    }

    pub fn close(&mut self) {
        if !self.shared.closed.swap(true, Ordering::SeqCst) {
            debug!(address = %self.address, "closing connection");
        }
        self.reader.abort();
        self.inbox.close();
    }
}

impl Drop for FahConnection {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop<R>(
    address: String,
    mut reader: ReadHalf<R>,
    tx: mpsc::UnboundedSender<RawMessage>,
    shared: Arc<Shared>,
) where
    R: AsyncRead + AsyncWrite + Send,
{
    let mut decoder = MessageDecoder::new();
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let n = match reader.read(&mut chunk).await {
            Ok(0) => {
                debug!(%address, "connection closed by peer");
                break;
            }
            Ok(n) => n,
            Err(e) => {
                warn!(%address, error = %e, "read failed");
                break;
            }
        };
        decoder.push(&chunk[..n]);

        loop {
            match decoder.next_frame() {
                Ok(Some(message)) => {
                    if message.kind == MessageKind::Heartbeat {
                        shared.touch();
                    }
                    trace!(%address, message = %message, "received");
                    if tx.send(message).is_err() {
                        shared.closed.store(true, Ordering::SeqCst);
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => warn!(%address, error = %e, "skipping frame"),
            }
        }
    }

    shared.closed.store(true, Ordering::SeqCst);
}

fn redact(command: &str) -> &str {
    if command.starts_with("auth ") {
        "auth ***"
    } else {
        command
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncBufReadExt, BufReader};

    #[test]
    fn test_subscription_commands_order() {
        let commands = subscription_commands(Some("secret"));
        assert_eq!(commands[0], "auth secret");
        assert_eq!(commands[1], "updates clear");
        assert_eq!(commands.last().unwrap(), "log-updates restart");
        assert_eq!(commands.len(), 8);

        let anonymous = subscription_commands(None);
        assert_eq!(anonymous.len(), 7);
        assert_eq!(anonymous[0], "updates clear");
        assert_eq!(subscription_commands(Some("")).len(), 7);
    }

    #[test]
    fn test_slot_options_command() {
        let command = slot_options_command(1);
        assert!(command.starts_with("slot-options 01 cpu-usage client-type"));
        assert!(command.ends_with("gpu-index gpu-usage"));
    }

    #[tokio::test]
    async fn test_frames_arrive_through_reader_task() {
        let (client_side, mut server_side) = tokio::io::duplex(64);
        let mut connection = FahConnection::from_stream("test:36330", client_side);

        server_side
            .write_all(b"Welcome\n> PyON 1 heartbeat\n0\n---\nPyON 1 units\n[]\n---\n")
            .await
            .unwrap();

        let first = connection
            .wait_for_message(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(first.kind, MessageKind::Heartbeat);
        let second = connection
            .wait_for_message(Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(second.kind, MessageKind::Units);
        assert!(connection.drain().is_empty());
    }

    #[tokio::test]
    async fn test_commands_are_line_terminated() {
        let (client_side, server_side) = tokio::io::duplex(1024);
        let connection = FahConnection::from_stream("test:36330", client_side);
        connection.subscribe(None).await.unwrap();

        let mut lines = BufReader::new(server_side).lines();
        let mut received = Vec::new();
        for _ in 0..7 {
            received.push(lines.next_line().await.unwrap().unwrap());
        }
        assert_eq!(received, subscription_commands(None));
    }

    #[tokio::test]
    async fn test_heartbeat_overdue_and_refreshed() {
        let (client_side, mut server_side) = tokio::io::duplex(64);
        let mut connection = FahConnection::from_stream("test:36330", client_side)
            .with_heartbeat_timeout(Duration::from_millis(50));
        assert!(!connection.is_heartbeat_overdue());

        tokio::time::sleep(Duration::from_millis(80)).await;
        assert!(connection.is_heartbeat_overdue());

        server_side
            .write_all(b"PyON 1 heartbeat\n1\n---\n")
            .await
            .unwrap();
        connection
            .wait_for_message(Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!connection.is_heartbeat_overdue());
    }

    #[tokio::test]
    async fn test_peer_close_marks_connection_closed() {
        let (client_side, server_side) = tokio::io::duplex(64);
        let mut connection = FahConnection::from_stream("test:36330", client_side);
        drop(server_side);

        assert!(
            connection
                .wait_for_message(Duration::from_secs(1))
                .await
                .is_none()
        );
        assert!(connection.is_closed());
        assert!(matches!(
            connection.send_command("updates clear").await,
            Err(ProtocolError::Closed(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_is_io_error() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = FahConnection::connect("127.0.0.1", port, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(err.is_disconnect());
    }
}
