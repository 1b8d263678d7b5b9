use anyhow::{anyhow, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;

pub mod tcp_socket;
pub mod unix_domain_socket;

pub use tcp_socket::TcpSocketTransport;
pub use unix_domain_socket::UnixDomainSocketTransport;

/// Connection identifier for tracking multiple publisher connections
pub type ConnectionId = u64;

/// Largest frame either transport will read or write
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// Capacity of the channel between connection handlers and consumer replicas
const INBOUND_CHANNEL_CAPACITY: usize = 1000;

/// Errors surfaced by the framing layer
#[derive(Debug, thiserror::Error)]
pub enum IpcError {
    /// The peer stopped draining its socket and the write did not finish in time
    #[error("Timeout sending message due to backpressure")]
    BackpressureTimeout,
    #[error(transparent)]
    Generic(#[from] anyhow::Error),
}

/// Message exchanged between publishers and consumers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub id: u64,
    /// Replica index of the publisher that produced the message
    pub publisher: u32,
    pub timestamp: u64, // nanoseconds since epoch
    pub payload: Vec<u8>,
}

impl Message {
    /// Create a new message stamped with the current wall-clock time
    pub fn new(id: u64, publisher: u32, payload: Vec<u8>) -> Self {
        Self {
            id,
            publisher,
            timestamp: crate::utils::current_timestamp_ns(),
            payload,
        }
    }

    /// Get the message size in bytes
    pub fn size(&self) -> usize {
        // Approximate size calculation
        8 + // id
        4 + // publisher
        8 + // timestamp
        self.payload.len()
    }

    /// Time since the publisher stamped this message
    pub fn latency(&self) -> Duration {
        crate::utils::elapsed_since_ns(self.timestamp)
    }

    /// Serialize the message to bytes
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    /// Deserialize bytes to a message
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(bytes)?)
    }
}

/// Read one length-prefixed message from a stream
///
/// Frames are a 4-byte little-endian length followed by the bincode body.
pub(crate) async fn read_frame<S>(stream: &mut S) -> Result<Message>
where
    S: AsyncRead + Unpin,
{
    let mut len_bytes = [0u8; 4];
    stream.read_exact(&mut len_bytes).await?;
    let message_len = u32::from_le_bytes(len_bytes) as usize;

    if message_len > MAX_FRAME_SIZE {
        return Err(anyhow!("Message too large: {} bytes", message_len));
    }

    let mut message_data = vec![0u8; message_len];
    stream.read_exact(&mut message_data).await?;

    Message::from_bytes(&message_data)
}

/// Write one length-prefixed message, giving up after `write_timeout`
pub(crate) async fn write_frame<S>(
    stream: &mut S,
    message: &Message,
    write_timeout: Duration,
) -> Result<(), IpcError>
where
    S: AsyncWrite + Unpin,
{
    let message_bytes = message.to_bytes()?;
    if message_bytes.len() > MAX_FRAME_SIZE {
        return Err(IpcError::Generic(anyhow!(
            "Message too large: {} bytes",
            message_bytes.len()
        )));
    }
    let message_len = message_bytes.len() as u32;

    let write_fut = async {
        stream.write_all(&message_len.to_le_bytes()).await?;
        stream.write_all(&message_bytes).await?;
        stream.flush().await?;
        Ok(()) as Result<(), std::io::Error>
    };

    match tokio::time::timeout(write_timeout, write_fut).await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(IpcError::Generic(e.into())),
        Err(_) => Err(IpcError::BackpressureTimeout),
    }
}

/// Socket mechanism used to reach a destination
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransportKind {
    /// TCP Sockets
    Tcp,
    /// Unix Domain Sockets
    UnixDomainSocket,
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportKind::Tcp => write!(f, "tcp"),
            TransportKind::UnixDomainSocket => write!(f, "uds"),
        }
    }
}

impl FromStr for TransportKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tcp" => Ok(TransportKind::Tcp),
            "uds" | "unix" => Ok(TransportKind::UnixDomainSocket),
            other => Err(anyhow!(
                "Unknown transport '{}', expected 'tcp' or 'uds'",
                other
            )),
        }
    }
}

/// Where a destination lives and how sockets are tuned
#[derive(Debug, Clone)]
pub struct TransportConfig {
    pub buffer_size: usize,
    pub host: String,
    pub port: u16,
    pub socket_path: String,
    /// Upper bound for a single blocking write before it counts as backpressure
    pub write_timeout: Duration,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            buffer_size: 8192,
            host: "127.0.0.1".to_string(),
            port: 5673,
            socket_path: "/tmp/mb-harness.sock".to_string(),
            write_timeout: Duration::from_secs(5),
        }
    }
}

impl TransportConfig {
    /// Human-readable endpoint for a given transport
    pub fn endpoint(&self, kind: TransportKind) -> String {
        match kind {
            TransportKind::Tcp => format!("{}:{}", self.host, self.port),
            TransportKind::UnixDomainSocket => self.socket_path.clone(),
        }
    }
}

/// Socket transport interface
///
/// Consumers own a destination through [`IpcTransport::start_multi_server`];
/// publishers attach to it with [`IpcTransport::start_client`] and push
/// messages one way with [`IpcTransport::send`].
#[async_trait]
pub trait IpcTransport: Send + Sync {
    /// Bind the destination and accept any number of publisher connections
    ///
    /// Every message read from any connection is forwarded on the returned
    /// channel together with the id of the connection it arrived on.
    async fn start_multi_server(
        &mut self,
        config: &TransportConfig,
    ) -> Result<mpsc::Receiver<(ConnectionId, Message)>>;

    /// Connect to a destination as a publisher
    async fn start_client(&mut self, config: &TransportConfig) -> Result<()>;

    /// Send a message on the client connection
    async fn send(&mut self, message: &Message) -> Result<()>;

    /// Close the transport
    async fn close(&mut self) -> Result<()>;

    /// Get transport name for identification
    fn name(&self) -> &'static str;

    /// Get list of active connection IDs
    fn get_active_connections(&self) -> Vec<ConnectionId>;
}

/// Transport state for tracking connection status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportState {
    Uninitialized,
    Initializing,
    Connected,
    Disconnected,
}

/// Transport factory for creating IPC transport instances
pub struct TransportFactory;

impl TransportFactory {
    /// Create a new transport instance based on the mechanism
    pub fn create(kind: TransportKind) -> Box<dyn IpcTransport> {
        match kind {
            TransportKind::Tcp => Box::new(TcpSocketTransport::new()),
            TransportKind::UnixDomainSocket => Box::new(UnixDomainSocketTransport::new()),
        }
    }
}

pub(crate) fn inbound_channel() -> (
    mpsc::Sender<(ConnectionId, Message)>,
    mpsc::Receiver<(ConnectionId, Message)>,
) {
    mpsc::channel(INBOUND_CHANNEL_CAPACITY)
}
