use super::{
    inbound_channel, read_frame, write_frame, ConnectionId, IpcTransport, Message,
    TransportConfig, TransportState,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

type ConnectionTable = Arc<Mutex<HashMap<ConnectionId, JoinHandle<()>>>>;

/// Unix Domain Socket transport implementation with multi-client support
pub struct UnixDomainSocketTransport {
    state: TransportState,
    // Publisher side
    stream: Option<UnixStream>,
    // Consumer side
    accept_task: Option<JoinHandle<()>>,
    connections: ConnectionTable,
    next_connection_id: Arc<AtomicU64>,
    socket_path: String,
    // True if this instance created/bound the socket file (consumer side)
    // Only the owning side should unlink the socket during cleanup.
    owns_socket_file: bool,
    write_timeout: std::time::Duration,
}

impl Default for UnixDomainSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl UnixDomainSocketTransport {
    /// Create a new Unix Domain Socket transport
    pub fn new() -> Self {
        Self {
            state: TransportState::Uninitialized,
            stream: None,
            accept_task: None,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_connection_id: Arc::new(AtomicU64::new(1)),
            socket_path: String::new(),
            owns_socket_file: false,
            write_timeout: TransportConfig::default().write_timeout,
        }
    }

    /// Clean up socket file
    fn cleanup_socket(&self) {
        if self.owns_socket_file && !self.socket_path.is_empty() {
            if let Err(e) = std::fs::remove_file(&self.socket_path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!("Failed to remove socket file {}: {}", self.socket_path, e);
                }
            }
        }
    }

    /// Forward every message of one publisher connection to the consumer side
    async fn handle_connection(
        connection_id: ConnectionId,
        mut stream: UnixStream,
        message_sender: mpsc::Sender<(ConnectionId, Message)>,
        connections: ConnectionTable,
    ) {
        debug!("Handling Unix Domain Socket connection {}", connection_id);

        loop {
            match read_frame(&mut stream).await {
                Ok(message) => {
                    if message_sender.send((connection_id, message)).await.is_err() {
                        debug!("Message receiver closed for connection {}", connection_id);
                        break;
                    }
                }
                Err(e) => {
                    debug!("Connection {} closed: {}", connection_id, e);
                    break;
                }
            }
        }

        connections.lock().remove(&connection_id);
        debug!("Connection {} handler finished", connection_id);
    }

    fn abort_tasks(&mut self) {
        if let Some(task) = self.accept_task.take() {
            task.abort();
        }
        for (_, handler) in self.connections.lock().drain() {
            handler.abort();
        }
    }
}

#[async_trait]
impl IpcTransport for UnixDomainSocketTransport {
    async fn start_multi_server(
        &mut self,
        config: &TransportConfig,
    ) -> Result<mpsc::Receiver<(ConnectionId, Message)>> {
        debug!(
            "Starting Unix Domain Socket multi-server on: {}",
            config.socket_path
        );

        self.socket_path = config.socket_path.clone();
        self.state = TransportState::Initializing;

        // The consumer owns the socket file. Best-effort remove if stale exists.
        self.owns_socket_file = true;
        let _ = std::fs::remove_file(&config.socket_path);

        let listener = UnixListener::bind(&config.socket_path)?;
        #[cfg(unix)]
        {
            use std::fs;
            use std::os::unix::fs::PermissionsExt;
            let _ = fs::set_permissions(&config.socket_path, fs::Permissions::from_mode(0o666));
        }

        let (message_sender, message_receiver) = inbound_channel();
        let connections = self.connections.clone();
        let next_connection_id = self.next_connection_id.clone();

        self.accept_task = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _)) => {
                        let connection_id = next_connection_id.fetch_add(1, Ordering::Relaxed);
                        debug!("Accepted Unix Domain Socket connection {}", connection_id);

                        let mut table = connections.lock();
                        let handler = tokio::spawn(Self::handle_connection(
                            connection_id,
                            stream,
                            message_sender.clone(),
                            connections.clone(),
                        ));
                        table.insert(connection_id, handler);
                    }
                    Err(e) => {
                        error!("Failed to accept Unix Domain Socket connection: {}", e);
                        break;
                    }
                }
            }
        }));

        self.state = TransportState::Connected;
        debug!("Unix Domain Socket multi-server listening");
        Ok(message_receiver)
    }

    async fn start_client(&mut self, config: &TransportConfig) -> Result<()> {
        debug!(
            "Starting Unix Domain Socket client connecting to: {}",
            config.socket_path
        );

        self.socket_path = config.socket_path.clone();
        self.state = TransportState::Initializing;
        // Client never owns the socket file
        self.owns_socket_file = false;

        let stream = UnixStream::connect(&config.socket_path).await?;
        self.stream = Some(stream);
        self.write_timeout = config.write_timeout;
        self.state = TransportState::Connected;

        debug!("Unix Domain Socket client connected");
        Ok(())
    }

    async fn send(&mut self, message: &Message) -> Result<()> {
        if self.state != TransportState::Connected {
            return Err(anyhow!("Transport not connected"));
        }

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("No active stream available"))?;

        write_frame(stream, message, self.write_timeout)
            .await
            .map_err(|e| anyhow!(e))?;
        debug!("Sent message {} via Unix Domain Socket", message.id);
        Ok(())
    }

    async fn close(&mut self) -> Result<()> {
        debug!("Closing Unix Domain Socket transport");

        self.abort_tasks();
        self.stream = None;
        self.state = TransportState::Disconnected;
        self.cleanup_socket();
        self.owns_socket_file = false;

        debug!("Unix Domain Socket transport closed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "Unix Domain Socket"
    }

    fn get_active_connections(&self) -> Vec<ConnectionId> {
        self.connections.lock().keys().copied().collect()
    }
}

impl Drop for UnixDomainSocketTransport {
    fn drop(&mut self) {
        self.abort_tasks();
        self.cleanup_socket();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{timeout, Duration};

    #[tokio::test]
    async fn test_uds_multi_client() {
        let dir = tempfile::tempdir().unwrap();
        let config = TransportConfig {
            socket_path: dir.path().join("dest.sock").to_string_lossy().into_owned(),
            ..Default::default()
        };

        let mut server = UnixDomainSocketTransport::new();
        let mut receiver = server.start_multi_server(&config).await.unwrap();

        let mut clients = Vec::new();
        for i in 0..2u32 {
            let mut client = UnixDomainSocketTransport::new();
            client.start_client(&config).await.unwrap();
            client
                .send(&Message::new(i as u64, i, vec![0xAB; 64]))
                .await
                .unwrap();
            clients.push(client);
        }

        let mut publishers = Vec::new();
        for _ in 0..2 {
            let (_, message) = timeout(Duration::from_secs(1), receiver.recv())
                .await
                .unwrap()
                .unwrap();
            publishers.push(message.publisher);
        }
        publishers.sort_unstable();
        assert_eq!(publishers, vec![0, 1]);

        for mut client in clients {
            client.close().await.unwrap();
        }
        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_socket_file_removed_on_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("cleanup.sock");
        let config = TransportConfig {
            socket_path: path.to_string_lossy().into_owned(),
            ..Default::default()
        };

        let mut server = UnixDomainSocketTransport::new();
        let _receiver = server.start_multi_server(&config).await.unwrap();
        assert!(path.exists());

        server.close().await.unwrap();
        assert!(!path.exists());
    }
}
