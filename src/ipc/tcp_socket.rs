use super::{
    inbound_channel, read_frame, write_frame, ConnectionId, IpcError, IpcTransport, Message,
    TransportConfig, TransportState,
};
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, warn};

type ConnectionTable = Arc<Mutex<HashMap<ConnectionId, JoinHandle<()>>>>;

/// TCP Socket transport implementation with multi-client support
pub struct TcpSocketTransport {
    state: TransportState,
    // Publisher side
    stream: Option<TcpStream>,
    // Consumer side
    accept_task: Option<JoinHandle<()>>,
    connections: ConnectionTable,
    next_connection_id: Arc<AtomicU64>,
    address: Option<SocketAddr>,
    write_timeout: std::time::Duration,
    has_warned_backpressure: bool,
}

impl Default for TcpSocketTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpSocketTransport {
    /// Create a new TCP Socket transport
    pub fn new() -> Self {
        Self {
            state: TransportState::Uninitialized,
            stream: None,
            accept_task: None,
            connections: Arc::new(Mutex::new(HashMap::new())),
            next_connection_id: Arc::new(AtomicU64::new(1)),
            address: None,
            write_timeout: TransportConfig::default().write_timeout,
            has_warned_backpressure: false,
        }
    }

    /// Address the transport is bound or connected to
    pub fn local_address(&self) -> Option<SocketAddr> {
        self.address
    }

    /// Apply low-latency socket options
    fn tune(stream: TcpStream, buffer_size: usize) -> Result<TcpStream> {
        let std_stream = stream.into_std()?;
        let socket = socket2::Socket::from(std_stream.try_clone()?);
        socket.set_nodelay(true)?;
        socket.set_recv_buffer_size(buffer_size)?;
        socket.set_send_buffer_size(buffer_size)?;
        Ok(TcpStream::from_std(std_stream)?)
    }

    /// Forward every message of one publisher connection to the consumer side
    async fn handle_connection(
        connection_id: ConnectionId,
        mut stream: TcpStream,
        message_sender: mpsc::Sender<(ConnectionId, Message)>,
        connections: ConnectionTable,
    ) {
        debug!("Handling TCP connection {}", connection_id);

        loop {
            match read_frame(&mut stream).await {
                Ok(message) => {
                    debug!(
                        "Received message {} from connection {}",
                        message.id, connection_id
                    );
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
impl IpcTransport for TcpSocketTransport {
    async fn start_multi_server(
        &mut self,
        config: &TransportConfig,
    ) -> Result<mpsc::Receiver<(ConnectionId, Message)>> {
        let addr = format!("{}:{}", config.host, config.port);
        debug!("Starting TCP multi-server on: {}", addr);

        self.state = TransportState::Initializing;

        let listener = TcpListener::bind(&addr).await?;
        let local_addr = listener.local_addr()?;
        self.address = Some(local_addr);

        debug!("TCP multi-server listening on: {}", local_addr);

        let (message_sender, message_receiver) = inbound_channel();

        let connections = self.connections.clone();
        let next_connection_id = self.next_connection_id.clone();
        let buffer_size = config.buffer_size;

        self.accept_task = Some(tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, client_addr)) => {
                        let connection_id = next_connection_id.fetch_add(1, Ordering::Relaxed);
                        debug!(
                            "Accepted TCP connection {} from: {}",
                            connection_id, client_addr
                        );

                        let stream = match Self::tune(stream, buffer_size) {
                            Ok(stream) => stream,
                            Err(e) => {
                                warn!(
                                    "Failed to configure TCP connection {}: {}",
                                    connection_id, e
                                );
                                continue;
                            }
                        };

                        // Hold the table lock across the spawn so a handler that
                        // finishes immediately still finds its own entry to remove.
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
                        error!("Failed to accept TCP connection: {}", e);
                        break;
                    }
                }
            }
        }));

        self.state = TransportState::Connected;
        Ok(message_receiver)
    }

    async fn start_client(&mut self, config: &TransportConfig) -> Result<()> {
        let addr = format!("{}:{}", config.host, config.port);
        debug!("Starting TCP Socket client connecting to: {}", addr);

        self.state = TransportState::Initializing;

        let stream = TcpStream::connect(&addr).await?;
        self.address = Some(stream.peer_addr()?);
        self.stream = Some(Self::tune(stream, config.buffer_size)?);
        self.write_timeout = config.write_timeout;
        self.state = TransportState::Connected;

        debug!("TCP Socket client connected to: {}", addr);
        Ok(())
    }

    /// A send that takes longer than a few milliseconds is taken as a sign
    /// that the OS send buffer is full; a hard timeout stops it from blocking
    /// forever.
    async fn send(&mut self, message: &Message) -> Result<()> {
        if self.state != TransportState::Connected {
            return Err(anyhow!("Transport not connected"));
        }

        let stream = self
            .stream
            .as_mut()
            .ok_or_else(|| anyhow!("No active stream available"))?;

        let start_time = std::time::Instant::now();
        match write_frame(stream, message, self.write_timeout).await {
            Ok(()) => {
                let elapsed = start_time.elapsed();
                if elapsed > std::time::Duration::from_millis(5) && !self.has_warned_backpressure
                {
                    warn!(
                        "TCP socket backpressure detected (send took {:?}). \
                        Consumers are not keeping up with this publisher.",
                        elapsed
                    );
                    self.has_warned_backpressure = true;
                }
                debug!("Sent message {} via TCP Socket", message.id);
                Ok(())
            }
            Err(IpcError::BackpressureTimeout) => {
                if !self.has_warned_backpressure {
                    warn!("TCP send timed out due to backpressure.");
                    self.has_warned_backpressure = true;
                }
                Err(anyhow!(IpcError::BackpressureTimeout))
            }
            Err(IpcError::Generic(e)) => Err(e),
        }
    }

    async fn close(&mut self) -> Result<()> {
        debug!("Closing TCP Socket transport");

        self.abort_tasks();
        self.stream = None;
        self.address = None;
        self.state = TransportState::Disconnected;

        debug!("TCP Socket transport closed");
        Ok(())
    }

    fn name(&self) -> &'static str {
        "TCP Socket"
    }

    fn get_active_connections(&self) -> Vec<ConnectionId> {
        self.connections.lock().keys().copied().collect()
    }
}

impl Drop for TcpSocketTransport {
    fn drop(&mut self) {
        self.abort_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::{sleep, timeout, Duration};

    #[tokio::test]
    async fn test_tcp_multi_client() {
        let config = TransportConfig {
            host: "127.0.0.1".to_string(),
            port: 19091,
            ..Default::default()
        };

        let mut server = TcpSocketTransport::new();
        let mut receiver = server.start_multi_server(&config).await.unwrap();

        let mut clients = Vec::new();
        for i in 0..3u32 {
            let mut client = TcpSocketTransport::new();
            client.start_client(&config).await.unwrap();

            let message = Message::new(i as u64, i, vec![i as u8; 10]);
            client.send(&message).await.unwrap();

            clients.push(client);
        }

        let mut received_count = 0;
        while received_count < 3 {
            match timeout(Duration::from_millis(1000), receiver.recv()).await {
                Ok(Some((connection_id, message))) => {
                    assert!(connection_id >= 1);
                    assert_eq!(message.payload.len(), 10);
                    received_count += 1;
                }
                _ => break,
            }
        }

        assert_eq!(received_count, 3);

        for mut client in clients {
            let _ = client.close().await;
        }
        let _ = server.close().await;
    }

    #[tokio::test]
    async fn test_connection_table_drains_after_client_close() {
        let config = TransportConfig {
            host: "127.0.0.1".to_string(),
            port: 19093,
            ..Default::default()
        };

        let mut server = TcpSocketTransport::new();
        let mut receiver = server.start_multi_server(&config).await.unwrap();

        let mut client = TcpSocketTransport::new();
        client.start_client(&config).await.unwrap();
        client.send(&Message::new(1, 0, vec![1])).await.unwrap();
        receiver.recv().await.unwrap();
        assert_eq!(server.get_active_connections().len(), 1);

        client.close().await.unwrap();
        for _ in 0..50 {
            if server.get_active_connections().is_empty() {
                break;
            }
            sleep(Duration::from_millis(20)).await;
        }
        assert!(server.get_active_connections().is_empty());

        server.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_send_without_connection_fails() {
        let mut client = TcpSocketTransport::new();
        let err = client.send(&Message::new(1, 0, vec![])).await.unwrap_err();
        assert!(err.to_string().contains("not connected"));
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let config = TransportConfig {
            host: "127.0.0.1".to_string(),
            port: 19094,
            ..Default::default()
        };
        let mut client = TcpSocketTransport::new();
        assert!(client.start_client(&config).await.is_err());
    }
}
