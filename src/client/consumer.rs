use super::{ClientRole, Lifecycle, MessagingClient, WaitOutcome};
use crate::config::ConsumerConfig;
use crate::ipc::{ConnectionId, IpcTransport, Message, TransportFactory};
use crate::metrics::{aggregate, utils::format_latency, ReplicaStats};
use crate::sinks::OutputSinks;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

type Inbound = Arc<tokio::sync::Mutex<mpsc::Receiver<(ConnectionId, Message)>>>;

/// Header of the consumer statistics CSV
pub const STATISTICS_HEADER: &str = "timestamp,client,replica,messages,tps,latency_ms";

/// One line of the received-messages file
#[derive(Debug, Serialize)]
struct ReceivedRecord<'a> {
    received_at: String,
    client: &'a str,
    replica: usize,
    connection: ConnectionId,
    publisher: u32,
    message_id: u64,
    payload_bytes: usize,
    latency_ns: u64,
}

/// Consumer client owning a destination
///
/// All replicas pull from the same inbound stream, so each message is
/// delivered to exactly one replica (queue semantics). A replica finishes
/// once it has received `maximumMessagesToReceive` messages; the client is
/// done when every replica has finished.
pub struct ConsumerClient {
    id: String,
    config: ConsumerConfig,
    asynchronous: bool,
    replicas: Vec<Arc<ReplicaStats>>,
    sinks: Arc<OutputSinks>,
    lifecycle: Arc<Lifecycle>,
    transport: parking_lot::Mutex<Option<Box<dyn IpcTransport>>>,
}

struct ReplicaContext {
    client_id: String,
    replica: usize,
    destination: String,
    stats: Arc<ReplicaStats>,
    inbound: Inbound,
    shutdown: watch::Receiver<bool>,
    maximum: Option<u64>,
    prints_per_message_count: u64,
    running_delay: Duration,
    received_messages_path: Option<PathBuf>,
    statistics_path: Option<PathBuf>,
    sinks: Arc<OutputSinks>,
}

impl ConsumerClient {
    pub fn new(
        config: ConsumerConfig,
        replicas: usize,
        asynchronous: bool,
        sinks: Arc<OutputSinks>,
    ) -> Result<Self> {
        let replicas = (0..replicas)
            .map(|replica| ReplicaStats::for_consumer(replica).map(Arc::new))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            id: crate::utils::generate_client_id(),
            config,
            asynchronous,
            replicas,
            sinks,
            lifecycle: Arc::new(Lifecycle::new()),
            transport: parking_lot::Mutex::new(None),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn replica_count(&self) -> usize {
        self.replicas.len()
    }

    fn short_id(&self) -> &str {
        &self.id[..8]
    }

    async fn run_replica(ctx: ReplicaContext) {
        let ReplicaContext {
            client_id,
            replica,
            destination,
            stats,
            inbound,
            mut shutdown,
            maximum,
            prints_per_message_count,
            running_delay,
            received_messages_path,
            statistics_path,
            sinks,
        } = ctx;

        debug!("[{} consumer {}-{}] started", destination, client_id, replica);

        loop {
            if let Some(maximum) = maximum {
                if stats.message_count() >= maximum {
                    break;
                }
            }
            if *shutdown.borrow() {
                break;
            }

            let next = {
                let mut receiver = inbound.lock().await;
                tokio::select! {
                    _ = shutdown.changed() => None,
                    message = receiver.recv() => message,
                }
            };

            let (connection, message) = match next {
                Some(next) => next,
                None => break,
            };

            let latency = message.latency();
            let count = match stats.record(message.size(), Some(latency)) {
                Ok(count) => count,
                Err(e) => {
                    warn!(
                        "[{} consumer {}-{}] failed to record message {}: {}",
                        destination, client_id, replica, message.id, e
                    );
                    stats.message_count()
                }
            };

            if let Some(path) = &received_messages_path {
                let record = ReceivedRecord {
                    received_at: chrono::Utc::now().to_rfc3339(),
                    client: &client_id,
                    replica,
                    connection,
                    publisher: message.publisher,
                    message_id: message.id,
                    payload_bytes: message.payload.len(),
                    latency_ns: latency.as_nanos() as u64,
                };
                let written = serde_json::to_string(&record)
                    .map_err(anyhow::Error::from)
                    .and_then(|line| sinks.write_line(path, &line));
                if let Err(e) = written {
                    warn!("[{} consumer {}-{}] {}", destination, client_id, replica, e);
                }
            }

            if let Some(path) = &statistics_path {
                let snapshot = stats.snapshot();
                let line = format!(
                    "{},{},{},{},{:.2},{:.3}",
                    chrono::Utc::now().timestamp_millis(),
                    client_id,
                    replica,
                    count,
                    snapshot.throughput.messages_per_second,
                    snapshot.latency.map(|l| l.mean_ms()).unwrap_or(0.0),
                );
                if let Err(e) = sinks.write_line(path, &line) {
                    warn!("[{} consumer {}-{}] {}", destination, client_id, replica, e);
                }
            }

            if count % prints_per_message_count == 0 {
                info!(
                    "[{} consumer {}-{}] Received {} messages",
                    destination, client_id, replica, count
                );
            }

            if !running_delay.is_zero() {
                tokio::time::sleep(running_delay).await;
            }
        }

        let snapshot = stats.snapshot();
        let mean_latency = snapshot
            .latency
            .map(|l| format_latency(l.mean_ns as u64))
            .unwrap_or_else(|| "n/a".to_string());
        info!(
            "[{} consumer {}-{}] finished after {} messages, mean latency {}",
            destination, client_id, replica, snapshot.throughput.total_messages, mean_latency
        );
    }
}

#[async_trait]
impl MessagingClient for ConsumerClient {
    fn role(&self) -> ClientRole {
        ClientRole::Consumer
    }

    async fn start(&self) -> Result<()> {
        self.lifecycle.begin_start(ClientRole::Consumer)?;

        let endpoint = &self.config.endpoint;
        let mut transport = TransportFactory::create(endpoint.transport);
        let receiver = transport
            .start_multi_server(&endpoint.transport_config)
            .await
            .with_context(|| {
                format!(
                    "Consumer failed to bind destination '{}' at {} ({})",
                    endpoint.destination_name,
                    endpoint.endpoint(),
                    transport.name()
                )
            })?;
        info!(
            "[{} consumer {}] listening on {} via {} with {} replica(s)",
            endpoint.destination_name,
            self.short_id(),
            endpoint.endpoint(),
            transport.name(),
            self.replicas.len()
        );
        *self.transport.lock() = Some(transport);

        if let Some(path) = &self.config.statistics_path {
            self.sinks.write_line(path, STATISTICS_HEADER)?;
        }

        let inbound: Inbound = Arc::new(tokio::sync::Mutex::new(receiver));
        let remaining = Arc::new(AtomicUsize::new(self.replicas.len()));

        for (replica, stats) in self.replicas.iter().enumerate() {
            let ctx = ReplicaContext {
                client_id: self.short_id().to_string(),
                replica,
                destination: endpoint.destination_name.clone(),
                stats: stats.clone(),
                inbound: inbound.clone(),
                shutdown: self.lifecycle.shutdown_signal(),
                maximum: self.config.maximum_messages_to_receive,
                prints_per_message_count: self.config.prints_per_message_count,
                running_delay: self.config.running_delay,
                received_messages_path: self.config.received_messages_path.clone(),
                statistics_path: self.config.statistics_path.clone(),
                sinks: self.sinks.clone(),
            };
            let lifecycle = self.lifecycle.clone();
            let remaining = remaining.clone();

            self.lifecycle.track(tokio::spawn(async move {
                Self::run_replica(ctx).await;
                if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                    lifecycle.mark_done();
                }
            }));
        }

        if !self.asynchronous {
            self.lifecycle.wait_finished().await;
        }
        Ok(())
    }

    fn stop(&self) -> Result<()> {
        if self.lifecycle.stop() {
            if let Some(transport) = self.transport.lock().take() {
                debug!(
                    "[{} consumer {}] dropping {} active connection(s)",
                    self.config.endpoint.destination_name,
                    self.short_id(),
                    transport.get_active_connections().len()
                );
                // Dropping the transport aborts its accept loop and handlers.
                drop(transport);
            }
            info!(
                "[{} consumer {}] stopped after receiving {} messages",
                self.config.endpoint.destination_name,
                self.short_id(),
                self.received_message_count()
            );
        }
        Ok(())
    }

    async fn wait_until_done_or_timeout(&self, timeout: Duration) -> WaitOutcome {
        self.lifecycle.wait_done(timeout).await
    }

    fn received_message_count(&self) -> u64 {
        self.replicas.iter().map(|r| r.message_count()).sum()
    }

    fn consumer_tps(&self) -> f64 {
        let snapshots: Vec<_> = self.replicas.iter().map(|r| r.snapshot()).collect();
        aggregate::mean_tps(&snapshots)
    }

    fn average_latency_ms(&self) -> f64 {
        let snapshots: Vec<_> = self.replicas.iter().map(|r| r.snapshot()).collect();
        aggregate::mean_latency_ms(&snapshots)
    }
}

impl Drop for ConsumerClient {
    fn drop(&mut self) {
        self.lifecycle.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointConfig;
    use crate::ipc::{TransportConfig, TransportKind};

    fn uds_config(dir: &tempfile::TempDir, maximum: Option<u64>) -> ConsumerConfig {
        ConsumerConfig {
            endpoint: EndpointConfig {
                transport: TransportKind::UnixDomainSocket,
                destination_name: "unit".to_string(),
                transport_config: TransportConfig {
                    socket_path: dir.path().join("unit.sock").to_string_lossy().into_owned(),
                    ..TransportConfig::default()
                },
            },
            maximum_messages_to_receive: maximum,
            prints_per_message_count: 1,
            running_delay: Duration::ZERO,
            received_messages_path: None,
            statistics_path: None,
        }
    }

    #[tokio::test]
    async fn test_replicas_compete_for_messages() {
        let dir = tempfile::tempdir().unwrap();
        let config = uds_config(&dir, Some(3));
        let transport_config = config.endpoint.transport_config.clone();
        let consumer = ConsumerClient::new(config, 2, true, Arc::new(OutputSinks::new())).unwrap();
        consumer.start().await.unwrap();

        let mut publisher = TransportFactory::create(TransportKind::UnixDomainSocket);
        publisher.start_client(&transport_config).await.unwrap();
        for id in 0..6 {
            publisher
                .send(&Message::new(id, 0, vec![7; 16]))
                .await
                .unwrap();
        }

        assert_eq!(
            consumer
                .wait_until_done_or_timeout(Duration::from_secs(5))
                .await,
            WaitOutcome::Completed
        );
        assert_eq!(consumer.received_message_count(), 6);
        assert!(consumer.average_latency_ms() >= 0.0);
        consumer.stop().unwrap();
    }

    #[tokio::test]
    async fn test_start_twice_and_stop_twice() {
        let dir = tempfile::tempdir().unwrap();
        let consumer = ConsumerClient::new(
            uds_config(&dir, None),
            1,
            true,
            Arc::new(OutputSinks::new()),
        )
        .unwrap();

        consumer.start().await.unwrap();
        assert!(consumer.start().await.is_err());

        assert!(consumer.stop().is_ok());
        assert!(consumer.stop().is_ok());
        assert!(!dir.path().join("unit.sock").exists());
    }

    #[tokio::test]
    async fn test_unbounded_consumer_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let consumer = ConsumerClient::new(
            uds_config(&dir, None),
            1,
            true,
            Arc::new(OutputSinks::new()),
        )
        .unwrap();
        consumer.start().await.unwrap();

        assert_eq!(
            consumer
                .wait_until_done_or_timeout(Duration::from_millis(50))
                .await,
            WaitOutcome::TimedOut
        );
        assert_eq!(consumer.consumer_tps(), 0.0);
        consumer.stop().unwrap();
    }
}
