use super::{ClientRole, Lifecycle, MessagingClient, WaitOutcome};
use crate::config::PublisherConfig;
use crate::ipc::{IpcTransport, Message, TransportFactory};
use crate::metrics::{aggregate, ReplicaStats};
use crate::sinks::OutputSinks;
use crate::utils::format_message_rate;
use anyhow::{Context, Result};
use async_trait::async_trait;
use rand::RngCore;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Header of the publisher statistics CSV
pub const STATISTICS_HEADER: &str = "timestamp,client,replica,messages,tps";

/// Publisher client attached to a destination
///
/// Every replica opens its own connection during `start`, so a destination
/// that is not there fails the start instead of a background task.
pub struct PublisherClient {
    id: String,
    config: PublisherConfig,
    asynchronous: bool,
    replicas: Vec<Arc<ReplicaStats>>,
    sinks: Arc<OutputSinks>,
    lifecycle: Arc<Lifecycle>,
}

struct ReplicaContext {
    client_id: String,
    replica: usize,
    destination: String,
    stats: Arc<ReplicaStats>,
    transport: Box<dyn IpcTransport>,
    shutdown: watch::Receiver<bool>,
    payload: Arc<Vec<u8>>,
    number_of_messages_to_send: u64,
    prints_per_message_count: u64,
    running_delay: Duration,
    statistics_path: Option<PathBuf>,
    sinks: Arc<OutputSinks>,
}

impl PublisherClient {
    pub fn new(
        config: PublisherConfig,
        replicas: usize,
        asynchronous: bool,
        sinks: Arc<OutputSinks>,
    ) -> Self {
        Self {
            id: crate::utils::generate_client_id(),
            config,
            asynchronous,
            replicas: (0..replicas)
                .map(|replica| Arc::new(ReplicaStats::for_publisher(replica)))
                .collect(),
            sinks,
            lifecycle: Arc::new(Lifecycle::new()),
        }
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

    async fn load_payload(&self) -> Result<Vec<u8>> {
        match &self.config.payload_file {
            Some(path) => tokio::fs::read(path)
                .await
                .with_context(|| format!("Failed to read message payload from {}", path.display())),
            None => {
                let mut payload = vec![0u8; self.config.message_size];
                rand::thread_rng().fill_bytes(&mut payload);
                Ok(payload)
            }
        }
    }

    async fn run_replica(ctx: ReplicaContext) {
        let ReplicaContext {
            client_id,
            replica,
            destination,
            stats,
            mut transport,
            mut shutdown,
            payload,
            number_of_messages_to_send,
            prints_per_message_count,
            running_delay,
            statistics_path,
            sinks,
        } = ctx;

        debug!("[{} publisher {}-{}] started", destination, client_id, replica);

        for id in 0..number_of_messages_to_send {
            if *shutdown.borrow() {
                break;
            }

            let message = Message::new(id, replica as u32, payload.as_ref().clone());
            let sent = tokio::select! {
                _ = shutdown.changed() => break,
                sent = transport.send(&message) => sent,
            };
            if let Err(e) = sent {
                warn!(
                    "[{} publisher {}-{}] send of message {} failed: {:#}",
                    destination, client_id, replica, id, e
                );
                break;
            }

            let count = match stats.record(message.size(), None) {
                Ok(count) => count,
                Err(e) => {
                    warn!("[{} publisher {}-{}] {}", destination, client_id, replica, e);
                    stats.message_count()
                }
            };

            if let Some(path) = &statistics_path {
                let line = format!(
                    "{},{},{},{},{:.2}",
                    chrono::Utc::now().timestamp_millis(),
                    client_id,
                    replica,
                    count,
                    stats.snapshot().throughput.messages_per_second,
                );
                if let Err(e) = sinks.write_line(path, &line) {
                    warn!("[{} publisher {}-{}] {}", destination, client_id, replica, e);
                }
            }

            if count % prints_per_message_count == 0 {
                info!(
                    "[{} publisher {}-{}] Sent {} messages",
                    destination, client_id, replica, count
                );
            }

            if !running_delay.is_zero() {
                tokio::time::sleep(running_delay).await;
            }
        }

        if let Err(e) = transport.close().await {
            warn!("[{} publisher {}-{}] close failed: {}", destination, client_id, replica, e);
        }
        let throughput = stats.snapshot().throughput;
        info!(
            "[{} publisher {}-{}] finished after {} messages at {}",
            destination,
            client_id,
            replica,
            throughput.total_messages,
            format_message_rate(throughput.messages_per_second)
        );
    }
}

#[async_trait]
impl MessagingClient for PublisherClient {
    fn role(&self) -> ClientRole {
        ClientRole::Publisher
    }

    async fn start(&self) -> Result<()> {
        self.lifecycle.begin_start(ClientRole::Publisher)?;

        let endpoint = &self.config.endpoint;
        let payload = Arc::new(self.load_payload().await?);

        // Connect everything before spawning anything so a missing destination
        // fails the start as a whole.
        let mut transports = Vec::with_capacity(self.replicas.len());
        for replica in 0..self.replicas.len() {
            let mut transport = TransportFactory::create(endpoint.transport);
            transport
                .start_client(&endpoint.transport_config)
                .await
                .with_context(|| {
                    format!(
                        "Publisher replica {} failed to connect to destination '{}' at {}",
                        replica,
                        endpoint.destination_name,
                        endpoint.endpoint()
                    )
                })?;
            transports.push(transport);
        }
        info!(
            "[{} publisher {}] connected {} replica(s) to {}",
            endpoint.destination_name,
            self.short_id(),
            transports.len(),
            endpoint.endpoint()
        );

        if let Some(path) = &self.config.statistics_path {
            self.sinks.write_line(path, STATISTICS_HEADER)?;
        }

        let remaining = Arc::new(AtomicUsize::new(self.replicas.len()));
        for (replica, transport) in transports.into_iter().enumerate() {
            let ctx = ReplicaContext {
                client_id: self.short_id().to_string(),
                replica,
                destination: endpoint.destination_name.clone(),
                stats: self.replicas[replica].clone(),
                transport,
                shutdown: self.lifecycle.shutdown_signal(),
                payload: payload.clone(),
                number_of_messages_to_send: self.config.number_of_messages_to_send,
                prints_per_message_count: self.config.prints_per_message_count,
                running_delay: self.config.running_delay,
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
            info!(
                "[{} publisher {}] stopped after sending {} messages",
                self.config.endpoint.destination_name,
                self.short_id(),
                self.sent_message_count()
            );
        }
        Ok(())
    }

    async fn wait_until_done_or_timeout(&self, timeout: Duration) -> WaitOutcome {
        self.lifecycle.wait_done(timeout).await
    }

    fn sent_message_count(&self) -> u64 {
        let snapshots: Vec<_> = self.replicas.iter().map(|r| r.snapshot()).collect();
        aggregate::total_messages(&snapshots)
    }

    fn publisher_tps(&self) -> f64 {
        let snapshots: Vec<_> = self.replicas.iter().map(|r| r.snapshot()).collect();
        aggregate::mean_tps(&snapshots)
    }
}

impl Drop for PublisherClient {
    fn drop(&mut self) {
        self.lifecycle.stop();
    }
}
