//! # Messaging Client Contract
//!
//! The harness never talks to a transport directly. It asks a
//! [`ClientFactory`] for a client handle built from a role configuration and
//! a replica count, then drives the handle through the [`MessagingClient`]
//! lifecycle: `start`, optionally `wait_until_done_or_timeout`, `stop`, and
//! the statistics getters.
//!
//! [`SocketClientFactory`] is the production implementation: consumers own
//! a TCP or Unix-domain-socket destination and publishers connect to it.

use crate::config::{ConsumerConfig, PublisherConfig};
use crate::sinks::OutputSinks;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

pub mod consumer;
pub mod publisher;

pub use consumer::ConsumerClient;
pub use publisher::PublisherClient;

/// Role a client plays against its destination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientRole {
    Consumer,
    Publisher,
}

impl fmt::Display for ClientRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClientRole::Consumer => write!(f, "consumer"),
            ClientRole::Publisher => write!(f, "publisher"),
        }
    }
}

/// Role configuration handed to a factory
#[derive(Debug, Clone)]
pub enum ClientConfiguration {
    Consumer(ConsumerConfig),
    Publisher(PublisherConfig),
}

impl ClientConfiguration {
    pub fn role(&self) -> ClientRole {
        match self {
            ClientConfiguration::Consumer(_) => ClientRole::Consumer,
            ClientConfiguration::Publisher(_) => ClientRole::Publisher,
        }
    }
}

/// How a bounded wait on a client ended
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// Every replica reached its message target
    Completed,
    /// The timeout elapsed first
    TimedOut,
}

/// Lifecycle and statistics of one client with one or more replicas
#[async_trait]
pub trait MessagingClient: Send + Sync {
    fn role(&self) -> ClientRole;

    /// Start every replica
    ///
    /// Asynchronous clients return once their replicas are running;
    /// synchronous ones return after all replicas finished. Starting twice
    /// is an error.
    async fn start(&self) -> Result<()>;

    /// Stop every replica
    ///
    /// Safe to call any number of times and from any thread; calls after the
    /// first are no-ops.
    fn stop(&self) -> Result<()>;

    /// Block until every replica finished or `timeout` elapsed
    async fn wait_until_done_or_timeout(&self, timeout: Duration) -> WaitOutcome;

    fn sent_message_count(&self) -> u64 {
        0
    }

    fn received_message_count(&self) -> u64 {
        0
    }

    /// Mean send rate over publisher replicas; 0 for consumers
    fn publisher_tps(&self) -> f64 {
        0.0
    }

    /// Mean receive rate over consumer replicas; 0 for publishers
    fn consumer_tps(&self) -> f64 {
        0.0
    }

    /// Mean end-to-end latency in milliseconds; 0 for publishers
    fn average_latency_ms(&self) -> f64 {
        0.0
    }
}

/// Shared handle to a running client
pub type ClientHandle = Arc<dyn MessagingClient>;

/// Builds clients from role configurations
pub trait ClientFactory: Send + Sync {
    /// Build a client with `replicas` parallel instances of the role
    fn construct(
        &self,
        config: ClientConfiguration,
        replicas: usize,
        asynchronous: bool,
    ) -> Result<ClientHandle>;

    /// Sinks every client of this factory writes to
    fn output_sinks(&self) -> Arc<OutputSinks>;
}

/// Factory for the socket-backed consumer and publisher clients
#[derive(Default)]
pub struct SocketClientFactory {
    sinks: Arc<OutputSinks>,
}

impl SocketClientFactory {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ClientFactory for SocketClientFactory {
    fn construct(
        &self,
        config: ClientConfiguration,
        replicas: usize,
        asynchronous: bool,
    ) -> Result<ClientHandle> {
        if replicas == 0 {
            return Err(anyhow!(
                "A {} client needs at least one replica",
                config.role()
            ));
        }

        let handle: ClientHandle = match config {
            ClientConfiguration::Consumer(config) => Arc::new(ConsumerClient::new(
                config,
                replicas,
                asynchronous,
                self.sinks.clone(),
            )?),
            ClientConfiguration::Publisher(config) => Arc::new(PublisherClient::new(
                config,
                replicas,
                asynchronous,
                self.sinks.clone(),
            )),
        };
        Ok(handle)
    }

    fn output_sinks(&self) -> Arc<OutputSinks> {
        self.sinks.clone()
    }
}

/// Start/stop/done bookkeeping shared by the socket clients
pub(crate) struct Lifecycle {
    started: AtomicBool,
    stopped: AtomicBool,
    shutdown_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl Lifecycle {
    pub(crate) fn new() -> Self {
        let (shutdown_tx, _) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);
        Self {
            started: AtomicBool::new(false),
            stopped: AtomicBool::new(false),
            shutdown_tx,
            done_tx,
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Claim the single start; errors on the second call
    pub(crate) fn begin_start(&self, role: ClientRole) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(anyhow!("The {} client was already started", role));
        }
        Ok(())
    }

    pub(crate) fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown_tx.subscribe()
    }

    pub(crate) fn track(&self, task: JoinHandle<()>) {
        self.tasks.lock().push(task);
    }

    pub(crate) fn mark_done(&self) {
        self.done_tx.send_replace(true);
    }

    pub(crate) fn is_done(&self) -> bool {
        *self.done_tx.borrow()
    }

    /// First call signals replicas to stop and aborts what is still running;
    /// returns whether this call did the stopping.
    pub(crate) fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return false;
        }
        self.shutdown_tx.send_replace(true);
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        true
    }

    /// Wait without a bound; used by synchronous clients inside `start`
    pub(crate) async fn wait_finished(&self) {
        let mut done_rx = self.done_tx.subscribe();
        // `done_tx` is owned by `self`, so the channel cannot close mid-wait.
        let _ = done_rx.wait_for(|done| *done).await;
    }

    pub(crate) async fn wait_done(&self, timeout: Duration) -> WaitOutcome {
        let mut done_rx = self.done_tx.subscribe();
        // The sender lives as long as `self`, so `wait_for` cannot fail with a
        // closed channel here; only the timeout can end the wait early.
        let completed = matches!(
            tokio::time::timeout(timeout, done_rx.wait_for(|done| *done)).await,
            Ok(Ok(_))
        );
        if completed {
            WaitOutcome::Completed
        } else {
            WaitOutcome::TimedOut
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lifecycle_start_once() {
        let lifecycle = Lifecycle::new();
        assert!(lifecycle.begin_start(ClientRole::Consumer).is_ok());
        let err = lifecycle.begin_start(ClientRole::Consumer).unwrap_err();
        assert!(err.to_string().contains("already started"));
    }

    #[test]
    fn test_lifecycle_stop_idempotent() {
        let lifecycle = Lifecycle::new();
        let signal = lifecycle.shutdown_signal();
        assert!(lifecycle.stop());
        assert!(!lifecycle.stop());
        assert!(*signal.borrow());
    }

    #[tokio::test]
    async fn test_wait_done_outcomes() {
        let lifecycle = Lifecycle::new();
        assert_eq!(
            lifecycle.wait_done(Duration::from_millis(20)).await,
            WaitOutcome::TimedOut
        );

        lifecycle.mark_done();
        assert!(lifecycle.is_done());
        assert_eq!(
            lifecycle.wait_done(Duration::from_millis(20)).await,
            WaitOutcome::Completed
        );
    }

    #[tokio::test]
    async fn test_wait_finished_returns_once_done() {
        let lifecycle = Arc::new(Lifecycle::new());
        let marker = lifecycle.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            marker.mark_done();
        });

        tokio::time::timeout(Duration::from_secs(5), lifecycle.wait_finished())
            .await
            .unwrap();
        assert!(lifecycle.is_done());
    }

    #[test]
    fn test_factory_rejects_zero_replicas() {
        let factory = SocketClientFactory::new();
        let config = ClientConfiguration::Publisher(PublisherConfig {
            endpoint: crate::config::EndpointConfig {
                transport: crate::ipc::TransportKind::Tcp,
                destination_name: "q".to_string(),
                transport_config: crate::ipc::TransportConfig::default(),
            },
            number_of_messages_to_send: 1,
            message_size: 8,
            payload_file: None,
            prints_per_message_count: 1,
            running_delay: Duration::ZERO,
            statistics_path: None,
        });

        assert!(factory.construct(config, 0, true).is_err());
    }
}
