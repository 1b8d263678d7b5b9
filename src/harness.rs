//! # Harness Orchestration
//!
//! Sequences one run of the harness against a [`ClientFactory`]:
//!
//! 1. **Consumers**: if the document has a `<consumer>` section, build and
//!    start a consumer client with the section's replica count.
//! 2. **Startup delay**: wait [`HarnessOptions::startup_delay`] so consumers
//!    are attached before anything is published. Cancellation during the
//!    delay skips publisher startup.
//! 3. **Publishers**: same as step 1 for the `<publisher>` section.
//! 4. **Shutdown hook**: every started client is registered with a
//!    [`ShutdownHook`] that stops publishers before consumers and flushes
//!    output sinks, exactly once, on every exit path.
//! 5. **Primary wait**: with a consumer present, wait until it is done or
//!    [`HarnessOptions::wait_timeout`] elapses. Publisher-only runs return
//!    immediately; see [`HarnessRun::await_background`].
//! 6. **Summary**: log publisher TPS, consumer TPS and average latency.

use crate::client::{ClientConfiguration, ClientFactory, ClientHandle, ClientRole, WaitOutcome};
use crate::config::{ConsumerConfig, HarnessConfig, PublisherConfig};
use crate::defaults;
use crate::sinks::OutputSinks;
use crate::utils::format_duration;
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

/// Timing knobs of a harness run
#[derive(Debug, Clone)]
pub struct HarnessOptions {
    /// Pause between consumer startup and publisher startup
    pub startup_delay: Duration,
    /// Upper bound of the primary wait on consumers
    pub wait_timeout: Duration,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            startup_delay: defaults::PUBLISHER_STARTUP_DELAY,
            wait_timeout: defaults::CONSUMER_WAIT_TIMEOUT,
        }
    }
}

/// Trips a [`Cancellation`]
pub struct CancelHandle {
    tx: watch::Sender<bool>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }
}

/// Cancellation signal observed by the harness while it waits
///
/// Clones observe the same signal.
#[derive(Clone)]
pub struct Cancellation {
    rx: watch::Receiver<bool>,
}

impl Cancellation {
    pub fn new() -> (CancelHandle, Cancellation) {
        let (tx, rx) = watch::channel(false);
        (CancelHandle { tx }, Cancellation { rx })
    }

    /// A signal that never fires
    pub fn never() -> Cancellation {
        let (_, cancellation) = Self::new();
        cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolve once cancelled; pends forever if the handle is gone uncancelled
    pub async fn cancelled(&self) {
        let mut rx = self.rx.clone();
        let fired = rx.wait_for(|cancelled| *cancelled).await.map(|_| ());
        if fired.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Scoped replacement for a process-exit hook
///
/// Fires on [`ShutdownHook::fire`] or on drop, whichever comes first, and
/// never again. Stop failures are logged and swallowed so teardown can never
/// block the exit.
pub struct ShutdownHook {
    fired: AtomicBool,
    consumer: Mutex<Option<ClientHandle>>,
    publisher: Mutex<Option<ClientHandle>>,
    sinks: Arc<OutputSinks>,
}

impl ShutdownHook {
    pub fn new(sinks: Arc<OutputSinks>) -> Self {
        Self {
            fired: AtomicBool::new(false),
            consumer: Mutex::new(None),
            publisher: Mutex::new(None),
            sinks,
        }
    }

    /// Hand a client to the hook; the slot is picked by the client's role
    pub fn register(&self, client: ClientHandle) {
        let slot = match client.role() {
            ClientRole::Consumer => &self.consumer,
            ClientRole::Publisher => &self.publisher,
        };
        *slot.lock() = Some(client);
    }

    pub fn has_fired(&self) -> bool {
        self.fired.load(Ordering::SeqCst)
    }

    /// Run the teardown; returns false if it already ran
    pub fn fire(&self) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            return false;
        }

        if let Some(publisher) = self.publisher.lock().take() {
            match publisher.stop() {
                Ok(()) => info!("Publisher TPS : {:.2}", publisher.publisher_tps()),
                Err(e) => error!("Error on shutdown hook while stopping publishers: {:#}", e),
            }
        }

        if let Some(consumer) = self.consumer.lock().take() {
            match consumer.stop() {
                Ok(()) => {
                    info!("Consumer TPS : {:.2}", consumer.consumer_tps());
                    info!("Average Latency : {:.3} ms", consumer.average_latency_ms());
                }
                Err(e) => error!("Error on shutdown hook while stopping consumers: {:#}", e),
            }
        }

        if let Err(e) = self.sinks.flush_all() {
            error!("Error on shutdown hook while flushing output: {:#}", e);
        }
        true
    }
}

impl Drop for ShutdownHook {
    fn drop(&mut self) {
        self.fire();
    }
}

/// What one run did, as seen from the harness
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub consumer_replicas: Option<usize>,
    pub publisher_replicas: Option<usize>,
    /// `None` when no primary wait happened
    pub wait_outcome: Option<WaitOutcome>,
    pub interrupted: bool,
    pub publisher_tps: Option<f64>,
    pub messages_sent: Option<u64>,
    pub consumer_tps: Option<f64>,
    pub messages_received: Option<u64>,
    pub average_latency_ms: Option<f64>,
}

/// A finished `Harness::run` that still owns its clients and shutdown hook
pub struct HarnessRun {
    summary: RunSummary,
    consumer: Option<ClientHandle>,
    publisher: Option<ClientHandle>,
    options: HarnessOptions,
    hook: ShutdownHook,
}

impl HarnessRun {
    pub fn summary(&self) -> &RunSummary {
        &self.summary
    }

    pub fn consumer(&self) -> Option<&ClientHandle> {
        self.consumer.as_ref()
    }

    pub fn publisher(&self) -> Option<&ClientHandle> {
        self.publisher.as_ref()
    }

    /// Keep publisher-only runs alive until their publishers finish
    ///
    /// `Harness::run` does not wait in publisher-only mode. A binary that
    /// wants the process to outlive its publishers (instead of tearing them
    /// down as soon as `run` returns) calls this before shutting down. Does
    /// nothing when a consumer was waited on or the run was interrupted.
    pub async fn await_background(&self, cancellation: &Cancellation) -> Option<WaitOutcome> {
        if self.consumer.is_some() || self.summary.interrupted || self.hook.has_fired() {
            return None;
        }
        let publisher = self.publisher.as_ref()?;

        info!("Waiting for publishers to finish...");
        let outcome = tokio::select! {
            outcome = publisher.wait_until_done_or_timeout(self.options.wait_timeout) => Some(outcome),
            _ = cancellation.cancelled() => None,
        };
        match outcome {
            Some(WaitOutcome::Completed) => {
                info!("Publisher TPS : {:.2}", publisher.publisher_tps())
            }
            Some(WaitOutcome::TimedOut) => warn!(
                "Publishers did not finish within {}",
                format_duration(self.options.wait_timeout)
            ),
            None => warn!("Interrupted while waiting for publishers"),
        }
        outcome
    }

    /// Fire the shutdown hook now; false if it already ran
    pub fn fire_shutdown(&self) -> bool {
        self.hook.fire()
    }

    /// Fire the shutdown hook and release the clients
    pub fn shutdown(self) {
        self.hook.fire();
    }
}

/// Runs consumers and publishers described by an XML document
pub struct Harness<F: ClientFactory> {
    factory: F,
    options: HarnessOptions,
}

impl<F: ClientFactory> Harness<F> {
    pub fn new(factory: F, options: HarnessOptions) -> Self {
        Self { factory, options }
    }

    pub fn factory(&self) -> &F {
        &self.factory
    }

    pub fn options(&self) -> &HarnessOptions {
        &self.options
    }

    /// Run the harness for the document at `config_path`
    ///
    /// Configuration and setup failures are returned as errors; by then the
    /// shutdown hook has already stopped whatever was started.
    pub async fn run(&self, config_path: &Path, cancellation: &Cancellation) -> Result<HarnessRun> {
        info!("Config File = {}", config_path.display());
        let config = HarnessConfig::load(config_path)?;

        let hook = ShutdownHook::new(self.factory.output_sinks());
        let mut summary = RunSummary::default();

        let consumer = match config.consumer {
            Some(section) => {
                info!("Creating consumer(s)...");
                let consumer_config = ConsumerConfig::from_path(config_path)?;
                info!("{}", consumer_config);

                let client = self.factory.construct(
                    ClientConfiguration::Consumer(consumer_config),
                    section.count,
                    true,
                )?;
                hook.register(client.clone());
                client.start().await.context("Failed to start consumers")?;
                summary.consumer_replicas = Some(section.count);
                Some(client)
            }
            None => {
                info!("No consumers are created");
                None
            }
        };

        let interrupted = tokio::select! {
            _ = tokio::time::sleep(self.options.startup_delay) => false,
            _ = cancellation.cancelled() => true,
        };
        if interrupted {
            warn!("Interrupted during the startup delay, publishers will not be started");
            summary.interrupted = true;
        }

        let publisher = match config.publisher {
            Some(_) if interrupted => None,
            Some(section) => {
                info!("Creating publisher(s)...");
                let publisher_config = PublisherConfig::from_path(config_path)?;
                info!("{}", publisher_config);

                let client = self.factory.construct(
                    ClientConfiguration::Publisher(publisher_config),
                    section.count,
                    true,
                )?;
                hook.register(client.clone());
                client.start().await.context("Failed to start publishers")?;
                summary.publisher_replicas = Some(section.count);
                Some(client)
            }
            None => {
                info!("No publishers are created");
                None
            }
        };

        if !interrupted {
            info!("Clients created...");
        }

        if let Some(consumer) = consumer.as_ref().filter(|_| !interrupted) {
            let outcome = tokio::select! {
                outcome = consumer.wait_until_done_or_timeout(self.options.wait_timeout) => Some(outcome),
                _ = cancellation.cancelled() => None,
            };
            match outcome {
                Some(WaitOutcome::Completed) => info!("Consumers received all expected messages"),
                Some(WaitOutcome::TimedOut) => warn!(
                    "Consumers did not finish within {}, reporting partial results",
                    format_duration(self.options.wait_timeout)
                ),
                None => {
                    warn!("Interrupted while waiting for consumers");
                    summary.interrupted = true;
                }
            }
            summary.wait_outcome = outcome;
        }

        if let Some(publisher) = &publisher {
            let tps = publisher.publisher_tps();
            info!("Publisher TPS : {:.2}", tps);
            summary.publisher_tps = Some(tps);
            summary.messages_sent = Some(publisher.sent_message_count());
        }
        if let Some(consumer) = &consumer {
            let tps = consumer.consumer_tps();
            let latency = consumer.average_latency_ms();
            info!("Consumer TPS : {:.2}", tps);
            info!("Average Latency : {:.3} ms", latency);
            summary.consumer_tps = Some(tps);
            summary.messages_received = Some(consumer.received_message_count());
            summary.average_latency_ms = Some(latency);
        }

        Ok(HarnessRun {
            summary,
            consumer,
            publisher,
            options: self.options.clone(),
            hook,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::MessagingClient;
    use async_trait::async_trait;

    struct RecordingClient {
        role: ClientRole,
        stops: Arc<Mutex<Vec<ClientRole>>>,
        fail_stop: bool,
    }

    #[async_trait]
    impl MessagingClient for RecordingClient {
        fn role(&self) -> ClientRole {
            self.role
        }

        async fn start(&self) -> Result<()> {
            Ok(())
        }

        fn stop(&self) -> Result<()> {
            self.stops.lock().push(self.role);
            if self.fail_stop {
                return Err(anyhow::anyhow!("connection already closed"));
            }
            Ok(())
        }

        async fn wait_until_done_or_timeout(&self, _timeout: Duration) -> WaitOutcome {
            WaitOutcome::Completed
        }
    }

    fn client(role: ClientRole, stops: &Arc<Mutex<Vec<ClientRole>>>, fail_stop: bool) -> ClientHandle {
        Arc::new(RecordingClient {
            role,
            stops: stops.clone(),
            fail_stop,
        })
    }

    #[test]
    fn test_hook_stops_publisher_before_consumer() {
        let stops = Arc::new(Mutex::new(Vec::new()));
        let hook = ShutdownHook::new(Arc::new(OutputSinks::new()));
        // Registration order must not matter.
        hook.register(client(ClientRole::Consumer, &stops, false));
        hook.register(client(ClientRole::Publisher, &stops, false));

        assert!(hook.fire());
        assert_eq!(
            *stops.lock(),
            vec![ClientRole::Publisher, ClientRole::Consumer]
        );
    }

    #[test]
    fn test_hook_fires_once_and_on_drop() {
        let stops = Arc::new(Mutex::new(Vec::new()));
        let hook = ShutdownHook::new(Arc::new(OutputSinks::new()));
        hook.register(client(ClientRole::Consumer, &stops, false));

        assert!(hook.fire());
        assert!(!hook.fire());
        drop(hook);
        assert_eq!(stops.lock().len(), 1);

        let dropped = ShutdownHook::new(Arc::new(OutputSinks::new()));
        dropped.register(client(ClientRole::Publisher, &stops, false));
        drop(dropped);
        assert_eq!(stops.lock().len(), 2);
    }

    #[test]
    fn test_hook_swallows_stop_failures() {
        let stops = Arc::new(Mutex::new(Vec::new()));
        let hook = ShutdownHook::new(Arc::new(OutputSinks::new()));
        hook.register(client(ClientRole::Publisher, &stops, true));
        hook.register(client(ClientRole::Consumer, &stops, false));

        assert!(hook.fire());
        // The failing publisher stop does not prevent the consumer stop.
        assert_eq!(
            *stops.lock(),
            vec![ClientRole::Publisher, ClientRole::Consumer]
        );
    }

    #[tokio::test]
    async fn test_cancellation_signal() {
        let (handle, cancellation) = Cancellation::new();
        let observer = cancellation.clone();
        assert!(!observer.is_cancelled());

        handle.cancel();
        observer.cancelled().await;
        assert!(cancellation.is_cancelled());
    }

    #[tokio::test]
    async fn test_never_cancellation_pends() {
        let cancellation = Cancellation::never();
        let fired = tokio::time::timeout(Duration::from_millis(20), cancellation.cancelled()).await;
        assert!(fired.is_err());
    }

    #[test]
    fn test_default_options() {
        let options = HarnessOptions::default();
        assert_eq!(options.startup_delay, Duration::from_millis(2000));
        assert_eq!(options.wait_timeout, Duration::from_secs(150));
    }
}
