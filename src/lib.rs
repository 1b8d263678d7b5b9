//! # MB Harness Library
//!
//! A message-broker load harness. One XML document describes a consumer
//! side and a publisher side of a destination; the harness starts the
//! consumers, gives them a head start, starts the publishers, waits for the
//! consumers to receive what they expect, and reports publisher TPS,
//! consumer TPS and average end-to-end latency.
//!
//! ## Architecture Overview
//!
//! - `config`: XML document loading and per-role client configuration
//! - `harness`: run orchestration and the scoped shutdown hook
//! - `client`: the messaging client contract plus socket-backed consumers
//!   and publishers with replica fan-out
//! - `ipc`: TCP and Unix domain socket transports with framed messages
//! - `metrics`: HDR-histogram latency and per-replica throughput
//! - `sinks`: received-message and statistics output files
//!
//! ## Usage Example
//!
//! ```rust,no_run
//! use mb_harness::{Cancellation, Harness, HarnessOptions, SocketClientFactory};
//! use std::path::Path;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let harness = Harness::new(SocketClientFactory::new(), HarnessOptions::default());
//!     let run = harness
//!         .run(Path::new("harness.xml"), &Cancellation::never())
//!         .await?;
//!
//!     println!("Consumer TPS: {:?}", run.summary().consumer_tps);
//!     run.shutdown();
//!     Ok(())
//! }
//! ```

/// Command-line interface
pub mod cli;

/// Messaging client contract and the socket-backed implementation
///
/// Consumers bind a destination and fan incoming messages out to competing
/// replicas; publishers open one connection per replica.
pub mod client;

/// XML configuration document
pub mod config;

/// Harness orchestration
///
/// Sequences consumer startup, the publisher startup delay, publisher
/// startup, the bounded wait on consumers and the final report.
pub mod harness;

/// IPC transport implementations and abstractions
///
/// Contains the `IpcTransport` trait and the TCP and Unix domain socket
/// transports. Messages travel as length-prefixed bincode frames.
pub mod ipc;

pub mod logging;

/// Latency and throughput measurement
pub mod metrics;

pub mod sinks;

pub mod utils;

pub use client::{
    ClientConfiguration, ClientFactory, ClientHandle, ClientRole, MessagingClient,
    SocketClientFactory, WaitOutcome,
};
pub use config::{ConfigError, ConsumerConfig, HarnessConfig, PublisherConfig};
pub use harness::{
    CancelHandle, Cancellation, Harness, HarnessOptions, HarnessRun, RunSummary, ShutdownHook,
};
pub use ipc::{IpcTransport, Message, TransportKind};
pub use metrics::{LatencyMetrics, ThroughputMetrics};

/// The current version of the harness
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Default configuration values
///
/// Applied whenever the XML document leaves a setting out.
pub mod defaults {
    use std::time::Duration;

    /// Head start consumers get before publishers are created
    pub const PUBLISHER_STARTUP_DELAY: Duration = Duration::from_millis(2000);

    /// Nominal run time of a harness run
    pub const DEFAULT_RUN_TIME: Duration = Duration::from_secs(10);

    /// Multiplier applied to [`DEFAULT_RUN_TIME`] for the consumer wait
    pub const WAIT_TIMEOUT_MULTIPLIER: u64 = 15;

    /// Upper bound of the primary wait on consumers
    pub const CONSUMER_WAIT_TIMEOUT: Duration =
        Duration::from_secs(DEFAULT_RUN_TIME.as_secs() * WAIT_TIMEOUT_MULTIPLIER);

    /// Replicas per role when `count` is absent
    pub const ROLE_COUNT: usize = 1;

    pub const DESTINATION_NAME: &str = "harness-queue";

    pub const HOST: &str = "127.0.0.1";

    pub const PORT: u16 = 5673;

    /// Socket buffer size in bytes
    pub const BUFFER_SIZE: usize = 8192;

    /// Payload size in bytes when no payload file is given
    pub const MESSAGE_SIZE: usize = 1024;

    /// Messages each publisher replica sends
    pub const NUMBER_OF_MESSAGES_TO_SEND: u64 = 10;

    /// Log a progress line every this many messages
    pub const PRINTS_PER_MESSAGE_COUNT: u64 = 100;
}

#[cfg(test)]
mod tests {
    use super::defaults;
    use std::time::Duration;

    #[test]
    fn test_wait_timeout_derivation() {
        assert_eq!(
            defaults::CONSUMER_WAIT_TIMEOUT,
            defaults::DEFAULT_RUN_TIME * defaults::WAIT_TIMEOUT_MULTIPLIER as u32
        );
        assert_eq!(defaults::CONSUMER_WAIT_TIMEOUT, Duration::from_secs(150));
    }
}
