//! # XML Configuration
//!
//! The harness is driven by a single XML document:
//!
//! ```xml
//! <base>
//!   <consumer count="2">
//!     <transport>tcp</transport>
//!     <port>5673</port>
//!     <maximumMessagesToReceive>1000</maximumMessagesToReceive>
//!   </consumer>
//!   <publisher count="1">
//!     <port>5673</port>
//!     <numberOfMessagesToSend>2000</numberOfMessagesToSend>
//!   </publisher>
//! </base>
//! ```
//!
//! Either section may be left out to skip that role. Every element is
//! optional and falls back to the values in [`crate::defaults`].
//!
//! Parsing happens in two stages: `quick-xml` deserializes the document into
//! loosely typed raw sections, then each section is validated into the typed
//! [`ConsumerConfig`] / [`PublisherConfig`] the clients consume.

use crate::defaults;
use crate::ipc::{TransportConfig, TransportKind};
use quick_xml::events::Event;
use serde::Deserialize;
use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::warn;

/// Configuration problems, all tied to the file they came from
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read configuration file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Malformed configuration file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: quick_xml::DeError,
    },

    #[error("Configuration file {path} must have a <base> root element, found <{found}>")]
    UnexpectedRoot { path: PathBuf, found: String },

    #[error("Configuration file {path} has no <{section}> section")]
    MissingSection { path: PathBuf, section: &'static str },

    #[error("Invalid value for <{field}> in {path}: {reason}")]
    Invalid {
        path: PathBuf,
        field: String,
        reason: String,
    },
}

const ROOT_ELEMENT: &str = "base";

/// Root `<base>` element; sections may repeat and interleave
#[derive(Debug, Default, Deserialize)]
struct RawDocument {
    #[serde(default)]
    consumer: Vec<RawConsumer>,
    #[serde(default)]
    publisher: Vec<RawPublisher>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawConsumer {
    #[serde(rename = "@count")]
    count: Option<i64>,
    transport: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    socket_path: Option<String>,
    destination_name: Option<String>,
    buffer_size: Option<usize>,
    maximum_messages_to_receive: Option<u64>,
    prints_per_message_count: Option<u64>,
    running_delay: Option<u64>,
    file_path_to_write_received_messages: Option<String>,
    file_path_to_write_statistics: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, rename_all = "camelCase")]
struct RawPublisher {
    #[serde(rename = "@count")]
    count: Option<i64>,
    transport: Option<String>,
    host: Option<String>,
    port: Option<u16>,
    socket_path: Option<String>,
    destination_name: Option<String>,
    buffer_size: Option<usize>,
    number_of_messages_to_send: Option<u64>,
    message_size: Option<usize>,
    read_messages_from_file_path: Option<String>,
    prints_per_message_count: Option<u64>,
    running_delay: Option<u64>,
    file_path_to_write_statistics: Option<String>,
}

fn read_document(path: &Path) -> Result<RawDocument, ConfigError> {
    let contents = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let document = quick_xml::de::from_str(&contents).map_err(|source| ConfigError::Parse {
        path: path.to_path_buf(),
        source,
    })?;

    match root_element(&contents) {
        Some(root) if root == ROOT_ELEMENT => Ok(document),
        found => Err(ConfigError::UnexpectedRoot {
            path: path.to_path_buf(),
            found: found.unwrap_or_default(),
        }),
    }
}

/// Name of the first element in `contents`, skipping the prolog
fn root_element(contents: &str) -> Option<String> {
    let mut reader = quick_xml::Reader::from_str(contents);
    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) | Ok(Event::Empty(e)) => {
                return Some(String::from_utf8_lossy(e.name().as_ref()).into_owned())
            }
            Ok(Event::Eof) | Err(_) => return None,
            Ok(_) => {}
        }
    }
}

fn invalid(path: &Path, field: &str, reason: impl Into<String>) -> ConfigError {
    ConfigError::Invalid {
        path: path.to_path_buf(),
        field: field.to_string(),
        reason: reason.into(),
    }
}

fn validate_count(path: &Path, section: &str, count: Option<i64>) -> Result<usize, ConfigError> {
    match count {
        None => Ok(defaults::ROLE_COUNT),
        Some(n) if n >= 1 => Ok(n as usize),
        Some(n) => Err(invalid(
            path,
            &format!("{} count", section),
            format!("count must be greater than 0, got {}", n),
        )),
    }
}

/// Presence and replica count of one role in the document
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleSection {
    pub count: usize,
}

/// Top-level view of the configuration document
///
/// Only answers which roles are present and how many replicas each asks for;
/// the role configurations are built from the same path by
/// [`ConsumerConfig::from_path`] and [`PublisherConfig::from_path`].
#[derive(Debug, Clone)]
pub struct HarnessConfig {
    pub path: PathBuf,
    pub consumer: Option<RoleSection>,
    pub publisher: Option<RoleSection>,
}

impl HarnessConfig {
    /// Load and validate the document at `path`
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let document = read_document(path)?;

        if document.consumer.len() > 1 {
            warn!(
                "{} <consumer> sections found, only the first is used",
                document.consumer.len()
            );
        }
        if document.publisher.len() > 1 {
            warn!(
                "{} <publisher> sections found, only the first is used",
                document.publisher.len()
            );
        }

        let consumer = match document.consumer.first() {
            Some(section) => Some(RoleSection {
                count: validate_count(path, "consumer", section.count)?,
            }),
            None => None,
        };
        let publisher = match document.publisher.first() {
            Some(section) => Some(RoleSection {
                count: validate_count(path, "publisher", section.count)?,
            }),
            None => None,
        };

        Ok(Self {
            path: path.to_path_buf(),
            consumer,
            publisher,
        })
    }
}

/// Where a client's destination lives
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub transport: TransportKind,
    pub destination_name: String,
    pub transport_config: TransportConfig,
}

impl EndpointConfig {
    #[allow(clippy::too_many_arguments)]
    fn build(
        path: &Path,
        transport: Option<&str>,
        host: Option<&str>,
        port: Option<u16>,
        socket_path: Option<&str>,
        destination_name: Option<&str>,
        buffer_size: Option<usize>,
    ) -> Result<Self, ConfigError> {
        let transport = match transport {
            Some(value) => value
                .parse::<TransportKind>()
                .map_err(|e| invalid(path, "transport", e.to_string()))?,
            None => TransportKind::Tcp,
        };

        let destination_name = destination_name
            .map(str::trim)
            .unwrap_or(defaults::DESTINATION_NAME)
            .to_string();
        if destination_name.is_empty() {
            return Err(invalid(path, "destinationName", "must not be empty"));
        }

        let buffer_size = buffer_size.unwrap_or(defaults::BUFFER_SIZE);
        crate::utils::validate_buffer_size(buffer_size)
            .map_err(|e| invalid(path, "bufferSize", e.to_string()))?;

        let socket_path = socket_path
            .map(str::to_string)
            .unwrap_or_else(|| format!("/tmp/mb-harness-{}.sock", destination_name));

        Ok(Self {
            transport,
            destination_name,
            transport_config: TransportConfig {
                buffer_size,
                host: host.unwrap_or(defaults::HOST).trim().to_string(),
                port: port.unwrap_or(defaults::PORT),
                socket_path,
                ..TransportConfig::default()
            },
        })
    }

    /// Human-readable endpoint of the destination
    pub fn endpoint(&self) -> String {
        self.transport_config.endpoint(self.transport)
    }
}

/// Settings of a consumer client
#[derive(Debug, Clone)]
pub struct ConsumerConfig {
    pub endpoint: EndpointConfig,
    /// Per replica; `None` keeps consuming until stopped
    pub maximum_messages_to_receive: Option<u64>,
    pub prints_per_message_count: u64,
    pub running_delay: Duration,
    pub received_messages_path: Option<PathBuf>,
    pub statistics_path: Option<PathBuf>,
}

impl ConsumerConfig {
    /// Build the consumer configuration from the `<consumer>` section at `path`
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let document = read_document(path)?;
        let raw = document
            .consumer
            .into_iter()
            .next()
            .ok_or_else(|| ConfigError::MissingSection {
                path: path.to_path_buf(),
                section: "consumer",
            })?;

        let endpoint = EndpointConfig::build(
            path,
            raw.transport.as_deref(),
            raw.host.as_deref(),
            raw.port,
            raw.socket_path.as_deref(),
            raw.destination_name.as_deref(),
            raw.buffer_size,
        )?;

        if raw.maximum_messages_to_receive == Some(0) {
            return Err(invalid(
                path,
                "maximumMessagesToReceive",
                "must be greater than 0 when set",
            ));
        }

        Ok(Self {
            endpoint,
            maximum_messages_to_receive: raw.maximum_messages_to_receive,
            prints_per_message_count: raw
                .prints_per_message_count
                .unwrap_or(defaults::PRINTS_PER_MESSAGE_COUNT)
                .max(1),
            running_delay: Duration::from_millis(raw.running_delay.unwrap_or(0)),
            received_messages_path: raw.file_path_to_write_received_messages.map(PathBuf::from),
            statistics_path: raw.file_path_to_write_statistics.map(PathBuf::from),
        })
    }
}

impl fmt::Display for ConsumerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ConsumerConfig{{transport={}, endpoint={}, destination={}, maximumMessagesToReceive={}, \
printsPerMessageCount={}, runningDelay={}ms",
            self.endpoint.transport,
            self.endpoint.endpoint(),
            self.endpoint.destination_name,
            self.maximum_messages_to_receive
                .map(|n| n.to_string())
                .unwrap_or_else(|| "unbounded".to_string()),
            self.prints_per_message_count,
            self.running_delay.as_millis(),
        )?;
        if let Some(path) = &self.received_messages_path {
            write!(f, ", receivedMessages={}", path.display())?;
        }
        if let Some(path) = &self.statistics_path {
            write!(f, ", statistics={}", path.display())?;
        }
        write!(f, "}}")
    }
}

/// Settings of a publisher client
#[derive(Debug, Clone)]
pub struct PublisherConfig {
    pub endpoint: EndpointConfig,
    /// Per replica
    pub number_of_messages_to_send: u64,
    pub message_size: usize,
    /// Send this file's contents instead of random bytes
    pub payload_file: Option<PathBuf>,
    pub prints_per_message_count: u64,
    pub running_delay: Duration,
    pub statistics_path: Option<PathBuf>,
}

impl PublisherConfig {
    /// Build the publisher configuration from the `<publisher>` section at `path`
    pub fn from_path(path: &Path) -> Result<Self, ConfigError> {
        let document = read_document(path)?;
        let raw = document
            .publisher
            .into_iter()
            .next()
            .ok_or_else(|| ConfigError::MissingSection {
                path: path.to_path_buf(),
                section: "publisher",
            })?;

        let endpoint = EndpointConfig::build(
            path,
            raw.transport.as_deref(),
            raw.host.as_deref(),
            raw.port,
            raw.socket_path.as_deref(),
            raw.destination_name.as_deref(),
            raw.buffer_size,
        )?;

        let message_size = raw.message_size.unwrap_or(defaults::MESSAGE_SIZE);
        crate::utils::validate_message_size(message_size)
            .map_err(|e| invalid(path, "messageSize", e.to_string()))?;

        Ok(Self {
            endpoint,
            number_of_messages_to_send: raw
                .number_of_messages_to_send
                .unwrap_or(defaults::NUMBER_OF_MESSAGES_TO_SEND),
            message_size,
            payload_file: raw.read_messages_from_file_path.map(PathBuf::from),
            prints_per_message_count: raw
                .prints_per_message_count
                .unwrap_or(defaults::PRINTS_PER_MESSAGE_COUNT)
                .max(1),
            running_delay: Duration::from_millis(raw.running_delay.unwrap_or(0)),
            statistics_path: raw.file_path_to_write_statistics.map(PathBuf::from),
        })
    }
}

impl fmt::Display for PublisherConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "PublisherConfig{{transport={}, endpoint={}, destination={}, numberOfMessagesToSend={}, \
messageSize={}, printsPerMessageCount={}, runningDelay={}ms",
            self.endpoint.transport,
            self.endpoint.endpoint(),
            self.endpoint.destination_name,
            self.number_of_messages_to_send,
            self.message_size,
            self.prints_per_message_count,
            self.running_delay.as_millis(),
        )?;
        if let Some(path) = &self.payload_file {
            write!(f, ", payloadFile={}", path.display())?;
        }
        if let Some(path) = &self.statistics_path {
            write!(f, ", statistics={}", path.display())?;
        }
        write!(f, "}}")
    }
}
