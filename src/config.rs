//! Public, backend-agnostic consumer and connection configuration.
//!
//! Nothing here knows about a concrete client library. Backends interpret
//! [`BusConfig`] into their own connection settings and read the tuning
//! knobs they care about from [`ConsumerOptions`].

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::{BusError, Result};

/// What a consumer does with a delivery whose payload cannot be decoded.
///
/// Poison messages never reach the handler and are never retried by this
/// crate. The policy only decides what the backend is told about them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PoisonPolicy {
    /// Acknowledge the delivery so the backend forgets it.
    #[default]
    Discard,

    /// Leave the delivery unacknowledged (pull backends) or reject it
    /// without requeue (push backends), so any dead-letter routing the
    /// backend itself is configured with takes over.
    Reject,
}

/// Tuning knobs shared by pull and push consumers.
///
/// Defaults follow the broker adapters this crate replaces: ten deliveries
/// per fetch, a short long-poll bound and a 100 ms pause when a backend
/// without long-poll support returns nothing.
#[derive(Debug, Clone)]
pub struct ConsumerOptions {
    // ---
    /// Maximum deliveries requested per fetch (pull backends).
    pub batch_size: usize,

    /// Upper bound a single fetch may block waiting for deliveries.
    ///
    /// Also bounds how long `stop()` waits for an idle loop to notice
    /// cancellation on backends that cannot be interrupted mid-fetch.
    pub wait_time: Duration,

    /// Pause after a fetch that returned no deliveries.
    pub idle_delay: Duration,

    /// Pause after a fetch that failed with a transport error.
    pub error_delay: Duration,

    /// Unacknowledged deliveries the broker may push at once (push backends).
    pub prefetch: u16,

    /// Upper bound on `stop()` waiting for in-flight work to finish.
    ///
    /// `None` waits for as long as the in-flight handler takes.
    pub shutdown_timeout: Option<Duration>,

    pub poison_policy: PoisonPolicy,

    /// Per-destination buffer of the in-process backend.
    pub channel_capacity: usize,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        // ---
        Self {
            batch_size: 10,
            wait_time: Duration::from_secs(1),
            idle_delay: Duration::from_millis(100),
            error_delay: Duration::from_secs(1),
            prefetch: 10,
            shutdown_timeout: Some(Duration::from_secs(30)),
            poison_policy: PoisonPolicy::Discard,
            channel_capacity: 1024,
        }
    }
}

impl ConsumerOptions {
    // ---

    /// Set the maximum deliveries per fetch.
    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.batch_size = size;
        self
    }

    /// Set the long-poll bound of a single fetch.
    pub fn with_wait_time(mut self, wait: Duration) -> Self {
        self.wait_time = wait;
        self
    }

    /// Set the pause after an empty fetch.
    pub fn with_idle_delay(mut self, delay: Duration) -> Self {
        self.idle_delay = delay;
        self
    }

    /// Set the pause after a failed fetch.
    pub fn with_error_delay(mut self, delay: Duration) -> Self {
        self.error_delay = delay;
        self
    }

    pub fn with_prefetch(mut self, prefetch: u16) -> Self {
        self.prefetch = prefetch;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn with_poison_policy(mut self, policy: PoisonPolicy) -> Self {
        self.poison_policy = policy;
        self
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity;
        self
    }

    /// Reject values no backend can honour.
    pub fn validate(&self) -> Result<()> {
        // ---
        if self.batch_size == 0 {
            return Err(BusError::Configuration("batch_size must be at least 1".into()));
        }
        if self.prefetch == 0 {
            return Err(BusError::Configuration("prefetch must be at least 1".into()));
        }
        if self.channel_capacity == 0 {
            return Err(BusError::Configuration(
                "channel_capacity must be at least 1".into(),
            ));
        }
        if self.wait_time.is_zero() {
            return Err(BusError::Configuration("wait_time must be non-zero".into()));
        }
        Ok(())
    }
}

/// Backend selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// In-process channel (always available).
    Memory,
    /// Redis Streams consumer groups (`transport_redis`).
    Redis,
    /// MQTT topics via rumqttc (`transport_rumqttc`).
    Mqtt,
    /// AMQP 0-9-1 queues via lapin (`transport_lapin`).
    Amqp,
}

impl TransportKind {
    // ---

    /// Infer the backend from a URI scheme.
    ///
    /// An empty URI selects the in-process backend.
    pub fn from_uri(uri: &str) -> Result<Self> {
        // ---
        if uri.is_empty() {
            return Ok(TransportKind::Memory);
        }

        let scheme = uri
            .split_once("://")
            .map(|(scheme, _)| scheme)
            .ok_or_else(|| BusError::Configuration(format!("URI without scheme: {uri}")))?;

        match scheme {
            "memory" => Ok(TransportKind::Memory),
            "redis" | "rediss" => Ok(TransportKind::Redis),
            "mqtt" | "mqtts" | "tcp" => Ok(TransportKind::Mqtt),
            "amqp" | "amqps" => Ok(TransportKind::Amqp),
            other => Err(BusError::Configuration(format!(
                "cannot infer transport from URI scheme: {other}"
            ))),
        }
    }

    /// Whether the backend tracks read positions per consumer group.
    pub fn supports_groups(self) -> bool {
        matches!(self, TransportKind::Redis | TransportKind::Mqtt)
    }
}

impl FromStr for TransportKind {
    type Err = BusError;

    fn from_str(s: &str) -> Result<Self> {
        // ---
        match s {
            "memory" => Ok(TransportKind::Memory),
            "redis" => Ok(TransportKind::Redis),
            "mqtt" | "rumqttc" => Ok(TransportKind::Mqtt),
            "amqp" | "lapin" => Ok(TransportKind::Amqp),
            other => Err(BusError::Configuration(format!(
                "unrecognized transport_type: {other}, valid values: memory, redis, mqtt, amqp"
            ))),
        }
    }
}

impl fmt::Display for TransportKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransportKind::Memory => "memory",
            TransportKind::Redis => "redis",
            TransportKind::Mqtt => "mqtt",
            TransportKind::Amqp => "amqp",
        };
        f.write_str(name)
    }
}

/// Connection and destination parameters for one consumer or publisher.
///
/// Passed to backend factory functions (`create_*_consumer()`,
/// `create_*_publisher()`); normally assembled by [`BusBuilder`](crate::BusBuilder).
#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Broker URI (e.g. `"redis://localhost:6379"`, `"amqp://localhost:5672/%2f"`).
    pub uri: String,
    /// Queue, topic, subject or stream name.
    pub destination: String,
    /// Consumer-group identity for backends that track group read positions.
    pub group: Option<String>,
    /// Member name within the group. Generated when absent.
    pub consumer_name: Option<String>,
    pub transport: TransportKind,
    /// Broker keep-alive interval in seconds.
    pub keep_alive_secs: Option<u16>,
}

impl BusConfig {
    /// Config for the in-process backend.
    pub fn memory(destination: impl Into<String>) -> Self {
        Self {
            uri: String::new(),
            destination: destination.into(),
            group: None,
            consumer_name: None,
            transport: TransportKind::Memory,
            keep_alive_secs: None,
        }
    }

    /// The group member name, generating a unique one if none was configured.
    pub fn consumer_name_or_generate(&self) -> String {
        self.consumer_name
            .clone()
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string())
    }
}
