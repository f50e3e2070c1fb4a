//! Connection, call and server options.
//!
//! `RemoteOptions` is attached to a connection when it is mapped and acts as
//! the default for every call on it. `CallOptions` overrides those defaults
//! for a single dispatch. Both deserialize from JSON (durations in
//! milliseconds), so they can live in an application config file.

use std::collections::HashMap;
use std::time::Duration;

use backon::ExponentialBuilder;
use serde::{Deserialize, Serialize};

/// Default number of attempts for a call, the first one included.
pub const DEFAULT_MAX_RETRY_ATTEMPTS: usize = 5;

/// Options for one remote connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteOptions {
    /// Maximum attempts for a transiently failing call (first attempt included).
    pub max_retry_attempts: usize,
    /// Smallest delay between attempts.
    #[serde(with = "duration_ms")]
    pub retry_min_delay: Duration,
    /// Largest delay between attempts.
    #[serde(with = "duration_ms")]
    pub retry_max_delay: Duration,
    /// Transport-level settings.
    pub transport: TransportOptions,
    /// gRPC service config document, carried as-is on the connection.
    pub service_config: Option<serde_json::Value>,
    /// Default per-attempt timeout for calls on this connection.
    #[serde(with = "opt_duration_ms")]
    pub per_call_timeout: Option<Duration>,
    /// Metadata sent with every call on this connection.
    pub per_call_metadata: HashMap<String, String>,
}

impl Default for RemoteOptions {
    fn default() -> Self {
        Self {
            max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            retry_min_delay: Duration::from_millis(50),
            retry_max_delay: Duration::from_secs(2),
            transport: TransportOptions::default(),
            service_config: None,
            per_call_timeout: None,
            per_call_metadata: HashMap::new(),
        }
    }
}

impl RemoteOptions {
    /// Parse options from a JSON document. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    /// Set the maximum attempts per call.
    pub fn with_max_retry_attempts(mut self, attempts: usize) -> Self {
        self.max_retry_attempts = attempts;
        self
    }

    /// Set the backoff bounds.
    pub fn with_retry_delays(mut self, min: Duration, max: Duration) -> Self {
        self.retry_min_delay = min;
        self.retry_max_delay = max;
        self
    }

    /// Set the default per-attempt timeout.
    pub fn with_per_call_timeout(mut self, timeout: Duration) -> Self {
        self.per_call_timeout = Some(timeout);
        self
    }

    /// Add a metadata entry sent with every call.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.per_call_metadata.insert(key.into(), value.into());
        self
    }

    /// Set the transport options.
    pub fn with_transport(mut self, transport: TransportOptions) -> Self {
        self.transport = transport;
        self
    }

    /// Merge per-call overrides over these defaults.
    pub fn resolve(&self, call: &CallOptions) -> ResolvedCall {
        let mut metadata = self.per_call_metadata.clone();
        metadata.extend(call.metadata.iter().map(|(k, v)| (k.clone(), v.clone())));
        ResolvedCall {
            timeout: call.timeout.or(self.per_call_timeout),
            metadata,
            max_attempts: call
                .max_retry_attempts
                .unwrap_or(self.max_retry_attempts)
                .max(1),
            min_delay: self.retry_min_delay,
            max_delay: self.retry_max_delay,
        }
    }
}

/// Transport-level settings applied to the connection's channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportOptions {
    #[serde(with = "opt_duration_ms")]
    pub connect_timeout: Option<Duration>,
    #[serde(with = "opt_duration_ms")]
    pub tcp_keepalive: Option<Duration>,
    #[serde(with = "opt_duration_ms")]
    pub http2_keep_alive_interval: Option<Duration>,
    /// Largest message accepted or sent, in bytes.
    pub max_message_size: Option<usize>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            connect_timeout: Some(Duration::from_secs(5)),
            tcp_keepalive: None,
            http2_keep_alive_interval: None,
            max_message_size: None,
        }
    }
}

/// Per-invocation overrides. Does not outlive the call.
#[derive(Debug, Clone, Default)]
pub struct CallOptions {
    pub timeout: Option<Duration>,
    pub metadata: HashMap<String, String>,
    pub max_retry_attempts: Option<usize>,
}

impl CallOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }

    pub fn with_max_retry_attempts(mut self, attempts: usize) -> Self {
        self.max_retry_attempts = Some(attempts);
        self
    }
}

/// Connection defaults with call overrides applied.
#[derive(Debug, Clone)]
pub struct ResolvedCall {
    pub timeout: Option<Duration>,
    pub metadata: HashMap<String, String>,
    pub max_attempts: usize,
    pub min_delay: Duration,
    pub max_delay: Duration,
}

impl ResolvedCall {
    /// Backoff between attempts. `max_attempts` counts the first call, so the
    /// builder allows one retry less.
    pub fn backoff(&self) -> ExponentialBuilder {
        backoff(self.max_attempts, self.min_delay, self.max_delay)
    }
}

/// Options for the handler server and its event hubs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerOptions {
    /// Completed unary replies kept for retried calls.
    pub replay_capacity: usize,
    /// Delivery attempts for one event before a subscriber is dropped.
    pub hub_max_retry_attempts: usize,
    #[serde(with = "duration_ms")]
    pub hub_retry_min_delay: Duration,
    #[serde(with = "duration_ms")]
    pub hub_retry_max_delay: Duration,
    /// How long a single delivery may wait on a slow subscriber.
    #[serde(with = "duration_ms")]
    pub hub_delivery_timeout: Duration,
    /// Buffered events between a drain task and its gRPC stream.
    pub hub_stream_capacity: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            replay_capacity: 1024,
            hub_max_retry_attempts: DEFAULT_MAX_RETRY_ATTEMPTS,
            hub_retry_min_delay: Duration::from_millis(100),
            hub_retry_max_delay: Duration::from_secs(2),
            hub_delivery_timeout: Duration::from_secs(5),
            hub_stream_capacity: 64,
        }
    }
}

impl ServerOptions {
    pub fn from_json(json: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(json)
    }

    pub fn with_replay_capacity(mut self, capacity: usize) -> Self {
        self.replay_capacity = capacity;
        self
    }

    pub fn with_hub_retry(mut self, attempts: usize, min: Duration, max: Duration) -> Self {
        self.hub_max_retry_attempts = attempts;
        self.hub_retry_min_delay = min;
        self.hub_retry_max_delay = max;
        self
    }

    pub fn with_hub_delivery_timeout(mut self, timeout: Duration) -> Self {
        self.hub_delivery_timeout = timeout;
        self
    }

    pub(crate) fn hub_backoff(&self) -> ExponentialBuilder {
        backoff(
            self.hub_max_retry_attempts,
            self.hub_retry_min_delay,
            self.hub_retry_max_delay,
        )
    }
}

/// Exponential backoff with jitter allowing `attempts - 1` retries.
pub(crate) fn backoff(attempts: usize, min: Duration, max: Duration) -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(min)
        .with_max_delay(max.max(min))
        .with_max_times(attempts.saturating_sub(1))
        .with_jitter()
}

mod duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_duration_ms {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        Option::<u64>::deserialize(deserializer).map(|ms| ms.map(Duration::from_millis))
    }
}
