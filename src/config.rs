//! Gateway configuration.
//!
//! The gateway consumes a [`GatewayConfig`] as plain values. It can be built programmatically with the `with_*`
//! methods or loaded from TOML:
//!
//! ```toml
//! name = "POS-GW"
//! role = "passive"
//! address = "0.0.0.0:9000"
//! framing = "llll"
//! max_connections = 64
//! reply_mode = "net_to_bus"
//! reply_timeout_ms = 5000
//! incoming_service = "POSIN"
//! ```

use std::{path::Path, time::Duration};

use serde::{Deserialize, Serialize};

use crate::{error::ConfigError, framing::FramingConfig, id::ConnId};

/// Which side opens the TCP connections.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    /// The gateway dials `address` and keeps the configured number of connections up.
    Active,
    /// The gateway listens on `address` and accepts peers.
    Passive,
}

impl Role {
    /// Single-letter flag used in bus records and status notifications.
    pub fn flag(&self) -> char {
        match self {
            Role::Active => 'A',
            Role::Passive => 'P',
        }
    }
}

/// How requests and replies are paired on the wire.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReplyMode {
    /// Persistent connections, no replies expected in either direction.
    Async,
    /// One network request per connection: call the bus, write the reply, close.
    NetToBus,
    /// One bus request per connection: dial, write, wait for the network reply, close.
    BusToNet,
    /// Persistent connections; network replies are matched by a correlator string.
    PersistentCorrelated,
    /// Persistent connections with at most one bus-originated exchange outstanding per connection.
    PersistentSingleExchange,
}

impl ReplyMode {
    /// Returns `true` if connections outlive a single exchange.
    pub fn is_persistent(&self) -> bool {
        !matches!(self, ReplyMode::NetToBus | ReplyMode::BusToNet)
    }

    /// Returns `true` if bus-originated sends wait for a network reply.
    pub fn expects_network_reply(&self) -> bool {
        matches!(
            self,
            ReplyMode::BusToNet
                | ReplyMode::PersistentCorrelated
                | ReplyMode::PersistentSingleExchange
        )
    }

    /// Returns `true` if fresh network requests are called synchronously on the bus and answered on the wire.
    pub fn answers_network_requests(&self) -> bool {
        matches!(
            self,
            ReplyMode::NetToBus
                | ReplyMode::PersistentCorrelated
                | ReplyMode::PersistentSingleExchange
        )
    }
}

/// Configuration of one gateway instance.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
    /// Gateway name, carried in every bus record.
    pub name: String,
    /// Active (dialing) or passive (listening).
    pub role: Role,
    /// Bind address in passive mode, target address in active mode.
    pub address: String,
    /// Framing mode string, e.g. `"llll"` or `"D"`.
    pub framing: String,
    /// Reserved leading header bytes excluded from the length value.
    pub framing_offset: usize,
    /// Swap the two halves of the header before interpreting it.
    pub framing_half_swap: bool,
    /// Keep the header as part of the logical message.
    pub framing_keep_header: bool,
    /// Maximum declared message length.
    pub max_message_len: Option<usize>,
    /// Start delimiter for `D` framing.
    pub delimiter_start: u8,
    /// Stop delimiter for `d` and `D` framing.
    pub delimiter_stop: u8,
    /// Maximum number of simultaneous connections.
    pub max_connections: u32,
    /// Request/reply pairing.
    pub reply_mode: ReplyMode,
    /// How long a pending exchange may wait for its reply.
    #[serde(rename = "reply_timeout_ms", with = "millis")]
    pub reply_timeout: Duration,
    /// Period of zero-length keep-alive frames.
    #[serde(rename = "keepalive_period_ms", with = "opt_millis")]
    pub keepalive_period: Option<Duration>,
    /// Close connections without inbound traffic for this long.
    #[serde(rename = "idle_timeout_ms", with = "opt_millis")]
    pub idle_timeout: Option<Duration>,
    /// Sessions available to network-originated requests.
    pub inbound_workers: usize,
    /// Sessions available to bus-originated sends; also bounds the outbound backlog.
    pub outbound_workers: usize,
    /// Dispatch one connection's inbound requests one at a time, in arrival order.
    pub sequential_inbound: bool,
    /// Bus service receiving network-originated messages.
    pub incoming_service: String,
    /// Bus service timeout for synchronous calls.
    #[serde(rename = "bus_timeout_ms", with = "millis")]
    pub bus_timeout: Duration,
    /// Timeout of a single dial attempt.
    #[serde(rename = "dial_timeout_ms", with = "millis")]
    pub dial_timeout: Duration,
    /// How long queued outbound frames may still be flushed on shutdown.
    #[serde(rename = "shutdown_grace_ms", with = "millis")]
    pub shutdown_grace: Duration,
    /// Period of the supervisor tick.
    #[serde(rename = "periodic_interval_ms", with = "millis")]
    pub periodic_interval: Duration,
    /// Capacity of each connection's outbound queue.
    pub outbound_queue_len: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        GatewayConfig {
            name: "busgate".to_string(),
            role: Role::Passive,
            address: String::new(),
            framing: "llll".to_string(),
            framing_offset: 0,
            framing_half_swap: false,
            framing_keep_header: false,
            max_message_len: None,
            delimiter_start: 0x02,
            delimiter_stop: 0x03,
            max_connections: 10,
            reply_mode: ReplyMode::Async,
            reply_timeout: Duration::from_secs(60),
            keepalive_period: None,
            idle_timeout: None,
            inbound_workers: 5,
            outbound_workers: 5,
            sequential_inbound: false,
            incoming_service: String::new(),
            bus_timeout: Duration::from_secs(60),
            dial_timeout: Duration::from_secs(5),
            shutdown_grace: Duration::from_secs(2),
            periodic_interval: Duration::from_secs(1),
            outbound_queue_len: 64,
        }
    }
}

impl GatewayConfig {
    /// Creates a configuration with defaults for the given role and address.
    pub fn new(role: Role, address: impl Into<String>) -> Self {
        GatewayConfig {
            role,
            address: address.into(),
            ..Default::default()
        }
    }

    /// Loads a configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parses a configuration from a TOML string.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Sets the gateway name.
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Sets the framing mode string.
    pub fn with_framing(mut self, framing: impl Into<String>) -> Self {
        self.framing = framing.into();
        self
    }

    /// Sets the reserved header offset.
    pub fn with_framing_offset(mut self, offset: usize) -> Self {
        self.framing_offset = offset;
        self
    }

    /// Enables or disables the header half-swap.
    pub fn with_half_swap(mut self, half_swap: bool) -> Self {
        self.framing_half_swap = half_swap;
        self
    }

    /// Keeps the header as part of the logical message.
    pub fn with_keep_header(mut self, keep_header: bool) -> Self {
        self.framing_keep_header = keep_header;
        self
    }

    /// Sets the maximum message length.
    pub fn with_max_message_len(mut self, max: usize) -> Self {
        self.max_message_len = Some(max);
        self
    }

    /// Sets the delimiters used by `d`/`D` framing.
    pub fn with_delimiters(mut self, start: u8, stop: u8) -> Self {
        self.delimiter_start = start;
        self.delimiter_stop = stop;
        self
    }

    /// Sets the maximum number of connections.
    pub fn with_max_connections(mut self, max: u32) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the request/reply mode.
    pub fn with_reply_mode(mut self, mode: ReplyMode) -> Self {
        self.reply_mode = mode;
        self
    }

    /// Sets the reply timeout.
    pub fn with_reply_timeout(mut self, timeout: Duration) -> Self {
        self.reply_timeout = timeout;
        self
    }

    /// Sets the keep-alive period.
    pub fn with_keepalive_period(mut self, period: Duration) -> Self {
        self.keepalive_period = Some(period);
        self
    }

    /// Sets the idle timeout.
    pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
        self.idle_timeout = Some(timeout);
        self
    }

    /// Sets the inbound and outbound worker counts.
    pub fn with_workers(mut self, inbound: usize, outbound: usize) -> Self {
        self.inbound_workers = inbound;
        self.outbound_workers = outbound;
        self
    }

    /// Dispatches each connection's inbound requests sequentially.
    pub fn with_sequential_inbound(mut self, sequential: bool) -> Self {
        self.sequential_inbound = sequential;
        self
    }

    /// Sets the service receiving network-originated messages.
    pub fn with_incoming_service(mut self, service: impl Into<String>) -> Self {
        self.incoming_service = service.into();
        self
    }

    /// Sets the supervisor tick period.
    pub fn with_periodic_interval(mut self, interval: Duration) -> Self {
        self.periodic_interval = interval;
        self
    }

    /// Sets the shutdown grace period.
    pub fn with_shutdown_grace(mut self, grace: Duration) -> Self {
        self.shutdown_grace = grace;
        self
    }

    /// Checks value ranges and cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.address.is_empty() {
            return Err(ConfigError::Invalid("address must be set".into()));
        }
        if self.max_connections == 0 || self.max_connections > ConnId::MAX_SLOT {
            return Err(ConfigError::Invalid(format!(
                "max_connections must be within 1..={}",
                ConnId::MAX_SLOT
            )));
        }
        if self.inbound_workers == 0 || self.outbound_workers == 0 {
            return Err(ConfigError::Invalid("worker counts must be non-zero".into()));
        }
        if self.outbound_queue_len == 0 {
            return Err(ConfigError::Invalid("outbound_queue_len must be non-zero".into()));
        }
        if self.periodic_interval.is_zero() {
            return Err(ConfigError::Invalid("periodic_interval must be non-zero".into()));
        }
        if self.reply_mode == ReplyMode::BusToNet && self.role != Role::Active {
            return Err(ConfigError::Invalid(
                "bus_to_net reply mode requires the active role".into(),
            ));
        }
        self.framing_config().map(drop)
    }

    /// Derives the immutable framing configuration.
    pub fn framing_config(&self) -> Result<FramingConfig, ConfigError> {
        let mut framing = FramingConfig::parse(&self.framing)?
            .with_offset(self.framing_offset)
            .with_half_swap(self.framing_half_swap)
            .with_keep_header(self.framing_keep_header)
            .with_delimiters(self.delimiter_start, self.delimiter_stop);
        if let Some(max) = self.max_message_len {
            framing = framing.with_max_len(max);
        }
        framing.validate()?;
        Ok(framing)
    }
}

mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}

mod opt_millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(
        value: &Option<Duration>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        match value {
            Some(value) => serializer.serialize_u64(value.as_millis() as u64),
            None => serializer.serialize_none(),
        }
    }

    // Zero disables the timer.
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Duration>, D::Error> {
        let value = Option::<u64>::deserialize(deserializer)?;
        Ok(value.filter(|ms| *ms > 0).map(Duration::from_millis))
    }
}
