//! Defines error handling constructs for busgate.
//!
//! Errors are grouped by the component that raises them. Each group maps onto one class of the gateway's
//! failure taxonomy (see [`ErrorKind`]), which determines how far a failure is allowed to spread: protocol and
//! transport errors end a single connection, capacity errors are reported to whoever asked for a new connection,
//! timeouts and bus errors are handed to the waiting caller, and logic errors indicate a bug.

use std::{fmt, io};

use bytes::Bytes;
use thiserror::Error;
use tokio::sync::oneshot;

/// Result type returned by gateway operations.
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Classification of gateway errors by blast radius.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed frame; fatal to the connection it arrived on.
    Protocol,
    /// No free connection slot.
    Capacity,
    /// Socket read, write or dial failure.
    Transport,
    /// No reply within the configured window.
    Timeout,
    /// Failure reported by the service bus.
    Bus,
    /// Invalid configuration.
    Config,
    /// Programming error, such as registering a correlation key twice.
    Logic,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::Protocol => write!(f, "protocol"),
            ErrorKind::Capacity => write!(f, "capacity"),
            ErrorKind::Transport => write!(f, "transport"),
            ErrorKind::Timeout => write!(f, "timeout"),
            ErrorKind::Bus => write!(f, "bus"),
            ErrorKind::Config => write!(f, "config"),
            ErrorKind::Logic => write!(f, "logic"),
        }
    }
}

/// Errors raised while reading or writing a frame.
#[derive(Debug, Error)]
pub enum FrameError {
    /// The length header could not be interpreted.
    #[error("malformed length header: {0}")]
    MalformedHeader(String),
    /// The declared length is smaller than the header it includes.
    #[error("declared length {declared} is shorter than the {header} byte header")]
    NegativeLength {
        /// Length value carried by the header.
        declared: u64,
        /// Header width in bytes.
        header: usize,
    },
    /// The message is longer than the configured ceiling.
    #[error("message length {len} exceeds the maximum of {max}")]
    TooLong {
        /// Offending length.
        len: u64,
        /// Configured maximum.
        max: usize,
    },
    /// The first byte of a delimited frame was not the start delimiter.
    #[error("expected start delimiter {expected:#04x}, got {found:#04x}")]
    DelimiterMismatch {
        /// Configured start delimiter.
        expected: u8,
        /// Byte actually read.
        found: u8,
    },
    /// A message handed to the encoder cannot be represented by the header.
    #[error("cannot encode length {len} into {width} header bytes")]
    Unencodable {
        /// Length that had to be encoded.
        len: usize,
        /// Available header width.
        width: usize,
    },
    /// A header-retaining message was shorter than its own header.
    #[error("message of {len} bytes is shorter than the {header} byte header it must carry")]
    MissingHeader {
        /// Message length.
        len: usize,
        /// Header width.
        header: usize,
    },
    /// A delimited message contains one of its own delimiter bytes.
    #[error("delimiter byte {byte:#04x} at offset {position} cannot be framed")]
    DelimiterInPayload {
        /// The offending byte.
        byte: u8,
        /// Its offset within the message.
        position: usize,
    },
    /// The peer closed the stream.
    #[error("connection closed by peer")]
    Eof,
    /// The underlying socket failed.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl FrameError {
    /// Returns the taxonomy class of the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            FrameError::Eof | FrameError::Io(_) => ErrorKind::Transport,
            _ => ErrorKind::Protocol,
        }
    }
}

/// Errors raised by the connection registry.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    /// Every connection slot is taken.
    #[error("no free connection slot (max {max})")]
    NoCapacity {
        /// Configured maximum number of connections.
        max: u32,
    },
    /// A connection was registered under an id it did not allocate.
    #[error("connection id {0} was not allocated")]
    NotAllocated(u32),
}

/// Errors raised by the correlation tables.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CorrelationError {
    /// A pending exchange already occupies the key.
    #[error("correlation key {0} is already registered")]
    DuplicateKey(String),
}

/// Failure reported by the service bus collaborator.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BusError {
    /// The service call failed; the bus may attach a reply payload.
    #[error("service {service} failed: {reason}")]
    Service {
        /// Called service.
        service: String,
        /// Reason given by the bus.
        reason: String,
        /// Optional error payload returned by the service.
        payload: Option<Bytes>,
    },
    /// The bus did not answer in time.
    #[error("bus call timed out")]
    Timeout,
    /// A session could not be opened for a pool slot.
    #[error("failed to open bus session for slot {slot}: {reason}")]
    Session {
        /// Pool slot.
        slot: usize,
        /// Reason given by the bus.
        reason: String,
    },
}

/// Outcome delivered through a pending exchange's reply conduit when no reply arrived.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum ReplyError {
    /// The reply window elapsed.
    #[error("no reply within the reply timeout")]
    Timeout,
    /// The connection carrying the exchange closed.
    #[error("connection closed before a reply arrived")]
    ConnectionClosed,
}

impl From<oneshot::error::RecvError> for ReplyError {
    fn from(_err: oneshot::error::RecvError) -> Self {
        ReplyError::ConnectionClosed
    }
}

/// Invalid configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file could not be read.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The configuration file is not valid TOML.
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    /// The framing mode string is not understood.
    #[error("invalid framing '{0}'")]
    Framing(String),
    /// A value is out of range.
    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The umbrella error type of the gateway.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// Framing failure.
    #[error(transparent)]
    Frame(#[from] FrameError),
    /// Registry failure.
    #[error(transparent)]
    Registry(#[from] RegistryError),
    /// Correlation failure.
    #[error(transparent)]
    Correlation(#[from] CorrelationError),
    /// Reply conduit outcome.
    #[error(transparent)]
    Reply(#[from] ReplyError),
    /// Bus failure.
    #[error(transparent)]
    Bus(#[from] BusError),
    /// Configuration failure.
    #[error(transparent)]
    Config(#[from] ConfigError),
    /// Dial, accept or bind failure.
    #[error("transport error: {0}")]
    Transport(#[from] io::Error),
    /// The addressed connection is not registered.
    #[error("connection {0} not found")]
    UnknownConnection(u64),
    /// No connection occupies the addressed slot.
    #[error("no connection in slot {0}")]
    UnknownSlot(u32),
    /// There is no open connection to send on.
    #[error("no open connection")]
    NoConnection,
    /// The request is not valid in the configured reply mode.
    #[error("{0}")]
    Unsupported(&'static str),
    /// The connection or gateway is shutting down.
    #[error("gateway is shutting down")]
    Shutdown,
    /// An internal invariant was violated.
    #[error("logic error: {0}")]
    Logic(String),
}

impl GatewayError {
    /// Returns the taxonomy class of the error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            GatewayError::Frame(err) => err.kind(),
            GatewayError::Registry(RegistryError::NoCapacity { .. }) => ErrorKind::Capacity,
            GatewayError::Registry(RegistryError::NotAllocated(_)) => ErrorKind::Logic,
            GatewayError::Correlation(_) | GatewayError::Logic(_) => ErrorKind::Logic,
            GatewayError::Reply(ReplyError::Timeout) => ErrorKind::Timeout,
            GatewayError::Reply(ReplyError::ConnectionClosed) => ErrorKind::Transport,
            GatewayError::Bus(_) => ErrorKind::Bus,
            GatewayError::Config(_) | GatewayError::Unsupported(_) => ErrorKind::Config,
            GatewayError::Transport(_)
            | GatewayError::UnknownConnection(_)
            | GatewayError::UnknownSlot(_)
            | GatewayError::NoConnection
            | GatewayError::Shutdown => ErrorKind::Transport,
        }
    }

    /// Returns `true` if the error is a reply timeout.
    pub fn is_timeout(&self) -> bool {
        self.kind() == ErrorKind::Timeout
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kinds_follow_taxonomy() {
        let err = GatewayError::from(FrameError::TooLong { len: 10, max: 4 });
        assert_eq!(err.kind(), ErrorKind::Protocol);

        let err = GatewayError::from(FrameError::Eof);
        assert_eq!(err.kind(), ErrorKind::Transport);

        let err = GatewayError::from(RegistryError::NoCapacity { max: 1 });
        assert_eq!(err.kind(), ErrorKind::Capacity);

        let err = GatewayError::from(ReplyError::Timeout);
        assert!(err.is_timeout());

        let err = GatewayError::from(CorrelationError::DuplicateKey("abc".into()));
        assert_eq!(err.kind(), ErrorKind::Logic);
    }
}
