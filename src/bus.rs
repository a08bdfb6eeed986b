//! Interfaces to the transactional service bus.
//!
//! The gateway does not speak any particular bus protocol. It drives a [`ServiceBus`] implementation through pooled
//! sessions, optionally asks a [`CorrelatorExtractor`] to find the correlator inside a network message, and reports
//! connection lifecycle events to a [`StatusNotifier`].

use std::{fmt, net::SocketAddr, sync::Arc, time::Duration};

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};

use crate::{config::Role, connection::Connection, error::BusError};

/// A message travelling between the gateway and the bus.
///
/// Network-originated records carry the identity of the connection they arrived on, so that the bus can address a
/// reply or a follow-up send back to the same connection via `conn`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BusRecord {
    /// Name of the gateway instance.
    pub gateway: String,
    /// Compiled id of the connection the record relates to.
    pub conn: u64,
    /// Message payload.
    pub payload: Bytes,
    /// Correlator carried by the payload, if known.
    pub correlator: Option<String>,
    /// Local socket address of the connection.
    pub local_addr: Option<SocketAddr>,
    /// Remote socket address of the connection.
    pub peer_addr: Option<SocketAddr>,
    /// Whether the connection was dialed or accepted.
    pub role: Role,
}

impl BusRecord {
    /// Creates a record carrying `payload` on behalf of `conn`.
    pub fn for_connection(gateway: impl Into<String>, conn: &Connection, payload: Bytes) -> Self {
        BusRecord {
            gateway: gateway.into(),
            conn: conn.compiled_id(),
            payload,
            correlator: None,
            local_addr: Some(conn.local_addr()),
            peer_addr: Some(conn.peer_addr()),
            role: conn.role(),
        }
    }

    /// Attaches a correlator.
    pub fn with_correlator(mut self, correlator: Option<String>) -> Self {
        self.correlator = correlator;
        self
    }
}

/// A service bus the gateway forwards network traffic to.
///
/// Calls borrow a session exclusively; the gateway guarantees a session is never used by two calls at once.
pub trait ServiceBus: Send + Sync + 'static {
    /// Per-worker bus session.
    type Session: Send + 'static;

    /// Opens the session for pool slot `slot`.
    fn open_session(&self, slot: usize) -> Result<Self::Session, BusError>;

    /// Calls `service` and waits up to `timeout` for its reply.
    fn call<'a>(
        &'a self,
        session: &'a mut Self::Session,
        service: &'a str,
        record: BusRecord,
        timeout: Duration,
    ) -> BoxFuture<'a, Result<BusRecord, BusError>>;

    /// Posts a record to `service` without waiting for a reply.
    fn post<'a>(
        &'a self,
        session: &'a mut Self::Session,
        service: &'a str,
        record: BusRecord,
    ) -> BoxFuture<'a, Result<(), BusError>>;
}

/// Finds the correlator inside a network message.
pub trait CorrelatorExtractor: Send + Sync + 'static {
    /// Returns the correlator carried by `message`, if any.
    fn extract<'a>(&'a self, message: &'a [u8]) -> BoxFuture<'a, Option<String>>;
}

impl<F> CorrelatorExtractor for F
where
    F: Fn(&[u8]) -> Option<String> + Send + Sync + 'static,
{
    fn extract<'a>(&'a self, message: &'a [u8]) -> BoxFuture<'a, Option<String>> {
        let correlator = self(message);
        Box::pin(async move { correlator })
    }
}

/// Connection lifecycle event.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ConnectionEvent {
    /// The connection was registered.
    Established,
    /// The connection was unregistered.
    Closed,
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionEvent::Established => write!(f, "established"),
            ConnectionEvent::Closed => write!(f, "closed"),
        }
    }
}

/// Status notification sent when a connection opens or closes.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatus {
    /// What happened.
    pub event: ConnectionEvent,
    /// Gateway name.
    pub gateway: String,
    /// Connection slot.
    pub slot: u32,
    /// Compiled connection id.
    pub conn: u64,
    /// `A` for dialed connections, `P` for accepted ones.
    pub role_flag: char,
    /// Local socket address.
    pub local_addr: SocketAddr,
    /// Remote socket address.
    pub peer_addr: SocketAddr,
}

impl ConnectionStatus {
    pub(crate) fn new(event: ConnectionEvent, gateway: &str, conn: &Connection) -> Self {
        ConnectionStatus {
            event,
            gateway: gateway.to_string(),
            slot: conn.id().slot(),
            conn: conn.compiled_id(),
            role_flag: conn.role().flag(),
            local_addr: conn.local_addr(),
            peer_addr: conn.peer_addr(),
        }
    }
}

/// Receives connection status notifications.
pub trait StatusNotifier: Send + Sync + 'static {
    /// Called once per event. Must not block.
    fn notify(&self, status: ConnectionStatus);
}

impl<T: StatusNotifier + ?Sized> StatusNotifier for Arc<T> {
    fn notify(&self, status: ConnectionStatus) {
        (**self).notify(status)
    }
}
