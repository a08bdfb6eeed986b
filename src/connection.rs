//! Shared handle to a live TCP connection.

use std::{
    fmt,
    net::SocketAddr,
    sync::{
        atomic::{AtomicU8, Ordering},
        Arc,
    },
    time::Instant,
};

use bytes::Bytes;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::{
    config::Role,
    error::{GatewayError, GatewayResult, ReplyError},
    id::ConnId,
};

/// Lifecycle of a registered connection.
///
/// A dial in progress has no `Connection` yet; it only holds a reserved registry slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    /// Registered and serving traffic.
    Open,
    /// Torn down by its handler; no new work is accepted.
    Closing,
    /// Unregistered and the socket is closed.
    Closed,
}

impl ConnectionState {
    fn from_u8(value: u8) -> Self {
        match value {
            0 => ConnectionState::Open,
            1 => ConnectionState::Closing,
            _ => ConnectionState::Closed,
        }
    }
}

/// A message queued for writing by the connection's handler task.
#[derive(Debug)]
pub(crate) struct Outbound {
    pub(crate) message: Bytes,
    /// Close the connection once this message has been written.
    pub(crate) close_after: bool,
    pub(crate) written: Option<oneshot::Sender<GatewayResult<()>>>,
}

/// A registered connection.
///
/// The handler task owns the socket; this handle is what the registry, the sequencer and the bus-facing API hold.
/// Writes go through the bounded outbound queue so that only the handler ever touches the write half.
pub struct Connection {
    id: ConnId,
    role: Role,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
    state: AtomicU8,
    outbound: mpsc::Sender<Outbound>,
    shutdown: CancellationToken,
    connected_at: Instant,
}

impl Connection {
    pub(crate) fn new(
        id: ConnId,
        role: Role,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
        queue_len: usize,
        shutdown: CancellationToken,
    ) -> (Arc<Self>, mpsc::Receiver<Outbound>) {
        let (outbound, outbound_rx) = mpsc::channel(queue_len);
        let conn = Connection {
            id,
            role,
            local_addr,
            peer_addr,
            state: AtomicU8::new(ConnectionState::Open as u8),
            outbound,
            shutdown,
            connected_at: Instant::now(),
        };
        (Arc::new(conn), outbound_rx)
    }

    /// The connection's identity.
    pub fn id(&self) -> ConnId {
        self.id
    }

    /// Shorthand for `self.id().compiled()`.
    pub fn compiled_id(&self) -> u64 {
        self.id.compiled()
    }

    /// Whether the connection was dialed or accepted.
    pub fn role(&self) -> Role {
        self.role
    }

    /// Local socket address.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Remote socket address.
    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    /// When the connection was established.
    pub fn connected_at(&self) -> Instant {
        self.connected_at
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Returns `true` until the handler starts closing the connection.
    pub fn is_open(&self) -> bool {
        self.state() == ConnectionState::Open
    }

    /// Moves the connection to `Closing`, returning whether it was open.
    pub(crate) fn begin_closing(&self) -> bool {
        self.state
            .compare_exchange(
                ConnectionState::Open as u8,
                ConnectionState::Closing as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
    }

    pub(crate) fn mark_closed(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }

    /// Asks the handler to close the connection.
    pub fn shutdown(&self) {
        self.shutdown.cancel();
    }

    pub(crate) fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    /// Writes a message and waits until the handler has put it on the wire.
    pub async fn send(&self, message: Bytes) -> GatewayResult<()> {
        self.send_inner(message, false).await
    }

    /// Writes a message, waits for the write, and closes the connection afterwards.
    pub async fn send_and_close(&self, message: Bytes) -> GatewayResult<()> {
        self.send_inner(message, true).await
    }

    async fn send_inner(&self, message: Bytes, close_after: bool) -> GatewayResult<()> {
        if !self.is_open() {
            return Err(ReplyError::ConnectionClosed.into());
        }
        let (tx, rx) = oneshot::channel();
        self.outbound
            .send(Outbound {
                message,
                close_after,
                written: Some(tx),
            })
            .await
            .map_err(|_| GatewayError::from(ReplyError::ConnectionClosed))?;
        rx.await.map_err(ReplyError::from)?
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("role", &self.role)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .field("state", &self.state())
            .finish()
    }
}
