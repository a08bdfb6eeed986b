//! The gateway instance.
//!
//! A [`Gateway`] is started from a [`GatewayConfig`] and a [`ServiceBus`]. In passive mode it accepts connections on
//! the configured address; in active mode the periodic supervisor keeps the configured number of connections
//! dialed. Each registered connection is served by its own handler task. The bus side sends to the network through
//! [`Gateway::send`].
//!
//! # Example
//!
//! ```no_run
//! use busgate::{GatewayConfig, Gateway, OutboundRequest, ReplyMode, Role};
//! # use busgate::{bus::{BusRecord, ServiceBus}, error::BusError};
//! # use futures::future::BoxFuture;
//! # use std::time::Duration;
//! # struct MyBus;
//! # impl ServiceBus for MyBus {
//! #     type Session = ();
//! #     fn open_session(&self, _slot: usize) -> Result<(), BusError> { Ok(()) }
//! #     fn call<'a>(&'a self, _: &'a mut (), _: &'a str, record: BusRecord, _: Duration) -> BoxFuture<'a, Result<BusRecord, BusError>> { Box::pin(async move { Ok(record) }) }
//! #     fn post<'a>(&'a self, _: &'a mut (), _: &'a str, _: BusRecord) -> BoxFuture<'a, Result<(), BusError>> { Box::pin(async { Ok(()) }) }
//! # }
//!
//! # tokio_test::block_on(async {
//! let config = GatewayConfig::new(Role::Active, "10.0.0.7:9000")
//!     .with_framing("bb")
//!     .with_max_connections(4)
//!     .with_reply_mode(ReplyMode::PersistentSingleExchange);
//! let gateway = Gateway::builder(config, MyBus).start().await?;
//!
//! let reply = gateway.send(OutboundRequest::any("PING")).await?;
//! println!("{reply:?}");
//!
//! gateway.shutdown().await;
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

use std::{
    fmt, io,
    net::SocketAddr,
    sync::{Arc, Mutex, PoisonError},
};

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use tokio::{
    net::{TcpListener, TcpStream},
    sync::oneshot,
    time,
};
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, error, info, warn};

use crate::{
    bus::{ConnectionEvent, ConnectionStatus, CorrelatorExtractor, ServiceBus, StatusNotifier},
    config::{GatewayConfig, ReplyMode, Role},
    connection::Connection,
    correlation::{Correlations, PendingExchange, ReplyReceiver},
    error::{GatewayError, GatewayResult, ReplyError},
    framing::FramingConfig,
    handler,
    id::ConnId,
    pool::{SessionLease, SessionPool},
    registry::ConnectionRegistry,
    sequencer::OutboundSequencer,
    supervisor::{self, TickReport},
};

/// Where a bus-originated message goes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Target {
    /// The connection with this compiled id.
    Connection(u64),
    /// Whichever connection currently occupies this slot.
    Slot(u32),
    /// Any open connection, picked round-robin. In bus-to-net mode, a newly dialed connection.
    Any,
}

/// A message from the bus to the network.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutboundRequest {
    /// Destination.
    pub target: Target,
    /// Payload to frame and write.
    pub payload: Bytes,
    /// Correlator the network reply will carry, in correlated mode.
    pub correlator: Option<String>,
}

impl OutboundRequest {
    /// Sends `payload` to the connection with compiled id `conn`.
    pub fn to_connection(conn: u64, payload: impl Into<Bytes>) -> Self {
        OutboundRequest {
            target: Target::Connection(conn),
            payload: payload.into(),
            correlator: None,
        }
    }

    /// Sends `payload` to the connection in `slot`.
    pub fn to_slot(slot: u32, payload: impl Into<Bytes>) -> Self {
        OutboundRequest {
            target: Target::Slot(slot),
            payload: payload.into(),
            correlator: None,
        }
    }

    /// Sends `payload` to any open connection.
    pub fn any(payload: impl Into<Bytes>) -> Self {
        OutboundRequest {
            target: Target::Any,
            payload: payload.into(),
            correlator: None,
        }
    }

    /// Sets the correlator.
    pub fn with_correlator(mut self, correlator: impl Into<String>) -> Self {
        self.correlator = Some(correlator.into());
        self
    }
}

/// Point-in-time counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GatewayStats {
    /// Registered connections.
    pub connections: usize,
    /// Slots neither registered nor being dialed.
    pub free_slots: u32,
    /// Exchanges waiting for a reply by connection.
    pub pending_by_connection: usize,
    /// Exchanges waiting for a reply by correlator.
    pub pending_by_correlator: usize,
    /// Idle inbound sessions.
    pub inbound_available: usize,
    /// Idle outbound sessions.
    pub outbound_available: usize,
    /// Bus-originated sends queued or in flight.
    pub outbound_backlog: usize,
}

/// How far a sequenced send got before its lane moved on.
enum Delivery {
    Written,
    Replied(Bytes),
    Awaiting(ReplyReceiver),
}

/// State shared by the gateway handle and all of its tasks.
pub(crate) struct Shared<B: ServiceBus> {
    pub(crate) config: GatewayConfig,
    pub(crate) framing: FramingConfig,
    pub(crate) bus: B,
    pub(crate) registry: ConnectionRegistry,
    pub(crate) correlations: Correlations,
    pub(crate) inbound: SessionPool<B::Session>,
    pub(crate) outbound: SessionPool<B::Session>,
    pub(crate) sequencer: Arc<OutboundSequencer<SessionLease<B::Session>>>,
    pub(crate) extractor: Option<Arc<dyn CorrelatorExtractor>>,
    pub(crate) notifier: Option<Arc<dyn StatusNotifier>>,
    pub(crate) shutdown: CancellationToken,
    pub(crate) tasks: TaskTracker,
    fatal: Mutex<Option<String>>,
}

impl<B: ServiceBus> Shared<B> {
    pub(crate) fn notify(&self, event: ConnectionEvent, conn: &Connection) {
        if let Some(notifier) = &self.notifier {
            notifier.notify(ConnectionStatus::new(event, &self.config.name, conn));
        }
    }

    /// Records a condition that requires the whole gateway to stop. The supervisor acts on it at its next tick.
    pub(crate) fn flag_fatal(&self, reason: impl Into<String>) {
        let reason = reason.into();
        error!(gateway = %self.config.name, %reason, "fatal condition");
        let mut fatal = self.fatal.lock().unwrap_or_else(PoisonError::into_inner);
        if fatal.is_none() {
            *fatal = Some(reason);
        }
    }

    pub(crate) fn fatal_reason(&self) -> Option<String> {
        self.fatal
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Registers a connected socket and spawns its handler.
    pub(crate) fn start_connection(
        self: &Arc<Self>,
        id: ConnId,
        role: Role,
        stream: TcpStream,
    ) -> GatewayResult<Arc<Connection>> {
        let addrs = stream
            .local_addr()
            .and_then(|local| Ok((local, stream.peer_addr()?)));
        let (local_addr, peer_addr) = match addrs {
            Ok(addrs) => addrs,
            Err(err) => {
                self.registry.release(id);
                return Err(err.into());
            }
        };
        if let Err(err) = stream.set_nodelay(true) {
            debug!(%id, error = %err, "failed to set TCP_NODELAY");
        }

        let (conn, outbound_rx) = Connection::new(
            id,
            role,
            local_addr,
            peer_addr,
            self.config.outbound_queue_len,
            self.shutdown.child_token(),
        );
        if let Err(err) = self.registry.register(conn.clone()) {
            self.registry.release(id);
            return Err(err.into());
        }
        info!(conn = %id, compiled = id.compiled(), %peer_addr, role = ?role, "connection established");
        self.notify(ConnectionEvent::Established, &conn);

        let shared = self.clone();
        let handler_conn = conn.clone();
        self.tasks
            .spawn(async move { handler::run(shared, handler_conn, stream, outbound_rx).await });
        Ok(conn)
    }

    /// Dials the configured address on a newly allocated slot.
    pub(crate) async fn dial(self: &Arc<Self>) -> GatewayResult<Arc<Connection>> {
        let id = self.registry.allocate()?;
        self.dial_slot(id).await
    }

    /// Dials the configured address on the already reserved slot `id`, releasing it on failure.
    pub(crate) async fn dial_slot(self: &Arc<Self>, id: ConnId) -> GatewayResult<Arc<Connection>> {
        debug!(conn = %id, address = %self.config.address, "dialing");
        let stream = match time::timeout(
            self.config.dial_timeout,
            TcpStream::connect(self.config.address.as_str()),
        )
        .await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(err)) => {
                self.registry.release(id);
                return Err(err.into());
            }
            Err(_) => {
                self.registry.release(id);
                return Err(io::Error::new(io::ErrorKind::TimedOut, "dial timed out").into());
            }
        };
        self.start_connection(id, Role::Active, stream)
    }

    pub(crate) async fn accept_loop(self: Arc<Self>, listener: TcpListener) {
        loop {
            let accepted = tokio::select! {
                _ = self.shutdown.cancelled() => break,
                accepted = listener.accept() => accepted,
            };
            match accepted {
                Ok((stream, peer_addr)) => match self.registry.allocate() {
                    Ok(id) => {
                        if let Err(err) = self.start_connection(id, Role::Passive, stream) {
                            warn!(%peer_addr, error = %err, "failed to register accepted connection");
                        }
                    }
                    Err(err) => {
                        warn!(%peer_addr, error = %err, "rejecting connection");
                    }
                },
                Err(err) => {
                    self.flag_fatal(format!("accept failed: {err}"));
                    break;
                }
            }
        }
        debug!(gateway = %self.config.name, "accept loop stopped");
    }

    async fn send(self: &Arc<Self>, request: OutboundRequest) -> GatewayResult<Option<Bytes>> {
        if self.shutdown.is_cancelled() {
            return Err(GatewayError::Shutdown);
        }
        let mode = self.config.reply_mode;
        let lease = self.outbound.acquire().await?;

        let conn = match (mode, request.target) {
            (ReplyMode::BusToNet, Target::Any) => self.dial().await?,
            (ReplyMode::BusToNet, Target::Connection(_) | Target::Slot(_)) => {
                return Err(GatewayError::Unsupported(
                    "bus-to-net sends always open a new connection",
                ))
            }
            (_, Target::Connection(compiled)) => self
                .registry
                .get(compiled)
                .ok_or(GatewayError::UnknownConnection(compiled))?,
            (_, Target::Slot(slot)) => self
                .registry
                .get_by_slot(slot)
                .ok_or(GatewayError::UnknownSlot(slot))?,
            (_, Target::Any) => self.registry.next_open().ok_or(GatewayError::NoConnection)?,
        };

        let correlator = match (mode, request.correlator) {
            (ReplyMode::PersistentCorrelated, None) => {
                let extracted = match &self.extractor {
                    Some(extractor) => extractor.extract(&request.payload).await,
                    None => None,
                };
                Some(extracted.ok_or(GatewayError::Unsupported(
                    "correlated sends need a correlator",
                ))?)
            }
            (_, correlator) => correlator,
        };

        let (tx, rx) = oneshot::channel();
        let job = {
            let shared = self.clone();
            let conn = conn.clone();
            let payload = request.payload;
            async move {
                let result = shared.deliver_outbound(&conn, payload, correlator).await;
                let _ = tx.send(result);
            }
        };
        self.sequencer.enqueue(conn.compiled_id(), lease, job).await?;
        match rx
            .await
            .map_err(|_| GatewayError::from(ReplyError::ConnectionClosed))??
        {
            Delivery::Written => Ok(None),
            Delivery::Replied(reply) => Ok(Some(reply)),
            Delivery::Awaiting(mut reply) => Ok(Some(reply.recv().await?)),
        }
    }

    // Runs inside the connection's sequencer lane, so at most one of these is active per connection.
    async fn deliver_outbound(
        &self,
        conn: &Connection,
        payload: Bytes,
        correlator: Option<String>,
    ) -> GatewayResult<Delivery> {
        let compiled = conn.compiled_id();
        let reply_timeout = self.config.reply_timeout;

        match self.config.reply_mode {
            ReplyMode::Async | ReplyMode::NetToBus => {
                conn.send(payload).await?;
                Ok(Delivery::Written)
            }
            ReplyMode::PersistentCorrelated => {
                let correlator = correlator.ok_or(GatewayError::Unsupported(
                    "correlated sends need a correlator",
                ))?;
                let (exchange, reply) =
                    PendingExchange::new(payload.clone(), Some(reply_timeout));
                self.correlations.by_correlator.register(
                    correlator.clone(),
                    exchange
                        .with_correlator(correlator.clone())
                        .with_connection(compiled),
                )?;
                if let Err(err) = conn.send(payload).await {
                    self.correlations.by_correlator.take(&correlator);
                    return Err(err);
                }
                // Replies are matched by correlator, so the lane does not wait for them.
                Ok(Delivery::Awaiting(reply))
            }
            ReplyMode::PersistentSingleExchange => {
                let (exchange, mut reply) =
                    PendingExchange::new(payload.clone(), Some(reply_timeout));
                self.correlations.by_conn.register(
                    compiled,
                    exchange.with_connection(compiled).with_non_locking(true),
                )?;
                if let Err(err) = conn.send(payload).await {
                    self.correlations.by_conn.take(&compiled);
                    return Err(err);
                }
                // Non-locking exchanges are skipped by the sweep; the lane bounds its own wait. A reply that races
                // the timeout still wins if it was taken first.
                let result = match time::timeout(reply_timeout, reply.recv()).await {
                    Ok(result) => result,
                    Err(_) => {
                        if let Some(exchange) = self.correlations.by_conn.take(&compiled) {
                            warn!(
                                conn = %conn.id(),
                                len = exchange.request().len(),
                                "reply timed out"
                            );
                            exchange.deliver(Err(ReplyError::Timeout));
                        }
                        reply.recv().await
                    }
                };
                Ok(Delivery::Replied(result?))
            }
            ReplyMode::BusToNet => {
                let (exchange, mut reply) =
                    PendingExchange::new(payload.clone(), Some(reply_timeout));
                self.correlations
                    .by_conn
                    .register(compiled, exchange.with_connection(compiled))?;
                if let Err(err) = conn.send(payload).await {
                    self.correlations.by_conn.take(&compiled);
                    conn.shutdown();
                    return Err(err);
                }
                let result = reply.recv().await;
                conn.shutdown();
                Ok(Delivery::Replied(result?))
            }
        }
    }

    fn stats(&self) -> GatewayStats {
        GatewayStats {
            connections: self.registry.len(),
            free_slots: self.registry.free_slots(),
            pending_by_connection: self.correlations.by_conn.len(),
            pending_by_correlator: self.correlations.by_correlator.len(),
            inbound_available: self.inbound.available(),
            outbound_available: self.outbound.available(),
            outbound_backlog: self.sequencer.backlog(),
        }
    }
}

/// Configures and starts a [`Gateway`].
pub struct GatewayBuilder<B: ServiceBus> {
    config: GatewayConfig,
    bus: B,
    extractor: Option<Arc<dyn CorrelatorExtractor>>,
    notifier: Option<Arc<dyn StatusNotifier>>,
}

impl<B: ServiceBus> GatewayBuilder<B> {
    /// Sets the correlator extractor used to match network replies in correlated mode.
    pub fn with_extractor(mut self, extractor: impl CorrelatorExtractor) -> Self {
        self.extractor = Some(Arc::new(extractor));
        self
    }

    /// Sets the receiver of connection status notifications.
    pub fn with_notifier(mut self, notifier: impl StatusNotifier) -> Self {
        self.notifier = Some(Arc::new(notifier));
        self
    }

    /// Validates the configuration, opens the bus sessions and starts serving.
    ///
    /// In passive mode the listener is bound before this returns.
    pub async fn start(self) -> GatewayResult<Gateway<B>> {
        let GatewayBuilder {
            config,
            bus,
            extractor,
            notifier,
        } = self;
        config.validate()?;
        let framing = config.framing_config()?;

        let inbound = SessionPool::new("inbound", config.inbound_workers, |slot| {
            bus.open_session(slot)
        })?;
        let outbound = SessionPool::new("outbound", config.outbound_workers, |slot| {
            bus.open_session(config.inbound_workers + slot)
        })?;

        let listener = match config.role {
            Role::Passive => Some(TcpListener::bind(config.address.as_str()).await?),
            Role::Active => None,
        };
        let local_addr = listener
            .as_ref()
            .map(TcpListener::local_addr)
            .transpose()?;

        let tasks = TaskTracker::new();
        let shared = Arc::new(Shared {
            sequencer: Arc::new(OutboundSequencer::new(
                config.outbound_workers,
                tasks.clone(),
            )),
            registry: ConnectionRegistry::new(config.max_connections),
            correlations: Correlations::new(),
            framing,
            bus,
            inbound,
            outbound,
            extractor,
            notifier,
            shutdown: CancellationToken::new(),
            tasks,
            fatal: Mutex::new(None),
            config,
        });

        info!(
            gateway = %shared.config.name,
            role = ?shared.config.role,
            address = %shared.config.address,
            reply_mode = ?shared.config.reply_mode,
            "gateway started"
        );

        if let Some(listener) = listener {
            shared.tasks.spawn(shared.clone().accept_loop(listener));
        }
        shared.tasks.spawn(supervisor::run(shared.clone()));

        Ok(Gateway { shared, local_addr })
    }
}

impl<B: ServiceBus> fmt::Debug for GatewayBuilder<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GatewayBuilder")
            .field("config", &self.config)
            .field("extractor", &self.extractor.is_some())
            .field("notifier", &self.notifier.is_some())
            .finish()
    }
}

/// Handle to a running gateway. Cloning it is cheap.
pub struct Gateway<B: ServiceBus> {
    shared: Arc<Shared<B>>,
    local_addr: Option<SocketAddr>,
}

impl<B: ServiceBus> Gateway<B> {
    /// Starts configuring a gateway.
    pub fn builder(config: GatewayConfig, bus: B) -> GatewayBuilder<B> {
        GatewayBuilder {
            config,
            bus,
            extractor: None,
            notifier: None,
        }
    }

    /// The configuration the gateway runs with.
    pub fn config(&self) -> &GatewayConfig {
        &self.shared.config
    }

    /// The bus the gateway forwards to.
    pub fn bus(&self) -> &B {
        &self.shared.bus
    }

    /// The bound listener address in passive mode.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    /// Sends a message to the network.
    ///
    /// Resolves once the message is written, or with the network reply in the modes that expect one. Sends to the
    /// same connection are written in call order.
    pub async fn send(&self, request: OutboundRequest) -> GatewayResult<Option<Bytes>> {
        self.shared.send(request).await
    }

    /// Dials one additional connection. Only meaningful in active mode.
    pub async fn dial(&self) -> GatewayResult<Arc<Connection>> {
        if self.shared.config.role != Role::Active {
            return Err(GatewayError::Unsupported("passive gateways do not dial"));
        }
        self.shared.dial().await
    }

    /// Looks up a registered connection.
    pub fn connection(&self, compiled: u64) -> Option<Arc<Connection>> {
        self.shared.registry.get(compiled)
    }

    /// Snapshot of all registered connections.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.shared.registry.connections()
    }

    /// Current counters.
    pub fn stats(&self) -> GatewayStats {
        self.shared.stats()
    }

    /// Runs one supervisor tick immediately. Dials it starts complete in the background.
    pub fn tick(&self) -> TickReport {
        supervisor::tick(&self.shared)
    }

    /// Returns `true` once shutdown has started, either requested or after a fatal condition.
    pub fn is_shutting_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }

    /// Waits until the gateway starts shutting down.
    pub async fn stopped(&self) {
        self.shared.shutdown.cancelled().await
    }

    /// Stops accepting and dialing, closes every connection and waits for the tasks to finish.
    ///
    /// Connections get the configured grace period to flush queued writes.
    pub async fn shutdown(&self) {
        info!(gateway = %self.shared.config.name, "shutting down");
        self.shared.shutdown.cancel();
        self.shared.tasks.close();
        let grace = self.shared.config.shutdown_grace * 2;
        if time::timeout(grace, self.shared.tasks.wait()).await.is_err() {
            warn!(gateway = %self.shared.config.name, "tasks still running after shutdown grace");
        }
    }
}

impl<B: ServiceBus> Clone for Gateway<B> {
    fn clone(&self) -> Self {
        Gateway {
            shared: self.shared.clone(),
            local_addr: self.local_addr,
        }
    }
}

impl<B: ServiceBus> fmt::Debug for Gateway<B> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Gateway")
            .field("name", &self.shared.config.name)
            .field("role", &self.shared.config.role)
            .field("local_addr", &self.local_addr)
            .field("stats", &self.stats())
            .finish()
    }
}
