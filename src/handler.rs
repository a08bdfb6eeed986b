//! The per-connection task.
//!
//! Each registered connection runs one handler. A reader task decodes frames from the read half and forwards them;
//! the handler itself owns the write half and multiplexes, in priority order:
//!
//! 1. decoded frames, which are either replies to a pending exchange or fresh requests for the bus,
//! 2. queued outbound messages,
//! 3. the connection's shutdown signal,
//! 4. the keep-alive and idle timers.
//!
//! Frames and replies are handled before shutdown so that a reply that already arrived is still delivered.

use std::{fmt, future, io, sync::Arc};

use bytes::Bytes;
use tokio::{
    io::{AsyncBufRead, AsyncWriteExt, BufReader},
    net::{tcp::OwnedWriteHalf, TcpStream},
    sync::mpsc,
    time::{self, Instant, Interval, MissedTickBehavior},
};
use tracing::{debug, info, trace, warn};

use crate::{
    bus::{BusRecord, ConnectionEvent, ServiceBus},
    connection::{Connection, Outbound},
    error::{BusError, FrameError, GatewayError, ReplyError},
    framing::FramingConfig,
    gateway::Shared,
    id::ConnId,
};

const FRAME_BUFFER: usize = 16;

#[derive(Debug)]
enum CloseReason {
    /// The exchange or message the connection was kept open for is done.
    Completed,
    Shutdown,
    Idle,
    Peer,
    ReadFailed(FrameError),
    WriteFailed(io::Error),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Completed => write!(f, "exchange completed"),
            CloseReason::Shutdown => write!(f, "shutdown"),
            CloseReason::Idle => write!(f, "idle timeout"),
            CloseReason::Peer => write!(f, "closed by peer"),
            CloseReason::ReadFailed(err) => write!(f, "read failed: {err}"),
            CloseReason::WriteFailed(err) => write!(f, "write failed: {err}"),
        }
    }
}

/// What a served inbound request leaves to write.
#[derive(Debug)]
enum InboundOutcome {
    Nothing,
    Reply { message: Bytes, close_after: bool },
    Close,
}

struct Handler<B: ServiceBus> {
    shared: Arc<Shared<B>>,
    conn: Arc<Connection>,
    writer: OwnedWriteHalf,
    outbound: mpsc::Receiver<Outbound>,
    /// Set once a non-persistent connection has dispatched its one request.
    request_taken: bool,
}

/// Serves `conn` over `stream` until it closes, then unregisters it.
pub(crate) async fn run<B: ServiceBus>(
    shared: Arc<Shared<B>>,
    conn: Arc<Connection>,
    stream: TcpStream,
    outbound: mpsc::Receiver<Outbound>,
) {
    let (read_half, writer) = stream.into_split();
    let (frames_tx, frames_rx) = mpsc::channel(FRAME_BUFFER);
    let reader = tokio::spawn(read_frames(
        shared.framing.clone(),
        BufReader::new(read_half),
        frames_tx,
        conn.id(),
    ));

    let mut handler = Handler {
        shared,
        conn,
        writer,
        outbound,
        request_taken: false,
    };
    let reason = handler.serve(frames_rx).await;
    reader.abort();
    handler.close(reason).await;
}

async fn read_frames<R>(
    framing: FramingConfig,
    mut reader: R,
    frames: mpsc::Sender<Result<Bytes, FrameError>>,
    id: ConnId,
) where
    R: AsyncBufRead + Unpin,
{
    loop {
        match framing.decode(&mut reader).await {
            Ok(message) => {
                trace!(conn = %id, len = message.len(), "frame received");
                if frames.send(Ok(message)).await.is_err() {
                    break;
                }
            }
            Err(err) => {
                let _ = frames.send(Err(err)).await;
                break;
            }
        }
    }
}

impl<B: ServiceBus> Handler<B> {
    async fn serve(
        &mut self,
        mut frames: mpsc::Receiver<Result<Bytes, FrameError>>,
    ) -> CloseReason {
        let shutdown = self.conn.shutdown_token().clone();
        let idle_timeout = self.shared.config.idle_timeout;
        let mut keepalive = self.shared.config.keepalive_period.map(|period| {
            let mut interval = time::interval_at(Instant::now() + period, period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            interval
        });
        let mut last_inbound = Instant::now();

        loop {
            let idle_deadline = idle_timeout.map(|timeout| last_inbound + timeout);
            tokio::select! {
                biased;
                frame = frames.recv() => match frame {
                    Some(Ok(message)) => {
                        last_inbound = Instant::now();
                        if self.shared.framing.is_keepalive(&message) {
                            trace!(conn = %self.conn.id(), "keep-alive received");
                            continue;
                        }
                        if let Some(reason) = self.on_message(message).await {
                            return reason;
                        }
                    }
                    Some(Err(FrameError::Eof)) | None => return CloseReason::Peer,
                    Some(Err(err)) => return CloseReason::ReadFailed(err),
                },
                Some(outbound) = self.outbound.recv() => {
                    if let Some(reason) = self.on_outbound(outbound).await {
                        return reason;
                    }
                }
                _ = shutdown.cancelled() => return CloseReason::Shutdown,
                _ = tick(&mut keepalive) => {
                    if let Err(reason) = self.write_keepalive().await {
                        return reason;
                    }
                }
                _ = sleep_until(idle_deadline) => return CloseReason::Idle,
            }
        }
    }

    async fn on_message(&mut self, message: Bytes) -> Option<CloseReason> {
        let shared = self.shared.clone();
        let id = self.conn.id();

        if let Some(exchange) = shared.correlations.by_conn.take(&id.compiled()) {
            trace!(conn = %id, len = message.len(), "reply matched by connection");
            exchange.deliver(Ok(message));
            return (!shared.config.reply_mode.is_persistent()).then_some(CloseReason::Completed);
        }

        let correlator = match &shared.extractor {
            Some(extractor) => extractor.extract(&message).await,
            None => None,
        };
        if let Some(correlator) = &correlator {
            if let Some(exchange) = shared.correlations.by_correlator.take(correlator) {
                trace!(conn = %id, %correlator, "reply matched by correlator");
                exchange.deliver(Ok(message));
                return None;
            }
        }

        self.dispatch_inbound(message, correlator).await
    }

    async fn dispatch_inbound(
        &mut self,
        message: Bytes,
        correlator: Option<String>,
    ) -> Option<CloseReason> {
        if !self.shared.config.reply_mode.is_persistent() {
            if self.request_taken {
                debug!(conn = %self.conn.id(), len = message.len(), "discarding frame after the request");
                return None;
            }
            self.request_taken = true;
        }

        let mut lease = match self.shared.inbound.acquire().await {
            Ok(lease) => lease,
            Err(err) => {
                warn!(conn = %self.conn.id(), error = %err, "no inbound session");
                return Some(CloseReason::Shutdown);
            }
        };

        if self.shared.config.sequential_inbound {
            let outcome =
                serve_inbound(&self.shared, &self.conn, &mut lease, message, correlator).await;
            let reason = self.apply(outcome).await;
            drop(lease);
            return reason;
        }

        let shared = self.shared.clone();
        let conn = self.conn.clone();
        self.shared.tasks.spawn(async move {
            let outcome = serve_inbound(&shared, &conn, &mut lease, message, correlator).await;
            hand_off(&conn, outcome).await;
            drop(lease);
        });
        None
    }

    async fn apply(&mut self, outcome: InboundOutcome) -> Option<CloseReason> {
        match outcome {
            InboundOutcome::Nothing => None,
            InboundOutcome::Close => Some(CloseReason::Completed),
            InboundOutcome::Reply {
                message,
                close_after,
            } => match self.write_frame(&message).await {
                Ok(()) => close_after.then_some(CloseReason::Completed),
                Err(FrameError::Io(err)) => Some(CloseReason::WriteFailed(err)),
                Err(err) => {
                    warn!(conn = %self.conn.id(), error = %err, "dropping unencodable reply");
                    close_after.then_some(CloseReason::Completed)
                }
            },
        }
    }

    async fn on_outbound(&mut self, outbound: Outbound) -> Option<CloseReason> {
        let Outbound {
            message,
            close_after,
            written,
        } = outbound;

        let (ack, reason) = match self.write_frame(&message).await {
            Ok(()) => (Ok(()), close_after.then_some(CloseReason::Completed)),
            Err(FrameError::Io(err)) => (
                Err(GatewayError::Transport(io::Error::new(
                    err.kind(),
                    err.to_string(),
                ))),
                Some(CloseReason::WriteFailed(err)),
            ),
            Err(err) => {
                warn!(conn = %self.conn.id(), error = %err, "rejecting outbound message");
                (Err(err.into()), None)
            }
        };
        if let Some(written) = written {
            let _ = written.send(ack);
        }
        reason
    }

    async fn write_frame(&mut self, message: &[u8]) -> Result<(), FrameError> {
        let frame = self.shared.framing.encode(message)?;
        self.writer.write_all(&frame).await?;
        trace!(conn = %self.conn.id(), len = message.len(), "frame written");
        Ok(())
    }

    async fn write_keepalive(&mut self) -> Result<(), CloseReason> {
        let frame = match self.shared.framing.keepalive_frame() {
            Ok(frame) => frame,
            Err(err) => {
                warn!(conn = %self.conn.id(), error = %err, "cannot encode keep-alive");
                return Ok(());
            }
        };
        self.writer
            .write_all(&frame)
            .await
            .map_err(CloseReason::WriteFailed)?;
        trace!(conn = %self.conn.id(), "keep-alive written");
        Ok(())
    }

    /// Flushes what can still be written within the shutdown grace period.
    async fn flush(&mut self) {
        let deadline = Instant::now() + self.shared.config.shutdown_grace;
        while let Ok(outbound) = self.outbound.try_recv() {
            match time::timeout_at(deadline, self.on_outbound(outbound)).await {
                Ok(Some(CloseReason::WriteFailed(_))) => break,
                Ok(_) => {}
                Err(_) => {
                    warn!(conn = %self.conn.id(), "shutdown grace elapsed with writes pending");
                    break;
                }
            }
        }
    }

    async fn close(mut self, reason: CloseReason) {
        let id = self.conn.id();
        self.conn.begin_closing();
        match &reason {
            CloseReason::ReadFailed(err) => {
                warn!(conn = %id, kind = %err.kind(), error = %err, "closing connection")
            }
            CloseReason::WriteFailed(_) => warn!(conn = %id, %reason, "closing connection"),
            _ => debug!(conn = %id, %reason, "closing connection"),
        }

        self.shared.registry.remove(&self.conn);
        if self.shared.correlations.fail_connection(id.compiled()) {
            debug!(conn = %id, "failed pending exchange");
        }

        if matches!(
            reason,
            CloseReason::Completed | CloseReason::Shutdown | CloseReason::Idle
        ) {
            self.flush().await;
        }
        self.outbound.close();
        while let Ok(outbound) = self.outbound.try_recv() {
            if let Some(written) = outbound.written {
                let _ = written.send(Err(ReplyError::ConnectionClosed.into()));
            }
        }
        if let Err(err) = self.writer.shutdown().await {
            trace!(conn = %id, error = %err, "socket shutdown failed");
        }

        self.conn.mark_closed();
        info!(conn = %id, %reason, uptime = ?self.conn.connected_at().elapsed(), "connection closed");
        self.shared.notify(ConnectionEvent::Closed, &self.conn);
    }
}

async fn serve_inbound<B: ServiceBus>(
    shared: &Shared<B>,
    conn: &Connection,
    session: &mut B::Session,
    message: Bytes,
    correlator: Option<String>,
) -> InboundOutcome {
    let mode = shared.config.reply_mode;
    let service = shared.config.incoming_service.as_str();
    let record =
        BusRecord::for_connection(&shared.config.name, conn, message).with_correlator(correlator);

    if !mode.answers_network_requests() {
        if let Err(err) = shared.bus.post(session, service, record).await {
            warn!(conn = %conn.id(), %service, error = %err, "bus post failed");
        }
        return InboundOutcome::Nothing;
    }

    let close_after = !mode.is_persistent();
    match shared
        .bus
        .call(session, service, record, shared.config.bus_timeout)
        .await
    {
        Ok(reply) => InboundOutcome::Reply {
            message: reply.payload,
            close_after,
        },
        Err(err) => {
            warn!(conn = %conn.id(), %service, error = %err, "bus call failed");
            match err {
                BusError::Service {
                    payload: Some(payload),
                    ..
                } => InboundOutcome::Reply {
                    message: payload,
                    close_after,
                },
                _ if close_after => InboundOutcome::Close,
                _ => InboundOutcome::Nothing,
            }
        }
    }
}

async fn hand_off(conn: &Connection, outcome: InboundOutcome) {
    let result = match outcome {
        InboundOutcome::Nothing => return,
        InboundOutcome::Close => {
            conn.shutdown();
            return;
        }
        InboundOutcome::Reply {
            message,
            close_after: true,
        } => conn.send_and_close(message).await,
        InboundOutcome::Reply {
            message,
            close_after: false,
        } => conn.send(message).await,
    };
    if let Err(err) = result {
        warn!(conn = %conn.id(), error = %err, "failed to write reply");
    }
}

async fn tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => future::pending().await,
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => time::sleep_until(deadline).await,
        None => future::pending().await,
    }
}
