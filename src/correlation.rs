//! Request/reply correlation.
//!
//! A [`PendingExchange`] is the bookkeeping for one request awaiting exactly one reply. It is registered in one of
//! the two [`CorrelationTable`]s held by [`Correlations`] (by compiled connection id or by correlator string) before
//! the request is written, and it is taken out again by whichever comes first: the reply arriving on the wire, the
//! connection closing, or the timeout sweep. Taking consumes the exchange, so its reply conduit fires at most once.

use std::{
    collections::HashMap,
    fmt,
    hash::Hash,
    sync::{Mutex, MutexGuard, PoisonError},
    time::{Duration, Instant},
};

use bytes::Bytes;
use tokio::sync::oneshot;
use tracing::{error, warn};

use crate::error::{CorrelationError, ReplyError};

/// What a waiting caller eventually receives.
pub type ReplyResult = Result<Bytes, ReplyError>;

/// An in-flight request awaiting its reply.
pub struct PendingExchange {
    request: Bytes,
    correlator: Option<String>,
    conn: Option<u64>,
    sent_at: Instant,
    deadline: Option<Instant>,
    non_locking: bool,
    reply: oneshot::Sender<ReplyResult>,
}

impl PendingExchange {
    /// Creates an exchange for `request`, returning the receiving end of its reply conduit.
    ///
    /// With a `timeout` the exchange is eligible for the periodic sweep unless it is marked non-locking; without one
    /// it only completes through a reply or the closing of its connection.
    pub fn new(request: Bytes, timeout: Option<Duration>) -> (Self, ReplyReceiver) {
        let (tx, rx) = oneshot::channel();
        let sent_at = Instant::now();
        let exchange = PendingExchange {
            request,
            correlator: None,
            conn: None,
            sent_at,
            deadline: timeout.map(|timeout| sent_at + timeout),
            non_locking: false,
            reply: tx,
        };
        (exchange, ReplyReceiver { rx, done: false })
    }

    /// Sets the correlator the reply will carry.
    pub fn with_correlator(mut self, correlator: impl Into<String>) -> Self {
        self.correlator = Some(correlator.into());
        self
    }

    /// Sets the connection the request was written to.
    pub fn with_connection(mut self, compiled: u64) -> Self {
        self.conn = Some(compiled);
        self
    }

    /// Marks the owning connection as already serialized by its own handler. The sweep leaves such exchanges to
    /// the task waiting on them.
    pub fn with_non_locking(mut self, non_locking: bool) -> Self {
        self.non_locking = non_locking;
        self
    }

    /// The request payload.
    pub fn request(&self) -> &Bytes {
        &self.request
    }

    /// The correlator, if any.
    pub fn correlator(&self) -> Option<&str> {
        self.correlator.as_deref()
    }

    /// Compiled id of the connection carrying the exchange.
    pub fn connection(&self) -> Option<u64> {
        self.conn
    }

    /// When the exchange was created.
    pub fn sent_at(&self) -> Instant {
        self.sent_at
    }

    /// Whether the owning connection is serialized by its handler.
    pub fn is_non_locking(&self) -> bool {
        self.non_locking
    }

    /// Returns `true` if the exchange has a deadline that lies at or before `now`.
    pub fn is_expired(&self, now: Instant) -> bool {
        self.deadline.is_some_and(|deadline| deadline <= now)
    }

    /// Completes the exchange. Returns `false` if the waiter has gone away.
    pub fn deliver(self, result: ReplyResult) -> bool {
        self.reply.send(result).is_ok()
    }
}

impl fmt::Debug for PendingExchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PendingExchange")
            .field("request_len", &self.request.len())
            .field("correlator", &self.correlator)
            .field("conn", &self.conn)
            .field("sent_at", &self.sent_at)
            .field("deadline", &self.deadline)
            .field("non_locking", &self.non_locking)
            .finish()
    }
}

/// Receiving end of a pending exchange's reply conduit.
#[derive(Debug)]
pub struct ReplyReceiver {
    rx: oneshot::Receiver<ReplyResult>,
    done: bool,
}

impl ReplyReceiver {
    /// Waits for the reply. A dropped exchange reads as [`ReplyError::ConnectionClosed`].
    ///
    /// Cancel safe: a wait abandoned before it completed can be resumed by calling `recv` again. Once a result has
    /// been returned, further calls return [`ReplyError::ConnectionClosed`].
    pub async fn recv(&mut self) -> ReplyResult {
        if self.done {
            return Err(ReplyError::ConnectionClosed);
        }
        let result = (&mut self.rx).await;
        self.done = true;
        result?
    }
}

/// A map from correlation key to the exchange waiting under it.
#[derive(Debug)]
pub struct CorrelationTable<K> {
    name: &'static str,
    entries: Mutex<HashMap<K, PendingExchange>>,
}

impl<K> CorrelationTable<K>
where
    K: Hash + Eq + Clone + fmt::Display,
{
    /// Creates an empty table. The name only appears in logs.
    pub fn new(name: &'static str) -> Self {
        CorrelationTable {
            name,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<K, PendingExchange>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Registers an exchange under `key`.
    ///
    /// Keys are allocated uniquely by their owners, so an occupied key is a bug. The new exchange is dropped, which
    /// its waiter observes as a closed conduit.
    pub fn register(&self, key: K, exchange: PendingExchange) -> Result<(), CorrelationError> {
        let mut entries = self.lock();
        if entries.contains_key(&key) {
            error!(table = self.name, %key, "correlation key registered twice");
            return Err(CorrelationError::DuplicateKey(key.to_string()));
        }
        entries.insert(key, exchange);
        Ok(())
    }

    /// Removes and returns the exchange under `key`.
    pub fn take(&self, key: &K) -> Option<PendingExchange> {
        self.lock().remove(key)
    }

    /// Returns `true` if an exchange waits under `key`.
    pub fn contains(&self, key: &K) -> bool {
        self.lock().contains_key(key)
    }

    /// Number of waiting exchanges.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    /// Returns `true` if nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes every exchange whose deadline has passed, except non-locking ones.
    pub fn take_expired(&self, now: Instant) -> Vec<(K, PendingExchange)> {
        let mut entries = self.lock();
        let keys: Vec<K> = entries
            .iter()
            .filter(|(_, exchange)| !exchange.is_non_locking() && exchange.is_expired(now))
            .map(|(key, _)| key.clone())
            .collect();
        keys.into_iter()
            .filter_map(|key| entries.remove(&key).map(|exchange| (key, exchange)))
            .collect()
    }
}

/// The two correlation tables.
#[derive(Debug)]
pub struct Correlations {
    /// Exchanges keyed by the compiled id of the connection expected to reply.
    pub by_conn: CorrelationTable<u64>,
    /// Exchanges keyed by correlator string.
    pub by_correlator: CorrelationTable<String>,
}

impl Default for Correlations {
    fn default() -> Self {
        Correlations {
            by_conn: CorrelationTable::new("connection"),
            by_correlator: CorrelationTable::new("correlator"),
        }
    }
}

impl Correlations {
    /// Creates empty tables.
    pub fn new() -> Self {
        Self::default()
    }

    /// Expires overdue exchanges in both tables, delivering [`ReplyError::Timeout`] to each.
    ///
    /// Returns the number of exchanges expired.
    pub fn sweep(&self, now: Instant) -> usize {
        let by_conn = self.by_conn.take_expired(now);
        let by_correlator = self.by_correlator.take_expired(now);
        let count = by_conn.len() + by_correlator.len();

        for (key, exchange) in by_conn {
            warn!(
                compiled = key,
                len = exchange.request().len(),
                waited = ?now.saturating_duration_since(exchange.sent_at()),
                "reply timed out"
            );
            exchange.deliver(Err(ReplyError::Timeout));
        }
        for (key, exchange) in by_correlator {
            warn!(
                correlator = %key,
                conn = ?exchange.connection(),
                len = exchange.request().len(),
                waited = ?now.saturating_duration_since(exchange.sent_at()),
                "reply timed out"
            );
            exchange.deliver(Err(ReplyError::Timeout));
        }
        count
    }

    /// Fails the exchange waiting for a reply on connection `compiled` with [`ReplyError::ConnectionClosed`].
    ///
    /// Correlator-keyed exchanges are left alone: their reply may still arrive on another connection, and the sweep
    /// bounds them otherwise. Returns `true` if an exchange was failed.
    pub fn fail_connection(&self, compiled: u64) -> bool {
        match self.by_conn.take(&compiled) {
            Some(exchange) => {
                exchange.deliver(Err(ReplyError::ConnectionClosed));
                true
            }
            None => false,
        }
    }
}
