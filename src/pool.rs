//! A fixed-size pool of bus sessions.
//!
//! The gateway keeps two [`SessionPool`]s, one for network-originated requests and one for bus-originated sends. A
//! session is handed out as a [`SessionLease`] which owns it for as long as the lease lives. Dropping the lease puts
//! the session back and wakes one waiter, so a slot index is in use by at most one holder at a time.
//!
//! # Example
//!
//! ```
//! use busgate::pool::SessionPool;
//!
//! # tokio_test::block_on(async {
//! let pool = SessionPool::new("inbound", 2, |index| Ok::<_, busgate::error::BusError>(format!("session-{index}")))?;
//!
//! let lease = pool.acquire().await?;
//! assert_eq!(*lease, "session-0");
//! assert_eq!(pool.available(), 1);
//!
//! drop(lease);
//! assert_eq!(pool.available(), 2);
//! # Ok::<(), Box<dyn std::error::Error>>(())
//! # });
//! ```

use std::{
    collections::VecDeque,
    fmt,
    ops::{Deref, DerefMut},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use tokio::sync::Semaphore;
use tracing::trace;

use crate::error::{BusError, GatewayError, GatewayResult};

/// A bounded set of sessions, each leased to one holder at a time.
pub struct SessionPool<S> {
    inner: Arc<PoolInner<S>>,
}

struct PoolInner<S> {
    name: &'static str,
    sessions: Vec<Mutex<Option<S>>>,
    free: Mutex<VecDeque<usize>>,
    permits: Semaphore,
}

impl<S> PoolInner<S> {
    fn free(&self) -> MutexGuard<'_, VecDeque<usize>> {
        self.free.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn session(&self, index: usize) -> MutexGuard<'_, Option<S>> {
        self.sessions[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

impl<S> SessionPool<S> {
    /// Opens `size` sessions with `factory`, which receives each slot index.
    ///
    /// Fails with the first session that cannot be opened.
    pub fn new(
        name: &'static str,
        size: usize,
        mut factory: impl FnMut(usize) -> Result<S, BusError>,
    ) -> Result<Self, BusError> {
        let sessions = (0..size)
            .map(|index| factory(index).map(|session| Mutex::new(Some(session))))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(SessionPool {
            inner: Arc::new(PoolInner {
                name,
                sessions,
                free: Mutex::new((0..size).collect()),
                permits: Semaphore::new(size),
            }),
        })
    }

    /// Number of sessions in the pool.
    pub fn size(&self) -> usize {
        self.inner.sessions.len()
    }

    /// Number of sessions not currently leased.
    pub fn available(&self) -> usize {
        self.inner.permits.available_permits()
    }

    /// Leases a session, waiting until one is free.
    pub async fn acquire(&self) -> GatewayResult<SessionLease<S>> {
        let permit = self
            .inner
            .permits
            .acquire()
            .await
            .map_err(|_| GatewayError::Shutdown)?;
        // The lease returns the permit itself when dropped.
        permit.forget();

        let index = self.inner.free().pop_front().ok_or_else(|| {
            GatewayError::Logic(format!("{} pool has a permit but no free slot", self.inner.name))
        })?;
        let session = self.inner.session(index).take().ok_or_else(|| {
            GatewayError::Logic(format!("{} pool slot {index} is empty", self.inner.name))
        })?;
        trace!(pool = self.inner.name, index, "session leased");

        Ok(SessionLease {
            pool: self.inner.clone(),
            index,
            session: Some(session),
        })
    }
}

impl<S> Clone for SessionPool<S> {
    fn clone(&self) -> Self {
        SessionPool {
            inner: self.inner.clone(),
        }
    }
}

impl<S> fmt::Debug for SessionPool<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionPool")
            .field("name", &self.inner.name)
            .field("size", &self.size())
            .field("available", &self.available())
            .finish()
    }
}

/// Exclusive use of one pooled session.
///
/// Dereferences to the session. The session goes back to its slot when the lease is dropped.
pub struct SessionLease<S> {
    pool: Arc<PoolInner<S>>,
    index: usize,
    session: Option<S>,
}

impl<S> SessionLease<S> {
    /// Slot index of the leased session.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Returns the session to the pool.
    pub fn release(self) {}
}

impl<S> Deref for SessionLease<S> {
    type Target = S;

    fn deref(&self) -> &S {
        self.session
            .as_ref()
            .expect("session is only taken when the lease is dropped")
    }
}

impl<S> DerefMut for SessionLease<S> {
    fn deref_mut(&mut self) -> &mut S {
        self.session
            .as_mut()
            .expect("session is only taken when the lease is dropped")
    }
}

impl<S> Drop for SessionLease<S> {
    fn drop(&mut self) {
        if let Some(session) = self.session.take() {
            *self.pool.session(self.index) = Some(session);
        }
        {
            let mut free = self.pool.free();
            assert!(
                !free.contains(&self.index),
                "{} pool slot {} released twice",
                self.pool.name,
                self.index
            );
            free.push_back(self.index);
        }
        self.pool.permits.add_permits(1);
        trace!(pool = self.pool.name, index = self.index, "session released");
    }
}

impl<S: fmt::Debug> fmt::Debug for SessionLease<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease")
            .field("pool", &self.pool.name)
            .field("index", &self.index)
            .field("session", &self.session)
            .finish()
    }
}
