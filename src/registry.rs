//! Registry of live connections, indexed by slot and by compiled id.

use std::{
    collections::{BTreeMap, BTreeSet, HashMap},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::{SystemTime, UNIX_EPOCH},
};

use crate::{connection::Connection, error::RegistryError, id::ConnId};

/// Owns the set of live connections.
///
/// Slots are allocated first, then registered once the socket is up, so that a dial in progress holds its slot.
/// Every operation runs under one registry-wide lock and lookups hand out shared [`Arc`] references.
#[derive(Debug)]
pub struct ConnectionRegistry {
    max_connections: u32,
    inner: Mutex<Inner>,
}

#[derive(Debug, Default)]
struct Inner {
    by_slot: BTreeMap<u32, Arc<Connection>>,
    by_compiled: HashMap<u64, Arc<Connection>>,
    reserved: BTreeSet<u32>,
    last_stamp: u64,
    cursor: usize,
}

impl Inner {
    // Seconds since the epoch, forced strictly increasing so a reused slot never repeats a compiled id.
    fn next_stamp(&mut self) -> u64 {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        self.last_stamp = now.max(self.last_stamp + 1);
        self.last_stamp
    }
}

impl ConnectionRegistry {
    /// Creates an empty registry holding at most `max_connections` connections.
    pub fn new(max_connections: u32) -> Self {
        ConnectionRegistry {
            max_connections: max_connections.min(ConnId::MAX_SLOT),
            inner: Mutex::new(Inner::default()),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Configured maximum.
    pub fn max_connections(&self) -> u32 {
        self.max_connections
    }

    /// Reserves the lowest free slot and stamps a new id for it.
    pub fn allocate(&self) -> Result<ConnId, RegistryError> {
        let mut inner = self.lock();
        let slot = (1..=self.max_connections)
            .find(|slot| !inner.by_slot.contains_key(slot) && !inner.reserved.contains(slot))
            .ok_or(RegistryError::NoCapacity {
                max: self.max_connections,
            })?;
        let stamp = inner.next_stamp();
        inner.reserved.insert(slot);
        Ok(ConnId::new(slot, stamp))
    }

    /// Returns an allocated slot that never got a connection.
    pub fn release(&self, id: ConnId) {
        self.lock().reserved.remove(&id.slot());
    }

    /// Registers a connection under both its slot and its compiled id.
    pub fn register(&self, conn: Arc<Connection>) -> Result<(), RegistryError> {
        let id = conn.id();
        let mut inner = self.lock();
        if !inner.reserved.remove(&id.slot()) {
            return Err(RegistryError::NotAllocated(id.slot()));
        }
        inner.by_compiled.insert(id.compiled(), conn.clone());
        inner.by_slot.insert(id.slot(), conn);
        Ok(())
    }

    /// Looks a connection up by compiled id.
    pub fn get(&self, compiled: u64) -> Option<Arc<Connection>> {
        self.lock().by_compiled.get(&compiled).cloned()
    }

    /// Looks a connection up by slot.
    pub fn get_by_slot(&self, slot: u32) -> Option<Arc<Connection>> {
        self.lock().by_slot.get(&slot).cloned()
    }

    /// Removes a connection from both indices.
    ///
    /// The slot entry is only removed if it still belongs to `conn`, so a late removal cannot evict a successor.
    pub fn remove(&self, conn: &Connection) -> bool {
        let id = conn.id();
        let mut inner = self.lock();
        let removed = inner.by_compiled.remove(&id.compiled()).is_some();
        if inner
            .by_slot
            .get(&id.slot())
            .is_some_and(|current| current.id() == id)
        {
            inner.by_slot.remove(&id.slot());
        }
        removed
    }

    /// Picks the next open connection in round-robin order.
    pub fn next_open(&self) -> Option<Arc<Connection>> {
        let mut inner = self.lock();
        let open: Vec<_> = inner
            .by_slot
            .values()
            .filter(|conn| conn.is_open())
            .cloned()
            .collect();
        if open.is_empty() {
            return None;
        }
        if inner.cursor >= open.len() {
            inner.cursor = 0;
        }
        let conn = open[inner.cursor].clone();
        inner.cursor += 1;
        Some(conn)
    }

    /// Number of registered connections.
    pub fn len(&self) -> usize {
        self.lock().by_slot.len()
    }

    /// Returns `true` if no connection is registered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of slots neither registered nor reserved.
    pub fn free_slots(&self) -> u32 {
        let inner = self.lock();
        let used = (inner.by_slot.len() + inner.reserved.len()) as u32;
        self.max_connections.saturating_sub(used)
    }

    /// Snapshot of all registered connections in slot order.
    pub fn connections(&self) -> Vec<Arc<Connection>> {
        self.lock().by_slot.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use std::net::SocketAddr;

    use tokio::sync::mpsc;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::{config::Role, connection::Outbound};

    fn connect(
        registry: &ConnectionRegistry,
    ) -> (Arc<Connection>, mpsc::Receiver<Outbound>) {
        let id = registry.allocate().unwrap();
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let (conn, rx) =
            Connection::new(id, Role::Passive, addr, addr, 1, CancellationToken::new());
        registry.register(conn.clone()).unwrap();
        (conn, rx)
    }

    #[test]
    fn allocates_lowest_free_slot() {
        let registry = ConnectionRegistry::new(3);
        let (a, _a) = connect(&registry);
        let (b, _b) = connect(&registry);
        assert_eq!(a.id().slot(), 1);
        assert_eq!(b.id().slot(), 2);

        registry.remove(&a);
        let (c, _c) = connect(&registry);
        assert_eq!(c.id().slot(), 1);
        assert!(registry.get(a.compiled_id()).is_none());
        assert_eq!(registry.get(c.compiled_id()).unwrap().id(), c.id());
        assert_eq!(registry.get_by_slot(2).unwrap().id(), b.id());
    }

    #[test]
    fn reports_no_capacity() {
        let registry = ConnectionRegistry::new(2);
        let first = registry.allocate().unwrap();
        registry.allocate().unwrap();
        assert_eq!(
            registry.allocate(),
            Err(RegistryError::NoCapacity { max: 2 })
        );
        assert_eq!(registry.free_slots(), 0);

        registry.release(first);
        assert_eq!(registry.free_slots(), 1);
        assert_eq!(registry.allocate().unwrap().slot(), 1);
    }

    #[test]
    fn compiled_ids_are_not_reused() {
        let registry = ConnectionRegistry::new(1);
        let mut previous = None;
        for _ in 0..100 {
            let (conn, _rx) = connect(&registry);
            assert_eq!(conn.id().slot(), 1);
            assert_ne!(Some(conn.compiled_id()), previous);
            previous = Some(conn.compiled_id());
            assert!(registry.remove(&conn));
        }
    }

    #[test]
    fn stale_remove_keeps_successor() {
        let registry = ConnectionRegistry::new(1);
        let (old, _old) = connect(&registry);
        registry.remove(&old);
        let (new, _new) = connect(&registry);

        assert!(!registry.remove(&old));
        assert_eq!(registry.get_by_slot(1).unwrap().id(), new.id());
    }

    #[test]
    fn register_requires_allocation() {
        let registry = ConnectionRegistry::new(2);
        let addr: SocketAddr = "127.0.0.1:9".parse().unwrap();
        let (conn, _rx) = Connection::new(
            ConnId::new(2, 5),
            Role::Active,
            addr,
            addr,
            1,
            CancellationToken::new(),
        );
        assert_eq!(
            registry.register(conn),
            Err(RegistryError::NotAllocated(2))
        );
    }

    #[test]
    fn round_robin_skips_closed_and_wraps() {
        let registry = ConnectionRegistry::new(3);
        let (a, _a) = connect(&registry);
        let (b, _b) = connect(&registry);
        let (c, _c) = connect(&registry);

        let picks: Vec<_> = (0..4)
            .map(|_| registry.next_open().unwrap().id().slot())
            .collect();
        assert_eq!(picks, vec![1, 2, 3, 1]);

        b.begin_closing();
        let picks: Vec<_> = (0..3)
            .map(|_| registry.next_open().unwrap().id().slot())
            .collect();
        assert_eq!(picks, vec![3, 1, 3]);

        a.begin_closing();
        c.begin_closing();
        assert!(registry.next_open().is_none());
    }
}
