use std::net::SocketAddr;
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::time::sleep;
use tracing::info;

use crate::connection::Connection;

/// Poll interval while waiting for a UID to be announced by some peer.
const UID_POLL_INTERVAL: Duration = Duration::from_millis(50);
/// Poll interval while waiting for any connection at all.
const ANY_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// The addressing layer: connections keyed by peer address, plus the UID
/// bindings learned from identity handshakes. Holding UID -> address rather
/// than UID -> connection keeps teardown simple - removing a connection walks
/// the UID map by value, which is fine at the expected fleet sizes.
///
/// Both maps live under one lock, so readers never observe a half-updated
/// pair. The lock is only ever held for map operations, never across I/O.
pub struct Registry {
    inner: RwLock<Maps>,
}

#[derive(Default)]
struct Maps {
    conns: FxHashMap<SocketAddr, Arc<Connection>>,
    uids: FxHashMap<String, SocketAddr>,
}

impl Registry {
    pub fn new() -> Registry {
        Registry {
            inner: RwLock::new(Maps::default()),
        }
    }

    /// Keyed by the peer address; an existing connection under the same key is
    /// replaced.
    pub fn insert(&self, conn: Arc<Connection>) {
        self.write().conns.insert(conn.remote_addr, conn);
    }

    /// Records which address a UID currently lives at. Re-binding an already
    /// known UID overwrites the previous address.
    pub fn bind_uid(&self, uid: impl Into<String>, addr: SocketAddr) {
        let uid = uid.into();
        info!(%uid, peer = %addr, "peer identified");
        self.write().uids.insert(uid, addr);
    }

    pub fn lookup(&self, addr: SocketAddr) -> Option<Arc<Connection>> {
        self.read().conns.get(&addr).cloned()
    }

    /// Waiting lookup: polls until the UID is bound *and* the bound address
    /// has a live connection. Callers that must not wait forever wrap this in
    /// a timeout.
    pub async fn lookup_by_uid(&self, uid: &str) -> Arc<Connection> {
        loop {
            {
                let maps = self.read();
                if let Some(conn) = maps.uids.get(uid).and_then(|addr| maps.conns.get(addr)) {
                    return conn.clone();
                }
            }
            sleep(UID_POLL_INTERVAL).await;
        }
    }

    /// Returns some live connection, waiting until at least one exists.
    pub async fn pick_any(&self) -> Arc<Connection> {
        loop {
            if let Some(conn) = self.read().conns.values().next() {
                return conn.clone();
            }
            sleep(ANY_POLL_INTERVAL).await;
        }
    }

    /// Removes the connection and, by value scan, the UID bound to its
    /// address. Returns false if the address was not registered (the sibling
    /// worker already tore the connection down).
    pub fn remove(&self, addr: SocketAddr) -> bool {
        let mut maps = self.write();
        if maps.conns.remove(&addr).is_none() {
            return false;
        }
        if let Some(uid) = maps.uids.iter().find(|(_, a)| **a == addr).map(|(uid, _)| uid.clone()) {
            maps.uids.remove(&uid);
            info!(%uid, peer = %addr, "lost connection to peer");
        }
        true
    }

    /// Number of peers whose identity is known.
    pub fn node_count(&self) -> usize {
        self.read().uids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.read().conns.is_empty()
    }

    /// Closes every registered connection; their workers deregister them as
    /// they exit.
    pub fn close_all(&self) {
        for conn in self.read().conns.values() {
            conn.close();
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Maps> {
        self.inner.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Maps> {
        self.inner.write().unwrap_or_else(PoisonError::into_inner)
    }
}
