// src/core/resolver.rs

//! Best-effort lookup of the database a client connection is using, for
//! connections whose handshake or `COM_INIT_DB` was never captured.

use dashmap::{DashMap, DashSet};
use tracing::debug;

/// Maps a client address (`ip:port`) to a database name.
pub trait DbNameResolver: Send + Sync {
    fn lookup(&self, client_addr: &str) -> Option<String>;

    /// Called when a stream learns the database of its connection. Resolvers
    /// that only serve lookups can ignore it.
    fn observe(&self, _client_addr: &str, _db: &str) {}

    /// Called when the connection of `client_addr` is closed. Anything
    /// learned from it no longer applies to a later connection on the same
    /// address.
    fn connection_closed(&self, _client_addr: &str) {}
}

/// A concurrent address → database table shared between workers. Streams
/// publish what they learn; streams that missed the handshake read it back.
///
/// Seeded entries are permanent. Published entries live as long as the
/// connection that published them.
#[derive(Debug, Default)]
pub struct ConnectionWatcher {
    entries: DashMap<String, String>,
    seeded: DashSet<String>,
}

impl ConnectionWatcher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a watcher pre-populated with `(client_addr, db)` pairs.
    pub fn with_entries<I>(entries: I) -> Self
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let watcher = Self::new();
        for (addr, db) in entries {
            watcher.seeded.insert(addr.clone());
            watcher.entries.insert(addr, db);
        }
        watcher
    }

    /// Removes the entry for a client address, returning the database it held.
    pub fn forget(&self, client_addr: &str) -> Option<String> {
        self.entries.remove(client_addr).map(|(_, db)| db)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl DbNameResolver for ConnectionWatcher {
    fn lookup(&self, client_addr: &str) -> Option<String> {
        self.entries.get(client_addr).map(|db| db.value().clone())
    }

    fn observe(&self, client_addr: &str, db: &str) {
        if db.is_empty() {
            return;
        }
        debug!("Watcher recorded database '{}' for client {}", db, client_addr);
        self.entries.insert(client_addr.to_string(), db.to_string());
    }

    fn connection_closed(&self, client_addr: &str) {
        if self.seeded.contains(client_addr) {
            return;
        }
        if let Some(db) = self.forget(client_addr) {
            debug!("Watcher dropped database '{}' of closed client {}", db, client_addr);
        }
    }
}
