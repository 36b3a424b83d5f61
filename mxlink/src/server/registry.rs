//! Live connections of one connector server.
//!
//! Connections are indexed by identity and by the local port they were
//! accepted on, so a single listening port can be drained without touching
//! the others.
//!
//! Identities of removed connections are remembered (the most recent
//! [`RELEASED_IDS_KEPT`]) so a reconnecting client can be re-associated
//! with the identity it had. Each released identity can be claimed once.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;

use crate::connection::Connection;

/// Released identities kept for re-association.
pub const RELEASED_IDS_KEPT: usize = 1024;

/// Connection counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ServerStats {
    pub current: usize,
    pub peak: usize,
    pub total_accepted: u64,
}

struct Registered {
    port: u16,
    connection: Connection,
}

/// Registry of live server-side connections.
///
/// Cloning is cheap; clones share the same tables.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    connections: Arc<DashMap<String, Registered>>,
    by_port: Arc<DashMap<u16, HashSet<String>>>,
    released: Arc<Mutex<VecDeque<String>>>,
    sequence: Arc<AtomicU64>,
    peak: Arc<AtomicUsize>,
    total: Arc<AtomicU64>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Next value of the identity sequence (starts at 1).
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Takes a released identity for re-association. Returns `false` if
    /// `id` was never issued here, is live, or was already claimed.
    pub(crate) fn claim_released(&self, id: &str) -> bool {
        let mut released = self.released.lock();
        match released.iter().position(|r| r == id) {
            Some(at) => {
                released.remove(at);
                true
            }
            None => false,
        }
    }

    /// Makes `id` claimable by a resuming client. Past
    /// [`RELEASED_IDS_KEPT`] the oldest released identity is forgotten.
    pub(crate) fn release(&self, id: String) {
        let mut released = self.released.lock();
        if released.len() >= RELEASED_IDS_KEPT {
            released.pop_front();
        }
        released.push_back(id);
    }

    /// Registers a connection under an identity from
    /// [`next_sequence`](Self::next_sequence) or
    /// [`claim_released`](Self::claim_released), both of which hand out each
    /// identity to one caller only.
    pub(crate) fn insert(&self, id: String, port: u16, connection: Connection) {
        self.by_port.entry(port).or_default().insert(id.clone());
        self.connections.insert(id, Registered { port, connection });
        self.total.fetch_add(1, Ordering::Relaxed);
        self.peak
            .fetch_max(self.connections.len(), Ordering::Relaxed);
    }

    /// Removes a connection without closing it. Its identity becomes
    /// claimable by a resuming client.
    pub fn remove(&self, id: &str) -> Option<Connection> {
        let (id, registered) = self.connections.remove(id)?;
        if let Some(mut ids) = self.by_port.get_mut(&registered.port) {
            ids.remove(&id);
        }
        self.by_port
            .remove_if(&registered.port, |_, ids| ids.is_empty());
        self.release(id);
        Some(registered.connection)
    }

    pub fn get(&self, id: &str) -> Option<Connection> {
        self.connections.get(id).map(|r| r.connection.clone())
    }

    pub fn contains(&self, id: &str) -> bool {
        self.connections.contains_key(id)
    }

    /// Identities of every live connection, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.connections.iter().map(|e| e.key().clone()).collect();
        ids.sort();
        ids
    }

    /// Connections accepted on `port`.
    pub fn on_port(&self, port: u16) -> Vec<Connection> {
        let ids: Vec<String> = self
            .by_port
            .get(&port)
            .map(|ids| ids.iter().cloned().collect())
            .unwrap_or_default();
        ids.iter().filter_map(|id| self.get(id)).collect()
    }

    /// Every live connection.
    pub fn all(&self) -> Vec<Connection> {
        self.connections
            .iter()
            .map(|e| e.connection.clone())
            .collect()
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    pub fn stats(&self) -> ServerStats {
        ServerStats {
            current: self.connections.len(),
            peak: self.peak.load(Ordering::Relaxed),
            total_accepted: self.total.load(Ordering::Relaxed),
        }
    }
}

impl std::fmt::Debug for ConnectionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionRegistry")
            .field("stats", &self.stats())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_starts_at_one_and_increases() {
        let registry = ConnectionRegistry::new();
        assert_eq!(registry.next_sequence(), 1);
        assert_eq!(registry.next_sequence(), 2);
        assert_eq!(registry.next_sequence(), 3);
    }

    #[test]
    fn empty_registry_reports_zero_stats() {
        let registry = ConnectionRegistry::new();
        assert!(registry.is_empty());
        assert_eq!(registry.stats(), ServerStats::default());
        assert!(registry.on_port(4000).is_empty());
        assert!(registry.remove("mxlink://127.0.0.1:1 1").is_none());
    }

    #[test]
    fn only_released_ids_can_be_claimed_once() {
        let registry = ConnectionRegistry::new();
        assert!(!registry.claim_released("mxlink://10.0.0.1:1 77"));

        registry.release("mxlink://127.0.0.1:5 1".into());
        assert!(registry.claim_released("mxlink://127.0.0.1:5 1"));
        assert!(!registry.claim_released("mxlink://127.0.0.1:5 1"));
    }

    #[test]
    fn released_ids_are_bounded() {
        let registry = ConnectionRegistry::new();
        for n in 0..RELEASED_IDS_KEPT + 1 {
            registry.release(format!("mxlink://127.0.0.1:5 {}", n));
        }
        assert!(!registry.claim_released("mxlink://127.0.0.1:5 0"));
        assert!(registry.claim_released("mxlink://127.0.0.1:5 1"));
    }
}
