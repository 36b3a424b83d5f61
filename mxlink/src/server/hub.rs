//! Server-side notification fan-out.
//!
//! [`NotificationHub`] keeps, per resource, the `{connection, listener,
//! filter}` triples created by `AddListener`. When a resource emits, the hub
//! evaluates every filter and queues the notification on the outbox of each
//! matching connection, tagged with the matching listener ID. A per-connection
//! pump task drains the outbox onto the wire, so a slow client never blocks
//! the emitting resource.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use mxlink_protocol::{ListenerId, Notification, NotificationFilter, ResourceName};
use tokio::sync::mpsc;

/// Item queued for one connection.
pub(crate) type Outgoing = (ListenerId, Arc<Notification>);

#[derive(Debug, Clone)]
struct Subscription {
    connection_id: String,
    listener_id: ListenerId,
    filter: Option<NotificationFilter>,
}

impl Subscription {
    fn accepts(&self, notification: &Notification) -> bool {
        self.filter
            .as_ref()
            .map(|f| f.accepts(notification))
            .unwrap_or(true)
    }
}

/// Subscription table and per-connection outboxes.
///
/// Cloning is cheap; clones share the same tables.
#[derive(Clone, Default)]
pub struct NotificationHub {
    subscriptions: Arc<DashMap<ResourceName, Vec<Subscription>>>,
    outboxes: Arc<DashMap<String, mpsc::Sender<Outgoing>>>,
    dropped: Arc<AtomicU64>,
}

impl NotificationHub {
    pub fn new() -> Self {
        Self::default()
    }

    // ────────────────────────────────────────────────────────────────
    // Connections
    // ────────────────────────────────────────────────────────────────

    /// Creates the outbox for a connection; the caller drives the receiver.
    pub(crate) fn attach(&self, connection_id: &str, capacity: usize) -> mpsc::Receiver<Outgoing> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        self.outboxes.insert(connection_id.to_string(), tx);
        rx
    }

    /// Drops the outbox and every subscription of a connection. Returns the
    /// number of subscriptions removed.
    pub(crate) fn detach(&self, connection_id: &str) -> usize {
        self.outboxes.remove(connection_id);
        let mut removed = 0;
        self.subscriptions.retain(|_, subs| {
            let before = subs.len();
            subs.retain(|s| s.connection_id != connection_id);
            removed += before - subs.len();
            !subs.is_empty()
        });
        removed
    }

    // ────────────────────────────────────────────────────────────────
    // Subscriptions
    // ────────────────────────────────────────────────────────────────

    pub(crate) fn subscribe(
        &self,
        connection_id: &str,
        resource: &ResourceName,
        listener_id: ListenerId,
        filter: Option<NotificationFilter>,
    ) {
        self.subscriptions
            .entry(resource.clone())
            .or_default()
            .push(Subscription {
                connection_id: connection_id.to_string(),
                listener_id,
                filter,
            });
    }

    /// Returns `false` if no such subscription exists.
    pub(crate) fn unsubscribe(
        &self,
        connection_id: &str,
        resource: &ResourceName,
        listener_id: ListenerId,
    ) -> bool {
        let removed = match self.subscriptions.get_mut(resource) {
            Some(mut subs) => {
                let before = subs.len();
                subs.retain(|s| {
                    !(s.connection_id == connection_id && s.listener_id == listener_id)
                });
                subs.len() != before
            }
            None => false,
        };
        self.subscriptions
            .remove_if(resource, |_, subs| subs.is_empty());
        removed
    }

    /// Drops every subscription to `resource` (on unregistration).
    pub fn remove_resource(&self, resource: &ResourceName) -> usize {
        self.subscriptions
            .remove(resource)
            .map(|(_, subs)| subs.len())
            .unwrap_or(0)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.iter().map(|e| e.len()).sum()
    }

    /// Notifications dropped because a connection's outbox was full.
    pub fn dropped_notifications(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    // ────────────────────────────────────────────────────────────────
    // Fan-out
    // ────────────────────────────────────────────────────────────────

    /// Queues `notification` for every subscription whose filter accepts
    /// it. Returns the number of deliveries queued.
    pub fn publish(&self, notification: &Notification) -> usize {
        // collect first so no table guard is held while queueing
        let subscriptions = self.subscriptions.get(&notification.source);
        let targets: Vec<(String, ListenerId)> = match subscriptions {
            Some(subs) => subs
                .iter()
                .filter(|s| s.accepts(notification))
                .map(|s| (s.connection_id.clone(), s.listener_id))
                .collect(),
            None => return 0,
        };
        if targets.is_empty() {
            return 0;
        }

        let shared = Arc::new(notification.clone());
        let mut queued = 0;
        for (connection_id, listener_id) in targets {
            let Some(outbox) = self.outboxes.get(&connection_id).map(|o| o.clone()) else {
                continue;
            };
            match outbox.try_send((listener_id, shared.clone())) {
                Ok(()) => queued += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        "Outbox of '{}' full, dropping {} notification #{} for {}",
                        connection_id,
                        notification.kind,
                        notification.sequence,
                        listener_id
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        queued
    }
}

impl std::fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationHub")
            .field("subscriptions", &self.subscription_count())
            .field("connections", &self.outboxes.len())
            .finish()
    }
}
