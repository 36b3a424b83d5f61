//! Client-side notification registry.
//!
//! Maps server-assigned listener IDs to local callbacks and their handback
//! values. The reader task calls [`ListenerRegistry::dispatch`] for every
//! inbound notification frame; callbacks run synchronously on that task,
//! which is what keeps per-listener delivery in emission order.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mxlink_protocol::{ListenerId, Notification, NotificationFilter, ResourceName};
use parking_lot::Mutex;

use crate::config::ResubscribePolicy;
use crate::error::{TransportError, TransportResult};

// ════════════════════════════════════════════════════════════════════
// Public types
// ════════════════════════════════════════════════════════════════════

/// Opaque client-side value returned unchanged with every notification.
///
/// Never sent over the wire.
#[derive(Clone, Default)]
pub struct Handback(Option<Arc<dyn Any + Send + Sync>>);

impl Handback {
    pub fn none() -> Self {
        Self(None)
    }

    pub fn new<T: Any + Send + Sync>(value: T) -> Self {
        Self(Some(Arc::new(value)))
    }

    pub fn from_arc(value: Arc<dyn Any + Send + Sync>) -> Self {
        Self(Some(value))
    }

    pub fn is_none(&self) -> bool {
        self.0.is_none()
    }

    pub fn downcast_ref<T: Any>(&self) -> Option<&T> {
        self.0.as_deref().and_then(|v| v.downcast_ref::<T>())
    }

    /// Returns `true` if both handbacks point at the same value.
    pub fn ptr_eq(&self, other: &Handback) -> bool {
        match (&self.0, &other.0) {
            (Some(a), Some(b)) => Arc::ptr_eq(a, b),
            (None, None) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for Handback {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(_) => f.write_str("Handback(..)"),
            None => f.write_str("Handback(None)"),
        }
    }
}

/// Callback invoked for every notification delivered to a registration.
///
/// Runs on the connection's reader task: it must not block.
pub trait NotificationListener: Send + Sync + 'static {
    fn handle_notification(&self, notification: &Notification, handback: &Handback);
}

impl<F> NotificationListener for F
where
    F: Fn(&Notification, &Handback) + Send + Sync + 'static,
{
    fn handle_notification(&self, notification: &Notification, handback: &Handback) {
        self(notification, handback)
    }
}

/// A live subscription, returned by a successful subscribe round trip.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListenerRegistration {
    listener_id: ListenerId,
    resource: ResourceName,
    incarnation: u64,
}

impl ListenerRegistration {
    pub fn listener_id(&self) -> ListenerId {
        self.listener_id
    }

    pub fn resource(&self) -> &ResourceName {
        &self.resource
    }

    /// Connection incarnation the registration belongs to.
    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }
}

/// A subscription remembered for replay under [`ResubscribePolicy::Replay`].
#[derive(Clone)]
pub struct DurableSubscription {
    pub resource: ResourceName,
    pub filter: Option<NotificationFilter>,
    pub listener: Arc<dyn NotificationListener>,
    pub handback: Handback,
}

impl fmt::Debug for DurableSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DurableSubscription")
            .field("resource", &self.resource)
            .field("filter", &self.filter)
            .finish_non_exhaustive()
    }
}

/// Counters for observability of dropped notifications.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ListenerStats {
    pub active: usize,
    pub dropped_notifications: u64,
}

// ════════════════════════════════════════════════════════════════════
// ListenerRegistry
// ════════════════════════════════════════════════════════════════════

struct Entry {
    subscription: DurableSubscription,
}

struct Table {
    incarnation: u64,
    open: bool,
    entries: HashMap<ListenerId, Entry>,
    durable: Vec<DurableSubscription>,
}

impl Table {
    fn is_live(&self, incarnation: u64) -> bool {
        self.open && self.incarnation == incarnation
    }
}

/// Listener table for one client connection.
pub struct ListenerRegistry {
    policy: ResubscribePolicy,
    table: Mutex<Table>,
    dropped: AtomicU64,
}

impl ListenerRegistry {
    pub fn new(policy: ResubscribePolicy) -> Self {
        Self {
            policy,
            table: Mutex::new(Table {
                incarnation: 0,
                open: false,
                entries: HashMap::new(),
                durable: Vec::new(),
            }),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn policy(&self) -> ResubscribePolicy {
        self.policy
    }

    /// Starts tracking a new incarnation.
    pub fn open(&self, incarnation: u64) {
        let mut table = self.table.lock();
        table.incarnation = incarnation;
        table.open = true;
        table.entries.clear();
    }

    /// Stores the mapping for a listener the server accepted under
    /// `incarnation`. Fails with `ConnectionClosed` if the connection was
    /// torn down while the subscribe round trip was in flight.
    pub fn insert(
        &self,
        incarnation: u64,
        listener_id: ListenerId,
        subscription: DurableSubscription,
    ) -> TransportResult<ListenerRegistration> {
        let mut table = self.table.lock();
        if !table.is_live(incarnation) {
            return Err(TransportError::closed(
                "connection torn down during subscribe",
            ));
        }
        let resource = subscription.resource.clone();
        table.entries.insert(listener_id, Entry { subscription });
        Ok(ListenerRegistration {
            listener_id,
            resource,
            incarnation,
        })
    }

    /// Returns `true` if `registration` is live in the current incarnation.
    pub fn contains(&self, registration: &ListenerRegistration) -> bool {
        let table = self.table.lock();
        table.is_live(registration.incarnation)
            && table.entries.contains_key(&registration.listener_id)
    }

    /// Drops the local mapping for `registration`.
    pub fn remove(&self, registration: &ListenerRegistration) -> bool {
        let mut table = self.table.lock();
        table.is_live(registration.incarnation)
            && table.entries.remove(&registration.listener_id).is_some()
    }

    /// Delivers a notification to its callback. Unknown IDs are dropped.
    pub fn dispatch(&self, incarnation: u64, listener_id: ListenerId, notification: &Notification) {
        let target = {
            let table = self.table.lock();
            if !table.is_live(incarnation) {
                None
            } else {
                table.entries.get(&listener_id).map(|e| {
                    (
                        e.subscription.listener.clone(),
                        e.subscription.handback.clone(),
                    )
                })
            }
        };
        match target {
            Some((listener, handback)) => listener.handle_notification(notification, &handback),
            None => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "tracing")]
                tracing::debug!(
                    "Dropping notification '{}' for unknown {}",
                    notification.kind,
                    listener_id
                );
            }
        }
    }

    /// Invalidates every registration of the current incarnation. Under
    /// [`ResubscribePolicy::Replay`] they are kept for [`take_durable`].
    ///
    /// [`take_durable`]: Self::take_durable
    pub fn invalidate_all(&self) -> usize {
        let mut table = self.table.lock();
        let entries = std::mem::take(&mut table.entries);
        let count = entries.len();
        if self.policy == ResubscribePolicy::Replay {
            let mut ordered: Vec<_> = entries.into_iter().collect();
            ordered.sort_by_key(|(id, _)| *id);
            table
                .durable
                .extend(ordered.into_iter().map(|(_, e)| e.subscription));
        }
        table.open = false;
        count
    }

    /// Takes the subscriptions remembered for replay.
    pub fn take_durable(&self) -> Vec<DurableSubscription> {
        std::mem::take(&mut self.table.lock().durable)
    }

    /// Puts subscriptions back for the next replay.
    pub fn remember(&self, subscriptions: impl IntoIterator<Item = DurableSubscription>) {
        if self.policy == ResubscribePolicy::Replay {
            self.table.lock().durable.extend(subscriptions);
        }
    }

    pub fn stats(&self) -> ListenerStats {
        ListenerStats {
            active: self.table.lock().entries.len(),
            dropped_notifications: self.dropped.load(Ordering::Relaxed),
        }
    }
}
