//! Connection lifecycle events.
//!
//! The connection enqueues an event while it still holds its state lock, so
//! the queue order is the transition order. Events are then drained outside
//! every lock by whichever thread detected the transition. A single
//! delivery guard makes sure two threads never deliver concurrently, which
//! would reorder them.

use std::collections::VecDeque;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

/// A connection state transition, as seen by observers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Opened { connection_id: String },
    Closed { connection_id: String },
    Failed { connection_id: String, cause: String },
}

impl ConnectionEvent {
    pub fn connection_id(&self) -> &str {
        match self {
            Self::Opened { connection_id }
            | Self::Closed { connection_id }
            | Self::Failed { connection_id, .. } => connection_id,
        }
    }
}

impl fmt::Display for ConnectionEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Opened { connection_id } => write!(f, "opened({})", connection_id),
            Self::Closed { connection_id } => write!(f, "closed({})", connection_id),
            Self::Failed {
                connection_id,
                cause,
            } => write!(f, "failed({}, {})", connection_id, cause),
        }
    }
}

/// Receives lifecycle events.
///
/// Called synchronously; an observer that blocks delays every later
/// transition on the same connection.
///
/// Events are delivered by whichever thread holds the delivery guard. When
/// a transition happens while another thread is delivering, that thread
/// also delivers the new event, so the call that caused the transition
/// (for example [`Connection::close`](crate::Connection::close)) can return
/// before the observer has run. Order is preserved either way.
pub trait ConnectionObserver: Send + Sync + 'static {
    fn opened(&self, _connection_id: &str) {}

    fn closed(&self, _connection_id: &str) {}

    fn failed(&self, _connection_id: &str, _cause: &str) {}
}

/// Adapts a closure over [`ConnectionEvent`] into an observer.
pub struct ObserverFn<F>(pub F);

impl<F> ConnectionObserver for ObserverFn<F>
where
    F: Fn(&ConnectionEvent) + Send + Sync + 'static,
{
    fn opened(&self, connection_id: &str) {
        (self.0)(&ConnectionEvent::Opened {
            connection_id: connection_id.to_string(),
        })
    }

    fn closed(&self, connection_id: &str) {
        (self.0)(&ConnectionEvent::Closed {
            connection_id: connection_id.to_string(),
        })
    }

    fn failed(&self, connection_id: &str, cause: &str) {
        (self.0)(&ConnectionEvent::Failed {
            connection_id: connection_id.to_string(),
            cause: cause.to_string(),
        })
    }
}

/// Handle for removing an observer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ObserverId(u64);

/// Ordered fan-out of lifecycle events to observers.
pub struct LifecycleNotifier {
    observers: RwLock<Vec<(ObserverId, Arc<dyn ConnectionObserver>)>>,
    queue: Mutex<VecDeque<ConnectionEvent>>,
    delivering: Mutex<()>,
    next_id: AtomicU64,
}

impl Default for LifecycleNotifier {
    fn default() -> Self {
        Self::new()
    }
}

impl LifecycleNotifier {
    pub fn new() -> Self {
        Self {
            observers: RwLock::new(Vec::new()),
            queue: Mutex::new(VecDeque::new()),
            delivering: Mutex::new(()),
            next_id: AtomicU64::new(1),
        }
    }

    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) -> ObserverId {
        let id = ObserverId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.observers.write().push((id, observer));
        id
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        let mut observers = self.observers.write();
        let before = observers.len();
        observers.retain(|(existing, _)| *existing != id);
        observers.len() != before
    }

    /// Queues an event. Call [`drain`](Self::drain) once no lock is held.
    pub fn enqueue(&self, event: ConnectionEvent) {
        self.queue.lock().push_back(event);
    }

    /// Delivers queued events in order. Returns immediately if another
    /// thread is already delivering; that thread picks up the new events.
    pub fn drain(&self) {
        loop {
            let Some(_guard) = self.delivering.try_lock() else {
                return;
            };
            loop {
                let next = self.queue.lock().pop_front();
                match next {
                    Some(event) => self.deliver(&event),
                    None => break,
                }
            }
            drop(_guard);
            // an event queued after the last pop but before the guard was
            // released would otherwise wait for the next transition
            if self.queue.lock().is_empty() {
                return;
            }
        }
    }

    fn deliver(&self, event: &ConnectionEvent) {
        #[cfg(feature = "tracing")]
        tracing::debug!("Lifecycle event {}", event);

        let observers: Vec<Arc<dyn ConnectionObserver>> = self
            .observers
            .read()
            .iter()
            .map(|(_, o)| o.clone())
            .collect();
        for observer in observers {
            match event {
                ConnectionEvent::Opened { connection_id } => observer.opened(connection_id),
                ConnectionEvent::Closed { connection_id } => observer.closed(connection_id),
                ConnectionEvent::Failed {
                    connection_id,
                    cause,
                } => observer.failed(connection_id, cause),
            }
        }
    }
}
