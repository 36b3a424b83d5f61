//! Request/response correlation.
//!
//! The [`Correlator`] hands out correlation IDs, parks one waiter per ID and
//! wakes exactly that waiter when the matching response arrives. IDs are
//! monotonically increasing within one connection incarnation and restart
//! at 1 when [`Correlator::open`] begins a new incarnation.
//!
//! Completion order is arbitrary: responses are matched purely by ID.
//!
//! A response whose ID is no longer in the table (timed out, interrupted,
//! abandoned, or from a previous incarnation) is *late*: it is dropped and
//! counted. A response whose ID was never issued in the current incarnation
//! is *unknown*: a protocol violation, also dropped and counted. Neither
//! disturbs the reader task.

use std::collections::HashMap;
use std::future::pending;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;

use crate::error::{TransportError, TransportResult};

type Outcome = TransportResult<Value>;

struct Slot {
    tx: oneshot::Sender<Outcome>,
    #[cfg_attr(not(feature = "tracing"), allow(dead_code))]
    created_at: Instant,
}

struct Table {
    incarnation: u64,
    next_id: u64,
    open: bool,
    pending: HashMap<u64, Slot>,
}

/// Result of routing one response to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    /// Handed to its waiter.
    Delivered,
    /// The waiter is gone; dropped.
    Late,
    /// The ID was never issued in this incarnation; dropped.
    Unknown,
}

/// Counters exposed for observability of dropped responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CorrelatorStats {
    pub incarnation: u64,
    pub in_flight: usize,
    pub late_responses: u64,
    pub unknown_responses: u64,
}

/// Handle for one in-flight request.
///
/// Holds only the incarnation number it was issued under, never a
/// reference back to the connection.
#[derive(Debug)]
pub struct PendingRequest {
    id: u64,
    incarnation: u64,
    created_at: Instant,
    rx: oneshot::Receiver<Outcome>,
}

impl PendingRequest {
    pub fn correlation_id(&self) -> u64 {
        self.id
    }

    pub fn incarnation(&self) -> u64 {
        self.incarnation
    }

    pub fn created_at(&self) -> Instant {
        self.created_at
    }
}

/// Correlation table for one connection.
pub struct Correlator {
    table: Mutex<Table>,
    late: AtomicU64,
    unknown: AtomicU64,
}

impl Default for Correlator {
    fn default() -> Self {
        Self::new()
    }
}

impl Correlator {
    /// Creates a closed table; [`open`](Self::open) must be called before
    /// the first [`register`](Self::register).
    pub fn new() -> Self {
        Self {
            table: Mutex::new(Table {
                incarnation: 0,
                next_id: 1,
                open: false,
                pending: HashMap::new(),
            }),
            late: AtomicU64::new(0),
            unknown: AtomicU64::new(0),
        }
    }

    /// Starts a fresh ID space for `incarnation`.
    pub fn open(&self, incarnation: u64) {
        let mut table = self.table.lock();
        let stale = std::mem::take(&mut table.pending);
        table.incarnation = incarnation;
        table.next_id = 1;
        table.open = true;
        drop(table);
        for (_, slot) in stale {
            let _ = slot
                .tx
                .send(Err(TransportError::closed("connection incarnation replaced")));
        }
    }

    /// Allocates the next correlation ID and parks a slot for it.
    pub fn register(&self) -> TransportResult<PendingRequest> {
        let mut table = self.table.lock();
        if !table.open {
            return Err(TransportError::closed("connection is not open"));
        }
        let id = table.next_id;
        table.next_id += 1;
        let (tx, rx) = oneshot::channel();
        let created_at = Instant::now();
        table.pending.insert(id, Slot { tx, created_at });
        Ok(PendingRequest {
            id,
            incarnation: table.incarnation,
            created_at,
            rx,
        })
    }

    /// Routes a response to its waiter. Called by the reader task of
    /// `incarnation`.
    pub fn resolve(&self, incarnation: u64, id: u64, outcome: Outcome) -> Resolution {
        let mut table = self.table.lock();
        if incarnation != table.incarnation {
            drop(table);
            self.late.fetch_add(1, Ordering::Relaxed);
            #[cfg(feature = "tracing")]
            tracing::debug!(
                "Dropping response #{} from stale incarnation {}",
                id,
                incarnation
            );
            return Resolution::Late;
        }
        match table.pending.remove(&id) {
            Some(slot) => {
                drop(table);
                #[cfg(feature = "tracing")]
                tracing::trace!("Response #{} after {:?}", id, slot.created_at.elapsed());
                if slot.tx.send(outcome).is_err() {
                    // waiter dropped its future without discarding the slot
                    self.late.fetch_add(1, Ordering::Relaxed);
                    #[cfg(feature = "tracing")]
                    tracing::debug!("No one is waiting for response #{}", id);
                    return Resolution::Late;
                }
                Resolution::Delivered
            }
            None if id != 0 && id < table.next_id => {
                drop(table);
                self.late.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "tracing")]
                tracing::debug!("Dropping late response #{}", id);
                Resolution::Late
            }
            None => {
                drop(table);
                self.unknown.fetch_add(1, Ordering::Relaxed);
                #[cfg(feature = "tracing")]
                tracing::warn!("Protocol violation: response for never-issued id #{}", id);
                Resolution::Unknown
            }
        }
    }

    /// Removes a slot without resolving it. Returns `false` if the slot was
    /// already resolved (or belongs to another incarnation).
    pub fn discard(&self, request: &PendingRequest) -> bool {
        let mut table = self.table.lock();
        table.incarnation == request.incarnation && table.pending.remove(&request.id).is_some()
    }

    /// Resolves every outstanding request with `error`, clears the table and
    /// refuses new registrations until the next [`open`](Self::open).
    pub fn fail_all(&self, error: &TransportError) -> usize {
        let mut table = self.table.lock();
        table.open = false;
        let drained = std::mem::take(&mut table.pending);
        drop(table);
        let count = drained.len();
        for (_, slot) in drained {
            let _ = slot.tx.send(Err(error.clone()));
        }
        count
    }

    /// Waits for `request` to resolve.
    ///
    /// `timeout` of `None` waits indefinitely. Cancelling `cancel` yields
    /// [`TransportError::Interrupted`]; the deadline yields
    /// [`TransportError::Timeout`]. In both cases the slot is removed so a
    /// later response is dropped as late. If the response won the race
    /// against the deadline, the response is returned.
    pub async fn wait(
        &self,
        request: PendingRequest,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Outcome {
        let (interruption, mut request) = match self.wait_or_keep(request, timeout, cancel).await {
            Ok(outcome) => return outcome,
            Err(abandoned) => abandoned,
        };
        if self.discard(&request) {
            return Err(interruption);
        }
        // resolved between the wake-up and the discard
        match request.rx.try_recv() {
            Ok(outcome) => outcome,
            Err(_) => Err(interruption),
        }
    }

    /// Like [`wait`](Self::wait), but on timeout or cancellation the slot
    /// stays registered and is handed back with the error, so the caller
    /// can still consume a response that arrives later.
    pub async fn wait_or_keep(
        &self,
        mut request: PendingRequest,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<Outcome, (TransportError, PendingRequest)> {
        let deadline = async {
            match timeout {
                Some(t) => tokio::time::sleep(t).await,
                None => pending::<()>().await,
            }
        };
        let cancelled = async {
            match cancel {
                Some(token) => token.cancelled().await,
                None => pending::<()>().await,
            }
        };

        let interruption = tokio::select! {
            biased;
            received = &mut request.rx => {
                return Ok(received
                    .unwrap_or_else(|_| Err(TransportError::closed("request slot dropped"))));
            }
            _ = cancelled => TransportError::Interrupted,
            _ = deadline => TransportError::Timeout { elapsed: request.created_at.elapsed() },
        };
        Err((interruption, request))
    }

    pub fn stats(&self) -> CorrelatorStats {
        let table = self.table.lock();
        CorrelatorStats {
            incarnation: table.incarnation,
            in_flight: table.pending.len(),
            late_responses: self.late.load(Ordering::Relaxed),
            unknown_responses: self.unknown.load(Ordering::Relaxed),
        }
    }
}
