//! The connection state machine.
//!
//! A [`Connection`] owns one duplex stream at a time together with the
//! [`Correlator`], the client [`ListenerRegistry`] and the
//! [`LifecycleNotifier`] for it. Every successful handshake starts a new
//! *incarnation*: a fresh correlation ID space and listener table, and a
//! dedicated reader task.
//!
//! # Locks
//!
//! The state cell, the correlation table and the listener table each have
//! their own lock, always taken in that order. None of them is held across
//! I/O. Writes are serialized by a separate async writer lock, which is the
//! only lock held while bytes go out.
//!
//! # Reader task
//!
//! One task per incarnation reads frames and routes them: responses to the
//! correlator, notifications to the listener registry (synchronously, which
//! preserves emission order), and, on server-accepted connections, requests
//! to the [`RequestHandler`] on their own tasks so slow operations never
//! stall the stream. A close frame ends the incarnation as CLOSED; EOF or
//! an unreadable frame ends it as FAILED.
//!
//! # Connection check
//!
//! With [`ClientConfig::connection_check_period`] set, a client incarnation
//! also runs a check task that sends `GetDefaultDomain` every period. Any
//! answer, faults included, proves the peer alive; a timeout or a transport
//! error fails the incarnation. The task is cancelled when the incarnation
//! ends. It never reconnects.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use mxlink_protocol::{
    decode, encode, read_channel_token, read_frame, write_channel_token, write_frame, FaultCode,
    Frame, FrameKind, HandshakeReply, Hello, ListenerId, Notification, Operation, PayloadCodec,
    RemoteFault, ResponseBody, DEFAULT_MAX_FRAME_SIZE,
};
use parking_lot::Mutex;
use serde_json::Value;
use tokio::io::{AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{watch, Mutex as AsyncMutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::{AuthorizationContext, Principal};
use crate::config::{ClientConfig, ResubscribePolicy};
use crate::correlator::{Correlator, CorrelatorStats, PendingRequest};
use crate::error::{TransportError, TransportResult};
use crate::interceptor::{BoxedStream, ConnectionInterceptor, Dialer};
use crate::lifecycle::{ConnectionEvent, ConnectionObserver, LifecycleNotifier, ObserverId};
use crate::listeners::{ListenerRegistry, ListenerStats};
use crate::state::{ConnectionState, Direction, SecurityMode};

type Reader = ReadHalf<BoxedStream>;
type Writer = WriteHalf<BoxedStream>;
type SharedWriter = Arc<AsyncMutex<Writer>>;

/// Handles operation requests arriving on a server-accepted connection.
#[async_trait]
pub trait RequestHandler: Send + Sync + 'static {
    async fn handle(&self, connection: &Connection, operation: Operation) -> ResponseBody;
}

/// A completed handshake: the split stream plus the negotiated identity.
pub(crate) struct Established {
    pub reader: Reader,
    pub writer: Writer,
    pub connection_id: String,
    pub security: SecurityMode,
    pub principal: Option<Principal>,
    /// Largest frame the peer reads; outgoing frames are checked against it.
    pub peer_frame_limit: usize,
}

/// Frame limit advertised in the handshake; peers that do not advertise
/// one are assumed to use the default.
pub(crate) fn advertised_limit(advertised: Option<u64>) -> usize {
    advertised
        .map(|n| usize::try_from(n).unwrap_or(usize::MAX))
        .unwrap_or(DEFAULT_MAX_FRAME_SIZE)
}

struct Link {
    writer: SharedWriter,
    reader_task: JoinHandle<()>,
    checker: CancellationToken,
}

struct StateCell {
    state: ConnectionState,
    incarnation: u64,
    connection_id: Option<String>,
    security: SecurityMode,
    auth: AuthorizationContext,
    link: Option<Link>,
    peer_frame_limit: usize,
    attempt: u64,
    last_outcome: Option<(u64, TransportResult<()>)>,
}

struct ClientSide {
    dialer: Arc<dyn Dialer>,
    interceptor: Arc<dyn ConnectionInterceptor>,
    config: ClientConfig,
}

struct Inner {
    direction: Direction,
    codec: Arc<dyn PayloadCodec>,
    max_frame_size: usize,
    close_timeout: Duration,
    request_timeout: Duration,
    state: Mutex<StateCell>,
    state_tx: watch::Sender<ConnectionState>,
    correlator: Correlator,
    listeners: ListenerRegistry,
    lifecycle: LifecycleNotifier,
    client: Option<ClientSide>,
    handler: Option<Arc<dyn RequestHandler>>,
}

impl Inner {
    fn set_state(&self, cell: &mut StateCell, next: ConnectionState) {
        cell.state = next;
        self.state_tx.send_replace(next);
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        if let Some(link) = self.state.get_mut().link.take() {
            link.checker.cancel();
            link.reader_task.abort();
        }
    }
}

enum ReaderEnd {
    Closed,
    Failed(String),
}

enum ConnectStart {
    Ready,
    Join(u64),
    Dial(u64, Option<String>),
}

/// Cheap-to-clone handle on one logical connection.
#[derive(Clone)]
pub struct Connection {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let cell = self.inner.state.lock();
        f.debug_struct("Connection")
            .field("direction", &self.inner.direction)
            .field("state", &cell.state)
            .field("connection_id", &cell.connection_id)
            .field("incarnation", &cell.incarnation)
            .finish()
    }
}

impl Connection {
    // ────────────────────────────────────────────────────────────────
    // Construction
    // ────────────────────────────────────────────────────────────────

    /// Creates an UNCONNECTED client connection. Nothing is dialed until
    /// [`connect`](Self::connect).
    pub fn client(
        dialer: Arc<dyn Dialer>,
        interceptor: Arc<dyn ConnectionInterceptor>,
        codec: Arc<dyn PayloadCodec>,
        config: ClientConfig,
    ) -> Self {
        let inner = Inner {
            direction: Direction::ClientInitiated,
            codec,
            max_frame_size: config.max_frame_size,
            close_timeout: config.close_timeout,
            request_timeout: config.request_timeout,
            state: Mutex::new(new_cell()),
            state_tx: watch::channel(ConnectionState::Unconnected).0,
            correlator: Correlator::new(),
            listeners: ListenerRegistry::new(config.resubscribe_policy),
            lifecycle: LifecycleNotifier::new(),
            client: Some(ClientSide {
                dialer,
                interceptor,
                config,
            }),
            handler: None,
        };
        Self {
            inner: Arc::new(inner),
        }
    }

    /// Wraps a stream the server has already handshaken. The connection
    /// starts CONNECTED and `opened` is delivered to `observers`.
    pub(crate) fn accepted(
        established: Established,
        codec: Arc<dyn PayloadCodec>,
        handler: Arc<dyn RequestHandler>,
        max_frame_size: usize,
        close_timeout: Duration,
        observers: Vec<Arc<dyn ConnectionObserver>>,
    ) -> Self {
        let inner = Arc::new(Inner {
            direction: Direction::ServerAccepted,
            codec,
            max_frame_size,
            close_timeout,
            request_timeout: Duration::MAX,
            state: Mutex::new(new_cell()),
            state_tx: watch::channel(ConnectionState::Unconnected).0,
            correlator: Correlator::new(),
            listeners: ListenerRegistry::new(ResubscribePolicy::None),
            lifecycle: LifecycleNotifier::new(),
            client: None,
            handler: Some(handler),
        });
        for observer in observers {
            inner.lifecycle.add_observer(observer);
        }
        let conn = Self { inner };
        {
            let mut cell = conn.inner.state.lock();
            cell.attempt = 1;
            conn.activate(&mut cell, established);
            cell.last_outcome = Some((1, Ok(())));
        }
        conn.inner.lifecycle.drain();
        conn
    }

    /// Installs a fresh incarnation. Caller holds the state lock.
    fn activate(&self, cell: &mut StateCell, established: Established) {
        cell.incarnation += 1;
        let incarnation = cell.incarnation;
        self.inner.correlator.open(incarnation);
        self.inner.listeners.open(incarnation);

        let Established {
            reader,
            writer,
            connection_id,
            security,
            principal,
            peer_frame_limit,
        } = established;

        let reader_task = tokio::spawn(reader_loop(
            Arc::downgrade(&self.inner),
            incarnation,
            reader,
            self.inner.max_frame_size,
        ));
        let checker = CancellationToken::new();
        let check_period = self
            .inner
            .client
            .as_ref()
            .and_then(|c| c.config.connection_check_period);
        if let Some(period) = check_period {
            tokio::spawn(connection_check(
                Arc::downgrade(&self.inner),
                incarnation,
                period,
                checker.clone(),
            ));
        }
        cell.link = Some(Link {
            writer: Arc::new(AsyncMutex::new(writer)),
            reader_task,
            checker,
        });
        cell.auth = AuthorizationContext::new(connection_id.clone(), principal);
        cell.connection_id = Some(connection_id.clone());
        cell.security = security;
        cell.peer_frame_limit = peer_frame_limit;
        self.inner.set_state(cell, ConnectionState::Connected);
        self.inner
            .lifecycle
            .enqueue(ConnectionEvent::Opened { connection_id });
    }

    // ────────────────────────────────────────────────────────────────
    // Accessors
    // ────────────────────────────────────────────────────────────────

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().state
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    /// Watch channel that yields every state change.
    pub fn watch_state(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    /// Identity assigned by the server on the first handshake.
    pub fn connection_id(&self) -> Option<String> {
        self.inner.state.lock().connection_id.clone()
    }

    /// Current incarnation; 0 before the first handshake.
    pub fn incarnation(&self) -> u64 {
        self.inner.state.lock().incarnation
    }

    pub fn direction(&self) -> Direction {
        self.inner.direction
    }

    pub fn security_mode(&self) -> SecurityMode {
        self.inner.state.lock().security
    }

    /// Identity bound during the handshake.
    pub fn authorization(&self) -> AuthorizationContext {
        self.inner.state.lock().auth.clone()
    }

    pub fn correlator_stats(&self) -> CorrelatorStats {
        self.inner.correlator.stats()
    }

    pub fn listener_stats(&self) -> ListenerStats {
        self.inner.listeners.stats()
    }

    pub(crate) fn listeners(&self) -> &ListenerRegistry {
        &self.inner.listeners
    }

    pub fn add_observer(&self, observer: Arc<dyn ConnectionObserver>) -> ObserverId {
        self.inner.lifecycle.add_observer(observer)
    }

    pub fn remove_observer(&self, id: ObserverId) -> bool {
        self.inner.lifecycle.remove_observer(id)
    }

    // ────────────────────────────────────────────────────────────────
    // Connect
    // ────────────────────────────────────────────────────────────────

    /// Dials and handshakes. Valid from UNCONNECTED or FAILED; a no-op when
    /// already CONNECTED. A call made while another caller's attempt is in
    /// flight waits for that attempt and returns its outcome.
    pub async fn connect(&self) -> TransportResult<()> {
        let Some(client) = self.inner.client.as_ref() else {
            return Err(TransportError::invalid_state(
                "server-accepted connections cannot dial",
            ));
        };

        let start = {
            let mut cell = self.inner.state.lock();
            match cell.state {
                ConnectionState::Connected => ConnectStart::Ready,
                ConnectionState::Closed => {
                    return Err(TransportError::closed("connection was closed"))
                }
                ConnectionState::Connecting => ConnectStart::Join(cell.attempt),
                ConnectionState::Unconnected | ConnectionState::Failed => {
                    cell.attempt += 1;
                    self.inner.set_state(&mut cell, ConnectionState::Connecting);
                    let resume = cell
                        .connection_id
                        .clone()
                        .filter(|_| client.config.resume_connection_id);
                    ConnectStart::Dial(cell.attempt, resume)
                }
            }
        };
        let (attempt, resume_id) = match start {
            ConnectStart::Ready => return Ok(()),
            ConnectStart::Join(attempt) => {
                return self
                    .wait_for_attempt(attempt, client.config.connected_state_timeout)
                    .await
            }
            ConnectStart::Dial(attempt, resume_id) => (attempt, resume_id),
        };

        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Connecting to {} (attempt {})",
            client.dialer.endpoint(),
            attempt
        );

        let outcome = match tokio::time::timeout(
            client.config.connect_timeout,
            self.client_handshake(client, resume_id),
        )
        .await
        {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::handshake(format!(
                "no handshake with {} within {:?}",
                client.dialer.endpoint(),
                client.config.connect_timeout
            ))),
        };
        self.finish_connect(attempt, outcome)
    }

    async fn client_handshake(
        &self,
        client: &ClientSide,
        resume_id: Option<String>,
    ) -> TransportResult<Established> {
        let hs = |stage: &str, e: &dyn std::fmt::Display| {
            TransportError::handshake(format!("{}: {}", stage, e))
        };

        let raw = client
            .dialer
            .dial()
            .await
            .map_err(|e| hs(&format!("dial {}", client.dialer.endpoint()), &e))?;
        let (stream, security) = client
            .interceptor
            .on_client_connect(raw)
            .await
            .map_err(|e| hs("interceptor", &e))?;
        let (mut reader, mut writer) = tokio::io::split(stream);

        write_channel_token(&mut writer)
            .await
            .map_err(|e| hs("channel token", &e))?;

        let mut hello = Hello::new(self.inner.codec.name());
        hello.credentials = client.config.credentials.clone();
        hello.resume_id = resume_id;
        hello.max_frame_size = Some(self.inner.max_frame_size as u64);
        let payload = encode(&*self.inner.codec, &hello).map_err(|e| hs("hello", &e))?;
        write_frame(&mut writer, &Frame::new(FrameKind::Handshake, 0, payload))
            .await
            .map_err(|e| hs("hello", &e))?;

        let reply = read_frame(&mut reader, self.inner.max_frame_size)
            .await
            .map_err(|e| hs("reply", &e))?;
        if reply.kind != FrameKind::Handshake {
            return Err(TransportError::handshake(format!(
                "unexpected {:?} frame during handshake",
                reply.kind
            )));
        }
        match decode::<HandshakeReply>(&*self.inner.codec, &reply.payload)
            .map_err(|e| hs("reply", &e))?
        {
            HandshakeReply::Welcome {
                connection_id,
                principal,
                max_frame_size,
                ..
            } => Ok(Established {
                reader,
                writer,
                connection_id,
                security,
                principal: principal.map(Principal::new),
                peer_frame_limit: advertised_limit(max_frame_size),
            }),
            HandshakeReply::Rejected { reason } => Err(TransportError::handshake(reason)),
        }
    }

    fn finish_connect(
        &self,
        attempt: u64,
        outcome: TransportResult<Established>,
    ) -> TransportResult<()> {
        let mut cell = self.inner.state.lock();
        if cell.state != ConnectionState::Connecting {
            // closed while the handshake was in flight; dropping the
            // established halves releases the socket
            let err = TransportError::closed("connection closed during connect");
            cell.last_outcome = Some((attempt, Err(err.clone())));
            return Err(err);
        }

        match outcome {
            Ok(established) => {
                self.activate(&mut cell, established);
                cell.last_outcome = Some((attempt, Ok(())));
                #[cfg(feature = "tracing")]
                tracing::info!(
                    "Connected as '{}' (incarnation {})",
                    cell.connection_id.as_deref().unwrap_or_default(),
                    cell.incarnation
                );
                drop(cell);
                self.inner.lifecycle.drain();
                Ok(())
            }
            Err(err) => {
                self.inner.set_state(&mut cell, ConnectionState::Failed);
                cell.last_outcome = Some((attempt, Err(err.clone())));
                drop(cell);
                #[cfg(feature = "tracing")]
                tracing::warn!("Connect attempt {} failed: {}", attempt, err);
                Err(err)
            }
        }
    }

    async fn wait_for_attempt(&self, attempt: u64, limit: Duration) -> TransportResult<()> {
        let mut rx = self.inner.state_tx.subscribe();
        let wait = async {
            loop {
                {
                    let cell = self.inner.state.lock();
                    if let Some((n, outcome)) = &cell.last_outcome {
                        if *n >= attempt {
                            return outcome.clone();
                        }
                    }
                    if cell.state != ConnectionState::Connecting {
                        return Err(TransportError::closed(format!(
                            "connection is {}",
                            cell.state
                        )));
                    }
                }
                if rx.changed().await.is_err() {
                    return Err(TransportError::closed("connection dropped"));
                }
            }
        };
        match tokio::time::timeout(limit, wait).await {
            Ok(outcome) => outcome,
            Err(_) => Err(TransportError::Timeout { elapsed: limit }),
        }
    }

    // ────────────────────────────────────────────────────────────────
    // Send / request
    // ────────────────────────────────────────────────────────────────

    /// Writes one frame. Holds the writer lock only for the write; does not
    /// wait for any response.
    ///
    /// A frame larger than the peer's limit is refused with
    /// [`TransportError::FrameTooLarge`] before anything is written, and
    /// the connection stays up.
    pub async fn send(&self, frame: Frame) -> TransportResult<()> {
        let (writer, incarnation, limit) = self.current_writer()?;
        frame.check_size(limit)?;
        self.write_on(&writer, incarnation, &frame).await
    }

    fn current_writer(&self) -> TransportResult<(SharedWriter, u64, usize)> {
        let cell = self.inner.state.lock();
        match (&cell.state, &cell.link) {
            (ConnectionState::Connected, Some(link)) => Ok((
                link.writer.clone(),
                cell.incarnation,
                cell.peer_frame_limit,
            )),
            (state, _) => Err(TransportError::closed(format!("connection is {}", state))),
        }
    }

    /// Largest frame the current peer accepts.
    pub fn peer_frame_limit(&self) -> usize {
        self.inner.state.lock().peer_frame_limit
    }

    async fn write_on(
        &self,
        writer: &SharedWriter,
        incarnation: u64,
        frame: &Frame,
    ) -> TransportResult<()> {
        let result = {
            let mut w = writer.lock().await;
            write_frame(&mut *w, frame).await
        };
        match result {
            Ok(()) => Ok(()),
            Err(e) => {
                let cause = format!("write failed: {}", e);
                self.fail_incarnation(incarnation, cause.clone());
                Err(TransportError::closed(cause))
            }
        }
    }

    /// Registers a correlation slot for `operation` and writes the request.
    ///
    /// A request too large for the peer fails here with
    /// [`TransportError::FrameTooLarge`]; no slot is registered and nothing
    /// is sent.
    pub async fn submit(&self, operation: &Operation) -> TransportResult<PendingRequest> {
        let mut frame = Frame::request(0, encode(&*self.inner.codec, operation)?);
        let (pending, writer, incarnation) = {
            let cell = self.inner.state.lock();
            let link = match (&cell.state, &cell.link) {
                (ConnectionState::Connected, Some(link)) => link,
                (state, _) => {
                    return Err(TransportError::closed(format!("connection is {}", state)))
                }
            };
            frame.check_size(cell.peer_frame_limit)?;
            let pending = self.inner.correlator.register()?;
            (pending, link.writer.clone(), cell.incarnation)
        };

        frame.id = pending.correlation_id();
        if let Err(e) = self.write_on(&writer, incarnation, &frame).await {
            self.inner.correlator.discard(&pending);
            return Err(e);
        }
        Ok(pending)
    }

    /// Waits for a submitted request. See [`Correlator::wait`].
    pub async fn await_response(
        &self,
        pending: PendingRequest,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> TransportResult<Value> {
        self.inner.correlator.wait(pending, timeout, cancel).await
    }

    /// Waits like [`await_response`](Self::await_response), but hands the
    /// still-registered request back on timeout or cancellation.
    pub(crate) async fn await_or_keep(
        &self,
        pending: PendingRequest,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<TransportResult<Value>, (TransportError, PendingRequest)> {
        self.inner
            .correlator
            .wait_or_keep(pending, timeout, cancel)
            .await
    }

    /// Submits `operation` and waits with the configured request timeout.
    pub async fn request(&self, operation: &Operation) -> TransportResult<Value> {
        self.request_with(operation, None, None).await
    }

    /// Submits `operation` and waits up to `timeout` (default: the
    /// configured request timeout), or until `cancel` fires.
    pub async fn request_with(
        &self,
        operation: &Operation,
        timeout: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> TransportResult<Value> {
        let pending = self.submit(operation).await?;
        let timeout = timeout.unwrap_or(self.inner.request_timeout);
        self.await_response(pending, Some(timeout), cancel).await
    }

    pub(crate) async fn respond(
        &self,
        correlation_id: u64,
        body: &ResponseBody,
    ) -> TransportResult<()> {
        let payload = encode(&*self.inner.codec, body)?;
        match self.send(Frame::response(correlation_id, payload)).await {
            Err(TransportError::FrameTooLarge { size, limit }) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Response #{} is {} bytes, over the peer limit of {}; sending a fault",
                    correlation_id,
                    size,
                    limit
                );
                let fault = ResponseBody::fault(RemoteFault::new(
                    FaultCode::Internal,
                    format!(
                        "response of {} bytes exceeds the client frame limit of {}",
                        size, limit
                    ),
                ));
                let payload = encode(&*self.inner.codec, &fault)?;
                self.send(Frame::response(correlation_id, payload)).await
            }
            other => other,
        }
    }

    pub(crate) async fn notify(
        &self,
        listener_id: ListenerId,
        notification: &Notification,
    ) -> TransportResult<()> {
        let payload = encode(&*self.inner.codec, notification)?;
        self.send(Frame::notification(listener_id.0, payload)).await
    }

    // ────────────────────────────────────────────────────────────────
    // Close / teardown
    // ────────────────────────────────────────────────────────────────

    /// Moves to CLOSED from any state. Idempotent.
    ///
    /// On return, every outstanding request has been resolved with
    /// `ConnectionClosed`, every listener registration is invalid and no
    /// further send can succeed. The peer is sent a close frame on a best
    /// effort basis. The `closed` event is delivered before return unless
    /// another thread is delivering events at that moment; see
    /// [`ConnectionObserver`].
    pub async fn close(&self) {
        let Some(link) = self.teardown(None, ConnectionState::Closed, None) else {
            return;
        };
        link.reader_task.abort();
        let _ = tokio::time::timeout(self.inner.close_timeout, async {
            let mut w = link.writer.lock().await;
            let _ = write_frame(&mut *w, &Frame::close()).await;
            let _ = w.shutdown().await;
        })
        .await;
    }

    /// Leaves CONNECTED (or, with `incarnation` `None`, any non-closed
    /// state): fails every pending request, invalidates listeners and
    /// queues the lifecycle event. Returns the link for the caller to
    /// release outside the lock.
    fn teardown(
        &self,
        incarnation: Option<u64>,
        next: ConnectionState,
        cause: Option<String>,
    ) -> Option<Link> {
        let mut cell = self.inner.state.lock();
        if cell.state == ConnectionState::Closed {
            return None;
        }
        if let Some(inc) = incarnation {
            if cell.incarnation != inc || cell.state != ConnectionState::Connected {
                return None;
            }
        }
        let was_connected = cell.state == ConnectionState::Connected;
        self.inner.set_state(&mut cell, next);
        let link = cell.link.take();
        if let Some(link) = &link {
            link.checker.cancel();
        }

        let reason = cause.clone().unwrap_or_else(|| "connection closed".to_string());
        let _failed = self
            .inner
            .correlator
            .fail_all(&TransportError::closed(reason));
        let _invalidated = self.inner.listeners.invalidate_all();

        if was_connected {
            let connection_id = cell.connection_id.clone().unwrap_or_default();
            #[cfg(feature = "tracing")]
            match &cause {
                Some(c) => tracing::warn!(
                    "Connection '{}' failed: {} ({} pending requests failed)",
                    connection_id,
                    c,
                    _failed
                ),
                None => tracing::info!(
                    "Connection '{}' closed ({} pending requests failed, {} listeners invalidated)",
                    connection_id,
                    _failed,
                    _invalidated
                ),
            }
            let event = match (next, cause) {
                (ConnectionState::Failed, Some(cause)) => ConnectionEvent::Failed {
                    connection_id,
                    cause,
                },
                _ => ConnectionEvent::Closed { connection_id },
            };
            self.inner.lifecycle.enqueue(event);
        }
        drop(cell);
        self.inner.lifecycle.drain();
        link
    }

    /// Fails `incarnation` from outside its reader task.
    fn fail_incarnation(&self, incarnation: u64, cause: String) {
        let link = self.teardown(Some(incarnation), ConnectionState::Failed, Some(cause));
        if let Some(link) = link {
            link.reader_task.abort();
        }
    }

    fn reader_finished(&self, incarnation: u64, end: ReaderEnd) {
        let link = match end {
            ReaderEnd::Closed => self.teardown(Some(incarnation), ConnectionState::Closed, None),
            ReaderEnd::Failed(cause) => {
                self.teardown(Some(incarnation), ConnectionState::Failed, Some(cause))
            }
        };
        if let Some(link) = link {
            // this task is the reader; only the write half needs releasing
            tokio::spawn(async move {
                let mut w = link.writer.lock().await;
                let _ = w.shutdown().await;
            });
        }
    }

    // ────────────────────────────────────────────────────────────────
    // Inbound routing
    // ────────────────────────────────────────────────────────────────

    fn route(&self, incarnation: u64, frame: Frame) {
        match frame.kind {
            FrameKind::Response => {
                let outcome = match decode::<ResponseBody>(&*self.inner.codec, &frame.payload) {
                    Ok(body) => body.into_result().map_err(TransportError::from),
                    Err(e) => Err(TransportError::violation(format!(
                        "undecodable response: {}",
                        e
                    ))),
                };
                self.inner.correlator.resolve(incarnation, frame.id, outcome);
            }
            FrameKind::Notification => {
                match decode::<Notification>(&*self.inner.codec, &frame.payload) {
                    Ok(notification) => {
                        self.inner
                            .listeners
                            .dispatch(incarnation, ListenerId(frame.id), &notification)
                    }
                    Err(_e) => {
                        #[cfg(feature = "tracing")]
                        tracing::warn!(
                            "Protocol violation: undecodable notification for listener {}: {}",
                            frame.id,
                            _e
                        );
                    }
                }
            }
            FrameKind::Request => self.route_request(frame),
            FrameKind::Handshake | FrameKind::Close => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Protocol violation: unexpected {:?} frame after handshake",
                    frame.kind
                );
            }
        }
    }

    fn route_request(&self, frame: Frame) {
        let Some(handler) = self.inner.handler.clone() else {
            #[cfg(feature = "tracing")]
            tracing::warn!(
                "Protocol violation: request #{} sent to a client connection",
                frame.id
            );
            return;
        };
        let decoded = decode::<Operation>(&*self.inner.codec, &frame.payload)
            .map_err(|e| RemoteFault::invalid_argument(format!("undecodable request: {}", e)));
        let conn = self.clone();
        let id = frame.id;
        tokio::spawn(async move {
            let body = match decoded {
                Ok(operation) => handler.handle(&conn, operation).await,
                Err(fault) => ResponseBody::fault(fault),
            };
            if let Err(_e) = conn.respond(id, &body).await {
                #[cfg(feature = "tracing")]
                tracing::debug!("Response #{} not sent: {}", id, _e);
            }
        });
    }
}

fn new_cell() -> StateCell {
    StateCell {
        state: ConnectionState::Unconnected,
        incarnation: 0,
        connection_id: None,
        security: SecurityMode::Plain,
        auth: AuthorizationContext::default(),
        link: None,
        peer_frame_limit: DEFAULT_MAX_FRAME_SIZE,
        attempt: 0,
        last_outcome: None,
    }
}

async fn reader_loop(
    inner: Weak<Inner>,
    incarnation: u64,
    mut reader: Reader,
    max_frame_size: usize,
) {
    let end = loop {
        let frame = match read_frame(&mut reader, max_frame_size).await {
            Ok(frame) => frame,
            Err(e) if e.is_eof() => {
                break ReaderEnd::Failed("peer closed the stream without a close message".into())
            }
            Err(e) => break ReaderEnd::Failed(format!("read failed: {}", e)),
        };
        if frame.kind == FrameKind::Close {
            break ReaderEnd::Closed;
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        Connection { inner }.route(incarnation, frame);
    };
    if let Some(inner) = inner.upgrade() {
        Connection { inner }.reader_finished(incarnation, end);
    }
}

async fn connection_check(
    inner: Weak<Inner>,
    incarnation: u64,
    period: Duration,
    stop: CancellationToken,
) {
    let mut ticks = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    ticks.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = stop.cancelled() => return,
            _ = ticks.tick() => {}
        }
        let Some(inner) = inner.upgrade() else {
            return;
        };
        let conn = Connection { inner };
        let limit = conn.inner.request_timeout;
        let outcome = conn
            .request_with(&Operation::GetDefaultDomain, Some(limit), Some(&stop))
            .await;
        match outcome {
            Ok(_)
            | Err(TransportError::Remote(_))
            | Err(TransportError::PermissionDenied { .. }) => {
                #[cfg(feature = "tracing")]
                tracing::trace!("Connection check passed (incarnation {})", incarnation);
            }
            Err(TransportError::Interrupted) | Err(TransportError::ConnectionClosed { .. }) => {
                return
            }
            Err(e) => {
                conn.fail_incarnation(incarnation, format!("connection check failed: {}", e));
                return;
            }
        }
    }
}

/// Server side of the handshake, first half: channel token and hello.
pub(crate) async fn read_hello(
    stream: BoxedStream,
    codec: &dyn PayloadCodec,
    max_frame_size: usize,
) -> TransportResult<(Reader, Writer, Hello)> {
    let (mut reader, writer) = tokio::io::split(stream);
    read_channel_token(&mut reader).await?;
    let frame = read_frame(&mut reader, max_frame_size).await?;
    if frame.kind != FrameKind::Handshake {
        return Err(TransportError::violation(format!(
            "expected hello, got {:?} frame",
            frame.kind
        )));
    }
    let hello: Hello = decode(codec, &frame.payload)?;
    Ok((reader, writer, hello))
}

/// Server side of the handshake, second half.
pub(crate) async fn write_reply(
    writer: &mut Writer,
    codec: &dyn PayloadCodec,
    reply: &HandshakeReply,
) -> TransportResult<()> {
    let payload = encode(codec, reply)?;
    write_frame(writer, &Frame::new(FrameKind::Handshake, 0, payload)).await?;
    Ok(())
}
