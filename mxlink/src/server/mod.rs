//! Connector server.
//!
//! [`ConnectorServer`] accepts TCP connections, runs the server side of the
//! handshake, and turns each accepted stream into a server-accepted
//! [`Connection`] whose requests are authorized and dispatched against a
//! [`ResourceRegistry`].
//!
//! # Per-connection tasks
//!
//! 1. **Reader**: owned by the connection; routes requests to the session.
//! 2. **Request tasks**: one per request, so a slow operation never stalls
//!    the stream.
//! 3. **Notification pump**: drains the connection's hub outbox onto the
//!    wire. It ends when the connection leaves CONNECTED and the hub drops
//!    the outbox.

pub mod dispatch;
pub mod hub;
pub mod registry;
pub mod resources;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use mxlink_protocol::{HandshakeReply, Hello, JsonCodec, PayloadCodec, PROTOCOL_VERSION};
use parking_lot::Mutex;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::auth::{AllowAll, Anonymous, AuthorizationChecker, Authenticator, Principal};
use crate::config::ServerConfig;
use crate::connection::{advertised_limit, read_hello, write_reply, Connection, Established};
use crate::error::{TransportError, TransportResult};
use crate::interceptor::{BoxedStream, ConnectionInterceptor, NoInterceptor};
use crate::lifecycle::ConnectionObserver;

pub use dispatch::{DispatchScope, DispatchTable, Handler, HandlerFuture};
pub use hub::NotificationHub;
pub use registry::{ConnectionRegistry, ServerStats};
pub use resources::{
    ManagedResource, NotificationEmitter, ResourceFactory, ResourceRegistry, DEFAULT_DOMAIN,
};

use dispatch::ServerSession;
use hub::Outgoing;

/// Pause after a failed `accept` before trying again.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

// ════════════════════════════════════════════════════════════════════
// Builder
// ════════════════════════════════════════════════════════════════════

/// Builder for [`ConnectorServer`].
///
/// Authorization defaults to [`AllowAll`] and authentication to
/// [`Anonymous`]; a deployment that exposes the server beyond a trusted
/// network should install both explicitly.
pub struct ConnectorServerBuilder {
    config: ServerConfig,
    resources: ResourceRegistry,
    checker: Arc<dyn AuthorizationChecker>,
    authenticator: Arc<dyn Authenticator>,
    interceptor: Arc<dyn ConnectionInterceptor>,
    codec: Arc<dyn PayloadCodec>,
    table: DispatchTable,
    observers: Vec<Arc<dyn ConnectionObserver>>,
}

impl ConnectorServerBuilder {
    pub fn new(config: ServerConfig) -> Self {
        Self {
            config,
            resources: ResourceRegistry::default(),
            checker: Arc::new(AllowAll),
            authenticator: Arc::new(Anonymous),
            interceptor: Arc::new(NoInterceptor),
            codec: Arc::new(JsonCodec),
            table: DispatchTable::standard(),
            observers: Vec::new(),
        }
    }

    /// Serves `resources` instead of a fresh, empty registry.
    pub fn with_resources(mut self, resources: ResourceRegistry) -> Self {
        self.resources = resources;
        self
    }

    pub fn with_authorization(mut self, checker: impl AuthorizationChecker) -> Self {
        self.checker = Arc::new(checker);
        self
    }

    pub fn with_authenticator(mut self, authenticator: impl Authenticator) -> Self {
        self.authenticator = Arc::new(authenticator);
        self
    }

    pub fn with_interceptor(mut self, interceptor: impl ConnectionInterceptor) -> Self {
        self.interceptor = Arc::new(interceptor);
        self
    }

    pub fn with_codec(mut self, codec: impl PayloadCodec) -> Self {
        self.codec = Arc::new(codec);
        self
    }

    pub fn with_dispatch_table(mut self, table: DispatchTable) -> Self {
        self.table = table;
        self
    }

    /// Observer attached to every accepted connection.
    pub fn with_observer(mut self, observer: Arc<dyn ConnectionObserver>) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn build(self) -> ConnectorServer {
        ConnectorServer {
            shared: Arc::new(Shared {
                resources: self.resources,
                checker: self.checker,
                authenticator: self.authenticator,
                interceptor: self.interceptor,
                codec: self.codec,
                table: Arc::new(self.table),
                observers: self.observers,
                connections: ConnectionRegistry::new(),
                slots: Arc::new(Semaphore::new(self.config.max_connections)),
                config: self.config,
            }),
            running: Mutex::new(None),
        }
    }
}

// ════════════════════════════════════════════════════════════════════
// ConnectorServer
// ════════════════════════════════════════════════════════════════════

struct Shared {
    config: ServerConfig,
    resources: ResourceRegistry,
    checker: Arc<dyn AuthorizationChecker>,
    authenticator: Arc<dyn Authenticator>,
    interceptor: Arc<dyn ConnectionInterceptor>,
    codec: Arc<dyn PayloadCodec>,
    table: Arc<DispatchTable>,
    observers: Vec<Arc<dyn ConnectionObserver>>,
    connections: ConnectionRegistry,
    /// One permit per connection, taken before its handshake starts.
    slots: Arc<Semaphore>,
}

struct Running {
    local_addr: SocketAddr,
    cancel: CancellationToken,
    accept_task: JoinHandle<()>,
}

/// Accepts and serves mxlink connections.
///
/// Every server owns its own registries; nothing is process-global.
pub struct ConnectorServer {
    shared: Arc<Shared>,
    running: Mutex<Option<Running>>,
}

impl ConnectorServer {
    pub fn builder(config: ServerConfig) -> ConnectorServerBuilder {
        ConnectorServerBuilder::new(config)
    }

    /// Binds the listener and starts accepting. Returns the bound address.
    pub async fn start(&self) -> TransportResult<SocketAddr> {
        let listener = TcpListener::bind(self.shared.config.bind_address).await?;
        let local_addr = listener.local_addr()?;

        let mut running = self.running.lock();
        if running.is_some() {
            return Err(TransportError::invalid_state("server is already running"));
        }
        let cancel = CancellationToken::new();
        let accept_task = tokio::spawn(accept_loop(
            self.shared.clone(),
            listener,
            cancel.clone(),
        ));
        *running = Some(Running {
            local_addr,
            cancel,
            accept_task,
        });

        #[cfg(feature = "tracing")]
        tracing::info!("Connector server listening on {}", local_addr);
        Ok(local_addr)
    }

    /// Stops accepting and closes every live connection. Idempotent.
    pub async fn stop(&self) {
        let Some(running) = self.running.lock().take() else {
            return;
        };
        running.cancel.cancel();
        let _ = running.accept_task.await;

        let connections = self.shared.connections.all();
        let _closed = connections.len();
        futures_util::future::join_all(connections.iter().map(|c| c.close())).await;

        #[cfg(feature = "tracing")]
        tracing::info!(
            "Connector server on {} stopped ({} connections closed)",
            running.local_addr,
            _closed
        );
    }

    pub fn is_running(&self) -> bool {
        self.running.lock().is_some()
    }

    /// Address of the listener while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.running.lock().as_ref().map(|r| r.local_addr)
    }

    /// Closes every connection accepted on local `port`. Returns how many
    /// were closed.
    pub async fn close_connections_on_port(&self, port: u16) -> usize {
        let connections = self.shared.connections.on_port(port);
        futures_util::future::join_all(connections.iter().map(|c| c.close())).await;
        connections.len()
    }

    pub fn connections(&self) -> &ConnectionRegistry {
        &self.shared.connections
    }

    pub fn resources(&self) -> &ResourceRegistry {
        &self.shared.resources
    }

    pub fn stats(&self) -> ServerStats {
        self.shared.connections.stats()
    }
}

impl Drop for ConnectorServer {
    fn drop(&mut self) {
        if let Some(running) = self.running.get_mut().take() {
            running.cancel.cancel();
        }
    }
}

impl std::fmt::Debug for ConnectorServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectorServer")
            .field("local_addr", &self.local_addr())
            .field("stats", &self.stats())
            .finish()
    }
}

// ════════════════════════════════════════════════════════════════════
// Accept path
// ════════════════════════════════════════════════════════════════════

async fn accept_loop(shared: Arc<Shared>, listener: TcpListener, cancel: CancellationToken) {
    loop {
        let accepted = tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => accepted,
        };
        match accepted {
            Ok((stream, peer)) => {
                // pending handshakes hold a slot too
                let Ok(permit) = shared.slots.clone().try_acquire_owned() else {
                    #[cfg(feature = "tracing")]
                    tracing::warn!(
                        "Refusing {}: connection limit {} reached",
                        peer,
                        shared.config.max_connections
                    );
                    continue;
                };
                let _ = stream.set_nodelay(true);
                let port = match stream.local_addr() {
                    Ok(addr) => addr.port(),
                    Err(_) => continue,
                };
                let shared = shared.clone();
                tokio::spawn(async move {
                    shared
                        .accept(Box::new(stream), peer, port, permit)
                        .await
                });
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Accept failed: {}", _e);
                tokio::time::sleep(ACCEPT_BACKOFF).await;
            }
        }
    }
}

impl Shared {
    async fn accept(
        self: Arc<Self>,
        stream: BoxedStream,
        peer: SocketAddr,
        port: u16,
        permit: OwnedSemaphorePermit,
    ) {
        let limit = self.config.handshake_timeout;
        let established = match tokio::time::timeout(limit, self.handshake(stream, peer)).await {
            Ok(Ok(established)) => established,
            Ok(Err(_e)) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Handshake with {} failed: {}", peer, _e);
                return;
            }
            Err(_) => {
                #[cfg(feature = "tracing")]
                tracing::warn!("Handshake with {} timed out after {:?}", peer, limit);
                return;
            }
        };
        self.admit(established, port, permit);
    }

    async fn handshake(
        &self,
        stream: BoxedStream,
        peer: SocketAddr,
    ) -> TransportResult<Established> {
        let (stream, security) = self
            .interceptor
            .on_server_accept(stream)
            .await
            .map_err(|e| TransportError::handshake(format!("interceptor: {}", e)))?;
        let (reader, mut writer, hello) =
            read_hello(stream, &*self.codec, self.config.max_frame_size).await?;

        let principal = match self.evaluate(&hello, peer).await {
            Ok(principal) => principal,
            Err(reason) => {
                let reply = HandshakeReply::Rejected {
                    reason: reason.clone(),
                };
                let _ = write_reply(&mut writer, &*self.codec, &reply).await;
                return Err(TransportError::handshake(reason));
            }
        };

        let connection_id = self.assign_id(hello.resume_id, peer);
        let reply = HandshakeReply::Welcome {
            connection_id: connection_id.clone(),
            version: PROTOCOL_VERSION.to_string(),
            principal: principal.as_ref().map(|p| p.name.clone()),
            max_frame_size: Some(self.config.max_frame_size as u64),
        };
        if let Err(e) = write_reply(&mut writer, &*self.codec, &reply).await {
            self.connections.release(connection_id);
            return Err(e);
        }

        Ok(Established {
            reader,
            writer,
            connection_id,
            security,
            principal,
            peer_frame_limit: advertised_limit(hello.max_frame_size),
        })
    }

    /// Decides the hello: the principal to bind, or a rejection reason.
    async fn evaluate(&self, hello: &Hello, peer: SocketAddr) -> Result<Option<Principal>, String> {
        if hello.version != PROTOCOL_VERSION {
            return Err(format!(
                "unsupported protocol version {} (server speaks {})",
                hello.version, PROTOCOL_VERSION
            ));
        }
        if hello.codec != self.codec.name() {
            return Err(format!(
                "unsupported codec '{}' (server uses '{}')",
                hello.codec,
                self.codec.name()
            ));
        }
        self.authenticator
            .authenticate(hello.credentials.as_ref(), peer)
            .await
            .map_err(|e| e.to_string())
    }

    /// Re-associates a resumed identity this server issued and has since
    /// released, otherwise issues `"<protocol>://<ip>:<port> <n>"`.
    fn assign_id(&self, resume_id: Option<String>, peer: SocketAddr) -> String {
        let scheme = format!("{}://", self.config.protocol);
        if let Some(id) = resume_id {
            if self.connections.claim_released(&id) {
                return id;
            }
            #[cfg(feature = "tracing")]
            tracing::debug!("Not resuming '{}' for {}: not a released identity", id, peer);
        }
        format!(
            "{}{}:{} {}",
            scheme,
            peer.ip(),
            peer.port(),
            self.connections.next_sequence()
        )
    }

    fn admit(&self, established: Established, port: u16, permit: OwnedSemaphorePermit) {
        let connection_id = established.connection_id.clone();
        let hub = self.resources.hub().clone();
        let outbox = hub.attach(&connection_id, self.config.notification_queue_size);

        let session = ServerSession::new(
            dispatch::DispatchScope::new(self.resources.clone(), connection_id.clone()),
            self.table.clone(),
            self.checker.clone(),
        );
        let mut observers = self.observers.clone();
        observers.push(Arc::new(Reaper {
            connections: self.connections.clone(),
            hub: hub.clone(),
            permit: Mutex::new(Some(permit)),
        }));

        let connection = Connection::accepted(
            established,
            self.codec.clone(),
            Arc::new(session),
            self.config.max_frame_size,
            self.config.close_timeout,
            observers,
        );
        self.connections
            .insert(connection_id.clone(), port, connection.clone());
        if !connection.is_connected() {
            // torn down before it was registered; the reaper already ran
            hub.detach(&connection_id);
            self.connections.remove(&connection_id);
            return;
        }

        #[cfg(feature = "tracing")]
        tracing::info!("Accepted connection '{}'", connection_id);

        tokio::spawn(pump(connection, outbox));
    }
}

/// Drops a connection's subscriptions, registry entry and connection slot
/// once it leaves CONNECTED.
struct Reaper {
    connections: ConnectionRegistry,
    hub: NotificationHub,
    permit: Mutex<Option<OwnedSemaphorePermit>>,
}

impl Reaper {
    fn reap(&self, connection_id: &str) {
        // detach first: nothing may be queued for an identity that is free
        let _subscriptions = self.hub.detach(connection_id);
        self.connections.remove(connection_id);
        drop(self.permit.lock().take());
        #[cfg(feature = "tracing")]
        tracing::debug!(
            "Released '{}' ({} subscriptions removed)",
            connection_id,
            _subscriptions
        );
    }
}

impl ConnectionObserver for Reaper {
    fn closed(&self, connection_id: &str) {
        self.reap(connection_id);
    }

    fn failed(&self, connection_id: &str, _cause: &str) {
        self.reap(connection_id);
    }
}

async fn pump(connection: Connection, mut outbox: mpsc::Receiver<Outgoing>) {
    while let Some((listener_id, notification)) = outbox.recv().await {
        match connection.notify(listener_id, &notification).await {
            Ok(()) => {}
            Err(TransportError::FrameTooLarge {
                size: _size,
                limit: _limit,
            }) => {
                #[cfg(feature = "tracing")]
                tracing::warn!(
                    "Dropped {} notification for {}: {} bytes over the peer limit of {}",
                    notification.kind,
                    listener_id,
                    _size,
                    _limit
                );
            }
            Err(_e) => {
                #[cfg(feature = "tracing")]
                tracing::debug!("Notification pump stopped: {}", _e);
                break;
            }
        }
    }
}
