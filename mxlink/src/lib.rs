//! mxlink Remote Management Transport
//!
//! This library lets a client process read and write attributes, invoke
//! operations and receive notifications from manageable resources living in
//! a remote process, over one bidirectional byte stream.
//!
//! ## Overview
//!
//! - **Connection**: `UNCONNECTED → CONNECTING → CONNECTED → FAILED | CLOSED`
//!   state machine with a dedicated reader task per incarnation
//! - **Correlation**: many concurrent callers share one connection; responses
//!   are matched purely by correlation ID, in any completion order
//! - **Notifications**: server-side filtered, listener-keyed delivery with a
//!   client-side handback
//! - **Authorization**: one check per operation kind, deny by default
//! - **Lifecycle**: ordered `opened` / `closed` / `failed` events
//!
//! ## Usage
//!
//! ```no_run
//! use std::sync::Arc;
//! use mxlink::{ClientConfig, ConnectorServer, RemoteClient, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let server = ConnectorServer::builder(ServerConfig::default()).build();
//!     let addr = server.start().await?;
//!
//!     let client = RemoteClient::tcp(addr.to_string(), ClientConfig::default());
//!     client.connect().await?;
//!     println!("{} resources", client.resource_count().await?);
//!
//!     client.close().await;
//!     server.stop().await;
//!     Ok(())
//! }
//! ```

pub mod auth;
pub mod client;
pub mod config;
pub mod connection;
pub mod correlator;
pub mod error;
pub mod interceptor;
pub mod lifecycle;
pub mod listeners;
pub mod server;
pub mod state;

// Re-export main types for convenience
pub use auth::{
    authorize, AccessControlList, AccessLevel, AllowAll, Anonymous, AuthError, Authenticator,
    AuthorizationChecker, AuthorizationContext, CheckResult, DenyAll, PermissionDenied, Principal,
    StaticCredentials,
};
pub use client::RemoteClient;
pub use config::{ClientConfig, ConfigError, ResubscribePolicy, ServerConfig};
pub use connection::{Connection, RequestHandler};
pub use correlator::{Correlator, CorrelatorStats, PendingRequest, Resolution};
pub use error::{TransportError, TransportResult};
pub use interceptor::{
    AsyncStream, BoxedStream, ConnectionInterceptor, Dialer, NoInterceptor, TcpDialer,
};
pub use lifecycle::{ConnectionEvent, ConnectionObserver, LifecycleNotifier, ObserverFn, ObserverId};
pub use listeners::{
    DurableSubscription, Handback, ListenerRegistration, ListenerRegistry, ListenerStats,
    NotificationListener,
};
pub use server::{
    ConnectionRegistry, ConnectorServer, ConnectorServerBuilder, DispatchScope, DispatchTable,
    ManagedResource, NotificationEmitter, NotificationHub, ResourceRegistry, ServerStats,
};
pub use state::{ConnectionState, Direction, SecurityMode};

pub use mxlink_protocol as protocol;
