//! Configuration types for mxlink clients and servers

use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;

use mxlink_protocol::{Credentials, DEFAULT_MAX_FRAME_SIZE};
use thiserror::Error;

/// Property key: request timeout in milliseconds
pub const REQUEST_TIMEOUT: &str = "mxlink.request.timeout";
/// Property key: connect timeout in milliseconds
pub const CONNECT_TIMEOUT: &str = "mxlink.connect.timeout";
/// Property key: how long to wait on another caller's connect attempt
pub const CONNECTED_STATE_TIMEOUT: &str = "mxlink.connected.state.timeout";
/// Property key: close frame timeout in milliseconds
pub const CLOSE_TIMEOUT: &str = "mxlink.close.timeout";
/// Property key: maximum frame size in bytes
pub const FRAME_MAX_SIZE: &str = "mxlink.frame.max.size";
/// Property key: connection check period in milliseconds (0 disables)
pub const CONNECTION_CHECK_PERIOD: &str = "mxlink.connection.check.period";
/// Property key: `none` or `replay`
pub const RESUBSCRIBE: &str = "mxlink.resubscribe";
/// Property key: server connection limit
pub const SERVER_MAX_CONNECTIONS: &str = "mxlink.server.max.connections";
/// Property key: server handshake timeout in milliseconds
pub const SERVER_HANDSHAKE_TIMEOUT: &str = "mxlink.server.handshake.timeout";
/// Property key: scheme used in connection identities
pub const SERVER_PROTOCOL: &str = "mxlink.server.protocol";
/// Property key: per-connection notification queue size
pub const SERVER_NOTIFICATION_QUEUE_SIZE: &str = "mxlink.server.notification.queue.size";

/// Invalid configuration value
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid value '{value}' for {key}: {reason}")]
pub struct ConfigError {
    pub key: String,
    pub value: String,
    pub reason: String,
}

/// What the client notification registry does with live subscriptions
/// when the connection is torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResubscribePolicy {
    /// Registrations die with the connection; callers resubscribe
    /// explicitly after a `failed` lifecycle event
    #[default]
    None,

    /// Registrations are remembered and re-issued after a successful
    /// reconnect
    Replay,
}

// ════════════════════════════════════════════════════════════════════
// ClientConfig
// ════════════════════════════════════════════════════════════════════

/// Client-side transport configuration
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Default deadline for one request/response round trip
    pub request_timeout: Duration,

    /// Deadline for dial, interceptor and handshake together
    pub connect_timeout: Duration,

    /// How long a caller waits for another caller's in-flight connect
    pub connected_state_timeout: Duration,

    /// Deadline for the best-effort close frame
    pub close_timeout: Duration,

    /// Largest accepted frame
    pub max_frame_size: usize,

    /// Credentials presented during the handshake
    pub credentials: Option<Credentials>,

    /// Subscription handling across reconnects
    pub resubscribe_policy: ResubscribePolicy,

    /// Ask the server to re-associate the previous connection identity
    /// on reconnect
    pub resume_connection_id: bool,

    /// Interval between liveness requests while CONNECTED; `None` disables
    /// the check. A check that fails or times out fails the connection.
    pub connection_check_period: Option<Duration>,
}

impl Default for ClientConfig {
    /// # Defaults
    /// - Request timeout: 30 s
    /// - Connect timeout: 5 s
    /// - Connected-state timeout: 5 s
    /// - Close timeout: 1 s
    /// - Max frame size: 16 MiB
    /// - No credentials, no resubscription, resume identity on reconnect
    /// - No connection check
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
            connected_state_timeout: Duration::from_secs(5),
            close_timeout: Duration::from_secs(1),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            credentials: None,
            resubscribe_policy: ResubscribePolicy::None,
            resume_connection_id: true,
            connection_check_period: None,
        }
    }
}

impl ClientConfig {
    /// Builds a configuration from defaults overlaid with a property map
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(d) = duration_prop(props, REQUEST_TIMEOUT)? {
            config.request_timeout = d;
        }
        if let Some(d) = duration_prop(props, CONNECT_TIMEOUT)? {
            config.connect_timeout = d;
        }
        if let Some(d) = duration_prop(props, CONNECTED_STATE_TIMEOUT)? {
            config.connected_state_timeout = d;
        }
        if let Some(d) = duration_prop(props, CLOSE_TIMEOUT)? {
            config.close_timeout = d;
        }
        if let Some(n) = number_prop(props, FRAME_MAX_SIZE)? {
            config.max_frame_size = n;
        }
        if let Some(d) = duration_prop(props, CONNECTION_CHECK_PERIOD)? {
            config.connection_check_period = Some(d).filter(|d| !d.is_zero());
        }
        if let Some(raw) = props.get(RESUBSCRIBE) {
            config.resubscribe_policy = match raw.trim().to_ascii_lowercase().as_str() {
                "none" | "false" => ResubscribePolicy::None,
                "replay" | "true" => ResubscribePolicy::Replay,
                _ => return Err(invalid(RESUBSCRIBE, raw, "expected 'none' or 'replay'")),
            };
        }
        Ok(config)
    }

    /// Sets the request timeout
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    /// Sets the connect timeout
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Sets how long to wait on another caller's connect attempt
    pub fn connected_state_timeout(mut self, timeout: Duration) -> Self {
        self.connected_state_timeout = timeout;
        self
    }

    /// Sets the close frame timeout
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }

    /// Sets the maximum frame size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Sets handshake credentials
    pub fn credentials(mut self, username: impl Into<String>, password: impl Into<String>) -> Self {
        self.credentials = Some(Credentials::new(username, password));
        self
    }

    /// Sets the resubscribe policy
    pub fn resubscribe_policy(mut self, policy: ResubscribePolicy) -> Self {
        self.resubscribe_policy = policy;
        self
    }

    /// Enables or disables identity re-association on reconnect
    pub fn resume_connection_id(mut self, resume: bool) -> Self {
        self.resume_connection_id = resume;
        self
    }

    /// Checks the connection every `period` while CONNECTED
    pub fn connection_check_period(mut self, period: Duration) -> Self {
        self.connection_check_period = Some(period).filter(|d| !d.is_zero());
        self
    }
}

// ════════════════════════════════════════════════════════════════════
// ServerConfig
// ════════════════════════════════════════════════════════════════════

/// Connector server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Address to listen on (port 0 picks a free port)
    pub bind_address: SocketAddr,

    /// Scheme used in connection identities (`<protocol>://ip:port n`)
    pub protocol: String,

    /// Maximum number of concurrent connections
    pub max_connections: usize,

    /// Deadline for the interceptor, channel token and hello
    pub handshake_timeout: Duration,

    /// Largest accepted frame
    pub max_frame_size: usize,

    /// Notifications queued per connection before new ones are dropped
    pub notification_queue_size: usize,

    /// Deadline for the best-effort close frame
    pub close_timeout: Duration,
}

impl Default for ServerConfig {
    /// # Defaults
    /// - Bind address: `127.0.0.1:0`
    /// - Protocol: `mxlink`
    /// - Max connections: 64
    /// - Handshake timeout: 5 s
    /// - Max frame size: 16 MiB
    /// - Notification queue: 1024
    /// - Close timeout: 1 s
    fn default() -> Self {
        Self {
            bind_address: SocketAddr::from(([127, 0, 0, 1], 0)),
            protocol: "mxlink".to_string(),
            max_connections: 64,
            handshake_timeout: Duration::from_secs(5),
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
            notification_queue_size: 1024,
            close_timeout: Duration::from_secs(1),
        }
    }
}

impl ServerConfig {
    /// Builds a configuration from defaults overlaid with a property map
    pub fn from_properties(props: &HashMap<String, String>) -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(n) = number_prop(props, SERVER_MAX_CONNECTIONS)? {
            config.max_connections = n;
        }
        if let Some(d) = duration_prop(props, SERVER_HANDSHAKE_TIMEOUT)? {
            config.handshake_timeout = d;
        }
        if let Some(p) = props.get(SERVER_PROTOCOL) {
            if p.is_empty() || p.contains([':', '/', ' ']) {
                return Err(invalid(SERVER_PROTOCOL, p, "not a valid scheme"));
            }
            config.protocol = p.clone();
        }
        if let Some(n) = number_prop(props, SERVER_NOTIFICATION_QUEUE_SIZE)? {
            if n == 0 {
                return Err(invalid(SERVER_NOTIFICATION_QUEUE_SIZE, "0", "must be positive"));
            }
            config.notification_queue_size = n;
        }
        if let Some(n) = number_prop(props, FRAME_MAX_SIZE)? {
            config.max_frame_size = n;
        }
        if let Some(d) = duration_prop(props, CLOSE_TIMEOUT)? {
            config.close_timeout = d;
        }
        Ok(config)
    }

    /// Sets the bind address
    pub fn bind_address(mut self, addr: SocketAddr) -> Self {
        self.bind_address = addr;
        self
    }

    /// Sets the connection identity scheme
    pub fn protocol(mut self, protocol: impl Into<String>) -> Self {
        self.protocol = protocol.into();
        self
    }

    /// Sets the maximum number of concurrent connections
    pub fn max_connections(mut self, max: usize) -> Self {
        self.max_connections = max;
        self
    }

    /// Sets the handshake timeout
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Sets the per-connection notification queue size
    pub fn notification_queue_size(mut self, size: usize) -> Self {
        self.notification_queue_size = size;
        self
    }

    /// Sets the maximum frame size
    pub fn max_frame_size(mut self, size: usize) -> Self {
        self.max_frame_size = size;
        self
    }

    /// Sets the close frame timeout
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.close_timeout = timeout;
        self
    }
}

// ────────────────────────────────────────────────────────────────────
// Property parsing
// ────────────────────────────────────────────────────────────────────

fn invalid(key: &str, value: &str, reason: &str) -> ConfigError {
    ConfigError {
        key: key.to_string(),
        value: value.to_string(),
        reason: reason.to_string(),
    }
}

fn number_prop(props: &HashMap<String, String>, key: &str) -> Result<Option<usize>, ConfigError> {
    props
        .get(key)
        .map(|raw| {
            raw.trim()
                .parse::<usize>()
                .map_err(|e| invalid(key, raw, &e.to_string()))
        })
        .transpose()
}

fn duration_prop(
    props: &HashMap<String, String>,
    key: &str,
) -> Result<Option<Duration>, ConfigError> {
    props
        .get(key)
        .map(|raw| {
            raw.trim()
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|e| invalid(key, raw, &e.to_string()))
        })
        .transpose()
}
