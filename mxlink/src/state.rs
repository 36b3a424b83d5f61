//! Connection state, direction and security mode.

use std::fmt;

/// Lifecycle state of a [`Connection`](crate::Connection).
///
/// ```text
/// Unconnected ─► Connecting ─► Connected ─► Failed ─┐
///                    ▲  │          │                │
///                    │  └─► Failed └─► Closed       │
///                    └──────────────────────────────┘
/// ```
///
/// `Closed` is terminal and reachable from every state through `close()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Unconnected,
    Connecting,
    Connected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States from which `connect()` may start a handshake.
    pub fn can_connect(self) -> bool {
        matches!(self, Self::Unconnected | Self::Failed)
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Closed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Unconnected => "UNCONNECTED",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Failed => "FAILED",
            Self::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Which side created the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Dialed by this process.
    ClientInitiated,
    /// Accepted by a connector server.
    ServerAccepted,
}

/// Security of the underlying stream, as reported by the interceptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityMode {
    #[default]
    Plain,
    Secured,
}
