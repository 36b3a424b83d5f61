//! Handshake messages.
//!
//! ```text
//! client                                   server
//!   | -- channel token (4 bytes) ----------> |
//!   | -- Handshake frame: Hello -----------> |
//!   | <- Handshake frame: Welcome|Rejected - |
//! ```

use std::fmt;

use serde::{Deserialize, Serialize};

/// Protocol version spoken by this crate.
pub const PROTOCOL_VERSION: &str = "1.0";

/// Username/password pair presented during the handshake.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// First message sent by the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Hello {
    pub version: String,
    /// Name of the client's payload codec.
    pub codec: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials: Option<Credentials>,
    /// Connection identity from a previous incarnation the client would
    /// like the server to re-associate.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_id: Option<String>,
    /// Largest frame the client accepts.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_frame_size: Option<u64>,
}

impl Hello {
    pub fn new(codec: impl Into<String>) -> Self {
        Self {
            version: PROTOCOL_VERSION.to_string(),
            codec: codec.into(),
            credentials: None,
            resume_id: None,
            max_frame_size: None,
        }
    }
}

/// Server reply to [`Hello`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HandshakeReply {
    Welcome {
        connection_id: String,
        version: String,
        /// Authenticated principal name, if any.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        principal: Option<String>,
        /// Largest frame the server accepts.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        max_frame_size: Option<u64>,
    },
    Rejected {
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn credentials_debug_hides_password() {
        let creds = Credentials::new("admin", "s3cret");
        let dbg = format!("{:?}", creds);
        assert!(dbg.contains("admin"));
        assert!(!dbg.contains("s3cret"));
    }

    #[test]
    fn frame_limit_is_optional_on_the_wire() {
        let hello: Hello = serde_json::from_str(r#"{"version":"1.0","codec":"json"}"#).unwrap();
        assert_eq!(hello.max_frame_size, None);

        let reply: HandshakeReply = serde_json::from_str(
            r#"{"status":"welcome","connection_id":"mxlink://h:1 1","version":"1.0","max_frame_size":1024}"#,
        )
        .unwrap();
        assert!(matches!(
            reply,
            HandshakeReply::Welcome {
                max_frame_size: Some(1024),
                ..
            }
        ));
    }

    #[test]
    fn reply_is_tagged_by_status() {
        let reply: HandshakeReply =
            serde_json::from_str(r#"{"status":"rejected","reason":"bad password"}"#).unwrap();
        assert_eq!(
            reply,
            HandshakeReply::Rejected {
                reason: "bad password".into()
            }
        );
    }
}
