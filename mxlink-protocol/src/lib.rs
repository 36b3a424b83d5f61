//! # mxlink-protocol
//!
//! Wire types for the mxlink remote management transport.
//!
//! This crate holds everything both ends of a connection must agree on and
//! nothing that touches a socket directly:
//!
//! - **Resource names**: [`ResourceName`] and query [`ResourcePattern`]s
//! - **Operations**: the closed [`OperationKind`] set and the [`Operation`]
//!   request payload
//! - **Responses**: [`ResponseBody`] carrying a result or a [`RemoteFault`]
//! - **Notifications**: [`Notification`] and server-side
//!   [`NotificationFilter`]s
//! - **Handshake**: [`Hello`] / [`HandshakeReply`]
//! - **Framing**: [`Frame`], [`FrameKind`], [`read_frame`] / [`write_frame`]
//! - **Payload codec**: the pluggable [`PayloadCodec`] and the default
//!   [`JsonCodec`]
//!
//! # Wire format
//!
//! Every frame is `[length: u32][kind: u8][id: u64][payload]`. The kind is
//! one of handshake, request, response, notification or close; the id is a
//! correlation ID (request/response) or a listener ID (notification).

pub mod codec;
pub mod error;
pub mod frame;
pub mod handshake;
pub mod name;
pub mod notification;
pub mod operation;
pub mod response;

pub use codec::{decode, encode, JsonCodec, PayloadCodec};
pub use error::{ProtocolError, ProtocolResult};
pub use frame::{
    read_channel_token, read_frame, write_channel_token, write_frame, Frame, FrameKind,
    CHANNEL_TOKEN, DEFAULT_MAX_FRAME_SIZE,
};
pub use handshake::{Credentials, HandshakeReply, Hello, PROTOCOL_VERSION};
pub use name::{ResourceName, ResourcePattern};
pub use notification::{AttributeChange, Notification, NotificationFilter, ATTRIBUTE_CHANGE};
pub use operation::{
    Attribute, AttributeInfo, ListenerId, Operation, OperationInfo, OperationKind, ResourceInfo,
};
pub use response::{FaultCode, RemoteFault, ResponseBody};
