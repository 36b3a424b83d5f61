//! Stream establishment hooks.
//!
//! A [`Dialer`] produces the raw client stream; a [`ConnectionInterceptor`]
//! may wrap it (for instance in TLS) once after the raw connect and before
//! the channel token is written, and once on the server after accept and
//! before the token is read.

use std::io;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;

use crate::state::SecurityMode;

/// Duplex byte stream usable as a connection transport.
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Type-erased transport stream.
pub type BoxedStream = Box<dyn AsyncStream>;

/// Stream wrapping hook.
#[async_trait]
pub trait ConnectionInterceptor: Send + Sync + 'static {
    /// Client side, after the raw connect.
    async fn on_client_connect(
        &self,
        stream: BoxedStream,
    ) -> io::Result<(BoxedStream, SecurityMode)> {
        Ok((stream, SecurityMode::Plain))
    }

    /// Server side, after accept.
    async fn on_server_accept(
        &self,
        stream: BoxedStream,
    ) -> io::Result<(BoxedStream, SecurityMode)> {
        Ok((stream, SecurityMode::Plain))
    }
}

/// Pass-through interceptor.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoInterceptor;

impl ConnectionInterceptor for NoInterceptor {}

/// Opens raw client streams.
#[async_trait]
pub trait Dialer: Send + Sync + 'static {
    async fn dial(&self) -> io::Result<BoxedStream>;

    /// Endpoint description for logs and errors.
    fn endpoint(&self) -> String;
}

/// Dials a TCP address.
#[derive(Debug, Clone)]
pub struct TcpDialer {
    address: String,
}

impl TcpDialer {
    pub fn new(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
        }
    }
}

#[async_trait]
impl Dialer for TcpDialer {
    async fn dial(&self) -> io::Result<BoxedStream> {
        let stream = TcpStream::connect(&self.address).await?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }

    fn endpoint(&self) -> String {
        self.address.clone()
    }
}
