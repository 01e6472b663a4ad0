//! Transport providers.
//!
//! A [`Provider`] owns a [`Listener`] for incoming connections and knows how to
//! open outbound ones. The broker never binds or dials sockets itself; it only
//! looks providers up by name and calls through this contract, so the mesh can
//! swap TCP for an in-process or tunneled transport without touching services.

pub mod memory;
pub mod tcp;

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};
use tonic::transport::server::Connected;

use crate::context::Context;

pub use memory::{MemoryListener, MemoryNetwork, MemoryProvider};
pub use tcp::{TcpListenerHandle, TcpProvider};

/// Pluggable transport capability.
#[async_trait]
pub trait Provider: Send + Sync + 'static {
    /// The listener incoming connections are accepted from. Established when
    /// the provider is constructed, so this never fails.
    fn listener(&self) -> Arc<dyn Listener>;

    /// Open an outbound connection to `remote`, honouring the deadline and
    /// cancellation of `ctx`.
    async fn connect(&self, ctx: &Context, remote: &str) -> io::Result<Connection>;
}

/// Source of incoming connections.
#[async_trait]
pub trait Listener: Send + Sync + 'static {
    /// Wait for the next connection. Returns an error once closed.
    async fn accept(&self) -> io::Result<Connection>;

    /// Close the listener. Blocked accepts are woken with an error.
    fn close(&self) -> io::Result<()>;

    /// Human readable listen address.
    fn addr(&self) -> String;
}

/// Byte stream usable as a connection.
pub trait Io: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

impl<T> Io for T where T: AsyncRead + AsyncWrite + Send + Unpin + 'static {}

/// Connection metadata exposed to tonic handlers through request extensions.
#[derive(Debug, Clone)]
pub struct ConnectionInfo {
    /// Transport that produced the connection, e.g. `tcp` or `memory`
    pub transport: &'static str,
    pub local_addr: Option<String>,
    pub remote_addr: Option<SocketAddr>,
}

/// A type-erased transport connection.
pub struct Connection {
    io: Box<dyn Io>,
    info: ConnectionInfo,
}

impl Connection {
    pub fn new<T: Io>(io: T, info: ConnectionInfo) -> Self {
        Self {
            io: Box::new(io),
            info,
        }
    }

    pub fn info(&self) -> &ConnectionInfo {
        &self.info
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection").field("info", &self.info).finish()
    }
}

impl AsyncRead for Connection {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Connection {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.io).poll_write(cx, buf)
    }

    fn poll_write_vectored(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        bufs: &[io::IoSlice<'_>],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut *self.io).poll_write_vectored(cx, bufs)
    }

    fn is_write_vectored(&self) -> bool {
        self.io.is_write_vectored()
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut *self.io).poll_shutdown(cx)
    }
}

impl Connected for Connection {
    type ConnectInfo = ConnectionInfo;

    fn connect_info(&self) -> Self::ConnectInfo {
        self.info.clone()
    }
}

pub(crate) fn closed_error() -> io::Error {
    io::Error::new(io::ErrorKind::NotConnected, "use of closed listener")
}
