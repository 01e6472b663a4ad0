//! Default TCP provider.

use std::io;
use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{closed_error, Connection, ConnectionInfo, Listener, Provider};
use crate::config::{Config, DEFAULT_LADDR, LADDR};
use crate::context::Context;
use crate::error::{Error, Result};

/// Provider listening on a local TCP address and dialing plain TCP.
pub struct TcpProvider {
    listener: Arc<TcpListenerHandle>,
}

impl TcpProvider {
    /// Bind a listener on `laddr`. A bare `:port` binds all interfaces.
    ///
    /// Must be called from within a tokio runtime context; outside of one it
    /// fails with [`Error::Bind`] before touching the socket.
    pub fn bind(laddr: &str) -> Result<Self> {
        let addr = normalize_laddr(laddr);
        let bind_error = |source: io::Error| Error::Bind {
            addr: laddr.to_string(),
            source,
        };

        tokio::runtime::Handle::try_current()
            .map_err(|e| bind_error(io::Error::new(io::ErrorKind::Other, e)))?;

        let std_listener = std::net::TcpListener::bind(&addr).map_err(bind_error)?;
        std_listener.set_nonblocking(true).map_err(bind_error)?;
        let listener = TcpListener::from_std(std_listener).map_err(bind_error)?;
        let local_addr = listener.local_addr().map_err(bind_error)?;

        debug!("grpc default provider listening on {}", local_addr);

        Ok(Self {
            listener: Arc::new(TcpListenerHandle::new(listener, local_addr)),
        })
    }

    /// Bind on the `laddr` configuration key, `:8080` when unset.
    pub fn from_config(config: &Config) -> Result<Self> {
        Self::bind(&config.string(LADDR, DEFAULT_LADDR))
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.listener.local_addr
    }
}

#[async_trait]
impl Provider for TcpProvider {
    fn listener(&self) -> Arc<dyn Listener> {
        self.listener.clone()
    }

    async fn connect(&self, ctx: &Context, remote: &str) -> io::Result<Connection> {
        debug!("try connect to {}", remote);

        let stream = tokio::select! {
            biased;
            done = ctx.done() => return Err(done.into()),
            stream = TcpStream::connect(remote) => stream?,
        };
        stream.set_nodelay(true)?;
        Ok(tcp_connection(stream))
    }
}

/// Closable wrapper around a tokio TCP listener.
pub struct TcpListenerHandle {
    inner: RwLock<Option<Arc<TcpListener>>>,
    closed: CancellationToken,
    local_addr: SocketAddr,
}

impl TcpListenerHandle {
    fn new(listener: TcpListener, local_addr: SocketAddr) -> Self {
        Self {
            inner: RwLock::new(Some(Arc::new(listener))),
            closed: CancellationToken::new(),
            local_addr,
        }
    }
}

#[async_trait]
impl Listener for TcpListenerHandle {
    async fn accept(&self) -> io::Result<Connection> {
        // No lock held across the await.
        let listener = self.inner.read().clone().ok_or_else(closed_error)?;

        tokio::select! {
            biased;
            _ = self.closed.cancelled() => Err(closed_error()),
            accepted = listener.accept() => {
                let (stream, peer) = accepted?;
                stream.set_nodelay(true)?;
                debug!("accepted tcp connection from {}", peer);
                Ok(tcp_connection(stream))
            }
        }
    }

    fn close(&self) -> io::Result<()> {
        // Dropping the last Arc releases the socket once in-flight accepts wake.
        self.inner.write().take();
        self.closed.cancel();
        Ok(())
    }

    fn addr(&self) -> String {
        self.local_addr.to_string()
    }
}

fn tcp_connection(stream: TcpStream) -> Connection {
    let info = ConnectionInfo {
        transport: "tcp",
        local_addr: stream.local_addr().ok().map(|addr| addr.to_string()),
        remote_addr: stream.peer_addr().ok(),
    };
    Connection::new(stream, info)
}

fn normalize_laddr(laddr: &str) -> String {
    if laddr.starts_with(':') {
        format!("0.0.0.0{}", laddr)
    } else {
        laddr.to_string()
    }
}
