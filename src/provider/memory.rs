//! In-process provider over duplex pipes.
//!
//! Listeners are bound to an address on a shared [`MemoryNetwork`]. Dialing an
//! address hands one end of a fresh pipe to the bound listener, so two modules
//! in the same process (or a module and itself) can talk gRPC without sockets.

use std::collections::HashMap;
use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::{closed_error, Connection, ConnectionInfo, Listener, Provider};
use crate::context::Context;
use crate::error::{Error, Result};

/// Buffer size of each direction of a pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

type Backlog = mpsc::UnboundedSender<DuplexStream>;

/// Address space shared by memory providers.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    listeners: Arc<RwLock<HashMap<String, Backlog>>>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a provider listening on `addr`.
    pub fn bind(&self, addr: &str) -> Result<MemoryProvider> {
        let (tx, rx) = mpsc::unbounded_channel();
        {
            let mut listeners = self.listeners.write();
            if listeners.contains_key(addr) {
                return Err(Error::Bind {
                    addr: addr.to_string(),
                    source: io::Error::from(io::ErrorKind::AddrInUse),
                });
            }
            listeners.insert(addr.to_string(), tx);
        }

        let listener = MemoryListener {
            addr: addr.to_string(),
            backlog: Mutex::new(rx),
            closed: CancellationToken::new(),
            network: self.clone(),
        };

        Ok(MemoryProvider {
            network: self.clone(),
            listener: Arc::new(listener),
        })
    }

    fn dial(&self, remote: &str) -> io::Result<DuplexStream> {
        let backlog = self
            .listeners
            .read()
            .get(remote)
            .cloned()
            .ok_or_else(|| refused(remote))?;

        let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
        backlog.send(server).map_err(|_| refused(remote))?;
        Ok(client)
    }

    fn unbind(&self, addr: &str) {
        self.listeners.write().remove(addr);
    }
}

fn refused(remote: &str) -> io::Error {
    io::Error::new(
        io::ErrorKind::ConnectionRefused,
        format!("no memory listener on {}", remote),
    )
}

/// Provider whose connections never leave the process.
pub struct MemoryProvider {
    network: MemoryNetwork,
    listener: Arc<MemoryListener>,
}

impl MemoryProvider {
    pub fn addr(&self) -> &str {
        &self.listener.addr
    }
}

#[async_trait]
impl Provider for MemoryProvider {
    fn listener(&self) -> Arc<dyn Listener> {
        self.listener.clone()
    }

    async fn connect(&self, ctx: &Context, remote: &str) -> io::Result<Connection> {
        if let Some(done) = ctx.err() {
            return Err(done.into());
        }
        debug!("memory connect {} -> {}", self.listener.addr, remote);

        let stream = self.network.dial(remote)?;
        Ok(Connection::new(
            stream,
            ConnectionInfo {
                transport: "memory",
                local_addr: Some(self.listener.addr.clone()),
                remote_addr: None,
            },
        ))
    }
}

pub struct MemoryListener {
    addr: String,
    backlog: Mutex<mpsc::UnboundedReceiver<DuplexStream>>,
    closed: CancellationToken,
    network: MemoryNetwork,
}

#[async_trait]
impl Listener for MemoryListener {
    async fn accept(&self) -> io::Result<Connection> {
        let mut backlog = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(closed_error()),
            guard = self.backlog.lock() => guard,
        };

        let stream = tokio::select! {
            biased;
            _ = self.closed.cancelled() => return Err(closed_error()),
            stream = backlog.recv() => stream.ok_or_else(closed_error)?,
        };

        Ok(Connection::new(
            stream,
            ConnectionInfo {
                transport: "memory",
                local_addr: Some(self.addr.clone()),
                remote_addr: None,
            },
        ))
    }

    fn close(&self) -> io::Result<()> {
        self.network.unbind(&self.addr);
        self.closed.cancel();
        Ok(())
    }

    fn addr(&self) -> String {
        format!("memory://{}", self.addr)
    }
}
