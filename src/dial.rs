//! Dial options and the provider-backed channel connector.
//!
//! Options are an ordered list. The broker always puts its own dialer at the
//! head, followed by its defaults, then whatever the caller passed:
//!
//! ```text
//! [Dialer(provider), FailOnNonTempDialError(true), caller options...]
//! ```
//!
//! The first `Dialer` wins, and callers cannot construct one, so the provider
//! connector stays authoritative. For every other option the last occurrence
//! wins, which lets callers add or relax orthogonal behaviour.

use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;

use hyper_util::rt::TokioIo;
use parking_lot::Mutex;
use tonic::codegen::{BoxFuture, Service};
use tonic::transport::{Endpoint, Uri};

use crate::broker::Broker;
use crate::context::Context;
use crate::error::{Error, Result};
use crate::provider::Connection;

/// Handle to the broker's provider dialer. Only the broker creates these.
#[derive(Clone)]
pub struct ProviderDialer {
    pub(crate) broker: Broker,
}

/// A single dial option.
#[derive(Clone)]
pub enum DialOption {
    /// Transport dial function; injected by the broker
    Dialer(ProviderDialer),
    /// Plaintext HTTP/2; a bare `host:port` target gets an `http://` scheme
    Insecure,
    /// Fail immediately on errors that are not temporary instead of retrying
    /// until the deadline
    FailOnNonTempDialError(bool),
    /// Bound on establishing a transport connection
    ConnectTimeout(Duration),
    /// Per-request timeout applied by the channel
    Timeout(Duration),
    UserAgent(String),
}

/// Options folded from an ordered [`DialOption`] list.
#[derive(Clone, Default)]
pub struct DialOptions {
    pub(crate) dialer: Option<ProviderDialer>,
    pub(crate) insecure: bool,
    pub(crate) fail_on_non_temp: bool,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) timeout: Option<Duration>,
    pub(crate) user_agent: Option<String>,
}

impl DialOptions {
    pub fn new<I>(options: I) -> Self
    where
        I: IntoIterator<Item = DialOption>,
    {
        let mut folded = Self::default();
        for option in options {
            match option {
                DialOption::Dialer(dialer) => {
                    if folded.dialer.is_none() {
                        folded.dialer = Some(dialer);
                    }
                }
                DialOption::Insecure => folded.insecure = true,
                DialOption::FailOnNonTempDialError(enabled) => folded.fail_on_non_temp = enabled,
                DialOption::ConnectTimeout(timeout) => folded.connect_timeout = Some(timeout),
                DialOption::Timeout(timeout) => folded.timeout = Some(timeout),
                DialOption::UserAgent(agent) => folded.user_agent = Some(agent),
            }
        }
        folded
    }

    pub fn is_insecure(&self) -> bool {
        self.insecure
    }

    pub fn fails_on_non_temp(&self) -> bool {
        self.fail_on_non_temp
    }

    pub fn connect_timeout(&self) -> Option<Duration> {
        self.connect_timeout
    }

    /// Build the tonic endpoint for `url`.
    pub(crate) fn endpoint(&self, url: &str) -> Result<Endpoint> {
        let url = url.trim();
        if url.is_empty() {
            return Err(invalid(url, "empty target"));
        }

        let url = if let Some((scheme, _)) = url.split_once("://") {
            match scheme {
                "http" => url.to_string(),
                "https" => return Err(Error::NoTransportSecurity(url.to_string())),
                other => return Err(invalid(url, &format!("unsupported scheme {}", other))),
            }
        } else if self.insecure {
            format!("http://{}", url)
        } else {
            return Err(Error::NoTransportSecurity(url.to_string()));
        };

        let mut endpoint =
            Endpoint::from_shared(url.clone()).map_err(|e| invalid(&url, &e.to_string()))?;
        if let Some(timeout) = self.connect_timeout {
            endpoint = endpoint.connect_timeout(timeout);
        }
        if let Some(timeout) = self.timeout {
            endpoint = endpoint.timeout(timeout);
        }
        if let Some(agent) = &self.user_agent {
            endpoint = endpoint
                .user_agent(agent.clone())
                .map_err(|e| invalid(&url, &e.to_string()))?;
        }
        Ok(endpoint)
    }
}

fn invalid(addr: &str, reason: &str) -> Error {
    Error::InvalidAddress {
        addr: addr.to_string(),
        reason: reason.to_string(),
    }
}

/// `host:port` the provider should connect to for `uri`.
pub(crate) fn remote_addr(uri: &Uri) -> Result<String> {
    let authority = uri
        .authority()
        .ok_or_else(|| invalid(&uri.to_string(), "missing host"))?;
    match authority.port_u16() {
        Some(_) => Ok(authority.as_str().to_string()),
        None => Ok(format!("{}:80", authority.host())),
    }
}

/// Channel connector that opens transport connections through the provider.
///
/// The connection established eagerly by the broker is handed out first;
/// reconnects dial the provider again.
#[derive(Clone)]
pub(crate) struct ProviderConnector {
    dialer: ProviderDialer,
    connect_timeout: Duration,
    prepared: Arc<Mutex<Option<Connection>>>,
}

impl ProviderConnector {
    pub(crate) fn new(
        dialer: ProviderDialer,
        connect_timeout: Duration,
        prepared: Connection,
    ) -> Self {
        Self {
            dialer,
            connect_timeout,
            prepared: Arc::new(Mutex::new(Some(prepared))),
        }
    }
}

impl Service<Uri> for ProviderConnector {
    type Response = TokioIo<Connection>;
    type Error = Error;
    type Future = BoxFuture<Self::Response, Self::Error>;

    fn poll_ready(&mut self, _cx: &mut TaskContext<'_>) -> Poll<Result<()>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, uri: Uri) -> Self::Future {
        let prepared = self.prepared.lock().take();
        let broker = self.dialer.broker.clone();
        let connect_timeout = self.connect_timeout;

        Box::pin(async move {
            if let Some(conn) = prepared {
                return Ok(TokioIo::new(conn));
            }
            let remote = remote_addr(&uri)?;
            let ctx = Context::background().with_timeout(connect_timeout);
            let conn = broker.connect_remote(&ctx, &remote).await?;
            Ok(TokioIo::new(conn))
        })
    }
}
