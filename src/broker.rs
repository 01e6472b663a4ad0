//! Connection broker.
//!
//! The broker decouples gRPC dial and accept from the concrete [`Provider`].
//! The provider is registered under a well-known name somewhere else in the
//! mesh and may not exist yet when the broker is created, so every operation
//! re-resolves it through the host's [`ProviderResolver`]:
//!
//! - `accept` polls until a provider appears (startup ordering is expected to
//!   settle), and can always be interrupted with `close`
//! - `dial` makes a single bounded attempt per try; a missing provider is a
//!   temporary error the retry logic may wait out until the deadline

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::Stream;
use parking_lot::RwLock;
use tokio_util::sync::CancellationToken;
use tonic::transport::Channel;
use tracing::{debug, error, trace};

use crate::config::{GrpcSettings, DEFAULT_DIAL_TIMEOUT, DEFAULT_POLL_INTERVAL};
use crate::context::{Context, Done};
use crate::dial::{remote_addr, DialOption, DialOptions, ProviderConnector, ProviderDialer};
use crate::error::{Error, Result};
use crate::mesh::{Lookup, ProviderResolver};
use crate::provider::{Connection, Provider};

/// First delay between dial attempts; doubles up to [`MAX_DIAL_BACKOFF`].
const INITIAL_DIAL_BACKOFF: Duration = Duration::from_millis(100);
const MAX_DIAL_BACKOFF: Duration = Duration::from_secs(1);

/// How a provider name that was never registered is treated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum ResolvePolicy {
    /// Treat it like a provider that is not ready yet
    #[default]
    Tolerant,
    /// Treat it as a configuration defect; operations fail with
    /// [`Error::ProviderNotRegistered`] and background loops stop
    Strict,
}

impl FromStr for ResolvePolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "tolerant" => Ok(ResolvePolicy::Tolerant),
            "strict" => Ok(ResolvePolicy::Strict),
            other => Err(Error::Config(format!("unknown provider policy {:?}", other))),
        }
    }
}

/// Dial-side API shared by the broker and the module.
#[async_trait]
pub trait Client: Send + Sync {
    async fn dial(&self, ctx: &Context, url: &str, options: Vec<DialOption>) -> Result<Channel>;
}

#[derive(Debug, Clone, Copy)]
struct Tuning {
    policy: ResolvePolicy,
    poll_interval: Duration,
    dial_timeout: Duration,
}

struct Inner {
    resolver: Arc<dyn ProviderResolver>,
    provider: String,
    tuning: RwLock<Tuning>,
    closed: CancellationToken,
}

/// Resolves the active provider by name and dials/accepts through it.
///
/// Cloning is cheap; clones share the resolver and the closed state.
#[derive(Clone)]
pub struct Broker {
    inner: Arc<Inner>,
}

impl Broker {
    pub fn new(resolver: Arc<dyn ProviderResolver>, provider: impl Into<String>) -> Self {
        Self {
            inner: Arc::new(Inner {
                resolver,
                provider: provider.into(),
                tuning: RwLock::new(Tuning {
                    policy: ResolvePolicy::default(),
                    poll_interval: DEFAULT_POLL_INTERVAL,
                    dial_timeout: DEFAULT_DIAL_TIMEOUT,
                }),
                closed: CancellationToken::new(),
            }),
        }
    }

    pub fn with_policy(self, policy: ResolvePolicy) -> Self {
        self.inner.tuning.write().policy = policy;
        self
    }

    pub fn with_poll_interval(self, poll_interval: Duration) -> Self {
        self.inner.tuning.write().poll_interval = poll_interval;
        self
    }

    pub fn with_dial_timeout(self, dial_timeout: Duration) -> Self {
        self.inner.tuning.write().dial_timeout = dial_timeout;
        self
    }

    /// Apply module settings read at Begin.
    pub fn configure(&self, settings: &GrpcSettings) {
        let mut tuning = self.inner.tuning.write();
        tuning.policy = settings.policy;
        tuning.poll_interval = settings.poll_interval;
        tuning.dial_timeout = settings.dial_timeout;
    }

    /// Name the provider is looked up under.
    pub fn provider_name(&self) -> &str {
        &self.inner.provider
    }

    pub fn policy(&self) -> ResolvePolicy {
        self.inner.tuning.read().policy
    }

    fn tuning(&self) -> Tuning {
        *self.inner.tuning.read()
    }

    /// Look the provider up. `Ok(None)` means "not yet"; under the strict
    /// policy a name that was never registered is an error.
    pub fn resolve_provider(&self) -> Result<Option<Arc<dyn Provider>>> {
        match self.inner.resolver.lookup(&self.inner.provider) {
            Lookup::Ready(provider) => Ok(Some(provider)),
            Lookup::Pending => Ok(None),
            Lookup::Unregistered => match self.policy() {
                ResolvePolicy::Tolerant => Ok(None),
                ResolvePolicy::Strict => {
                    error!("expect provider {}", self.inner.provider);
                    Err(Error::ProviderNotRegistered {
                        name: self.inner.provider.clone(),
                    })
                }
            },
        }
    }

    /// Wait for and return the next incoming connection.
    ///
    /// Polls for the provider without bound while it is absent. Returns
    /// [`Error::Closed`] once [`Broker::close`] has been called.
    pub async fn accept(&self) -> Result<Connection> {
        let closed = &self.inner.closed;
        loop {
            if closed.is_cancelled() {
                return Err(Error::Closed);
            }

            if let Some(provider) = self.resolve_provider()? {
                let listener = provider.listener();
                return tokio::select! {
                    biased;
                    _ = closed.cancelled() => Err(Error::Closed),
                    accepted = listener.accept() => accepted.map_err(|e| {
                        if closed.is_cancelled() { Error::Closed } else { Error::Io(e) }
                    }),
                };
            }

            let poll_interval = self.tuning().poll_interval;
            trace!(
                "provider {} not ready, retry accept in {:?}",
                self.inner.provider,
                poll_interval
            );
            tokio::select! {
                biased;
                _ = closed.cancelled() => return Err(Error::Closed),
                _ = tokio::time::sleep(poll_interval) => {}
            }
        }
    }

    /// Accepted connections as a stream.
    ///
    /// Transient accept errors are yielded and accepting continues on the
    /// next poll, so consumers pace retries themselves. The stream ends after
    /// yielding a terminal error ([`Error::is_terminal`]).
    pub fn incoming(&self) -> impl Stream<Item = Result<Connection>> + Send + 'static {
        let broker = self.clone();
        async_stream::stream! {
            loop {
                let accepted = broker.accept().await;
                let terminal = matches!(&accepted, Err(err) if err.is_terminal());
                yield accepted;
                if terminal {
                    break;
                }
            }
        }
    }

    /// Close the broker and the current provider's listener. Any blocked
    /// accept is unblocked with an error.
    pub fn close(&self) -> Result<()> {
        self.inner.closed.cancel();
        if let Ok(Some(provider)) = self.resolve_provider() {
            provider.listener().close()?;
        }
        Ok(())
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.is_cancelled()
    }

    /// Listen address of the current provider, or a loopback placeholder
    /// while none is resolvable.
    pub fn addr(&self) -> String {
        match self.resolve_provider() {
            Ok(Some(provider)) => provider.listener().addr(),
            _ => "127.0.0.1:0".to_string(),
        }
    }

    /// The broker's own options, always at the head of the dial list.
    pub fn default_options(&self) -> Vec<DialOption> {
        vec![
            DialOption::Dialer(ProviderDialer {
                broker: self.clone(),
            }),
            DialOption::FailOnNonTempDialError(true),
        ]
    }

    /// Create a gRPC channel to `url` whose transport goes through the
    /// provider.
    ///
    /// The transport connection is made before returning, retrying
    /// temporary failures with backoff until the context deadline or the
    /// connect timeout expires. The channel itself speaks HTTP/2 lazily and
    /// reconnects through the provider.
    pub async fn dial<I>(&self, ctx: &Context, url: &str, options: I) -> Result<Channel>
    where
        I: IntoIterator<Item = DialOption>,
    {
        let options = DialOptions::new(self.default_options().into_iter().chain(options));
        let endpoint = options.endpoint(url)?;
        let remote = remote_addr(endpoint.uri())?;
        let connect_timeout = options
            .connect_timeout
            .unwrap_or_else(|| self.tuning().dial_timeout);
        let dialer = options.dialer.clone().unwrap_or(ProviderDialer {
            broker: self.clone(),
        });

        let ctx = ctx.with_timeout(connect_timeout);
        let conn = dialer.broker.dial_with_retry(&ctx, &remote, &options).await?;
        debug!("dial success with conn {:?} -> {}", conn.info().local_addr, remote);

        let connector = ProviderConnector::new(dialer, connect_timeout, conn);
        Ok(endpoint.connect_with_connector_lazy(connector))
    }

    async fn dial_with_retry(
        &self,
        ctx: &Context,
        remote: &str,
        options: &DialOptions,
    ) -> Result<Connection> {
        let mut backoff = INITIAL_DIAL_BACKOFF;
        let mut last_error: Option<Error> = None;

        loop {
            if let Some(done) = ctx.err() {
                return Err(finish(done, last_error));
            }

            match self.connect_remote(ctx, remote).await {
                Ok(conn) => return Ok(conn),
                Err(err) => {
                    if let Some(done) = ctx.err() {
                        return Err(finish(done, Some(err)));
                    }
                    if options.fail_on_non_temp && !err.is_temporary() {
                        return Err(err);
                    }
                    debug!("grpc dial to {} failed, retry in {:?}: {}", remote, backoff, err);
                    last_error = Some(err);
                }
            }

            tokio::select! {
                biased;
                done = ctx.done() => return Err(finish(done, last_error)),
                _ = tokio::time::sleep(backoff) => {}
            }
            backoff = (backoff * 2).min(MAX_DIAL_BACKOFF);
        }
    }

    /// One transport connection attempt through the provider.
    ///
    /// Fails immediately with [`Error::ProviderUnavailable`] when no provider
    /// is resolvable; errors are tagged with the remote address.
    pub(crate) async fn connect_remote(&self, ctx: &Context, remote: &str) -> Result<Connection> {
        debug!("grpc dial to {}", remote);

        let provider = match self.resolve_provider()? {
            Some(provider) => provider,
            None => {
                debug!("grpc provider {} not exists ...", self.inner.provider);
                return Err(Error::ProviderUnavailable {
                    name: self.inner.provider.clone(),
                });
            }
        };

        let sub_ctx = ctx.with_timeout(self.tuning().dial_timeout);
        let connected = tokio::select! {
            biased;
            done = sub_ctx.done() => Err(done.into()),
            connected = provider.connect(&sub_ctx, remote) => connected,
        };

        connected.map_err(|source| {
            error!("grpc dial to {} error: {}", remote, source);
            Error::Dial {
                remote: remote.to_string(),
                source,
            }
        })
    }
}

/// Error returned when the dial context finishes. A deadline reports the
/// last attempt's error so callers see why dialing never succeeded.
fn finish(done: Done, last_error: Option<Error>) -> Error {
    match (done, last_error) {
        (Done::DeadlineExceeded, Some(err)) => err,
        (done, _) => done.into(),
    }
}

#[async_trait]
impl Client for Broker {
    async fn dial(&self, ctx: &Context, url: &str, options: Vec<DialOption>) -> Result<Channel> {
        Broker::dial(self, ctx, url, options).await
    }
}

impl fmt::Debug for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Broker")
            .field("provider", &self.inner.provider)
            .field("tuning", &self.tuning())
            .field("closed", &self.is_closed())
            .finish()
    }
}
