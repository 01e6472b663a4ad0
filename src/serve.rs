//! Background serve loop.
//!
//! Serves the frozen gRPC routes on connections accepted through the broker.
//! Accept errors and server errors are logged and retried after the backoff
//! interval, so a provider that appears late or a listener that flaps does
//! not take the module down. Connections already accepted keep being served
//! across accept failures. The loop only exits on shutdown, on a closed
//! broker, or on a fatal provider error.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::service::Routes;
use tonic::transport::Server;
use tracing::{debug, error, info};

use crate::broker::Broker;
use crate::error::{Error, Result};

pub struct ServeLoop {
    broker: Broker,
    routes: Routes,
    backoff: Duration,
}

impl ServeLoop {
    pub fn new(broker: Broker, routes: Routes, backoff: Duration) -> Self {
        Self {
            broker,
            routes,
            backoff,
        }
    }

    /// Spawn the loop on the current runtime.
    pub fn spawn(self) -> ServeHandle {
        let shutdown = CancellationToken::new();
        let attempts = Arc::new(AtomicU64::new(0));

        let task = {
            let shutdown = shutdown.clone();
            let attempts = attempts.clone();
            tokio::spawn(async move { self.run(shutdown, attempts).await })
        };

        ServeHandle {
            task: Some(task),
            shutdown,
            attempts,
        }
    }

    async fn run(self, shutdown: CancellationToken, attempts: Arc<AtomicU64>) {
        loop {
            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
            debug!("grpc serve attempt {} on {}", attempt, self.broker.addr());

            match self.serve_once(&shutdown, &attempts).await {
                Ok(()) => break,
                Err(Error::Closed) => {
                    debug!("grpc broker closed, serve loop exits");
                    break;
                }
                Err(err) if err.is_fatal() => {
                    error!("grpc server stopped: {}", err);
                    break;
                }
                Err(err) => error!("grpc server error: {}", err),
            }

            if !self.pause(&shutdown).await {
                break;
            }
        }
        info!("grpc serve loop stopped");
    }

    /// Sleep for the backoff interval. Returns `false` on shutdown.
    async fn pause(&self, shutdown: &CancellationToken) -> bool {
        tokio::select! {
            biased;
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(self.backoff) => true,
        }
    }

    /// Serve until shutdown or until accepting can no longer succeed.
    ///
    /// A transient accept error is logged and accepting resumes after the
    /// backoff interval, with the server and its live connections kept up.
    /// tonic skips failed items of the incoming stream, so a terminal error
    /// is parked in a slot and ends the stream instead.
    async fn serve_once(
        &self,
        shutdown: &CancellationToken,
        attempts: &Arc<AtomicU64>,
    ) -> Result<()> {
        let failure: Arc<Mutex<Option<Error>>> = Arc::new(Mutex::new(None));

        let incoming = {
            let accepted = self.broker.incoming();
            let failure = failure.clone();
            let attempts = attempts.clone();
            let shutdown = shutdown.clone();
            let backoff = self.backoff;
            Box::pin(async_stream::stream! {
                let mut accepted = std::pin::pin!(accepted);
                while let Some(next) = accepted.next().await {
                    match next {
                        Ok(conn) => yield Ok::<_, io::Error>(conn),
                        Err(err) if err.is_terminal() => {
                            *failure.lock() = Some(err);
                            break;
                        }
                        Err(err) => {
                            error!("grpc accept error: {}", err);
                            tokio::select! {
                                biased;
                                _ = shutdown.cancelled() => break,
                                _ = tokio::time::sleep(backoff) => {}
                            }
                            let attempt = attempts.fetch_add(1, Ordering::Relaxed) + 1;
                            debug!("grpc serve attempt {}, accepting again", attempt);
                        }
                    }
                }
            })
        };

        let signal = {
            let shutdown = shutdown.clone();
            async move { shutdown.cancelled().await }
        };

        let mut server = Server::builder();
        server
            .add_routes(self.routes.clone())
            .serve_with_incoming_shutdown(incoming, signal)
            .await?;

        let failed = failure.lock().take();
        match failed {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

/// Handle to a running serve loop.
pub struct ServeHandle {
    task: Option<JoinHandle<()>>,
    shutdown: CancellationToken,
    attempts: Arc<AtomicU64>,
}

impl ServeHandle {
    /// Stop serving and wait for the loop to exit.
    ///
    /// Idempotent: subsequent calls are no-ops.
    pub async fn stop(&mut self) {
        self.shutdown.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Number of serve attempts made so far.
    pub fn attempts(&self) -> u64 {
        self.attempts.load(Ordering::Relaxed)
    }
}

impl Drop for ServeHandle {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}
