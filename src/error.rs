//! Error types for the gRPC mesh broker.

use std::io;

use thiserror::Error;
use tonic::Status;

/// A specialized Result type for broker and lifecycle operations.
pub type Result<T> = std::result::Result<T, Error>;

/// The error type for broker and lifecycle operations.
#[derive(Debug, Error)]
pub enum Error {
    /// A provider could not acquire its listener.
    #[error("listen on {addr} error: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },

    /// The provider is not resolvable right now. Retryable.
    #[error("grpc provider {name} not valid")]
    ProviderUnavailable { name: String },

    /// The provider name was never registered with the host.
    #[error("expect provider {name}, but it was never registered")]
    ProviderNotRegistered { name: String },

    /// Neither a local nor a remote factory exists under this name.
    #[error("service {0} not found")]
    ServiceNotFound(String),

    /// Error returned verbatim by a local factory or remote connector.
    #[error(transparent)]
    Factory(anyhow::Error),

    /// A retained service failed to attach its handlers to the server.
    #[error("service {service} grpc handler error: {source}")]
    HandlerAttach {
        service: String,
        #[source]
        source: anyhow::Error,
    },

    /// Opening a transport connection through the provider failed.
    #[error("grpc dial to {remote} error: {source}")]
    Dial {
        remote: String,
        #[source]
        source: io::Error,
    },

    /// A remote service was requested without a `remote` address.
    #[error("remote service {service} has no remote address configured")]
    MissingRemote { service: String },

    /// Neither plaintext nor an explicit `http://` URL was requested.
    #[error("no transport security set for {0}, use DialOption::Insecure")]
    NoTransportSecurity(String),

    #[error("invalid address {addr}: {reason}")]
    InvalidAddress { addr: String, reason: String },

    /// The name is already registered as the other service kind.
    #[error("service {name} is already registered as a {existing} service")]
    DuplicateService { name: String, existing: &'static str },

    /// A lifecycle phase was invoked out of order.
    #[error("lifecycle error: {0}")]
    Lifecycle(String),

    /// The broker or listener has been closed.
    #[error("use of closed listener")]
    Closed,

    #[error("context canceled")]
    Cancelled,

    #[error("context deadline exceeded")]
    DeadlineExceeded,

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl Error {
    /// Whether a dial attempt failing with this error may succeed if retried.
    pub fn is_temporary(&self) -> bool {
        match self {
            Error::ProviderUnavailable { .. } => true,
            Error::Dial { source, .. } | Error::Io(source) => is_temporary_io(source),
            _ => false,
        }
    }

    /// Whether this error indicates a configuration defect rather than a
    /// timing race. Background loops stop instead of retrying on these.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::ProviderNotRegistered { .. })
    }

    /// Whether accepting can never succeed again: the broker is closed or
    /// the provider is misconfigured.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Error::Closed) || self.is_fatal()
    }
}

fn is_temporary_io(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::TimedOut
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    )
}

impl From<config::ConfigError> for Error {
    fn from(err: config::ConfigError) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<Error> for Status {
    fn from(err: Error) -> Self {
        match err {
            Error::ServiceNotFound(name) => Status::not_found(format!("service {} not found", name)),
            Error::ProviderUnavailable { .. } | Error::Dial { .. } | Error::Closed => {
                Status::unavailable(err.to_string())
            }
            Error::DeadlineExceeded => Status::deadline_exceeded(err.to_string()),
            Error::Cancelled => Status::cancelled(err.to_string()),
            Error::MissingRemote { .. }
            | Error::NoTransportSecurity(_)
            | Error::InvalidAddress { .. }
            | Error::DuplicateService { .. }
            | Error::Lifecycle(_)
            | Error::ProviderNotRegistered { .. }
            | Error::Config(_) => Status::failed_precondition(err.to_string()),
            other => Status::internal(other.to_string()),
        }
    }
}
