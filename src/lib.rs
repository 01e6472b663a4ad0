//! Provider-pluggable gRPC connection broker for service meshes.
//!
//! Services are registered with a [`GrpcModule`] as local (served here) or
//! remote (dialed elsewhere). All listening and dialing goes through a named
//! [`Provider`] resolved from the host, so transports can be swapped without
//! touching service code.

pub mod broker;
pub mod config;
pub mod context;
pub mod dial;
pub mod error;
pub mod logging;
pub mod mesh;
pub mod module;
pub mod provider;
pub mod serve;
pub mod service;

// Re-export commonly used types
pub use broker::{Broker, Client, ResolvePolicy};
pub use config::{Config, GrpcSettings};
pub use context::Context;
pub use dial::DialOption;
pub use error::{Error, Result};
pub use mesh::{LocalMesh, Lookup, Module, ModuleBuilder, ProviderRegistry, ProviderResolver};
pub use module::{GrpcModule, Phase, DEFAULT_PROVIDER};
pub use provider::{Connection, Listener, MemoryNetwork, Provider, TcpProvider};
pub use service::{GrpcHandler, GrpcServer, Service};
