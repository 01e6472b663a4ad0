//! Host collaboration surface.
//!
//! The gRPC module is driven by a host mesh that looks providers up by name,
//! accepts declared service names, and calls the lifecycle phases in order.
//! This module defines that boundary and ships [`LocalMesh`], a small
//! in-process host used for embedding and tests.
//!
//! # Usage
//!
//! ```ignore
//! let mesh = LocalMesh::new();
//! let grpc = GrpcModule::on_mesh(&mesh).build();
//!
//! grpc.local("echo", |_config| Ok(Service::attachable(EchoService)))?;
//! grpc.remote("echo.client", |channel| Ok(Service::base(EchoClient::new(channel))))?;
//!
//! mesh.start().await?;
//! let client = mesh.service("echo.client").and_then(|s| s.downcast::<EchoClient>());
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use tracing::{debug, info};

use crate::config::Config;
use crate::error::{Error, Result};
use crate::provider::Provider;
use crate::service::Service;

/// Result of a name-based lookup.
///
/// `Pending` means the name is registered but its value does not exist yet;
/// `Unregistered` means nothing was ever registered under the name.
pub enum Lookup<T> {
    Ready(T),
    Pending,
    Unregistered,
}

impl<T> Lookup<T> {
    pub fn ready(self) -> Option<T> {
        match self {
            Lookup::Ready(value) => Some(value),
            Lookup::Pending | Lookup::Unregistered => None,
        }
    }

    pub fn is_registered(&self) -> bool {
        !matches!(self, Lookup::Unregistered)
    }
}

/// Name-based provider lookup supplied by the host.
pub trait ProviderResolver: Send + Sync {
    fn lookup(&self, name: &str) -> Lookup<Arc<dyn Provider>>;
}

/// Receives the service names a module can produce.
pub trait ModuleBuilder: Send + Sync {
    fn register_service(&self, module: &str, service: &str);
}

/// Lifecycle callbacks a host invokes, in order: `begin`, `create_service`
/// for every declared name, `setup`, `start`.
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    /// Called once before any service is created. Implementations may bind
    /// sockets, so hosts call it from within a tokio runtime.
    fn begin(&self, config: &Config) -> Result<()>;

    async fn create_service(&self, name: &str, config: &Config) -> Result<Service>;

    fn setup(&self) -> Result<()>;

    fn start(&self) -> Result<()>;
}

/// Providers keyed by name.
#[derive(Default)]
pub struct ProviderRegistry {
    entries: RwLock<HashMap<String, Option<Arc<dyn Provider>>>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `name` without a value yet; lookups report `Pending`.
    pub fn declare(&self, name: &str) {
        self.entries.write().entry(name.to_owned()).or_insert(None);
    }

    /// Install (or replace) the provider registered under `name`.
    pub fn install(&self, name: &str, provider: Arc<dyn Provider>) {
        info!("provider {} installed", name);
        self.entries.write().insert(name.to_owned(), Some(provider));
    }

    /// Remove `name` entirely; lookups report `Unregistered`.
    pub fn remove(&self, name: &str) -> Option<Arc<dyn Provider>> {
        self.entries.write().remove(name).flatten()
    }

    pub fn is_declared(&self, name: &str) -> bool {
        self.entries.read().contains_key(name)
    }
}

impl ProviderResolver for ProviderRegistry {
    fn lookup(&self, name: &str) -> Lookup<Arc<dyn Provider>> {
        match self.entries.read().get(name) {
            Some(Some(provider)) => Lookup::Ready(provider.clone()),
            Some(None) => Lookup::Pending,
            None => Lookup::Unregistered,
        }
    }
}

/// Service names declared by modules, mapped to the declaring module.
#[derive(Default)]
pub struct Declarations {
    entries: RwLock<BTreeMap<String, String>>,
}

impl Declarations {
    /// Declared service names in name order.
    pub fn names(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn owner(&self, service: &str) -> Option<String> {
        self.entries.read().get(service).cloned()
    }

    fn snapshot(&self) -> Vec<(String, String)> {
        self.entries
            .read()
            .iter()
            .map(|(service, module)| (service.clone(), module.clone()))
            .collect()
    }
}

impl ModuleBuilder for Declarations {
    fn register_service(&self, module: &str, service: &str) {
        self.entries
            .write()
            .insert(service.to_owned(), module.to_owned());
    }
}

/// Minimal in-process host.
#[derive(Default)]
pub struct LocalMesh {
    providers: Arc<ProviderRegistry>,
    declarations: Arc<Declarations>,
    modules: RwLock<Vec<Arc<dyn Module>>>,
    services: RwLock<HashMap<String, Service>>,
    module_configs: RwLock<HashMap<String, Config>>,
    service_configs: RwLock<HashMap<String, Config>>,
}

impl LocalMesh {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn providers(&self) -> &Arc<ProviderRegistry> {
        &self.providers
    }

    /// Sink modules declare their service names into.
    pub fn declarations(&self) -> &Arc<Declarations> {
        &self.declarations
    }

    pub fn add_module(&self, module: Arc<dyn Module>) {
        debug!("module {} added", module.name());
        self.modules.write().push(module);
    }

    /// Configuration passed to `begin` of the named module.
    pub fn configure_module(&self, module: &str, config: Config) {
        self.module_configs.write().insert(module.to_owned(), config);
    }

    /// Configuration passed to `create_service` for the named service.
    pub fn configure_service(&self, service: &str, config: Config) {
        self.service_configs.write().insert(service.to_owned(), config);
    }

    /// Declared service names in creation order.
    pub fn declared_services(&self) -> Vec<String> {
        self.declarations.names()
    }

    /// Drive every module through its lifecycle.
    ///
    /// Services are created in name order after every module has begun.
    pub async fn start(&self) -> Result<()> {
        let modules = self.modules.read().clone();

        for module in &modules {
            let config = self.module_config(module.name());
            module.begin(&config)?;
        }

        for (service, module_name) in self.declarations.snapshot() {
            let module = modules
                .iter()
                .find(|module| module.name() == module_name)
                .ok_or_else(|| Error::ServiceNotFound(service.clone()))?;
            let config = self.service_config(&service);
            let created = module.create_service(&service, &config).await?;
            debug!("service {} created by {}", service, module_name);
            self.services.write().insert(service, created);
        }

        for module in &modules {
            module.setup()?;
        }
        for module in &modules {
            module.start()?;
        }

        info!("mesh started with {} modules", modules.len());
        Ok(())
    }

    /// A service created during [`LocalMesh::start`].
    pub fn service(&self, name: &str) -> Option<Service> {
        self.services.read().get(name).cloned()
    }

    fn module_config(&self, module: &str) -> Config {
        self.module_configs
            .read()
            .get(module)
            .cloned()
            .unwrap_or_default()
    }

    fn service_config(&self, service: &str) -> Config {
        self.service_configs
            .read()
            .get(service)
            .cloned()
            .unwrap_or_default()
    }
}

impl ProviderResolver for LocalMesh {
    fn lookup(&self, name: &str) -> Lookup<Arc<dyn Provider>> {
        self.providers.lookup(name)
    }
}

impl ModuleBuilder for LocalMesh {
    fn register_service(&self, module: &str, service: &str) {
        self.declarations.register_service(module, service);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::MemoryNetwork;

    #[tokio::test]
    async fn test_registry_distinguishes_pending_from_unregistered() {
        let registry = ProviderRegistry::new();
        assert!(matches!(registry.lookup("p"), Lookup::Unregistered));

        registry.declare("p");
        assert!(matches!(registry.lookup("p"), Lookup::Pending));
        assert!(registry.lookup("p").is_registered());

        let provider = MemoryNetwork::new().bind("a").unwrap();
        registry.install("p", Arc::new(provider));
        assert!(registry.lookup("p").ready().is_some());

        assert!(registry.remove("p").is_some());
        assert!(matches!(registry.lookup("p"), Lookup::Unregistered));
    }

    #[test]
    fn test_declare_keeps_installed_provider() {
        let registry = ProviderRegistry::new();
        let provider = MemoryNetwork::new().bind("a").unwrap();
        registry.install("p", Arc::new(provider));
        registry.declare("p");
        assert!(registry.lookup("p").ready().is_some());
    }

    #[test]
    fn test_builder_records_declared_names() {
        let mesh = LocalMesh::new();
        mesh.register_service("grpc", "b");
        mesh.register_service("grpc", "a");
        mesh.register_service("grpc", "a");
        assert_eq!(mesh.declared_services(), vec!["a".to_string(), "b".to_string()]);
        assert_eq!(mesh.declarations().owner("a").as_deref(), Some("grpc"));
    }
}
