//! gRPC module: service registry and lifecycle controller.
//!
//! Services are registered as *local* (hosted here, served off the broker's
//! incoming connections) or *remote* (dialed through the broker). The host
//! then drives the module through its phases:
//!
//! 1. `begin` - bootstrap the default provider if needed and create the server
//! 2. `create_service` - run a local factory or dial a remote service
//! 3. `setup` - attach every retained local service to the server
//! 4. `start` - freeze the routes and spawn the serve loop
//!
//! Registration is only possible before `begin`.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use tonic::transport::Channel;
use tracing::{debug, info, warn};

use crate::broker::{Broker, Client};
use crate::config::{Config, GrpcSettings, REMOTE, TIMEOUT};
use crate::context::Context;
use crate::dial::DialOption;
use crate::error::{Error, Result};
use crate::mesh::{LocalMesh, Module, ModuleBuilder, ProviderRegistry, ProviderResolver};
use crate::provider::TcpProvider;
use crate::serve::{ServeHandle, ServeLoop};
use crate::service::{GrpcServer, Service};

/// Provider name used when the host does not supply one.
pub const DEFAULT_PROVIDER: &str = "grpcmesh.provider.default";

/// Module name announced to the host.
pub const NAME: &str = "grpcmesh.module.grpc";

/// Builds a local service from its configuration.
pub type LocalFactory = Arc<dyn Fn(&Config) -> anyhow::Result<Service> + Send + Sync>;

/// Wraps a dialed channel in a client stub.
pub type RemoteConnector = Arc<dyn Fn(Channel) -> anyhow::Result<Service> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Registering,
    Begun,
    SetUp,
    Serving,
}

struct State {
    phase: Phase,
    server: Option<GrpcServer>,
    /// Attachable local services in creation order
    retained: Vec<(String, Service)>,
    settings: GrpcSettings,
    serve: Option<ServeHandle>,
}

pub struct GrpcModule {
    name: String,
    builder: Arc<dyn ModuleBuilder>,
    /// Registry the default provider is installed into at begin; `None` when
    /// the host supplies its own provider
    bootstrap: Option<Arc<ProviderRegistry>>,
    broker: Broker,
    locals: RwLock<HashMap<String, LocalFactory>>,
    remotes: RwLock<HashMap<String, RemoteConnector>>,
    state: Mutex<State>,
}

/// Builder for [`GrpcModule`].
pub struct GrpcModuleBuilder {
    name: String,
    resolver: Arc<dyn ProviderResolver>,
    builder: Arc<dyn ModuleBuilder>,
    provider: Option<String>,
    bootstrap: Option<Arc<ProviderRegistry>>,
    mesh: Option<Arc<LocalMesh>>,
}

impl GrpcModuleBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Resolve connections through the named provider instead of
    /// bootstrapping the default TCP provider.
    pub fn provider(mut self, name: impl Into<String>) -> Self {
        self.provider = Some(name.into());
        self
    }

    /// Registry the default provider is installed into.
    pub fn bootstrap_registry(mut self, registry: Arc<ProviderRegistry>) -> Self {
        self.bootstrap = Some(registry);
        self
    }

    pub fn build(self) -> Arc<GrpcModule> {
        let (broker, bootstrap) = match self.provider {
            Some(provider) => (Broker::new(self.resolver, provider), None),
            None => {
                let registry = self
                    .bootstrap
                    .unwrap_or_else(|| Arc::new(ProviderRegistry::new()));
                registry.declare(DEFAULT_PROVIDER);
                (Broker::new(registry.clone(), DEFAULT_PROVIDER), Some(registry))
            }
        };

        let module = Arc::new(GrpcModule {
            name: self.name,
            builder: self.builder,
            bootstrap,
            broker,
            locals: RwLock::new(HashMap::new()),
            remotes: RwLock::new(HashMap::new()),
            state: Mutex::new(State {
                phase: Phase::Registering,
                server: None,
                retained: Vec::new(),
                settings: GrpcSettings::default(),
                serve: None,
            }),
        });

        if let Some(mesh) = self.mesh {
            mesh.add_module(module.clone());
        }
        module
    }
}

impl GrpcModule {
    pub fn builder(
        resolver: Arc<dyn ProviderResolver>,
        builder: Arc<dyn ModuleBuilder>,
    ) -> GrpcModuleBuilder {
        GrpcModuleBuilder {
            name: NAME.to_string(),
            resolver,
            builder,
            provider: None,
            bootstrap: None,
            mesh: None,
        }
    }

    /// Builder for a module hosted by `mesh`. The built module is added to
    /// the mesh and the default provider is installed in its registry.
    pub fn on_mesh(mesh: &Arc<LocalMesh>) -> GrpcModuleBuilder {
        GrpcModuleBuilder {
            name: NAME.to_string(),
            resolver: mesh.providers().clone(),
            builder: mesh.declarations().clone(),
            provider: None,
            bootstrap: Some(mesh.providers().clone()),
            mesh: Some(mesh.clone()),
        }
    }

    /// Register a local service factory.
    pub fn local<F>(&self, name: &str, factory: F) -> Result<()>
    where
        F: Fn(&Config) -> anyhow::Result<Service> + Send + Sync + 'static,
    {
        self.ensure_registering(name)?;
        if self.remotes.read().contains_key(name) {
            return Err(Error::DuplicateService {
                name: name.to_string(),
                existing: "remote",
            });
        }
        self.locals
            .write()
            .insert(name.to_string(), Arc::new(factory));
        self.builder.register_service(&self.name, name);
        debug!("local service {} registered", name);
        Ok(())
    }

    /// Register a remote service connector.
    pub fn remote<F>(&self, name: &str, connector: F) -> Result<()>
    where
        F: Fn(Channel) -> anyhow::Result<Service> + Send + Sync + 'static,
    {
        self.ensure_registering(name)?;
        if self.locals.read().contains_key(name) {
            return Err(Error::DuplicateService {
                name: name.to_string(),
                existing: "local",
            });
        }
        self.remotes
            .write()
            .insert(name.to_string(), Arc::new(connector));
        self.builder.register_service(&self.name, name);
        debug!("remote service {} registered", name);
        Ok(())
    }

    fn ensure_registering(&self, name: &str) -> Result<()> {
        match self.phase() {
            Phase::Registering => Ok(()),
            phase => Err(Error::Lifecycle(format!(
                "cannot register service {} in phase {:?}",
                name, phase
            ))),
        }
    }

    pub fn phase(&self) -> Phase {
        self.state.lock().phase
    }

    pub fn broker(&self) -> &Broker {
        &self.broker
    }

    pub fn settings(&self) -> GrpcSettings {
        self.state.lock().settings.clone()
    }

    /// Names of the registered local and remote services, sorted.
    pub fn service_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .locals
            .read()
            .keys()
            .chain(self.remotes.read().keys())
            .cloned()
            .collect();
        names.sort();
        names
    }

    /// Listen address of the active provider.
    pub fn addr(&self) -> String {
        self.broker.addr()
    }

    /// Read settings, bootstrap the default provider and create the server.
    ///
    /// Bootstrapping binds a tokio TCP listener, so without a host supplied
    /// provider this must run inside a tokio runtime. Outside of one it fails
    /// with [`Error::Bind`] and the module stays unbegun.
    pub fn begin(&self, config: &Config) -> Result<()> {
        let mut state = self.state.lock();
        if state.phase != Phase::Registering {
            return Err(Error::Lifecycle(format!(
                "begin called twice on module {}",
                self.name
            )));
        }

        for name in self.service_names() {
            self.builder.register_service(&self.name, &name);
        }

        let settings = GrpcSettings::from_config(config)?;
        if let Some(registry) = &self.bootstrap {
            let provider = TcpProvider::bind(&settings.laddr)?;
            info!("grpc default provider listening on {}", provider.local_addr());
            registry.install(DEFAULT_PROVIDER, Arc::new(provider));
        }
        self.broker.configure(&settings);

        state.settings = settings;
        state.server = Some(GrpcServer::new());
        state.phase = Phase::Begun;
        Ok(())
    }

    /// Build a fresh instance of the named service.
    ///
    /// Local factories win over remote connectors; nothing is cached.
    pub async fn create_service(&self, name: &str, config: &Config) -> Result<Service> {
        let phase = self.phase();
        if phase == Phase::Registering {
            return Err(Error::Lifecycle(format!(
                "service {} requested before begin",
                name
            )));
        }

        let local = self.locals.read().get(name).cloned();
        if let Some(factory) = local {
            let service = factory(config).map_err(Error::Factory)?;
            if service.is_attachable() {
                let mut state = self.state.lock();
                if state.phase == Phase::Begun {
                    state.retained.push((name.to_string(), service.clone()));
                } else {
                    warn!("service {} created after setup, handlers not attached", name);
                }
            }
            return Ok(service);
        }

        let remote = self.remotes.read().get(name).cloned();
        if let Some(connector) = remote {
            let addr = config.opt_string(REMOTE).ok_or_else(|| Error::MissingRemote {
                service: name.to_string(),
            })?;
            let timeout = match config.opt_duration(TIMEOUT)? {
                Some(timeout) => timeout,
                None => self.settings().dial_timeout,
            };

            let ctx = Context::background().with_timeout(timeout);
            let channel = self
                .broker
                .dial(
                    &ctx,
                    &addr,
                    [DialOption::Insecure, DialOption::ConnectTimeout(timeout)],
                )
                .await?;
            debug!("remote service {} dialed {}", name, addr);
            return connector(channel).map_err(Error::Factory);
        }

        Err(Error::ServiceNotFound(name.to_string()))
    }

    /// Attach every retained local service to the server, in creation order.
    pub fn setup(&self) -> Result<()> {
        let mut guard = self.state.lock();
        let state = &mut *guard;
        if state.phase != Phase::Begun {
            return Err(Error::Lifecycle(format!(
                "setup called in phase {:?}",
                state.phase
            )));
        }
        let server = state
            .server
            .as_mut()
            .ok_or_else(|| Error::Lifecycle("grpc server not created".to_string()))?;

        for (name, service) in &state.retained {
            if let Some(handler) = service.handler() {
                handler
                    .grpc_handler(server)
                    .map_err(|source| Error::HandlerAttach {
                        service: name.clone(),
                        source,
                    })?;
                debug!("service {} attached", name);
            }
        }

        state.phase = Phase::SetUp;
        Ok(())
    }

    /// Freeze the routes and spawn the serve loop. Returns immediately.
    pub fn start(&self) -> Result<()> {
        let mut state = self.state.lock();
        if !matches!(state.phase, Phase::Begun | Phase::SetUp) {
            return Err(Error::Lifecycle(format!(
                "start called in phase {:?}",
                state.phase
            )));
        }
        let server = state
            .server
            .take()
            .ok_or_else(|| Error::Lifecycle("grpc server not created".to_string()))?;

        info!(
            "grpc module {} serving {:?} through provider {}",
            self.name,
            server.service_names(),
            self.broker.provider_name()
        );
        let handle =
            ServeLoop::new(self.broker.clone(), server.into_routes(), state.settings.backoff)
                .spawn();

        state.serve = Some(handle);
        state.phase = Phase::Serving;
        Ok(())
    }

    /// Number of serve attempts made so far, zero before start.
    pub fn serve_attempts(&self) -> u64 {
        self.state
            .lock()
            .serve
            .as_ref()
            .map(ServeHandle::attempts)
            .unwrap_or(0)
    }

    /// Stop the serve loop and wait for it to exit.
    pub async fn shutdown(&self) {
        let handle = self.state.lock().serve.take();
        if let Some(mut handle) = handle {
            handle.stop().await;
        }
    }

    /// Close the broker, unblocking any pending accept.
    pub fn close(&self) -> Result<()> {
        self.broker.close()
    }
}

#[async_trait]
impl Module for GrpcModule {
    fn name(&self) -> &str {
        &self.name
    }

    fn begin(&self, config: &Config) -> Result<()> {
        GrpcModule::begin(self, config)
    }

    async fn create_service(&self, name: &str, config: &Config) -> Result<Service> {
        GrpcModule::create_service(self, name, config).await
    }

    fn setup(&self) -> Result<()> {
        GrpcModule::setup(self)
    }

    fn start(&self) -> Result<()> {
        GrpcModule::start(self)
    }
}

#[async_trait]
impl Client for GrpcModule {
    async fn dial(&self, ctx: &Context, url: &str, options: Vec<DialOption>) -> Result<Channel> {
        self.broker.dial(ctx, url, options).await
    }
}

impl fmt::Debug for GrpcModule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrpcModule")
            .field("name", &self.name)
            .field("phase", &self.phase())
            .field("services", &self.service_names())
            .field("broker", &self.broker)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::Declarations;
    use crate::provider::MemoryNetwork;
    use crate::service::GrpcHandler;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Counter(usize);

    struct Failing;

    impl GrpcHandler for Failing {
        fn grpc_handler(&self, _server: &mut GrpcServer) -> anyhow::Result<()> {
            anyhow::bail!("cannot attach")
        }
    }

    fn memory_module() -> (Arc<GrpcModule>, Arc<Declarations>) {
        let registry = Arc::new(ProviderRegistry::new());
        let provider = MemoryNetwork::new().bind("self:1").unwrap();
        registry.install("memory", Arc::new(provider));
        let declarations = Arc::new(Declarations::default());
        let module = GrpcModule::builder(registry, declarations.clone())
            .provider("memory")
            .build();
        (module, declarations)
    }

    #[test]
    fn test_registration_declares_names() {
        let (module, declarations) = memory_module();
        module
            .local("echo", |_| Ok(Service::base(Counter(0))))
            .unwrap();
        module
            .remote("proxy", |channel| Ok(Service::base(channel)))
            .unwrap();
        assert_eq!(declarations.names(), vec!["echo", "proxy"]);
        assert_eq!(declarations.owner("echo").as_deref(), Some(NAME));
    }

    #[test]
    fn test_duplicate_across_kinds_is_rejected() {
        let (module, _) = memory_module();
        module.local("a", |_| Ok(Service::base(Counter(1)))).unwrap();
        let err = module
            .remote("a", |channel| Ok(Service::base(channel)))
            .unwrap_err();
        assert!(matches!(err, Error::DuplicateService { existing: "local", .. }));
    }

    #[tokio::test]
    async fn test_same_kind_last_write_wins() {
        let (module, _) = memory_module();
        module.local("a", |_| Ok(Service::base(Counter(1)))).unwrap();
        module.local("a", |_| Ok(Service::base(Counter(2)))).unwrap();
        module.begin(&Config::empty()).unwrap();

        let service = module.create_service("a", &Config::empty()).await.unwrap();
        assert_eq!(service.downcast::<Counter>().unwrap().0, 2);
    }

    #[tokio::test]
    async fn test_lifecycle_order_is_enforced() {
        let (module, _) = memory_module();
        assert!(matches!(
            module.create_service("a", &Config::empty()).await,
            Err(Error::Lifecycle(_))
        ));

        module.begin(&Config::empty()).unwrap();
        assert!(matches!(module.begin(&Config::empty()), Err(Error::Lifecycle(_))));
        assert_eq!(module.phase(), Phase::Begun);
        assert!(matches!(
            module.local("late", |_| Ok(Service::base(Counter(0)))),
            Err(Error::Lifecycle(_))
        ));

        module.setup().unwrap();
        module.start().unwrap();
        assert!(matches!(module.start(), Err(Error::Lifecycle(_))));
        module.shutdown().await;
    }

    #[tokio::test]
    async fn test_factories_run_per_call() {
        let (module, _) = memory_module();
        let calls = Arc::new(AtomicUsize::new(0));
        let counted = calls.clone();
        module
            .local("a", move |_| {
                let n = counted.fetch_add(1, Ordering::SeqCst);
                Ok(Service::base(Counter(n)))
            })
            .unwrap();
        module.begin(&Config::empty()).unwrap();

        let first = module.create_service("a", &Config::empty()).await.unwrap();
        let second = module.create_service("a", &Config::empty()).await.unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert!(!Arc::ptr_eq(first.instance(), second.instance()));
    }

    #[tokio::test]
    async fn test_factory_error_is_returned_verbatim() {
        let (module, _) = memory_module();
        module
            .local("broken", |_| Err(anyhow::anyhow!("factory exploded")))
            .unwrap();
        module.begin(&Config::empty()).unwrap();

        let err = module
            .create_service("broken", &Config::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Factory(_)));
        assert_eq!(err.to_string(), "factory exploded");
    }

    #[tokio::test]
    async fn test_remote_requires_address() {
        let (module, _) = memory_module();
        module
            .remote("proxy", |channel| Ok(Service::base(channel)))
            .unwrap();
        module.begin(&Config::empty()).unwrap();

        let err = module
            .create_service("proxy", &Config::empty())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::MissingRemote { .. }));
    }

    #[tokio::test]
    async fn test_setup_reports_failing_handler() {
        let (module, _) = memory_module();
        module.local("bad", |_| Ok(Service::attachable(Failing))).unwrap();
        module.begin(&Config::empty()).unwrap();
        module.create_service("bad", &Config::empty()).await.unwrap();

        let err = module.setup().unwrap_err();
        match err {
            Error::HandlerAttach { service, .. } => assert_eq!(service, "bad"),
            other => panic!("unexpected error {}", other),
        }
    }

    #[tokio::test]
    async fn test_begin_bootstraps_default_provider() {
        let registry = Arc::new(ProviderRegistry::new());
        let module = GrpcModule::builder(registry.clone(), Arc::new(Declarations::default()))
            .bootstrap_registry(registry.clone())
            .build();
        assert!(registry.is_declared(DEFAULT_PROVIDER));
        assert_eq!(module.addr(), "127.0.0.1:0");

        let config = Config::empty().with("laddr", "127.0.0.1:0").unwrap();
        module.begin(&config).unwrap();
        assert!(registry.lookup(DEFAULT_PROVIDER).ready().is_some());
        assert_ne!(module.addr(), "127.0.0.1:0");
        module.close().unwrap();
    }

    #[test]
    fn test_begin_outside_runtime_fails_without_panicking() {
        let registry = Arc::new(ProviderRegistry::new());
        let module = GrpcModule::builder(registry.clone(), Arc::new(Declarations::default()))
            .bootstrap_registry(registry.clone())
            .build();

        let config = Config::empty().with("laddr", "127.0.0.1:0").unwrap();
        let err = module.begin(&config).unwrap_err();
        assert!(matches!(err, Error::Bind { .. }));
        assert_eq!(module.phase(), Phase::Registering);
        assert!(registry.lookup(DEFAULT_PROVIDER).ready().is_none());
    }

    #[tokio::test]
    async fn test_services_created_after_setup_are_not_retained() {
        let (module, _) = memory_module();
        module.local("echo", |_| Ok(Service::attachable(Failing))).unwrap();
        module.begin(&Config::empty()).unwrap();
        module.setup().unwrap();

        for _ in 0..3 {
            let service = module.create_service("echo", &Config::empty()).await.unwrap();
            assert!(service.is_attachable());
        }
        assert!(module.state.lock().retained.is_empty());
    }
}
