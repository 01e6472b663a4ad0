//! Service instances and the shared gRPC server they attach to.

use std::any::Any;
use std::convert::Infallible;
use std::fmt;
use std::sync::Arc;

use tonic::body::BoxBody;
use tonic::codegen::http::{Request, Response};
use tonic::codegen::Service as TowerService;
use tonic::server::NamedService;
use tonic::service::{Routes, RoutesBuilder};

/// Type-erased service value handed back to the host.
pub type Instance = Arc<dyn Any + Send + Sync>;

/// Capability of a local service to bind its RPC methods onto the server.
pub trait GrpcHandler: Send + Sync + 'static {
    fn grpc_handler(&self, server: &mut GrpcServer) -> anyhow::Result<()>;
}

/// A created service.
///
/// Whether a service attaches handlers is decided when it is constructed,
/// so the controller retains [`Service::Attachable`] values without
/// inspecting concrete types.
#[derive(Clone)]
pub enum Service {
    /// Plain service, e.g. a client stub for a remote service
    Base(Instance),
    /// Local service that attaches handlers during setup
    Attachable {
        instance: Instance,
        handler: Arc<dyn GrpcHandler>,
    },
}

impl Service {
    pub fn base<T: Send + Sync + 'static>(value: T) -> Self {
        Service::Base(Arc::new(value))
    }

    pub fn attachable<T: GrpcHandler>(value: T) -> Self {
        let value = Arc::new(value);
        Service::Attachable {
            instance: value.clone(),
            handler: value,
        }
    }

    pub fn instance(&self) -> &Instance {
        match self {
            Service::Base(instance) | Service::Attachable { instance, .. } => instance,
        }
    }

    pub fn handler(&self) -> Option<&Arc<dyn GrpcHandler>> {
        match self {
            Service::Base(_) => None,
            Service::Attachable { handler, .. } => Some(handler),
        }
    }

    pub fn is_attachable(&self) -> bool {
        self.handler().is_some()
    }

    /// The concrete value, if it is a `T`.
    pub fn downcast<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.instance().clone().downcast::<T>().ok()
    }
}

impl fmt::Debug for Service {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Service::Base(_) => f.write_str("Service::Base"),
            Service::Attachable { .. } => f.write_str("Service::Attachable"),
        }
    }
}

/// The gRPC server shared by every local service of a module.
///
/// Services add their tonic servers here during setup; the routes are frozen
/// when the module starts serving.
#[derive(Default)]
pub struct GrpcServer {
    routes: RoutesBuilder,
    names: Vec<&'static str>,
}

impl GrpcServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a tonic service, typically a generated `*Server<T>`.
    pub fn add_service<S>(&mut self, svc: S) -> &mut Self
    where
        S: TowerService<Request<BoxBody>, Response = Response<BoxBody>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        self.names.push(S::NAME);
        self.routes.add_service(svc);
        self
    }

    /// Fully qualified names of the attached gRPC services.
    pub fn service_names(&self) -> &[&'static str] {
        &self.names
    }

    pub(crate) fn into_routes(self) -> Routes {
        self.routes.routes()
    }
}

impl fmt::Debug for GrpcServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GrpcServer")
            .field("services", &self.names)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Plain(u32);

    struct Attaching;

    impl GrpcHandler for Attaching {
        fn grpc_handler(&self, _server: &mut GrpcServer) -> anyhow::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_capability_is_chosen_at_construction() {
        let plain = Service::base(Plain(7));
        assert!(!plain.is_attachable());
        assert_eq!(plain.downcast::<Plain>().unwrap().0, 7);
        assert!(plain.downcast::<Attaching>().is_none());

        let attaching = Service::attachable(Attaching);
        assert!(attaching.is_attachable());
        assert!(attaching.downcast::<Attaching>().is_some());
    }

    #[test]
    fn test_empty_server_has_no_services() {
        let server = GrpcServer::new();
        assert!(server.service_names().is_empty());
        let _routes = server.into_routes();
    }
}
