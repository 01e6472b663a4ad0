//! Common test utilities: an echo gRPC service and module helpers.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;

use grpcmesh_core::{
    Config, GrpcHandler, GrpcModule, GrpcServer, MemoryNetwork, ProviderRegistry, Service,
};
use grpcmesh_core::mesh::Declarations;
use tonic::transport::Channel;

/// Messages of the `echo.Echo` service.
#[derive(Clone, PartialEq, prost::Message)]
pub struct EchoRequest {
    #[prost(string, tag = "1")]
    pub message: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct EchoReply {
    #[prost(string, tag = "1")]
    pub message: String,
}

pub mod echo_server {
    use tonic::codegen::*;

    #[async_trait]
    pub trait Echo: Send + Sync + 'static {
        async fn shout(
            &self,
            request: tonic::Request<super::EchoRequest>,
        ) -> std::result::Result<tonic::Response<super::EchoReply>, tonic::Status>;
    }

    #[derive(Debug)]
    pub struct EchoServer<T> {
        inner: Arc<T>,
    }

    impl<T> EchoServer<T> {
        pub fn new(inner: T) -> Self {
            Self {
                inner: Arc::new(inner),
            }
        }
    }

    impl<T, B> tonic::codegen::Service<http::Request<B>> for EchoServer<T>
    where
        T: Echo,
        B: Body + Send + 'static,
        B::Error: Into<StdError> + Send + 'static,
    {
        type Response = http::Response<tonic::body::BoxBody>;
        type Error = std::convert::Infallible;
        type Future = BoxFuture<Self::Response, Self::Error>;

        fn poll_ready(
            &mut self,
            _cx: &mut Context<'_>,
        ) -> Poll<std::result::Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: http::Request<B>) -> Self::Future {
            match req.uri().path() {
                "/echo.Echo/Shout" => {
                    struct ShoutSvc<T: Echo>(pub Arc<T>);

                    impl<T: Echo> tonic::server::UnaryService<super::EchoRequest> for ShoutSvc<T> {
                        type Response = super::EchoReply;
                        type Future = BoxFuture<tonic::Response<Self::Response>, tonic::Status>;

                        fn call(
                            &mut self,
                            request: tonic::Request<super::EchoRequest>,
                        ) -> Self::Future {
                            let inner = Arc::clone(&self.0);
                            Box::pin(async move { <T as Echo>::shout(&inner, request).await })
                        }
                    }

                    let inner = self.inner.clone();
                    Box::pin(async move {
                        let codec = tonic::codec::ProstCodec::default();
                        let mut grpc = tonic::server::Grpc::new(codec);
                        Ok(grpc.unary(ShoutSvc(inner), req).await)
                    })
                }
                _ => Box::pin(async move {
                    let mut response = http::Response::new(empty_body());
                    let headers = response.headers_mut();
                    headers.insert(
                        tonic::Status::GRPC_STATUS,
                        (tonic::Code::Unimplemented as i32).into(),
                    );
                    headers.insert(
                        http::header::CONTENT_TYPE,
                        tonic::metadata::GRPC_CONTENT_TYPE,
                    );
                    Ok(response)
                }),
            }
        }
    }

    impl<T> Clone for EchoServer<T> {
        fn clone(&self) -> Self {
            Self {
                inner: self.inner.clone(),
            }
        }
    }

    impl<T> tonic::server::NamedService for EchoServer<T> {
        const NAME: &'static str = "echo.Echo";
    }
}

pub mod echo_client {
    use tonic::codegen::*;

    #[derive(Debug, Clone)]
    pub struct EchoClient<T> {
        inner: tonic::client::Grpc<T>,
    }

    impl<T> EchoClient<T>
    where
        T: tonic::client::GrpcService<tonic::body::BoxBody>,
        T::Error: Into<StdError>,
        T::ResponseBody: Body<Data = Bytes> + Send + 'static,
        <T::ResponseBody as Body>::Error: Into<StdError> + Send,
    {
        pub fn new(inner: T) -> Self {
            Self {
                inner: tonic::client::Grpc::new(inner),
            }
        }

        pub async fn shout(
            &mut self,
            request: impl tonic::IntoRequest<super::EchoRequest>,
        ) -> std::result::Result<tonic::Response<super::EchoReply>, tonic::Status> {
            self.inner.ready().await.map_err(|e| {
                tonic::Status::unknown(format!("Service was not ready: {}", e.into()))
            })?;
            let codec = tonic::codec::ProstCodec::default();
            let path = http::uri::PathAndQuery::from_static("/echo.Echo/Shout");
            self.inner.unary(request.into_request(), path, codec).await
        }
    }
}

use echo_client::EchoClient;
use echo_server::{Echo, EchoServer};

/// Echo implementation replying with the upper-cased message.
#[derive(Debug, Default)]
pub struct Shouter;

#[tonic::async_trait]
impl Echo for Shouter {
    async fn shout(
        &self,
        request: tonic::Request<EchoRequest>,
    ) -> Result<tonic::Response<EchoReply>, tonic::Status> {
        let message = request.into_inner().message.to_uppercase();
        Ok(tonic::Response::new(EchoReply { message }))
    }
}

impl GrpcHandler for Shouter {
    fn grpc_handler(&self, server: &mut GrpcServer) -> anyhow::Result<()> {
        server.add_service(EchoServer::new(Shouter));
        Ok(())
    }
}

pub fn echo_factory(_config: &Config) -> anyhow::Result<Service> {
    Ok(Service::attachable(Shouter))
}

pub fn echo_connector(channel: Channel) -> anyhow::Result<Service> {
    Ok(Service::base(EchoClient::new(channel)))
}

/// Downcast a created remote service into its echo client.
pub fn echo_client(service: &Service) -> EchoClient<Channel> {
    service
        .downcast::<EchoClient<Channel>>()
        .expect("service is not an echo client")
        .as_ref()
        .clone()
}

pub async fn shout(client: &mut EchoClient<Channel>, message: &str) -> String {
    client
        .shout(EchoRequest {
            message: message.to_string(),
        })
        .await
        .expect("shout failed")
        .into_inner()
        .message
}

/// A module resolving its connections through a memory provider bound on
/// `addr` and registered as `memory`.
pub struct MemoryFixture {
    pub module: Arc<GrpcModule>,
    pub registry: Arc<ProviderRegistry>,
    pub declarations: Arc<Declarations>,
    pub network: MemoryNetwork,
}

pub fn memory_fixture(addr: &str) -> MemoryFixture {
    let registry = Arc::new(ProviderRegistry::new());
    let network = MemoryNetwork::new();
    let provider = network.bind(addr).expect("bind memory provider");
    registry.install("memory", Arc::new(provider));

    let declarations = Arc::new(Declarations::default());
    let module = GrpcModule::builder(registry.clone(), declarations.clone())
        .provider("memory")
        .build();

    MemoryFixture {
        module,
        registry,
        declarations,
        network,
    }
}

/// A loopback TCP address that was free a moment ago.
pub fn free_addr() -> SocketAddr {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind probe");
    listener.local_addr().expect("probe address")
}

pub fn remote_config(remote: &str) -> Config {
    Config::empty()
        .with("remote", remote)
        .expect("remote override")
}
