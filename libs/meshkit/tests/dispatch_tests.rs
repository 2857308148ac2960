#![allow(clippy::unwrap_used, clippy::expect_used)]

//! Call-dispatch wiring: services exposing `CallHandler` get a gRPC server on
//! the agent's listener once the start phase is over.

use std::convert::Infallible;
use std::future::{Ready, ready};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use http::{Request, Response};
use serde_json::json;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tonic::body::Body;
use tonic::server::NamedService;
use tonic::service::RoutesBuilder;
use tonic::transport::Channel;
use tower::Service as TowerService;
use tower::ServiceExt;

use meshkit::config::Inline;
use meshkit::errors::codes;
use meshkit::{
    CallHandler, ConfigNode, Container, Mesh, MeshError, Phase, RemoteAgent, Service,
};

#[derive(Clone)]
struct EchoGrpc;

impl NamedService for EchoGrpc {
    const NAME: &'static str = "meshkit.test.Echo";
}

impl TowerService<Request<Body>> for EchoGrpc {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: Request<Body>) -> Self::Future {
        ready(Ok(Response::new(Body::empty())))
    }
}

struct Echo;

impl Service for Echo {
    fn as_call_handler(&self) -> Option<&dyn CallHandler> {
        Some(self)
    }
}

impl CallHandler for Echo {
    fn register_grpc(&self, routes: &mut RoutesBuilder) -> anyhow::Result<()> {
        routes.add_service(EchoGrpc);
        Ok(())
    }
}

#[derive(Default)]
struct LoopbackAgent {
    bound: Mutex<Option<SocketAddr>>,
}

#[async_trait]
impl RemoteAgent for LoopbackAgent {
    async fn start(&self, _config: &ConfigNode) -> anyhow::Result<()> {
        Ok(())
    }

    async fn service_config(&self, _name: &str) -> anyhow::Result<ConfigNode> {
        Ok(ConfigNode::default())
    }

    async fn listen(&self) -> anyhow::Result<TcpListener> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        *self.bound.lock().unwrap() = Some(listener.local_addr()?);
        Ok(listener)
    }

    async fn connect(&self, name: &str) -> anyhow::Result<Channel> {
        anyhow::bail!("no route to '{name}'")
    }
}

/// Records whether container lookups were live when each call arrived.
#[derive(Clone)]
struct LivenessGrpc {
    container: Arc<Container>,
    seen: Arc<Mutex<Vec<bool>>>,
}

impl NamedService for LivenessGrpc {
    const NAME: &'static str = "meshkit.test.Liveness";
}

impl TowerService<Request<Body>> for LivenessGrpc {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _req: Request<Body>) -> Self::Future {
        let live = self.container.is_initialized() && self.container.contains("liveness");
        self.seen.lock().unwrap().push(live);
        ready(Ok(Response::new(Body::empty())))
    }
}

struct Liveness(LivenessGrpc);

impl Service for Liveness {
    fn as_call_handler(&self) -> Option<&dyn CallHandler> {
        Some(self)
    }
}

impl CallHandler for Liveness {
    fn register_grpc(&self, routes: &mut RoutesBuilder) -> anyhow::Result<()> {
        routes.add_service(self.0.clone());
        Ok(())
    }
}

fn echo_factory(_: &ConfigNode) -> anyhow::Result<Arc<dyn Service>> {
    Ok(Arc::new(Echo))
}

#[tokio::test]
async fn call_handlers_are_served_until_shutdown() {
    let agent = Arc::new(LoopbackAgent::default());
    let mesh = Mesh::new();
    mesh.register_agent(agent.clone()).unwrap();
    mesh.register_local("echo", echo_factory).unwrap();

    mesh.start(&[&Inline::new(json!({}))]).await.unwrap();
    assert_eq!(mesh.phase(), Phase::Ready);

    let addr = agent.bound.lock().unwrap().expect("agent listened");
    TcpStream::connect(addr).await.unwrap();

    mesh.shutdown();
    timeout(Duration::from_secs(5), mesh.stopped())
        .await
        .expect("dispatch task stops after shutdown");
}

#[tokio::test]
async fn call_handlers_without_agent_fail_start() {
    let mesh = Mesh::new();
    mesh.register_local("echo", echo_factory).unwrap();

    let err = mesh.start(&[&Inline::new(json!({}))]).await.unwrap_err();

    assert!(matches!(err, MeshError::AgentMissing { ref service } if service == "echo"));
    assert_eq!(err.api_error().code, codes::AGENT);
    assert_eq!(mesh.phase(), Phase::Failed);
    assert!(!mesh.container().is_initialized());
}

#[tokio::test]
async fn failing_connect_aborts_start() {
    let mesh = Mesh::new();
    mesh.register_agent(Arc::new(LoopbackAgent::default()))
        .unwrap();
    mesh.register_remote("billing", |_| anyhow::bail!("unused"))
        .unwrap();

    let err = mesh.start(&[&Inline::new(json!({}))]).await.unwrap_err();

    assert!(matches!(err, MeshError::Connect { ref service, .. } if service == "billing"));
}

#[tokio::test]
async fn stopped_returns_when_nothing_is_served() {
    let mesh = Mesh::new();
    mesh.start(&[&Inline::new(json!({}))]).await.unwrap();
    timeout(Duration::from_secs(1), mesh.stopped())
        .await
        .unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn served_calls_see_a_live_container() {
    let agent = Arc::new(LoopbackAgent::default());
    let mesh = Mesh::new();
    mesh.register_agent(agent.clone()).unwrap();

    let seen = Arc::new(Mutex::new(Vec::new()));
    let grpc = LivenessGrpc {
        container: mesh.container(),
        seen: seen.clone(),
    };
    mesh.register_local("liveness", move |_| -> anyhow::Result<Arc<dyn Service>> {
        Ok(Arc::new(Liveness(grpc.clone())))
    })
    .unwrap();

    mesh.start(&[&Inline::new(json!({}))]).await.unwrap();
    assert!(mesh.container().is_initialized());

    let addr = agent.bound.lock().unwrap().expect("agent listened");
    let channel = Channel::from_shared(format!("http://{addr}"))
        .unwrap()
        .connect()
        .await
        .unwrap();
    let request = Request::builder()
        .method("POST")
        .uri(format!("http://{addr}/meshkit.test.Liveness/Check"))
        .header("content-type", "application/grpc")
        .body(Body::empty())
        .unwrap();
    timeout(Duration::from_secs(5), channel.oneshot(request))
        .await
        .expect("call completes")
        .unwrap();

    assert_eq!(*seen.lock().unwrap(), vec![true]);

    mesh.shutdown();
    timeout(Duration::from_secs(5), mesh.stopped()).await.unwrap();
}
