//! Demonstration wiring: a `demo` module owning a runnable `clock` and a
//! `greeter` that depends on it, plus an `audit` extension that logs service
//! creation and inbound calls.

use async_trait::async_trait;
use http::header::CONTENT_TYPE;
use http::{HeaderValue, Request, Response};
use parking_lot::RwLock;
use serde::Deserialize;
use std::convert::Infallible;
use std::future::{Ready, ready};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};
use std::time::{Duration, Instant};
use tonic::body::Body;
use tonic::server::NamedService;
use tonic::service::RoutesBuilder;

use meshkit::{
    CallContext, CallHandler, CallInterceptor, ConfigNode, Dependencies, Dependency, Extension,
    Mesh, Module, RegistryError, Runnable, Service, ServiceHook,
};

pub const MODULE: &str = "demo";
pub const CLOCK: &str = "clock";
pub const GREETER: &str = "greeter";

/// Header carrying the caller's name.
pub const NAME_HEADER: &str = "x-name";
/// Header carrying the greeting in the response.
pub const GREETING_HEADER: &str = "x-greeting";

/// Register the demo module and the audit extension.
///
/// # Errors
/// Fails if the names are already taken or the mesh has started.
pub fn register(mesh: &Mesh) -> Result<Arc<Audit>, RegistryError> {
    mesh.register_module(Arc::new(DemoModule::default()), [CLOCK, GREETER])?;
    let audit = Arc::new(Audit::default());
    mesh.register_extension(audit.clone())?;
    Ok(audit)
}

#[derive(Default)]
pub struct Clock {
    started_at: OnceLock<Instant>,
}

impl Clock {
    /// Time since the clock was started; `None` before start.
    #[must_use]
    pub fn uptime(&self) -> Option<Duration> {
        self.started_at.get().map(Instant::elapsed)
    }
}

impl Service for Clock {
    fn as_runnable(&self) -> Option<&dyn Runnable> {
        Some(self)
    }
}

#[async_trait]
impl Runnable for Clock {
    async fn start(&self) -> anyhow::Result<()> {
        self.started_at
            .set(Instant::now())
            .map_err(|_| anyhow::anyhow!("clock started twice"))?;
        tracing::debug!(service = CLOCK, "clock started");
        Ok(())
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GreeterConfig {
    pub greeting: String,
}

impl Default for GreeterConfig {
    fn default() -> Self {
        Self {
            greeting: "hello".to_owned(),
        }
    }
}

pub struct Greeter {
    greeting: String,
    clock: OnceLock<Arc<Clock>>,
}

impl Greeter {
    fn new(cfg: GreeterConfig) -> Self {
        Self {
            greeting: cfg.greeting,
            clock: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn clock(&self) -> Option<&Arc<Clock>> {
        self.clock.get()
    }
}

impl Service for Greeter {
    fn dependencies(&self) -> Vec<Dependency> {
        vec![Dependency::named::<Clock>(CLOCK)]
    }

    fn inject(&self, deps: &Dependencies) -> anyhow::Result<()> {
        let clock = deps.get::<Clock>(CLOCK)?;
        self.clock
            .set(clock)
            .map_err(|_| anyhow::anyhow!("greeter injected twice"))
    }

    fn as_runnable(&self) -> Option<&dyn Runnable> {
        Some(self)
    }

    fn as_call_handler(&self) -> Option<&dyn CallHandler> {
        Some(self)
    }
}

#[async_trait]
impl Runnable for Greeter {
    async fn start(&self) -> anyhow::Result<()> {
        let uptime = self
            .clock()
            .and_then(|clock| clock.uptime())
            .ok_or_else(|| anyhow::anyhow!("clock is not running"))?;
        tracing::info!(
            service = GREETER,
            clock_uptime_us = u64::try_from(uptime.as_micros()).unwrap_or(u64::MAX),
            "greeter ready"
        );
        Ok(())
    }
}

impl CallHandler for Greeter {
    fn register_grpc(&self, routes: &mut RoutesBuilder) -> anyhow::Result<()> {
        routes.add_service(GreeterGrpc {
            greeting: self.greeting.clone().into(),
        });
        Ok(())
    }
}

/// Trailers-only responder: greets the `x-name` header back in `x-greeting`.
#[derive(Clone)]
struct GreeterGrpc {
    greeting: Arc<str>,
}

impl NamedService for GreeterGrpc {
    const NAME: &'static str = "meshkit.demo.Greeter";
}

impl tower::Service<Request<Body>> for GreeterGrpc {
    type Response = Response<Body>;
    type Error = Infallible;
    type Future = Ready<Result<Self::Response, Self::Error>>;

    fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        let who = req
            .headers()
            .get(NAME_HEADER)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("world");
        let greeting = format!("{}, {who}", self.greeting);

        let mut response = Response::new(Body::empty());
        let headers = response.headers_mut();
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/grpc"));
        headers.insert("grpc-status", HeaderValue::from_static("0"));
        if let Ok(value) = HeaderValue::from_str(&greeting) {
            headers.insert(GREETING_HEADER, value);
        }
        ready(Ok(response))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DemoConfig {
    pub banner: String,
}

impl Default for DemoConfig {
    fn default() -> Self {
        Self {
            banner: "meshkit demo".to_owned(),
        }
    }
}

#[derive(Default)]
pub struct DemoModule {
    config: RwLock<DemoConfig>,
}

impl Service for DemoModule {}

#[async_trait]
impl Module for DemoModule {
    fn name(&self) -> &str {
        MODULE
    }

    fn configure(&self, config: &ConfigNode) -> anyhow::Result<()> {
        *self.config.write() = config.extract_or_default()?;
        Ok(())
    }

    async fn create_service(
        &self,
        name: &str,
        config: &ConfigNode,
    ) -> anyhow::Result<Arc<dyn Service>> {
        match name {
            CLOCK => Ok(Arc::new(Clock::default())),
            GREETER => Ok(Arc::new(Greeter::new(config.extract_or_default()?))),
            other => anyhow::bail!("module '{MODULE}' has no service '{other}'"),
        }
    }

    async fn end_start(&self) -> anyhow::Result<()> {
        let banner = self.config.read().banner.clone();
        tracing::info!(module = MODULE, %banner, "module started");
        Ok(())
    }
}

/// Logs every created service and every inbound call.
#[derive(Default)]
pub struct Audit {
    created: AtomicUsize,
    calls: AtomicUsize,
}

impl Audit {
    #[must_use]
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::Relaxed)
    }
}

impl Extension for Audit {
    fn name(&self) -> &'static str {
        "audit"
    }

    fn as_service_hook(&self) -> Option<&dyn ServiceHook> {
        Some(self)
    }

    fn as_interceptor(&self) -> Option<&dyn CallInterceptor> {
        Some(self)
    }
}

impl ServiceHook for Audit {
    fn register_service(&self, name: &str, _service: &Arc<dyn Service>) -> anyhow::Result<()> {
        self.created.fetch_add(1, Ordering::Relaxed);
        tracing::debug!(service = name, "service created");
        Ok(())
    }
}

#[async_trait]
impl CallInterceptor for Audit {
    async fn before_call(&self, ctx: CallContext) -> anyhow::Result<CallContext> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        tracing::info!(method = ctx.method(), "inbound call");
        Ok(ctx)
    }

    async fn after_call(&self, ctx: &CallContext) -> anyhow::Result<()> {
        tracing::debug!(method = ctx.method(), "call completed");
        Ok(())
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use meshkit::config::Inline;
    use meshkit_transport_grpc::TcpAgent;
    use serde_json::json;
    use tonic::transport::Channel;
    use tower::ServiceExt;

    fn config() -> Inline {
        Inline::new(json!({
            "mesh": {
                "agent": { "listen_addr": "127.0.0.1:0" },
                "modules": { "demo": { "banner": "test" } },
                "services": { "greeter": { "greeting": "hi" } }
            }
        }))
    }

    #[tokio::test]
    async fn greeter_is_bound_to_running_clock() {
        let mesh = Mesh::new();
        mesh.register_agent(Arc::new(TcpAgent::new())).unwrap();
        let audit = register(&mesh).unwrap();

        mesh.start(&[&config()]).await.unwrap();

        let container = mesh.container();
        let greeter = container.get::<Greeter>(GREETER).unwrap();
        let clock = container.get::<Clock>(CLOCK).unwrap();
        assert!(Arc::ptr_eq(greeter.clock().unwrap(), &clock));
        assert!(clock.uptime().is_some());
        assert_eq!(&*greeter.greeting, "hi");
        assert_eq!(audit.created(), 2);
        assert_eq!(audit.name(), "audit");

        mesh.shutdown();
        mesh.stopped().await;
    }

    #[tokio::test]
    async fn greeting_is_served_through_the_interceptor() {
        let mesh = Mesh::new();
        let agent = Arc::new(TcpAgent::new());
        mesh.register_agent(agent.clone()).unwrap();
        let audit = register(&mesh).unwrap();
        mesh.start(&[&config()]).await.unwrap();

        let addr = agent.bound_addr().unwrap();
        let channel = Channel::from_shared(format!("http://{addr}"))
            .unwrap()
            .connect()
            .await
            .unwrap();
        let request = Request::builder()
            .method("POST")
            .uri(format!("http://{addr}/meshkit.demo.Greeter/Greet"))
            .header(CONTENT_TYPE, "application/grpc")
            .header(NAME_HEADER, "ada")
            .body(Body::empty())
            .unwrap();
        let response = channel.oneshot(request).await.unwrap();

        assert_eq!(response.headers()[GREETING_HEADER], "hi, ada");
        assert_eq!(audit.calls(), 1);

        mesh.shutdown();
        mesh.stopped().await;
    }

    #[tokio::test]
    async fn unknown_service_is_rejected_by_the_module() {
        let module = DemoModule::default();
        let err = module
            .create_service("weather", &ConfigNode::default())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("weather"));
    }

    #[test]
    fn module_config_falls_back_to_defaults() {
        let module = DemoModule::default();
        module.configure(&ConfigNode::default()).unwrap();
        assert_eq!(module.config.read().banner, "meshkit demo");

        module
            .configure(&ConfigNode::root(json!({ "banner": "custom" })))
            .unwrap();
        assert_eq!(module.config.read().banner, "custom");
    }
}
