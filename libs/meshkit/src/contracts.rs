use async_trait::async_trait;
use std::any::Any;
use std::sync::Arc;
use tonic::service::RoutesBuilder;

use crate::config::ConfigNode;
use crate::container::{Dependencies, Dependency};

/// Upcasting helpers implemented for every `'static` thread-safe type.
pub trait AsAny: Any + Send + Sync {
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: Any + Send + Sync> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

/// A unit registered in the container.
///
/// Services have no required shape. Optional capabilities are reported through
/// the `as_*` accessors; the runtime only inspects them at fixed lifecycle points.
///
/// Injection is manifest driven: the container resolves everything returned by
/// [`Service::dependencies`] and hands the result to [`Service::inject`].
pub trait Service: AsAny {
    /// Dependencies this service wants injected during the bind phase.
    fn dependencies(&self) -> Vec<Dependency> {
        Vec::new()
    }

    /// Receive the resolved dependencies. Called exactly once, during bind.
    ///
    /// # Errors
    /// Implementations return an error if a dependency cannot be stored.
    fn inject(&self, _deps: &Dependencies) -> anyhow::Result<()> {
        Ok(())
    }

    fn as_runnable(&self) -> Option<&dyn Runnable> {
        None
    }

    fn as_call_handler(&self) -> Option<&dyn CallHandler> {
        None
    }
}

/// Services that must be started once everything is bound and set up.
#[async_trait]
pub trait Runnable: Send + Sync {
    /// Awaited during the start phase, before the owning module's `start_service`.
    async fn start(&self) -> anyhow::Result<()>;
}

/// Services that serve remote calls.
pub trait CallHandler: Send + Sync {
    /// Attach this service's gRPC routes to the process-wide server.
    ///
    /// # Errors
    /// Returns an error if the routes cannot be built.
    fn register_grpc(&self, routes: &mut RoutesBuilder) -> anyhow::Result<()>;
}

/// A unit owning a set of services and the lifecycle hooks that create them.
///
/// The module itself is a container entry under [`Module::name`] and is bound
/// (injected) just like the services it creates.
#[async_trait]
pub trait Module: Service {
    fn name(&self) -> &str;

    /// Receives `mesh.modules.<name>` before the create phase.
    ///
    /// # Errors
    /// Returns an error if the module configuration is invalid.
    fn configure(&self, _config: &ConfigNode) -> anyhow::Result<()> {
        Ok(())
    }

    async fn begin_create(&self) -> anyhow::Result<()> {
        Ok(())
    }

    /// Build the service declared under `name` from its `mesh.services.<name>` node.
    async fn create_service(
        &self,
        name: &str,
        config: &ConfigNode,
    ) -> anyhow::Result<Arc<dyn Service>>;

    async fn end_create(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn begin_setup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn setup_service(&self, _name: &str, _service: &Arc<dyn Service>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn end_setup(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn begin_start(&self) -> anyhow::Result<()> {
        Ok(())
    }

    async fn start_service(&self, _name: &str, _service: &Arc<dyn Service>) -> anyhow::Result<()> {
        Ok(())
    }

    async fn end_start(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
