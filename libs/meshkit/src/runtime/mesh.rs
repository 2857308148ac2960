//! Lifecycle orchestrator.
//!
//! `Mesh` owns every registration and drives them through the lifecycle, one
//! phase at a time and never overlapping:
//! - `config_resolve`: merge all configuration sources
//! - `remote_agent_start`: start the transport agent, if one is registered
//! - `create`: catalog group first (remote proxies, then local services), then each
//!   module in registration order: `configure`, `begin_create`, `create_service`
//!   per declared name, `end_create`
//! - `bind`: inject dependencies into every created instance
//! - runnable extensions are started
//! - `setup`: `begin_setup`, `setup_service` per service, `end_setup`
//! - `start`: `begin_start`; per service, `Runnable::start` then `start_service`;
//!   `end_start`. Afterwards the gRPC dispatch surface is stood up if any service
//!   handles calls.
//! - steady state: the container is marked live
//!
//! The first error aborts `start`. Services built so far stay alive, but the
//! container is never marked live.

use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tonic::service::RoutesBuilder;
use tonic::transport::Channel;
use tracing::Instrument;

use super::agent::RemoteAgent;
use super::dispatch;
use super::errors::MeshError;
use super::phase::Phase;
use crate::catalog::{CatalogEntry, Factory, RegistryError, ServiceCatalog};
use crate::config::{self, ConfigLoader, ConfigNode, ROOT_KEY};
use crate::container::Container;
use crate::contracts::{Module, Service};
use crate::extension::{Extension, ExtensionRegistry};

const MODULES_KEY: &str = "modules";
const SERVICES_KEY: &str = "services";

struct ModuleEntry {
    module: Arc<dyn Module>,
    services: Vec<String>,
}

#[derive(Default)]
struct Registrations {
    catalog: ServiceCatalog,
    modules: Vec<ModuleEntry>,
    agent: Option<Arc<dyn RemoteAgent>>,
}

impl Registrations {
    fn name_taken(&self, name: &str) -> bool {
        self.catalog.contains(name)
            || self
                .modules
                .iter()
                .any(|m| m.module.name() == name || m.services.iter().any(|s| s == name))
    }
}

/// Who drives a creation group's lifecycle hooks.
enum Owner {
    Catalog,
    Module(Arc<dyn Module>),
}

struct Created {
    name: String,
    service: Arc<dyn Service>,
}

struct Group {
    owner: Owner,
    services: Vec<Created>,
}

impl Group {
    fn label(&self) -> &str {
        match &self.owner {
            Owner::Catalog => "catalog",
            Owner::Module(module) => module.name(),
        }
    }
}

/// Builder for [`Mesh`].
#[derive(Default)]
pub struct MeshBuilder {
    span: Option<tracing::Span>,
}

impl MeshBuilder {
    /// Span every lifecycle event is recorded under.
    #[must_use]
    pub fn span(mut self, span: tracing::Span) -> Self {
        self.span = Some(span);
        self
    }

    #[must_use]
    pub fn build(self) -> Mesh {
        Mesh {
            registrations: Mutex::new(Registrations::default()),
            extensions: ExtensionRegistry::new(),
            container: Arc::new(Container::new()),
            phase: RwLock::new(Phase::Idle),
            started: AtomicBool::new(false),
            span: self
                .span
                .unwrap_or_else(|| tracing::info_span!("mesh")),
            cancel: CancellationToken::new(),
            server: Mutex::new(None),
        }
    }
}

/// The process-local service runtime.
pub struct Mesh {
    registrations: Mutex<Registrations>,
    extensions: ExtensionRegistry,
    container: Arc<Container>,
    phase: RwLock<Phase>,
    started: AtomicBool,
    span: tracing::Span,
    cancel: CancellationToken,
    server: Mutex<Option<JoinHandle<()>>>,
}

impl Default for Mesh {
    fn default() -> Self {
        Self::new()
    }
}

impl Mesh {
    #[must_use]
    pub fn new() -> Self {
        MeshBuilder::default().build()
    }

    #[must_use]
    pub fn builder() -> MeshBuilder {
        MeshBuilder::default()
    }

    fn register_with<F>(&self, name: &str, insert: F) -> Result<(), RegistryError>
    where
        F: FnOnce(&mut Registrations) -> Result<(), RegistryError>,
    {
        let mut regs = self.registrations.lock();
        if self.started.load(Ordering::Acquire) {
            return Err(RegistryError::Sealed);
        }
        if regs.name_taken(name) {
            return Err(RegistryError::DuplicateService {
                name: name.to_owned(),
            });
        }
        insert(&mut regs)
    }

    /// Register a locally constructed service.
    ///
    /// # Errors
    /// `DuplicateService` if the name is taken, `Sealed` once start has begun.
    pub fn register_local<F>(&self, name: &str, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(&ConfigNode) -> anyhow::Result<Arc<dyn Service>> + Send + Sync + 'static,
    {
        self.register_with(name, |regs| {
            regs.catalog.register_local(name, Arc::new(factory))
        })?;
        tracing::debug!(service = name, origin = "local", "service registered");
        Ok(())
    }

    /// Register a proxy for a service reached through the remote agent.
    ///
    /// # Errors
    /// `DuplicateService` if the name is taken, `Sealed` once start has begun.
    pub fn register_remote<F>(&self, name: &str, factory: F) -> Result<(), RegistryError>
    where
        F: Fn(Channel) -> anyhow::Result<Arc<dyn Service>> + Send + Sync + 'static,
    {
        self.register_with(name, |regs| {
            regs.catalog.register_remote(name, Arc::new(factory))
        })?;
        tracing::debug!(service = name, origin = "remote", "service registered");
        Ok(())
    }

    /// Register a module and the service names it creates, in creation order.
    ///
    /// # Errors
    /// `DuplicateService` if the module name or any service name is taken
    /// (including twice in `services`), `Sealed` once start has begun.
    pub fn register_module<I, S>(
        &self,
        module: Arc<dyn Module>,
        services: I,
    ) -> Result<(), RegistryError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let services: Vec<String> = services.into_iter().map(Into::into).collect();
        let module_name = module.name().to_owned();

        self.register_with(&module_name, |regs| {
            for (i, name) in services.iter().enumerate() {
                if *name == module_name || regs.name_taken(name) || services[..i].contains(name) {
                    return Err(RegistryError::DuplicateService { name: name.clone() });
                }
            }
            regs.modules.push(ModuleEntry {
                module,
                services: services.clone(),
            });
            Ok(())
        })?;

        tracing::debug!(module = %module_name, services = ?services, "module registered");
        Ok(())
    }

    /// # Errors
    /// `DuplicateExtension` on a name collision, `Sealed` once start has begun.
    pub fn register_extension(&self, extension: Arc<dyn Extension>) -> Result<(), RegistryError> {
        if self.started.load(Ordering::Acquire) {
            return Err(RegistryError::Sealed);
        }
        self.extensions.register(extension)
    }

    /// # Errors
    /// `AgentExists` if an agent is already registered, `Sealed` once start has begun.
    pub fn register_agent(&self, agent: Arc<dyn RemoteAgent>) -> Result<(), RegistryError> {
        let mut regs = self.registrations.lock();
        if self.started.load(Ordering::Acquire) {
            return Err(RegistryError::Sealed);
        }
        if regs.agent.is_some() {
            return Err(RegistryError::AgentExists);
        }
        regs.agent = Some(agent);
        Ok(())
    }

    /// Shared handle to the container; lookups turn live at steady state.
    #[must_use]
    pub fn container(&self) -> Arc<Container> {
        self.container.clone()
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        *self.phase.read()
    }

    fn enter(&self, phase: Phase) {
        *self.phase.write() = phase;
        tracing::info!("Phase: {phase}");
    }

    /// Stop the gRPC dispatch surface, if it was started.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Wait for the gRPC dispatch task to finish. Returns at once if none runs.
    pub async fn stopped(&self) {
        let handle = self.server.lock().take();
        if let Some(handle) = handle
            && let Err(e) = handle.await
        {
            tracing::warn!(error = %e, "gRPC dispatch task aborted");
        }
    }

    /// Run the full lifecycle. Can be entered only once.
    ///
    /// # Errors
    /// `AlreadyStarted` on a second call; otherwise the first error of any
    /// phase, with the phase and the offending name attached.
    pub async fn start(&self, loaders: &[&dyn ConfigLoader]) -> Result<(), MeshError> {
        {
            let _regs = self.registrations.lock();
            if self.started.swap(true, Ordering::AcqRel) {
                return Err(MeshError::AlreadyStarted);
            }
        }

        let span = self.span.clone();
        let result = self.run(loaders).instrument(span.clone()).await;

        span.in_scope(|| match &result {
            Ok(()) => {
                self.container.mark_initialized();
                self.enter(Phase::Ready);
            }
            Err(e) => {
                *self.phase.write() = Phase::Failed;
                tracing::error!(error = %e, "mesh start failed");
            }
        });
        result
    }

    async fn run(&self, loaders: &[&dyn ConfigLoader]) -> Result<(), MeshError> {
        let extensions = self.extensions.ordered_view();

        self.enter(Phase::ConfigResolve);
        let root = config::resolve(loaders)?;

        let (catalog, modules, agent) = {
            let regs = self.registrations.lock();
            let modules: Vec<(Arc<dyn Module>, Vec<String>)> = regs
                .modules
                .iter()
                .map(|m| (m.module.clone(), m.services.clone()))
                .collect();
            (regs.catalog.clone(), modules, regs.agent.clone())
        };

        if let Some(agent) = &agent {
            self.enter(Phase::RemoteAgentStart);
            agent.start(&root).await.map_err(MeshError::AgentStart)?;
        } else if let Some(name) = catalog
            .creation_order()
            .find(|e| matches!(e.factory, Factory::Remote(_)))
            .map(|e| e.name.clone())
        {
            return Err(MeshError::AgentMissing { service: name });
        }

        self.enter(Phase::Create);
        let mut groups = Vec::with_capacity(modules.len() + 1);
        groups.push(
            self.create_catalog(&catalog, &root, agent.as_deref(), &extensions)
                .await?,
        );
        for (module, services) in modules {
            groups.push(
                self.create_module(module, &services, &root, &extensions)
                    .await?,
            );
        }

        self.enter(Phase::Bind);
        self.bind_all(&groups)?;
        Self::start_extensions(&extensions).await?;

        self.enter(Phase::Setup);
        Self::setup_all(&groups).await?;

        self.enter(Phase::Start);
        Self::start_all(&groups).await?;
        self.serve_call_handlers(&groups, agent.as_deref()).await
    }

    async fn create_catalog(
        &self,
        catalog: &ServiceCatalog,
        root: &ConfigNode,
        agent: Option<&dyn RemoteAgent>,
        extensions: &[Arc<dyn Extension>],
    ) -> Result<Group, MeshError> {
        let mut group = Group {
            owner: Owner::Catalog,
            services: Vec::with_capacity(catalog.len()),
        };

        for CatalogEntry { name, factory } in catalog.creation_order() {
            tracing::debug!(service = %name, "creating catalog service");
            let service = match factory {
                Factory::Remote(factory) => {
                    let agent = agent.ok_or_else(|| MeshError::AgentMissing {
                        service: name.clone(),
                    })?;
                    let channel =
                        agent
                            .connect(name)
                            .await
                            .map_err(|source| MeshError::Connect {
                                service: name.clone(),
                                source,
                            })?;
                    factory(channel)
                }
                Factory::Local(factory) => {
                    let config = match agent {
                        Some(agent) => agent.service_config(name).await.map_err(|source| {
                            MeshError::ServiceConfig {
                                service: name.clone(),
                                source,
                            }
                        })?,
                        None => root.sub_config(&[ROOT_KEY, SERVICES_KEY, name.as_str()])?,
                    };
                    factory(&config)
                }
            }
            .map_err(|source| MeshError::Create {
                service: name.clone(),
                source,
            })?;

            self.register_created(&mut group, name, service, extensions)?;
        }

        Ok(group)
    }

    async fn create_module(
        &self,
        module: Arc<dyn Module>,
        services: &[String],
        root: &ConfigNode,
        extensions: &[Arc<dyn Extension>],
    ) -> Result<Group, MeshError> {
        let module_name = module.name().to_owned();
        let hook = |stage: &'static str| {
            let module = module_name.clone();
            move |source| MeshError::Hook {
                module,
                hook: stage,
                source,
            }
        };

        let as_service: Arc<dyn Service> = module.clone();
        self.container.register(&module_name, as_service)?;

        let module_config = root.sub_config(&[ROOT_KEY, MODULES_KEY, module_name.as_str()])?;
        module
            .configure(&module_config)
            .map_err(hook("configure"))?;

        tracing::debug!(module = %module_name, "begin_create");
        module.begin_create().await.map_err(hook("begin_create"))?;

        let mut group = Group {
            owner: Owner::Module(module.clone()),
            services: Vec::with_capacity(services.len()),
        };
        for name in services {
            let config = root.sub_config(&[ROOT_KEY, SERVICES_KEY, name.as_str()])?;
            let service = module
                .create_service(name, &config)
                .await
                .map_err(|source| MeshError::Create {
                    service: name.clone(),
                    source,
                })?;
            self.register_created(&mut group, name, service, extensions)?;
        }

        module.end_create().await.map_err(hook("end_create"))?;
        Ok(group)
    }

    /// Make a created service visible in the container and announce it to
    /// every service hook, in extension order.
    fn register_created(
        &self,
        group: &mut Group,
        name: &str,
        service: Arc<dyn Service>,
        extensions: &[Arc<dyn Extension>],
    ) -> Result<(), MeshError> {
        self.container.register(name, service.clone())?;

        for ext in extensions {
            if let Some(hook) = ext.as_service_hook() {
                hook.register_service(name, &service)
                    .map_err(|source| MeshError::Extension {
                        extension: ext.name().to_owned(),
                        hook: "register_service",
                        source,
                    })?;
            }
        }

        tracing::debug!(group = group.label(), service = name, "service created");
        group.services.push(Created {
            name: name.to_owned(),
            service,
        });
        Ok(())
    }

    fn bind_all(&self, groups: &[Group]) -> Result<(), MeshError> {
        for group in groups {
            if let Owner::Module(module) = &group.owner {
                let as_service: Arc<dyn Service> = module.clone();
                self.container
                    .bind(module.name(), &as_service)
                    .map_err(MeshError::Bind)?;
            }
            for created in &group.services {
                self.container
                    .bind(&created.name, &created.service)
                    .map_err(MeshError::Bind)?;
            }
        }
        Ok(())
    }

    async fn start_extensions(extensions: &[Arc<dyn Extension>]) -> Result<(), MeshError> {
        for ext in extensions {
            if let Some(runnable) = ext.as_runnable() {
                tracing::debug!(extension = ext.name(), "starting extension");
                runnable
                    .start()
                    .await
                    .map_err(|source| MeshError::Extension {
                        extension: ext.name().to_owned(),
                        hook: "start",
                        source,
                    })?;
            }
        }
        Ok(())
    }

    async fn setup_all(groups: &[Group]) -> Result<(), MeshError> {
        for group in groups {
            let Owner::Module(module) = &group.owner else {
                continue;
            };
            let hook = |stage: &'static str| {
                move |source| MeshError::Hook {
                    module: module.name().to_owned(),
                    hook: stage,
                    source,
                }
            };

            module.begin_setup().await.map_err(hook("begin_setup"))?;
            for created in &group.services {
                module
                    .setup_service(&created.name, &created.service)
                    .await
                    .map_err(hook("setup_service"))?;
            }
            module.end_setup().await.map_err(hook("end_setup"))?;
        }
        Ok(())
    }

    async fn start_all(groups: &[Group]) -> Result<(), MeshError> {
        for group in groups {
            let module = match &group.owner {
                Owner::Module(module) => Some(module),
                Owner::Catalog => None,
            };
            let hook = |stage: &'static str| {
                let module = group.label().to_owned();
                move |source| MeshError::Hook {
                    module,
                    hook: stage,
                    source,
                }
            };

            if let Some(module) = module {
                module.begin_start().await.map_err(hook("begin_start"))?;
            }
            for created in &group.services {
                if let Some(runnable) = created.service.as_runnable() {
                    tracing::debug!(service = %created.name, "starting service");
                    runnable
                        .start()
                        .await
                        .map_err(|source| MeshError::ServiceStart {
                            service: created.name.clone(),
                            source,
                        })?;
                }
                if let Some(module) = module {
                    module
                        .start_service(&created.name, &created.service)
                        .await
                        .map_err(hook("start_service"))?;
                }
            }
            if let Some(module) = module {
                module.end_start().await.map_err(hook("end_start"))?;
            }
        }
        Ok(())
    }

    async fn serve_call_handlers(
        &self,
        groups: &[Group],
        agent: Option<&dyn RemoteAgent>,
    ) -> Result<(), MeshError> {
        let handlers: Vec<&Created> = groups
            .iter()
            .flat_map(|g| g.services.iter())
            .filter(|c| c.service.as_call_handler().is_some())
            .collect();
        let Some(first) = handlers.first() else {
            return Ok(());
        };
        let agent = agent.ok_or_else(|| MeshError::AgentMissing {
            service: first.name.clone(),
        })?;

        let mut routes = RoutesBuilder::default();
        for created in &handlers {
            if let Some(handler) = created.service.as_call_handler() {
                handler
                    .register_grpc(&mut routes)
                    .map_err(|source| MeshError::GrpcHandle {
                        service: created.name.clone(),
                        source,
                    })?;
            }
        }

        let listener = agent.listen().await.map_err(MeshError::Listen)?;
        let chain = self.extensions.interceptor_chain();
        let cancel = self.cancel.clone();
        tracing::info!(handlers = handlers.len(), "starting gRPC dispatch");

        // Calls may arrive as soon as the task runs; lookups must already be live.
        self.container.mark_initialized();
        let task = tokio::spawn(
            async move {
                if let Err(e) = dispatch::serve(listener, routes.routes(), chain, cancel).await {
                    tracing::error!(error = %e, "gRPC dispatch failed");
                }
            }
            .instrument(self.span.clone()),
        );
        *self.server.lock() = Some(task);
        Ok(())
    }
}
