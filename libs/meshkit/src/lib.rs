#![cfg_attr(coverage_nightly, feature(coverage_attribute))]
//! Meshkit: a process-local service runtime.
//!
//! Services are registered by name (locally built, remote proxies, or created by
//! modules), wired together by an explicit dependency container and driven
//! through a fixed lifecycle by [`Mesh`]. Extensions observe creation, start
//! alongside the lifecycle and intercept inbound gRPC calls.
//!
//! ```no_run
//! # async fn run() -> anyhow::Result<()> {
//! use meshkit::{Mesh, config::YamlFile};
//!
//! let mesh = Mesh::builder().span(tracing::info_span!("mesh")).build();
//! // mesh.register_module(...), mesh.register_extension(...), ...
//! mesh.start(&[&YamlFile::new("config/mesh.yaml")]).await?;
//! # Ok(())
//! # }
//! ```

pub mod catalog;
pub mod config;
pub mod container;
pub mod contracts;
pub mod errors;
pub mod extension;
pub mod interceptor;
pub mod runtime;
pub mod telemetry;

pub use catalog::{Origin, RegistryError, ServiceCatalog};
pub use config::{ConfigError, ConfigLoader, ConfigNode};
pub use container::{Container, ContainerError, Dependencies, Dependency};
pub use contracts::{CallHandler, Module, Runnable, Service};
pub use errors::ApiError;
pub use extension::{Extension, ExtensionRegistry, RunnableExtension, ServiceHook};
pub use interceptor::{CallContext, CallInterceptor, InterceptorChain};
pub use runtime::{Mesh, MeshBuilder, MeshError, Phase, RemoteAgent, global};

// Re-exported for trait implementors.
pub use async_trait::async_trait;
