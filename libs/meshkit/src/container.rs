//! Name-indexed service container.
//!
//! Design goals:
//! - Every created service (and every module) is registered once under a unique name.
//! - Injection is explicit: a service declares a manifest of [`Dependency`] keys and
//!   receives the resolved instances through [`crate::contracts::Service::inject`].
//! - Consumers look services up by name, or collect all services of a given shape.
//!
//! Implementation details:
//! - Entries are kept in registration order with a name index on the side.
//! - Value = `Arc<dyn Service>`; typed reads go through `Arc<dyn Any>` downcasts.
//! - Public lookups only see entries once the runtime has reached steady state.
//!   The flag is a single-writer `AtomicBool` (release on write, acquire on read).
//!
//! Notes:
//! - Registration is append-only: no removal and no re-registration.

use parking_lot::RwLock;
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::contracts::Service;

#[derive(Debug, thiserror::Error)]
pub enum ContainerError {
    #[error("service '{name}' already registered")]
    DuplicateName { name: String },

    #[error("service '{name}' not found")]
    NotFound { name: String },

    #[error("service '{service}' depends on unresolved {dependency:?}")]
    UnresolvedDependency {
        service: String,
        dependency: DependencyKey,
    },

    #[error("type mismatch for '{name}': expected {expected}")]
    TypeMismatch { name: String, expected: &'static str },

    #[error("service '{service}' rejected its dependencies")]
    Inject {
        service: String,
        #[source]
        source: anyhow::Error,
    },
}

/// How a dependency is located in the container.
#[derive(Clone, PartialEq, Eq, Hash)]
pub enum DependencyKey {
    /// A specific entry by name.
    Name(Arc<str>),
    /// The first registered entry of a concrete type.
    Type(&'static str),
}

impl fmt::Debug for DependencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DependencyKey::Name(name) => write!(f, "name={name}"),
            DependencyKey::Type(ty) => write!(f, "type={ty}"),
        }
    }
}

/// One entry of a service's dependency manifest.
#[derive(Clone, Debug)]
pub struct Dependency {
    key: DependencyKey,
    expected: Option<(TypeId, &'static str)>,
    optional: bool,
}

impl Dependency {
    /// Depend on the entry `name`, which must be of concrete type `T`.
    pub fn named<T: Any + Send + Sync>(name: impl Into<Arc<str>>) -> Self {
        Self {
            key: DependencyKey::Name(name.into()),
            expected: Some((TypeId::of::<T>(), std::any::type_name::<T>())),
            optional: false,
        }
    }

    /// Depend on the entry `name` whatever its type.
    pub fn any(name: impl Into<Arc<str>>) -> Self {
        Self {
            key: DependencyKey::Name(name.into()),
            expected: None,
            optional: false,
        }
    }

    /// Depend on the first registered entry of concrete type `T`.
    #[must_use]
    pub fn of_type<T: Any + Send + Sync>() -> Self {
        let type_name = std::any::type_name::<T>();
        Self {
            key: DependencyKey::Type(type_name),
            expected: Some((TypeId::of::<T>(), type_name)),
            optional: false,
        }
    }

    /// Skip this dependency instead of failing when it is absent.
    #[must_use]
    pub fn optional(mut self) -> Self {
        self.optional = true;
        self
    }

    #[must_use]
    pub fn key(&self) -> &DependencyKey {
        &self.key
    }

    #[must_use]
    pub fn is_optional(&self) -> bool {
        self.optional
    }
}

/// Resolved dependencies handed to [`Service::inject`].
#[derive(Default)]
pub struct Dependencies {
    by_name: HashMap<Arc<str>, Arc<dyn Service>>,
    by_type: HashMap<TypeId, Arc<dyn Service>>,
}

impl Dependencies {
    /// Typed access to a dependency declared with [`Dependency::named`].
    ///
    /// # Errors
    /// Returns `NotFound` if it was not resolved and `TypeMismatch` if it is not a `T`.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, ContainerError> {
        let service = self
            .by_name
            .get(name)
            .ok_or_else(|| ContainerError::NotFound {
                name: name.to_owned(),
            })?;
        downcast::<T>(name, service)
    }

    /// Typed access to a dependency declared with [`Dependency::of_type`].
    ///
    /// # Errors
    /// Returns `NotFound` if no entry of type `T` was resolved.
    pub fn get_by_type<T: Any + Send + Sync>(&self) -> Result<Arc<T>, ContainerError> {
        let type_name = std::any::type_name::<T>();
        let service =
            self.by_type
                .get(&TypeId::of::<T>())
                .ok_or_else(|| ContainerError::NotFound {
                    name: type_name.to_owned(),
                })?;
        downcast::<T>(type_name, service)
    }

    /// Untyped access to a dependency declared by name; `None` if it was not resolved.
    #[must_use]
    pub fn service(&self, name: &str) -> Option<Arc<dyn Service>> {
        self.by_name.get(name).cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.by_name.len() + self.by_type.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Entry {
    name: Arc<str>,
    instance: Arc<dyn Service>,
}

#[derive(Default)]
struct State {
    entries: Vec<Entry>,
    index: HashMap<Arc<str>, usize>,
}

/// Name-indexed registry of services and modules.
pub struct Container {
    state: RwLock<State>,
    initialized: AtomicBool,
}

impl Default for Container {
    fn default() -> Self {
        Self::new()
    }
}

impl Container {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: RwLock::new(State::default()),
            initialized: AtomicBool::new(false),
        }
    }

    /// Register `instance` under `name`.
    ///
    /// # Errors
    /// Returns `DuplicateName` if the name is already bound.
    pub fn register(&self, name: &str, instance: Arc<dyn Service>) -> Result<(), ContainerError> {
        let mut w = self.state.write();
        if w.index.contains_key(name) {
            return Err(ContainerError::DuplicateName {
                name: name.to_owned(),
            });
        }

        let name: Arc<str> = Arc::from(name);
        let position = w.entries.len();
        w.index.insert(name.clone(), position);
        w.entries.push(Entry { name, instance });
        Ok(())
    }

    /// Resolve the manifest of `instance` and inject the result.
    ///
    /// Lookups here ignore the steady-state flag: binding runs before it is set.
    ///
    /// # Errors
    /// Returns `UnresolvedDependency`, `TypeMismatch`, or `Inject` if the service
    /// rejects what it was given.
    pub fn bind(&self, name: &str, instance: &Arc<dyn Service>) -> Result<(), ContainerError> {
        let manifest = instance.dependencies();
        let deps = {
            let r = self.state.read();
            Self::resolve(&r, name, &manifest)?
        };

        tracing::trace!(service = name, resolved = deps.len(), "injecting dependencies");
        instance
            .inject(&deps)
            .map_err(|source| ContainerError::Inject {
                service: name.to_owned(),
                source,
            })
    }

    fn resolve(
        state: &State,
        service: &str,
        manifest: &[Dependency],
    ) -> Result<Dependencies, ContainerError> {
        let mut deps = Dependencies::default();

        for dep in manifest {
            let found = match &dep.key {
                DependencyKey::Name(dep_name) => state
                    .index
                    .get(dep_name)
                    .map(|&i| state.entries[i].instance.clone()),
                DependencyKey::Type(_) => dep.expected.and_then(|(type_id, _)| {
                    state
                        .entries
                        .iter()
                        .find(|e| concrete_type_id(e.instance.as_ref()) == type_id)
                        .map(|e| e.instance.clone())
                }),
            };

            let Some(found) = found else {
                if dep.optional {
                    continue;
                }
                return Err(ContainerError::UnresolvedDependency {
                    service: service.to_owned(),
                    dependency: dep.key.clone(),
                });
            };

            if let Some((type_id, expected)) = dep.expected
                && concrete_type_id(found.as_ref()) != type_id
            {
                let name = match &dep.key {
                    DependencyKey::Name(n) => n.to_string(),
                    DependencyKey::Type(t) => (*t).to_owned(),
                };
                return Err(ContainerError::TypeMismatch { name, expected });
            }

            match &dep.key {
                DependencyKey::Name(dep_name) => {
                    deps.by_name.insert(dep_name.clone(), found);
                }
                DependencyKey::Type(_) => {
                    if let Some((type_id, _)) = dep.expected {
                        deps.by_type.insert(type_id, found);
                    }
                }
            }
        }

        Ok(deps)
    }

    /// Mark the container live. Called once by the runtime at steady state.
    pub(crate) fn mark_initialized(&self) {
        self.initialized.store(true, Ordering::Release);
    }

    /// Whether the runtime has reached steady state.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    /// Look up a service by name.
    ///
    /// # Errors
    /// Returns `NotFound` if the name is unknown or the container is not live yet.
    pub fn get_service(&self, name: &str) -> Result<Arc<dyn Service>, ContainerError> {
        if !self.is_initialized() {
            tracing::debug!(service = name, "lookup before steady state");
            return Err(ContainerError::NotFound {
                name: name.to_owned(),
            });
        }

        let r = self.state.read();
        r.index
            .get(name)
            .map(|&i| r.entries[i].instance.clone())
            .ok_or_else(|| ContainerError::NotFound {
                name: name.to_owned(),
            })
    }

    /// Look up a service by name and downcast it to `T`.
    ///
    /// # Errors
    /// Returns `NotFound` (see [`Container::get_service`]) or `TypeMismatch`.
    pub fn get<T: Any + Send + Sync>(&self, name: &str) -> Result<Arc<T>, ContainerError> {
        let service = self.get_service(name)?;
        downcast::<T>(name, &service)
    }

    /// All services of concrete type `T`, in registration order.
    ///
    /// Empty (never an error) before steady state.
    #[must_use]
    pub fn find_all<T: Any + Send + Sync>(&self) -> Vec<Arc<T>> {
        self.find_all_with(|_, service| service.clone().into_any().downcast::<T>().ok())
    }

    /// Collect a projection of every service, in registration order.
    ///
    /// Empty (never an error) before steady state.
    pub fn find_all_with<U, F>(&self, mut projection: F) -> Vec<U>
    where
        F: FnMut(&str, &Arc<dyn Service>) -> Option<U>,
    {
        if !self.is_initialized() {
            return Vec::new();
        }

        let r = self.state.read();
        r.entries
            .iter()
            .filter_map(|e| projection(&e.name, &e.instance))
            .collect()
    }

    /// Registered names, in registration order.
    #[must_use]
    pub fn names(&self) -> Vec<String> {
        self.state
            .read()
            .entries
            .iter()
            .map(|e| e.name.to_string())
            .collect()
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.state.read().index.contains_key(name)
    }

    /// Introspection: total entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.state.read().entries.is_empty()
    }
}

fn concrete_type_id(service: &dyn Service) -> TypeId {
    service.as_any().type_id()
}

fn downcast<T: Any + Send + Sync>(
    name: &str,
    service: &Arc<dyn Service>,
) -> Result<Arc<T>, ContainerError> {
    service
        .clone()
        .into_any()
        .downcast::<T>()
        .map_err(|_| ContainerError::TypeMismatch {
            name: name.to_owned(),
            expected: std::any::type_name::<T>(),
        })
}
