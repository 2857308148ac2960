//! Service catalog: ordered `(name, factory)` registrations, local or remote.
//!
//! Names are unique across *both* lists. Each list keeps registration order,
//! which is the creation order of the catalog group.

use std::sync::Arc;
use tonic::transport::Channel;

use crate::config::ConfigNode;
use crate::contracts::Service;
use crate::errors::ApiError;

/// Builds a locally constructed service from its configuration node.
pub type LocalFactory = Arc<dyn Fn(&ConfigNode) -> anyhow::Result<Arc<dyn Service>> + Send + Sync>;

/// Builds a proxy for a remote service over a channel opened by the agent.
pub type RemoteFactory = Arc<dyn Fn(Channel) -> anyhow::Result<Arc<dyn Service>> + Send + Sync>;

/// Registration-time failures.
#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("service '{name}' already registered")]
    DuplicateService { name: String },

    #[error("extension '{name}' already registered")]
    DuplicateExtension { name: String },

    #[error("remote agent already registered")]
    AgentExists,

    #[error("registrations are closed once start has begun")]
    Sealed,
}

impl RegistryError {
    /// Wire representation of this error.
    #[must_use]
    pub fn api_error(&self) -> ApiError {
        match self {
            RegistryError::DuplicateService { .. }
            | RegistryError::DuplicateExtension { .. }
            | RegistryError::AgentExists => ApiError::exists(self.to_string()),
            RegistryError::Sealed => ApiError::internal(self.to_string()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

#[derive(Clone)]
pub(crate) enum Factory {
    Local(LocalFactory),
    Remote(RemoteFactory),
}

#[derive(Clone)]
pub(crate) struct CatalogEntry {
    pub(crate) name: String,
    pub(crate) factory: Factory,
}

#[derive(Default, Clone)]
pub struct ServiceCatalog {
    local: Vec<CatalogEntry>,
    remote: Vec<CatalogEntry>,
}

impl ServiceCatalog {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// # Errors
    /// Returns `DuplicateService` if `name` is already in either list.
    pub fn register_local(
        &mut self,
        name: impl Into<String>,
        factory: LocalFactory,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        self.ensure_unique(&name)?;
        self.local.push(CatalogEntry {
            name,
            factory: Factory::Local(factory),
        });
        Ok(())
    }

    /// # Errors
    /// Returns `DuplicateService` if `name` is already in either list.
    pub fn register_remote(
        &mut self,
        name: impl Into<String>,
        factory: RemoteFactory,
    ) -> Result<(), RegistryError> {
        let name = name.into();
        self.ensure_unique(&name)?;
        self.remote.push(CatalogEntry {
            name,
            factory: Factory::Remote(factory),
        });
        Ok(())
    }

    fn ensure_unique(&self, name: &str) -> Result<(), RegistryError> {
        if self.origin(name).is_some() {
            return Err(RegistryError::DuplicateService {
                name: name.to_owned(),
            });
        }
        Ok(())
    }

    #[must_use]
    pub fn origin(&self, name: &str) -> Option<Origin> {
        if self.local.iter().any(|e| e.name == name) {
            Some(Origin::Local)
        } else if self.remote.iter().any(|e| e.name == name) {
            Some(Origin::Remote)
        } else {
            None
        }
    }

    #[must_use]
    pub fn contains(&self, name: &str) -> bool {
        self.origin(name).is_some()
    }

    #[must_use]
    pub fn has_remote(&self) -> bool {
        !self.remote.is_empty()
    }

    /// Creation order of the catalog group: remote proxies, then local services.
    pub(crate) fn creation_order(&self) -> impl Iterator<Item = &CatalogEntry> {
        self.remote.iter().chain(self.local.iter())
    }

    /// Names in creation order.
    #[must_use]
    pub fn names(&self) -> Vec<&str> {
        self.creation_order().map(|e| e.name.as_str()).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.local.len() + self.remote.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::errors::codes;

    struct Plain;
    impl Service for Plain {}

    fn local() -> LocalFactory {
        Arc::new(|_| Ok(Arc::new(Plain) as Arc<dyn Service>))
    }

    fn remote() -> RemoteFactory {
        Arc::new(|_| Ok(Arc::new(Plain) as Arc<dyn Service>))
    }

    #[test]
    fn duplicates_are_rejected_across_origins() {
        #[derive(Clone, Copy)]
        enum Kind {
            L,
            R,
        }

        for (first, second) in [
            (Kind::L, Kind::L),
            (Kind::L, Kind::R),
            (Kind::R, Kind::L),
            (Kind::R, Kind::R),
        ] {
            let mut catalog = ServiceCatalog::new();
            let register = |catalog: &mut ServiceCatalog, kind: Kind| match kind {
                Kind::L => catalog.register_local("svc", local()),
                Kind::R => catalog.register_remote("svc", remote()),
            };

            register(&mut catalog, first).unwrap();
            let err = register(&mut catalog, second).unwrap_err();
            assert!(matches!(err, RegistryError::DuplicateService { ref name } if name == "svc"));
            assert_eq!(catalog.len(), 1);
        }
    }

    #[test]
    fn size_counts_successful_registrations_only() {
        let mut catalog = ServiceCatalog::new();
        let attempts = [
            catalog.register_local("a", local()).is_ok(),
            catalog.register_remote("b", remote()).is_ok(),
            catalog.register_remote("a", remote()).is_ok(),
            catalog.register_local("c", local()).is_ok(),
            catalog.register_local("b", local()).is_ok(),
        ];
        let succeeded = attempts.iter().filter(|ok| **ok).count();
        assert_eq!(succeeded, 3);
        assert_eq!(catalog.len(), succeeded);
    }

    #[test]
    fn remote_services_are_created_first() {
        let mut catalog = ServiceCatalog::new();
        catalog.register_local("l1", local()).unwrap();
        catalog.register_remote("r1", remote()).unwrap();
        catalog.register_local("l2", local()).unwrap();
        catalog.register_remote("r2", remote()).unwrap();

        assert_eq!(catalog.names(), vec!["r1", "r2", "l1", "l2"]);
        assert_eq!(catalog.origin("r2"), Some(Origin::Remote));
        assert_eq!(catalog.origin("l1"), Some(Origin::Local));
        assert!(catalog.has_remote());
    }

    #[test]
    fn registry_errors_map_to_wire_codes() {
        assert_eq!(RegistryError::AgentExists.api_error().code, codes::EXISTS);
        assert_eq!(
            RegistryError::DuplicateService { name: "x".into() }
                .api_error()
                .code,
            codes::EXISTS
        );
        assert_eq!(RegistryError::Sealed.api_error().code, codes::INTERNAL);
    }
}
