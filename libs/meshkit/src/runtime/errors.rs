use crate::catalog::RegistryError;
use crate::config::ConfigError;
use crate::container::ContainerError;
use crate::errors::ApiError;

/// Terminal error of [`crate::Mesh::start`], with phase and name context.
#[derive(Debug, thiserror::Error)]
pub enum MeshError {
    #[error("mesh already started")]
    AlreadyStarted,

    #[error("configuration error")]
    Config(#[from] ConfigError),

    #[error("no remote agent registered, required by '{service}'")]
    AgentMissing { service: String },

    #[error("remote agent failed to start")]
    AgentStart(#[source] anyhow::Error),

    #[error("connect to remote service '{service}' failed")]
    Connect {
        service: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("config for service '{service}' unavailable")]
    ServiceConfig {
        service: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("create service '{service}' failed")]
    Create {
        service: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("module '{module}' failed in {hook}")]
    Hook {
        module: String,
        hook: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("extension '{extension}' failed in {hook}")]
    Extension {
        extension: String,
        hook: &'static str,
        #[source]
        source: anyhow::Error,
    },

    #[error("bind failed")]
    Bind(#[source] ContainerError),

    #[error("start service '{service}' failed")]
    ServiceStart {
        service: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("remote agent failed to listen")]
    Listen(#[source] anyhow::Error),

    #[error("service '{service}' failed to register gRPC routes")]
    GrpcHandle {
        service: String,
        #[source]
        source: anyhow::Error,
    },

    #[error(transparent)]
    Registry(#[from] RegistryError),

    #[error(transparent)]
    Container(#[from] ContainerError),
}

impl MeshError {
    /// Wire representation of this error.
    ///
    /// An [`ApiError`] anywhere in the source chain is kept as is; otherwise the
    /// error is mapped to a `meshkit` code.
    #[must_use]
    pub fn api_error(&self) -> ApiError {
        let mut cause: Option<&(dyn std::error::Error + 'static)> = Some(self);
        while let Some(err) = cause {
            if let Some(api) = err.downcast_ref::<ApiError>() {
                return api.clone();
            }
            cause = err.source();
        }

        match self {
            MeshError::AgentMissing { .. } => ApiError::agent_missing(self.to_string()),
            MeshError::Registry(e) => e.api_error(),
            MeshError::Bind(e) | MeshError::Container(e) => container_api_error(e),
            _ => ApiError::internal(self.to_string()),
        }
    }
}

fn container_api_error(err: &ContainerError) -> ApiError {
    match err {
        ContainerError::DuplicateName { .. } => ApiError::exists(err.to_string()),
        ContainerError::NotFound { .. } | ContainerError::UnresolvedDependency { .. } => {
            ApiError::not_found(err.to_string())
        }
        ContainerError::TypeMismatch { .. } | ContainerError::Inject { .. } => {
            ApiError::internal(err.to_string())
        }
    }
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::errors::codes;

    #[test]
    fn agent_missing_maps_to_agent_code() {
        let err = MeshError::AgentMissing {
            service: "billing".into(),
        };
        assert_eq!(err.api_error().code, codes::AGENT);
        assert!(err.to_string().contains("billing"));
    }

    #[test]
    fn api_errors_in_the_source_chain_are_preserved() {
        let err = MeshError::Create {
            service: "billing".into(),
            source: anyhow::Error::new(ApiError::new(-9, "billing", "no quota")),
        };
        let api = err.api_error();
        assert_eq!(api.code, -9);
        assert_eq!(api.scope, "billing");
    }

    #[test]
    fn foreign_failures_are_internal() {
        let err = MeshError::Create {
            service: "billing".into(),
            source: anyhow::anyhow!("boom"),
        };
        let api = err.api_error();
        assert_eq!(api.code, codes::INTERNAL);
        assert!(api.message.contains("billing"));
    }

    #[test]
    fn unresolved_dependencies_map_to_not_found() {
        let err = MeshError::Bind(ContainerError::NotFound { name: "x".into() });
        assert_eq!(err.api_error().code, codes::NOT_FOUND);
    }
}
