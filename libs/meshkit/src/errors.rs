//! Scoped API error codes shared by the mesh runtime and its call-dispatch boundary.
//!
//! Every error that crosses the process boundary is expressed as an [`ApiError`]:
//! a small negative code, the scope that owns it (`meshkit` for errors raised by
//! the runtime itself) and a human readable message.
//!
//! Errors raised by interceptors or handlers that are not already an [`ApiError`]
//! are reported as [`codes::UNKNOWN`] with the message `UNKNOWN`, so internal
//! details never leak to remote callers.
//!
//! Note: [`codes::EXISTS`] and [`codes::NOT_FOUND`] share the value `-3`. Both
//! historical error tables assigned it, and remote peers already depend on it.
//! Callers that need to tell the two apart must compare messages or use the typed
//! runtime errors instead of the wire code.

use std::borrow::Cow;

use tonic::metadata::{MetadataMap, MetadataValue};
use tonic::{Code, Status};

/// Scope of errors raised by the mesh runtime.
pub const SCOPE: &str = "meshkit";

/// Metadata key carrying the numeric error code on the wire.
pub const ERROR_CODE_METADATA_KEY: &str = "x-mesh-error-code";

/// Metadata key carrying the error scope on the wire.
pub const ERROR_SCOPE_METADATA_KEY: &str = "x-mesh-error-scope";

/// Numeric error codes of the `meshkit` scope.
pub mod codes {
    /// The internal error.
    pub const INTERNAL: i32 = -1;
    /// Agent implementation not found.
    pub const AGENT: i32 = -2;
    /// Target resource exists.
    pub const EXISTS: i32 = -3;
    /// Target resource not found. Shares its value with [`EXISTS`].
    pub const NOT_FOUND: i32 = -3;
    /// Fallback for errors that carry no code of their own.
    pub const UNKNOWN: i32 = -1;
}

/// Error with a scoped numeric code, translatable to and from `tonic::Status`.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("[{scope}:{code}] {message}")]
pub struct ApiError {
    pub code: i32,
    pub scope: Cow<'static, str>,
    pub message: String,
}

impl ApiError {
    /// Build an error in an arbitrary scope.
    pub fn new(code: i32, scope: impl Into<Cow<'static, str>>, message: impl Into<String>) -> Self {
        Self {
            code,
            scope: scope.into(),
            message: message.into(),
        }
    }

    #[must_use]
    pub fn internal(message: impl Into<String>) -> Self {
        Self::new(codes::INTERNAL, SCOPE, message)
    }

    #[must_use]
    pub fn agent_missing(message: impl Into<String>) -> Self {
        Self::new(codes::AGENT, SCOPE, message)
    }

    #[must_use]
    pub fn exists(message: impl Into<String>) -> Self {
        Self::new(codes::EXISTS, SCOPE, message)
    }

    #[must_use]
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(codes::NOT_FOUND, SCOPE, message)
    }

    /// The catch-all used for errors that are not `ApiError`s.
    #[must_use]
    pub fn unknown() -> Self {
        Self::new(codes::UNKNOWN, "", "UNKNOWN")
    }

    /// Classify an arbitrary error: keep it if it already is an `ApiError`
    /// (anywhere in its chain), otherwise fall back to [`ApiError::unknown`].
    #[must_use]
    pub fn classify(err: &anyhow::Error) -> Self {
        err.chain()
            .find_map(|cause| cause.downcast_ref::<ApiError>())
            .cloned()
            .unwrap_or_else(Self::unknown)
    }

    /// Encode into a gRPC status with code and scope in the metadata.
    #[must_use]
    pub fn to_status(&self) -> Status {
        let mut metadata = MetadataMap::new();
        if let Ok(code) = MetadataValue::try_from(self.code.to_string()) {
            metadata.insert(ERROR_CODE_METADATA_KEY, code);
        }
        if let Ok(scope) = MetadataValue::try_from(self.scope.as_ref()) {
            metadata.insert(ERROR_SCOPE_METADATA_KEY, scope);
        }
        Status::with_metadata(Code::Unknown, self.message.clone(), metadata)
    }

    /// Decode a gRPC status produced by [`ApiError::to_status`].
    ///
    /// Returns `None` when the status does not carry a mesh error code.
    #[must_use]
    pub fn from_status(status: &Status) -> Option<Self> {
        let metadata = status.metadata();
        let code = metadata
            .get(ERROR_CODE_METADATA_KEY)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<i32>().ok())?;
        let scope = metadata
            .get(ERROR_SCOPE_METADATA_KEY)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_owned();
        Some(Self::new(code, scope, status.message()))
    }
}

impl From<ApiError> for Status {
    fn from(err: ApiError) -> Self {
        err.to_status()
    }
}
