//! Call interception around inbound remote calls.
//!
//! For every call the chain runs each interceptor's `before_call` in extension
//! order; the first error short-circuits the call. The handler runs next, and
//! only if it succeeded every `after_call` runs, again in order. After-hook
//! errors do not stop the remaining hooks: each one is logged and the last one
//! is what the caller receives.

use async_trait::async_trait;
use std::future::Future;
use std::sync::Arc;
use tonic::metadata::MetadataMap;

use crate::errors::ApiError;
use crate::extension::Extension;

/// Per-call state visible to interceptors.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    method: String,
    /// Request metadata; changes made by before-hooks reach the handler.
    pub metadata: MetadataMap,
    /// Typed per-call values; written back into the request for the handler.
    pub extensions: http::Extensions,
}

impl CallContext {
    pub fn new(method: impl Into<String>) -> Self {
        Self {
            method: method.into(),
            metadata: MetadataMap::new(),
            extensions: http::Extensions::new(),
        }
    }

    #[must_use]
    pub fn with_metadata(mut self, metadata: MetadataMap) -> Self {
        self.metadata = metadata;
        self
    }

    #[must_use]
    pub fn with_extensions(mut self, extensions: http::Extensions) -> Self {
        self.extensions = extensions;
        self
    }

    /// Full gRPC method path, e.g. `/greeter.Greeter/SayHello`.
    #[must_use]
    pub fn method(&self) -> &str {
        &self.method
    }
}

/// Before/after hooks wrapped around every inbound call.
#[async_trait]
pub trait CallInterceptor: Send + Sync {
    /// Inspect or replace the call context. An error rejects the call.
    async fn before_call(&self, ctx: CallContext) -> anyhow::Result<CallContext> {
        Ok(ctx)
    }

    /// Runs after a successful handler.
    async fn after_call(&self, _ctx: &CallContext) -> anyhow::Result<()> {
        Ok(())
    }
}

/// Interceptor-capable extensions, in extension order.
#[derive(Clone, Default)]
pub struct InterceptorChain {
    interceptors: Arc<[Arc<dyn Extension>]>,
}

impl InterceptorChain {
    /// Keep the extensions that expose [`CallInterceptor`], preserving order.
    pub fn new(extensions: impl IntoIterator<Item = Arc<dyn Extension>>) -> Self {
        Self {
            interceptors: extensions
                .into_iter()
                .filter(|e| e.as_interceptor().is_some())
                .collect(),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.interceptors.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.interceptors.is_empty()
    }

    /// Run the before-hooks in order.
    ///
    /// # Errors
    /// The first failing hook's error, classified for the wire.
    pub async fn before(&self, mut ctx: CallContext) -> Result<CallContext, ApiError> {
        for ext in self.interceptors.iter() {
            let Some(interceptor) = ext.as_interceptor() else {
                continue;
            };
            ctx = interceptor.before_call(ctx).await.map_err(|e| {
                tracing::warn!(extension = ext.name(), error = %e, "call rejected");
                ApiError::classify(&e)
            })?;
        }
        Ok(ctx)
    }

    /// Run every after-hook in order.
    ///
    /// # Errors
    /// The last failing hook's error, classified for the wire.
    pub async fn after(&self, ctx: &CallContext) -> Result<(), ApiError> {
        let mut last_error = None;
        for ext in self.interceptors.iter() {
            let Some(interceptor) = ext.as_interceptor() else {
                continue;
            };
            if let Err(e) = interceptor.after_call(ctx).await {
                tracing::warn!(
                    extension = ext.name(),
                    method = ctx.method(),
                    error = %e,
                    "after-call hook failed"
                );
                last_error = Some(ApiError::classify(&e));
            }
        }
        last_error.map_or(Ok(()), Err)
    }

    /// Wrap `handler` with the full chain.
    ///
    /// # Errors
    /// A before-hook error (handler not called), the handler's own error
    /// (after-hooks not called), or the last after-hook error.
    pub async fn invoke<T, F, Fut>(&self, ctx: CallContext, handler: F) -> Result<T, ApiError>
    where
        F: FnOnce(CallContext) -> Fut,
        Fut: Future<Output = anyhow::Result<T>>,
    {
        let ctx = self.before(ctx).await?;
        let out = handler(ctx.clone())
            .await
            .map_err(|e| ApiError::classify(&e))?;
        self.after(&ctx).await?;
        Ok(out)
    }
}
