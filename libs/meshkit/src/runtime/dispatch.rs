//! gRPC call-dispatch surface.
//!
//! One `tonic::Server` per process serves the routes of every call handler,
//! wrapped by [`InterceptLayer`] so each inbound call passes through the
//! extension interceptor chain.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use http::{Request, Response};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;
use tokio_util::sync::CancellationToken;
use tonic::body::Body;
use tonic::metadata::MetadataMap;
use tonic::service::Routes;
use tonic::transport::Server;
use tower::{Layer, Service};

use crate::errors::ApiError;
use crate::interceptor::{CallContext, InterceptorChain};

const GRPC_STATUS_HEADER: &str = "grpc-status";

/// Tower layer running the interceptor chain around every call.
#[derive(Clone, Default)]
pub struct InterceptLayer {
    chain: InterceptorChain,
}

impl InterceptLayer {
    #[must_use]
    pub fn new(chain: InterceptorChain) -> Self {
        Self { chain }
    }
}

impl<S> Layer<S> for InterceptLayer {
    type Service = InterceptService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InterceptService {
            inner,
            chain: self.chain.clone(),
        }
    }
}

/// Created by [`InterceptLayer`].
#[derive(Clone)]
pub struct InterceptService<S> {
    inner: S,
    chain: InterceptorChain,
}

impl<S> Service<Request<Body>> for InterceptService<S>
where
    S: Service<Request<Body>, Response = Response<Body>> + Clone + Send + 'static,
    S::Future: Send,
{
    type Response = Response<Body>;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Body>, S::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx)
    }

    fn call(&mut self, req: Request<Body>) -> Self::Future {
        // Clone-swap pattern (Tower Service contract).
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let chain = self.chain.clone();

        if chain.is_empty() {
            return Box::pin(inner.call(req));
        }

        Box::pin(async move {
            let (mut parts, body) = req.into_parts();
            let ctx = CallContext::new(parts.uri.path())
                .with_metadata(MetadataMap::from_headers(parts.headers.clone()))
                .with_extensions(std::mem::take(&mut parts.extensions));

            let ctx = match chain.before(ctx).await {
                Ok(ctx) => ctx,
                Err(err) => return Ok(reject(&err)),
            };

            parts.headers = ctx.metadata.clone().into_headers();
            parts.extensions = ctx.extensions.clone();

            let response = inner.call(Request::from_parts(parts, body)).await?;
            if !succeeded(&response) {
                return Ok(response);
            }

            match chain.after(&ctx).await {
                Ok(()) => Ok(response),
                Err(err) => Ok(reject(&err)),
            }
        })
    }
}

/// Whether the handler finished without a gRPC error.
///
/// Failed unary calls are answered trailers-only, so `grpc-status` shows up in
/// the headers; successful calls carry it in the trailers.
fn succeeded<B>(response: &Response<B>) -> bool {
    response
        .headers()
        .get(GRPC_STATUS_HEADER)
        .is_none_or(|status| status.as_bytes() == b"0")
}

fn reject(err: &ApiError) -> Response<Body> {
    err.to_status().into_http::<()>().map(|()| Body::empty())
}

/// Serve `routes` on `listener` until `cancel` fires.
///
/// # Errors
/// Returns an error if the server fails.
pub async fn serve(
    listener: TcpListener,
    routes: Routes,
    chain: InterceptorChain,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, interceptors = chain.len(), "gRPC dispatch listening");

    let incoming = TcpListenerStream::new(listener);
    Server::builder()
        .layer(InterceptLayer::new(chain))
        .add_routes(routes)
        .serve_with_incoming_shutdown(incoming, async move {
            cancel.cancelled().await;
        })
        .await?;

    tracing::info!(%local_addr, "gRPC dispatch stopped");
    Ok(())
}

#[cfg(test)]
#[cfg_attr(coverage_nightly, coverage(off))]
mod tests {
    use super::*;
    use crate::errors::{ERROR_CODE_METADATA_KEY, codes};
    use crate::extension::Extension;
    use crate::interceptor::CallInterceptor;
    use async_trait::async_trait;
    use std::convert::Infallible;
    use std::sync::Arc;
    use tower::ServiceExt;

    #[derive(Clone)]
    struct Echo;

    impl Service<Request<Body>> for Echo {
        type Response = Response<Body>;
        type Error = Infallible;
        type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

        fn poll_ready(&mut self, _: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, req: Request<Body>) -> Self::Future {
            let tenant = req.headers().get("x-tenant").cloned();
            Box::pin(async move {
                let mut response = Response::new(Body::empty());
                if let Some(tenant) = tenant {
                    response.headers_mut().insert("x-tenant", tenant);
                }
                Ok(response)
            })
        }
    }

    struct Gate {
        allow: bool,
    }

    impl Extension for Gate {
        fn name(&self) -> &'static str {
            "gate"
        }
        fn as_interceptor(&self) -> Option<&dyn CallInterceptor> {
            Some(self)
        }
    }

    #[async_trait]
    impl CallInterceptor for Gate {
        async fn before_call(&self, mut ctx: CallContext) -> anyhow::Result<CallContext> {
            if !self.allow {
                return Err(ApiError::not_found("denied").into());
            }
            ctx.metadata.insert("x-tenant", "acme".parse()?);
            Ok(ctx)
        }
    }

    fn layered(allow: bool) -> InterceptService<Echo> {
        let chain = InterceptorChain::new([Arc::new(Gate { allow }) as Arc<dyn Extension>]);
        InterceptLayer::new(chain).layer(Echo)
    }

    fn request() -> Request<Body> {
        Request::builder()
            .uri("/greeter.Greeter/SayHello")
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn rewritten_metadata_reaches_the_handler() {
        let response = layered(true).oneshot(request()).await.unwrap();
        assert_eq!(response.headers().get("x-tenant").unwrap(), "acme");
        assert!(succeeded(&response));
    }

    #[tokio::test]
    async fn rejection_becomes_a_grpc_status() {
        let response = layered(false).oneshot(request()).await.unwrap();

        assert!(!succeeded(&response));
        assert_eq!(
            response
                .headers()
                .get(ERROR_CODE_METADATA_KEY)
                .unwrap()
                .to_str()
                .unwrap(),
            codes::NOT_FOUND.to_string()
        );
        assert!(response.headers().get("x-tenant").is_none());
    }

    #[tokio::test]
    async fn empty_chain_passes_through() {
        let svc = InterceptLayer::default().layer(Echo);
        let response = svc.oneshot(request()).await.unwrap();
        assert!(succeeded(&response));
    }

    #[test]
    fn grpc_status_zero_is_success() {
        let mut response = Response::new(());
        assert!(succeeded(&response));
        response
            .headers_mut()
            .insert(GRPC_STATUS_HEADER, http::HeaderValue::from_static("0"));
        assert!(succeeded(&response));
        response
            .headers_mut()
            .insert(GRPC_STATUS_HEADER, http::HeaderValue::from_static("5"));
        assert!(!succeeded(&response));
    }
}
