//! gRPC client endpoint configuration.
//!
//! Builds tonic endpoints with connect and per-RPC timeouts plus HTTP/2
//! keepalive, and opens channels eagerly or lazily.

use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tracing::Instrument;

fn duration_to_u64_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Transport settings for one remote service.
#[derive(Debug, Clone)]
pub struct GrpcClientConfig {
    /// Timeout for establishing the connection.
    pub connect_timeout: Duration,

    /// Timeout for individual RPC calls.
    pub rpc_timeout: Duration,

    /// Open the connection on first use instead of at start.
    pub lazy: bool,

    /// Service name for tracing.
    pub service_name: String,
}

impl Default for GrpcClientConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            rpc_timeout: Duration::from_secs(30),
            lazy: true,
            service_name: "grpc_client".to_owned(),
        }
    }
}

impl GrpcClientConfig {
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Default::default()
        }
    }

    #[must_use]
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    #[must_use]
    pub fn with_rpc_timeout(mut self, timeout: Duration) -> Self {
        self.rpc_timeout = timeout;
        self
    }

    /// Connect during start rather than on first call.
    #[must_use]
    pub fn eager(mut self) -> Self {
        self.lazy = false;
        self
    }
}

/// Build a tonic `Endpoint` with timeouts and keepalive settings.
///
/// # Errors
/// Returns an error if `uri` is not a valid URI.
pub fn build_endpoint(
    uri: impl Into<String>,
    cfg: &GrpcClientConfig,
) -> Result<Endpoint, tonic::transport::Error> {
    let endpoint = Endpoint::from_shared(uri.into())?
        .connect_timeout(cfg.connect_timeout)
        .timeout(cfg.rpc_timeout)
        .tcp_keepalive(Some(Duration::from_secs(30)))
        .http2_keep_alive_interval(Duration::from_secs(30))
        .keep_alive_timeout(Duration::from_secs(10))
        .keep_alive_while_idle(true);

    Ok(endpoint)
}

/// Open a channel to `uri`.
///
/// Lazy configurations return immediately; eager ones wait for the connection.
///
/// # Errors
/// Returns an error if the URI is invalid or an eager connection fails.
pub async fn open_channel(uri: impl Into<String>, cfg: &GrpcClientConfig) -> anyhow::Result<Channel> {
    let uri = uri.into();
    let span = tracing::debug_span!(
        "grpc_connect",
        service = %cfg.service_name,
        uri = %uri,
        lazy = cfg.lazy
    );

    async move {
        let endpoint = build_endpoint(uri, cfg)?;
        let channel = if cfg.lazy {
            endpoint.connect_lazy()
        } else {
            endpoint.connect().await?
        };

        tracing::debug!(
            service_name = %cfg.service_name,
            connect_timeout_ms = duration_to_u64_ms(cfg.connect_timeout),
            rpc_timeout_ms = duration_to_u64_ms(cfg.rpc_timeout),
            "gRPC channel ready"
        );
        Ok(channel)
    }
    .instrument(span)
    .await
}
