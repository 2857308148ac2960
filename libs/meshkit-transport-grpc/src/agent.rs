//! TCP remote agent.
//!
//! Reads its settings from `mesh.agent`:
//!
//! ```yaml
//! mesh:
//!   agent:
//!     listen_addr: "127.0.0.1:50051"   # "127.0.0.1:0" for an ephemeral port
//!     services:
//!       billing:
//!         endpoint: "http://10.0.0.7:50051"
//!         connect_timeout_ms: 10000
//!         rpc_timeout_ms: 30000
//!         lazy: true
//! ```
//!
//! Local catalog services are configured from `mesh.services.<name>`.

use anyhow::Context;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Deserialize;
use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::net::TcpListener;
use tonic::transport::Channel;

use meshkit::config::{ConfigNode, ROOT_KEY};
use meshkit::RemoteAgent;

use crate::client::{GrpcClientConfig, open_channel};

/// Key of the agent section under the mesh root.
pub const AGENT_KEY: &str = "agent";

const DEFAULT_LISTEN_ADDR: SocketAddr =
    SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 50_051));

/// Settings for dialing one remote service.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct RemoteServiceConfig {
    pub endpoint: String,
    pub connect_timeout_ms: u64,
    pub rpc_timeout_ms: u64,
    pub lazy: bool,
}

impl Default for RemoteServiceConfig {
    fn default() -> Self {
        let defaults = GrpcClientConfig::default();
        Self {
            endpoint: String::new(),
            connect_timeout_ms: u64::try_from(defaults.connect_timeout.as_millis())
                .unwrap_or(u64::MAX),
            rpc_timeout_ms: u64::try_from(defaults.rpc_timeout.as_millis()).unwrap_or(u64::MAX),
            lazy: defaults.lazy,
        }
    }
}

impl RemoteServiceConfig {
    fn client_config(&self, name: &str) -> GrpcClientConfig {
        let cfg = GrpcClientConfig::new(name)
            .with_connect_timeout(Duration::from_millis(self.connect_timeout_ms))
            .with_rpc_timeout(Duration::from_millis(self.rpc_timeout_ms));
        if self.lazy { cfg } else { cfg.eager() }
    }
}

/// The `mesh.agent` section.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    pub listen_addr: String,
    pub services: HashMap<String, RemoteServiceConfig>,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            services: HashMap::new(),
        }
    }
}

struct Started {
    root: ConfigNode,
    listen_addr: SocketAddr,
    services: HashMap<String, RemoteServiceConfig>,
}

/// [`RemoteAgent`] over plain TCP and tonic channels.
#[derive(Default)]
pub struct TcpAgent {
    state: RwLock<Option<Started>>,
    bound: RwLock<Option<SocketAddr>>,
}

impl TcpAgent {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Address the listener was bound to, once [`RemoteAgent::listen`] ran.
    #[must_use]
    pub fn bound_addr(&self) -> Option<SocketAddr> {
        *self.bound.read()
    }

    fn with_state<T>(&self, f: impl FnOnce(&Started) -> anyhow::Result<T>) -> anyhow::Result<T> {
        let state = self.state.read();
        let started = state
            .as_ref()
            .ok_or_else(|| anyhow::anyhow!("remote agent not started"))?;
        f(started)
    }
}

#[async_trait]
impl RemoteAgent for TcpAgent {
    async fn start(&self, config: &ConfigNode) -> anyhow::Result<()> {
        let agent_cfg: AgentConfig = config
            .sub_config(&[ROOT_KEY, AGENT_KEY])?
            .extract_or_default()?;

        let listen_addr = agent_cfg
            .listen_addr
            .parse::<SocketAddr>()
            .with_context(|| format!("invalid listen_addr '{}'", agent_cfg.listen_addr))?;

        if let Some((name, _)) = agent_cfg
            .services
            .iter()
            .find(|(_, svc)| svc.endpoint.is_empty())
        {
            anyhow::bail!("remote service '{name}' has no endpoint");
        }

        tracing::info!(
            %listen_addr,
            remotes = agent_cfg.services.len(),
            "remote agent started"
        );

        *self.state.write() = Some(Started {
            root: config.clone(),
            listen_addr,
            services: agent_cfg.services,
        });
        Ok(())
    }

    async fn service_config(&self, name: &str) -> anyhow::Result<ConfigNode> {
        self.with_state(|s| Ok(s.root.sub_config(&[ROOT_KEY, "services", name])?))
    }

    async fn listen(&self) -> anyhow::Result<TcpListener> {
        let addr = self.with_state(|s| Ok(s.listen_addr))?;
        let listener = TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;
        let bound_addr = listener.local_addr()?;
        *self.bound.write() = Some(bound_addr);

        tracing::info!(%bound_addr, transport = "tcp", "remote agent listening");
        Ok(listener)
    }

    async fn connect(&self, name: &str) -> anyhow::Result<Channel> {
        let (endpoint, cfg) = self.with_state(|s| {
            let remote = s
                .services
                .get(name)
                .with_context(|| format!("no endpoint configured for remote service '{name}'"))?;
            Ok((remote.endpoint.clone(), remote.client_config(name)))
        })?;

        open_channel(endpoint, &cfg).await
    }
}
