use async_trait::async_trait;
use tokio::net::TcpListener;
use tonic::transport::Channel;

use crate::config::ConfigNode;

/// Transport collaborator used in the remote-capable configuration.
///
/// The runtime calls [`RemoteAgent::start`] once, before the create phase, then
/// [`RemoteAgent::connect`] for each remote service and
/// [`RemoteAgent::service_config`] for each local catalog service. If any
/// created service handles calls, [`RemoteAgent::listen`] provides the socket
/// the gRPC server is served on.
#[async_trait]
pub trait RemoteAgent: Send + Sync {
    /// Receives the whole resolved configuration tree.
    async fn start(&self, config: &ConfigNode) -> anyhow::Result<()>;

    /// Configuration node for the catalog service `name`.
    async fn service_config(&self, name: &str) -> anyhow::Result<ConfigNode>;

    async fn listen(&self) -> anyhow::Result<TcpListener>;

    /// Open a channel to the remote service `name`.
    async fn connect(&self, name: &str) -> anyhow::Result<Channel>;
}
