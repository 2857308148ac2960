#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
//! TCP/gRPC transport for meshkit.
//!
//! [`TcpAgent`] implements [`meshkit::RemoteAgent`]: it serves call handlers on a
//! TCP listener and dials remote services over tonic channels, both configured
//! under `mesh.agent`.

pub mod agent;
pub mod client;

pub use agent::{AGENT_KEY, AgentConfig, RemoteServiceConfig, TcpAgent};
pub use client::GrpcClientConfig;
