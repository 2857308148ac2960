mod agent;
mod dispatch;
mod errors;
mod global;
mod mesh;
mod phase;

pub use agent::RemoteAgent;
pub use dispatch::{InterceptLayer, InterceptService, serve};
pub use errors::MeshError;
pub use global::global;
pub use mesh::{Mesh, MeshBuilder};
pub use phase::Phase;
