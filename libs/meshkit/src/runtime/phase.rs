use std::fmt;

/// Lifecycle phase of a [`crate::Mesh`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    ConfigResolve,
    RemoteAgentStart,
    Create,
    Bind,
    Setup,
    Start,
    /// Steady state: container lookups are live.
    Ready,
    /// Start returned an error. Terminal.
    Failed,
}

impl Phase {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Phase::Idle => "idle",
            Phase::ConfigResolve => "config_resolve",
            Phase::RemoteAgentStart => "remote_agent_start",
            Phase::Create => "create",
            Phase::Bind => "bind",
            Phase::Setup => "setup",
            Phase::Start => "start",
            Phase::Ready => "ready",
            Phase::Failed => "failed",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
