//! Endpoint lifecycle.
//!
//! ```text
//! Initializing ──► Synchronizing ──► Running ──► Disconnected ──► Shutdown
//!                  synchronize()     handshake    timeout or       shutdown
//!                                    complete     peer request     delay
//! ```
//!
//! While running, silence longer than the notify threshold marks the endpoint
//! interrupted without leaving `Running`; any packet clears the mark.

#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub(crate) enum ProtocolState {
    Initializing,
    Synchronizing,
    Running,
    Disconnected,
    Shutdown,
}

impl ProtocolState {
    pub(crate) const fn as_str(self) -> &'static str {
        match self {
            Self::Initializing => "Initializing",
            Self::Synchronizing => "Synchronizing",
            Self::Running => "Running",
            Self::Disconnected => "Disconnected",
            Self::Shutdown => "Shutdown",
        }
    }
}

impl std::fmt::Display for ProtocolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
