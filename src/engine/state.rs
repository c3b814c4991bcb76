// src/engine/state.rs

use std::fmt;

/// Lifecycle of the test server as seen by the orchestrator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ServerPhase {
    #[default]
    Stopped,
    Starting,
    Running,
    Stopping,
}

impl fmt::Display for ServerPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ServerPhase::Stopped => "stopped",
            ServerPhase::Starting => "starting",
            ServerPhase::Running => "running",
            ServerPhase::Stopping => "stopping",
        };
        f.write_str(s)
    }
}

/// Ports a started test server listens on.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct ServerStartInfo {
    pub primary_port: u16,
    pub event_port: u16,
    pub debug_port: Option<u16>,
}
