// src/exec/launcher.rs

//! Pluggable process launcher abstraction.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use tokio::sync::oneshot;
use tracing::debug;

use crate::engine::ServerStartInfo;
use crate::errors::Result;
use crate::execution::Execution;

pub const PORT_ENV: &str = "RUNBRIDGE_PORT";
pub const EVENT_PORT_ENV: &str = "RUNBRIDGE_EVENT_PORT";
pub const DEBUG_PORT_ENV: &str = "RUNBRIDGE_DEBUG_PORT";

/// What to launch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LaunchSpec {
    /// Shell command line.
    pub command: String,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
}

impl LaunchSpec {
    /// Copy of this spec with the assigned ports exported to the child.
    pub fn with_ports(&self, ports: &ServerStartInfo) -> Self {
        let mut spec = self.clone();
        spec.env.insert(PORT_ENV.to_string(), ports.primary_port.to_string());
        spec.env.insert(EVENT_PORT_ENV.to_string(), ports.event_port.to_string());
        if let Some(debug_port) = ports.debug_port {
            spec.env.insert(DEBUG_PORT_ENV.to_string(), debug_port.to_string());
        }
        spec
    }

    pub fn env_port(&self, key: &str) -> Option<u16> {
        self.env.get(key).and_then(|v| v.parse().ok())
    }
}

/// How a launched process went away.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// `None` when terminated by a signal.
    pub code: Option<i32>,
    /// True when we killed it.
    pub killed: bool,
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.killed, self.code) {
            (true, _) => f.write_str("killed"),
            (false, Some(code)) => write!(f, "exit code {code}"),
            (false, None) => f.write_str("terminated by signal"),
        }
    }
}

/// Handle to a running process.
///
/// The execution starts with the PID once the process is up and ends with
/// its [`ExitInfo`].
#[derive(Debug)]
pub struct LaunchedProcess {
    pub execution: Execution<u32, ExitInfo>,
    cancel: Option<oneshot::Sender<()>>,
}

impl LaunchedProcess {
    pub fn new(execution: Execution<u32, ExitInfo>, cancel: oneshot::Sender<()>) -> Self {
        Self {
            execution,
            cancel: Some(cancel),
        }
    }

    /// Ask the process to die and wait until its execution settles.
    ///
    /// Safe to call more than once.
    pub async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            if cancel.send(()).is_err() {
                debug!("process already finished while stopping");
            }
        }
        self.execution.done().await;
    }
}

/// Trait abstracting how the test-runner process is started.
///
/// Production code uses [`CommandLauncher`](super::CommandLauncher); tests
/// provide their own implementation that doesn't spawn real processes.
pub trait ProcessLauncher: Send + Sync {
    fn launch(&self, spec: LaunchSpec) -> Result<LaunchedProcess>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ports_are_exported_to_the_environment() {
        let spec = LaunchSpec {
            command: "karma start".into(),
            ..Default::default()
        };
        let ports = ServerStartInfo {
            primary_port: 9876,
            event_port: 9877,
            debug_port: None,
        };

        let spec = spec.with_ports(&ports);
        assert_eq!(spec.env_port(PORT_ENV), Some(9876));
        assert_eq!(spec.env_port(EVENT_PORT_ENV), Some(9877));
        assert!(!spec.env.contains_key(DEBUG_PORT_ENV));
    }

    #[test]
    fn exit_info_display() {
        let exit = ExitInfo { code: Some(3), killed: false };
        assert_eq!(exit.to_string(), "exit code 3");
        let exit = ExitInfo { code: None, killed: true };
        assert_eq!(exit.to_string(), "killed");
    }
}
