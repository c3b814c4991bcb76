// src/exec/command.rs

//! Production launcher spawning the test runner through the platform shell.

use std::process::Stdio;

use anyhow::Context;
use tokio::process::{Child, Command};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use super::launcher::{ExitInfo, LaunchSpec, LaunchedProcess, ProcessLauncher};
use super::output::spawn_line_logger;
use crate::errors::{Result, RunbridgeError};
use crate::execution::{DeferredExecution, Failure};

/// Build a shell command appropriate for the platform.
pub fn shell_command(command_line: &str) -> Command {
    if cfg!(windows) {
        let mut c = Command::new("cmd");
        c.arg("/C").arg(command_line);
        c
    } else {
        let mut c = Command::new("sh");
        c.arg("-c").arg(command_line);
        c
    }
}

/// Spawns `LaunchSpec::command` with `sh -c` / `cmd /C`.
#[derive(Debug, Clone, Copy, Default)]
pub struct CommandLauncher;

impl ProcessLauncher for CommandLauncher {
    fn launch(&self, spec: LaunchSpec) -> Result<LaunchedProcess> {
        info!(cmd = %spec.command, cwd = ?spec.cwd, "launching test runner");

        let mut cmd = shell_command(&spec.command);
        if let Some(cwd) = &spec.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(&spec.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning test runner '{}'", spec.command))
            .map_err(|e| RunbridgeError::LaunchFailed(format!("{e:#}")))?;

        let pid = child.id().unwrap_or_default();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_logger(stdout, "stdout", pid);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_logger(stderr, "stderr", pid);
        }

        let deferred = DeferredExecution::new();
        deferred.start(pid);
        let execution = deferred.execution();

        let (cancel_tx, cancel_rx) = oneshot::channel();
        tokio::spawn(supervise(child, pid, deferred, cancel_rx));

        Ok(LaunchedProcess::new(execution, cancel_tx))
    }
}

/// Either the process exits on its own, or a stop is requested and we kill
/// it. Both settle the end phase.
async fn supervise(
    mut child: Child,
    pid: u32,
    deferred: DeferredExecution<u32, ExitInfo>,
    mut cancel_rx: oneshot::Receiver<()>,
) {
    tokio::select! {
        status = child.wait() => {
            match status {
                Ok(status) => {
                    info!(pid, exit_code = ?status.code(), success = status.success(), "test runner exited");
                    deferred.end(ExitInfo { code: status.code(), killed: false });
                }
                Err(e) => {
                    warn!(pid, error = %e, "waiting for test runner failed");
                    deferred.fail(Failure::error(format!("waiting for test runner: {e}")));
                }
            }
        }

        cancel = &mut cancel_rx => {
            if cancel.is_err() {
                debug!(pid, "process handle dropped; killing test runner");
            } else {
                info!(pid, "stop requested; killing test runner");
            }
            if let Err(e) = child.kill().await {
                warn!(pid, error = %e, "failed to kill test runner");
            }
            let code = child.try_wait().ok().flatten().and_then(|s| s.code());
            deferred.end(ExitInfo { code, killed: true });
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn process_exit_ends_execution() {
        let spec = LaunchSpec {
            command: "exit 3".into(),
            ..Default::default()
        };
        let process = CommandLauncher.launch(spec).unwrap();
        assert!(process.execution.started().await.is_ok());

        let exit = tokio::time::timeout(Duration::from_secs(5), process.execution.ended())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(exit, ExitInfo { code: Some(3), killed: false });
    }

    #[tokio::test]
    async fn stop_kills_a_long_running_process() {
        let spec = LaunchSpec {
            command: "sleep 30".into(),
            ..Default::default()
        };
        let mut process = CommandLauncher.launch(spec).unwrap();

        tokio::time::timeout(Duration::from_secs(5), process.stop())
            .await
            .unwrap();
        let exit = process.execution.ended().await.unwrap();
        assert!(exit.killed);

        // second stop is a no-op
        process.stop().await;
    }

    #[tokio::test]
    async fn env_reaches_the_child() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("port.txt");
        let mut spec = LaunchSpec {
            command: format!("echo $RUNBRIDGE_PORT > '{}'", out.display()),
            ..Default::default()
        };
        spec.env.insert("RUNBRIDGE_PORT".into(), "4242".into());

        let process = CommandLauncher.launch(spec).unwrap();
        process.execution.ended().await.unwrap();
        assert_eq!(std::fs::read_to_string(out).unwrap().trim(), "4242");
    }
}
