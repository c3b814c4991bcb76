// src/exec/trigger.rs

//! Kicking off discovery and test runs on an already running test server.

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;

use anyhow::Context;
use tracing::{debug, info};

use super::command::shell_command;
use super::output::spawn_line_logger;
use crate::engine::ServerStartInfo;
use crate::errors::{Result, RunbridgeError};

pub const RUN_MODE_ENV: &str = "RUNBRIDGE_RUN_MODE";
pub const GREP_ENV: &str = "RUNBRIDGE_GREP";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunMode {
    /// Report every test without running it.
    Discover,
    Execute,
}

impl fmt::Display for RunMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RunMode::Discover => f.write_str("discover"),
            RunMode::Execute => f.write_str("run"),
        }
    }
}

/// What the runner is asked to do.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunRequest {
    pub mode: RunMode,
    /// Full names of the requested tests/suites. Empty means all.
    pub tests: Vec<String>,
}

impl RunRequest {
    pub fn discovery() -> Self {
        Self {
            mode: RunMode::Discover,
            tests: Vec::new(),
        }
    }

    pub fn execute(tests: Vec<String>) -> Self {
        Self {
            mode: RunMode::Execute,
            tests,
        }
    }

    /// Anchored regex matching any requested full name as a prefix.
    ///
    /// Empty when everything should run.
    pub fn grep_pattern(&self) -> String {
        if self.mode == RunMode::Discover || self.tests.is_empty() {
            return String::new();
        }
        let alternatives: Vec<String> = self.tests.iter().map(|t| regex::escape(t)).collect();
        format!("^(?:{})", alternatives.join("|"))
    }
}

/// Trait abstracting how a run is triggered on the started server.
///
/// Resolves once the trigger has been delivered; results arrive separately
/// over the event channel.
pub trait RunTrigger: Send + Sync {
    fn trigger(
        &self,
        server: &ServerStartInfo,
        request: RunRequest,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>>;
}

/// Runs a configured shell command template to completion.
///
/// `{port}` is replaced by the primary port and `{grep}` by the
/// single-quoted grep pattern.
#[derive(Debug, Clone, Default)]
pub struct CommandRunTrigger {
    pub template: String,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    /// Accept a non-zero exit (runs with failing tests exit non-zero).
    pub allow_failure_exit: bool,
}

impl CommandRunTrigger {
    pub fn render(&self, server: &ServerStartInfo, request: &RunRequest) -> String {
        self.template
            .replace("{port}", &server.primary_port.to_string())
            .replace("{grep}", &shell_quote(&request.grep_pattern()))
    }

    async fn run(&self, server: ServerStartInfo, request: RunRequest) -> Result<()> {
        let line = self.render(&server, &request);
        info!(mode = %request.mode, cmd = %line, "triggering test runner");

        let mut cmd = shell_command(&line);
        if let Some(cwd) = &self.cwd {
            cmd.current_dir(cwd);
        }
        cmd.envs(&self.env)
            .env(RUN_MODE_ENV, request.mode.to_string())
            .env(GREP_ENV, request.grep_pattern())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let mut child = cmd
            .spawn()
            .with_context(|| format!("spawning run trigger '{line}'"))?;
        let pid = child.id().unwrap_or_default();
        if let Some(stdout) = child.stdout.take() {
            spawn_line_logger(stdout, "stdout", pid);
        }
        if let Some(stderr) = child.stderr.take() {
            spawn_line_logger(stderr, "stderr", pid);
        }

        let status = child
            .wait()
            .await
            .with_context(|| format!("waiting for run trigger '{line}'"))?;
        debug!(pid, exit_code = ?status.code(), "run trigger exited");

        if !status.success() && !self.allow_failure_exit {
            return Err(RunbridgeError::SessionFailed(format!(
                "run trigger exited with {}",
                status
                    .code()
                    .map_or_else(|| "a signal".to_string(), |c| format!("code {c}"))
            )));
        }
        Ok(())
    }
}

impl RunTrigger for CommandRunTrigger {
    fn trigger(
        &self,
        server: &ServerStartInfo,
        request: RunRequest,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        let server = server.clone();
        Box::pin(self.run(server, request))
    }
}

fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server() -> ServerStartInfo {
        ServerStartInfo {
            primary_port: 9876,
            event_port: 9877,
            debug_port: None,
        }
    }

    #[test]
    fn grep_is_empty_for_discovery_and_run_all() {
        assert_eq!(RunRequest::discovery().grep_pattern(), "");
        assert_eq!(RunRequest::execute(vec![]).grep_pattern(), "");
    }

    #[test]
    fn grep_escapes_and_anchors_names() {
        let req = RunRequest::execute(vec!["Calc adds (ints)".into(), "Parser".into()]);
        let pattern = req.grep_pattern();
        assert_eq!(pattern, r"^(?:Calc adds \(ints\)|Parser)");

        let re = regex::Regex::new(&pattern).unwrap();
        assert!(re.is_match("Calc adds (ints)"));
        assert!(re.is_match("Parser handles empty input"));
        assert!(!re.is_match("Other Parser"));
    }

    #[test]
    fn render_substitutes_placeholders() {
        let trigger = CommandRunTrigger {
            template: "karma run --port {port} -- --grep={grep}".into(),
            ..Default::default()
        };
        let line = trigger.render(&server(), &RunRequest::execute(vec!["it's".into()]));
        assert_eq!(line, r"karma run --port 9876 -- --grep='^(?:it'\''s)'");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn non_zero_exit_is_an_error_unless_allowed() {
        let mut trigger = CommandRunTrigger {
            template: "exit 1".into(),
            ..Default::default()
        };
        let err = trigger
            .trigger(&server(), RunRequest::discovery())
            .await
            .unwrap_err();
        assert!(matches!(err, RunbridgeError::SessionFailed(_)));

        trigger.allow_failure_exit = true;
        trigger
            .trigger(&server(), RunRequest::discovery())
            .await
            .unwrap();
    }
}
