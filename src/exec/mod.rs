// src/exec/mod.rs

//! Process execution layer.
//!
//! This module is responsible for actually running the test runner and the
//! run-trigger commands, using `tokio::process::Command`.
//!
//! - [`launcher`] provides the `ProcessLauncher` trait the orchestrator talks
//!   to, plus the `LaunchSpec` / `LaunchedProcess` types.
//! - [`command`] is the production launcher spawning a shell command.
//! - [`trigger`] provides the `RunTrigger` trait and a shell-command
//!   implementation used to kick off discovery and test runs.
//! - [`output`] drains child stdout/stderr into the log.
//!
//! Tests swap in fakes for both traits instead of spawning processes.

pub mod command;
pub mod launcher;
pub mod output;
pub mod trigger;

pub use command::CommandLauncher;
pub use launcher::{ExitInfo, LaunchSpec, LaunchedProcess, ProcessLauncher};
pub use trigger::{CommandRunTrigger, RunMode, RunRequest, RunTrigger};
