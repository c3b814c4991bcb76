// src/cli.rs

//! CLI argument parsing using `clap`.

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};

use crate::config::default_config_path;

/// Command-line arguments for `runbridge`.
#[derive(Debug, Clone, Parser)]
#[command(
    name = "runbridge",
    version,
    about = "Drive a long-lived test runner: discover tests, run them, stream results.",
    long_about = None
)]
pub struct CliArgs {
    /// Path to the config file (TOML).
    ///
    /// Default: `Runbridge.toml` in the current working directory.
    #[arg(long, value_name = "PATH", default_value_os_t = default_config_path())]
    pub config: PathBuf,

    /// Logging level (error, warn, info, debug, trace).
    ///
    /// If omitted, `RUNBRIDGE_LOG` or a default level will be used.
    #[arg(long, value_enum, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevel>,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Start the runner, list every test it knows about, then stop it.
    Discover,
    /// Run tests whose full name starts with one of NAMES (all if none).
    Run {
        #[arg(value_name = "NAMES")]
        names: Vec<String>,
    },
    /// Start the runner and keep it up until Ctrl-C.
    Serve,
}

/// Log level as exposed on the CLI.
#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
pub enum LogLevel {
    Error,
    Warn,
    Info,
    Debug,
    Trace,
}

/// Convenience wrapper around `CliArgs::parse()`.
pub fn parse() -> CliArgs {
    CliArgs::parse()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn run_collects_names() {
        let args = CliArgs::try_parse_from([
            "runbridge",
            "--log-level",
            "debug",
            "run",
            "Calc adds",
            "Parser",
        ])
        .unwrap();

        assert_eq!(args.log_level, Some(LogLevel::Debug));
        assert_eq!(args.config, PathBuf::from("Runbridge.toml"));
        match args.command {
            Command::Run { names } => assert_eq!(names, vec!["Calc adds", "Parser"]),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn subcommand_is_required() {
        assert!(CliArgs::try_parse_from(["runbridge"]).is_err());
    }
}
