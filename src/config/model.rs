// src/config/model.rs

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;

use crate::types::TestStatus;

/// Configuration exactly as read from `Runbridge.toml`.
///
/// ```toml
/// [server]
/// command = "npx karma start karma.conf.js"
/// port = 9876
/// event_port = 9877
/// ready_timeout = "60s"
///
/// [run]
/// trigger = "npx karma run --port {port} -- --grep={grep}"
/// result_timeout = "30s"
/// park = ["skipped"]
/// ```
///
/// Durations are still strings here; [`ConfigFile`] is the validated form.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawConfigFile {
    pub server: RawServerSection,
    pub run: RawRunSection,
}

/// `[server]` section: how to launch the test runner.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawServerSection {
    pub command: String,
    #[serde(default)]
    pub cwd: Option<PathBuf>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default = "default_host")]
    pub host: IpAddr,
    /// Preferred primary port; `0` lets the OS choose.
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_event_port")]
    pub event_port: u16,
    #[serde(default)]
    pub debug_port: Option<u16>,
    #[serde(default = "default_ready_timeout")]
    pub ready_timeout: String,
    #[serde(default = "default_port_attempts")]
    pub port_attempts: u16,
}

/// `[run]` section: how to trigger discovery and runs.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RawRunSection {
    /// Shell command template; `{port}` and `{grep}` are substituted.
    pub trigger: String,
    #[serde(default)]
    pub result_timeout: Option<String>,
    #[serde(default = "default_allow_failure_exit")]
    pub allow_failure_exit: bool,
    /// Statuses held back during a run and reported once it finishes.
    #[serde(default)]
    pub park: Vec<TestStatus>,
}

fn default_host() -> IpAddr {
    IpAddr::V4(Ipv4Addr::LOCALHOST)
}

fn default_port() -> u16 {
    9876
}

fn default_event_port() -> u16 {
    9877
}

fn default_ready_timeout() -> String {
    "60s".to_string()
}

fn default_port_attempts() -> u16 {
    100
}

fn default_allow_failure_exit() -> bool {
    true
}

/// Validated configuration used by the rest of the crate.
///
/// Built through `TryFrom<RawConfigFile>` (see `validate.rs`).
#[derive(Debug, Clone)]
pub struct ConfigFile {
    pub server: ServerSettings,
    pub run: RunSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub command: String,
    pub cwd: Option<PathBuf>,
    pub env: BTreeMap<String, String>,
    pub host: IpAddr,
    pub port: u16,
    pub event_port: u16,
    pub debug_port: Option<u16>,
    pub ready_timeout: Duration,
    pub port_attempts: u16,
}

#[derive(Debug, Clone)]
pub struct RunSettings {
    pub trigger: String,
    pub result_timeout: Option<Duration>,
    pub allow_failure_exit: bool,
    pub park: Vec<TestStatus>,
}
