#![allow(dead_code)]

use std::collections::BTreeMap;
use std::net::{IpAddr, Ipv4Addr};
use std::time::Duration;

use runbridge::config::model::{RawRunSection, RawServerSection};
use runbridge::config::{ConfigFile, RawConfigFile};
use runbridge::engine::ManagerConfig;
use runbridge::exec::LaunchSpec;
use runbridge::session::TestResult;
use runbridge::session::results::full_name_of;
use runbridge::types::TestStatus;

/// Builder for `TestResult`.
pub struct ResultBuilder {
    result: TestResult,
}

impl ResultBuilder {
    pub fn new(id: &str, suite: &[&str], description: &str) -> Self {
        let suite: Vec<String> = suite.iter().map(|s| s.to_string()).collect();
        Self {
            result: TestResult {
                id: id.to_string(),
                description: description.to_string(),
                full_name: full_name_of(&suite, description),
                suite,
                status: TestStatus::Passed,
                time_ms: 5,
                failure_messages: Vec::new(),
            },
        }
    }

    pub fn status(mut self, status: TestStatus) -> Self {
        self.result.status = status;
        self
    }

    pub fn failed(mut self, message: &str) -> Self {
        self.result.status = TestStatus::Failed;
        self.result.failure_messages.push(message.to_string());
        self
    }

    pub fn skipped(self) -> Self {
        self.status(TestStatus::Skipped)
    }

    pub fn time_ms(mut self, ms: u64) -> Self {
        self.result.time_ms = ms;
        self
    }

    pub fn build(self) -> TestResult {
        self.result
    }
}

/// Shorthand for a passing result.
pub fn passed(id: &str, suite: &[&str], description: &str) -> TestResult {
    ResultBuilder::new(id, suite, description).build()
}

/// Manager settings bound to localhost with OS-assigned ports and short
/// timeouts.
pub fn manager_config() -> ManagerConfig {
    ManagerConfig {
        launch: LaunchSpec {
            command: "fake-runner".to_string(),
            ..Default::default()
        },
        host: IpAddr::V4(Ipv4Addr::LOCALHOST),
        port: 0,
        event_port: 0,
        debug_port: None,
        port_attempts: 20,
        ready_timeout: Duration::from_secs(2),
        result_timeout: Some(Duration::from_secs(2)),
        park: Vec::new(),
    }
}

/// Builder for `ConfigFile` going through the same validation as files.
pub struct ConfigFileBuilder {
    config: RawConfigFile,
}

impl ConfigFileBuilder {
    pub fn new() -> Self {
        Self {
            config: RawConfigFile {
                server: RawServerSection {
                    command: "npx karma start".to_string(),
                    cwd: None,
                    env: BTreeMap::new(),
                    host: IpAddr::V4(Ipv4Addr::LOCALHOST),
                    port: 9876,
                    event_port: 9877,
                    debug_port: None,
                    ready_timeout: "60s".to_string(),
                    port_attempts: 100,
                },
                run: RawRunSection {
                    trigger: "npx karma run --port {port} -- --grep={grep}".to_string(),
                    result_timeout: None,
                    allow_failure_exit: true,
                    park: Vec::new(),
                },
            },
        }
    }

    pub fn command(mut self, command: &str) -> Self {
        self.config.server.command = command.to_string();
        self
    }

    pub fn ports(mut self, port: u16, event_port: u16) -> Self {
        self.config.server.port = port;
        self.config.server.event_port = event_port;
        self
    }

    pub fn ready_timeout(mut self, value: &str) -> Self {
        self.config.server.ready_timeout = value.to_string();
        self
    }

    pub fn result_timeout(mut self, value: &str) -> Self {
        self.config.run.result_timeout = Some(value.to_string());
        self
    }

    pub fn park(mut self, status: TestStatus) -> Self {
        self.config.run.park.push(status);
        self
    }

    pub fn raw(self) -> RawConfigFile {
        self.config
    }

    pub fn build(self) -> ConfigFile {
        ConfigFile::try_from(self.config).expect("Failed to build valid config from builder")
    }
}

impl Default for ConfigFileBuilder {
    fn default() -> Self {
        Self::new()
    }
}
