// tests/config_loading.rs

use std::io::Write;
use std::time::Duration;

use runbridge::config::{load_and_validate, load_from_path};
use runbridge::engine::ManagerConfig;
use runbridge::errors::RunbridgeError;
use runbridge::types::TestStatus;
use runbridge_test_utils::builders::ConfigFileBuilder;
use tempfile::NamedTempFile;

fn write_config(contents: &str) -> NamedTempFile {
    let mut file = NamedTempFile::new().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn full_config_is_loaded_and_validated() {
    let file = write_config(
        r#"
[server]
command = "npx karma start karma.conf.js"
cwd = "web"
port = 9100
event_port = 9101
debug_port = 9222
ready_timeout = "90s"

[server.env]
CHROME_BIN = "/usr/bin/chromium"

[run]
trigger = "npx karma run --port {port} -- --grep={grep}"
result_timeout = "500ms"
allow_failure_exit = false
park = ["skipped", "failed", "skipped"]
"#,
    );

    let cfg = load_and_validate(file.path()).unwrap();

    assert_eq!(cfg.server.port, 9100);
    assert_eq!(cfg.server.event_port, 9101);
    assert_eq!(cfg.server.debug_port, Some(9222));
    assert_eq!(cfg.server.ready_timeout, Duration::from_secs(90));
    assert_eq!(cfg.server.env["CHROME_BIN"], "/usr/bin/chromium");
    assert_eq!(cfg.run.result_timeout, Some(Duration::from_millis(500)));
    assert!(!cfg.run.allow_failure_exit);
    assert_eq!(cfg.run.park, vec![TestStatus::Failed, TestStatus::Skipped]);

    let manager = ManagerConfig::from_config(&cfg);
    assert_eq!(manager.launch.command, "npx karma start karma.conf.js");
    assert_eq!(manager.debug_port, Some(9222));
    assert_eq!(manager.port_attempts, 100);
}

#[test]
fn defaults_fill_optional_keys() {
    let file = write_config(
        r#"
[server]
command = "npx karma start"

[run]
trigger = "npx karma run"
"#,
    );

    let cfg = load_and_validate(file.path()).unwrap();
    assert_eq!(cfg.server.port, 9876);
    assert_eq!(cfg.server.event_port, 9877);
    assert_eq!(cfg.server.ready_timeout, Duration::from_secs(60));
    assert!(cfg.server.host.is_loopback());
    assert_eq!(cfg.run.result_timeout, None);
    assert!(cfg.run.allow_failure_exit);
    assert!(cfg.run.park.is_empty());
}

#[test]
fn unknown_keys_are_rejected() {
    let file = write_config(
        r#"
[server]
command = "npx karma start"
prot = 9000

[run]
trigger = "npx karma run"
"#,
    );

    let err = load_from_path(file.path()).unwrap_err();
    assert!(matches!(err, RunbridgeError::TomlError(_)), "got {err:?}");
}

#[test]
fn unknown_park_status_is_rejected() {
    let file = write_config(
        r#"
[server]
command = "npx karma start"

[run]
trigger = "npx karma run"
park = ["flaky"]
"#,
    );

    assert!(load_from_path(file.path()).is_err());
}

#[test]
fn missing_file_is_an_io_error() {
    let dir = tempfile::tempdir().unwrap();
    let err = load_and_validate(dir.path().join("Runbridge.toml")).unwrap_err();
    assert!(matches!(err, RunbridgeError::IoError(_)));
}

#[test]
fn validation_errors_name_the_field() {
    let cases = [
        (ConfigFileBuilder::new().command("  ").raw(), "[server].command"),
        (ConfigFileBuilder::new().ports(9000, 9000).raw(), "[server].event_port"),
        (ConfigFileBuilder::new().ready_timeout("soon").raw(), "[server].ready_timeout"),
        (ConfigFileBuilder::new().result_timeout("10 parsecs").raw(), "[run].result_timeout"),
    ];

    for (raw, field) in cases {
        let err = runbridge::config::ConfigFile::try_from(raw).unwrap_err();
        assert!(matches!(err, RunbridgeError::ConfigError(_)), "got {err:?}");
        assert!(err.to_string().contains(field), "{field}: {err}");
    }
}

#[test]
fn os_assigned_ports_may_coincide() {
    let cfg = ConfigFileBuilder::new().ports(0, 0).build();
    assert_eq!((cfg.server.port, cfg.server.event_port), (0, 0));
}
