// src/config/validate.rs

use std::time::Duration;

use crate::config::model::{
    ConfigFile, RawConfigFile, RawRunSection, RawServerSection, RunSettings, ServerSettings,
};
use crate::errors::{Result, RunbridgeError};

impl TryFrom<RawConfigFile> for ConfigFile {
    type Error = RunbridgeError;

    fn try_from(raw: RawConfigFile) -> std::result::Result<Self, Self::Error> {
        Ok(ConfigFile {
            server: validate_server(raw.server)?,
            run: validate_run(raw.run)?,
        })
    }
}

fn validate_server(raw: RawServerSection) -> Result<ServerSettings> {
    ensure_command("[server].command", &raw.command)?;
    ensure_distinct_ports(raw.port, raw.event_port)?;
    ensure_port_attempts(raw.port_attempts)?;
    let ready_timeout = duration_field("[server].ready_timeout", &raw.ready_timeout)?;

    Ok(ServerSettings {
        command: raw.command,
        cwd: raw.cwd,
        env: raw.env,
        host: raw.host,
        port: raw.port,
        event_port: raw.event_port,
        debug_port: raw.debug_port,
        ready_timeout,
        port_attempts: raw.port_attempts,
    })
}

fn validate_run(raw: RawRunSection) -> Result<RunSettings> {
    ensure_command("[run].trigger", &raw.trigger)?;
    let result_timeout = raw
        .result_timeout
        .as_deref()
        .map(|s| duration_field("[run].result_timeout", s))
        .transpose()?;

    let mut park = raw.park;
    park.sort();
    park.dedup();

    Ok(RunSettings {
        trigger: raw.trigger,
        result_timeout,
        allow_failure_exit: raw.allow_failure_exit,
        park,
    })
}

fn ensure_command(field: &str, value: &str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(RunbridgeError::ConfigError(format!("{field} must not be empty")));
    }
    Ok(())
}

fn ensure_distinct_ports(port: u16, event_port: u16) -> Result<()> {
    if port != 0 && port == event_port {
        return Err(RunbridgeError::ConfigError(format!(
            "[server].event_port must differ from [server].port (both are {port})"
        )));
    }
    Ok(())
}

fn ensure_port_attempts(attempts: u16) -> Result<()> {
    if attempts == 0 {
        return Err(RunbridgeError::ConfigError(
            "[server].port_attempts must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn duration_field(field: &str, value: &str) -> Result<Duration> {
    parse_duration(value).map_err(|e| RunbridgeError::ConfigError(format!("{field}: {e}")))
}

/// Parse strings like `"500ms"`, `"30s"`, `"2m"` or `"1h"`.
pub fn parse_duration(s: &str) -> std::result::Result<Duration, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty duration string".to_string());
    }

    let idx = s
        .chars()
        .position(|c| !c.is_ascii_digit())
        .ok_or_else(|| "duration missing unit suffix".to_string())?;

    let (num_part, unit_part) = s.split_at(idx);
    let value: u64 = num_part
        .parse()
        .map_err(|e| format!("invalid duration number '{num_part}': {e}"))?;

    let seconds = |factor: u64| {
        value
            .checked_mul(factor)
            .map(Duration::from_secs)
            .ok_or_else(|| format!("duration '{s}' is too large"))
    };

    match unit_part.trim().to_lowercase().as_str() {
        "ms" => Ok(Duration::from_millis(value)),
        "s" => Ok(Duration::from_secs(value)),
        "m" => seconds(60),
        "h" => seconds(60 * 60),
        unit => Err(format!(
            "unsupported duration unit '{unit}'; expected ms, s, m, or h"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_supported_units() {
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert_eq!(parse_duration(" 30s ").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("2m").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn rejects_malformed_durations() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("30").is_err());
        assert!(parse_duration("s").is_err());
        assert!(parse_duration("3d").is_err());
    }

    #[test]
    fn oversized_durations_are_errors() {
        let max = u64::MAX;
        let err = parse_duration(&format!("{max}h")).unwrap_err();
        assert!(err.contains("too large"), "{err}");
        assert!(parse_duration(&format!("{max}m")).is_err());
        assert_eq!(parse_duration(&format!("{max}s")).unwrap(), Duration::from_secs(max));
    }

    #[test]
    fn same_port_only_allowed_when_os_assigned() {
        assert!(ensure_distinct_ports(9876, 9876).is_err());
        assert!(ensure_distinct_ports(0, 0).is_ok());
        assert!(ensure_distinct_ports(9876, 0).is_ok());
    }
}
