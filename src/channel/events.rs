// src/channel/events.rs

use std::fmt;

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::Value;

/// Kinds of events the runner is known to send.
///
/// Anything else is kept as [`EventKind::Unrecognized`] so the dispatcher can
/// still route it to a fallback handler.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EventKind {
    /// The runner finished warming up and can execute tests.
    Ready,
    RunStart,
    /// One test finished; payload is a test result.
    SpecComplete,
    RunComplete,
    /// The runner reported an error for the current run.
    Error,
    /// The runner is going away on purpose.
    Shutdown,
    Unrecognized(String),
}

const EVENT_NAMES: &[(&str, EventKind)] = &[
    ("ready", EventKind::Ready),
    ("run_start", EventKind::RunStart),
    ("spec_complete", EventKind::SpecComplete),
    ("run_complete", EventKind::RunComplete),
    ("error", EventKind::Error),
    ("shutdown", EventKind::Shutdown),
];

impl EventKind {
    pub fn from_name(name: &str) -> Self {
        EVENT_NAMES
            .iter()
            .find(|(known, _)| *known == name)
            .map(|(_, kind)| kind.clone())
            .unwrap_or_else(|| EventKind::Unrecognized(name.to_string()))
    }

    pub fn name(&self) -> &str {
        match self {
            EventKind::Unrecognized(name) => name,
            known => EVENT_NAMES
                .iter()
                .find(|(_, kind)| kind == known)
                .map(|(name, _)| *name)
                .unwrap_or("unknown"),
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Deserialize)]
struct RawEvent {
    event: String,
    #[serde(default)]
    payload: Value,
}

/// A single decoded message from the runner.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelEvent {
    pub kind: EventKind,
    pub payload: Value,
}

impl ChannelEvent {
    pub fn new(kind: EventKind, payload: Value) -> Self {
        Self { kind, payload }
    }

    /// Decode one line of the wire protocol.
    pub fn decode(line: &str) -> Result<Self> {
        let raw: RawEvent = serde_json::from_str(line.trim())
            .with_context(|| format!("malformed event line: {}", truncate(line, 120)))?;
        Ok(Self {
            kind: EventKind::from_name(&raw.event),
            payload: raw.payload,
        })
    }

    /// Encode as one line of the wire protocol (without trailing newline).
    pub fn encode(&self) -> String {
        serde_json::json!({
            "event": self.kind.name(),
            "payload": self.payload,
        })
        .to_string()
    }

    /// Human-readable message carried by the event, if any.
    ///
    /// Accepts either a bare string payload or an object with a `message`
    /// field.
    pub fn message(&self) -> Option<String> {
        match &self.payload {
            Value::String(s) => Some(s.clone()),
            Value::Object(map) => map.get("message").and_then(Value::as_str).map(str::to_string),
            _ => None,
        }
    }
}

fn truncate(s: &str, max: usize) -> &str {
    match s.char_indices().nth(max) {
        Some((idx, _)) => &s[..idx],
        None => s,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn known_and_unknown_names() {
        assert_eq!(EventKind::from_name("spec_complete"), EventKind::SpecComplete);
        assert_eq!(
            EventKind::from_name("browser_log"),
            EventKind::Unrecognized("browser_log".into())
        );
        assert_eq!(EventKind::RunComplete.name(), "run_complete");
    }

    #[test]
    fn decode_defaults_missing_payload_to_null() {
        let ev = ChannelEvent::decode(r#"{"event":"ready"}"#).unwrap();
        assert_eq!(ev.kind, EventKind::Ready);
        assert!(ev.payload.is_null());
    }

    #[test]
    fn decode_rejects_garbage() {
        assert!(ChannelEvent::decode("not json").is_err());
        assert!(ChannelEvent::decode(r#"{"payload":1}"#).is_err());
    }

    #[test]
    fn message_from_string_or_object() {
        let ev = ChannelEvent::decode(r#"{"event":"error","payload":"boom"}"#).unwrap();
        assert_eq!(ev.message().as_deref(), Some("boom"));

        let ev = ChannelEvent::decode(r#"{"event":"error","payload":{"message":"bang"}}"#).unwrap();
        assert_eq!(ev.message().as_deref(), Some("bang"));
    }

    #[test]
    fn encode_uses_wire_names() {
        let ev = ChannelEvent::new(EventKind::Unrecognized("custom".into()), Value::Null);
        let decoded = ChannelEvent::decode(&ev.encode()).unwrap();
        assert_eq!(decoded, ev);
    }
}
