// src/channel/dispatch.rs

//! Event routing for the channel listener.
//!
//! Each [`EventKind`] maps to at most one handler. Events without a
//! registered handler (including every [`EventKind::Unrecognized`] name) fall
//! through to the default handler. Handler errors and panics are routed to
//! the error handler; they never take down the read loop.

use std::collections::HashMap;
use std::fmt;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::{Arc, LazyLock};

use anyhow::{Result, anyhow};
use regex::Regex;
use tracing::{debug, warn};

use super::events::{ChannelEvent, EventKind};
use crate::execution::Failure;

/// Why an established connection session ended normally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Every transport stream from the peer closed.
    PeerClosed,
    /// The peer announced it is shutting down.
    PeerShutdown,
    /// We stopped the listener.
    Stopped,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            DisconnectReason::PeerClosed => "peer closed the connection",
            DisconnectReason::PeerShutdown => "peer shut down",
            DisconnectReason::Stopped => "listener stopped",
        };
        f.write_str(s)
    }
}

/// Connection status change requested by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Started,
    Ended(DisconnectReason),
    Failed(Failure),
}

pub type EventHandler =
    Arc<dyn Fn(&ChannelEvent) -> Result<Option<ConnectionStatus>> + Send + Sync>;

/// Receives the name of the event being handled and the error it caused.
pub type ErrorHandler = Arc<dyn Fn(&str, &anyhow::Error) + Send + Sync>;

static ERROR_LIKE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error|exception|fail").expect("static pattern is valid"));

/// Whether an unexpected event name looks like an error report.
pub fn is_error_like(name: &str) -> bool {
    ERROR_LIKE.is_match(name)
}

/// Lookup table from event kind to handler.
pub struct HandlerTable {
    handlers: HashMap<EventKind, EventHandler>,
    default: EventHandler,
    on_error: ErrorHandler,
}

impl fmt::Debug for HandlerTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerTable")
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl Default for HandlerTable {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerTable {
    /// Empty table with the built-in fallback handlers.
    ///
    /// The default handler turns error-looking event names into handler
    /// errors (so they surface through the error handler) and ignores the
    /// rest. The default error handler logs at warn level.
    pub fn new() -> Self {
        Self {
            handlers: HashMap::new(),
            default: Arc::new(default_handler),
            on_error: Arc::new(|event, err| {
                warn!(event, error = %err, "event handler failed");
            }),
        }
    }

    pub fn on<F>(mut self, kind: EventKind, handler: F) -> Self
    where
        F: Fn(&ChannelEvent) -> Result<Option<ConnectionStatus>> + Send + Sync + 'static,
    {
        self.handlers.insert(kind, Arc::new(handler));
        self
    }

    pub fn on_unrecognized<F>(mut self, handler: F) -> Self
    where
        F: Fn(&ChannelEvent) -> Result<Option<ConnectionStatus>> + Send + Sync + 'static,
    {
        self.default = Arc::new(handler);
        self
    }

    pub fn on_handler_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&str, &anyhow::Error) + Send + Sync + 'static,
    {
        self.on_error = Arc::new(handler);
        self
    }

    /// Run the handler for `event` and return the connection status change
    /// it requested, if any.
    pub fn dispatch(&self, event: &ChannelEvent) -> Option<ConnectionStatus> {
        let handler = self.handlers.get(&event.kind).unwrap_or(&self.default);

        match catch_unwind(AssertUnwindSafe(|| handler(event))) {
            Ok(Ok(status)) => status,
            Ok(Err(err)) => {
                self.report_error(event.kind.name(), &err);
                None
            }
            Err(panic) => {
                let msg = panic
                    .downcast_ref::<&str>()
                    .map(|s| s.to_string())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "unknown panic".to_string());
                self.report_error(event.kind.name(), &anyhow!("handler panicked: {msg}"));
                None
            }
        }
    }

    pub fn report_error(&self, event: &str, err: &anyhow::Error) {
        let on_error = &self.on_error;
        if catch_unwind(AssertUnwindSafe(|| on_error(event, err))).is_err() {
            warn!(event, error = %err, "error handler panicked while reporting");
        }
    }
}

fn default_handler(event: &ChannelEvent) -> Result<Option<ConnectionStatus>> {
    let name = event.kind.name();
    if is_error_like(name) {
        let detail = event.message().unwrap_or_else(|| event.payload.to_string());
        return Err(anyhow!("runner sent unexpected '{name}' event: {detail}"));
    }
    debug!(event = name, "ignoring unhandled event");
    Ok(None)
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use serde_json::{Value, json};

    use super::*;

    fn event(name: &str, payload: Value) -> ChannelEvent {
        ChannelEvent::new(EventKind::from_name(name), payload)
    }

    fn recording_table() -> (HandlerTable, Arc<Mutex<Vec<String>>>) {
        let errors = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&errors);
        let table = HandlerTable::new().on_handler_error(move |event, err| {
            sink.lock().unwrap().push(format!("{event}: {err}"));
        });
        (table, errors)
    }

    #[test]
    fn registered_handler_status_is_returned() {
        let table = HandlerTable::new().on(EventKind::Ready, |_| Ok(Some(ConnectionStatus::Started)));
        assert_eq!(
            table.dispatch(&event("ready", Value::Null)),
            Some(ConnectionStatus::Started)
        );
        assert_eq!(table.dispatch(&event("run_start", Value::Null)), None);
    }

    #[test]
    fn error_like_unrecognized_events_are_surfaced() {
        let (table, errors) = recording_table();

        table.dispatch(&event("browser_error", json!("ReferenceError: x is not defined")));
        table.dispatch(&event("browser_log", json!("hello")));

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 1);
        assert!(errors[0].starts_with("browser_error:"));
        assert!(errors[0].contains("ReferenceError"));
    }

    #[test]
    fn handler_failures_do_not_escape_dispatch() {
        let (table, errors) = recording_table();
        let table = table
            .on(EventKind::SpecComplete, |_| Err(anyhow!("bad payload")))
            .on(EventKind::RunComplete, |_| panic!("handler blew up"));

        assert_eq!(table.dispatch(&event("spec_complete", Value::Null)), None);
        assert_eq!(table.dispatch(&event("run_complete", Value::Null)), None);

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 2);
        assert!(errors[0].contains("bad payload"));
        assert!(errors[1].contains("handler blew up"));
    }

    #[test]
    fn error_like_heuristic() {
        assert!(is_error_like("browser_error"));
        assert!(is_error_like("UncaughtException"));
        assert!(is_error_like("compile_failed"));
        assert!(!is_error_like("browser_log"));
    }
}
