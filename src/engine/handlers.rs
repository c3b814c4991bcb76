// src/engine/handlers.rs

//! Wiring runner events to the processing session.

use std::sync::Arc;

use anyhow::Context;
use tracing::{debug, warn};

use super::notify::{NotificationLevel, NotificationSink};
use crate::channel::{ConnectionStatus, DisconnectReason, EventKind, HandlerTable};
use crate::session::{TestEventProcessor, TestResult};

/// Handler table used by the orchestrator's event channel.
///
/// - `ready` starts the connection session
/// - `spec_complete` feeds one result into the processor
/// - `run_complete` concludes the processing session
/// - `error` rejects it (or warns when nothing is processing)
/// - `shutdown` ends the connection session
pub fn build_handler_table(
    processor: Arc<TestEventProcessor>,
    notifier: Arc<dyn NotificationSink>,
) -> HandlerTable {
    let on_result = Arc::clone(&processor);
    let on_complete = Arc::clone(&processor);
    let on_error = processor;
    let error_notifier = Arc::clone(&notifier);

    HandlerTable::new()
        .on(EventKind::Ready, |_| {
            debug!("test runner ready");
            Ok(Some(ConnectionStatus::Started))
        })
        .on(EventKind::RunStart, |event| {
            debug!(payload = %event.payload, "runner started a run");
            Ok(None)
        })
        .on(EventKind::SpecComplete, move |event| {
            let result = TestResult::from_payload(&event.payload)
                .with_context(|| format!("malformed result payload: {}", event.payload))?;
            on_result.on_result(result);
            Ok(None)
        })
        .on(EventKind::RunComplete, move |_| {
            if !on_complete.conclude() {
                debug!("run_complete with no processing session");
            }
            Ok(None)
        })
        .on(EventKind::Error, move |event| {
            let message = event
                .message()
                .unwrap_or_else(|| "test runner reported an error".to_string());
            if !on_error.on_error(&message) {
                error_notifier.notify(NotificationLevel::Warning, &message);
            }
            Ok(None)
        })
        .on(EventKind::Shutdown, |_| {
            debug!("test runner announced shutdown");
            Ok(Some(ConnectionStatus::Ended(DisconnectReason::PeerShutdown)))
        })
        .on_handler_error(move |event, err| {
            warn!(event, error = %err, "event handler failed");
            notifier.notify(
                NotificationLevel::Warning,
                &format!("Error handling '{event}' event from the test runner: {err:#}"),
            );
        })
}
