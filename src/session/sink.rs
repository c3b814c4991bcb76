// src/session/sink.rs

use std::io::Write;
use std::sync::{Mutex, PoisonError};

use tracing::{debug, warn};

use super::results::{RunSummary, TestTransition};
use crate::types::TestStatus;

/// Receives transitions and summaries produced by processing sessions.
///
/// Called synchronously from the event-channel read loop, so implementations
/// should not block.
pub trait ResultSink: Send + Sync {
    fn transition(&self, transition: &TestTransition);

    fn summary(&self, _summary: &RunSummary) {}
}

/// Prints one line per finished test to stdout and remembers the last
/// summary it saw.
#[derive(Debug, Default)]
pub struct ConsoleResultSink {
    last_summary: Mutex<Option<RunSummary>>,
}

impl ConsoleResultSink {
    pub fn last_summary(&self) -> Option<RunSummary> {
        *self.last_summary.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn print(&self, line: &str) {
        let mut out = std::io::stdout().lock();
        if let Err(e) = writeln!(out, "{line}") {
            warn!(error = %e, "writing to stdout");
        }
    }
}

impl ResultSink for ConsoleResultSink {
    fn transition(&self, t: &TestTransition) {
        debug!(test_id = %t.test_id, status = %t.to, "test finished");
        let mark = match t.to {
            TestStatus::Passed => "PASS",
            TestStatus::Failed => "FAIL",
            TestStatus::Skipped => "SKIP",
        };
        self.print(&format!("{mark} {} ({} ms)", t.result.full_name, t.result.time_ms));
        for msg in &t.result.failure_messages {
            for line in msg.lines() {
                self.print(&format!("     {line}"));
            }
        }
    }

    fn summary(&self, s: &RunSummary) {
        self.print(&format!(
            "\n{} passed, {} failed, {} skipped ({} ms)",
            s.passed, s.failed, s.skipped, s.total_time_ms
        ));
        *self.last_summary.lock().unwrap_or_else(PoisonError::into_inner) = Some(*s);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn console_sink_remembers_the_last_summary() {
        let sink = ConsoleResultSink::default();
        assert!(sink.last_summary().is_none());

        let summary = RunSummary {
            passed: 2,
            failed: 1,
            skipped: 0,
            total_time_ms: 40,
        };
        sink.summary(&summary);
        assert_eq!(sink.last_summary(), Some(summary));
    }
}
