// src/session/results.rs

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::types::{TestState, TestStatus};

/// One test outcome as reported by a `spec_complete` event.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestResult {
    pub id: String,
    pub description: String,
    /// Enclosing suite names, outermost first.
    #[serde(default)]
    pub suite: Vec<String>,
    /// Suite names and description joined by spaces. Derived when the
    /// runner leaves it out.
    #[serde(default)]
    pub full_name: String,
    pub status: TestStatus,
    #[serde(default)]
    pub time_ms: u64,
    #[serde(default)]
    pub failure_messages: Vec<String>,
}

impl TestResult {
    pub fn from_payload(payload: &Value) -> Result<Self> {
        let mut result: TestResult = serde_json::from_value(payload.clone())
            .context("decoding spec_complete payload")?;
        if result.full_name.is_empty() {
            result.full_name = full_name_of(&result.suite, &result.description);
        }
        Ok(result)
    }
}

pub fn full_name_of(suite: &[String], description: &str) -> String {
    suite
        .iter()
        .map(String::as_str)
        .chain(std::iter::once(description))
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// A test moving from running to its final status.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestTransition {
    pub test_id: String,
    pub from: TestState,
    pub to: TestStatus,
    pub result: TestResult,
}

impl TestTransition {
    pub fn finished(result: TestResult) -> Self {
        Self {
            test_id: result.id.clone(),
            from: TestState::Running,
            to: result.status,
            result,
        }
    }
}

/// Aggregate counts over a concluded session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RunSummary {
    pub passed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_time_ms: u64,
}

impl RunSummary {
    pub fn from_results<'a>(results: impl IntoIterator<Item = &'a TestResult>) -> Self {
        results.into_iter().fold(Self::default(), |mut acc, r| {
            match r.status {
                TestStatus::Passed => acc.passed += 1,
                TestStatus::Failed => acc.failed += 1,
                TestStatus::Skipped => acc.skipped += 1,
            }
            acc.total_time_ms += r.time_ms;
            acc
        })
    }

    pub fn total(&self) -> usize {
        self.passed + self.failed + self.skipped
    }
}

/// Snapshot handed to whoever awaited a session's conclusion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessedResults {
    /// Every recorded result, sorted by full name.
    pub results: Vec<TestResult>,
    /// Transitions that were held back from the live stream.
    pub parked: Vec<TestTransition>,
    pub summary: Option<RunSummary>,
}
