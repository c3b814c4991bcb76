// src/types.rs

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// Final outcome of a single test as reported by the runner.
///
/// The runner reports `"success"` for passed tests and `"pending"` for
/// skipped ones in some setups; both spellings are accepted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TestStatus {
    #[serde(alias = "success")]
    Passed,
    Failed,
    #[serde(alias = "pending")]
    Skipped,
}

impl TestStatus {
    pub const ALL: [TestStatus; 3] = [TestStatus::Passed, TestStatus::Failed, TestStatus::Skipped];
}

impl fmt::Display for TestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TestStatus::Passed => "passed",
            TestStatus::Failed => "failed",
            TestStatus::Skipped => "skipped",
        };
        f.write_str(s)
    }
}

impl FromStr for TestStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "passed" | "success" => Ok(TestStatus::Passed),
            "failed" => Ok(TestStatus::Failed),
            "skipped" | "pending" => Ok(TestStatus::Skipped),
            other => Err(format!(
                "invalid test status: {other} (expected \"passed\", \"failed\" or \"skipped\")"
            )),
        }
    }
}

/// State a test moves *out of* when a result is emitted.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TestState {
    Running,
}

/// Whether a caller-side target is a suite or an individual test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum TargetKind {
    Suite,
    Test,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_accepts_runner_aliases() {
        assert_eq!("success".parse::<TestStatus>().unwrap(), TestStatus::Passed);
        assert_eq!("Pending".parse::<TestStatus>().unwrap(), TestStatus::Skipped);
        assert!("broken".parse::<TestStatus>().is_err());

        let parsed: TestStatus = serde_json::from_str("\"success\"").unwrap();
        assert_eq!(parsed, TestStatus::Passed);
    }
}
