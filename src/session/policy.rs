// src/session/policy.rs

use std::collections::BTreeSet;
use std::time::Duration;

use crate::types::TestStatus;

/// Which results become visible, and when.
///
/// - A status in `emit` produces a transition for the result sink.
/// - A status in both `emit` and `park` is held back and handed over in the
///   conclusion snapshot instead of being streamed live.
/// - `summary` attaches aggregate counts when the session concludes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EmissionPolicy {
    pub emit: BTreeSet<TestStatus>,
    pub park: BTreeSet<TestStatus>,
    pub summary: bool,
}

impl EmissionPolicy {
    /// Record results, emit nothing (discovery).
    pub fn silent() -> Self {
        Self::default()
    }

    /// Stream every status and summarise at the end.
    pub fn live() -> Self {
        Self {
            emit: TestStatus::ALL.into_iter().collect(),
            park: BTreeSet::new(),
            summary: true,
        }
    }

    pub fn with_park(mut self, statuses: impl IntoIterator<Item = TestStatus>) -> Self {
        self.park.extend(statuses);
        self
    }

    pub fn emits(&self, status: TestStatus) -> bool {
        self.emit.contains(&status)
    }

    pub fn parks(&self, status: TestStatus) -> bool {
        self.park.contains(&status)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessingOptions {
    pub policy: EmissionPolicy,
    /// Conclude with an error if no accepted result arrives for this long.
    pub inactivity_timeout: Option<Duration>,
}

impl ProcessingOptions {
    pub fn new(policy: EmissionPolicy, inactivity_timeout: Option<Duration>) -> Self {
        Self {
            policy,
            inactivity_timeout,
        }
    }
}
