use std::sync::Mutex;

use runbridge::engine::{NotificationLevel, NotificationSink};
use runbridge::session::{ResultSink, RunSummary, TestTransition};

/// Result sink that keeps everything it is handed.
#[derive(Debug, Default)]
pub struct RecordingSink {
    transitions: Mutex<Vec<TestTransition>>,
    summaries: Mutex<Vec<RunSummary>>,
}

impl RecordingSink {
    pub fn transitions(&self) -> Vec<TestTransition> {
        self.transitions.lock().unwrap().clone()
    }

    /// Test ids in the order their transitions arrived.
    pub fn ids(&self) -> Vec<String> {
        self.transitions
            .lock()
            .unwrap()
            .iter()
            .map(|t| t.test_id.clone())
            .collect()
    }

    pub fn summaries(&self) -> Vec<RunSummary> {
        self.summaries.lock().unwrap().clone()
    }
}

impl ResultSink for RecordingSink {
    fn transition(&self, transition: &TestTransition) {
        self.transitions.lock().unwrap().push(transition.clone());
    }

    fn summary(&self, summary: &RunSummary) {
        self.summaries.lock().unwrap().push(*summary);
    }
}

/// Notification sink that keeps every notification.
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    notes: Mutex<Vec<(NotificationLevel, String)>>,
}

impl RecordingNotifier {
    pub fn all(&self) -> Vec<(NotificationLevel, String)> {
        self.notes.lock().unwrap().clone()
    }

    pub fn at(&self, level: NotificationLevel) -> Vec<String> {
        self.notes
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, m)| m.clone())
            .collect()
    }
}

impl NotificationSink for RecordingNotifier {
    fn notify(&self, level: NotificationLevel, message: &str) {
        self.notes.lock().unwrap().push((level, message.to_string()));
    }
}
