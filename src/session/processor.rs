// src/session/processor.rs

//! The processing-session state machine.
//!
//! `Idle -> Processing -> Concluded`. Only one session is processing at a
//! time; `begin` while processing concludes the previous session first.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::task::{Context, Poll};
use std::time::Duration;

use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::policy::ProcessingOptions;
use super::results::{ProcessedResults, RunSummary, TestResult, TestTransition};
use super::sink::ResultSink;
use crate::execution::Failure;
use crate::types::TestStatus;

type Conclusion = Result<ProcessedResults, Failure>;

/// Resolves when the session it was returned for concludes.
#[derive(Debug)]
pub struct SessionConclusion {
    rx: oneshot::Receiver<Conclusion>,
}

impl Future for SessionConclusion {
    type Output = Conclusion;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|res| res.unwrap_or_else(|_| Err(Failure::abandoned())))
    }
}

#[derive(Debug)]
enum ProcessorState {
    Idle,
    Processing(ActiveSession),
    Concluded,
}

#[derive(Debug)]
struct ActiveSession {
    generation: u64,
    filter: Vec<String>,
    options: ProcessingOptions,
    results: HashMap<String, TestResult>,
    parked: HashMap<String, TestTransition>,
    conclusion: oneshot::Sender<Conclusion>,
    timer: Option<JoinHandle<()>>,
}

impl ActiveSession {
    /// Empty filter means "everything".
    fn includes(&self, full_name: &str) -> bool {
        self.filter.is_empty() || self.filter.iter().any(|name| full_name.starts_with(name.as_str()))
    }

    fn stop_timer(&mut self) {
        if let Some(timer) = self.timer.take() {
            timer.abort();
        }
    }

    fn snapshot(&self) -> ProcessedResults {
        let mut results: Vec<TestResult> = self.results.values().cloned().collect();
        results.sort_by(|a, b| a.full_name.cmp(&b.full_name).then_with(|| a.id.cmp(&b.id)));

        let mut parked: Vec<TestTransition> = self.parked.values().cloned().collect();
        parked.sort_by(|a, b| a.result.full_name.cmp(&b.result.full_name));

        let summary = self
            .options
            .policy
            .summary
            .then(|| RunSummary::from_results(&results));

        ProcessedResults {
            results,
            parked,
            summary,
        }
    }
}

/// Correlates incoming results with the currently open request.
pub struct TestEventProcessor {
    me: Weak<TestEventProcessor>,
    sink: Arc<dyn ResultSink>,
    state: Mutex<ProcessorState>,
    next_generation: AtomicU64,
}

impl std::fmt::Debug for TestEventProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestEventProcessor")
            .field("processing", &self.is_processing())
            .finish_non_exhaustive()
    }
}

impl TestEventProcessor {
    pub fn new(sink: Arc<dyn ResultSink>) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            sink,
            state: Mutex::new(ProcessorState::Idle),
            next_generation: AtomicU64::new(1),
        })
    }

    pub fn is_processing(&self) -> bool {
        matches!(*self.lock(), ProcessorState::Processing(_))
    }

    /// Open a new session for tests whose full name starts with one of
    /// `filter` (all tests if empty).
    ///
    /// Any session still processing is concluded first; its results go to
    /// whoever is awaiting its conclusion.
    pub fn begin(&self, filter: Vec<String>, options: ProcessingOptions) -> SessionConclusion {
        let (tx, rx) = oneshot::channel();
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);

        let mut session = ActiveSession {
            generation,
            filter,
            options,
            results: HashMap::new(),
            parked: HashMap::new(),
            conclusion: tx,
            timer: None,
        };
        if let Some(timeout) = session.options.inactivity_timeout {
            session.timer = Some(self.spawn_timer(generation, timeout));
        }

        debug!(
            generation,
            filter = ?session.filter,
            timeout = ?session.options.inactivity_timeout,
            "processing session started"
        );

        let previous = std::mem::replace(&mut *self.lock(), ProcessorState::Processing(session));
        if let ProcessorState::Processing(previous) = previous {
            debug!(generation = previous.generation, "concluding superseded session");
            self.finish(previous, None);
        }

        SessionConclusion { rx }
    }

    /// Feed one test result into the open session.
    pub fn on_result(&self, result: TestResult) {
        let live = {
            let mut state = self.lock();
            let ProcessorState::Processing(session) = &mut *state else {
                trace!(test_id = %result.id, "no session processing; dropping result");
                return;
            };

            if !session.includes(&result.full_name) {
                trace!(test_id = %result.id, name = %result.full_name, "result outside requested tests");
                return;
            }

            // A late "skipped" must not downgrade a real outcome.
            if result.status == TestStatus::Skipped {
                if let Some(existing) = session.results.get(&result.id) {
                    if existing.status != TestStatus::Skipped {
                        debug!(
                            test_id = %result.id,
                            recorded = %existing.status,
                            "ignoring late skipped update"
                        );
                        return;
                    }
                }
            }

            let status = result.status;
            let id = result.id.clone();
            session.results.insert(id.clone(), result.clone());

            let mut live = None;
            let parks = session.options.policy.emits(status) && session.options.policy.parks(status);
            if !parks {
                // A held-back transition is superseded by the newer outcome.
                session.parked.remove(&id);
            }
            if session.options.policy.emits(status) {
                let transition = TestTransition::finished(result);
                if parks {
                    session.parked.insert(id, transition);
                } else {
                    live = Some(transition);
                }
            }

            if let Some(timeout) = session.options.inactivity_timeout {
                session.stop_timer();
                session.timer = Some(self.spawn_timer(session.generation, timeout));
            }

            live
        };

        if let Some(transition) = live {
            self.sink.transition(&transition);
        }
    }

    /// Reject the open session's conclusion with `message`.
    pub fn on_error(&self, message: &str) -> bool {
        self.reject(Failure::error(message))
    }

    /// Reject the open session's conclusion with an arbitrary failure.
    pub fn reject(&self, failure: Failure) -> bool {
        let Some(session) = self.take_processing() else {
            return false;
        };
        warn!(generation = session.generation, reason = %failure, "processing session rejected");
        self.finish(session, Some(failure));
        true
    }

    /// Resolve the open session with everything recorded so far.
    ///
    /// Idempotent: returns `false` when nothing was processing.
    pub fn conclude(&self) -> bool {
        let Some(session) = self.take_processing() else {
            return false;
        };
        self.finish(session, None);
        true
    }

    fn take_processing(&self) -> Option<ActiveSession> {
        let mut state = self.lock();
        if !matches!(*state, ProcessorState::Processing(_)) {
            return None;
        }
        match std::mem::replace(&mut *state, ProcessorState::Concluded) {
            ProcessorState::Processing(session) => Some(session),
            _ => None,
        }
    }

    fn finish(&self, mut session: ActiveSession, failure: Option<Failure>) {
        session.stop_timer();

        let outcome = match failure {
            Some(failure) => Err(failure),
            None => {
                let snapshot = session.snapshot();
                if let Some(summary) = &snapshot.summary {
                    self.sink.summary(summary);
                }
                info!(
                    generation = session.generation,
                    results = snapshot.results.len(),
                    parked = snapshot.parked.len(),
                    "processing session concluded"
                );
                Ok(snapshot)
            }
        };

        if session.conclusion.send(outcome).is_err() {
            debug!(generation = session.generation, "nobody awaited session conclusion");
        }
    }

    fn spawn_timer(&self, generation: u64, timeout: Duration) -> JoinHandle<()> {
        let me = self.me.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if let Some(processor) = me.upgrade() {
                processor.expire(generation, timeout);
            }
        })
    }

    fn expire(&self, generation: u64, timeout: Duration) {
        let mut session = {
            let mut state = self.lock();
            let current = matches!(&*state, ProcessorState::Processing(s) if s.generation == generation);
            if !current {
                return;
            }
            match std::mem::replace(&mut *state, ProcessorState::Concluded) {
                ProcessorState::Processing(s) => s,
                _ => return,
            }
        };

        // The timer task is the one running this; don't abort it.
        session.timer = None;
        let failure = Failure::error(format!(
            "no test results received from the runner within {timeout:?}"
        ));
        warn!(generation, reason = %failure, "processing session timed out");
        self.finish(session, Some(failure));
    }

    fn lock(&self) -> MutexGuard<'_, ProcessorState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
