// src/execution/deferred.rs

//! Controller / handle pair backed by a `tokio::sync::watch` channel.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::trace;

use super::{ExecutionState, Failure};

/// Mutating side of an [`Execution`].
///
/// Cloning is cheap; all clones drive the same execution. When every
/// controller is dropped while a phase is still pending, waiters observe an
/// "abandoned" failure instead of hanging forever.
pub struct DeferredExecution<S, E> {
    tx: Arc<watch::Sender<ExecutionState<S, E>>>,
}

impl<S, E> Clone for DeferredExecution<S, E> {
    fn clone(&self) -> Self {
        Self {
            tx: Arc::clone(&self.tx),
        }
    }
}

impl<S, E> std::fmt::Debug for DeferredExecution<S, E>
where
    S: std::fmt::Debug,
    E: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeferredExecution")
            .field("state", &*self.tx.borrow())
            .finish()
    }
}

impl<S, E> Default for DeferredExecution<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<S, E> DeferredExecution<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(ExecutionState::Pending);
        Self { tx: Arc::new(tx) }
    }

    /// Read-only handle observing this execution.
    pub fn execution(&self) -> Execution<S, E> {
        Execution {
            rx: self.tx.subscribe(),
        }
    }

    /// Resolve the start phase. Returns `false` if it was already settled.
    pub fn start(&self, value: S) -> bool {
        apply_start(&self.tx, value)
    }

    /// Resolve the end phase.
    ///
    /// Only applies once the start phase has resolved; an `end` that arrives
    /// before `start` is dropped.
    pub fn end(&self, value: E) -> bool {
        self.tx.send_if_modified(|state| {
            match std::mem::replace(state, ExecutionState::Pending) {
                ExecutionState::Started(s) => {
                    *state = ExecutionState::Ended(s, value);
                    true
                }
                other => {
                    *state = other;
                    false
                }
            }
        })
    }

    /// Reject whichever phase is still pending.
    pub fn fail(&self, reason: Failure) -> bool {
        self.tx.send_if_modified(|state| {
            match std::mem::replace(state, ExecutionState::Pending) {
                ExecutionState::Pending => {
                    *state = ExecutionState::StartFailed(reason);
                    true
                }
                ExecutionState::Started(s) => {
                    *state = ExecutionState::EndFailed(s, reason);
                    true
                }
                other => {
                    *state = other;
                    false
                }
            }
        })
    }

    /// Resolve the start phase with `value` after `delay`, unless something
    /// settled it first.
    pub fn auto_start(&self, delay: Duration, value: S) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.tx);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(tx) = Weak::upgrade(&weak) {
                if apply_start(&tx, value) {
                    trace!(?delay, "execution auto-started");
                }
            }
        })
    }

    /// Fail the start phase after `delay` if it is still pending by then.
    ///
    /// Has no effect on an execution that has already started.
    pub fn fail_if_not_started(&self, delay: Duration, reason: Failure) -> JoinHandle<()> {
        let weak = Arc::downgrade(&self.tx);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(tx) = Weak::upgrade(&weak) else {
                return;
            };
            let failed = tx.send_if_modified(|state| {
                if state.is_pending() {
                    *state = ExecutionState::StartFailed(reason);
                    true
                } else {
                    false
                }
            });
            if failed {
                trace!(?delay, "execution failed: not started in time");
            }
        })
    }

    pub fn is_started(&self) -> bool {
        matches!(*self.tx.borrow(), ExecutionState::Started(_))
    }

    pub fn is_done(&self) -> bool {
        self.tx.borrow().is_terminal()
    }
}

fn apply_start<S, E>(tx: &watch::Sender<ExecutionState<S, E>>, value: S) -> bool {
    tx.send_if_modified(|state| {
        if state.is_pending() {
            *state = ExecutionState::Started(value);
            true
        } else {
            false
        }
    })
}

/// Read-only view of a two-phase operation.
///
/// All waiting methods return owned `'static` futures so they can be handed
/// to `tokio::select!`, spawned, or used as a port release signal.
pub struct Execution<S, E> {
    rx: watch::Receiver<ExecutionState<S, E>>,
}

impl<S, E> Clone for Execution<S, E> {
    fn clone(&self) -> Self {
        Self {
            rx: self.rx.clone(),
        }
    }
}

impl<S, E> std::fmt::Debug for Execution<S, E>
where
    S: std::fmt::Debug,
    E: std::fmt::Debug,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Execution")
            .field("state", &*self.rx.borrow())
            .finish()
    }
}

impl<S, E> Execution<S, E>
where
    S: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Build a handle that is already in `state` and can never change.
    pub fn settled(state: ExecutionState<S, E>) -> Self {
        let (_tx, rx) = watch::channel(state);
        Self { rx }
    }

    pub fn state(&self) -> ExecutionState<S, E> {
        self.rx.borrow().clone()
    }

    /// Started and not yet ended or failed.
    pub fn is_started(&self) -> bool {
        matches!(*self.rx.borrow(), ExecutionState::Started(_))
    }

    pub fn is_done(&self) -> bool {
        self.rx.borrow().is_terminal()
    }

    pub fn is_failed(&self) -> bool {
        self.rx.borrow().failure().is_some()
    }

    /// Resolves with the start value, or the failure that prevented it.
    pub fn started(&self) -> impl Future<Output = Result<S, Failure>> + Send + use<S, E> {
        let rx = self.rx.clone();
        async move {
            match wait_until(rx, |s| !s.is_pending()).await {
                Some(ExecutionState::Started(s))
                | Some(ExecutionState::Ended(s, _))
                | Some(ExecutionState::EndFailed(s, _)) => Ok(s),
                Some(ExecutionState::StartFailed(f)) => Err(f),
                Some(ExecutionState::Pending) | None => Err(Failure::abandoned()),
            }
        }
    }

    /// Resolves with the end value, or the failure from either phase.
    pub fn ended(&self) -> impl Future<Output = Result<E, Failure>> + Send + use<S, E> {
        let rx = self.rx.clone();
        async move {
            match wait_until(rx, ExecutionState::is_terminal).await {
                Some(ExecutionState::Ended(_, e)) => Ok(e),
                Some(ExecutionState::StartFailed(f)) | Some(ExecutionState::EndFailed(_, f)) => Err(f),
                Some(_) | None => Err(Failure::abandoned()),
            }
        }
    }

    /// Resolves with the failure of whichever phase was rejected.
    ///
    /// Never resolves if the execution ends successfully, which makes it
    /// suitable as a race arm.
    pub fn failed(&self) -> impl Future<Output = Failure> + Send + use<S, E> {
        let rx = self.rx.clone();
        async move {
            match wait_until(rx, ExecutionState::is_terminal).await {
                Some(ExecutionState::StartFailed(f)) | Some(ExecutionState::EndFailed(_, f)) => f,
                Some(_) => std::future::pending().await,
                None => Failure::abandoned(),
            }
        }
    }

    /// Resolves once the execution reached any terminal state.
    pub fn done(&self) -> impl Future<Output = ()> + Send + use<S, E> {
        let rx = self.rx.clone();
        async move {
            let _ = wait_until(rx, ExecutionState::is_terminal).await;
        }
    }
}

/// Wait until `pred` holds and return a copy of the state; `None` if every
/// controller went away first.
async fn wait_until<S, E, F>(
    mut rx: watch::Receiver<ExecutionState<S, E>>,
    pred: F,
) -> Option<ExecutionState<S, E>>
where
    S: Clone,
    E: Clone,
    F: FnMut(&ExecutionState<S, E>) -> bool,
{
    let state = rx.wait_for(pred).await.map(|state| (*state).clone());
    state.ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    type Exec = DeferredExecution<u32, &'static str>;

    #[test]
    fn end_before_start_is_ignored() {
        let d = Exec::new();
        let e = d.execution();

        assert!(!d.end("early"));
        assert_eq!(e.state(), ExecutionState::Pending);

        assert!(d.start(1));
        assert!(e.is_started());
        assert!(d.end("done"));
        assert!(!e.is_started());
        assert!(e.is_done());
        assert_eq!(e.state(), ExecutionState::Ended(1, "done"));
    }

    #[test]
    fn repeated_mutations_are_no_ops_once_settled() {
        let d = Exec::new();
        let e = d.execution();

        d.start(1);
        assert!(!d.start(2));
        d.end("first");
        assert!(!d.end("second"));
        assert!(!d.fail(Failure::error("late")));

        assert_eq!(e.state(), ExecutionState::Ended(1, "first"));
        assert!(!e.is_failed());
    }

    #[test]
    fn fail_targets_the_pending_phase() {
        let d = Exec::new();
        d.fail(Failure::error("never started"));
        assert_eq!(
            d.execution().state(),
            ExecutionState::StartFailed(Failure::error("never started"))
        );

        let d = Exec::new();
        d.start(7);
        d.fail(Failure::cancelled("stopped"));
        let e = d.execution();
        assert!(e.is_done());
        assert!(e.is_failed());
        assert_eq!(e.state(), ExecutionState::EndFailed(7, Failure::cancelled("stopped")));
    }

    #[tokio::test]
    async fn waiters_observe_each_phase() {
        let d = Exec::new();
        let e = d.execution();

        let started = tokio::spawn(e.started());
        let ended = tokio::spawn(e.ended());

        d.start(3);
        assert_eq!(started.await.unwrap(), Ok(3));

        d.end("bye");
        assert_eq!(ended.await.unwrap(), Ok("bye"));
        e.done().await;
    }

    #[tokio::test]
    async fn failed_resolves_with_start_rejection() {
        let d = Exec::new();
        let e = d.execution();
        d.fail(Failure::error("boom"));

        assert_eq!(e.failed().await, Failure::error("boom"));
        assert_eq!(e.started().await, Err(Failure::error("boom")));
        assert_eq!(e.ended().await, Err(Failure::error("boom")));
    }

    #[tokio::test]
    async fn failed_never_resolves_on_success() {
        let d = Exec::new();
        let e = d.execution();
        d.start(1);
        d.end("ok");

        let res = tokio::time::timeout(Duration::from_millis(30), e.failed()).await;
        assert!(res.is_err(), "failed() must stay pending for a successful execution");
    }

    #[tokio::test]
    async fn dropped_controller_abandons_waiters() {
        let d = Exec::new();
        let e = d.execution();
        drop(d);

        let res = e.started().await;
        assert!(matches!(res, Err(Failure::Error(msg)) if msg.contains("abandoned")));
    }

    #[tokio::test]
    async fn fail_if_not_started_only_fires_when_pending() {
        let d = Exec::new();
        let e = d.execution();
        d.fail_if_not_started(Duration::from_millis(10), Failure::error("too slow"))
            .await
            .unwrap();
        assert_eq!(e.started().await, Err(Failure::error("too slow")));

        let d = Exec::new();
        let e = d.execution();
        d.start(5);
        d.fail_if_not_started(Duration::from_millis(10), Failure::error("too slow"))
            .await
            .unwrap();
        assert!(e.is_started());
    }

    #[tokio::test]
    async fn auto_start_resolves_after_delay() {
        let d = Exec::new();
        let e = d.execution();
        let timer = d.auto_start(Duration::from_millis(10), 42);

        assert_eq!(e.started().await, Ok(42));
        timer.await.unwrap();
    }

    #[test]
    fn settled_handle_reports_terminal_state() {
        let e: Execution<u32, &str> = Execution::settled(ExecutionState::Ended(1, "x"));
        assert!(e.is_done());
        assert!(!e.is_started());
    }
}
