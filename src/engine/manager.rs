// src/engine/manager.rs

//! The run orchestrator.
//!
//! `TestManager` owns the test server lifecycle
//! (`Stopped -> Starting -> Running -> Stopping -> Stopped`) and the
//! caller-visible actions on top of it:
//!
//! - `start` leases ports, opens the event channel, launches the runner and
//!   waits until both the process and the channel are up.
//! - `stop` tears everything down; in-flight actions see a cancellation.
//! - `discover_tests` / `run_tests` open a processing session, trigger the
//!   runner and race the session's conclusion against the server failing.
//!
//! Every server session is represented by a `DeferredExecution` that starts
//! with the assigned ports and fails when the server crashes or is stopped.
//! Port leases are released when it settles, and running actions race
//! against its failure.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use anyhow::anyhow;
use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::sync::oneshot;
use tracing::{debug, error, info, warn};

use super::handlers::build_handler_table;
use super::notify::{NotificationLevel, NotificationSink};
use super::state::{ServerPhase, ServerStartInfo};
use super::targets::{TestTarget, dedup_targets};
use super::tree::{TestTree, TestTreeMapper};
use crate::channel::listener::ChannelExecution;
use crate::channel::{EventChannelListener, ListenerOptions};
use crate::config::model::ConfigFile;
use crate::errors::{Result, RunbridgeError};
use crate::exec::{ExitInfo, LaunchSpec, LaunchedProcess, ProcessLauncher, RunRequest, RunTrigger};
use crate::execution::{DeferredExecution, Execution, Failure};
use crate::ports::PortAllocator;
use crate::session::{
    EmissionPolicy, ProcessedResults, ProcessingOptions, ResultSink, SessionConclusion,
    TestEventProcessor,
};
use crate::types::TestStatus;

const STOPPED_MESSAGE: &str = "test server was stopped";

/// Static settings for a [`TestManager`].
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Runner command; ports are added to its environment on launch.
    pub launch: LaunchSpec,
    pub host: IpAddr,
    pub port: u16,
    pub event_port: u16,
    pub debug_port: Option<u16>,
    pub port_attempts: u16,
    pub ready_timeout: Duration,
    pub result_timeout: Option<Duration>,
    /// Statuses held back during a run and replayed after it concludes.
    pub park: Vec<TestStatus>,
}

impl ManagerConfig {
    pub fn from_config(cfg: &ConfigFile) -> Self {
        let server = &cfg.server;
        Self {
            launch: LaunchSpec {
                command: server.command.clone(),
                cwd: server.cwd.clone(),
                env: server.env.clone(),
            },
            host: server.host,
            port: server.port,
            event_port: server.event_port,
            debug_port: server.debug_port,
            port_attempts: server.port_attempts,
            ready_timeout: server.ready_timeout,
            result_timeout: cfg.run.result_timeout,
            park: cfg.run.park.clone(),
        }
    }
}

/// Collaborators injected at construction.
#[derive(Clone)]
pub struct ManagerDeps {
    pub launcher: Arc<dyn ProcessLauncher>,
    pub trigger: Arc<dyn RunTrigger>,
    pub mapper: Arc<dyn TestTreeMapper>,
    pub notifier: Arc<dyn NotificationSink>,
    pub results: Arc<dyn ResultSink>,
}

type ServerSession = DeferredExecution<ServerStartInfo, ()>;
type Settled = Shared<BoxFuture<'static, ()>>;

#[derive(Default)]
struct ManagerState {
    phase: ServerPhase,
    start_info: Option<ServerStartInfo>,
    session: Option<ServerSession>,
    process: Option<LaunchedProcess>,
    /// Resolves when the in-flight start settled, whichever way.
    starting: Option<Settled>,
    stopping: Option<Settled>,
}

struct ManagerInner {
    config: ManagerConfig,
    deps: ManagerDeps,
    allocator: PortAllocator,
    listener: EventChannelListener,
    processor: Arc<TestEventProcessor>,
    state: Mutex<ManagerState>,
    action_running: AtomicBool,
}

/// Cheap, cloneable handle to the orchestrator.
#[derive(Clone)]
pub struct TestManager {
    inner: Arc<ManagerInner>,
}

impl std::fmt::Debug for TestManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestManager")
            .field("phase", &self.phase())
            .field("action_running", &self.is_action_running())
            .finish_non_exhaustive()
    }
}

enum StartStep {
    AwaitStop(Settled),
    Follow(Execution<ServerStartInfo, ()>),
    Lead(BoxFuture<'static, Result<ServerStartInfo>>),
}

/// Clears the action flag when the action finishes or is dropped.
struct ActionGuard<'a>(&'a AtomicBool);

impl Drop for ActionGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

impl TestManager {
    pub fn new(config: ManagerConfig, deps: ManagerDeps) -> Self {
        let processor = TestEventProcessor::new(Arc::clone(&deps.results));
        let handlers = build_handler_table(Arc::clone(&processor), Arc::clone(&deps.notifier));
        let listener = EventChannelListener::new(
            ListenerOptions {
                host: config.host,
                ready_timeout: config.ready_timeout,
            },
            handlers,
        );
        let allocator = PortAllocator::new(config.host, config.port_attempts);

        Self {
            inner: Arc::new(ManagerInner {
                config,
                deps,
                allocator,
                listener,
                processor,
                state: Mutex::new(ManagerState::default()),
                action_running: AtomicBool::new(false),
            }),
        }
    }

    pub fn phase(&self) -> ServerPhase {
        self.inner.lock().phase
    }

    /// Running, and the current server session has not failed.
    pub fn is_started(&self) -> bool {
        let state = self.inner.lock();
        state.phase == ServerPhase::Running && state.session.as_ref().is_some_and(|s| !s.is_done())
    }

    pub fn is_action_running(&self) -> bool {
        self.inner.action_running.load(Ordering::Acquire)
    }

    /// Ports of the running server, if any.
    pub fn start_info(&self) -> Option<ServerStartInfo> {
        let state = self.inner.lock();
        match state.phase {
            ServerPhase::Running => state.start_info.clone(),
            _ => None,
        }
    }

    /// Bring the test server up, or join a start already in progress.
    ///
    /// Returns immediately when already running. A stop in progress is
    /// awaited first.
    pub async fn start(&self) -> Result<ServerStartInfo> {
        loop {
            let next = {
                let mut state = self.inner.lock();
                let stopping = state.stopping.clone();
                match (stopping, state.phase) {
                    (Some(stopping), _) => StartStep::AwaitStop(stopping),
                    (None, ServerPhase::Running) => {
                        return state.start_info.clone().ok_or_else(|| {
                            RunbridgeError::SystemFailure("server running without start info".to_string())
                        });
                    }
                    (None, ServerPhase::Starting) => match state.session.as_ref() {
                        Some(session) => StartStep::Follow(session.execution()),
                        None => {
                            return Err(RunbridgeError::SystemFailure(
                                "server starting without a session".to_string(),
                            ));
                        }
                    },
                    (None, ServerPhase::Stopped | ServerPhase::Stopping) => {
                        StartStep::Lead(self.lead_start(&mut state))
                    }
                }
            };

            match next {
                StartStep::AwaitStop(stopping) => {
                    debug!("waiting for test server stop before starting");
                    stopping.await;
                }
                StartStep::Follow(session) => {
                    debug!("joining in-flight test server start");
                    return session.started().await.map_err(RunbridgeError::from);
                }
                StartStep::Lead(reply) => return reply.await,
            }
        }
    }

    /// Starts a new server session. Called with the state lock held; the
    /// lock is released before anything is awaited.
    fn lead_start(
        &self,
        state: &mut MutexGuard<'_, ManagerState>,
    ) -> BoxFuture<'static, Result<ServerStartInfo>> {
        let session = ServerSession::new();
        state.phase = ServerPhase::Starting;
        state.session = Some(session.clone());
        state.start_info = None;

        let (reply_tx, reply_rx) = oneshot::channel();
        let inner = Arc::clone(&self.inner);
        let task = tokio::spawn(async move {
            let outcome = bring_up(&inner, session).await;
            if reply_tx.send(outcome).is_err() {
                debug!("start caller went away before the server came up");
            }
        });
        state.starting = Some(task.map(|_| ()).boxed().shared());

        info!("starting test server");
        async move {
            reply_rx
                .await
                .map_err(|_| RunbridgeError::Other(anyhow!("test server start task ended unexpectedly")))?
        }
        .boxed()
    }

    /// Tear the server down. Concurrent callers share a single teardown.
    pub async fn stop(&self) -> Result<()> {
        let teardown = {
            let mut state = self.inner.lock();
            if state.stopping.is_none() && state.phase == ServerPhase::Stopped && state.session.is_none() {
                debug!("stop requested while already stopped");
                return Ok(());
            }
            begin_stop(&self.inner, &mut state)
        };

        teardown.await;
        Ok(())
    }

    pub async fn restart(&self) -> Result<()> {
        self.stop().await?;
        self.start().await.map(|_| ())
    }

    /// Enumerate every test the runner knows about, starting the server
    /// if needed.
    pub async fn discover_tests(&self) -> Result<TestTree> {
        let _guard = self.begin_action("discover tests")?;
        self.inner
            .deps
            .notifier
            .notify(NotificationLevel::Busy, "Discovering tests");

        match self.discover_inner().await {
            Ok(tree) => {
                info!(tests = tree.test_count(), "test discovery finished");
                self.inner.deps.notifier.notify(
                    NotificationLevel::Info,
                    &format!("Discovered {} tests", tree.test_count()),
                );
                Ok(tree)
            }
            Err(err) if err.is_cancellation() => Err(err),
            Err(err) => {
                let err = RunbridgeError::DiscoveryFailed(err.to_string());
                self.inner
                    .deps
                    .notifier
                    .notify(NotificationLevel::Error, &err.to_string());
                Err(err)
            }
        }
    }

    async fn discover_inner(&self) -> Result<TestTree> {
        let info = self.start().await?;
        let system_failure = self.system_failure()?;
        let options = ProcessingOptions::new(EmissionPolicy::silent(), self.inner.config.result_timeout);
        let conclusion = self.inner.processor.begin(Vec::new(), options);

        let snapshot = self
            .trigger_and_conclude(&info, RunRequest::discovery(), conclusion, system_failure)
            .await?;
        Ok(self.inner.deps.mapper.map(&snapshot.results))
    }

    /// Run `targets` (everything when empty), streaming results to the
    /// result sink.
    ///
    /// Rejected with [`RunbridgeError::ActionInProgress`] while another
    /// action is running; nothing is queued.
    pub async fn run_tests(&self, targets: &[TestTarget]) -> Result<()> {
        let _guard = self.begin_action("run tests")?;
        let targets = dedup_targets(targets);
        let names: Vec<String> = targets.iter().map(|t| t.full_name.clone()).collect();
        self.inner.deps.notifier.notify(
            NotificationLevel::Busy,
            &if names.is_empty() {
                "Running all tests".to_string()
            } else {
                format!("Running {} test target(s)", names.len())
            },
        );

        let outcome = self.run_inner(names).await;
        match &outcome {
            Ok(()) => self
                .inner
                .deps
                .notifier
                .notify(NotificationLevel::Info, "Test run finished"),
            Err(err) if err.is_cancellation() => debug!(error = %err, "test run cancelled"),
            Err(err) => self
                .inner
                .deps
                .notifier
                .notify(NotificationLevel::Error, &err.to_string()),
        }
        outcome
    }

    async fn run_inner(&self, names: Vec<String>) -> Result<()> {
        let info = self.start().await?;
        let system_failure = self.system_failure()?;

        let policy = EmissionPolicy::live().with_park(self.inner.config.park.iter().copied());
        let options = ProcessingOptions::new(policy, self.inner.config.result_timeout);
        let conclusion = self.inner.processor.begin(names.clone(), options);

        let snapshot = self
            .trigger_and_conclude(&info, RunRequest::execute(names), conclusion, system_failure)
            .await?;

        for transition in &snapshot.parked {
            self.inner.deps.results.transition(transition);
        }
        info!(
            results = snapshot.results.len(),
            replayed = snapshot.parked.len(),
            "test run finished"
        );
        Ok(())
    }

    /// Trigger the runner and wait for the session to conclude, bailing out
    /// as soon as the server fails.
    async fn trigger_and_conclude(
        &self,
        info: &ServerStartInfo,
        request: RunRequest,
        conclusion: SessionConclusion,
        system_failure: impl std::future::Future<Output = Failure> + Send,
    ) -> Result<ProcessedResults> {
        let processor = &self.inner.processor;
        let work = async {
            if let Err(err) = self.inner.deps.trigger.trigger(info, request).await {
                processor.reject(Failure::error(err.to_string()));
                return Err(err);
            }
            conclusion.await.map_err(|failure| match failure {
                Failure::Cancelled(msg) => RunbridgeError::Cancelled(msg),
                Failure::Error(msg) => RunbridgeError::SessionFailed(msg),
            })
        };

        tokio::select! {
            biased;
            failure = system_failure => {
                processor.reject(failure.clone());
                Err(failure.into())
            }
            outcome = work => outcome,
        }
    }

    /// Resolves when the current server session fails.
    fn system_failure(&self) -> Result<impl std::future::Future<Output = Failure> + Send + use<>> {
        let state = self.inner.lock();
        match &state.session {
            Some(session) => Ok(session.execution().failed()),
            None => Err(RunbridgeError::Cancelled(STOPPED_MESSAGE.to_string())),
        }
    }

    fn begin_action(&self, what: &str) -> Result<ActionGuard<'_>> {
        let flag = &self.inner.action_running;
        if flag
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            warn!(action = what, "another test action is already running; ignoring request");
            return Err(RunbridgeError::ActionInProgress);
        }
        Ok(ActionGuard(flag))
    }
}

impl ManagerInner {
    fn lock(&self) -> MutexGuard<'_, ManagerState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Move to `Stopping` and spawn the teardown, or join the one in flight.
/// Called with the state lock held.
fn begin_stop(inner: &Arc<ManagerInner>, state: &mut ManagerState) -> Settled {
    if let Some(in_flight) = &state.stopping {
        return in_flight.clone();
    }
    state.phase = ServerPhase::Stopping;
    let owner = Arc::clone(inner);
    let teardown = tokio::spawn(async move { shut_down(&owner).await })
        .map(|_| ())
        .boxed()
        .shared();
    state.stopping = Some(teardown.clone());
    teardown
}

/// Lease ports, open the channel, launch the runner and wait for both to be
/// ready. Any failure tears down what was acquired so far and fails the
/// session.
async fn bring_up(inner: &Arc<ManagerInner>, session: ServerSession) -> Result<ServerStartInfo> {
    let failed = session.execution().failed();
    let mut launched = None;
    let outcome = tokio::select! {
        biased;
        failure = failed => Err(RunbridgeError::from(failure)),
        outcome = launch_and_wait(inner, &session, &mut launched) => outcome,
    };

    let (info, channel, process) = match (outcome, launched) {
        (Ok((info, channel)), Some(process)) => (info, channel, process),
        (outcome, launched) => {
            let err = match outcome {
                Err(err) => err,
                Ok(_) => RunbridgeError::LaunchFailed("no process handle after launch".to_string()),
            };
            warn!(error = %err, "test server failed to start");
            if let Some(mut process) = launched {
                process.stop().await;
            }
            inner.listener.stop().await;
            session.fail(Failure::error(err.to_string()));
            reset_after_failed_start(inner);
            return Err(err);
        }
    };

    let process_exec = process.execution.clone();
    let still_starting = {
        let mut state = inner.lock();
        if state.phase == ServerPhase::Starting {
            state.phase = ServerPhase::Running;
            state.start_info = Some(info.clone());
            state.process = Some(process);
            state.starting = None;
            None
        } else {
            Some(process)
        }
    };
    if let Some(mut process) = still_starting {
        debug!("stop requested while starting; discarding fresh server");
        process.stop().await;
        inner.listener.stop().await;
        return Err(RunbridgeError::Cancelled(STOPPED_MESSAGE.to_string()));
    }
    session.start(info.clone());

    tokio::spawn(monitor(
        Arc::downgrade(inner),
        session,
        channel,
        process_exec,
    ));

    info!(
        primary_port = info.primary_port,
        event_port = info.event_port,
        debug_port = ?info.debug_port,
        "test server running"
    );
    Ok(info)
}

/// The launched process is left in `launched` so the caller can stop it
/// whichever way the start goes.
async fn launch_and_wait(
    inner: &ManagerInner,
    session: &ServerSession,
    launched: &mut Option<LaunchedProcess>,
) -> Result<(ServerStartInfo, ChannelExecution)> {
    let config = &inner.config;
    let lease = session.execution();

    let primary_port = inner.allocator.find_available_port(config.port, lease.done()).await?;
    let event_port = inner
        .allocator
        .find_available_port(config.event_port, lease.done())
        .await?;
    let debug_port = match config.debug_port {
        Some(preferred) => Some(inner.allocator.find_available_port(preferred, lease.done()).await?),
        None => None,
    };
    let info = ServerStartInfo {
        primary_port,
        event_port,
        debug_port,
    };
    debug!(?info, "ports leased");

    let channel = inner.listener.open(event_port)?;
    let process = launched.insert(inner.deps.launcher.launch(config.launch.with_ports(&info))?);

    let ready = futures::future::try_join(channel.started(), process.execution.started());
    let exited = process.execution.ended();
    tokio::select! {
        biased;
        exit = exited => Err(RunbridgeError::LaunchFailed(match exit {
            Ok(exit) => format!("test runner exited before it was ready ({exit})"),
            Err(failure) => format!("test runner failed before it was ready: {failure}"),
        })),
        ready = ready => ready
            .map(|_| (info, channel))
            .map_err(|failure| RunbridgeError::ConnectionFailed(failure.to_string())),
    }
}

fn reset_after_failed_start(inner: &ManagerInner) {
    let mut state = inner.lock();
    state.starting = None;
    if state.phase == ServerPhase::Starting {
        state.phase = ServerPhase::Stopped;
        state.session = None;
        state.start_info = None;
    }
}

/// Watch a running server and turn an unexpected exit of the process or the
/// channel into a system failure followed by a full stop.
async fn monitor(
    inner: Weak<ManagerInner>,
    session: ServerSession,
    channel: ChannelExecution,
    process: Execution<u32, ExitInfo>,
) {
    let session_done = session.execution().done();
    let reason = tokio::select! {
        biased;
        _ = session_done => return,
        exit = process.ended() => match exit {
            Ok(exit) => format!("test runner exited unexpectedly ({exit})"),
            Err(failure) => format!("test runner failed: {failure}"),
        },
        end = channel.ended() => match end {
            Ok(reason) => format!("event channel closed unexpectedly: {reason}"),
            Err(failure) => format!("event channel failed: {failure}"),
        },
    };

    let failure = Failure::error(reason.clone());
    let Some(inner) = inner.upgrade() else {
        session.fail(failure);
        return;
    };

    // Failing the session and leaving `Running` happen under one lock, so
    // nobody sees a running server with a failed session.
    let (teardown, action_running) = {
        let mut state = inner.lock();
        let action_running = inner.action_running.load(Ordering::Acquire);
        if !session.fail(failure.clone()) {
            return;
        }
        (begin_stop(&inner, &mut state), action_running)
    };

    error!(reason = %reason, "test server failed while running");
    inner.processor.reject(failure);
    if !action_running {
        inner
            .deps
            .notifier
            .notify(NotificationLevel::Error, &format!("Test server failure: {reason}"));
    }

    teardown.await;
}

async fn shut_down(inner: &Arc<ManagerInner>) {
    let (session, starting) = {
        let state = inner.lock();
        (state.session.clone(), state.starting.clone())
    };

    // Fail the session first so in-flight actions and starts bail out.
    if let Some(session) = &session {
        session.fail(Failure::cancelled(STOPPED_MESSAGE));
    }
    inner.processor.reject(Failure::cancelled(STOPPED_MESSAGE));

    if let Some(starting) = starting {
        debug!("waiting for in-flight start to settle before stopping");
        starting.await;
    }

    let process = {
        let mut state = inner.lock();
        state.start_info = None;
        state.process.take()
    };

    inner.listener.stop().await;
    if let Some(mut process) = process {
        process.stop().await;
    }

    let mut state = inner.lock();
    state.phase = ServerPhase::Stopped;
    state.session = None;
    state.starting = None;
    state.stopping = None;
    info!("test server stopped");
}
