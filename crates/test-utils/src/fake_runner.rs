use std::future::Future;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, anyhow};
use serde_json::{Value, json};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::{Notify, oneshot};

use runbridge::channel::{ChannelEvent, EventKind};
use runbridge::engine::ServerStartInfo;
use runbridge::errors::{Result, RunbridgeError};
use runbridge::exec::launcher::EVENT_PORT_ENV;
use runbridge::exec::{
    ExitInfo, LaunchSpec, LaunchedProcess, ProcessLauncher, RunMode, RunRequest, RunTrigger,
};
use runbridge::execution::{DeferredExecution, Execution, ExecutionState};
use runbridge::session::TestResult;

/// How the fake runner behaves.
#[derive(Debug, Clone, Default)]
pub struct FakeRunnerOptions {
    /// Connect but never send `ready`.
    pub never_ready: bool,
    /// Exit with code 2 right after launch, before connecting.
    pub exit_on_launch: bool,
    /// Exit with code 1 when a run is triggered instead of reporting.
    pub crash_on_trigger: bool,
    /// Send an `error` event with this message instead of results.
    pub error_on_trigger: Option<String>,
    /// Report results but never send `run_complete`.
    pub skip_run_complete: bool,
    /// Pause between events sent for a run.
    pub event_delay: Option<Duration>,
}

/// In-process stand-in for the test runner.
///
/// Acts as both the launcher (it "starts" by connecting to the event port
/// found in the launch environment and sending `ready`) and the run trigger
/// (it streams the scripted results matching the request and then
/// `run_complete`).
#[derive(Clone, Default)]
pub struct FakeRunner {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    options: Mutex<FakeRunnerOptions>,
    script: Mutex<Vec<TestResult>>,
    writer: tokio::sync::Mutex<Option<OwnedWriteHalf>>,
    crash: Mutex<Option<Arc<Notify>>>,
    launches: AtomicUsize,
    kills: AtomicUsize,
    triggers: Mutex<Vec<RunRequest>>,
    next_pid: AtomicUsize,
}

impl FakeRunner {
    pub fn new(options: FakeRunnerOptions) -> Self {
        let runner = Self::default();
        *runner.inner.options.lock().unwrap() = options;
        runner
    }

    /// Results reported for every matching run.
    pub fn with_results(self, results: Vec<TestResult>) -> Self {
        *self.inner.script.lock().unwrap() = results;
        self
    }

    pub fn set_options(&self, options: FakeRunnerOptions) {
        *self.inner.options.lock().unwrap() = options;
    }

    pub fn launches(&self) -> usize {
        self.inner.launches.load(Ordering::SeqCst)
    }

    pub fn kills(&self) -> usize {
        self.inner.kills.load(Ordering::SeqCst)
    }

    pub fn triggers(&self) -> Vec<RunRequest> {
        self.inner.triggers.lock().unwrap().clone()
    }

    /// Make the currently running fake process exit with code 1.
    pub fn crash(&self) {
        if let Some(crash) = self.inner.crash.lock().unwrap().as_ref() {
            crash.notify_one();
        }
    }

    /// Write a raw event to the open connection.
    pub async fn send(&self, kind: EventKind, payload: Value) -> anyhow::Result<()> {
        send_event(&self.inner, kind, payload).await
    }

    fn options(&self) -> FakeRunnerOptions {
        self.inner.options.lock().unwrap().clone()
    }
}

impl ProcessLauncher for FakeRunner {
    fn launch(&self, spec: LaunchSpec) -> Result<LaunchedProcess> {
        let event_port = spec
            .env_port(EVENT_PORT_ENV)
            .ok_or_else(|| RunbridgeError::LaunchFailed("no event port in environment".into()))?;
        let options = self.options();
        let pid = 1000 + self.inner.next_pid.fetch_add(1, Ordering::SeqCst) as u32;
        self.inner.launches.fetch_add(1, Ordering::SeqCst);

        let (cancel_tx, cancel_rx) = oneshot::channel::<()>();
        if options.exit_on_launch {
            let exit = ExitInfo { code: Some(2), killed: false };
            let execution = Execution::settled(ExecutionState::Ended(pid, exit));
            return Ok(LaunchedProcess::new(execution, cancel_tx));
        }

        let deferred = DeferredExecution::new();
        deferred.start(pid);
        let execution = deferred.execution();
        let crash = Arc::new(Notify::new());
        *self.inner.crash.lock().unwrap() = Some(Arc::clone(&crash));

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(err) = connect(&inner, event_port, !options.never_ready).await {
                tracing::warn!(error = %err, "fake runner failed to connect");
            }

            tokio::select! {
                _ = cancel_rx => {
                    inner.kills.fetch_add(1, Ordering::SeqCst);
                    inner.writer.lock().await.take();
                    deferred.end(ExitInfo { code: None, killed: true });
                }
                _ = crash.notified() => {
                    deferred.end(ExitInfo { code: Some(1), killed: false });
                    inner.writer.lock().await.take();
                }
            }
        });

        Ok(LaunchedProcess::new(execution, cancel_tx))
    }
}

impl RunTrigger for FakeRunner {
    fn trigger(
        &self,
        _server: &ServerStartInfo,
        request: RunRequest,
    ) -> Pin<Box<dyn Future<Output = Result<()>> + Send + '_>> {
        Box::pin(async move {
            self.inner.triggers.lock().unwrap().push(request.clone());
            let options = self.options();

            if options.crash_on_trigger {
                self.crash();
                return Ok(());
            }
            if let Some(message) = options.error_on_trigger {
                send_event(&self.inner, EventKind::Error, json!(message)).await?;
                return Ok(());
            }

            let grep = request.grep_pattern();
            let pattern = if grep.is_empty() {
                None
            } else {
                Some(regex::Regex::new(&grep).map_err(anyhow::Error::from)?)
            };
            let results: Vec<TestResult> = self
                .inner
                .script
                .lock()
                .unwrap()
                .iter()
                .filter(|r| request.mode == RunMode::Discover || pattern.as_ref().is_none_or(|p| p.is_match(&r.full_name)))
                .cloned()
                .collect();

            send_event(&self.inner, EventKind::RunStart, json!({"total": results.len()})).await?;
            for result in results {
                if let Some(delay) = options.event_delay {
                    tokio::time::sleep(delay).await;
                }
                let payload = serde_json::to_value(&result).map_err(anyhow::Error::from)?;
                send_event(&self.inner, EventKind::SpecComplete, payload).await?;
            }
            if !options.skip_run_complete {
                send_event(&self.inner, EventKind::RunComplete, json!({})).await?;
            }
            Ok(())
        })
    }
}

async fn connect(inner: &Inner, port: u16, send_ready: bool) -> anyhow::Result<()> {
    let addr = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), port);
    let stream = TcpStream::connect(addr)
        .await
        .with_context(|| format!("connecting to event port {port}"))?;
    let (_read, write) = stream.into_split();
    *inner.writer.lock().await = Some(write);

    if send_ready {
        send_event(inner, EventKind::Ready, Value::Null).await?;
    }
    Ok(())
}

async fn send_event(inner: &Inner, kind: EventKind, payload: Value) -> anyhow::Result<()> {
    let mut line = ChannelEvent::new(kind, payload).encode();
    line.push('\n');

    let mut writer = inner.writer.lock().await;
    let stream = writer.as_mut().ok_or_else(|| anyhow!("fake runner is not connected"))?;
    stream.write_all(line.as_bytes()).await?;
    stream.flush().await?;
    Ok(())
}
