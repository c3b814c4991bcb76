// src/channel/listener.rs

//! Single-peer TCP listener for runner events.

use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use futures::FutureExt;
use futures::future::{BoxFuture, Shared};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::dispatch::{ConnectionStatus, DisconnectReason, HandlerTable};
use super::events::ChannelEvent;
use crate::errors::{Result, RunbridgeError};
use crate::execution::{DeferredExecution, Execution, Failure};

/// Execution describing one connection session: starts when the peer sends
/// `ready`, ends when the peer goes away.
pub type ChannelExecution = Execution<(), DisconnectReason>;

#[derive(Debug, Clone)]
pub struct ListenerOptions {
    pub host: IpAddr,
    /// How long the peer may take to send `ready` after `open`.
    pub ready_timeout: Duration,
}

/// Accepts the runner's connection and feeds its events through a
/// [`HandlerTable`].
///
/// Only one connection session can be open at a time. A session may consist
/// of several transport streams ("sub-connections") from the same peer; the
/// session ends once the last of them closes.
pub struct EventChannelListener {
    options: ListenerOptions,
    handlers: Arc<HandlerTable>,
    active: Arc<Mutex<Option<Arc<ChannelSession>>>>,
    stopping: Mutex<Option<Shared<BoxFuture<'static, ()>>>>,
    next_session: AtomicU64,
}

impl std::fmt::Debug for EventChannelListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventChannelListener")
            .field("options", &self.options)
            .field("open", &self.is_open())
            .finish_non_exhaustive()
    }
}

struct ChannelSession {
    id: u64,
    port: u16,
    deferred: DeferredExecution<(), DisconnectReason>,
    handlers: Arc<HandlerTable>,
    accept_task: Mutex<Option<JoinHandle<()>>>,
    connections: Mutex<HashMap<u64, JoinHandle<()>>>,
    next_connection: AtomicU64,
}

impl EventChannelListener {
    pub fn new(options: ListenerOptions, handlers: HandlerTable) -> Self {
        Self {
            options,
            handlers: Arc::new(handlers),
            active: Arc::new(Mutex::new(None)),
            stopping: Mutex::new(None),
            next_session: AtomicU64::new(1),
        }
    }

    /// Whether a connection session is currently live.
    pub fn is_open(&self) -> bool {
        lock(&self.active)
            .as_ref()
            .is_some_and(|session| !session.deferred.is_done())
    }

    /// Bind `port` and wait for the runner to connect.
    ///
    /// Fails immediately with [`RunbridgeError::ConnectionAlreadyOpen`] if a
    /// previous session is still live. The returned execution starts when the
    /// peer sends `ready`; if that does not happen within the configured
    /// ready timeout, the start phase fails and the socket is released.
    pub fn open(&self, port: u16) -> Result<ChannelExecution> {
        let mut active = lock(&self.active);
        if active.as_ref().is_some_and(|s| !s.deferred.is_done()) {
            return Err(RunbridgeError::ConnectionAlreadyOpen);
        }

        let addr = SocketAddr::new(self.options.host, port);
        let std_listener = std::net::TcpListener::bind(addr).map_err(|e| {
            RunbridgeError::ConnectionFailed(format!("binding event channel on {addr}: {e}"))
        })?;
        std_listener.set_nonblocking(true)?;
        let listener = TcpListener::from_std(std_listener)?;

        let session = Arc::new(ChannelSession {
            id: self.next_session.fetch_add(1, Ordering::Relaxed),
            port,
            deferred: DeferredExecution::new(),
            handlers: Arc::clone(&self.handlers),
            accept_task: Mutex::new(None),
            connections: Mutex::new(HashMap::new()),
            next_connection: AtomicU64::new(1),
        });
        let execution = session.deferred.execution();

        let accept = tokio::spawn(accept_loop(listener, Arc::clone(&session)));
        *lock(&session.accept_task) = Some(accept);

        let timeout = self.options.ready_timeout;
        session.deferred.fail_if_not_started(
            timeout,
            Failure::error(format!(
                "test runner did not signal readiness on event port {port} within {timeout:?}"
            )),
        );

        // Tear the session down once it settles, however that happens.
        {
            let session = Arc::clone(&session);
            let slot = Arc::clone(&self.active);
            let done = execution.done();
            tokio::spawn(async move {
                done.await;
                session.close().await;
                let mut active = lock(&slot);
                if active.as_ref().is_some_and(|s| s.id == session.id) {
                    *active = None;
                }
                debug!(port = session.port, session = session.id, "event channel session closed");
            });
        }

        info!(port, session = session.id, "event channel listening");
        *active = Some(session);
        Ok(execution)
    }

    /// Drop every open sub-connection and close the server socket.
    ///
    /// Idempotent; concurrent callers share a single teardown.
    pub async fn stop(&self) {
        let teardown = {
            let mut stopping = lock(&self.stopping);
            match stopping.as_ref() {
                Some(in_flight) => in_flight.clone(),
                None => {
                    let session = lock(&self.active).take();
                    let fut = async move {
                        if let Some(session) = session {
                            debug!(port = session.port, session = session.id, "stopping event channel");
                            session.deferred.end(DisconnectReason::Stopped);
                            session.deferred.fail(Failure::cancelled("event channel stopped"));
                            session.close().await;
                        }
                    }
                    .boxed()
                    .shared();
                    *stopping = Some(fut.clone());
                    fut
                }
            }
        };

        teardown.clone().await;

        let mut stopping = lock(&self.stopping);
        if stopping.as_ref().is_some_and(|f| f.ptr_eq(&teardown)) {
            *stopping = None;
        }
    }
}

impl ChannelSession {
    fn handle_line(&self, line: &str) {
        let event = match ChannelEvent::decode(line) {
            Ok(event) => event,
            Err(err) => {
                self.handlers.report_error("<decode>", &err);
                return;
            }
        };

        debug!(event = %event.kind, session = self.id, "event received");

        match self.handlers.dispatch(&event) {
            Some(ConnectionStatus::Started) => {
                if self.deferred.start(()) {
                    info!(port = self.port, "test runner signalled readiness");
                }
            }
            Some(ConnectionStatus::Ended(reason)) => {
                self.deferred.end(reason);
            }
            Some(ConnectionStatus::Failed(failure)) => {
                warn!(port = self.port, reason = %failure, "event channel failed");
                self.deferred.fail(failure);
            }
            None => {}
        }
    }

    fn connection_closed(&self, conn_id: u64) {
        let remaining = {
            let mut conns = lock(&self.connections);
            conns.remove(&conn_id);
            conns.len()
        };
        debug!(session = self.id, conn_id, remaining, "event channel peer disconnected");

        if remaining > 0 {
            return;
        }
        if self.deferred.is_started() {
            self.deferred.end(DisconnectReason::PeerClosed);
        } else if !self.deferred.is_done() {
            debug!(session = self.id, "peer left before signalling readiness; still waiting");
        }
    }

    /// Abort the accept loop and every reader task.
    async fn close(&self) {
        let accept = lock(&self.accept_task).take();
        if let Some(handle) = accept {
            handle.abort();
            let _ = handle.await;
        }

        let readers: Vec<_> = lock(&self.connections).drain().map(|(_, h)| h).collect();
        for handle in readers {
            handle.abort();
            let _ = handle.await;
        }
    }
}

async fn accept_loop(listener: TcpListener, session: Arc<ChannelSession>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                let conn_id = session.next_connection.fetch_add(1, Ordering::Relaxed);
                debug!(%peer, session = session.id, conn_id, "event channel peer connected");

                // Hold the map lock across the spawn so the reader cannot
                // remove itself before it was inserted.
                let mut conns = lock(&session.connections);
                let handle = tokio::spawn(read_connection(stream, conn_id, Arc::clone(&session)));
                conns.insert(conn_id, handle);
            }
            Err(err) => {
                warn!(error = %err, session = session.id, "event channel accept failed");
                session
                    .deferred
                    .fail(Failure::error(format!("event channel accept failed: {err}")));
                return;
            }
        }
    }
}

async fn read_connection(stream: TcpStream, conn_id: u64, session: Arc<ChannelSession>) {
    let mut lines = BufReader::new(stream).lines();

    loop {
        match lines.next_line().await {
            Ok(Some(line)) => {
                if line.trim().is_empty() {
                    continue;
                }
                session.handle_line(&line);
            }
            Ok(None) => break,
            Err(err) => {
                debug!(session = session.id, conn_id, error = %err, "event channel read error");
                break;
            }
        }
    }

    session.connection_closed(conn_id);
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
