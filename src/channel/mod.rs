// src/channel/mod.rs

//! Inbound event channel from the test-runner process.
//!
//! The runner connects to a local TCP port and writes newline-delimited JSON
//! objects of the form `{"event": "<name>", "payload": <json>}`.
//!
//! - [`events`] decodes lines into typed [`ChannelEvent`]s.
//! - [`dispatch`] routes events through a per-kind handler table and turns
//!   handler outcomes into connection status changes.
//! - [`listener`] owns the server socket, accepts the peer, and reports the
//!   connection lifecycle as an [`Execution`](crate::execution::Execution).

pub mod dispatch;
pub mod events;
pub mod listener;

pub use dispatch::{ConnectionStatus, DisconnectReason, HandlerTable};
pub use events::{ChannelEvent, EventKind};
pub use listener::{EventChannelListener, ListenerOptions};
