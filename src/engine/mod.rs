// src/engine/mod.rs

//! Orchestration engine for runbridge.
//!
//! This module ties together:
//! - the test server lifecycle and caller-visible actions ([`manager`])
//! - the handler table routing runner events into the processor
//!   ([`handlers`])
//! - target deduplication and result-to-tree mapping ([`targets`], [`tree`])
//! - user-facing notifications ([`notify`])

pub mod handlers;
pub mod manager;
pub mod notify;
pub mod state;
pub mod targets;
pub mod tree;

pub use handlers::build_handler_table;
pub use manager::{ManagerConfig, ManagerDeps, TestManager};
pub use notify::{NotificationLevel, NotificationSink, TracingNotifier};
pub use state::{ServerPhase, ServerStartInfo};
pub use targets::{TestTarget, dedup_targets};
pub use tree::{
    NoLocator, SourceLocation, SuiteTreeMapper, TestLocator, TestNode, TestTree, TestTreeMapper,
};
