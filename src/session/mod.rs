// src/session/mod.rs

//! Correlation of per-test result events with an open run/discover request.
//!
//! - [`results`] defines the result payloads, emitted transitions and the
//!   snapshot produced when a session concludes.
//! - [`policy`] decides which statuses are streamed, parked or summarised.
//! - [`sink`] is where emitted transitions and summaries go.
//! - [`processor`] holds the `Idle -> Processing -> Concluded` state machine.

pub mod policy;
pub mod processor;
pub mod results;
pub mod sink;

pub use policy::{EmissionPolicy, ProcessingOptions};
pub use processor::{SessionConclusion, TestEventProcessor};
pub use results::{ProcessedResults, RunSummary, TestResult, TestTransition};
pub use sink::{ConsoleResultSink, ResultSink};
