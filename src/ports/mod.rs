// src/ports/mod.rs

//! Port allocation for the runner's primary, event-channel and debug ports.
//!
//! - [`allocator`] probes for free ports and keeps them reserved until a
//!   caller-supplied release future settles.

pub mod allocator;

pub use allocator::PortAllocator;
