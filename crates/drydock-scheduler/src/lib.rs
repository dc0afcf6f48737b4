//! Build scheduling and queue management for Drydock.
//!
//! This crate is the serialization core of the server: named build-request
//! queues with priority and duplicate-handling semantics, the queue manager
//! that routes requests and enforces cross-queue locking, and the per-project
//! integrator loops that pull requests through to the build runner.

pub mod integrator;
pub mod interval;
pub mod manager;
pub mod queue;

pub use integrator::ProjectIntegrator;
pub use interval::IntervalTrigger;
pub use manager::QueueManager;
pub use queue::{BuildQueue, QueueItem};
