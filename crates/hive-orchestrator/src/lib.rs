//! Task distribution and claiming core for Hive.
//!
//! Sits on top of `hive-ledger` and turns its compare-and-swap transition
//! primitive into the full distribution lifecycle: the [`Orchestrator`]
//! decomposes submitted requests into subtasks, [`ClaimArbiter`] hands them
//! to workers under exclusive leases, [`Worker`] runs the claim-execute-
//! release loop around a caller-supplied [`Executor`], [`LeaseSweep`]
//! reclaims leases from crashed or stalled workers, and [`ResultAggregator`]
//! assembles the final report exactly once.

/// Result collection and exactly-once request completion.
pub mod aggregator;
/// Exclusive lease-bounded claiming.
pub mod arbiter;
/// The orchestrator front door.
pub mod engine;
/// Background lease reclaim.
pub mod sweep;
/// Worker loop and the decomposer/executor seams.
pub mod worker;

pub use aggregator::ResultAggregator;
pub use arbiter::{ClaimArbiter, ExecutionOutcome};
pub use engine::{MaintenanceHandles, Orchestrator, RequestSnapshot};
pub use sweep::LeaseSweep;
pub use worker::{Decomposer, Executor, Worker, WorkerPass};
