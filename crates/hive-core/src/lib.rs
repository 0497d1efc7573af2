//! Core types and error definitions for the Hive task-distribution system.
//!
//! This crate provides the foundational types shared across all Hive crates:
//! the unified error enum, the request/subtask/worker data model, validated
//! result payloads, state-transition events, and runtime configuration.
//!
//! # Main types
//!
//! - [`HiveError`] — Unified error enum for all Hive subsystems.
//! - [`HiveResult`] — Convenience alias for `Result<T, HiveError>`.
//! - [`Request`] / [`Subtask`] — The units of work tracked by the ledger.
//! - [`WorkerRecord`] — A registered worker and its liveness state.
//! - [`Finding`] — A validated subtask result payload.
//! - [`StateEvent`] — A transition event published on the status feed.
//! - [`HiveConfig`] — Lease, heartbeat, retry, and aggregation tunables.

/// Runtime configuration (lease duration, heartbeat timeout, retries).
pub mod config;
/// State-transition events for the status feed.
pub mod event;
/// Validated result payloads and the assembled final report.
pub mod finding;
/// Requests, subtasks, and their lifecycle statuses.
pub mod task;
/// Worker records and liveness statuses.
pub mod worker;

use uuid::Uuid;

pub use config::{AggregationPolicy, HiveConfig};
pub use event::StateEvent;
pub use finding::{FinalReport, Finding, ReportEntry};
pub use task::{CapabilitySet, Request, RequestStatus, Subtask, SubtaskSpec, SubtaskStatus};
pub use worker::{WorkerRecord, WorkerStatus};

/// Top-level error type for the Hive system.
///
/// Transient coordination losses ([`HiveError::StaleState`],
/// [`HiveError::NotClaimant`]) are resolved locally by the caller re-reading
/// and retrying or moving on; permanent failures propagate up to the request.
#[derive(Debug, thiserror::Error)]
pub enum HiveError {
    /// A compare-and-swap transition lost a race: the entity's current
    /// status no longer matches the expected prior status.
    #[error("stale state for {id}: expected {expected}, found {actual}")]
    StaleState {
        /// The entity whose transition was rejected.
        id: Uuid,
        /// The status the caller expected.
        expected: String,
        /// The status actually recorded.
        actual: String,
    },

    /// The caller is no longer the recorded claimant of a subtask (the lease
    /// expired or the subtask was reassigned).
    #[error("worker {worker} is not the claimant of subtask {subtask}")]
    NotClaimant {
        /// The subtask whose claim was checked.
        subtask: Uuid,
        /// The worker that attempted the operation.
        worker: Uuid,
    },

    /// Worker-supplied execution logic failed. Recorded against the subtask
    /// and counted toward its retry budget.
    #[error("execution error: {0}")]
    Execution(String),

    /// A subtask exhausted its retry budget and is permanently failed.
    #[error("subtask {subtask} failed permanently after {retries} retries")]
    RetryExhausted {
        /// The permanently failed subtask.
        subtask: Uuid,
        /// Number of retries consumed.
        retries: u32,
    },

    /// A result payload failed schema validation at the boundary.
    #[error("invalid payload: {0}")]
    InvalidPayload(String),

    /// The referenced request, subtask, or worker does not exist.
    #[error("unknown entity: {0}")]
    NotFound(Uuid),

    /// The request was cancelled before it reached a result.
    #[error("request {0} was cancelled")]
    Cancelled(Uuid),

    /// The request did not complete within the caller's deadline.
    #[error("timed out waiting for request {0}")]
    Timeout(Uuid),

    /// The request finished in the Failed state.
    #[error("request {0} failed: {1}")]
    RequestFailed(Uuid, String),

    /// An error from the storage backend.
    #[error("store error: {0}")]
    Store(String),

    /// An error in configuration parsing or validation.
    #[error("config error: {0}")]
    Config(String),

    /// A JSON serialization or deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// A standard I/O error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A convenience `Result` alias using [`HiveError`].
pub type HiveResult<T> = Result<T, HiveError>;
