use crate::finding::{FinalReport, Finding};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use uuid::Uuid;

/// A set of capability tags. `BTreeSet` keeps serialization deterministic.
pub type CapabilitySet = BTreeSet<String>;

/// Status of a top-level request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    /// Submitted, not yet decomposed.
    Pending,
    /// Decomposition produced subtasks, none enqueued yet.
    Decomposed,
    /// Subtasks enqueued and being worked.
    InProgress,
    /// Every subtask succeeded (or best-effort aggregation closed the set).
    Completed,
    /// A subtask failed permanently under fail-fast aggregation.
    Failed,
    /// Cancelled by the caller before completion.
    Cancelled,
}

impl RequestStatus {
    /// Whether this status is terminal. Terminal requests never transition again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl std::fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Decomposed => "decomposed",
            Self::InProgress => "in_progress",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// Status of a subtask in the distribution lifecycle.
///
/// `Abandoned` is transient: the lease sweep moves an abandoned subtask back
/// to `Pending` (or to `Failed` once its retry budget is spent) in the same
/// pass that abandons it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubtaskStatus {
    /// Enqueued and claimable.
    Pending,
    /// A worker holds the lease but has not acknowledged starting.
    Claimed,
    /// The claimant acknowledged and is executing.
    InProgress,
    /// Released with a result payload.
    Succeeded,
    /// Failed permanently (execution error past the retry budget).
    Failed,
    /// The lease expired or the claimant died; about to become Pending again.
    Abandoned,
    /// The parent request was cancelled.
    Cancelled,
}

impl SubtaskStatus {
    /// Whether this status is terminal for aggregation purposes.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Succeeded | Self::Failed | Self::Cancelled)
    }

    /// Whether a live lease may exist in this status.
    pub fn is_leased(self) -> bool {
        matches!(self, Self::Claimed | Self::InProgress)
    }
}

impl std::fmt::Display for SubtaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Claimed => "claimed",
            Self::InProgress => "in_progress",
            Self::Succeeded => "succeeded",
            Self::Failed => "failed",
            Self::Abandoned => "abandoned",
            Self::Cancelled => "cancelled",
        };
        write!(f, "{s}")
    }
}

/// A top-level request submitted by a human caller.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Unique request identifier.
    pub id: Uuid,
    /// The original request text.
    pub text: String,
    /// Priority in `1..=10`; higher claims first.
    pub priority: u8,
    /// Current lifecycle status.
    pub status: RequestStatus,
    /// Submission time.
    pub created_at: DateTime<Utc>,
    /// Time the request reached a terminal status.
    pub completed_at: Option<DateTime<Utc>>,
    /// The assembled result, present once the request is Completed
    /// (or Failed under best-effort partial reporting).
    pub final_report: Option<FinalReport>,
    /// Subtask ids in decomposition order. Used only for stable reporting.
    pub subtask_ids: Vec<Uuid>,
}

impl Request {
    /// Default priority for submissions that do not specify one.
    pub const DEFAULT_PRIORITY: u8 = 5;

    /// Creates a pending request. Priority is clamped to `1..=10`.
    pub fn new(text: impl Into<String>, priority: u8) -> Self {
        Self {
            id: Uuid::new_v4(),
            text: text.into(),
            priority: priority.clamp(1, 10),
            status: RequestStatus::Pending,
            created_at: Utc::now(),
            completed_at: None,
            final_report: None,
            subtask_ids: Vec::new(),
        }
    }
}

/// Description of a subtask to enqueue, as produced by a decomposer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskSpec {
    /// Human-readable description of the unit of work.
    pub description: String,
    /// Capability tags a worker must cover to claim this subtask.
    #[serde(default)]
    pub required_capabilities: CapabilitySet,
}

impl SubtaskSpec {
    /// Creates a spec with no capability requirements.
    pub fn new(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            required_capabilities: CapabilitySet::new(),
        }
    }

    /// Adds required capability tags.
    pub fn with_capabilities<I, S>(mut self, caps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.required_capabilities
            .extend(caps.into_iter().map(Into::into));
        self
    }
}

/// One unit of decomposed work, owned by the ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    /// Unique subtask identifier.
    pub id: Uuid,
    /// The parent request.
    pub request_id: Uuid,
    /// What the worker is asked to do.
    pub description: String,
    /// Capability tags a claimant must cover.
    pub required_capabilities: CapabilitySet,
    /// Current lifecycle status.
    pub status: SubtaskStatus,
    /// The worker currently holding the lease, if any.
    pub claimant: Option<Uuid>,
    /// Time the current claim was granted.
    pub claimed_at: Option<DateTime<Utc>>,
    /// Expiry of the current lease.
    pub lease_expiry: Option<DateTime<Utc>>,
    /// The recorded result, once released successfully.
    pub result: Option<Finding>,
    /// Message from the most recent execution failure.
    pub last_error: Option<String>,
    /// Number of times this subtask was retried after failure or abandonment.
    pub retry_count: u32,
    /// Priority inherited from the parent request.
    pub priority: u8,
    /// Enqueue sequence number; FIFO tiebreak within a priority band.
    pub sequence: u64,
    /// Enqueue time.
    pub enqueued_at: DateTime<Utc>,
}

impl Subtask {
    /// Creates a pending subtask from a spec.
    pub fn new(request_id: Uuid, spec: SubtaskSpec, priority: u8, sequence: u64) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_id,
            description: spec.description,
            required_capabilities: spec.required_capabilities,
            status: SubtaskStatus::Pending,
            claimant: None,
            claimed_at: None,
            lease_expiry: None,
            result: None,
            last_error: None,
            retry_count: 0,
            priority,
            sequence,
            enqueued_at: Utc::now(),
        }
    }

    /// Whether a worker with `caps` may claim this subtask: it must be
    /// pending and its required capabilities must be a subset of `caps`.
    pub fn eligible_for(&self, caps: &CapabilitySet) -> bool {
        self.status == SubtaskStatus::Pending && self.required_capabilities.is_subset(caps)
    }

    /// Whether the current lease has expired as of `now`.
    /// A subtask without a lease is never expired.
    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.status.is_leased() && self.lease_expiry.is_some_and(|exp| exp <= now)
    }

    /// Whether the recorded claimant is `worker` and the lease is still live.
    pub fn held_by(&self, worker: Uuid, now: DateTime<Utc>) -> bool {
        self.status.is_leased() && self.claimant == Some(worker) && !self.lease_expired(now)
    }
}
