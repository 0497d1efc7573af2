use crate::task::CapabilitySet;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Liveness status of a registered worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerStatus {
    /// Registered and heartbeating, no claim held.
    Idle,
    /// Holding a claim on a subtask.
    Busy,
    /// Missed heartbeats past the timeout; must rejoin to work again.
    Dead,
}

impl std::fmt::Display for WorkerStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Busy => "busy",
            Self::Dead => "dead",
        };
        write!(f, "{s}")
    }
}

/// A worker known to the registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerRecord {
    /// Unique worker identifier, assigned on join.
    pub id: Uuid,
    /// Capability tags this worker can cover.
    pub capabilities: CapabilitySet,
    /// Current liveness status.
    pub status: WorkerStatus,
    /// Time of the most recent heartbeat.
    pub last_heartbeat: DateTime<Utc>,
    /// The subtask this worker currently holds, if any.
    pub current_subtask: Option<Uuid>,
    /// Time the worker joined.
    pub joined_at: DateTime<Utc>,
}

impl WorkerRecord {
    /// Creates an idle worker record with a fresh id and heartbeat.
    pub fn new(capabilities: CapabilitySet) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            capabilities,
            status: WorkerStatus::Idle,
            last_heartbeat: now,
            current_subtask: None,
            joined_at: now,
        }
    }

    /// Whether the worker is still considered live.
    pub fn is_live(&self) -> bool {
        self.status != WorkerStatus::Dead
    }

    /// Whether the last heartbeat is older than `timeout` as of `now`.
    pub fn heartbeat_stale(&self, now: DateTime<Utc>, timeout: chrono::Duration) -> bool {
        now - self.last_heartbeat > timeout
    }
}
