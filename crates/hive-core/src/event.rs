use crate::task::{RequestStatus, SubtaskStatus};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A state transition published on the status feed.
///
/// Dashboards and notification layers subscribe to this stream; the core
/// never depends on anyone listening.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum StateEvent {
    /// A subtask moved between lifecycle statuses.
    Subtask {
        /// The subtask that transitioned.
        id: Uuid,
        /// Its parent request.
        request_id: Uuid,
        /// Status before the transition.
        from: SubtaskStatus,
        /// Status after the transition.
        to: SubtaskStatus,
        /// Who performed the transition (worker id, "sweep", "orchestrator").
        actor: String,
        /// Transition time.
        at: DateTime<Utc>,
    },
    /// A request moved between lifecycle statuses.
    Request {
        /// The request that transitioned.
        id: Uuid,
        /// Status before the transition.
        from: RequestStatus,
        /// Status after the transition.
        to: RequestStatus,
        /// Transition time.
        at: DateTime<Utc>,
    },
    /// A worker joined the registry.
    WorkerJoined {
        /// The new worker.
        id: Uuid,
        /// Join time.
        at: DateTime<Utc>,
    },
    /// A worker was declared dead by the heartbeat monitor.
    WorkerDead {
        /// The dead worker.
        id: Uuid,
        /// Detection time.
        at: DateTime<Utc>,
    },
    /// A worker left the registry voluntarily.
    WorkerLeft {
        /// The departed worker.
        id: Uuid,
        /// Departure time.
        at: DateTime<Utc>,
    },
}

impl StateEvent {
    /// The request this event concerns, when it concerns one.
    pub fn request_id(&self) -> Option<Uuid> {
        match self {
            Self::Subtask { request_id, .. } => Some(*request_id),
            Self::Request { id, .. } => Some(*id),
            _ => None,
        }
    }
}
