use chrono::{DateTime, Utc};
use hive_core::{Finding, HiveConfig, HiveError, HiveResult, Subtask, SubtaskStatus};
use hive_ledger::{TaskLedger, TransitionExtra, WorkerRegistry};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// How a worker finished executing a subtask.
#[derive(Debug, Clone)]
pub enum ExecutionOutcome {
    /// Execution produced a validated result.
    Success(Finding),
    /// Execution failed with the given error message.
    Failure(String),
}

/// Grants exclusive, lease-bounded ownership of pending subtasks.
///
/// Claiming never blocks on another worker: each candidate is tried once via
/// the ledger's compare-and-swap and a lost race just moves the scan to the
/// next candidate. A worker finding nothing eligible is "nothing to do",
/// not an error.
pub struct ClaimArbiter {
    ledger: Arc<TaskLedger>,
    registry: Arc<WorkerRegistry>,
    config: HiveConfig,
}

impl ClaimArbiter {
    /// Creates an arbiter over the given ledger and registry.
    pub fn new(ledger: Arc<TaskLedger>, registry: Arc<WorkerRegistry>, config: HiveConfig) -> Self {
        Self {
            ledger,
            registry,
            config,
        }
    }

    /// Attempts to claim one pending subtask for `worker_id`.
    ///
    /// Scans eligible pending subtasks in priority-then-FIFO order and takes
    /// the first one whose Pending→Claimed CAS succeeds. Returns `None` when
    /// no eligible subtask exists or every candidate was raced away; a dead
    /// or departed worker also gets `None` and must rejoin.
    pub async fn try_claim(&self, worker_id: Uuid) -> HiveResult<Option<Subtask>> {
        let worker = match self.registry.get(worker_id).await {
            Ok(w) if w.is_live() => w,
            Ok(_) | Err(HiveError::NotFound(_)) => {
                warn!(worker_id = %worker_id, "claim attempt by dead or unknown worker");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        let candidates = self.ledger.list_pending(&worker.capabilities).await?;
        for candidate in candidates {
            let expiry = Utc::now() + self.config.lease_duration();
            match self
                .ledger
                .transition(
                    candidate.id,
                    SubtaskStatus::Pending,
                    SubtaskStatus::Claimed,
                    TransitionExtra::claim(worker_id, expiry),
                    &worker_id.to_string(),
                )
                .await
            {
                Ok(claimed) => {
                    self.registry.mark_busy(worker_id, claimed.id).await?;
                    info!(
                        subtask_id = %claimed.id,
                        worker_id = %worker_id,
                        "subtask claimed"
                    );
                    return Ok(Some(claimed));
                }
                // Another worker raced ahead; the candidate is no longer
                // Pending, so move on rather than retry it.
                Err(HiveError::StaleState { .. }) => continue,
                Err(e) => return Err(e),
            }
        }
        debug!(worker_id = %worker_id, "no eligible pending subtask");
        Ok(None)
    }

    /// Acknowledges that the claimant started executing: Claimed → InProgress.
    pub async fn start(&self, subtask_id: Uuid, worker_id: Uuid) -> HiveResult<Subtask> {
        let subtask = self.ledger.get(subtask_id).await?;
        if !subtask.held_by(worker_id, Utc::now()) {
            return Err(HiveError::NotClaimant {
                subtask: subtask_id,
                worker: worker_id,
            });
        }
        self.ledger
            .transition(
                subtask_id,
                SubtaskStatus::Claimed,
                SubtaskStatus::InProgress,
                TransitionExtra::none(),
                &worker_id.to_string(),
            )
            .await
            .map_err(|e| self.demote_stale(e, subtask_id, worker_id))
    }

    /// Extends the caller's lease. Fails with [`HiveError::NotClaimant`]
    /// once the lease expired or the subtask was reassigned or cancelled.
    pub async fn renew_lease(
        &self,
        subtask_id: Uuid,
        worker_id: Uuid,
    ) -> HiveResult<DateTime<Utc>> {
        let subtask = self.ledger.get(subtask_id).await?;
        if !subtask.held_by(worker_id, Utc::now()) {
            return Err(HiveError::NotClaimant {
                subtask: subtask_id,
                worker: worker_id,
            });
        }
        let expiry = Utc::now() + self.config.lease_duration();
        self.ledger
            .transition(
                subtask_id,
                subtask.status,
                subtask.status,
                TransitionExtra::renew(expiry),
                &worker_id.to_string(),
            )
            .await
            .map_err(|e| self.demote_stale(e, subtask_id, worker_id))?;
        Ok(expiry)
    }

    /// Releases a claim with its outcome.
    ///
    /// Success transitions to Succeeded with the finding recorded. Failure
    /// charges one retry and requeues the subtask as Pending, or transitions
    /// it to permanently Failed once the budget is spent. Only the recorded
    /// claimant may release; a repeated release fails with
    /// [`HiveError::NotClaimant`] because the claim is already gone.
    pub async fn release(
        &self,
        subtask_id: Uuid,
        worker_id: Uuid,
        outcome: ExecutionOutcome,
    ) -> HiveResult<Subtask> {
        let subtask = self.ledger.get(subtask_id).await?;
        if !subtask.status.is_leased() || subtask.claimant != Some(worker_id) {
            return Err(HiveError::NotClaimant {
                subtask: subtask_id,
                worker: worker_id,
            });
        }

        let released = match outcome {
            ExecutionOutcome::Success(finding) => self
                .ledger
                .transition(
                    subtask_id,
                    subtask.status,
                    SubtaskStatus::Succeeded,
                    TransitionExtra::succeed(finding),
                    &worker_id.to_string(),
                )
                .await
                .map_err(|e| self.demote_stale(e, subtask_id, worker_id))?,
            ExecutionOutcome::Failure(error) => {
                let exhausted = subtask.retry_count + 1 >= self.config.max_retries;
                let to = if exhausted {
                    SubtaskStatus::Failed
                } else {
                    SubtaskStatus::Pending
                };
                let mut extra = TransitionExtra::fail(error);
                extra.bump_retry = true;
                let released = self
                    .ledger
                    .transition(subtask_id, subtask.status, to, extra, &worker_id.to_string())
                    .await
                    .map_err(|e| self.demote_stale(e, subtask_id, worker_id))?;
                if exhausted {
                    warn!(
                        subtask_id = %subtask_id,
                        retries = released.retry_count,
                        "subtask failed permanently"
                    );
                } else {
                    info!(
                        subtask_id = %subtask_id,
                        retries = released.retry_count,
                        "subtask failed, requeued"
                    );
                }
                released
            }
        };

        self.registry.mark_idle(worker_id).await?;
        Ok(released)
    }

    /// A CAS loss inside a claimant-guarded operation means the claim was
    /// taken away between the read and the write.
    fn demote_stale(&self, e: HiveError, subtask: Uuid, worker: Uuid) -> HiveError {
        match e {
            HiveError::StaleState { .. } => HiveError::NotClaimant { subtask, worker },
            other => other,
        }
    }
}
