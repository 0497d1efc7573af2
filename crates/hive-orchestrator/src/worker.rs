use crate::aggregator::ResultAggregator;
use crate::arbiter::{ClaimArbiter, ExecutionOutcome};
use async_trait::async_trait;
use hive_core::{Finding, HiveConfig, HiveError, HiveResult, Subtask, SubtaskSpec, SubtaskStatus};
use hive_ledger::WorkerRegistry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Splits a request into independently executable subtasks.
#[async_trait]
pub trait Decomposer: Send + Sync {
    /// Produces the subtask specs for `request_text`, in execution-report
    /// order. An empty decomposition is rejected by the orchestrator.
    async fn decompose(&self, request_text: &str) -> HiveResult<Vec<SubtaskSpec>>;
}

/// Executes one subtask and produces its finding.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Runs the subtask to completion. An `Err` is recorded as an execution
    /// failure and charged against the subtask's retry budget.
    async fn execute(&self, subtask: &Subtask) -> HiveResult<Finding>;
}

/// A claim-execute-release loop around an [`Executor`].
///
/// The worker heartbeats on its poll cadence while idle and keeps both its
/// heartbeat and its lease fresh while executing, so a subtask may honestly
/// run longer than the heartbeat timeout. A renewal rejected with
/// [`HiveError::NotClaimant`] means the lease was reclaimed or the subtask
/// cancelled; the in-flight execution is dropped and its result discarded.
pub struct Worker {
    id: Uuid,
    arbiter: Arc<ClaimArbiter>,
    registry: Arc<WorkerRegistry>,
    aggregator: Arc<ResultAggregator>,
    executor: Arc<dyn Executor>,
    config: HiveConfig,
    poll_interval: Duration,
}

/// What one pass of the worker loop did.
#[derive(Debug, PartialEq, Eq)]
pub enum WorkerPass {
    /// Nothing eligible to claim.
    Idle,
    /// A subtask was executed and released.
    Executed(Uuid),
    /// The claim was lost mid-execution and the work discarded.
    ClaimLost(Uuid),
}

impl Worker {
    /// Wraps an already-registered worker id in a runner loop.
    pub fn new(
        id: Uuid,
        arbiter: Arc<ClaimArbiter>,
        registry: Arc<WorkerRegistry>,
        aggregator: Arc<ResultAggregator>,
        executor: Arc<dyn Executor>,
        config: HiveConfig,
        poll_interval: Duration,
    ) -> Self {
        Self {
            id,
            arbiter,
            registry,
            aggregator,
            executor,
            config,
            poll_interval,
        }
    }

    /// This worker's registry id.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// One pass: claim, execute under lease renewal, release, and feed the
    /// aggregator.
    pub async fn run_once(&self) -> HiveResult<WorkerPass> {
        let Some(claimed) = self.arbiter.try_claim(self.id).await? else {
            return Ok(WorkerPass::Idle);
        };
        let subtask = match self.arbiter.start(claimed.id, self.id).await {
            Ok(subtask) => subtask,
            Err(HiveError::NotClaimant { .. }) => return self.concede(claimed.id).await,
            Err(e) => return Err(e),
        };

        let outcome = match self.execute_leased(&subtask).await {
            Some(outcome) => outcome,
            None => return self.concede(subtask.id).await,
        };

        let released = match self.arbiter.release(subtask.id, self.id, outcome).await {
            Ok(released) => released,
            // Cancelled or reclaimed between execution and release.
            Err(HiveError::NotClaimant { .. }) => return self.concede(subtask.id).await,
            Err(e) => return Err(e),
        };
        match released.status {
            SubtaskStatus::Succeeded => {
                self.aggregator.record_result(&released).await?;
            }
            SubtaskStatus::Failed => {
                self.aggregator.record_failure(&released).await?;
            }
            // Requeued for another attempt; nothing to aggregate yet.
            _ => {}
        }
        Ok(WorkerPass::Executed(released.id))
    }

    /// Gives up a lost claim: the sweep or a cancellation owns the subtask
    /// now, so any in-flight result is discarded.
    async fn concede(&self, subtask_id: Uuid) -> HiveResult<WorkerPass> {
        warn!(
            subtask_id = %subtask_id,
            worker_id = %self.id,
            "claim lost, result discarded"
        );
        self.registry.mark_idle(self.id).await?;
        Ok(WorkerPass::ClaimLost(subtask_id))
    }

    /// Runs the executor while keeping the worker live: every tick it
    /// heartbeats and renews the lease, ticking at half of whichever of the
    /// two deadlines is shorter. Returns `None` when the claim is lost
    /// before execution finishes.
    async fn execute_leased(&self, subtask: &Subtask) -> Option<ExecutionOutcome> {
        let lease_half = self
            .config
            .lease_duration()
            .to_std()
            .map_or(Duration::from_secs(1), |d| d / 2);
        let heartbeat_half = Duration::from_secs(self.config.heartbeat_timeout_secs) / 2;
        let keepalive_every = lease_half.min(heartbeat_half).max(Duration::from_millis(10));
        let mut ticker = tokio::time::interval(keepalive_every);
        // First tick fires immediately; skip it.
        ticker.tick().await;

        let execution = self.executor.execute(subtask);
        tokio::pin!(execution);
        loop {
            tokio::select! {
                result = &mut execution => {
                    return Some(match result {
                        Ok(finding) => ExecutionOutcome::Success(finding),
                        Err(e) => ExecutionOutcome::Failure(e.to_string()),
                    });
                }
                _ = ticker.tick() => {
                    match self.registry.heartbeat(self.id).await {
                        Ok(true) => {}
                        // Declared dead; the claim is forfeit either way.
                        Ok(false) => return None,
                        Err(e) => {
                            warn!(worker_id = %self.id, error = %e, "heartbeat failed mid-execution");
                            return None;
                        }
                    }
                    match self.arbiter.renew_lease(subtask.id, self.id).await {
                        Ok(expiry) => {
                            debug!(subtask_id = %subtask.id, %expiry, "lease renewed");
                        }
                        Err(HiveError::NotClaimant { .. }) => return None,
                        Err(e) => {
                            warn!(subtask_id = %subtask.id, error = %e, "lease renewal failed");
                            return None;
                        }
                    }
                }
            }
        }
    }

    /// Runs the worker loop until `shutdown` flips to `true`, then leaves
    /// the registry. Heartbeats on every pass.
    pub fn run(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            info!(worker_id = %self.id, "worker loop started");
            loop {
                if *shutdown.borrow() {
                    break;
                }
                match self.registry.heartbeat(self.id).await {
                    Ok(true) => {}
                    // Declared dead; this identity is done and must rejoin.
                    Ok(false) => {
                        warn!(worker_id = %self.id, "declared dead, stopping");
                        return;
                    }
                    Err(e) => {
                        warn!(worker_id = %self.id, error = %e, "heartbeat failed");
                        return;
                    }
                }

                match self.run_once().await {
                    Ok(WorkerPass::Idle) => {
                        tokio::select! {
                            _ = tokio::time::sleep(self.poll_interval) => {}
                            _ = shutdown.changed() => {}
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!(worker_id = %self.id, error = %e, "worker pass failed");
                        tokio::time::sleep(self.poll_interval).await;
                    }
                }
            }
            if let Err(e) = self.registry.leave(self.id).await {
                warn!(worker_id = %self.id, error = %e, "leave failed");
            }
            info!(worker_id = %self.id, "worker loop stopped");
        })
    }
}
