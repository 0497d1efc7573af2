use chrono::Utc;
use hive_core::{
    AggregationPolicy, FinalReport, HiveError, HiveResult, ReportEntry, RequestStatus, Subtask,
};
use hive_ledger::TaskLedger;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

/// Collects completed-subtask outputs and detects request completion.
///
/// Completion detection runs against the subtask set recorded at
/// decomposition time and finishes with a compare-and-swap on the request,
/// so concurrent finishers racing to detect "all done" produce exactly one
/// terminal transition.
pub struct ResultAggregator {
    ledger: Arc<TaskLedger>,
    policy: AggregationPolicy,
}

impl ResultAggregator {
    /// Creates an aggregator with the given policy, fixed for its lifetime.
    pub fn new(ledger: Arc<TaskLedger>, policy: AggregationPolicy) -> Self {
        Self { ledger, policy }
    }

    /// The policy this aggregator resolves failed subtasks with.
    pub fn policy(&self) -> AggregationPolicy {
        self.policy
    }

    /// Records that `subtask` succeeded and runs completion detection on its
    /// parent. Returns the final report if this call completed the request.
    pub async fn record_result(&self, subtask: &Subtask) -> HiveResult<Option<FinalReport>> {
        debug!(subtask_id = %subtask.id, request_id = %subtask.request_id, "result recorded");
        self.try_complete(subtask.request_id).await
    }

    /// Records that `subtask` failed permanently and runs completion
    /// detection on its parent.
    pub async fn record_failure(&self, subtask: &Subtask) -> HiveResult<Option<FinalReport>> {
        debug!(subtask_id = %subtask.id, request_id = %subtask.request_id, "permanent failure recorded");
        self.try_complete(subtask.request_id).await
    }

    /// Checks whether every subtask of `request_id` is terminal and, if so,
    /// assembles the report and transitions the request exactly once.
    ///
    /// Returns `None` when the set is still open or another finisher won the
    /// completion race.
    pub async fn try_complete(&self, request_id: Uuid) -> HiveResult<Option<FinalReport>> {
        let request = self.ledger.get_request(request_id).await?;
        if request.status.is_terminal() {
            return Ok(None);
        }

        // The set recorded at decomposition time, in decomposition order.
        let mut entries = Vec::with_capacity(request.subtask_ids.len());
        let mut succeeded = 0usize;
        let mut failed = 0usize;
        for subtask_id in &request.subtask_ids {
            let subtask = self.ledger.get(*subtask_id).await?;
            if !subtask.status.is_terminal() {
                return Ok(None);
            }
            match subtask.result {
                Some(_) => succeeded += 1,
                None => failed += 1,
            }
            entries.push(ReportEntry {
                subtask_id: subtask.id,
                description: subtask.description,
                finding: subtask.result,
            });
        }

        let report = FinalReport {
            request_id,
            entries,
            complete: failed == 0,
            succeeded,
            failed,
            generated_at: Utc::now(),
        };
        let to = if failed == 0 || self.policy == AggregationPolicy::BestEffort {
            RequestStatus::Completed
        } else {
            RequestStatus::Failed
        };

        match self
            .ledger
            .transition_request(request_id, request.status, to, Some(report.clone()))
            .await
        {
            Ok(_) => {
                info!(
                    request_id = %request_id,
                    %to,
                    succeeded,
                    failed,
                    "request resolved"
                );
                Ok(Some(report))
            }
            // Another finisher completed the request first.
            Err(HiveError::StaleState { .. }) => Ok(None),
            Err(e) => Err(e),
        }
    }
}
