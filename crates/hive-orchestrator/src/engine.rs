use crate::aggregator::ResultAggregator;
use crate::arbiter::ClaimArbiter;
use crate::sweep::LeaseSweep;
use crate::worker::{Decomposer, Executor, Worker};
use chrono::Utc;
use hive_core::{
    CapabilitySet, FinalReport, HiveConfig, HiveError, HiveResult, Request, RequestStatus,
    StateEvent, SubtaskStatus,
};
use hive_ledger::{
    AuditTrail, CasStore, HeartbeatMonitor, StatusFeed, TaskLedger, TransitionExtra,
    WorkerRegistry,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Point-in-time view of a request's progress.
#[derive(Debug, Clone)]
pub struct RequestSnapshot {
    /// The request record.
    pub request: Request,
    /// Total subtasks in its decomposition.
    pub total: usize,
    /// Subtasks that reached a terminal status.
    pub settled: usize,
}

impl RequestSnapshot {
    /// Fraction of subtasks settled, in `[0, 1]`. A request with no
    /// subtasks yet reports zero progress.
    pub fn progress(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.settled as f64 / self.total as f64
        }
    }
}

/// Handles to the background maintenance loops.
pub struct MaintenanceHandles {
    /// The heartbeat monitor loop.
    pub monitor: JoinHandle<()>,
    /// The lease sweep loop.
    pub sweep: JoinHandle<()>,
}

impl MaintenanceHandles {
    /// Stops both loops.
    pub fn abort(&self) {
        self.monitor.abort();
        self.sweep.abort();
    }
}

/// Front door of the distribution core.
///
/// Owns the shared ledger, registry, arbiter, and aggregator, and drives a
/// request through its lifecycle: submit decomposes and enqueues, workers
/// claim and execute, the aggregator resolves, and `await_result` observes
/// the resolution on the status feed.
pub struct Orchestrator {
    config: HiveConfig,
    ledger: Arc<TaskLedger>,
    registry: Arc<WorkerRegistry>,
    arbiter: Arc<ClaimArbiter>,
    aggregator: Arc<ResultAggregator>,
    decomposer: Arc<dyn Decomposer>,
}

impl Orchestrator {
    /// Builds an orchestrator over `store` with the given decomposer.
    pub fn new(
        store: Arc<dyn CasStore>,
        decomposer: Arc<dyn Decomposer>,
        config: HiveConfig,
    ) -> Self {
        Self::with_audit(store, decomposer, Arc::new(AuditTrail::new()), config)
    }

    /// Builds an orchestrator with a caller-provided audit trail, e.g. one
    /// configured with a log directory.
    pub fn with_audit(
        store: Arc<dyn CasStore>,
        decomposer: Arc<dyn Decomposer>,
        audit: Arc<AuditTrail>,
        config: HiveConfig,
    ) -> Self {
        let feed = StatusFeed::new();
        let ledger = Arc::new(TaskLedger::new(store.clone(), audit, feed.clone()));
        let registry = Arc::new(WorkerRegistry::new(store, feed, config.clone()));
        let arbiter = Arc::new(ClaimArbiter::new(
            ledger.clone(),
            registry.clone(),
            config.clone(),
        ));
        let aggregator = Arc::new(ResultAggregator::new(
            ledger.clone(),
            config.aggregation_policy,
        ));
        Self {
            config,
            ledger,
            registry,
            arbiter,
            aggregator,
            decomposer,
        }
    }

    /// The shared task ledger.
    pub fn ledger(&self) -> &Arc<TaskLedger> {
        &self.ledger
    }

    /// The worker registry.
    pub fn registry(&self) -> &Arc<WorkerRegistry> {
        &self.registry
    }

    /// The claim arbiter.
    pub fn arbiter(&self) -> &Arc<ClaimArbiter> {
        &self.arbiter
    }

    /// The result aggregator.
    pub fn aggregator(&self) -> &Arc<ResultAggregator> {
        &self.aggregator
    }

    /// Submits a request: records it, decomposes it, enqueues the subtasks,
    /// and opens it for claiming. Returns the request id.
    ///
    /// `priority` is clamped into `1..=10`. A decomposer returning no
    /// subtasks fails the submission with [`HiveError::InvalidPayload`].
    pub async fn submit(&self, text: impl Into<String>, priority: u8) -> HiveResult<Uuid> {
        let text = text.into();
        let request = Request::new(text.clone(), priority);
        let request_id = request.id;
        self.ledger.create_request(request).await?;

        let specs = match self.decomposer.decompose(&text).await {
            Ok(specs) if specs.is_empty() => {
                let err = HiveError::InvalidPayload("decomposition produced no subtasks".into());
                self.fail_submission(request_id, RequestStatus::Pending, &err).await;
                return Err(err);
            }
            Ok(specs) => specs,
            Err(e) => {
                self.fail_submission(request_id, RequestStatus::Pending, &e).await;
                return Err(e);
            }
        };

        let count = specs.len();
        if let Err(e) = self.ledger.enqueue(request_id, specs).await {
            // Enqueue fails before its Pending → Decomposed swap takes.
            self.fail_submission(request_id, RequestStatus::Pending, &e).await;
            return Err(e);
        }
        if let Err(e) = self
            .ledger
            .transition_request(
                request_id,
                RequestStatus::Decomposed,
                RequestStatus::InProgress,
                None,
            )
            .await
        {
            self.fail_submission(request_id, RequestStatus::Decomposed, &e).await;
            return Err(e);
        }
        info!(request_id = %request_id, subtasks = count, "request submitted");
        Ok(request_id)
    }

    /// A submission that cannot open for claiming must not leave the record
    /// stranded non-terminal, or `await_result` on it could only time out.
    async fn fail_submission(&self, request_id: Uuid, from: RequestStatus, err: &HiveError) {
        warn!(request_id = %request_id, error = %err, "submission failed");
        if let Err(e) = self
            .ledger
            .transition_request(request_id, from, RequestStatus::Failed, None)
            .await
        {
            warn!(request_id = %request_id, error = %e, "could not fail request record");
        }
    }

    /// Waits until the request resolves or `timeout` elapses.
    ///
    /// Returns the final report on completion; a failed request surfaces as
    /// [`HiveError::RequestFailed`], a cancelled one as
    /// [`HiveError::Cancelled`], and the deadline as [`HiveError::Timeout`].
    pub async fn await_result(&self, request_id: Uuid, timeout: Duration) -> HiveResult<FinalReport> {
        // Subscribe before the status check so a resolution landing in
        // between is not missed.
        let events = self.ledger.feed().subscribe();
        let request = self.ledger.get_request(request_id).await?;
        if request.status.is_terminal() {
            return self.resolve(request);
        }

        match tokio::time::timeout(timeout, self.wait_terminal(request_id, events)).await {
            Ok(request) => self.resolve(request?),
            Err(_) => Err(HiveError::Timeout(request_id)),
        }
    }

    async fn wait_terminal(
        &self,
        request_id: Uuid,
        mut events: broadcast::Receiver<StateEvent>,
    ) -> HiveResult<Request> {
        loop {
            match events.recv().await {
                Ok(StateEvent::Request { id, to, .. }) if id == request_id && to.is_terminal() => {
                    return self.ledger.get_request(request_id).await;
                }
                Ok(_) => {}
                // Fell behind the feed; the resolution may be among the
                // dropped events, so re-read.
                Err(broadcast::error::RecvError::Lagged(_)) => {
                    let request = self.ledger.get_request(request_id).await?;
                    if request.status.is_terminal() {
                        return Ok(request);
                    }
                }
                Err(broadcast::error::RecvError::Closed) => {
                    return self.ledger.get_request(request_id).await;
                }
            }
        }
    }

    fn resolve(&self, request: Request) -> HiveResult<FinalReport> {
        match request.status {
            RequestStatus::Completed => request.final_report.ok_or_else(|| {
                HiveError::Store(format!("completed request {} has no report", request.id))
            }),
            RequestStatus::Failed => {
                let reason = request.final_report.as_ref().map_or_else(
                    || "decomposition failed".to_string(),
                    |r| format!("{} of {} subtasks failed", r.failed, r.entries.len()),
                );
                Err(HiveError::RequestFailed(request.id, reason))
            }
            RequestStatus::Cancelled => Err(HiveError::Cancelled(request.id)),
            other => Err(HiveError::StaleState {
                id: request.id,
                expected: "terminal".to_string(),
                actual: other.to_string(),
            }),
        }
    }

    /// Cancels a request and all of its unfinished subtasks.
    ///
    /// Already-terminal subtasks keep their outcomes. In-flight claimants
    /// discover the cancellation on their next lease renewal or release,
    /// which fails with [`HiveError::NotClaimant`].
    pub async fn cancel(&self, request_id: Uuid) -> HiveResult<()> {
        let request = self.ledger.get_request(request_id).await?;
        if request.status.is_terminal() {
            return Err(HiveError::StaleState {
                id: request_id,
                expected: "non-terminal".to_string(),
                actual: request.status.to_string(),
            });
        }
        self.ledger
            .transition_request(request_id, request.status, RequestStatus::Cancelled, None)
            .await?;

        for subtask in self.ledger.list_request_subtasks(request_id).await? {
            if subtask.status.is_terminal() {
                continue;
            }
            let mut extra = TransitionExtra::none();
            extra.clear_claim = true;
            match self
                .ledger
                .transition(
                    subtask.id,
                    subtask.status,
                    SubtaskStatus::Cancelled,
                    extra,
                    "orchestrator",
                )
                .await
            {
                Ok(_) => {}
                // The subtask moved under us; the request is already
                // Cancelled, so a late release fails and nothing leaks.
                Err(HiveError::StaleState { .. }) => {
                    debug!(subtask_id = %subtask.id, "cancel raced a transition, skipped");
                }
                Err(e) => return Err(e),
            }
        }
        info!(request_id = %request_id, "request cancelled");
        Ok(())
    }

    /// Snapshot of a request and its subtask progress.
    pub async fn status(&self, request_id: Uuid) -> HiveResult<RequestSnapshot> {
        let request = self.ledger.get_request(request_id).await?;
        let subtasks = self.ledger.list_request_subtasks(request_id).await?;
        let settled = subtasks.iter().filter(|s| s.status.is_terminal()).count();
        Ok(RequestSnapshot {
            request,
            total: subtasks.len(),
            settled,
        })
    }

    /// Starts the heartbeat monitor and lease sweep, wired so that a worker
    /// death triggers an eager reclaim pass.
    pub fn start_maintenance(&self) -> MaintenanceHandles {
        let (monitor, dead_rx) = HeartbeatMonitor::new(self.registry.clone());
        let sweep = LeaseSweep::new(
            self.ledger.clone(),
            self.registry.clone(),
            self.aggregator.clone(),
            self.config.clone(),
            dead_rx,
        );
        MaintenanceHandles {
            monitor: monitor.start(),
            sweep: sweep.start(),
        }
    }

    /// Registers a worker with `capabilities` and starts its loop around
    /// `executor`. Returns the worker id and its join handle.
    pub async fn spawn_worker(
        &self,
        capabilities: CapabilitySet,
        executor: Arc<dyn Executor>,
        poll_interval: Duration,
        shutdown: watch::Receiver<bool>,
    ) -> HiveResult<(Uuid, JoinHandle<()>)> {
        let id = self.registry.join(capabilities).await?;
        let worker = Worker::new(
            id,
            self.arbiter.clone(),
            self.registry.clone(),
            self.aggregator.clone(),
            executor,
            self.config.clone(),
            poll_interval,
        );
        Ok((id, worker.run(shutdown)))
    }

    /// Timestamped one-line summary of system health for logs.
    pub async fn health_line(&self) -> HiveResult<String> {
        let live = self.registry.live_workers().await?.len();
        let leased = self.ledger.list_leased().await?.len();
        Ok(format!(
            "{} live_workers={live} leased_subtasks={leased}",
            Utc::now().to_rfc3339()
        ))
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use hive_core::SubtaskSpec;
    use hive_ledger::MemoryStore;

    struct SplitDecomposer;

    #[async_trait]
    impl Decomposer for SplitDecomposer {
        async fn decompose(&self, request_text: &str) -> HiveResult<Vec<SubtaskSpec>> {
            Ok(request_text
                .split(';')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(SubtaskSpec::new)
                .collect())
        }
    }

    fn orchestrator() -> Orchestrator {
        Orchestrator::new(
            Arc::new(MemoryStore::new()),
            Arc::new(SplitDecomposer),
            HiveConfig::default(),
        )
    }

    #[tokio::test]
    async fn test_submit_decomposes_and_opens_request() {
        let orch = orchestrator();
        let id = orch.submit("step one; step two; step three", 7).await.unwrap();

        let snapshot = orch.status(id).await.unwrap();
        assert_eq!(snapshot.request.status, RequestStatus::InProgress);
        assert_eq!(snapshot.total, 3);
        assert_eq!(snapshot.settled, 0);
        assert!((snapshot.progress() - 0.0).abs() < f64::EPSILON);
        assert_eq!(snapshot.request.priority, 7);
    }

    #[tokio::test]
    async fn test_submit_rejects_empty_decomposition() {
        let orch = orchestrator();
        let err = orch.submit("   ", 5).await.unwrap_err();
        assert!(matches!(err, HiveError::InvalidPayload(_)));
    }

    /// Delegates to a `MemoryStore` but fails selected operations.
    struct FaultyStore {
        inner: MemoryStore,
        fail_sequence: bool,
        fail_open: bool,
    }

    impl FaultyStore {
        fn new(fail_sequence: bool, fail_open: bool) -> Self {
            Self {
                inner: MemoryStore::new(),
                fail_sequence,
                fail_open,
            }
        }
    }

    #[async_trait]
    impl hive_ledger::CasStore for FaultyStore {
        async fn insert_request(&self, request: hive_core::Request) -> HiveResult<()> {
            self.inner.insert_request(request).await
        }
        async fn get_request(&self, id: Uuid) -> HiveResult<Option<hive_core::Request>> {
            self.inner.get_request(id).await
        }
        async fn cas_request(
            &self,
            expected: RequestStatus,
            updated: hive_core::Request,
        ) -> HiveResult<bool> {
            if self.fail_open && updated.status == RequestStatus::InProgress {
                return Err(HiveError::Store("disk full".into()));
            }
            self.inner.cas_request(expected, updated).await
        }
        async fn insert_subtask(&self, subtask: hive_core::Subtask) -> HiveResult<()> {
            self.inner.insert_subtask(subtask).await
        }
        async fn get_subtask(&self, id: Uuid) -> HiveResult<Option<hive_core::Subtask>> {
            self.inner.get_subtask(id).await
        }
        async fn list_subtasks(&self) -> HiveResult<Vec<hive_core::Subtask>> {
            self.inner.list_subtasks().await
        }
        async fn list_request_subtasks(
            &self,
            request_id: Uuid,
        ) -> HiveResult<Vec<hive_core::Subtask>> {
            self.inner.list_request_subtasks(request_id).await
        }
        async fn cas_subtask(
            &self,
            expected: SubtaskStatus,
            updated: hive_core::Subtask,
        ) -> HiveResult<bool> {
            self.inner.cas_subtask(expected, updated).await
        }
        async fn insert_worker(&self, worker: hive_core::WorkerRecord) -> HiveResult<()> {
            self.inner.insert_worker(worker).await
        }
        async fn get_worker(&self, id: Uuid) -> HiveResult<Option<hive_core::WorkerRecord>> {
            self.inner.get_worker(id).await
        }
        async fn list_workers(&self) -> HiveResult<Vec<hive_core::WorkerRecord>> {
            self.inner.list_workers().await
        }
        async fn cas_worker(
            &self,
            expected: hive_core::WorkerStatus,
            updated: hive_core::WorkerRecord,
        ) -> HiveResult<bool> {
            self.inner.cas_worker(expected, updated).await
        }
        async fn remove_worker(&self, id: Uuid) -> HiveResult<bool> {
            self.inner.remove_worker(id).await
        }
        async fn next_sequence(&self) -> HiveResult<u64> {
            if self.fail_sequence {
                return Err(HiveError::Store("disk full".into()));
            }
            self.inner.next_sequence().await
        }
    }

    /// Waits for the Failed request event and returns the request id.
    async fn failed_request_id(
        events: &mut tokio::sync::broadcast::Receiver<hive_core::StateEvent>,
    ) -> Uuid {
        loop {
            match events.recv().await.unwrap() {
                hive_core::StateEvent::Request { id, to, .. } if to == RequestStatus::Failed => {
                    return id;
                }
                _ => {}
            }
        }
    }

    #[tokio::test]
    async fn test_failed_enqueue_leaves_request_terminal() {
        let orch = Orchestrator::new(
            Arc::new(FaultyStore::new(true, false)),
            Arc::new(SplitDecomposer),
            HiveConfig::default(),
        );
        let mut events = orch.ledger().feed().subscribe();
        let err = orch.submit("a; b", 5).await.unwrap_err();
        assert!(matches!(err, HiveError::Store(_)));

        // The stranded record was failed, not left Pending forever: awaiting
        // it resolves instead of timing out.
        let request_id = failed_request_id(&mut events).await;
        let err = orch
            .await_result(request_id, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::RequestFailed(..)));
    }

    #[tokio::test]
    async fn test_failed_open_leaves_request_terminal() {
        let store = Arc::new(FaultyStore::new(false, true));
        let orch = Orchestrator::new(store, Arc::new(SplitDecomposer), HiveConfig::default());
        let mut events = orch.ledger().feed().subscribe();
        let err = orch.submit("a; b", 5).await.unwrap_err();
        assert!(matches!(err, HiveError::Store(_)));

        // Enqueue succeeded, opening failed: the record fails from Decomposed.
        let request_id = failed_request_id(&mut events).await;
        let request = orch.ledger().get_request(request_id).await.unwrap();
        assert_eq!(request.status, RequestStatus::Failed);
        assert!(request.completed_at.is_some());
    }

    #[tokio::test]
    async fn test_await_result_times_out() {
        let orch = orchestrator();
        let id = orch.submit("never claimed", 5).await.unwrap();
        let err = orch
            .await_result(id, Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::Timeout(_)));
    }

    #[tokio::test]
    async fn test_await_result_on_already_resolved_request() {
        let orch = orchestrator();
        let id = orch.submit("one step", 5).await.unwrap();
        orch.cancel(id).await.unwrap();

        let err = orch
            .await_result(id, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::Cancelled(_)));
    }

    #[tokio::test]
    async fn test_cancel_clears_unfinished_subtasks() {
        let orch = orchestrator();
        let id = orch.submit("a; b", 5).await.unwrap();
        orch.cancel(id).await.unwrap();

        let subtasks = orch.ledger().list_request_subtasks(id).await.unwrap();
        assert_eq!(subtasks.len(), 2);
        assert!(subtasks
            .iter()
            .all(|s| s.status == SubtaskStatus::Cancelled));

        // A second cancel is rejected: the request is already terminal.
        let err = orch.cancel(id).await.unwrap_err();
        assert!(matches!(err, HiveError::StaleState { .. }));
    }

    #[tokio::test]
    async fn test_cancelled_claim_discovered_on_release() {
        let orch = orchestrator();
        let id = orch.submit("long running step", 5).await.unwrap();
        let worker = orch.registry().join(CapabilitySet::new()).await.unwrap();
        let claimed = orch.arbiter().try_claim(worker).await.unwrap().unwrap();

        orch.cancel(id).await.unwrap();

        let finding = hive_core::Finding::new("late", serde_json::Value::Null, 1.0).unwrap();
        let err = orch
            .arbiter()
            .release(
                claimed.id,
                worker,
                crate::arbiter::ExecutionOutcome::Success(finding),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, HiveError::NotClaimant { .. }));
    }

    #[tokio::test]
    async fn test_health_line_reports_counts() {
        let orch = orchestrator();
        orch.registry().join(CapabilitySet::new()).await.unwrap();
        let line = orch.health_line().await.unwrap();
        assert!(line.contains("live_workers=1"));
        assert!(line.contains("leased_subtasks=0"));
    }
}
