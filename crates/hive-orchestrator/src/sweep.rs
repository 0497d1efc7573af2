use crate::aggregator::ResultAggregator;
use chrono::Utc;
use hive_core::{HiveConfig, HiveError, HiveResult, SubtaskStatus};
use hive_ledger::{TaskLedger, TransitionExtra, WorkerRegistry};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

const ACTOR: &str = "sweep";

/// Background reclaim of leases whose holders died or stalled.
///
/// Runs on a timer and additionally wakes immediately when the heartbeat
/// monitor reports a newly dead worker, so that worker's claims requeue
/// without waiting out the full lease.
pub struct LeaseSweep {
    ledger: Arc<TaskLedger>,
    registry: Arc<WorkerRegistry>,
    aggregator: Arc<ResultAggregator>,
    config: HiveConfig,
    dead_rx: mpsc::UnboundedReceiver<Uuid>,
}

impl LeaseSweep {
    /// Creates a sweep fed by the heartbeat monitor's dead-worker channel.
    pub fn new(
        ledger: Arc<TaskLedger>,
        registry: Arc<WorkerRegistry>,
        aggregator: Arc<ResultAggregator>,
        config: HiveConfig,
        dead_rx: mpsc::UnboundedReceiver<Uuid>,
    ) -> Self {
        Self {
            ledger,
            registry,
            aggregator,
            config,
            dead_rx,
        }
    }

    /// One reclaim pass over every leased subtask. Returns the ids it
    /// reclaimed.
    pub async fn sweep_once(&self) -> HiveResult<Vec<Uuid>> {
        let mut reclaimed = Vec::new();

        for candidate in self.ledger.list_leased().await? {
            // Decide on a fresh read, not the snapshot: a renewal landing
            // after the snapshot keeps its lease.
            let subtask = match self.ledger.get(candidate.id).await {
                Ok(s) => s,
                Err(HiveError::NotFound(_)) => continue,
                Err(e) => return Err(e),
            };
            if !subtask.status.is_leased() {
                continue;
            }
            let holder_dead = match subtask.claimant {
                Some(worker) => self.registry.is_dead(worker).await?,
                // Leased without a claimant cannot happen via the ledger;
                // treat it as reclaimable rather than leak the lease.
                None => true,
            };
            if !holder_dead && !subtask.lease_expired(Utc::now()) {
                continue;
            }

            let abandoned = match self
                .ledger
                .transition(
                    subtask.id,
                    subtask.status,
                    SubtaskStatus::Abandoned,
                    TransitionExtra::reclaim(),
                    ACTOR,
                )
                .await
            {
                Ok(s) => s,
                // The holder finished (or another sweep won) in between.
                Err(HiveError::StaleState { .. }) => continue,
                Err(e) => return Err(e),
            };
            info!(
                subtask_id = %subtask.id,
                claimant = ?subtask.claimant,
                retry_count = abandoned.retry_count,
                "lease reclaimed"
            );
            reclaimed.push(subtask.id);

            if abandoned.retry_count >= self.config.max_retries {
                let failed = self
                    .ledger
                    .transition(
                        subtask.id,
                        SubtaskStatus::Abandoned,
                        SubtaskStatus::Failed,
                        TransitionExtra::fail(format!(
                            "retry budget exhausted after {} attempts",
                            abandoned.retry_count
                        )),
                        ACTOR,
                    )
                    .await?;
                warn!(subtask_id = %subtask.id, "subtask failed permanently");
                self.aggregator.record_failure(&failed).await?;
            } else {
                self.ledger
                    .transition(
                        subtask.id,
                        SubtaskStatus::Abandoned,
                        SubtaskStatus::Pending,
                        TransitionExtra::none(),
                        ACTOR,
                    )
                    .await?;
                debug!(subtask_id = %subtask.id, "subtask requeued");
            }
        }
        Ok(reclaimed)
    }

    /// Starts the periodic sweep. Abort the returned handle to stop it.
    pub fn start(mut self) -> JoinHandle<()> {
        let interval = self.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {}
                    dead = self.dead_rx.recv() => {
                        match dead {
                            Some(worker) => {
                                debug!(worker_id = %worker, "eager sweep for dead worker");
                            }
                            // Monitor gone; fall back to the timer alone.
                            None => {
                                ticker.tick().await;
                            }
                        }
                    }
                }
                if let Err(e) = self.sweep_once().await {
                    warn!(error = %e, "lease sweep failed");
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use hive_core::{AggregationPolicy, CapabilitySet, Request, RequestStatus, SubtaskSpec};
    use hive_ledger::{AuditTrail, CasStore, MemoryStore, StatusFeed};

    struct Fixture {
        ledger: Arc<TaskLedger>,
        registry: Arc<WorkerRegistry>,
        aggregator: Arc<ResultAggregator>,
        config: HiveConfig,
    }

    fn fixture(config: HiveConfig) -> Fixture {
        fixture_with_store(Arc::new(MemoryStore::new()), config)
    }

    fn fixture_with_store(store: Arc<dyn CasStore>, config: HiveConfig) -> Fixture {
        let feed = StatusFeed::new();
        let ledger = Arc::new(TaskLedger::new(
            store.clone(),
            Arc::new(AuditTrail::new()),
            feed.clone(),
        ));
        let registry = Arc::new(WorkerRegistry::new(store, feed, config.clone()));
        let aggregator = Arc::new(ResultAggregator::new(
            ledger.clone(),
            AggregationPolicy::FailFast,
        ));
        Fixture {
            ledger,
            registry,
            aggregator,
            config,
        }
    }

    fn sweep(f: &Fixture) -> LeaseSweep {
        let (_tx, dead_rx) = mpsc::unbounded_channel();
        LeaseSweep::new(
            f.ledger.clone(),
            f.registry.clone(),
            f.aggregator.clone(),
            f.config.clone(),
            dead_rx,
        )
    }

    async fn claimed_subtask(f: &Fixture, worker: Uuid, lease_secs: i64) -> Uuid {
        let request = Request::new("r", 5);
        let request_id = request.id;
        f.ledger.create_request(request).await.unwrap();
        let ids = f
            .ledger
            .enqueue(request_id, vec![SubtaskSpec::new("work")])
            .await
            .unwrap();
        f.ledger
            .transition_request(
                request_id,
                RequestStatus::Decomposed,
                RequestStatus::InProgress,
                None,
            )
            .await
            .unwrap();
        f.ledger
            .transition(
                ids[0],
                SubtaskStatus::Pending,
                SubtaskStatus::Claimed,
                TransitionExtra::claim(worker, Utc::now() + chrono::Duration::seconds(lease_secs)),
                &worker.to_string(),
            )
            .await
            .unwrap();
        ids[0]
    }

    #[tokio::test]
    async fn test_live_lease_untouched() {
        let f = fixture(HiveConfig::default());
        let worker = f.registry.join(CapabilitySet::new()).await.unwrap();
        let id = claimed_subtask(&f, worker, 60).await;

        assert!(sweep(&f).sweep_once().await.unwrap().is_empty());
        assert_eq!(
            f.ledger.get(id).await.unwrap().status,
            SubtaskStatus::Claimed
        );
    }

    #[tokio::test]
    async fn test_expired_lease_requeued_with_retry_charged() {
        let f = fixture(HiveConfig::default());
        let worker = f.registry.join(CapabilitySet::new()).await.unwrap();
        let id = claimed_subtask(&f, worker, -5).await;

        let reclaimed = sweep(&f).sweep_once().await.unwrap();
        assert_eq!(reclaimed, vec![id]);

        let subtask = f.ledger.get(id).await.unwrap();
        assert_eq!(subtask.status, SubtaskStatus::Pending);
        assert_eq!(subtask.retry_count, 1);
        assert!(subtask.claimant.is_none());
        assert!(subtask.lease_expiry.is_none());
    }

    #[tokio::test]
    async fn test_dead_worker_lease_reclaimed_before_expiry() {
        let f = fixture(HiveConfig::default());
        // Never joined, so the registry counts the claimant as dead.
        let ghost = Uuid::new_v4();
        let id = claimed_subtask(&f, ghost, 3600).await;

        let reclaimed = sweep(&f).sweep_once().await.unwrap();
        assert_eq!(reclaimed, vec![id]);
        assert_eq!(
            f.ledger.get(id).await.unwrap().status,
            SubtaskStatus::Pending
        );
    }

    #[tokio::test]
    async fn test_retry_exhaustion_fails_subtask_and_request() {
        let config = HiveConfig {
            max_retries: 2,
            ..HiveConfig::default()
        };
        let f = fixture(config);
        let ghost = Uuid::new_v4();
        let id = claimed_subtask(&f, ghost, -5).await;
        let request_id = f.ledger.get(id).await.unwrap().request_id;
        let s = sweep(&f);

        // First reclaim requeues.
        s.sweep_once().await.unwrap();
        assert_eq!(f.ledger.get(id).await.unwrap().status, SubtaskStatus::Pending);

        // Claim again and let it expire again; second reclaim exhausts.
        f.ledger
            .transition(
                id,
                SubtaskStatus::Pending,
                SubtaskStatus::Claimed,
                TransitionExtra::claim(ghost, Utc::now() - chrono::Duration::seconds(1)),
                &ghost.to_string(),
            )
            .await
            .unwrap();
        s.sweep_once().await.unwrap();

        let subtask = f.ledger.get(id).await.unwrap();
        assert_eq!(subtask.status, SubtaskStatus::Failed);
        assert_eq!(subtask.retry_count, 2);
        assert!(subtask.last_error.is_some());

        // Fail-fast aggregation resolved the parent.
        assert_eq!(
            f.ledger.get_request(request_id).await.unwrap().status,
            RequestStatus::Failed
        );
    }

    /// Delegates to a `MemoryStore` but reports every leased subtask with an
    /// expired lease in listings, modeling a renewal that lands between the
    /// sweep's snapshot and its reclaim decision.
    struct StaleSnapshotStore {
        inner: MemoryStore,
    }

    #[async_trait::async_trait]
    impl CasStore for StaleSnapshotStore {
        async fn insert_request(&self, request: Request) -> HiveResult<()> {
            self.inner.insert_request(request).await
        }
        async fn get_request(&self, id: Uuid) -> HiveResult<Option<Request>> {
            self.inner.get_request(id).await
        }
        async fn cas_request(&self, expected: RequestStatus, updated: Request) -> HiveResult<bool> {
            self.inner.cas_request(expected, updated).await
        }
        async fn insert_subtask(&self, subtask: hive_core::Subtask) -> HiveResult<()> {
            self.inner.insert_subtask(subtask).await
        }
        async fn get_subtask(&self, id: Uuid) -> HiveResult<Option<hive_core::Subtask>> {
            self.inner.get_subtask(id).await
        }
        async fn list_subtasks(&self) -> HiveResult<Vec<hive_core::Subtask>> {
            let mut subtasks = self.inner.list_subtasks().await?;
            for subtask in &mut subtasks {
                if subtask.status.is_leased() {
                    subtask.lease_expiry = Some(Utc::now() - chrono::Duration::seconds(30));
                }
            }
            Ok(subtasks)
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
            self.inner.next_sequence().await
        }
    }

    #[tokio::test]
    async fn test_renewed_lease_survives_stale_snapshot() {
        let store = StaleSnapshotStore {
            inner: MemoryStore::new(),
        };
        let f = fixture_with_store(Arc::new(store), HiveConfig::default());
        let worker = f.registry.join(CapabilitySet::new()).await.unwrap();
        // The authoritative record holds a live lease; only the snapshot
        // shows it expired.
        let id = claimed_subtask(&f, worker, 60).await;

        assert!(sweep(&f).sweep_once().await.unwrap().is_empty());
        let subtask = f.ledger.get(id).await.unwrap();
        assert_eq!(subtask.status, SubtaskStatus::Claimed);
        assert_eq!(subtask.claimant, Some(worker));
        assert_eq!(subtask.retry_count, 0);
    }

    #[tokio::test]
    async fn test_sweep_skips_races_it_loses() {
        let f = fixture(HiveConfig::default());
        let worker = f.registry.join(CapabilitySet::new()).await.unwrap();
        let id = claimed_subtask(&f, worker, -5).await;

        // The worker finishes between the snapshot and the sweep's CAS.
        let s = sweep(&f);
        let finding = hive_core::Finding::new("done", serde_json::Value::Null, 1.0).unwrap();
        f.ledger
            .transition(
                id,
                SubtaskStatus::Claimed,
                SubtaskStatus::Succeeded,
                TransitionExtra::succeed(finding),
                &worker.to_string(),
            )
            .await
            .unwrap();

        assert!(s.sweep_once().await.unwrap().is_empty());
        assert_eq!(
            f.ledger.get(id).await.unwrap().status,
            SubtaskStatus::Succeeded
        );
    }
}
