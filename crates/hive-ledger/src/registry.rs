use crate::feed::StatusFeed;
use crate::store::CasStore;
use chrono::Utc;
use hive_core::{CapabilitySet, HiveConfig, HiveError, HiveResult, StateEvent, WorkerRecord, WorkerStatus};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{info, warn};
use uuid::Uuid;

/// Tracks live workers and their capabilities.
///
/// All mutations go through the store's worker CAS; the registry never
/// overwrites a record blind, so a heartbeat racing the monitor's
/// death-marking resolves to exactly one winner.
pub struct WorkerRegistry {
    store: Arc<dyn CasStore>,
    feed: StatusFeed,
    config: HiveConfig,
}

impl WorkerRegistry {
    /// Creates a registry over the given store and status feed.
    pub fn new(store: Arc<dyn CasStore>, feed: StatusFeed, config: HiveConfig) -> Self {
        Self { store, feed, config }
    }

    /// Registers a new worker and returns its id.
    pub async fn join(&self, capabilities: CapabilitySet) -> HiveResult<Uuid> {
        let record = WorkerRecord::new(capabilities);
        let id = record.id;
        self.store.insert_worker(record).await?;
        self.feed.publish(StateEvent::WorkerJoined { id, at: Utc::now() });
        info!(worker_id = %id, "worker joined");
        Ok(id)
    }

    /// Records a heartbeat. Returns `false` if the worker was already
    /// declared dead, signaling it must stop and rejoin.
    pub async fn heartbeat(&self, worker_id: Uuid) -> HiveResult<bool> {
        // One retry absorbs a racing status change (e.g. busy/idle flip).
        for _ in 0..2 {
            let Some(current) = self.store.get_worker(worker_id).await? else {
                return Err(HiveError::NotFound(worker_id));
            };
            if current.status == WorkerStatus::Dead {
                return Ok(false);
            }
            let mut updated = current.clone();
            updated.last_heartbeat = Utc::now();
            if self.store.cas_worker(current.status, updated).await? {
                return Ok(true);
            }
        }
        // Lost both races; the only persistent competitor is death-marking.
        Ok(false)
    }

    /// Removes a worker on explicit leave.
    pub async fn leave(&self, worker_id: Uuid) -> HiveResult<()> {
        if self.store.remove_worker(worker_id).await? {
            self.feed.publish(StateEvent::WorkerLeft {
                id: worker_id,
                at: Utc::now(),
            });
            info!(worker_id = %worker_id, "worker left");
        }
        Ok(())
    }

    /// Marks a worker busy on `subtask_id`. CAS Idle → Busy.
    pub async fn mark_busy(&self, worker_id: Uuid, subtask_id: Uuid) -> HiveResult<bool> {
        let Some(current) = self.store.get_worker(worker_id).await? else {
            return Err(HiveError::NotFound(worker_id));
        };
        if current.status != WorkerStatus::Idle {
            return Ok(false);
        }
        let mut updated = current;
        updated.status = WorkerStatus::Busy;
        updated.current_subtask = Some(subtask_id);
        self.store.cas_worker(WorkerStatus::Idle, updated).await
    }

    /// Marks a worker idle again. CAS Busy → Idle.
    pub async fn mark_idle(&self, worker_id: Uuid) -> HiveResult<bool> {
        let Some(current) = self.store.get_worker(worker_id).await? else {
            return Err(HiveError::NotFound(worker_id));
        };
        if current.status != WorkerStatus::Busy {
            return Ok(false);
        }
        let mut updated = current;
        updated.status = WorkerStatus::Idle;
        updated.current_subtask = None;
        self.store.cas_worker(WorkerStatus::Busy, updated).await
    }

    /// Fetches a worker record.
    pub async fn get(&self, worker_id: Uuid) -> HiveResult<WorkerRecord> {
        self.store
            .get_worker(worker_id)
            .await?
            .ok_or(HiveError::NotFound(worker_id))
    }

    /// Whether a worker is currently considered dead. Unknown workers count
    /// as dead: their leases are reclaimable either way.
    pub async fn is_dead(&self, worker_id: Uuid) -> HiveResult<bool> {
        Ok(self
            .store
            .get_worker(worker_id)
            .await?
            .map_or(true, |w| !w.is_live()))
    }

    /// Snapshot of all live workers.
    pub async fn live_workers(&self) -> HiveResult<Vec<WorkerRecord>> {
        Ok(self
            .store
            .list_workers()
            .await?
            .into_iter()
            .filter(WorkerRecord::is_live)
            .collect())
    }

    /// One monitor pass: marks every worker whose heartbeat is older than
    /// the configured timeout as Dead and returns the newly dead ids.
    pub async fn sweep_dead(&self) -> HiveResult<Vec<Uuid>> {
        let now = Utc::now();
        let timeout = self.config.heartbeat_timeout();
        let mut newly_dead = Vec::new();

        for worker in self.store.list_workers().await? {
            if !worker.is_live() || !worker.heartbeat_stale(now, timeout) {
                continue;
            }
            let mut updated = worker.clone();
            updated.status = WorkerStatus::Dead;
            // A concurrent heartbeat may win the race; skip if so.
            if self.store.cas_worker(worker.status, updated).await? {
                warn!(worker_id = %worker.id, "worker heartbeat timed out, marked dead");
                self.feed.publish(StateEvent::WorkerDead {
                    id: worker.id,
                    at: now,
                });
                newly_dead.push(worker.id);
            }
        }
        Ok(newly_dead)
    }
}

/// Background heartbeat monitor.
///
/// Runs [`WorkerRegistry::sweep_dead`] every `heartbeat_timeout / 2` and
/// forwards newly dead worker ids to the lease sweep so abandoned claims are
/// reclaimed eagerly instead of waiting for lease expiry.
pub struct HeartbeatMonitor {
    registry: Arc<WorkerRegistry>,
    dead_tx: mpsc::UnboundedSender<Uuid>,
}

impl HeartbeatMonitor {
    /// Creates a monitor and the receiving end of its dead-worker channel.
    pub fn new(registry: Arc<WorkerRegistry>) -> (Self, mpsc::UnboundedReceiver<Uuid>) {
        let (dead_tx, dead_rx) = mpsc::unbounded_channel();
        (Self { registry, dead_tx }, dead_rx)
    }

    /// Starts the periodic sweep. Abort the returned handle to stop it.
    pub fn start(self) -> JoinHandle<()> {
        let interval = self.registry.config.sweep_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                match self.registry.sweep_dead().await {
                    Ok(dead) => {
                        for id in dead {
                            let _ = self.dead_tx.send(id);
                        }
                    }
                    Err(e) => warn!(error = %e, "heartbeat sweep failed"),
                }
            }
        })
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn registry_with(config: HiveConfig) -> WorkerRegistry {
        WorkerRegistry::new(Arc::new(MemoryStore::new()), StatusFeed::new(), config)
    }

    fn registry() -> WorkerRegistry {
        registry_with(HiveConfig::default())
    }

    #[tokio::test]
    async fn test_join_and_heartbeat() {
        let registry = registry();
        let id = registry.join(CapabilitySet::new()).await.unwrap();

        assert!(registry.heartbeat(id).await.unwrap());
        let record = registry.get(id).await.unwrap();
        assert_eq!(record.status, WorkerStatus::Idle);
    }

    #[tokio::test]
    async fn test_heartbeat_unknown_worker() {
        let registry = registry();
        assert!(matches!(
            registry.heartbeat(Uuid::new_v4()).await,
            Err(HiveError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_busy_idle_flow() {
        let registry = registry();
        let id = registry.join(CapabilitySet::new()).await.unwrap();
        let subtask = Uuid::new_v4();

        assert!(registry.mark_busy(id, subtask).await.unwrap());
        assert_eq!(registry.get(id).await.unwrap().current_subtask, Some(subtask));
        // A second mark_busy is rejected: one claim per worker.
        assert!(!registry.mark_busy(id, Uuid::new_v4()).await.unwrap());

        assert!(registry.mark_idle(id).await.unwrap());
        assert!(registry.get(id).await.unwrap().current_subtask.is_none());
    }

    #[tokio::test]
    async fn test_sweep_marks_stale_workers_dead() {
        let config = HiveConfig {
            heartbeat_timeout_secs: 1,
            ..HiveConfig::default()
        };
        let store: Arc<dyn CasStore> = Arc::new(MemoryStore::new());
        let registry = WorkerRegistry::new(store.clone(), StatusFeed::new(), config);

        let id = registry.join(CapabilitySet::new()).await.unwrap();
        // Backdate the heartbeat instead of sleeping.
        let mut record = registry.get(id).await.unwrap();
        record.last_heartbeat = Utc::now() - chrono::Duration::seconds(5);
        assert!(store.cas_worker(WorkerStatus::Idle, record).await.unwrap());

        let dead = registry.sweep_dead().await.unwrap();
        assert_eq!(dead, vec![id]);
        assert!(registry.is_dead(id).await.unwrap());

        // Dead workers fail heartbeats and must rejoin.
        assert!(!registry.heartbeat(id).await.unwrap());
        // A second sweep does not re-report.
        assert!(registry.sweep_dead().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_leave_removes_worker() {
        let registry = registry();
        let id = registry.join(CapabilitySet::new()).await.unwrap();
        registry.leave(id).await.unwrap();
        assert!(matches!(registry.get(id).await, Err(HiveError::NotFound(_))));
        // Unknown workers count as dead for reclaim purposes.
        assert!(registry.is_dead(id).await.unwrap());
    }

    #[tokio::test]
    async fn test_live_workers_excludes_dead() {
        let config = HiveConfig {
            heartbeat_timeout_secs: 1,
            ..HiveConfig::default()
        };
        let store: Arc<dyn CasStore> = Arc::new(MemoryStore::new());
        let registry = WorkerRegistry::new(store.clone(), StatusFeed::new(), config);

        let a = registry.join(CapabilitySet::new()).await.unwrap();
        let b = registry.join(CapabilitySet::new()).await.unwrap();

        let mut record = registry.get(a).await.unwrap();
        record.last_heartbeat = Utc::now() - chrono::Duration::seconds(5);
        assert!(store.cas_worker(WorkerStatus::Idle, record).await.unwrap());
        registry.sweep_dead().await.unwrap();

        let live: Vec<Uuid> = registry
            .live_workers()
            .await
            .unwrap()
            .into_iter()
            .map(|w| w.id)
            .collect();
        assert_eq!(live, vec![b]);
    }

    #[tokio::test]
    async fn test_monitor_forwards_dead_ids() {
        let config = HiveConfig {
            heartbeat_timeout_secs: 1,
            sweep_interval_secs: Some(1),
            ..HiveConfig::default()
        };
        let store: Arc<dyn CasStore> = Arc::new(MemoryStore::new());
        let registry = Arc::new(WorkerRegistry::new(store.clone(), StatusFeed::new(), config));

        let id = registry.join(CapabilitySet::new()).await.unwrap();
        let mut record = registry.get(id).await.unwrap();
        record.last_heartbeat = Utc::now() - chrono::Duration::seconds(5);
        assert!(store.cas_worker(WorkerStatus::Idle, record).await.unwrap());

        let (monitor, mut dead_rx) = HeartbeatMonitor::new(registry);
        let handle = monitor.start();

        let dead = tokio::time::timeout(std::time::Duration::from_secs(5), dead_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(dead, id);
        handle.abort();
    }
}
