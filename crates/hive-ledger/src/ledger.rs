use crate::audit::{AuditRecord, AuditScope, AuditTrail};
use crate::feed::StatusFeed;
use crate::store::CasStore;
use chrono::Utc;
use hive_core::{
    CapabilitySet, FinalReport, Finding, HiveError, HiveResult, Request, RequestStatus, StateEvent,
    Subtask, SubtaskSpec, SubtaskStatus,
};
use std::sync::Arc;
use tracing::debug;
use uuid::Uuid;

/// Field updates applied alongside a status transition.
///
/// Built with the constructors below so call sites read as intent
/// (claim, renew, reclaim) rather than as field soup.
#[derive(Debug, Clone, Default)]
pub struct TransitionExtra {
    /// New claimant; also stamps `claimed_at`.
    pub claimant: Option<Uuid>,
    /// New lease expiry.
    pub lease_expiry: Option<chrono::DateTime<Utc>>,
    /// Clears claimant, claim timestamp, and lease.
    pub clear_claim: bool,
    /// Result payload to record.
    pub result: Option<Finding>,
    /// Execution error message to record.
    pub error: Option<String>,
    /// Increments the retry counter.
    pub bump_retry: bool,
}

impl TransitionExtra {
    /// A bare status change.
    pub fn none() -> Self {
        Self::default()
    }

    /// Grants a lease to `worker` until `expiry`.
    pub fn claim(worker: Uuid, expiry: chrono::DateTime<Utc>) -> Self {
        Self {
            claimant: Some(worker),
            lease_expiry: Some(expiry),
            ..Self::default()
        }
    }

    /// Extends the current lease to `expiry`.
    pub fn renew(expiry: chrono::DateTime<Utc>) -> Self {
        Self {
            lease_expiry: Some(expiry),
            ..Self::default()
        }
    }

    /// Records a successful result and drops the claim.
    pub fn succeed(finding: Finding) -> Self {
        Self {
            result: Some(finding),
            clear_claim: true,
            ..Self::default()
        }
    }

    /// Records an execution failure and drops the claim.
    pub fn fail(error: impl Into<String>) -> Self {
        Self {
            error: Some(error.into()),
            clear_claim: true,
            ..Self::default()
        }
    }

    /// Drops a stale claim and charges one retry.
    pub fn reclaim() -> Self {
        Self {
            clear_claim: true,
            bump_retry: true,
            ..Self::default()
        }
    }
}

/// Durable record of every subtask's lifecycle, built entirely on the
/// store's compare-and-swap primitive.
///
/// The subtask status is the CAS token: two writers racing for the same
/// transition see exactly one winner. A lease renewal (status unchanged)
/// racing the sweep after its lease already expired can lose its write; the
/// worker observes this as `NotClaimant` on its next call, which is the
/// contract for an expired lease.
pub struct TaskLedger {
    store: Arc<dyn CasStore>,
    audit: Arc<AuditTrail>,
    feed: StatusFeed,
}

impl TaskLedger {
    /// Creates a ledger over the given store, audit trail, and status feed.
    pub fn new(store: Arc<dyn CasStore>, audit: Arc<AuditTrail>, feed: StatusFeed) -> Self {
        Self { store, audit, feed }
    }

    /// The audit trail of successful transitions.
    pub fn audit(&self) -> &Arc<AuditTrail> {
        &self.audit
    }

    /// The status feed this ledger publishes to.
    pub fn feed(&self) -> &StatusFeed {
        &self.feed
    }

    /// Records a freshly submitted request.
    pub async fn create_request(&self, request: Request) -> HiveResult<()> {
        self.store.insert_request(request).await
    }

    /// Fetches a request.
    pub async fn get_request(&self, id: Uuid) -> HiveResult<Request> {
        self.store
            .get_request(id)
            .await?
            .ok_or(HiveError::NotFound(id))
    }

    /// Enqueues the decomposed subtasks of a request and moves the request
    /// Pending → Decomposed with the subtask ids recorded in decomposition
    /// order. Returns the new subtask ids.
    pub async fn enqueue(
        &self,
        request_id: Uuid,
        specs: Vec<SubtaskSpec>,
    ) -> HiveResult<Vec<Uuid>> {
        let request = self.get_request(request_id).await?;

        let mut ids = Vec::with_capacity(specs.len());
        for spec in specs {
            let sequence = self.store.next_sequence().await?;
            let subtask = Subtask::new(request_id, spec, request.priority, sequence);
            ids.push(subtask.id);
            self.store.insert_subtask(subtask).await?;
        }

        let mut updated = request;
        updated.subtask_ids.clone_from(&ids);
        self.transition_request_inner(updated, RequestStatus::Pending, RequestStatus::Decomposed)
            .await?;

        debug!(request_id = %request_id, subtasks = ids.len(), "enqueued decomposition");
        Ok(ids)
    }

    /// Fetches a subtask.
    pub async fn get(&self, id: Uuid) -> HiveResult<Subtask> {
        self.store
            .get_subtask(id)
            .await?
            .ok_or(HiveError::NotFound(id))
    }

    /// Snapshot of pending subtasks claimable by a worker with `caps`,
    /// ordered by priority (descending), then enqueue sequence, then id.
    pub async fn list_pending(&self, caps: &CapabilitySet) -> HiveResult<Vec<Subtask>> {
        let mut pending: Vec<Subtask> = self
            .store
            .list_subtasks()
            .await?
            .into_iter()
            .filter(|s| s.eligible_for(caps))
            .collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.sequence.cmp(&b.sequence))
                .then(a.id.cmp(&b.id))
        });
        Ok(pending)
    }

    /// Snapshot of subtasks currently holding a lease (Claimed/InProgress).
    pub async fn list_leased(&self) -> HiveResult<Vec<Subtask>> {
        Ok(self
            .store
            .list_subtasks()
            .await?
            .into_iter()
            .filter(|s| s.status.is_leased())
            .collect())
    }

    /// Snapshot of one request's subtasks, unordered.
    pub async fn list_request_subtasks(&self, request_id: Uuid) -> HiveResult<Vec<Subtask>> {
        self.store.list_request_subtasks(request_id).await
    }

    /// Transitions a subtask `from` → `to`, applying `extra`, as `actor`.
    ///
    /// Succeeds only if the subtask's current status equals `from`; otherwise
    /// fails with [`HiveError::StaleState`] and the caller must re-read and
    /// retry or move on. Every success appends an audit record and publishes
    /// a [`StateEvent`].
    pub async fn transition(
        &self,
        id: Uuid,
        from: SubtaskStatus,
        to: SubtaskStatus,
        extra: TransitionExtra,
        actor: &str,
    ) -> HiveResult<Subtask> {
        let current = self.get(id).await?;
        if current.status != from {
            return Err(HiveError::StaleState {
                id,
                expected: from.to_string(),
                actual: current.status.to_string(),
            });
        }

        let now = Utc::now();
        let mut updated = current;
        updated.status = to;
        if let Some(worker) = extra.claimant {
            updated.claimant = Some(worker);
            updated.claimed_at = Some(now);
        }
        if let Some(expiry) = extra.lease_expiry {
            updated.lease_expiry = Some(expiry);
        }
        if extra.clear_claim {
            updated.claimant = None;
            updated.claimed_at = None;
            updated.lease_expiry = None;
        }
        if let Some(finding) = extra.result {
            updated.result = Some(finding);
        }
        if let Some(error) = extra.error {
            updated.last_error = Some(error);
        }
        if extra.bump_retry {
            updated.retry_count += 1;
        }

        if !self.store.cas_subtask(from, updated.clone()).await? {
            let actual = self.get(id).await?.status;
            return Err(HiveError::StaleState {
                id,
                expected: from.to_string(),
                actual: actual.to_string(),
            });
        }

        self.audit.record(AuditRecord {
            timestamp: now,
            scope: AuditScope::Subtask,
            entity_id: id,
            request_id: updated.request_id,
            from: from.to_string(),
            to: to.to_string(),
            actor: actor.to_string(),
        });
        self.feed.publish(StateEvent::Subtask {
            id,
            request_id: updated.request_id,
            from,
            to,
            actor: actor.to_string(),
            at: now,
        });
        debug!(subtask_id = %id, %from, %to, actor, "subtask transition");
        Ok(updated)
    }

    /// Transitions a request `from` → `to` under the same CAS contract,
    /// optionally attaching the final report. Stamps `completed_at` on
    /// terminal transitions.
    pub async fn transition_request(
        &self,
        id: Uuid,
        from: RequestStatus,
        to: RequestStatus,
        report: Option<FinalReport>,
    ) -> HiveResult<Request> {
        let current = self.get_request(id).await?;
        if current.status != from {
            return Err(HiveError::StaleState {
                id,
                expected: from.to_string(),
                actual: current.status.to_string(),
            });
        }
        let mut updated = current;
        if report.is_some() {
            updated.final_report = report;
        }
        self.transition_request_inner(updated, from, to).await
    }

    async fn transition_request_inner(
        &self,
        mut updated: Request,
        from: RequestStatus,
        to: RequestStatus,
    ) -> HiveResult<Request> {
        let now = Utc::now();
        updated.status = to;
        if to.is_terminal() {
            updated.completed_at = Some(now);
        }

        if !self.store.cas_request(from, updated.clone()).await? {
            let actual = self.get_request(updated.id).await?.status;
            return Err(HiveError::StaleState {
                id: updated.id,
                expected: from.to_string(),
                actual: actual.to_string(),
            });
        }

        self.audit.record(AuditRecord {
            timestamp: now,
            scope: AuditScope::Request,
            entity_id: updated.id,
            request_id: updated.id,
            from: from.to_string(),
            to: to.to_string(),
            actor: "orchestrator".to_string(),
        });
        self.feed.publish(StateEvent::Request {
            id: updated.id,
            from,
            to,
            at: now,
        });
        debug!(request_id = %updated.id, %from, %to, "request transition");
        Ok(updated)
    }
}
