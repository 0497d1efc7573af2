use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::sync::mpsc;
use uuid::Uuid;

/// The kind of entity an audit record describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditScope {
    /// A subtask transition.
    Subtask,
    /// A request transition.
    Request,
}

/// One successful state transition, as recorded by the ledger.
///
/// The trail is what makes claim races and Abandoned→Pending reclaim
/// history reconstructable after the fact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Transition time.
    pub timestamp: DateTime<Utc>,
    /// Whether this records a subtask or a request transition.
    pub scope: AuditScope,
    /// The entity that transitioned.
    pub entity_id: Uuid,
    /// The owning request (equals `entity_id` for request records).
    pub request_id: Uuid,
    /// Status before the transition.
    pub from: String,
    /// Status after the transition.
    pub to: String,
    /// Who performed the transition (worker id, "sweep", "orchestrator").
    pub actor: String,
}

/// Append-only trail of every successful ledger transition.
///
/// Records are always kept in an in-memory tail; with a log directory
/// configured they are additionally written to `transitions.jsonl` by a
/// background task.
pub struct AuditTrail {
    tail: Mutex<Vec<AuditRecord>>,
    file_tx: Option<mpsc::UnboundedSender<AuditRecord>>,
}

impl AuditTrail {
    /// Creates a memory-only trail.
    pub fn new() -> Self {
        Self {
            tail: Mutex::new(Vec::new()),
            file_tx: None,
        }
    }

    /// Creates a trail that also appends JSONL records under `log_dir`.
    /// Must be called from within a tokio runtime.
    pub fn with_log_dir(log_dir: PathBuf) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<AuditRecord>();

        tokio::spawn(async move {
            let _ = tokio::fs::create_dir_all(&log_dir).await;
            let log_file = log_dir.join("transitions.jsonl");

            while let Some(record) = rx.recv().await {
                if let Ok(mut line) = serde_json::to_string(&record) {
                    line.push('\n');
                    use tokio::io::AsyncWriteExt;
                    if let Ok(mut file) = tokio::fs::OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&log_file)
                        .await
                    {
                        let _ = file.write_all(line.as_bytes()).await;
                    }
                }
            }
        });

        Self {
            tail: Mutex::new(Vec::new()),
            file_tx: Some(tx),
        }
    }

    /// Appends a record.
    pub fn record(&self, record: AuditRecord) {
        if let Some(tx) = &self.file_tx {
            let _ = tx.send(record.clone());
        }
        self.tail.lock().push(record);
    }

    /// Snapshot of all records in append order.
    pub fn tail(&self) -> Vec<AuditRecord> {
        self.tail.lock().clone()
    }

    /// Records concerning a single entity, in append order.
    pub fn records_for(&self, entity_id: Uuid) -> Vec<AuditRecord> {
        self.tail
            .lock()
            .iter()
            .filter(|r| r.entity_id == entity_id)
            .cloned()
            .collect()
    }

    /// Number of recorded transitions.
    pub fn len(&self) -> usize {
        self.tail.lock().len()
    }

    /// Whether nothing has been recorded yet.
    pub fn is_empty(&self) -> bool {
        self.tail.lock().is_empty()
    }
}

impl Default for AuditTrail {
    fn default() -> Self {
        Self::new()
    }
}
