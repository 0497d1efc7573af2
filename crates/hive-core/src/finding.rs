use crate::{HiveError, HiveResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A validated result payload produced by executing a subtask.
///
/// Payloads cross the worker boundary as arbitrary JSON in the original
/// design; here they are validated at construction so malformed results are
/// rejected with [`HiveError::InvalidPayload`] instead of stored.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    /// One-line summary of the result.
    pub summary: String,
    /// Structured details, schema defined by the executing worker.
    pub details: serde_json::Value,
    /// Worker-reported confidence in `[0.0, 1.0]`.
    pub confidence: f64,
    /// Time the finding was produced.
    pub produced_at: DateTime<Utc>,
}

impl Finding {
    /// Creates a validated finding.
    ///
    /// Rejects an empty summary or a confidence outside `[0.0, 1.0]`
    /// (NaN included).
    pub fn new(
        summary: impl Into<String>,
        details: serde_json::Value,
        confidence: f64,
    ) -> HiveResult<Self> {
        let summary = summary.into();
        if summary.trim().is_empty() {
            return Err(HiveError::InvalidPayload(
                "finding summary must not be empty".to_string(),
            ));
        }
        if !(0.0..=1.0).contains(&confidence) {
            return Err(HiveError::InvalidPayload(format!(
                "confidence {confidence} outside [0.0, 1.0]"
            )));
        }
        Ok(Self {
            summary,
            details,
            confidence,
            produced_at: Utc::now(),
        })
    }
}

/// One subtask's slot in a final report, in decomposition order.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReportEntry {
    /// The subtask this entry covers.
    pub subtask_id: Uuid,
    /// The subtask description, for readable reports.
    pub description: String,
    /// The finding, absent when the subtask failed permanently and the
    /// aggregation policy is best-effort.
    pub finding: Option<Finding>,
}

/// The assembled result of a request, produced once all subtasks are terminal.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FinalReport {
    /// The request this report belongs to.
    pub request_id: Uuid,
    /// Entries in the order the subtasks were decomposed.
    pub entries: Vec<ReportEntry>,
    /// True when every subtask succeeded.
    pub complete: bool,
    /// Number of succeeded subtasks.
    pub succeeded: usize,
    /// Number of permanently failed subtasks.
    pub failed: usize,
    /// Assembly time.
    pub generated_at: DateTime<Utc>,
}
