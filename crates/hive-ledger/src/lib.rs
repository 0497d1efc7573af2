//! Durable task ledger, worker registry, and status feed for Hive.
//!
//! Everything in this crate builds on a single concurrency primitive: the
//! per-record compare-and-swap exposed by [`CasStore`]. The ledger expresses
//! each subtask and request mutation as a named status transition; the
//! registry does the same for worker liveness. Successful transitions are
//! audited and published on the status feed.
//!
//! # Main types
//!
//! - [`TaskLedger`] — Lifecycle record of every subtask and request.
//! - [`CasStore`] — Storage seam; [`MemoryStore`] and [`SqliteStore`] ship here.
//! - [`WorkerRegistry`] / [`HeartbeatMonitor`] — Worker liveness tracking.
//! - [`AuditTrail`] — Append-only record of successful transitions.
//! - [`StatusFeed`] — Broadcast of [`hive_core::StateEvent`]s.

/// Append-only audit trail of successful transitions.
pub mod audit;
/// Broadcast status feed.
pub mod feed;
/// The task ledger and its CAS transition contract.
pub mod ledger;
/// Worker registry and heartbeat monitor.
pub mod registry;
/// Storage backends with per-record compare-and-swap.
pub mod store;

pub use audit::{AuditRecord, AuditScope, AuditTrail};
pub use feed::StatusFeed;
pub use ledger::{TaskLedger, TransitionExtra};
pub use registry::{HeartbeatMonitor, WorkerRegistry};
pub use store::{CasStore, MemoryStore, SqliteStore};
