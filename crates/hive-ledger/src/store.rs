use async_trait::async_trait;
use hive_core::{
    HiveError, HiveResult, Request, RequestStatus, Subtask, SubtaskStatus, WorkerRecord,
    WorkerStatus,
};
use rusqlite::{params, Connection, OptionalExtension};
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

/// Storage backend for the ledger and registry.
///
/// The only write primitive is a per-record compare-and-swap keyed on the
/// record's current status. Implementations must make each CAS atomic and
/// linearizable per record; the rest of the system builds every mutation on
/// top of it, never on blind overwrites.
#[async_trait]
pub trait CasStore: Send + Sync {
    /// Inserts a new request. Fails if the id already exists.
    async fn insert_request(&self, request: Request) -> HiveResult<()>;
    /// Fetches a request by id.
    async fn get_request(&self, id: Uuid) -> HiveResult<Option<Request>>;
    /// Replaces the stored request with `updated` iff its current status is
    /// `expected`. Returns whether the swap happened.
    async fn cas_request(&self, expected: RequestStatus, updated: Request) -> HiveResult<bool>;

    /// Inserts a new subtask. Fails if the id already exists.
    async fn insert_subtask(&self, subtask: Subtask) -> HiveResult<()>;
    /// Fetches a subtask by id.
    async fn get_subtask(&self, id: Uuid) -> HiveResult<Option<Subtask>>;
    /// Snapshot of all subtasks.
    async fn list_subtasks(&self) -> HiveResult<Vec<Subtask>>;
    /// Snapshot of one request's subtasks.
    async fn list_request_subtasks(&self, request_id: Uuid) -> HiveResult<Vec<Subtask>>;
    /// Replaces the stored subtask with `updated` iff its current status is
    /// `expected`. Returns whether the swap happened.
    async fn cas_subtask(&self, expected: SubtaskStatus, updated: Subtask) -> HiveResult<bool>;

    /// Inserts a new worker record.
    async fn insert_worker(&self, worker: WorkerRecord) -> HiveResult<()>;
    /// Fetches a worker by id.
    async fn get_worker(&self, id: Uuid) -> HiveResult<Option<WorkerRecord>>;
    /// Snapshot of all workers.
    async fn list_workers(&self) -> HiveResult<Vec<WorkerRecord>>;
    /// Replaces the stored worker with `updated` iff its current status is
    /// `expected`. Returns whether the swap happened.
    async fn cas_worker(&self, expected: WorkerStatus, updated: WorkerRecord) -> HiveResult<bool>;
    /// Removes a worker on explicit leave. Returns whether it existed.
    async fn remove_worker(&self, id: Uuid) -> HiveResult<bool>;

    /// Allocates the next monotonically increasing enqueue sequence number.
    async fn next_sequence(&self) -> HiveResult<u64>;
}

/// In-memory store backed by `tokio::sync::RwLock` maps.
///
/// The write lock makes each CAS atomic; suitable for tests and
/// single-process deployments.
#[derive(Default)]
pub struct MemoryStore {
    requests: RwLock<HashMap<Uuid, Request>>,
    subtasks: RwLock<HashMap<Uuid, Subtask>>,
    workers: RwLock<HashMap<Uuid, WorkerRecord>>,
    sequence: AtomicU64,
}

impl MemoryStore {
    /// Creates an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CasStore for MemoryStore {
    async fn insert_request(&self, request: Request) -> HiveResult<()> {
        let mut requests = self.requests.write().await;
        if requests.contains_key(&request.id) {
            return Err(HiveError::Store(format!(
                "request {} already exists",
                request.id
            )));
        }
        requests.insert(request.id, request);
        Ok(())
    }

    async fn get_request(&self, id: Uuid) -> HiveResult<Option<Request>> {
        Ok(self.requests.read().await.get(&id).cloned())
    }

    async fn cas_request(&self, expected: RequestStatus, updated: Request) -> HiveResult<bool> {
        let mut requests = self.requests.write().await;
        match requests.get(&updated.id) {
            Some(current) if current.status == expected => {
                requests.insert(updated.id, updated);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(HiveError::NotFound(updated.id)),
        }
    }

    async fn insert_subtask(&self, subtask: Subtask) -> HiveResult<()> {
        let mut subtasks = self.subtasks.write().await;
        if subtasks.contains_key(&subtask.id) {
            return Err(HiveError::Store(format!(
                "subtask {} already exists",
                subtask.id
            )));
        }
        subtasks.insert(subtask.id, subtask);
        Ok(())
    }

    async fn get_subtask(&self, id: Uuid) -> HiveResult<Option<Subtask>> {
        Ok(self.subtasks.read().await.get(&id).cloned())
    }

    async fn list_subtasks(&self) -> HiveResult<Vec<Subtask>> {
        Ok(self.subtasks.read().await.values().cloned().collect())
    }

    async fn list_request_subtasks(&self, request_id: Uuid) -> HiveResult<Vec<Subtask>> {
        Ok(self
            .subtasks
            .read()
            .await
            .values()
            .filter(|s| s.request_id == request_id)
            .cloned()
            .collect())
    }

    async fn cas_subtask(&self, expected: SubtaskStatus, updated: Subtask) -> HiveResult<bool> {
        let mut subtasks = self.subtasks.write().await;
        match subtasks.get(&updated.id) {
            Some(current) if current.status == expected => {
                subtasks.insert(updated.id, updated);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(HiveError::NotFound(updated.id)),
        }
    }

    async fn insert_worker(&self, worker: WorkerRecord) -> HiveResult<()> {
        self.workers.write().await.insert(worker.id, worker);
        Ok(())
    }

    async fn get_worker(&self, id: Uuid) -> HiveResult<Option<WorkerRecord>> {
        Ok(self.workers.read().await.get(&id).cloned())
    }

    async fn list_workers(&self) -> HiveResult<Vec<WorkerRecord>> {
        Ok(self.workers.read().await.values().cloned().collect())
    }

    async fn cas_worker(&self, expected: WorkerStatus, updated: WorkerRecord) -> HiveResult<bool> {
        let mut workers = self.workers.write().await;
        match workers.get(&updated.id) {
            Some(current) if current.status == expected => {
                workers.insert(updated.id, updated);
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(HiveError::NotFound(updated.id)),
        }
    }

    async fn remove_worker(&self, id: Uuid) -> HiveResult<bool> {
        Ok(self.workers.write().await.remove(&id).is_some())
    }

    async fn next_sequence(&self) -> HiveResult<u64> {
        Ok(self.sequence.fetch_add(1, Ordering::SeqCst))
    }
}

/// SQLite-backed store.
///
/// Records are stored as JSON bodies next to a `status` column; the CAS is a
/// conditional `UPDATE ... WHERE id = ? AND status = ?` checked via
/// `changes()`, i.e. a row-level conditional update.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Opens (or creates) a store at `path`.
    pub fn open(path: impl AsRef<Path>) -> HiveResult<Self> {
        let conn = Connection::open(path.as_ref()).map_err(sql_err)?;
        Self::init(conn)
    }

    /// Opens an in-memory SQLite store, mostly for tests.
    pub fn open_in_memory() -> HiveResult<Self> {
        let conn = Connection::open_in_memory().map_err(sql_err)?;
        Self::init(conn)
    }

    fn init(conn: Connection) -> HiveResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS requests (
                 id     TEXT PRIMARY KEY,
                 status TEXT NOT NULL,
                 body   TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS subtasks (
                 id         TEXT PRIMARY KEY,
                 request_id TEXT NOT NULL,
                 status     TEXT NOT NULL,
                 body       TEXT NOT NULL
             );
             CREATE INDEX IF NOT EXISTS idx_subtasks_request ON subtasks(request_id);
             CREATE TABLE IF NOT EXISTS workers (
                 id     TEXT PRIMARY KEY,
                 status TEXT NOT NULL,
                 body   TEXT NOT NULL
             );
             CREATE TABLE IF NOT EXISTS meta (
                 key   TEXT PRIMARY KEY,
                 value INTEGER NOT NULL
             );
             INSERT OR IGNORE INTO meta (key, value) VALUES ('subtask_seq', 0);",
        )
        .map_err(sql_err)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }
}

fn sql_err(e: rusqlite::Error) -> HiveError {
    HiveError::Store(e.to_string())
}

#[async_trait]
impl CasStore for SqliteStore {
    async fn insert_request(&self, request: Request) -> HiveResult<()> {
        let body = serde_json::to_string(&request)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO requests (id, status, body) VALUES (?1, ?2, ?3)",
            params![request.id.to_string(), request.status.to_string(), body],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn get_request(&self, id: Uuid) -> HiveResult<Option<Request>> {
        let conn = self.conn.lock().await;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM requests WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        body.map(|b| serde_json::from_str(&b).map_err(HiveError::from))
            .transpose()
    }

    async fn cas_request(&self, expected: RequestStatus, updated: Request) -> HiveResult<bool> {
        let body = serde_json::to_string(&updated)?;
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE requests SET status = ?1, body = ?2 WHERE id = ?3 AND status = ?4",
                params![
                    updated.status.to_string(),
                    body,
                    updated.id.to_string(),
                    expected.to_string()
                ],
            )
            .map_err(sql_err)?;
        if changed == 1 {
            return Ok(true);
        }
        let exists: bool = conn
            .query_row(
                "SELECT 1 FROM requests WHERE id = ?1",
                params![updated.id.to_string()],
                |_| Ok(true),
            )
            .optional()
            .map_err(sql_err)?
            .unwrap_or(false);
        if exists {
            Ok(false)
        } else {
            Err(HiveError::NotFound(updated.id))
        }
    }

    async fn insert_subtask(&self, subtask: Subtask) -> HiveResult<()> {
        let body = serde_json::to_string(&subtask)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO subtasks (id, request_id, status, body) VALUES (?1, ?2, ?3, ?4)",
            params![
                subtask.id.to_string(),
                subtask.request_id.to_string(),
                subtask.status.to_string(),
                body
            ],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn get_subtask(&self, id: Uuid) -> HiveResult<Option<Subtask>> {
        let conn = self.conn.lock().await;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM subtasks WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        body.map(|b| serde_json::from_str(&b).map_err(HiveError::from))
            .transpose()
    }

    async fn list_subtasks(&self) -> HiveResult<Vec<Subtask>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT body FROM subtasks")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(sql_err)?;
        let mut subtasks = Vec::new();
        for body in rows {
            subtasks.push(serde_json::from_str(&body.map_err(sql_err)?)?);
        }
        Ok(subtasks)
    }

    async fn list_request_subtasks(&self, request_id: Uuid) -> HiveResult<Vec<Subtask>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn
            .prepare("SELECT body FROM subtasks WHERE request_id = ?1")
            .map_err(sql_err)?;
        let rows = stmt
            .query_map(params![request_id.to_string()], |row| {
                row.get::<_, String>(0)
            })
            .map_err(sql_err)?;
        let mut subtasks = Vec::new();
        for body in rows {
            subtasks.push(serde_json::from_str(&body.map_err(sql_err)?)?);
        }
        Ok(subtasks)
    }

    async fn cas_subtask(&self, expected: SubtaskStatus, updated: Subtask) -> HiveResult<bool> {
        let body = serde_json::to_string(&updated)?;
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE subtasks SET status = ?1, body = ?2 WHERE id = ?3 AND status = ?4",
                params![
                    updated.status.to_string(),
                    body,
                    updated.id.to_string(),
                    expected.to_string()
                ],
            )
            .map_err(sql_err)?;
        if changed == 1 {
            return Ok(true);
        }
        let exists: bool = conn
            .query_row(
                "SELECT 1 FROM subtasks WHERE id = ?1",
                params![updated.id.to_string()],
                |_| Ok(true),
            )
            .optional()
            .map_err(sql_err)?
            .unwrap_or(false);
        if exists {
            Ok(false)
        } else {
            Err(HiveError::NotFound(updated.id))
        }
    }

    async fn insert_worker(&self, worker: WorkerRecord) -> HiveResult<()> {
        let body = serde_json::to_string(&worker)?;
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO workers (id, status, body) VALUES (?1, ?2, ?3)",
            params![worker.id.to_string(), worker.status.to_string(), body],
        )
        .map_err(sql_err)?;
        Ok(())
    }

    async fn get_worker(&self, id: Uuid) -> HiveResult<Option<WorkerRecord>> {
        let conn = self.conn.lock().await;
        let body: Option<String> = conn
            .query_row(
                "SELECT body FROM workers WHERE id = ?1",
                params![id.to_string()],
                |row| row.get(0),
            )
            .optional()
            .map_err(sql_err)?;
        body.map(|b| serde_json::from_str(&b).map_err(HiveError::from))
            .transpose()
    }

    async fn list_workers(&self) -> HiveResult<Vec<WorkerRecord>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare("SELECT body FROM workers").map_err(sql_err)?;
        let rows = stmt
            .query_map([], |row| row.get::<_, String>(0))
            .map_err(sql_err)?;
        let mut workers = Vec::new();
        for body in rows {
            workers.push(serde_json::from_str(&body.map_err(sql_err)?)?);
        }
        Ok(workers)
    }

    async fn cas_worker(&self, expected: WorkerStatus, updated: WorkerRecord) -> HiveResult<bool> {
        let body = serde_json::to_string(&updated)?;
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "UPDATE workers SET status = ?1, body = ?2 WHERE id = ?3 AND status = ?4",
                params![
                    updated.status.to_string(),
                    body,
                    updated.id.to_string(),
                    expected.to_string()
                ],
            )
            .map_err(sql_err)?;
        if changed == 1 {
            return Ok(true);
        }
        let exists: bool = conn
            .query_row(
                "SELECT 1 FROM workers WHERE id = ?1",
                params![updated.id.to_string()],
                |_| Ok(true),
            )
            .optional()
            .map_err(sql_err)?
            .unwrap_or(false);
        if exists {
            Ok(false)
        } else {
            Err(HiveError::NotFound(updated.id))
        }
    }

    async fn remove_worker(&self, id: Uuid) -> HiveResult<bool> {
        let conn = self.conn.lock().await;
        let changed = conn
            .execute(
                "DELETE FROM workers WHERE id = ?1",
                params![id.to_string()],
            )
            .map_err(sql_err)?;
        Ok(changed == 1)
    }

    async fn next_sequence(&self) -> HiveResult<u64> {
        let conn = self.conn.lock().await;
        let current: i64 = conn
            .query_row(
                "SELECT value FROM meta WHERE key = 'subtask_seq'",
                [],
                |row| row.get(0),
            )
            .map_err(sql_err)?;
        conn.execute(
            "UPDATE meta SET value = value + 1 WHERE key = 'subtask_seq'",
            [],
        )
        .map_err(sql_err)?;
        Ok(current as u64)
    }
}
