//! Key issuance store
//!
//! SQLite-backed record of which users have received a key. The only write is
//! a conditional insert guarded by the unique index on `UserId`, so two
//! concurrent requests for the same user can never both succeed.
//!
//! Blocking SQLite calls run on the tokio blocking pool; every operation is
//! bounded by the store's deadline and reports `StorageUnavailable` when it is
//! exceeded. A write whose caller has given up is rolled back, never committed.

pub mod schema;

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use futures::{Stream, TryStreamExt};
use rusqlite::{params, Connection, InterruptHandle, OptionalExtension, Row, Transaction};
use serde::Serialize;
use tracing::{debug, info};
use uuid::Uuid;

use crate::config::DatabaseLocation;
use crate::error::StoreError;

const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(10);
const DEFAULT_PAGE_SIZE: usize = 256;

/// A persisted `(user, key)` pair
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IssuanceRecord {
    /// Surrogate row id, defines listing order
    pub id: i64,
    pub user_id: i64,
    pub key: String,
    /// Unix seconds; `None` for rows written before timestamps were recorded
    pub issued_at: Option<i64>,
}

impl IssuanceRecord {
    fn from_row(row: &Row) -> Result<Self, rusqlite::Error> {
        Ok(Self {
            id: row.get(0)?,
            user_id: row.get(1)?,
            key: row.get(2)?,
            issued_at: row.get(3)?,
        })
    }
}

/// Whether `key` looks like a token this store issues (hyphenated UUID)
pub fn is_valid_key(key: &str) -> bool {
    key.len() == 36 && Uuid::parse_str(key).is_ok()
}

/// Persistent user → key mapping
#[derive(Clone)]
pub struct KeyIssuanceStore {
    conn: Arc<Mutex<Connection>>,
    interrupt: Arc<InterruptHandle>,
    op_timeout: Duration,
    page_size: usize,
}

impl KeyIssuanceStore {
    /// Open or create the issuance database and make sure its schema exists
    pub fn open(location: &DatabaseLocation, busy_timeout: Duration) -> Result<Self, StoreError> {
        let conn = match location {
            DatabaseLocation::File(path) => {
                if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                    std::fs::create_dir_all(parent).map_err(|e| {
                        StoreError::unavailable(format!(
                            "creating database directory {}: {}",
                            parent.display(),
                            e
                        ))
                    })?;
                }
                info!(path = %path.display(), "Opening issuance database");
                let conn = Connection::open(path).map_err(|e| {
                    StoreError::unavailable(format!("opening {}: {}", path.display(), e))
                })?;
                // WAL keeps reads going while a write is in flight
                conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
                conn
            }
            DatabaseLocation::Memory => {
                debug!("Opening in-memory issuance database");
                Connection::open_in_memory()?
            }
        };
        conn.busy_timeout(busy_timeout)?;

        schema::init_schema(&conn)?;

        Ok(Self {
            interrupt: Arc::new(conn.get_interrupt_handle()),
            conn: Arc::new(Mutex::new(conn)),
            op_timeout: DEFAULT_OP_TIMEOUT,
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    /// `open` on the blocking pool, for callers already on the async runtime
    pub async fn connect(
        location: DatabaseLocation,
        busy_timeout: Duration,
    ) -> Result<Self, StoreError> {
        tokio::task::spawn_blocking(move || Self::open(&location, busy_timeout))
            .await
            .map_err(|e| StoreError::unavailable(format!("open task failed: {}", e)))?
    }

    /// Open an in-memory store (for testing)
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::open(&DatabaseLocation::Memory, Duration::from_millis(0))
    }

    /// Deadline applied to each store operation
    pub fn with_timeout(mut self, op_timeout: Duration) -> Self {
        self.op_timeout = op_timeout;
        self
    }

    /// Rows fetched per round trip by `list_all`
    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// Re-run schema creation; a no-op on an initialized database
    pub async fn init_schema(&self) -> Result<(), StoreError> {
        self.run("init_schema", |conn, _| schema::init_schema(conn)).await
    }

    /// Whether a key has already been issued to `user_id`
    pub async fn has_key(&self, user_id: i64) -> Result<bool, StoreError> {
        self.run("has_key", move |conn, _| {
            let exists: bool = conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM Users WHERE UserId = ?1)",
                [user_id],
                |row| row.get(0),
            )?;
            Ok(exists)
        })
        .await
    }

    /// Generate a key and record it for `user_id` unless one already exists.
    ///
    /// Check and insert happen in a single statement. A user who already holds
    /// a key gets `DuplicateIssuance` and the freshly generated key is dropped.
    /// On `StorageUnavailable` (including a missed deadline) no row is written.
    pub async fn issue_key(&self, user_id: i64) -> Result<String, StoreError> {
        let key = Uuid::new_v4().to_string();
        self.run("issue_key", move |conn, gate| {
            let tx = conn.unchecked_transaction()?;
            let inserted = tx.execute(
                "INSERT INTO Users (UserId, UniqueKey, IssuedAt) VALUES (?1, ?2, ?3)
                 ON CONFLICT(UserId) DO NOTHING",
                params![user_id, key, now()],
            )?;
            if inserted == 0 {
                debug!(user_id, "Conditional insert found an existing key");
                return Err(StoreError::DuplicateIssuance { user_id });
            }
            gate.commit(tx)?;
            Ok(key)
        })
        .await
    }

    /// The record for `user_id`, if any
    pub async fn get_key(&self, user_id: i64) -> Result<Option<IssuanceRecord>, StoreError> {
        self.run("get_key", move |conn, _| {
            let record = conn
                .query_row(
                    "SELECT Id, UserId, UniqueKey, IssuedAt FROM Users WHERE UserId = ?1",
                    [user_id],
                    IssuanceRecord::from_row,
                )
                .optional()?;
            Ok(record)
        })
        .await
    }

    /// Number of issued keys
    pub async fn count(&self) -> Result<u64, StoreError> {
        self.run("count", |conn, _| {
            let count: i64 = conn.query_row("SELECT COUNT(*) FROM Users", [], |row| row.get(0))?;
            Ok(count as u64)
        })
        .await
    }

    /// Every issued record in insertion order.
    ///
    /// Rows are fetched a page at a time as the stream is polled. Each call
    /// starts a new scan from the beginning. A failed page ends the stream
    /// after yielding the error.
    pub fn list_all(&self) -> impl Stream<Item = Result<IssuanceRecord, StoreError>> + Send + 'static {
        let scan = Scan {
            store: self.clone(),
            after_id: 0,
            buffer: VecDeque::new(),
            exhausted: false,
        };

        futures::stream::unfold(scan, |mut scan| async move {
            loop {
                if let Some(record) = scan.buffer.pop_front() {
                    scan.after_id = record.id;
                    return Some((Ok(record), scan));
                }
                if scan.exhausted {
                    return None;
                }
                match scan.store.fetch_page(scan.after_id).await {
                    Ok(page) => {
                        scan.exhausted = page.len() < scan.store.page_size;
                        scan.buffer.extend(page);
                    }
                    Err(e) => {
                        scan.exhausted = true;
                        return Some((Err(e), scan));
                    }
                }
            }
        })
    }

    /// Collect `list_all` into a vector
    pub async fn all_records(&self) -> Result<Vec<IssuanceRecord>, StoreError> {
        self.list_all().try_collect().await
    }

    async fn fetch_page(&self, after_id: i64) -> Result<Vec<IssuanceRecord>, StoreError> {
        let limit = self.page_size as i64;
        self.run("list_all", move |conn, _| {
            let mut stmt = conn.prepare_cached(
                "SELECT Id, UserId, UniqueKey, IssuedAt FROM Users
                 WHERE Id > ?1 ORDER BY Id LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![after_id, limit], IssuanceRecord::from_row)?;
            let mut page = Vec::new();
            for row in rows {
                page.push(row?);
            }
            Ok(page)
        })
        .await
    }

    /// Run `op` against the connection on the blocking pool, bounded by the
    /// store deadline.
    ///
    /// When the deadline passes first, the operation is abandoned: a running
    /// statement is interrupted and any write it made is rolled back by
    /// `OpGate::commit`. An operation that committed just as the deadline
    /// passed reports its real result instead.
    async fn run<T, F>(&self, name: &'static str, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&Connection, &OpGate) -> Result<T, StoreError> + Send + 'static,
    {
        let gate = Arc::new(OpGate::new(Arc::clone(&self.interrupt)));
        let conn = Arc::clone(&self.conn);
        let op_gate = Arc::clone(&gate);
        let mut task = tokio::task::spawn_blocking(move || {
            let guard = conn
                .lock()
                .map_err(|e| StoreError::unavailable(format!("connection lock poisoned: {}", e)))?;
            if !op_gate.begin() {
                return Err(StoreError::unavailable("abandoned before it started"));
            }
            let result = op(&*guard, &*op_gate);
            op_gate.finish();
            result
        });

        let joined = match tokio::time::timeout(self.op_timeout, &mut task).await {
            Ok(joined) => joined,
            Err(_) if gate.abandon() => {
                return Err(StoreError::unavailable(format!(
                    "{} exceeded deadline of {:?}",
                    name, self.op_timeout
                )));
            }
            Err(_) => task.await,
        };
        joined.map_err(|e| StoreError::unavailable(format!("{} task failed: {}", name, e)))?
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Queued,
    Running,
    Committed,
    Finished,
    Abandoned,
}

/// Settles the race between an operation finishing and its caller giving up.
/// Exactly one side wins; a write commits only if the caller is still waiting.
pub(crate) struct OpGate {
    phase: Mutex<Phase>,
    interrupt: Arc<InterruptHandle>,
}

impl OpGate {
    fn new(interrupt: Arc<InterruptHandle>) -> Self {
        Self {
            phase: Mutex::new(Phase::Queued),
            interrupt,
        }
    }

    fn phase(&self) -> MutexGuard<'_, Phase> {
        self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Called with the connection held; false if the caller already gave up
    fn begin(&self) -> bool {
        let mut phase = self.phase();
        if *phase == Phase::Abandoned {
            return false;
        }
        *phase = Phase::Running;
        true
    }

    fn finish(&self) {
        let mut phase = self.phase();
        if matches!(*phase, Phase::Running | Phase::Committed) {
            *phase = Phase::Finished;
        }
    }

    /// Commit `tx` unless the caller has abandoned the operation, in which
    /// case dropping `tx` rolls it back.
    pub(crate) fn commit(&self, tx: Transaction<'_>) -> Result<(), StoreError> {
        let mut phase = self.phase();
        if *phase == Phase::Abandoned {
            return Err(StoreError::unavailable("caller gave up before commit"));
        }
        tx.commit()?;
        *phase = Phase::Committed;
        Ok(())
    }

    /// Give up on the operation. Returns false when it already committed or
    /// finished, in which case its own result stands.
    fn abandon(&self) -> bool {
        let mut phase = self.phase();
        match *phase {
            Phase::Committed | Phase::Finished => false,
            Phase::Running => {
                // Still holding the phase lock, so the statement running on the
                // connection is this operation's
                self.interrupt.interrupt();
                *phase = Phase::Abandoned;
                true
            }
            Phase::Queued | Phase::Abandoned => {
                *phase = Phase::Abandoned;
                true
            }
        }
    }
}

struct Scan {
    store: KeyIssuanceStore,
    after_id: i64,
    buffer: VecDeque<IssuanceRecord>,
    exhausted: bool,
}

fn now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}
