//! Shared in-memory store.
//!
//! A [`MemoryDatabase`] is a handle to committed table data plus the row-lock
//! table. Connections opened from the same database (or from clones of the
//! handle) see each other's committed writes and contend on the same locks.

use crate::connection::MemoryConnection;
use asupersync::{Cx, Outcome};
use ormtx_core::{BeginOptions, Dialect, Error, QueryError, QueryErrorKind, Statement, Value};
use ormtx_pool::ConnectionFactory;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Column name to value.
pub type Record = BTreeMap<String, Value>;

/// A row address: table name and internal row id.
pub(crate) type RowRef = (String, u64);

/// Configuration for an in-memory database.
#[derive(Debug, Clone)]
pub struct MemoryConfig {
    /// Dialect reported by connections; decides whether reads open transactions
    pub dialect: Dialect,
    /// How long a waiting lock request blocks before failing with `LockTimeout`
    pub lock_timeout: Duration,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            dialect: Dialect::Postgres,
            lock_timeout: Duration::from_secs(5),
        }
    }
}

impl MemoryConfig {
    /// Set the reported dialect.
    pub fn dialect(mut self, dialect: Dialect) -> Self {
        self.dialect = dialect;
        self
    }

    /// Set the lock wait timeout.
    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }
}

pub(crate) struct Table {
    pub(crate) key: Vec<String>,
    pub(crate) rows: BTreeMap<u64, Record>,
    next_row_id: u64,
}

impl Table {
    pub(crate) fn allocate_row_id(&mut self) -> u64 {
        self.next_row_id += 1;
        self.next_row_id
    }
}

#[derive(Default)]
pub(crate) struct Store {
    pub(crate) tables: HashMap<String, Table>,
    /// Row lock owner by connection id
    pub(crate) locks: HashMap<RowRef, u64>,
    /// Waiting connection id to the connection holding the lock it waits for
    waits_for: HashMap<u64, u64>,
    begins: Vec<BeginOptions>,
    statements: Vec<Statement>,
    injected: VecDeque<QueryErrorKind>,
    commits: usize,
    rollbacks: usize,
}

impl Store {
    pub(crate) fn table(&self, name: &str) -> Result<&Table, Error> {
        self.tables.get(name).ok_or_else(|| unknown_table(name))
    }

    pub(crate) fn table_mut(&mut self, name: &str) -> Result<&mut Table, Error> {
        self.tables.get_mut(name).ok_or_else(|| unknown_table(name))
    }

    pub(crate) fn record_begin(&mut self, options: BeginOptions) {
        self.begins.push(options);
    }

    pub(crate) fn record_statement(&mut self, statement: &Statement) -> Result<(), Error> {
        self.statements.push(statement.clone());
        match self.injected.pop_front() {
            Some(kind) => Err(Error::Query(QueryError {
                kind,
                sql: Some(statement.to_sql(Dialect::Postgres).0),
                message: format!("injected {kind:?} failure"),
                source: None,
            })),
            None => Ok(()),
        }
    }

    pub(crate) fn record_end(&mut self, committed: bool) {
        if committed {
            self.commits += 1;
        } else {
            self.rollbacks += 1;
        }
    }

    /// Release every lock held by `owner`.
    pub(crate) fn release_locks(&mut self, owner: u64) -> usize {
        let before = self.locks.len();
        self.locks.retain(|_, holder| *holder != owner);
        self.waits_for.remove(&owner);
        before - self.locks.len()
    }

    /// Would `waiter` waiting on `holder` close a cycle?
    fn closes_cycle(&self, waiter: u64, holder: u64) -> bool {
        let mut current = holder;
        for _ in 0..=self.waits_for.len() {
            if current == waiter {
                return true;
            }
            match self.waits_for.get(&current) {
                Some(next) => current = *next,
                None => return false,
            }
        }
        false
    }
}

fn unknown_table(name: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::NotFound,
        sql: None,
        message: format!("no such table: {name}"),
        source: None,
    })
}

pub(crate) struct Shared {
    pub(crate) config: MemoryConfig,
    store: Mutex<Store>,
    released: Condvar,
    next_connection_id: AtomicU64,
}

impl Shared {
    pub(crate) fn lock_store(&self) -> MutexGuard<'_, Store> {
        self.store.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub(crate) fn notify_released(&self) {
        self.released.notify_all();
    }

    /// Take the row lock on `row` for `owner`, waiting according to `wait`.
    ///
    /// The store guard is released while waiting and handed back on return.
    pub(crate) fn acquire_row_lock<'a>(
        &'a self,
        mut store: MutexGuard<'a, Store>,
        owner: u64,
        row: &RowRef,
        wait: bool,
    ) -> (MutexGuard<'a, Store>, Result<(), Error>) {
        let deadline = Instant::now() + self.config.lock_timeout;
        loop {
            let holder = match store.locks.get(row) {
                None => {
                    store.locks.insert(row.clone(), owner);
                    store.waits_for.remove(&owner);
                    return (store, Ok(()));
                }
                Some(holder) if *holder == owner => return (store, Ok(())),
                Some(holder) => *holder,
            };

            if !wait {
                tracing::debug!(table = %row.0, row = row.1, holder, "Row locked, not waiting");
                return (
                    store,
                    Err(lock_error(
                        QueryErrorKind::LockNotAvailable,
                        format!("could not obtain lock on row in relation \"{}\"", row.0),
                    )),
                );
            }

            if store.closes_cycle(owner, holder) {
                store.waits_for.remove(&owner);
                tracing::debug!(connection = owner, holder, "Deadlock detected");
                return (
                    store,
                    Err(lock_error(
                        QueryErrorKind::Deadlock,
                        "deadlock detected".to_string(),
                    )),
                );
            }

            let now = Instant::now();
            if now >= deadline {
                store.waits_for.remove(&owner);
                return (
                    store,
                    Err(lock_error(
                        QueryErrorKind::LockTimeout,
                        format!("lock wait timeout on relation \"{}\"", row.0),
                    )),
                );
            }

            store.waits_for.insert(owner, holder);
            tracing::trace!(connection = owner, holder, "Waiting for row lock");
            let (guard, _) = self
                .released
                .wait_timeout(store, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            store = guard;
        }
    }
}

fn lock_error(kind: QueryErrorKind, message: String) -> Error {
    Error::Query(QueryError {
        kind,
        sql: None,
        message,
        source: None,
    })
}

/// Handle to an in-memory database.
///
/// Cloning the handle shares the underlying store.
#[derive(Clone)]
pub struct MemoryDatabase {
    pub(crate) shared: Arc<Shared>,
}

impl Default for MemoryDatabase {
    fn default() -> Self {
        Self::new(MemoryConfig::default())
    }
}

impl std::fmt::Debug for MemoryDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryDatabase")
            .field("config", &self.shared.config)
            .finish_non_exhaustive()
    }
}

impl MemoryDatabase {
    /// Create an empty database.
    pub fn new(config: MemoryConfig) -> Self {
        Self {
            shared: Arc::new(Shared {
                config,
                store: Mutex::new(Store::default()),
                released: Condvar::new(),
                next_connection_id: AtomicU64::new(0),
            }),
        }
    }

    /// Get the database configuration.
    pub fn config(&self) -> &MemoryConfig {
        &self.shared.config
    }

    /// Create a table whose rows are identified by `key` columns.
    ///
    /// Creating an existing table is a no-op.
    pub fn create_table(&self, name: &str, key: &[&str]) {
        let mut store = self.shared.lock_store();
        store.tables.entry(name.to_string()).or_insert_with(|| Table {
            key: key.iter().map(|c| (*c).to_string()).collect(),
            rows: BTreeMap::new(),
            next_row_id: 0,
        });
    }

    /// Insert a committed row directly, bypassing transactions.
    pub fn insert_row(&self, table: &str, row: &[(&str, Value)]) -> Result<(), Error> {
        let mut store = self.shared.lock_store();
        let table = store.table_mut(table)?;
        let record: Record = row
            .iter()
            .map(|(col, val)| ((*col).to_string(), val.clone()))
            .collect();
        let id = table.allocate_row_id();
        table.rows.insert(id, record);
        Ok(())
    }

    /// Committed rows of `table` matching every `(column, value)` pair.
    pub fn committed_rows(&self, table: &str, filter: &[(&str, Value)]) -> Vec<Record> {
        let store = self.shared.lock_store();
        let Ok(table) = store.table(table) else {
            return Vec::new();
        };
        table
            .rows
            .values()
            .filter(|record| {
                filter
                    .iter()
                    .all(|(col, val)| record.get(*col).unwrap_or(&Value::Null).same_as(val))
            })
            .cloned()
            .collect()
    }

    /// Committed value of one column of the row identified by `key`.
    pub fn committed_value(&self, table: &str, key: &[(&str, Value)], column: &str) -> Option<Value> {
        self.committed_rows(table, key)
            .into_iter()
            .next()
            .and_then(|mut record| record.remove(column))
    }

    /// Open a new connection.
    pub fn connect(&self) -> MemoryConnection {
        let id = self.shared.next_connection_id.fetch_add(1, Ordering::SeqCst) + 1;
        tracing::debug!(connection = id, "Opened in-memory connection");
        MemoryConnection::new(id, Arc::clone(&self.shared))
    }

    /// Number of connections opened so far.
    pub fn connections_opened(&self) -> u64 {
        self.shared.next_connection_id.load(Ordering::SeqCst)
    }

    /// Options of every transaction begun so far, in order.
    pub fn begin_log(&self) -> Vec<BeginOptions> {
        self.shared.lock_store().begins.clone()
    }

    /// Every statement received so far, in order.
    pub fn statement_log(&self) -> Vec<Statement> {
        self.shared.lock_store().statements.clone()
    }

    /// Number of committed and rolled back transactions.
    pub fn transaction_counts(&self) -> (usize, usize) {
        let store = self.shared.lock_store();
        (store.commits, store.rollbacks)
    }

    /// Number of row locks currently held.
    pub fn locks_held(&self) -> usize {
        self.shared.lock_store().locks.len()
    }

    /// Make the next statement (from any connection) fail with `kind`.
    ///
    /// Used to simulate backend-detected deadlocks and serialization failures.
    pub fn fail_next_statement(&self, kind: QueryErrorKind) {
        self.shared.lock_store().injected.push_back(kind);
    }
}

impl ConnectionFactory for MemoryDatabase {
    type Connection = MemoryConnection;

    fn connect(&self, _cx: &Cx) -> impl Future<Output = Outcome<MemoryConnection, Error>> + Send {
        let conn = MemoryDatabase::connect(self);
        async move { Outcome::Ok(conn) }
    }
}
