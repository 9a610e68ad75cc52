//! Session and transaction engine for ormtx.
//!
//! `ormtx-session` is the **unit-of-work layer**. It coordinates the object
//! cache, per-transaction attribute tracking, optimistic commit checks,
//! pessimistic row locks and retries over any [`ConnectionPool`].
//!
//! # Role In The Architecture
//!
//! - **Object cache**: one snapshot per loaded object, for the session's lifetime.
//! - **Access tracking**: records which attributes a transaction read or wrote.
//! - **Transaction controller**: begin policy, optimistic check, partial
//!   updates, commit/rollback.
//! - **Retry orchestrator**: re-runs a unit of work in a fresh session when it
//!   fails with a retryable failure.
//!
//! # Design Philosophy
//!
//! - **Explicit session**: every data operation takes `&mut Session`; there
//!   is no ambient global session.
//! - **Lazy connection**: the connection is acquired right before the first
//!   statement, not when the session opens.
//! - **Cancel-correct**: all async operations use `Cx` + `Outcome`.
//!
//! # Example
//!
//! ```ignore
//! let outcome = db_session(&cx, &pool, SessionConfig::new().retry(3), async |s| {
//!     let Some(account) = try_outcome!(s.get(&cx, &ACCOUNT, &[Value::BigInt(1)]).await) else {
//!         return Outcome::Ok(());
//!     };
//!     let balance = try_outcome!(s.read(&cx, &account, "balance").await);
//!     let balance = balance.as_i64().unwrap_or_default();
//!     s.write(&cx, &account, "balance", balance - 10).await
//! })
//! .await;
//! ```

pub mod access_tracker;
pub mod config;
pub mod object_cache;
pub mod retry;
pub mod transaction;

pub use access_tracker::{AccessTracker, TrackedAttribute};
pub use config::{FailureFilter, SessionConfig, SessionSettings};
pub use object_cache::{CachedObject, ObjectCache, ObjectKey, ObjectState};
pub use retry::{RetryOrchestrator, db_session};
pub use transaction::{
    FlushResult, LockRequest, TransactionController, TransactionState, translate_driver_error,
};

use asupersync::{Cx, Outcome};
use object_cache::split_row;
use ormtx_core::{
    ConnectionPool, Entity, Error, Row, SessionErrorKind, Statement, TransactionError,
    TransactionErrorKind, Value, WaitPolicy, try_outcome, try_result,
};
use std::collections::HashMap;
use std::sync::Arc;

/// Counters describing what a session did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Connections taken from the pool (0 or 1).
    pub connections_acquired: usize,
    /// Statements sent to the driver.
    pub statements: usize,
    /// Transactions committed.
    pub commits: usize,
    /// Transactions rolled back.
    pub rollbacks: usize,
    /// `get` calls served from the cache.
    pub cache_hits: usize,
    /// `get` calls that went to the database.
    pub cache_misses: usize,
    /// Lazy columns fetched on first read.
    pub lazy_loads: usize,
}

/// Snapshot of session state for debugging.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDebugInfo {
    pub depth: usize,
    pub open: bool,
    pub has_connection: bool,
    pub transaction: TransactionState,
    pub cached: usize,
    pub tracked: usize,
    pub dirty: usize,
    pub locks: usize,
    pub statements: usize,
}

/// A database session.
///
/// A session owns at most one connection, an object cache and a transaction
/// controller. [`Session::open`] is the outermost scope entry; nested scopes
/// ([`Session::enter`] / [`Session::exit`], or [`Session::scope`]) reuse the
/// same connection and cache. Only the outermost exit commits (or rolls
/// back), evicts the cache and returns the connection to the pool. After
/// that the session is closed and data operations fail with
/// `SessionRequired`.
pub struct Session<P: ConnectionPool> {
    pool: Arc<P>,
    connection: Option<P::Connection>,
    config: SessionConfig,
    depth: usize,
    closed: bool,
    retry_managed: bool,
    cache: ObjectCache,
    tracker: AccessTracker,
    transaction: TransactionController,
    stats: SessionStats,
}

impl<P: ConnectionPool> std::fmt::Debug for Session<P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("depth", &self.depth)
            .field("closed", &self.closed)
            .field("has_connection", &self.connection.is_some())
            .field("transaction", &self.transaction.state())
            .field("cached", &self.cache.len())
            .finish_non_exhaustive()
    }
}

impl<P: ConnectionPool> Session<P> {
    /// Open an outermost session scope.
    ///
    /// No connection is acquired until the first statement.
    pub fn open(pool: Arc<P>, config: SessionConfig) -> Result<Self, Error> {
        config.validate()?;
        tracing::debug!(
            serializable = config.serializable,
            immediate = config.immediate,
            optimistic = config.optimistic,
            "Session opened"
        );
        let transaction =
            TransactionController::new(config.begin_options(), config.optimistic, config.sql_debug);
        Ok(Self {
            pool,
            connection: None,
            config,
            depth: 1,
            closed: false,
            retry_managed: false,
            cache: ObjectCache::new(),
            tracker: AccessTracker::new(),
            transaction,
            stats: SessionStats::default(),
        })
    }

    // ========================================================================
    // Scopes
    // ========================================================================

    /// Enter a nested scope.
    pub fn enter(&mut self) -> Result<usize, Error> {
        if self.closed {
            return Err(Error::session_required("enter"));
        }
        self.depth += 1;
        tracing::trace!(depth = self.depth, "Entered nested session scope");
        Ok(self.depth)
    }

    /// Enter a nested scope that carries its own configuration.
    ///
    /// Nested scopes cannot retry; isolation requests that differ from the
    /// open session are ignored.
    pub fn enter_with(&mut self, config: &SessionConfig) -> Result<usize, Error> {
        if self.closed {
            return Err(Error::session_required("enter"));
        }
        config.validate_nested(&self.config)?;
        self.enter()
    }

    /// Leave a scope.
    ///
    /// `failure` is the failure propagating out of the scope, if any. Nested
    /// exits only decrement the depth. The outermost exit commits when there
    /// is no failure or the failure is allowed, rolls back otherwise, then
    /// evicts the cache and releases the connection. A failed teardown
    /// commit is returned after the session has been torn down.
    #[tracing::instrument(level = "debug", skip(self, cx, failure), fields(depth = self.depth, failing = failure.is_some()))]
    pub async fn exit(&mut self, cx: &Cx, failure: Option<&Error>) -> Outcome<(), Error> {
        self.exit_inner(cx, failure, false).await
    }

    /// Leave a scope; `force_rollback` skips the allowed-failure check.
    async fn exit_inner(
        &mut self,
        cx: &Cx,
        failure: Option<&Error>,
        force_rollback: bool,
    ) -> Outcome<(), Error> {
        if self.closed {
            return Outcome::Err(Error::session_required("exit"));
        }
        self.depth -= 1;
        if self.depth > 0 {
            return Outcome::Ok(());
        }

        let commit = !force_rollback && failure.is_none_or(|e| self.config.allowed.matches(e));
        let result = if commit {
            match self.commit_internal(cx).await {
                Outcome::Ok(_) => Outcome::Ok(()),
                Outcome::Err(e) => Outcome::Err(e),
                Outcome::Cancelled(r) => Outcome::Cancelled(r),
                Outcome::Panicked(p) => Outcome::Panicked(p),
            }
        } else {
            if let Some(e) = failure {
                tracing::debug!(error = %e, "Rolling back on failure");
            }
            match self.rollback_internal(cx).await {
                Outcome::Err(e) => {
                    tracing::warn!(error = %e, "Rollback at session exit failed");
                    Outcome::Ok(())
                }
                other => other,
            }
        };

        self.cache.clear();
        self.tracker.clear();
        self.release_connection();
        self.closed = true;
        tracing::debug!(
            statements = self.stats.statements,
            commits = self.stats.commits,
            rollbacks = self.stats.rollbacks,
            "Session closed"
        );
        result
    }

    /// Run `work` in a nested scope, exiting on every path.
    pub async fn scope<T>(
        &mut self,
        cx: &Cx,
        work: impl AsyncFnOnce(&mut Self) -> Outcome<T, Error>,
    ) -> Outcome<T, Error> {
        try_result!(self.enter());
        let outcome = work(self).await;
        finish_scope(self, cx, outcome).await
    }

    // ========================================================================
    // Object API
    // ========================================================================

    /// Get an object by key, from the cache when possible.
    ///
    /// Returns `None` if no such row exists or the object is pending deletion.
    #[tracing::instrument(level = "debug", skip(self, cx, entity, key), fields(table = entity.table))]
    pub async fn get(
        &mut self,
        cx: &Cx,
        entity: &Entity,
        key: &[Value],
    ) -> Outcome<Option<ObjectKey>, Error> {
        if self.closed {
            return Outcome::Err(Error::session_required("get"));
        }
        let object_key = ObjectKey::new(entity, key);
        if let Some(object) = self.cache.get(&object_key) {
            self.stats.cache_hits += 1;
            tracing::trace!(pk_hash = object_key.pk_hash(), "Cache hit");
            return Outcome::Ok((object.state() != ObjectState::Deleted).then_some(object_key));
        }
        self.stats.cache_misses += 1;

        let statement = Statement::Select {
            table: entity.table.to_string(),
            columns: column_names(&entity.eager_columns()),
            filter: entity.key_filter(key),
            lock: None,
        };
        let rows = try_outcome!(self.run_query(cx, &statement).await);
        match rows.first() {
            Some(row) => Outcome::Ok(try_result!(self.absorb_row(entity, row, false))),
            None => Outcome::Ok(None),
        }
    }

    /// Get an object by key, taking a row lock.
    ///
    /// Always fetches from the database. With [`WaitPolicy::NoWait`], a row
    /// locked elsewhere fails immediately with `LockUnavailable`.
    #[tracing::instrument(level = "debug", skip(self, cx, entity, key), fields(table = entity.table))]
    pub async fn get_for_update(
        &mut self,
        cx: &Cx,
        entity: &Entity,
        key: &[Value],
        wait: WaitPolicy,
    ) -> Outcome<Option<ObjectKey>, Error> {
        let filter = entity.key_filter(key);
        let locked = try_outcome!(self.fetch(cx, entity, filter, Some(wait)).await);
        Outcome::Ok(locked.into_iter().next())
    }

    /// Select objects whose columns equal the given values.
    pub async fn select(
        &mut self,
        cx: &Cx,
        entity: &Entity,
        filter: &[(&str, Value)],
    ) -> Outcome<Vec<ObjectKey>, Error> {
        let filter = owned_filter(filter);
        self.fetch(cx, entity, filter, None).await
    }

    /// Select objects and lock their rows.
    pub async fn for_update(
        &mut self,
        cx: &Cx,
        entity: &Entity,
        filter: &[(&str, Value)],
        wait: WaitPolicy,
    ) -> Outcome<Vec<ObjectKey>, Error> {
        let filter = owned_filter(filter);
        self.fetch(cx, entity, filter, Some(wait)).await
    }

    async fn fetch(
        &mut self,
        cx: &Cx,
        entity: &Entity,
        filter: Vec<(String, Value)>,
        lock: Option<WaitPolicy>,
    ) -> Outcome<Vec<ObjectKey>, Error> {
        if self.closed {
            return Outcome::Err(Error::session_required("select"));
        }
        let statement = Statement::Select {
            table: entity.table.to_string(),
            columns: column_names(&entity.eager_columns()),
            filter,
            lock,
        };
        let rows = try_outcome!(self.run_query(cx, &statement).await);
        let mut keys = Vec::with_capacity(rows.len());
        for row in &rows {
            if let Some(key) = try_result!(self.absorb_row(entity, row, lock.is_some())) {
                if let Some(wait) = lock {
                    self.transaction.record_lock(key, wait);
                }
                keys.push(key);
            }
        }
        Outcome::Ok(keys)
    }

    /// Merge a fetched row into the cache.
    ///
    /// Attributes already read or written in this transaction must still
    /// have their original value; anything else is refreshed from the row.
    fn absorb_row(
        &mut self,
        entity: &Entity,
        row: &Row,
        locked: bool,
    ) -> Result<Option<ObjectKey>, Error> {
        let (key_values, values) = split_row(entity, row)?;
        let key = ObjectKey::new(entity, &key_values);

        let Some(object) = self.cache.get_mut(&key) else {
            let key = self
                .cache
                .insert(*entity, key_values, values, ObjectState::Persistent);
            if locked {
                if let Some(object) = self.cache.get_mut(&key) {
                    object.set_locked(true);
                }
            }
            return Ok(Some(key));
        };

        match object.state() {
            ObjectState::Deleted => return Ok(None),
            ObjectState::New => return Ok(Some(key)),
            ObjectState::Persistent => {}
        }
        for (column, value) in values {
            match self.tracker.get(&key, column) {
                Some(tracked) if !tracked.original.same_as(&value) => {
                    tracing::debug!(
                        object = %object.describe(),
                        column,
                        "Unrepeatable read detected"
                    );
                    return Err(Error::Transaction(TransactionError {
                        kind: TransactionErrorKind::UnrepeatableRead,
                        message: format!(
                            "value of {column} was changed from {} to {value} by another transaction",
                            tracked.original
                        ),
                        object: Some(object.describe()),
                    }));
                }
                Some(_) => {}
                None => object.set_value(column, value),
            }
        }
        if locked {
            object.set_locked(true);
        }
        Ok(Some(key))
    }

    /// Read an attribute, loading it first if it is lazy.
    #[tracing::instrument(level = "trace", skip(self, cx, object), fields(pk_hash = object.pk_hash()))]
    pub async fn read(&mut self, cx: &Cx, object: &ObjectKey, attr: &str) -> Outcome<Value, Error> {
        let column = try_result!(self.resolve(object, attr, "read"));
        let Some(cached) = self.cache.get(object) else {
            return Outcome::Err(unknown_object(object));
        };
        if cached.state() == ObjectState::New {
            return Outcome::Ok(cached.value(column).cloned().unwrap_or(Value::Null));
        }
        if cached.entity().is_key(column) {
            return Outcome::Ok(cached.value(column).cloned().unwrap_or(Value::Null));
        }
        if let Some(tracked) = self.tracker.get(object, column) {
            let persisted = tracked.original.clone();
            return Outcome::Ok(self.tracker.on_read(*object, column, &persisted));
        }
        let persisted = try_outcome!(self.persisted_value(cx, object, column).await);
        Outcome::Ok(self.tracker.on_read(*object, column, &persisted))
    }

    /// Write an attribute. The change is sent at the next flush or commit.
    #[tracing::instrument(level = "trace", skip(self, cx, object, value), fields(pk_hash = object.pk_hash()))]
    pub async fn write(
        &mut self,
        cx: &Cx,
        object: &ObjectKey,
        attr: &str,
        value: impl Into<Value>,
    ) -> Outcome<(), Error> {
        let value = value.into();
        let column = try_result!(self.resolve(object, attr, "write"));
        let Some(cached) = self.cache.get_mut(object) else {
            return Outcome::Err(unknown_object(object));
        };
        if cached.entity().is_key(column) {
            return Outcome::Err(Error::session(
                SessionErrorKind::ReadOnlyAttribute,
                format!("{} is part of the key of {}", column, cached.describe()),
            ));
        }
        if cached.state() == ObjectState::New {
            cached.set_value(column, value);
            return Outcome::Ok(());
        }

        let persisted = match self.tracker.get(object, column) {
            Some(tracked) => tracked.original.clone(),
            None => try_outcome!(self.persisted_value(cx, object, column).await),
        };
        self.tracker.on_write(*object, column, &persisted, value);
        self.transaction.mark_dirty(*object);
        Outcome::Ok(())
    }

    /// Persisted value of a column, fetching it when it is a lazy column not
    /// loaded yet.
    async fn persisted_value(
        &mut self,
        cx: &Cx,
        object: &ObjectKey,
        column: &'static str,
    ) -> Outcome<Value, Error> {
        let Some(cached) = self.cache.get(object) else {
            return Outcome::Err(unknown_object(object));
        };
        if let Some(value) = cached.value(column) {
            return Outcome::Ok(value.clone());
        }
        if !cached.entity().is_lazy(column) {
            return Outcome::Ok(Value::Null);
        }

        let entity = *cached.entity();
        let describe = cached.describe();
        let statement = Statement::Select {
            table: entity.table.to_string(),
            columns: vec![column.to_string()],
            filter: entity.key_filter(cached.key()),
            lock: None,
        };
        tracing::debug!(object = %describe, column, "Loading lazy attribute");
        let rows = try_outcome!(self.run_query(cx, &statement).await);
        let Some(value) = rows.first().and_then(|row| row.get_by_name(column)).cloned() else {
            return Outcome::Err(Error::optimistic_check(
                describe,
                "object was deleted by another transaction",
            ));
        };
        self.stats.lazy_loads += 1;
        if let Some(cached) = self.cache.get_mut(object) {
            cached.set_value(column, value.clone());
        }
        Outcome::Ok(value)
    }

    /// Create a new object. It is inserted at the next flush or commit.
    ///
    /// An object pending deletion must be flushed before its key can be
    /// reused.
    pub fn create(&mut self, entity: &Entity, values: &[(&str, Value)]) -> Result<ObjectKey, Error> {
        if self.closed {
            return Err(Error::session_required("create"));
        }
        let mut columns = HashMap::with_capacity(values.len());
        for (name, value) in values {
            let Some(column) = entity.column(name) else {
                return Err(unknown_attribute(entity, name));
            };
            columns.insert(column, value.clone());
        }
        let mut key = Vec::with_capacity(entity.primary_key.len());
        for col in entity.primary_key {
            let Some(value) = columns.get(col) else {
                return Err(Error::session(
                    SessionErrorKind::UnknownAttribute,
                    format!("{} requires key column {col}", entity.name),
                ));
            };
            key.push(value.clone());
        }
        let object_key = ObjectKey::new(entity, &key);
        match self.cache.get(&object_key).map(CachedObject::state) {
            Some(ObjectState::Deleted) => {
                return Err(Error::session(
                    SessionErrorKind::DuplicateObject,
                    format!(
                        "{} is pending deletion; flush before creating it again",
                        entity.describe(&key)
                    ),
                ));
            }
            Some(_) => {
                return Err(Error::session(
                    SessionErrorKind::DuplicateObject,
                    format!("{} is already in the session", entity.describe(&key)),
                ));
            }
            None => {}
        }
        let object_key = self.cache.insert(*entity, key, columns, ObjectState::New);
        self.transaction.mark_dirty(object_key);
        tracing::debug!(table = entity.table, pk_hash = object_key.pk_hash(), "Created object");
        Ok(object_key)
    }

    /// Mark an object for deletion. New objects are simply discarded.
    pub fn delete(&mut self, object: &ObjectKey) -> Result<(), Error> {
        if self.closed {
            return Err(Error::session_required("delete"));
        }
        let Some(cached) = self.cache.get_mut(object) else {
            return Err(unknown_object(object));
        };
        match cached.state() {
            ObjectState::New => {
                self.cache.remove(object);
                self.transaction.forget_dirty(object);
            }
            ObjectState::Persistent => {
                cached.set_state(ObjectState::Deleted);
                self.transaction.mark_dirty(*object);
            }
            ObjectState::Deleted => {}
        }
        Ok(())
    }

    /// Check and write pending changes inside the current transaction
    /// without committing.
    pub async fn flush(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        try_outcome!(self.ensure_connection(cx).await);
        let Some(conn) = self.connection.as_ref() else {
            return Outcome::Err(Error::session_required("flush"));
        };
        self.transaction
            .flush(cx, conn, &mut self.cache, &mut self.tracker)
            .await
    }

    // ========================================================================
    // Transaction Management
    // ========================================================================

    /// Commit the current transaction.
    ///
    /// The cache survives a commit; the tracker starts empty for the next
    /// transaction. Not allowed while a retry wrapper controls the session.
    pub async fn commit(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        try_result!(self.check_manual("commit"));
        self.commit_internal(cx).await
    }

    /// Roll back the current transaction and evict the cache.
    ///
    /// Not allowed while a retry wrapper controls the session.
    pub async fn rollback(&mut self, cx: &Cx) -> Outcome<(), Error> {
        try_result!(self.check_manual("rollback"));
        self.rollback_internal(cx).await
    }

    fn check_manual(&self, operation: &str) -> Result<(), Error> {
        if self.closed {
            return Err(Error::session_required(operation));
        }
        if self.retry_managed {
            return Err(Error::session(
                SessionErrorKind::RetryManaged,
                format!("{operation} is not allowed while a retry wrapper controls the transaction"),
            ));
        }
        Ok(())
    }

    async fn commit_internal(&mut self, cx: &Cx) -> Outcome<FlushResult, Error> {
        let pending = !self.cache.keys_in_state(ObjectState::New).is_empty()
            || !self.cache.keys_in_state(ObjectState::Deleted).is_empty()
            || !self.tracker.is_empty();
        if self.connection.is_none() && !pending {
            self.transaction.mark_committed();
            return Outcome::Ok(FlushResult::default());
        }

        try_outcome!(self.ensure_connection(cx).await);
        let Some(conn) = self.connection.as_ref() else {
            return Outcome::Err(Error::session_required("commit"));
        };
        let outcome = self
            .transaction
            .commit(cx, conn, &mut self.cache, &mut self.tracker)
            .await;
        match &outcome {
            Outcome::Ok(_) => self.stats.commits += 1,
            _ => self.stats.rollbacks += 1,
        }
        outcome
    }

    async fn rollback_internal(&mut self, cx: &Cx) -> Outcome<(), Error> {
        let outcome = self
            .transaction
            .rollback(cx, self.connection.as_ref(), &mut self.cache, &mut self.tracker)
            .await;
        self.stats.rollbacks += 1;
        outcome
    }

    // ========================================================================
    // Statement passthrough
    // ========================================================================

    /// Run an externally built row-returning statement.
    pub async fn query(&mut self, cx: &Cx, statement: &Statement) -> Outcome<Vec<Row>, Error> {
        if self.closed {
            return Outcome::Err(Error::session_required("query"));
        }
        self.run_query(cx, statement).await
    }

    /// Run an externally built modifying statement.
    ///
    /// Bypasses the object cache; cached snapshots of affected rows are not
    /// refreshed.
    pub async fn execute(&mut self, cx: &Cx, statement: &Statement) -> Outcome<u64, Error> {
        try_outcome!(self.ensure_connection(cx).await);
        let Some(conn) = self.connection.as_ref() else {
            return Outcome::Err(Error::session_required("execute"));
        };
        self.stats.statements += 1;
        self.transaction.execute(cx, conn, statement).await
    }

    async fn run_query(&mut self, cx: &Cx, statement: &Statement) -> Outcome<Vec<Row>, Error> {
        try_outcome!(self.ensure_connection(cx).await);
        let Some(conn) = self.connection.as_ref() else {
            return Outcome::Err(Error::session_required("query"));
        };
        self.stats.statements += 1;
        self.transaction.query(cx, conn, statement).await
    }

    async fn ensure_connection(&mut self, cx: &Cx) -> Outcome<(), Error> {
        if self.closed {
            return Outcome::Err(Error::session_required("statement"));
        }
        if self.connection.is_some() {
            return Outcome::Ok(());
        }
        let conn = try_outcome!(self.pool.acquire(cx).await);
        tracing::debug!("Acquired connection");
        self.stats.connections_acquired += 1;
        self.connection = Some(conn);
        Outcome::Ok(())
    }

    fn release_connection(&mut self) {
        let Some(conn) = self.connection.take() else {
            return;
        };
        if self.transaction.is_active() {
            tracing::warn!("Discarding connection with an open transaction");
            self.pool.discard(conn);
        } else {
            tracing::debug!("Released connection");
            self.pool.release(conn);
        }
    }

    fn resolve(&self, object: &ObjectKey, attr: &str, operation: &str) -> Result<&'static str, Error> {
        if self.closed {
            return Err(Error::session_required(operation));
        }
        let Some(cached) = self.cache.get(object) else {
            return Err(unknown_object(object));
        };
        if cached.state() == ObjectState::Deleted {
            return Err(Error::session(
                SessionErrorKind::UnknownObject,
                format!("{} was deleted in this session", cached.describe()),
            ));
        }
        cached
            .entity()
            .column(attr)
            .ok_or_else(|| unknown_attribute(cached.entity(), attr))
    }

    pub(crate) fn set_retry_managed(&mut self, managed: bool) {
        self.retry_managed = managed;
    }

    // ========================================================================
    // Introspection
    // ========================================================================

    /// Current nesting depth (0 once closed).
    pub fn depth(&self) -> usize {
        self.depth
    }

    /// Is the session still open?
    pub fn is_open(&self) -> bool {
        !self.closed
    }

    /// Get the session configuration.
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Does the session currently hold a connection?
    pub fn has_connection(&self) -> bool {
        self.connection.is_some()
    }

    /// The held connection, if any.
    pub fn connection(&self) -> Option<&P::Connection> {
        self.connection.as_ref()
    }

    /// Current transaction state.
    pub fn transaction_state(&self) -> TransactionState {
        self.transaction.state()
    }

    /// Whether a transaction is open.
    pub fn in_transaction(&self) -> bool {
        self.transaction.is_active()
    }

    /// Row locks held by the current transaction.
    pub fn lock_requests(&self) -> &[LockRequest] {
        self.transaction.lock_requests()
    }

    /// The object cache.
    pub fn cache(&self) -> &ObjectCache {
        &self.cache
    }

    /// The attribute access tracker.
    pub fn tracker(&self) -> &AccessTracker {
        &self.tracker
    }

    /// State of a cached object.
    pub fn object_state(&self, object: &ObjectKey) -> Option<ObjectState> {
        self.cache.get(object).map(CachedObject::state)
    }

    /// Has this attribute been loaded into the cache?
    pub fn is_loaded(&self, object: &ObjectKey, attr: &str) -> bool {
        self.cache.get(object).is_some_and(|o| o.is_loaded(attr))
    }

    /// Session counters.
    pub fn stats(&self) -> &SessionStats {
        &self.stats
    }

    /// Dump session state for debugging.
    pub fn debug_state(&self) -> SessionDebugInfo {
        SessionDebugInfo {
            depth: self.depth,
            open: !self.closed,
            has_connection: self.connection.is_some(),
            transaction: self.transaction.state(),
            cached: self.cache.len(),
            tracked: self.tracker.len(),
            dirty: self.transaction.dirty().len(),
            locks: self.transaction.lock_requests().len(),
            statements: self.transaction.statement_count(),
        }
    }
}

impl<P: ConnectionPool> Drop for Session<P> {
    fn drop(&mut self) {
        if let Some(conn) = self.connection.take() {
            tracing::warn!(depth = self.depth, "Session dropped without exit; discarding its connection");
            self.pool.discard(conn);
        }
    }
}

/// Exit the scope `work` ran in, choosing commit or rollback from its outcome.
pub(crate) async fn finish_scope<P: ConnectionPool, T>(
    session: &mut Session<P>,
    cx: &Cx,
    outcome: Outcome<T, Error>,
) -> Outcome<T, Error> {
    match outcome {
        Outcome::Ok(value) => match session.exit(cx, None).await {
            Outcome::Ok(()) => Outcome::Ok(value),
            Outcome::Err(e) => Outcome::Err(e),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        },
        Outcome::Err(e) => match session.exit(cx, Some(&e)).await {
            Outcome::Err(commit_error) => Outcome::Err(commit_error),
            _ => Outcome::Err(e),
        },
        Outcome::Cancelled(r) => {
            let _ = session.exit_inner(cx, Some(&Error::Cancelled), true).await;
            Outcome::Cancelled(r)
        }
        Outcome::Panicked(p) => {
            let panicked = Error::Custom("unit of work panicked".into());
            let _ = session.exit_inner(cx, Some(&panicked), true).await;
            Outcome::Panicked(p)
        }
    }
}

fn column_names(columns: &[&'static str]) -> Vec<String> {
    columns.iter().map(|c| (*c).to_string()).collect()
}

fn owned_filter(filter: &[(&str, Value)]) -> Vec<(String, Value)> {
    filter
        .iter()
        .map(|(col, val)| ((*col).to_string(), val.clone()))
        .collect()
}

fn unknown_object(object: &ObjectKey) -> Error {
    Error::session(
        SessionErrorKind::UnknownObject,
        format!(
            "object {:#x} of table {} is not in this session",
            object.pk_hash(),
            object.table()
        ),
    )
}

fn unknown_attribute(entity: &Entity, attr: &str) -> Error {
    Error::session(
        SessionErrorKind::UnknownAttribute,
        format!("{} has no attribute {attr}", entity.name),
    )
}
