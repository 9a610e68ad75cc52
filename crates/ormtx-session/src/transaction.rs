//! Transaction controller.
//!
//! Owns the transaction state machine of one session, decides when a
//! statement must open a transaction, maps driver failures into the
//! transaction failure taxonomy, and runs flush and commit:
//!
//! 1. **Check**: for every touched object, re-read the accessed or modified
//!    attributes and compare them with their tracked originals.
//! 2. **Write**: INSERT new objects, UPDATE only modified attributes (guarded
//!    by the checked originals), DELETE removed objects (guarded likewise).
//! 3. **Commit** the driver transaction and release row locks.
//!
//! Any failure rolls the transaction back and evicts the object cache.

use crate::{AccessTracker, ObjectCache, ObjectKey, ObjectState};
use asupersync::{Cx, Outcome};
use ormtx_core::{
    BeginOptions, Connection, Dialect, Error, QueryErrorKind, Row, Statement, TransactionError,
    TransactionErrorKind, Value, WaitPolicy,
};

/// Transaction state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TransactionState {
    /// No transaction has started since the session opened or the last one ended.
    #[default]
    NoTransaction,
    /// A driver transaction is open.
    Active,
    /// The last transaction committed.
    Committed,
    /// The last transaction rolled back.
    RolledBack,
}

/// A row lock taken by a locking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockRequest {
    /// The locked object.
    pub object: ObjectKey,
    /// Wait policy used to obtain the lock.
    pub wait: WaitPolicy,
}

/// What a flush wrote.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushResult {
    /// Number of optimistic check queries issued.
    pub checked: usize,
    /// Number of INSERT statements executed.
    pub inserted: usize,
    /// Number of UPDATE statements executed.
    pub updated: usize,
    /// Number of DELETE statements executed.
    pub deleted: usize,
}

impl FlushResult {
    /// Total number of write statements.
    pub fn writes(&self) -> usize {
        self.inserted + self.updated + self.deleted
    }
}

/// Drives begin/commit/rollback for one session.
#[derive(Debug)]
pub struct TransactionController {
    state: TransactionState,
    options: BeginOptions,
    optimistic: bool,
    sql_debug: bool,
    statements: usize,
    dirty: Vec<ObjectKey>,
    locks: Vec<LockRequest>,
}

impl TransactionController {
    /// Create a controller.
    pub fn new(options: BeginOptions, optimistic: bool, sql_debug: bool) -> Self {
        Self {
            state: TransactionState::NoTransaction,
            options,
            optimistic,
            sql_debug,
            statements: 0,
            dirty: Vec::new(),
            locks: Vec::new(),
        }
    }

    /// Current state.
    pub fn state(&self) -> TransactionState {
        self.state
    }

    /// Is a driver transaction open?
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Statements sent in the current transaction.
    pub fn statement_count(&self) -> usize {
        self.statements
    }

    /// Objects with unflushed changes, in the order they became dirty.
    pub fn dirty(&self) -> &[ObjectKey] {
        &self.dirty
    }

    /// Row locks held by the current transaction.
    pub fn lock_requests(&self) -> &[LockRequest] {
        &self.locks
    }

    pub(crate) fn mark_dirty(&mut self, key: ObjectKey) {
        if !self.dirty.contains(&key) {
            self.dirty.push(key);
        }
    }

    pub(crate) fn forget_dirty(&mut self, key: &ObjectKey) {
        self.dirty.retain(|k| k != key);
    }

    pub(crate) fn record_lock(&mut self, object: ObjectKey, wait: WaitPolicy) {
        if !self.locks.iter().any(|l| l.object == object) {
            self.locks.push(LockRequest { object, wait });
        }
    }

    /// Open a driver transaction if `statement` needs one and none is open.
    async fn begin_if_needed<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        statement: &Statement,
    ) -> Outcome<(), Error> {
        if self.is_active() {
            return Outcome::Ok(());
        }
        let needed = statement.requires_transaction()
            || self.options.immediate
            || conn.dialect().reads_start_transaction();
        if !needed {
            self.state = TransactionState::NoTransaction;
            return Outcome::Ok(());
        }

        match conn.begin(cx, self.options).await {
            Outcome::Ok(()) => {
                tracing::debug!(
                    isolation = self.options.isolation.as_sql(),
                    immediate = self.options.immediate,
                    "Transaction started"
                );
                self.state = TransactionState::Active;
                self.statements = 0;
                Outcome::Ok(())
            }
            Outcome::Err(e) => Outcome::Err(translate_driver_error(e)),
            Outcome::Cancelled(r) => Outcome::Cancelled(r),
            Outcome::Panicked(p) => Outcome::Panicked(p),
        }
    }

    fn log_statement(&mut self, dialect: Dialect, statement: &Statement) {
        if self.is_active() {
            self.statements += 1;
        }
        let (sql, params) = statement.to_sql(dialect);
        if self.sql_debug {
            tracing::info!(sql = %sql, params = ?params, "Executing statement");
        } else {
            tracing::debug!(sql = %sql, params = ?params, "Executing statement");
        }
    }

    /// Run a row-returning statement under the transaction-start policy.
    pub async fn query<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        statement: &Statement,
    ) -> Outcome<Vec<Row>, Error> {
        ormtx_core::try_outcome!(self.begin_if_needed(cx, conn, statement).await);
        self.log_statement(conn.dialect(), statement);
        translate_outcome(conn.query(cx, statement).await)
    }

    /// Run a modifying statement under the transaction-start policy.
    pub async fn execute<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        statement: &Statement,
    ) -> Outcome<u64, Error> {
        ormtx_core::try_outcome!(self.begin_if_needed(cx, conn, statement).await);
        self.log_statement(conn.dialect(), statement);
        translate_outcome(conn.execute(cx, statement).await)
    }

    /// Check touched objects and write pending changes, without committing.
    #[tracing::instrument(level = "debug", skip_all, fields(tracked = tracker.len(), cached = cache.len()))]
    pub async fn flush<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        cache: &mut ObjectCache,
        tracker: &mut AccessTracker,
    ) -> Outcome<FlushResult, Error> {
        let mut result = FlushResult::default();

        if self.optimistic {
            for key in tracker.objects().to_vec() {
                let Some(object) = cache.get(&key) else {
                    continue;
                };
                if object.state() == ObjectState::New || object.is_locked() {
                    continue;
                }
                let checked = checked_attributes(tracker, &key, object.entity());
                if checked.is_empty() {
                    continue;
                }
                let entity = *object.entity();
                let describe = object.describe();
                let statement = Statement::Select {
                    table: entity.table.to_string(),
                    columns: checked.iter().map(|(c, _)| (*c).to_string()).collect(),
                    filter: entity.key_filter(object.key()),
                    lock: None,
                };
                let rows = ormtx_core::try_outcome!(self.query(cx, conn, &statement).await);
                result.checked += 1;
                let Some(row) = rows.first() else {
                    tracing::debug!(object = %describe, "Optimistic check failed: row is gone");
                    return Outcome::Err(Error::optimistic_check(
                        describe,
                        "object was deleted by another transaction",
                    ));
                };
                for (column, original) in &checked {
                    let persisted = row.get_by_name(column).unwrap_or(&Value::Null);
                    if !persisted.same_as(original) {
                        tracing::debug!(
                            object = %describe,
                            column,
                            %original,
                            %persisted,
                            "Optimistic check failed"
                        );
                        return Outcome::Err(Error::optimistic_check(
                            describe,
                            format!(
                                "value of {column} was changed from {original} to {persisted} by another transaction"
                            ),
                        ));
                    }
                }
            }
        }

        for key in cache.keys_in_state(ObjectState::New) {
            let Some(object) = cache.get(&key) else {
                continue;
            };
            let (columns, values): (Vec<String>, Vec<Value>) = object
                .loaded_values()
                .into_iter()
                .map(|(col, val)| (col.to_string(), val.clone()))
                .unzip();
            let statement = Statement::Insert {
                table: object.entity().table.to_string(),
                columns,
                values,
            };
            ormtx_core::try_outcome!(self.execute(cx, conn, &statement).await);
            result.inserted += 1;
            if let Some(object) = cache.get_mut(&key) {
                object.set_state(ObjectState::Persistent);
            }
        }

        for key in tracker.objects().to_vec() {
            let Some(object) = cache.get(&key) else {
                continue;
            };
            if object.state() != ObjectState::Persistent {
                continue;
            }
            let modified = tracker.modified(&key);
            if modified.is_empty() {
                continue;
            }
            let entity = *object.entity();
            let describe = object.describe();
            let guards = if self.optimistic && !object.is_locked() {
                guard_conditions(&checked_attributes(tracker, &key, &entity))
            } else {
                Vec::new()
            };
            let statement = Statement::Update {
                table: entity.table.to_string(),
                key: entity.key_filter(object.key()),
                assignments: modified
                    .iter()
                    .map(|(col, val)| ((*col).to_string(), val.clone()))
                    .collect(),
                guards,
            };
            let affected = ormtx_core::try_outcome!(self.execute(cx, conn, &statement).await);
            if affected == 0 {
                return Outcome::Err(Error::optimistic_check(
                    describe,
                    "object was changed or deleted by another transaction before update",
                ));
            }
            result.updated += 1;
            if let Some(object) = cache.get_mut(&key) {
                for (col, val) in modified {
                    object.set_value(col, val);
                }
            }
        }

        for key in cache.keys_in_state(ObjectState::Deleted) {
            let Some(object) = cache.get(&key) else {
                continue;
            };
            let entity = *object.entity();
            let describe = object.describe();
            let guards = if self.optimistic && !object.is_locked() {
                guard_conditions(&checked_attributes(tracker, &key, &entity))
            } else {
                Vec::new()
            };
            let statement = Statement::Delete {
                table: entity.table.to_string(),
                key: entity.key_filter(object.key()),
                guards,
            };
            let affected = ormtx_core::try_outcome!(self.execute(cx, conn, &statement).await);
            if affected == 0 {
                return Outcome::Err(Error::optimistic_check(
                    describe,
                    "object was changed or deleted by another transaction before delete",
                ));
            }
            result.deleted += 1;
            cache.remove(&key);
            tracker.forget(&key);
        }

        tracker.mark_flushed();
        self.dirty.clear();
        tracing::debug!(
            checked = result.checked,
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            "Flush complete"
        );
        Outcome::Ok(result)
    }

    /// Flush, then commit the driver transaction.
    ///
    /// On failure the transaction is rolled back and the cache evicted
    /// before the failure is returned.
    pub async fn commit<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        cache: &mut ObjectCache,
        tracker: &mut AccessTracker,
    ) -> Outcome<FlushResult, Error> {
        let flushed = match self.flush(cx, conn, cache, tracker).await {
            Outcome::Ok(flushed) => flushed,
            failure => {
                self.abort(cx, conn, cache, tracker).await;
                return failure;
            }
        };

        if self.is_active() {
            match conn.commit(cx).await {
                Outcome::Ok(()) => {}
                Outcome::Err(e) => {
                    self.abort(cx, conn, cache, tracker).await;
                    return Outcome::Err(translate_driver_error(e));
                }
                Outcome::Cancelled(r) => {
                    self.abort(cx, conn, cache, tracker).await;
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    self.abort(cx, conn, cache, tracker).await;
                    return Outcome::Panicked(p);
                }
            }
        }

        tracing::debug!(statements = self.statements, "Transaction committed");
        self.state = TransactionState::Committed;
        self.statements = 0;
        self.locks.clear();
        tracker.clear();
        cache.unlock_all();
        Outcome::Ok(flushed)
    }

    /// Roll back the driver transaction (if one is open) and discard all
    /// session state. The state is reset even when the driver fails.
    pub async fn rollback<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: Option<&C>,
        cache: &mut ObjectCache,
        tracker: &mut AccessTracker,
    ) -> Outcome<(), Error> {
        let result = match conn {
            Some(conn) if self.is_active() => {
                translate_outcome(conn.rollback(cx).await)
            }
            _ => Outcome::Ok(()),
        };
        tracing::debug!(statements = self.statements, "Transaction rolled back");
        self.state = TransactionState::RolledBack;
        self.statements = 0;
        self.dirty.clear();
        self.locks.clear();
        tracker.clear();
        cache.clear();
        result
    }

    async fn abort<C: Connection>(
        &mut self,
        cx: &Cx,
        conn: &C,
        cache: &mut ObjectCache,
        tracker: &mut AccessTracker,
    ) {
        if let Outcome::Err(e) = self.rollback(cx, Some(conn), cache, tracker).await {
            tracing::warn!(error = %e, "Rollback after failed commit also failed");
        }
    }

    /// Mark a commit with nothing to send.
    pub(crate) fn mark_committed(&mut self) {
        self.state = TransactionState::Committed;
        self.locks.clear();
    }
}

/// Checked attributes of `key` except key columns, which never change.
fn checked_attributes(
    tracker: &AccessTracker,
    key: &ObjectKey,
    entity: &ormtx_core::Entity,
) -> Vec<(&'static str, Value)> {
    tracker
        .checked(key)
        .into_iter()
        .filter(|(col, _)| !entity.is_key(col))
        .collect()
}

fn guard_conditions(checked: &[(&'static str, Value)]) -> Vec<(String, Value)> {
    checked
        .iter()
        .map(|(col, val)| ((*col).to_string(), val.clone()))
        .collect()
}

/// Map backend-native lock and concurrency failures to transaction failures.
pub fn translate_driver_error(error: Error) -> Error {
    let Error::Query(q) = error else {
        return error;
    };
    let kind = match q.kind {
        QueryErrorKind::LockNotAvailable => TransactionErrorKind::LockUnavailable,
        QueryErrorKind::LockTimeout => TransactionErrorKind::LockTimeout,
        QueryErrorKind::Deadlock => TransactionErrorKind::Deadlock,
        QueryErrorKind::Serialization => TransactionErrorKind::Serialization,
        _ => return Error::Query(q),
    };
    Error::Transaction(TransactionError {
        kind,
        message: q.message,
        object: None,
    })
}

fn translate_outcome<T>(outcome: Outcome<T, Error>) -> Outcome<T, Error> {
    match outcome {
        Outcome::Err(e) => Outcome::Err(translate_driver_error(e)),
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormtx_core::{FailureKind, QueryError};

    fn query_error(kind: QueryErrorKind) -> Error {
        Error::Query(QueryError {
            kind,
            sql: None,
            message: "backend says no".into(),
            source: None,
        })
    }

    #[test]
    fn test_driver_errors_map_to_transaction_failures() {
        let cases = [
            (QueryErrorKind::LockNotAvailable, FailureKind::LockUnavailable),
            (QueryErrorKind::LockTimeout, FailureKind::LockTimeout),
            (QueryErrorKind::Deadlock, FailureKind::Deadlock),
            (QueryErrorKind::Serialization, FailureKind::Serialization),
        ];
        for (driver, expected) in cases {
            let mapped = translate_driver_error(query_error(driver));
            assert!(mapped.is_kind(&expected), "{driver:?} -> {mapped:?}");
            assert!(mapped.is_kind(&FailureKind::TransactionFailure));
        }
    }

    #[test]
    fn test_other_driver_errors_pass_through() {
        let mapped = translate_driver_error(query_error(QueryErrorKind::Constraint));
        assert!(matches!(mapped, Error::Query(ref q) if q.kind == QueryErrorKind::Constraint));
        assert!(!mapped.is_transaction_failure());
        assert!(matches!(
            translate_driver_error(Error::Timeout),
            Error::Timeout
        ));
    }

    #[test]
    fn test_controller_starts_idle() {
        let controller = TransactionController::new(BeginOptions::default(), true, false);
        assert_eq!(controller.state(), TransactionState::NoTransaction);
        assert!(!controller.is_active());
        assert!(controller.dirty().is_empty());
        assert!(controller.lock_requests().is_empty());
    }

    #[test]
    fn test_dirty_and_lock_sets_deduplicate() {
        use ormtx_core::Entity;
        const ITEM: Entity = Entity::new("Item", "items", &["id"], &["id"]);
        let key = ObjectKey::new(&ITEM, &[Value::BigInt(1)]);

        let mut controller = TransactionController::new(BeginOptions::default(), true, false);
        controller.mark_dirty(key);
        controller.mark_dirty(key);
        controller.record_lock(key, WaitPolicy::NoWait);
        controller.record_lock(key, WaitPolicy::Wait);
        assert_eq!(controller.dirty(), &[key]);
        assert_eq!(controller.lock_requests().len(), 1);
        assert_eq!(controller.lock_requests()[0].wait, WaitPolicy::NoWait);

        controller.forget_dirty(&key);
        assert!(controller.dirty().is_empty());
    }

    #[test]
    fn test_flush_result_counts_writes() {
        let result = FlushResult {
            checked: 4,
            inserted: 1,
            updated: 2,
            deleted: 1,
        };
        assert_eq!(result.writes(), 4);
    }
}
