//! In-memory connection implementation.

use crate::database::{Record, RowRef, Shared, Store};
use asupersync::{Cx, Outcome};
use ormtx_core::{
    BeginOptions, Connection, Dialect, Error, QueryError, QueryErrorKind, Row, Statement, Value,
    WaitPolicy,
};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

/// Private state of an open transaction.
struct TxState {
    options: BeginOptions,
    /// Uncommitted row images; `None` marks a deleted row
    writes: BTreeMap<RowRef, Option<Record>>,
}

impl TxState {
    fn new(options: BeginOptions) -> Self {
        Self {
            options,
            writes: BTreeMap::new(),
        }
    }
}

/// A connection to a [`MemoryDatabase`](crate::MemoryDatabase).
///
/// Writes are buffered per transaction and become visible to other
/// connections at commit. Updates, deletes and locking reads take row locks
/// that are held until the transaction ends. Statements sent outside a
/// transaction run in autocommit mode.
pub struct MemoryConnection {
    id: u64,
    shared: Arc<Shared>,
    tx: Mutex<Option<TxState>>,
}

impl std::fmt::Debug for MemoryConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryConnection")
            .field("id", &self.id)
            .field("in_transaction", &self.in_transaction())
            .finish()
    }
}

impl MemoryConnection {
    pub(crate) fn new(id: u64, shared: Arc<Shared>) -> Self {
        Self {
            id,
            shared,
            tx: Mutex::new(None),
        }
    }

    /// Connection id, unique within its database.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Is a transaction open on this connection?
    pub fn in_transaction(&self) -> bool {
        self.lock_tx().is_some()
    }

    /// Isolation options of the open transaction, if any.
    pub fn transaction_options(&self) -> Option<BeginOptions> {
        self.lock_tx().as_ref().map(|state| state.options)
    }

    fn lock_tx(&self) -> MutexGuard<'_, Option<TxState>> {
        self.tx.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn begin_sync(&self, options: BeginOptions) -> Result<(), Error> {
        let mut tx = self.lock_tx();
        if tx.is_some() {
            return Err(database_error("already in a transaction"));
        }
        self.shared.lock_store().record_begin(options);
        tracing::debug!(
            connection = self.id,
            isolation = options.isolation.as_sql(),
            immediate = options.immediate,
            "BEGIN"
        );
        *tx = Some(TxState::new(options));
        Ok(())
    }

    fn commit_sync(&self) -> Result<(), Error> {
        let state = self
            .lock_tx()
            .take()
            .ok_or_else(|| database_error("not in a transaction"))?;
        self.finish(state, true);
        tracing::debug!(connection = self.id, "COMMIT");
        Ok(())
    }

    fn rollback_sync(&self) -> Result<(), Error> {
        let state = self
            .lock_tx()
            .take()
            .ok_or_else(|| database_error("not in a transaction"))?;
        self.finish(state, false);
        tracing::debug!(connection = self.id, "ROLLBACK");
        Ok(())
    }

    /// End a transaction, publishing its writes if `commit`, and release its locks.
    fn finish(&self, state: TxState, commit: bool) {
        let mut store = self.shared.lock_store();
        if commit {
            for ((table, id), image) in state.writes {
                let Ok(table) = store.table_mut(&table) else {
                    continue;
                };
                match image {
                    Some(record) => {
                        table.rows.insert(id, record);
                    }
                    None => {
                        table.rows.remove(&id);
                    }
                }
            }
        }
        store.record_end(commit);
        let released = store.release_locks(self.id);
        drop(store);
        if released > 0 {
            tracing::trace!(connection = self.id, released, "Released row locks");
        }
        self.shared.notify_released();
    }

    /// Run `op` inside the open transaction, or inside a one-statement
    /// transaction when none is open.
    fn run<T>(
        &self,
        op: impl FnOnce(&Self, &mut TxState) -> Result<T, Error>,
    ) -> Result<T, Error> {
        let mut tx = self.lock_tx();
        if let Some(state) = tx.as_mut() {
            return op(self, state);
        }
        let mut state = TxState::new(BeginOptions::default());
        let result = op(self, &mut state);
        self.finish(state, result.is_ok());
        result
    }

    fn query_sync(&self, statement: &Statement) -> Result<Vec<Row>, Error> {
        let Statement::Select {
            table,
            columns,
            filter,
            lock,
        } = statement
        else {
            return Err(statement_error(
                statement,
                QueryErrorKind::Syntax,
                "query expects a SELECT statement",
            ));
        };
        tracing::trace!(connection = self.id, table = %table, locking = lock.is_some(), "Query");

        self.run(|conn, state| {
            let mut store = conn.shared.lock_store();
            store.record_statement(statement)?;

            if let Some(policy) = lock {
                // Re-evaluate after every wait: the matching set can change while blocked.
                loop {
                    let ids = matching_ids(&visible_rows(&store, state, table)?, filter);
                    let mut all_held = true;
                    for id in ids {
                        let row = (table.clone(), id);
                        if store.locks.get(&row) == Some(&conn.id) {
                            continue;
                        }
                        all_held = false;
                        let (guard, result) = conn.shared.acquire_row_lock(
                            store,
                            conn.id,
                            &row,
                            *policy == WaitPolicy::Wait,
                        );
                        store = guard;
                        result.map_err(|e| with_sql(e, statement))?;
                    }
                    if all_held {
                        break;
                    }
                }
            }

            let rows = visible_rows(&store, state, table)?;
            Ok(project(
                rows.values().filter(|record| matches(record, filter)),
                columns,
            ))
        })
    }

    fn execute_sync(&self, statement: &Statement) -> Result<u64, Error> {
        tracing::trace!(connection = self.id, table = %statement.table(), "Execute");
        match statement {
            Statement::Select { .. } => self.query_sync(statement).map(|rows| rows.len() as u64),
            Statement::Insert {
                table,
                columns,
                values,
            } => self.run(|conn, state| {
                let mut store = conn.shared.lock_store();
                store.record_statement(statement)?;
                let record: Record = columns.iter().cloned().zip(values.iter().cloned()).collect();
                let key = store.table(table)?.key.clone();
                let key_filter: Vec<(String, Value)> = key
                    .iter()
                    .map(|col| (col.clone(), record.get(col).cloned().unwrap_or(Value::Null)))
                    .collect();
                if !matching_ids(&visible_rows(&store, state, table)?, &key_filter).is_empty() {
                    return Err(statement_error(
                        statement,
                        QueryErrorKind::Constraint,
                        "duplicate key value violates unique constraint",
                    ));
                }
                let id = store.table_mut(table)?.allocate_row_id();
                store.locks.insert((table.clone(), id), conn.id);
                state.writes.insert((table.clone(), id), Some(record));
                Ok(1)
            }),
            Statement::Update {
                table,
                key,
                assignments,
                guards,
            } => self.run(|conn, state| {
                let (store, ids) = conn.lock_rows(statement, state, table, key)?;
                let rows = visible_rows(&store, state, table)?;
                let mut affected = 0;
                for id in ids {
                    let Some(record) = rows.get(&id) else {
                        continue;
                    };
                    if !matches(record, key) || !matches(record, guards) {
                        continue;
                    }
                    let mut image = record.clone();
                    for (col, val) in assignments {
                        image.insert(col.clone(), val.clone());
                    }
                    state.writes.insert((table.clone(), id), Some(image));
                    affected += 1;
                }
                Ok(affected)
            }),
            Statement::Delete { table, key, guards } => self.run(|conn, state| {
                let (store, ids) = conn.lock_rows(statement, state, table, key)?;
                let rows = visible_rows(&store, state, table)?;
                let mut affected = 0;
                for id in ids {
                    if rows
                        .get(&id)
                        .is_some_and(|record| matches(record, key) && matches(record, guards))
                    {
                        state.writes.insert((table.clone(), id), None);
                        affected += 1;
                    }
                }
                Ok(affected)
            }),
        }
    }

    /// Lock every row matching `key`, waiting for other holders.
    fn lock_rows<'a>(
        &'a self,
        statement: &Statement,
        state: &TxState,
        table: &str,
        key: &[(String, Value)],
    ) -> Result<(MutexGuard<'a, Store>, Vec<u64>), Error> {
        let mut store = self.shared.lock_store();
        store.record_statement(statement)?;
        let ids = matching_ids(&visible_rows(&store, state, table)?, key);
        for id in &ids {
            let (guard, result) =
                self.shared
                    .acquire_row_lock(store, self.id, &(table.to_string(), *id), true);
            store = guard;
            result.map_err(|e| with_sql(e, statement))?;
        }
        Ok((store, ids))
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        let open = self
            .tx
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(state) = open {
            tracing::debug!(connection = self.id, "Connection dropped inside a transaction, rolling back");
            self.finish(state, false);
        }
    }
}

/// Committed rows of `table` overlaid with the transaction's own writes.
fn visible_rows(
    store: &Store,
    state: &TxState,
    table: &str,
) -> Result<BTreeMap<u64, Record>, Error> {
    let mut rows = store.table(table)?.rows.clone();
    for ((name, id), image) in &state.writes {
        if name != table {
            continue;
        }
        match image {
            Some(record) => {
                rows.insert(*id, record.clone());
            }
            None => {
                rows.remove(id);
            }
        }
    }
    Ok(rows)
}

fn matches(record: &Record, filter: &[(String, Value)]) -> bool {
    filter
        .iter()
        .all(|(col, val)| record.get(col).unwrap_or(&Value::Null).same_as(val))
}

fn matching_ids(rows: &BTreeMap<u64, Record>, filter: &[(String, Value)]) -> Vec<u64> {
    rows.iter()
        .filter(|(_, record)| matches(record, filter))
        .map(|(id, _)| *id)
        .collect()
}

/// Build result rows; an empty column list selects every column.
fn project<'a>(records: impl Iterator<Item = &'a Record>, columns: &[String]) -> Vec<Row> {
    let mut rows: Vec<Row> = Vec::new();
    for record in records {
        if columns.is_empty() {
            let (names, values) = record
                .iter()
                .map(|(col, val)| (col.clone(), val.clone()))
                .unzip();
            rows.push(Row::new(names, values));
            continue;
        }
        let values = columns
            .iter()
            .map(|col| record.get(col).cloned().unwrap_or(Value::Null))
            .collect();
        let row = match rows.first() {
            Some(first) => first.sharing_columns(values),
            None => Row::new(columns.to_vec(), values),
        };
        rows.push(row);
    }
    rows
}

fn database_error(message: &str) -> Error {
    Error::Query(QueryError {
        kind: QueryErrorKind::Database,
        sql: None,
        message: message.to_string(),
        source: None,
    })
}

fn statement_error(statement: &Statement, kind: QueryErrorKind, message: &str) -> Error {
    Error::Query(QueryError {
        kind,
        sql: Some(statement.to_sql(Dialect::Postgres).0),
        message: message.to_string(),
        source: None,
    })
}

fn with_sql(error: Error, statement: &Statement) -> Error {
    match error {
        Error::Query(mut q) if q.sql.is_none() => {
            q.sql = Some(statement.to_sql(Dialect::Postgres).0);
            Error::Query(q)
        }
        other => other,
    }
}

impl Connection for MemoryConnection {
    fn dialect(&self) -> Dialect {
        self.shared.config.dialect
    }

    fn begin(
        &self,
        _cx: &Cx,
        options: BeginOptions,
    ) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.begin_sync(options);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn query(
        &self,
        _cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
        let result = self.query_sync(statement);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn execute(
        &self,
        _cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<u64, Error>> + Send {
        let result = self.execute_sync(statement);
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.commit_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        let result = self.rollback_sync();
        async move { result.map_or_else(Outcome::Err, Outcome::Ok) }
    }

    fn ping(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
        async { Outcome::Ok(()) }
    }
}
