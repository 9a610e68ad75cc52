//! Driver and pool traits.
//!
//! This module defines the two collaborators the session engine consumes:
//!
//! - [`Connection`] - a driver connection that runs [`Statement`]s and
//!   brackets them in transactions
//! - [`ConnectionPool`] - hands out connections and takes them back
//!
//! All operations integrate with asupersync's structured concurrency via `Cx`
//! context for proper cancellation and timeout handling. Blocking inside a
//! driver (a lock wait, a commit round-trip) is opaque to the engine.

use crate::row::Row;
use crate::statement::{Dialect, Statement};
use asupersync::{Cx, Outcome};

/// Transaction isolation level.
///
/// Defines the degree to which one transaction must be isolated from
/// resource or data modifications made by other concurrent transactions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum IsolationLevel {
    /// Read uncommitted: dirty reads, non-repeatable reads and phantoms possible.
    ReadUncommitted,

    /// Read committed: only committed changes from others are visible.
    #[default]
    ReadCommitted,

    /// Repeatable read: a consistent snapshot for the whole transaction.
    RepeatableRead,

    /// Serializable: transactions appear to execute sequentially.
    Serializable,
}

impl IsolationLevel {
    /// Get the SQL syntax for this isolation level.
    #[must_use]
    pub const fn as_sql(&self) -> &'static str {
        match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        }
    }
}

/// What a locking read does when the row is already locked elsewhere.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WaitPolicy {
    /// Block until the lock is released or the driver's lock timeout elapses.
    #[default]
    Wait,
    /// Fail immediately with `LockUnavailable`.
    NoWait,
}

/// Options for opening a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BeginOptions {
    /// Requested isolation level
    pub isolation: IsolationLevel,
    /// Take the write lock up front (`BEGIN IMMEDIATE` on SQLite)
    pub immediate: bool,
}

/// A database connection capable of executing statements.
///
/// A connection has at most one open transaction. Statements sent while no
/// transaction is open run in autocommit mode.
pub trait Connection: Send + Sync {
    /// The SQL dialect, which also decides whether reads open transactions.
    fn dialect(&self) -> Dialect;

    /// Open a transaction.
    fn begin(
        &self,
        cx: &Cx,
        options: BeginOptions,
    ) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Run a statement and return all rows.
    fn query(
        &self,
        cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<Vec<Row>, crate::Error>> + Send;

    /// Run a statement and return the number of rows affected.
    fn execute(
        &self,
        cx: &Cx,
        statement: &Statement,
    ) -> impl Future<Output = Outcome<u64, crate::Error>> + Send;

    /// Commit the open transaction, releasing its row locks.
    fn commit(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Roll back the open transaction, releasing its row locks.
    fn rollback(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;

    /// Check if the connection is still valid.
    fn ping(&self, cx: &Cx) -> impl Future<Output = Outcome<(), crate::Error>> + Send;
}

/// A source of connections.
///
/// Sessions acquire a connection lazily, right before their first statement,
/// and release it at the outermost scope exit.
pub trait ConnectionPool: Send + Sync {
    /// The connection type handed out by this pool.
    type Connection: Connection;

    /// Take a connection out of the pool.
    fn acquire(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Connection, crate::Error>> + Send;

    /// Return a connection to the pool.
    fn release(&self, connection: Self::Connection);

    /// Give up a connection that must not be reused (for example one dropped
    /// while a transaction may still be open).
    fn discard(&self, connection: Self::Connection) {
        drop(connection);
    }
}
