//! ormtx - session scopes, optimistic concurrency and retrying transactions.
//!
//! ormtx is the unit-of-work half of an ORM. It provides:
//!
//! - Session scopes that own one connection and an object cache, with
//!   reentrant nesting
//! - Optimistic concurrency: only attributes a transaction read or wrote are
//!   checked at commit, and updates write only the modified columns
//! - Pessimistic row locks with wait / no-wait policies
//! - A retry orchestrator that re-runs a unit of work after transaction
//!   failures
//!
//! # Quick Start
//!
//! ```ignore
//! use ormtx::prelude::*;
//!
//! const ACCOUNT: Entity = Entity::new("Account", "accounts", &["id"], &["id", "owner", "balance"]);
//!
//! async fn withdraw(cx: &Cx, pool: &Arc<Pool<MemoryDatabase>>, amount: i64) -> Outcome<i64, Error> {
//!     db_session(cx, pool, SessionConfig::new().retry(3), async |s| {
//!         let Some(account) = try_outcome!(s.get(cx, &ACCOUNT, &[Value::BigInt(1)]).await) else {
//!             return Outcome::Err(Error::application("not_found", "no such account"));
//!         };
//!         let balance = try_outcome!(s.read(cx, &account, "balance").await)
//!             .as_i64()
//!             .unwrap_or_default();
//!         try_outcome!(s.write(cx, &account, "balance", balance - amount).await);
//!         Outcome::Ok(balance - amount)
//!     })
//!     .await
//! }
//! ```
//!
//! # Features
//!
//! - **Explicit sessions**: every data operation takes `&mut Session`
//! - **Structured concurrency**: built on asupersync for cancel-correct operations
//! - **Backend neutral**: any [`ConnectionPool`] whose connections implement
//!   [`Connection`]; [`MemoryDatabase`] ships for tests and examples

// Re-export all public types from sub-crates
pub use ormtx_core::{
    // asupersync re-exports
    Cx,
    Outcome,
    // Core types
    BeginOptions,
    Connection,
    ConnectionPool,
    Dialect,
    Entity,
    IsolationLevel,
    Row,
    Statement,
    Value,
    WaitPolicy,
    // Errors
    ApplicationError,
    ConfigError,
    Error,
    QueryError,
    QueryErrorKind,
    FailureKind,
    Result,
    SessionError,
    SessionErrorKind,
    TransactionError,
    TransactionErrorKind,
    try_outcome,
    try_result,
};

pub use ormtx_session::{
    AccessTracker, CachedObject, FailureFilter, FlushResult, LockRequest, ObjectCache, ObjectKey,
    ObjectState, RetryOrchestrator, Session, SessionConfig, SessionDebugInfo, SessionSettings,
    SessionStats, TrackedAttribute, TransactionController, TransactionState, db_session,
    translate_driver_error,
};

pub use ormtx_pool::{ConnectionFactory, Pool, PoolConfig, PoolStats};

pub use ormtx_memory::{MemoryConfig, MemoryConnection, MemoryDatabase};

/// Prelude module for convenient imports.
///
/// ```ignore
/// use ormtx::prelude::*;
/// ```
pub mod prelude {
    pub use crate::{
        Cx, Entity, Error, FailureKind, MemoryDatabase, ObjectKey, Outcome, Pool, PoolConfig,
        Session, SessionConfig, Value, WaitPolicy, db_session, try_outcome, try_result,
    };
    pub use std::sync::Arc;
}
