//! Core types and traits for ormtx.
//!
//! This crate provides the foundational abstractions shared by the session
//! engine, pools and drivers:
//!
//! - `Value` and `Row` for moving data between drivers and the object cache
//! - `Entity` descriptors naming tables, keys and lazy columns
//! - `Statement` and `Dialect` for the statements a session emits
//! - `Connection` and `ConnectionPool` traits for drivers and pools
//! - `Error` and `FailureKind`, the failure taxonomy used by retry policies
//! - `Outcome` re-export from asupersync for cancel-correct operations
//! - `Cx` context for structured concurrency

// Re-export asupersync primitives for structured concurrency
pub use asupersync::{Cx, Outcome};

pub mod connection;
pub mod entity;
pub mod error;
pub mod row;
pub mod statement;
pub mod value;

pub use connection::{BeginOptions, Connection, ConnectionPool, IsolationLevel, WaitPolicy};
pub use entity::Entity;
pub use error::{
    ApplicationError, ConfigError, ConnectionError, ConnectionErrorKind, Error, FailureKind,
    PoolError, PoolErrorKind, QueryError, QueryErrorKind, Result, SessionError, SessionErrorKind,
    TransactionError, TransactionErrorKind, TypeError,
};
pub use row::{FromValue, Row};
pub use statement::{Dialect, Statement};
pub use value::Value;

/// Unwrap `Outcome::Ok`, returning every other outcome from the enclosing
/// function or async block.
#[macro_export]
macro_rules! try_outcome {
    ($expr:expr) => {
        match $expr {
            $crate::Outcome::Ok(v) => v,
            $crate::Outcome::Err(e) => return $crate::Outcome::Err(e),
            $crate::Outcome::Cancelled(r) => return $crate::Outcome::Cancelled(r),
            $crate::Outcome::Panicked(p) => return $crate::Outcome::Panicked(p),
        }
    };
}

/// Unwrap `Ok`, returning `Err` as `Outcome::Err` from the enclosing function.
#[macro_export]
macro_rules! try_result {
    ($expr:expr) => {
        match $expr {
            Ok(v) => v,
            Err(e) => return $crate::Outcome::Err(e),
        }
    };
}
