//! In-memory transactional backend for ormtx.
//!
//! This crate provides a small database engine that implements the
//! `Connection` trait from ormtx-core, so sessions can be exercised end to
//! end without an external server.
//!
//! # Features
//!
//! - Per-transaction write sets, published atomically at commit
//! - Row locks for updates, deletes and `FOR UPDATE` reads, with wait and
//!   no-wait policies, a configurable lock timeout and deadlock detection
//! - Guarded updates and deletes (rows affected is 0 when a guard fails)
//! - A reported [`Dialect`](ormtx_core::Dialect) that decides whether reads
//!   open transactions
//! - Logs of begun transactions and received statements for inspection
//! - Failure injection for backend-reported deadlocks and serialization errors
//!
//! # Example
//!
//! ```rust,ignore
//! use ormtx_memory::{MemoryConfig, MemoryDatabase};
//! use ormtx_pool::{Pool, PoolConfig};
//!
//! let db = MemoryDatabase::new(MemoryConfig::default());
//! db.create_table("accounts", &["id"]);
//! db.insert_row("accounts", &[("id", Value::BigInt(1)), ("balance", Value::BigInt(100))])?;
//!
//! let pool = Pool::new(db.clone(), PoolConfig::new(4));
//! ```
//!
//! # Thread Safety
//!
//! `MemoryConnection` is `Send` and `Sync`. Lock waits block the calling
//! thread, so concurrent sessions that contend on rows should run on
//! separate threads.

pub mod connection;
pub mod database;

pub use connection::MemoryConnection;
pub use database::{MemoryConfig, MemoryDatabase, Record};
