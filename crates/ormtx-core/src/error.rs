//! Error types and the failure taxonomy for ormtx operations.
//!
//! Every failure surfaced by the engine is an [`Error`]. Retry and
//! allowed-failure policies never match on error values directly; they use
//! the typed [`FailureKind`] set and [`Error::is_kind`], which encodes the
//! superclass relations (for example `TransactionFailure` matches every
//! [`TransactionError`]).

use serde::{Deserialize, Serialize};
use std::fmt;

/// The primary error type for all ormtx operations.
#[derive(Debug)]
pub enum Error {
    /// Session scope errors (no open session, misuse of a managed session)
    Session(SessionError),
    /// Transaction failures (optimistic conflicts, lock failures, deadlocks)
    Transaction(TransactionError),
    /// Connection-related errors (connect, disconnect)
    Connection(ConnectionError),
    /// Statement execution errors reported by a driver
    Query(QueryError),
    /// Type conversion errors
    Type(TypeError),
    /// Pool errors
    Pool(PoolError),
    /// Configuration errors
    Config(ConfigError),
    /// Caller-raised failures, matched by kind name
    Application(ApplicationError),
    /// Operation timed out
    Timeout,
    /// Operation was cancelled via asupersync
    Cancelled,
    /// Custom error with message
    Custom(String),
}

#[derive(Debug)]
pub struct SessionError {
    pub kind: SessionErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionErrorKind {
    /// A database operation was attempted with no open session
    Required,
    /// Explicit commit/rollback while a retry wrapper controls the transaction
    RetryManaged,
    /// The object is not present in the session's cache
    UnknownObject,
    /// The entity has no such attribute
    UnknownAttribute,
    /// The attribute cannot be written (primary key columns)
    ReadOnlyAttribute,
    /// An object with the same identity is already in the session
    DuplicateObject,
}

#[derive(Debug)]
pub struct TransactionError {
    pub kind: TransactionErrorKind,
    pub message: String,
    /// Human-readable identity of the conflicting object, e.g. `accounts[1]`
    pub object: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionErrorKind {
    /// Commit-time attribute mismatch
    OptimisticCheck,
    /// A re-fetched row disagrees with attributes already read in this transaction
    UnrepeatableRead,
    /// Row lock requested with no-wait and the row is locked elsewhere
    LockUnavailable,
    /// Waiting for a row lock exceeded the driver timeout
    LockTimeout,
    /// Backend detected a deadlock
    Deadlock,
    /// Backend reported a serialization failure
    Serialization,
}

#[derive(Debug)]
pub struct ConnectionError {
    pub kind: ConnectionErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionErrorKind {
    /// Failed to establish connection
    Connect,
    /// Connection lost during operation
    Disconnected,
    /// Connection pool exhausted
    PoolExhausted,
}

#[derive(Debug)]
pub struct QueryError {
    pub kind: QueryErrorKind,
    pub sql: Option<String>,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryErrorKind {
    /// Malformed or unsupported statement
    Syntax,
    /// Constraint violation (unique, not null)
    Constraint,
    /// Table or column not found
    NotFound,
    /// Row lock not available (NOWAIT)
    LockNotAvailable,
    /// Lock wait timeout
    LockTimeout,
    /// Deadlock detected
    Deadlock,
    /// Serialization failure (retry may succeed)
    Serialization,
    /// Other database error
    Database,
}

#[derive(Debug)]
pub struct TypeError {
    pub expected: &'static str,
    pub actual: String,
    pub column: Option<String>,
}

#[derive(Debug)]
pub struct PoolError {
    pub kind: PoolErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PoolErrorKind {
    /// Pool exhausted (no available connections)
    Exhausted,
    /// Pool is closed
    Closed,
}

#[derive(Debug)]
pub struct ConfigError {
    pub message: String,
}

/// A failure raised by caller code inside a session scope.
///
/// The `kind` is a caller-chosen name; scopes list the kinds they treat as
/// allowed (commit and propagate) or retryable via [`FailureKind::Application`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApplicationError {
    pub kind: String,
    pub message: String,
}

/// Typed failure kinds used by retry and allowed-failure policies.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// No open session
    SessionRequired,
    /// Superclass of every transaction failure
    TransactionFailure,
    /// Optimistic conflict (includes unrepeatable reads)
    OptimisticCheckFailure,
    /// No-wait lock request on a locked row
    LockUnavailable,
    /// Lock wait timed out
    LockTimeout,
    /// Backend-reported deadlock
    Deadlock,
    /// Backend-reported serialization failure
    Serialization,
    /// Connection failures
    Connection,
    /// Driver statement failures
    Query,
    /// Pool failures
    Pool,
    /// Timeouts
    Timeout,
    /// A caller-raised [`ApplicationError`] with this kind name
    Application(String),
}

impl Error {
    /// Create a `SessionRequired` error for the named operation.
    pub fn session_required(operation: &str) -> Self {
        Error::Session(SessionError {
            kind: SessionErrorKind::Required,
            message: format!("{operation} requires an open session"),
        })
    }

    /// Create a session misuse error.
    pub fn session(kind: SessionErrorKind, message: impl Into<String>) -> Self {
        Error::Session(SessionError {
            kind,
            message: message.into(),
        })
    }

    /// Create a caller-raised failure of the given kind.
    pub fn application(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Application(ApplicationError {
            kind: kind.into(),
            message: message.into(),
        })
    }

    /// Create an optimistic check failure naming the conflicting object.
    pub fn optimistic_check(object: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Transaction(TransactionError {
            kind: TransactionErrorKind::OptimisticCheck,
            message: message.into(),
            object: Some(object.into()),
        })
    }

    /// Is this a transaction failure (the default retry trigger)?
    pub fn is_transaction_failure(&self) -> bool {
        matches!(self, Error::Transaction(_))
    }

    /// Is this a `SessionRequired` error?
    pub fn is_session_required(&self) -> bool {
        matches!(
            self,
            Error::Session(SessionError {
                kind: SessionErrorKind::Required,
                ..
            })
        )
    }

    /// The most specific failure kind of this error, if it has one.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Error::Session(s) if s.kind == SessionErrorKind::Required => {
                Some(FailureKind::SessionRequired)
            }
            Error::Transaction(t) => Some(match t.kind {
                TransactionErrorKind::OptimisticCheck | TransactionErrorKind::UnrepeatableRead => {
                    FailureKind::OptimisticCheckFailure
                }
                TransactionErrorKind::LockUnavailable => FailureKind::LockUnavailable,
                TransactionErrorKind::LockTimeout => FailureKind::LockTimeout,
                TransactionErrorKind::Deadlock => FailureKind::Deadlock,
                TransactionErrorKind::Serialization => FailureKind::Serialization,
            }),
            Error::Connection(_) => Some(FailureKind::Connection),
            Error::Query(_) => Some(FailureKind::Query),
            Error::Pool(_) => Some(FailureKind::Pool),
            Error::Timeout => Some(FailureKind::Timeout),
            Error::Application(a) => Some(FailureKind::Application(a.kind.clone())),
            _ => None,
        }
    }

    /// Does this error belong to `kind`, taking superclasses into account?
    pub fn is_kind(&self, kind: &FailureKind) -> bool {
        match kind {
            FailureKind::TransactionFailure => self.is_transaction_failure(),
            other => self.kind().as_ref() == Some(other),
        }
    }

    /// Is this a retryable error (transaction failures, pool exhaustion, timeouts)?
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Transaction(_) => true,
            Error::Query(q) => matches!(
                q.kind,
                QueryErrorKind::Deadlock
                    | QueryErrorKind::Serialization
                    | QueryErrorKind::LockTimeout
            ),
            Error::Pool(p) => matches!(p.kind, PoolErrorKind::Exhausted),
            Error::Connection(c) => matches!(c.kind, ConnectionErrorKind::PoolExhausted),
            Error::Timeout => true,
            _ => false,
        }
    }

    /// Get the SQL that caused this error, if available
    pub fn sql(&self) -> Option<&str> {
        match self {
            Error::Query(q) => q.sql.as_deref(),
            _ => None,
        }
    }

    /// Get the conflicting object of a transaction failure, if known.
    pub fn conflicting_object(&self) -> Option<&str> {
        match self {
            Error::Transaction(t) => t.object.as_deref(),
            _ => None,
        }
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Session(e) => write!(f, "Session error: {}", e.message),
            Error::Transaction(e) => write!(f, "Transaction failure: {e}"),
            Error::Connection(e) => write!(f, "Connection error: {}", e.message),
            Error::Query(e) => write!(f, "Query error: {}", e.message),
            Error::Type(e) => write!(f, "Type error: {e}"),
            Error::Pool(e) => write!(f, "Pool error: {}", e.message),
            Error::Config(e) => write!(f, "Configuration error: {}", e.message),
            Error::Application(e) => write!(f, "{}: {}", e.kind, e.message),
            Error::Timeout => write!(f, "Operation timed out"),
            Error::Cancelled => write!(f, "Operation cancelled"),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::Connection(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            Error::Query(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for TransactionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(object) = &self.object {
            write!(f, "{} ({})", self.message, object)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

impl fmt::Display for TypeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(col) = &self.column {
            write!(
                f,
                "expected {} for column '{}', found {}",
                self.expected, col, self.actual
            )
        } else {
            write!(f, "expected {}, found {}", self.expected, self.actual)
        }
    }
}

impl fmt::Display for QueryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl From<SessionError> for Error {
    fn from(err: SessionError) -> Self {
        Error::Session(err)
    }
}

impl From<TransactionError> for Error {
    fn from(err: TransactionError) -> Self {
        Error::Transaction(err)
    }
}

impl From<ConnectionError> for Error {
    fn from(err: ConnectionError) -> Self {
        Error::Connection(err)
    }
}

impl From<QueryError> for Error {
    fn from(err: QueryError) -> Self {
        Error::Query(err)
    }
}

impl From<TypeError> for Error {
    fn from(err: TypeError) -> Self {
        Error::Type(err)
    }
}

impl From<PoolError> for Error {
    fn from(err: PoolError) -> Self {
        Error::Pool(err)
    }
}

impl From<ConfigError> for Error {
    fn from(err: ConfigError) -> Self {
        Error::Config(err)
    }
}

impl From<ApplicationError> for Error {
    fn from(err: ApplicationError) -> Self {
        Error::Application(err)
    }
}

/// Result type alias for ormtx operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    fn tx_error(kind: TransactionErrorKind) -> Error {
        Error::Transaction(TransactionError {
            kind,
            message: "conflict".to_string(),
            object: Some("accounts[1]".to_string()),
        })
    }

    #[test]
    fn transaction_failure_is_superclass() {
        for kind in [
            TransactionErrorKind::OptimisticCheck,
            TransactionErrorKind::UnrepeatableRead,
            TransactionErrorKind::LockUnavailable,
            TransactionErrorKind::LockTimeout,
            TransactionErrorKind::Deadlock,
            TransactionErrorKind::Serialization,
        ] {
            assert!(tx_error(kind).is_kind(&FailureKind::TransactionFailure));
            assert!(tx_error(kind).is_retryable());
        }
        assert!(!Error::session_required("get").is_kind(&FailureKind::TransactionFailure));
    }

    #[test]
    fn unrepeatable_read_is_an_optimistic_failure() {
        let err = tx_error(TransactionErrorKind::UnrepeatableRead);
        assert!(err.is_kind(&FailureKind::OptimisticCheckFailure));
        assert!(!err.is_kind(&FailureKind::LockUnavailable));
    }

    #[test]
    fn application_kinds_match_by_name() {
        let err = Error::application("redirect", "go elsewhere");
        assert!(err.is_kind(&FailureKind::Application("redirect".into())));
        assert!(!err.is_kind(&FailureKind::Application("other".into())));
        assert!(!err.is_retryable());
        assert_eq!(err.to_string(), "redirect: go elsewhere");
    }

    #[test]
    fn session_required_flags() {
        let err = Error::session_required("read");
        assert!(err.is_session_required());
        assert_eq!(err.kind(), Some(FailureKind::SessionRequired));
        assert!(err.to_string().contains("read requires an open session"));
    }

    #[test]
    fn conflict_names_object() {
        let err = Error::optimistic_check("accounts[7]", "value changed");
        assert_eq!(err.conflicting_object(), Some("accounts[7]"));
        assert_eq!(
            err.to_string(),
            "Transaction failure: value changed (accounts[7])"
        );
    }

    #[test]
    fn failure_kinds_deserialize_from_snake_case() {
        let kinds: Vec<FailureKind> =
            serde_json::from_str(r#"["transaction_failure", {"application": "redirect"}]"#)
                .unwrap();
        assert_eq!(
            kinds,
            vec![
                FailureKind::TransactionFailure,
                FailureKind::Application("redirect".to_string())
            ]
        );
    }
}
