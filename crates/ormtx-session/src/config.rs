//! Session configuration.

use ormtx_core::{BeginOptions, ConfigError, Error, FailureKind, IsolationLevel};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

type FailurePredicate = Arc<dyn Fn(&Error) -> bool + Send + Sync>;

/// Selects failures for retry or allowed-failure handling.
#[derive(Clone)]
pub enum FailureFilter {
    /// Match errors belonging to any of these kinds (see [`Error::is_kind`]).
    Kinds(HashSet<FailureKind>),
    /// Match errors for which the predicate returns `true`.
    Predicate(FailurePredicate),
}

impl FailureFilter {
    /// A filter matching nothing.
    pub fn none() -> Self {
        FailureFilter::Kinds(HashSet::new())
    }

    /// A filter matching any of `kinds`.
    pub fn kinds(kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        FailureFilter::Kinds(kinds.into_iter().collect())
    }

    /// A filter backed by a predicate.
    pub fn predicate(f: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        FailureFilter::Predicate(Arc::new(f))
    }

    /// Does `error` match?
    pub fn matches(&self, error: &Error) -> bool {
        match self {
            FailureFilter::Kinds(kinds) => kinds.iter().any(|kind| error.is_kind(kind)),
            FailureFilter::Predicate(f) => f(error),
        }
    }

    /// Can this filter never match anything?
    pub fn is_empty(&self) -> bool {
        matches!(self, FailureFilter::Kinds(kinds) if kinds.is_empty())
    }
}

impl Default for FailureFilter {
    /// Transaction failures.
    fn default() -> Self {
        FailureFilter::kinds([FailureKind::TransactionFailure])
    }
}

impl fmt::Debug for FailureFilter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureFilter::Kinds(kinds) => f.debug_tuple("Kinds").field(kinds).finish(),
            FailureFilter::Predicate(_) => f.write_str("Predicate(..)"),
        }
    }
}

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Extra attempts after a retryable failure (outermost scope only).
    pub retry: usize,
    /// Failures that trigger a retry.
    pub retry_on: FailureFilter,
    /// Failures that commit instead of rolling back, then propagate.
    pub allowed: FailureFilter,
    /// Open a transaction on the first statement, reads included.
    pub immediate: bool,
    /// Request serializable isolation.
    pub serializable: bool,
    /// Compare touched attributes against the database at commit.
    pub optimistic: bool,
    /// Log statements at INFO instead of DEBUG.
    pub sql_debug: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            retry: 0,
            retry_on: FailureFilter::default(),
            allowed: FailureFilter::none(),
            immediate: false,
            serializable: false,
            optimistic: true,
            sql_debug: false,
        }
    }
}

impl SessionConfig {
    /// Create a default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the number of retries.
    #[must_use]
    pub fn retry(mut self, retry: usize) -> Self {
        self.retry = retry;
        self
    }

    /// Retry failures of these kinds.
    #[must_use]
    pub fn retry_on(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.retry_on = FailureFilter::kinds(kinds);
        self
    }

    /// Retry failures accepted by a predicate.
    #[must_use]
    pub fn retry_if(mut self, f: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        self.retry_on = FailureFilter::predicate(f);
        self
    }

    /// Commit and propagate failures of these kinds.
    #[must_use]
    pub fn allowed(mut self, kinds: impl IntoIterator<Item = FailureKind>) -> Self {
        self.allowed = FailureFilter::kinds(kinds);
        self
    }

    /// Commit and propagate failures accepted by a predicate.
    #[must_use]
    pub fn allowed_if(mut self, f: impl Fn(&Error) -> bool + Send + Sync + 'static) -> Self {
        self.allowed = FailureFilter::predicate(f);
        self
    }

    /// Set the `immediate` option.
    #[must_use]
    pub fn immediate(mut self, value: bool) -> Self {
        self.immediate = value;
        self
    }

    /// Set the `serializable` option.
    #[must_use]
    pub fn serializable(mut self, value: bool) -> Self {
        self.serializable = value;
        self
    }

    /// Set the `optimistic` option.
    #[must_use]
    pub fn optimistic(mut self, value: bool) -> Self {
        self.optimistic = value;
        self
    }

    /// Set the `sql_debug` option.
    #[must_use]
    pub fn sql_debug(mut self, value: bool) -> Self {
        self.sql_debug = value;
        self
    }

    /// Options passed to the driver when a transaction begins.
    pub fn begin_options(&self) -> BeginOptions {
        BeginOptions {
            isolation: if self.serializable {
                IsolationLevel::Serializable
            } else {
                IsolationLevel::default()
            },
            immediate: self.immediate,
        }
    }

    /// Check the configuration of an outermost session.
    pub fn validate(&self) -> Result<(), Error> {
        if self.retry > 0 && self.retry_on.is_empty() {
            return Err(config_error(
                "retry is set but retry_on matches no failure kind",
            ));
        }
        if let (FailureFilter::Kinds(retry_on), FailureFilter::Kinds(allowed)) =
            (&self.retry_on, &self.allowed)
        {
            if let Some(kind) = retry_on.intersection(allowed).next() {
                return Err(config_error(format!(
                    "{kind:?} cannot be both retried and allowed"
                )));
            }
        }
        Ok(())
    }

    /// Check the configuration of a scope nested in a session opened with `outer`.
    ///
    /// Retries belong to the outermost scope. Isolation is fixed when the
    /// session opens, so a differing request is ignored.
    pub fn validate_nested(&self, outer: &SessionConfig) -> Result<(), Error> {
        if self.retry > 0 {
            return Err(config_error(
                "retry can only be set on the outermost session scope",
            ));
        }
        if self.serializable != outer.serializable || self.immediate != outer.immediate {
            tracing::warn!(
                serializable = self.serializable,
                immediate = self.immediate,
                "Nested session scope requests different isolation; ignored"
            );
        }
        Ok(())
    }
}

fn config_error(message: impl Into<String>) -> Error {
    Error::Config(ConfigError {
        message: message.into(),
    })
}

/// The serializable subset of [`SessionConfig`].
///
/// Predicate filters cannot be expressed here; use the builder methods on
/// `SessionConfig` for those.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionSettings {
    pub retry: usize,
    pub retry_on: Vec<FailureKind>,
    pub allowed: Vec<FailureKind>,
    pub immediate: bool,
    pub serializable: bool,
    pub optimistic: bool,
    pub sql_debug: bool,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            retry: 0,
            retry_on: vec![FailureKind::TransactionFailure],
            allowed: Vec::new(),
            immediate: false,
            serializable: false,
            optimistic: true,
            sql_debug: false,
        }
    }
}

impl SessionSettings {
    /// Parse settings from JSON. Missing fields take their defaults.
    pub fn from_json(json: &str) -> Result<Self, Error> {
        serde_json::from_str(json).map_err(|e| config_error(format!("invalid session settings: {e}")))
    }
}

impl From<SessionSettings> for SessionConfig {
    fn from(settings: SessionSettings) -> Self {
        Self {
            retry: settings.retry,
            retry_on: FailureFilter::kinds(settings.retry_on),
            allowed: FailureFilter::kinds(settings.allowed),
            immediate: settings.immediate,
            serializable: settings.serializable,
            optimistic: settings.optimistic,
            sql_debug: settings.sql_debug,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ormtx_core::TransactionErrorKind;

    #[test]
    fn test_session_config_defaults() {
        let config = SessionConfig::default();
        assert_eq!(config.retry, 0);
        assert!(config.optimistic);
        assert!(!config.immediate);
        assert!(!config.serializable);
        assert!(config.allowed.is_empty());
        assert!(config.retry_on.matches(&Error::optimistic_check("A[1]", "changed")));
        assert!(!config.retry_on.matches(&Error::application("redirect", "")));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_begin_options_follow_flags() {
        let options = SessionConfig::new()
            .serializable(true)
            .immediate(true)
            .begin_options();
        assert_eq!(options.isolation, IsolationLevel::Serializable);
        assert!(options.immediate);
        assert_eq!(
            SessionConfig::new().begin_options().isolation,
            IsolationLevel::ReadCommitted
        );
    }

    #[test]
    fn test_predicate_filter() {
        let config = SessionConfig::new().retry(2).retry_if(|e| {
            matches!(e, Error::Transaction(t) if t.kind == TransactionErrorKind::LockTimeout)
        });
        let lock_timeout = Error::Transaction(ormtx_core::TransactionError {
            kind: TransactionErrorKind::LockTimeout,
            message: "timeout".into(),
            object: None,
        });
        assert!(config.retry_on.matches(&lock_timeout));
        assert!(!config.retry_on.matches(&Error::optimistic_check("A[1]", "changed")));
        assert!(config.validate().is_ok());
        assert_eq!(format!("{:?}", config.retry_on), "Predicate(..)");
    }

    #[test]
    fn test_validate_rejects_contradictions() {
        let empty = SessionConfig::new().retry(1).retry_on([]);
        assert!(matches!(empty.validate(), Err(Error::Config(_))));

        let overlap = SessionConfig::new()
            .retry_on([FailureKind::LockUnavailable])
            .allowed([FailureKind::LockUnavailable]);
        assert!(matches!(overlap.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_nested_validation() {
        let outer = SessionConfig::new();
        assert!(SessionConfig::new().retry(1).validate_nested(&outer).is_err());
        assert!(SessionConfig::new().serializable(true).validate_nested(&outer).is_ok());
    }

    #[test]
    fn test_settings_from_json() {
        let settings = SessionSettings::from_json(
            r#"{"retry": 3, "allowed": [{"application": "redirect"}], "serializable": true}"#,
        )
        .unwrap();
        assert_eq!(settings.retry, 3);
        assert_eq!(settings.retry_on, vec![FailureKind::TransactionFailure]);
        assert!(settings.optimistic);

        let config = SessionConfig::from(settings);
        assert!(config.allowed.matches(&Error::application("redirect", "go")));
        assert_eq!(config.begin_options().isolation, IsolationLevel::Serializable);

        assert!(matches!(
            SessionSettings::from_json("{\"retry\": -1}"),
            Err(Error::Config(_))
        ));
    }
}
