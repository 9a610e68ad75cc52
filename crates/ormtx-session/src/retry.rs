//! Retrying units of work.
//!
//! A unit of work wrapped by [`RetryOrchestrator::run`] (or [`db_session`])
//! runs in a fresh [`Session`] per attempt. When an attempt fails with a
//! failure the retry filter matches, its transaction is rolled back and the
//! whole unit of work runs again, up to the configured number of attempts.
//! Failures raised by the final commit count as failures of the attempt.

use crate::config::{FailureFilter, SessionConfig};
use crate::{Session, finish_scope};
use asupersync::{Cx, Outcome};
use ormtx_core::{ConnectionPool, Error, try_result};
use std::sync::Arc;

/// Re-runs a unit of work after retryable failures.
#[derive(Debug, Clone)]
pub struct RetryOrchestrator {
    max_attempts: usize,
    retry_on: FailureFilter,
}

impl RetryOrchestrator {
    /// Allow up to `max_attempts` attempts (at least one), retrying
    /// transaction failures.
    pub fn new(max_attempts: usize) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            retry_on: FailureFilter::default(),
        }
    }

    /// Retry the failures matched by `filter` instead.
    #[must_use]
    pub fn retry_on(mut self, filter: FailureFilter) -> Self {
        self.retry_on = filter;
        self
    }

    /// `config.retry` extra attempts, retrying `config.retry_on`.
    pub fn from_config(config: &SessionConfig) -> Self {
        Self::new(config.retry + 1).retry_on(config.retry_on.clone())
    }

    /// Maximum number of attempts.
    pub fn max_attempts(&self) -> usize {
        self.max_attempts
    }

    /// Should an attempt failing with `error` be followed by another?
    pub fn should_retry(&self, attempt: usize, error: &Error, config: &SessionConfig) -> bool {
        attempt < self.max_attempts && self.retry_on.matches(error) && !config.allowed.matches(error)
    }

    /// Run `work` in a fresh outermost session, retrying as configured.
    ///
    /// While more than one attempt is allowed the session is retry-managed:
    /// explicit `commit` and `rollback` calls inside `work` fail.
    /// Cancellation and panics are never retried.
    pub async fn run<P, T>(
        &self,
        cx: &Cx,
        pool: &Arc<P>,
        config: &SessionConfig,
        mut work: impl AsyncFnMut(&mut Session<P>) -> Outcome<T, Error>,
    ) -> Outcome<T, Error>
    where
        P: ConnectionPool,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            let mut session = try_result!(Session::open(Arc::clone(pool), config.clone()));
            session.set_retry_managed(self.max_attempts > 1);

            let outcome = work(&mut session).await;
            let outcome = finish_scope(&mut session, cx, outcome).await;
            match outcome {
                Outcome::Err(e) if self.should_retry(attempt, &e, config) => {
                    tracing::warn!(
                        attempt,
                        max_attempts = self.max_attempts,
                        error = %e,
                        "Retrying unit of work"
                    );
                }
                Outcome::Err(e) => {
                    if attempt > 1 {
                        tracing::debug!(attempt, error = %e, "Unit of work failed");
                    }
                    return Outcome::Err(e);
                }
                other => return other,
            }
        }
    }
}

/// Run `work` in an outermost session configured by `config`.
///
/// This is the usual entry point: the session commits when `work` succeeds
/// (or fails with an allowed failure), rolls back otherwise, and the whole
/// unit of work is retried `config.retry` times on failures matched by
/// `config.retry_on`.
pub async fn db_session<P, T>(
    cx: &Cx,
    pool: &Arc<P>,
    config: SessionConfig,
    work: impl AsyncFnMut(&mut Session<P>) -> Outcome<T, Error>,
) -> Outcome<T, Error>
where
    P: ConnectionPool,
{
    RetryOrchestrator::from_config(&config)
        .run(cx, pool, &config, work)
        .await
}
