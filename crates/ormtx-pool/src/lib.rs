//! Connection pooling for ormtx sessions.
//!
//! [`Pool`] implements [`ConnectionPool`] over any [`ConnectionFactory`]. It
//! keeps released connections idle for reuse and enforces an upper bound on
//! the number of live connections. Acquisition never waits: when the pool is
//! at capacity and nothing is idle, `acquire` fails with
//! `PoolErrorKind::Exhausted`, which is a retryable error.

use asupersync::{Cx, Outcome};
use ormtx_core::{Connection, ConnectionPool, Error, PoolError, PoolErrorKind};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};

/// Opens new driver connections on behalf of a [`Pool`].
pub trait ConnectionFactory: Send + Sync {
    /// The connection type produced by this factory.
    type Connection: Connection;

    /// Open a new connection.
    fn connect(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Connection, Error>> + Send;
}

/// Connection pool configuration.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Maximum number of live connections (idle + checked out)
    pub max_connections: usize,
    /// Maximum number of idle connections kept for reuse
    pub max_idle: usize,
    /// Ping idle connections before handing them out
    pub test_on_checkout: bool,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 10,
            max_idle: 10,
            test_on_checkout: true,
        }
    }
}

impl PoolConfig {
    /// Create a new pool configuration with the given max connections.
    pub fn new(max_connections: usize) -> Self {
        Self {
            max_connections,
            max_idle: max_connections,
            ..Default::default()
        }
    }

    /// Set the idle connection limit.
    pub fn max_idle(mut self, n: usize) -> Self {
        self.max_idle = n;
        self
    }

    /// Enable/disable test on checkout.
    pub fn test_on_checkout(mut self, enabled: bool) -> Self {
        self.test_on_checkout = enabled;
        self
    }
}

/// Pool statistics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Total number of live connections (active + idle)
    pub total_connections: usize,
    /// Number of idle connections
    pub idle_connections: usize,
    /// Number of checked-out connections
    pub active_connections: usize,
    /// Successful `acquire` calls since the pool was created
    pub acquires: usize,
    /// Connections opened through the factory since the pool was created
    pub connections_created: usize,
}

/// A bounded pool of driver connections.
pub struct Pool<F: ConnectionFactory> {
    factory: F,
    config: PoolConfig,
    idle: Mutex<Vec<F::Connection>>,
    total_connections: AtomicUsize,
    active_connections: AtomicUsize,
    acquires: AtomicUsize,
    connections_created: AtomicUsize,
    closed: AtomicBool,
}

impl<F: ConnectionFactory> Pool<F> {
    /// Create a new connection pool.
    pub fn new(factory: F, config: PoolConfig) -> Self {
        Self {
            factory,
            config,
            idle: Mutex::new(Vec::new()),
            total_connections: AtomicUsize::new(0),
            active_connections: AtomicUsize::new(0),
            acquires: AtomicUsize::new(0),
            connections_created: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    /// Get the pool configuration.
    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Get the connection factory.
    pub fn factory(&self) -> &F {
        &self.factory
    }

    /// Get the current pool statistics.
    pub fn stats(&self) -> PoolStats {
        PoolStats {
            total_connections: self.total_connections.load(Ordering::Relaxed),
            idle_connections: self.lock_idle().len(),
            active_connections: self.active_connections.load(Ordering::Relaxed),
            acquires: self.acquires.load(Ordering::Relaxed),
            connections_created: self.connections_created.load(Ordering::Relaxed),
        }
    }

    /// Check if the pool is at capacity.
    pub fn at_capacity(&self) -> bool {
        self.total_connections.load(Ordering::Relaxed) >= self.config.max_connections
    }

    /// Close the pool: drop idle connections and refuse new acquisitions.
    ///
    /// Connections still checked out are dropped when released.
    pub fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
        let drained: Vec<F::Connection> = std::mem::take(&mut *self.lock_idle());
        self.total_connections
            .fetch_sub(drained.len(), Ordering::SeqCst);
        tracing::debug!(dropped = drained.len(), "Pool closed");
    }

    /// Is the pool closed?
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn lock_idle(&self) -> std::sync::MutexGuard<'_, Vec<F::Connection>> {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take_idle(&self) -> Option<F::Connection> {
        self.lock_idle().pop()
    }

    fn checked_out(&self, conn: F::Connection) -> Outcome<F::Connection, Error> {
        self.active_connections.fetch_add(1, Ordering::SeqCst);
        self.acquires.fetch_add(1, Ordering::SeqCst);
        Outcome::Ok(conn)
    }
}

impl<F: ConnectionFactory> ConnectionPool for Pool<F> {
    type Connection = F::Connection;

    fn acquire(&self, cx: &Cx) -> impl Future<Output = Outcome<Self::Connection, Error>> + Send {
        async move {
            if self.is_closed() {
                return Outcome::Err(Error::Pool(PoolError {
                    kind: PoolErrorKind::Closed,
                    message: "pool is closed".to_string(),
                }));
            }

            while let Some(conn) = self.take_idle() {
                if !self.config.test_on_checkout {
                    return self.checked_out(conn);
                }
                match conn.ping(cx).await {
                    Outcome::Ok(()) => return self.checked_out(conn),
                    Outcome::Err(e) => {
                        tracing::warn!(error = %e, "Discarding idle connection that failed ping");
                        self.total_connections.fetch_sub(1, Ordering::SeqCst);
                    }
                    Outcome::Cancelled(r) => {
                        self.lock_idle().push(conn);
                        return Outcome::Cancelled(r);
                    }
                    Outcome::Panicked(p) => {
                        self.total_connections.fetch_sub(1, Ordering::SeqCst);
                        return Outcome::Panicked(p);
                    }
                }
            }

            // Reserve a slot before connecting so concurrent acquirers respect the bound.
            let reserved = self.total_connections.fetch_update(
                Ordering::SeqCst,
                Ordering::SeqCst,
                |n| (n < self.config.max_connections).then_some(n + 1),
            );
            if reserved.is_err() {
                tracing::debug!(
                    max_connections = self.config.max_connections,
                    "Pool exhausted"
                );
                return Outcome::Err(Error::Pool(PoolError {
                    kind: PoolErrorKind::Exhausted,
                    message: format!(
                        "all {} connections are in use",
                        self.config.max_connections
                    ),
                }));
            }

            let conn = match self.factory.connect(cx).await {
                Outcome::Ok(conn) => conn,
                Outcome::Err(e) => {
                    self.total_connections.fetch_sub(1, Ordering::SeqCst);
                    return Outcome::Err(e);
                }
                Outcome::Cancelled(r) => {
                    self.total_connections.fetch_sub(1, Ordering::SeqCst);
                    return Outcome::Cancelled(r);
                }
                Outcome::Panicked(p) => {
                    self.total_connections.fetch_sub(1, Ordering::SeqCst);
                    return Outcome::Panicked(p);
                }
            };
            self.connections_created.fetch_add(1, Ordering::SeqCst);
            tracing::debug!(
                total = self.total_connections.load(Ordering::Relaxed),
                "Opened pooled connection"
            );
            self.checked_out(conn)
        }
    }

    fn release(&self, connection: Self::Connection) {
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
        if self.is_closed() {
            self.total_connections.fetch_sub(1, Ordering::SeqCst);
            return;
        }
        let mut idle = self.lock_idle();
        if idle.len() < self.config.max_idle {
            idle.push(connection);
        } else {
            self.total_connections.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn discard(&self, connection: Self::Connection) {
        self.active_connections.fetch_sub(1, Ordering::SeqCst);
        self.total_connections.fetch_sub(1, Ordering::SeqCst);
        drop(connection);
    }
}

#[cfg(test)]
#[allow(clippy::manual_async_fn)] // Mock trait impls must match trait signatures
mod tests {
    use super::*;
    use asupersync::runtime::RuntimeBuilder;
    use ormtx_core::{BeginOptions, Dialect, Row, Statement};
    use std::sync::Arc;

    fn unwrap_outcome<T>(outcome: Outcome<T, Error>) -> T {
        match outcome {
            Outcome::Ok(v) => v,
            Outcome::Err(e) => panic!("unexpected error: {e}"),
            Outcome::Cancelled(r) => panic!("cancelled: {r:?}"),
            Outcome::Panicked(p) => panic!("panicked: {p:?}"),
        }
    }

    #[derive(Debug)]
    struct MockConnection {
        id: usize,
        healthy: Arc<AtomicBool>,
    }

    impl Connection for MockConnection {
        fn dialect(&self) -> Dialect {
            Dialect::Sqlite
        }

        fn begin(
            &self,
            _cx: &Cx,
            _options: BeginOptions,
        ) -> impl Future<Output = Outcome<(), Error>> + Send {
            async { Outcome::Ok(()) }
        }

        fn query(
            &self,
            _cx: &Cx,
            _statement: &Statement,
        ) -> impl Future<Output = Outcome<Vec<Row>, Error>> + Send {
            async { Outcome::Ok(vec![]) }
        }

        fn execute(
            &self,
            _cx: &Cx,
            _statement: &Statement,
        ) -> impl Future<Output = Outcome<u64, Error>> + Send {
            async { Outcome::Ok(0) }
        }

        fn commit(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
            async { Outcome::Ok(()) }
        }

        fn rollback(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
            async { Outcome::Ok(()) }
        }

        fn ping(&self, _cx: &Cx) -> impl Future<Output = Outcome<(), Error>> + Send {
            let healthy = self.healthy.load(Ordering::SeqCst);
            async move {
                if healthy {
                    Outcome::Ok(())
                } else {
                    Outcome::Err(Error::Custom("connection is gone".to_string()))
                }
            }
        }
    }

    struct MockFactory {
        opened: AtomicUsize,
        healthy: Arc<AtomicBool>,
    }

    impl MockFactory {
        fn new() -> Self {
            Self {
                opened: AtomicUsize::new(0),
                healthy: Arc::new(AtomicBool::new(true)),
            }
        }
    }

    impl ConnectionFactory for MockFactory {
        type Connection = MockConnection;

        fn connect(&self, _cx: &Cx) -> impl Future<Output = Outcome<MockConnection, Error>> + Send {
            let id = self.opened.fetch_add(1, Ordering::SeqCst);
            let healthy = Arc::clone(&self.healthy);
            async move { Outcome::Ok(MockConnection { id, healthy }) }
        }
    }

    #[test]
    fn test_pool_config_builder() {
        let config = PoolConfig::new(4).max_idle(2).test_on_checkout(false);
        assert_eq!(config.max_connections, 4);
        assert_eq!(config.max_idle, 2);
        assert!(!config.test_on_checkout);
    }

    #[test]
    fn test_released_connections_are_reused() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let pool = Pool::new(MockFactory::new(), PoolConfig::new(2));

        rt.block_on(async {
            let first = unwrap_outcome(pool.acquire(&cx).await);
            assert_eq!(first.id, 0);
            pool.release(first);

            let again = unwrap_outcome(pool.acquire(&cx).await);
            assert_eq!(again.id, 0);
            pool.release(again);
        });

        let stats = pool.stats();
        assert_eq!(stats.connections_created, 1);
        assert_eq!(stats.acquires, 2);
        assert_eq!(stats.idle_connections, 1);
        assert_eq!(stats.active_connections, 0);
    }

    #[test]
    fn test_exhausted_pool_fails_fast() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let pool = Pool::new(MockFactory::new(), PoolConfig::new(1));

        rt.block_on(async {
            let held = unwrap_outcome(pool.acquire(&cx).await);
            assert!(pool.at_capacity());
            match pool.acquire(&cx).await {
                Outcome::Err(e @ Error::Pool(_)) => assert!(e.is_retryable()),
                other => panic!("expected pool exhaustion, got {other:?}"),
            }
            pool.release(held);
            let _again = unwrap_outcome(pool.acquire(&cx).await);
        });
    }

    #[test]
    fn test_unhealthy_idle_connection_is_replaced() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let factory = MockFactory::new();
        let healthy = Arc::clone(&factory.healthy);
        let pool = Pool::new(factory, PoolConfig::new(1));

        rt.block_on(async {
            let conn = unwrap_outcome(pool.acquire(&cx).await);
            pool.release(conn);
            healthy.store(false, Ordering::SeqCst);
            let replacement = unwrap_outcome(pool.acquire(&cx).await);
            assert_eq!(replacement.id, 1);
            pool.release(replacement);
        });

        assert_eq!(pool.stats().connections_created, 2);
        assert_eq!(pool.stats().total_connections, 1);
    }

    #[test]
    fn test_discard_and_close() {
        let rt = RuntimeBuilder::current_thread()
            .build()
            .expect("create asupersync runtime");
        let cx = Cx::for_testing();
        let pool = Pool::new(MockFactory::new(), PoolConfig::new(2));

        rt.block_on(async {
            let a = unwrap_outcome(pool.acquire(&cx).await);
            let b = unwrap_outcome(pool.acquire(&cx).await);
            pool.discard(a);
            pool.release(b);
            assert_eq!(pool.stats().total_connections, 1);

            pool.close();
            assert_eq!(pool.stats().total_connections, 0);
            match pool.acquire(&cx).await {
                Outcome::Err(Error::Pool(PoolError {
                    kind: PoolErrorKind::Closed,
                    ..
                })) => {}
                other => panic!("expected closed pool, got {other:?}"),
            }
        });
    }
}
