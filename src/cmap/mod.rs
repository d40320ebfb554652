pub(crate) mod conn;
pub(crate) mod establish;
mod manager;
pub(crate) mod options;

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
        Mutex,
    },
};

use tokio::sync::Semaphore;

pub(crate) use self::conn::{Command, Connection, RawCommandResponse, StreamDescription};
use self::{
    conn::PendingConnection,
    establish::ConnectionEstablisher,
    manager::PoolManager,
    options::ConnectionPoolOptions,
};
use crate::{
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
    runtime,
};

pub use self::conn::ConnectionInfo;

const DEFAULT_MAX_POOL_SIZE: u32 = 100;

/// A pool of connections implementing the CMAP spec.
///
/// Idle connections are handed out most-recently-used first; checkouts beyond the pool's
/// capacity wait in FIFO order on a semaphore, bounded by the wait-queue timeout.
#[derive(Clone, Debug)]
pub(crate) struct ConnectionPool {
    inner: Arc<ConnectionPoolInner>,
}

#[derive(Debug)]
pub(crate) struct ConnectionPoolInner {
    address: ServerAddress,

    options: ConnectionPoolOptions,

    establisher: ConnectionEstablisher,

    /// The current generation of the pool. The generation is incremented whenever the pool is
    /// cleared. Connections belonging to a previous generation are considered stale and will be
    /// closed when checked back in or when popped off of the set of available connections.
    generation: AtomicU32,

    /// The ID of the next connection created by the pool.
    next_connection_id: AtomicU32,

    /// The set of available connections in the pool, most recently used first. Stale, errored,
    /// or idle connections are closed lazily when they reach the front of the stack.
    available: Mutex<VecDeque<Connection>>,

    /// Gate on the number of connections currently checked out; acquired in FIFO order so the
    /// wait queue is fair.
    wait_queue: Semaphore,
}

impl ConnectionPool {
    pub(crate) fn new(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        options: ConnectionPoolOptions,
    ) -> Self {
        let max_pool_size = options.max_pool_size.unwrap_or(DEFAULT_MAX_POOL_SIZE);

        let inner = ConnectionPoolInner {
            address,
            options,
            establisher,
            generation: AtomicU32::new(0),
            next_connection_id: AtomicU32::new(1),
            available: Mutex::new(VecDeque::new()),
            wait_queue: Semaphore::new(max_pool_size as usize),
        };

        Self {
            inner: Arc::new(inner),
        }
    }

    /// The pool's current generation.
    pub(crate) fn generation(&self) -> u32 {
        self.inner.generation.load(Ordering::SeqCst)
    }

    /// Checks out a connection from the pool, establishing a new one if no healthy idle
    /// connection exists and the pool is below its maximum size. Blocks in FIFO order until
    /// capacity is available, bounded by the wait-queue timeout.
    pub(crate) async fn check_out(&self) -> Result<Connection> {
        let permit = match runtime::timeout_opt(
            self.inner.options.wait_queue_timeout,
            self.inner.wait_queue.acquire(),
        )
        .await
        {
            Ok(Ok(permit)) => permit,
            Ok(Err(_)) => {
                return Err(Error::internal("connection pool wait queue was closed"))
            }
            Err(_) => {
                return Err(ErrorKind::WaitQueueTimeout {
                    address: self.inner.address.clone(),
                }
                .into())
            }
        };

        // The permit now accounts for the connection being checked out; it is restored on
        // check-in (or on establishment failure).
        permit.forget();

        let result = self.acquire_or_establish().await;

        match result {
            Ok(mut connection) => {
                connection.on_checked_out(PoolManager {
                    pool: Arc::downgrade(&self.inner),
                });
                Ok(connection)
            }
            Err(e) => {
                self.inner.wait_queue.add_permits(1);
                Err(e)
            }
        }
    }

    async fn acquire_or_establish(&self) -> Result<Connection> {
        let generation = self.generation();

        // Try the most recently used healthy idle connection first.
        loop {
            let conn = self.inner.available.lock().unwrap().pop_front();
            match conn {
                Some(conn) if conn.is_stale(generation) => continue,
                Some(conn) if conn.is_poisoned() => continue,
                Some(conn) if conn.is_idle(self.inner.options.max_idle_time) => continue,
                Some(conn) => return Ok(conn),
                None => break,
            }
        }

        let pending = PendingConnection {
            id: self
                .inner
                .next_connection_id
                .fetch_add(1, Ordering::SeqCst),
            address: self.inner.address.clone(),
            generation,
        };

        self.inner.establisher.establish_connection(pending).await
    }

    /// Increments the generation of the pool and closes all idle connections. Future checkouts
    /// can never return a connection from before the bump.
    pub(crate) fn clear(&self, cause: Option<&Error>) {
        self.inner.generation.fetch_add(1, Ordering::SeqCst);

        let dropped: Vec<Connection> = self.inner.available.lock().unwrap().drain(..).collect();
        tracing::debug!(
            address = %self.inner.address,
            closed = dropped.len(),
            cause = cause.map(|e| e.to_string()).as_deref(),
            "connection pool cleared"
        );
        drop(dropped);
    }
}

impl ConnectionPoolInner {
    /// Checks a connection back into the pool. Stale and errored connections are closed rather
    /// than returned to the idle set. Called synchronously from `Connection::drop` via
    /// `PoolManager`.
    pub(super) fn check_in(self: &Arc<Self>, mut connection: Connection) {
        let generation = self.generation.load(Ordering::SeqCst);

        if !connection.is_stale(generation) && !connection.is_poisoned() {
            connection.on_checked_in();
            self.available.lock().unwrap().push_front(connection);
        }

        self.wait_queue.add_permits(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        client::options::ClientOptions,
        runtime::AsyncStream,
    };
    use std::time::Duration;

    fn test_pool(max_pool_size: u32, wait_queue_timeout: Option<Duration>) -> ConnectionPool {
        let address = ServerAddress::parse("localhost:27017").unwrap();
        let establisher =
            ConnectionEstablisher::new(&ClientOptions::default()).unwrap();
        ConnectionPool::new(
            address,
            establisher,
            ConnectionPoolOptions {
                max_pool_size: Some(max_pool_size),
                min_pool_size: None,
                max_idle_time: None,
                wait_queue_timeout,
            },
        )
    }

    fn dummy_connection(pool: &ConnectionPool, generation: u32) -> Connection {
        Connection::new(
            pool.inner.address.clone(),
            AsyncStream::Null,
            99,
            generation,
            None,
        )
    }

    #[tokio::test]
    async fn checkout_times_out_when_capacity_exhausted() {
        let pool = test_pool(1, Some(Duration::from_millis(50)));

        // Consume the only permit without returning it.
        let permit = pool.inner.wait_queue.acquire().await.unwrap();
        permit.forget();

        let err = pool.check_out().await.unwrap_err();
        assert!(matches!(
            *err.kind,
            ErrorKind::WaitQueueTimeout { .. }
        ));
    }

    #[tokio::test]
    async fn stale_connections_are_discarded_after_clear() {
        let pool = test_pool(2, None);

        let conn = dummy_connection(&pool, pool.generation());
        ConnectionPoolInner::check_in(&pool.inner, conn);
        assert_eq!(pool.inner.available.lock().unwrap().len(), 1);

        pool.clear(None);
        assert_eq!(pool.inner.available.lock().unwrap().len(), 0);

        // A connection from the old generation checked in after the clear is dropped too.
        let old = dummy_connection(&pool, 0);
        ConnectionPoolInner::check_in(&pool.inner, old);
        assert_eq!(pool.inner.available.lock().unwrap().len(), 0);

        // One from the current generation is retained.
        let fresh = dummy_connection(&pool, pool.generation());
        ConnectionPoolInner::check_in(&pool.inner, fresh);
        assert_eq!(pool.inner.available.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn check_in_restores_capacity() {
        let pool = test_pool(1, Some(Duration::from_millis(50)));

        let permit = pool.inner.wait_queue.acquire().await.unwrap();
        permit.forget();

        // Returning a connection restores the permit, so a subsequent checkout can proceed to
        // the idle stack.
        let conn = dummy_connection(&pool, pool.generation());
        ConnectionPoolInner::check_in(&pool.inner, conn);

        let checked_out = pool.check_out().await.unwrap();
        assert_eq!(checked_out.id, 99);
    }
}
