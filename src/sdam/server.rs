use std::sync::atomic::{AtomicU32, Ordering};

use crate::{
    cmap::{establish::ConnectionEstablisher, options::ConnectionPoolOptions, ConnectionPool},
    options::ServerAddress,
};

/// Contains the state for a given server in the topology: its connection pool and the number of
/// operations currently executing against it.
#[derive(Debug)]
pub(crate) struct Server {
    pub(crate) address: ServerAddress,

    /// The application connection pool for this server.
    pub(crate) pool: ConnectionPool,

    /// Number of operations currently using this server.
    operation_count: AtomicU32,
}

impl Server {
    pub(crate) fn new(
        address: ServerAddress,
        establisher: ConnectionEstablisher,
        pool_options: ConnectionPoolOptions,
    ) -> Self {
        Self {
            pool: ConnectionPool::new(address.clone(), establisher, pool_options),
            address,
            operation_count: AtomicU32::new(0),
        }
    }

    pub(crate) fn increment_operation_count(&self) {
        self.operation_count.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn decrement_operation_count(&self) {
        self.operation_count.fetch_sub(1, Ordering::SeqCst);
    }

    #[allow(dead_code)]
    pub(crate) fn operation_count(&self) -> u32 {
        self.operation_count.load(Ordering::SeqCst)
    }
}
