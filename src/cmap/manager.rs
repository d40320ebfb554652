use std::sync::Weak;

use super::{conn::Connection, ConnectionPoolInner};

/// A handle held by checked-out connections that returns them to their pool when they are
/// dropped. Holding only a weak reference means an outstanding connection does not keep a
/// torn-down pool alive.
#[derive(Clone, Debug)]
pub(crate) struct PoolManager {
    pub(super) pool: Weak<ConnectionPoolInner>,
}

impl PoolManager {
    /// Check the connection back into the pool. If the pool has already been dropped, the
    /// connection simply closes.
    pub(crate) fn check_in(&self, connection: Connection) {
        if let Some(pool) = self.pool.upgrade() {
            ConnectionPoolInner::check_in(&pool, connection);
        }
    }
}
