use std::time::Duration;

use crate::client::options::ClientOptions;

/// Options for a per-server connection pool, derived from the client options.
#[derive(Clone, Debug, Default)]
pub(crate) struct ConnectionPoolOptions {
    /// The maximum number of connections that the pool can have at a given time. This includes
    /// connections which are currently checked out of the pool.
    pub(crate) max_pool_size: Option<u32>,

    /// The minimum number of connections the pool keeps; retained for configuration
    /// completeness, connections are only established on demand.
    pub(crate) min_pool_size: Option<u32>,

    /// Connections that have been ready for usage in the pool for longer than `max_idle_time`
    /// will be closed rather than handed out.
    pub(crate) max_idle_time: Option<Duration>,

    /// If a checkout operation takes longer than `wait_queue_timeout`, the pool will return an
    /// error. If `wait_queue_timeout` is `None`, the checkout operation will not time out.
    pub(crate) wait_queue_timeout: Option<Duration>,
}

impl ConnectionPoolOptions {
    pub(crate) fn from_client_options(options: &ClientOptions) -> Self {
        Self {
            max_pool_size: options.max_pool_size,
            min_pool_size: options.min_pool_size,
            max_idle_time: options.max_idle_time,
            wait_queue_timeout: options.wait_queue_timeout,
        }
    }
}
