mod cluster_time;
pub(crate) mod pool;

use std::{
    sync::Arc,
    time::{Duration, Instant},
};

use uuid::Uuid;

use crate::{
    bson::{doc, spec::BinarySubtype, Binary, Bson, Document, Timestamp},
    error::{ErrorKind, Result, TRANSIENT_TRANSACTION_ERROR, UNKNOWN_TRANSACTION_COMMIT_RESULT},
    operation::{AbortTransaction, CommitTransaction, Operation},
    options::{ServerAddress, SessionOptions, TransactionOptions},
    sdam::{ServerInfo, TransactionSupportStatus},
    selection_criteria::SelectionCriteria,
    BoxFuture,
    Client,
};

pub use cluster_time::ClusterTime;
pub(crate) use pool::ServerSessionPool;

/// The wall-clock budget for the retry loop in
/// [`with_transaction`](ClientSession::with_transaction).
const WITH_TRANSACTION_TIMEOUT: Duration = Duration::from_secs(120);

/// A MongoDB client session. This struct represents a logical session used for ordering
/// sequential operations. To create a `ClientSession`, call `start_session` on a `Client`.
///
/// `ClientSession` instances are not thread safe or fork safe. They can only be used by one
/// thread or process at a time.
#[derive(Debug)]
pub struct ClientSession {
    cluster_time: Option<ClusterTime>,
    server_session: ServerSession,
    client: Client,
    is_implicit: bool,
    options: Option<SessionOptions>,
    pub(crate) transaction: Transaction,
    pub(crate) operation_time: Option<Timestamp>,
}

/// The session's slice of transaction state: where in the lifecycle it is, the options the
/// transaction was started with, and the sharded-cluster bookkeeping (mongos pin and recovery
/// token).
#[derive(Debug, Default)]
pub(crate) struct Transaction {
    pub(crate) state: TransactionState,
    pub(crate) options: Option<TransactionOptions>,
    pub(crate) pinned_mongos: Option<SelectionCriteria>,
    pub(crate) recovery_token: Option<Document>,
    /// Whether at least one operation has been sent to the server as part of this transaction.
    pub(crate) operations_sent: bool,
}

impl Transaction {
    /// Enter `Starting` with the given options, wiping everything a previous transaction left
    /// behind.
    pub(crate) fn begin(&mut self, options: Option<TransactionOptions>) {
        *self = Transaction {
            state: TransactionState::Starting,
            options,
            ..Default::default()
        };
    }

    /// Leave the transaction in a terminal state. Aborting drops the options and the pin; a
    /// commit keeps both, since the commit may be re-run.
    pub(crate) fn conclude(&mut self, state: TransactionState) {
        if matches!(state, TransactionState::Aborted) {
            self.options = None;
            self.pinned_mongos = None;
        }
        self.state = state;
    }

    /// Back to `None`, as when an unrelated operation follows a finished transaction.
    pub(crate) fn reset(&mut self) {
        *self = Default::default();
    }

    pub(crate) fn pinned_mongos(&self) -> Option<&SelectionCriteria> {
        self.pinned_mongos.as_ref()
    }

    fn take(&mut self) -> Self {
        std::mem::take(self)
    }
}

#[derive(Clone, Debug, PartialEq, Default)]
pub(crate) enum TransactionState {
    #[default]
    None,
    Starting,
    InProgress,
    Committed {
        /// Whether the transaction had sent any operations when `commit_transaction` was first
        /// called, i.e. whether there is anything server-side for a repeated commit to
        /// re-commit.
        wrote_data: bool,
    },
    Aborted,
}

impl ClientSession {
    /// Creates a new `ClientSession` by checking out a corresponding `ServerSession` from the
    /// provided client's session pool.
    pub(crate) async fn new(
        client: Client,
        options: Option<SessionOptions>,
        is_implicit: bool,
    ) -> Self {
        let timeout = client.inner.topology.logical_session_timeout();
        let server_session = client.inner.session_pool.check_out(timeout).await;
        Self {
            client,
            server_session,
            cluster_time: None,
            is_implicit,
            options,
            transaction: Default::default(),
            operation_time: None,
        }
    }

    /// The client used to create this session.
    pub fn client(&self) -> Client {
        self.client.clone()
    }

    /// The id of this session.
    pub fn id(&self) -> &Document {
        &self.server_session.id
    }

    /// Whether this session was created implicitly by the driver or explicitly by the user.
    pub(crate) fn is_implicit(&self) -> bool {
        self.is_implicit
    }

    /// Whether this session is currently in a transaction.
    pub(crate) fn in_transaction(&self) -> bool {
        self.transaction.state == TransactionState::Starting
            || self.transaction.state == TransactionState::InProgress
    }

    /// The highest seen cluster time this session has seen so far.
    /// This will be `None` if this session has not been used in an operation yet.
    pub fn cluster_time(&self) -> Option<&ClusterTime> {
        self.cluster_time.as_ref()
    }

    /// The options used to create this session.
    pub(crate) fn options(&self) -> Option<&SessionOptions> {
        self.options.as_ref()
    }

    /// Set the cluster time to the provided one if it is greater than this session's highest
    /// seen cluster time or if this session's cluster time is `None`.
    pub fn advance_cluster_time(&mut self, to: &ClusterTime) {
        if self.cluster_time().map(|ct| ct < to).unwrap_or(true) {
            self.cluster_time = Some(to.clone());
        }
    }

    /// Advance operation time for this session. If the provided timestamp is earlier than this
    /// session's current operation time, then the operation time is unchanged.
    pub fn advance_operation_time(&mut self, ts: Timestamp) {
        self.operation_time = match self.operation_time {
            Some(current_op_time) if current_op_time < ts => Some(ts),
            None => Some(ts),
            _ => self.operation_time,
        }
    }

    /// The operation time returned by the last operation executed in this session.
    pub fn operation_time(&self) -> Option<Timestamp> {
        self.operation_time
    }

    /// Whether reads in this session observe the effects of prior writes made in the session.
    /// Defaults to true for explicit sessions.
    pub(crate) fn causal_consistency(&self) -> bool {
        self.options()
            .and_then(|opts| opts.causal_consistency)
            .unwrap_or(!self.is_implicit())
    }

    /// Mark this session (and the underlying server session) as dirty.
    pub(crate) fn mark_dirty(&mut self) {
        self.server_session.dirty = true;
    }

    /// Updates the date that the underlying server session was last used as part of an operation
    /// sent to the server.
    pub(crate) fn update_last_use(&mut self) {
        self.server_session.last_use = Instant::now();
    }

    /// Gets the current txn_number.
    pub(crate) fn txn_number(&self) -> i64 {
        self.server_session.txn_number
    }

    /// Increments the txn_number.
    pub(crate) fn increment_txn_number(&mut self) {
        self.server_session.txn_number += 1;
    }

    /// Increments the txn_number and returns the new value.
    pub(crate) fn get_and_increment_txn_number(&mut self) -> i64 {
        self.increment_txn_number();
        self.server_session.txn_number
    }

    /// Pin this session to the mongos at the given address; all subsequent operations in the
    /// active transaction must be routed to it.
    pub(crate) fn pin_mongos(&mut self, address: ServerAddress) {
        self.transaction.pinned_mongos = Some(SelectionCriteria::Predicate(Arc::new(
            move |server_info: &ServerInfo| *server_info.address() == address,
        )));
    }

    pub(crate) fn unpin(&mut self) {
        self.transaction.pinned_mongos = None;
    }

    fn default_transaction_options(&self) -> Option<&TransactionOptions> {
        self.options
            .as_ref()
            .and_then(|options| options.default_transaction_options.as_ref())
    }

    /// Starts a new transaction on this session with the given `TransactionOptions`. If no
    /// options are provided, the session's `defaultTransactionOptions` will be used. This session
    /// must be passed into each operation within the transaction; otherwise, the operation will
    /// be executed outside of the transaction.
    ///
    /// Errors returned from operations executed within a transaction may include a
    /// [`crate::error::TRANSIENT_TRANSACTION_ERROR`] label. This label indicates that the entire
    /// transaction can be retried with a reasonable expectation that it will succeed.
    ///
    /// Transactions are supported on MongoDB 4.0+. The driver supports transactions on replica
    /// sets and, on MongoDB 4.2+, sharded clusters.
    pub async fn start_transaction(
        &mut self,
        options: impl Into<Option<TransactionOptions>>,
    ) -> Result<()> {
        match self.transaction.state {
            TransactionState::Starting | TransactionState::InProgress => {
                return Err(ErrorKind::Transaction {
                    message: "transaction already in progress".into(),
                }
                .into());
            }
            TransactionState::Committed { .. } => {
                // Unpin session if the previous transaction is committed.
                self.unpin();
            }
            _ => {}
        }
        match self.client.transaction_support_status().await? {
            TransactionSupportStatus::Supported => {
                let mut options = match options.into() {
                    Some(mut options) => {
                        if let Some(defaults) = self.default_transaction_options() {
                            merge_options!(
                                defaults,
                                options,
                                [
                                    read_concern,
                                    write_concern,
                                    selection_criteria,
                                    max_commit_time
                                ]
                            );
                        }
                        Some(options)
                    }
                    None => self.default_transaction_options().cloned(),
                };
                resolve_options!(
                    self.client,
                    options,
                    [read_concern, write_concern, selection_criteria]
                );

                if let Some(ref options) = options {
                    if !options
                        .write_concern
                        .as_ref()
                        .map(|wc| wc.is_acknowledged())
                        .unwrap_or(true)
                    {
                        return Err(ErrorKind::Transaction {
                            message: "transactions do not support unacknowledged write concerns"
                                .into(),
                        }
                        .into());
                    }
                }

                self.increment_txn_number();
                self.unpin();
                self.transaction.begin(options);
                Ok(())
            }
            _ => Err(ErrorKind::Transaction {
                message: "Transactions are not supported by this deployment".into(),
            }
            .into()),
        }
    }

    /// Commits the transaction that is currently active on this session.
    ///
    /// This method may return an error with a
    /// [`crate::error::UNKNOWN_TRANSACTION_COMMIT_RESULT`] label. This label indicates that it
    /// is unknown whether the commit has satisfied the write concern associated with the
    /// transaction. If an error with this label is returned, it is safe to retry the commit
    /// until the write concern is satisfied or an error without the label is returned.
    pub async fn commit_transaction(&mut self) -> Result<()> {
        match &mut self.transaction.state {
            TransactionState::None => Err(ErrorKind::Transaction {
                message: "no transaction started".into(),
            }
            .into()),
            TransactionState::Aborted => Err(ErrorKind::Transaction {
                message: "Cannot call commitTransaction after calling abortTransaction".into(),
            }
            .into()),
            TransactionState::Starting => {
                // No operation was ever sent; there is nothing for the server to commit.
                self.transaction.conclude(TransactionState::Committed { wrote_data: false });
                Ok(())
            }
            TransactionState::InProgress => {
                let commit_transaction =
                    CommitTransaction::new(self.transaction.options.clone());
                self.transaction.conclude(TransactionState::Committed { wrote_data: true });
                let client = self.client.clone();
                client.execute_operation(commit_transaction, &mut *self).await
            }
            TransactionState::Committed {
                wrote_data: true,
            } => {
                let mut commit_transaction =
                    CommitTransaction::new(self.transaction.options.clone());
                commit_transaction.update_for_retry();
                let client = self.client.clone();
                client.execute_operation(commit_transaction, &mut *self).await
            }
            TransactionState::Committed {
                wrote_data: false,
            } => Ok(()),
        }
    }

    /// Aborts the transaction that is currently active on this session. Any open transaction
    /// will be aborted automatically in the `Drop` implementation of `ClientSession`.
    ///
    /// Errors returned from the server when aborting are swallowed: the transaction is dead
    /// either way.
    pub async fn abort_transaction(&mut self) -> Result<()> {
        match self.transaction.state {
            TransactionState::None => Err(ErrorKind::Transaction {
                message: "no transaction started".into(),
            }
            .into()),
            TransactionState::Committed { .. } => Err(ErrorKind::Transaction {
                message: "Cannot call abortTransaction after calling commitTransaction".into(),
            }
            .into()),
            TransactionState::Aborted => Err(ErrorKind::Transaction {
                message: "cannot call abortTransaction twice".into(),
            }
            .into()),
            TransactionState::Starting => {
                self.transaction.conclude(TransactionState::Aborted);
                Ok(())
            }
            TransactionState::InProgress => {
                let write_concern = self
                    .transaction
                    .options
                    .as_ref()
                    .and_then(|options| options.write_concern.as_ref())
                    .cloned();
                let abort_transaction =
                    AbortTransaction::new(write_concern, self.transaction.pinned_mongos.take());
                self.transaction.conclude(TransactionState::Aborted);
                let client = self.client.clone();
                let _result = client.execute_operation(abort_transaction, &mut *self).await;
                Ok(())
            }
        }
    }

    /// Starts a transaction, runs the given callback, and commits or aborts the transaction.
    /// Transient transaction errors will cause the callback or the commit to be retried;
    /// other errors will cause the transaction to be aborted and the error returned to the
    /// caller.
    ///
    /// Because the callback can be repeatedly executed and because it returns a future, the
    /// rust closure borrowing rules for captured values can be overly restrictive; a pattern
    /// that works is to pass owned context via the session's client or to clone captured data
    /// into each invocation.
    pub async fn with_transaction<R, F>(
        &mut self,
        mut callback: F,
        options: impl Into<Option<TransactionOptions>>,
    ) -> Result<R>
    where
        F: for<'b> FnMut(&'b mut ClientSession) -> BoxFuture<'b, Result<R>>,
    {
        let options = options.into();
        // The retry budget is wall-clock time from the first attempt, measured monotonically.
        let start = Instant::now();

        'transaction: loop {
            self.start_transaction(options.clone()).await?;
            let callback_result = callback(self).await;

            match callback_result {
                Ok(value) => {
                    // The callback may have committed or aborted on its own.
                    if !self.in_transaction() {
                        return Ok(value);
                    }

                    loop {
                        match self.commit_transaction().await {
                            Ok(()) => return Ok(value),
                            Err(error) => {
                                if start.elapsed() < WITH_TRANSACTION_TIMEOUT
                                    && error.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
                                    && !error.is_max_time_ms_expired_error()
                                {
                                    continue;
                                }
                                if start.elapsed() < WITH_TRANSACTION_TIMEOUT
                                    && error.contains_label(TRANSIENT_TRANSACTION_ERROR)
                                {
                                    continue 'transaction;
                                }
                                return Err(error);
                            }
                        }
                    }
                }
                Err(error) => {
                    if self.in_transaction() {
                        let _ = self.abort_transaction().await;
                    }
                    if start.elapsed() < WITH_TRANSACTION_TIMEOUT
                        && error.contains_label(TRANSIENT_TRANSACTION_ERROR)
                    {
                        continue 'transaction;
                    }
                    return Err(error);
                }
            }
        }
    }
}

struct DroppedClientSession {
    cluster_time: Option<ClusterTime>,
    server_session: ServerSession,
    client: Client,
    is_implicit: bool,
    options: Option<SessionOptions>,
    transaction: Transaction,
    operation_time: Option<Timestamp>,
}

impl From<DroppedClientSession> for ClientSession {
    fn from(dropped_session: DroppedClientSession) -> Self {
        Self {
            cluster_time: dropped_session.cluster_time,
            server_session: dropped_session.server_session,
            client: dropped_session.client,
            is_implicit: dropped_session.is_implicit,
            options: dropped_session.options,
            transaction: dropped_session.transaction,
            operation_time: dropped_session.operation_time,
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        if self.transaction.state == TransactionState::InProgress {
            let dropped_session = DroppedClientSession {
                cluster_time: self.cluster_time.clone(),
                server_session: self.server_session.clone(),
                client: self.client.clone(),
                is_implicit: self.is_implicit,
                options: self.options.clone(),
                transaction: self.transaction.take(),
                operation_time: self.operation_time,
            };
            crate::runtime::spawn(async move {
                let mut session: ClientSession = dropped_session.into();
                let _result = session.abort_transaction().await;
            });
        } else {
            let client = self.client.clone();
            let server_session = self.server_session.clone();
            crate::runtime::spawn(async move {
                client.check_in_server_session(server_session).await;
            });
        }
    }
}

/// Client side abstraction of a server session. These are pooled and may be associated with
/// multiple `ClientSession`s over the course of their lifetime.
#[derive(Clone, Debug)]
pub(crate) struct ServerSession {
    /// The id of the server session to which this corresponds.
    pub(super) id: Document,

    /// The last time an operation was executed with this session.
    pub(super) last_use: Instant,

    /// Whether a network error was encountered while using this session.
    pub(super) dirty: bool,

    /// A monotonically increasing transaction number for this session.
    pub(super) txn_number: i64,

    /// The session pool's epoch at the time this session was minted.
    pub(super) epoch: u64,
}

impl ServerSession {
    /// Creates a new session, generating the id client side.
    fn new(epoch: u64) -> Self {
        let binary = Bson::Binary(Binary {
            subtype: BinarySubtype::Uuid,
            bytes: Uuid::new_v4().as_bytes().to_vec(),
        });

        Self {
            id: doc! { "id": binary },
            last_use: Instant::now(),
            dirty: false,
            txn_number: 0,
            epoch,
        }
    }

    /// Determines if this server session is about to expire in a short amount of time (1
    /// minute).
    fn is_about_to_expire(&self, logical_session_timeout: Option<Duration>) -> bool {
        let timeout = match logical_session_timeout {
            Some(t) => t,
            None => return false,
        };
        let expiration_date = self.last_use + timeout;
        expiration_date < Instant::now() + Duration::from_secs(60)
    }
}
