use std::time::Instant;

use super::{session::TransactionState, Client, ClientSession};
use crate::{
    bson::{Bson, Document, Timestamp},
    change_stream::options::ChangeStreamOptions,
    client::session::ClusterTime,
    cmap::{conn::wire::next_request_id, Command, Connection, RawCommandResponse, StreamDescription},
    cursor::CursorSpecification,
    error::{
        Error,
        ErrorKind,
        Result,
        RETRYABLE_WRITE_ERROR,
        TRANSIENT_TRANSACTION_ERROR,
        UNKNOWN_TRANSACTION_COMMIT_RESULT,
    },
    event::command::{
        CommandEvent,
        CommandFailedEvent,
        CommandStartedEvent,
        CommandSucceededEvent,
    },
    operation::{
        AbortTransaction,
        AggregateTarget,
        ChangeStreamAggregate,
        CommandErrorBody,
        CommitTransaction,
        Operation,
        Retryability,
    },
    options::ServerAddress,
    sdam::ServerType,
    selection_criteria::{ReadPreference, SelectionCriteria},
};

/// The session an operation runs under: none, the caller's, or one the dispatcher created for
/// the duration of the operation (and its cursor, if it produces one).
enum OpSession<'a> {
    None,
    Explicit(&'a mut ClientSession),
    Implicit(ClientSession),
}

impl OpSession<'_> {
    fn as_mut(&mut self) -> Option<&mut ClientSession> {
        match self {
            Self::None => None,
            Self::Explicit(session) => Some(session),
            Self::Implicit(session) => Some(session),
        }
    }

    /// The implicit session, if one was created, so it can follow the operation's cursor.
    fn take_implicit(self) -> Option<ClientSession> {
        match self {
            Self::Implicit(session) => Some(session),
            _ => None,
        }
    }
}

/// Everything the retry driver needs to know about a failed attempt.
struct AttemptFailure {
    error: Error,
    /// The server the attempt ran against, if it got that far; the retry avoids it when
    /// another candidate exists.
    server: Option<ServerAddress>,
    /// The transaction number used, so the retry reuses it and the server can deduplicate.
    txn_number: Option<i64>,
    /// The retryability that applied to this attempt.
    retryability: Retryability,
}

impl AttemptFailure {
    /// Whether the dispatcher is allowed a second attempt after this failure.
    fn permits_retry(&self) -> bool {
        if self.error.is_pool_cleared() {
            // A concurrent failure churned the pool out from under this operation; trying
            // again is always reasonable.
            return true;
        }
        match self.retryability {
            Retryability::Read => self.error.is_read_retryable(),
            Retryability::Write => self.error.is_write_retryable(),
            Retryability::None => false,
        }
    }
}

impl Client {
    /// Execute the given operation.
    ///
    /// Server selection will be performed using the criteria specified on the operation, if any,
    /// and an implicit session will be created if the operation and write concern are compatible
    /// with sessions and an explicit session is not provided.
    pub(crate) async fn execute_operation<T: Operation>(
        &self,
        op: T,
        session: impl Into<Option<&mut ClientSession>>,
    ) -> Result<T::O> {
        self.shutdown_check()?;
        self.execute_operation_unchecked(op, session).await
    }

    /// Like `execute_operation`, but runs even on a shut-down client; the shutdown path itself
    /// needs this to send `endSessions`.
    pub(crate) async fn execute_operation_unchecked<T: Operation>(
        &self,
        mut op: T,
        session: impl Into<Option<&mut ClientSession>>,
    ) -> Result<T::O> {
        Box::pin(async {
            self.execute_operation_with_details(&mut op, session.into())
                .await
                .map(|details| details.output)
        })
        .await
    }

    /// Execute the given operation, returning the cursor specification it produced along with
    /// the implicit session created for it, if any. The session must accompany the cursor so
    /// that `getMore`s run under the same lsid.
    pub(crate) async fn execute_cursor_operation<Op>(
        &self,
        mut op: Op,
    ) -> Result<(CursorSpecification, Option<ClientSession>)>
    where
        Op: Operation<O = CursorSpecification>,
    {
        self.shutdown_check()?;
        let details = self.execute_operation_with_details(&mut op, None).await?;
        Ok((details.output, details.implicit_session))
    }

    /// Run the aggregation that backs a change stream.
    pub(crate) async fn execute_watch(
        &self,
        target: AggregateTarget,
        pipeline: Vec<Document>,
        options: Option<&ChangeStreamOptions>,
    ) -> Result<(CursorSpecification, Option<Timestamp>, Option<ClientSession>)> {
        self.shutdown_check()?;
        let mut op = ChangeStreamAggregate::new(
            target,
            pipeline,
            options,
            options.map(|o| o.aggregate_options()),
        )?;
        let details = self.execute_operation_with_details(&mut op, None).await?;
        let (spec, operation_time) = details.output;
        Ok((spec, operation_time, details.implicit_session))
    }

    async fn execute_operation_with_details<T: Operation>(
        &self,
        op: &mut T,
        session: Option<&mut ClientSession>,
    ) -> Result<ExecutionDetails<T>> {
        // TODO: support unacknowledged write concerns by fire-and-forget messages.
        if !op.is_acknowledged() {
            return Err(ErrorKind::InvalidArgument {
                message: "Unacknowledged write concerns are not supported".to_string(),
            }
            .into());
        }

        if let Some(ref session) = session {
            if !std::sync::Arc::ptr_eq(&self.inner, &session.client().inner) {
                return Err(ErrorKind::InvalidArgument {
                    message: "the session provided to an operation must be created from the same \
                              client as the collection/database"
                        .into(),
                }
                .into());
            }

            if let Some(SelectionCriteria::ReadPreference(read_preference)) =
                op.selection_criteria()
            {
                if session.in_transaction() && read_preference != &ReadPreference::Primary {
                    return Err(ErrorKind::Transaction {
                        message: "read preference in a transaction must be primary".into(),
                    }
                    .into());
                }
            }
        }

        self.execute_with_one_retry(op, session).await
    }

    /// The retry-once pipeline: run the operation, and when the failure and the operation both
    /// permit it, run it exactly once more. Per the retryable-writes contract, the second
    /// attempt reuses the first one's transaction number and prefers a different server; its
    /// outcome is what the caller sees, whatever it is.
    async fn execute_with_one_retry<T: Operation>(
        &self,
        op: &mut T,
        session: Option<&mut ClientSession>,
    ) -> Result<ExecutionDetails<T>> {
        let mut op_session = match session {
            Some(session) => OpSession::Explicit(session),
            None => OpSession::None,
        };

        // A finished transaction's state is carried on the session until the next operation so
        // that commit can be re-run; anything else starting resets it.
        if let Some(session) = op_session.as_mut() {
            let done = match session.transaction.state {
                TransactionState::Committed { .. } => op.name() != CommitTransaction::NAME,
                TransactionState::Aborted => op.name() != AbortTransaction::NAME,
                _ => false,
            };
            if done {
                session.transaction.reset();
            }
        }

        let failure = match self.attempt(op, &mut op_session, None, None).await {
            Ok(output) => {
                return Ok(ExecutionDetails {
                    output,
                    implicit_session: op_session.take_implicit(),
                })
            }
            Err(failure) => failure,
        };

        if !failure.permits_retry() {
            return Err(failure.error);
        }

        op.update_for_retry();

        match self
            .attempt(op, &mut op_session, failure.txn_number, failure.server.as_ref())
            .await
        {
            Ok(output) => Ok(ExecutionDetails {
                output,
                implicit_session: op_session.take_implicit(),
            }),
            // The second attempt's outcome is reported regardless of how it compares to the
            // first's.
            Err(second_failure) => Err(second_failure.error),
        }
    }

    /// One complete attempt: select a server, check out a connection, and run the command.
    async fn attempt<T: Operation>(
        &self,
        op: &mut T,
        op_session: &mut OpSession<'_>,
        prior_txn_number: Option<i64>,
        deprioritized: Option<&ServerAddress>,
    ) -> std::result::Result<T::O, AttemptFailure> {
        // Route the operation: a pinned transaction overrides whatever the operation wants.
        let server = {
            let mut session = op_session.as_mut();
            let criteria = session
                .as_ref()
                .and_then(|s| s.transaction.pinned_mongos())
                .or_else(|| op.selection_criteria());

            match self.select_server(criteria, deprioritized).await {
                Ok(server) => server,
                Err(mut error) => {
                    error.apply_transaction_labels(None, &mut session, None);
                    return Err(AttemptFailure {
                        error,
                        server: None,
                        txn_number: prior_txn_number,
                        // Selection failures are not retried; by the time selection gives up,
                        // its own internal timeout already waited out the topology.
                        retryability: Retryability::None,
                    });
                }
            }
        };
        let address = server.address.clone();

        let mut conn = match server.pool.check_out().await {
            Ok(conn) => conn,
            Err(mut error) => {
                if error.is_network_error() {
                    // Failing to establish a connection is indistinguishable from the server
                    // having gone away.
                    self.inner
                        .topology
                        .handle_application_error(address.clone(), error.clone())
                        .await;
                }

                let mut session = op_session.as_mut();
                error.apply_transaction_labels(None, &mut session, None);
                if error.is_read_retryable() && self.inner.options.retry_writes != Some(false) {
                    error.add_label(RETRYABLE_WRITE_ERROR);
                }

                let retryability = self.op_retryability(op, session.as_deref());
                return Err(AttemptFailure {
                    error,
                    server: Some(address),
                    txn_number: prior_txn_number,
                    retryability,
                });
            }
        };

        // Sessions require server support; an implicit one is minted here, after the
        // handshake has told us support exists.
        if matches!(op_session, OpSession::None)
            && conn.supports_sessions()
            && op.supports_sessions()
            && op.is_acknowledged()
        {
            *op_session = OpSession::Implicit(self.start_implicit_session().await);
        }

        let mut session = op_session.as_mut();
        if !conn.supports_sessions() && session.is_some() {
            return Err(AttemptFailure {
                error: ErrorKind::SessionsNotSupported.into(),
                server: Some(address),
                txn_number: prior_txn_number,
                retryability: Retryability::None,
            });
        }

        let retryability = self.connection_retryability(&conn, op, session.as_deref());
        let txn_number = prior_txn_number.or_else(|| {
            session
                .as_deref_mut()
                .and_then(|session| next_txn_number(session, retryability))
        });

        match self
            .run_on_connection(op, &mut conn, &mut session, txn_number, retryability)
            .await
        {
            Ok(output) => Ok(output),
            Err(mut error) => {
                error.wire_version = conn
                    .stream_description()
                    .ok()
                    .and_then(|description| description.max_wire_version);

                rewrite_unsupported_retryability_error(&mut error);

                self.inner
                    .topology
                    .handle_application_error(address.clone(), error.clone())
                    .await;
                // Return the connection to the pool and decrement the server's operation count
                // before the (possible) second attempt selects again.
                drop(conn);
                drop(server);

                Err(AttemptFailure {
                    error,
                    server: Some(address),
                    txn_number,
                    retryability,
                })
            }
        }
    }

    /// Executes an operation on a given connection, optionally using a provided session.
    async fn run_on_connection<T: Operation>(
        &self,
        op: &mut T,
        connection: &mut Connection,
        session: &mut Option<&mut ClientSession>,
        txn_number: Option<i64>,
        retryability: Retryability,
    ) -> Result<T::O> {
        if let Some(write_concern) = op.write_concern() {
            write_concern.validate()?;
        }

        let stream_description = connection.stream_description()?.clone();
        let is_sharded = stream_description.initial_server_type == ServerType::Mongos;

        let mut cmd = op.build(&stream_description)?;
        self.inner
            .topology
            .state()
            .description
            .update_command_with_read_pref(connection.address(), &mut cmd, op.selection_criteria());

        attach_session_fields(
            &mut cmd,
            op,
            session,
            txn_number,
            is_sharded,
            &stream_description,
            connection.address(),
        )?;

        // Every command gossips the highest cluster time the client or session has seen.
        let session_cluster_time = session.as_ref().and_then(|s| s.cluster_time().cloned());
        let client_cluster_time = self.inner.topology.cluster_time();
        if let Some(cluster_time) = std::cmp::max(session_cluster_time, client_cluster_time) {
            cmd.set_cluster_time(&cluster_time);
        }

        let connection_info = connection.info();
        let request_id = next_request_id();
        let should_redact = cmd.should_redact();
        let cmd_name = cmd.name.clone();
        let target_db = cmd.target_db.clone();
        let command_body = if should_redact {
            Document::new()
        } else {
            cmd.body.clone()
        };

        self.emit_command_event(|| {
            CommandEvent::Started(CommandStartedEvent {
                command: command_body,
                db: target_db.clone(),
                command_name: cmd_name.clone(),
                request_id,
                connection: connection_info.clone(),
            })
        });

        let start_time = Instant::now();
        let command_result = match connection.send_command(cmd, request_id).await {
            Ok(response) => self.absorb_reply_metadata(session, is_sharded, response).await,
            Err(error) => Err(error),
        };
        let duration = start_time.elapsed();

        match command_result {
            Err(mut error) => {
                self.emit_command_event(|| {
                    CommandEvent::Failed(CommandFailedEvent {
                        duration,
                        command_name: cmd_name.clone(),
                        failure: error.clone(),
                        request_id,
                        connection: connection_info.clone(),
                    })
                });

                if error.is_network_error() {
                    // The session may have in-flight server state nobody will ever observe.
                    if let Some(ref mut session) = session {
                        session.mark_dirty();
                    }
                }

                error.apply_transaction_labels(
                    stream_description.max_wire_version,
                    session,
                    Some(retryability),
                );
                op.handle_error(error)
            }
            Ok(response) => {
                self.emit_command_event(|| {
                    let reply = if should_redact {
                        Document::new()
                    } else {
                        response.raw_response().clone()
                    };
                    CommandEvent::Succeeded(CommandSucceededEvent {
                        duration,
                        reply,
                        command_name: cmd_name.clone(),
                        request_id,
                        connection: connection_info.clone(),
                    })
                });

                op.handle_response(response, &stream_description)
                    .map_err(|mut error| {
                        error.apply_transaction_labels(
                            stream_description.max_wire_version,
                            session,
                            Some(retryability),
                        );
                        error
                    })
            }
        }
    }

    /// Reads the session- and cluster-level bookkeeping fields out of a server reply before the
    /// operation interprets it, and converts `ok: 0` replies into errors.
    async fn absorb_reply_metadata(
        &self,
        session: &mut Option<&mut ClientSession>,
        is_sharded: bool,
        response: RawCommandResponse,
    ) -> Result<RawCommandResponse> {
        let body = response.raw_response();

        let ok = body
            .get("ok")
            .and_then(crate::bson_util::get_int)
            .ok_or_else(|| Error::invalid_response("missing 'ok' value in response"))?;

        if let Ok(cluster_time_doc) = body.get_document("$clusterTime") {
            if let Ok(cluster_time) = bson::from_document::<ClusterTime>(cluster_time_doc.clone())
            {
                self.inner
                    .topology
                    .advance_cluster_time(cluster_time.clone())
                    .await;
                if let Some(ref mut session) = session {
                    session.advance_cluster_time(&cluster_time);
                }
            }
        }

        if let Some(ref mut session) = session {
            if let Some(Bson::Timestamp(operation_time)) = body.get("operationTime") {
                session.advance_operation_time(*operation_time);
            }

            // A mongos hands out a recovery token with each transaction reply; it must be
            // echoed on commit and abort.
            if is_sharded && session.in_transaction() {
                if let Ok(token) = body.get_document("recoveryToken") {
                    session.transaction.recovery_token = Some(token.clone());
                }
            }
        }

        if ok == 1 {
            Ok(response)
        } else {
            Err(response
                .body::<CommandErrorBody>()
                .map(Error::from)
                .unwrap_or_else(|e| {
                    Error::invalid_response(format!("error deserializing command error: {}", e))
                }))
        }
    }

    /// The retryability the operation and client configuration allow, before any connection is
    /// involved.
    fn op_retryability<T: Operation>(
        &self,
        op: &T,
        session: Option<&ClientSession>,
    ) -> Retryability {
        // Operations inside a transaction are never individually retried; the transaction has
        // its own retry loop.
        if session.map(|s| s.in_transaction()).unwrap_or(false) {
            return Retryability::None;
        }

        match op.retryability() {
            Retryability::Read if self.inner.options.retry_reads != Some(false) => {
                Retryability::Read
            }
            // Commits and aborts retry regardless of the client's retry_writes setting.
            Retryability::Write
                if op.name() == CommitTransaction::NAME
                    || op.name() == AbortTransaction::NAME
                    || self.inner.options.retry_writes != Some(false) =>
            {
                Retryability::Write
            }
            _ => Retryability::None,
        }
    }

    /// The retryability that actually applies on this connection: writes additionally need the
    /// server to support retryable writes.
    fn connection_retryability<T: Operation>(
        &self,
        conn: &Connection,
        op: &T,
        session: Option<&ClientSession>,
    ) -> Retryability {
        match self.op_retryability(op, session) {
            Retryability::Write => {
                let supported = conn
                    .stream_description
                    .as_ref()
                    .map(StreamDescription::supports_retryable_writes)
                    .unwrap_or(false);
                if supported {
                    Retryability::Write
                } else {
                    Retryability::None
                }
            }
            other => other,
        }
    }
}

/// Attaches `lsid`, `txnNumber`, causal-consistency read concern, and the transaction state
/// machine fields, advancing the session's transaction state as a side effect.
fn attach_session_fields<T: Operation>(
    cmd: &mut Command,
    op: &T,
    session: &mut Option<&mut ClientSession>,
    txn_number: Option<i64>,
    is_sharded: bool,
    stream_description: &StreamDescription,
    address: &ServerAddress,
) -> Result<()> {
    let session = match session {
        Some(ref mut session) if op.supports_sessions() && op.is_acknowledged() => session,
        Some(ref session) if !op.supports_sessions() && !session.is_implicit() => {
            return Err(ErrorKind::InvalidArgument {
                message: format!("{} does not support sessions", cmd.name),
            }
            .into());
        }
        _ => return Ok(()),
    };

    cmd.set_session(session);
    if let Some(txn_number) = txn_number {
        cmd.set_txn_number(txn_number);
    }

    // Causally consistent reads outside a running transaction are anchored to the session's
    // last observed operation time.
    if session.causal_consistency()
        && matches!(
            session.transaction.state,
            TransactionState::None | TransactionState::Starting
        )
        && op.supports_read_concern(stream_description)
    {
        cmd.set_after_cluster_time(session);
    }

    match session.transaction.state {
        TransactionState::Starting => {
            cmd.set_start_transaction();
            cmd.set_autocommit();
            if session.causal_consistency() {
                cmd.set_after_cluster_time(session);
            }
            if let Some(ref options) = session.transaction.options {
                if let Some(ref read_concern) = options.read_concern {
                    cmd.set_read_concern_level(read_concern.level.clone());
                }
            }

            // The first operation of a sharded transaction pins the session to this mongos.
            if is_sharded {
                session.pin_mongos(address.clone());
            }

            session.transaction.state = TransactionState::InProgress;
            session.transaction.operations_sent = true;
        }
        TransactionState::InProgress => {
            cmd.set_autocommit();
            session.transaction.operations_sent = true;
        }
        TransactionState::Committed { .. } | TransactionState::Aborted => {
            // Re-commit / abort of a finished transaction.
            cmd.set_autocommit();
            if is_sharded {
                if let Some(ref recovery_token) = session.transaction.recovery_token {
                    cmd.set_recovery_token(recovery_token);
                }
            }
        }
        TransactionState::None => {}
    }

    session.update_last_use();
    Ok(())
}

/// The transaction number for this attempt: inside a transaction the session's current one, for
/// a retryable write a freshly ratcheted one (shared by both attempts), otherwise none.
fn next_txn_number(session: &mut ClientSession, retryability: Retryability) -> Option<i64> {
    if session.transaction.state != TransactionState::None {
        Some(session.txn_number())
    } else if retryability == Retryability::Write {
        Some(session.get_and_increment_txn_number())
    } else {
        None
    }
}

/// Storage engines without document-level locking reject transaction numbers outright; point
/// the user at the workaround.
fn rewrite_unsupported_retryability_error(error: &mut Error) {
    if let ErrorKind::Command(ref mut command_error) = *error.kind {
        if command_error.code == 20 && command_error.message.starts_with("Transaction numbers") {
            command_error.message = "This MongoDB deployment does not support retryable writes. \
                                     Please add retryWrites=false to your connection string."
                .to_string();
        }
    }
}

impl Error {
    /// Attaches the transaction-related labels this error calls for given the session's state,
    /// and unpins the session when a label means the transaction's server binding is dead.
    ///
    /// From wire version 9 the server applies `RetryableWriteError` itself, so the driver only
    /// adds it for network errors; on older servers the retryable code set applies too.
    fn apply_transaction_labels(
        &mut self,
        max_wire_version: Option<i32>,
        session: &mut Option<&mut ClientSession>,
        retryability: Option<Retryability>,
    ) {
        let state = session
            .as_ref()
            .map(|s| s.transaction.state.clone())
            .unwrap_or(TransactionState::None);

        let retryable_write_label = match state {
            // Inside a running transaction the individual operation is never write-retryable.
            TransactionState::Starting | TransactionState::InProgress => false,
            TransactionState::Committed { .. } | TransactionState::Aborted => true,
            TransactionState::None => retryability == Some(Retryability::Write),
        };
        if retryable_write_label {
            if let Some(max_wire_version) = max_wire_version {
                if self.should_add_retryable_write_label(max_wire_version) {
                    self.add_label(RETRYABLE_WRITE_ERROR);
                }
            }
        }

        match state {
            TransactionState::Starting | TransactionState::InProgress => {
                if self.is_network_error() || self.is_server_selection_error() {
                    self.add_label(TRANSIENT_TRANSACTION_ERROR);
                }
            }
            TransactionState::Committed { .. } => {
                if self.should_add_unknown_transaction_commit_result_label() {
                    self.add_label(UNKNOWN_TRANSACTION_COMMIT_RESULT);
                }
            }
            _ => {}
        }

        if self.contains_label(TRANSIENT_TRANSACTION_ERROR)
            || self.contains_label(UNKNOWN_TRANSACTION_COMMIT_RESULT)
        {
            if let Some(ref mut session) = session {
                session.unpin();
            }
        }
    }
}

struct ExecutionDetails<T: Operation> {
    output: T::O,
    implicit_session: Option<ClientSession>,
}
