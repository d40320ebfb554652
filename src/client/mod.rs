pub(crate) mod auth;
mod executor;
pub mod options;
pub(crate) mod session;

use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc,
    },
    time::Duration,
};

use crate::{
    concern::{ReadConcern, WriteConcern},
    db::Database,
    error::{ErrorKind, Result},
    event::command::CommandEvent,
    operation::EndSessions,
    options::{ClientOptions, SessionOptions},
    sdam::{SelectedServer, Topology, TransactionSupportStatus},
    selection_criteria::{ReadPreference, SelectionCriteria},
};

pub(crate) use session::ClientSession;
use session::{ServerSession, ServerSessionPool};

/// The maximum number of session ids sent in a single `endSessions` command.
const END_SESSIONS_BATCH_SIZE: usize = 10_000;

/// This is the main entry point for the API. A `Client` is used to connect to a MongoDB cluster.
/// By default, it will monitor the topology of the cluster, keeping track of any changes, such
/// as servers being added or removed.
///
/// `Client` uses [`std::sync::Arc`] internally, so it can be shared safely across threads or
/// async tasks. It is also entirely lock-free in its operation dispatch path.
#[derive(Clone, Debug)]
pub struct Client {
    pub(crate) inner: Arc<ClientInner>,
}

#[derive(Debug)]
pub(crate) struct ClientInner {
    pub(crate) topology: Topology,
    pub(crate) options: ClientOptions,
    pub(crate) session_pool: ServerSessionPool,
    pub(crate) shutdown: AtomicBool,
}

impl Client {
    /// Creates a new `Client` connected to the cluster specified by `uri`. `uri` must be a valid
    /// MongoDB connection string; `mongodb+srv://` URIs perform their DNS lookups here.
    pub async fn with_uri_str(uri: impl AsRef<str>) -> Result<Self> {
        let options = ClientOptions::parse(uri.as_ref()).await?;

        Client::with_options(options)
    }

    /// Creates a new `Client` connected to the cluster specified by `options`.
    pub fn with_options(options: ClientOptions) -> Result<Self> {
        options.validate()?;

        let topology = Topology::new(options.clone())?;

        Ok(Self {
            inner: Arc::new(ClientInner {
                topology,
                options,
                session_pool: ServerSessionPool::new(),
                shutdown: AtomicBool::new(false),
            }),
        })
    }

    /// Gets a handle to a database specified by `name` in the cluster the `Client` is connected
    /// to. The `Database` options (e.g. read preference and write concern) will default to those
    /// of the `Client`.
    pub fn database(&self, name: &str) -> Database {
        Database::new(self.clone(), name, None)
    }

    /// Gets a handle to a database specified by `name` with the given options.
    pub fn database_with_options(
        &self,
        name: &str,
        options: crate::db::options::DatabaseOptions,
    ) -> Database {
        Database::new(self.clone(), name, Some(options))
    }

    /// Gets a handle to the default database specified in the `ClientOptions` or MongoDB
    /// connection string, if defined.
    pub fn default_database(&self) -> Option<Database> {
        self.inner
            .options
            .default_database
            .as_ref()
            .map(|db| self.database(db))
    }

    /// Starts a new [`ClientSession`].
    pub async fn start_session(
        &self,
        options: impl Into<Option<SessionOptions>>,
    ) -> Result<ClientSession> {
        Ok(ClientSession::new(self.clone(), options.into(), false).await)
    }

    pub(crate) async fn start_implicit_session(&self) -> ClientSession {
        ClientSession::new(self.clone(), None, true).await
    }

    pub(crate) async fn check_in_server_session(&self, session: ServerSession) {
        let timeout = self.inner.topology.logical_session_timeout();
        self.inner.session_pool.check_in(session, timeout).await;
    }

    /// The read concern operations default to when none is specified closer to the operation.
    pub(crate) fn read_concern(&self) -> Option<&ReadConcern> {
        self.inner.options.read_concern.as_ref()
    }

    /// The write concern operations default to when none is specified closer to the operation.
    pub(crate) fn write_concern(&self) -> Option<&WriteConcern> {
        self.inner.options.write_concern.as_ref()
    }

    /// The selection criteria operations default to when none is specified closer to the
    /// operation.
    pub(crate) fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.inner.options.selection_criteria.as_ref()
    }

    pub(crate) fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    /// Select a server for an operation, deferring to the client's default criteria when the
    /// operation carries none.
    pub(crate) async fn select_server(
        &self,
        criteria: Option<&SelectionCriteria>,
        deprioritized: Option<&crate::options::ServerAddress>,
    ) -> Result<SelectedServer> {
        let default_criteria = SelectionCriteria::ReadPreference(ReadPreference::Primary);
        let criteria = criteria
            .or(self.inner.options.selection_criteria.as_ref())
            .unwrap_or(&default_criteria);
        self.inner
            .topology
            .select_server(criteria, deprioritized)
            .await
    }

    /// Gets whether the topology supports transactions. If that has not been determined yet,
    /// performs a server selection to force a connection to at least one data-bearing server.
    pub(crate) async fn transaction_support_status(&self) -> Result<TransactionSupportStatus> {
        let initial_status = self.inner.topology.transaction_support_status();

        match initial_status {
            TransactionSupportStatus::Undetermined => {
                let criteria = SelectionCriteria::Predicate(Arc::new(move |server_info| {
                    server_info.server_type().is_data_bearing()
                }));
                let _ = self.select_server(Some(&criteria), None).await?;
                Ok(self.inner.topology.transaction_support_status())
            }
            _ => Ok(initial_status),
        }
    }

    pub(crate) fn emit_command_event(&self, generate_event: impl FnOnce() -> CommandEvent) {
        if let Some(ref handler) = self.inner.options.command_event_handler {
            match generate_event() {
                CommandEvent::Started(event) => handler.handle_command_started_event(event),
                CommandEvent::Succeeded(event) => handler.handle_command_succeeded_event(event),
                CommandEvent::Failed(event) => handler.handle_command_failed_event(event),
            }
        }
    }

    pub(crate) fn is_shutdown(&self) -> bool {
        self.inner.shutdown.load(Ordering::SeqCst)
    }

    /// Shut down this client, ending all pooled server sessions on a best-effort basis.
    ///
    /// Any in-flight operations started before the shutdown will be allowed to complete, but new
    /// operations will fail.
    pub async fn shutdown(self) {
        if self.inner.shutdown.swap(true, Ordering::SeqCst) {
            return;
        }

        let mut session_ids = self.inner.session_pool.drain_session_ids().await;
        while !session_ids.is_empty() {
            let batch: Vec<_> = session_ids
                .drain(..session_ids.len().min(END_SESSIONS_BATCH_SIZE))
                .collect();
            // endSessions is advisory; the sessions expire on their own if this fails.
            let _ = self
                .execute_operation_unchecked(EndSessions::new(batch), None)
                .await;
        }
    }

    /// Reset this client's pooled state after the process has been duplicated (e.g. via `fork`).
    ///
    /// The child process must call this before issuing any operations: sessions checked out by
    /// the parent are discarded rather than re-pooled, and no connection established by the
    /// parent will be reused.
    pub async fn reset(&self) {
        self.inner.session_pool.reset().await;
        for server in self.inner.topology.state().servers.values() {
            server.pool.clear(None);
        }
    }

    /// When the deployment advertises a session timeout below this duration away, a pooled
    /// session is too close to expiry to be worth reusing.
    #[allow(dead_code)]
    pub(crate) fn logical_session_timeout(&self) -> Option<Duration> {
        self.inner.topology.logical_session_timeout()
    }

    pub(crate) fn shutdown_check(&self) -> Result<()> {
        if self.is_shutdown() {
            return Err(ErrorKind::Shutdown.into());
        }
        Ok(())
    }
}
