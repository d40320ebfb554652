pub mod options;

use std::sync::Arc;

use crate::{
    bson::Document,
    change_stream::{event::ChangeStreamEvent, ChangeStream},
    client::ClientSession,
    coll::{options::CollectionOptions, Collection},
    concern::{ReadConcern, WriteConcern},
    error::Result,
    operation::{AggregateTarget, RunCommand},
    options::ChangeStreamOptions,
    selection_criteria::SelectionCriteria,
    Client,
};

use options::DatabaseOptions;

/// `Database` is the client-side abstraction of a MongoDB database. It can be used to perform
/// database-level operations or to obtain handles to specific collections within the database.
/// A `Database` can only be obtained through a [`Client`] by calling [`Client::database`].
///
/// `Database` uses [`std::sync::Arc`] internally, so it can safely be shared across threads or
/// async tasks.
#[derive(Clone, Debug)]
pub struct Database {
    inner: Arc<DatabaseInner>,
}

#[derive(Debug)]
struct DatabaseInner {
    client: Client,
    name: String,
    read_concern: Option<ReadConcern>,
    write_concern: Option<WriteConcern>,
    selection_criteria: Option<SelectionCriteria>,
}

impl Database {
    pub(crate) fn new(client: Client, name: &str, options: Option<DatabaseOptions>) -> Self {
        let options = options.unwrap_or_default();

        Self {
            inner: Arc::new(DatabaseInner {
                name: name.to_string(),
                read_concern: options
                    .read_concern
                    .or_else(|| client.read_concern().cloned()),
                write_concern: options
                    .write_concern
                    .or_else(|| client.write_concern().cloned()),
                selection_criteria: options
                    .selection_criteria
                    .or_else(|| client.selection_criteria().cloned()),
                client,
            }),
        }
    }

    /// Gets the client behind this database handle.
    pub(crate) fn client(&self) -> &Client {
        &self.inner.client
    }

    /// Gets the name of the `Database`.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// The read concern operations on this database default to.
    pub fn read_concern(&self) -> Option<&ReadConcern> {
        self.inner.read_concern.as_ref()
    }

    /// The write concern operations on this database default to.
    pub fn write_concern(&self) -> Option<&WriteConcern> {
        self.inner.write_concern.as_ref()
    }

    /// The selection criteria read operations on this database default to.
    pub fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.inner.selection_criteria.as_ref()
    }

    /// Gets a handle to a collection specified by `name` of the database. The `Collection`
    /// options (e.g. read preference and write concern) will default to those of the
    /// `Database`.
    pub fn collection(&self, name: &str) -> Collection {
        Collection::new(self, name, None)
    }

    /// Gets a handle to a collection specified by `name` with the given options.
    pub fn collection_with_options(
        &self,
        name: &str,
        options: CollectionOptions,
    ) -> Collection {
        Collection::new(self, name, Some(options))
    }

    /// Runs a database-level command.
    ///
    /// Note that no inspection is done on the document, so the command will be sent to the
    /// server as-is and can be anything the deployment accepts.
    pub async fn run_command(
        &self,
        command: Document,
        selection_criteria: impl Into<Option<SelectionCriteria>>,
    ) -> Result<Document> {
        let operation = RunCommand::new(
            self.inner.name.clone(),
            command,
            selection_criteria.into(),
        )?;
        self.client().execute_operation(operation, None).await
    }

    /// Runs a database-level command using the provided session.
    pub async fn run_command_with_session(
        &self,
        command: Document,
        selection_criteria: impl Into<Option<SelectionCriteria>>,
        session: &mut ClientSession,
    ) -> Result<Document> {
        let operation = RunCommand::new(
            self.inner.name.clone(),
            command,
            selection_criteria.into(),
        )?;
        self.client().execute_operation(operation, session).await
    }

    /// Starts a new [`ChangeStream`] that receives events for all changes in this database.
    pub async fn watch(
        &self,
        pipeline: impl IntoIterator<Item = Document>,
        options: impl Into<Option<ChangeStreamOptions>>,
    ) -> Result<ChangeStream<ChangeStreamEvent<Document>>> {
        ChangeStream::create(
            self.client().clone(),
            AggregateTarget::Database(self.inner.name.clone()),
            pipeline.into_iter().collect(),
            options.into(),
        )
        .await
    }
}
