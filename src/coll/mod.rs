pub mod bulk;
pub mod options;

use std::sync::Arc;

use crate::{
    bson::Document,
    bson_util,
    change_stream::{event::ChangeStreamEvent, ChangeStream},
    client::ClientSession,
    concern::{ReadConcern, WriteConcern},
    cursor::{Cursor, SessionCursor},
    error::{convert_bulk_errors, Result},
    operation::{Aggregate, AggregateTarget, Delete, Find, Insert, Update},
    options::ChangeStreamOptions,
    results::{DeleteResult, InsertManyResult, InsertOneResult, UpdateResult},
    selection_criteria::SelectionCriteria,
    Client,
    Database,
};

use bulk::WriteModel;
use options::{
    AggregateOptions,
    BulkWriteOptions,
    CollectionOptions,
    DeleteOptions,
    FindOneOptions,
    FindOptions,
    InsertManyOptions,
    InsertOneOptions,
    UpdateOptions,
};

pub use options::Namespace;

/// `Collection` is the client-side abstraction of a MongoDB Collection. It can be used to
/// perform collection-level operations such as CRUD operations. A `Collection` can be obtained
/// through a [`Database`] by calling [`Database::collection`].
///
/// `Collection` uses [`std::sync::Arc`] internally, so it can safely be shared across threads
/// or async tasks.
#[derive(Clone, Debug)]
pub struct Collection {
    inner: Arc<CollectionInner>,
}

#[derive(Debug)]
struct CollectionInner {
    client: Client,
    ns: Namespace,
    read_concern: Option<ReadConcern>,
    write_concern: Option<WriteConcern>,
    selection_criteria: Option<SelectionCriteria>,
}

impl Collection {
    pub(crate) fn new(db: &Database, name: &str, options: Option<CollectionOptions>) -> Self {
        let options = options.unwrap_or_default();

        Self {
            inner: Arc::new(CollectionInner {
                client: db.client().clone(),
                ns: Namespace::new(db.name(), name),
                read_concern: options.read_concern.or_else(|| db.read_concern().cloned()),
                write_concern: options
                    .write_concern
                    .or_else(|| db.write_concern().cloned()),
                selection_criteria: options
                    .selection_criteria
                    .or_else(|| db.selection_criteria().cloned()),
            }),
        }
    }

    /// Gets the name of the `Collection`.
    pub fn name(&self) -> &str {
        &self.inner.ns.coll
    }

    /// Gets the namespace of the `Collection`, i.e. `<db name>.<coll name>`.
    pub fn namespace(&self) -> Namespace {
        self.inner.ns.clone()
    }

    fn client(&self) -> &Client {
        &self.inner.client
    }

    /// The read concern operations on this collection default to.
    pub fn read_concern(&self) -> Option<&ReadConcern> {
        self.inner.read_concern.as_ref()
    }

    /// The write concern operations on this collection default to.
    pub fn write_concern(&self) -> Option<&WriteConcern> {
        self.inner.write_concern.as_ref()
    }

    /// The selection criteria read operations on this collection default to.
    pub fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.inner.selection_criteria.as_ref()
    }

    /// Inserts `document` into the collection.
    pub async fn insert_one(
        &self,
        document: Document,
        options: impl Into<Option<InsertOneOptions>>,
    ) -> Result<InsertOneResult> {
        self.insert_one_common(document, options.into(), None).await
    }

    /// Inserts `document` into the collection using the provided session.
    pub async fn insert_one_with_session(
        &self,
        document: Document,
        options: impl Into<Option<InsertOneOptions>>,
        session: &mut ClientSession,
    ) -> Result<InsertOneResult> {
        self.insert_one_common(document, options.into(), Some(session))
            .await
    }

    async fn insert_one_common(
        &self,
        document: Document,
        options: Option<InsertOneOptions>,
        session: Option<&mut ClientSession>,
    ) -> Result<InsertOneResult> {
        let mut options: Option<InsertManyOptions> = options.map(Into::into);
        resolve_options!(self, options, [write_concern]);

        let insert = Insert::new(self.namespace(), vec![document], options);
        self.client()
            .execute_operation(insert, session)
            .await
            .map(InsertOneResult::from_insert_many_result)
            .map_err(convert_bulk_errors)
    }

    /// Inserts the documents in `documents` into the collection. Documents are sent in batches
    /// honoring the server's write batch limits; batches the server rejects for size are split
    /// and retried.
    pub async fn insert_many(
        &self,
        documents: impl IntoIterator<Item = Document>,
        options: impl Into<Option<InsertManyOptions>>,
    ) -> Result<InsertManyResult> {
        self.insert_many_common(documents, options.into(), None)
            .await
    }

    /// Inserts the documents in `documents` into the collection using the provided session.
    pub async fn insert_many_with_session(
        &self,
        documents: impl IntoIterator<Item = Document>,
        options: impl Into<Option<InsertManyOptions>>,
        session: &mut ClientSession,
    ) -> Result<InsertManyResult> {
        self.insert_many_common(documents, options.into(), Some(session))
            .await
    }

    async fn insert_many_common(
        &self,
        documents: impl IntoIterator<Item = Document>,
        options: Option<InsertManyOptions>,
        session: Option<&mut ClientSession>,
    ) -> Result<InsertManyResult> {
        let mut options = options;
        resolve_options!(self, options, [write_concern]);

        let models: Vec<WriteModel> = documents
            .into_iter()
            .map(|document| WriteModel::InsertOne { document })
            .collect();

        let bulk_options = options.map(|options| BulkWriteOptions {
            bypass_document_validation: options.bypass_document_validation,
            ordered: options.ordered,
            write_concern: options.write_concern,
        });

        let result = bulk::execute_bulk_write(
            self.client(),
            &self.inner.ns,
            &models,
            bulk_options,
            session,
        )
        .await?;

        Ok(InsertManyResult {
            inserted_ids: result.inserted_ids,
        })
    }

    /// Updates at most one document matching `filter` with the modifications in `update`, which
    /// must only contain update operators (`$`-prefixed fields).
    pub async fn update_one(
        &self,
        filter: Document,
        update: Document,
        options: impl Into<Option<UpdateOptions>>,
    ) -> Result<UpdateResult> {
        self.update_common(filter, update, false, options.into(), None)
            .await
    }

    /// Updates at most one document matching `filter` using the provided session.
    pub async fn update_one_with_session(
        &self,
        filter: Document,
        update: Document,
        options: impl Into<Option<UpdateOptions>>,
        session: &mut ClientSession,
    ) -> Result<UpdateResult> {
        self.update_common(filter, update, false, options.into(), Some(session))
            .await
    }

    /// Updates every document matching `filter` with the modifications in `update`, which must
    /// only contain update operators (`$`-prefixed fields).
    pub async fn update_many(
        &self,
        filter: Document,
        update: Document,
        options: impl Into<Option<UpdateOptions>>,
    ) -> Result<UpdateResult> {
        self.update_common(filter, update, true, options.into(), None)
            .await
    }

    /// Updates every document matching `filter` using the provided session.
    pub async fn update_many_with_session(
        &self,
        filter: Document,
        update: Document,
        options: impl Into<Option<UpdateOptions>>,
        session: &mut ClientSession,
    ) -> Result<UpdateResult> {
        self.update_common(filter, update, true, options.into(), Some(session))
            .await
    }

    async fn update_common(
        &self,
        filter: Document,
        update: Document,
        multi: bool,
        options: Option<UpdateOptions>,
        session: Option<&mut ClientSession>,
    ) -> Result<UpdateResult> {
        bson_util::update_document_check(&update)?;

        let mut options = options;
        resolve_options!(self, options, [write_concern]);

        let update = Update::new(self.namespace(), filter, update, multi, options);
        self.client()
            .execute_operation(update, session)
            .await
            .map_err(convert_bulk_errors)
    }

    /// Replaces at most one document matching `filter` with `replacement`, which must not
    /// contain update operators.
    pub async fn replace_one(
        &self,
        filter: Document,
        replacement: Document,
        options: impl Into<Option<UpdateOptions>>,
    ) -> Result<UpdateResult> {
        bson_util::replacement_document_check(&replacement)?;

        let mut options = options.into();
        resolve_options!(self, options, [write_concern]);

        let update = Update::new(self.namespace(), filter, replacement, false, options);
        self.client()
            .execute_operation(update, None)
            .await
            .map_err(convert_bulk_errors)
    }

    /// Deletes at most one document matching `filter`.
    pub async fn delete_one(
        &self,
        filter: Document,
        options: impl Into<Option<DeleteOptions>>,
    ) -> Result<DeleteResult> {
        self.delete_common(filter, Some(1), options.into(), None)
            .await
    }

    /// Deletes at most one document matching `filter` using the provided session.
    pub async fn delete_one_with_session(
        &self,
        filter: Document,
        options: impl Into<Option<DeleteOptions>>,
        session: &mut ClientSession,
    ) -> Result<DeleteResult> {
        self.delete_common(filter, Some(1), options.into(), Some(session))
            .await
    }

    /// Deletes every document matching `filter`.
    pub async fn delete_many(
        &self,
        filter: Document,
        options: impl Into<Option<DeleteOptions>>,
    ) -> Result<DeleteResult> {
        self.delete_common(filter, None, options.into(), None).await
    }

    /// Deletes every document matching `filter` using the provided session.
    pub async fn delete_many_with_session(
        &self,
        filter: Document,
        options: impl Into<Option<DeleteOptions>>,
        session: &mut ClientSession,
    ) -> Result<DeleteResult> {
        self.delete_common(filter, None, options.into(), Some(session))
            .await
    }

    async fn delete_common(
        &self,
        filter: Document,
        limit: Option<u32>,
        options: Option<DeleteOptions>,
        session: Option<&mut ClientSession>,
    ) -> Result<DeleteResult> {
        let mut options = options;
        resolve_options!(self, options, [write_concern]);

        let delete = Delete::new(self.namespace(), filter, limit, options);
        self.client()
            .execute_operation(delete, session)
            .await
            .map_err(convert_bulk_errors)
    }

    /// Finds the documents in the collection matching `filter`.
    pub async fn find(
        &self,
        filter: Document,
        options: impl Into<Option<FindOptions>>,
    ) -> Result<Cursor<Document>> {
        let mut options = options.into();
        resolve_options!(self, options, [read_concern, selection_criteria]);

        let find = Find::new(self.namespace(), filter, options);
        let (spec, session) = self.client().execute_cursor_operation(find).await?;

        Ok(Cursor::new(self.client().clone(), spec, session))
    }

    /// Finds the documents in the collection matching `filter` using the provided session.
    pub async fn find_with_session(
        &self,
        filter: Document,
        options: impl Into<Option<FindOptions>>,
        session: &mut ClientSession,
    ) -> Result<SessionCursor<Document>> {
        let mut options = options.into();
        resolve_options!(self, options, [read_concern, selection_criteria]);

        let find = Find::new(self.namespace(), filter, options);
        let spec = self
            .client()
            .execute_operation(find, &mut *session)
            .await?;

        Ok(SessionCursor::new(self.client().clone(), spec))
    }

    /// Finds a single document in the collection matching `filter`.
    pub async fn find_one(
        &self,
        filter: Document,
        options: impl Into<Option<FindOneOptions>>,
    ) -> Result<Option<Document>> {
        let options: Option<FindOptions> = options.into().map(Into::into);
        let mut cursor = self.find(filter, options).await?;
        cursor.try_next().await
    }

    /// Runs an aggregation framework pipeline over the collection.
    pub async fn aggregate(
        &self,
        pipeline: impl IntoIterator<Item = Document>,
        options: impl Into<Option<AggregateOptions>>,
    ) -> Result<Cursor<Document>> {
        let mut options = options.into();
        resolve_options!(self, options, [read_concern, selection_criteria]);

        let aggregate = Aggregate::new(
            AggregateTarget::Collection(self.namespace()),
            pipeline,
            options,
        );
        let (spec, session) = self.client().execute_cursor_operation(aggregate).await?;

        Ok(Cursor::new(self.client().clone(), spec, session))
    }

    /// Starts a new [`ChangeStream`] that receives events for all changes in this collection.
    pub async fn watch(
        &self,
        pipeline: impl IntoIterator<Item = Document>,
        options: impl Into<Option<ChangeStreamOptions>>,
    ) -> Result<ChangeStream<ChangeStreamEvent<Document>>> {
        ChangeStream::create(
            self.client().clone(),
            AggregateTarget::Collection(self.namespace()),
            pipeline.into_iter().collect(),
            options.into(),
        )
        .await
    }

    /// Executes the given sequence of insert, update, and delete operations, batching them into
    /// as few write commands as possible.
    ///
    /// In ordered mode (the default) the operations run in order and stop at the first write
    /// error; in unordered mode every operation is attempted. On failure, the returned
    /// [`BulkWriteFailure`](crate::error::BulkWriteFailure) carries the accumulated partial
    /// result.
    pub async fn bulk_write(
        &self,
        models: impl IntoIterator<Item = WriteModel>,
        options: impl Into<Option<BulkWriteOptions>>,
    ) -> Result<crate::results::BulkWriteResult> {
        self.bulk_write_common(models, options.into(), None).await
    }

    /// Executes a bulk write using the provided session.
    pub async fn bulk_write_with_session(
        &self,
        models: impl IntoIterator<Item = WriteModel>,
        options: impl Into<Option<BulkWriteOptions>>,
        session: &mut ClientSession,
    ) -> Result<crate::results::BulkWriteResult> {
        self.bulk_write_common(models, options.into(), Some(session))
            .await
    }

    async fn bulk_write_common(
        &self,
        models: impl IntoIterator<Item = WriteModel>,
        options: Option<BulkWriteOptions>,
        session: Option<&mut ClientSession>,
    ) -> Result<crate::results::BulkWriteResult> {
        let mut options = options;
        resolve_options!(self, options, [write_concern]);

        let models: Vec<WriteModel> = models.into_iter().collect();
        bulk::execute_bulk_write(self.client(), &self.inner.ns, &models, options, session).await
    }
}
