//! Contains the bulk write API: a grouped sequence of insert, update, and delete operations
//! executed with as few write commands as possible.

use std::collections::VecDeque;

use serde::Deserialize;

use crate::{
    bson::{doc, oid::ObjectId, Bson, Document},
    bson_util,
    client::ClientSession,
    cmap::{Command, RawCommandResponse, StreamDescription},
    coll::{options::BulkWriteOptions, Namespace},
    error::{BulkWriteError, BulkWriteFailure, Error, ErrorKind, Result, WriteConcernError},
    operation::{Operation, Retryability, UpsertedId},
    options::WriteConcern,
    results::BulkWriteResult,
    Client,
};

/// The protocol default for the maximum number of write operations in one write command, used
/// until the server reports its own limit.
pub(crate) const DEFAULT_MAX_WRITE_BATCH_SIZE: usize = 100_000;

/// The protocol default for the maximum size of a write command, with the slack the server
/// grants write commands over raw documents.
pub(crate) const DEFAULT_MAX_WRITE_SIZE_BYTES: usize = 16 * 1024 * 1024 + 16 * 1024;

/// A single operation in a bulk write.
#[derive(Clone, Debug)]
#[non_exhaustive]
pub enum WriteModel {
    /// Insert one document.
    InsertOne {
        /// The document to insert.
        document: Document,
    },

    /// Update at most one document matching a filter.
    UpdateOne {
        /// The filter selecting the document.
        filter: Document,
        /// The modifications to apply, as an update document (`$`-prefixed operators).
        update: Document,
        /// Insert a document if none matches the filter.
        upsert: bool,
    },

    /// Update every document matching a filter.
    UpdateMany {
        /// The filter selecting the documents.
        filter: Document,
        /// The modifications to apply, as an update document (`$`-prefixed operators).
        update: Document,
        /// Insert a document if none matches the filter.
        upsert: bool,
    },

    /// Delete at most one document matching a filter.
    DeleteOne {
        /// The filter selecting the document.
        filter: Document,
    },

    /// Delete every document matching a filter.
    DeleteMany {
        /// The filter selecting the documents.
        filter: Document,
    },
}

/// The three write command shapes a model can map to.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum WriteModelKind {
    Insert,
    Update,
    Delete,
}

impl WriteModel {
    pub(crate) fn kind(&self) -> WriteModelKind {
        match self {
            WriteModel::InsertOne { .. } => WriteModelKind::Insert,
            WriteModel::UpdateOne { .. } | WriteModel::UpdateMany { .. } => WriteModelKind::Update,
            WriteModel::DeleteOne { .. } | WriteModel::DeleteMany { .. } => WriteModelKind::Delete,
        }
    }

    /// Whether a batch containing this model remains eligible for a retryable write.
    fn is_retryable(&self) -> bool {
        !matches!(
            self,
            WriteModel::UpdateMany { .. } | WriteModel::DeleteMany { .. }
        )
    }

    fn approximate_size(&self) -> usize {
        let doc = match self {
            WriteModel::InsertOne { document } => document,
            WriteModel::UpdateOne { update, .. } | WriteModel::UpdateMany { update, .. } => update,
            WriteModel::DeleteOne { filter } | WriteModel::DeleteMany { filter } => filter,
        };
        bson_util::doc_size_bytes(doc).unwrap_or(256)
    }
}

/// One write command's worth of models, along with the index each model had in the caller's
/// queue so that per-op results can be reported against the original positions.
#[derive(Clone, Debug)]
pub(crate) struct WriteBatch {
    pub(crate) indices: Vec<usize>,
    pub(crate) models: Vec<WriteModel>,
}

impl WriteBatch {
    fn kind(&self) -> WriteModelKind {
        self.models[0].kind()
    }

    fn split_into(self, count: usize) -> Vec<WriteBatch> {
        let mut batches = Vec::new();
        let mut indices = self.indices.into_iter();
        let mut models = self.models.into_iter();

        loop {
            let batch_indices: Vec<usize> = indices.by_ref().take(count).collect();
            if batch_indices.is_empty() {
                break;
            }
            let batch_models: Vec<WriteModel> = models.by_ref().take(count).collect();
            batches.push(WriteBatch {
                indices: batch_indices,
                models: batch_models,
            });
        }

        batches
    }
}

/// Groups a queue of write models into batches.
///
/// In ordered mode, the queue is walked in order and a new batch starts whenever the command
/// type changes or the batch reaches `max_batch_size`. In unordered mode, models are grouped by
/// type first, so at most three runs of batches are produced.
pub(crate) fn batch_models(
    models: &[WriteModel],
    ordered: bool,
    max_batch_size: usize,
) -> VecDeque<WriteBatch> {
    let mut batches: VecDeque<WriteBatch> = VecDeque::new();

    let push = |batches: &mut VecDeque<WriteBatch>, index: usize, model: &WriteModel| {
        let start_new = match batches.back() {
            Some(batch) => batch.kind() != model.kind() || batch.models.len() >= max_batch_size,
            None => true,
        };
        if start_new {
            batches.push_back(WriteBatch {
                indices: Vec::new(),
                models: Vec::new(),
            });
        }
        let batch = batches.back_mut().expect("batch was just pushed");
        batch.indices.push(index);
        batch.models.push(model.clone());
    };

    if ordered {
        for (index, model) in models.iter().enumerate() {
            push(&mut batches, index, model);
        }
    } else {
        for kind in [
            WriteModelKind::Insert,
            WriteModelKind::Update,
            WriteModelKind::Delete,
        ] {
            for (index, model) in models.iter().enumerate() {
                if model.kind() == kind {
                    push(&mut batches, index, model);
                }
            }
        }
    }

    batches
}

/// How many operations fit per batch once the server has rejected a batch of `n` ops of total
/// serialized size `total_size` for exceeding `wire_limit`.
pub(crate) fn split_batch_count(total_size: usize, n: usize, wire_limit: usize) -> usize {
    if n == 0 {
        return 1;
    }
    let avg = (total_size / n).max(1);
    (wire_limit / avg).max(1)
}

/// The per-batch write command. Unlike the standalone insert/update/delete operations, write
/// errors in the reply are returned in the result rather than as an `Err`, since partial counts
/// from failed batches still contribute to the accumulated bulk result.
#[derive(Debug)]
pub(crate) struct BulkWriteBatchOp {
    ns: Namespace,
    batch: WriteBatch,
    ordered: bool,
    options: BulkWriteOptions,
    inserted_ids: Vec<(usize, Bson)>,
}

impl BulkWriteBatchOp {
    fn new(ns: Namespace, mut batch: WriteBatch, options: BulkWriteOptions) -> Self {
        let ordered = options.ordered.unwrap_or(true);

        // Generate missing _ids up front so the result can report them.
        let mut inserted_ids = Vec::new();
        for (position, model) in batch.models.iter_mut().enumerate() {
            if let WriteModel::InsertOne { ref mut document } = model {
                let id = match document.get("_id") {
                    Some(id) => id.clone(),
                    None => {
                        let id = Bson::ObjectId(ObjectId::new());
                        document.insert("_id", id.clone());
                        id
                    }
                };
                inserted_ids.push((batch.indices[position], id));
            }
        }

        Self {
            ns,
            batch,
            ordered,
            options,
            inserted_ids,
        }
    }

    fn kind(&self) -> WriteModelKind {
        self.batch.kind()
    }
}

impl Operation for BulkWriteBatchOp {
    type O = BatchResult;

    const NAME: &'static str = "bulkWriteBatch";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let (command_name, payload_field) = match self.kind() {
            WriteModelKind::Insert => ("insert", "documents"),
            WriteModelKind::Update => ("update", "updates"),
            WriteModelKind::Delete => ("delete", "deletes"),
        };

        let statements: Vec<Bson> = self
            .batch
            .models
            .iter()
            .map(|model| {
                Bson::Document(match model {
                    WriteModel::InsertOne { document } => document.clone(),
                    WriteModel::UpdateOne {
                        filter,
                        update,
                        upsert,
                    } => doc! {
                        "q": filter.clone(),
                        "u": update.clone(),
                        "multi": false,
                        "upsert": *upsert,
                    },
                    WriteModel::UpdateMany {
                        filter,
                        update,
                        upsert,
                    } => doc! {
                        "q": filter.clone(),
                        "u": update.clone(),
                        "multi": true,
                        "upsert": *upsert,
                    },
                    WriteModel::DeleteOne { filter } => doc! {
                        "q": filter.clone(),
                        "limit": 1,
                    },
                    WriteModel::DeleteMany { filter } => doc! {
                        "q": filter.clone(),
                        "limit": 0,
                    },
                })
            })
            .collect();

        let mut body = doc! {
            command_name: self.ns.coll.clone(),
            payload_field: statements,
            "ordered": self.ordered,
        };

        if let Some(bypass) = self.options.bypass_document_validation {
            body.insert("bypassDocumentValidation", bypass);
        }
        if let Some(ref write_concern) = self.options.write_concern {
            if !write_concern.is_empty() {
                body.insert("writeConcern", write_concern.to_document()?);
            }
        }

        Ok(Command::new(command_name, self.ns.db.clone(), body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let body: BatchResponseBody = response.body()?;

        let mut result = BatchResult {
            kind: self.kind(),
            n: body.n,
            n_modified: body.n_modified,
            upserted: body.upserted.unwrap_or_default(),
            inserted_ids: self.inserted_ids.clone(),
            write_errors: body.write_errors.unwrap_or_default(),
            write_concern_error: body.write_concern_error,
            indices: self.batch.indices.clone(),
        };

        // Inserts that failed did not actually insert their documents.
        if result.kind == WriteModelKind::Insert {
            let failed: Vec<usize> = result
                .write_errors
                .iter()
                .map(|error| self.batch.indices[error.index])
                .collect();
            result
                .inserted_ids
                .retain(|(index, _)| !failed.contains(index));
        }

        Ok(result)
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        if self.batch.models.iter().all(WriteModel::is_retryable) {
            Retryability::Write
        } else {
            Retryability::None
        }
    }
}

#[derive(Debug, Deserialize)]
struct BatchResponseBody {
    n: u64,

    #[serde(rename = "nModified")]
    n_modified: Option<u64>,

    upserted: Option<Vec<UpsertedId>>,

    #[serde(rename = "writeErrors")]
    write_errors: Option<Vec<BulkWriteError>>,

    #[serde(rename = "writeConcernError")]
    write_concern_error: Option<WriteConcernError>,
}

/// The interpreted reply to one batch.
#[derive(Debug)]
pub(crate) struct BatchResult {
    kind: WriteModelKind,
    n: u64,
    n_modified: Option<u64>,
    upserted: Vec<UpsertedId>,
    inserted_ids: Vec<(usize, Bson)>,
    write_errors: Vec<BulkWriteError>,
    write_concern_error: Option<WriteConcernError>,
    /// The original queue index of each op in the batch.
    indices: Vec<usize>,
}

/// Accumulates per-batch results into the overall bulk result, rewriting indices to be relative
/// to the caller's queue.
#[derive(Debug, Default)]
pub(crate) struct BulkWriteResultAccumulator {
    result: BulkWriteResult,
    write_errors: Vec<BulkWriteError>,
    write_concern_error: Option<WriteConcernError>,
}

impl BulkWriteResultAccumulator {
    pub(crate) fn new() -> Self {
        Self {
            result: BulkWriteResult::new(),
            write_errors: Vec::new(),
            write_concern_error: None,
        }
    }

    pub(crate) fn merge(&mut self, batch: BatchResult) {
        match batch.kind {
            WriteModelKind::Insert => {
                self.result.inserted_count += batch.inserted_ids.len() as u64;
                for (index, id) in batch.inserted_ids {
                    self.result.inserted_ids.insert(index, id);
                }
            }
            WriteModelKind::Update => {
                let upserted_count = batch.upserted.len() as u64;
                self.result.matched_count += batch.n.saturating_sub(upserted_count);
                self.result.upserted_count += upserted_count;
                for upserted in batch.upserted {
                    self.result
                        .upserted_ids
                        .insert(batch.indices[upserted.index], upserted.id);
                }

                // Once a sub-result omits nModified, the total is meaningless; this is sticky
                // across further merges.
                match (self.result.modified_count, batch.n_modified) {
                    (Some(total), Some(n_modified)) => {
                        self.result.modified_count = Some(total + n_modified)
                    }
                    _ => self.result.modified_count = None,
                }
            }
            WriteModelKind::Delete => {
                self.result.deleted_count += batch.n;
            }
        }

        for mut error in batch.write_errors {
            error.index = batch.indices[error.index];
            self.write_errors.push(error);
        }

        if let Some(write_concern_error) = batch.write_concern_error {
            // Only the most recent write concern error is surfaced.
            self.write_concern_error = Some(write_concern_error);
        }
    }

    pub(crate) fn into_result(self) -> Result<BulkWriteResult> {
        if self.write_errors.is_empty() && self.write_concern_error.is_none() {
            return Ok(self.result);
        }

        let inserted_ids = self
            .result
            .inserted_ids
            .iter()
            .map(|(index, id)| (*index, id.clone()))
            .collect();

        Err(Error::new(
            ErrorKind::BulkWrite(BulkWriteFailure {
                write_errors: if self.write_errors.is_empty() {
                    None
                } else {
                    Some(self.write_errors)
                },
                write_concern_error: self.write_concern_error,
                inserted_ids,
                partial_result: Some(self.result),
            }),
            None::<Option<String>>,
        ))
    }
}

/// Executes a bulk write against `ns`: batches the models, runs each batch as a single write
/// command, splits batches the server rejects for size, and merges per-batch results.
pub(crate) async fn execute_bulk_write(
    client: &Client,
    ns: &Namespace,
    models: &[WriteModel],
    options: Option<BulkWriteOptions>,
    mut session: Option<&mut ClientSession>,
) -> Result<BulkWriteResult> {
    if models.is_empty() {
        return Err(ErrorKind::InvalidArgument {
            message: "bulk write requires at least one operation".to_string(),
        }
        .into());
    }

    let options = options.unwrap_or_default();
    let ordered = options.ordered.unwrap_or(true);

    let mut batches = batch_models(models, ordered, DEFAULT_MAX_WRITE_BATCH_SIZE);
    let mut accumulator = BulkWriteResultAccumulator::new();

    while let Some(batch) = batches.pop_front() {
        let batch_len = batch.models.len();
        let batch_size: usize = batch.models.iter().map(WriteModel::approximate_size).sum();

        let op = BulkWriteBatchOp::new(ns.clone(), batch.clone(), options.clone());
        match client.execute_operation(op, session.as_deref_mut()).await {
            Ok(batch_result) => {
                let failed = !batch_result.write_errors.is_empty();
                accumulator.merge(batch_result);

                if ordered && failed {
                    break;
                }
            }
            Err(error) if error.is_command_size_error() && batch_len > 1 => {
                // Split the rejected batch into smaller ones and try again.
                let per_batch =
                    split_batch_count(batch_size, batch_len, DEFAULT_MAX_WRITE_SIZE_BYTES);
                let split = batch.split_into(per_batch.min(batch_len - 1).max(1));
                for small_batch in split.into_iter().rev() {
                    batches.push_front(small_batch);
                }
            }
            Err(error) if error.is_command_size_error() => {
                // A single operation that cannot fit is unsendable.
                return Err(ErrorKind::InvalidArgument {
                    message: "a single write operation exceeds the maximum command size"
                        .to_string(),
                }
                .into());
            }
            // Transport-level failures propagate unchanged so their retry labels survive;
            // partial progress from earlier batches is lost the same way it would be for any
            // other interrupted command.
            Err(error) => return Err(error),
        }
    }

    accumulator.into_result()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn insert(i: i32) -> WriteModel {
        WriteModel::InsertOne {
            document: doc! { "_id": i },
        }
    }

    fn delete_one() -> WriteModel {
        WriteModel::DeleteOne { filter: doc! {} }
    }

    fn batch_sizes(batches: &VecDeque<WriteBatch>) -> Vec<usize> {
        batches.iter().map(|b| b.models.len()).collect()
    }

    #[test]
    fn ordered_batching_splits_at_limit() {
        let limit = 4;
        let models: Vec<WriteModel> = (0..(2 * limit as i32 + 3)).map(insert).collect();

        let batches = batch_models(&models, true, limit);
        assert_eq!(batch_sizes(&batches), vec![limit, limit, 3]);

        // Indices remain contiguous and in order.
        assert_eq!(batches[0].indices, vec![0, 1, 2, 3]);
        assert_eq!(batches[2].indices, vec![8, 9, 10]);
    }

    #[test]
    fn ordered_batching_splits_on_type_change() {
        let models = vec![insert(0), insert(1), delete_one(), insert(2)];
        let batches = batch_models(&models, true, 100);

        assert_eq!(batch_sizes(&batches), vec![2, 1, 1]);
        assert_eq!(batches[1].kind(), WriteModelKind::Delete);
        assert_eq!(batches[2].indices, vec![3]);
    }

    #[test]
    fn unordered_batching_groups_by_type() {
        let models = vec![insert(0), delete_one(), insert(1), delete_one(), insert(2)];
        let batches = batch_models(&models, false, 100);

        assert_eq!(batch_sizes(&batches), vec![3, 2]);
        assert_eq!(batches[0].kind(), WriteModelKind::Insert);
        assert_eq!(batches[0].indices, vec![0, 2, 4]);
        assert_eq!(batches[1].kind(), WriteModelKind::Delete);
        assert_eq!(batches[1].indices, vec![1, 3]);
    }

    #[test]
    fn size_error_split_formula() {
        // A batch of 10 ops totalling 50_000 bytes against a 16k limit: avg 5_000 per op,
        // 3 ops per batch, i.e. ceil(10/3) = 4 batches.
        let per_batch = split_batch_count(50_000, 10, 16_000);
        assert_eq!(per_batch, 3);

        let batch = WriteBatch {
            indices: (0..10).collect(),
            models: (0..10).map(|i| insert(i)).collect(),
        };
        let split = batch.split_into(per_batch);
        assert_eq!(split.len(), 4);
        assert_eq!(split[3].indices, vec![9]);

        // A batch of one can never be split below one op.
        assert_eq!(split_batch_count(50_000, 1, 16_000), 1);
    }

    #[test]
    fn merge_rewrites_indices() {
        let mut accumulator = BulkWriteResultAccumulator::new();

        accumulator.merge(BatchResult {
            kind: WriteModelKind::Insert,
            n: 2,
            n_modified: None,
            upserted: vec![],
            inserted_ids: vec![(0, Bson::Int32(1)), (1, Bson::Int32(2))],
            write_errors: vec![],
            write_concern_error: None,
            indices: vec![0, 1],
        });

        // Second batch starts at overall index 2; its write error at batch index 0 must be
        // reported as overall index 2.
        accumulator.merge(BatchResult {
            kind: WriteModelKind::Insert,
            n: 1,
            n_modified: None,
            upserted: vec![],
            inserted_ids: vec![(3, Bson::Int32(3))],
            write_errors: vec![BulkWriteError {
                index: 0,
                code: 11000,
                code_name: None,
                message: "duplicate key".to_string(),
                details: None,
            }],
            write_concern_error: None,
            indices: vec![2, 3],
        });

        let error = accumulator.into_result().unwrap_err();
        match *error.kind {
            ErrorKind::BulkWrite(ref failure) => {
                let write_errors = failure.write_errors.as_ref().unwrap();
                assert_eq!(write_errors.len(), 1);
                assert_eq!(write_errors[0].index, 2);
                assert_eq!(write_errors[0].code, 11000);

                let partial = failure.partial_result.as_ref().unwrap();
                assert_eq!(partial.inserted_count, 3);
            }
            ref other => panic!("expected bulk write error, got {:?}", other),
        }
    }

    #[test]
    fn modified_count_is_sticky_none() {
        let update_batch = |n_modified: Option<u64>| BatchResult {
            kind: WriteModelKind::Update,
            n: 1,
            n_modified,
            upserted: vec![],
            inserted_ids: vec![],
            write_errors: vec![],
            write_concern_error: None,
            indices: vec![0],
        };

        let mut accumulator = BulkWriteResultAccumulator::new();
        accumulator.merge(update_batch(Some(1)));
        accumulator.merge(update_batch(None));
        accumulator.merge(update_batch(Some(1)));

        let result = accumulator.into_result().unwrap();
        assert_eq!(result.modified_count, None);
        assert_eq!(result.matched_count, 3);
    }

    #[test]
    fn upserted_ids_use_overall_indices() {
        let mut accumulator = BulkWriteResultAccumulator::new();
        accumulator.merge(BatchResult {
            kind: WriteModelKind::Update,
            n: 2,
            n_modified: Some(1),
            upserted: vec![UpsertedId {
                index: 1,
                id: Bson::Int32(42),
            }],
            inserted_ids: vec![],
            write_errors: vec![],
            write_concern_error: None,
            indices: vec![5, 7],
        });

        let result = accumulator.into_result().unwrap();
        assert_eq!(result.upserted_count, 1);
        assert_eq!(result.matched_count, 1);
        assert_eq!(result.upserted_ids.get(&7), Some(&Bson::Int32(42)));
    }
}
