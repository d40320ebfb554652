use crate::{
    bson::{doc, Bson, Document, Timestamp},
    bson_util,
    change_stream::options::ChangeStreamOptions,
    cmap::{Command, RawCommandResponse, StreamDescription},
    coll::{options::AggregateOptions, Namespace},
    cursor::CursorSpecification,
    error::Result,
    operation::{append_options, CursorBody, Operation, Retryability},
    options::WriteConcern,
    selection_criteria::SelectionCriteria,
};

/// The target of an aggregation: a collection, or a whole database (for stages like
/// `$currentOp`, and for database-level change streams).
#[derive(Clone, Debug)]
pub(crate) enum AggregateTarget {
    Database(String),
    Collection(Namespace),
}

impl AggregateTarget {
    pub(crate) fn db_name(&self) -> &str {
        match self {
            AggregateTarget::Database(ref db) => db.as_str(),
            AggregateTarget::Collection(ref ns) => ns.db.as_str(),
        }
    }

    fn aggregate_value(&self) -> Bson {
        match self {
            AggregateTarget::Database(_) => Bson::Int32(1),
            AggregateTarget::Collection(ref ns) => Bson::String(ns.coll.clone()),
        }
    }
}

#[derive(Debug)]
pub(crate) struct Aggregate {
    target: AggregateTarget,
    pipeline: Vec<Document>,
    options: Option<AggregateOptions>,
}

impl Aggregate {
    pub(crate) fn new(
        target: AggregateTarget,
        pipeline: impl IntoIterator<Item = Document>,
        options: Option<AggregateOptions>,
    ) -> Self {
        Self {
            target,
            pipeline: pipeline.into_iter().collect(),
            options,
        }
    }

    /// Whether the pipeline ends in a write stage, which pins the aggregation to a writable
    /// server and rules out read retries.
    fn is_out_or_merge(&self) -> bool {
        self.pipeline
            .last()
            .and_then(bson_util::first_key)
            .map(|key| key == "$out" || key == "$merge")
            .unwrap_or(false)
    }
}

impl Operation for Aggregate {
    type O = CursorSpecification;

    const NAME: &'static str = "aggregate";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.target.aggregate_value(),
            "pipeline": self.pipeline.iter().cloned().map(Bson::Document).collect::<Vec<_>>(),
        };

        let mut cursor = Document::new();
        if let Some(batch_size) = self.options.as_ref().and_then(|opts| opts.batch_size) {
            cursor.insert("batchSize", batch_size as i64);
        }
        body.insert("cursor", cursor);

        if let Some(ref options) = self.options {
            if let Some(allow_disk_use) = options.allow_disk_use {
                body.insert("allowDiskUse", allow_disk_use);
            }
            if let Some(bypass) = options.bypass_document_validation {
                body.insert("bypassDocumentValidation", bypass);
            }
            if let Some(ref collation) = options.collation {
                body.insert("collation", collation.clone());
            }
            if let Some(ref comment) = options.comment {
                body.insert("comment", comment.clone());
            }
            if let Some(ref hint) = options.hint {
                body.insert("hint", hint.clone());
            }
            if let Some(max_time) = options.max_time {
                body.insert("maxTimeMS", max_time.as_millis() as i64);
            }
            if let Some(ref read_concern) = options.read_concern {
                body.insert("readConcern", doc! { "level": read_concern.level.as_str() });
            }
            if self.is_out_or_merge() {
                if let Some(ref write_concern) = options.write_concern {
                    body.insert("writeConcern", write_concern.to_document()?);
                }
            }
        }

        Ok(Command::new(
            Self::NAME,
            self.target.db_name().to_string(),
            body,
        ))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let source_address = response.source_address().clone();
        let body: CursorBody = response.body()?;

        Ok(CursorSpecification::new(
            body.cursor,
            source_address,
            self.options.as_ref().and_then(|opts| opts.batch_size),
            self.options.as_ref().and_then(|opts| opts.max_await_time),
            false,
            false,
        ))
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.options
            .as_ref()
            .and_then(|opts| opts.selection_criteria.as_ref())
    }

    fn supports_read_concern(&self, _description: &StreamDescription) -> bool {
        true
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        if self.is_out_or_merge() {
            self.options
                .as_ref()
                .and_then(|opts| opts.write_concern.as_ref())
        } else {
            None
        }
    }

    fn retryability(&self) -> Retryability {
        if self.is_out_or_merge() {
            Retryability::None
        } else {
            Retryability::Read
        }
    }
}

/// An aggregate whose pipeline begins with a `$changeStream` stage. In addition to the cursor,
/// its output carries the `operationTime` of the response, which seeds the stream's resume
/// logic when no resume token has been seen yet.
#[derive(Debug)]
pub(crate) struct ChangeStreamAggregate {
    inner: Aggregate,
}

impl ChangeStreamAggregate {
    pub(crate) fn new(
        target: AggregateTarget,
        pipeline: impl IntoIterator<Item = Document>,
        change_stream_options: Option<&ChangeStreamOptions>,
        aggregate_options: Option<AggregateOptions>,
    ) -> Result<Self> {
        let mut stage_body = Document::new();
        if let Some(options) = change_stream_options {
            append_options(&mut stage_body, Some(options))?;

            if matches!(target, AggregateTarget::Database(ref db) if db == "admin")
                && options.all_changes_for_cluster == Some(true)
            {
                stage_body.insert("allChangesForCluster", true);
            }
        }

        let mut full_pipeline = vec![doc! { "$changeStream": stage_body }];
        full_pipeline.extend(pipeline);

        Ok(Self {
            inner: Aggregate::new(target, full_pipeline, aggregate_options),
        })
    }
}

impl Operation for ChangeStreamAggregate {
    type O = (CursorSpecification, Option<Timestamp>);

    const NAME: &'static str = "aggregate";

    fn build(&mut self, description: &StreamDescription) -> Result<Command> {
        self.inner.build(description)
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        description: &StreamDescription,
    ) -> Result<Self::O> {
        let operation_time = response
            .raw_response()
            .get("operationTime")
            .and_then(Bson::as_timestamp);

        let mut spec = self.inner.handle_response(response, description)?;
        // A change stream cursor waits server-side like a tailable-await cursor: an empty batch
        // with a live cursor id means "no event this wait", not end-of-stream.
        spec.info.tailable = true;
        spec.info.await_data = true;
        Ok((spec, operation_time))
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.inner.selection_criteria()
    }

    fn supports_read_concern(&self, description: &StreamDescription) -> bool {
        self.inner.supports_read_concern(description)
    }

    fn retryability(&self) -> Retryability {
        self.inner.retryability()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn out_pipelines_are_not_read_retryable() {
        let plain = Aggregate::new(
            AggregateTarget::Collection(Namespace::new("db", "coll")),
            vec![doc! { "$match": { "x": 1 } }],
            None,
        );
        assert_eq!(plain.retryability(), Retryability::Read);

        let out = Aggregate::new(
            AggregateTarget::Collection(Namespace::new("db", "coll")),
            vec![doc! { "$match": { "x": 1 } }, doc! { "$out": "other" }],
            None,
        );
        assert_eq!(out.retryability(), Retryability::None);
    }

    #[test]
    fn change_stream_stage_is_prepended() {
        let options = ChangeStreamOptions {
            full_document: Some("updateLookup".to_string()),
            ..Default::default()
        };
        let mut op = ChangeStreamAggregate::new(
            AggregateTarget::Collection(Namespace::new("db", "coll")),
            vec![doc! { "$match": { "operationType": "insert" } }],
            Some(&options),
            None,
        )
        .unwrap();

        let command = op.build(&StreamDescription::default()).unwrap();
        let pipeline = command.body.get_array("pipeline").unwrap();
        assert_eq!(pipeline.len(), 2);

        let first_stage = pipeline[0].as_document().unwrap();
        let stage_body = first_stage.get_document("$changeStream").unwrap();
        assert_eq!(stage_body.get_str("fullDocument"), Ok("updateLookup"));
    }
}
