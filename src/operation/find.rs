use crate::{
    bson::{doc, Document},
    cmap::{Command, RawCommandResponse, StreamDescription},
    coll::{
        options::{CursorType, FindOptions},
        Namespace,
    },
    cursor::CursorSpecification,
    error::{ErrorKind, Result},
    operation::{CursorBody, Operation, Retryability},
    selection_criteria::SelectionCriteria,
};

#[derive(Debug)]
pub(crate) struct Find {
    ns: Namespace,
    filter: Document,
    options: Option<FindOptions>,
}

impl Find {
    pub(crate) fn new(ns: Namespace, filter: Document, options: Option<FindOptions>) -> Self {
        Self {
            ns,
            filter,
            options,
        }
    }

    fn cursor_type(&self) -> CursorType {
        self.options
            .as_ref()
            .and_then(|opts| opts.cursor_type)
            .unwrap_or(CursorType::NonTailable)
    }
}

impl Operation for Find {
    type O = CursorSpecification;

    const NAME: &'static str = "find";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "filter": self.filter.clone(),
        };

        if let Some(ref options) = self.options {
            if let Some(ref sort) = options.sort {
                body.insert("sort", sort.clone());
            }
            if let Some(ref projection) = options.projection {
                body.insert("projection", projection.clone());
            }
            if let Some(ref hint) = options.hint {
                body.insert("hint", hint.clone());
            }
            if let Some(skip) = options.skip {
                body.insert("skip", skip as i64);
            }
            if let Some(limit) = options.limit {
                if limit < 0 {
                    // A negative limit requests a single batch of at most |limit| documents.
                    body.insert("limit", limit.abs());
                    body.insert("singleBatch", true);
                } else if limit > 0 {
                    body.insert("limit", limit);
                }
            }
            if let Some(batch_size) = options.batch_size {
                if i32::try_from(batch_size).is_err() {
                    return Err(ErrorKind::InvalidArgument {
                        message: "the batch size must fit in a signed 32-bit integer".to_string(),
                    }
                    .into());
                }
                body.insert("batchSize", batch_size as i64);
            }
            if let Some(ref comment) = options.comment {
                body.insert("comment", comment.clone());
            }
            if let Some(allow_disk_use) = options.allow_disk_use {
                body.insert("allowDiskUse", allow_disk_use);
            }
            if let Some(no_cursor_timeout) = options.no_cursor_timeout {
                body.insert("noCursorTimeout", no_cursor_timeout);
            }
            if let Some(ref read_concern) = options.read_concern {
                body.insert("readConcern", doc! { "level": read_concern.level.as_str() });
            }
            // `maxTimeMS` on a tailable-await find bounds the server-side wait per getMore
            // rather than the query, so it is attached there instead.
            if self.cursor_type() == CursorType::NonTailable {
                if let Some(max_time) = options.max_time {
                    body.insert("maxTimeMS", max_time.as_millis() as i64);
                }
            }
        }

        match self.cursor_type() {
            CursorType::NonTailable => {}
            CursorType::Tailable => {
                body.insert("tailable", true);
            }
            CursorType::TailableAwait => {
                body.insert("tailable", true);
                body.insert("awaitData", true);
            }
        }

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let source_address = response.source_address().clone();
        let body: CursorBody = response.body()?;

        let (tailable, await_data) = match self.cursor_type() {
            CursorType::NonTailable => (false, false),
            CursorType::Tailable => (true, false),
            CursorType::TailableAwait => (true, true),
        };

        Ok(CursorSpecification::new(
            body.cursor,
            source_address,
            self.options.as_ref().and_then(|opts| opts.batch_size),
            self.options.as_ref().and_then(|opts| opts.max_await_time),
            tailable,
            await_data,
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

    fn retryability(&self) -> Retryability {
        Retryability::Read
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn tailable_await_defers_max_time_to_get_more() {
        let options = FindOptions {
            cursor_type: Some(CursorType::TailableAwait),
            max_time: Some(Duration::from_millis(100)),
            ..Default::default()
        };
        let mut op = Find::new(Namespace::new("db", "coll"), doc! {}, Some(options));
        let command = op.build(&StreamDescription::default()).unwrap();

        assert!(!command.body.contains_key("maxTimeMS"));
        assert_eq!(command.body.get_bool("tailable"), Ok(true));
        assert_eq!(command.body.get_bool("awaitData"), Ok(true));
    }

    #[test]
    fn negative_limit_means_single_batch() {
        let options = FindOptions {
            limit: Some(-5),
            ..Default::default()
        };
        let mut op = Find::new(Namespace::new("db", "coll"), doc! {}, Some(options));
        let command = op.build(&StreamDescription::default()).unwrap();

        assert_eq!(command.body.get_i64("limit"), Ok(5));
        assert_eq!(command.body.get_bool("singleBatch"), Ok(true));
    }
}
