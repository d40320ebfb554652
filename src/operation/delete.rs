use crate::{
    bson::{doc, Bson, Document},
    cmap::{Command, RawCommandResponse, StreamDescription},
    coll::{options::DeleteOptions, Namespace},
    error::Result,
    operation::{drop_empty_write_concern, Operation, Retryability, WriteResponseBody},
    options::WriteConcern,
    results::DeleteResult,
};

#[derive(Debug)]
pub(crate) struct Delete {
    ns: Namespace,
    filter: Document,
    limit: u32,
    options: Option<DeleteOptions>,
}

impl Delete {
    /// A `limit` of 0 deletes all matching documents; 1 deletes at most one.
    pub(crate) fn new(
        ns: Namespace,
        filter: Document,
        limit: Option<u32>,
        options: Option<DeleteOptions>,
    ) -> Self {
        let mut options = options;
        if let Some(ref mut options) = options {
            drop_empty_write_concern(&mut options.write_concern);
        }
        Self {
            ns,
            filter,
            limit: limit.unwrap_or(0),
            options,
        }
    }
}

impl Operation for Delete {
    type O = DeleteResult;

    const NAME: &'static str = "delete";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut delete = doc! {
            "q": self.filter.clone(),
            "limit": self.limit,
        };

        if let Some(ref options) = self.options {
            if let Some(ref collation) = options.collation {
                delete.insert("collation", collation.clone());
            }
            if let Some(ref hint) = options.hint {
                delete.insert("hint", hint.clone());
            }
        }

        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "deletes": vec![Bson::Document(delete)],
            "ordered": true,
        };

        if let Some(ref options) = self.options {
            if let Some(ref write_concern) = options.write_concern {
                body.insert("writeConcern", write_concern.to_document()?);
            }
        }

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        let response: WriteResponseBody = response.body()?;
        response.validate()?;

        Ok(DeleteResult {
            deleted_count: response.n,
        })
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options
            .as_ref()
            .and_then(|options| options.write_concern.as_ref())
    }

    fn retryability(&self) -> Retryability {
        if self.limit == 1 {
            Retryability::Write
        } else {
            Retryability::None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delete_many_is_not_retryable() {
        let one = Delete::new(Namespace::new("db", "coll"), doc! {}, Some(1), None);
        assert_eq!(one.retryability(), Retryability::Write);

        let many = Delete::new(Namespace::new("db", "coll"), doc! {}, None, None);
        assert_eq!(many.retryability(), Retryability::None);
    }
}
