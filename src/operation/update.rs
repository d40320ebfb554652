use serde::Deserialize;

use crate::{
    bson::{doc, Bson, Document},
    cmap::{Command, RawCommandResponse, StreamDescription},
    coll::{options::UpdateOptions, Namespace},
    error::Result,
    operation::{
        drop_empty_write_concern,
        Operation,
        Retryability,
        UpsertedId,
        WriteResponseBody,
    },
    options::WriteConcern,
    results::UpdateResult,
};

#[derive(Debug)]
pub(crate) struct Update {
    ns: Namespace,
    filter: Document,
    update: Document,
    multi: Option<bool>,
    options: Option<UpdateOptions>,
}

impl Update {
    pub(crate) fn new(
        ns: Namespace,
        filter: Document,
        update: Document,
        multi: bool,
        options: Option<UpdateOptions>,
    ) -> Self {
        let mut options = options;
        if let Some(ref mut options) = options {
            drop_empty_write_concern(&mut options.write_concern);
        }
        Self {
            ns,
            filter,
            update,
            multi: multi.then_some(true),
            options,
        }
    }
}

impl Operation for Update {
    type O = UpdateResult;

    const NAME: &'static str = "update";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut update = doc! {
            "q": self.filter.clone(),
            "u": self.update.clone(),
        };

        if let Some(ref options) = self.options {
            if let Some(upsert) = options.upsert {
                update.insert("upsert", upsert);
            }

            if let Some(ref array_filters) = options.array_filters {
                update.insert("arrayFilters", array_filters.clone());
            }

            if let Some(ref hint) = options.hint {
                update.insert("hint", hint.clone());
            }

            if let Some(ref collation) = options.collation {
                update.insert("collation", collation.clone());
            }
        }

        if let Some(multi) = self.multi {
            update.insert("multi", multi);
        }

        let mut body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "updates": vec![Bson::Document(update)],
            "ordered": true,
        };

        if let Some(ref options) = self.options {
            if let Some(bypass) = options.bypass_document_validation {
                body.insert("bypassDocumentValidation", bypass);
            }
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
        let body: WriteResponseBody = response.body()?;
        body.validate()?;

        let upserts: UpsertedBody = response.body()?;
        let upserted_id = upserts
            .upserted
            .and_then(|mut upserted| (!upserted.is_empty()).then(|| upserted.remove(0).id));

        Ok(UpdateResult {
            // An upsert is counted in `n` but did not match anything.
            matched_count: if upserted_id.is_some() { 0 } else { body.n },
            modified_count: body.n_modified,
            upserted_id,
        })
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options
            .as_ref()
            .and_then(|options| options.write_concern.as_ref())
    }

    fn retryability(&self) -> Retryability {
        if self.multi != Some(true) {
            Retryability::Write
        } else {
            Retryability::None
        }
    }
}

#[derive(Debug, Deserialize)]
struct UpsertedBody {
    upserted: Option<Vec<UpsertedId>>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn multi_updates_are_not_retryable() {
        let single = Update::new(
            Namespace::new("db", "coll"),
            doc! { "x": 1 },
            doc! { "$set": { "x": 2 } },
            false,
            None,
        );
        assert_eq!(single.retryability(), Retryability::Write);

        let multi = Update::new(
            Namespace::new("db", "coll"),
            doc! { "x": 1 },
            doc! { "$set": { "x": 2 } },
            true,
            None,
        );
        assert_eq!(multi.retryability(), Retryability::None);
    }

    #[test]
    fn builds_update_statement() {
        let mut op = Update::new(
            Namespace::new("db", "coll"),
            doc! { "x": 1 },
            doc! { "$inc": { "x": 1 } },
            true,
            Some(UpdateOptions {
                upsert: Some(true),
                ..Default::default()
            }),
        );

        let command = op.build(&StreamDescription::default()).unwrap();
        let updates = command.body.get_array("updates").unwrap();
        let statement = updates[0].as_document().unwrap();

        assert_eq!(statement.get_document("q").unwrap(), &doc! { "x": 1 });
        assert_eq!(statement.get_bool("multi"), Ok(true));
        assert_eq!(statement.get_bool("upsert"), Ok(true));
    }
}
