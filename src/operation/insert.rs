use std::collections::HashMap;

use crate::{
    bson::{oid::ObjectId, Bson, Document},
    cmap::{Command, RawCommandResponse, StreamDescription},
    coll::{options::InsertManyOptions, Namespace},
    error::Result,
    operation::{drop_empty_write_concern, Operation, Retryability, WriteResponseBody},
    options::WriteConcern,
    results::InsertManyResult,
};

#[derive(Debug)]
pub(crate) struct Insert {
    ns: Namespace,
    documents: Vec<Document>,
    inserted_ids: Vec<Bson>,
    options: Option<InsertManyOptions>,
}

impl Insert {
    pub(crate) fn new(
        ns: Namespace,
        documents: Vec<Document>,
        options: Option<InsertManyOptions>,
    ) -> Self {
        let mut options = options;
        if let Some(ref mut options) = options {
            drop_empty_write_concern(&mut options.write_concern);
        }
        let mut insert = Self {
            ns,
            documents,
            options,
            inserted_ids: vec![],
        };

        // Any document without an `_id` gets one generated driver-side, so the caller can learn
        // the ids of everything it inserted.
        for doc in insert.documents.iter_mut() {
            let id = match doc.get("_id") {
                Some(id) => id.clone(),
                None => {
                    let id = Bson::ObjectId(ObjectId::new());
                    doc.insert("_id", id.clone());
                    id
                }
            };
            insert.inserted_ids.push(id);
        }

        insert
    }

    fn is_ordered(&self) -> bool {
        self.options
            .as_ref()
            .and_then(|options| options.ordered)
            .unwrap_or(true)
    }
}

impl Operation for Insert {
    type O = InsertManyResult;

    const NAME: &'static str = "insert";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = crate::bson::doc! {
            Self::NAME: self.ns.coll.clone(),
            "documents": self.documents.iter().cloned().map(Bson::Document).collect::<Vec<_>>(),
            "ordered": self.is_ordered(),
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
        let response: WriteResponseBody = response.body()?;
        response.validate()?;

        let mut inserted_ids = HashMap::new();
        for (index, id) in self.inserted_ids.iter().enumerate() {
            inserted_ids.insert(index, id.clone());
        }

        Ok(InsertManyResult { inserted_ids })
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options
            .as_ref()
            .and_then(|options| options.write_concern.as_ref())
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bson::doc;

    #[test]
    fn generates_missing_ids() {
        let mut op = Insert::new(
            Namespace::new("db", "coll"),
            vec![doc! { "_id": 12 }, doc! { "x": 1 }],
            None,
        );

        assert_eq!(op.inserted_ids.len(), 2);
        assert_eq!(op.inserted_ids[0], Bson::Int32(12));
        assert!(matches!(op.inserted_ids[1], Bson::ObjectId(_)));

        let command = op
            .build(&StreamDescription::default())
            .unwrap();
        assert_eq!(command.name, "insert");
        assert_eq!(command.target_db, "db");
        assert_eq!(command.body.get_bool("ordered"), Ok(true));

        let documents = command.body.get_array("documents").unwrap();
        assert_eq!(documents.len(), 2);
        // The generated _id is present in the document actually sent.
        assert!(documents[1]
            .as_document()
            .unwrap()
            .contains_key("_id"));
    }
}
