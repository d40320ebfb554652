use std::{collections::VecDeque, time::Duration};

use serde::Deserialize;

use crate::{
    bson::{doc, Document},
    cmap::{Command, RawCommandResponse, StreamDescription},
    coll::Namespace,
    cursor::CursorInformation,
    error::Result,
    operation::Operation,
    results::GetMoreResult,
    selection_criteria::SelectionCriteria,
};

/// Fetches the next batch of an open cursor. Never subject to ordinary server selection: the
/// batch can only come from the server holding the cursor, so the operation pins itself to the
/// address the cursor was opened on.
#[derive(Debug)]
pub(crate) struct GetMore {
    ns: Namespace,
    cursor_id: i64,
    pinned_to: SelectionCriteria,
    batch_size: Option<u32>,
    await_time: Option<Duration>,
}

impl GetMore {
    pub(crate) fn new(info: &CursorInformation) -> Self {
        Self {
            ns: info.ns.clone(),
            cursor_id: info.id,
            pinned_to: SelectionCriteria::from_address(info.address.clone()),
            batch_size: info.batch_size.filter(|size| *size > 0),
            // Only a tailable-await cursor bounds the server-side wait per batch.
            await_time: info.await_data.then_some(info.max_time).flatten(),
        }
    }
}

impl Operation for GetMore {
    type O = GetMoreResult;

    const NAME: &'static str = "getMore";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let mut body = doc! {
            Self::NAME: self.cursor_id,
            "collection": self.ns.coll.clone(),
        };
        if let Some(batch_size) = self.batch_size {
            body.insert("batchSize", batch_size as i64);
        }
        if let Some(await_time) = self.await_time {
            body.insert("maxTimeMS", await_time.as_millis() as i64);
        }

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        #[derive(Debug, Deserialize)]
        struct Body {
            cursor: CursorUpdate,
        }

        #[derive(Debug, Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct CursorUpdate {
            id: i64,
            next_batch: VecDeque<Document>,
        }

        let Body { cursor } = response.body()?;

        Ok(GetMoreResult {
            batch: cursor.next_batch,
            exhausted: cursor.id == 0,
        })
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        Some(&self.pinned_to)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::options::ServerAddress;

    fn info(await_data: bool) -> CursorInformation {
        CursorInformation {
            ns: Namespace::new("db", "coll"),
            address: ServerAddress::parse("a:27017").unwrap(),
            id: 42,
            batch_size: Some(5),
            max_time: Some(Duration::from_millis(300)),
            tailable: await_data,
            await_data,
        }
    }

    #[test]
    fn await_time_only_for_tailable_await() {
        let mut regular = GetMore::new(&info(false));
        let command = regular.build(&StreamDescription::default()).unwrap();
        assert!(!command.body.contains_key("maxTimeMS"));
        assert_eq!(command.body.get_i64("getMore"), Ok(42));
        assert_eq!(command.body.get_i64("batchSize"), Ok(5));

        let mut tailable = GetMore::new(&info(true));
        let command = tailable.build(&StreamDescription::default()).unwrap();
        assert_eq!(command.body.get_i64("maxTimeMS"), Ok(300));
    }
}
