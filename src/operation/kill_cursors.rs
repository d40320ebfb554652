use crate::{
    bson::doc,
    cmap::{Command, RawCommandResponse, StreamDescription},
    coll::Namespace,
    error::Result,
    operation::Operation,
    selection_criteria::SelectionCriteria,
};

/// Tells a server to free the resources for a cursor the driver is abandoning. Like `getMore`,
/// this is always routed to the server the cursor lives on.
#[derive(Debug)]
pub(crate) struct KillCursors {
    ns: Namespace,
    cursor_id: i64,
    selection_criteria: SelectionCriteria,
}

impl KillCursors {
    pub(crate) fn new(ns: Namespace, cursor_id: i64, address: crate::options::ServerAddress) -> Self {
        Self {
            ns,
            cursor_id,
            selection_criteria: SelectionCriteria::from_address(address),
        }
    }
}

impl Operation for KillCursors {
    type O = ();

    const NAME: &'static str = "killCursors";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let body = doc! {
            Self::NAME: self.ns.coll.clone(),
            "cursors": [self.cursor_id],
        };

        Ok(Command::new(Self::NAME, self.ns.db.clone(), body))
    }

    fn handle_response(
        &self,
        _response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        Ok(())
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        Some(&self.selection_criteria)
    }

    fn supports_sessions(&self) -> bool {
        false
    }
}
