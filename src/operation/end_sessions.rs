use crate::{
    bson::{doc, Bson, Document},
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::Result,
    operation::Operation,
    selection_criteria::{ReadPreference, SelectionCriteria},
};

/// Informs the server that a batch of logical sessions will not be used again, allowing it to
/// reclaim their resources before their timeouts lapse. Best-effort: callers ignore failures.
#[derive(Debug)]
pub(crate) struct EndSessions {
    session_ids: Vec<Document>,
    selection_criteria: SelectionCriteria,
}

impl EndSessions {
    pub(crate) fn new(session_ids: Vec<Document>) -> Self {
        Self {
            session_ids,
            selection_criteria: SelectionCriteria::ReadPreference(
                ReadPreference::PrimaryPreferred {
                    options: Default::default(),
                },
            ),
        }
    }
}

impl Operation for EndSessions {
    type O = ();

    const NAME: &'static str = "endSessions";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let body = doc! {
            Self::NAME: self.session_ids.iter().cloned().map(Bson::Document).collect::<Vec<_>>(),
        };

        Ok(Command::new(Self::NAME, "admin", body))
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
