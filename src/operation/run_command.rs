use crate::{
    bson::Document,
    bson_util,
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::{ErrorKind, Result},
    operation::{CommandErrorBody, Operation},
    selection_criteria::SelectionCriteria,
};

/// An arbitrary command provided by the caller, sent to the server as-is.
#[derive(Debug)]
pub(crate) struct RunCommand {
    db: String,
    command: Document,
    selection_criteria: Option<SelectionCriteria>,
}

impl RunCommand {
    pub(crate) fn new(
        db: String,
        command: Document,
        selection_criteria: Option<SelectionCriteria>,
    ) -> Result<Self> {
        if bson_util::first_key(&command).is_none() {
            return Err(ErrorKind::InvalidArgument {
                message: "an empty document cannot be run as a command".to_string(),
            }
            .into());
        }

        Ok(Self {
            db,
            command,
            selection_criteria,
        })
    }

    fn command_name(&self) -> &str {
        bson_util::first_key(&self.command).unwrap_or("")
    }
}

impl Operation for RunCommand {
    type O = Document;

    const NAME: &'static str = "";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        Ok(Command::new(
            self.command_name().to_string(),
            self.db.clone(),
            self.command.clone(),
        ))
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        if !response.is_success() {
            if let Ok(error_body) = response.body::<CommandErrorBody>() {
                return Err(error_body.into());
            }
        }
        Ok(response.into_raw_response())
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.selection_criteria.as_ref()
    }

    fn name(&self) -> &str {
        self.command_name()
    }
}
