//! The commit and abort commands that conclude a transaction. Both are bare `admin` commands
//! whose only body beyond the command name is the transaction's write concern; the executor
//! supplies the session fields that tie them to the transaction itself.

use std::time::Duration;

use crate::{
    bson::doc,
    cmap::{Command, RawCommandResponse, StreamDescription},
    error::Result,
    operation::{Operation, Retryability, WriteConcernOnlyBody},
    options::{Acknowledgment, TransactionOptions, WriteConcern},
    selection_criteria::SelectionCriteria,
};

fn transaction_command(
    name: &'static str,
    write_concern: Option<&WriteConcern>,
) -> Result<Command> {
    let mut body = doc! { name: 1 };
    match write_concern {
        Some(write_concern) if !write_concern.is_empty() => {
            body.insert("writeConcern", write_concern.to_document()?);
        }
        _ => {}
    }
    Ok(Command::new(name, "admin", body))
}

#[derive(Debug)]
pub(crate) struct CommitTransaction {
    options: Option<TransactionOptions>,
}

impl CommitTransaction {
    pub(crate) fn new(options: Option<TransactionOptions>) -> Self {
        Self { options }
    }
}

impl Operation for CommitTransaction {
    type O = ();

    const NAME: &'static str = "commitTransaction";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        let options = self.options.as_ref();

        let mut command =
            transaction_command(Self::NAME, options.and_then(|o| o.write_concern.as_ref()))?;
        if let Some(max_commit_time) = options.and_then(|o| o.max_commit_time) {
            command
                .body
                .insert("maxTimeMS", max_commit_time.as_millis() as i64);
        }
        Ok(command)
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        response.body::<WriteConcernOnlyBody>()?.validate()
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.options
            .as_ref()
            .and_then(|options| options.write_concern.as_ref())
    }

    /// A retried commit asks for majority acknowledgment (with a 10 second floor on the wait),
    /// so that it observes whatever the first attempt managed to commit.
    fn update_for_retry(&mut self) {
        let write_concern = self
            .options
            .get_or_insert_with(Default::default)
            .write_concern
            .get_or_insert_with(Default::default);

        write_concern.w = Some(Acknowledgment::Majority);
        write_concern
            .w_timeout
            .get_or_insert(Duration::from_secs(10));
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }
}

/// Throws away a transaction's uncommitted state. The session has already moved on by the time
/// this runs, so the mongos pin it held rides along here instead.
#[derive(Debug)]
pub(crate) struct AbortTransaction {
    write_concern: Option<WriteConcern>,
    pinned: Option<SelectionCriteria>,
}

impl AbortTransaction {
    pub(crate) fn new(
        write_concern: Option<WriteConcern>,
        pinned: Option<SelectionCriteria>,
    ) -> Self {
        Self {
            write_concern,
            pinned,
        }
    }
}

impl Operation for AbortTransaction {
    type O = ();

    const NAME: &'static str = "abortTransaction";

    fn build(&mut self, _description: &StreamDescription) -> Result<Command> {
        transaction_command(Self::NAME, self.write_concern())
    }

    fn handle_response(
        &self,
        response: RawCommandResponse,
        _description: &StreamDescription,
    ) -> Result<Self::O> {
        response.body::<WriteConcernOnlyBody>()?.validate()
    }

    fn selection_criteria(&self) -> Option<&SelectionCriteria> {
        self.pinned.as_ref()
    }

    fn write_concern(&self) -> Option<&WriteConcern> {
        self.write_concern.as_ref()
    }

    fn retryability(&self) -> Retryability {
        Retryability::Write
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_retry_upgrades_write_concern_to_majority() {
        let mut op = CommitTransaction::new(None);

        let first = op.build(&StreamDescription::default()).unwrap();
        assert!(!first.body.contains_key("writeConcern"));

        op.update_for_retry();
        let second = op.build(&StreamDescription::default()).unwrap();
        let write_concern = second.body.get_document("writeConcern").unwrap();
        assert_eq!(write_concern.get_str("w"), Ok("majority"));
        assert_eq!(write_concern.get_i32("wtimeout"), Ok(10_000));
    }

    #[test]
    fn commit_retry_keeps_existing_timeout() {
        let options = TransactionOptions::builder()
            .write_concern(WriteConcern::builder().w_timeout(Duration::from_secs(3)).build())
            .build();
        let mut op = CommitTransaction::new(Some(options));

        op.update_for_retry();
        let command = op.build(&StreamDescription::default()).unwrap();
        let write_concern = command.body.get_document("writeConcern").unwrap();
        assert_eq!(write_concern.get_str("w"), Ok("majority"));
        assert_eq!(write_concern.get_i32("wtimeout"), Ok(3000));
    }

    #[test]
    fn max_commit_time_is_attached() {
        let options = TransactionOptions::builder()
            .max_commit_time(Duration::from_secs(5))
            .build();
        let mut op = CommitTransaction::new(Some(options));

        let command = op.build(&StreamDescription::default()).unwrap();
        assert_eq!(command.body.get_i64("maxTimeMS"), Ok(5000));
        assert_eq!(command.target_db, "admin");
        assert_eq!(command.name, "commitTransaction");
    }

    #[test]
    fn abort_skips_empty_write_concern() {
        let mut op = AbortTransaction::new(Some(WriteConcern::default()), None);
        let command = op.build(&StreamDescription::default()).unwrap();
        assert!(!command.body.contains_key("writeConcern"));
        assert_eq!(command.body.get_i32("abortTransaction"), Ok(1));
    }
}
