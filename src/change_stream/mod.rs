//! Contains the functionality for change streams.

pub mod event;
pub mod options;

use std::marker::PhantomData;

use serde::de::DeserializeOwned;

use crate::{
    bson::{Document, Timestamp},
    cursor::RawCursor,
    error::{ErrorKind, Result},
    operation::AggregateTarget,
    options::ChangeStreamOptions,
    Client,
};

pub use event::ChangeStreamEvent;

/// A `ChangeStream` streams the ongoing changes of its associated collection, database or
/// deployment. It is a resumable iterator over an aggregation whose first stage is
/// `$changeStream`: when a resumable error (a network error, a cursor-not-found, or a server
/// error the server labels resumable) interrupts iteration, the stream re-issues the
/// aggregation from the last observed resume token and continues, once per `next` call.
///
/// A change stream only yields events written after its creation (or after the resume point it
/// was given) and only while it is iterated.
#[derive(Debug)]
pub struct ChangeStream<T> {
    cursor: RawCursor,

    client: Client,

    target: AggregateTarget,

    pipeline: Vec<Document>,

    options: Option<ChangeStreamOptions>,

    data: ChangeStreamData,

    _phantom: PhantomData<fn() -> T>,
}

/// The resume-relevant state of a change stream.
#[derive(Debug, Default)]
struct ChangeStreamData {
    /// The `_id` of the most recent event returned, if any.
    resume_token: Option<Document>,

    /// The operation time of the initial aggregation, used as the resume point when no event
    /// has been returned yet on a stream that was not given an explicit starting point.
    initial_operation_time: Option<Timestamp>,

    /// Whether any event has ever been returned from this stream.
    document_returned: bool,
}

impl<T> ChangeStream<T>
where
    T: DeserializeOwned,
{
    pub(crate) async fn create(
        client: Client,
        target: AggregateTarget,
        pipeline: Vec<Document>,
        options: Option<ChangeStreamOptions>,
    ) -> Result<Self> {
        let (spec, operation_time, implicit_session) = client
            .execute_watch(target.clone(), pipeline.clone(), options.as_ref())
            .await?;

        let has_explicit_start = options
            .as_ref()
            .map(|o| o.resume_after.is_some() || o.start_at_operation_time.is_some())
            .unwrap_or(false);

        Ok(Self {
            cursor: RawCursor::new(client.clone(), spec, implicit_session),
            client,
            target,
            pipeline,
            options,
            data: ChangeStreamData {
                resume_token: None,
                // Only streams without an explicit starting point resume from the initial
                // operation time.
                initial_operation_time: if has_explicit_start {
                    None
                } else {
                    operation_time
                },
                document_returned: false,
            },
            _phantom: Default::default(),
        })
    }

    /// The cached resume token of the most recent event returned by this stream, suitable for
    /// the `resume_after` option of a new stream.
    pub fn resume_token(&self) -> Option<&Document> {
        self.data.resume_token.as_ref()
    }

    /// Returns the next event in the stream, waiting until one is available.
    ///
    /// Returns `Ok(None)` only if the stream has been invalidated server-side.
    pub async fn next(&mut self) -> Result<Option<T>> {
        loop {
            if let Some(event) = self.next_if_any().await? {
                return Ok(Some(event));
            }
            if self.cursor.is_exhausted() {
                return Ok(None);
            }
        }
    }

    /// Returns the next event without waiting past the server's await timeout: if the server
    /// had no event to report this wait, returns `Ok(None)` so the caller can decide whether to
    /// keep polling.
    ///
    /// One resume attempt is made per call; a second failure propagates.
    pub async fn next_if_any(&mut self) -> Result<Option<T>> {
        match self.cursor.try_next().await {
            Ok(next) => self.handle_document(next),
            Err(error) if error.is_resumable() => {
                self.resume().await?;
                let next = self.cursor.try_next().await?;
                self.handle_document(next)
            }
            Err(error) => Err(error),
        }
    }

    fn handle_document(&mut self, document: Option<Document>) -> Result<Option<T>> {
        let document = match document {
            Some(document) => document,
            None => return Ok(None),
        };

        // Without a resume token there is no way to ever resume past this event.
        let resume_token = match document.get_document("_id") {
            Ok(token) => token.clone(),
            Err(_) => return Err(ErrorKind::MissingResumeToken.into()),
        };

        self.data.resume_token = Some(resume_token);
        self.data.document_returned = true;

        Ok(Some(bson::from_document(document)?))
    }

    /// Re-issue the aggregation from the stream's resume point and swap in the new cursor.
    async fn resume(&mut self) -> Result<()> {
        let mut options = self.options.clone().unwrap_or_default();

        if let Some(ref token) = self.data.resume_token {
            options.resume_after = Some(token.clone());
            options.start_at_operation_time = None;
        } else if !self.data.document_returned {
            if let Some(operation_time) = self.data.initial_operation_time {
                options.resume_after = None;
                options.start_at_operation_time = Some(operation_time);
            }
        }

        let (spec, _, implicit_session) = self
            .client
            .execute_watch(
                self.target.clone(),
                self.pipeline.clone(),
                Some(&options),
            )
            .await?;

        self.cursor = RawCursor::new(self.client.clone(), spec, implicit_session);
        Ok(())
    }
}
