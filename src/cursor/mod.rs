//! Contains the types for cursors returned by queries and aggregations.

use std::{collections::VecDeque, marker::PhantomData, time::Duration};

use serde::de::DeserializeOwned;

use crate::{
    bson::Document,
    client::ClientSession,
    coll::Namespace,
    error::Result,
    operation::{CursorInfo, GetMore, KillCursors},
    options::ServerAddress,
    runtime,
    Client,
};

/// Specification used to create a new cursor.
#[derive(Debug, Clone)]
pub(crate) struct CursorSpecification {
    pub(crate) info: CursorInformation,
    pub(crate) initial_buffer: VecDeque<Document>,
}

impl CursorSpecification {
    pub(crate) fn new(
        info: CursorInfo,
        address: ServerAddress,
        batch_size: impl Into<Option<u32>>,
        max_time: impl Into<Option<Duration>>,
        tailable: bool,
        await_data: bool,
    ) -> Self {
        Self {
            info: CursorInformation {
                ns: info.ns,
                id: info.id,
                address,
                batch_size: batch_size.into(),
                max_time: max_time.into(),
                tailable,
                await_data,
            },
            initial_buffer: info.first_batch,
        }
    }

    pub(crate) fn id(&self) -> i64 {
        self.info.id
    }
}

/// Static information about a cursor.
#[derive(Clone, Debug)]
pub(crate) struct CursorInformation {
    pub(crate) ns: Namespace,

    /// The address of the server the cursor was opened on. All follow-up `getMore` and
    /// `killCursors` commands are routed there.
    pub(crate) address: ServerAddress,

    pub(crate) id: i64,

    pub(crate) batch_size: Option<u32>,

    /// For tailable-await cursors, how long each `getMore` asks the server to wait for new
    /// results.
    pub(crate) max_time: Option<Duration>,

    pub(crate) tailable: bool,

    pub(crate) await_data: bool,
}

/// The shared iteration state of `Cursor` and `SessionCursor`.
#[derive(Debug)]
struct CursorState {
    info: CursorInformation,
    buffer: VecDeque<Document>,
    exhausted: bool,
}

impl CursorState {
    fn new(spec: CursorSpecification) -> Self {
        Self {
            exhausted: spec.id() == 0,
            buffer: spec.initial_buffer,
            info: spec.info,
        }
    }

    /// Fetch the next document, issuing `getMore`s against the cursor's server as needed.
    ///
    /// Returns `Ok(None)` when the cursor is exhausted, or, for tailable cursors, when a
    /// `getMore` returned no documents but the cursor is still alive ("no document this wait").
    async fn try_next(
        &mut self,
        client: &Client,
        mut session: Option<&mut ClientSession>,
    ) -> Result<Option<Document>> {
        loop {
            if let Some(doc) = self.buffer.pop_front() {
                return Ok(Some(doc));
            }

            if self.exhausted {
                return Ok(None);
            }

            let get_more = GetMore::new(&self.info);
            let result = client
                .execute_operation(get_more, session.as_deref_mut())
                .await;

            match result {
                Ok(get_more_result) => {
                    self.exhausted = get_more_result.exhausted;
                    self.buffer = get_more_result.batch;

                    if self.buffer.is_empty() && !self.exhausted && self.info.tailable {
                        // Not end-of-stream: the caller decides whether to poll again.
                        return Ok(None);
                    }
                }
                Err(error) => {
                    // If the server has already forgotten the cursor there is nothing left to
                    // iterate (or kill).
                    if error.sdam_code() == Some(43) {
                        self.exhausted = true;
                    }
                    return Err(error);
                }
            }
        }
    }

    fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Spawn a best-effort `killCursors` for a cursor being dropped while still open.
    fn kill(&mut self, client: Client) {
        if self.exhausted || self.info.id == 0 {
            return;
        }
        let ns = self.info.ns.clone();
        let id = self.info.id;
        let address = self.info.address.clone();
        runtime::spawn(async move {
            let op = KillCursors::new(ns, id, address);
            let _ = client.execute_operation(op, None).await;
        });
    }
}

/// A `Cursor` streams the result of a query. Results are returned in batches: the first batch
/// arrives with the reply that created the cursor, and subsequent batches are requested from the
/// server the cursor was opened on as the buffered ones are drained.
///
/// A cursor created outside of an explicit session owns an implicit session, which is returned
/// to the client's session pool when the cursor is exhausted or dropped.
#[derive(Debug)]
pub struct Cursor<T> {
    client: Client,
    state: CursorState,
    session: Option<ClientSession>,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Cursor<T>
where
    T: DeserializeOwned,
{
    pub(crate) fn new(
        client: Client,
        spec: CursorSpecification,
        session: Option<ClientSession>,
    ) -> Self {
        Self {
            client,
            state: CursorState::new(spec),
            session,
            _phantom: Default::default(),
        }
    }

    /// Fetch the next document, if any.
    ///
    /// For non-tailable cursors, `Ok(None)` means the cursor is exhausted. For tailable
    /// cursors, `Ok(None)` may also mean no document was available this wait; check
    /// [`is_exhausted`](Cursor::is_exhausted) to distinguish the two.
    pub async fn try_next(&mut self) -> Result<Option<T>> {
        let doc = self
            .state
            .try_next(&self.client.clone(), self.session.as_mut())
            .await?;

        if self.state.is_exhausted() {
            // Hand the implicit session back to the pool as soon as the server side is done.
            self.session.take();
        }

        match doc {
            Some(doc) => Ok(Some(bson::from_document(doc)?)),
            None => Ok(None),
        }
    }

    /// Whether the server has closed the cursor.
    pub fn is_exhausted(&self) -> bool {
        self.state.is_exhausted()
    }
}

impl<T> Drop for Cursor<T> {
    fn drop(&mut self) {
        self.state.kill(self.client.clone());
    }
}

/// A cursor opened within an explicit [`ClientSession`]. Iteration requires the session it was
/// opened in, so every `getMore` runs under the same logical session id.
#[derive(Debug)]
pub struct SessionCursor<T> {
    client: Client,
    state: CursorState,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> SessionCursor<T>
where
    T: DeserializeOwned,
{
    pub(crate) fn new(client: Client, spec: CursorSpecification) -> Self {
        Self {
            client,
            state: CursorState::new(spec),
            _phantom: Default::default(),
        }
    }

    /// Fetch the next document using the given session, which must be the session the cursor
    /// was opened in.
    pub async fn try_next(&mut self, session: &mut ClientSession) -> Result<Option<T>> {
        let doc = self
            .state
            .try_next(&self.client.clone(), Some(session))
            .await?;

        match doc {
            Some(doc) => Ok(Some(bson::from_document(doc)?)),
            None => Ok(None),
        }
    }

    /// Whether the server has closed the cursor.
    pub fn is_exhausted(&self) -> bool {
        self.state.is_exhausted()
    }
}

impl<T> Drop for SessionCursor<T> {
    fn drop(&mut self) {
        self.state.kill(self.client.clone());
    }
}

/// Internal cursor handle used by change streams: iterates raw documents and exposes enough
/// state for the stream to rebuild itself on resume.
#[derive(Debug)]
pub(crate) struct RawCursor {
    client: Client,
    state: CursorState,
    session: Option<ClientSession>,
}

impl RawCursor {
    pub(crate) fn new(
        client: Client,
        spec: CursorSpecification,
        session: Option<ClientSession>,
    ) -> Self {
        Self {
            client,
            state: CursorState::new(spec),
            session,
        }
    }

    pub(crate) async fn try_next(&mut self) -> Result<Option<Document>> {
        self.state
            .try_next(&self.client.clone(), self.session.as_mut())
            .await
    }

    pub(crate) fn is_exhausted(&self) -> bool {
        self.state.is_exhausted()
    }
}

impl Drop for RawCursor {
    fn drop(&mut self) {
        self.state.kill(self.client.clone());
    }
}
