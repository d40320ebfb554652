mod resolver;
mod stream;
mod tls;

use std::{future::Future, time::Duration};

use crate::error::{Error, Result};

pub(crate) use resolver::AsyncResolver;
pub(crate) use stream::AsyncStream;
pub(crate) use tls::TlsConfig;

/// Spawn a task in the background to run a future.
///
/// If called from within a tokio runtime, the task is spawned there; otherwise it is silently
/// dropped, which only happens when a handle is dropped after its runtime already shut down.
pub(crate) fn spawn<F, O>(fut: F)
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    if let Ok(handle) = tokio::runtime::Handle::try_current() {
        handle.spawn(fut);
    }
}

/// Await on a future for a maximum amount of time before returning an error.
pub(crate) async fn timeout<F: Future>(timeout: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(timeout, future)
        .await
        .map_err(|_| Error::from(std::io::ErrorKind::TimedOut))
}

/// Await on a future, bounding it with the given timeout if one is provided.
pub(crate) async fn timeout_opt<F: Future>(
    duration: Option<Duration>,
    future: F,
) -> Result<F::Output> {
    match duration {
        Some(duration) => timeout(duration, future).await,
        None => Ok(future.await),
    }
}

pub(crate) async fn delay_for(delay: Duration) {
    tokio::time::sleep(delay).await
}
