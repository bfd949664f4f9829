mod join_handle;
pub(crate) mod stream;
mod sync_read_ext;

use std::{future::Future, time::Duration};

pub(crate) use self::{join_handle::AsyncJoinHandle, sync_read_ext::SyncLittleEndianRead};
use crate::error::{Error, Result};

/// Spawns a task on the current tokio runtime.
pub(crate) fn spawn<F, O>(fut: F) -> AsyncJoinHandle<O>
where
    F: Future<Output = O> + Send + 'static,
    O: Send + 'static,
{
    AsyncJoinHandle::spawn(fut)
}

/// Awaits `future` for at most `duration`, failing with a network timeout once it elapses.
pub(crate) async fn timeout<F: Future>(duration: Duration, future: F) -> Result<F::Output> {
    tokio::time::timeout(duration, future)
        .await
        .map_err(|_| Error::network_timeout())
}

/// Like [`timeout`], but leaves `future` unbounded when no budget is configured.
pub(crate) async fn maybe_timeout<F: Future>(
    duration: Option<Duration>,
    future: F,
) -> Result<F::Output> {
    match duration {
        Some(duration) if !duration.is_zero() => timeout(duration, future).await,
        _ => Ok(future.await),
    }
}
