//! Bounded round trips
//!
//! Every network exchange is raced against a deadline. Whichever side
//! finishes first wins; the other is dropped, and the cleanup action (usually
//! closing the socket) runs exactly once either way.

use std::future::Future;
use std::time::Duration;

use tokio::time::sleep;

use crate::nat::error::{NatError, NatResult};

/// Resolve to a timeout failure after `duration`, running `cleanup` first
pub async fn fail_after<C>(duration: Duration, message: impl Into<String>, cleanup: C) -> NatError
where
    C: FnOnce(),
{
    let message = message.into();
    sleep(duration).await;
    cleanup();
    tracing::trace!("deadline elapsed: {}", message);
    NatError::timeout(message, duration)
}

/// Race `operation` against a deadline of `duration`.
///
/// `cleanup` runs exactly once regardless of which side wins, before the
/// outcome is returned.
pub async fn race<T, F, C>(
    duration: Duration,
    message: impl Into<String>,
    operation: F,
    cleanup: C,
) -> NatResult<T>
where
    F: Future<Output = NatResult<T>>,
    C: FnOnce(),
{
    let mut cleanup = Some(cleanup);
    let take_cleanup = {
        let cleanup = &mut cleanup;
        move || {
            if let Some(cleanup) = cleanup.take() {
                cleanup();
            }
        }
    };

    let outcome = tokio::select! {
        result = operation => Ok(result),
        err = fail_after(duration, message, take_cleanup) => Err(err),
    };

    // The operation won: release its resources too
    if let Some(cleanup) = cleanup.take() {
        cleanup();
    }

    match outcome {
        Ok(result) => result,
        Err(timeout) => Err(timeout),
    }
}
