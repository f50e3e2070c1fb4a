//! Retry boundary around transport calls.
//!
//! Only the network call is retried. Handler failures come back inside a
//! `Reply` and never reach this layer, so a retry can not re-run a handler
//! that reported a result.

use std::future::Future;
use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};
use tonic::{Code, Status};

/// Whether a gRPC status describes a transient transport condition.
///
/// Retryable codes:
/// - `Unavailable`: connection refused, reset or not yet established
/// - `DeadlineExceeded`: the attempt timed out
/// - `ResourceExhausted`: the peer shed load
/// - `Aborted`: the peer aborted the stream
/// - `Unknown`: a broken HTTP/2 stream surfaces with this code
///
/// Everything else (`Unimplemented`, `InvalidArgument`, `Internal`, ...) is a
/// configuration or protocol error and is final.
pub fn is_transient(status: &Status) -> bool {
    matches!(
        status.code(),
        Code::Unavailable
            | Code::DeadlineExceeded
            | Code::ResourceExhausted
            | Code::Aborted
            | Code::Unknown
    )
}

/// Run one attempt, turning an elapsed timeout into `DeadlineExceeded`.
pub(crate) async fn with_timeout<T, F>(timeout: Option<Duration>, attempt: F) -> Result<T, Status>
where
    F: Future<Output = Result<T, Status>>,
{
    match timeout {
        Some(limit) => match tokio::time::timeout(limit, attempt).await {
            Ok(result) => result,
            Err(_) => Err(Status::deadline_exceeded(format!(
                "call timed out after {limit:?}"
            ))),
        },
        None => attempt.await,
    }
}

/// Run `attempt` until it succeeds, fails with a non-transient status, or the
/// backoff runs out. The error carries the last status and the attempt count.
pub(crate) async fn retry_transient<T, F, Fut, N>(
    backoff: ExponentialBuilder,
    attempt: F,
    notify: N,
) -> Result<T, (Status, usize)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Status>>,
    N: FnMut(&Status, Duration),
{
    retry_when(backoff, attempt, is_transient, notify).await
}

/// Like [`retry_transient`], but `retryable` decides which failures get
/// another attempt.
pub(crate) async fn retry_when<T, F, Fut, R, N>(
    backoff: ExponentialBuilder,
    mut attempt: F,
    mut retryable: R,
    mut notify: N,
) -> Result<T, (Status, usize)>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, Status>>,
    R: FnMut(&Status) -> bool,
    N: FnMut(&Status, Duration),
{
    let mut delays = backoff.build();
    let mut attempts = 0;
    loop {
        attempts += 1;
        let status = match attempt().await {
            Ok(value) => return Ok(value),
            Err(status) => status,
        };
        if !retryable(&status) {
            return Err((status, attempts));
        }
        let Some(delay) = delays.next() else {
            return Err((status, attempts));
        };
        notify(&status, delay);
        tokio::time::sleep(delay).await;
    }
}
