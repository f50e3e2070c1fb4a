//! Sends encoded commands over a connection.
//!
//! Retry boundaries per call shape:
//! - unary: every attempt is retried on a transient status. The call id stays
//!   the same across attempts so the server replays a completed reply instead
//!   of running the handler again.
//! - server stream: only establishing the stream is retried. Once items flow,
//!   a broken stream ends with an error item.
//! - client stream: retried only while nothing has been pulled from the
//!   input, since the input can only be consumed once.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll};

use futures::stream::{self, BoxStream, Stream, StreamExt};
use tokio::sync::oneshot;
use tonic::{Request, Status};
use tracing::{debug, warn};
use uuid::Uuid;

use super::connection::RemoteConnection;
use crate::codec::{CodecError, Envelope, Reply};
use crate::config::ResolvedCall;
use crate::error::{category, RemoteError};
use crate::metadata::{CallMetadata, CALL_ID_HEADER, COMMAND_HEADER};
use crate::retry::{is_transient, retry_transient, retry_when, with_timeout};

/// Send one unary command and wait for its reply.
pub(crate) async fn unary(
    connection: &RemoteConnection,
    envelope: Envelope,
    call: &ResolvedCall,
) -> Result<Reply, RemoteError> {
    let command = envelope.type_name.clone();
    let call_id = Uuid::new_v4().to_string();
    let headers = headers(call, &[(CALL_ID_HEADER, call_id.as_str())])?;
    debug!(command = %command, address = %connection.address(), call_id = %call_id, "dispatching command");

    retry_transient(
        call.backoff(),
        || {
            let mut client = connection.client();
            let request = request(envelope.clone(), &headers);
            with_timeout(call.timeout, async move {
                client.execute(request).await.map(|r| r.into_inner())
            })
        },
        |status, delay| log_retry(&command, connection, status, delay),
    )
    .await
    .map_err(|(status, attempts)| connection.failure(&status, attempts))
}

/// Open a server stream. Only establishment is retried; `call.timeout` bounds
/// each establishment attempt, not the life of the stream.
pub(crate) async fn server_stream(
    connection: &RemoteConnection,
    envelope: Envelope,
    call: &ResolvedCall,
) -> Result<BoxStream<'static, Result<Reply, RemoteError>>, RemoteError> {
    let command = envelope.type_name.clone();
    let headers = headers(call, &[])?;
    debug!(command = %command, address = %connection.address(), "opening server stream");

    let replies = retry_transient(
        call.backoff(),
        || {
            let mut client = connection.client();
            let request = request(envelope.clone(), &headers);
            with_timeout(call.timeout, async move {
                client
                    .execute_server_stream(request)
                    .await
                    .map(|r| r.into_inner())
            })
        },
        |status, delay| log_retry(&command, connection, status, delay),
    )
    .await
    .map_err(|(status, attempts)| connection.failure(&status, attempts))?;

    let connection = connection.clone();
    Ok(replies
        .map(move |reply| reply.map_err(|status| broken_stream(&connection, &status)))
        .boxed())
}

/// Send a stream of items and wait for the single reply produced after the
/// input ends. `call.timeout` bounds each attempt, input included.
///
/// An item that fails to encode aborts the call: the server receives an
/// abort item in its place and the caller gets the encode error.
pub(crate) async fn client_stream(
    connection: &RemoteConnection,
    command: &str,
    items: BoxStream<'static, Result<Envelope, CodecError>>,
    call: &ResolvedCall,
) -> Result<Reply, RemoteError> {
    let headers = headers(call, &[(COMMAND_HEADER, command)])?;
    debug!(command, address = %connection.address(), "opening client stream");

    let (abort_tx, abort_rx) = oneshot::channel();
    let input = Arc::new(ClientInput::new(items, abort_tx));

    let attempts = retry_when(
        call.backoff(),
        || {
            let mut client = connection.client();
            let request = request(input.attempt(), &headers);
            with_timeout(call.timeout, async move {
                client
                    .execute_client_stream(request)
                    .await
                    .map(|r| r.into_inner())
            })
        },
        |status| is_transient(status) && !input.pulled(),
        |status, delay| log_retry(command, connection, status, delay),
    );

    tokio::select! {
        biased;
        Ok(failure) = abort_rx => {
            warn!(command, address = %connection.address(), error = %failure, "client stream aborted");
            Err(failure.into())
        }
        outcome = attempts => {
            outcome.map_err(|(status, attempts)| connection.failure(&status, attempts))
        }
    }
}

/// The caller's input to a client stream, shared by every attempt.
struct ClientInput {
    items: Mutex<BoxStream<'static, Result<Envelope, CodecError>>>,
    pulled: AtomicBool,
    abort: Mutex<Option<oneshot::Sender<CodecError>>>,
}

impl ClientInput {
    fn new(
        items: BoxStream<'static, Result<Envelope, CodecError>>,
        abort: oneshot::Sender<CodecError>,
    ) -> Self {
        Self {
            items: Mutex::new(items),
            pulled: AtomicBool::new(false),
            abort: Mutex::new(Some(abort)),
        }
    }

    /// The request body of one attempt. Tonic polls it only once the
    /// channel is connected.
    fn attempt(self: &Arc<Self>) -> impl Stream<Item = Envelope> + Send + 'static {
        let input = Arc::clone(self);
        stream::poll_fn(move |cx| input.poll_item(cx))
    }

    /// Whether any attempt has started reading the input.
    fn pulled(&self) -> bool {
        self.pulled.load(Ordering::SeqCst)
    }

    fn poll_item(&self, cx: &mut Context<'_>) -> Poll<Option<Envelope>> {
        self.pulled.store(true, Ordering::SeqCst);
        // nothing follows the abort item
        if lock(&self.abort).is_none() {
            return Poll::Ready(None);
        }

        let next = lock(&self.items).poll_next_unpin(cx);
        match next {
            Poll::Ready(Some(Ok(envelope))) => Poll::Ready(Some(envelope)),
            Poll::Ready(Some(Err(failure))) => {
                let item = Envelope::abort(failure.to_string());
                if let Some(abort) = lock(&self.abort).take() {
                    let _ = abort.send(failure);
                }
                Poll::Ready(Some(item))
            }
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Turn a reply into the caller's result type.
pub(crate) fn into_result<T: serde::de::DeserializeOwned>(
    reply: Reply,
    command: &str,
) -> Result<T, RemoteError> {
    if let Some(failure) = reply.failure {
        if failure.category == category::HANDLER_NOT_FOUND {
            return Err(RemoteError::HandlerNotFound(command.to_string()));
        }
        return Err(RemoteError::RemoteExecution {
            category: failure.category,
            message: failure.message,
        });
    }
    let envelope = reply.envelope.ok_or_else(|| RemoteError::RemoteExecution {
        category: category::INTERNAL.to_string(),
        message: format!("empty reply for {command}"),
    })?;
    Ok(envelope.unpack_as(command)?)
}

fn headers(
    call: &ResolvedCall,
    reserved: &[(&str, &str)],
) -> Result<tonic::metadata::MetadataMap, RemoteError> {
    let mut metadata = CallMetadata::from_map(call.metadata.clone());
    for (key, value) in reserved {
        metadata.set(*key, *value);
    }
    metadata.to_grpc().map_err(RemoteError::InvalidCallOptions)
}

/// Timeouts are enforced locally; dropping the request resets the stream,
/// which cancels the handler's call context on the server.
fn request<T>(message: T, headers: &tonic::metadata::MetadataMap) -> Request<T> {
    let mut request = Request::new(message);
    *request.metadata_mut() = headers.clone();
    request
}

fn log_retry(command: &str, connection: &RemoteConnection, status: &Status, delay: std::time::Duration) {
    warn!(
        command,
        address = %connection.address(),
        code = ?status.code(),
        error = %status.message(),
        delay = ?delay,
        "transport call failed, retrying"
    );
}

fn broken_stream(connection: &RemoteConnection, status: &Status) -> RemoteError {
    warn!(address = %connection.address(), code = ?status.code(), error = %status.message(), "server stream broken");
    connection.failure(status, 1)
}
