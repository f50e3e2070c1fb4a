//! Event subscriber runtime.
//!
//! One task per (hub address, event type) holds the `Subscribe` stream open
//! and hands each event to every local handler registered for its type.
//!
//! ```text
//!  Disconnected ──> Connecting ──> Streaming ──(stream broke)──> Connecting ──> Streaming
//!                        │                                           │
//!                        └──(fatal status / retries spent / shutdown)┴──> Disconnected
//! ```
//!
//! Handlers for one event run concurrently and are awaited before the next
//! event is taken from the stream, so each handler sees events in hub order.
//! A handler that fails or panics is logged and does not affect the others.

use std::future::Future;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use backon::BackoffBuilder;
use futures::future::{BoxFuture, FutureExt};
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tonic::{Request, Status, Streaming};
use tracing::{debug, error, info, warn};

use super::connection::RemoteConnection;
use crate::codec::Envelope;
use crate::config::CallOptions;
use crate::error::HandlerError;
use crate::message::Event;
use crate::metadata::CallMetadata;
use crate::retry::{is_transient, with_timeout};
use crate::transport::SubscribeRequest;

/// Connection state of one subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    /// Not started yet, or stopped for good.
    Disconnected,
    /// Opening the stream, or waiting to retry.
    Connecting,
    Streaming,
}

/// Handles one event type on the subscriber side. Nothing is returned to the
/// publisher; an error is only logged.
#[async_trait]
pub trait EventHandler<E: Event>: Send + Sync + 'static {
    async fn handle(&self, event: E) -> Result<(), HandlerError>;
}

#[async_trait]
impl<E, F, Fut> EventHandler<E> for F
where
    E: Event,
    F: Fn(E) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), HandlerError>> + Send + 'static,
{
    async fn handle(&self, event: E) -> Result<(), HandlerError> {
        self(event).await
    }
}

type ErasedHandler = Arc<dyn Fn(Envelope) -> BoxFuture<'static, Result<(), HandlerError>> + Send + Sync>;

fn erase<E: Event, H: EventHandler<E>>(handler: H) -> ErasedHandler {
    let handler = Arc::new(handler);
    Arc::new(move |envelope: Envelope| {
        let handler = Arc::clone(&handler);
        async move {
            let event = envelope.unpack_as::<E>(E::NAME)?;
            handler.handle(event).await
        }
        .boxed()
    })
}

/// A running subscription. Stops when its token is cancelled.
pub(crate) struct Subscription {
    handlers: Arc<RwLock<Vec<ErasedHandler>>>,
    state: watch::Receiver<SubscriptionState>,
    cancel: CancellationToken,
}

impl Subscription {
    /// Start the subscription task. Must be called inside a Tokio runtime.
    pub(crate) fn spawn(
        connection: RemoteConnection,
        event_type: &'static str,
        subscriber_id: String,
        cancel: CancellationToken,
    ) -> Self {
        let handlers = Arc::new(RwLock::new(Vec::new()));
        let (state_tx, state_rx) = watch::channel(SubscriptionState::Disconnected);

        let task = SubscriptionTask {
            connection,
            event_type,
            subscriber_id,
            handlers: Arc::clone(&handlers),
            cancel: cancel.clone(),
        };
        tokio::spawn(task.run(state_tx));

        Self {
            handlers,
            state: state_rx,
            cancel,
        }
    }

    pub(crate) fn add_handler<E: Event, H: EventHandler<E>>(&self, handler: H) {
        self.handlers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(erase::<E, H>(handler));
    }

    pub(crate) fn state(&self) -> SubscriptionState {
        *self.state.borrow()
    }

    pub(crate) fn watch(&self) -> watch::Receiver<SubscriptionState> {
        self.state.clone()
    }

    pub(crate) fn stop(&self) {
        self.cancel.cancel();
    }
}

struct SubscriptionTask {
    connection: RemoteConnection,
    event_type: &'static str,
    subscriber_id: String,
    handlers: Arc<RwLock<Vec<ErasedHandler>>>,
    cancel: CancellationToken,
}

impl SubscriptionTask {
    async fn run(self, state: watch::Sender<SubscriptionState>) {
        let backoff = self.connection.options().resolve(&CallOptions::new()).backoff();
        let mut delays = backoff.build();

        loop {
            state.send_replace(SubscriptionState::Connecting);
            let opened = tokio::select! {
                _ = self.cancel.cancelled() => break,
                opened = self.open() => opened,
            };

            let status = match opened {
                Ok(events) => {
                    state.send_replace(SubscriptionState::Streaming);
                    info!(
                        event = self.event_type,
                        address = %self.connection.address(),
                        subscriber = %self.subscriber_id,
                        "subscribed to event hub"
                    );
                    delays = backoff.build();
                    match self.consume(events).await {
                        Some(status) => status,
                        None => break,
                    }
                }
                Err(status) => status,
            };

            if !is_transient(&status) {
                error!(
                    event = self.event_type,
                    address = %self.connection.address(),
                    code = ?status.code(),
                    error = %status.message(),
                    "subscription failed"
                );
                break;
            }
            let Some(delay) = delays.next() else {
                error!(
                    event = self.event_type,
                    address = %self.connection.address(),
                    error = %status.message(),
                    "event hub unreachable, giving up"
                );
                break;
            };
            warn!(
                event = self.event_type,
                address = %self.connection.address(),
                error = %status.message(),
                delay = ?delay,
                "event stream lost, reconnecting"
            );
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        state.send_replace(SubscriptionState::Disconnected);
        debug!(event = self.event_type, address = %self.connection.address(), "subscription stopped");
    }

    async fn open(&self) -> Result<Streaming<Envelope>, Status> {
        let options = self.connection.options();
        let mut request = Request::new(SubscribeRequest {
            event_type: self.event_type.to_string(),
            subscriber_id: self.subscriber_id.clone(),
        });
        *request.metadata_mut() = CallMetadata::from_map(options.per_call_metadata.clone())
            .to_grpc()
            .map_err(Status::invalid_argument)?;

        let mut client = self.connection.client();
        with_timeout(options.per_call_timeout, async move {
            client.subscribe(request).await.map(|r| r.into_inner())
        })
        .await
    }

    /// Read events until the stream breaks (returns its status) or the
    /// subscription is stopped (returns `None`).
    async fn consume(&self, mut events: Streaming<Envelope>) -> Option<Status> {
        loop {
            let next = tokio::select! {
                _ = self.cancel.cancelled() => return None,
                next = events.message() => next,
            };
            match next {
                Ok(Some(envelope)) => self.dispatch(envelope).await,
                Ok(None) => return Some(Status::unavailable("event stream closed by the hub")),
                Err(status) => return Some(status),
            }
        }
    }

    async fn dispatch(&self, envelope: Envelope) {
        let handlers = self
            .handlers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if handlers.is_empty() {
            debug!(event = self.event_type, "no local handlers, event skipped");
            return;
        }

        let mut running = JoinSet::new();
        for handler in handlers {
            running.spawn(handler(envelope.clone()));
        }
        while let Some(outcome) = running.join_next().await {
            match outcome {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(event = self.event_type, error = %e, "event handler failed"),
                Err(e) if e.is_panic() => error!(event = self.event_type, "event handler panicked"),
                Err(e) => warn!(event = self.event_type, error = %e, "event handler aborted"),
            }
        }
    }
}
