//! Handler server: command handler registry, dispatch and event hubs.
//!
//! `HandlerServer` maps command types to handlers and event types to hubs.
//! It knows nothing about the network; `grpc` puts it behind the transport.
//!
//! ## Example
//!
//! ```ignore
//! let server = Arc::new(
//!     HandlerServer::new()
//!         .register::<CreateOrderCommand, _>(CreateOrderHandler)
//!         .register_event_hub::<SomethingHappened>(),
//! );
//!
//! tokio::spawn(server::serve(Arc::clone(&server), "0.0.0.0:6000"));
//! server.broadcast(&SomethingHappened { id: 7, description: "x".into() })?;
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures::future::{self, BoxFuture, FutureExt};
use futures::stream::{self, BoxStream, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::context::CallContext;
use super::handlers::{ClientStreamHandler, CommandHandler, Endpoint, ServerStreamHandler};
use super::hub::{EventHub, HubMode};
use super::replay::ReplayCache;
use crate::codec::{Envelope, Failure, Reply};
use crate::config::ServerOptions;
use crate::error::{category, HandlerError, RemoteError};
use crate::message::{ClientStreamItem, Command, Event, ServerStreamCommand};
use crate::metadata::CallMetadata;

/// Hosts command handlers and event hubs.
///
/// Every inbound call runs independently; handlers are shared between
/// concurrent calls.
pub struct HandlerServer {
    endpoints: HashMap<String, Endpoint>,
    hubs: HashMap<String, Arc<EventHub>>,
    replay: ReplayCache,
    options: ServerOptions,
    shutdown: CancellationToken,
}

impl Default for HandlerServer {
    fn default() -> Self {
        Self::new()
    }
}

impl HandlerServer {
    pub fn new() -> Self {
        Self::with_options(ServerOptions::default())
    }

    pub fn with_options(options: ServerOptions) -> Self {
        Self {
            endpoints: HashMap::new(),
            hubs: HashMap::new(),
            replay: ReplayCache::new(options.replay_capacity),
            options,
            shutdown: CancellationToken::new(),
        }
    }

    /// Register a unary command handler.
    ///
    /// Uses builder pattern; registering a command type twice keeps the last handler.
    pub fn register<C, H>(self, handler: H) -> Self
    where
        C: Command,
        H: CommandHandler<C>,
    {
        self.insert(C::NAME, Endpoint::unary::<C, H>(handler))
    }

    /// Register a server-streaming command handler.
    pub fn register_server_stream<C, H>(self, handler: H) -> Self
    where
        C: ServerStreamCommand,
        H: ServerStreamHandler<C>,
    {
        self.insert(C::NAME, Endpoint::server_stream::<C, H>(handler))
    }

    /// Register a client-streaming handler for items of type `I`.
    pub fn register_client_stream<I, H>(self, handler: H) -> Self
    where
        I: ClientStreamItem,
        H: ClientStreamHandler<I>,
    {
        self.insert(I::NAME, Endpoint::client_stream::<I, H>(handler))
    }

    /// Host a fan-out event hub for `E`.
    pub fn register_event_hub<E: Event>(self) -> Self {
        self.register_event_hub_with::<E>(HubMode::default())
    }

    /// Host an event hub for `E` with the given delivery mode.
    pub fn register_event_hub_with<E: Event>(mut self, mode: HubMode) -> Self {
        let hub = EventHub::new(E::NAME, mode, &self.options, self.shutdown.child_token());
        self.hubs.insert(E::NAME.to_string(), Arc::new(hub));
        info!(event = E::NAME, mode = ?mode, "event hub registered");
        self
    }

    fn insert(mut self, name: &str, endpoint: Endpoint) -> Self {
        let shape = endpoint.shape();
        match self.endpoints.insert(name.to_string(), endpoint) {
            Some(previous) => warn!(
                command = name,
                shape,
                previous = previous.shape(),
                "command handler replaced"
            ),
            None => info!(command = name, shape, "command handler registered"),
        }
        self
    }

    /// Execute a unary command.
    ///
    /// Calls carrying a call id run their handler at most once; a retried
    /// call gets the stored reply.
    pub async fn execute(&self, envelope: Envelope, metadata: CallMetadata) -> Reply {
        let command = envelope.type_name.clone();
        let Some(Endpoint::Unary(handler)) = self.endpoints.get(&command) else {
            return self.not_found(&command, "unary");
        };
        let handler = Arc::clone(handler);
        let call_id = metadata.call_id().map(str::to_string);

        self.replay
            .run(call_id.as_deref(), || async move {
                let token = self.shutdown.child_token();
                let _guard = token.clone().drop_guard();
                debug!(command = %command, call_id = ?metadata.call_id(), "executing command");
                let ctx = CallContext::new(command.clone(), metadata, token);
                guarded(&command, handler(envelope, ctx)).await
            })
            .await
    }

    /// Execute a client-streaming command once its input stream ends.
    ///
    /// An abort item from the caller reaches the handler as a failed item,
    /// ends the input and cancels the call context.
    pub async fn execute_client_stream(
        &self,
        command: &str,
        items: BoxStream<'static, Result<Envelope, HandlerError>>,
        metadata: CallMetadata,
    ) -> Reply {
        let Some(Endpoint::ClientStream(handler)) = self.endpoints.get(command) else {
            return self.not_found(command, "client_stream");
        };
        let token = self.shutdown.child_token();
        let _guard = token.clone().drop_guard();
        debug!(command, "executing client stream");
        let items = abortable(command, items, token.clone());
        let ctx = CallContext::new(command, metadata, token);
        guarded(command, handler(items, ctx)).await
    }

    /// Execute a server-streaming command.
    ///
    /// The call context is cancelled when the returned stream is dropped.
    pub fn execute_server_stream(
        &self,
        envelope: Envelope,
        metadata: CallMetadata,
    ) -> BoxStream<'static, Reply> {
        let command = envelope.type_name.clone();
        let Some(Endpoint::ServerStream(handler)) = self.endpoints.get(&command) else {
            let reply = self.not_found(&command, "server_stream");
            return stream::once(future::ready(reply)).boxed();
        };

        let token = self.shutdown.child_token();
        let guard = token.clone().drop_guard();
        debug!(command = %command, "executing server stream");
        let ctx = CallContext::new(command.clone(), metadata, token);

        let replies = match std::panic::catch_unwind(AssertUnwindSafe(|| handler(envelope, ctx))) {
            Ok(replies) => replies,
            Err(panic) => return stream::once(future::ready(panicked(&command, panic))).boxed(),
        };

        AssertUnwindSafe(replies)
            .catch_unwind()
            .map(move |reply| {
                let _call = &guard;
                match reply {
                    Ok(reply) => reply,
                    Err(panic) => panicked(&command, panic),
                }
            })
            .boxed()
    }

    /// Queue an event for every subscriber of its hub.
    ///
    /// Returns once the event is queued, with the number of subscribers it was
    /// queued for. Delivery happens in the background.
    pub fn broadcast<E: Event>(&self, event: &E) -> Result<usize, RemoteError> {
        let hub = self
            .hubs
            .get(E::NAME)
            .ok_or_else(|| RemoteError::UnregisteredEvent(E::NAME.to_string()))?;
        let queued = hub.broadcast(Envelope::pack(E::NAME, event)?);
        debug!(event = E::NAME, subscribers = queued, "event broadcast");
        Ok(queued)
    }

    /// The hub for an event type.
    pub fn hub(&self, event_type: &str) -> Option<&Arc<EventHub>> {
        self.hubs.get(event_type)
    }

    /// Registered command types, sorted.
    pub fn commands(&self) -> Vec<String> {
        let mut commands: Vec<String> = self.endpoints.keys().cloned().collect();
        commands.sort();
        commands
    }

    /// Event types with a hub, sorted.
    pub fn event_hubs(&self) -> Vec<String> {
        let mut hubs: Vec<String> = self.hubs.keys().cloned().collect();
        hubs.sort();
        hubs
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    /// Cancel in-flight calls and stop every hub's drain tasks.
    pub fn shutdown(&self) {
        if !self.shutdown.is_cancelled() {
            info!("handler server shutting down");
            self.shutdown.cancel();
        }
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn not_found(&self, command: &str, shape: &str) -> Reply {
        warn!(command, shape, "no handler registered for command");
        Reply::failed(Failure::new(
            category::HANDLER_NOT_FOUND,
            format!("no {shape} handler registered for {command}"),
        ))
    }
}

/// Await a handler, turning a panic into an internal failure.
async fn guarded(command: &str, call: BoxFuture<'static, Reply>) -> Reply {
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(reply) => {
            if let Some(failure) = &reply.failure {
                warn!(command, category = %failure.category, error = %failure.message, "command handler failed");
            }
            reply
        }
        Err(panic) => panicked(command, panic),
    }
}

fn panicked(command: &str, panic: Box<dyn Any + Send>) -> Reply {
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    error!(command, error = %message, "command handler panicked");
    Reply::failed(Failure::new(
        category::INTERNAL,
        format!("handler panicked: {message}"),
    ))
}

fn abortable(
    command: &str,
    items: BoxStream<'static, Result<Envelope, HandlerError>>,
    token: CancellationToken,
) -> BoxStream<'static, Result<Envelope, HandlerError>> {
    let command = command.to_string();
    items
        .scan(false, move |aborted, item| {
            if *aborted {
                return future::ready(None);
            }
            let item = match item {
                Ok(Envelope {
                    abort: Some(failure),
                    ..
                }) => {
                    *aborted = true;
                    token.cancel();
                    warn!(command = %command, error = %failure.message, "caller aborted the client stream");
                    Err(HandlerError::custom(failure.category, failure.message))
                }
                item => item,
            };
            future::ready(Some(item))
        })
        .boxed()
}
