//! Client side: mapping remotes, dispatching commands and subscribing to events.
//!
//! ## Example
//!
//! ```ignore
//! let client = RemoteClient::new();
//! client
//!     .map_remote("127.0.0.1:6000", RemoteOptions::default())?
//!     .register::<CreateOrderCommand>()
//!     .subscribe::<SomethingHappened, _>(|event: SomethingHappened| async move {
//!         tracing::info!(id = event.id, "something happened");
//!         Ok(())
//!     });
//!
//! let result = client
//!     .execute(&CreateOrderCommand { order_id: 1001, customer_name: "Holly Simms".into() })
//!     .await?;
//! ```

mod connection;
mod dispatcher;
mod router;
mod subscriber;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::stream::{BoxStream, Stream, StreamExt};
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info};
use uuid::Uuid;

pub use connection::{ConnectionManager, RemoteConnection};
pub use router::{Binding, CallShape, CommandRouter};
pub use subscriber::{EventHandler, SubscriptionState};

use subscriber::Subscription;

use crate::codec::Envelope;
use crate::config::{CallOptions, RemoteOptions};
use crate::error::RemoteError;
use crate::message::{ClientStreamItem, Command, Event, ServerStreamCommand};

/// Items of a server-streaming call.
pub type RemoteStream<T> = BoxStream<'static, Result<T, RemoteError>>;

/// Entry point for the calling side. Cheap to clone; clones share
/// connections, bindings and subscriptions.
///
/// Dropping the last clone stops every subscription.
#[derive(Clone)]
pub struct RemoteClient {
    inner: Arc<ClientInner>,
}

struct ClientInner {
    connections: ConnectionManager,
    router: CommandRouter,
    subscriptions: Mutex<HashMap<(String, &'static str), Subscription>>,
    subscriber_id: String,
    shutdown: CancellationToken,
    _stop_on_drop: DropGuard,
}

impl Default for RemoteClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RemoteClient {
    /// Create a client with a random subscriber id.
    pub fn new() -> Self {
        Self::with_subscriber_id(Uuid::new_v4().to_string())
    }

    /// Create a client that subscribes under a fixed id. A restarted process
    /// using the same id resumes its queue on the hub if the hub still holds it.
    pub fn with_subscriber_id(subscriber_id: impl Into<String>) -> Self {
        let shutdown = CancellationToken::new();
        Self {
            inner: Arc::new(ClientInner {
                connections: ConnectionManager::new(),
                router: CommandRouter::new(),
                subscriptions: Mutex::new(HashMap::new()),
                subscriber_id: subscriber_id.into(),
                _stop_on_drop: shutdown.clone().drop_guard(),
                shutdown,
            }),
        }
    }

    /// Start mapping command and event types to a remote handler server.
    ///
    /// The connection is created on first use of `address` and shared after
    /// that; `options` only apply to a new connection.
    pub fn map_remote(&self, address: &str, options: RemoteOptions) -> Result<RemoteMap<'_>, RemoteError> {
        let connection = self.inner.connections.get_or_create(address, options)?;
        Ok(RemoteMap {
            client: self,
            connection,
        })
    }

    pub fn subscriber_id(&self) -> &str {
        &self.inner.subscriber_id
    }

    pub fn router(&self) -> &CommandRouter {
        &self.inner.router
    }

    pub fn connections(&self) -> &ConnectionManager {
        &self.inner.connections
    }

    /// Execute a unary command with the connection's default options.
    pub async fn execute<C: Command>(&self, command: &C) -> Result<C::Result, RemoteError> {
        self.execute_with(command, CallOptions::default()).await
    }

    /// Execute a unary command with per-call overrides.
    pub async fn execute_with<C: Command>(
        &self,
        command: &C,
        options: CallOptions,
    ) -> Result<C::Result, RemoteError> {
        let connection = self.inner.router.resolve(C::NAME, CallShape::Unary)?;
        let call = connection.options().resolve(&options);
        let envelope = Envelope::pack(C::NAME, command)?;
        let reply = dispatcher::unary(&connection, envelope, &call).await?;
        dispatcher::into_result(reply, C::NAME)
    }

    /// Execute a server-streaming command. Items arrive as the handler
    /// produces them; dropping the stream cancels the call.
    pub async fn execute_server_stream<C: ServerStreamCommand>(
        &self,
        command: &C,
        options: CallOptions,
    ) -> Result<RemoteStream<C::Item>, RemoteError> {
        let connection = self.inner.router.resolve(C::NAME, CallShape::ServerStream)?;
        let call = connection.options().resolve(&options);
        let envelope = Envelope::pack(C::NAME, command)?;
        let replies = dispatcher::server_stream(&connection, envelope, &call).await?;

        Ok(replies
            .map(|reply| reply.and_then(|reply| dispatcher::into_result(reply, C::NAME)))
            // the first error ends the stream
            .scan(false, |failed, item| {
                if *failed {
                    return futures::future::ready(None);
                }
                *failed = item.is_err();
                futures::future::ready(Some(item))
            })
            .boxed())
    }

    /// Send a stream of items and get the result the handler produces once
    /// the stream ends. An item that fails to encode aborts the call; the
    /// handler never sees the input as complete.
    pub async fn execute_client_stream<I, S>(
        &self,
        items: S,
        options: CallOptions,
    ) -> Result<I::Result, RemoteError>
    where
        I: ClientStreamItem,
        S: Stream<Item = I> + Send + 'static,
    {
        let connection = self.inner.router.resolve(I::NAME, CallShape::ClientStream)?;
        let call = connection.options().resolve(&options);

        let envelopes = items.map(|item| Envelope::pack(I::NAME, &item)).boxed();
        let reply = dispatcher::client_stream(&connection, I::NAME, envelopes, &call).await?;
        dispatcher::into_result(reply, I::NAME)
    }

    /// Connection state of the subscription to `E` on `address`.
    pub fn subscription_state<E: Event>(&self, address: &str) -> Option<SubscriptionState> {
        self.subscriptions()
            .get(&(address.to_string(), E::NAME))
            .map(Subscription::state)
    }

    /// Watch the connection state of the subscription to `E` on `address`.
    pub fn watch_subscription<E: Event>(
        &self,
        address: &str,
    ) -> Option<watch::Receiver<SubscriptionState>> {
        self.subscriptions()
            .get(&(address.to_string(), E::NAME))
            .map(Subscription::watch)
    }

    /// Stop every subscription and close every connection.
    pub fn shutdown(&self) {
        info!(subscriber = %self.inner.subscriber_id, "remote client shutting down");
        self.inner.shutdown.cancel();
        for subscription in self.subscriptions().drain().map(|(_, s)| s) {
            subscription.stop();
        }
        self.inner.connections.close_all();
    }

    fn subscribe<E: Event, H: EventHandler<E>>(&self, connection: &RemoteConnection, handler: H) {
        let mut subscriptions = self.subscriptions();
        let key = (connection.address().to_string(), E::NAME);
        let subscription = subscriptions.entry(key).or_insert_with(|| {
            debug!(event = E::NAME, address = %connection.address(), "starting subscription");
            Subscription::spawn(
                connection.clone(),
                E::NAME,
                self.inner.subscriber_id.clone(),
                self.inner.shutdown.child_token(),
            )
        });
        subscription.add_handler::<E, H>(handler);
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<(String, &'static str), Subscription>> {
        self.inner
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Builder binding types to one remote. Returned by [`RemoteClient::map_remote`].
pub struct RemoteMap<'a> {
    client: &'a RemoteClient,
    connection: RemoteConnection,
}

impl RemoteMap<'_> {
    /// Send unary commands of type `C` to this remote.
    pub fn register<C: Command>(self) -> Self {
        self.bind(C::NAME, CallShape::Unary)
    }

    /// Send server-streaming commands of type `C` to this remote.
    pub fn register_server_stream<C: ServerStreamCommand>(self) -> Self {
        self.bind(C::NAME, CallShape::ServerStream)
    }

    /// Send client streams of `I` items to this remote.
    pub fn register_client_stream<I: ClientStreamItem>(self) -> Self {
        self.bind(I::NAME, CallShape::ClientStream)
    }

    /// Handle events of type `E` broadcast by this remote's hub. Handlers
    /// registered for the same event and remote share one stream.
    pub fn subscribe<E: Event, H: EventHandler<E>>(self, handler: H) -> Self {
        self.client.subscribe::<E, H>(&self.connection, handler);
        self
    }

    pub fn connection(&self) -> &RemoteConnection {
        &self.connection
    }

    fn bind(self, command: &str, shape: CallShape) -> Self {
        self.client
            .inner
            .router
            .register(command, self.connection.clone(), shape);
        self
    }
}
