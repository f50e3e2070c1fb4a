//! Typed remote command dispatch and event hubs over gRPC.
//!
//! A *handler server* hosts command handlers and event hubs. A *remote client*
//! maps command and event types to handler server addresses, sends commands to
//! them and subscribes to their events.
//!
//! - Commands go to exactly one handler and come back with one result (unary),
//!   one result for a stream of items (client streaming), or a stream of
//!   results (server streaming).
//! - Events are broadcast fire-and-forget. Each subscriber has its own
//!   in-memory FIFO queue on the hub; a slow or dead subscriber never holds up
//!   the others, and queued events do not survive a hub restart.
//! - Transient transport failures are retried with backoff. A retried unary
//!   call never runs its handler twice.
//!
//! ```ignore
//! // server
//! let server = Arc::new(
//!     HandlerServer::new()
//!         .register::<CreateOrderCommand, _>(|cmd: CreateOrderCommand, _ctx| async move {
//!             Ok(CreateOrderResult {
//!                 message: format!("Order {} created for {}", cmd.order_id, cmd.customer_name),
//!             })
//!         })
//!         .register_event_hub::<SomethingHappened>(),
//! );
//! tokio::spawn(remote_messaging::serve(Arc::clone(&server), "0.0.0.0:6000"));
//!
//! // client
//! let client = RemoteClient::new();
//! client
//!     .map_remote("127.0.0.1:6000", RemoteOptions::default())?
//!     .register::<CreateOrderCommand>();
//! let result = client.execute(&CreateOrderCommand { order_id: 1001, customer_name: "Holly Simms".into() }).await?;
//! ```

pub mod codec;
pub mod transport;

mod client;
mod config;
mod error;
mod message;
mod metadata;
mod retry;
mod server;

pub use client::{
    Binding, CallShape, CommandRouter, ConnectionManager, EventHandler, RemoteClient,
    RemoteConnection, RemoteMap, RemoteStream, SubscriptionState,
};
pub use codec::{CodecError, Envelope, Failure, Reply};
pub use config::{
    CallOptions, RemoteOptions, ResolvedCall, ServerOptions, TransportOptions,
    DEFAULT_MAX_RETRY_ATTEMPTS,
};
pub use error::{category, HandlerError, RemoteError};
pub use message::{ClientStreamItem, Command, Event, ServerStreamCommand};
pub use metadata::{CallMetadata, CALL_ID_HEADER, COMMAND_HEADER};
pub use retry::is_transient;
pub use server::{
    grpc_server, serve, serve_with_shutdown, CallContext, ClientStreamHandler, CommandHandler,
    DeliveryError, EventHub, EventSink, GrpcHandler, HandlerServer, HubMode, ItemStream,
    ServeError, ServerStreamHandler,
};
