//! Server side: command handlers, event hubs and the gRPC service exposing them.

mod context;
mod grpc;
mod handlers;
mod hub;
mod replay;
mod service;

pub use context::CallContext;
pub use grpc::{grpc_server, serve, serve_with_shutdown, GrpcHandler, ServeError};
pub use handlers::{ClientStreamHandler, CommandHandler, ItemStream, ServerStreamHandler};
pub use hub::{DeliveryError, EventHub, EventSink, HubMode};
pub use service::HandlerServer;
