//! gRPC transport for the handler server.
//!
//! ## RPCs
//!
//! - `Execute`: unary command. `Envelope` in, `Reply` out.
//! - `ExecuteClientStream`: stream of `Envelope` items in, one `Reply` out.
//!   The command type travels in the `x-remote-command` header.
//! - `ExecuteServerStream`: `Envelope` in, stream of `Reply` out.
//! - `Subscribe`: attach to an event hub, stream of event `Envelope`s out.
//! - `Health`: registered commands and event hubs.
//!
//! ## Example
//!
//! ```ignore
//! let server = Arc::new(HandlerServer::new().register::<CreateOrderCommand, _>(handler));
//!
//! // Compose with other tonic services
//! let svc = server::grpc_server(Arc::clone(&server));
//!
//! // Or serve directly
//! server::serve(server, "[::1]:6000").await?;
//! ```

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use futures::stream::{BoxStream, StreamExt};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tonic::{Request, Response, Status, Streaming};
use tracing::{debug, info};

use super::hub::ChannelSink;
use super::service::HandlerServer;
use crate::codec::{Envelope, Reply};
use crate::error::{category, HandlerError};
use crate::metadata::{CallMetadata, COMMAND_HEADER};
use crate::transport::{
    HealthRequest, HealthResponse, RemoteService, RemoteServiceServer, SubscribeRequest,
};

/// Errors from binding or running the gRPC server.
#[derive(Debug, Error)]
pub enum ServeError {
    #[error("invalid listen address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    #[error("transport error: {0}")]
    Transport(#[from] tonic::transport::Error),
}

/// Implements the generated `RemoteService` trait on top of a `HandlerServer`.
pub struct GrpcHandler {
    server: Arc<HandlerServer>,
}

impl GrpcHandler {
    pub fn new(server: Arc<HandlerServer>) -> Self {
        Self { server }
    }
}

#[tonic::async_trait]
impl RemoteService for GrpcHandler {
    async fn execute(&self, request: Request<Envelope>) -> Result<Response<Reply>, Status> {
        let metadata = CallMetadata::from_grpc(request.metadata());
        let reply = self.server.execute(request.into_inner(), metadata).await;
        Ok(Response::new(reply))
    }

    async fn execute_client_stream(
        &self,
        request: Request<Streaming<Envelope>>,
    ) -> Result<Response<Reply>, Status> {
        let metadata = CallMetadata::from_grpc(request.metadata());
        let command = metadata
            .get(COMMAND_HEADER)
            .map(str::to_string)
            .ok_or_else(|| Status::invalid_argument(format!("missing {COMMAND_HEADER} header")))?;

        let items = request
            .into_inner()
            .map(|item| {
                item.map_err(|status| {
                    HandlerError::custom(category::TRANSPORT, status.message().to_string())
                })
            })
            .boxed();

        let reply = self
            .server
            .execute_client_stream(&command, items, metadata)
            .await;
        Ok(Response::new(reply))
    }

    type ExecuteServerStreamStream = BoxStream<'static, Result<Reply, Status>>;

    async fn execute_server_stream(
        &self,
        request: Request<Envelope>,
    ) -> Result<Response<Self::ExecuteServerStreamStream>, Status> {
        let metadata = CallMetadata::from_grpc(request.metadata());
        let replies = self
            .server
            .execute_server_stream(request.into_inner(), metadata)
            .map(Ok)
            .boxed();
        Ok(Response::new(replies))
    }

    type SubscribeStream = ReceiverStream<Result<Envelope, Status>>;

    async fn subscribe(
        &self,
        request: Request<SubscribeRequest>,
    ) -> Result<Response<Self::SubscribeStream>, Status> {
        let SubscribeRequest {
            event_type,
            subscriber_id,
        } = request.into_inner();

        if subscriber_id.is_empty() {
            return Err(Status::invalid_argument("subscriber_id must not be empty"));
        }
        let hub = self
            .server
            .hub(&event_type)
            .ok_or_else(|| Status::unimplemented(format!("no event hub for {event_type}")))?;
        if self.server.is_shutdown() {
            return Err(Status::unavailable("server is shutting down"));
        }

        let options = self.server.options();
        let (tx, rx) = mpsc::channel(options.hub_stream_capacity.max(1));
        hub.attach(
            &subscriber_id,
            Box::new(ChannelSink::new(tx, options.hub_delivery_timeout)),
        );
        debug!(event = %event_type, subscriber = %subscriber_id, "subscribe stream opened");

        Ok(Response::new(ReceiverStream::new(rx)))
    }

    async fn health(
        &self,
        _request: Request<HealthRequest>,
    ) -> Result<Response<HealthResponse>, Status> {
        Ok(Response::new(HealthResponse {
            ok: !self.server.is_shutdown(),
            commands: self.server.commands(),
            event_hubs: self.server.event_hubs(),
        }))
    }
}

// ---------------------------------------------------------------------------
// Convenience constructors
// ---------------------------------------------------------------------------

/// Create a `RemoteServiceServer` from a shared `HandlerServer`.
pub fn grpc_server(server: Arc<HandlerServer>) -> RemoteServiceServer<GrpcHandler> {
    RemoteServiceServer::new(GrpcHandler::new(server))
}

/// Bind and serve at the given address (e.g. `"[::1]:6000"`) until the process ends.
pub async fn serve(server: Arc<HandlerServer>, addr: &str) -> Result<(), ServeError> {
    serve_with_shutdown(server, addr, std::future::pending()).await
}

/// Bind and serve until `signal` resolves, then shut the handler server down
/// and drain open calls.
pub async fn serve_with_shutdown<F>(
    server: Arc<HandlerServer>,
    addr: &str,
    signal: F,
) -> Result<(), ServeError>
where
    F: Future<Output = ()> + Send,
{
    let socket: SocketAddr = addr.parse().map_err(|e: std::net::AddrParseError| {
        ServeError::InvalidAddress {
            address: addr.to_string(),
            reason: e.to_string(),
        }
    })?;

    info!(
        address = %socket,
        commands = ?server.commands(),
        event_hubs = ?server.event_hubs(),
        "handler server listening"
    );

    let handle = Arc::clone(&server);
    tonic::transport::Server::builder()
        .add_service(grpc_server(server))
        .serve_with_shutdown(socket, async move {
            signal.await;
            handle.shutdown();
        })
        .await?;

    info!(address = %socket, "handler server stopped");
    Ok(())
}
