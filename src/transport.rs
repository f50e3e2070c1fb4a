//! gRPC transport: the streaming RPC service commands and events ride on.
//!
//! Uses tonic for the server and client and prost for message serialization
//! (standard protobuf wire format, no `.proto` file). The service trait and
//! client are generated by `build.rs`.
//!
//! ## RPCs
//!
//! - `Execute`: unary command. `Envelope` in, `Reply` out.
//! - `ExecuteClientStream`: stream of `Envelope` in, one `Reply` out.
//! - `ExecuteServerStream`: one `Envelope` in, stream of `Reply` out.
//! - `Subscribe`: attach to an event hub, stream of event `Envelope` out.
//! - `Health`: lists registered commands and event hubs.

// ---------------------------------------------------------------------------
// Message types (prost, standard protobuf wire format)
// ---------------------------------------------------------------------------

#[derive(Clone, PartialEq, prost::Message)]
pub struct SubscribeRequest {
    #[prost(string, tag = "1")]
    pub event_type: String,
    #[prost(string, tag = "2")]
    pub subscriber_id: String,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HealthRequest {}

#[derive(Clone, PartialEq, prost::Message)]
pub struct HealthResponse {
    #[prost(bool, tag = "1")]
    pub ok: bool,
    #[prost(string, repeated, tag = "2")]
    pub commands: Vec<String>,
    #[prost(string, repeated, tag = "3")]
    pub event_hubs: Vec<String>,
}

// ---------------------------------------------------------------------------
// Generated service trait + server/client
// ---------------------------------------------------------------------------

include!(concat!(
    env!("OUT_DIR"),
    "/remote.messaging.RemoteService.rs"
));

pub use remote_service_client::RemoteServiceClient;
pub use remote_service_server::{RemoteService, RemoteServiceServer};
