//! Shared test domain and server helpers.

use std::sync::{Arc, Once};
use std::time::Duration;

use remote_messaging::transport::{RemoteService, RemoteServiceServer};
use remote_messaging::{
    ClientStreamItem, Command, Event, GrpcHandler, HandlerServer, RemoteClient, RemoteOptions,
    ServerStreamCommand, SubscriptionState,
};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio_stream::wrappers::TcpListenerStream;

// ---------------------------------------------------------------------------
// Test domain
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreateOrderCommand {
    pub order_id: u64,
    pub customer_name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CreateOrderResult {
    pub message: String,
}

impl Command for CreateOrderCommand {
    type Result = CreateOrderResult;
    const NAME: &'static str = "orders.create";
}

/// Returns the tenant the call was made for.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WhoAmI;

impl Command for WhoAmI {
    type Result = String;
    const NAME: &'static str = "whoami";
}

/// Streams order ids `1..=count`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListOrders {
    pub count: u64,
    /// Fail after this many items.
    pub fail_after: Option<u64>,
}

impl ServerStreamCommand for ListOrders {
    type Item = u64;
    const NAME: &'static str = "orders.list";
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Reading {
    pub sensor: String,
    pub value: i64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingSummary {
    pub count: usize,
    pub total: i64,
}

impl ClientStreamItem for Reading {
    type Result = ReadingSummary;
    const NAME: &'static str = "sensors.readings";
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SomethingHappened {
    pub id: u64,
    pub description: String,
}

impl Event for SomethingHappened {
    const NAME: &'static str = "something.happened";
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

pub fn init_tracing() {
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Serve a handler server on an ephemeral port and return its address.
pub async fn start_server(server: Arc<HandlerServer>) -> String {
    start_service(GrpcHandler::new(server)).await
}

/// Serve any `RemoteService` implementation on an ephemeral port.
pub async fn start_service<S: RemoteService>(service: S) -> String {
    init_tracing();
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        tonic::transport::Server::builder()
            .add_service(RemoteServiceServer::new(service))
            .serve_with_incoming(TcpListenerStream::new(listener))
            .await
            .unwrap();
    });

    addr.to_string()
}

/// An address nothing listens on right now.
pub async fn free_address() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().to_string()
}

/// Connection options with short retry delays.
pub fn fast_options() -> RemoteOptions {
    RemoteOptions::default().with_retry_delays(Duration::from_millis(5), Duration::from_millis(20))
}

/// Connection options that keep retrying for a few seconds.
pub fn patient_options() -> RemoteOptions {
    RemoteOptions::default()
        .with_max_retry_attempts(60)
        .with_retry_delays(Duration::from_millis(20), Duration::from_millis(100))
}

/// Wait until the client's subscription to `E` on `address` is streaming.
pub async fn wait_streaming<E: Event>(client: &RemoteClient, address: &str) {
    let mut state = client
        .watch_subscription::<E>(address)
        .expect("no subscription for event");
    tokio::time::timeout(
        Duration::from_secs(5),
        state.wait_for(|s| *s == SubscriptionState::Streaming),
    )
    .await
    .expect("subscription not streaming in time")
    .expect("subscription task gone");
}

/// Wait until the client's subscription to `E` on `address` has stopped for
/// good. Returns the states it went through on the way.
pub async fn wait_stopped<E: Event>(client: &RemoteClient, address: &str) -> Vec<SubscriptionState> {
    let mut state = client
        .watch_subscription::<E>(address)
        .expect("no subscription for event");
    let mut seen = Vec::new();
    tokio::time::timeout(Duration::from_secs(10), async {
        while state.changed().await.is_ok() {
            seen.push(*state.borrow_and_update());
        }
    })
    .await
    .expect("subscription still running");
    seen
}

/// Receive from a channel or fail after a bounded delivery window.
pub async fn recv<T>(rx: &mut tokio::sync::mpsc::UnboundedReceiver<T>) -> T {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("nothing received in time")
        .expect("channel closed")
}
