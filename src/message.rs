//! Typed messages exchanged with remote peers.
//!
//! Every message type carries an explicit `NAME` which is used as the type
//! discriminator on the wire. Names must be unique per server.
//!
//! ```ignore
//! #[derive(Serialize, Deserialize)]
//! pub struct CreateOrderCommand { pub order_id: u64, pub customer_name: String }
//!
//! #[derive(Serialize, Deserialize)]
//! pub struct CreateOrderResult { pub message: String }
//!
//! impl Command for CreateOrderCommand {
//!     type Result = CreateOrderResult;
//!     const NAME: &'static str = "orders.create";
//! }
//! ```

use serde::de::DeserializeOwned;
use serde::Serialize;

/// A request routed to exactly one remote handler, answered by one result.
///
/// Use `type Result = ()` for commands without a result.
pub trait Command: Serialize + DeserializeOwned + Send + Sync + 'static {
    type Result: Serialize + DeserializeOwned + Send + 'static;
    const NAME: &'static str;
}

/// A request answered by a lazy, possibly unbounded sequence of items.
pub trait ServerStreamCommand: Serialize + DeserializeOwned + Send + Sync + 'static {
    type Item: Serialize + DeserializeOwned + Send + 'static;
    const NAME: &'static str;
}

/// An item of a client stream. The result is produced once the caller closes
/// the input sequence.
pub trait ClientStreamItem: Serialize + DeserializeOwned + Send + Sync + 'static {
    type Result: Serialize + DeserializeOwned + Send + 'static;
    const NAME: &'static str;
}

/// A broadcast payload consumed by zero or more subscriber handlers.
pub trait Event: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const NAME: &'static str;
}
