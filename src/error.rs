//! Error types surfaced by remote command dispatch and event delivery.

use std::error::Error as StdError;

use thiserror::Error;

use crate::codec::CodecError;

/// Failure categories carried on the wire in a `Failure`.
pub mod category {
    /// The server has no handler for the command type.
    pub const HANDLER_NOT_FOUND: &str = "handler_not_found";
    /// The command payload could not be decoded.
    pub const DECODE_FAILED: &str = "decode_failed";
    /// Business logic rejected the command.
    pub const REJECTED: &str = "rejected";
    /// A resource the command refers to does not exist.
    pub const NOT_FOUND: &str = "not_found";
    /// The caller is not allowed to run the command.
    pub const UNAUTHORIZED: &str = "unauthorized";
    /// The call was cancelled before the handler finished.
    pub const CANCELLED: &str = "cancelled";
    /// Any other handler failure.
    pub const INTERNAL: &str = "internal";
    /// The transport reported a non-transient failure.
    pub const TRANSPORT: &str = "transport";
}

/// Error returned to callers of the remote client.
#[derive(Debug, Error)]
pub enum RemoteError {
    /// No connection is bound to this command type on the client.
    #[error("unregistered command: {0}")]
    UnregisteredCommand(String),

    /// No event hub exists for this event type.
    #[error("unregistered event: {0}")]
    UnregisteredEvent(String),

    /// The server has no handler for this command type.
    #[error("no handler registered on the server for: {0}")]
    HandlerNotFound(String),

    /// The remote handler ran and failed.
    #[error("remote execution failed ({category}): {message}")]
    RemoteExecution { category: String, message: String },

    /// The transport stayed unavailable after every retry attempt.
    #[error("transport unavailable at {address} after {attempts} attempt(s): {reason}")]
    TransportUnavailable {
        address: String,
        attempts: usize,
        reason: String,
    },

    /// The remote address could not be parsed into an endpoint.
    #[error("invalid remote address {address}: {reason}")]
    InvalidAddress { address: String, reason: String },

    /// Call options could not be applied (bad metadata key or value).
    #[error("invalid call options: {0}")]
    InvalidCallOptions(String),

    /// Payload encoding or decoding failed.
    #[error(transparent)]
    Codec(#[from] CodecError),
}

impl RemoteError {
    /// Whether retrying the same call later could succeed.
    ///
    /// Configuration errors and handler failures are final.
    pub fn is_retryable(&self) -> bool {
        matches!(self, RemoteError::TransportUnavailable { .. })
    }

    /// The failure category, when the error came from the remote side.
    pub fn category(&self) -> Option<&str> {
        match self {
            RemoteError::RemoteExecution { category, .. } => Some(category),
            RemoteError::HandlerNotFound(_) => Some(category::HANDLER_NOT_FOUND),
            _ => None,
        }
    }
}

/// Error type for command and event handlers.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// Payload decode / deserialization failed.
    #[error("decode failed: {0}")]
    DecodeFailed(String),
    /// Business logic rejected the command (validation, invariant violation).
    #[error("rejected: {0}")]
    Rejected(String),
    /// Resource not found.
    #[error("not found: {0}")]
    NotFound(String),
    /// Missing or invalid authentication / authorization.
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    /// The call was cancelled while the handler ran.
    #[error("cancelled")]
    Cancelled,
    /// A failure with an application-defined category.
    #[error("{message}")]
    Custom { category: String, message: String },
    /// Other error.
    #[error("handler error: {0}")]
    Other(Box<dyn StdError + Send + Sync>),
}

impl HandlerError {
    /// Stable category string sent to the caller.
    pub fn category(&self) -> &str {
        match self {
            HandlerError::DecodeFailed(_) => category::DECODE_FAILED,
            HandlerError::Rejected(_) => category::REJECTED,
            HandlerError::NotFound(_) => category::NOT_FOUND,
            HandlerError::Unauthorized(_) => category::UNAUTHORIZED,
            HandlerError::Cancelled => category::CANCELLED,
            HandlerError::Custom { category, .. } => category,
            HandlerError::Other(_) => category::INTERNAL,
        }
    }

    /// Build a failure with an application-defined category.
    pub fn custom(category: impl Into<String>, message: impl Into<String>) -> Self {
        HandlerError::Custom {
            category: category.into(),
            message: message.into(),
        }
    }

    /// Wrap any error as an internal handler failure.
    pub fn other<E>(err: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        HandlerError::Other(Box::new(err))
    }
}

impl From<CodecError> for HandlerError {
    fn from(err: CodecError) -> Self {
        HandlerError::DecodeFailed(err.to_string())
    }
}
