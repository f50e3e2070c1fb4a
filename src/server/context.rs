//! Context passed to command handlers.
//!
//! Carries the command type, the call metadata and a cancellation token tied
//! to the lifetime of the inbound call.

use tokio_util::sync::CancellationToken;

use crate::error::HandlerError;
use crate::metadata::CallMetadata;

/// The context passed to every command handler.
///
/// Cheap to clone. The cancellation token fires when the caller goes away or
/// the server shuts down; handlers that spawn work should watch it.
///
/// ## Example
///
/// ```ignore
/// async fn execute(&self, cmd: CreateOrderCommand, ctx: CallContext)
///     -> Result<CreateOrderResult, HandlerError>
/// {
///     let tenant = ctx.require("x-tenant")?;
///     tokio::select! {
///         _ = ctx.cancelled() => Err(HandlerError::Cancelled),
///         result = create_order(tenant, cmd) => result,
///     }
/// }
/// ```
#[derive(Debug, Clone)]
pub struct CallContext {
    command: String,
    metadata: CallMetadata,
    cancellation: CancellationToken,
}

impl CallContext {
    pub(crate) fn new(
        command: impl Into<String>,
        metadata: CallMetadata,
        cancellation: CancellationToken,
    ) -> Self {
        Self {
            command: command.into(),
            metadata,
            cancellation,
        }
    }

    /// A context with no metadata and a fresh token, for invoking handlers directly.
    pub fn detached(command: impl Into<String>) -> Self {
        Self::new(command, CallMetadata::new(), CancellationToken::new())
    }

    /// The command type being handled.
    pub fn command(&self) -> &str {
        &self.command
    }

    /// The idempotency key of the call, if any.
    pub fn call_id(&self) -> Option<&str> {
        self.metadata.call_id()
    }

    /// Metadata sent by the caller.
    pub fn metadata(&self) -> &CallMetadata {
        &self.metadata
    }

    /// Get a metadata entry or fail with `Unauthorized`.
    pub fn require(&self, key: &str) -> Result<&str, HandlerError> {
        self.metadata
            .get(key)
            .ok_or_else(|| HandlerError::Unauthorized(format!("missing {key} in call metadata")))
    }

    /// The call's cancellation token.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the call is cancelled.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }
}
