//! Command type to connection bindings.

use std::collections::HashMap;
use std::fmt;
use std::sync::{PoisonError, RwLock};

use tracing::{debug, info};

use super::connection::RemoteConnection;
use crate::error::RemoteError;

/// The RPC shape a command type is dispatched with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallShape {
    Unary,
    ClientStream,
    ServerStream,
}

impl fmt::Display for CallShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CallShape::Unary => "unary",
            CallShape::ClientStream => "client_stream",
            CallShape::ServerStream => "server_stream",
        })
    }
}

/// Where and how a command type is sent.
#[derive(Debug, Clone)]
pub struct Binding {
    pub connection: RemoteConnection,
    pub shape: CallShape,
}

/// Maps command types to the connection serving them.
///
/// Registration is last-writer-wins. Bindings are built before they are
/// published, so a concurrent `resolve` sees either the old binding or the new
/// one, never a partial one.
#[derive(Default)]
pub struct CommandRouter {
    bindings: RwLock<HashMap<String, Binding>>,
}

impl CommandRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Bind a command type, replacing any earlier binding. Returns the replaced one.
    pub fn register(
        &self,
        command: &str,
        connection: RemoteConnection,
        shape: CallShape,
    ) -> Option<Binding> {
        let binding = Binding { connection, shape };
        let address = binding.connection.address().to_string();

        let previous = self
            .bindings
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(command.to_string(), binding);

        match &previous {
            Some(old) => info!(
                command,
                address = %address,
                previous = %old.connection.address(),
                shape = %shape,
                "command binding replaced"
            ),
            None => debug!(command, address = %address, shape = %shape, "command bound"),
        }
        previous
    }

    /// The connection for a command type dispatched with `shape`.
    ///
    /// A type bound with a different shape counts as unregistered for this shape.
    pub fn resolve(&self, command: &str, shape: CallShape) -> Result<RemoteConnection, RemoteError> {
        let bindings = self.bindings.read().unwrap_or_else(PoisonError::into_inner);
        match bindings.get(command) {
            Some(binding) if binding.shape == shape => Ok(binding.connection.clone()),
            _ => Err(RemoteError::UnregisteredCommand(command.to_string())),
        }
    }

    /// Bound command types, sorted.
    pub fn commands(&self) -> Vec<String> {
        let mut commands: Vec<String> = self
            .bindings
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .keys()
            .cloned()
            .collect();
        commands.sort();
        commands
    }
}
