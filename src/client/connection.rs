//! Connections to remote handler servers.
//!
//! One lazily-connected tonic `Channel` per address. The channel reconnects on
//! its own after a drop; the dispatcher retries the calls that failed meanwhile.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use tonic::transport::{Channel, Endpoint};
use tonic::Status;
use tracing::{debug, info};

use crate::config::RemoteOptions;
use crate::error::{category, RemoteError};
use crate::retry::is_transient;
use crate::transport::RemoteServiceClient;

/// Shared handle to one remote address. Cheap to clone.
#[derive(Clone)]
pub struct RemoteConnection {
    inner: Arc<ConnectionInner>,
}

struct ConnectionInner {
    address: String,
    options: RemoteOptions,
    channel: Channel,
}

impl std::fmt::Debug for RemoteConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteConnection")
            .field("address", &self.inner.address)
            .finish_non_exhaustive()
    }
}

impl RemoteConnection {
    /// Build a lazily-connected channel. Nothing touches the network until the
    /// first call. Must be called inside a Tokio runtime.
    pub fn open(address: &str, options: RemoteOptions) -> Result<Self, RemoteError> {
        let uri = if address.contains("://") {
            address.to_string()
        } else {
            format!("http://{address}")
        };

        let mut endpoint = Endpoint::from_shared(uri).map_err(|e| RemoteError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })?;

        let transport = &options.transport;
        if let Some(timeout) = transport.connect_timeout {
            endpoint = endpoint.connect_timeout(timeout);
        }
        if let Some(interval) = transport.http2_keep_alive_interval {
            endpoint = endpoint.http2_keep_alive_interval(interval);
        }
        endpoint = endpoint.tcp_keepalive(transport.tcp_keepalive);

        let channel = endpoint.connect_lazy();
        debug!(address, "remote connection created");

        Ok(Self {
            inner: Arc::new(ConnectionInner {
                address: address.to_string(),
                options,
                channel,
            }),
        })
    }

    pub fn address(&self) -> &str {
        &self.inner.address
    }

    pub fn options(&self) -> &RemoteOptions {
        &self.inner.options
    }

    /// The gRPC service config attached to this connection, as given.
    pub fn service_config(&self) -> Option<&serde_json::Value> {
        self.inner.options.service_config.as_ref()
    }

    /// A client over the shared channel.
    pub(crate) fn client(&self) -> RemoteServiceClient<Channel> {
        let client = RemoteServiceClient::new(self.inner.channel.clone());
        match self.inner.options.transport.max_message_size {
            Some(limit) => client
                .max_decoding_message_size(limit)
                .max_encoding_message_size(limit),
            None => client,
        }
    }

    /// Map a final transport status to the caller-facing error.
    pub(crate) fn failure(&self, status: &Status, attempts: usize) -> RemoteError {
        if is_transient(status) {
            RemoteError::TransportUnavailable {
                address: self.inner.address.clone(),
                attempts,
                reason: status.message().to_string(),
            }
        } else {
            RemoteError::RemoteExecution {
                category: category::TRANSPORT.to_string(),
                message: format!("{:?}: {}", status.code(), status.message()),
            }
        }
    }
}

/// Owns one connection per distinct remote address.
#[derive(Default)]
pub struct ConnectionManager {
    connections: RwLock<HashMap<String, RemoteConnection>>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Return the connection for `address`, creating it on first use.
    ///
    /// Options only apply when the connection is created; later calls for the
    /// same address share the existing handle.
    pub fn get_or_create(
        &self,
        address: &str,
        options: RemoteOptions,
    ) -> Result<RemoteConnection, RemoteError> {
        if let Some(existing) = self.get(address) {
            return Ok(existing);
        }

        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if let Some(existing) = connections.get(address) {
            return Ok(existing.clone());
        }
        let connection = RemoteConnection::open(address, options)?;
        connections.insert(address.to_string(), connection.clone());
        info!(address, "remote mapped");
        Ok(connection)
    }

    pub fn get(&self, address: &str) -> Option<RemoteConnection> {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(address)
            .cloned()
    }

    pub fn len(&self) -> usize {
        self.connections
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every connection. Channels close once the last handle is dropped.
    pub fn close_all(&self) {
        let mut connections = self
            .connections
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        if !connections.is_empty() {
            info!(count = connections.len(), "closing remote connections");
            connections.clear();
        }
    }
}
