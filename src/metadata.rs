//! Call metadata: string headers that travel with a command call.

use std::collections::HashMap;

use tonic::metadata::{Ascii, KeyAndValueRef, MetadataKey, MetadataMap, MetadataValue};

/// Idempotency key of one logical unary call. Constant across retries.
pub const CALL_ID_HEADER: &str = "x-remote-call-id";

/// Command type of a client-streaming call.
pub const COMMAND_HEADER: &str = "x-remote-command";

/// Metadata received with an inbound call, or attached to an outbound one.
///
/// Keys are lowercase ASCII, as gRPC requires.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CallMetadata {
    entries: HashMap<String, String>,
}

impl CallMetadata {
    /// Create empty metadata.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create metadata from a map of entries.
    pub fn from_map(entries: HashMap<String, String>) -> Self {
        Self { entries }
    }

    /// Read the ASCII entries of a gRPC metadata map. Binary entries are skipped.
    pub fn from_grpc(metadata: &MetadataMap) -> Self {
        let mut entries = HashMap::new();
        for kv in metadata.iter() {
            if let KeyAndValueRef::Ascii(key, value) = kv {
                if let Ok(v) = value.to_str() {
                    entries.insert(key.as_str().to_string(), v.to_string());
                }
            }
        }
        Self { entries }
    }

    /// Convert into a gRPC metadata map, rejecting keys or values gRPC cannot carry.
    pub fn to_grpc(&self) -> Result<MetadataMap, String> {
        let mut map = MetadataMap::new();
        for (name, value) in &self.entries {
            let key = MetadataKey::<Ascii>::from_bytes(name.to_ascii_lowercase().as_bytes())
                .map_err(|_| format!("invalid metadata key: {name}"))?;
            let value = MetadataValue::<Ascii>::try_from(value.as_str())
                .map_err(|_| format!("invalid metadata value for {name}"))?;
            map.insert(key, value);
        }
        Ok(map)
    }

    /// Get an entry by key.
    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries.get(key).map(|v| v.as_str())
    }

    /// Set an entry.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.entries.insert(key.into(), value.into());
    }

    /// Check if an entry exists.
    pub fn has(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// The idempotency key of the call, if the caller sent one.
    pub fn call_id(&self) -> Option<&str> {
        self.get(CALL_ID_HEADER)
    }

    /// Get all entries.
    pub fn entries(&self) -> &HashMap<String, String> {
        &self.entries
    }
}
