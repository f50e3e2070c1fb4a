//! Wire codec: the binary envelope every command, result and event travels in.
//!
//! The body is serialized with bitcode and gzip-compressed once it grows past
//! [`COMPRESSION_THRESHOLD`]. The envelope itself is a protobuf message so it
//! can ride directly on the gRPC transport.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use crate::error::category;

/// Bodies larger than this many bytes are compressed.
pub const COMPRESSION_THRESHOLD: usize = 1024;

/// Upper bound on a decompressed body.
pub const MAX_DECOMPRESSED_SIZE: usize = 16 * 1024 * 1024;

/// Codec failures.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("encode failed: {0}")]
    Encode(String),
    #[error("decode failed: {0}")]
    Decode(String),
    #[error("compression failed: {0}")]
    Compression(String),
    #[error("decompressed body exceeds {limit} bytes")]
    TooLarge { limit: usize },
    #[error("type mismatch: expected {expected}, got {actual}")]
    TypeMismatch { expected: String, actual: String },
}

/// A typed payload on the wire: type discriminator, body, compression flag.
///
/// On a client stream an envelope may instead carry `abort`: the caller gave
/// up on the input and the server must not treat it as complete.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Envelope {
    #[prost(string, tag = "1")]
    pub type_name: String,
    #[prost(bytes = "vec", tag = "2")]
    pub body: Vec<u8>,
    #[prost(bool, tag = "3")]
    pub compressed: bool,
    #[prost(message, optional, tag = "4")]
    pub abort: Option<Failure>,
}

impl Envelope {
    /// Serialize `value` into an envelope tagged with `type_name`.
    pub fn pack<T: Serialize + ?Sized>(
        type_name: impl Into<String>,
        value: &T,
    ) -> Result<Self, CodecError> {
        let raw = bitcode::serialize(value).map_err(|e| CodecError::Encode(e.to_string()))?;
        let (body, compressed) = if raw.len() > COMPRESSION_THRESHOLD {
            (compress(&raw)?, true)
        } else {
            (raw, false)
        };
        Ok(Self {
            type_name: type_name.into(),
            body,
            compressed,
            abort: None,
        })
    }

    /// A client-stream item that aborts the stream instead of closing it.
    pub fn abort(reason: impl Into<String>) -> Self {
        Self {
            abort: Some(Failure::new(category::CANCELLED, reason)),
            ..Self::default()
        }
    }

    /// Deserialize the body.
    pub fn unpack<T: DeserializeOwned>(&self) -> Result<T, CodecError> {
        let decoded;
        let raw = if self.compressed {
            decoded = decompress(&self.body)?;
            decoded.as_slice()
        } else {
            self.body.as_slice()
        };
        bitcode::deserialize(raw).map_err(|e| CodecError::Decode(e.to_string()))
    }

    /// Check the type discriminator before decoding.
    pub fn expect_type(&self, expected: &str) -> Result<(), CodecError> {
        if self.type_name == expected {
            Ok(())
        } else {
            Err(CodecError::TypeMismatch {
                expected: expected.to_string(),
                actual: self.type_name.clone(),
            })
        }
    }

    /// Check the discriminator, then deserialize.
    pub fn unpack_as<T: DeserializeOwned>(&self, expected: &str) -> Result<T, CodecError> {
        self.expect_type(expected)?;
        self.unpack()
    }
}

/// A structured handler failure.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Failure {
    #[prost(string, tag = "1")]
    pub category: String,
    #[prost(string, tag = "2")]
    pub message: String,
}

impl Failure {
    pub fn new(category: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            category: category.into(),
            message: message.into(),
        }
    }
}

/// Response to any command call: either a result envelope or a failure.
#[derive(Clone, PartialEq, prost::Message)]
pub struct Reply {
    #[prost(message, optional, tag = "1")]
    pub envelope: Option<Envelope>,
    #[prost(message, optional, tag = "2")]
    pub failure: Option<Failure>,
}

impl Reply {
    pub fn ok(envelope: Envelope) -> Self {
        Self {
            envelope: Some(envelope),
            failure: None,
        }
    }

    pub fn failed(failure: Failure) -> Self {
        Self {
            envelope: None,
            failure: Some(failure),
        }
    }

    pub fn is_ok(&self) -> bool {
        self.failure.is_none()
    }
}

fn compress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder
        .write_all(data)
        .map_err(|e| CodecError::Compression(e.to_string()))?;
    encoder
        .finish()
        .map_err(|e| CodecError::Compression(e.to_string()))
}

fn decompress(data: &[u8]) -> Result<Vec<u8>, CodecError> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    let mut buffer = [0u8; 8192];

    loop {
        let read = decoder
            .read(&mut buffer)
            .map_err(|e| CodecError::Compression(e.to_string()))?;
        if read == 0 {
            break;
        }
        if decompressed.len() + read > MAX_DECOMPRESSED_SIZE {
            return Err(CodecError::TooLarge {
                limit: MAX_DECOMPRESSED_SIZE,
            });
        }
        decompressed.extend_from_slice(&buffer[..read]);
    }

    Ok(decompressed)
}
