//! Error types shared by every layer of the store.

use std::path::PathBuf;

use thiserror::Error;

use crate::client::ConnectionState;
use crate::serializer::CodecError;

/// Errors returned by the key-value layer.
#[derive(Error, Debug)]
pub enum KvError {
    /// No configuration was found; the store stays disabled.
    #[error("Configuration not found: {}", .0.display())]
    ConfigMissing(PathBuf),

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The storage engine reported an I/O or transaction failure.
    #[error("Storage engine error: {0}")]
    Engine(#[from] sled::Error),

    /// Stored bytes do not follow the bucket layout.
    #[error("Storage layout corrupted: {0}")]
    Corrupted(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Malformed key {key:?}: {reason}")]
    MalformedKey { key: String, reason: &'static str },

    #[error("Failed to encode record for key {key:?}: {source}")]
    Encode {
        key: String,
        #[source]
        source: CodecError,
    },

    #[error("Failed to decode record at key {key:?}: {source}")]
    Decode {
        key: String,
        #[source]
        source: CodecError,
    },

    /// The store is disabled or already closed.
    #[error("Key-value store is not available (state: {0})")]
    NotAvailable(ConnectionState),
}

impl KvError {
    pub(crate) fn malformed(key: &str, reason: &'static str) -> Self {
        KvError::MalformedKey {
            key: key.to_string(),
            reason,
        }
    }

    pub(crate) fn corrupted(msg: impl Into<String>) -> Self {
        KvError::Corrupted(msg.into())
    }
}

pub type KvResult<T> = Result<T, KvError>;
