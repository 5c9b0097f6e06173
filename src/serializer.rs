//! Serialization boundary between typed records and stored bytes.
//!
//! [`Serializer`] is a narrow two-method capability. [`RecordWrapper`]
//! (crate::RecordWrapper) is generic over it, so a compact binary encoding can
//! replace the default [`JsonSerializer`] without touching the wrapper.

use serde::de::DeserializeOwned;
use serde::Serialize;

/// Error produced by a serializer implementation.
pub type CodecError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Converts records to and from raw bytes.
///
/// `unmarshal` must report malformed input as an error and never panic.
pub trait Serializer: Clone + Send + Sync + 'static {
    fn marshal<T: Serialize>(&self, record: &T) -> Result<Vec<u8>, CodecError>;

    fn unmarshal<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError>;
}

/// Default serializer: JSON text.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct JsonSerializer {
    pretty: bool,
}

impl JsonSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Indented output, easier to read when inspecting a store by hand.
    pub fn pretty() -> Self {
        Self { pretty: true }
    }
}

impl Serializer for JsonSerializer {
    fn marshal<T: Serialize>(&self, record: &T) -> Result<Vec<u8>, CodecError> {
        let bytes = if self.pretty {
            serde_json::to_vec_pretty(record)?
        } else {
            serde_json::to_vec(record)?
        };
        Ok(bytes)
    }

    fn unmarshal<T: DeserializeOwned>(&self, data: &[u8]) -> Result<T, CodecError> {
        Ok(serde_json::from_slice(data)?)
    }
}
