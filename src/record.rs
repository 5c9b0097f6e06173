//! Typed records on top of the raw client.
//!
//! [`RecordWrapper`] mirrors the [`RawClient`] operations but takes and returns
//! records, encoding on the way in and decoding on the way out. Decoding
//! always produces a fresh value, so a failed `get` never leaves a half-filled
//! record behind.

use std::marker::PhantomData;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use crate::broker::{PrefixedBroker, PrefixedWatcher};
use crate::client::{KeyIterator, RawClient, RawTxn, ValueIterator};
use crate::error::{KvError, KvResult};
use crate::serializer::{JsonSerializer, Serializer};
use crate::watch::{ChangeKind, WatchEvent, WatchHandle};

/// A committed change, decoded into records.
#[derive(Clone, Debug, PartialEq)]
pub struct RecordChange<T> {
    pub kind: ChangeKind,
    pub key: String,

    /// New record, `None` for deletes
    pub value: Option<T>,

    /// Record before the change, if the key existed
    pub prev_value: Option<T>,

    pub revision: i64,
}

/// Record-level facade over a [`RawClient`].
pub struct RecordWrapper<T, S = JsonSerializer> {
    client: Arc<RawClient>,
    serializer: S,
    _record: PhantomData<fn() -> T>,
}

impl<T, S: Clone> Clone for RecordWrapper<T, S> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            serializer: self.serializer.clone(),
            _record: PhantomData,
        }
    }
}

impl<T, S> RecordWrapper<T, S>
where
    T: Serialize + DeserializeOwned,
    S: Serializer,
{
    pub fn new(client: Arc<RawClient>, serializer: S) -> Self {
        Self {
            client,
            serializer,
            _record: PhantomData,
        }
    }

    pub fn client(&self) -> &Arc<RawClient> {
        &self.client
    }

    pub fn serializer(&self) -> &S {
        &self.serializer
    }

    /// Returns the record at `key`, or `None` if it is absent.
    pub fn get(&self, key: &str) -> KvResult<Option<T>> {
        match self.client.get(key)? {
            Some(bytes) => decode(&self.serializer, key, &bytes).map(Some),
            None => Ok(None),
        }
    }

    pub fn put(&self, key: &str, record: &T) -> KvResult<()> {
        let bytes = encode(&self.serializer, key, record)?;
        self.client.put(key, &bytes)
    }

    /// Removes `key`. Returns whether it existed.
    pub fn delete(&self, key: &str) -> KvResult<bool> {
        self.client.delete(key)
    }

    pub fn delete_prefix(&self, prefix: &str) -> KvResult<usize> {
        self.client.delete_prefix(prefix)
    }

    pub fn list_keys(&self, prefix: &str) -> KvResult<KeyIterator> {
        self.client.list_keys(prefix)
    }

    /// Lists decoded `(key, record)` pairs. A record that fails to decode is
    /// yielded as an error and iteration continues with the next key.
    pub fn list_values(&self, prefix: &str) -> KvResult<RecordIterator<T, S>> {
        Ok(RecordIterator {
            inner: self.client.list_values(prefix)?,
            serializer: self.serializer.clone(),
            _record: PhantomData,
        })
    }

    /// Calls `callback` with decoded changes for keys starting with `prefix`.
    ///
    /// A new value that cannot be decoded reaches the callback as
    /// `Err(KvError::Decode { .. })`; the watch stays registered. A previous
    /// value that cannot be decoded is reported as `prev_value: None`.
    pub fn watch<F>(&self, prefix: &str, callback: F) -> KvResult<WatchHandle>
    where
        T: 'static,
        F: Fn(KvResult<RecordChange<T>>) + Send + Sync + 'static,
    {
        let serializer = self.serializer.clone();
        self.client
            .watch(prefix, move |event| callback(decode_event(&serializer, event)))
    }

    /// Starts a batch of record writes committed atomically.
    pub fn new_txn(&self) -> RecordTxn<'_, T, S> {
        RecordTxn {
            txn: self.client.new_txn(),
            serializer: &self.serializer,
            _record: PhantomData,
        }
    }

    /// A broker confined to keys starting with `prefix`.
    pub fn new_broker(&self, prefix: impl Into<String>) -> PrefixedBroker<T, S> {
        PrefixedBroker::new(self.clone(), prefix)
    }

    /// A watcher confined to keys starting with `prefix`.
    pub fn new_watcher(&self, prefix: impl Into<String>) -> PrefixedWatcher<T, S> {
        PrefixedWatcher::new(self.clone(), prefix)
    }
}

fn encode<T: Serialize, S: Serializer>(serializer: &S, key: &str, record: &T) -> KvResult<Vec<u8>> {
    serializer.marshal(record).map_err(|source| KvError::Encode {
        key: key.to_string(),
        source,
    })
}

fn decode<T: DeserializeOwned, S: Serializer>(serializer: &S, key: &str, bytes: &[u8]) -> KvResult<T> {
    serializer.unmarshal(bytes).map_err(|source| KvError::Decode {
        key: key.to_string(),
        source,
    })
}

fn decode_event<T: DeserializeOwned, S: Serializer>(
    serializer: &S,
    event: &WatchEvent,
) -> KvResult<RecordChange<T>> {
    let value = event
        .value
        .as_deref()
        .map(|b| decode(serializer, &event.key, b))
        .transpose()?;

    // The previous value may predate the record type; it never hides the new one.
    let prev_value = match event.prev_value.as_deref() {
        Some(b) => decode(serializer, &event.key, b).map(Some).unwrap_or_else(|e| {
            debug!(key = %event.key, error = %e, "Dropping undecodable previous value");
            None
        }),
        None => None,
    };

    Ok(RecordChange {
        kind: event.kind,
        key: event.key.clone(),
        value,
        prev_value,
        revision: event.revision,
    })
}

/// Lazy iterator over decoded records. Holds a read transaction until dropped.
pub struct RecordIterator<T, S = JsonSerializer> {
    inner: ValueIterator,
    serializer: S,
    _record: PhantomData<fn() -> T>,
}

impl<T, S> RecordIterator<T, S> {
    /// Releases the read transaction.
    pub fn close(self) {}
}

impl<T, S> Iterator for RecordIterator<T, S>
where
    T: DeserializeOwned,
    S: Serializer,
{
    type Item = KvResult<(String, T)>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.inner.next()?;
        Some(entry.and_then(|(key, bytes)| {
            let record = decode(&self.serializer, &key, &bytes)?;
            Ok((key, record))
        }))
    }
}

/// A batch of record writes committed in one write transaction.
#[must_use = "a transaction does nothing until committed"]
pub struct RecordTxn<'a, T, S = JsonSerializer> {
    txn: RawTxn<'a>,
    serializer: &'a S,
    _record: PhantomData<fn() -> T>,
}

impl<'a, T, S> RecordTxn<'a, T, S>
where
    T: Serialize,
    S: Serializer,
{
    /// Encodes `record` and queues it. Encoding errors are reported here,
    /// before anything is written.
    pub fn put(&mut self, key: impl Into<String>, record: &T) -> KvResult<&mut Self> {
        let key = key.into();
        let bytes = encode(self.serializer, &key, record)?;
        self.txn.put(key, bytes);
        Ok(self)
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.txn.delete(key);
        self
    }

    pub fn len(&self) -> usize {
        self.txn.len()
    }

    pub fn is_empty(&self) -> bool {
        self.txn.is_empty()
    }

    pub fn commit(self) -> KvResult<()> {
        self.txn.commit()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StoreConfig;
    use crate::serializer::CodecError;
    use parking_lot::Mutex;
    use serde::Deserialize;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Interface {
        name: String,
        mtu: u32,
        enabled: bool,
    }

    fn eth(mtu: u32) -> Interface {
        Interface {
            name: "eth0".to_string(),
            mtu,
            enabled: true,
        }
    }

    fn open_records(temp_dir: &TempDir) -> RecordWrapper<Interface> {
        let config = StoreConfig::new(temp_dir.path().join("db"));
        let client = Arc::new(RawClient::open(&config).unwrap());
        RecordWrapper::new(client, JsonSerializer::new())
    }

    /// Writes a fixed payload and never decodes.
    #[derive(Clone)]
    struct WriteOnlySerializer;

    impl Serializer for WriteOnlySerializer {
        fn marshal<T: Serialize>(&self, _record: &T) -> Result<Vec<u8>, CodecError> {
            Ok(b"opaque".to_vec())
        }

        fn unmarshal<T: DeserializeOwned>(&self, _data: &[u8]) -> Result<T, CodecError> {
            Err("cannot decode".into())
        }
    }

    #[test]
    fn test_put_get_record() {
        let temp_dir = TempDir::new().unwrap();
        let records = open_records(&temp_dir);

        records.put("vpp/interfaces/eth0", &eth(1500)).unwrap();
        assert_eq!(records.get("vpp/interfaces/eth0").unwrap(), Some(eth(1500)));
        assert_eq!(records.get("vpp/interfaces/eth1").unwrap(), None);
    }

    #[test]
    fn test_stored_bytes_are_json() {
        let temp_dir = TempDir::new().unwrap();
        let records = open_records(&temp_dir);

        records.put("if", &eth(9000)).unwrap();
        let raw = records.client().get("if").unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_slice(&raw).unwrap();
        assert_eq!(value["mtu"], 9000);
    }

    #[test]
    fn test_get_decode_error() {
        let temp_dir = TempDir::new().unwrap();
        let records = open_records(&temp_dir);

        records.client().put("broken", b"not json").unwrap();
        match records.get("broken") {
            Err(KvError::Decode { key, .. }) => assert_eq!(key, "broken"),
            other => panic!("expected decode error, got {:?}", other),
        }
    }

    #[test]
    fn test_list_values_reports_bad_entries() {
        let temp_dir = TempDir::new().unwrap();
        let records = open_records(&temp_dir);

        records.put("if/a", &eth(1500)).unwrap();
        records.client().put("if/b", b"{").unwrap();
        records.put("if/c", &eth(9000)).unwrap();

        let results: Vec<KvResult<(String, Interface)>> = records.list_values("if/").unwrap().collect();
        assert_eq!(results.len(), 3);
        let good: Vec<String> = results
            .iter()
            .filter_map(|r| r.as_ref().ok().map(|(k, _)| k.clone()))
            .collect();
        assert_eq!(good.len(), 2);
        assert!(results
            .iter()
            .any(|r| matches!(r, Err(KvError::Decode { key, .. }) if key == "if/b")));
    }

    #[test]
    fn test_watch_decodes_changes() {
        let temp_dir = TempDir::new().unwrap();
        let records = open_records(&temp_dir);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _handle = records
            .watch("if/", move |change| sink.lock().push(change))
            .unwrap();

        records.put("if/eth0", &eth(1500)).unwrap();
        records.client().put("if/bad", b"garbage").unwrap();
        records.put("if/eth0", &eth(9000)).unwrap();
        records.delete("if/eth0").unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 4);

        let first = seen[0].as_ref().unwrap();
        assert_eq!(first.kind, ChangeKind::Put);
        assert_eq!(first.value, Some(eth(1500)));

        assert!(matches!(&seen[1], Err(KvError::Decode { key, .. }) if key == "if/bad"));

        let update = seen[2].as_ref().unwrap();
        assert_eq!(update.prev_value, Some(eth(1500)));
        assert_eq!(update.value, Some(eth(9000)));

        let delete = seen[3].as_ref().unwrap();
        assert_eq!(delete.kind, ChangeKind::Delete);
        assert_eq!(delete.value, None);
        assert_eq!(delete.prev_value, Some(eth(9000)));
    }

    #[test]
    fn test_watch_tolerates_undecodable_previous_value() {
        let temp_dir = TempDir::new().unwrap();
        let records = open_records(&temp_dir);

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _handle = records
            .watch("if/", move |change| sink.lock().push(change))
            .unwrap();

        records.client().put("if/eth0", b"legacy").unwrap();
        records.put("if/eth0", &eth(1500)).unwrap();
        records.delete("if/eth0").unwrap();
        records.client().put("if/eth1", b"legacy").unwrap();
        records.delete("if/eth1").unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 5);
        assert!(seen[0].is_err());

        let repaired = seen[1].as_ref().unwrap();
        assert_eq!(repaired.value, Some(eth(1500)));
        assert_eq!(repaired.prev_value, None);

        let delete = seen[2].as_ref().unwrap();
        assert_eq!(delete.prev_value, Some(eth(1500)));

        let legacy_delete = seen[4].as_ref().unwrap();
        assert_eq!(legacy_delete.kind, ChangeKind::Delete);
        assert_eq!(legacy_delete.value, None);
        assert_eq!(legacy_delete.prev_value, None);
    }

    #[test]
    fn test_custom_serializer() {
        let temp_dir = TempDir::new().unwrap();
        let config = StoreConfig::new(temp_dir.path().join("db"));
        let client = Arc::new(RawClient::open(&config).unwrap());
        let records: RecordWrapper<Interface, _> = RecordWrapper::new(client, WriteOnlySerializer);

        records.put("k", &eth(1500)).unwrap();
        assert_eq!(records.client().get("k").unwrap(), Some(b"opaque".to_vec()));
        assert!(matches!(records.get("k"), Err(KvError::Decode { .. })));
    }

    #[test]
    fn test_record_txn() {
        let temp_dir = TempDir::new().unwrap();
        let records = open_records(&temp_dir);
        records.put("if/old", &eth(1)).unwrap();

        let mut txn = records.new_txn();
        txn.put("if/eth0", &eth(1500)).unwrap().put("if/eth1", &eth(9000)).unwrap();
        txn.delete("if/old");
        assert_eq!(txn.len(), 3);
        txn.commit().unwrap();

        assert_eq!(records.get("if/eth1").unwrap(), Some(eth(9000)));
        assert_eq!(records.get("if/old").unwrap(), None);
    }
}
