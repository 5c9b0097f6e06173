//! Prefix-scoped views over a [`RecordWrapper`].
//!
//! A broker or watcher created with prefix `p` turns every caller key `k`
//! into `p + k` on the way in and strips `p` from keys on the way out. The
//! prefix is concatenated as-is; callers that want a bucket boundary end it
//! with the separator (`"config/"`).
//!
//! Brokers with disjoint prefixes never see each other's keys. Overlapping
//! prefixes (`"a/"` and `"a/b/"`) share keys and both observe their changes.

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::client::KeyIterator;
use crate::error::{KvError, KvResult};
use crate::record::{RecordChange, RecordIterator, RecordTxn, RecordWrapper};
use crate::serializer::{JsonSerializer, Serializer};
use crate::watch::WatchHandle;

fn strip(prefix: &str, key: String) -> KvResult<String> {
    match key.strip_prefix(prefix) {
        Some(rest) => Ok(rest.to_string()),
        None => Err(KvError::corrupted(format!(
            "listed key {} lies outside prefix {}",
            key, prefix
        ))),
    }
}

/// Reads and writes records under a fixed key prefix.
pub struct PrefixedBroker<T, S = JsonSerializer> {
    records: RecordWrapper<T, S>,
    prefix: String,
}

impl<T, S: Clone> Clone for PrefixedBroker<T, S> {
    fn clone(&self) -> Self {
        Self {
            records: self.records.clone(),
            prefix: self.prefix.clone(),
        }
    }
}

impl<T, S> PrefixedBroker<T, S>
where
    T: Serialize + DeserializeOwned,
    S: Serializer,
{
    pub fn new(records: RecordWrapper<T, S>, prefix: impl Into<String>) -> Self {
        Self {
            records,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    fn full_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    pub fn put(&self, key: &str, record: &T) -> KvResult<()> {
        self.records.put(&self.full_key(key), record)
    }

    pub fn get(&self, key: &str) -> KvResult<Option<T>> {
        self.records.get(&self.full_key(key))
    }

    pub fn delete(&self, key: &str) -> KvResult<bool> {
        self.records.delete(&self.full_key(key))
    }

    /// Removes every key under `prefix + key_prefix`.
    pub fn delete_prefix(&self, key_prefix: &str) -> KvResult<usize> {
        self.records.delete_prefix(&self.full_key(key_prefix))
    }

    /// Lists keys under `prefix + key_prefix`, relative to the broker prefix.
    pub fn list_keys(&self, key_prefix: &str) -> KvResult<BrokerKeyIterator> {
        Ok(BrokerKeyIterator {
            inner: self.records.list_keys(&self.full_key(key_prefix))?,
            prefix: self.prefix.clone(),
        })
    }

    /// Lists records under `prefix + key_prefix`, keyed relative to the
    /// broker prefix.
    pub fn list_values(&self, key_prefix: &str) -> KvResult<BrokerValueIterator<T, S>> {
        Ok(BrokerValueIterator {
            inner: self.records.list_values(&self.full_key(key_prefix))?,
            prefix: self.prefix.clone(),
        })
    }

    /// Starts a batch of writes under the broker prefix.
    pub fn new_txn(&self) -> BrokerTxn<'_, T, S> {
        BrokerTxn {
            txn: self.records.new_txn(),
            prefix: &self.prefix,
        }
    }
}

/// Keys listed by a [`PrefixedBroker`], with the broker prefix removed.
pub struct BrokerKeyIterator {
    inner: KeyIterator,
    prefix: String,
}

impl Iterator for BrokerKeyIterator {
    type Item = KvResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        let key = self.inner.next()?;
        Some(key.and_then(|key| strip(&self.prefix, key)))
    }
}

/// Records listed by a [`PrefixedBroker`], with the broker prefix removed.
pub struct BrokerValueIterator<T, S = JsonSerializer> {
    inner: RecordIterator<T, S>,
    prefix: String,
}

impl<T, S> Iterator for BrokerValueIterator<T, S>
where
    T: DeserializeOwned,
    S: Serializer,
{
    type Item = KvResult<(String, T)>;

    fn next(&mut self) -> Option<Self::Item> {
        let entry = self.inner.next()?;
        Some(entry.and_then(|(key, record)| Ok((strip(&self.prefix, key)?, record))))
    }
}

/// A [`RecordTxn`] whose keys are relative to a broker prefix.
#[must_use = "a transaction does nothing until committed"]
pub struct BrokerTxn<'a, T, S = JsonSerializer> {
    txn: RecordTxn<'a, T, S>,
    prefix: &'a str,
}

impl<'a, T, S> BrokerTxn<'a, T, S>
where
    T: Serialize,
    S: Serializer,
{
    pub fn put(&mut self, key: &str, record: &T) -> KvResult<&mut Self> {
        self.txn.put(format!("{}{}", self.prefix, key), record)?;
        Ok(self)
    }

    pub fn delete(&mut self, key: &str) -> &mut Self {
        self.txn.delete(format!("{}{}", self.prefix, key));
        self
    }

    pub fn commit(self) -> KvResult<()> {
        self.txn.commit()
    }
}

/// Delivers decoded changes under a fixed key prefix.
pub struct PrefixedWatcher<T, S = JsonSerializer> {
    records: RecordWrapper<T, S>,
    prefix: String,
}

impl<T, S> PrefixedWatcher<T, S>
where
    T: Serialize + DeserializeOwned,
    S: Serializer,
{
    pub fn new(records: RecordWrapper<T, S>, prefix: impl Into<String>) -> Self {
        Self {
            records,
            prefix: prefix.into(),
        }
    }

    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Watches `prefix + key_prefix`. Keys handed to `callback` are relative
    /// to the watcher prefix.
    pub fn watch<F>(&self, key_prefix: &str, callback: F) -> KvResult<WatchHandle>
    where
        T: 'static,
        F: Fn(KvResult<RecordChange<T>>) + Send + Sync + 'static,
    {
        let prefix = self.prefix.clone();
        let full = format!("{}{}", self.prefix, key_prefix);
        self.records.watch(&full, move |change| {
            callback(change.and_then(|mut change| {
                change.key = strip(&prefix, change.key)?;
                Ok(change)
            }))
        })
    }
}
