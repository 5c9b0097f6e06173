//! Raw client: the byte-level facade over the bucket store.
//!
//! Every operation maps its logical key through the [`KeyMapper`] and runs in
//! its own transaction:
//!
//! - `get` runs in a short read transaction. A missing bucket means the key is
//!   absent, not an error
//! - `put` creates the missing buckets along the path and sets the leaf key in
//!   one write transaction
//! - `delete` removes the leaf key and leaves the buckets in place, even
//!   when they become empty
//! - `list_keys` / `list_values` return lazy iterators holding a read
//!   transaction until they are dropped
//!
//! Committed changes are handed to the [`WatchHub`] before the writer lock is
//! released and delivered right after it.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::StoreConfig;
use crate::error::{KvError, KvResult};
use crate::storage::{
    Backend, Cursor, CursorItem, KeyMapper, ReadBucket, ReadTxn, TxResult, WriteBucket,
    WriteGuard, WriteTxn, ROOT_BUCKET,
};
use crate::watch::{ChangeKind, WatchEvent, WatchHandle, WatchHub};

/// Lifecycle state of a store.
///
/// `Open` and `Disabled` are reached once, at construction. `Closed` follows
/// `Open` after [`RawClient::close`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Open,
    /// No configuration was available and no database was opened.
    Disabled,
    Closed,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Open => f.write_str("open"),
            ConnectionState::Disabled => f.write_str("disabled"),
            ConnectionState::Closed => f.write_str("closed"),
        }
    }
}

enum Connection {
    Open(Arc<Backend>),
    Disabled,
    Closed,
}

/// A write queued in a [`RawTxn`].
#[derive(Clone, Debug, PartialEq, Eq)]
enum TxnOp {
    Put { key: String, value: Vec<u8> },
    Delete { key: String },
}

impl TxnOp {
    fn key(&self) -> &str {
        match self {
            TxnOp::Put { key, .. } | TxnOp::Delete { key } => key,
        }
    }
}

/// Byte-level client over the bucket store.
pub struct RawClient {
    connection: RwLock<Connection>,
    mapper: KeyMapper,
    hub: Arc<WatchHub>,
}

impl RawClient {
    /// Opens the database described by `config`.
    pub fn open(config: &StoreConfig) -> KvResult<Self> {
        config.validate()?;
        let backend = Backend::open(config.backend_config())?;

        info!(
            "Bucket store opened at {:?} (separator {:?})",
            config.db_path, config.bucket_separator
        );

        Ok(Self {
            connection: RwLock::new(Connection::Open(Arc::new(backend))),
            mapper: KeyMapper::new(config.bucket_separator.clone()),
            hub: WatchHub::new(),
        })
    }

    /// A client that never opened a database. Every operation fails with
    /// [`KvError::NotAvailable`].
    pub fn disabled() -> Self {
        Self {
            connection: RwLock::new(Connection::Disabled),
            mapper: KeyMapper::default(),
            hub: WatchHub::new(),
        }
    }

    pub fn state(&self) -> ConnectionState {
        match &*self.connection.read() {
            Connection::Open(_) => ConnectionState::Open,
            Connection::Disabled => ConnectionState::Disabled,
            Connection::Closed => ConnectionState::Closed,
        }
    }

    pub fn mapper(&self) -> &KeyMapper {
        &self.mapper
    }

    fn backend(&self) -> KvResult<Arc<Backend>> {
        match &*self.connection.read() {
            Connection::Open(backend) => Ok(Arc::clone(backend)),
            Connection::Disabled => Err(KvError::NotAvailable(ConnectionState::Disabled)),
            Connection::Closed => Err(KvError::NotAvailable(ConnectionState::Closed)),
        }
    }

    /// Returns the value stored at `key`, or `None` if it is absent.
    pub fn get(&self, key: &str) -> KvResult<Option<Vec<u8>>> {
        let backend = self.backend()?;
        let (buckets, leaf) = self.mapper.map_key(key)?;

        backend.view(|txn| {
            let Some(bucket) = find_bucket(txn.root(), &buckets)? else {
                return Ok(None);
            };
            Ok(bucket.get(leaf)?.map(|value| value.to_vec()))
        })
    }

    /// Stores `value` at `key`, creating the buckets along the path.
    pub fn put(&self, key: &str, value: &[u8]) -> KvResult<()> {
        self.commit(vec![TxnOp::Put {
            key: key.to_string(),
            value: value.to_vec(),
        }])?;
        Ok(())
    }

    /// Removes `key`. Returns whether it existed.
    pub fn delete(&self, key: &str) -> KvResult<bool> {
        let events = self.commit(vec![TxnOp::Delete {
            key: key.to_string(),
        }])?;
        Ok(!events.is_empty())
    }

    /// Removes every key starting with `prefix` in one write transaction.
    /// Returns the number of keys removed.
    pub fn delete_prefix(&self, prefix: &str) -> KvResult<usize> {
        let backend = self.backend()?;
        let writer = backend.writer();

        let mut traversal = Traversal::new(writer.tree(), &self.mapper, prefix)?;
        let mut ops = Vec::new();
        while let Some(entry) = traversal.next(writer.tree(), &self.mapper) {
            let (key, _) = entry?;
            ops.push(TxnOp::Delete { key });
        }

        let events = self.apply(&writer, &ops)?;
        let removed = events.len();
        self.publish(writer, events);

        debug!(prefix, removed, "Deleted keys by prefix");
        Ok(removed)
    }

    /// Lists the keys starting with `prefix`.
    ///
    /// The iterator holds a read transaction until it is dropped; writers wait
    /// for it. Reads from the same thread still proceed, but do not write from
    /// the same thread while it is alive.
    pub fn list_keys(&self, prefix: &str) -> KvResult<KeyIterator> {
        Ok(KeyIterator {
            inner: self.list_values(prefix)?,
        })
    }

    /// Lists the `(key, value)` pairs whose key starts with `prefix`.
    /// See [`RawClient::list_keys`] for the transaction lifetime.
    pub fn list_values(&self, prefix: &str) -> KvResult<ValueIterator> {
        let backend = self.backend()?;
        let txn = backend.begin_read();
        let traversal = Traversal::new(txn.tree(), &self.mapper, prefix)?;

        Ok(ValueIterator {
            txn,
            mapper: self.mapper.clone(),
            traversal,
        })
    }

    /// Calls `callback` for every committed put or delete of a key starting
    /// with `prefix`.
    ///
    /// The callback runs synchronously on the committing thread after the
    /// commit and before that write returns, in commit order. A slow callback
    /// delays later writers until it returns.
    pub fn watch<F>(&self, prefix: &str, callback: F) -> KvResult<WatchHandle>
    where
        F: Fn(&WatchEvent) + Send + Sync + 'static,
    {
        self.backend()?;
        if prefix.contains('\0') {
            return Err(KvError::malformed(prefix, "prefix contains a NUL byte"));
        }
        Ok(self.hub.register(prefix, Arc::new(callback)))
    }

    /// Like [`RawClient::watch`], forwarding events into a channel for async
    /// consumers.
    pub fn watch_channel(
        &self,
        prefix: &str,
    ) -> KvResult<(WatchHandle, mpsc::UnboundedReceiver<WatchEvent>)> {
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = self.watch(prefix, move |event| {
            if tx.send(event.clone()).is_err() {
                warn!(key = %event.key, "Watch receiver dropped, discarding event");
            }
        })?;
        Ok((handle, rx))
    }

    /// Starts a batch of writes committed atomically.
    pub fn new_txn(&self) -> RawTxn<'_> {
        RawTxn {
            client: self,
            ops: Vec::new(),
        }
    }

    /// Revision of the last committed change.
    pub fn revision(&self) -> KvResult<i64> {
        self.backend()?.revision()
    }

    /// Closes the store. Later operations fail with `NotAvailable`, watch
    /// registrations are dropped. Closing twice is a no-op.
    pub fn close(&self) -> KvResult<()> {
        let backend = {
            let mut connection = self.connection.write();
            match std::mem::replace(&mut *connection, Connection::Closed) {
                Connection::Open(backend) => backend,
                other => {
                    *connection = other;
                    return Ok(());
                }
            }
        };

        self.hub.clear();
        backend.close()
    }

    fn commit(&self, ops: Vec<TxnOp>) -> KvResult<Vec<WatchEvent>> {
        let backend = self.backend()?;
        let writer = backend.writer();
        let events = self.apply(&writer, &ops)?;
        self.publish(writer, events.clone());
        Ok(events)
    }

    /// Applies `ops` in one write transaction and returns the resulting events.
    fn apply(&self, writer: &WriteGuard<'_>, ops: &[TxnOp]) -> KvResult<Vec<WatchEvent>> {
        let mapped = ops
            .iter()
            .map(|op| self.mapper.map_key(op.key()))
            .collect::<KvResult<Vec<_>>>()?;

        writer.update(|tx| {
            let mut events = Vec::with_capacity(ops.len());

            for (op, (buckets, leaf)) in ops.iter().zip(&mapped) {
                match op {
                    TxnOp::Put { key, value } => {
                        let bucket = create_path(tx, buckets)?;
                        let prev = bucket.put(leaf, value)?;
                        events.push(WatchEvent {
                            kind: ChangeKind::Put,
                            key: key.clone(),
                            value: Some(value.clone()),
                            prev_value: prev.map(|v| v.to_vec()),
                            revision: 0,
                        });
                    }
                    TxnOp::Delete { key } => {
                        let Some(bucket) = find_write_bucket(tx, buckets)? else {
                            continue;
                        };
                        if let Some(prev) = bucket.delete(leaf)? {
                            events.push(WatchEvent {
                                kind: ChangeKind::Delete,
                                key: key.clone(),
                                value: None,
                                prev_value: Some(prev.to_vec()),
                                revision: 0,
                            });
                        }
                    }
                }
            }

            if !events.is_empty() {
                let revision = tx.next_revision()?;
                for event in &mut events {
                    event.revision = revision;
                }
            }
            Ok(events)
        })
    }

    /// Queues `events` while the writer lock is still held, then releases it
    /// and delivers.
    fn publish(&self, writer: WriteGuard<'_>, events: Vec<WatchEvent>) {
        if let Some(last) = events.last() {
            debug!(changes = events.len(), revision = last.revision, "Committed write transaction");
        }
        self.hub.enqueue(events);
        drop(writer);
        self.hub.dispatch();
    }
}

/// Follows `path` from `bucket`, returning `None` at the first missing bucket.
fn find_bucket<'t, S: AsRef<str>>(
    bucket: ReadBucket<'t>,
    path: &[S],
) -> KvResult<Option<ReadBucket<'t>>> {
    let mut current = bucket;
    for name in path {
        match current.bucket(name.as_ref())? {
            Some(next) => current = next,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

fn find_write_bucket<'t>(tx: &WriteTxn<'t>, path: &[&str]) -> TxResult<Option<WriteBucket<'t>>> {
    let mut current = tx.root();
    for name in path {
        match current.bucket(name)? {
            Some(next) => current = next,
            None => return Ok(None),
        }
    }
    Ok(Some(current))
}

fn create_path<'t>(tx: &WriteTxn<'t>, path: &[&str]) -> TxResult<WriteBucket<'t>> {
    let mut current = tx.root();
    for name in path {
        current = current.create_bucket_if_not_exists(name)?;
    }
    Ok(current)
}

/// One bucket being walked by a [`Traversal`].
struct Frame {
    /// Logical prefix of every key in this bucket
    base: String,
    cursor: Cursor,
    /// Only the starting bucket needs its children checked against the prefix
    filtered: bool,
}

/// Depth-first walk over the keys starting with a prefix.
struct Traversal {
    prefix: String,
    stack: Vec<Frame>,
}

impl Traversal {
    fn new(tree: &sled::Tree, mapper: &KeyMapper, prefix: &str) -> KvResult<Self> {
        let (buckets, partial) = mapper.split_prefix(prefix)?;

        let root = ReadBucket::new(tree, ROOT_BUCKET);
        let stack = match find_bucket(root, &buckets)? {
            Some(start) => vec![Frame {
                base: mapper.bucket_prefix(&buckets),
                cursor: start.cursor_prefix(mapper.scan_name_prefix(partial)),
                filtered: true,
            }],
            None => Vec::new(),
        };

        Ok(Self {
            prefix: prefix.to_string(),
            stack,
        })
    }

    fn next(&mut self, tree: &sled::Tree, mapper: &KeyMapper) -> Option<KvResult<(String, Vec<u8>)>> {
        loop {
            let frame = self.stack.last_mut()?;
            let item = match frame.cursor.next() {
                Some(Ok(item)) => item,
                Some(Err(e)) => return Some(Err(e)),
                None => {
                    self.stack.pop();
                    continue;
                }
            };

            match item {
                CursorItem::Value { name, value } => {
                    let key = format!("{}{}", frame.base, name);
                    if frame.filtered && !key.starts_with(self.prefix.as_str()) {
                        continue;
                    }
                    return Some(Ok((key, value.to_vec())));
                }
                CursorItem::Bucket { name, id } => {
                    let base = format!("{}{}{}", frame.base, name, mapper.separator());
                    if frame.filtered && !base.starts_with(self.prefix.as_str()) {
                        continue;
                    }
                    self.stack.push(Frame {
                        base,
                        cursor: Cursor::open(tree, id, ""),
                        filtered: false,
                    });
                }
            }
        }
    }
}

/// Lazy iterator over `(key, value)` pairs. Holds a read transaction until
/// dropped.
pub struct ValueIterator {
    txn: ReadTxn,
    mapper: KeyMapper,
    traversal: Traversal,
}

impl ValueIterator {
    /// Releases the read transaction.
    pub fn close(self) {}
}

impl Iterator for ValueIterator {
    type Item = KvResult<(String, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        self.traversal.next(self.txn.tree(), &self.mapper)
    }
}

/// Lazy iterator over keys. Holds a read transaction until dropped.
pub struct KeyIterator {
    inner: ValueIterator,
}

impl KeyIterator {
    /// Releases the read transaction.
    pub fn close(self) {}
}

impl Iterator for KeyIterator {
    type Item = KvResult<String>;

    fn next(&mut self) -> Option<Self::Item> {
        self.inner.next().map(|entry| entry.map(|(key, _)| key))
    }
}

/// A batch of puts and deletes committed in one write transaction.
///
/// Watchers see the changes in the order they were added, all with the same
/// revision.
#[must_use = "a transaction does nothing until committed"]
pub struct RawTxn<'a> {
    client: &'a RawClient,
    ops: Vec<TxnOp>,
}

impl<'a> RawTxn<'a> {
    pub fn put(&mut self, key: impl Into<String>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.ops.push(TxnOp::Put {
            key: key.into(),
            value: value.into(),
        });
        self
    }

    pub fn delete(&mut self, key: impl Into<String>) -> &mut Self {
        self.ops.push(TxnOp::Delete { key: key.into() });
        self
    }

    pub fn len(&self) -> usize {
        self.ops.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Commits every queued write, or none of them.
    pub fn commit(self) -> KvResult<()> {
        if self.ops.is_empty() {
            return Ok(());
        }
        self.client.commit(self.ops)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    fn open_client(temp_dir: &TempDir, separator: &str) -> RawClient {
        let config = StoreConfig::new(temp_dir.path().join("db")).with_separator(separator);
        RawClient::open(&config).unwrap()
    }

    fn keys(client: &RawClient, prefix: &str) -> Vec<String> {
        let mut keys: Vec<String> = client
            .list_keys(prefix)
            .unwrap()
            .collect::<KvResult<_>>()
            .unwrap();
        keys.sort();
        keys
    }

    #[test]
    fn test_put_get() {
        let temp_dir = TempDir::new().unwrap();
        let client = open_client(&temp_dir, "/");

        client.put("a/b/c", b"value").unwrap();
        assert_eq!(client.get("a/b/c").unwrap(), Some(b"value".to_vec()));
        assert_eq!(client.get("a/b/d").unwrap(), None);
        assert_eq!(client.get("x/y").unwrap(), None);
    }

    #[test]
    fn test_put_overwrites() {
        let temp_dir = TempDir::new().unwrap();
        let client = open_client(&temp_dir, "/");

        client.put("k", b"v1").unwrap();
        client.put("k", b"v2").unwrap();
        assert_eq!(client.get("k").unwrap(), Some(b"v2".to_vec()));
    }

    #[test]
    fn test_delete() {
        let temp_dir = TempDir::new().unwrap();
        let client = open_client(&temp_dir, "/");

        client.put("a/b", b"v").unwrap();
        assert!(client.delete("a/b").unwrap());
        assert_eq!(client.get("a/b").unwrap(), None);
        assert!(!client.delete("a/b").unwrap());
        assert!(!client.delete("missing/bucket/key").unwrap());
    }

    #[test]
    fn test_delete_keeps_buckets() {
        let temp_dir = TempDir::new().unwrap();
        let client = open_client(&temp_dir, "/");

        client.put("a/b/c", b"v").unwrap();
        client.delete("a/b/c").unwrap();

        let backend = client.backend().unwrap();
        let still_there = backend
            .view(|txn| Ok(find_bucket(txn.root(), &["a", "b"])?.is_some()))
            .unwrap();
        assert!(still_there);
    }

    #[test]
    fn test_malformed_key() {
        let temp_dir = TempDir::new().unwrap();
        let client = open_client(&temp_dir, "/");

        assert!(matches!(client.put("a/", b"v"), Err(KvError::MalformedKey { .. })));
        assert!(matches!(client.get(""), Err(KvError::MalformedKey { .. })));
    }

    #[test]
    fn test_list_keys_by_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let client = open_client(&temp_dir, "/");

        for key in ["a/b/c", "a/b/d", "a/x", "ab", "abc/d", "b/c"] {
            client.put(key, key.as_bytes()).unwrap();
        }

        assert_eq!(keys(&client, "a/"), vec!["a/b/c", "a/b/d", "a/x"]);
        assert_eq!(keys(&client, "a/b"), vec!["a/b/c", "a/b/d"]);
        assert_eq!(keys(&client, "ab"), vec!["ab", "abc/d"]);
        assert_eq!(keys(&client, "").len(), 6);
        assert!(keys(&client, "zzz/").is_empty());
    }

    #[test]
    fn test_list_values() {
        let temp_dir = TempDir::new().unwrap();
        let client = open_client(&temp_dir, "/");

        client.put("svc/one", b"1").unwrap();
        client.put("svc/two", b"2").unwrap();

        let mut values: Vec<(String, Vec<u8>)> = client
            .list_values("svc/")
            .unwrap()
            .collect::<KvResult<_>>()
            .unwrap();
        values.sort();
        assert_eq!(
            values,
            vec![
                ("svc/one".to_string(), b"1".to_vec()),
                ("svc/two".to_string(), b"2".to_vec()),
            ]
        );
    }

    #[test]
    fn test_value_and_bucket_with_same_name() {
        let temp_dir = TempDir::new().unwrap();
        let client = open_client(&temp_dir, "/");

        client.put("a/b", b"leaf").unwrap();
        client.put("a/b/c", b"nested").unwrap();

        assert_eq!(client.get("a/b").unwrap(), Some(b"leaf".to_vec()));
        assert_eq!(keys(&client, "a/"), vec!["a/b", "a/b/c"]);
    }

    #[test]
    fn test_flat_separator() {
        let temp_dir = TempDir::new().unwrap();
        let client = open_client(&temp_dir, "");

        client.put("a/b/c", b"v").unwrap();
        client.put("a/b/", b"trailing").unwrap();
        assert_eq!(client.get("a/b/c").unwrap(), Some(b"v".to_vec()));
        assert_eq!(keys(&client, "a/b"), vec!["a/b/", "a/b/c"]);
    }

    #[test]
    fn test_multi_char_separator_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let client = open_client(&temp_dir, "::");

        client.put("a::b", b"1").unwrap();
        client.put("a:x", b"2").unwrap();

        assert_eq!(keys(&client, "a:"), vec!["a::b", "a:x"]);
        assert_eq!(keys(&client, "a::"), vec!["a::b"]);
    }

    #[test]
    fn test_delete_prefix() {
        let temp_dir = TempDir::new().unwrap();
        let client = open_client(&temp_dir, "/");

        for key in ["a/1", "a/2", "a/b/3", "b/1"] {
            client.put(key, b"v").unwrap();
        }

        assert_eq!(client.delete_prefix("a/").unwrap(), 3);
        assert_eq!(keys(&client, ""), vec!["b/1"]);
        assert_eq!(client.delete_prefix("a/").unwrap(), 0);
    }

    #[test]
    fn test_txn_commits_atomically() {
        let temp_dir = TempDir::new().unwrap();
        let client = open_client(&temp_dir, "/");
        client.put("old", b"v").unwrap();

        let mut txn = client.new_txn();
        txn.put("x/1", b"1".to_vec()).put("x/2", b"2".to_vec()).delete("old");
        assert_eq!(txn.len(), 3);
        txn.commit().unwrap();

        assert_eq!(keys(&client, ""), vec!["x/1", "x/2"]);
    }

    #[test]
    fn test_txn_with_malformed_key_writes_nothing() {
        let temp_dir = TempDir::new().unwrap();
        let client = open_client(&temp_dir, "/");

        let mut txn = client.new_txn();
        txn.put("ok", b"1".to_vec()).put("bad/", b"2".to_vec());
        assert!(matches!(txn.commit(), Err(KvError::MalformedKey { .. })));
        assert_eq!(client.get("ok").unwrap(), None);
    }

    #[test]
    fn test_revision_counts_changing_commits() {
        let temp_dir = TempDir::new().unwrap();
        let client = open_client(&temp_dir, "/");

        assert_eq!(client.revision().unwrap(), 0);
        client.put("a", b"1").unwrap();
        client.put("b", b"2").unwrap();
        assert_eq!(client.revision().unwrap(), 2);

        // deleting a missing key changes nothing
        client.delete("missing").unwrap();
        assert_eq!(client.revision().unwrap(), 2);
    }

    #[test]
    fn test_watch_receives_matching_events() {
        let temp_dir = TempDir::new().unwrap();
        let client = open_client(&temp_dir, "/");

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _handle = client
            .watch("a/", move |event| sink.lock().push(event.clone()))
            .unwrap();

        client.put("a/1", b"one").unwrap();
        client.put("b/1", b"other").unwrap();
        client.put("a/1", b"uno").unwrap();
        client.delete("a/1").unwrap();
        client.delete("a/1").unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 3);
        assert_eq!(seen[0].kind, ChangeKind::Put);
        assert_eq!(seen[0].prev_value, None);
        assert_eq!(seen[1].value, Some(b"uno".to_vec()));
        assert_eq!(seen[1].prev_value, Some(b"one".to_vec()));
        assert_eq!(seen[2].kind, ChangeKind::Delete);
        assert_eq!(seen[2].prev_value, Some(b"uno".to_vec()));
        assert!(seen.windows(2).all(|w| w[0].revision < w[1].revision));
    }

    #[test]
    fn test_watch_sees_committed_state() {
        let temp_dir = TempDir::new().unwrap();
        let client = Arc::new(open_client(&temp_dir, "/"));

        let observed = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&observed);
        let reader = Arc::clone(&client);
        let _handle = client
            .watch("k", move |event| {
                *sink.lock() = Some(reader.get(&event.key).unwrap());
            })
            .unwrap();

        client.put("k", b"v").unwrap();
        assert_eq!(*observed.lock(), Some(Some(b"v".to_vec())));
    }

    #[test]
    fn test_write_from_callback_delivered_after() {
        let temp_dir = TempDir::new().unwrap();
        let client = Arc::new(open_client(&temp_dir, "/"));

        let order = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&order);
        let writer = Arc::clone(&client);
        let _handle = client
            .watch("", move |event| {
                sink.lock().push(format!("start {}", event.key));
                if event.key == "first" {
                    writer.put("second", b"v").unwrap();
                }
                sink.lock().push(format!("end {}", event.key));
            })
            .unwrap();

        client.put("first", b"v").unwrap();
        assert_eq!(
            *order.lock(),
            vec!["start first", "end first", "start second", "end second"]
        );
    }

    #[test]
    fn test_put_returns_after_own_callback() {
        let temp_dir = TempDir::new().unwrap();
        let client = Arc::new(open_client(&temp_dir, "/"));

        let delivered = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&delivered);
        let _handle = client
            .watch("", move |event| {
                if event.key == "slow" {
                    std::thread::sleep(std::time::Duration::from_millis(300));
                }
                sink.lock().push((event.key.clone(), std::thread::current().id()));
            })
            .unwrap();

        let slow = {
            let client = Arc::clone(&client);
            std::thread::spawn(move || client.put("slow", b"v").unwrap())
        };
        std::thread::sleep(std::time::Duration::from_millis(100));

        client.put("fast", b"v").unwrap();
        {
            let delivered = delivered.lock();
            let keys: Vec<&str> = delivered.iter().map(|(key, _)| key.as_str()).collect();
            assert_eq!(keys, vec!["slow", "fast"]);
            assert_eq!(delivered[1].1, std::thread::current().id());
        }

        slow.join().unwrap();
        assert_eq!(delivered.lock().len(), 2);
    }

    #[test]
    fn test_disabled_client() {
        let client = RawClient::disabled();
        assert_eq!(client.state(), ConnectionState::Disabled);
        assert!(matches!(
            client.get("a"),
            Err(KvError::NotAvailable(ConnectionState::Disabled))
        ));
        assert!(matches!(
            client.put("a", b"v"),
            Err(KvError::NotAvailable(ConnectionState::Disabled))
        ));
        assert!(client.list_keys("").is_err());
        assert!(client.watch("", |_| {}).is_err());

        client.close().unwrap();
        assert_eq!(client.state(), ConnectionState::Disabled);
    }

    #[test]
    fn test_close() {
        let temp_dir = TempDir::new().unwrap();
        let client = open_client(&temp_dir, "/");
        let handle = client.watch("", |_| {}).unwrap();

        client.close().unwrap();
        assert_eq!(client.state(), ConnectionState::Closed);
        assert!(!handle.is_active());
        assert!(matches!(
            client.get("a"),
            Err(KvError::NotAvailable(ConnectionState::Closed))
        ));

        client.close().unwrap();
    }
}
