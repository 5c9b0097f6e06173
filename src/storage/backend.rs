//! Sled-backed transactional byte store with nested buckets.
//!
//! Sled offers flat trees. This module layers a bucket hierarchy on top of a
//! single tree so that a logical key can be stored under any number of nested
//! buckets, all updated inside one atomic sled transaction:
//!
//! ```text
//! entry key:  | bucket id (u64 BE) | name bytes | 0x00 | kind (u8) |
//!
//! kind 0x00 (value)   sled value = payload
//! kind 0x01 (bucket)  sled value = child bucket id (u64 BE)
//! ```
//!
//! The root bucket has id 0 and bucket id `u64::MAX` holds metadata (the
//! bucket id sequence and the commit revision). Names never contain NUL, so
//! scanning `| id | partial |` visits exactly the children whose names start
//! with `partial`, in name order. A value and a bucket may share a name.
//!
//! Concurrency follows a single-writer, multiple-reader model:
//! - **Writers** take the exclusive side of the transaction lock for the
//!   duration of one sled transaction.
//! - **Readers** hold the shared side for as long as their [`ReadTxn`] lives,
//!   so a reader sees the state at the moment it began. The shared side is
//!   taken recursively: a thread already holding a read transaction can open
//!   another one even while a writer is queued.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::lock_api::ArcRwLockReadGuard;
use parking_lot::{RawRwLock, RwLock, RwLockWriteGuard};
use sled::transaction::{
    ConflictableTransactionError, ConflictableTransactionResult, TransactionError,
    TransactionalTree,
};
use sled::IVec;
use tracing::{debug, info};

use crate::error::{KvError, KvResult};

/// Identifier of a bucket inside the store.
pub type BucketId = u64;

/// The bucket every path starts from.
pub const ROOT_BUCKET: BucketId = 0;

const META_BUCKET: BucketId = u64::MAX;
const NEXT_BUCKET_ID: &str = "next-bucket-id";
const REVISION: &str = "revision";

const KIND_VALUE: u8 = 0x00;
const KIND_BUCKET: u8 = 0x01;
const NAME_TERMINATOR: u8 = 0x00;

const BUCKETS_TREE: &str = "buckets";

/// Result type of closures run inside a write transaction.
///
/// Returning `Err(abort(e))` rolls the transaction back and surfaces `e`.
pub type TxResult<T> = ConflictableTransactionResult<T, KvError>;

/// Aborts the surrounding write transaction with `err`.
pub fn abort(err: KvError) -> ConflictableTransactionError<KvError> {
    ConflictableTransactionError::Abort(err)
}

/// Configuration for the backend storage.
#[derive(Clone, Debug)]
pub struct BackendConfig {
    /// Location of the sled database.
    pub path: PathBuf,

    /// Page cache size in megabytes.
    pub cache_size_mb: u64,

    /// Background flush interval in milliseconds, 0 disables it.
    pub flush_interval_ms: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data"),
            cache_size_mb: crate::config::DEFAULT_CACHE_SIZE_MB,
            flush_interval_ms: crate::config::DEFAULT_FLUSH_INTERVAL_MS,
        }
    }
}

/// The persistent byte store.
pub struct Backend {
    db: sled::Db,

    /// Single tree holding every bucket and value
    tree: sled::Tree,

    /// Shared by readers, exclusive for the writer
    txn_lock: Arc<RwLock<()>>,

    config: BackendConfig,
}

impl Backend {
    /// Opens or creates the database described by `config`.
    pub fn open(config: BackendConfig) -> KvResult<Self> {
        debug!("Opening storage backend at {:?}", config.path);

        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let flush_every_ms = match config.flush_interval_ms {
            0 => None,
            ms => Some(ms),
        };

        let db = sled::Config::new()
            .path(&config.path)
            .cache_capacity(config.cache_size_mb * 1024 * 1024)
            .flush_every_ms(flush_every_ms)
            .open()?;
        let tree = db.open_tree(BUCKETS_TREE)?;

        info!(
            "Storage backend opened at {:?} with cache_size={}MB, flush_interval={}ms",
            config.path, config.cache_size_mb, config.flush_interval_ms
        );

        Ok(Self {
            db,
            tree,
            txn_lock: Arc::new(RwLock::new(())),
            config,
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Acquires the writer lock. Transactions run through the guard are
    /// serialized against every other writer and against open readers.
    pub fn writer(&self) -> WriteGuard<'_> {
        WriteGuard {
            backend: self,
            _lock: self.txn_lock.write(),
        }
    }

    /// Runs `f` as one atomic write transaction.
    ///
    /// Everything `f` wrote is rolled back if it returns an error. `f` must
    /// not have side effects outside the transaction: the engine may call it
    /// again after an internal conflict.
    pub fn update<T, F>(&self, f: F) -> KvResult<T>
    where
        F: Fn(&WriteTxn<'_>) -> TxResult<T>,
    {
        self.writer().update(f)
    }

    /// Starts a read transaction that lasts until the returned value is dropped.
    ///
    /// Writers block while it is alive. Further reads on the same thread do
    /// not wait behind a queued writer, but beginning a write on the same
    /// thread before dropping it deadlocks.
    pub fn begin_read(&self) -> ReadTxn {
        ReadTxn {
            tree: self.tree.clone(),
            _guard: self.txn_lock.read_arc_recursive(),
        }
    }

    /// Runs `f` inside a short read transaction.
    pub fn view<T, F>(&self, f: F) -> KvResult<T>
    where
        F: FnOnce(&ReadTxn) -> KvResult<T>,
    {
        let txn = self.begin_read();
        f(&txn)
    }

    /// Last committed revision, 0 for a fresh store.
    pub fn revision(&self) -> KvResult<i64> {
        match self.tree.get(entry_key(META_BUCKET, REVISION, KIND_VALUE))? {
            Some(raw) => decode_i64(&raw),
            None => Ok(0),
        }
    }

    /// Flushes all pending writes to disk.
    pub fn flush(&self) -> KvResult<()> {
        self.db.flush()?;
        Ok(())
    }

    /// Flushes the database. The handle is released when the last reference drops.
    pub fn close(&self) -> KvResult<()> {
        self.flush()?;
        info!("Storage backend at {:?} closed", self.config.path);
        Ok(())
    }
}

/// Exclusive writer access to the store.
pub struct WriteGuard<'a> {
    backend: &'a Backend,
    _lock: RwLockWriteGuard<'a, ()>,
}

impl<'a> WriteGuard<'a> {
    /// Runs `f` as one atomic write transaction. See [`Backend::update`].
    pub fn update<T, F>(&self, f: F) -> KvResult<T>
    where
        F: Fn(&WriteTxn<'_>) -> TxResult<T>,
    {
        let result = self.backend.tree.transaction(|tx| f(&WriteTxn { tx }));
        match result {
            Ok(value) => Ok(value),
            Err(TransactionError::Abort(e)) => Err(e),
            Err(TransactionError::Storage(e)) => Err(KvError::Engine(e)),
        }
    }

    /// Non-transactional view of the tree. Consistent while the guard is held
    /// because no other writer can run.
    pub(crate) fn tree(&self) -> &sled::Tree {
        &self.backend.tree
    }
}

/// An open write transaction.
pub struct WriteTxn<'t> {
    tx: &'t TransactionalTree,
}

impl<'t> WriteTxn<'t> {
    pub fn root(&self) -> WriteBucket<'t> {
        WriteBucket {
            tx: self.tx,
            id: ROOT_BUCKET,
        }
    }

    /// Looks up a top-level bucket.
    pub fn bucket(&self, name: &str) -> TxResult<Option<WriteBucket<'t>>> {
        self.root().bucket(name)
    }

    /// Returns the top-level bucket `name`, creating it when absent.
    pub fn create_bucket_if_not_exists(&self, name: &str) -> TxResult<WriteBucket<'t>> {
        self.root().create_bucket_if_not_exists(name)
    }

    /// Increments and returns the store revision.
    pub fn next_revision(&self) -> TxResult<i64> {
        let key = entry_key(META_BUCKET, REVISION, KIND_VALUE);
        let current = match self.tx.get(&key)? {
            Some(raw) => decode_i64(&raw).map_err(abort)?,
            None => 0,
        };
        let next = current + 1;
        self.tx.insert(key, next.to_be_bytes().to_vec())?;
        Ok(next)
    }
}

/// A bucket seen from inside a write transaction.
pub struct WriteBucket<'t> {
    tx: &'t TransactionalTree,
    id: BucketId,
}

impl<'t> WriteBucket<'t> {
    pub fn id(&self) -> BucketId {
        self.id
    }

    pub fn get(&self, key: &str) -> TxResult<Option<IVec>> {
        Ok(self.tx.get(entry_key(self.id, key, KIND_VALUE))?)
    }

    /// Sets `key` to `value`, returning the previous value.
    pub fn put(&self, key: &str, value: &[u8]) -> TxResult<Option<IVec>> {
        check_name(key).map_err(abort)?;
        Ok(self.tx.insert(entry_key(self.id, key, KIND_VALUE), value)?)
    }

    /// Removes `key`, returning the value it held.
    pub fn delete(&self, key: &str) -> TxResult<Option<IVec>> {
        Ok(self.tx.remove(entry_key(self.id, key, KIND_VALUE))?)
    }

    /// Looks up the nested bucket `name`.
    pub fn bucket(&self, name: &str) -> TxResult<Option<WriteBucket<'t>>> {
        match self.tx.get(entry_key(self.id, name, KIND_BUCKET))? {
            Some(raw) => Ok(Some(WriteBucket {
                tx: self.tx,
                id: decode_id(&raw).map_err(abort)?,
            })),
            None => Ok(None),
        }
    }

    /// Returns the nested bucket `name`, creating it when absent.
    pub fn create_bucket_if_not_exists(&self, name: &str) -> TxResult<WriteBucket<'t>> {
        if let Some(existing) = self.bucket(name)? {
            return Ok(existing);
        }
        check_name(name).map_err(abort)?;

        let id = allocate_bucket_id(self.tx)?;
        self.tx
            .insert(entry_key(self.id, name, KIND_BUCKET), id.to_be_bytes().to_vec())?;
        Ok(WriteBucket { tx: self.tx, id })
    }
}

fn allocate_bucket_id(tx: &TransactionalTree) -> TxResult<BucketId> {
    let key = entry_key(META_BUCKET, NEXT_BUCKET_ID, KIND_VALUE);
    let id = match tx.get(&key)? {
        Some(raw) => decode_id(&raw).map_err(abort)?,
        None => ROOT_BUCKET + 1,
    };
    if id == META_BUCKET {
        return Err(abort(KvError::corrupted("bucket id space exhausted")));
    }
    tx.insert(key, (id + 1).to_be_bytes().to_vec())?;
    Ok(id)
}

/// A read transaction. Dropping it releases the shared lock.
pub struct ReadTxn {
    tree: sled::Tree,
    _guard: ArcRwLockReadGuard<RawRwLock, ()>,
}

impl ReadTxn {
    pub fn root(&self) -> ReadBucket<'_> {
        ReadBucket::new(&self.tree, ROOT_BUCKET)
    }

    /// Looks up a top-level bucket.
    pub fn bucket(&self, name: &str) -> KvResult<Option<ReadBucket<'_>>> {
        self.root().bucket(name)
    }

    pub(crate) fn tree(&self) -> &sled::Tree {
        &self.tree
    }
}

/// A bucket seen from inside a read transaction.
pub struct ReadBucket<'t> {
    tree: &'t sled::Tree,
    id: BucketId,
}

impl<'t> ReadBucket<'t> {
    pub(crate) fn new(tree: &'t sled::Tree, id: BucketId) -> Self {
        Self { tree, id }
    }

    pub fn id(&self) -> BucketId {
        self.id
    }

    pub fn get(&self, key: &str) -> KvResult<Option<IVec>> {
        Ok(self.tree.get(entry_key(self.id, key, KIND_VALUE))?)
    }

    pub fn bucket(&self, name: &str) -> KvResult<Option<ReadBucket<'t>>> {
        match self.tree.get(entry_key(self.id, name, KIND_BUCKET))? {
            Some(raw) => Ok(Some(ReadBucket {
                tree: self.tree,
                id: decode_id(&raw)?,
            })),
            None => Ok(None),
        }
    }

    /// Iterates over every value and nested bucket, in name order.
    pub fn cursor(&self) -> Cursor {
        Cursor::open(self.tree, self.id, "")
    }

    /// Iterates over the children whose names start with `partial`.
    pub fn cursor_prefix(&self, partial: &str) -> Cursor {
        Cursor::open(self.tree, self.id, partial)
    }
}

/// One child of a bucket.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CursorItem {
    Value { name: String, value: IVec },
    Bucket { name: String, id: BucketId },
}

impl CursorItem {
    pub fn name(&self) -> &str {
        match self {
            CursorItem::Value { name, .. } | CursorItem::Bucket { name, .. } => name,
        }
    }
}

/// Lazy iterator over the children of one bucket.
pub struct Cursor {
    iter: sled::Iter,
}

impl Cursor {
    pub(crate) fn open(tree: &sled::Tree, bucket: BucketId, partial: &str) -> Self {
        let mut prefix = Vec::with_capacity(8 + partial.len());
        prefix.extend_from_slice(&bucket.to_be_bytes());
        prefix.extend_from_slice(partial.as_bytes());
        Self {
            iter: tree.scan_prefix(prefix),
        }
    }
}

impl Iterator for Cursor {
    type Item = KvResult<CursorItem>;

    fn next(&mut self) -> Option<Self::Item> {
        let (raw_key, raw_value) = match self.iter.next()? {
            Ok(entry) => entry,
            Err(e) => return Some(Err(KvError::Engine(e))),
        };
        Some(decode_item(&raw_key, raw_value))
    }
}

fn entry_key(bucket: BucketId, name: &str, kind: u8) -> Vec<u8> {
    let mut key = Vec::with_capacity(8 + name.len() + 2);
    key.extend_from_slice(&bucket.to_be_bytes());
    key.extend_from_slice(name.as_bytes());
    key.push(NAME_TERMINATOR);
    key.push(kind);
    key
}

fn decode_item(raw_key: &[u8], raw_value: IVec) -> KvResult<CursorItem> {
    if raw_key.len() < 10 || raw_key[raw_key.len() - 2] != NAME_TERMINATOR {
        return Err(KvError::corrupted(format!("invalid entry key {:?}", raw_key)));
    }

    let name = std::str::from_utf8(&raw_key[8..raw_key.len() - 2])
        .map_err(|_| KvError::corrupted("entry name is not valid UTF-8"))?
        .to_string();

    match raw_key[raw_key.len() - 1] {
        KIND_VALUE => Ok(CursorItem::Value {
            name,
            value: raw_value,
        }),
        KIND_BUCKET => Ok(CursorItem::Bucket {
            name,
            id: decode_id(&raw_value)?,
        }),
        kind => Err(KvError::corrupted(format!("unknown entry kind 0x{:02x}", kind))),
    }
}

fn decode_id(raw: &[u8]) -> KvResult<BucketId> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| KvError::corrupted(format!("invalid bucket id of {} bytes", raw.len())))?;
    Ok(u64::from_be_bytes(bytes))
}

fn decode_i64(raw: &[u8]) -> KvResult<i64> {
    let bytes: [u8; 8] = raw
        .try_into()
        .map_err(|_| KvError::corrupted(format!("invalid revision of {} bytes", raw.len())))?;
    Ok(i64::from_be_bytes(bytes))
}

fn check_name(name: &str) -> KvResult<()> {
    if name.contains('\0') {
        return Err(KvError::malformed(name, "name contains a NUL byte"));
    }
    Ok(())
}
