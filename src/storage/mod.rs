//! Storage module: the transactional byte store and the key mapping onto it.
//!
//! The layer is split in two:
//!
//! 1. **Backend** (`backend`): sled wrapped into a bucket store with atomic
//!    write transactions, read transactions and cursors
//! 2. **Key mapping** (`keys`): translation of logical keys such as
//!    `"a/b/c"` into a bucket path and a leaf key

pub mod backend;
pub mod keys;

pub use backend::{
    abort, Backend, BackendConfig, BucketId, Cursor, CursorItem, ReadBucket, ReadTxn, TxResult,
    WriteBucket, WriteGuard, WriteTxn, ROOT_BUCKET,
};
pub use keys::KeyMapper;
