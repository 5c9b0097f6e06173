//! # bucketkv: a namespaced key-value layer over an embedded transactional store
//!
//! bucketkv maps hierarchical string keys onto nested buckets of an embedded
//! database and exposes them through a small broker API:
//!
//! - **Bucket mapping**: `"a/b/c"` lives as key `c` inside bucket `b` inside bucket `a`
//! - **Raw client**: byte-level get/put/delete, prefix listing and batch transactions
//! - **Records**: typed values through a pluggable [`Serializer`] (JSON by default)
//! - **Prefixed brokers and watchers**: namespace views that add and strip a key prefix
//! - **Watches**: synchronous change callbacks delivered in commit order
//! - **Optional configuration**: without one the store is Disabled, not an error
//!
//! # Usage
//!
//! ```no_run
//! use bucketkv::{KvStore, StoreConfig};
//!
//! let store = KvStore::new(Some(StoreConfig::new("/var/lib/agent/kv")))?;
//! let broker = store.new_broker::<String>("agent1/config/");
//! broker.put("route/1", &"10.0.0.0/8".to_string())?;
//! # Ok::<(), bucketkv::KvError>(())
//! ```

pub mod broker;
pub mod client;
pub mod config;
pub mod error;
pub mod record;
pub mod serializer;
pub mod storage;
pub mod store;
pub mod watch;

// Re-export main types at crate root for convenience
pub use broker::{PrefixedBroker, PrefixedWatcher};
pub use client::{ConnectionState, KeyIterator, RawClient, RawTxn, ValueIterator};
pub use config::StoreConfig;
pub use error::{KvError, KvResult};
pub use record::{RecordChange, RecordIterator, RecordTxn, RecordWrapper};
pub use serializer::{CodecError, JsonSerializer, Serializer};
pub use storage::KeyMapper;
pub use store::KvStore;
pub use watch::{ChangeKind, WatchEvent, WatchHandle};
