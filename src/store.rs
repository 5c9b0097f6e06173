//! Store lifecycle: configuration in, a shared client out.
//!
//! A store is built from an optional configuration. Without one it comes up
//! Disabled: every data operation fails with [`KvError::NotAvailable`] and the
//! host process keeps running.

use std::path::Path;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::{info, warn};

use crate::broker::{PrefixedBroker, PrefixedWatcher};
use crate::client::{ConnectionState, RawClient};
use crate::config::StoreConfig;
use crate::error::{KvError, KvResult};
use crate::record::RecordWrapper;
use crate::serializer::{JsonSerializer, Serializer};

/// Entry point owning the shared [`RawClient`].
pub struct KvStore {
    client: Arc<RawClient>,
    config: Option<StoreConfig>,
}

impl KvStore {
    /// Opens the database described by `config`, or comes up Disabled when
    /// `config` is `None`.
    pub fn new(config: Option<StoreConfig>) -> KvResult<Self> {
        let Some(config) = config else {
            info!("No store configuration, key-value store disabled");
            return Ok(Self::disabled());
        };

        let client = RawClient::open(&config)?;
        Ok(Self {
            client: Arc::new(client),
            config: Some(config),
        })
    }

    /// Loads the configuration file at `path` and opens the store. A missing
    /// file yields a Disabled store; an unreadable or invalid one is an error.
    pub fn from_config_file(path: impl AsRef<Path>) -> KvResult<Self> {
        match StoreConfig::load(path) {
            Ok(config) => Self::new(Some(config)),
            Err(KvError::ConfigMissing(path)) => {
                warn!(path = %path.display(), "Store configuration not found, key-value store disabled");
                Ok(Self::disabled())
            }
            Err(e) => Err(e),
        }
    }

    pub fn disabled() -> Self {
        Self {
            client: Arc::new(RawClient::disabled()),
            config: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.client.state()
    }

    /// The configuration the store was opened with, `None` when disabled.
    pub fn config(&self) -> Option<&StoreConfig> {
        self.config.as_ref()
    }

    /// The shared byte-level client.
    pub fn raw(&self) -> Arc<RawClient> {
        Arc::clone(&self.client)
    }

    /// A record wrapper using the default JSON encoding.
    pub fn records<T>(&self) -> RecordWrapper<T, JsonSerializer>
    where
        T: Serialize + DeserializeOwned,
    {
        RecordWrapper::new(self.raw(), JsonSerializer::new())
    }

    /// A record wrapper using `serializer`.
    pub fn records_with<T, S>(&self, serializer: S) -> RecordWrapper<T, S>
    where
        T: Serialize + DeserializeOwned,
        S: Serializer,
    {
        RecordWrapper::new(self.raw(), serializer)
    }

    pub fn new_broker<T>(&self, prefix: impl Into<String>) -> PrefixedBroker<T, JsonSerializer>
    where
        T: Serialize + DeserializeOwned,
    {
        self.records::<T>().new_broker(prefix)
    }

    pub fn new_watcher<T>(&self, prefix: impl Into<String>) -> PrefixedWatcher<T, JsonSerializer>
    where
        T: Serialize + DeserializeOwned,
    {
        self.records::<T>().new_watcher(prefix)
    }

    /// Closes the underlying client. Wrappers and brokers created from this
    /// store fail with `NotAvailable` afterwards.
    pub fn close(&self) -> KvResult<()> {
        self.client.close()
    }
}
