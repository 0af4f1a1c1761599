//! Shared counter store used as the rate-limit ledger.

mod memory;
mod redis;

use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Serialize};

use crate::error::Result;

pub use self::memory::MemoryCounterStore;
pub use self::redis::RedisCounterStore;

/// Key-value store with an atomic increment.
///
/// Implementations must make `increment` atomic with respect to concurrent
/// callers in every process sharing the store.
#[async_trait]
pub trait CounterStore: Send + Sync {
    /// Increments `key` (missing keys start at 0) and returns the new value.
    async fn increment(&self, key: &str) -> Result<i64>;

    /// Like [`increment`](Self::increment), and gives the key a `window` time
    /// to live when this call created it, as one atomic step.
    async fn increment_in_window(&self, key: &str, window: Duration) -> Result<i64>;

    /// Sets the key's time to live.
    async fn expire(&self, key: &str, ttl: Duration) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()>;

    /// Remaining time to live, `None` if the key is missing or never expires.
    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>>;
}

pub type DynCounterStore = Arc<dyn CounterStore>;

/// Namespaced JSON values on top of a [`CounterStore`].
pub struct Collection<T> {
    store: DynCounterStore,
    name: String,
    _phantom: PhantomData<fn() -> T>,
}

impl<T> Collection<T>
where
    T: Serialize + DeserializeOwned,
{
    pub const DEFAULT_TTL: Duration = Duration::from_secs(86_400);

    pub fn new(store: DynCounterStore, name: impl Into<String>) -> Self {
        Self {
            store,
            name: name.into(),
            _phantom: PhantomData,
        }
    }

    fn key(&self, identifier: &str) -> String {
        format!("{}:{identifier}", self.name)
    }

    pub async fn get(&self, identifier: &str) -> Result<Option<T>> {
        match self.store.get(&self.key(identifier)).await? {
            Some(raw) => Ok(Some(serde_json::from_str(&raw)?)),
            None => Ok(None),
        }
    }

    pub async fn set(&self, identifier: &str, value: &T) -> Result<()> {
        self.set_with_ttl(identifier, value, Self::DEFAULT_TTL).await
    }

    pub async fn set_with_ttl(&self, identifier: &str, value: &T, ttl: Duration) -> Result<()> {
        let raw = serde_json::to_string(value)?;
        self.store.set(&self.key(identifier), &raw, ttl).await
    }
}
