use std::collections::HashMap;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::time::Instant;

use super::CounterStore;
use crate::error::Result;

#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at: Option<Instant>,
}

impl Entry {
    fn live(&self, now: Instant) -> bool {
        self.expires_at.map_or(true, |at| at > now)
    }
}

/// Process-local counter store.
///
/// Expiry follows the tokio clock, so tests running with a paused clock
/// see windows roll over deterministically.
#[derive(Debug, Default)]
pub struct MemoryCounterStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryCounterStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn bump<'a>(entries: &'a mut HashMap<String, Entry>, key: &str, now: Instant) -> (i64, &'a mut Entry) {
    let entry = entries
        .entry(key.to_string())
        .and_modify(|entry| {
            if !entry.live(now) {
                entry.value = "0".to_string();
                entry.expires_at = None;
            }
        })
        .or_insert_with(|| Entry {
            value: "0".to_string(),
            expires_at: None,
        });
    let next = entry.value.parse::<i64>().unwrap_or(0) + 1;
    entry.value = next.to_string();
    (next, entry)
}

#[async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment(&self, key: &str) -> Result<i64> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        Ok(bump(&mut entries, key, now).0)
    }

    async fn increment_in_window(&self, key: &str, window: Duration) -> Result<i64> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        let (next, entry) = bump(&mut entries, key, now);
        if next == 1 {
            entry.expires_at = Some(now + window);
        }
        Ok(next)
    }

    async fn expire(&self, key: &str, ttl: Duration) -> Result<()> {
        let now = Instant::now();
        let mut entries = self.entries.lock().await;
        if let Some(entry) = entries.get_mut(key) {
            if entry.live(now) {
                entry.expires_at = Some(now + ttl);
            }
        }
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.live(now))
            .map(|entry| entry.value.clone()))
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<()> {
        let expires_at = Instant::now() + ttl;
        self.entries.lock().await.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(expires_at),
            },
        );
        Ok(())
    }

    async fn time_to_live(&self, key: &str) -> Result<Option<Duration>> {
        let now = Instant::now();
        let entries = self.entries.lock().await;
        Ok(entries
            .get(key)
            .filter(|entry| entry.live(now))
            .and_then(|entry| entry.expires_at)
            .map(|at| at - now))
    }
}
