//! Two-tier fixed-window rate limiter over a [`CounterStore`].

use std::time::Duration;

use serde_json::Value;
use tracing::debug;

use crate::config::RateLimitConfig;
use crate::error::Result;
use crate::payload::Recipient;
use crate::store::DynCounterStore;
use crate::utils::constants::{GLOBAL_COUNTER_KEY, PERSONAL_COUNTER_PREFIX};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Global,
    Personal,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Global => f.write_str("global"),
            Self::Personal => f.write_str("personal"),
        }
    }
}

/// Result of checking one job against the limiter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Gate {
    Pass,
    /// Over a ceiling; the job should be requeued after `delay`.
    Deferred { tier: Tier, delay: Duration },
}

impl Gate {
    pub fn is_pass(&self) -> bool {
        matches!(self, Self::Pass)
    }
}

pub fn personal_key(queue: &str, identity: &str) -> String {
    format!("{PERSONAL_COUNTER_PREFIX}:{queue}:{identity}")
}

pub struct RateLimiter {
    store: DynCounterStore,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(store: DynCounterStore, config: RateLimitConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Counts one dispatch of `payload` on `queue` against both tiers.
    ///
    /// The personal tier is only charged once the global tier passed.
    pub async fn check(&self, queue: &str, payload: &Value) -> Result<Gate> {
        let global = self
            .hit(GLOBAL_COUNTER_KEY, self.config.global_window)
            .await?;
        if global > self.config.global_limit {
            debug!(queue = %queue, count = global, "Global rate limit exceeded");
            return Ok(Gate::Deferred {
                tier: Tier::Global,
                delay: self.config.global_requeue_delay,
            });
        }

        let Some(recipient) = Recipient::from_payload(payload) else {
            return Ok(Gate::Pass);
        };
        let key = personal_key(queue, &recipient.identity);
        let count = self.hit(&key, self.config.personal_window).await?;
        let limit = if recipient.direct {
            self.config.direct_limit
        } else {
            self.config.group_limit
        };
        if count <= limit {
            return Ok(Gate::Pass);
        }

        let remaining = self
            .store
            .time_to_live(&key)
            .await?
            .unwrap_or(self.config.personal_window);
        let delay = remaining.max(self.config.min_requeue_delay);
        debug!(
            queue = %queue,
            recipient = %recipient.identity,
            count,
            limit,
            delay_ms = delay.as_millis() as u64,
            "Personal rate limit exceeded"
        );
        Ok(Gate::Deferred {
            tier: Tier::Personal,
            delay,
        })
    }

    /// Increments a window counter, starting its window on the first hit.
    async fn hit(&self, key: &str, window: Duration) -> Result<i64> {
        self.store.increment_in_window(key, window).await
    }
}
