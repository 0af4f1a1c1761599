use std::time::Duration;

use crate::error::{DispatchError, Result};
use crate::job::{Backoff, DispatchOptions};


/// A queue to serve and how many jobs it may run in parallel.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct QueueConfig {
    pub name: String,
    pub concurrency: usize,
}

impl QueueConfig {
    pub fn new(name: impl Into<String>, concurrency: usize) -> Self {
        Self {
            name: name.into(),
            concurrency,
        }
    }

    /// Parses a comma separated list of queue names, all sharing one concurrency.
    pub fn from_list(list: &str, concurrency: usize) -> Vec<Self> {
        list.split(',')
            .map(str::trim)
            .filter(|name| !name.is_empty())
            .map(|name| Self::new(name, concurrency))
            .collect()
    }
}


/// Connection settings for the shared Redis instance.
#[derive(Clone, Debug)]
pub struct RedisConfig {
    pub host: String,
    pub port: u16,
    pub db: i64,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Full URL; when set it wins over the individual fields.
    pub url: Option<String>,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 6379,
            db: 0,
            username: None,
            password: None,
            url: None,
        }
    }
}

impl RedisConfig {
    /// Reads `REDIS_URL`, or `REDIS_HOST`, `REDIS_PORT`, `REDIS_DB`,
    /// `REDIS_AUTH_USERNAME` and `REDIS_AUTH_PASSWORD`.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let port = match lookup("REDIS_PORT") {
            Some(raw) => raw
                .parse()
                .map_err(|_| DispatchError::Config(format!("invalid REDIS_PORT: {raw}")))?,
            None => defaults.port,
        };
        let db = match lookup("REDIS_DB") {
            Some(raw) => raw
                .parse()
                .map_err(|_| DispatchError::Config(format!("invalid REDIS_DB: {raw}")))?,
            None => defaults.db,
        };

        Ok(Self {
            host: lookup("REDIS_HOST").unwrap_or(defaults.host),
            port,
            db,
            username: lookup("REDIS_AUTH_USERNAME").filter(|v| !v.is_empty()),
            password: lookup("REDIS_AUTH_PASSWORD").filter(|v| !v.is_empty()),
            url: lookup("REDIS_URL").filter(|v| !v.is_empty()),
        })
    }

    pub fn url(&self) -> String {
        if let Some(url) = &self.url {
            return url.clone();
        }
        let auth = match (&self.username, &self.password) {
            (Some(user), Some(pass)) => format!("{user}:{pass}@"),
            (None, Some(pass)) => format!(":{pass}@"),
            (Some(user), None) => format!("{user}@"),
            (None, None) => String::new(),
        };
        format!("redis://{auth}{}:{}/{}", self.host, self.port, self.db)
    }
}


/// Ceilings and windows of the two-tier limiter.
#[derive(Clone, Debug)]
pub struct RateLimitConfig {
    /// Jobs allowed across all recipients per global window.
    pub global_limit: i64,
    pub global_window: Duration,
    /// Fixed delay applied to jobs deferred by the global tier.
    pub global_requeue_delay: Duration,
    /// Per-recipient ceiling for groups, supergroups and channels.
    pub group_limit: i64,
    /// Per-recipient ceiling for direct chats.
    pub direct_limit: i64,
    pub personal_window: Duration,
    /// Lower bound for delays computed from the remaining personal window.
    pub min_requeue_delay: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global_limit: 30,
            global_window: Duration::from_secs(1),
            global_requeue_delay: Duration::from_millis(1000),
            group_limit: 20,
            direct_limit: 30,
            personal_window: Duration::from_secs(60),
            min_requeue_delay: Duration::from_secs(1),
        }
    }
}


/// Timing knobs for broker workers.
#[derive(Clone, Debug)]
pub struct WorkerSettings {
    /// Sleep between polls of an empty wait list.
    pub poll_interval: Duration,
    /// How long a claimed job stays locked before it counts as stalled.
    pub lock_duration: Duration,
    /// Interval of the delayed-job promoter and the stall reaper.
    pub maintenance_interval: Duration,
    /// How long `close()` waits for in-flight jobs before aborting them.
    pub shutdown_timeout: Duration,
    /// Jobs moved per promoter tick.
    pub batch_size: usize,
}

impl Default for WorkerSettings {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            lock_duration: Duration::from_secs(30),
            maintenance_interval: Duration::from_secs(1),
            shutdown_timeout: Duration::from_secs(25),
            batch_size: 100,
        }
    }
}


/// Engine-wide defaults.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    pub default_concurrency: usize,
    pub default_options: DispatchOptions,
    pub rate_limits: RateLimitConfig,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            default_concurrency: 5,
            default_options: DispatchOptions::defaults(),
            rate_limits: RateLimitConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn concurrency(mut self, concurrency: usize) -> Self {
        self.default_concurrency = concurrency.max(1);
        self
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.default_options.attempts = Some(attempts);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.default_options.backoff = Some(backoff);
        self
    }

    pub fn rate_limits(mut self, rate_limits: RateLimitConfig) -> Self {
        self.rate_limits = rate_limits;
        self
    }
}
