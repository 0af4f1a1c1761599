//! Rate-limited notification dispatch on top of a durable job queue.
//!
//! A [`DispatchEngine`] owns named queues and their workers. Every job a
//! worker claims is first checked against a two-tier rate limiter (a global
//! per-second ceiling and a per-recipient per-minute ceiling); jobs over a
//! ceiling are dropped from their current attempt and enqueued again with a
//! delay, everything else is handed to the registered [`Handler`].

pub mod broker;
pub mod config;
pub mod engine;
pub mod error;
pub mod events;
pub mod handlers;
pub mod job;
pub mod limiter;
pub mod notifier;
pub mod payload;
pub mod producer;
pub mod rdconfig;
pub mod readiness;
pub mod registry;
pub mod store;
pub mod utils;

pub use broker::{Broker, DynBroker, MemoryBroker, QueueCounts, QueueEvent, RedisBroker};
pub use config::{EngineConfig, QueueConfig, RateLimitConfig, RedisConfig, WorkerSettings};
pub use engine::{CloseReport, DispatchEngine, StatsSnapshot};
pub use error::{DispatchError, Result};
pub use job::{Backoff, BackoffKind, DispatchOptions, Handler, HandlerOutcome, JobId};
pub use limiter::{Gate, RateLimiter, Tier};
pub use notifier::{LogNotifier, Notifier};
pub use payload::{MessagePayload, Payload, RecipientKind, SendOptions, TaskPayload};
pub use readiness::{Readiness, ReadyListener};
pub use store::{CounterStore, DynCounterStore, MemoryCounterStore, RedisCounterStore};
