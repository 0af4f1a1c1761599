//! Broker abstraction: durable queues, workers and job lifecycle events.
//!
//! The engine only talks to the traits in this module. Two implementations
//! ship with the crate:
//! - [`RedisBroker`] keeps jobs in Redis and can be shared by many processes
//! - [`MemoryBroker`] keeps jobs in process memory, for single-process use and tests

mod memory;
mod redis;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::warn;

use crate::error::Result;
use crate::job::{JobId, JobOptions};
use crate::readiness::ReadyListener;

pub use self::memory::{FailedJob, MemoryBroker};
pub use self::redis::RedisBroker;

const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Job lifecycle transitions published per queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueEvent {
    Completed {
        job_id: JobId,
    },
    /// An attempt failed. `terminal` is false while the broker will retry.
    Failed {
        job_id: JobId,
        error: String,
        attempts_made: u32,
        terminal: bool,
    },
    /// The job's worker died or lost its lock; the broker put it back.
    Stalled {
        job_id: JobId,
    },
}

/// Producer side of one named queue.
#[async_trait]
pub trait QueueHandle: Send + Sync {
    fn name(&self) -> &str;

    /// Persists a job. An explicit `job_id` that already exists is not added twice.
    async fn add(&self, job_name: &str, data: Value, opts: JobOptions) -> Result<JobId>;

    /// Replaces the claimed `job` with a copy that becomes ready after `delay`.
    ///
    /// An explicit job id carries over to the copy and stays taken the whole
    /// time, so a producer re-adding it meanwhile is still deduplicated. The
    /// caller discards the claimed attempt afterwards.
    async fn requeue(&self, job: &ActiveJob, delay: Duration) -> Result<JobId>;

    async fn close(&self) -> Result<()>;
}

/// A running consumer bound to one queue.
#[async_trait]
pub trait WorkerHandle: Send + Sync {
    fn queue(&self) -> &str;

    fn concurrency(&self) -> usize;

    /// Stops claiming jobs and waits for in-flight ones to settle.
    async fn close(&self) -> Result<()>;
}

/// Called by a worker for every job it claims.
///
/// The processor reports the outcome through the [`ActiveJob`]; returning
/// without failing or discarding the job completes it.
#[async_trait]
pub trait JobProcessor: Send + Sync {
    async fn process(&self, job: &ActiveJob);
}

/// Queue and worker primitives over a shared connection.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Fires once the underlying connection is usable.
    fn readiness(&self) -> ReadyListener;

    async fn open_queue(&self, name: &str) -> Result<Arc<dyn QueueHandle>>;

    async fn start_worker(
        &self,
        name: &str,
        processor: Arc<dyn JobProcessor>,
        concurrency: usize,
    ) -> Result<Arc<dyn WorkerHandle>>;

    async fn subscribe_events(&self, name: &str) -> Result<broadcast::Receiver<QueueEvent>>;
}

pub type DynBroker = Arc<dyn Broker>;

/// Snapshot of a queue's job counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct QueueCounts {
    pub waiting: u64,
    pub delayed: u64,
    pub active: u64,
    pub failed: u64,
    pub completed: u64,
}

impl QueueCounts {
    /// Jobs not yet completed or terminally failed.
    pub fn pending(&self) -> u64 {
        self.waiting + self.delayed + self.active
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Settlement {
    Failed { error: String, retryable: bool },
    Discarded,
}

/// A claimed job, handed to the [`JobProcessor`].
#[derive(Debug)]
pub struct ActiveJob {
    id: JobId,
    queue: String,
    name: String,
    data: Value,
    opts: JobOptions,
    attempts_made: u32,
    progress: AtomicU8,
    settlement: Mutex<Option<Settlement>>,
}

impl ActiveJob {
    pub fn new(
        id: JobId,
        queue: impl Into<String>,
        name: impl Into<String>,
        data: Value,
        opts: JobOptions,
        attempts_made: u32,
    ) -> Self {
        Self {
            id,
            queue: queue.into(),
            name: name.into(),
            data,
            opts,
            attempts_made,
            progress: AtomicU8::new(0),
            settlement: Mutex::new(None),
        }
    }

    pub fn id(&self) -> &JobId {
        &self.id
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn data(&self) -> &Value {
        &self.data
    }

    pub fn options(&self) -> &JobOptions {
        &self.opts
    }

    /// Options for a delayed copy of this job, keeping any explicit id.
    pub(crate) fn requeue_options(&self, delay: Duration) -> JobOptions {
        JobOptions {
            delay: Some(delay),
            ..self.opts.clone()
        }
    }

    /// Failed attempts before this one.
    pub fn attempts_made(&self) -> u32 {
        self.attempts_made
    }

    pub fn progress(&self) -> u8 {
        self.progress.load(Ordering::SeqCst)
    }

    pub fn update_progress(&self, pct: u8) {
        self.progress.store(pct.min(100), Ordering::SeqCst);
    }

    /// Fails this attempt. Retryable failures are retried within the attempt budget.
    pub fn move_to_failed(&self, error: impl Into<String>, retryable: bool) {
        self.settle(Settlement::Failed {
            error: error.into(),
            retryable,
        });
    }

    /// Drops this attempt without completing or failing it.
    pub fn discard(&self) {
        self.settle(Settlement::Discarded);
    }

    fn settle(&self, settlement: Settlement) {
        let mut slot = self.settlement.lock().unwrap_or_else(|e| e.into_inner());
        if slot.is_none() {
            *slot = Some(settlement);
        }
    }

    /// Decides what the broker does with the job once processing returned.
    pub(crate) fn disposition(&self) -> Disposition {
        let settlement = self
            .settlement
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone();
        match settlement {
            None => Disposition::Completed,
            Some(Settlement::Discarded) => Disposition::Discarded,
            Some(Settlement::Failed { error, retryable }) => {
                let attempts_made = self.attempts_made + 1;
                if retryable && attempts_made < self.opts.attempts {
                    Disposition::Retry {
                        delay: self.opts.backoff.delay_for(attempts_made),
                        attempts_made,
                        error,
                    }
                } else {
                    Disposition::Failed { attempts_made, error }
                }
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Disposition {
    Completed,
    Retry {
        delay: Duration,
        attempts_made: u32,
        error: String,
    },
    Failed {
        attempts_made: u32,
        error: String,
    },
    Discarded,
}

impl Disposition {
    /// Event to publish for this outcome, if any.
    pub(crate) fn event(&self, job_id: &JobId) -> Option<QueueEvent> {
        match self {
            Self::Completed => Some(QueueEvent::Completed { job_id: job_id.clone() }),
            Self::Retry { attempts_made, error, .. } => Some(QueueEvent::Failed {
                job_id: job_id.clone(),
                error: error.clone(),
                attempts_made: *attempts_made,
                terminal: false,
            }),
            Self::Failed { attempts_made, error } => Some(QueueEvent::Failed {
                job_id: job_id.clone(),
                error: error.clone(),
                attempts_made: *attempts_made,
                terminal: true,
            }),
            Self::Discarded => None,
        }
    }
}

/// Per-queue broadcast channels for [`QueueEvent`]s.
#[derive(Debug, Default)]
pub(crate) struct EventBus {
    channels: Mutex<HashMap<String, broadcast::Sender<QueueEvent>>>,
}

impl EventBus {
    pub(crate) fn sender(&self, queue: &str) -> broadcast::Sender<QueueEvent> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(queue.to_string())
            .or_insert_with(|| broadcast::channel(EVENT_CHANNEL_CAPACITY).0)
            .clone()
    }

    pub(crate) fn subscribe(&self, queue: &str) -> broadcast::Receiver<QueueEvent> {
        self.sender(queue).subscribe()
    }
}

/// Worker handle over a set of spawned loops sharing one shutdown signal.
pub(crate) struct TaskWorker {
    queue: String,
    concurrency: usize,
    shutdown: watch::Sender<bool>,
    shutdown_timeout: Duration,
    tasks: tokio::sync::Mutex<Option<JoinSet<()>>>,
}

impl TaskWorker {
    pub(crate) fn new(
        queue: impl Into<String>,
        concurrency: usize,
        shutdown: watch::Sender<bool>,
        shutdown_timeout: Duration,
        tasks: JoinSet<()>,
    ) -> Self {
        Self {
            queue: queue.into(),
            concurrency,
            shutdown,
            shutdown_timeout,
            tasks: tokio::sync::Mutex::new(Some(tasks)),
        }
    }
}

#[async_trait]
impl WorkerHandle for TaskWorker {
    fn queue(&self) -> &str {
        &self.queue
    }

    fn concurrency(&self) -> usize {
        self.concurrency
    }

    async fn close(&self) -> Result<()> {
        let _ = self.shutdown.send(true);
        let Some(mut tasks) = self.tasks.lock().await.take() else {
            return Ok(());
        };
        let drained = tokio::time::timeout(self.shutdown_timeout, async {
            while let Some(result) = tasks.join_next().await {
                if let Err(e) = result {
                    if e.is_panic() {
                        warn!(queue = %self.queue, error = %e, "Worker task panicked");
                    }
                }
            }
        })
        .await;
        if drained.is_err() {
            warn!(queue = %self.queue, "Shutdown timeout reached, aborting in-flight jobs");
            tasks.abort_all();
        }
        Ok(())
    }
}

/// Sleeps for `period`; returns true if shutdown was requested meanwhile.
pub(crate) async fn idle(shutdown: &mut watch::Receiver<bool>, period: Duration) -> bool {
    tokio::select! {
        _ = shutdown.wait_for(|stop| *stop) => true,
        _ = tokio::time::sleep(period) => false,
    }
}
