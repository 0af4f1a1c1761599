//! The dispatch engine: queue/worker lifecycle, rate-limit gate, requeue
//! policy and shutdown.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

use crate::broker::{ActiveJob, DynBroker, JobProcessor, QueueHandle, WorkerHandle};
use crate::config::EngineConfig;
use crate::error::{DispatchError, Result};
use crate::events::QueueEvents;
use crate::job::{DispatchOptions, Handler, HandlerOutcome, JobId};
use crate::limiter::{Gate, RateLimiter, Tier};
use crate::readiness::{Readiness, ReadyListener};
use crate::registry::Registry;
use crate::store::DynCounterStore;

/// Running totals of what the engine did.
#[derive(Debug, Default)]
pub struct DispatchStats {
    enqueued: AtomicU64,
    dropped: AtomicU64,
    dispatched: AtomicU64,
    deferred: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StatsSnapshot {
    pub enqueued: u64,
    /// Enqueue attempts abandoned because the broker was unavailable.
    pub dropped: u64,
    /// Jobs whose handler ran to success.
    pub dispatched: u64,
    /// Jobs discarded and requeued by the rate limiter.
    pub deferred: u64,
    /// Failed attempts, retried or terminal.
    pub failed: u64,
}

impl DispatchStats {
    fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            enqueued: self.enqueued.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            dispatched: self.dispatched.load(Ordering::Relaxed),
            deferred: self.deferred.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of [`DispatchEngine::close`].
#[derive(Debug, Default)]
pub struct CloseReport {
    pub closed: usize,
    /// One [`DispatchError::ResourceClose`] per resource that failed to close.
    pub failures: Vec<DispatchError>,
}

impl CloseReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn record(&mut self, resource: String, result: Result<()>) {
        match result {
            Ok(()) => self.closed += 1,
            Err(e) => {
                error!(resource = %resource, error = %e, "Failed to close resource");
                self.failures.push(DispatchError::ResourceClose {
                    resource,
                    reason: e.to_string(),
                });
            }
        }
    }
}

struct EngineInner {
    broker: DynBroker,
    limiter: Arc<RateLimiter>,
    config: EngineConfig,
    registry: Registry,
    readiness: Arc<Readiness>,
    /// Serializes queue and worker creation.
    setup: Mutex<()>,
    closed: AtomicBool,
    stats: Arc<DispatchStats>,
}

/// Owns named queues and their workers on top of a [`Broker`](crate::broker::Broker).
///
/// Cheap to clone; clones share the same registries.
#[derive(Clone)]
pub struct DispatchEngine {
    inner: Arc<EngineInner>,
}

impl DispatchEngine {
    /// Builds the engine and starts waiting for the broker to become ready.
    ///
    /// Must be called from within a tokio runtime.
    pub fn new(broker: DynBroker, store: DynCounterStore, config: EngineConfig) -> Self {
        let readiness = Arc::new(Readiness::new());
        let mut broker_ready = broker.readiness();
        if broker_ready.is_ready() {
            readiness.mark_ready();
            info!("Dispatch engine ready");
        } else {
            let engine_ready = readiness.clone();
            tokio::spawn(async move {
                broker_ready.wait().await;
                if engine_ready.mark_ready() {
                    info!("Dispatch engine ready");
                }
            });
        }

        let limiter = Arc::new(RateLimiter::new(store, config.rate_limits.clone()));
        Self {
            inner: Arc::new(EngineInner {
                broker,
                limiter,
                config,
                registry: Registry::new(),
                readiness,
                setup: Mutex::new(()),
                closed: AtomicBool::new(false),
                stats: Arc::new(DispatchStats::default()),
            }),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.inner.readiness.is_ready()
    }

    /// Resolves once the broker connection reported ready.
    pub async fn ready(&self) {
        self.listener().wait().await;
    }

    pub fn listener(&self) -> ReadyListener {
        self.inner.readiness.listener()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.inner.stats.snapshot()
    }

    pub fn queue_names(&self) -> Vec<String> {
        self.inner.registry.queue_names()
    }

    fn ensure_open(&self, queue: &str) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::QueueClosed(queue.to_string()));
        }
        Ok(())
    }

    fn ensure_ready(&self) -> Result<()> {
        if !self.is_ready() {
            return Err(DispatchError::BrokerUnavailable(
                "connection not ready".to_string(),
            ));
        }
        Ok(())
    }

    /// Returns the queue named `name`, opening it and its event
    /// subscription on first use.
    ///
    /// Fails with [`DispatchError::BrokerUnavailable`] before the engine is
    /// ready; nothing is registered in that case.
    pub async fn create_queue(&self, name: &str) -> Result<Arc<dyn QueueHandle>> {
        if let Some(queue) = self.inner.registry.queue(name) {
            return Ok(queue);
        }
        let _guard = self.inner.setup.lock().await;
        self.create_queue_locked(name).await
    }

    async fn create_queue_locked(&self, name: &str) -> Result<Arc<dyn QueueHandle>> {
        self.ensure_open(name)?;
        self.ensure_ready()?;
        if let Some(queue) = self.inner.registry.queue(name) {
            return Ok(queue);
        }
        let queue = self.inner.broker.open_queue(name).await?;
        let rx = self.inner.broker.subscribe_events(name).await?;
        let events = QueueEvents::spawn(name, rx);
        info!(queue = %name, "Queue created");
        Ok(self.inner.registry.insert_queue(name, queue, events))
    }

    /// Submits a job, logging and swallowing failures.
    ///
    /// Returns `None` when the job was not persisted, most often because the
    /// broker is not ready yet. Use [`try_enqueue`](Self::try_enqueue) when
    /// the caller must know.
    pub async fn enqueue<P: Serialize>(
        &self,
        queue: &str,
        payload: &P,
        options: Option<DispatchOptions>,
    ) -> Option<JobId> {
        match self.try_enqueue(queue, payload, options).await {
            Ok(id) => Some(id),
            Err(DispatchError::BrokerUnavailable(reason)) => {
                DispatchStats::bump(&self.inner.stats.dropped);
                warn!(queue = %queue, reason = %reason, "Broker unavailable, job not enqueued");
                None
            }
            Err(e) => {
                DispatchStats::bump(&self.inner.stats.dropped);
                error!(queue = %queue, error = %e, "Failed to enqueue job");
                None
            }
        }
    }

    pub async fn try_enqueue<P: Serialize>(
        &self,
        queue: &str,
        payload: &P,
        options: Option<DispatchOptions>,
    ) -> Result<JobId> {
        self.ensure_open(queue)?;
        self.ensure_ready()?;
        let data = serde_json::to_value(payload)?;
        let opts = options
            .unwrap_or_default()
            .merged_over(&self.inner.config.default_options);
        let handle = self.create_queue(queue).await?;
        let id = handle.add(queue, data, opts).await?;
        DispatchStats::bump(&self.inner.stats.enqueued);
        debug!(queue = %queue, job_id = %id, "Job enqueued");
        Ok(id)
    }

    /// Starts the worker for `queue`. A second registration returns the
    /// existing worker and ignores `handler`.
    ///
    /// Waits for the engine to become ready first.
    pub async fn register_handler<H: Handler>(
        &self,
        queue: &str,
        handler: H,
        concurrency: Option<usize>,
    ) -> Result<Arc<dyn WorkerHandle>> {
        self.ready().await;
        if let Some(worker) = self.inner.registry.worker(queue) {
            debug!(queue = %queue, "Handler already registered");
            return Ok(worker);
        }

        let _guard = self.inner.setup.lock().await;
        if let Some(worker) = self.inner.registry.worker(queue) {
            return Ok(worker);
        }
        let handle = self.create_queue_locked(queue).await?;
        let concurrency = concurrency.unwrap_or(self.inner.config.default_concurrency).max(1);
        let runner = Arc::new(JobRunner {
            queue: handle,
            handler: Arc::new(handler),
            limiter: self.inner.limiter.clone(),
            stats: self.inner.stats.clone(),
        });
        let worker = self
            .inner
            .broker
            .start_worker(queue, runner, concurrency)
            .await?;
        info!(queue = %queue, concurrency, "Handler registered");
        Ok(self.inner.registry.insert_worker(queue, worker))
    }

    /// Closes every worker, then every queue, then every event subscription.
    ///
    /// Failures are logged and collected; the remaining resources are still
    /// closed. Calling it again does nothing.
    pub async fn close(&self) -> CloseReport {
        let mut report = CloseReport::default();
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return report;
        }
        let drained = {
            let _guard = self.inner.setup.lock().await;
            self.inner.registry.drain()
        };

        for worker in drained.workers {
            let result = worker.close().await;
            report.record(format!("worker:{}", worker.queue()), result);
        }
        for queue in drained.queues {
            let result = queue.close().await;
            report.record(format!("queue:{}", queue.name()), result);
        }
        for events in drained.events {
            let result = events.close().await;
            report.record(format!("events:{}", events.queue()), result);
        }

        info!(
            closed = report.closed,
            failed = report.failures.len(),
            "Dispatch engine closed"
        );
        report
    }
}

/// Wraps a handler with the rate-limit gate and outcome translation.
struct JobRunner {
    queue: Arc<dyn QueueHandle>,
    handler: Arc<dyn Handler>,
    limiter: Arc<RateLimiter>,
    stats: Arc<DispatchStats>,
}

impl JobRunner {
    /// Puts a fresh copy of the job back with `delay`, then drops this attempt.
    async fn defer(&self, job: &ActiveJob, tier: Tier, delay: Duration) {
        match self.queue.requeue(job, delay).await {
            Ok(new_id) => {
                job.discard();
                DispatchStats::bump(&self.stats.deferred);
                debug!(
                    queue = %job.queue(),
                    job_id = %job.id(),
                    new_job_id = %new_id,
                    tier = %tier,
                    delay_ms = delay.as_millis() as u64,
                    "Rate limited, job requeued"
                );
            }
            Err(e) => {
                // keep the job instead of losing it
                self.fail(job, format!("failed to requeue rate-limited job: {e}"), true);
            }
        }
    }

    fn fail(&self, job: &ActiveJob, error: String, retryable: bool) {
        DispatchStats::bump(&self.stats.failed);
        warn!(queue = %job.queue(), job_id = %job.id(), retryable, error = %error, "Job attempt failed");
        job.move_to_failed(error, retryable);
    }
}

#[async_trait]
impl JobProcessor for JobRunner {
    async fn process(&self, job: &ActiveJob) {
        match self.limiter.check(job.queue(), job.data()).await {
            Ok(Gate::Pass) => {}
            Ok(Gate::Deferred { tier, delay }) => {
                self.defer(job, tier, delay).await;
                return;
            }
            Err(e) => {
                self.fail(job, format!("rate limit check failed: {e}"), true);
                return;
            }
        }

        let outcome = AssertUnwindSafe(self.handler.handle(job.data().clone()))
            .catch_unwind()
            .await;
        match outcome {
            Ok(HandlerOutcome::Success) => {
                job.update_progress(100);
                DispatchStats::bump(&self.stats.dispatched);
            }
            Ok(HandlerOutcome::Retryable(message)) => {
                self.fail(job, DispatchError::HandlerFailure(message).to_string(), true);
            }
            Ok(HandlerOutcome::Terminal(message)) => {
                self.fail(job, DispatchError::HandlerFailure(message).to_string(), false);
            }
            Err(panic) => {
                let message = format!("handler panicked: {}", panic_message(panic.as_ref()));
                error!(queue = %job.queue(), job_id = %job.id(), "{message}");
                self.fail(job, DispatchError::HandlerFailure(message).to_string(), true);
            }
        }
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> &str {
    if let Some(message) = panic.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = panic.downcast_ref::<String>() {
        message
    } else {
        "unknown panic"
    }
}
