use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{broadcast, watch, Notify};
use tokio::task::JoinSet;
use tracing::debug;

use super::{
    ActiveJob, Broker, Disposition, EventBus, JobProcessor, QueueCounts, QueueEvent, QueueHandle,
    TaskWorker, WorkerHandle,
};
use crate::config::WorkerSettings;
use crate::error::{DispatchError, Result};
use crate::job::{JobId, JobOptions};
use crate::readiness::{ReadyListener, Readiness};

#[derive(Debug, Clone)]
struct JobRecord {
    id: JobId,
    name: String,
    data: Value,
    opts: JobOptions,
    attempts_made: u32,
    token: u64,
}

/// A job that exhausted its attempts or failed terminally.
#[derive(Debug, Clone, PartialEq)]
pub struct FailedJob {
    pub id: JobId,
    pub data: Value,
    pub error: String,
    pub attempts_made: u32,
}

#[derive(Debug, Default)]
struct QueueInner {
    waiting: VecDeque<JobRecord>,
    delayed: usize,
    active: usize,
    completed: u64,
    failed: Vec<FailedJob>,
    /// Ids not yet settled, with the token of the record that holds them.
    live_ids: HashMap<JobId, u64>,
    next_token: u64,
}

impl QueueInner {
    /// Takes `id` for a new record. `None` if another record holds it.
    fn reserve(&mut self, id: &JobId) -> Option<u64> {
        if self.live_ids.contains_key(id) {
            return None;
        }
        Some(self.hand_over(id))
    }

    /// Gives `id` to a new record, whoever held it before.
    fn hand_over(&mut self, id: &JobId) -> u64 {
        self.next_token += 1;
        self.live_ids.insert(id.clone(), self.next_token);
        self.next_token
    }

    /// Frees `id` unless it was handed over to a newer record.
    fn release(&mut self, id: &JobId, token: u64) {
        if self.live_ids.get(id) == Some(&token) {
            self.live_ids.remove(id);
        }
    }
}

#[derive(Debug)]
struct QueueState {
    name: String,
    inner: Mutex<QueueInner>,
    notify: Notify,
    timers: Mutex<JoinSet<()>>,
}

impl QueueState {
    fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            inner: Mutex::new(QueueInner::default()),
            notify: Notify::new(),
            timers: Mutex::new(JoinSet::new()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn push_ready(&self, record: JobRecord) {
        self.lock().waiting.push_back(record);
        self.notify.notify_one();
    }

    fn timers(&self) -> std::sync::MutexGuard<'_, JoinSet<()>> {
        self.timers.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn schedule(self: &Arc<Self>, record: JobRecord, delay: Duration) {
        self.lock().delayed += 1;
        let state = self.clone();
        let mut timers = self.timers();
        while timers.try_join_next().is_some() {}
        timers.spawn(async move {
            tokio::time::sleep(delay).await;
            {
                let mut inner = state.lock();
                inner.delayed = inner.delayed.saturating_sub(1);
            }
            state.push_ready(record);
        });
    }

    /// Drops every job still waiting for its delay.
    fn cancel_timers(&self) {
        let cancelled = {
            let mut timers = self.timers();
            let pending = timers.len();
            timers.abort_all();
            pending
        };
        self.lock().delayed = 0;
        if cancelled > 0 {
            debug!(queue = %self.name, cancelled, "Cancelled delayed jobs");
        }
    }

    /// Waits for the next ready job. Cancel safe.
    async fn next(&self) -> JobRecord {
        loop {
            {
                let mut inner = self.lock();
                if let Some(record) = inner.waiting.pop_front() {
                    inner.active += 1;
                    return record;
                }
            }
            self.notify.notified().await;
        }
    }

    fn counts(&self) -> QueueCounts {
        let inner = self.lock();
        QueueCounts {
            waiting: inner.waiting.len() as u64,
            delayed: inner.delayed as u64,
            active: inner.active as u64,
            failed: inner.failed.len() as u64,
            completed: inner.completed,
        }
    }
}

/// In-process broker with the same job semantics as the Redis one.
///
/// Jobs do not survive the process.
#[derive(Debug)]
pub struct MemoryBroker {
    readiness: Readiness,
    settings: WorkerSettings,
    queues: Mutex<HashMap<String, Arc<QueueState>>>,
    events: EventBus,
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBroker {
    /// A broker that is ready immediately.
    pub fn new() -> Self {
        let broker = Self::unready();
        broker.mark_ready();
        broker
    }

    /// A broker that stays unavailable until [`MemoryBroker::mark_ready`].
    pub fn unready() -> Self {
        Self {
            readiness: Readiness::new(),
            settings: WorkerSettings::default(),
            queues: Mutex::new(HashMap::new()),
            events: EventBus::default(),
        }
    }

    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn mark_ready(&self) {
        self.readiness.mark_ready();
    }

    fn state(&self, name: &str) -> Arc<QueueState> {
        let mut queues = self.queues.lock().unwrap_or_else(|e| e.into_inner());
        queues
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(QueueState::new(name)))
            .clone()
    }

    pub fn queue_counts(&self, name: &str) -> QueueCounts {
        self.state(name).counts()
    }

    pub fn completed_count(&self, name: &str) -> u64 {
        self.queue_counts(name).completed
    }

    /// Waiting, delayed and active jobs.
    pub fn pending_count(&self, name: &str) -> u64 {
        self.queue_counts(name).pending()
    }

    pub fn failed_jobs(&self, name: &str) -> Vec<FailedJob> {
        self.state(name).lock().failed.clone()
    }
}

#[async_trait]
impl Broker for MemoryBroker {
    fn readiness(&self) -> ReadyListener {
        self.readiness.listener()
    }

    async fn open_queue(&self, name: &str) -> Result<Arc<dyn QueueHandle>> {
        Ok(Arc::new(MemoryQueue {
            state: self.state(name),
            closed: AtomicBool::new(false),
        }))
    }

    async fn start_worker(
        &self,
        name: &str,
        processor: Arc<dyn JobProcessor>,
        concurrency: usize,
    ) -> Result<Arc<dyn WorkerHandle>> {
        let state = self.state(name);
        let events = self.events.sender(name);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let concurrency = concurrency.max(1);

        let mut tasks = JoinSet::new();
        for _ in 0..concurrency {
            let state = state.clone();
            let processor = processor.clone();
            let events = events.clone();
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { run_loop(state, processor, events, shutdown).await });
        }

        Ok(Arc::new(TaskWorker::new(
            name,
            concurrency,
            shutdown_tx,
            self.settings.shutdown_timeout,
            tasks,
        )))
    }

    async fn subscribe_events(&self, name: &str) -> Result<broadcast::Receiver<QueueEvent>> {
        Ok(self.events.subscribe(name))
    }
}

async fn run_loop(
    state: Arc<QueueState>,
    processor: Arc<dyn JobProcessor>,
    events: broadcast::Sender<QueueEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let record = tokio::select! {
            biased;
            _ = shutdown.wait_for(|stop| *stop) => break,
            record = state.next() => record,
        };

        let job = ActiveJob::new(
            record.id.clone(),
            state.name.clone(),
            record.name.clone(),
            record.data.clone(),
            record.opts.clone(),
            record.attempts_made,
        );
        processor.process(&job).await;

        let disposition = job.disposition();
        if let Some(event) = disposition.event(job.id()) {
            let _ = events.send(event);
        }

        let retry = {
            let mut inner = state.lock();
            inner.active -= 1;
            match disposition {
                Disposition::Completed => {
                    inner.completed += 1;
                    inner.release(&record.id, record.token);
                    None
                }
                Disposition::Discarded => {
                    inner.release(&record.id, record.token);
                    None
                }
                Disposition::Failed { attempts_made, error } => {
                    inner.release(&record.id, record.token);
                    inner.failed.push(FailedJob {
                        id: record.id.clone(),
                        data: record.data.clone(),
                        error,
                        attempts_made,
                    });
                    None
                }
                Disposition::Retry { delay, attempts_made, .. } => Some((
                    JobRecord {
                        attempts_made,
                        ..record
                    },
                    delay,
                )),
            }
        };
        if let Some((record, delay)) = retry {
            state.schedule(record, delay);
        }
    }
}

struct MemoryQueue {
    state: Arc<QueueState>,
    closed: AtomicBool,
}

impl MemoryQueue {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::QueueClosed(self.state.name.clone()));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueHandle for MemoryQueue {
    fn name(&self) -> &str {
        &self.state.name
    }

    async fn add(&self, job_name: &str, data: Value, opts: JobOptions) -> Result<JobId> {
        self.ensure_open()?;

        let id = opts.job_id.as_deref().map(JobId::from).unwrap_or_else(JobId::generate);
        let Some(token) = self.state.lock().reserve(&id) else {
            debug!(queue = %self.state.name, job_id = %id, "Job id already present, not added");
            return Ok(id);
        };

        let delay = opts.delay;
        let record = JobRecord {
            id: id.clone(),
            name: job_name.to_string(),
            data,
            opts,
            attempts_made: 0,
            token,
        };
        match delay {
            Some(delay) => self.state.schedule(record, delay),
            None => self.state.push_ready(record),
        }
        Ok(id)
    }

    async fn requeue(&self, job: &ActiveJob, delay: Duration) -> Result<JobId> {
        self.ensure_open()?;

        let opts = job.requeue_options(delay);
        let id = opts.job_id.as_deref().map(JobId::from).unwrap_or_else(JobId::generate);
        let token = {
            let mut inner = self.state.lock();
            if &id != job.id() {
                inner.live_ids.remove(job.id());
            }
            inner.hand_over(&id)
        };
        let record = JobRecord {
            id: id.clone(),
            name: job.name().to_string(),
            data: job.data().clone(),
            opts,
            attempts_made: 0,
            token,
        };
        self.state.schedule(record, delay);
        Ok(id)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        self.state.cancel_timers();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::DispatchOptions;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    struct Counting {
        seen: AtomicUsize,
        fail: bool,
    }

    #[async_trait]
    impl JobProcessor for Counting {
        async fn process(&self, job: &ActiveJob) {
            self.seen.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                job.move_to_failed("nope", true);
            } else {
                job.update_progress(100);
            }
        }
    }

    fn opts(options: DispatchOptions) -> JobOptions {
        options.merged_over(&DispatchOptions::defaults())
    }

    #[tokio::test(start_paused = true)]
    async fn delayed_job_runs_after_delay() {
        let broker = MemoryBroker::new();
        let queue = broker.open_queue("q").await.unwrap();
        let processor = Arc::new(Counting { seen: AtomicUsize::new(0), fail: false });
        let worker = broker.start_worker("q", processor.clone(), 2).await.unwrap();

        queue
            .add("q", json!({"n": 1}), opts(DispatchOptions::with_delay(Duration::from_secs(5))))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(processor.seen.load(Ordering::SeqCst), 0);
        assert_eq!(broker.queue_counts("q").delayed, 1);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(processor.seen.load(Ordering::SeqCst), 1);
        assert_eq!(broker.completed_count("q"), 1);
        worker.close().await.unwrap();
    }

    #[tokio::test(start_paused = true)]
    async fn failures_retry_until_budget_then_fail() {
        let broker = MemoryBroker::new();
        let queue = broker.open_queue("q").await.unwrap();
        let mut events = broker.subscribe_events("q").await.unwrap();
        let processor = Arc::new(Counting { seen: AtomicUsize::new(0), fail: true });
        let _worker = broker.start_worker("q", processor.clone(), 1).await.unwrap();

        queue
            .add("q", json!({"n": 1}), opts(DispatchOptions::default().attempts(3)))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(processor.seen.load(Ordering::SeqCst), 3);
        let failed = broker.failed_jobs("q");
        assert_eq!(failed.len(), 1);
        assert_eq!(failed[0].attempts_made, 3);
        assert_eq!(broker.pending_count("q"), 0);

        let mut terminal = 0;
        while let Ok(event) = events.try_recv() {
            if let QueueEvent::Failed { terminal: true, .. } = event {
                terminal += 1;
            }
        }
        assert_eq!(terminal, 1);
    }

    #[tokio::test]
    async fn explicit_job_id_is_not_added_twice() {
        let broker = MemoryBroker::new();
        let queue = broker.open_queue("q").await.unwrap();
        let first = queue.add("q", json!({}), opts(DispatchOptions::default().job_id("same"))).await.unwrap();
        let second = queue.add("q", json!({}), opts(DispatchOptions::default().job_id("same"))).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(broker.queue_counts("q").waiting, 1);
    }

    struct Deferring {
        seen: Mutex<Vec<JobId>>,
        queue: Mutex<Option<Arc<dyn QueueHandle>>>,
    }

    #[async_trait]
    impl JobProcessor for Deferring {
        async fn process(&self, job: &ActiveJob) {
            let first_attempt = {
                let mut seen = self.seen.lock().unwrap();
                seen.push(job.id().clone());
                seen.len() == 1
            };
            let queue = self.queue.lock().unwrap().clone();
            if let (true, Some(queue)) = (first_attempt, queue) {
                queue.requeue(job, Duration::from_secs(5)).await.unwrap();
                job.discard();
            }
        }
    }

    #[tokio::test(start_paused = true)]
    async fn requeued_copy_keeps_its_explicit_id_reserved() {
        let broker = MemoryBroker::new();
        let queue = broker.open_queue("q").await.unwrap();
        let processor = Arc::new(Deferring {
            seen: Mutex::new(Vec::new()),
            queue: Mutex::new(Some(queue.clone())),
        });
        let _worker = broker.start_worker("q", processor.clone(), 1).await.unwrap();

        let explicit = || opts(DispatchOptions::default().job_id("welcome-7"));
        queue.add("q", json!({"n": 1}), explicit()).await.unwrap();
        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(broker.queue_counts("q").delayed, 1);

        let again = queue.add("q", json!({"n": 2}), explicit()).await.unwrap();
        assert_eq!(again, JobId::from("welcome-7"));
        assert_eq!(broker.queue_counts("q").waiting, 0);

        tokio::time::sleep(Duration::from_secs(5)).await;
        let seen = processor.seen.lock().unwrap().clone();
        assert_eq!(seen, vec![JobId::from("welcome-7"), JobId::from("welcome-7")]);
        assert_eq!(broker.completed_count("q"), 1);
        assert_eq!(broker.pending_count("q"), 0);

        // settled for good, so the id is free again
        queue.add("q", json!({"n": 3}), explicit()).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(broker.completed_count("q"), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn closing_the_queue_cancels_delayed_jobs() {
        let broker = MemoryBroker::new();
        let queue = broker.open_queue("q").await.unwrap();
        let processor = Arc::new(Counting { seen: AtomicUsize::new(0), fail: false });
        let _worker = broker.start_worker("q", processor.clone(), 1).await.unwrap();

        queue
            .add("q", json!({"n": 1}), opts(DispatchOptions::with_delay(Duration::from_secs(5))))
            .await
            .unwrap();
        queue.close().await.unwrap();
        assert_eq!(broker.queue_counts("q").delayed, 0);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(processor.seen.load(Ordering::SeqCst), 0);
        assert_eq!(broker.pending_count("q"), 0);
    }

    #[tokio::test]
    async fn closed_queue_rejects_jobs() {
        let broker = MemoryBroker::new();
        let queue = broker.open_queue("q").await.unwrap();
        queue.close().await.unwrap();
        let err = queue.add("q", json!({}), JobOptions::default()).await.unwrap_err();
        assert!(matches!(err, DispatchError::QueueClosed(_)));
    }
}
