use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use redis::{AsyncCommands, Script};
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use super::{
    idle, ActiveJob, Broker, Disposition, EventBus, JobProcessor, QueueCounts, QueueEvent,
    QueueHandle, TaskWorker, WorkerHandle,
};
use crate::config::WorkerSettings;
use crate::error::{DispatchError, Result};
use crate::job::{JobId, JobOptions};
use crate::rdconfig::RedisConnection;
use crate::readiness::ReadyListener;
use crate::utils::constants::{COMPLETED_JOB_TTL_SECS, PREFIX, QUEUES_KEY};

/// Pops the next waiting id and locks it in the active set.
const CLAIM_SCRIPT: &str = r#"
local id = redis.call('LPOP', KEYS[1])
if id then
    redis.call('ZADD', KEYS[2], ARGV[1], id)
end
return id
"#;

/// Moves up to ARGV[2] ids scored at or below ARGV[1] from KEYS[1] to the wait list KEYS[2].
const MOVE_DUE_SCRIPT: &str = r#"
local ids = redis.call('ZRANGEBYSCORE', KEYS[1], '-inf', ARGV[1], 'LIMIT', 0, tonumber(ARGV[2]))
for _, id in ipairs(ids) do
    redis.call('ZREM', KEYS[1], id)
    redis.call('RPUSH', KEYS[2], id)
end
return ids
"#;

/// Stores a new job unless its hash already exists.
///
/// KEYS: job hash, wait list, delayed set, queue index.
/// ARGV: id, queue name, run-at millis or '' for ready now, then hash field/value pairs.
const ADD_SCRIPT: &str = r#"
if redis.call('EXISTS', KEYS[1]) == 1 then
    return 0
end
redis.call('HSET', KEYS[1], unpack(ARGV, 4))
if ARGV[3] == '' then
    redis.call('RPUSH', KEYS[2], ARGV[1])
else
    redis.call('ZADD', KEYS[3], ARGV[3], ARGV[1])
end
redis.call('SADD', KEYS[4], ARGV[2])
return 1
"#;

/// Swaps a claimed job for a delayed copy.
///
/// KEYS: claimed job hash, active set, copy hash, delayed set.
/// ARGV: claimed id, copy id, run-at millis, then hash field/value pairs.
const REQUEUE_SCRIPT: &str = r#"
redis.call('ZREM', KEYS[2], ARGV[1])
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[3], unpack(ARGV, 4))
redis.call('ZADD', KEYS[4], ARGV[3], ARGV[2])
return 1
"#;

/// Drops a claimed job whose hash still carries the claimed token.
///
/// KEYS: job hash, active set. ARGV: id, token.
const DISCARD_SCRIPT: &str = r#"
local token = redis.call('HGET', KEYS[1], 'token') or ''
if token ~= ARGV[2] then
    return 0
end
redis.call('DEL', KEYS[1])
redis.call('ZREM', KEYS[2], ARGV[1])
return 1
"#;

/// Hash fields of a freshly stored job.
fn job_fields(
    job_name: &str,
    data: &Value,
    opts: &JobOptions,
    status: &str,
) -> Result<Vec<(&'static str, String)>> {
    Ok(vec![
        ("name", job_name.to_string()),
        ("data", serde_json::to_string(data)?),
        ("opts", serde_json::to_string(opts)?),
        ("attemptsMade", "0".to_string()),
        ("status", status.to_string()),
        ("progress", "0".to_string()),
        ("token", nanoid::nanoid!()),
        ("createdAt", Utc::now().to_rfc3339()),
    ])
}

fn run_at(delay: Duration) -> i64 {
    Utc::now().timestamp_millis() + delay.as_millis() as i64
}

/// Redis keys of one queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueKeys {
    queue: String,
}

impl QueueKeys {
    pub fn new(queue: impl Into<String>) -> Self {
        Self { queue: queue.into() }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Job hash.
    pub fn job(&self, id: &str) -> String {
        format!("{PREFIX}:{}:job:{id}", self.queue)
    }

    /// Ready job ids (LIST).
    pub fn wait(&self) -> String {
        format!("{PREFIX}:{}:wait", self.queue)
    }

    /// Delayed and backing-off job ids scored by run-at millis (ZSET).
    pub fn delayed(&self) -> String {
        format!("{PREFIX}:{}:delayed", self.queue)
    }

    /// Claimed job ids scored by lock deadline millis (ZSET).
    pub fn active(&self) -> String {
        format!("{PREFIX}:{}:active", self.queue)
    }

    /// Terminally failed job ids scored by failure time (ZSET).
    pub fn failed(&self) -> String {
        format!("{PREFIX}:{}:failed", self.queue)
    }

    /// Completed job counter.
    pub fn completed(&self) -> String {
        format!("{PREFIX}:{}:completed", self.queue)
    }
}

/// Broker keeping queues in Redis, shared by every process on the same instance.
pub struct RedisBroker {
    conn: RedisConnection,
    settings: WorkerSettings,
    events: EventBus,
}

impl RedisBroker {
    pub fn new(conn: RedisConnection) -> Self {
        Self {
            conn,
            settings: WorkerSettings::default(),
            events: EventBus::default(),
        }
    }

    pub fn with_settings(mut self, settings: WorkerSettings) -> Self {
        self.settings = settings;
        self
    }

    pub async fn known_queues(&self) -> Result<Vec<String>> {
        let mut conn = self.conn.manager()?;
        let mut queues: Vec<String> = conn.smembers(QUEUES_KEY).await?;
        queues.sort();
        Ok(queues)
    }

    pub async fn queue_counts(&self, name: &str) -> Result<QueueCounts> {
        let keys = QueueKeys::new(name);
        let mut conn = self.conn.manager()?;
        let (waiting, delayed, active, failed, completed): (u64, u64, u64, u64, Option<u64>) = redis::pipe()
            .llen(keys.wait())
            .zcard(keys.delayed())
            .zcard(keys.active())
            .zcard(keys.failed())
            .get(keys.completed())
            .query_async(&mut conn)
            .await?;
        Ok(QueueCounts {
            waiting,
            delayed,
            active,
            failed,
            completed: completed.unwrap_or(0),
        })
    }
}

#[async_trait]
impl Broker for RedisBroker {
    fn readiness(&self) -> ReadyListener {
        self.conn.listener()
    }

    async fn open_queue(&self, name: &str) -> Result<Arc<dyn QueueHandle>> {
        Ok(Arc::new(RedisQueue {
            conn: self.conn.clone(),
            keys: QueueKeys::new(name),
            closed: AtomicBool::new(false),
            add: Script::new(ADD_SCRIPT),
            requeue: Script::new(REQUEUE_SCRIPT),
        }))
    }

    async fn start_worker(
        &self,
        name: &str,
        processor: Arc<dyn JobProcessor>,
        concurrency: usize,
    ) -> Result<Arc<dyn WorkerHandle>> {
        let concurrency = concurrency.max(1);
        let core = Arc::new(WorkerCore {
            conn: self.conn.clone(),
            keys: QueueKeys::new(name),
            settings: self.settings.clone(),
            processor,
            events: self.events.sender(name),
            claim: Script::new(CLAIM_SCRIPT),
            move_due: Script::new(MOVE_DUE_SCRIPT),
            discard: Script::new(DISCARD_SCRIPT),
        });
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut tasks = JoinSet::new();
        for worker_id in 0..concurrency {
            let core = core.clone();
            let shutdown = shutdown_rx.clone();
            tasks.spawn(async move { core.fetch_loop(worker_id, shutdown).await });
        }
        let maintenance = core.clone();
        tasks.spawn(async move { maintenance.maintenance_loop(shutdown_rx).await });

        info!(queue = %name, concurrency, "Worker pool started");
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

struct RedisQueue {
    conn: RedisConnection,
    keys: QueueKeys,
    closed: AtomicBool,
    add: Script,
    requeue: Script,
}

impl RedisQueue {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(DispatchError::QueueClosed(self.keys.queue().to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl QueueHandle for RedisQueue {
    fn name(&self) -> &str {
        self.keys.queue()
    }

    async fn add(&self, job_name: &str, data: Value, opts: JobOptions) -> Result<JobId> {
        self.ensure_open()?;
        let mut conn = self.conn.manager()?;

        let id = opts.job_id.as_deref().map(JobId::from).unwrap_or_else(JobId::generate);
        let status = if opts.delay.is_some() { "delayed" } else { "waiting" };
        let fields = job_fields(job_name, &data, &opts, status)?;
        let run_at = opts.delay.map(|delay| run_at(delay).to_string()).unwrap_or_default();

        let mut invocation = self.add.prepare_invoke();
        invocation
            .key(self.keys.job(id.as_str()))
            .key(self.keys.wait())
            .key(self.keys.delayed())
            .key(QUEUES_KEY)
            .arg(id.as_str())
            .arg(self.keys.queue())
            .arg(run_at);
        for (field, value) in &fields {
            invocation.arg(*field).arg(value);
        }
        let added: i64 = invocation.invoke_async(&mut conn).await?;
        if added == 0 {
            debug!(queue = %self.keys.queue(), job_id = %id, "Job id already present, not added");
        }
        Ok(id)
    }

    async fn requeue(&self, job: &ActiveJob, delay: Duration) -> Result<JobId> {
        self.ensure_open()?;
        let mut conn = self.conn.manager()?;

        let opts = job.requeue_options(delay);
        let id = opts.job_id.as_deref().map(JobId::from).unwrap_or_else(JobId::generate);
        let fields = job_fields(job.name(), job.data(), &opts, "delayed")?;

        let mut invocation = self.requeue.prepare_invoke();
        invocation
            .key(self.keys.job(job.id().as_str()))
            .key(self.keys.active())
            .key(self.keys.job(id.as_str()))
            .key(self.keys.delayed())
            .arg(job.id().as_str())
            .arg(id.as_str())
            .arg(run_at(delay));
        for (field, value) in &fields {
            invocation.arg(*field).arg(value);
        }
        invocation.invoke_async::<_, i64>(&mut conn).await?;
        Ok(id)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct WorkerCore {
    conn: RedisConnection,
    keys: QueueKeys,
    settings: WorkerSettings,
    processor: Arc<dyn JobProcessor>,
    events: broadcast::Sender<QueueEvent>,
    claim: Script,
    move_due: Script,
    discard: Script,
}

impl WorkerCore {
    async fn fetch_loop(&self, worker_id: usize, mut shutdown: watch::Receiver<bool>) {
        debug!(queue = %self.keys.queue(), worker_id, "Worker started");
        loop {
            if *shutdown.borrow() {
                break;
            }
            let pause = match self.claim_next().await {
                Ok(Some(id)) => {
                    if let Err(e) = self.run(&id).await {
                        error!(queue = %self.keys.queue(), job_id = %id, error = %e, "Failed to settle job");
                    }
                    continue;
                }
                Ok(None) => self.settings.poll_interval,
                Err(e) => {
                    error!(queue = %self.keys.queue(), worker_id, error = %e, "Worker error");
                    Duration::from_secs(1)
                }
            };
            if idle(&mut shutdown, pause).await {
                break;
            }
        }
        debug!(queue = %self.keys.queue(), worker_id, "Worker stopped");
    }

    async fn maintenance_loop(&self, mut shutdown: watch::Receiver<bool>) {
        loop {
            if let Err(e) = self.promote_delayed().await {
                error!(queue = %self.keys.queue(), error = %e, "Failed to promote delayed jobs");
            }
            if let Err(e) = self.reclaim_stalled().await {
                error!(queue = %self.keys.queue(), error = %e, "Failed to reclaim stalled jobs");
            }
            if idle(&mut shutdown, self.settings.maintenance_interval).await {
                break;
            }
        }
    }

    fn lock_deadline(&self) -> i64 {
        Utc::now().timestamp_millis() + self.settings.lock_duration.as_millis() as i64
    }

    async fn claim_next(&self) -> Result<Option<String>> {
        let mut conn = self.conn.manager()?;
        let id: Option<String> = self
            .claim
            .key(self.keys.wait())
            .key(self.keys.active())
            .arg(self.lock_deadline())
            .invoke_async(&mut conn)
            .await?;
        Ok(id)
    }

    async fn promote_delayed(&self) -> Result<()> {
        let mut conn = self.conn.manager()?;
        let moved: Vec<String> = self
            .move_due
            .key(self.keys.delayed())
            .key(self.keys.wait())
            .arg(Utc::now().timestamp_millis())
            .arg(self.settings.batch_size)
            .invoke_async(&mut conn)
            .await?;
        if !moved.is_empty() {
            debug!(queue = %self.keys.queue(), count = moved.len(), "Moved delayed jobs to wait list");
        }
        Ok(())
    }

    async fn reclaim_stalled(&self) -> Result<()> {
        let mut conn = self.conn.manager()?;
        let stalled: Vec<String> = self
            .move_due
            .key(self.keys.active())
            .key(self.keys.wait())
            .arg(Utc::now().timestamp_millis())
            .arg(self.settings.batch_size)
            .invoke_async(&mut conn)
            .await?;
        for id in stalled {
            warn!(queue = %self.keys.queue(), job_id = %id, "Job lock expired, moved back to wait list");
            let _ = self.events.send(QueueEvent::Stalled { job_id: JobId(id) });
        }
        Ok(())
    }

    async fn extend_lock(&self, id: &JobId) -> Result<()> {
        let mut conn = self.conn.manager()?;
        redis::cmd("ZADD")
            .arg(self.keys.active())
            .arg("XX")
            .arg(self.lock_deadline())
            .arg(id.as_str())
            .query_async::<_, ()>(&mut conn)
            .await?;
        Ok(())
    }

    async fn run(&self, id: &str) -> Result<()> {
        let mut conn = self.conn.manager()?;
        let job_id = JobId::from(id);
        let job_key = self.keys.job(id);
        let fields: HashMap<String, String> = conn.hgetall(&job_key).await?;
        if fields.is_empty() {
            warn!(queue = %self.keys.queue(), job_id = %job_id, "Claimed job has no data, dropping");
            conn.zrem::<_, _, ()>(self.keys.active(), id).await?;
            return Ok(());
        }

        let token = fields.get("token").cloned().unwrap_or_default();
        let job = match self.load(job_id.clone(), &fields) {
            Ok(job) => job,
            Err(e) => {
                error!(queue = %self.keys.queue(), job_id = %job_id, error = %e, "Failed to parse job, moving to failed");
                let disposition = Disposition::Failed {
                    attempts_made: 0,
                    error: e.to_string(),
                };
                self.persist(&job_id, &token, &disposition, 0).await?;
                return Ok(());
            }
        };

        conn.hset_multiple::<_, _, _, ()>(
            &job_key,
            &[("status", "active".to_string()), ("processedOn", Utc::now().to_rfc3339())],
        )
        .await?;

        self.process_locked(&job).await;

        let disposition = job.disposition();
        self.persist(&job_id, &token, &disposition, job.progress()).await?;
        if let Some(event) = disposition.event(&job_id) {
            let _ = self.events.send(event);
        }
        Ok(())
    }

    fn load(&self, id: JobId, fields: &HashMap<String, String>) -> Result<ActiveJob> {
        let field = |name: &str| {
            fields
                .get(name)
                .ok_or_else(|| DispatchError::Config(format!("job hash is missing '{name}'")))
        };
        let data: Value = serde_json::from_str(field("data")?)?;
        let opts: JobOptions = serde_json::from_str(field("opts")?)?;
        let attempts_made = fields
            .get("attemptsMade")
            .and_then(|raw| raw.parse().ok())
            .unwrap_or(0);
        let name = fields.get("name").cloned().unwrap_or_else(|| self.keys.queue().to_string());
        Ok(ActiveJob::new(id, self.keys.queue(), name, data, opts, attempts_made))
    }

    /// Runs the processor while keeping the job's lock fresh.
    async fn process_locked(&self, job: &ActiveJob) {
        let period = (self.settings.lock_duration / 2).max(Duration::from_millis(10));
        let renew = async {
            let mut tick = tokio::time::interval(period);
            tick.tick().await;
            loop {
                tick.tick().await;
                if let Err(e) = self.extend_lock(job.id()).await {
                    warn!(queue = %self.keys.queue(), job_id = %job.id(), error = %e, "Failed to extend job lock");
                }
            }
        };
        tokio::select! {
            _ = self.processor.process(job) => {}
            _ = renew => {}
        }
    }

    async fn persist(
        &self,
        id: &JobId,
        token: &str,
        disposition: &Disposition,
        progress: u8,
    ) -> Result<()> {
        let mut conn = self.conn.manager()?;
        let job_key = self.keys.job(id.as_str());
        let now = Utc::now();

        if let Disposition::Discarded = disposition {
            // a requeued copy may already own this id
            self.discard
                .key(&job_key)
                .key(self.keys.active())
                .arg(id.as_str())
                .arg(token)
                .invoke_async::<_, i64>(&mut conn)
                .await?;
            return Ok(());
        }

        let mut pipe = redis::pipe();
        pipe.atomic().zrem(self.keys.active(), id.as_str()).ignore();
        match disposition {
            Disposition::Completed => {
                let fields = [
                    ("status", "completed".to_string()),
                    ("progress", progress.to_string()),
                    ("finishedOn", now.to_rfc3339()),
                ];
                pipe.hset_multiple(&job_key, &fields)
                    .ignore()
                    .expire(&job_key, COMPLETED_JOB_TTL_SECS)
                    .ignore()
                    .incr(self.keys.completed(), 1)
                    .ignore();
            }
            Disposition::Retry {
                delay,
                attempts_made,
                error,
            } => {
                let fields = [
                    ("status", "delayed".to_string()),
                    ("attemptsMade", attempts_made.to_string()),
                    ("failedReason", error.clone()),
                ];
                pipe.hset_multiple(&job_key, &fields)
                    .ignore()
                    .zadd(self.keys.delayed(), id.as_str(), run_at(*delay))
                    .ignore();
            }
            Disposition::Failed { attempts_made, error } => {
                let fields = [
                    ("status", "failed".to_string()),
                    ("attemptsMade", attempts_made.to_string()),
                    ("failedReason", error.clone()),
                    ("finishedOn", now.to_rfc3339()),
                ];
                pipe.hset_multiple(&job_key, &fields)
                    .ignore()
                    .zadd(self.keys.failed(), id.as_str(), now.timestamp_millis())
                    .ignore();
            }
            Disposition::Discarded => {}
        }
        pipe.query_async::<_, ()>(&mut conn).await?;
        Ok(())
    }
}
