use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::{json, Value};
use tokio::sync::broadcast;
use tokio::time::{sleep_until, Instant};

use notifyq::broker::{ActiveJob, JobProcessor, QueueHandle, WorkerHandle};
use notifyq::job::{Backoff, JobOptions};
use notifyq::{
    Broker, DispatchEngine, DispatchError, DispatchOptions, EngineConfig, Handler, HandlerOutcome,
    JobId, MemoryBroker, MemoryCounterStore, QueueEvent, ReadyListener,
};

#[derive(Clone, Default)]
struct Recorder {
    seen: Arc<Mutex<Vec<Value>>>,
}

impl Recorder {
    fn len(&self) -> usize {
        self.seen.lock().unwrap().len()
    }

    fn payloads(&self) -> Vec<Value> {
        self.seen.lock().unwrap().clone()
    }
}

#[async_trait]
impl Handler for Recorder {
    async fn handle(&self, payload: Value) -> HandlerOutcome {
        self.seen.lock().unwrap().push(payload);
        HandlerOutcome::Success
    }
}

fn setup() -> (Arc<MemoryBroker>, DispatchEngine) {
    let broker = Arc::new(MemoryBroker::new());
    let engine = DispatchEngine::new(
        broker.clone(),
        Arc::new(MemoryCounterStore::new()),
        EngineConfig::default(),
    );
    (broker, engine)
}

fn group_message(chat_id: i64, n: usize) -> Value {
    json!({
        "type": "group",
        "chatId": chat_id,
        "message": format!("{n} Random message"),
        "options": { "parse_mode": "HTML" }
    })
}

#[tokio::test(start_paused = true)]
async fn global_ceiling_spills_into_next_window() {
    let start = Instant::now();
    let (broker, engine) = setup();
    let recorder = Recorder::default();
    engine.register_handler("tasks", recorder.clone(), None).await.unwrap();

    for n in 0..40 {
        let task = json!({"taskType": "noop", "n": n});
        assert!(engine.enqueue("tasks", &task, None).await.is_some());
    }

    sleep_until(start + Duration::from_millis(500)).await;
    assert_eq!(recorder.len(), 30);
    assert_eq!(engine.stats().deferred, 10);
    assert_eq!(broker.pending_count("tasks"), 10);

    sleep_until(start + Duration::from_millis(1500)).await;
    assert_eq!(recorder.len(), 40);
    assert_eq!(broker.completed_count("tasks"), 40);
    assert_eq!(broker.pending_count("tasks"), 0);

    assert!(engine.close().await.is_clean());
}

#[tokio::test(start_paused = true)]
async fn personal_ceiling_defers_until_window_ends() {
    let start = Instant::now();
    let (broker, engine) = setup();
    let recorder = Recorder::default();
    engine.register_handler("message-group", recorder.clone(), None).await.unwrap();

    for n in 0..25 {
        engine.enqueue("message-group", &group_message(-1001, n), None).await;
    }

    sleep_until(start + Duration::from_millis(500)).await;
    assert_eq!(recorder.len(), 20);
    assert_eq!(engine.stats().deferred, 5);
    assert_eq!(broker.queue_counts("message-group").delayed, 5);

    sleep_until(start + Duration::from_secs(59)).await;
    assert_eq!(recorder.len(), 20);

    sleep_until(start + Duration::from_millis(60_500)).await;
    assert_eq!(recorder.len(), 25);

    // requeued jobs carry the original payloads, each delivered once
    let messages: HashSet<String> = recorder
        .payloads()
        .iter()
        .map(|p| p["message"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(messages.len(), 25);
    assert!(recorder.payloads().iter().all(|p| p["options"]["parse_mode"] == "HTML"));

    engine.close().await;
}

#[tokio::test(start_paused = true)]
async fn each_recipient_has_its_own_counter() {
    let start = Instant::now();
    let (_, engine) = setup();
    let recorder = Recorder::default();
    engine.register_handler("message-group", recorder.clone(), None).await.unwrap();

    for n in 0..15 {
        engine.enqueue("message-group", &group_message(-1, n), None).await;
        engine.enqueue("message-group", &group_message(-2, n), None).await;
    }

    sleep_until(start + Duration::from_millis(500)).await;
    assert_eq!(recorder.len(), 30);
    assert_eq!(engine.stats().deferred, 0);
    engine.close().await;
}

#[tokio::test(start_paused = true)]
async fn hundred_messages_to_one_group_are_never_lost() {
    let start = Instant::now();
    let (broker, engine) = setup();
    let recorder = Recorder::default();
    engine.register_handler("message-group", recorder.clone(), None).await.unwrap();

    for n in 0..100 {
        engine.enqueue("message-group", &group_message(5947376037, n), None).await;
    }

    let expected = [
        (500, 20),
        (30_000, 20),
        (60_500, 40),
        (120_500, 60),
        (180_500, 80),
        (240_500, 100),
    ];
    for (at_ms, completed) in expected {
        sleep_until(start + Duration::from_millis(at_ms)).await;
        let counts = broker.queue_counts("message-group");
        assert_eq!(counts.completed, completed, "at {at_ms}ms");
        assert_eq!(counts.completed + counts.pending(), 100, "at {at_ms}ms");
        assert_eq!(recorder.len() as u64, completed);
    }
    assert!(broker.failed_jobs("message-group").is_empty());
    assert!(engine.close().await.is_clean());
}

#[tokio::test(start_paused = true)]
async fn retryable_failures_end_in_failed_after_attempt_budget() {
    let start = Instant::now();
    let (broker, engine) = setup();
    let calls = Arc::new(Mutex::new(0u32));
    let counter = calls.clone();
    engine
        .register_handler(
            "tasks",
            move |_: Value| {
                let counter = counter.clone();
                async move {
                    *counter.lock().unwrap() += 1;
                    HandlerOutcome::retryable("upstream 502")
                }
            },
            Some(1),
        )
        .await
        .unwrap();

    let options = DispatchOptions::default()
        .attempts(3)
        .backoff(Backoff::exponential(Duration::from_secs(1)));
    engine
        .enqueue("tasks", &json!({"taskType": "noop"}), Some(options))
        .await
        .unwrap();

    // attempts at 0s, 1s and 3s
    sleep_until(start + Duration::from_millis(2500)).await;
    assert_eq!(*calls.lock().unwrap(), 2);
    assert!(broker.failed_jobs("tasks").is_empty());

    sleep_until(start + Duration::from_millis(3500)).await;
    assert_eq!(*calls.lock().unwrap(), 3);
    let failed = broker.failed_jobs("tasks");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempts_made, 3);
    assert!(failed[0].error.contains("upstream 502"));
    assert_eq!(engine.stats().failed, 3);

    engine.close().await;
}

#[tokio::test(start_paused = true)]
async fn terminal_failure_is_not_retried() {
    let start = Instant::now();
    let (broker, engine) = setup();
    engine
        .register_handler("tasks", |_: Value| async { HandlerOutcome::terminal("bad input") }, None)
        .await
        .unwrap();
    engine.enqueue("tasks", &json!({"taskType": "noop"}), None).await;

    sleep_until(start + Duration::from_secs(10)).await;
    let failed = broker.failed_jobs("tasks");
    assert_eq!(failed.len(), 1);
    assert_eq!(failed[0].attempts_made, 1);
    engine.close().await;
}

#[tokio::test(start_paused = true)]
async fn panicking_handler_does_not_stop_the_worker() {
    let start = Instant::now();
    let (broker, engine) = setup();
    engine
        .register_handler(
            "tasks",
            |payload: Value| async move {
                if payload["boom"] == true {
                    panic!("handler exploded");
                }
                HandlerOutcome::Success
            },
            Some(1),
        )
        .await
        .unwrap();

    let once = DispatchOptions::default().attempts(1);
    engine.enqueue("tasks", &json!({"taskType": "x", "boom": true}), Some(once)).await;
    engine.enqueue("tasks", &json!({"taskType": "x"}), None).await;

    sleep_until(start + Duration::from_millis(500)).await;
    assert_eq!(broker.completed_count("tasks"), 1);
    let failed = broker.failed_jobs("tasks");
    assert_eq!(failed.len(), 1);
    assert!(failed[0].error.contains("handler exploded"));
    engine.close().await;
}

#[tokio::test(start_paused = true)]
async fn enqueue_before_ready_is_dropped_and_registration_waits() {
    let broker = Arc::new(MemoryBroker::unready());
    let engine = DispatchEngine::new(
        broker.clone(),
        Arc::new(MemoryCounterStore::new()),
        EngineConfig::default(),
    );

    assert!(!engine.is_ready());
    assert_eq!(engine.enqueue("tasks", &json!({"taskType": "x"}), None).await, None);
    assert!(matches!(
        engine.try_enqueue("tasks", &json!({"taskType": "x"}), None).await,
        Err(DispatchError::BrokerUnavailable(_))
    ));
    assert_eq!(engine.stats().dropped, 1);
    assert!(matches!(
        engine.create_queue("tasks").await,
        Err(DispatchError::BrokerUnavailable(_))
    ));
    assert!(engine.queue_names().is_empty());

    let recorder = Recorder::default();
    let registering = {
        let engine = engine.clone();
        let recorder = recorder.clone();
        tokio::spawn(async move { engine.register_handler("tasks", recorder, None).await })
    };
    tokio::time::sleep(Duration::from_secs(5)).await;
    assert!(!registering.is_finished());

    broker.mark_ready();
    registering.await.unwrap().unwrap();
    assert!(engine.is_ready());
    assert_eq!(engine.queue_names(), vec!["tasks".to_string()]);
    engine.create_queue("audit").await.unwrap();

    engine.enqueue("tasks", &json!({"taskType": "x"}), None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(recorder.len(), 1);
    engine.close().await;
}

#[tokio::test(start_paused = true)]
async fn explicit_job_id_is_enqueued_once() {
    let (broker, engine) = setup();
    let options = DispatchOptions::default()
        .delay(Duration::from_secs(5))
        .job_id("refresh:-100");
    let first = engine
        .try_enqueue("tasks", &json!({"taskType": "member-count"}), Some(options.clone()))
        .await
        .unwrap();
    let second = engine
        .try_enqueue("tasks", &json!({"taskType": "member-count"}), Some(options))
        .await
        .unwrap();
    assert_eq!(first, JobId::from("refresh:-100"));
    assert_eq!(first, second);
    assert_eq!(broker.queue_counts("tasks").delayed, 1);
    engine.close().await;
}

#[tokio::test(start_paused = true)]
async fn rate_limited_job_keeps_its_explicit_id() {
    let start = Instant::now();
    let (broker, engine) = setup();
    let recorder = Recorder::default();
    engine.register_handler("message-group", recorder.clone(), None).await.unwrap();

    for n in 0..20 {
        engine.enqueue("message-group", &group_message(-5, n), None).await;
    }
    let digest = json!({"type": "group", "chatId": -5, "message": "daily digest"});
    let once = || DispatchOptions::default().job_id("digest:-5");
    let first = engine.try_enqueue("message-group", &digest, Some(once())).await.unwrap();

    sleep_until(start + Duration::from_millis(500)).await;
    assert_eq!(recorder.len(), 20);
    assert_eq!(engine.stats().deferred, 1);

    // still reserved by the requeued copy
    let second = engine.try_enqueue("message-group", &digest, Some(once())).await.unwrap();
    assert_eq!(first, second);
    let counts = broker.queue_counts("message-group");
    assert_eq!((counts.waiting, counts.delayed), (0, 1));

    sleep_until(start + Duration::from_millis(60_500)).await;
    let digests = recorder
        .payloads()
        .iter()
        .filter(|p| p["message"] == "daily digest")
        .count();
    assert_eq!(digests, 1);
    assert_eq!(broker.completed_count("message-group"), 21);
    assert_eq!(broker.pending_count("message-group"), 0);
    engine.close().await;
}

/// Wraps [`MemoryBroker`], failing to close one queue.
struct FlakyCloseBroker {
    inner: MemoryBroker,
    broken: &'static str,
}

struct BrokenQueue {
    inner: Arc<dyn QueueHandle>,
}

#[async_trait]
impl QueueHandle for BrokenQueue {
    fn name(&self) -> &str {
        self.inner.name()
    }

    async fn add(&self, job_name: &str, data: Value, opts: JobOptions) -> notifyq::Result<JobId> {
        self.inner.add(job_name, data, opts).await
    }

    async fn requeue(&self, job: &ActiveJob, delay: Duration) -> notifyq::Result<JobId> {
        self.inner.requeue(job, delay).await
    }

    async fn close(&self) -> notifyq::Result<()> {
        Err(DispatchError::Config("close refused".to_string()))
    }
}

#[async_trait]
impl Broker for FlakyCloseBroker {
    fn readiness(&self) -> ReadyListener {
        self.inner.readiness()
    }

    async fn open_queue(&self, name: &str) -> notifyq::Result<Arc<dyn QueueHandle>> {
        let queue = self.inner.open_queue(name).await?;
        if name == self.broken {
            return Ok(Arc::new(BrokenQueue { inner: queue }));
        }
        Ok(queue)
    }

    async fn start_worker(
        &self,
        name: &str,
        processor: Arc<dyn JobProcessor>,
        concurrency: usize,
    ) -> notifyq::Result<Arc<dyn WorkerHandle>> {
        self.inner.start_worker(name, processor, concurrency).await
    }

    async fn subscribe_events(&self, name: &str) -> notifyq::Result<broadcast::Receiver<QueueEvent>> {
        self.inner.subscribe_events(name).await
    }
}

#[tokio::test(start_paused = true)]
async fn close_keeps_going_past_a_failing_resource() {
    let broker = Arc::new(FlakyCloseBroker {
        inner: MemoryBroker::new(),
        broken: "message-group",
    });
    let engine = DispatchEngine::new(broker, Arc::new(MemoryCounterStore::new()), EngineConfig::default());

    engine.register_handler("message-group", Recorder::default(), None).await.unwrap();
    engine.register_handler("tasks", Recorder::default(), None).await.unwrap();
    let tasks = engine.create_queue("tasks").await.unwrap();
    let extra = engine.create_queue("audit").await.unwrap();

    let report = engine.close().await;
    // 2 workers, 3 queues, 3 subscriptions, one queue refuses
    assert_eq!(report.closed, 7);
    assert_eq!(report.failures.len(), 1);
    assert!(matches!(
        &report.failures[0],
        DispatchError::ResourceClose { resource, .. } if resource == "queue:message-group"
    ));

    for queue in [tasks, extra] {
        let result = queue.add("x", json!({}), JobOptions::default()).await;
        assert!(matches!(result, Err(DispatchError::QueueClosed(_))));
    }

    // closing twice is a no-op
    let again = engine.close().await;
    assert_eq!(again.closed, 0);
    assert!(again.is_clean());
}

#[tokio::test(start_paused = true)]
async fn lifecycle_events_are_published() {
    let start = Instant::now();
    let (broker, engine) = setup();
    let mut events = broker.subscribe_events("tasks").await.unwrap();
    engine.register_handler("tasks", Recorder::default(), None).await.unwrap();
    let id = engine.enqueue("tasks", &json!({"taskType": "x"}), None).await.unwrap();

    sleep_until(start + Duration::from_millis(100)).await;
    assert_eq!(events.recv().await.unwrap(), QueueEvent::Completed { job_id: id });
    engine.close().await;
}
