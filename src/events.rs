//! Per-queue subscription that logs job lifecycle events.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use tokio::sync::broadcast::{self, error::RecvError, error::TryRecvError};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::QueueEvent;
use crate::error::{DispatchError, Result};

pub struct QueueEvents {
    queue: String,
    stop: watch::Sender<bool>,
    logged: Arc<AtomicU64>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl QueueEvents {
    /// Spawns the logging task over `rx`.
    pub fn spawn(queue: impl Into<String>, mut rx: broadcast::Receiver<QueueEvent>) -> Self {
        let queue = queue.into();
        let name = queue.clone();
        let (stop, mut stopped) = watch::channel(false);
        let logged = Arc::new(AtomicU64::new(0));
        let counter = logged.clone();
        let task = tokio::spawn(async move {
            let log = |event: &QueueEvent| {
                log_event(&name, event);
                counter.fetch_add(1, Ordering::Relaxed);
            };
            loop {
                tokio::select! {
                    biased;
                    received = rx.recv() => match received {
                        Ok(event) => log(&event),
                        Err(RecvError::Lagged(skipped)) => {
                            warn!(queue = %name, skipped, "Event subscriber lagged");
                        }
                        Err(RecvError::Closed) => break,
                    },
                    _ = stopped.wait_for(|stop| *stop) => {
                        loop {
                            match rx.try_recv() {
                                Ok(event) => log(&event),
                                Err(TryRecvError::Lagged(skipped)) => {
                                    warn!(queue = %name, skipped, "Event subscriber lagged");
                                }
                                Err(_) => break,
                            }
                        }
                        break;
                    }
                }
            }
            debug!(queue = %name, "Event subscription stopped");
        });
        Self {
            queue,
            stop,
            logged,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    /// Events logged so far.
    pub fn logged(&self) -> u64 {
        self.logged.load(Ordering::Relaxed)
    }

    /// Logs the events already buffered, then ends the subscription.
    pub async fn close(&self) -> Result<()> {
        let task = self
            .task
            .lock()
            .map_err(|_| self.close_error("subscription lock poisoned".to_string()))?
            .take();
        let Some(task) = task else {
            return Ok(());
        };
        let _ = self.stop.send(true);
        task.await.map_err(|e| self.close_error(e.to_string()))
    }

    fn close_error(&self, reason: String) -> DispatchError {
        DispatchError::ResourceClose {
            resource: format!("events:{}", self.queue),
            reason,
        }
    }
}

impl Drop for QueueEvents {
    fn drop(&mut self) {
        if let Ok(mut task) = self.task.lock() {
            if let Some(task) = task.take() {
                task.abort();
            }
        }
    }
}

fn log_event(queue: &str, event: &QueueEvent) {
    match event {
        QueueEvent::Completed { job_id } => {
            info!(queue = %queue, job_id = %job_id, "Job completed");
        }
        QueueEvent::Failed {
            job_id,
            error,
            attempts_made,
            terminal: false,
        } => {
            warn!(queue = %queue, job_id = %job_id, attempts_made, error = %error, "Job failed, will retry");
        }
        QueueEvent::Failed {
            job_id,
            error,
            attempts_made,
            terminal: true,
        } => {
            error!(queue = %queue, job_id = %job_id, attempts_made, error = %error, "Job failed");
        }
        QueueEvent::Stalled { job_id } => {
            warn!(queue = %queue, job_id = %job_id, "Job stalled");
        }
    }
}
