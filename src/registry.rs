use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use crate::broker::{QueueHandle, WorkerHandle};
use crate::events::QueueEvents;

#[derive(Default)]
struct Entries {
    queues: HashMap<String, Arc<dyn QueueHandle>>,
    workers: HashMap<String, Arc<dyn WorkerHandle>>,
    events: HashMap<String, Arc<QueueEvents>>,
}

/// Queues, workers and event subscriptions owned by one engine, at most one of each per queue name.
#[derive(Default)]
pub struct Registry {
    entries: Mutex<Entries>,
}

/// Everything taken out of a [`Registry`] for shutdown.
pub struct Drained {
    pub workers: Vec<Arc<dyn WorkerHandle>>,
    pub queues: Vec<Arc<dyn QueueHandle>>,
    pub events: Vec<Arc<QueueEvents>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Entries> {
        self.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn queue(&self, name: &str) -> Option<Arc<dyn QueueHandle>> {
        self.lock().queues.get(name).cloned()
    }

    /// Registers a queue with its subscription unless one exists; returns the registered queue.
    pub fn insert_queue(
        &self,
        name: &str,
        queue: Arc<dyn QueueHandle>,
        events: QueueEvents,
    ) -> Arc<dyn QueueHandle> {
        let mut entries = self.lock();
        if let Some(existing) = entries.queues.get(name) {
            return existing.clone();
        }
        entries.queues.insert(name.to_string(), queue.clone());
        entries.events.insert(name.to_string(), Arc::new(events));
        queue
    }

    pub fn worker(&self, name: &str) -> Option<Arc<dyn WorkerHandle>> {
        self.lock().workers.get(name).cloned()
    }

    /// Registers a worker unless one exists; returns the registered worker.
    pub fn insert_worker(&self, name: &str, worker: Arc<dyn WorkerHandle>) -> Arc<dyn WorkerHandle> {
        self.lock()
            .workers
            .entry(name.to_string())
            .or_insert(worker)
            .clone()
    }

    pub fn queue_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().queues.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn drain(&self) -> Drained {
        let mut entries = self.lock();
        Drained {
            workers: entries.workers.drain().map(|(_, w)| w).collect(),
            queues: entries.queues.drain().map(|(_, q)| q).collect(),
            events: entries.events.drain().map(|(_, e)| e).collect(),
        }
    }
}
