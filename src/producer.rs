use tracing::info;

use crate::engine::DispatchEngine;
use crate::job::JobId;
use crate::payload::{MessagePayload, RecipientKind, SendOptions};
use crate::utils::constants::MESSAGE_GROUP_QUEUE;

/// Fans numbered messages out to a set of chats.
pub struct Broadcaster {
    engine: DispatchEngine,
    queue: String,
    kind: RecipientKind,
    options: SendOptions,
}

impl Broadcaster {
    pub fn new(engine: DispatchEngine) -> Self {
        Self {
            engine,
            queue: MESSAGE_GROUP_QUEUE.to_string(),
            kind: RecipientKind::Group,
            options: SendOptions::html(),
        }
    }

    pub fn queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    pub fn kind(mut self, kind: RecipientKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn options(mut self, options: SendOptions) -> Self {
        self.options = options;
        self
    }

    /// Builds the `count` messages for one chat.
    pub fn messages(&self, chat_id: i64, count: usize) -> Vec<MessagePayload> {
        (0..count)
            .map(|i| MessagePayload {
                kind: self.kind,
                chat_id,
                message: format!("{i} Random message"),
                options: self.options.clone(),
            })
            .collect()
    }

    /// Enqueues `count` messages per chat; returns the ids of the jobs that were persisted.
    pub async fn broadcast(&self, chat_ids: &[i64], count: usize) -> Vec<JobId> {
        let mut ids = Vec::with_capacity(chat_ids.len() * count);
        for &chat_id in chat_ids {
            for message in self.messages(chat_id, count) {
                if let Some(id) = self.engine.enqueue(&self.queue, &message, None).await {
                    ids.push(id);
                }
            }
        }
        info!(
            queue = %self.queue,
            chats = chat_ids.len(),
            enqueued = ids.len(),
            requested = chat_ids.len() * count,
            "Broadcast enqueued"
        );
        ids
    }
}
