//! Handlers shipped with the crate.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, info};

use crate::job::{Handler, HandlerOutcome};
use crate::notifier::Notifier;
use crate::payload::{MessagePayload, Payload, TaskPayload};
use crate::store::{Collection, DynCounterStore};
use crate::utils::constants::MEMBER_COUNT_COLLECTION;

pub const MEMBER_COUNT_TASK: &str = "member-count";

/// Sends message payloads through a [`Notifier`].
pub struct MessageHandler {
    notifier: Arc<dyn Notifier>,
}

impl MessageHandler {
    pub fn new(notifier: Arc<dyn Notifier>) -> Self {
        Self { notifier }
    }
}

#[async_trait]
impl Handler for MessageHandler {
    async fn handle(&self, payload: Value) -> HandlerOutcome {
        let message: MessagePayload = match serde_json::from_value(payload) {
            Ok(message) => message,
            Err(e) => return HandlerOutcome::terminal(format!("invalid message payload: {e}")),
        };
        self.notifier
            .send_message(message.chat_id, &message.message, &message.options)
            .await
            .into()
    }
}

/// Runs auxiliary tasks selected by `taskType`.
pub struct TaskHandler {
    notifier: Arc<dyn Notifier>,
    member_counts: Collection<u64>,
}

impl TaskHandler {
    pub fn new(notifier: Arc<dyn Notifier>, store: DynCounterStore) -> Self {
        Self {
            notifier,
            member_counts: Collection::new(store, MEMBER_COUNT_COLLECTION),
        }
    }

    async fn refresh_member_count(&self, task: &TaskPayload) -> HandlerOutcome {
        let Some(chat_id) = task.chat_id() else {
            return HandlerOutcome::terminal("member-count task without chatId");
        };
        let count = match self.notifier.get_member_count(chat_id).await {
            Ok(count) => count,
            Err(e) => return HandlerOutcome::retryable(e.to_string()),
        };
        let identifier = chat_id.to_string();
        if let Err(e) = self.member_counts.set(&identifier, &count).await {
            return HandlerOutcome::retryable(e.to_string());
        }
        info!(chat_id, count, "Member count refreshed");
        HandlerOutcome::Success
    }
}

#[async_trait]
impl Handler for TaskHandler {
    async fn handle(&self, payload: Value) -> HandlerOutcome {
        let task = match serde_json::from_value::<Payload>(payload) {
            Ok(Payload::Task(task)) => task,
            Ok(Payload::Message(_)) => return HandlerOutcome::terminal("message payload on task queue"),
            Err(e) => return HandlerOutcome::terminal(format!("invalid task payload: {e}")),
        };
        match task.task_type.as_str() {
            MEMBER_COUNT_TASK => self.refresh_member_count(&task).await,
            other => {
                debug!(task_type = %other, "Unknown task type");
                HandlerOutcome::terminal(format!("unknown task type '{other}'"))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{DispatchError, Result};
    use crate::notifier::LogNotifier;
    use crate::payload::SendOptions;
    use crate::store::MemoryCounterStore;
    use serde_json::json;

    struct FlakyNotifier;

    #[async_trait]
    impl Notifier for FlakyNotifier {
        async fn send_message(&self, _: i64, _: &str, _: &SendOptions) -> Result<()> {
            Err(DispatchError::HandlerFailure("429 Too Many Requests".to_string()))
        }

        async fn get_member_count(&self, _: i64) -> Result<u64> {
            Ok(0)
        }
    }

    #[tokio::test]
    async fn message_handler_sends_and_reports_errors() {
        let notifier = Arc::new(LogNotifier::new());
        let handler = MessageHandler::new(notifier.clone());
        let payload = json!({"type": "group", "chatId": -1, "message": "hello"});
        assert!(handler.handle(payload.clone()).await.is_success());
        assert_eq!(notifier.sent(), 1);

        let flaky = MessageHandler::new(Arc::new(FlakyNotifier));
        assert!(matches!(flaky.handle(payload).await, HandlerOutcome::Retryable(_)));

        let invalid = handler.handle(json!({"message": 1})).await;
        assert!(matches!(invalid, HandlerOutcome::Terminal(_)));
    }

    #[tokio::test]
    async fn member_count_task_caches_the_count() {
        let store: DynCounterStore = Arc::new(MemoryCounterStore::new());
        let handler = TaskHandler::new(Arc::new(LogNotifier::new()), store.clone());

        let outcome = handler.handle(json!({"taskType": "member-count", "chatId": 99})).await;
        assert!(outcome.is_success());
        assert_eq!(store.get("member_count:99").await.unwrap().as_deref(), Some("0"));

        let unknown = handler.handle(json!({"taskType": "reindex"})).await;
        assert!(matches!(unknown, HandlerOutcome::Terminal(_)));
    }
}
