//! Job payloads as they travel through the broker.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of chat a message is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RecipientKind {
    Group,
    Supergroup,
    Channel,
    #[serde(alias = "private")]
    Direct,
}

impl RecipientKind {
    pub fn is_direct(self) -> bool {
        matches!(self, Self::Direct)
    }
}

/// Options forwarded verbatim to the notifier.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SendOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parse_mode: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub disable_notification: Option<bool>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SendOptions {
    pub fn html() -> Self {
        Self {
            parse_mode: Some("HTML".to_string()),
            ..Self::default()
        }
    }
}

/// One outbound message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MessagePayload {
    #[serde(rename = "type")]
    pub kind: RecipientKind,
    #[serde(alias = "recipientId")]
    pub chat_id: i64,
    pub message: String,
    #[serde(default)]
    pub options: SendOptions,
}

/// An auxiliary task; `taskType` selects the behavior, the rest is task specific.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskPayload {
    pub task_type: String,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl TaskPayload {
    pub fn new(task_type: impl Into<String>) -> Self {
        Self {
            task_type: task_type.into(),
            fields: Map::new(),
        }
    }

    pub fn field(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.fields.insert(key.into(), value.into());
        self
    }

    pub fn chat_id(&self) -> Option<i64> {
        self.fields
            .get("chatId")
            .or_else(|| self.fields.get("recipientId"))
            .and_then(Value::as_i64)
    }
}

/// Everything the engine knows how to dispatch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Payload {
    Message(MessagePayload),
    Task(TaskPayload),
}

/// Who a job is addressed to, as far as the personal limiter cares.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Recipient {
    pub identity: String,
    pub direct: bool,
}

impl Recipient {
    /// Reads `chatId`/`recipientId` and `type` from a raw payload.
    ///
    /// Payloads without a recipient (most tasks) yield `None`.
    pub fn from_payload(payload: &Value) -> Option<Self> {
        let id = payload.get("chatId").or_else(|| payload.get("recipientId"))?;
        let identity = match id {
            Value::Number(n) => n.to_string(),
            Value::String(s) if !s.is_empty() => s.clone(),
            _ => return None,
        };
        let direct = payload
            .get("type")
            .and_then(|kind| serde_json::from_value::<RecipientKind>(kind.clone()).ok())
            .map(RecipientKind::is_direct)
            .unwrap_or(false);
        Some(Self { identity, direct })
    }
}
