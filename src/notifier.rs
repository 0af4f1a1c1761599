//! Outbound messaging client seam.

use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use tracing::info;

use crate::error::Result;
use crate::payload::SendOptions;

#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_message(&self, recipient_id: i64, body: &str, options: &SendOptions) -> Result<()>;

    async fn get_member_count(&self, recipient_id: i64) -> Result<u64>;
}

/// Notifier that only logs what it would send.
#[derive(Debug, Default)]
pub struct LogNotifier {
    sent: AtomicU64,
}

impl LogNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> u64 {
        self.sent.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl Notifier for LogNotifier {
    async fn send_message(&self, recipient_id: i64, body: &str, options: &SendOptions) -> Result<()> {
        self.sent.fetch_add(1, Ordering::Relaxed);
        info!(
            recipient_id,
            parse_mode = options.parse_mode.as_deref().unwrap_or("plain"),
            body = %body,
            "Message sent"
        );
        Ok(())
    }

    async fn get_member_count(&self, recipient_id: i64) -> Result<u64> {
        info!(recipient_id, "Member count requested");
        Ok(0)
    }
}
