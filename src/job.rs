//! Job identity, dispatch options and the handler contract.

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Broker-assigned (or caller-supplied) job identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(pub String);

impl JobId {
    /// Generate a fresh random id.
    pub fn generate() -> Self {
        Self(nanoid::nanoid!(12))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for JobId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// How the wait between failed attempts grows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackoffKind {
    Fixed,
    Exponential,
}

/// Backoff policy applied by the broker to handler failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Backoff {
    #[serde(rename = "type")]
    pub kind: BackoffKind,
    #[serde(with = "duration_ms")]
    pub delay: Duration,
}

impl Backoff {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Fixed,
            delay,
        }
    }

    pub fn exponential(delay: Duration) -> Self {
        Self {
            kind: BackoffKind::Exponential,
            delay,
        }
    }

    /// Delay before the next attempt, given how many attempts already failed.
    pub fn delay_for(&self, attempts_made: u32) -> Duration {
        match self.kind {
            BackoffKind::Fixed => self.delay,
            BackoffKind::Exponential => {
                let exponent = attempts_made.saturating_sub(1).min(31);
                self.delay.saturating_mul(2u32.saturating_pow(exponent))
            }
        }
    }
}

/// Per-call dispatch options. Unset fields fall back to the engine defaults.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DispatchOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attempts: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub backoff: Option<Backoff>,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_duration_ms")]
    pub delay: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl DispatchOptions {
    /// Five attempts, fixed one second backoff.
    pub fn defaults() -> Self {
        Self {
            attempts: Some(5),
            backoff: Some(Backoff::fixed(Duration::from_millis(1000))),
            delay: None,
            job_id: None,
        }
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay: Some(delay),
            ..Self::default()
        }
    }

    pub fn attempts(mut self, attempts: u32) -> Self {
        self.attempts = Some(attempts);
        self
    }

    pub fn backoff(mut self, backoff: Backoff) -> Self {
        self.backoff = Some(backoff);
        self
    }

    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn job_id(mut self, id: impl Into<String>) -> Self {
        self.job_id = Some(id.into());
        self
    }

    /// Layer `self` over `defaults` field by field.
    pub fn merged_over(&self, defaults: &DispatchOptions) -> JobOptions {
        let fallback = Self::defaults();
        JobOptions {
            attempts: self
                .attempts
                .or(defaults.attempts)
                .or(fallback.attempts)
                .unwrap_or(1)
                .max(1),
            backoff: self
                .backoff
                .or(defaults.backoff)
                .or(fallback.backoff)
                .unwrap_or(Backoff::fixed(Duration::ZERO)),
            delay: self.delay.or(defaults.delay).filter(|d| !d.is_zero()),
            job_id: self.job_id.clone().or_else(|| defaults.job_id.clone()),
        }
    }
}

/// Fully resolved options as stored with a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobOptions {
    pub attempts: u32,
    pub backoff: Backoff,
    #[serde(default, skip_serializing_if = "Option::is_none", with = "opt_duration_ms")]
    pub delay: Option<Duration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
}

impl Default for JobOptions {
    fn default() -> Self {
        DispatchOptions::default().merged_over(&DispatchOptions::defaults())
    }
}

/// What a handler reports back for one job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Success,
    /// Failed, the broker may retry within the attempt budget.
    Retryable(String),
    /// Failed, retrying would not help.
    Terminal(String),
}

impl HandlerOutcome {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable(message.into())
    }

    pub fn terminal(message: impl Into<String>) -> Self {
        Self::Terminal(message.into())
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

impl<E: std::fmt::Display> From<std::result::Result<(), E>> for HandlerOutcome {
    fn from(result: std::result::Result<(), E>) -> Self {
        match result {
            Ok(()) => Self::Success,
            Err(err) => Self::Retryable(err.to_string()),
        }
    }
}

/// Application code that performs the side effect of a job.
#[async_trait]
pub trait Handler: Send + Sync + 'static {
    async fn handle(&self, payload: Value) -> HandlerOutcome;
}

#[async_trait]
impl<F, Fut> Handler for F
where
    F: Fn(Value) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerOutcome> + Send + 'static,
{
    async fn handle(&self, payload: Value) -> HandlerOutcome {
        (self)(payload).await
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(value.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(deserializer)?))
    }
}

mod opt_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error> {
        match value {
            Some(d) => serializer.serialize_some(&(d.as_millis() as u64)),
            None => serializer.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_only_keeps_attempt_and_backoff_defaults() {
        let resolved = DispatchOptions::with_delay(Duration::from_millis(1500))
            .merged_over(&DispatchOptions::defaults());
        assert_eq!(resolved.attempts, 5);
        assert_eq!(resolved.backoff, Backoff::fixed(Duration::from_millis(1000)));
        assert_eq!(resolved.delay, Some(Duration::from_millis(1500)));
        assert_eq!(resolved.job_id, None);
    }

    #[test]
    fn caller_options_win_over_defaults() {
        let resolved = DispatchOptions::default()
            .attempts(2)
            .backoff(Backoff::exponential(Duration::from_millis(200)))
            .job_id("abc")
            .merged_over(&DispatchOptions::defaults());
        assert_eq!(resolved.attempts, 2);
        assert_eq!(resolved.backoff.kind, BackoffKind::Exponential);
        assert_eq!(resolved.job_id.as_deref(), Some("abc"));
    }

    #[test]
    fn zero_delay_means_immediate() {
        let resolved = DispatchOptions::with_delay(Duration::ZERO).merged_over(&DispatchOptions::defaults());
        assert_eq!(resolved.delay, None);
    }

    #[test]
    fn exponential_backoff_doubles_per_attempt() {
        let backoff = Backoff::exponential(Duration::from_millis(1000));
        assert_eq!(backoff.delay_for(1), Duration::from_millis(1000));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(2000));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(8000));
        assert_eq!(Backoff::fixed(Duration::from_millis(700)).delay_for(4), Duration::from_millis(700));
    }

    #[test]
    fn options_serialize_with_millisecond_durations() {
        let json = serde_json::to_value(JobOptions::default()).unwrap();
        assert_eq!(json["attempts"], 5);
        assert_eq!(json["backoff"]["type"], "fixed");
        assert_eq!(json["backoff"]["delay"], 1000);
        assert!(json.get("delay").is_none());
    }

    #[test]
    fn handler_outcome_from_result() {
        let ok: std::result::Result<(), String> = Ok(());
        assert!(HandlerOutcome::from(ok).is_success());
        let err: std::result::Result<(), String> = Err("boom".into());
        assert_eq!(HandlerOutcome::from(err), HandlerOutcome::Retryable("boom".into()));
    }
}
