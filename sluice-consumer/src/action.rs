//! Downstream actions run on every pulled message before it is acknowledged.

use async_trait::async_trait;
use sluice_core::config::{ActionKind, ActionSettings};
use sluice_core::{Error, Message, Result};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Work performed on a message between receive and acknowledge.
#[async_trait]
pub trait Action: Send + Sync + fmt::Debug {
    /// Process one message.
    ///
    /// # Errors
    /// Any error counts as an action failure; the configured failure policy
    /// decides whether the message is still acknowledged.
    async fn perform(&self, message: &Message) -> Result<()>;
}

/// Does nothing.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopAction;

#[async_trait]
impl Action for NoopAction {
    async fn perform(&self, _message: &Message) -> Result<()> {
        Ok(())
    }
}

/// Logs the message identity, size and age at info level.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogAction;

#[async_trait]
impl Action for LogAction {
    async fn perform(&self, message: &Message) -> Result<()> {
        info!(
            topic = %message.topic,
            message_id = %message.id,
            sequence = %message.sequence,
            size = message.payload_size(),
            age_ms = u64::try_from(message.age().as_millis()).unwrap_or(u64::MAX),
            redeliveries = message.redelivery_count,
            "received"
        );
        Ok(())
    }
}

/// Sleeps for a fixed time, simulating downstream latency.
#[derive(Debug, Clone, Copy)]
pub struct DelayAction {
    delay: Duration,
}

impl DelayAction {
    /// Create a delay action.
    #[must_use]
    pub const fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

#[async_trait]
impl Action for DelayAction {
    async fn perform(&self, _message: &Message) -> Result<()> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

/// Adapts a synchronous closure.
pub struct FnAction<F> {
    f: F,
}

impl<F> FnAction<F>
where
    F: Fn(&Message) -> Result<()> + Send + Sync,
{
    /// Wrap `f`.
    pub const fn new(f: F) -> Self {
        Self { f }
    }
}

impl<F> fmt::Debug for FnAction<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("FnAction")
    }
}

#[async_trait]
impl<F> Action for FnAction<F>
where
    F: Fn(&Message) -> Result<()> + Send + Sync,
{
    async fn perform(&self, message: &Message) -> Result<()> {
        (self.f)(message).map_err(|e| match e {
            Error::Action { .. } => e,
            other => Error::action(other.to_string()),
        })
    }
}

/// Build the action selected by the `[action]` configuration section.
#[must_use]
pub fn from_settings(settings: &ActionSettings) -> Arc<dyn Action> {
    match settings.kind {
        ActionKind::Noop => Arc::new(NoopAction),
        ActionKind::Log => Arc::new(LogAction),
        ActionKind::Delay => Arc::new(DelayAction::new(settings.delay)),
    }
}
