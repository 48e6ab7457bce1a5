//! Messaging client capability.
//!
//! The harness never talks to a broker directly. Everything it needs from a
//! messaging client is expressed by the three traits in this module, so that
//! transports can be swapped without touching the fleet logic:
//!
//! - [`Connector`] opens a [`MessagingClient`] from bootstrap settings
//! - [`MessagingClient`] creates subscriptions, one [`ConsumerHandle`] each
//! - [`ConsumerHandle`] receives, batch-receives, acknowledges and accepts a
//!   push listener
//!
//! Implementations must be safe for concurrent use: the client is shared by
//! every worker, and each handle is driven by exactly one worker at a time.

use async_trait::async_trait;
use sluice_core::config::{BrokerSettings, SubscriptionType};
use sluice_core::{Message, Result, SubscriptionId, TopicName};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Callback invoked by the client for every pushed message.
pub type MessageListener = Arc<dyn Fn(&Message) + Send + Sync>;

/// Client bootstrap parameters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientSettings {
    /// Broker service address
    pub service_url: String,
    /// Client I/O threads
    pub io_threads: usize,
    /// Timeout for control operations
    pub operation_timeout: Duration,
}

impl From<&BrokerSettings> for ClientSettings {
    fn from(broker: &BrokerSettings) -> Self {
        Self {
            service_url: broker.service_url(),
            io_threads: broker.io_threads,
            operation_timeout: broker.operation_timeout,
        }
    }
}

/// Batch receive policy: return after `max_messages` or `timeout`, whichever
/// comes first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchPolicy {
    /// Longest wait for the batch to fill
    pub timeout: Duration,
    /// Upper bound on messages per batch
    pub max_messages: u32,
}

/// Everything needed to open one subscription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscribeRequest {
    /// Topic to subscribe to
    pub topic: TopicName,
    /// Fresh subscription identifier
    pub subscription: SubscriptionId,
    /// Subscription type
    pub subscription_type: SubscriptionType,
    /// Partition update polling interval, when enabled
    pub auto_update_partitions: Option<Duration>,
    /// Batch receive policy, when enabled
    pub batch_policy: Option<BatchPolicy>,
}

/// Opens clients.
#[async_trait]
pub trait Connector: Send + Sync {
    /// Connect to the broker.
    ///
    /// # Errors
    /// Returns [`sluice_core::Error::ConnectionFailure`] if the broker cannot
    /// be reached.
    async fn connect(&self, settings: &ClientSettings) -> Result<Arc<dyn MessagingClient>>;
}

/// A connected client shared by the whole fleet.
#[async_trait]
pub trait MessagingClient: Send + Sync + fmt::Debug {
    /// Open a subscription.
    ///
    /// # Errors
    /// Returns [`sluice_core::Error::SubscriptionFailure`] if the broker
    /// rejects the subscription, or
    /// [`sluice_core::Error::ConnectionFailure`] if the client is unusable.
    async fn subscribe(&self, request: SubscribeRequest) -> Result<Arc<dyn ConsumerHandle>>;

    /// Release the client. Idempotent.
    async fn close(&self) -> Result<()>;
}

/// One subscription on one topic.
#[async_trait]
pub trait ConsumerHandle: Send + Sync + fmt::Debug {
    /// Topic this handle is subscribed to.
    fn topic(&self) -> &TopicName;

    /// Subscription identifier.
    fn subscription(&self) -> SubscriptionId;

    /// Batch policy the handle was created with.
    fn batch_policy(&self) -> Option<BatchPolicy>;

    /// Wait up to `timeout` for one message.
    ///
    /// # Errors
    /// `Timeout` when nothing arrives, `ConnectionLost` on transport failure,
    /// `HandleInvalid` when the subscription can never be served again.
    async fn receive(&self, timeout: Duration) -> Result<Message>;

    /// Wait for a batch according to `policy`. An empty batch means the
    /// policy timeout elapsed.
    ///
    /// # Errors
    /// Same as [`ConsumerHandle::receive`], except that a timeout is reported
    /// as an empty batch.
    async fn receive_batch(&self, policy: &BatchPolicy) -> Result<Vec<Message>>;

    /// Acknowledge one received message.
    ///
    /// # Errors
    /// `Acknowledge` when the broker rejects it.
    async fn acknowledge(&self, message: &Message) -> Result<()>;

    /// Switch the handle to push delivery.
    ///
    /// # Errors
    /// Returns an error if the handle is closed or already has a listener.
    fn register_listener(&self, listener: MessageListener) -> Result<()>;

    /// Release the subscription. Idempotent.
    async fn close(&self) -> Result<()>;
}
