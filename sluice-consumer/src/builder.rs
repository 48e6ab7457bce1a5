//! Consumer handle construction for both delivery modes.

use crate::client::{BatchPolicy, ConsumerHandle, MessageListener, MessagingClient, SubscribeRequest};
use sluice_core::config::{ConsumerSettings, DeliveryMode};
use sluice_core::{Message, Result, SubscriptionId, TopicName};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Opens one handle per topic with the run's consumer settings.
#[derive(Debug, Clone)]
pub struct HandleBuilder {
    client: Arc<dyn MessagingClient>,
    settings: ConsumerSettings,
    listener_deliveries: Arc<AtomicU64>,
}

impl HandleBuilder {
    /// Create a builder over a connected client.
    #[must_use]
    pub fn new(client: Arc<dyn MessagingClient>, settings: ConsumerSettings) -> Self {
        Self { client, settings, listener_deliveries: Arc::new(AtomicU64::new(0)) }
    }

    /// Batch policy handles get, if batch receive is enabled.
    #[must_use]
    pub fn batch_policy(&self) -> Option<BatchPolicy> {
        self.settings.consume_batch.then(|| BatchPolicy {
            timeout: self.settings.batch_timeout,
            max_messages: self.settings.batch_max_messages,
        })
    }

    /// Shared counter of messages pushed to listeners built by this builder.
    #[must_use]
    pub fn listener_deliveries(&self) -> Arc<AtomicU64> {
        Arc::clone(&self.listener_deliveries)
    }

    /// Subscribe to `topic` under a fresh subscription id.
    ///
    /// In [`DeliveryMode::Listen`] the handle gets a listener that only logs
    /// and counts deliveries; nothing is acknowledged.
    ///
    /// # Errors
    /// Propagates the client's `ConnectionFailure` or `SubscriptionFailure`.
    /// Nothing is retried here.
    pub async fn build(
        &self,
        topic: &TopicName,
        mode: DeliveryMode,
    ) -> Result<Arc<dyn ConsumerHandle>> {
        let request = SubscribeRequest {
            topic: topic.clone(),
            subscription: SubscriptionId::generate(),
            subscription_type: self.settings.subscription_type,
            auto_update_partitions: self
                .settings
                .auto_update_partitions
                .then_some(self.settings.auto_update_partitions_interval),
            batch_policy: self.batch_policy(),
        };
        let subscription = request.subscription;

        let handle = self.client.subscribe(request).await?;

        if mode == DeliveryMode::Listen {
            if let Err(e) = handle.register_listener(self.listener()) {
                if let Err(close_error) = handle.close().await {
                    warn!(%topic, %subscription, error = %close_error, "failed to close consumer handle");
                }
                return Err(e);
            }
        }

        debug!(%topic, %subscription, mode = %mode, "consumer handle created");
        Ok(handle)
    }

    fn listener(&self) -> MessageListener {
        let deliveries = Arc::clone(&self.listener_deliveries);
        Arc::new(move |message: &Message| {
            deliveries.fetch_add(1, Ordering::Relaxed);
            debug!(topic = %message.topic, message_id = %message.id, "do nothing");
        })
    }
}
