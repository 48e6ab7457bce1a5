//! In-process messaging client.
//!
//! [`InMemoryBroker`] implements the client capability without a network:
//! every subscription owns a FIFO queue, publishing fans a message out to all
//! open subscriptions of its topic, and push listeners are invoked on the
//! publishing task. It keeps a bounded history of acknowledgments per
//! subscription, queues a received message again when it stays unacknowledged
//! past the redelivery delay, and exposes fault injection hooks. That makes it
//! the backbone of the test suite and of the `sluice` binary's self-contained
//! mode.

use crate::client::{
    BatchPolicy, ClientSettings, ConsumerHandle, Connector, MessageListener, MessagingClient,
    SubscribeRequest,
};
use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use parking_lot::Mutex;
use sluice_core::config::SubscriptionType;
use sluice_core::{Error, Message, MessageId, Result, Sequence, SubscriptionId, TopicName};
use std::collections::{HashMap, HashSet, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, trace};

/// Acknowledged sequences remembered per subscription by default.
pub const DEFAULT_ACK_HISTORY: usize = 65_536;

/// Default time a received message may stay unacknowledged.
pub const DEFAULT_REDELIVERY_DELAY: Duration = Duration::from_secs(60);

/// Retention and redelivery settings of an [`InMemoryBroker`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BrokerOptions {
    /// Acknowledged sequences kept per subscription for
    /// [`InMemoryBroker::acknowledged`]; `0` keeps only the counts
    pub ack_history: usize,
    /// Time after which a received, unacknowledged message is queued again
    /// with its redelivery count incremented
    pub redelivery_delay: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self { ack_history: DEFAULT_ACK_HISTORY, redelivery_delay: DEFAULT_REDELIVERY_DELAY }
    }
}

/// Shared in-process broker. Cloning yields another reference to the same
/// broker.
#[derive(Clone, Default)]
pub struct InMemoryBroker {
    inner: Arc<BrokerState>,
}

#[derive(Default)]
struct BrokerState {
    options: BrokerOptions,
    topics: DashMap<TopicName, TopicState>,
    refuse_connections: AtomicBool,
    failing_topics: Mutex<HashSet<TopicName>>,
    connections: AtomicU64,
    dropped_messages: AtomicU64,
}

#[derive(Default)]
struct TopicState {
    next_sequence: Sequence,
    subscriptions: Vec<Arc<SubscriptionState>>,
}

/// Read-only view of one subscription, for assertions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    /// Topic
    pub topic: TopicName,
    /// Subscription identifier
    pub subscription: SubscriptionId,
    /// Requested subscription type
    pub subscription_type: SubscriptionType,
    /// Requested partition update interval
    pub auto_update_partitions: Option<Duration>,
    /// Requested batch policy
    pub batch_policy: Option<BatchPolicy>,
    /// Whether a push listener is registered
    pub has_listener: bool,
    /// Whether the handle was closed
    pub closed: bool,
    /// Messages queued and not yet received
    pub backlog: usize,
    /// Messages received or pushed so far, redeliveries included
    pub delivered: u64,
    /// Messages acknowledged so far
    pub acknowledged: u64,
    /// Received messages awaiting acknowledgment
    pub pending_acks: usize,
    /// Messages queued again after the redelivery delay
    pub redelivered: u64,
}

impl InMemoryBroker {
    /// Create an empty broker with [`BrokerOptions::default`].
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty broker with custom retention and redelivery.
    #[must_use]
    pub fn with_options(options: BrokerOptions) -> Self {
        Self { inner: Arc::new(BrokerState { options, ..BrokerState::default() }) }
    }

    /// Publish a message to every open subscription of `topic`.
    ///
    /// Messages published to a topic without subscriptions are discarded, as
    /// a broker would for subscriptions starting at the latest position.
    pub fn publish(&self, topic: &TopicName, payload: Bytes) -> Sequence {
        let (sequence, subscriptions) = {
            let mut state = self.inner.topics.entry(topic.clone()).or_default();
            let sequence = state.next_sequence;
            state.next_sequence = sequence.next();
            (sequence, state.subscriptions.clone())
        };

        if subscriptions.is_empty() {
            self.inner.dropped_messages.fetch_add(1, Ordering::Relaxed);
        }

        let message = Message::new(topic.clone(), sequence, payload);
        for subscription in subscriptions {
            subscription.enqueue(message.clone());
        }

        trace!(%topic, %sequence, "published");
        sequence
    }

    /// Publish `count` messages with the same payload.
    pub fn publish_many(&self, topic: &TopicName, count: usize, payload: &Bytes) {
        for _ in 0..count {
            self.publish(topic, payload.clone());
        }
    }

    /// Make the next `connect` calls fail.
    pub fn refuse_connections(&self, refuse: bool) {
        self.inner.refuse_connections.store(refuse, Ordering::SeqCst);
    }

    /// Make subscriptions to `topic` fail.
    pub fn fail_subscriptions_to(&self, topic: &TopicName) {
        self.inner.failing_topics.lock().insert(topic.clone());
    }

    /// Queue an error that the next receive on every open subscription of
    /// `topic` returns instead of a message.
    pub fn fail_next_receive(&self, topic: &TopicName, error: Error) {
        for subscription in self.open_subscriptions(topic) {
            subscription.injected.lock().push_back(error.clone());
            subscription.notify.notify_one();
        }
    }

    /// Permanently invalidate every open subscription of `topic`.
    pub fn invalidate(&self, topic: &TopicName) {
        for subscription in self.open_subscriptions(topic) {
            subscription.invalid.store(true, Ordering::SeqCst);
            subscription.notify.notify_one();
        }
    }

    /// Sequences acknowledged on `topic`, in acknowledgment order, across all
    /// subscriptions. Only the last [`BrokerOptions::ack_history`] entries of
    /// each subscription are kept.
    #[must_use]
    pub fn acknowledged(&self, topic: &TopicName) -> Vec<Sequence> {
        self.all_subscriptions(topic)
            .iter()
            .flat_map(|subscription| subscription.acked.lock().iter().copied().collect::<Vec<_>>())
            .collect()
    }

    /// Total acknowledgments on `topic`, unaffected by the history limit.
    #[must_use]
    pub fn acknowledged_count(&self, topic: &TopicName) -> u64 {
        self.all_subscriptions(topic)
            .iter()
            .map(|subscription| subscription.acked_total.load(Ordering::Relaxed))
            .sum()
    }

    /// Snapshot of every subscription ever opened on `topic`.
    #[must_use]
    pub fn subscriptions(&self, topic: &TopicName) -> Vec<SubscriptionInfo> {
        self.all_subscriptions(topic).iter().map(|s| s.info()).collect()
    }

    /// Number of subscriptions not yet closed, across all topics.
    #[must_use]
    pub fn open_subscription_count(&self) -> usize {
        self.inner
            .topics
            .iter()
            .map(|entry| {
                entry.subscriptions.iter().filter(|s| !s.closed.load(Ordering::SeqCst)).count()
            })
            .sum()
    }

    /// Successful `connect` calls so far.
    #[must_use]
    pub fn connection_count(&self) -> u64 {
        self.inner.connections.load(Ordering::Relaxed)
    }

    /// Messages published while their topic had no subscription.
    #[must_use]
    pub fn dropped_messages(&self) -> u64 {
        self.inner.dropped_messages.load(Ordering::Relaxed)
    }

    fn all_subscriptions(&self, topic: &TopicName) -> Vec<Arc<SubscriptionState>> {
        self.inner.topics.get(topic).map(|state| state.subscriptions.clone()).unwrap_or_default()
    }

    fn open_subscriptions(&self, topic: &TopicName) -> Vec<Arc<SubscriptionState>> {
        self.all_subscriptions(topic)
            .into_iter()
            .filter(|s| !s.closed.load(Ordering::SeqCst))
            .collect()
    }
}

impl fmt::Debug for InMemoryBroker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryBroker")
            .field("topics", &self.inner.topics.len())
            .field("connections", &self.connection_count())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self, settings: &ClientSettings) -> Result<Arc<dyn MessagingClient>> {
        if self.inner.refuse_connections.load(Ordering::SeqCst) {
            return Err(Error::ConnectionFailure {
                address: settings.service_url.clone(),
                message: "connection refused".to_string(),
            });
        }

        self.inner.connections.fetch_add(1, Ordering::Relaxed);
        debug!(service_url = %settings.service_url, "in-memory client connected");
        Ok(Arc::new(InMemoryClient {
            broker: self.clone(),
            service_url: settings.service_url.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// Client returned by [`InMemoryBroker`]'s connector.
pub struct InMemoryClient {
    broker: InMemoryBroker,
    service_url: String,
    closed: AtomicBool,
}

impl fmt::Debug for InMemoryClient {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryClient")
            .field("service_url", &self.service_url)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[async_trait]
impl MessagingClient for InMemoryClient {
    async fn subscribe(&self, request: SubscribeRequest) -> Result<Arc<dyn ConsumerHandle>> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::ConnectionFailure {
                address: self.service_url.clone(),
                message: "client is closed".to_string(),
            });
        }

        if self.broker.inner.failing_topics.lock().contains(&request.topic) {
            return Err(Error::SubscriptionFailure {
                topic: request.topic.to_string(),
                message: "subscription rejected by broker".to_string(),
            });
        }

        let state = Arc::new(SubscriptionState::new(request, self.broker.inner.options));
        self.broker
            .inner
            .topics
            .entry(state.topic.clone())
            .or_default()
            .subscriptions
            .push(Arc::clone(&state));

        debug!(topic = %state.topic, subscription = %state.id, "subscribed");
        Ok(Arc::new(InMemoryConsumer { state }))
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

struct SubscriptionState {
    topic: TopicName,
    id: SubscriptionId,
    subscription_type: SubscriptionType,
    auto_update_partitions: Option<Duration>,
    batch_policy: Option<BatchPolicy>,
    options: BrokerOptions,
    queue: Mutex<VecDeque<Message>>,
    outstanding: Mutex<Outstanding>,
    acked: Mutex<VecDeque<Sequence>>,
    acked_total: AtomicU64,
    redelivered: AtomicU64,
    injected: Mutex<VecDeque<Error>>,
    listener: Mutex<Option<MessageListener>>,
    notify: Notify,
    invalid: AtomicBool,
    closed: AtomicBool,
    delivered: AtomicU64,
}

/// Received messages awaiting acknowledgment.
#[derive(Default)]
struct Outstanding {
    messages: HashMap<MessageId, Message>,
    // In delivery order. Ids no longer in `messages` are stale.
    deadlines: VecDeque<(Instant, MessageId)>,
}

impl Outstanding {
    fn prune_front(&mut self) {
        while let Some((_, id)) = self.deadlines.front() {
            if self.messages.contains_key(id) {
                break;
            }
            self.deadlines.pop_front();
        }
    }
}

impl SubscriptionState {
    fn new(request: SubscribeRequest, options: BrokerOptions) -> Self {
        Self {
            topic: request.topic,
            id: request.subscription,
            subscription_type: request.subscription_type,
            auto_update_partitions: request.auto_update_partitions,
            batch_policy: request.batch_policy,
            options,
            queue: Mutex::new(VecDeque::new()),
            outstanding: Mutex::new(Outstanding::default()),
            acked: Mutex::new(VecDeque::new()),
            acked_total: AtomicU64::new(0),
            redelivered: AtomicU64::new(0),
            injected: Mutex::new(VecDeque::new()),
            listener: Mutex::new(None),
            notify: Notify::new(),
            invalid: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            delivered: AtomicU64::new(0),
        }
    }

    fn enqueue(&self, message: Message) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }

        // Held until the message is queued, so a listener registering
        // concurrently finds it in the backlog.
        let slot = self.listener.lock();
        if let Some(listener) = (*slot).clone() {
            drop(slot);
            self.delivered.fetch_add(1, Ordering::Relaxed);
            listener(&message);
            return;
        }

        self.queue.lock().push_back(message);
        drop(slot);
        self.notify.notify_one();
    }

    fn ensure_usable(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(self.invalid_error("consumer is closed"));
        }
        if self.invalid.load(Ordering::SeqCst) {
            return Err(self.invalid_error("subscription was deleted"));
        }
        Ok(())
    }

    fn invalid_error(&self, message: &str) -> Error {
        Error::HandleInvalid {
            topic: self.topic.to_string(),
            subscription: self.id.to_string(),
            message: message.to_string(),
        }
    }

    fn take_injected(&self) -> Option<Error> {
        self.injected.lock().pop_front()
    }

    fn pop(&self) -> Option<Message> {
        self.requeue_expired();
        let message = self.queue.lock().pop_front()?;

        let deadline = Instant::now() + self.options.redelivery_delay;
        let mut outstanding = self.outstanding.lock();
        outstanding.deadlines.push_back((deadline, message.id));
        outstanding.messages.insert(message.id, message.clone());
        drop(outstanding);

        self.delivered.fetch_add(1, Ordering::Relaxed);
        Some(message)
    }

    /// Put messages unacknowledged past their deadline back at the queue head.
    fn requeue_expired(&self) {
        let now = Instant::now();
        let mut expired = Vec::new();
        {
            let mut outstanding = self.outstanding.lock();
            while let Some(&(deadline, id)) = outstanding.deadlines.front() {
                if deadline > now {
                    break;
                }
                outstanding.deadlines.pop_front();
                if let Some(mut message) = outstanding.messages.remove(&id) {
                    message.redelivery_count += 1;
                    expired.push(message);
                }
            }
        }
        if expired.is_empty() {
            return;
        }

        self.redelivered.fetch_add(expired.len() as u64, Ordering::Relaxed);
        trace!(topic = %self.topic, subscription = %self.id, count = expired.len(), "redelivering");
        let mut queue = self.queue.lock();
        for message in expired.into_iter().rev() {
            queue.push_front(message);
        }
    }

    fn settle(&self, message: &Message) -> Result<()> {
        let sequence = {
            let mut outstanding = self.outstanding.lock();
            let acked = outstanding.messages.remove(&message.id).ok_or_else(|| {
                Error::Acknowledge {
                    message: format!("message {} is unknown or already acknowledged", message.id),
                }
            })?;
            outstanding.prune_front();
            acked.sequence
        };

        self.acked_total.fetch_add(1, Ordering::Relaxed);
        if self.options.ack_history > 0 {
            let mut acked = self.acked.lock();
            if acked.len() == self.options.ack_history {
                acked.pop_front();
            }
            acked.push_back(sequence);
        }
        Ok(())
    }

    fn info(&self) -> SubscriptionInfo {
        SubscriptionInfo {
            topic: self.topic.clone(),
            subscription: self.id,
            subscription_type: self.subscription_type,
            auto_update_partitions: self.auto_update_partitions,
            batch_policy: self.batch_policy,
            has_listener: self.listener.lock().is_some(),
            closed: self.closed.load(Ordering::SeqCst),
            backlog: self.queue.lock().len(),
            delivered: self.delivered.load(Ordering::Relaxed),
            acknowledged: self.acked_total.load(Ordering::Relaxed),
            pending_acks: self.outstanding.lock().messages.len(),
            redelivered: self.redelivered.load(Ordering::Relaxed),
        }
    }
}

/// Consumer handle returned by [`InMemoryClient`].
pub struct InMemoryConsumer {
    state: Arc<SubscriptionState>,
}

impl fmt::Debug for InMemoryConsumer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("InMemoryConsumer")
            .field("topic", &self.state.topic)
            .field("subscription", &self.state.id)
            .finish()
    }
}

#[async_trait]
impl ConsumerHandle for InMemoryConsumer {
    fn topic(&self) -> &TopicName {
        &self.state.topic
    }

    fn subscription(&self) -> SubscriptionId {
        self.state.id
    }

    fn batch_policy(&self) -> Option<BatchPolicy> {
        self.state.batch_policy
    }

    async fn receive(&self, timeout: Duration) -> Result<Message> {
        let deadline = Instant::now() + timeout;
        loop {
            self.state.ensure_usable()?;
            if let Some(error) = self.state.take_injected() {
                return Err(error);
            }
            if let Some(message) = self.state.pop() {
                return Ok(message);
            }
            if tokio::time::timeout_at(deadline, self.state.notify.notified()).await.is_err() {
                return Err(Error::Timeout {
                    timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                });
            }
        }
    }

    async fn receive_batch(&self, policy: &BatchPolicy) -> Result<Vec<Message>> {
        let deadline = Instant::now() + policy.timeout;
        let max = policy.max_messages.max(1) as usize;
        let mut batch = Vec::new();

        loop {
            self.state.ensure_usable()?;
            if let Some(error) = self.state.take_injected() {
                if batch.is_empty() {
                    return Err(error);
                }
                // Hand back what was collected; the error surfaces next call.
                self.state.injected.lock().push_front(error);
                return Ok(batch);
            }

            while batch.len() < max {
                match self.state.pop() {
                    Some(message) => batch.push(message),
                    None => break,
                }
            }

            if batch.len() >= max {
                return Ok(batch);
            }
            if tokio::time::timeout_at(deadline, self.state.notify.notified()).await.is_err() {
                return Ok(batch);
            }
        }
    }

    async fn acknowledge(&self, message: &Message) -> Result<()> {
        if self.state.closed.load(Ordering::SeqCst) {
            return Err(Error::Acknowledge { message: "consumer is closed".to_string() });
        }

        self.state.settle(message)
    }

    fn register_listener(&self, listener: MessageListener) -> Result<()> {
        self.state.ensure_usable()?;

        // Publishers wait on the slot, so the backlog is delivered first.
        let mut slot = self.state.listener.lock();
        if slot.is_some() {
            return Err(Error::internal("listener already registered"));
        }
        let backlog: Vec<Message> = self.state.queue.lock().drain(..).collect();
        for message in &backlog {
            self.state.delivered.fetch_add(1, Ordering::Relaxed);
            listener(message);
        }
        *slot = Some(listener);
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        if !self.state.closed.swap(true, Ordering::SeqCst) {
            self.state.notify.notify_one();
            debug!(topic = %self.state.topic, subscription = %self.state.id, "consumer closed");
        }
        Ok(())
    }
}
