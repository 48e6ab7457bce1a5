//! Pull worker: the receive → action → acknowledge loop.
//!
//! A worker owns an ordered set of consumer handles and one [`Limiter`]. It
//! visits its handles round-robin, takes a permit before every receive, and
//! hands received messages to the downstream action on a separate task so the
//! next receive can start right away. Completed pipelines are settled
//! (acknowledged, permit released) strictly in receive order through an
//! ordered in-flight queue, and settling keeps going while the worker waits
//! for a permit or for a receive to return.
//!
//! Receive failures never leave the loop. A timeout is an idle poll and only
//! counted. Other transient failures are logged and the worker moves on to
//! the next handle, after the configured backoff; a permanently invalid handle is removed
//! from rotation and reported to the [`RebalanceHook`]. A worker whose
//! rotation empties this way enters [`WorkerState::Draining`] and idles until
//! shutdown.

use crate::action::Action;
use crate::client::ConsumerHandle;
use crate::limiter::{Limiter, Permit};
use crate::stats::{WorkerSnapshot, WorkerState, WorkerStats};
use futures::future::{BoxFuture, FutureExt};
use futures::stream::{FuturesOrdered, StreamExt};
use parking_lot::Mutex;
use sluice_core::config::{ActionFailurePolicy, ConsumerSettings};
use sluice_core::{Error, Message, ReceiveDisposition, Result, SubscriptionId, TopicName, WorkerId};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Loop tuning taken from the consumer configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSettings {
    /// Timeout of a single-message receive
    pub receive_timeout: Duration,
    /// Fate of messages whose action failed
    pub failure_policy: ActionFailurePolicy,
    /// Pause after a transient receive failure; zero retries immediately
    pub retry_backoff: Duration,
}

impl From<&ConsumerSettings> for WorkerSettings {
    fn from(settings: &ConsumerSettings) -> Self {
        Self {
            receive_timeout: settings.receive_timeout,
            failure_policy: settings.action_failure_policy,
            retry_backoff: settings.retry_backoff,
        }
    }
}

/// Notified when a worker permanently drops a handle.
///
/// Handles are never reassigned automatically. An implementation may
/// resubscribe the topic elsewhere.
pub trait RebalanceHook: Send + Sync + fmt::Debug {
    /// `worker` removed the handle for `topic` from its rotation.
    fn handle_dropped(&self, worker: WorkerId, topic: &TopicName, subscription: SubscriptionId);
}

/// A handle removed from rotation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DroppedHandle {
    /// Worker that owned it
    pub worker: WorkerId,
    /// Its topic
    pub topic: TopicName,
    /// Its subscription
    pub subscription: SubscriptionId,
}

/// Default hook: records dropped handles.
#[derive(Debug, Default)]
pub struct DroppedTopicLog {
    dropped: Mutex<Vec<DroppedHandle>>,
}

impl DroppedTopicLog {
    /// Handles dropped so far, in drop order.
    #[must_use]
    pub fn dropped(&self) -> Vec<DroppedHandle> {
        self.dropped.lock().clone()
    }
}

impl RebalanceHook for DroppedTopicLog {
    fn handle_dropped(&self, worker: WorkerId, topic: &TopicName, subscription: SubscriptionId) {
        self.dropped.lock().push(DroppedHandle { worker, topic: topic.clone(), subscription });
    }
}

/// What a worker hands back when it stops.
#[derive(Debug)]
pub struct WorkerReport {
    /// Worker
    pub worker: WorkerId,
    /// Every handle the worker owned, dropped ones included
    pub handles: Vec<Arc<dyn ConsumerHandle>>,
    /// Final counters
    pub stats: WorkerSnapshot,
}

/// Received messages whose action has finished, waiting to be settled.
struct Completed {
    handle: Arc<dyn ConsumerHandle>,
    messages: Arc<Vec<Message>>,
    results: Vec<Result<()>>,
    permit: Permit,
}

/// One pull worker.
pub struct PullWorker {
    id: WorkerId,
    handles: Vec<Arc<dyn ConsumerHandle>>,
    limiter: Limiter,
    action: Arc<dyn Action>,
    settings: WorkerSettings,
    stats: Arc<WorkerStats>,
    rebalance: Arc<dyn RebalanceHook>,
    shutdown: watch::Receiver<bool>,
}

impl fmt::Debug for PullWorker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PullWorker")
            .field("id", &self.id)
            .field("handles", &self.handles.len())
            .field("limit", &self.limiter.limit())
            .finish_non_exhaustive()
    }
}

impl PullWorker {
    /// Create a worker. It does nothing until [`PullWorker::run`] is polled.
    #[must_use]
    pub fn new(
        id: WorkerId,
        handles: Vec<Arc<dyn ConsumerHandle>>,
        limiter: Limiter,
        action: Arc<dyn Action>,
        settings: WorkerSettings,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            id,
            handles,
            limiter,
            action,
            settings,
            stats: Arc::new(WorkerStats::new(id)),
            rebalance: Arc::new(DroppedTopicLog::default()),
            shutdown,
        }
    }

    /// Replace the rebalance hook.
    #[must_use]
    pub fn with_rebalance_hook(mut self, hook: Arc<dyn RebalanceHook>) -> Self {
        self.rebalance = hook;
        self
    }

    /// Live counters, shared with the running loop.
    #[must_use]
    pub fn stats(&self) -> Arc<WorkerStats> {
        Arc::clone(&self.stats)
    }

    /// Drive the loop until shutdown is signalled (`true` on the watch
    /// channel, or its sender dropped).
    pub async fn run(self) -> WorkerReport {
        let Self { id, handles, limiter, action, settings, stats, rebalance, mut shutdown } = self;

        let mut rotation: Vec<usize> = (0..handles.len()).collect();
        let mut cursor = 0usize;
        let mut in_flight: FuturesOrdered<BoxFuture<'static, Completed>> = FuturesOrdered::new();

        info!(worker = %id, handles = handles.len(), limit = ?limiter.limit(), "pull worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            if rotation.is_empty() {
                while let Some(completed) = in_flight.next().await {
                    settle(id, completed, settings.failure_policy, &stats).await;
                }
                wait_for_shutdown(&mut shutdown).await;
                break;
            }

            let permit = tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    continue;
                },
                Some(completed) = in_flight.next(), if !in_flight.is_empty() => {
                    settle(id, completed, settings.failure_policy, &stats).await;
                    continue;
                },
                acquired = limiter.acquire() => match acquired {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };
            stats.record_in_flight(limiter.outstanding());

            let position = cursor % rotation.len();
            cursor = position + 1;
            let handle = Arc::clone(&handles[rotation[position]]);

            // The receive is never cancelled; pending pipelines settle meanwhile.
            let outcome = {
                let receive = receive_from(handle.as_ref(), settings.receive_timeout);
                tokio::pin!(receive);
                loop {
                    tokio::select! {
                        biased;
                        result = &mut receive => break result,
                        Some(completed) = in_flight.next(), if !in_flight.is_empty() => {
                            settle(id, completed, settings.failure_policy, &stats).await;
                        },
                    }
                }
            };

            match outcome {
                Ok(messages) if messages.is_empty() => {
                    stats.record_receive();
                    stats.record_empty_receive();
                    permit.release();
                },
                Ok(messages) => {
                    stats.record_receive();
                    stats.record_messages(messages.len());
                    in_flight.push_back(dispatch(&action, handle, messages, permit));
                },
                Err(Error::Timeout { .. }) => {
                    stats.record_receive_timeout();
                    permit.release();
                    debug!(worker = %id, topic = %handle.topic(), "receive timed out");
                },
                Err(error) => {
                    stats.record_receive_error();
                    permit.release();

                    match error.receive_disposition() {
                        ReceiveDisposition::Retry => {
                            warn!(
                                worker = %id,
                                topic = %handle.topic(),
                                subscription = %handle.subscription(),
                                %error,
                                "receive failed"
                            );
                            if !settings.retry_backoff.is_zero() {
                                let backoff = tokio::time::sleep(settings.retry_backoff);
                                tokio::pin!(backoff);
                                loop {
                                    tokio::select! {
                                        biased;
                                        _ = shutdown.changed() => break,
                                        Some(completed) = in_flight.next(), if !in_flight.is_empty() => {
                                            settle(id, completed, settings.failure_policy, &stats).await;
                                        },
                                        () = &mut backoff => break,
                                    }
                                }
                            }
                        },
                        ReceiveDisposition::DropHandle => {
                            warn!(
                                worker = %id,
                                topic = %handle.topic(),
                                subscription = %handle.subscription(),
                                %error,
                                "dropping invalid consumer handle"
                            );
                            rotation.remove(position);
                            cursor = position;
                            stats.record_dropped_handle();
                            rebalance.handle_dropped(id, handle.topic(), handle.subscription());

                            if rotation.is_empty() {
                                stats.set_state(WorkerState::Draining);
                                warn!(worker = %id, "no consumer handles left, worker draining");
                            }
                        },
                    }
                },
            }
        }

        let pending = in_flight.len();
        while let Some(completed) = in_flight.next().await {
            settle(id, completed, settings.failure_policy, &stats).await;
        }
        limiter.close();
        stats.set_state(WorkerState::Stopped);

        debug!(worker = %id, drained = pending, "pull worker stopped");
        WorkerReport { worker: id, handles, stats: stats.snapshot() }
    }
}

async fn receive_from(handle: &dyn ConsumerHandle, timeout: Duration) -> Result<Vec<Message>> {
    match handle.batch_policy() {
        Some(policy) => handle.receive_batch(&policy).await,
        None => handle.receive(timeout).await.map(|message| vec![message]),
    }
}

/// Run the action for every message on its own task.
fn dispatch(
    action: &Arc<dyn Action>,
    handle: Arc<dyn ConsumerHandle>,
    messages: Vec<Message>,
    permit: Permit,
) -> BoxFuture<'static, Completed> {
    let messages = Arc::new(messages);
    let task = {
        let action = Arc::clone(action);
        let messages = Arc::clone(&messages);
        tokio::spawn(async move {
            let mut results = Vec::with_capacity(messages.len());
            for message in messages.iter() {
                results.push(action.perform(message).await);
            }
            results
        })
    };

    async move {
        let results = task.await.unwrap_or_else(|join_error| {
            let failure = Error::action(format!("action task failed: {join_error}"));
            vec![Err(failure); messages.len()]
        });
        Completed { handle, messages, results, permit }
    }
    .boxed()
}

/// Acknowledge (or deliberately skip) each message, then release the permit.
async fn settle(
    worker: WorkerId,
    completed: Completed,
    policy: ActionFailurePolicy,
    stats: &WorkerStats,
) {
    let Completed { handle, messages, results, permit } = completed;

    for (message, result) in messages.iter().zip(results) {
        if let Err(error) = result {
            stats.record_action_failure();
            warn!(%worker, topic = %message.topic, message_id = %message.id, %error, "action failed");
            if policy == ActionFailurePolicy::LeaveUnacknowledged {
                stats.record_unacknowledged();
                continue;
            }
        }

        match handle.acknowledge(message).await {
            Ok(()) => stats.record_acknowledged(),
            Err(error) => {
                stats.record_ack_failure();
                warn!(%worker, topic = %message.topic, message_id = %message.id, %error, "acknowledge failed");
            },
        }
    }

    permit.release();
}

async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    while !*shutdown.borrow_and_update() {
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::action::{FnAction, NoopAction};
    use crate::client::{ClientSettings, Connector, MessagingClient, SubscribeRequest};
    use crate::limiter::Limit;
    use crate::memory::InMemoryBroker;
    use bytes::Bytes;
    use sluice_core::config::SubscriptionType;
    use sluice_core::Sequence;
    use tokio::task::JoinHandle;

    struct Harness {
        broker: InMemoryBroker,
        client: Arc<dyn MessagingClient>,
    }

    impl Harness {
        async fn new() -> Self {
            let broker = InMemoryBroker::new();
            let client = broker
                .connect(&ClientSettings {
                    service_url: "http://localhost:8080".into(),
                    io_threads: 1,
                    operation_timeout: Duration::from_secs(1),
                })
                .await
                .unwrap();
            Self { broker, client }
        }

        async fn handle(&self, topic: &TopicName) -> Arc<dyn ConsumerHandle> {
            self.client
                .subscribe(SubscribeRequest {
                    topic: topic.clone(),
                    subscription: SubscriptionId::generate(),
                    subscription_type: SubscriptionType::Exclusive,
                    auto_update_partitions: None,
                    batch_policy: None,
                })
                .await
                .unwrap()
        }
    }

    fn topic(name: &str) -> TopicName {
        format!("persistent://t/ns/{name}").parse().unwrap()
    }

    fn settings(policy: ActionFailurePolicy) -> WorkerSettings {
        WorkerSettings {
            receive_timeout: Duration::from_millis(10),
            failure_policy: policy,
            retry_backoff: Duration::ZERO,
        }
    }

    fn spawn(worker: PullWorker) -> (Arc<WorkerStats>, JoinHandle<WorkerReport>) {
        let stats = worker.stats();
        (stats, tokio::spawn(worker.run()))
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        tokio::time::timeout(Duration::from_secs(5), async {
            while !condition() {
                tokio::time::sleep(Duration::from_millis(2)).await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn test_timeout_does_not_stop_worker() {
        let harness = Harness::new().await;
        let (a, b) = (topic("a"), topic("b"));
        let handles = vec![harness.handle(&a).await, harness.handle(&b).await];
        harness.broker.fail_next_receive(&a, Error::Timeout { timeout_ms: 10 });
        harness.broker.publish(&b, Bytes::from_static(b"x"));

        let (tx, rx) = watch::channel(false);
        let worker = PullWorker::new(
            WorkerId::new(0),
            handles,
            Limiter::new(Limit::Bounded(1)),
            Arc::new(NoopAction),
            settings(ActionFailurePolicy::Acknowledge),
            rx,
        );
        let (stats, task) = spawn(worker);

        wait_until(|| harness.broker.acknowledged(&b).len() == 1).await;
        tx.send(true).unwrap();
        let report = task.await.unwrap();

        assert!(report.stats.receive_timeouts >= 1);
        assert_eq!(report.stats.receive_errors, 0);
        assert_eq!(report.stats.acknowledged, 1);
        assert_eq!(report.stats.state, WorkerState::Stopped);
        assert_eq!(stats.state(), WorkerState::Stopped);
        assert_eq!(report.handles.len(), 2);
    }

    #[tokio::test]
    async fn test_handles_serviced_in_alternation() {
        let harness = Harness::new().await;
        let (a, b) = (topic("a"), topic("b"));
        let handles = vec![harness.handle(&a).await, harness.handle(&b).await];
        harness.broker.publish_many(&a, 3, &Bytes::new());
        harness.broker.publish_many(&b, 3, &Bytes::new());

        let order = Arc::new(Mutex::new(Vec::new()));
        let seen = Arc::clone(&order);
        let action = FnAction::new(move |message: &Message| {
            seen.lock().push(message.topic.local_name().to_string());
            Ok(())
        });

        let (tx, rx) = watch::channel(false);
        let worker = PullWorker::new(
            WorkerId::new(0),
            handles,
            Limiter::new(Limit::Bounded(1)),
            Arc::new(action),
            settings(ActionFailurePolicy::Acknowledge),
            rx,
        );
        let (stats, task) = spawn(worker);

        wait_until(|| stats.acknowledged() == 6).await;
        tx.send(true).unwrap();
        let report = task.await.unwrap();

        assert_eq!(*order.lock(), ["a", "b", "a", "b", "a", "b"]);
        assert_eq!(report.stats.peak_in_flight, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_backoff_delays_next_receive() {
        let harness = Harness::new().await;
        let a = topic("a");
        let handle = harness.handle(&a).await;
        harness.broker.fail_next_receive(&a, Error::ConnectionLost { message: "reset".into() });
        harness.broker.publish(&a, Bytes::new());

        let performed_at = Arc::new(Mutex::new(None));
        let record = Arc::clone(&performed_at);
        let action = FnAction::new(move |_: &Message| {
            let mut slot = record.lock();
            if slot.is_none() {
                *slot = Some(tokio::time::Instant::now());
            }
            Ok(())
        });

        let (tx, rx) = watch::channel(false);
        let worker = PullWorker::new(
            WorkerId::new(0),
            vec![handle],
            Limiter::new(Limit::Bounded(1)),
            Arc::new(action),
            WorkerSettings {
                retry_backoff: Duration::from_secs(1),
                ..settings(ActionFailurePolicy::Acknowledge)
            },
            rx,
        );
        let start = tokio::time::Instant::now();
        let (stats, task) = spawn(worker);

        wait_until(|| stats.acknowledged() == 1).await;
        tx.send(true).unwrap();
        let report = task.await.unwrap();

        let performed_at = (*performed_at.lock()).expect("action never ran");
        assert!(performed_at - start >= Duration::from_secs(1));
        assert_eq!(report.stats.receive_errors, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_interrupts_retry_backoff() {
        let harness = Harness::new().await;
        let a = topic("a");
        let handle = harness.handle(&a).await;
        harness.broker.fail_next_receive(&a, Error::ConnectionLost { message: "reset".into() });

        let (tx, rx) = watch::channel(false);
        let worker = PullWorker::new(
            WorkerId::new(0),
            vec![handle],
            Limiter::new(Limit::Bounded(1)),
            Arc::new(NoopAction),
            WorkerSettings {
                retry_backoff: Duration::from_secs(3600),
                ..settings(ActionFailurePolicy::Acknowledge)
            },
            rx,
        );
        let (stats, task) = spawn(worker);

        wait_until(|| stats.snapshot().receive_errors == 1).await;
        let stopping = tokio::time::Instant::now();
        tx.send(true).unwrap();
        let report = task.await.unwrap();

        assert!(stopping.elapsed() < Duration::from_secs(1));
        assert_eq!(report.stats.state, WorkerState::Stopped);
        assert_eq!(report.stats.receives, 0);
    }

    #[tokio::test]
    async fn test_invalid_handle_leads_to_draining() {
        let harness = Harness::new().await;
        let a = topic("a");
        let handle = harness.handle(&a).await;
        let subscription = handle.subscription();
        harness.broker.invalidate(&a);

        let hook = Arc::new(DroppedTopicLog::default());
        let (tx, rx) = watch::channel(false);
        let worker = PullWorker::new(
            WorkerId::new(2),
            vec![handle],
            Limiter::new(Limit::Unbounded),
            Arc::new(NoopAction),
            settings(ActionFailurePolicy::Acknowledge),
            rx,
        )
        .with_rebalance_hook(Arc::clone(&hook) as Arc<dyn RebalanceHook>);
        let (stats, task) = spawn(worker);

        wait_until(|| stats.state() == WorkerState::Draining).await;
        assert_eq!(
            hook.dropped(),
            vec![DroppedHandle { worker: WorkerId::new(2), topic: a, subscription }]
        );

        tx.send(true).unwrap();
        let report = task.await.unwrap();
        assert_eq!(report.stats.dropped_handles, 1);
        assert_eq!(report.stats.receive_errors, 1);
        assert_eq!(report.stats.state, WorkerState::Stopped);
    }

    #[tokio::test]
    async fn test_leave_unacknowledged_policy() {
        let harness = Harness::new().await;
        let a = topic("a");
        let handle = harness.handle(&a).await;
        harness.broker.publish_many(&a, 4, &Bytes::new());

        let action = FnAction::new(|message: &Message| {
            if message.sequence.value() % 2 == 0 {
                Err(Error::action("rejected"))
            } else {
                Ok(())
            }
        });
        let (tx, rx) = watch::channel(false);
        let worker = PullWorker::new(
            WorkerId::new(0),
            vec![handle],
            Limiter::new(Limit::Bounded(2)),
            Arc::new(action),
            settings(ActionFailurePolicy::LeaveUnacknowledged),
            rx,
        );
        let (stats, task) = spawn(worker);

        wait_until(|| stats.snapshot().messages == 4 && stats.snapshot().unacknowledged == 2).await;
        tx.send(true).unwrap();
        let report = task.await.unwrap();

        assert_eq!(harness.broker.acknowledged(&a), vec![Sequence::new(1), Sequence::new(3)]);
        assert_eq!(report.stats.action_failures, 2);
        assert_eq!(report.stats.acknowledged, 2);
    }

    #[tokio::test]
    async fn test_acknowledge_policy_acks_failed_actions() {
        let harness = Harness::new().await;
        let a = topic("a");
        let handle = harness.handle(&a).await;
        harness.broker.publish_many(&a, 3, &Bytes::new());

        let (tx, rx) = watch::channel(false);
        let worker = PullWorker::new(
            WorkerId::new(0),
            vec![handle],
            Limiter::new(Limit::Unbounded),
            Arc::new(FnAction::new(|_: &Message| Err(Error::action("always")))),
            settings(ActionFailurePolicy::Acknowledge),
            rx,
        );
        let (stats, task) = spawn(worker);

        wait_until(|| stats.acknowledged() == 3).await;
        tx.send(true).unwrap();
        let report = task.await.unwrap();

        assert_eq!(report.stats.action_failures, 3);
        assert_eq!(harness.broker.acknowledged(&a).len(), 3);
    }

    #[tokio::test]
    async fn test_worker_without_handles_idles_until_shutdown() {
        let (tx, rx) = watch::channel(false);
        let worker = PullWorker::new(
            WorkerId::new(5),
            Vec::new(),
            Limiter::new(Limit::Bounded(1)),
            Arc::new(NoopAction),
            settings(ActionFailurePolicy::Acknowledge),
            rx,
        );
        let (stats, task) = spawn(worker);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(stats.state(), WorkerState::Running);
        assert_eq!(stats.snapshot().receives, 0);

        drop(tx);
        let report = task.await.unwrap();
        assert_eq!(report.stats.state, WorkerState::Stopped);
    }

    #[test]
    fn test_settings_from_consumer_settings() {
        let consumer = ConsumerSettings {
            receive_timeout: Duration::from_millis(70),
            action_failure_policy: ActionFailurePolicy::LeaveUnacknowledged,
            retry_backoff: Duration::from_millis(3),
            ..ConsumerSettings::default()
        };
        let settings = WorkerSettings::from(&consumer);
        assert_eq!(settings.receive_timeout, Duration::from_millis(70));
        assert_eq!(settings.failure_policy, ActionFailurePolicy::LeaveUnacknowledged);
        assert_eq!(settings.retry_backoff, Duration::from_millis(3));
    }
}
