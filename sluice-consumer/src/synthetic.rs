//! Synthetic traffic for the in-process broker.

use crate::memory::InMemoryBroker;
use bytes::Bytes;
use rand::rngs::StdRng;
use rand::{RngCore, SeedableRng};
use sluice_core::TopicName;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

const MIN_TICK: Duration = Duration::from_millis(10);
const NANOS_PER_SEC: u128 = 1_000_000_000;

/// Spreads a per-second rate over fixed ticks. The fractional part of each
/// tick's share carries over, so any whole-second window publishes `rate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Pacer {
    tick: Duration,
    rate: u128,
    carry: u128,
}

impl Pacer {
    fn new(rate: u64) -> Self {
        let tick = (Duration::from_secs(1) / u32::try_from(rate.max(1)).unwrap_or(u32::MAX))
            .max(MIN_TICK);
        Self { tick, rate: u128::from(rate), carry: 0 }
    }

    /// Messages per topic due on the next tick.
    fn next_batch(&mut self) -> u64 {
        let budget = self.carry + self.rate * self.tick.as_nanos();
        self.carry = budget % NANOS_PER_SEC;
        u64::try_from(budget / NANOS_PER_SEC).unwrap_or(u64::MAX)
    }
}

/// Publishes random payloads into every topic at a fixed per-topic rate.
#[derive(Debug, Clone)]
pub struct SyntheticPublisher {
    broker: InMemoryBroker,
    topics: Vec<TopicName>,
    rate: u64,
    payload_size: usize,
}

impl SyntheticPublisher {
    /// `rate` is messages per second per topic.
    #[must_use]
    pub fn new(broker: InMemoryBroker, topics: Vec<TopicName>, rate: u64, payload_size: usize) -> Self {
        Self { broker, topics, rate, payload_size }
    }

    /// Publish until `shutdown` turns true. The task returns the number of
    /// messages published.
    pub fn spawn(self, mut shutdown: watch::Receiver<bool>) -> JoinHandle<u64> {
        tokio::spawn(async move {
            if self.rate == 0 || self.topics.is_empty() {
                return 0;
            }

            let mut pacer = Pacer::new(self.rate);
            let tick = pacer.tick;
            let mut interval = tokio::time::interval(tick);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut rng = StdRng::from_entropy();
            let mut payload = vec![0u8; self.payload_size];
            let mut published = 0u64;

            info!(topics = self.topics.len(), rate = self.rate, ?tick, "synthetic publisher started");

            loop {
                tokio::select! {
                    changed = shutdown.changed() => {
                        if changed.is_err() || *shutdown.borrow() {
                            break;
                        }
                    },
                    _ = interval.tick() => {
                        let per_tick = pacer.next_batch();
                        for topic in &self.topics {
                            for _ in 0..per_tick {
                                rng.fill_bytes(&mut payload);
                                self.broker.publish(topic, Bytes::copy_from_slice(&payload));
                                published += 1;
                            }
                        }
                    },
                }
            }

            debug!(published, "synthetic publisher stopped");
            published
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::{ClientSettings, Connector, SubscribeRequest};
    use sluice_core::config::SubscriptionType;
    use sluice_core::SubscriptionId;

    fn publisher(rate: u64) -> SyntheticPublisher {
        let topics = vec!["persistent://t/ns/a".parse().unwrap()];
        SyntheticPublisher::new(InMemoryBroker::new(), topics, rate, 16)
    }

    /// Messages published over one second of ticks.
    fn one_second(rate: u64) -> (Duration, u64) {
        let mut pacer = Pacer::new(rate);
        let ticks = Duration::from_secs(1).as_nanos() / pacer.tick.as_nanos();
        let total = (0..ticks).map(|_| pacer.next_batch()).sum();
        (pacer.tick, total)
    }

    #[test]
    fn test_pacer_tick() {
        assert_eq!(Pacer::new(10).tick, Duration::from_millis(100));
        assert_eq!(Pacer::new(1).tick, Duration::from_secs(1));
        assert_eq!(Pacer::new(1000).tick, MIN_TICK);
        assert_eq!(Pacer::new(150).tick, MIN_TICK);
    }

    #[test]
    fn test_pacer_keeps_exact_rate() {
        for rate in [1, 10, 100, 150, 250, 999, 1000, 12_345] {
            assert_eq!(one_second(rate).1, rate, "rate {rate}");
        }
    }

    #[test]
    fn test_pacer_alternates_fractional_share() {
        let mut pacer = Pacer::new(150);
        let batches: Vec<u64> = (0..4).map(|_| pacer.next_batch()).collect();
        assert_eq!(batches, vec![1, 2, 1, 2]);
    }

    #[tokio::test]
    async fn test_zero_rate_publishes_nothing() {
        let (_tx, rx) = watch::channel(false);
        assert_eq!(publisher(0).spawn(rx).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_publishes_until_shutdown() {
        let broker = InMemoryBroker::new();
        let topic: TopicName = "persistent://t/ns/a".parse().unwrap();
        let client = broker
            .connect(&ClientSettings {
                service_url: "http://localhost:8080".into(),
                io_threads: 1,
                operation_timeout: Duration::from_secs(1),
            })
            .await
            .unwrap();
        let handle = client
            .subscribe(SubscribeRequest {
                topic: topic.clone(),
                subscription: SubscriptionId::generate(),
                subscription_type: SubscriptionType::Shared,
                auto_update_partitions: None,
                batch_policy: None,
            })
            .await
            .unwrap();

        let (tx, rx) = watch::channel(false);
        let task = SyntheticPublisher::new(broker.clone(), vec![topic], 1000, 32).spawn(rx);

        let message = handle.receive(Duration::from_secs(5)).await.unwrap();
        assert_eq!(message.payload_size(), 32);

        tx.send(true).unwrap();
        assert!(task.await.unwrap() >= 1);
    }
}
