//! Fleet orchestration: boot, run and shut down the whole consumer fleet.

use crate::action::Action;
use crate::assignment::Assignment;
use crate::builder::HandleBuilder;
use crate::client::{ClientSettings, ConsumerHandle, Connector, MessagingClient};
use crate::limiter::{Limit, Limiter};
use crate::stats::{FleetStats, WorkerStats};
use crate::topics::TopicSpec;
use crate::worker::{
    DroppedHandle, DroppedTopicLog, PullWorker, RebalanceHook, WorkerReport, WorkerSettings,
};
use sluice_core::config::{self, DeliveryMode, HarnessConfig};
use sluice_core::{Result, TopicName, WorkerId};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, info, warn};

struct RunningWorker {
    id: WorkerId,
    stats: Arc<WorkerStats>,
    task: JoinHandle<WorkerReport>,
}

/// A booted consumer fleet.
///
/// In [`DeliveryMode::Listen`] the fleet holds one listener-backed handle per
/// topic and no workers. In [`DeliveryMode::Pull`] it runs exactly
/// `pull_threads` workers, each owning the handles the round-robin
/// [`Assignment`] gives it.
pub struct Fleet {
    mode: DeliveryMode,
    client: Arc<dyn MessagingClient>,
    topics: Vec<TopicName>,
    handles: Vec<Arc<dyn ConsumerHandle>>,
    assignment: Option<Assignment>,
    workers: Vec<RunningWorker>,
    shutdown_tx: watch::Sender<bool>,
    listener_deliveries: Arc<AtomicU64>,
    dropped: Arc<DroppedTopicLog>,
    shutdown_timeout: Duration,
}

impl std::fmt::Debug for Fleet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fleet")
            .field("mode", &self.mode)
            .field("topics", &self.topics.len())
            .field("workers", &self.workers.len())
            .finish_non_exhaustive()
    }
}

impl Fleet {
    /// Connect, subscribe every enumerated topic and start the workers.
    ///
    /// Boot is all-or-nothing: if any subscription fails, the handles opened
    /// so far and the client are closed (best effort) and no worker starts.
    ///
    /// # Errors
    /// Returns `Configuration` for an invalid config, `ConnectionFailure`
    /// when the client cannot connect and `SubscriptionFailure` when a topic
    /// cannot be subscribed.
    pub async fn boot(
        config: &HarnessConfig,
        connector: &dyn Connector,
        action: Arc<dyn Action>,
    ) -> Result<Self> {
        config::validate(config)?;

        let mode = config.fleet.mode;
        let topics = TopicSpec::from_settings(&config.topics)?.enumerate();
        let plan = match mode {
            DeliveryMode::Listen => None,
            DeliveryMode::Pull => Some((
                Limit::from_receive_limit(config.fleet.receive_limit)?,
                Assignment::round_robin(topics.len(), config.fleet.pull_threads)?,
            )),
        };

        let settings = ClientSettings::from(&config.broker);
        let client = connector.connect(&settings).await?;
        info!(service_url = %settings.service_url, topics = topics.len(), %mode, "client connected");

        let builder = HandleBuilder::new(Arc::clone(&client), config.consumer.clone());
        let mut handles = Vec::with_capacity(topics.len());
        for topic in &topics {
            match builder.build(topic, mode).await {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!(%topic, error = %e, opened = handles.len(), "fleet boot aborted");
                    close_handles(&handles).await;
                    if let Err(close_error) = client.close().await {
                        warn!(error = %close_error, "failed to close client after boot failure");
                    }
                    return Err(e);
                },
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let dropped = Arc::new(DroppedTopicLog::default());
        let mut workers = Vec::new();
        let mut assignment = None;

        if let Some((limit, plan)) = plan {
            let worker_settings = WorkerSettings::from(&config.consumer);
            for w in 0..plan.workers() {
                let id = WorkerId::new(w);
                let owned = plan.owned(id).iter().map(|&i| Arc::clone(&handles[i])).collect();
                let worker = PullWorker::new(
                    id,
                    owned,
                    Limiter::new(limit),
                    Arc::clone(&action),
                    worker_settings,
                    shutdown_rx.clone(),
                )
                .with_rebalance_hook(Arc::clone(&dropped) as Arc<dyn RebalanceHook>);

                let stats = worker.stats();
                let task = tokio::spawn(worker.run());
                workers.push(RunningWorker { id, stats, task });
            }
            info!(workers = workers.len(), sizes = ?plan.sizes(), "pull workers started");
            assignment = Some(plan);
        } else {
            info!(handles = handles.len(), "listeners registered");
        }

        Ok(Self {
            mode,
            client,
            topics,
            handles,
            assignment,
            workers,
            shutdown_tx,
            listener_deliveries: builder.listener_deliveries(),
            dropped,
            shutdown_timeout: config.fleet.shutdown_timeout,
        })
    }

    /// Delivery mode chosen at boot.
    #[must_use]
    pub const fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Enumerated topics, in handle order.
    #[must_use]
    pub fn topics(&self) -> &[TopicName] {
        &self.topics
    }

    /// Every open handle, in topic order.
    #[must_use]
    pub fn handles(&self) -> &[Arc<dyn ConsumerHandle>] {
        &self.handles
    }

    /// Number of running workers; zero in listen mode.
    #[must_use]
    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    /// Topic-to-worker assignment; `None` in listen mode.
    #[must_use]
    pub const fn assignment(&self) -> Option<&Assignment> {
        self.assignment.as_ref()
    }

    /// Handles dropped from rotation so far.
    #[must_use]
    pub fn dropped_handles(&self) -> Vec<DroppedHandle> {
        self.dropped.dropped()
    }

    /// Live statistics.
    #[must_use]
    pub fn stats(&self) -> FleetStats {
        FleetStats {
            workers: self.workers.iter().map(|w| w.stats.snapshot()).collect(),
            listener_deliveries: self.listener_deliveries.load(Ordering::Relaxed),
        }
    }

    /// Stop the fleet.
    ///
    /// Workers finish their current receive, settle every pending pipeline
    /// and return. Workers still running after the shutdown timeout are
    /// aborted. Every handle and then the client are closed.
    ///
    /// # Errors
    /// Returns the client's error if closing it fails.
    pub async fn shutdown(self) -> Result<FleetStats> {
        let Self { client, handles, workers, shutdown_tx, listener_deliveries, shutdown_timeout, .. } =
            self;

        info!(workers = workers.len(), "shutting down fleet");
        // Workers that already exited have dropped their receivers.
        let _ = shutdown_tx.send(true);

        let deadline = Instant::now() + shutdown_timeout;
        let mut snapshots = Vec::with_capacity(workers.len());
        for RunningWorker { id, stats, mut task } in workers {
            match tokio::time::timeout_at(deadline, &mut task).await {
                Ok(Ok(report)) => snapshots.push(report.stats),
                Ok(Err(join_error)) => {
                    warn!(worker = %id, error = %join_error, "worker task failed");
                    snapshots.push(stats.snapshot());
                },
                Err(_) => {
                    warn!(worker = %id, timeout = ?shutdown_timeout, "worker did not stop in time, aborting");
                    task.abort();
                    snapshots.push(stats.snapshot());
                },
            }
        }

        close_handles(&handles).await;
        client.close().await?;

        let stats = FleetStats {
            workers: snapshots,
            listener_deliveries: listener_deliveries.load(Ordering::Relaxed),
        };
        info!(
            messages = stats.messages(),
            acknowledged = stats.acknowledged(),
            receive_errors = stats.receive_errors(),
            listener_deliveries = stats.listener_deliveries,
            "fleet stopped"
        );
        Ok(stats)
    }
}

async fn close_handles(handles: &[Arc<dyn ConsumerHandle>]) {
    for handle in handles {
        if let Err(e) = handle.close().await {
            warn!(topic = %handle.topic(), subscription = %handle.subscription(), error = %e, "failed to close consumer handle");
        }
    }
}
