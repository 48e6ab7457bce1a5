//! `sluice`: run a consumer fleet against the in-process broker.

use anyhow::Context;
use clap::Parser;
use sluice_consumer::synthetic::SyntheticPublisher;
use sluice_consumer::{action, BrokerOptions, Fleet, InMemoryBroker};
use sluice_core::config::{ConfigLoader, DeliveryMode, LogFormat, SubscriptionType};
use sluice_core::telemetry;
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::watch;
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "sluice")]
#[command(about = "Consumer fleet load harness for publish/subscribe brokers")]
#[command(version)]
struct Cli {
    /// Configuration file; searched for in ./, ./config and the user config dir when absent
    #[arg(long, short = 'c', env = "SLUICE_CONFIG")]
    config: Option<PathBuf>,

    /// Broker host
    #[arg(long)]
    host: Option<String>,

    /// Broker port
    #[arg(long)]
    port: Option<u16>,

    /// Topic tenant
    #[arg(long)]
    tenant: Option<String>,

    /// Topic namespace
    #[arg(long)]
    namespace: Option<String>,

    /// Base topic name
    #[arg(long)]
    topic: Option<String>,

    /// Number of suffixed topics; 0 subscribes the bare topic only
    #[arg(long, alias = "suffix-num")]
    suffix_count: Option<u32>,

    /// Delivery mode: listen or pull
    #[arg(long, value_parser = parse_mode)]
    mode: Option<DeliveryMode>,

    /// Number of pull workers
    #[arg(long)]
    pull_threads: Option<u32>,

    /// In-flight receives per worker; -1 for unbounded
    #[arg(long, allow_hyphen_values = true)]
    receive_limit: Option<i64>,

    /// Subscription type: exclusive, shared, failover or key_shared
    #[arg(long, value_parser = parse_subscription_type)]
    subscription_type: Option<SubscriptionType>,

    /// Receive in batches
    #[arg(long)]
    consume_batch: Option<bool>,

    /// Synthetic messages per second per topic; 0 disables the publisher
    #[arg(long)]
    rate: Option<u32>,

    /// Stop after this many seconds instead of waiting for Ctrl-C
    #[arg(long)]
    duration: Option<u64>,

    /// Log filter directive
    #[arg(long)]
    log_level: Option<String>,

    /// Log format: text or json
    #[arg(long, value_parser = parse_log_format)]
    log_format: Option<LogFormat>,
}

fn parse_mode(s: &str) -> sluice_core::Result<DeliveryMode> {
    s.parse()
}

fn parse_subscription_type(s: &str) -> sluice_core::Result<SubscriptionType> {
    s.parse()
}

fn parse_log_format(s: &str) -> sluice_core::Result<LogFormat> {
    s.parse()
}

impl Cli {
    /// Loader with every flag given on the command line applied last.
    fn loader(&self) -> ConfigLoader {
        let mut loader = ConfigLoader::new();
        if let Some(path) = &self.config {
            loader = loader.with_file(path);
        }

        let strings = [
            ("broker.host", &self.host),
            ("topics.tenant", &self.tenant),
            ("topics.namespace", &self.namespace),
            ("topics.topic", &self.topic),
            ("logging.level", &self.log_level),
        ];
        for (key, value) in strings {
            if let Some(value) = value {
                loader = loader.with_override(key, value.as_str());
            }
        }

        let integers = [
            ("broker.port", self.port.map(i64::from)),
            ("topics.suffix_count", self.suffix_count.map(i64::from)),
            ("fleet.pull_threads", self.pull_threads.map(i64::from)),
            ("fleet.receive_limit", self.receive_limit),
            ("fleet.synthetic_rate", self.rate.map(i64::from)),
        ];
        for (key, value) in integers {
            if let Some(value) = value {
                loader = loader.with_override(key, value);
            }
        }

        if let Some(mode) = self.mode {
            loader = loader.with_override("fleet.mode", mode.as_str());
        }
        if let Some(subscription_type) = self.subscription_type {
            loader = loader.with_override("consumer.subscription_type", subscription_type.as_str());
        }
        if let Some(consume_batch) = self.consume_batch {
            loader = loader.with_override("consumer.consume_batch", consume_batch);
        }
        if let Some(format) = self.log_format {
            loader = loader.with_override("logging.format", format.as_str());
        }
        loader
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.loader().load().context("failed to load configuration")?;
    telemetry::init_logging(&config.logging)?;

    info!(
        mode = %config.fleet.mode,
        topics = config.topics.suffix_count.max(1),
        pull_threads = config.fleet.pull_threads,
        receive_limit = config.fleet.receive_limit,
        "starting sluice"
    );

    // Runs are open-ended; keep ack counts only.
    let broker = InMemoryBroker::with_options(BrokerOptions { ack_history: 0, ..BrokerOptions::default() });
    let fleet = Fleet::boot(&config, &broker, action::from_settings(&config.action))
        .await
        .context("fleet boot failed")?;

    let (stop_tx, stop_rx) = watch::channel(false);
    let publisher = SyntheticPublisher::new(
        broker.clone(),
        fleet.topics().to_vec(),
        config.fleet.synthetic_rate,
        config.fleet.synthetic_payload_size,
    )
    .spawn(stop_rx);

    let stats_interval = config.fleet.stats_interval;
    let mut ticker = tokio::time::interval(stats_interval.max(Duration::from_secs(1)));
    ticker.tick().await;
    let deadline = cli.duration.map(|secs| tokio::time::Instant::now() + Duration::from_secs(secs));

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                signal.context("failed to listen for Ctrl-C")?;
                info!("interrupt received");
                break;
            },
            () = sleep_until(deadline) => {
                info!("run duration elapsed");
                break;
            },
            _ = ticker.tick(), if !stats_interval.is_zero() => {
                let stats = fleet.stats();
                info!(
                    messages = stats.messages(),
                    acknowledged = stats.acknowledged(),
                    receive_timeouts = stats.receive_timeouts(),
                    receive_errors = stats.receive_errors(),
                    action_failures = stats.action_failures(),
                    dropped_handles = stats.dropped_handles(),
                    listener_deliveries = stats.listener_deliveries,
                    "fleet progress"
                );
            },
        }
    }

    let _ = stop_tx.send(true);
    let published = publisher.await.context("synthetic publisher failed")?;
    let stats = fleet.shutdown().await?;

    info!(published, dropped_messages = broker.dropped_messages(), "run complete");
    println!("{}", serde_json::to_string_pretty(&stats)?);
    Ok(())
}

async fn sleep_until(deadline: Option<tokio::time::Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
