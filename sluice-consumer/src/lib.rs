//! # Sluice Consumer
//!
//! Consumer fleet orchestrator for the Sluice load harness.
//!
//! A run subscribes to every topic of a generated topic set and drains them,
//! either by registering push listeners or by running a fixed number of pull
//! workers. Each pull worker owns a round-robin share of the topics and caps
//! its outstanding receive→action→acknowledge pipelines with a per-worker
//! limiter.
//!
//! The broker is reached through the [`client`] traits. [`memory`] provides
//! an in-process implementation used by the tests and the `sluice` binary.
//!
//! ## Examples
//!
//! ```rust,no_run
//! use sluice_consumer::{action::NoopAction, Fleet, InMemoryBroker};
//! use sluice_core::HarnessConfig;
//! use std::sync::Arc;
//!
//! # async fn example() -> sluice_core::Result<()> {
//! let mut config = HarnessConfig::default();
//! config.topics.suffix_count = 16;
//! config.fleet.pull_threads = 4;
//!
//! let broker = InMemoryBroker::new();
//! let fleet = Fleet::boot(&config, &broker, Arc::new(NoopAction)).await?;
//!
//! for topic in fleet.topics() {
//!     broker.publish(topic, "hello".into());
//! }
//!
//! let stats = fleet.shutdown().await?;
//! println!("acknowledged {}", stats.acknowledged());
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod action;
pub mod assignment;
pub mod builder;
pub mod client;
pub mod fleet;
pub mod limiter;
pub mod memory;
pub mod stats;
pub mod synthetic;
pub mod topics;
pub mod worker;

pub use action::Action;
pub use assignment::Assignment;
pub use builder::HandleBuilder;
pub use client::{BatchPolicy, ClientSettings, ConsumerHandle, Connector, MessagingClient};
pub use fleet::Fleet;
pub use limiter::{Limit, Limiter, Permit};
pub use memory::{BrokerOptions, InMemoryBroker};
pub use sluice_core::{Error, Result};
pub use stats::{FleetStats, WorkerState};
pub use topics::TopicSpec;
pub use worker::{PullWorker, RebalanceHook};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::{
        Action, Assignment, ConsumerHandle, Connector, Fleet, FleetStats, InMemoryBroker, Limit,
        MessagingClient, TopicSpec, WorkerState,
    };
    pub use sluice_core::prelude::*;
}
