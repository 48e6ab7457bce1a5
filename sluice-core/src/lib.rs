//! # Sluice Core
//!
//! Shared foundation for the Sluice consumer load harness.
//!
//! Sluice subscribes to many topics on a publish/subscribe broker and drains
//! them under configurable concurrency, so that the broker's delivery behavior
//! can be measured. This crate holds the pieces every other crate needs:
//!
//! - [`message`]: topic identifiers and delivered messages
//! - [`types`]: subscription, worker and sequence identifiers
//! - [`config`]: the harness configuration schema, loader and validator
//! - [`error`]: the error taxonomy and receive-failure classification
//! - [`telemetry`]: global `tracing` subscriber setup
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use sluice_core::{config::ConfigLoader, telemetry};
//!
//! # fn main() -> sluice_core::Result<()> {
//! let config = ConfigLoader::new().load()?;
//! telemetry::init_logging(&config.logging)?;
//! # Ok(())
//! # }
//! ```

#![deny(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod error;
pub mod message;
pub mod prelude;
pub mod telemetry;
pub mod types;

pub use crate::{
    config::HarnessConfig,
    error::{Error, ReceiveDisposition, Result},
    message::{Message, MessageId, TopicDomain, TopicName},
    types::{Sequence, SubscriptionId, Timestamp, WorkerId},
};
