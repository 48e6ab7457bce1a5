//! Logging for the harness.
//!
//! Statistics are carried by the consumer crate; this module only owns the
//! global `tracing` subscriber.

pub mod logging;

pub use logging::{env_filter, init_logging};
