//! # Configuration Validation
//!
//! Validates configuration settings for consistency and safety beyond what the
//! field-level `validator` attributes can express.

use crate::{
    config::schema::{DeliveryMode, HarnessConfig, UNBOUNDED_RECEIVE_LIMIT},
    config::ActionKind,
    Error, Result,
};
use std::time::Duration;
use tracing::{debug, warn};
use validator::Validate;

/// Host facts the validator compares the configuration against.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationContext {
    /// Logical CPU cores available
    pub cpu_cores: usize,
}

impl ValidationContext {
    /// Detect the current host.
    #[must_use]
    pub fn detect() -> Self {
        Self { cpu_cores: num_cpus::get().max(1) }
    }
}

/// Configuration validator with cross-field rules
pub struct ConfigValidator {
    context: ValidationContext,
}

impl ConfigValidator {
    /// Create a new configuration validator
    pub fn new() -> Self {
        Self { context: ValidationContext::detect() }
    }

    /// Create validator with custom context
    pub fn with_context(context: ValidationContext) -> Self {
        Self { context }
    }

    /// Validate a configuration
    pub fn validate(config: &HarnessConfig) -> Result<()> {
        Self::new().validate_config(config)
    }

    /// Run field-level and cross-field validation.
    pub fn validate_config(&self, config: &HarnessConfig) -> Result<()> {
        debug!("Starting configuration validation");

        config.validate().map_err(Error::from)?;

        self.validate_broker(config)?;
        self.validate_consumer(config)?;
        self.validate_fleet(config)?;
        self.validate_action(config)?;

        debug!("Configuration validation completed successfully");
        Ok(())
    }

    fn validate_broker(&self, config: &HarnessConfig) -> Result<()> {
        if config.broker.operation_timeout.is_zero() {
            return Err(Error::configuration("broker.operation_timeout must be greater than 0"));
        }

        if config.broker.io_threads > self.context.cpu_cores * 4 {
            warn!(
                io_threads = config.broker.io_threads,
                cpu_cores = self.context.cpu_cores,
                "Client I/O threads significantly exceed CPU cores"
            );
        }

        Ok(())
    }

    fn validate_consumer(&self, config: &HarnessConfig) -> Result<()> {
        let consumer = &config.consumer;

        if consumer.receive_timeout.is_zero() {
            return Err(Error::configuration("consumer.receive_timeout must be greater than 0"));
        }

        if consumer.consume_batch && consumer.batch_timeout.is_zero() {
            return Err(Error::configuration(
                "consumer.batch_timeout must be greater than 0 when consume_batch is enabled",
            ));
        }

        if consumer.auto_update_partitions && consumer.auto_update_partitions_interval.is_zero() {
            return Err(Error::configuration(
                "consumer.auto_update_partitions_interval must be at least one second",
            ));
        }

        if consumer.consume_batch && config.fleet.mode == DeliveryMode::Listen {
            warn!("consume_batch has no effect in listen mode");
        }

        Ok(())
    }

    fn validate_fleet(&self, config: &HarnessConfig) -> Result<()> {
        let fleet = &config.fleet;

        if fleet.receive_limit != UNBOUNDED_RECEIVE_LIMIT && fleet.receive_limit < 1 {
            return Err(Error::configuration(format!(
                "fleet.receive_limit must be -1 (unbounded) or at least 1, got {}",
                fleet.receive_limit
            )));
        }

        if fleet.shutdown_timeout < Duration::from_millis(1) {
            return Err(Error::configuration("fleet.shutdown_timeout must be greater than 0"));
        }

        if fleet.mode == DeliveryMode::Pull {
            let drain = Self::drain_estimate(config);
            if fleet.shutdown_timeout <= drain {
                return Err(Error::configuration(format!(
                    "fleet.shutdown_timeout ({}ms) must exceed the longest receive wait plus \
                     action time ({}ms), or workers are aborted with messages unacknowledged",
                    fleet.shutdown_timeout.as_millis(),
                    drain.as_millis()
                )));
            }

            let topics = config.topics.suffix_count.max(1) as usize;
            if fleet.pull_threads > topics {
                warn!(
                    pull_threads = fleet.pull_threads,
                    topics, "More pull workers than topics; some workers will stay idle"
                );
            }
        }

        Ok(())
    }

    /// Longest a worker can take to notice shutdown and settle what it holds:
    /// one receive wait plus the actions of one receive, which run in order.
    fn drain_estimate(config: &HarnessConfig) -> Duration {
        let consumer = &config.consumer;
        let (wait, messages) = if consumer.consume_batch {
            (consumer.batch_timeout, consumer.batch_max_messages.max(1))
        } else {
            (consumer.receive_timeout, 1)
        };
        let delay = match config.action.kind {
            ActionKind::Delay => config.action.delay,
            ActionKind::Noop | ActionKind::Log => Duration::ZERO,
        };
        wait.saturating_add(delay.saturating_mul(messages))
    }

    fn validate_action(&self, config: &HarnessConfig) -> Result<()> {
        if config.action.kind == ActionKind::Delay && config.action.delay.is_zero() {
            warn!("Delay action configured with a zero delay");
        }

        if config.action.kind != ActionKind::Delay && !config.action.delay.is_zero() {
            debug!("action.delay is ignored unless action.kind = \"delay\"");
        }

        Ok(())
    }
}

impl Default for ConfigValidator {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validator_creation() {
        let validator = ConfigValidator::new();
        assert!(validator.context.cpu_cores > 0);
    }

    #[test]
    fn test_default_config_validation() {
        assert!(ConfigValidator::validate(&HarnessConfig::default()).is_ok());
    }

    #[test]
    fn test_receive_limit_rules() {
        let mut config = HarnessConfig::default();

        config.fleet.receive_limit = 0;
        assert!(ConfigValidator::validate(&config).is_err());

        config.fleet.receive_limit = -2;
        assert!(ConfigValidator::validate(&config).is_err());

        config.fleet.receive_limit = -1;
        assert!(ConfigValidator::validate(&config).is_ok());

        config.fleet.receive_limit = 16;
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_zero_pull_threads_rejected() {
        let mut config = HarnessConfig::default();
        config.fleet.pull_threads = 0;
        let err = ConfigValidator::validate(&config).unwrap_err();
        assert!(matches!(err, Error::Configuration { .. }));
    }

    #[test]
    fn test_batch_rules() {
        let mut config = HarnessConfig::default();
        config.consumer.consume_batch = true;
        config.consumer.batch_timeout = Duration::ZERO;
        assert!(ConfigValidator::validate(&config).is_err());

        config.consumer.batch_timeout = Duration::from_millis(10);
        config.consumer.batch_max_messages = 0;
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_shutdown_timeout_must_cover_drain() {
        let mut config = HarnessConfig::default();
        config.consumer.receive_timeout = Duration::from_millis(500);
        config.fleet.shutdown_timeout = Duration::from_millis(500);
        assert!(ConfigValidator::validate(&config).is_err());

        config.fleet.shutdown_timeout = Duration::from_millis(501);
        assert!(ConfigValidator::validate(&config).is_ok());

        config.action.kind = ActionKind::Delay;
        config.action.delay = Duration::from_millis(100);
        assert!(ConfigValidator::validate(&config).is_err());

        config.consumer.consume_batch = true;
        config.consumer.batch_timeout = Duration::from_millis(50);
        config.consumer.batch_max_messages = 10;
        config.fleet.shutdown_timeout = Duration::from_millis(1_000);
        assert!(ConfigValidator::validate(&config).is_err());
        config.fleet.shutdown_timeout = Duration::from_millis(1_100);
        assert!(ConfigValidator::validate(&config).is_ok());

        // Listen mode has no workers to drain.
        config.fleet.mode = DeliveryMode::Listen;
        config.fleet.shutdown_timeout = Duration::from_millis(1);
        assert!(ConfigValidator::validate(&config).is_ok());
    }

    #[test]
    fn test_empty_topic_rejected() {
        let mut config = HarnessConfig::default();
        config.topics.topic.clear();
        assert!(ConfigValidator::validate(&config).is_err());
    }

    #[test]
    fn test_custom_context() {
        let validator = ConfigValidator::with_context(ValidationContext { cpu_cores: 1 });
        let mut config = HarnessConfig::default();
        config.broker.io_threads = 64;
        // Oversubscription only warns.
        assert!(validator.validate_config(&config).is_ok());
    }
}
