//! Configuration schema definitions for the Sluice harness
//!
//! All configuration structures use serde for (de)serialization and validator
//! for field-level validation. Cross-field rules live in
//! [`ConfigValidator`](crate::config::ConfigValidator).
//!
//! Durations are written as plain integers in configuration files; the unit is
//! part of each field's documentation (milliseconds unless stated otherwise).

use crate::message::TopicDomain;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use validator::Validate;

/// Receive limit value meaning "no per-worker limit".
pub const UNBOUNDED_RECEIVE_LIMIT: i64 = -1;

/// Root configuration for a harness run.
///
/// Loaded in layers: defaults → file → environment → runtime overrides.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, Default, PartialEq, Eq)]
#[serde(default)]
pub struct HarnessConfig {
    /// Broker connection bootstrap parameters
    #[validate(nested)]
    pub broker: BrokerSettings,

    /// Topic template and suffix range
    #[validate(nested)]
    pub topics: TopicSettings,

    /// Per-subscription consumer settings
    #[validate(nested)]
    pub consumer: ConsumerSettings,

    /// Fleet shape: delivery mode, worker count, per-worker limit
    #[validate(nested)]
    pub fleet: FleetSettings,

    /// Downstream action applied to each pulled message
    #[validate(nested)]
    pub action: ActionSettings,

    /// Logging output
    #[validate(nested)]
    pub logging: LoggingConfig,
}

/// Broker connection bootstrap parameters.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq, Eq)]
#[serde(default)]
pub struct BrokerSettings {
    /// Broker host name or address
    #[validate(length(min = 1, max = 253))]
    pub host: String,

    /// Broker service port
    #[validate(range(min = 1))]
    pub port: u16,

    /// Client I/O threads
    #[validate(range(min = 1, max = 1024))]
    pub io_threads: usize,

    /// Timeout for client operations such as subscribe, in seconds
    #[serde(with = "duration_secs")]
    pub operation_timeout: Duration,
}

impl BrokerSettings {
    /// Service address handed to the messaging client.
    #[must_use]
    pub fn service_url(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

/// Topic template: one base name plus an optional numeric suffix range.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq, Eq)]
#[serde(default)]
pub struct TopicSettings {
    /// Topic domain (URI scheme)
    pub domain: TopicDomain,

    /// Tenant segment
    #[validate(length(min = 1))]
    pub tenant: String,

    /// Namespace segment
    #[validate(length(min = 1))]
    pub namespace: String,

    /// Base topic name
    #[validate(length(min = 1))]
    pub topic: String,

    /// Number of suffixed topics; `0` means the bare base name only
    pub suffix_count: u32,
}

/// Consumer settings applied to every subscription.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq, Eq)]
#[serde(default)]
pub struct ConsumerSettings {
    /// Subscription type requested from the broker
    pub subscription_type: SubscriptionType,

    /// Let the client follow partition count changes
    pub auto_update_partitions: bool,

    /// How often partition changes are polled, in seconds
    #[serde(with = "duration_secs")]
    pub auto_update_partitions_interval: Duration,

    /// Use batch receive instead of single-message receive
    pub consume_batch: bool,

    /// Maximum wait for a batch to fill, in milliseconds
    #[serde(with = "duration_ms")]
    pub batch_timeout: Duration,

    /// Maximum messages per batch
    #[validate(range(min = 1))]
    pub batch_max_messages: u32,

    /// Timeout of a single-message receive, in milliseconds
    #[serde(with = "duration_ms")]
    pub receive_timeout: Duration,

    /// Whether a message whose action failed is still acknowledged
    pub action_failure_policy: ActionFailurePolicy,

    /// Pause after a failed receive before the next attempt, in milliseconds;
    /// `0` retries immediately
    #[serde(with = "duration_ms")]
    pub retry_backoff: Duration,
}

/// Fleet shape.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq, Eq)]
#[serde(default)]
pub struct FleetSettings {
    /// Push (listener) or pull delivery
    pub mode: DeliveryMode,

    /// Number of pull workers
    #[validate(range(min = 1, max = 4096))]
    pub pull_threads: usize,

    /// Maximum in-flight receives per worker; `-1` is unbounded
    pub receive_limit: i64,

    /// Time allowed for workers to drain on shutdown, in milliseconds
    #[serde(with = "duration_ms")]
    pub shutdown_timeout: Duration,

    /// Interval between statistics log lines, in seconds; `0` disables them
    #[serde(with = "duration_secs")]
    pub stats_interval: Duration,

    /// Messages per second published into each topic by the in-process
    /// broker's synthetic publisher; `0` disables it
    pub synthetic_rate: u64,

    /// Payload size of synthetic messages, in bytes
    #[validate(range(max = 16_777_216))]
    pub synthetic_payload_size: usize,
}

/// Downstream action settings.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq, Eq)]
#[serde(default)]
pub struct ActionSettings {
    /// Which built-in action to run
    pub kind: ActionKind,

    /// Delay applied by [`ActionKind::Delay`], in milliseconds
    #[serde(with = "duration_ms")]
    pub delay: Duration,
}

/// Logging output configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Validate, PartialEq, Eq)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by `RUST_LOG`
    #[validate(length(min = 1))]
    pub level: String,

    /// Output format
    pub format: LogFormat,

    /// Include thread ids in log lines
    pub with_thread_ids: bool,

    /// Include the event target in log lines
    pub with_target: bool,
}

/// Subscription type requested from the broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionType {
    /// One consumer per subscription
    #[default]
    Exclusive,
    /// Round-robin across consumers
    Shared,
    /// Active/standby consumers
    Failover,
    /// Key-hashed distribution across consumers
    KeyShared,
}

/// How messages reach the harness.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMode {
    /// Broker pushes messages to a listener; nothing is acknowledged
    Listen,
    /// Harness workers actively receive and acknowledge
    #[default]
    Pull,
}

/// What happens to a message whose downstream action failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActionFailurePolicy {
    /// Acknowledge anyway; the failure is only counted
    #[default]
    Acknowledge,
    /// Leave it unacknowledged; the broker redelivers it once its
    /// acknowledgment deadline passes
    LeaveUnacknowledged,
}

/// Built-in downstream actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ActionKind {
    /// Do nothing
    #[default]
    Noop,
    /// Log message identity and size
    Log,
    /// Sleep before acknowledging
    Delay,
}

/// Log output format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
    /// Human-readable lines
    #[default]
    Text,
    /// One JSON object per line
    Json,
}

macro_rules! string_enum {
    ($ty:ty { $($variant:ident => $name:literal),+ $(,)? }) => {
        impl $ty {
            /// Configuration spelling of this value.
            #[must_use]
            pub const fn as_str(self) -> &'static str {
                match self {
                    $(Self::$variant => $name,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = crate::Error;

            fn from_str(s: &str) -> crate::Result<Self> {
                let normalized = s.trim().to_ascii_lowercase().replace('-', "_");
                match normalized.as_str() {
                    $($name => Ok(Self::$variant),)+
                    _ => Err(crate::Error::configuration(format!(
                        "unknown {} '{s}'",
                        stringify!($ty)
                    ))),
                }
            }
        }
    };
}

string_enum!(SubscriptionType {
    Exclusive => "exclusive",
    Shared => "shared",
    Failover => "failover",
    KeyShared => "key_shared",
});
string_enum!(DeliveryMode { Listen => "listen", Pull => "pull" });
string_enum!(ActionFailurePolicy {
    Acknowledge => "acknowledge",
    LeaveUnacknowledged => "leave_unacknowledged",
});
string_enum!(ActionKind { Noop => "noop", Log => "log", Delay => "delay" });
string_enum!(LogFormat { Text => "text", Json => "json" });

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(u64::try_from(duration.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let ms = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(ms))
    }
}

mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

impl Default for BrokerSettings {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 8080,
            io_threads: num_cpus::get().clamp(1, 1024),
            operation_timeout: Duration::from_secs(15),
        }
    }
}

impl Default for TopicSettings {
    fn default() -> Self {
        Self {
            domain: TopicDomain::Persistent,
            tenant: "public".to_string(),
            namespace: "default".to_string(),
            topic: "topic".to_string(),
            suffix_count: 0,
        }
    }
}

impl Default for ConsumerSettings {
    fn default() -> Self {
        Self {
            subscription_type: SubscriptionType::Exclusive,
            auto_update_partitions: false,
            auto_update_partitions_interval: Duration::from_secs(60),
            consume_batch: false,
            batch_timeout: Duration::from_millis(50),
            batch_max_messages: 500,
            receive_timeout: Duration::from_millis(1000),
            action_failure_policy: ActionFailurePolicy::Acknowledge,
            retry_backoff: Duration::ZERO,
        }
    }
}

impl Default for FleetSettings {
    fn default() -> Self {
        Self {
            mode: DeliveryMode::Pull,
            pull_threads: 1,
            receive_limit: UNBOUNDED_RECEIVE_LIMIT,
            shutdown_timeout: Duration::from_millis(10_000),
            stats_interval: Duration::from_secs(10),
            synthetic_rate: 0,
            synthetic_payload_size: 128,
        }
    }
}

impl Default for ActionSettings {
    fn default() -> Self {
        Self { kind: ActionKind::Noop, delay: Duration::from_millis(0) }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            format: LogFormat::Text,
            with_thread_ids: false,
            with_target: true,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_validate() {
        let config = HarnessConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.fleet.mode, DeliveryMode::Pull);
        assert_eq!(config.fleet.receive_limit, UNBOUNDED_RECEIVE_LIMIT);
    }

    #[test]
    fn test_toml_round_trip_keeps_units() {
        let mut config = HarnessConfig::default();
        config.consumer.batch_timeout = Duration::from_millis(75);
        config.broker.operation_timeout = Duration::from_secs(3);

        let text = toml::to_string(&config).unwrap();
        assert!(text.contains("batch_timeout = 75"));
        assert!(text.contains("operation_timeout = 3"));

        let parsed: HarnessConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: HarnessConfig = toml::from_str(
            r#"
            [fleet]
            mode = "listen"
            pull_threads = 4

            [consumer]
            subscription_type = "key_shared"
            "#,
        )
        .unwrap();

        assert_eq!(parsed.fleet.mode, DeliveryMode::Listen);
        assert_eq!(parsed.fleet.pull_threads, 4);
        assert_eq!(parsed.consumer.subscription_type, SubscriptionType::KeyShared);
        assert_eq!(parsed.topics, TopicSettings::default());
    }

    #[test]
    fn test_enum_from_str() {
        assert_eq!("Key-Shared".parse::<SubscriptionType>().unwrap(), SubscriptionType::KeyShared);
        assert_eq!("LISTEN".parse::<DeliveryMode>().unwrap(), DeliveryMode::Listen);
        assert!("push".parse::<DeliveryMode>().is_err());
        assert_eq!(ActionKind::Delay.to_string(), "delay");
    }

    #[test]
    fn test_service_url() {
        let broker = BrokerSettings { host: "broker-1".into(), port: 6650, ..Default::default() };
        assert_eq!(broker.service_url(), "http://broker-1:6650");
    }
}
