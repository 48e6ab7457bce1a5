//! Configuration loading through the public API.

use proptest::prelude::*;
use sluice_core::config::{
    self, ActionFailurePolicy, ConfigLoader, DeliveryMode, HarnessConfig, LogFormat,
};
use sluice_core::{telemetry, Error};
use std::time::Duration;

fn loader_in(dir: &std::path::Path) -> ConfigLoader {
    ConfigLoader::new()
        .with_file(dir.join("sluice.toml"))
        .with_env_vars(Vec::<(String, String)>::new())
}

#[test]
fn test_full_file_layered_with_environment() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("sluice.toml"),
        r#"
        [broker]
        host = "pulsar.internal"
        port = 6650
        operation_timeout = 15

        [topics]
        domain = "non-persistent"
        tenant = "load"
        namespace = "bench"
        topic = "events"
        suffix_count = 40

        [consumer]
        subscription_type = "failover"
        consume_batch = true
        batch_timeout = 25
        batch_max_messages = 200
        action_failure_policy = "leave_unacknowledged"

        [fleet]
        mode = "pull"
        pull_threads = 8
        receive_limit = 32

        [logging]
        level = "debug"
        format = "json"
        "#,
    )
    .unwrap();

    let config = loader_in(dir.path())
        .with_env_vars([("SLUICE_FLEET__RECEIVE_LIMIT", "-1"), ("SLUICE_BROKER__PORT", "6651")])
        .load()
        .unwrap();

    assert_eq!(config.broker.service_url(), "http://pulsar.internal:6651");
    assert_eq!(config.broker.operation_timeout, Duration::from_secs(15));
    assert_eq!(config.topics.suffix_count, 40);
    assert!(config.consumer.consume_batch);
    assert_eq!(config.consumer.batch_timeout, Duration::from_millis(25));
    assert_eq!(config.consumer.action_failure_policy, ActionFailurePolicy::LeaveUnacknowledged);
    assert_eq!(config.fleet.mode, DeliveryMode::Pull);
    assert_eq!(config.fleet.receive_limit, -1);
    assert_eq!(config.logging.format, LogFormat::Json);
}

#[test]
fn test_batch_without_timeout_rejected() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("sluice.toml"),
        "[consumer]\nconsume_batch = true\nbatch_timeout = 0\n",
    )
    .unwrap();

    let result = loader_in(dir.path()).load();
    assert!(matches!(result, Err(Error::Configuration { .. })));
}

#[test]
fn test_malformed_file_is_configuration_error() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("sluice.toml"), "[fleet\npull_threads = ").unwrap();

    let result = loader_in(dir.path()).load();
    assert!(matches!(result, Err(Error::Configuration { .. })));
}

#[test]
fn test_logging_init_is_repeatable() {
    let config = HarnessConfig::default();
    telemetry::init_logging(&config.logging).unwrap();
    assert!(!telemetry::init_logging(&config.logging).unwrap());
}

proptest! {
    #[test]
    fn prop_receive_limit_accepts_minus_one_or_positive(limit in -1000i64..1000) {
        let mut config = HarnessConfig::default();
        config.fleet.receive_limit = limit;
        let accepted = config::validate(&config).is_ok();
        prop_assert_eq!(accepted, limit == -1 || limit >= 1);
    }
}
