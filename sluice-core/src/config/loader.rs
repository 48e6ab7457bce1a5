//! # Configuration Loading
//!
//! Loads [`HarnessConfig`] from layered sources: built-in defaults, a TOML
//! file, `SLUICE_*` environment variables and programmatic overrides, in that
//! order, then validates the result.

use crate::{
    config::{schema::HarnessConfig, validator::ConfigValidator},
    Error, Result,
};
use std::{
    collections::BTreeMap,
    env,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// File names probed in every search path, in order.
const CONFIG_FILE_NAMES: [&str; 2] = ["sluice.toml", "config.toml"];

/// Separator between nesting levels in environment variable names.
const ENV_NESTING_SEPARATOR: &str = "__";

/// Configuration loader with support for multiple sources
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    search_paths: Vec<PathBuf>,
    explicit_file: Option<PathBuf>,
    env_prefix: String,
    env_vars: Option<BTreeMap<String, String>>,
    overrides: Vec<(String, toml::Value)>,
}

impl ConfigLoader {
    /// Create a new configuration loader
    pub fn new() -> Self {
        let mut search_paths = vec![PathBuf::from("."), PathBuf::from("./config")];
        if let Some(dir) = dirs::config_dir() {
            search_paths.push(dir.join("sluice"));
        }

        Self {
            search_paths,
            explicit_file: None,
            env_prefix: "SLUICE".to_string(),
            env_vars: None,
            overrides: Vec::new(),
        }
    }

    /// Add a search path for configuration files
    #[must_use]
    pub fn with_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.search_paths.push(path.as_ref().to_path_buf());
        self
    }

    /// Use exactly this file instead of searching. A missing file is an error.
    #[must_use]
    pub fn with_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.explicit_file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Set the environment variable prefix
    #[must_use]
    pub fn with_env_prefix<S: AsRef<str>>(mut self, prefix: S) -> Self {
        self.env_prefix = prefix.as_ref().to_string();
        self
    }

    /// Read variables from this set instead of the process environment.
    #[must_use]
    pub fn with_env_vars<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<String>,
    {
        self.env_vars = Some(vars.into_iter().map(|(k, v)| (k.into(), v.into())).collect());
        self
    }

    /// Override a dotted key (`fleet.pull_threads`) after all other sources.
    #[must_use]
    pub fn with_override<V: Into<toml::Value>>(mut self, key: &str, value: V) -> Self {
        self.overrides.push((key.to_string(), value.into()));
        self
    }

    /// Load configuration from all available sources
    pub fn load(&self) -> Result<HarnessConfig> {
        info!("Loading configuration from multiple sources");

        let mut config_value = toml::Value::try_from(HarnessConfig::default())?;
        debug!("Applied default configuration");

        if let Some(config_path) = self.resolve_config_file()? {
            let file_config = Self::load_config_file(&config_path)?;
            config_value = Self::merge_config(config_value, file_config);
            info!("Loaded configuration file: {}", config_path.display());
        } else {
            debug!("No configuration file found in search paths");
        }

        for (key, value) in self.collect_env_vars() {
            let parts: Vec<&str> = key.split('.').collect();
            Self::set_nested_value(&mut config_value, &parts, Self::parse_env_value(&value));
        }
        debug!("Applied environment variables");

        for (key, value) in &self.overrides {
            let parts: Vec<&str> = key.split('.').collect();
            Self::set_nested_value(&mut config_value, &parts, value.clone());
        }

        let config: HarnessConfig = config_value
            .try_into()
            .map_err(|e| Error::configuration(format!("Failed to deserialize config: {e}")))?;

        ConfigValidator::validate(&config)?;

        info!("Configuration loaded and validated successfully");
        Ok(config)
    }

    /// Load configuration from a specific file, skipping the environment
    pub fn load_from_file<P: AsRef<Path>>(path: P) -> Result<HarnessConfig> {
        let path = path.as_ref();
        info!("Loading configuration from file: {}", path.display());

        let defaults = toml::Value::try_from(HarnessConfig::default())?;
        let merged = Self::merge_config(defaults, Self::load_config_file(path)?);
        let config: HarnessConfig = merged
            .try_into()
            .map_err(|e| Error::configuration(format!("Failed to parse config file: {e}")))?;

        ConfigValidator::validate(&config)?;
        Ok(config)
    }

    /// Save configuration to a TOML file
    pub fn save_to_file<P: AsRef<Path>>(config: &HarnessConfig, path: P) -> Result<()> {
        let toml_string = toml::to_string_pretty(config)?;

        std::fs::write(path.as_ref(), toml_string).map_err(|e| {
            Error::configuration(format!(
                "Failed to write config to {}: {e}",
                path.as_ref().display()
            ))
        })?;

        info!("Configuration saved to: {}", path.as_ref().display());
        Ok(())
    }

    fn resolve_config_file(&self) -> Result<Option<PathBuf>> {
        if let Some(explicit) = &self.explicit_file {
            if !explicit.exists() {
                return Err(Error::configuration(format!(
                    "Config file {} does not exist",
                    explicit.display()
                )));
            }
            return Ok(Some(explicit.clone()));
        }

        for search_path in &self.search_paths {
            for config_name in CONFIG_FILE_NAMES {
                let config_path = search_path.join(config_name);
                if config_path.is_file() {
                    debug!("Found config file: {}", config_path.display());
                    return Ok(Some(config_path));
                }
            }
        }

        Ok(None)
    }

    fn load_config_file(path: &Path) -> Result<toml::Value> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::configuration(format!("Failed to read config file {}: {e}", path.display()))
        })?;

        content.parse::<toml::Value>().map_err(|e| {
            Error::configuration(format!("Failed to parse config file {}: {e}", path.display()))
        })
    }

    fn merge_config(mut base: toml::Value, override_value: toml::Value) -> toml::Value {
        if let (toml::Value::Table(base_table), toml::Value::Table(override_table)) =
            (&mut base, override_value)
        {
            for (key, value) in override_table {
                match base_table.get_mut(&key) {
                    Some(existing) if existing.is_table() && value.is_table() => {
                        let current = std::mem::replace(existing, toml::Value::Boolean(false));
                        *existing = Self::merge_config(current, value);
                    },
                    Some(existing) => *existing = value,
                    None => {
                        base_table.insert(key, value);
                    },
                }
            }
        }

        base
    }

    /// `SLUICE_FLEET__PULL_THREADS=4` becomes `fleet.pull_threads = 4`.
    fn collect_env_vars(&self) -> BTreeMap<String, String> {
        let prefix = format!("{}_", self.env_prefix);
        let source: Box<dyn Iterator<Item = (String, String)>> = match &self.env_vars {
            Some(vars) => Box::new(vars.clone().into_iter()),
            None => Box::new(env::vars()),
        };

        let collected: BTreeMap<String, String> = source
            .filter_map(|(key, value)| {
                let stripped = key.strip_prefix(&prefix)?;
                let config_key = stripped
                    .split(ENV_NESTING_SEPARATOR)
                    .map(str::to_lowercase)
                    .collect::<Vec<_>>()
                    .join(".");
                Some((config_key, value))
            })
            .collect();

        debug!("Collected {} environment variables", collected.len());
        collected
    }

    fn set_nested_value(config: &mut toml::Value, parts: &[&str], value: toml::Value) {
        let toml::Value::Table(table) = config else {
            return;
        };

        match parts {
            [] => {},
            [last] => {
                table.insert((*last).to_string(), value);
            },
            [head, rest @ ..] => {
                let entry = table
                    .entry((*head).to_string())
                    .or_insert_with(|| toml::Value::Table(toml::map::Map::new()));
                Self::set_nested_value(entry, rest, value);
            },
        }
    }

    fn parse_env_value(value: &str) -> toml::Value {
        if let Ok(bool_val) = value.parse::<bool>() {
            return toml::Value::Boolean(bool_val);
        }

        if let Ok(int_val) = value.parse::<i64>() {
            return toml::Value::Integer(int_val);
        }

        if let Ok(float_val) = value.parse::<f64>() {
            return toml::Value::Float(float_val);
        }

        toml::Value::String(value.to_string())
    }
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{DeliveryMode, SubscriptionType};
    use std::time::Duration;

    fn isolated_loader(dir: &Path) -> ConfigLoader {
        ConfigLoader {
            search_paths: vec![dir.to_path_buf()],
            ..ConfigLoader::new()
        }
        .with_env_vars(Vec::<(String, String)>::new())
    }

    #[test]
    fn test_defaults_without_sources() {
        let dir = tempfile::tempdir().unwrap();
        let config = isolated_loader(dir.path()).load().unwrap();
        assert_eq!(config, HarnessConfig::default());
    }

    #[test]
    fn test_file_then_env_then_override() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(
            dir.path().join("sluice.toml"),
            r#"
            [topics]
            tenant = "acme"
            topic = "orders"
            suffix_count = 3

            [fleet]
            pull_threads = 2
            receive_limit = 10
            "#,
        )
        .unwrap();

        let config = isolated_loader(dir.path())
            .with_env_vars([
                ("SLUICE_FLEET__PULL_THREADS", "6"),
                ("SLUICE_CONSUMER__SUBSCRIPTION_TYPE", "shared"),
                ("SLUICE_CONSUMER__BATCH_TIMEOUT", "20"),
                ("UNRELATED_VAR", "x"),
            ])
            .with_override("fleet.receive_limit", -1)
            .with_override("fleet.mode", "listen")
            .load()
            .unwrap();

        assert_eq!(config.topics.tenant, "acme");
        assert_eq!(config.topics.topic, "orders");
        assert_eq!(config.topics.suffix_count, 3);
        assert_eq!(config.topics.namespace, "default");
        assert_eq!(config.fleet.pull_threads, 6);
        assert_eq!(config.fleet.receive_limit, -1);
        assert_eq!(config.fleet.mode, DeliveryMode::Listen);
        assert_eq!(config.consumer.subscription_type, SubscriptionType::Shared);
        assert_eq!(config.consumer.batch_timeout, Duration::from_millis(20));
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let result = isolated_loader(dir.path()).with_file(dir.path().join("absent.toml")).load();
        assert!(matches!(result, Err(Error::Configuration { .. })));
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        let result = isolated_loader(dir.path()).with_override("fleet.receive_limit", 0).load();
        assert!(result.is_err());
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("saved.toml");

        let mut config = HarnessConfig::default();
        config.topics.suffix_count = 12;
        config.fleet.pull_threads = 3;

        ConfigLoader::save_to_file(&config, &path).unwrap();
        let loaded = ConfigLoader::load_from_file(&path).unwrap();
        assert_eq!(loaded, config);
    }

    #[test]
    fn test_custom_env_prefix() {
        let dir = tempfile::tempdir().unwrap();
        let config = isolated_loader(dir.path())
            .with_env_prefix("LOADGEN")
            .with_env_vars([("LOADGEN_BROKER__PORT", "6650"), ("SLUICE_BROKER__PORT", "1")])
            .load()
            .unwrap();
        assert_eq!(config.broker.port, 6650);
    }
}
