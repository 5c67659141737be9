use basalt_bus::{BusOptions, Lifetime};
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Settings shared by the `beacon` publisher and the `tap` subscriber.
#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BasaltConfig {
    #[serde(default = "defaults::log_level")]
    pub log_level: String,
    #[serde(default = "defaults::topic")]
    pub topic: String,
    #[serde(default = "defaults::publish_interval_ms")]
    pub publish_interval_ms: u64,
    /// Messages `beacon` publishes before exiting; unbounded when absent.
    #[serde(default)]
    pub count: Option<u64>,
    /// Whether `tap` starts from the oldest message still held.
    #[serde(default)]
    pub replay: bool,
    #[serde(default)]
    pub bus: BusConfig,
}

#[derive(Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct BusConfig {
    #[serde(default = "defaults::namespace")]
    pub namespace: String,
    #[serde(default = "defaults::capacity")]
    pub capacity: usize,
    #[serde(default)]
    pub lifetime: LifetimeConfig,
    #[serde(default)]
    pub auto_create_on_subscribe: bool,
    #[serde(default = "defaults::exclusive_publisher")]
    pub exclusive_publisher: bool,
    #[serde(default = "defaults::init_timeout_ms")]
    pub init_timeout_ms: u64,
}

#[derive(Deserialize, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LifetimeConfig {
    #[default]
    RemoveOnLastDetach,
    Persistent,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read '{path}'")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config")]
    Parse(#[from] toml::de::Error),
}

mod defaults {
    pub fn log_level() -> String {
        "info".into()
    }

    pub fn topic() -> String {
        "events".into()
    }

    pub fn publish_interval_ms() -> u64 {
        100
    }

    pub fn namespace() -> String {
        basalt_bus::DEFAULT_NAMESPACE.into()
    }

    pub fn capacity() -> usize {
        basalt_bus::DEFAULT_CAPACITY
    }

    pub fn exclusive_publisher() -> bool {
        true
    }

    pub fn init_timeout_ms() -> u64 {
        basalt_bus::DEFAULT_INIT_TIMEOUT.as_millis() as u64
    }
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            namespace: defaults::namespace(),
            capacity: defaults::capacity(),
            lifetime: LifetimeConfig::default(),
            auto_create_on_subscribe: false,
            exclusive_publisher: defaults::exclusive_publisher(),
            init_timeout_ms: defaults::init_timeout_ms(),
        }
    }
}

impl Default for BasaltConfig {
    fn default() -> Self {
        Self {
            log_level: defaults::log_level(),
            topic: defaults::topic(),
            publish_interval_ms: defaults::publish_interval_ms(),
            count: None,
            replay: false,
            bus: BusConfig::default(),
        }
    }
}

impl From<LifetimeConfig> for Lifetime {
    fn from(value: LifetimeConfig) -> Self {
        match value {
            LifetimeConfig::RemoveOnLastDetach => Lifetime::RemoveOnLastDetach,
            LifetimeConfig::Persistent => Lifetime::Persistent,
        }
    }
}

impl BusConfig {
    pub fn to_options(&self) -> BusOptions {
        BusOptions::default()
            .namespace(self.namespace.clone())
            .capacity(self.capacity)
            .lifetime(self.lifetime.into())
            .auto_create_on_subscribe(self.auto_create_on_subscribe)
            .exclusive_publisher(self.exclusive_publisher)
            .init_timeout(Duration::from_millis(self.init_timeout_ms))
    }
}

impl BasaltConfig {
    pub fn load(path: impl AsRef<Path> + ToString) -> Result<Self, ConfigError> {
        let toml_to_str = std::fs::read_to_string(&path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        let config: BasaltConfig = toml::from_str(&toml_to_str)?;
        Ok(config)
    }

    /// Loads `path` when given, otherwise returns the defaults.
    pub fn load_or_default(path: Option<String>) -> Result<Self, ConfigError> {
        match path {
            Some(path) => Self::load(path),
            None => Ok(Self::default()),
        }
    }

    #[inline]
    pub fn bus_options(&self) -> BusOptions {
        self.bus.to_options()
    }

    #[inline]
    pub fn publish_interval(&self) -> Duration {
        Duration::from_millis(self.publish_interval_ms)
    }
}
