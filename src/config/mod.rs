//! Messaging configuration.
//!
//! Loaded from YAML files and environment variables. Broker properties for
//! each consumer and sender are generated from these settings; see
//! [`MessagingConfig::consumer_properties`] and
//! [`MessagingConfig::sender_properties`].

mod properties;

use std::collections::HashMap;
use std::time::Duration;

use serde::Deserialize;

use crate::error::Result;
use crate::key::KeyPolicy;
use crate::receiver::ConsumerSettings;

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "messaging.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "PROTO_MESSAGING_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "PROTO_MESSAGING";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "PROTO_MESSAGING_LOG";

/// Default broker address.
pub const DEFAULT_BOOTSTRAP_SERVERS: &str = "localhost:12100";

/// Messaging layer settings.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct MessagingConfig {
    /// Broker bootstrap address list.
    pub bootstrap_servers: String,
    /// Upper bound of one poll in the consumer read loop.
    pub poll_timeout_ms: u64,
    /// Delivery timeout of a single send.
    pub send_timeout_ms: u64,
    /// Prefix of generated sender client ids.
    pub client_id_prefix: String,
    /// Treatment of non-conforming record keys.
    pub key_policy: KeyPolicy,
    /// Consumer property overrides, applied over generated defaults.
    pub consumer: HashMap<String, String>,
    /// Sender property overrides, applied over generated defaults.
    pub sender: HashMap<String, String>,
}

impl Default for MessagingConfig {
    fn default() -> Self {
        Self {
            bootstrap_servers: DEFAULT_BOOTSTRAP_SERVERS.to_string(),
            poll_timeout_ms: 1000,
            send_timeout_ms: 5000,
            client_id_prefix: "proto_messaging".to_string(),
            key_policy: KeyPolicy::Lenient,
            consumer: HashMap::new(),
            sender: HashMap::new(),
        }
    }
}

impl MessagingConfig {
    /// Load configuration from file and environment.
    ///
    /// Sources, later ones overriding earlier ones:
    /// `messaging.yaml` in the working directory (optional), `path` if given,
    /// the file named by `PROTO_MESSAGING_CONFIG` if set, then
    /// `PROTO_MESSAGING__*` environment variables.
    pub fn load(path: Option<&str>) -> Result<Self> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }

    /// Create config for testing.
    pub fn for_test() -> Self {
        Self {
            poll_timeout_ms: 50,
            ..Self::default()
        }
    }

    pub fn poll_timeout(&self) -> Duration {
        Duration::from_millis(self.poll_timeout_ms)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_millis(self.send_timeout_ms)
    }

    pub(crate) fn consumer_settings(&self) -> ConsumerSettings {
        ConsumerSettings {
            poll_timeout: self.poll_timeout(),
            key_policy: self.key_policy,
        }
    }
}
