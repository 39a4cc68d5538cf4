//! Configuration management for schema topic tooling
//!
//! Supports loading configuration from:
//! - Default values
//! - Config file (schema-topic.toml)
//! - Environment variables (SCHEMA_TOPIC__*)
//!
//! ## Example config file (schema-topic.toml):
//! ```toml
//! [kafka]
//! "bootstrap.servers" = "kafka-1:9092,kafka-2:9092"
//! "security.protocol" = "PLAINTEXT"
//!
//! [topics.android_phone_acceleration]
//! partitions = 6
//! replication_factor = 3
//! properties = { "retention.ms" = "604800000" }
//!
//! [topics.legacy_topic]
//! enabled = false
//!
//! [retry.brokers]
//! initial_secs = 2
//! max_secs = 32
//! attempts = 20
//!
//! [backup]
//! path = "/var/lib/schemas/_schemas.json"
//! ```

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::time::Duration;

use config_crate::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::error::{Result, TopicError};
use crate::retry::RetryPolicy;

/// Kafka client property holding the bootstrap endpoint list.
pub const BOOTSTRAP_SERVERS: &str = "bootstrap.servers";

/// Kafka client property holding SASL JAAS credentials.
pub const SASL_JAAS_CONFIG: &str = "sasl.jaas.config";

/// Main configuration for the schema topic tool
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ToolConfig {
    /// Raw Kafka client properties
    #[serde(default)]
    pub kafka: BTreeMap<String, String>,

    /// Per-topic creation overrides
    #[serde(default)]
    pub topics: BTreeMap<String, TopicConfig>,

    /// Polling and timeout tuning
    #[serde(default)]
    pub retry: RetryConfig,

    /// Backup settings
    #[serde(default)]
    pub backup: BackupConfig,
}

/// Creation overrides for a single topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopicConfig {
    /// Whether the topic should be created at all
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Partition count, replacing the command-line default
    #[serde(default)]
    pub partitions: Option<i32>,

    /// Replication factor, replacing the command-line default
    #[serde(default)]
    pub replication_factor: Option<i32>,

    /// Topic-level settings applied at creation
    #[serde(default)]
    pub properties: BTreeMap<String, String>,
}

/// Polling and timeout tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Schedule while waiting for brokers
    #[serde(default = "RetryPolicy::brokers")]
    pub brokers: RetryPolicy,

    /// Schedule while listing topics
    #[serde(default = "RetryPolicy::topics")]
    pub topics: RetryPolicy,

    /// Pause after a successful topic listing, absorbing metadata propagation lag
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,

    /// Number of partition lookups before the schema topic is declared missing
    #[serde(default = "default_partition_attempts")]
    pub partition_attempts: u32,

    /// Pause between partition lookups
    #[serde(default = "default_partition_pause_ms")]
    pub partition_pause_ms: u64,

    /// Poll timeout once the first batch of records has arrived
    #[serde(default = "default_secondary_poll_secs")]
    pub secondary_poll_secs: u64,

    /// Operation and request timeout for admin calls
    #[serde(default = "default_admin_timeout_secs")]
    pub admin_timeout_secs: u64,
}

/// Backup settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Default backup file, used when no file is given on the command line
    #[serde(default)]
    pub path: Option<PathBuf>,

    /// Client id for backup consumers and producers
    #[serde(default = "default_client_id")]
    pub client_id: String,
}

// Default value functions
fn default_true() -> bool {
    true
}

fn default_settle_secs() -> u64 {
    5
}

fn default_partition_attempts() -> u32 {
    10
}

fn default_partition_pause_ms() -> u64 {
    1000
}

fn default_secondary_poll_secs() -> u64 {
    10
}

fn default_admin_timeout_secs() -> u64 {
    30
}

fn default_client_id() -> String {
    "schema-backup".to_string()
}

impl Default for TopicConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            partitions: None,
            replication_factor: None,
            properties: BTreeMap::new(),
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            brokers: RetryPolicy::brokers(),
            topics: RetryPolicy::topics(),
            settle_secs: default_settle_secs(),
            partition_attempts: default_partition_attempts(),
            partition_pause_ms: default_partition_pause_ms(),
            secondary_poll_secs: default_secondary_poll_secs(),
            admin_timeout_secs: default_admin_timeout_secs(),
        }
    }
}

impl RetryConfig {
    pub fn settle_delay(&self) -> Duration {
        Duration::from_secs(self.settle_secs)
    }

    pub fn partition_pause(&self) -> Duration {
        Duration::from_millis(self.partition_pause_ms)
    }

    pub fn secondary_poll_timeout(&self) -> Duration {
        Duration::from_secs(self.secondary_poll_secs)
    }

    pub fn admin_timeout(&self) -> Duration {
        Duration::from_secs(self.admin_timeout_secs)
    }
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            path: None,
            client_id: default_client_id(),
        }
    }
}

impl ToolConfig {
    /// Load configuration from a specific file
    pub fn load_from(config_path: Option<&Path>) -> Result<Self> {
        let mut builder = Config::builder();

        let config_locations = [
            "schema-topic.toml",
            ".schema-topic.toml",
            "config/schema-topic.toml",
        ];

        for location in config_locations {
            builder = builder.add_source(File::with_name(location).required(false));
        }

        if let Some(config_dir) = directories::ProjectDirs::from("dev", "schemas", "schema-topic") {
            let xdg_config = config_dir.config_dir().join("schema-topic.toml");
            if xdg_config.exists() {
                builder = builder.add_source(File::from(xdg_config).required(false));
            }
        }

        if let Some(path) = config_path {
            builder = builder.add_source(File::from(path.to_path_buf()).required(true));
        }

        // Environment variables (SCHEMA_TOPIC__*)
        builder = builder.add_source(
            Environment::with_prefix("SCHEMA_TOPIC")
                .separator("__")
                .try_parsing(true),
        );

        let config = builder.build()?;
        Ok(config.try_deserialize()?)
    }

    /// Override the bootstrap servers.
    ///
    /// Without an override the configuration must already name its bootstrap
    /// servers. With one, SASL credentials are taken from
    /// `KAFKA_SASL_JAAS_CONFIG` when that variable is set.
    pub fn with_bootstrap_servers(self, bootstrap_servers: Option<&str>) -> Result<Self> {
        self.with_bootstrap_servers_and_jaas(
            bootstrap_servers,
            std::env::var("KAFKA_SASL_JAAS_CONFIG").ok(),
        )
    }

    fn with_bootstrap_servers_and_jaas(
        mut self,
        bootstrap_servers: Option<&str>,
        jaas: Option<String>,
    ) -> Result<Self> {
        match bootstrap_servers.filter(|s| !s.is_empty()) {
            None => {
                if !self.kafka.contains_key(BOOTSTRAP_SERVERS) {
                    return Err(TopicError::InvalidConfig(format!(
                        "Cannot configure Kafka without {} property",
                        BOOTSTRAP_SERVERS
                    )));
                }
            }
            Some(servers) => {
                self.kafka
                    .insert(BOOTSTRAP_SERVERS.to_string(), servers.to_string());
                if let Some(jaas) = jaas {
                    self.kafka.insert(SASL_JAAS_CONFIG.to_string(), jaas);
                }
            }
        }
        Ok(self)
    }

    /// Topic overrides for `name`, falling back to defaults
    pub fn topic(&self, name: &str) -> TopicConfig {
        self.topics.get(name).cloned().unwrap_or_default()
    }

    /// Whether `name` is enabled for creation
    pub fn is_enabled(&self, name: &str) -> bool {
        self.topics.get(name).map_or(true, |t| t.enabled)
    }
}

/// Load a Java-style properties file (`key=value` or `key: value` lines,
/// `#`/`!` comments) as used by managed cloud Kafka offerings.
pub fn load_properties(path: &Path) -> Result<HashMap<String, String>> {
    let content = std::fs::read_to_string(path)?;
    Ok(parse_properties(&content))
}

fn parse_properties(content: &str) -> HashMap<String, String> {
    let mut properties = HashMap::new();
    let mut pending = String::new();

    for line in content.lines() {
        let line = line.trim_start();
        if pending.is_empty() && (line.is_empty() || line.starts_with('#') || line.starts_with('!')) {
            continue;
        }
        // trailing backslash continues the value on the next line
        if let Some(stripped) = line.strip_suffix('\\') {
            pending.push_str(stripped);
            continue;
        }
        pending.push_str(line);

        let entry = std::mem::take(&mut pending);
        let split = entry.find(['=', ':']).unwrap_or(entry.len());
        let key = entry[..split].trim();
        let value = entry.get(split + 1..).unwrap_or("").trim();
        if !key.is_empty() {
            properties.insert(key.to_string(), value.to_string());
        }
    }

    properties
}
