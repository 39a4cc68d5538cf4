//! Error types for schema topic management

use thiserror::Error;

/// Result type for schema topic operations
pub type Result<T> = std::result::Result<T, TopicError>;

/// Schema topic errors
#[derive(Error, Debug)]
pub enum TopicError {
    #[error("Manager is not initialized yet")]
    NotInitialized,

    #[error("Brokers not available: {available} out of {required} Kafka brokers reachable")]
    BrokersUnavailable { required: usize, available: usize },

    #[error("Found {available} Kafka brokers but cannot connect to them")]
    BrokersUnreachable { available: usize },

    #[error("Topics not available")]
    TopicsUnavailable,

    #[error("Unexpected number of partitions in the {topic} topic. Expected 1 and instead got {count}")]
    PartitionCount { topic: String, count: usize },

    #[error("Unable to subscribe to the Kafka topic {topic} backing this data store. Topic may not exist.")]
    TopicMissing { topic: String },

    #[error("Topic {topic} already exists, cannot restore it from backup")]
    TopicExists { topic: String },

    #[error("Failed to create topic {topic}")]
    TopicCreation { topic: String },

    #[error("Cannot deserialize message at offset {offset}: {reason}")]
    Decode { offset: i64, reason: String },

    #[error("Admin operation {operation} failed for {resource}: {reason}")]
    Admin {
        operation: &'static str,
        resource: String,
        reason: String,
    },

    #[error("Failed to deliver record {index}: {reason}")]
    Delivery { index: usize, reason: String },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Operation interrupted before it completed")]
    Interrupted,

    #[error("Kafka error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] config_crate::ConfigError),

    #[error("Pattern error: {0}")]
    Pattern(#[from] regex::Error),

    #[error("Background task failed: {0}")]
    Task(#[from] tokio::task::JoinError),

    #[error("Cannot move backup into place: {0}")]
    Persist(#[from] tempfile::PersistError),
}

impl TopicError {
    /// Process exit code for this error.
    ///
    /// `1` means the tool could not proceed but nothing unexpected happened
    /// (cluster not ready, topic absent or already present). Anything else is
    /// an internal failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            TopicError::BrokersUnavailable { .. }
            | TopicError::BrokersUnreachable { .. }
            | TopicError::TopicsUnavailable
            | TopicError::TopicMissing { .. }
            | TopicError::TopicExists { .. }
            | TopicError::InvalidConfig(_) => 1,
            TopicError::Interrupted => 130,
            _ => 2,
        }
    }
}
