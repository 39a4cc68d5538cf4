//! Schema Topic
//!
//! Backup, restore and repair of the compacted `_schemas` topic that a schema
//! registry uses as its only store, plus idempotent creation of the topics a
//! deployment needs.
//!
//! ## Features
//!
//! - **Readiness**: waits with capped exponential backoff until enough
//!   brokers and a topic listing are available
//! - **Idempotent registration**: topics are diffed against the last listing
//!   and only missing ones are created
//! - **Snapshots**: the topic is replayed with compaction semantics and is
//!   valid only when it still holds schema ID 1
//! - **Durable backups**: JSON files replaced atomically, with every distinct
//!   previous version kept next to them
//!
//! ## Architecture
//!
//! ```text
//! schema-topic ensure
//!   └── SchemaTopicManager
//!         ├── KafkaTopics ── ClusterReadinessGate
//!         │     └── ClusterAdmin + KafkaConnector (rdkafka)
//!         └── BackupStore (JSON files)
//!               ├── schemas.json
//!               ├── schemas.2024-05-01T10:00:00Z.json
//!               └── schemas.invalid.json
//! ```

pub mod backup;
pub mod catalogue;
pub mod checksum;
pub mod cluster;
pub mod config;
pub mod error;
pub mod manager;
pub mod readiness;
pub mod registrar;
pub mod retry;
pub mod snapshot;

pub use backup::{BackupStore, JsonBackupStore, StoreOutcome};
pub use catalogue::{SourceCatalogue, StaticCatalogue};
pub use checksum::Checksum;
pub use cluster::kafka::KafkaCluster;
pub use cluster::{BrokerSet, ClusterAdmin, KafkaConnector, RawRecord, TopicDescriptor};
pub use config::ToolConfig;
pub use error::{Result, TopicError};
pub use manager::{BackupOutcome, EnsureOutcome, RestoreOutcome, SchemaTopicManager, TOPIC_NAME};
pub use readiness::ClusterReadinessGate;
pub use registrar::{KafkaTopics, TopicRegistrar};
pub use retry::RetryPolicy;
pub use snapshot::{KeyType, SchemaRecordEntry, TopicSnapshot};
