//! Transport seam between topic management and the Kafka cluster
//!
//! Readiness, registration and the schema topic manager only talk to the
//! cluster through these traits. [`kafka`] provides the rdkafka-backed
//! implementation.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::error::Result;

pub mod kafka;

/// A reachable broker endpoint.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Broker {
    pub id: i32,
    pub host: String,
    pub port: i32,
}

impl fmt::Display for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Brokers observed during a single readiness poll. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BrokerSet {
    brokers: BTreeSet<Broker>,
}

impl BrokerSet {
    pub fn new(brokers: impl IntoIterator<Item = Broker>) -> Self {
        Self {
            brokers: brokers.into_iter().collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.brokers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.brokers.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Broker> {
        self.brokers.iter()
    }

    /// Comma-separated `host:port` list, usable as bootstrap servers.
    pub fn bootstrap_servers(&self) -> String {
        self.brokers
            .iter()
            .map(ToString::to_string)
            .collect::<Vec<_>>()
            .join(",")
    }
}

/// Everything needed to create one topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopicDescriptor {
    pub name: String,
    pub partitions: i32,
    pub replication_factor: i32,
    pub configuration: BTreeMap<String, String>,
}

impl TopicDescriptor {
    pub fn new(name: impl Into<String>, partitions: i32, replication_factor: i32) -> Self {
        Self {
            name: name.into(),
            partitions,
            replication_factor,
            configuration: BTreeMap::new(),
        }
    }

    pub fn with_configuration(mut self, configuration: BTreeMap<String, String>) -> Self {
        self.configuration = configuration;
        self
    }
}

/// A raw record consumed from, or produced to, a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub offset: i64,
    pub key: Vec<u8>,
    /// `None` for tombstones
    pub value: Option<Vec<u8>>,
}

/// Resolves once the broker acknowledged a produced record.
pub type DeliveryFuture = BoxFuture<'static, Result<()>>;

/// Administrative operations against the cluster.
#[async_trait]
pub trait ClusterAdmin: Send + Sync {
    /// List the brokers currently in the cluster.
    async fn describe_brokers(&self, timeout: Duration) -> Result<BrokerSet>;

    /// Re-target the admin connection at discovered brokers.
    fn bind(&mut self, brokers: &BrokerSet) -> Result<()>;

    /// List all topic names, internal topics included.
    async fn list_topics(&self, timeout: Duration) -> Result<BTreeSet<String>>;

    /// Create all given topics in one batch.
    async fn create_topics(&self, topics: &[TopicDescriptor]) -> Result<()>;

    /// Delete all given topics in one batch.
    async fn delete_topics(&self, names: &[String]) -> Result<()>;

    /// Read the current configuration of a topic.
    async fn describe_config(&self, topic: &str) -> Result<BTreeMap<String, String>>;

    /// Apply every given setting to a topic.
    async fn alter_config(&self, topic: &str, settings: &BTreeMap<String, String>) -> Result<()>;
}

/// Reads a single topic partition from the start.
#[async_trait]
pub trait RecordConsumer: Send {
    /// Number of partitions of `topic`, or `0` when the topic is not visible.
    async fn partition_count(&mut self, topic: &str) -> Result<usize>;

    /// Assign `topic`/`partition` and rewind to the earliest offset.
    async fn assign_from_beginning(&mut self, topic: &str, partition: i32) -> Result<()>;

    /// Wait up to `timeout` for records. An empty batch means the tail was
    /// reached.
    async fn poll(&mut self, timeout: Duration) -> Result<Vec<RawRecord>>;
}

/// Produces raw records.
pub trait RecordProducer: Send + Sync {
    /// Enqueue a record. The record is in flight once this returns; the
    /// returned future resolves on acknowledgement.
    fn send(&self, topic: &str, key: &[u8], value: Option<&[u8]>) -> Result<DeliveryFuture>;

    /// Wait until all enqueued records were handed to the brokers.
    fn flush(&self, timeout: Duration) -> Result<()>;
}

/// Builds fresh consumers and producers for one operation.
pub trait KafkaConnector: Send + Sync {
    /// A consumer in its own, randomly named group, with auto-commit disabled.
    fn consumer(&self) -> Result<Box<dyn RecordConsumer>>;

    fn producer(&self) -> Result<Box<dyn RecordProducer>>;
}
