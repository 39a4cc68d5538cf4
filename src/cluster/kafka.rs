//! rdkafka implementation of the cluster traits

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use rdkafka::admin::{
    AdminClient, AdminOptions, AlterConfig, NewTopic, ResourceSpecifier, TopicReplication,
};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::error::KafkaError;
use rdkafka::metadata::Metadata;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::types::RDKafkaErrorCode;
use rdkafka::{Message, Offset, TopicPartitionList};
use tracing::{debug, info};
use uuid::Uuid;

use super::{
    Broker, BrokerSet, ClusterAdmin, DeliveryFuture, KafkaConnector, RawRecord, RecordConsumer,
    RecordProducer, TopicDescriptor,
};
use crate::config::BOOTSTRAP_SERVERS;
use crate::error::{Result, TopicError};

/// Upper bound on records drained from the local queue per poll.
const MAX_POLL_RECORDS: usize = 500;

/// Where the admin connection gets its endpoints and credentials from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointSource {
    /// Bootstrap servers; rebound to the brokers discovered at readiness.
    Bootstrap,
    /// Managed cloud cluster. Its configured endpoints carry credentials and
    /// are kept as they are.
    Managed,
}

/// Kafka cluster reached through librdkafka.
pub struct KafkaCluster {
    properties: BTreeMap<String, String>,
    source: EndpointSource,
    client_id: String,
    admin_timeout: Duration,
    admin: Arc<AdminClient<DefaultClientContext>>,
}

impl std::fmt::Debug for KafkaCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KafkaCluster")
            .field("bootstrap_servers", &self.properties.get(BOOTSTRAP_SERVERS))
            .field("source", &self.source)
            .finish_non_exhaustive()
    }
}

impl KafkaCluster {
    /// Connect using plain Kafka client properties.
    pub fn new(
        properties: BTreeMap<String, String>,
        client_id: impl Into<String>,
        admin_timeout: Duration,
    ) -> Result<Self> {
        Self::with_source(properties, EndpointSource::Bootstrap, client_id, admin_timeout)
    }

    /// Connect to a managed cluster described by a properties file.
    pub fn managed(
        properties: HashMap<String, String>,
        client_id: impl Into<String>,
        admin_timeout: Duration,
    ) -> Result<Self> {
        Self::with_source(
            properties.into_iter().collect(),
            EndpointSource::Managed,
            client_id,
            admin_timeout,
        )
    }

    fn with_source(
        properties: BTreeMap<String, String>,
        source: EndpointSource,
        client_id: impl Into<String>,
        admin_timeout: Duration,
    ) -> Result<Self> {
        if !properties.contains_key(BOOTSTRAP_SERVERS) {
            return Err(TopicError::InvalidConfig(format!(
                "Cannot configure Kafka without {} property",
                BOOTSTRAP_SERVERS
            )));
        }
        let client_id = client_id.into();
        info!(
            bootstrap_servers = %properties[BOOTSTRAP_SERVERS],
            ?source,
            "Creating Kafka admin client"
        );
        let admin = Arc::new(client_config(&properties, &format!("{}-admin", client_id)).create()?);
        Ok(Self {
            properties,
            source,
            client_id,
            admin_timeout,
            admin,
        })
    }

    pub fn bootstrap_servers(&self) -> &str {
        self.properties
            .get(BOOTSTRAP_SERVERS)
            .map(String::as_str)
            .unwrap_or_default()
    }

    fn admin_options(&self) -> AdminOptions {
        AdminOptions::new()
            .operation_timeout(Some(self.admin_timeout))
            .request_timeout(Some(self.admin_timeout))
    }

    /// Metadata requests block the calling thread until they time out, so
    /// they run on the blocking pool.
    async fn fetch_metadata(&self, timeout: Duration) -> Result<Metadata> {
        let admin = Arc::clone(&self.admin);
        tokio::task::spawn_blocking(move || -> Result<Metadata> {
            Ok(admin.inner().fetch_metadata(None, timeout)?)
        })
        .await?
    }
}

fn client_config(properties: &BTreeMap<String, String>, client_id: &str) -> ClientConfig {
    let mut config = ClientConfig::new();
    for (key, value) in properties {
        config.set(key, value);
    }
    config.set("client.id", client_id);
    config
}

fn admin_error(operation: &'static str, resource: impl Into<String>, code: RDKafkaErrorCode) -> TopicError {
    TopicError::Admin {
        operation,
        resource: resource.into(),
        reason: code.to_string(),
    }
}

#[async_trait]
impl ClusterAdmin for KafkaCluster {
    async fn describe_brokers(&self, timeout: Duration) -> Result<BrokerSet> {
        let metadata = self.fetch_metadata(timeout).await?;
        Ok(BrokerSet::new(metadata.brokers().iter().map(|b| Broker {
            id: b.id(),
            host: b.host().to_string(),
            port: b.port(),
        })))
    }

    fn bind(&mut self, brokers: &BrokerSet) -> Result<()> {
        if self.source == EndpointSource::Managed || brokers.is_empty() {
            return Ok(());
        }
        let servers = brokers.bootstrap_servers();
        if servers == self.bootstrap_servers() {
            return Ok(());
        }
        info!(bootstrap_servers = %servers, "Binding admin client to discovered brokers");
        let mut properties = self.properties.clone();
        properties.insert(BOOTSTRAP_SERVERS.to_string(), servers);
        self.admin = Arc::new(client_config(&properties, &format!("{}-admin", self.client_id)).create()?);
        self.properties = properties;
        Ok(())
    }

    async fn list_topics(&self, timeout: Duration) -> Result<BTreeSet<String>> {
        let metadata = self.fetch_metadata(timeout).await?;
        Ok(metadata
            .topics()
            .iter()
            .filter(|t| t.error().is_none())
            .map(|t| t.name().to_string())
            .collect())
    }

    async fn create_topics(&self, topics: &[TopicDescriptor]) -> Result<()> {
        let new_topics: Vec<NewTopic<'_>> = topics
            .iter()
            .map(|t| {
                t.configuration.iter().fold(
                    NewTopic::new(
                        &t.name,
                        t.partitions,
                        TopicReplication::Fixed(t.replication_factor),
                    ),
                    |topic, (key, value)| topic.set(key, value),
                )
            })
            .collect();

        let results = self
            .admin
            .create_topics(&new_topics, &self.admin_options())
            .await?;

        for result in results {
            match result {
                Ok(name) => debug!(topic = %name, "Created topic"),
                Err((name, RDKafkaErrorCode::TopicAlreadyExists)) => {
                    info!(topic = %name, "Topic was created concurrently, continuing")
                }
                Err((name, code)) => return Err(admin_error("create_topics", name, code)),
            }
        }
        Ok(())
    }

    async fn delete_topics(&self, names: &[String]) -> Result<()> {
        let names: Vec<&str> = names.iter().map(String::as_str).collect();
        let results = self
            .admin
            .delete_topics(&names, &self.admin_options())
            .await?;

        for result in results {
            match result {
                Ok(name) => debug!(topic = %name, "Deleted topic"),
                Err((name, code)) => return Err(admin_error("delete_topics", name, code)),
            }
        }
        Ok(())
    }

    async fn describe_config(&self, topic: &str) -> Result<BTreeMap<String, String>> {
        let resource = ResourceSpecifier::Topic(topic);
        let results = self
            .admin
            .describe_configs([&resource], &self.admin_options())
            .await?;

        let mut settings = BTreeMap::new();
        for result in results {
            let config = result.map_err(|code| admin_error("describe_configs", topic, code))?;
            for entry in config.entries {
                // read-only and sensitive values cannot be written back
                if entry.is_read_only || entry.is_sensitive {
                    continue;
                }
                if let Some(value) = entry.value {
                    settings.insert(entry.name, value);
                }
            }
        }
        Ok(settings)
    }

    /// Uses the non-incremental AlterConfigs request: settings not listed
    /// revert to their defaults. librdkafka's IncrementalAlterConfigs is not
    /// exposed by rdkafka yet; switch to it once it is.
    async fn alter_config(&self, topic: &str, settings: &BTreeMap<String, String>) -> Result<()> {
        let alter = settings.iter().fold(
            AlterConfig::new(ResourceSpecifier::Topic(topic)),
            |alter, (key, value)| alter.set(key, value),
        );
        let results = self
            .admin
            .alter_configs([&alter], &self.admin_options())
            .await?;

        for result in results {
            result.map_err(|(_, code)| admin_error("alter_configs", topic, code))?;
        }
        Ok(())
    }
}

impl KafkaConnector for KafkaCluster {
    fn consumer(&self) -> Result<Box<dyn RecordConsumer>> {
        let consumer: StreamConsumer = client_config(&self.properties, &self.client_id)
            .set("group.id", format!("{}-{}", self.client_id, Uuid::new_v4()))
            .set("auto.offset.reset", "earliest")
            .set("enable.auto.commit", "false")
            .set("enable.partition.eof", "false")
            .create()?;
        Ok(Box::new(KafkaRecordConsumer {
            consumer: Arc::new(consumer),
            metadata_timeout: self.admin_timeout,
        }))
    }

    fn producer(&self) -> Result<Box<dyn RecordProducer>> {
        let producer: FutureProducer = client_config(&self.properties, &self.client_id)
            .set("queue.buffering.max.messages", "1000000")
            .create()?;
        Ok(Box::new(KafkaRecordProducer { producer }))
    }
}

struct KafkaRecordConsumer {
    consumer: Arc<StreamConsumer>,
    metadata_timeout: Duration,
}

#[async_trait]
impl RecordConsumer for KafkaRecordConsumer {
    async fn partition_count(&mut self, topic: &str) -> Result<usize> {
        let consumer = Arc::clone(&self.consumer);
        let topic = topic.to_string();
        let timeout = self.metadata_timeout;
        tokio::task::spawn_blocking(move || -> Result<usize> {
            let metadata = consumer.fetch_metadata(Some(&topic), timeout)?;
            Ok(metadata
                .topics()
                .iter()
                .filter(|t| t.name() == topic && t.error().is_none())
                .map(|t| t.partitions().len())
                .sum())
        })
        .await?
    }

    async fn assign_from_beginning(&mut self, topic: &str, partition: i32) -> Result<()> {
        let mut assignment = TopicPartitionList::new();
        assignment.add_partition_offset(topic, partition, Offset::Beginning)?;
        self.consumer.assign(&assignment)?;
        Ok(())
    }

    async fn poll(&mut self, timeout: Duration) -> Result<Vec<RawRecord>> {
        let mut records = Vec::new();
        let first = match tokio::time::timeout(timeout, self.consumer.recv()).await {
            Err(_elapsed) => return Ok(records),
            Ok(message) => message?,
        };
        records.push(raw_record(&first));
        drop(first);

        // drain whatever is already buffered without waiting again
        while records.len() < MAX_POLL_RECORDS {
            match self.consumer.recv().now_or_never() {
                Some(message) => records.push(raw_record(&message?)),
                None => break,
            }
        }
        Ok(records)
    }
}

fn raw_record<M: Message>(message: &M) -> RawRecord {
    RawRecord {
        offset: message.offset(),
        key: message.key().map(<[u8]>::to_vec).unwrap_or_default(),
        value: message.payload().map(<[u8]>::to_vec),
    }
}

struct KafkaRecordProducer {
    producer: FutureProducer,
}

impl RecordProducer for KafkaRecordProducer {
    fn send(&self, topic: &str, key: &[u8], value: Option<&[u8]>) -> Result<DeliveryFuture> {
        let mut record = FutureRecord::<[u8], [u8]>::to(topic).key(key);
        if let Some(value) = value {
            record = record.payload(value);
        }
        let delivery = self
            .producer
            .send_result(record)
            .map_err(|(err, _record)| TopicError::Kafka(err))?;

        Ok(async move {
            match delivery.await {
                Ok(Ok(_)) => Ok(()),
                Ok(Err((err, _message))) => Err(TopicError::Kafka(err)),
                Err(_canceled) => Err(TopicError::Kafka(KafkaError::Canceled)),
            }
        }
        .boxed())
    }

    fn flush(&self, timeout: Duration) -> Result<()> {
        Ok(self.producer.flush(timeout)?)
    }
}
