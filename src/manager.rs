//! Backup, restore and repair of the `_schemas` topic
//!
//! The schema registry keeps all of its state in a single compacted topic.
//! [`SchemaTopicManager`] reads that topic into a [`TopicSnapshot`], checks
//! that it still holds the first schema, and writes snapshots to and from a
//! [`BackupStore`].
//!
//! No lock is held: only one manager may operate on a given topic and backup
//! file at a time.

use std::time::Duration;

use futures::future;
use tracing::{debug, error, info, warn};

use crate::backup::{BackupStore, StoreOutcome};
use crate::cluster::{ClusterAdmin, KafkaConnector, RecordConsumer, TopicDescriptor};
use crate::error::{Result, TopicError};
use crate::registrar::{KafkaTopics, TopicRegistrar};
use crate::snapshot::TopicSnapshot;

/// Topic backing the schema registry.
pub const TOPIC_NAME: &str = "_schemas";

/// Result of [`SchemaTopicManager::make_backup`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupOutcome {
    Valid(StoreOutcome),
    /// The topic did not contain the first schema and was stored as invalid.
    Invalid(StoreOutcome),
}

/// Result of [`SchemaTopicManager::restore`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreOutcome {
    Restored { records: usize },
    NoBackup,
}

/// Result of [`SchemaTopicManager::ensure`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnsureOutcome {
    /// The live topic is valid and was left untouched.
    AlreadyValid,
    /// The topic was recreated from the stored backup. `replaced` is set when
    /// an invalid live topic was deleted first.
    Restored { records: usize, replaced: bool },
    /// The live topic is absent or invalid and there is no backup to restore.
    NoBackup,
}

pub struct SchemaTopicManager<A, S> {
    topics: KafkaTopics<A>,
    storage: S,
    initialized: bool,
}

impl<A, S> SchemaTopicManager<A, S>
where
    A: ClusterAdmin + KafkaConnector,
    S: BackupStore,
{
    pub fn new(topics: KafkaTopics<A>, storage: S) -> Self {
        Self {
            topics,
            storage,
            initialized: false,
        }
    }

    pub fn storage(&self) -> &S {
        &self.storage
    }

    pub fn topics(&self) -> &KafkaTopics<A> {
        &self.topics
    }

    /// Wait for `brokers` brokers and the topic list to become available.
    pub async fn initialize(&mut self, brokers: usize) -> Result<()> {
        self.topics.initialize(brokers).await?;
        self.initialized = true;
        Ok(())
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(TopicError::NotInitialized)
        }
    }

    /// Read the full topic and its writable settings.
    ///
    /// `timeout` bounds the wait for the first batch of records; later polls
    /// use the configured secondary timeout and reading stops at the first
    /// empty poll.
    pub async fn read_backup(&self, timeout: Duration) -> Result<TopicSnapshot> {
        self.ensure_initialized()?;
        let cluster = self.topics.cluster()?;
        let retry = &self.topics.config().retry;

        let mut consumer = cluster.consumer()?;
        self.ensure_single_partition(consumer.as_mut()).await?;
        consumer.assign_from_beginning(TOPIC_NAME, 0).await?;
        debug!(topic = TOPIC_NAME, "Schema topic reader started");

        let mut snapshot = TopicSnapshot::new();
        let mut poll_timeout = timeout;
        loop {
            let records = consumer.poll(poll_timeout).await?;
            poll_timeout = retry.secondary_poll_timeout();
            if records.is_empty() {
                break;
            }
            for record in &records {
                if let Err(err) = snapshot.add_record(record) {
                    error!(topic = TOPIC_NAME, error = %err, "Failed to deserialize the schema or config key");
                    return Err(err);
                }
            }
        }

        let settings = cluster.describe_config(TOPIC_NAME).await.map_err(|err| {
            error!(topic = TOPIC_NAME, error = %err, "Failed to get topic config");
            err
        })?;
        snapshot.put_settings(settings);

        info!(
            topic = TOPIC_NAME,
            count = snapshot.len(),
            schemas = snapshot.schema_count(),
            "Read schema topic"
        );
        Ok(snapshot)
    }

    /// Partition discovery is retried since a freshly created topic takes a
    /// while to propagate.
    async fn ensure_single_partition(&self, consumer: &mut dyn RecordConsumer) -> Result<()> {
        let retry = &self.topics.config().retry;
        let mut count = 0;
        for attempt in 1..=retry.partition_attempts {
            count = consumer.partition_count(TOPIC_NAME).await?;
            if count > 0 {
                break;
            }
            debug!(topic = TOPIC_NAME, attempt, "No partitions found yet");
            if attempt < retry.partition_attempts {
                tokio::time::sleep(retry.partition_pause()).await;
            }
        }

        match count {
            0 => Err(TopicError::TopicMissing {
                topic: TOPIC_NAME.to_string(),
            }),
            1 => Ok(()),
            count => Err(TopicError::PartitionCount {
                topic: TOPIC_NAME.to_string(),
                count,
            }),
        }
    }

    /// Read the topic and store it, as valid or invalid backup depending on
    /// whether it holds the first schema.
    pub async fn make_backup(&self, timeout: Duration) -> Result<BackupOutcome> {
        let snapshot = self.read_backup(timeout).await?;
        let outcome = if snapshot.starts_at_first_id() {
            self.storage.store(&snapshot).map(BackupOutcome::Valid)
        } else {
            warn!(
                topic = TOPIC_NAME,
                count = snapshot.len(),
                "Schema topic does not contain the first schema, storing it as invalid"
            );
            self.storage.store_invalid(&snapshot).map(BackupOutcome::Invalid)
        };
        outcome.map_err(|err| {
            error!(path = %self.storage.path().display(), error = %err, "Failed to store schema topic data");
            err
        })
    }

    fn load_backup(&self) -> Result<Option<TopicSnapshot>> {
        self.storage.load().map_err(|err| {
            error!(path = %self.storage.path().display(), error = %err, "Backup storage loading failure.");
            err
        })
    }

    /// Create the schema topic from the stored backup. Refuses to touch an
    /// existing topic.
    pub async fn restore(&mut self, replication: i32) -> Result<RestoreOutcome> {
        self.ensure_initialized()?;

        let Some(snapshot) = self.load_backup()? else {
            error!(path = %self.storage.path().display(), "Backup not available");
            return Ok(RestoreOutcome::NoBackup);
        };

        if self.topics.topics()?.contains(TOPIC_NAME) {
            return Err(TopicError::TopicExists {
                topic: TOPIC_NAME.to_string(),
            });
        }

        self.create_topic(replication).await?;
        let records = self.commit(&snapshot).await?;
        info!(topic = TOPIC_NAME, count = records, "Restored schema topic from backup");
        Ok(RestoreOutcome::Restored { records })
    }

    /// Make sure the schema topic exists and holds the first schema,
    /// restoring it from backup otherwise.
    ///
    /// An invalid live topic is stored as invalid backup before it is
    /// deleted.
    pub async fn ensure(&mut self, replication: i32, timeout: Duration) -> Result<EnsureOutcome> {
        self.ensure_initialized()?;

        let exists = self.topics.topics()?.contains(TOPIC_NAME);
        if exists {
            let live = self.read_backup(timeout).await?;
            if live.starts_at_first_id() {
                info!(topic = TOPIC_NAME, count = live.len(), "Existing topic is valid.");
                return Ok(EnsureOutcome::AlreadyValid);
            }
            warn!(topic = TOPIC_NAME, count = live.len(), "Existing topic is invalid");
            self.storage.store_invalid(&live).map_err(|err| {
                error!(path = %self.storage.path().display(), error = %err, "Backup storage failure.");
                err
            })?;
        }

        let Some(snapshot) = self.load_backup()? else {
            error!(path = %self.storage.path().display(), "No valid backup in storage.");
            return Ok(EnsureOutcome::NoBackup);
        };

        if exists {
            info!(topic = TOPIC_NAME, "Removing invalid topic");
            self.topics.delete_topics(&[TOPIC_NAME.to_string()]).await?;
        }

        self.create_topic(replication).await?;
        let records = self.commit(&snapshot).await?;
        info!(topic = TOPIC_NAME, count = records, replaced = exists, "Restored schema topic from backup");
        Ok(EnsureOutcome::Restored {
            records,
            replaced: exists,
        })
    }

    /// The topic always gets a single partition, whatever the per-topic
    /// configuration says.
    async fn create_topic(&mut self, replication: i32) -> Result<()> {
        let descriptor = TopicDescriptor::new(TOPIC_NAME, 1, replication);
        if self.topics.create_descriptors(vec![descriptor]).await? {
            Ok(())
        } else {
            Err(TopicError::TopicCreation {
                topic: TOPIC_NAME.to_string(),
            })
        }
    }

    /// Apply the snapshot settings and replay all records onto the topic.
    ///
    /// Every record is enqueued before any acknowledgement is awaited. A
    /// failure part way leaves the records acknowledged so far on the topic.
    async fn commit(&self, snapshot: &TopicSnapshot) -> Result<usize> {
        let cluster = self.topics.cluster()?;

        let alter = cluster.alter_config(TOPIC_NAME, snapshot.settings());
        let replay = self.replay(cluster, snapshot);
        let (altered, replayed) = future::join(alter, replay).await;

        let records = replayed?;
        altered.map_err(|err| {
            error!(topic = TOPIC_NAME, error = %err, "Failed to apply topic settings");
            err
        })?;
        Ok(records)
    }

    async fn replay(&self, cluster: &A, snapshot: &TopicSnapshot) -> Result<usize> {
        let producer = cluster.producer()?;
        let delivery_error = |index: usize, err: TopicError| {
            error!(topic = TOPIC_NAME, index, error = %err, "Failed to replay record");
            TopicError::Delivery {
                index,
                reason: err.to_string(),
            }
        };

        let mut deliveries = Vec::with_capacity(snapshot.len());
        for (index, record) in snapshot.records().enumerate() {
            let delivery = producer
                .send(TOPIC_NAME, &record.key, record.value.as_deref())
                .map_err(|err| delivery_error(index, err))?;
            deliveries.push(delivery);
        }
        debug!(topic = TOPIC_NAME, count = deliveries.len(), "Records enqueued");

        let count = deliveries.len();
        for (index, delivery) in deliveries.into_iter().enumerate() {
            delivery.await.map_err(|err| delivery_error(index, err))?;
        }
        producer.flush(self.topics.config().retry.admin_timeout())?;
        Ok(count)
    }
}
