//! End-to-end tests of the schema topic manager against an in-memory cluster

use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use futures::FutureExt;
use schema_topic::cluster::{
    Broker, BrokerSet, ClusterAdmin, DeliveryFuture, KafkaConnector, RawRecord, RecordConsumer,
    RecordProducer, TopicDescriptor,
};
use schema_topic::config::TopicConfig;
use schema_topic::{
    BackupOutcome, BackupStore, EnsureOutcome, JsonBackupStore, KafkaTopics, RestoreOutcome,
    SchemaRecordEntry, SchemaTopicManager, StoreOutcome, ToolConfig, TopicError, TopicSnapshot,
    TOPIC_NAME,
};
use tempfile::{tempdir, TempDir};

const TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Default)]
struct FakeTopic {
    partitions: i32,
    records: Vec<RawRecord>,
    config: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct ClusterState {
    topics: BTreeMap<String, FakeTopic>,
    /// Every mutating call, in order.
    mutations: Vec<String>,
    polls: usize,
    /// Fail the acknowledgement of the n-th produced record.
    fail_delivery_at: Option<usize>,
    produced: usize,
}

#[derive(Debug, Clone, Default)]
struct FakeCluster {
    state: Arc<Mutex<ClusterState>>,
}

impl FakeCluster {
    fn new() -> Self {
        let cluster = Self::default();
        cluster.add_topic("__consumer_offsets", 1, Vec::new());
        cluster
    }

    fn add_topic(&self, name: &str, partitions: i32, records: Vec<RawRecord>) {
        self.state.lock().unwrap().topics.insert(
            name.to_string(),
            FakeTopic {
                partitions,
                records,
                config: BTreeMap::from([("cleanup.policy".to_string(), "compact".to_string())]),
            },
        );
    }

    fn mutations(&self) -> Vec<String> {
        self.state.lock().unwrap().mutations.clone()
    }

    fn records(&self, topic: &str) -> Vec<RawRecord> {
        self.state.lock().unwrap().topics[topic].records.clone()
    }
}

#[async_trait]
impl ClusterAdmin for FakeCluster {
    async fn describe_brokers(&self, _timeout: Duration) -> schema_topic::Result<BrokerSet> {
        Ok(BrokerSet::new((0..3).map(|id| Broker {
            id,
            host: format!("kafka-{}", id),
            port: 9092,
        })))
    }

    fn bind(&mut self, _brokers: &BrokerSet) -> schema_topic::Result<()> {
        Ok(())
    }

    async fn list_topics(&self, _timeout: Duration) -> schema_topic::Result<BTreeSet<String>> {
        Ok(self.state.lock().unwrap().topics.keys().cloned().collect())
    }

    async fn create_topics(&self, topics: &[TopicDescriptor]) -> schema_topic::Result<()> {
        let mut state = self.state.lock().unwrap();
        for topic in topics {
            state.mutations.push(format!("create {}", topic.name));
            state.topics.insert(
                topic.name.clone(),
                FakeTopic {
                    partitions: topic.partitions,
                    records: Vec::new(),
                    config: topic.configuration.clone(),
                },
            );
        }
        Ok(())
    }

    async fn delete_topics(&self, names: &[String]) -> schema_topic::Result<()> {
        let mut state = self.state.lock().unwrap();
        for name in names {
            state.mutations.push(format!("delete {}", name));
            state.topics.remove(name);
        }
        Ok(())
    }

    async fn describe_config(&self, topic: &str) -> schema_topic::Result<BTreeMap<String, String>> {
        let state = self.state.lock().unwrap();
        Ok(state.topics.get(topic).map(|t| t.config.clone()).unwrap_or_default())
    }

    async fn alter_config(
        &self,
        topic: &str,
        settings: &BTreeMap<String, String>,
    ) -> schema_topic::Result<()> {
        let mut state = self.state.lock().unwrap();
        state.mutations.push(format!("alter {}", topic));
        if let Some(topic) = state.topics.get_mut(topic) {
            topic.config.extend(settings.clone());
        }
        Ok(())
    }
}

impl KafkaConnector for FakeCluster {
    fn consumer(&self) -> schema_topic::Result<Box<dyn RecordConsumer>> {
        Ok(Box::new(FakeConsumer {
            state: self.state.clone(),
            topic: None,
            position: 0,
        }))
    }

    fn producer(&self) -> schema_topic::Result<Box<dyn RecordProducer>> {
        Ok(Box::new(FakeProducer {
            state: self.state.clone(),
        }))
    }
}

/// Hands out records two at a time.
struct FakeConsumer {
    state: Arc<Mutex<ClusterState>>,
    topic: Option<String>,
    position: usize,
}

#[async_trait]
impl RecordConsumer for FakeConsumer {
    async fn partition_count(&mut self, topic: &str) -> schema_topic::Result<usize> {
        let state = self.state.lock().unwrap();
        Ok(state.topics.get(topic).map_or(0, |t| t.partitions as usize))
    }

    async fn assign_from_beginning(&mut self, topic: &str, _partition: i32) -> schema_topic::Result<()> {
        self.topic = Some(topic.to_string());
        self.position = 0;
        Ok(())
    }

    async fn poll(&mut self, _timeout: Duration) -> schema_topic::Result<Vec<RawRecord>> {
        let mut state = self.state.lock().unwrap();
        state.polls += 1;
        let records = self
            .topic
            .as_ref()
            .and_then(|t| state.topics.get(t))
            .map(|t| t.records.iter().skip(self.position).take(2).cloned().collect::<Vec<_>>())
            .unwrap_or_default();
        self.position += records.len();
        Ok(records)
    }
}

struct FakeProducer {
    state: Arc<Mutex<ClusterState>>,
}

impl RecordProducer for FakeProducer {
    fn send(&self, topic: &str, key: &[u8], value: Option<&[u8]>) -> schema_topic::Result<DeliveryFuture> {
        let mut state = self.state.lock().unwrap();
        let index = state.produced;
        state.produced += 1;
        if state.fail_delivery_at == Some(index) {
            return Ok(async { Err::<(), _>(TopicError::TopicsUnavailable) }.boxed());
        }
        state.mutations.push(format!("produce {}", topic));
        let topic = state
            .topics
            .get_mut(topic)
            .ok_or_else(|| TopicError::TopicMissing { topic: topic.to_string() })?;
        let offset = topic.records.len() as i64;
        topic.records.push(RawRecord {
            offset,
            key: key.to_vec(),
            value: value.map(<[u8]>::to_vec),
        });
        Ok(async { Ok::<(), TopicError>(()) }.boxed())
    }

    fn flush(&self, _timeout: Duration) -> schema_topic::Result<()> {
        Ok(())
    }
}

fn schema_record(offset: i64, subject: &str, id: i32) -> RawRecord {
    RawRecord {
        offset,
        key: format!(r#"{{"keytype":"SCHEMA","subject":"{}","version":1,"magic":1}}"#, subject)
            .into_bytes(),
        value: Some(
            format!(
                r#"{{"subject":"{}","version":1,"id":{},"schema":"\"string\"","deleted":false}}"#,
                subject, id
            )
            .into_bytes(),
        ),
    }
}

fn config_record(offset: i64) -> RawRecord {
    RawRecord {
        offset,
        key: br#"{"keytype":"CONFIG","subject":null,"magic":0}"#.to_vec(),
        value: Some(br#"{"compatibilityLevel":"FULL"}"#.to_vec()),
    }
}

fn records_with_ids(ids: &[i32]) -> Vec<RawRecord> {
    let mut records = vec![config_record(0)];
    records.extend(
        ids.iter()
            .enumerate()
            .map(|(i, id)| schema_record(i as i64 + 1, &format!("subject-{}", id), *id)),
    );
    records
}

fn snapshot_of(records: &[RawRecord]) -> TopicSnapshot {
    TopicSnapshot::from_parts(
        [("retention.ms".to_string(), "-1".to_string())],
        records.iter().map(|r| SchemaRecordEntry::decode(r).unwrap()),
    )
}

fn manager(
    cluster: &FakeCluster,
    dir: &TempDir,
) -> SchemaTopicManager<FakeCluster, JsonBackupStore> {
    let store = JsonBackupStore::new(dir.path().join("schemas.json")).unwrap();
    SchemaTopicManager::new(KafkaTopics::new(cluster.clone(), ToolConfig::default()), store)
}

async fn initialized(
    cluster: &FakeCluster,
    dir: &TempDir,
) -> SchemaTopicManager<FakeCluster, JsonBackupStore> {
    let mut manager = manager(cluster, dir);
    manager.initialize(3).await.unwrap();
    manager
}

fn file_names(dir: &Path) -> Vec<String> {
    let mut names: Vec<String> = std::fs::read_dir(dir)
        .unwrap()
        .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
        .collect();
    names.sort();
    names
}

#[tokio::test(start_paused = true)]
async fn test_operations_require_initialization() {
    let cluster = FakeCluster::new();
    let dir = tempdir().unwrap();
    let mut manager = manager(&cluster, &dir);

    assert_matches!(manager.read_backup(TIMEOUT).await, Err(TopicError::NotInitialized));
    assert_matches!(manager.restore(3).await, Err(TopicError::NotInitialized));
    assert_matches!(manager.ensure(3, TIMEOUT).await, Err(TopicError::NotInitialized));
}

#[tokio::test(start_paused = true)]
async fn test_ensure_without_backup_or_topic_does_nothing() {
    let cluster = FakeCluster::new();
    let dir = tempdir().unwrap();
    let mut manager = initialized(&cluster, &dir).await;

    let outcome = manager.ensure(3, TIMEOUT).await.unwrap();

    assert_eq!(outcome, EnsureOutcome::NoBackup);
    assert!(cluster.mutations().is_empty());
    assert!(file_names(dir.path()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_ensure_keeps_valid_topic() {
    let cluster = FakeCluster::new();
    cluster.add_topic(TOPIC_NAME, 1, records_with_ids(&[1, 2, 3]));
    let dir = tempdir().unwrap();
    let mut manager = initialized(&cluster, &dir).await;

    let outcome = manager.ensure(3, TIMEOUT).await.unwrap();

    assert_eq!(outcome, EnsureOutcome::AlreadyValid);
    assert!(cluster.mutations().is_empty());
    assert!(file_names(dir.path()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_ensure_replaces_invalid_topic_from_backup() {
    let cluster = FakeCluster::new();
    cluster.add_topic(TOPIC_NAME, 1, records_with_ids(&[2, 3]));
    let dir = tempdir().unwrap();
    let mut manager = initialized(&cluster, &dir).await;

    let mut stored_records = records_with_ids(&[1, 2, 3]);
    stored_records.push(RawRecord {
        offset: 4,
        key: br#"{"keytype":"SCHEMA","subject":"subject-3","version":1,"magic":1}"#.to_vec(),
        value: None,
    });
    let stored = snapshot_of(&stored_records);
    manager.storage().store(&stored).unwrap();

    let outcome = manager.ensure(3, TIMEOUT).await.unwrap();

    assert_eq!(
        outcome,
        EnsureOutcome::Restored {
            records: stored.len(),
            replaced: true
        }
    );
    assert_eq!(file_names(dir.path()), vec!["schemas.invalid.json", "schemas.json"]);
    let invalid: TopicSnapshot =
        serde_json::from_slice(&std::fs::read(dir.path().join("schemas.invalid.json")).unwrap())
            .unwrap();
    assert!(!invalid.starts_at_first_id());
    assert_eq!(invalid.len(), 3);

    let mutations = cluster.mutations();
    assert_eq!(mutations[0], "delete _schemas");
    assert_eq!(mutations[1], "create _schemas");
    assert!(mutations.contains(&"alter _schemas".to_string()));
    assert_eq!(
        mutations.iter().filter(|m| *m == "produce _schemas").count(),
        stored.len()
    );

    let live = manager.read_backup(TIMEOUT).await.unwrap();
    assert_eq!(live, stored);
    assert_eq!(live.records().last().unwrap().value, None);
    assert_eq!(live.settings()["retention.ms"], "-1");
}

#[tokio::test(start_paused = true)]
async fn test_ensure_invalid_topic_without_backup_keeps_topic() {
    let cluster = FakeCluster::new();
    cluster.add_topic(TOPIC_NAME, 1, records_with_ids(&[4]));
    let dir = tempdir().unwrap();
    let mut manager = initialized(&cluster, &dir).await;

    let outcome = manager.ensure(3, TIMEOUT).await.unwrap();

    assert_eq!(outcome, EnsureOutcome::NoBackup);
    assert!(cluster.mutations().is_empty());
    assert_eq!(file_names(dir.path()), vec!["schemas.invalid.json"]);
}

#[tokio::test(start_paused = true)]
async fn test_ensure_creates_missing_topic_from_backup() {
    let cluster = FakeCluster::new();
    let dir = tempdir().unwrap();
    let mut manager = initialized(&cluster, &dir).await;
    let stored = snapshot_of(&records_with_ids(&[1, 2]));
    manager.storage().store(&stored).unwrap();

    let outcome = manager.ensure(3, TIMEOUT).await.unwrap();

    assert_eq!(
        outcome,
        EnsureOutcome::Restored {
            records: 3,
            replaced: false
        }
    );
    assert_eq!(cluster.mutations()[0], "create _schemas");
    assert_eq!(cluster.records(TOPIC_NAME).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_two_partitions_are_fatal() {
    let cluster = FakeCluster::new();
    cluster.add_topic(TOPIC_NAME, 2, records_with_ids(&[1]));
    let dir = tempdir().unwrap();
    let manager = initialized(&cluster, &dir).await;

    assert_matches!(
        manager.make_backup(TIMEOUT).await,
        Err(TopicError::PartitionCount { count: 2, .. })
    );
    assert_eq!(cluster.state.lock().unwrap().polls, 0);
    assert!(file_names(dir.path()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_backup_of_missing_topic_fails() {
    let cluster = FakeCluster::new();
    let dir = tempdir().unwrap();
    let manager = initialized(&cluster, &dir).await;

    assert_matches!(
        manager.read_backup(TIMEOUT).await,
        Err(TopicError::TopicMissing { .. })
    );
}

#[tokio::test(start_paused = true)]
async fn test_backup_is_idempotent() {
    let cluster = FakeCluster::new();
    cluster.add_topic(TOPIC_NAME, 1, records_with_ids(&[1, 2, 3, 4, 5]));
    let dir = tempdir().unwrap();
    let manager = initialized(&cluster, &dir).await;

    let first = manager.make_backup(TIMEOUT).await.unwrap();
    assert_matches!(first, BackupOutcome::Valid(StoreOutcome::Created { .. }));
    let second = manager.make_backup(TIMEOUT).await.unwrap();
    assert_matches!(second, BackupOutcome::Valid(StoreOutcome::Unchanged { .. }));

    assert_eq!(file_names(dir.path()), vec!["schemas.json"]);
    let stored = manager.storage().load().unwrap().unwrap();
    assert_eq!(stored.len(), 6);
    assert_eq!(stored.schema_count(), 5);
}

#[tokio::test(start_paused = true)]
async fn test_backup_of_invalid_topic_is_stored_separately() {
    let cluster = FakeCluster::new();
    cluster.add_topic(TOPIC_NAME, 1, records_with_ids(&[7]));
    let dir = tempdir().unwrap();
    let manager = initialized(&cluster, &dir).await;

    let outcome = manager.make_backup(TIMEOUT).await.unwrap();

    assert_matches!(outcome, BackupOutcome::Invalid(_));
    assert_eq!(file_names(dir.path()), vec!["schemas.invalid.json"]);
    assert!(manager.storage().load().unwrap().is_none());
}

#[tokio::test(start_paused = true)]
async fn test_backup_fails_on_undecodable_record() {
    let cluster = FakeCluster::new();
    let mut records = records_with_ids(&[1]);
    records.push(RawRecord {
        offset: 2,
        key: b"garbage".to_vec(),
        value: None,
    });
    cluster.add_topic(TOPIC_NAME, 1, records);
    let dir = tempdir().unwrap();
    let manager = initialized(&cluster, &dir).await;

    assert_matches!(
        manager.make_backup(TIMEOUT).await,
        Err(TopicError::Decode { offset: 2, .. })
    );
    assert!(file_names(dir.path()).is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_restore_refuses_existing_topic() {
    let cluster = FakeCluster::new();
    cluster.add_topic(TOPIC_NAME, 1, records_with_ids(&[1]));
    let dir = tempdir().unwrap();
    let mut manager = initialized(&cluster, &dir).await;
    manager
        .storage()
        .store(&snapshot_of(&records_with_ids(&[1, 2])))
        .unwrap();

    assert_matches!(manager.restore(3).await, Err(TopicError::TopicExists { .. }));
    assert!(cluster.mutations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_restore_without_backup() {
    let cluster = FakeCluster::new();
    let dir = tempdir().unwrap();
    let mut manager = initialized(&cluster, &dir).await;

    assert_eq!(manager.restore(3).await.unwrap(), RestoreOutcome::NoBackup);
    assert!(cluster.mutations().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_restore_replays_in_order() {
    let cluster = FakeCluster::new();
    let dir = tempdir().unwrap();
    let mut manager = initialized(&cluster, &dir).await;
    let stored = snapshot_of(&records_with_ids(&[1, 2, 3]));
    manager.storage().store(&stored).unwrap();

    assert_eq!(
        manager.restore(2).await.unwrap(),
        RestoreOutcome::Restored { records: 4 }
    );

    let keys: Vec<Vec<u8>> = cluster.records(TOPIC_NAME).into_iter().map(|r| r.key).collect();
    let expected: Vec<Vec<u8>> = stored.records().map(|r| r.key.clone()).collect();
    assert_eq!(keys, expected);
    let state = cluster.state.lock().unwrap();
    assert_eq!(state.topics[TOPIC_NAME].partitions, 1);
    assert_eq!(state.topics[TOPIC_NAME].config["retention.ms"], "-1");
}

#[tokio::test(start_paused = true)]
async fn test_restore_reports_failed_delivery() {
    let cluster = FakeCluster::new();
    cluster.state.lock().unwrap().fail_delivery_at = Some(2);
    let dir = tempdir().unwrap();
    let mut manager = initialized(&cluster, &dir).await;
    manager
        .storage()
        .store(&snapshot_of(&records_with_ids(&[1, 2, 3])))
        .unwrap();

    assert_matches!(
        manager.restore(3).await,
        Err(TopicError::Delivery { index: 2, .. })
    );
    // records other than the failed one were still sent
    assert_eq!(cluster.records(TOPIC_NAME).len(), 3);
}

#[tokio::test(start_paused = true)]
async fn test_restore_creates_single_partition_despite_overrides() {
    let cluster = FakeCluster::new();
    let dir = tempdir().unwrap();
    let mut config = ToolConfig::default();
    config.topics.insert(
        TOPIC_NAME.to_string(),
        TopicConfig {
            partitions: Some(3),
            replication_factor: Some(1),
            ..TopicConfig::default()
        },
    );
    let store = JsonBackupStore::new(dir.path().join("schemas.json")).unwrap();
    let mut manager =
        SchemaTopicManager::new(KafkaTopics::new(cluster.clone(), config), store);
    manager.initialize(3).await.unwrap();
    manager
        .storage()
        .store(&snapshot_of(&records_with_ids(&[1])))
        .unwrap();

    assert_eq!(
        manager.restore(2).await.unwrap(),
        RestoreOutcome::Restored { records: 2 }
    );
    assert_eq!(cluster.state.lock().unwrap().topics[TOPIC_NAME].partitions, 1);

    let live = manager.read_backup(TIMEOUT).await.unwrap();
    assert!(live.starts_at_first_id());
}
