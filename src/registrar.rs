//! Topic registration
//!
//! [`KafkaTopics`] waits for the cluster to come up, keeps a refreshed list of
//! topic names and creates missing topics idempotently: requested names are
//! diffed against the last refreshed list, so repeated or racing runs never
//! try to create a topic twice.

use std::collections::BTreeSet;

use async_trait::async_trait;
use regex::Regex;
use tracing::{error, info};

use crate::catalogue::SourceCatalogue;
use crate::cluster::{ClusterAdmin, TopicDescriptor};
use crate::config::ToolConfig;
use crate::error::{Result, TopicError};
use crate::readiness::ClusterReadinessGate;

/// Registers topics on a Kafka cluster.
#[async_trait]
pub trait TopicRegistrar: Send + Sync {
    /// Wait for `brokers` brokers and a first topic listing.
    ///
    /// Returns `false` when either did not become available in time.
    async fn wait_until_ready(&mut self, brokers: usize) -> bool;

    /// Fails unless [`TopicRegistrar::wait_until_ready`] found the brokers.
    fn ensure_initialized(&self) -> Result<()>;

    /// Update the list of topic names from the cluster.
    ///
    /// Returns `false` if the list stayed empty or unreachable.
    async fn refresh_topics(&mut self) -> Result<bool>;

    /// Topic names as of the last successful refresh.
    fn topics(&self) -> Result<&BTreeSet<String>>;

    /// Refresh the topic list and create the given topics unless they
    /// already exist.
    ///
    /// Returns `false` if the refresh or the creation call failed.
    async fn create_topics(
        &mut self,
        names: &BTreeSet<String>,
        partitions: i32,
        replication: i32,
    ) -> Result<bool>;

    /// Delete the given topics and refresh the topic list.
    async fn delete_topics(&mut self, names: &[String]) -> Result<()>;

    /// Wait for the cluster, turning an unready cluster into an error.
    async fn initialize(&mut self, brokers: usize) -> Result<()> {
        if self.wait_until_ready(brokers).await {
            Ok(())
        } else if self.ensure_initialized().is_err() {
            let available = self.available_brokers();
            if available >= brokers {
                Err(TopicError::BrokersUnreachable { available })
            } else {
                Err(TopicError::BrokersUnavailable {
                    required: brokers,
                    available,
                })
            }
        } else {
            Err(TopicError::TopicsUnavailable)
        }
    }

    /// Brokers seen by the last readiness check.
    fn available_brokers(&self) -> usize;
}

/// Build a pattern from an exact topic name or a regular expression.
///
/// The exact name wins when both are given; `None` when neither is.
pub fn match_topic(exact: Option<&str>, regex: Option<&str>) -> Result<Option<Regex>> {
    match (exact, regex) {
        (Some(exact), _) => Ok(Some(Regex::new(&format!("^{}$", regex::escape(exact)))?)),
        (None, Some(regex)) => Ok(Some(Regex::new(regex)?)),
        (None, None) => Ok(None),
    }
}

/// Topic registrar on a cluster reached through `A`.
pub struct KafkaTopics<A> {
    cluster: A,
    config: ToolConfig,
    gate: ClusterReadinessGate,
    initialized: bool,
    available_brokers: usize,
    topics: Option<BTreeSet<String>>,
}

impl<A: ClusterAdmin> KafkaTopics<A> {
    pub fn new(cluster: A, config: ToolConfig) -> Self {
        let gate = ClusterReadinessGate::new(config.retry.brokers);
        Self {
            cluster,
            config,
            gate,
            initialized: false,
            available_brokers: 0,
            topics: None,
        }
    }

    /// The cluster connection, once initialized.
    pub fn cluster(&self) -> Result<&A> {
        self.ensure_initialized()?;
        Ok(&self.cluster)
    }

    pub fn config(&self) -> &ToolConfig {
        &self.config
    }

    /// Catalogue topics plus configured topics, minus disabled ones.
    fn topic_names(&self, catalogue: &dyn SourceCatalogue) -> BTreeSet<String> {
        catalogue
            .topic_names()
            .chain(self.config.topics.keys().cloned())
            .filter(|t| self.config.is_enabled(t))
            .collect()
    }

    /// Create catalogue topics, optionally narrowed to an exact name or a
    /// regular expression.
    ///
    /// Returns `false` when nothing matched or creation failed.
    pub async fn create_topics_matching(
        &mut self,
        catalogue: &dyn SourceCatalogue,
        partitions: i32,
        replication: i32,
        topic: Option<&str>,
        pattern: Option<&str>,
    ) -> Result<bool> {
        self.ensure_initialized()?;
        let names = self.topic_names(catalogue);

        let names = match match_topic(topic, pattern)? {
            None => names,
            Some(pattern) => {
                let matched: BTreeSet<String> =
                    names.into_iter().filter(|t| pattern.is_match(t)).collect();
                if matched.is_empty() {
                    error!(
                        %pattern,
                        "Topic does not match a known topic. Find the list of acceptable topics \
                         in the source catalogue. Aborting."
                    );
                    return Ok(false);
                }
                matched
            }
        };

        self.create_topics(&names, partitions, replication).await
    }

    /// Create topics exactly as described, ignoring `[topics.<name>]`
    /// overrides. Topics already on the cluster after a refresh are skipped.
    ///
    /// Returns `false` if the refresh or the creation call failed.
    pub async fn create_descriptors(&mut self, topics: Vec<TopicDescriptor>) -> Result<bool> {
        if !self.refresh_topics().await? {
            return Ok(false);
        }
        let existing = self.topics()?;

        info!("Creating topics. Topics marked with [*] already exist.");
        let mut missing = Vec::new();
        for topic in topics {
            if existing.contains(&topic.name) {
                info!("[*] {}", topic.name);
            } else {
                info!("[ ] {}", topic.name);
                missing.push(topic);
            }
        }

        if missing.is_empty() {
            info!("All of the topics are already created.");
            return Ok(true);
        }

        if let Err(err) = self.cluster.create_topics(&missing).await {
            error!(error = %err, "Failed to create topics");
            return Ok(false);
        }
        info!(count = missing.len(), "Created topics. Requesting to refresh topics");
        self.refresh_topics().await
    }

    fn descriptor(&self, name: &str, partitions: i32, replication: i32) -> TopicDescriptor {
        let topic = self.config.topic(name);
        TopicDescriptor::new(
            name,
            topic.partitions.unwrap_or(partitions),
            topic.replication_factor.unwrap_or(replication),
        )
        .with_configuration(topic.properties)
    }
}

#[async_trait]
impl<A: ClusterAdmin> TopicRegistrar for KafkaTopics<A> {
    async fn wait_until_ready(&mut self, brokers: usize) -> bool {
        let found = self.gate.wait_for_brokers(&self.cluster, brokers).await;
        self.available_brokers = found.len();
        if found.len() < brokers {
            return false;
        }
        if let Err(err) = self.cluster.bind(&found) {
            error!(error = %err, "Cannot connect to discovered brokers");
            return false;
        }
        self.initialized = true;

        match self.refresh_topics().await {
            Ok(ready) => ready,
            Err(err) => {
                error!(error = %err, "Failed to refresh topics");
                false
            }
        }
    }

    fn ensure_initialized(&self) -> Result<()> {
        if self.initialized {
            Ok(())
        } else {
            Err(TopicError::NotInitialized)
        }
    }

    fn available_brokers(&self) -> usize {
        self.available_brokers
    }

    async fn refresh_topics(&mut self) -> Result<bool> {
        self.ensure_initialized()?;
        info!("Waiting for topics to become available.");

        self.topics = None;
        let cluster = &self.cluster;
        let listed = self
            .config
            .retry
            .topics
            .run(
                "topics",
                |attempt, timeout| async move {
                    match cluster.list_topics(timeout).await {
                        Ok(topics) => topics,
                        Err(err) => {
                            error!(attempt, error = %err, "Failed to list topics from brokers");
                            BTreeSet::new()
                        }
                    }
                },
                |_, topics| !topics.is_empty(),
            )
            .await;

        match listed {
            Some(topics) => {
                info!(count = topics.len(), "Topics available");
                tokio::time::sleep(self.config.retry.settle_delay()).await;
                self.topics = Some(topics);
                Ok(true)
            }
            None => {
                error!("Topics not available.");
                Ok(false)
            }
        }
    }

    fn topics(&self) -> Result<&BTreeSet<String>> {
        self.ensure_initialized()?;
        self.topics.as_ref().ok_or(TopicError::TopicsUnavailable)
    }

    async fn create_topics(
        &mut self,
        names: &BTreeSet<String>,
        partitions: i32,
        replication: i32,
    ) -> Result<bool> {
        let descriptors = names
            .iter()
            .map(|name| self.descriptor(name, partitions, replication))
            .collect();
        self.create_descriptors(descriptors).await
    }

    async fn delete_topics(&mut self, names: &[String]) -> Result<()> {
        self.ensure_initialized()?;
        self.cluster.delete_topics(names).await?;
        info!(topics = ?names, "Deleted topics. Requesting to refresh topics");
        if !self.refresh_topics().await? {
            return Err(TopicError::TopicsUnavailable);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use std::sync::Mutex;
    use std::time::Duration;

    use assert_matches::assert_matches;

    use crate::catalogue::StaticCatalogue;
    use crate::cluster::{Broker, BrokerSet};
    use crate::config::TopicConfig;

    #[derive(Debug, Default)]
    struct RecordingCluster {
        topics: Mutex<BTreeSet<String>>,
        create_calls: Mutex<Vec<Vec<TopicDescriptor>>>,
        fail_bind: bool,
    }

    #[async_trait]
    impl ClusterAdmin for RecordingCluster {
        async fn describe_brokers(&self, _timeout: Duration) -> Result<BrokerSet> {
            Ok(BrokerSet::new([Broker { id: 1, host: "kafka-1".into(), port: 9092 }]))
        }

        fn bind(&mut self, _brokers: &BrokerSet) -> Result<()> {
            if self.fail_bind {
                return Err(TopicError::TopicsUnavailable);
            }
            Ok(())
        }

        async fn list_topics(&self, _timeout: Duration) -> Result<BTreeSet<String>> {
            Ok(self.topics.lock().unwrap().clone())
        }

        async fn create_topics(&self, topics: &[TopicDescriptor]) -> Result<()> {
            self.create_calls.lock().unwrap().push(topics.to_vec());
            let mut existing = self.topics.lock().unwrap();
            existing.extend(topics.iter().map(|t| t.name.clone()));
            Ok(())
        }

        async fn delete_topics(&self, names: &[String]) -> Result<()> {
            let mut existing = self.topics.lock().unwrap();
            for name in names {
                existing.remove(name);
            }
            Ok(())
        }

        async fn describe_config(&self, _topic: &str) -> Result<BTreeMap<String, String>> {
            Ok(BTreeMap::new())
        }

        async fn alter_config(&self, _topic: &str, _settings: &BTreeMap<String, String>) -> Result<()> {
            Ok(())
        }
    }

    fn cluster_with(topics: &[&str]) -> RecordingCluster {
        let cluster = RecordingCluster::default();
        cluster
            .topics
            .lock()
            .unwrap()
            .extend(topics.iter().map(|t| t.to_string()));
        cluster
    }

    fn names(names: &[&str]) -> BTreeSet<String> {
        names.iter().map(|t| t.to_string()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_topics_before_initialize() {
        let topics = KafkaTopics::new(cluster_with(&["__consumer_offsets"]), ToolConfig::default());
        assert_matches!(topics.topics(), Err(TopicError::NotInitialized));
        assert_matches!(topics.cluster(), Err(TopicError::NotInitialized));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_topics_is_idempotent() {
        let mut topics =
            KafkaTopics::new(cluster_with(&["__consumer_offsets"]), ToolConfig::default());
        topics.initialize(1).await.unwrap();

        assert!(topics.create_topics(&names(&["a", "b"]), 3, 1).await.unwrap());
        assert!(topics.create_topics(&names(&["a", "b"]), 3, 1).await.unwrap());

        let calls = topics.cluster.create_calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].len(), 2);
        assert!(topics.topics().unwrap().contains("a"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_skips_existing_topics() {
        let mut topics = KafkaTopics::new(
            cluster_with(&["__consumer_offsets", "a"]),
            ToolConfig::default(),
        );
        topics.initialize(1).await.unwrap();

        assert!(topics.create_topics(&names(&["a", "b"]), 3, 1).await.unwrap());
        let calls = topics.cluster.create_calls.lock().unwrap();
        assert_eq!(calls[0], vec![TopicDescriptor::new("b", 3, 1)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_fails_without_brokers() {
        let mut topics =
            KafkaTopics::new(cluster_with(&["__consumer_offsets"]), ToolConfig::default());
        let err = topics.initialize(3).await.unwrap_err();
        assert_matches!(err, TopicError::BrokersUnavailable { required: 3, available: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_reports_unreachable_brokers() {
        let cluster = RecordingCluster {
            fail_bind: true,
            ..cluster_with(&["__consumer_offsets"])
        };
        let mut topics = KafkaTopics::new(cluster, ToolConfig::default());
        let err = topics.initialize(1).await.unwrap_err();
        assert_matches!(err, TopicError::BrokersUnreachable { available: 1 });
        assert_matches!(topics.topics(), Err(TopicError::NotInitialized));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_sees_topics_created_elsewhere() {
        let mut topics =
            KafkaTopics::new(cluster_with(&["__consumer_offsets"]), ToolConfig::default());
        topics.initialize(1).await.unwrap();
        assert!(!topics.topics().unwrap().contains("a"));

        // another client creates the topic after our last listing
        topics.cluster.topics.lock().unwrap().insert("a".to_string());

        assert!(topics.create_topics(&names(&["a"]), 3, 1).await.unwrap());
        assert!(topics.cluster.create_calls.lock().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_descriptors_ignores_overrides() {
        let mut config = ToolConfig::default();
        config.topics.insert(
            "_schemas".to_string(),
            TopicConfig {
                partitions: Some(3),
                replication_factor: Some(5),
                ..TopicConfig::default()
            },
        );
        let mut topics = KafkaTopics::new(cluster_with(&["__consumer_offsets"]), config);
        topics.initialize(1).await.unwrap();

        assert!(topics
            .create_descriptors(vec![TopicDescriptor::new("_schemas", 1, 2)])
            .await
            .unwrap());
        let calls = topics.cluster.create_calls.lock().unwrap();
        assert_eq!(calls[0], vec![TopicDescriptor::new("_schemas", 1, 2)]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_initialize_fails_without_topics() {
        let mut topics = KafkaTopics::new(cluster_with(&[]), ToolConfig::default());
        assert_matches!(topics.initialize(1).await, Err(TopicError::TopicsUnavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_matching_applies_overrides() {
        let mut config = ToolConfig::default();
        config.topics.insert(
            "phone_battery".to_string(),
            TopicConfig {
                partitions: Some(6),
                properties: BTreeMap::from([("retention.ms".to_string(), "1000".to_string())]),
                ..TopicConfig::default()
            },
        );
        config.topics.insert(
            "phone_legacy".to_string(),
            TopicConfig { enabled: false, ..TopicConfig::default() },
        );
        let mut topics = KafkaTopics::new(cluster_with(&["__consumer_offsets"]), config);
        topics.initialize(1).await.unwrap();

        let catalogue = StaticCatalogue::new(["phone_light", "watch_heart_rate", "phone_legacy"]);
        assert!(topics
            .create_topics_matching(&catalogue, 3, 2, None, Some("^phone_"))
            .await
            .unwrap());

        let calls = topics.cluster.create_calls.lock().unwrap();
        let created: Vec<&str> = calls[0].iter().map(|t| t.name.as_str()).collect();
        assert_eq!(created, vec!["phone_battery", "phone_light"]);
        assert_eq!(calls[0][0].partitions, 6);
        assert_eq!(calls[0][0].configuration["retention.ms"], "1000");
        assert_eq!(calls[0][1].replication_factor, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_matching_nothing() {
        let mut topics =
            KafkaTopics::new(cluster_with(&["__consumer_offsets"]), ToolConfig::default());
        topics.initialize(1).await.unwrap();

        let catalogue = StaticCatalogue::new(["phone_light"]);
        assert!(!topics
            .create_topics_matching(&catalogue, 3, 1, Some("phone"), None)
            .await
            .unwrap());
        assert!(topics.cluster.create_calls.lock().unwrap().is_empty());
    }

    #[test]
    fn test_match_topic() {
        let exact = match_topic(Some("a.b"), Some("x")).unwrap().unwrap();
        assert!(exact.is_match("a.b"));
        assert!(!exact.is_match("aXb"));
        assert!(!exact.is_match("a.bc"));

        let regex = match_topic(None, Some("^android_")).unwrap().unwrap();
        assert!(regex.is_match("android_phone_light"));

        assert!(match_topic(None, None).unwrap().is_none());
        assert_matches!(match_topic(None, Some("(")), Err(TopicError::Pattern(_)));
    }
}
