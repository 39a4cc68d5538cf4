//! Schema Topic CLI
//!
//! Backs up, restores and repairs the schema registry topic, and creates the
//! topics a deployment needs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use schema_topic::config::load_properties;
use schema_topic::{
    BackupOutcome, EnsureOutcome, JsonBackupStore, KafkaCluster, KafkaTopics, RestoreOutcome,
    SchemaTopicManager, StaticCatalogue, ToolConfig, TopicError, TopicRegistrar,
};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "schema-topic")]
#[command(about = "Back up, restore and create the Kafka topics of a schema registry")]
struct Cli {
    /// Configuration file, on top of the default locations
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Kafka bootstrap servers, overriding the configured ones
    #[arg(short, long, global = true)]
    bootstrap_servers: Option<String>,

    /// Properties file of a managed Kafka cluster
    #[arg(long, global = true, conflicts_with = "bootstrap_servers")]
    managed: Option<PathBuf>,

    /// Number of brokers to wait for
    #[arg(long, global = true, default_value_t = 3)]
    brokers: usize,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Store the schema topic in a backup file
    Backup {
        /// Backup file, defaults to the configured path
        #[arg(short, long)]
        file: Option<PathBuf>,
        /// Seconds to wait for the first records
        #[arg(short, long, default_value_t = 600)]
        timeout: u64,
    },

    /// Create the schema topic from a backup file
    Restore {
        #[arg(short, long)]
        file: Option<PathBuf>,
        #[arg(short, long, default_value_t = 3)]
        replication: i32,
    },

    /// Restore the schema topic from backup if it is absent or invalid
    Ensure {
        #[arg(short, long)]
        file: Option<PathBuf>,
        #[arg(short, long, default_value_t = 3)]
        replication: i32,
        #[arg(short, long, default_value_t = 600)]
        timeout: u64,
    },

    /// Create catalogue and configured topics
    CreateTopics {
        /// Exact topic name to create
        #[arg(short, long, conflicts_with = "pattern")]
        topic: Option<String>,
        /// Regular expression of topic names to create
        #[arg(short = 'm', long = "match")]
        pattern: Option<String>,
        /// File listing topic names, one per line
        #[arg(long)]
        catalogue: Option<PathBuf>,
        #[arg(short, long, default_value_t = 3)]
        partitions: i32,
        #[arg(short, long, default_value_t = 3)]
        replication: i32,
    },

    /// List the topics on the cluster
    ListTopics,
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    let code = tokio::select! {
        result = run(cli) => match result {
            Ok(code) => code,
            Err(e) => {
                error!("{:#}", e);
                e.downcast_ref::<TopicError>().map_or(2, TopicError::exit_code)
            }
        },
        _ = tokio::signal::ctrl_c() => {
            error!("Interrupted. The operation did not complete; verify the topic state before retrying.");
            TopicError::Interrupted.exit_code()
        }
    };

    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let config = ToolConfig::load_from(cli.config.as_deref()).context("Cannot load configuration")?;
    let config = if cli.managed.is_some() {
        config
    } else {
        config.with_bootstrap_servers(cli.bootstrap_servers.as_deref())?
    };
    let cluster = connect(cli.managed.as_deref(), &config)?;

    match cli.command {
        Commands::Backup { file, timeout } => {
            let store = backup_store(file, &config)?;
            let mut manager = SchemaTopicManager::new(KafkaTopics::new(cluster, config), store);
            manager.initialize(cli.brokers).await?;

            match manager.make_backup(Duration::from_secs(timeout)).await? {
                BackupOutcome::Valid(outcome) => info!(
                    path = %outcome.path().display(),
                    checksum = %outcome.checksum(),
                    "Stored schema topic backup"
                ),
                BackupOutcome::Invalid(outcome) => warn!(
                    path = %outcome.path().display(),
                    checksum = %outcome.checksum(),
                    "Stored invalid schema topic backup"
                ),
            }
            Ok(0)
        }

        Commands::Restore { file, replication } => {
            let store = backup_store(file, &config)?;
            let mut manager = SchemaTopicManager::new(KafkaTopics::new(cluster, config), store);
            manager.initialize(cli.brokers).await?;

            match manager.restore(replication).await? {
                RestoreOutcome::Restored { .. } => Ok(0),
                RestoreOutcome::NoBackup => Ok(1),
            }
        }

        Commands::Ensure {
            file,
            replication,
            timeout,
        } => {
            let store = backup_store(file, &config)?;
            let mut manager = SchemaTopicManager::new(KafkaTopics::new(cluster, config), store);
            manager.initialize(cli.brokers).await?;

            match manager
                .ensure(replication, Duration::from_secs(timeout))
                .await?
            {
                EnsureOutcome::AlreadyValid | EnsureOutcome::Restored { .. } => Ok(0),
                EnsureOutcome::NoBackup => Ok(1),
            }
        }

        Commands::CreateTopics {
            topic,
            pattern,
            catalogue,
            partitions,
            replication,
        } => {
            let catalogue = match catalogue {
                Some(path) => StaticCatalogue::from_file(&path)
                    .with_context(|| format!("Cannot read catalogue {}", path.display()))?,
                None => StaticCatalogue::default(),
            };
            let mut topics = KafkaTopics::new(cluster, config);
            topics.initialize(cli.brokers).await?;

            let created = topics
                .create_topics_matching(
                    &catalogue,
                    partitions,
                    replication,
                    topic.as_deref(),
                    pattern.as_deref(),
                )
                .await?;
            Ok(if created { 0 } else { 1 })
        }

        Commands::ListTopics => {
            let mut topics = KafkaTopics::new(cluster, config);
            topics.initialize(cli.brokers).await?;
            for name in topics.topics()? {
                println!("{}", name);
            }
            Ok(0)
        }
    }
}

fn connect(managed: Option<&Path>, config: &ToolConfig) -> anyhow::Result<KafkaCluster> {
    let client_id = config.backup.client_id.clone();
    let timeout = config.retry.admin_timeout();
    let cluster = match managed {
        Some(path) => {
            let properties = load_properties(path)
                .with_context(|| format!("Cannot read managed cluster properties {}", path.display()))?;
            KafkaCluster::managed(properties, client_id, timeout)?
        }
        None => KafkaCluster::new(config.kafka.clone(), client_id, timeout)?,
    };
    Ok(cluster)
}

fn backup_store(file: Option<PathBuf>, config: &ToolConfig) -> anyhow::Result<JsonBackupStore> {
    let path = file
        .or_else(|| config.backup.path.clone())
        .ok_or_else(|| TopicError::InvalidConfig("No backup file given".to_string()))?;
    Ok(JsonBackupStore::new(path)?)
}
