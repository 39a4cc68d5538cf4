//! Waiting for enough brokers to come online

use tracing::{error, info, warn};

use crate::cluster::{BrokerSet, ClusterAdmin};
use crate::retry::RetryPolicy;

/// Polls the cluster until a minimum number of brokers is reachable.
#[derive(Debug, Clone)]
pub struct ClusterReadinessGate {
    policy: RetryPolicy,
}

impl ClusterReadinessGate {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    /// Wait until at least `required` brokers are reachable.
    ///
    /// Listing failures count as zero brokers for that attempt. Returns the
    /// last observed broker set, which holds fewer than `required` brokers
    /// when the schedule ran out.
    pub async fn wait_for_brokers<A>(&self, admin: &A, required: usize) -> BrokerSet
    where
        A: ClusterAdmin + ?Sized,
    {
        let mut last = BrokerSet::default();
        let found = self
            .policy
            .run(
                "brokers",
                |attempt, timeout| async move {
                    match admin.describe_brokers(timeout).await {
                        Ok(brokers) => brokers,
                        Err(err) => {
                            error!(attempt, error = %err, "Failed to connect to bootstrap servers");
                            BrokerSet::default()
                        }
                    }
                },
                |attempt, brokers| {
                    if brokers.len() >= required {
                        true
                    } else {
                        warn!(
                            attempt,
                            available = brokers.len(),
                            required,
                            "Only {} out of {} Kafka brokers available.",
                            brokers.len(),
                            required
                        );
                        last = brokers.clone();
                        false
                    }
                },
            )
            .await;

        match found {
            Some(brokers) => {
                info!(available = brokers.len(), required, "Kafka brokers available");
                brokers
            }
            None => {
                error!(
                    available = last.len(),
                    required,
                    attempts = self.policy.attempts,
                    "Kafka brokers not available"
                );
                last
            }
        }
    }
}
