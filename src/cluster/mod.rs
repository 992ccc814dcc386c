//! Cluster readiness oracle
//!
//! Applying a stack returns as soon as the cloud API accepts the request; the
//! compute cluster keeps converging for minutes afterwards. [`wait_for_cluster`]
//! polls a [`ClusterReadiness`] implementation until the cluster accepts
//! workload scheduling.
//!
//! # Implementations
//!
//! - [`EksCluster`] - AWS EKS via the `aws` CLI

mod eks;

pub use eks::EksCluster;

use async_trait::async_trait;
use tracing::info;

#[cfg(test)]
use mockall::automock;

use crate::poll::{poll_until_ready, PollFailure, PollPolicy};
use crate::{Error, Result};

/// Reported lifecycle state of a compute cluster
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClusterStatus {
    /// Accepts workload scheduling
    Active,
    /// Still converging (creating, updating)
    Pending(String),
    /// Terminal state; waiting longer will not help
    Failed(String),
}

/// Trait abstracting the cloud provider's view of a cluster
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterReadiness: Send + Sync {
    /// Current status of `cluster` in `region`
    ///
    /// Returns [`Error::NotFound`] while the cluster does not exist yet.
    async fn status(&self, cluster: &str, region: &str) -> Result<ClusterStatus>;
}

/// Poll until the cluster is active.
///
/// Pending states and absence are retried; a failed cluster or any other
/// error aborts immediately.
pub async fn wait_for_cluster(
    oracle: &dyn ClusterReadiness,
    cluster: &str,
    region: &str,
    policy: &PollPolicy,
) -> Result<()> {
    info!(
        cluster = %cluster,
        region = %region,
        max_attempts = policy.max_attempts,
        max_wait = %humantime::format_duration(policy.max_wait()),
        "Waiting for cluster to become active"
    );

    poll_until_ready(policy, "cluster readiness", || async {
        match oracle.status(cluster, region).await? {
            ClusterStatus::Active => Ok(()),
            ClusterStatus::Pending(state) => Err(PollFailure::retry(format!(
                "cluster {} is {}",
                cluster, state
            ))),
            ClusterStatus::Failed(state) => Err(PollFailure::Fatal(Error::cluster(
                cluster,
                format!("status {}", state),
            ))),
        }
    })
    .await?;

    info!(cluster = %cluster, "Cluster active");
    Ok(())
}
