//! EKS readiness via the AWS CLI
//!
//! Credentials come from the caller's environment exactly as they would for
//! an interactive `aws` invocation.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;

use super::{ClusterReadiness, ClusterStatus};
use crate::command::run_command;
use crate::{Error, Result};

/// Timeout for a single describe-cluster call
const DESCRIBE_TIMEOUT: Duration = Duration::from_secs(60);

/// stderr fragments meaning the API could not be reached this time
const TRANSIENT_ERRORS: &[&str] = &[
    "Could not connect to the endpoint URL",
    "Read timeout on endpoint URL",
    "ThrottlingException",
];

/// EKS cluster readiness oracle
#[derive(Clone, Debug)]
pub struct EksCluster {
    binary: String,
}

impl Default for EksCluster {
    fn default() -> Self {
        Self {
            binary: "aws".to_string(),
        }
    }
}

impl EksCluster {
    /// Use a different CLI binary
    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self {
            binary: binary.into(),
        }
    }
}

/// Map `cluster.status` to a readiness state
fn parse_status(raw: &str) -> Result<ClusterStatus> {
    match raw.trim() {
        "ACTIVE" => Ok(ClusterStatus::Active),
        state @ ("CREATING" | "UPDATING" | "PENDING") => Ok(ClusterStatus::Pending(state.to_string())),
        state @ ("FAILED" | "DELETING") => Ok(ClusterStatus::Failed(state.to_string())),
        other => Err(Error::command(
            "aws eks describe-cluster",
            format!("unexpected cluster status {:?}", other),
        )),
    }
}

/// Classify a failed describe-cluster call
fn classify_failure(cluster: &str, stderr: &str) -> Result<ClusterStatus> {
    if stderr.contains("ResourceNotFoundException") {
        return Err(Error::not_found("EKS cluster", cluster));
    }
    if let Some(reason) = TRANSIENT_ERRORS.iter().find(|t| stderr.contains(*t)) {
        return Ok(ClusterStatus::Pending(format!("unreachable ({})", reason)));
    }
    Err(Error::command("aws eks describe-cluster", stderr.trim()))
}

#[async_trait]
impl ClusterReadiness for EksCluster {
    async fn status(&self, cluster: &str, region: &str) -> Result<ClusterStatus> {
        let mut cmd = Command::new(&self.binary);
        cmd.args([
            "eks",
            "describe-cluster",
            "--name",
            cluster,
            "--region",
            region,
            "--query",
            "cluster.status",
            "--output",
            "text",
        ]);

        let output = run_command(
            &mut cmd,
            &format!("aws eks describe-cluster (cluster={})", cluster),
            DESCRIBE_TIMEOUT,
        )
        .await
        .map_err(|e| Error::command("aws eks describe-cluster", e))?;

        if output.success {
            parse_status(&output.stdout)
        } else {
            classify_failure(cluster, &output.stderr)
        }
    }
}
