//! Read-only view of the orchestration platform
//!
//! A [`ResourceReader`] fetches the handful of objects a verification run
//! cares about and reduces each to the attributes that get compared. Absence
//! is reported as `Ok(None)` (or an empty list), never as an error; errors
//! mean the request itself failed.
//!
//! # Implementations
//!
//! - [`KubeResourceReader`] - kube-rs client against a live API server

mod kubernetes;

pub use kubernetes::KubeResourceReader;

use std::collections::BTreeMap;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use crate::Result;

/// Pod phase in which containers are running
pub const POD_PHASE_RUNNING: &str = "Running";

/// Namespace phase once deletion has started
pub const NAMESPACE_PHASE_TERMINATING: &str = "Terminating";

/// Observed Namespace
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedNamespace {
    /// Namespace name
    pub name: String,
    /// Lifecycle phase (Active, Terminating)
    pub phase: Option<String>,
}

impl ObservedNamespace {
    /// Deletion has started; workloads in it are going away
    pub fn is_terminating(&self) -> bool {
        self.phase.as_deref() == Some(NAMESPACE_PHASE_TERMINATING)
    }
}

/// Observed StatefulSet
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedStatefulSet {
    /// StatefulSet name
    pub name: String,
    /// Desired replicas from the spec
    pub replicas: i32,
    /// Replicas reported ready in status
    pub ready_replicas: i32,
}

/// Observed Pod
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedPod {
    /// Pod name
    pub name: String,
    /// Pod labels
    pub labels: BTreeMap<String, String>,
    /// Pod phase (Pending, Running, ...)
    pub phase: Option<String>,
    /// Number of container statuses reported
    pub containers: usize,
    /// Number of containers that are started and ready
    pub ready_containers: usize,
}

impl ObservedPod {
    /// Running with every container started and passing readiness
    pub fn is_available(&self) -> bool {
        self.phase.as_deref() == Some(POD_PHASE_RUNNING)
            && self.containers > 0
            && self.ready_containers == self.containers
    }

    /// Why the pod is not available yet, for polling diagnostics
    pub fn unavailable_reason(&self) -> String {
        format!(
            "pod {} is {} with {}/{} containers ready",
            self.name,
            self.phase.as_deref().unwrap_or("Unknown"),
            self.ready_containers,
            self.containers
        )
    }
}

/// Observed NetworkPolicy
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedNetworkPolicy {
    /// NetworkPolicy name
    pub name: String,
    /// Declared policy types (Ingress, Egress)
    pub policy_types: Vec<String>,
}

/// Observed Service
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedService {
    /// Service name
    pub name: String,
    /// Declared ports in order
    pub ports: Vec<i32>,
}

impl ObservedService {
    /// First declared port, the one verification compares
    pub fn first_port(&self) -> Option<i32> {
        self.ports.first().copied()
    }
}

/// Trait abstracting read-only queries against the orchestration platform
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ResourceReader: Send + Sync {
    /// Get a Namespace by name
    async fn namespace(&self, name: &str) -> Result<Option<ObservedNamespace>>;

    /// Get a StatefulSet by name
    async fn stateful_set(&self, namespace: &str, name: &str)
        -> Result<Option<ObservedStatefulSet>>;

    /// List pods matching every label in `labels`
    async fn pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ObservedPod>>;

    /// Get a Pod by name
    async fn pod(&self, namespace: &str, name: &str) -> Result<Option<ObservedPod>>;

    /// Get a NetworkPolicy by name
    async fn network_policy(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ObservedNetworkPolicy>>;

    /// Get a Service by name
    async fn service(&self, namespace: &str, name: &str) -> Result<Option<ObservedService>>;
}

/// Render labels as a Kubernetes label selector (`a=b,c=d`)
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{}={}", k, v))
        .collect::<Vec<_>>()
        .join(",")
}
