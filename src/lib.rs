//! Stackverify - end-to-end verification harness for provisioned infrastructure
//!
//! Stackverify drives a declarative infrastructure stack through its whole
//! lifecycle and checks that what came up matches what was asked for.
//!
//! # Architecture
//!
//! Every run is a linear pipeline:
//! - Apply the stack through a provisioner (terraform)
//! - Poll the cloud provider until the compute cluster accepts scheduling
//! - Check namespace, stateful set, pods, network policy and service against
//!   the expected state, polling where the platform converges asynchronously
//! - Destroy the stack on every exit path
//!
//! The three external systems (provisioner, cloud provider, Kubernetes API)
//! sit behind traits so the pipeline can run against fakes in tests.
//!
//! # Modules
//!
//! - [`pipeline`] - Run orchestration and the guaranteed teardown
//! - [`poll`] - Bounded fixed-interval polling with retryable/fatal failures
//! - [`verify`] - Expected vs observed resource comparison
//! - [`provisioner`] - Stack apply/destroy (terraform implementation)
//! - [`cluster`] - Cluster readiness oracle (EKS implementation)
//! - [`resources`] - Read-only Kubernetes resource queries
//! - [`config`] - Harness file loading and name resolution
//! - [`cli`] - Command-line interface
//! - [`error`] - Error types

#![deny(missing_docs)]

pub mod cli;
pub mod cluster;
mod command;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod poll;
pub mod provisioner;
pub mod resources;
pub mod verify;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

// =============================================================================
// Default Polling Constants
// =============================================================================
// Defaults for the three polled checks. Harness files may override each one.

/// Attempts when waiting for the compute cluster to become active
pub const DEFAULT_CLUSTER_POLL_ATTEMPTS: u32 = 10;

/// Interval between cluster readiness attempts
pub const DEFAULT_CLUSTER_POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(30);

/// Attempts when waiting for the expected number of pods to exist
pub const DEFAULT_POD_COUNT_ATTEMPTS: u32 = 30;

/// Interval between pod count attempts
pub const DEFAULT_POD_COUNT_INTERVAL: std::time::Duration = std::time::Duration::from_secs(10);

/// Attempts when waiting for a pod to become available
pub const DEFAULT_POD_READY_ATTEMPTS: u32 = 10;

/// Interval between pod readiness attempts
pub const DEFAULT_POD_READY_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);
