//! Harness configuration loaded from YAML.
//!
//! One harness file describes one verification run:
//!
//! ```yaml
//! name: eks-postgres
//! stack:
//!   dir: ../../kubernetes
//!   vars:
//!     region: us-east-1
//! cluster:
//!   name: { output: eks_cluster_name }
//!   region: us-east-1
//! kubernetes:
//!   context: postgres-eks
//! expect:
//!   namespace: postgres-security
//!   stateful_set: postgres-security
//!   replicas: 1
//!   pod_labels: { app: postgres-security }
//!   pod_count: 1
//!   network_policy: postgres-security-network-policy
//!   service: postgres-security
//!   service_port: 5432
//! ```
//!
//! Any resource name may be a literal or `{ output: <name> }`, resolved
//! against the stack outputs once the stack has been applied.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::Deserialize;

use crate::poll::PollPolicy;
use crate::provisioner::{StackConfig, StackOutputs};
use crate::verify::ExpectedResourceState;
use crate::{Error, Result};

/// Default provisioner binary
pub const DEFAULT_TERRAFORM_BINARY: &str = "terraform";

/// Default timeout for a single provisioner command
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(30 * 60);

/// Longest accepted value for any timeout, interval or polling budget
pub const MAX_DURATION: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Default retries for provisioner errors matching a retryable pattern
pub const DEFAULT_PROVISION_RETRIES: u32 = 3;

/// Default delay between provisioner retries
pub const DEFAULT_PROVISION_RETRY_DELAY: Duration = Duration::from_secs(5);

/// Terraform errors known to be transient (network flakes, registry hiccups)
pub const DEFAULT_RETRYABLE_ERRORS: &[&str] = &[
    ".*read: connection reset by peer.*",
    ".*transport is closing.*",
    ".*unable to verify signature.*",
    ".*unable to verify checksum.*",
    ".*no provider exists with the given name.*",
    ".*registry service is unreachable.*",
    ".*Error installing provider.*",
    ".*Failed to query available provider packages.*",
    ".*timeout while waiting for plugin to start.*",
    ".*timed out waiting for server handshake.*",
    "could not query provider registry for",
    ".*Error: Failed to install provider.*",
    ".*RequestError: send request failed.*",
    ".*TLS handshake timeout.*",
    ".*Client.Timeout exceeded while awaiting headers.*",
];

/// Serde helpers for humantime durations (`30s`, `5m`, `1h 30m`).
pub(crate) mod duration {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer};

    /// Deserialize a required humantime duration
    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let raw = String::deserialize(d)?;
        humantime::parse_duration(&raw).map_err(serde::de::Error::custom)
    }

    pub mod option {
        use std::time::Duration;

        use serde::{Deserialize, Deserializer};

        /// Deserialize an optional humantime duration
        pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Option<Duration>, D::Error> {
            Option::<String>::deserialize(d)?
                .map(|raw| humantime::parse_duration(&raw).map_err(serde::de::Error::custom))
                .transpose()
        }
    }
}

/// A resource name given literally or taken from a stack output.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(untagged)]
pub enum NameRef {
    /// Literal name
    Literal(String),
    /// Name produced by the stack
    Output {
        /// Stack output holding the name
        output: String,
    },
}

impl NameRef {
    /// Resolve against the outputs of an applied stack
    pub fn resolve(&self, outputs: &StackOutputs) -> Result<String> {
        match self {
            NameRef::Literal(name) => Ok(name.clone()),
            NameRef::Output { output } => outputs.string(output),
        }
    }
}

impl std::fmt::Display for NameRef {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            NameRef::Literal(name) => write!(f, "{}", name),
            NameRef::Output { output } => write!(f, "output.{}", output),
        }
    }
}

impl From<&str> for NameRef {
    fn from(name: &str) -> Self {
        NameRef::Literal(name.to_string())
    }
}

/// One verification run.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HarnessConfig {
    /// Run name used in logs and the final report
    pub name: String,
    /// Stack to provision
    pub stack: StackSection,
    /// Compute cluster that must become active
    pub cluster: ClusterSection,
    /// How to reach the Kubernetes API
    #[serde(default)]
    pub kubernetes: KubernetesSection,
    /// Expected live state
    pub expect: ExpectSection,
    /// Polling budgets for asynchronous checks
    #[serde(default)]
    pub polling: PollingSection,
    /// Overall deadline for apply and verification. Apply always runs to
    /// completion; a deadline that passes meanwhile fails the run right after.
    /// Teardown runs regardless
    #[serde(default, with = "duration::option")]
    pub timeout: Option<Duration>,
}

/// Declarative stack and provisioner settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StackSection {
    /// Directory holding the stack definition; relative to the harness file
    pub dir: PathBuf,
    /// Parameters passed to the provisioner
    #[serde(default)]
    pub vars: BTreeMap<String, serde_json::Value>,
    /// Provisioner binary
    #[serde(default = "default_binary")]
    pub binary: String,
    /// Timeout for each provisioner command
    #[serde(default = "default_command_timeout", with = "duration")]
    pub command_timeout: Duration,
    /// Retries for failures matching `retryable_errors`
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay between retries
    #[serde(default = "default_retry_delay", with = "duration")]
    pub retry_delay: Duration,
    /// Regexes matched against provisioner stderr
    #[serde(default = "default_retryable_errors")]
    pub retryable_errors: Vec<String>,
}

/// Cluster readiness settings.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ClusterSection {
    /// Cluster name
    pub name: NameRef,
    /// Cloud region
    pub region: String,
    /// Readiness polling budget
    #[serde(default = "default_cluster_poll")]
    pub poll: PollPolicy,
}

/// Kubernetes client selection; both unset means kube's default inference.
#[derive(Clone, Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KubernetesSection {
    /// Path to a kubeconfig file
    pub kubeconfig: Option<PathBuf>,
    /// Context within the kubeconfig
    pub context: Option<String>,
}

/// Expected resource state before name resolution.
#[derive(Clone, Debug, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExpectSection {
    /// Namespace holding the workload
    pub namespace: NameRef,
    /// StatefulSet name
    pub stateful_set: NameRef,
    /// Desired replica count on the StatefulSet
    pub replicas: i32,
    /// Label selector for the workload's pods
    pub pod_labels: BTreeMap<String, String>,
    /// Number of pods matching `pod_labels`
    pub pod_count: usize,
    /// NetworkPolicy name
    pub network_policy: NameRef,
    /// Service name
    pub service: NameRef,
    /// First port exposed by the service
    pub service_port: i32,
}

/// Polling budgets for the pod checks.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PollingSection {
    /// Waiting for the expected number of pods to exist
    #[serde(default = "default_pod_count_poll")]
    pub pod_count: PollPolicy,
    /// Waiting for each pod to become available
    #[serde(default = "default_pod_ready_poll")]
    pub pod_ready: PollPolicy,
}

impl Default for PollingSection {
    fn default() -> Self {
        Self {
            pod_count: default_pod_count_poll(),
            pod_ready: default_pod_ready_poll(),
        }
    }
}

fn default_binary() -> String {
    DEFAULT_TERRAFORM_BINARY.to_string()
}

fn default_command_timeout() -> Duration {
    DEFAULT_COMMAND_TIMEOUT
}

fn default_max_retries() -> u32 {
    DEFAULT_PROVISION_RETRIES
}

fn default_retry_delay() -> Duration {
    DEFAULT_PROVISION_RETRY_DELAY
}

fn default_retryable_errors() -> Vec<String> {
    DEFAULT_RETRYABLE_ERRORS.iter().map(|s| s.to_string()).collect()
}

fn default_cluster_poll() -> PollPolicy {
    PollPolicy::new(
        crate::DEFAULT_CLUSTER_POLL_ATTEMPTS,
        crate::DEFAULT_CLUSTER_POLL_INTERVAL,
    )
}

fn default_pod_count_poll() -> PollPolicy {
    PollPolicy::new(
        crate::DEFAULT_POD_COUNT_ATTEMPTS,
        crate::DEFAULT_POD_COUNT_INTERVAL,
    )
}

fn default_pod_ready_poll() -> PollPolicy {
    PollPolicy::new(
        crate::DEFAULT_POD_READY_ATTEMPTS,
        crate::DEFAULT_POD_READY_INTERVAL,
    )
}

fn within_max_duration(field: &str, value: Option<Duration>) -> Result<()> {
    match value {
        Some(value) if value > MAX_DURATION => Err(Error::config(format!(
            "{} of {} exceeds the maximum of {}",
            field,
            humantime::format_duration(value),
            humantime::format_duration(MAX_DURATION)
        ))),
        _ => Ok(()),
    }
}

/// Compile retryable error patterns, naming the first invalid one
pub fn compile_patterns<S: AsRef<str>>(patterns: &[S]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|pattern| {
            let pattern = pattern.as_ref();
            Regex::new(pattern).map_err(|e| {
                Error::config(format!("invalid retryable error pattern {:?}: {}", pattern, e))
            })
        })
        .collect()
}

impl HarnessConfig {
    /// Load and validate a harness file.
    ///
    /// A relative `stack.dir` is resolved against the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .map_err(|e| Error::config(format!("failed to read {}: {}", path.display(), e)))?;
        let mut config = Self::from_yaml(&raw)
            .map_err(|e| Error::config(format!("{}: {}", path.display(), e)))?;

        if config.stack.dir.is_relative() {
            if let Some(parent) = path.parent() {
                config.stack.dir = parent.join(&config.stack.dir);
            }
        }
        Ok(config)
    }

    /// Parse and validate harness YAML
    pub fn from_yaml(raw: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(raw)
            .map_err(|e| Error::config(format!("invalid harness YAML: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Check invariants serde cannot express
    pub fn validate(&self) -> Result<()> {
        if self.name.trim().is_empty() {
            return Err(Error::config("name must not be empty"));
        }
        if self.cluster.region.trim().is_empty() {
            return Err(Error::config("cluster.region must not be empty"));
        }

        for (field, policy) in [
            ("cluster.poll", &self.cluster.poll),
            ("polling.pod_count", &self.polling.pod_count),
            ("polling.pod_ready", &self.polling.pod_ready),
        ] {
            if policy.max_attempts == 0 {
                return Err(Error::config(format!(
                    "{}.max_attempts must be at least 1",
                    field
                )));
            }
            within_max_duration(&format!("{}.interval", field), Some(policy.interval))?;
            within_max_duration(&format!("{}.timeout", field), policy.timeout)?;
            within_max_duration(
                &format!("{}.interval x max_attempts", field),
                Some(
                    policy
                        .interval
                        .checked_mul(policy.max_attempts)
                        .unwrap_or(Duration::MAX),
                ),
            )?;
        }
        within_max_duration("timeout", self.timeout)?;
        within_max_duration("stack.command_timeout", Some(self.stack.command_timeout))?;
        within_max_duration("stack.retry_delay", Some(self.stack.retry_delay))?;

        let expect = &self.expect;
        if expect.replicas < 0 {
            return Err(Error::config("expect.replicas must not be negative"));
        }
        if expect.pod_labels.is_empty() {
            return Err(Error::config(
                "expect.pod_labels must select at least one label",
            ));
        }
        if !(1..=65535).contains(&expect.service_port) {
            return Err(Error::config(format!(
                "expect.service_port {} is not a valid port",
                expect.service_port
            )));
        }

        self.retryable_patterns()?;
        Ok(())
    }

    /// Compile `stack.retryable_errors`
    pub fn retryable_patterns(&self) -> Result<Vec<Regex>> {
        compile_patterns(&self.stack.retryable_errors)
    }

    /// The immutable parameter set handed to the provisioner
    pub fn stack_config(&self) -> StackConfig {
        StackConfig::new(self.stack.dir.clone(), self.stack.vars.clone())
    }

    /// Literal namespace, if the namespace does not depend on stack outputs.
    ///
    /// Used to warn about runs that share a namespace before anything is
    /// provisioned.
    pub fn literal_namespace(&self) -> Option<&str> {
        match &self.expect.namespace {
            NameRef::Literal(ns) => Some(ns),
            NameRef::Output { .. } => None,
        }
    }
}

impl ExpectSection {
    /// Resolve every name reference against stack outputs
    pub fn resolve(&self, outputs: &StackOutputs) -> Result<ExpectedResourceState> {
        Ok(ExpectedResourceState {
            namespace: self.namespace.resolve(outputs)?,
            stateful_set: self.stateful_set.resolve(outputs)?,
            replicas: self.replicas,
            pod_labels: self.pod_labels.clone(),
            pod_count: self.pod_count,
            network_policy: self.network_policy.resolve(outputs)?,
            service: self.service.resolve(outputs)?,
            service_port: self.service_port,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    const HARNESS: &str = r#"
name: eks-postgres
stack:
  dir: ../../kubernetes
  vars:
    region: us-east-1
cluster:
  name: { output: eks_cluster_name }
  region: us-east-1
expect:
  namespace: postgres-security
  stateful_set: postgres-security
  replicas: 1
  pod_labels:
    app: postgres-security
  pod_count: 1
  network_policy: postgres-security-network-policy
  service: postgres-security
  service_port: 5432
"#;

    fn outputs() -> StackOutputs {
        StackOutputs::from_values(BTreeMap::from([(
            "eks_cluster_name".to_string(),
            serde_json::json!("postgres-eks"),
        )]))
    }

    #[test]
    fn parses_harness_with_defaults() {
        let config = HarnessConfig::from_yaml(HARNESS).unwrap();

        assert_eq!(config.name, "eks-postgres");
        assert_eq!(config.stack.binary, "terraform");
        assert_eq!(config.stack.max_retries, 3);
        assert_eq!(config.stack.retry_delay, Duration::from_secs(5));
        assert_eq!(config.stack.retryable_errors.len(), DEFAULT_RETRYABLE_ERRORS.len());
        assert_eq!(config.cluster.poll, PollPolicy::new(10, Duration::from_secs(30)));
        assert_eq!(config.polling.pod_count, PollPolicy::new(30, Duration::from_secs(10)));
        assert_eq!(config.polling.pod_ready, PollPolicy::new(10, Duration::from_secs(5)));
        assert!(config.timeout.is_none());
        assert_eq!(
            config.cluster.name,
            NameRef::Output {
                output: "eks_cluster_name".to_string()
            }
        );
    }

    #[test]
    fn parses_humantime_overrides() {
        let yaml = format!(
            "{HARNESS}timeout: 45m\npolling:\n  pod_ready:\n    max_attempts: 3\n    interval: 2s\n    timeout: 1m\n"
        );
        let config = HarnessConfig::from_yaml(&yaml).unwrap();

        assert_eq!(config.timeout, Some(Duration::from_secs(45 * 60)));
        assert_eq!(
            config.polling.pod_ready,
            PollPolicy::new(3, Duration::from_secs(2)).with_timeout(Duration::from_secs(60))
        );
        // Unspecified sibling keeps its default
        assert_eq!(config.polling.pod_count.max_attempts, 30);
    }

    #[test]
    fn resolves_names_from_outputs() {
        let config = HarnessConfig::from_yaml(HARNESS).unwrap();
        let outputs = outputs();

        assert_eq!(config.cluster.name.resolve(&outputs).unwrap(), "postgres-eks");

        let expected = config.expect.resolve(&outputs).unwrap();
        assert_eq!(expected.namespace, "postgres-security");
        assert_eq!(expected.replicas, 1);
        assert_eq!(expected.service_port, 5432);
        assert_eq!(
            expected.pod_labels.get("app").map(String::as_str),
            Some("postgres-security")
        );
    }

    #[test]
    fn missing_output_is_a_config_error() {
        let name = NameRef::Output {
            output: "nope".to_string(),
        };
        let err = name.resolve(&outputs()).unwrap_err();
        assert!(matches!(err, Error::Config { .. }));
        assert!(err.to_string().contains("nope"));
    }

    #[test]
    fn rejects_zero_attempts() {
        let yaml = HARNESS.replace(
            "  region: us-east-1\nexpect",
            "  region: us-east-1\n  poll: { max_attempts: 0, interval: 30s }\nexpect",
        );
        let err = HarnessConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("cluster.poll.max_attempts"));
    }

    #[test]
    fn rejects_durations_past_the_maximum() {
        let yaml = format!("{HARNESS}timeout: 500000000y\n");
        let err = HarnessConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("timeout of"), "{err}");

        let yaml = HARNESS.replace(
            "  region: us-east-1\nexpect",
            "  region: us-east-1\n  poll: { max_attempts: 4294967295, interval: 1000000y }\nexpect",
        );
        let err = HarnessConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("cluster.poll.interval"), "{err}");

        let yaml = HARNESS.replace(
            "  region: us-east-1\nexpect",
            "  region: us-east-1\n  poll: { max_attempts: 100000, interval: 1h }\nexpect",
        );
        let err = HarnessConfig::from_yaml(&yaml).unwrap_err();
        assert!(
            err.to_string().contains("cluster.poll.interval x max_attempts"),
            "{err}"
        );

        let yaml = format!("{HARNESS}timeout: 7days\n");
        assert!(HarnessConfig::from_yaml(&yaml).is_ok());
    }

    #[test]
    fn rejects_invalid_port_and_empty_selector() {
        let yaml = HARNESS.replace("service_port: 5432", "service_port: 70000");
        assert!(HarnessConfig::from_yaml(&yaml)
            .unwrap_err()
            .to_string()
            .contains("not a valid port"));

        let yaml = HARNESS.replace("pod_labels:\n    app: postgres-security", "pod_labels: {}");
        assert!(HarnessConfig::from_yaml(&yaml)
            .unwrap_err()
            .to_string()
            .contains("pod_labels"));
    }

    #[test]
    fn rejects_bad_retryable_pattern() {
        let yaml = HARNESS.replace(
            "    region: us-east-1\ncluster",
            "    region: us-east-1\n  retryable_errors: [\"(unclosed\"]\ncluster",
        );
        let err = HarnessConfig::from_yaml(&yaml).unwrap_err();
        assert!(err.to_string().contains("invalid retryable error pattern"));
    }

    #[test]
    fn rejects_unknown_fields() {
        let yaml = format!("{HARNESS}teardown: false\n");
        assert!(HarnessConfig::from_yaml(&yaml).is_err());
    }

    #[test]
    fn load_resolves_stack_dir_relative_to_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("harness.yaml");
        let mut file = std::fs::File::create(&path).unwrap();
        file.write_all(HARNESS.as_bytes()).unwrap();

        let config = HarnessConfig::load(&path).unwrap();
        assert_eq!(config.stack.dir, dir.path().join("../../kubernetes"));
        assert_eq!(config.literal_namespace(), Some("postgres-security"));
    }

    #[test]
    fn load_reports_missing_file() {
        let err = HarnessConfig::load(Path::new("/nonexistent/harness.yaml")).unwrap_err();
        assert!(err.to_string().contains("failed to read"));
    }
}
