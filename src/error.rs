//! Error types for verification runs
//!
//! Each variant carries enough context (stage, check, field, expected vs
//! observed) to produce an actionable failure message without re-running.

use thiserror::Error;

/// Main error type for stackverify operations
#[derive(Debug, Error)]
pub enum Error {
    /// The provisioner could not apply the stack or read its outputs
    #[error("provision error [{stage}]: {message}")]
    Provision {
        /// Provisioner stage that failed (init, apply, output)
        stage: String,
        /// Description of what failed, usually the tool's stderr
        message: String,
    },

    /// A polled check never succeeded within its attempt budget
    #[error("timed out waiting for {check} after {attempts} attempts: {last_reason}")]
    Timeout {
        /// The check that was being polled
        check: String,
        /// Number of predicate invocations made
        attempts: u32,
        /// Reason reported by the final failed attempt
        last_reason: String,
    },

    /// The run's overall deadline expired while a check was in progress
    #[error("run deadline of {} exceeded during {check}", humantime::format_duration(.limit.clone()))]
    Deadline {
        /// The check in progress when the deadline fired
        check: String,
        /// The configured deadline
        limit: std::time::Duration,
    },

    /// A named resource does not exist (yet)
    ///
    /// Retryable inside a polling context, fatal outside one.
    #[error("{kind} not found: {name}")]
    NotFound {
        /// Resource kind (Namespace, StatefulSet, ...)
        kind: String,
        /// Qualified resource name (namespace/name for namespaced kinds)
        name: String,
    },

    /// An observed attribute differs from the expected value
    #[error("mismatch on {field}: expected {expected}, observed {observed}")]
    Mismatch {
        /// The attribute that differs (e.g. "replicas")
        field: String,
        /// Expected value, rendered for display
        expected: String,
        /// Observed value, rendered for display
        observed: String,
    },

    /// Destroying the stack failed; recorded but never replaces a verdict
    #[error("teardown error: {message}")]
    Teardown {
        /// Description of what failed
        message: String,
    },

    /// Invalid harness configuration or unresolvable name reference
    #[error("configuration error: {message}")]
    Config {
        /// Description of what's invalid
        message: String,
    },

    /// Kubernetes API error other than not-found
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The compute cluster reached a state it will not recover from
    #[error("cluster {cluster} unavailable: {message}")]
    Cluster {
        /// Cluster name
        cluster: String,
        /// Description of the terminal state
        message: String,
    },

    /// An external command could not be run or returned garbage
    #[error("command error [{command}]: {message}")]
    Command {
        /// The command that failed
        command: String,
        /// Description of what failed
        message: String,
    },
}

impl Error {
    /// Create a provision error for the given stage
    pub fn provision(stage: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Provision {
            stage: stage.into(),
            message: msg.into(),
        }
    }

    /// Create a timeout error for a polled check
    pub fn timeout(check: impl Into<String>, attempts: u32, last_reason: impl Into<String>) -> Self {
        Self::Timeout {
            check: check.into(),
            attempts,
            last_reason: last_reason.into(),
        }
    }

    /// Create a deadline error for the check that was interrupted
    pub fn deadline(check: impl Into<String>, limit: std::time::Duration) -> Self {
        Self::Deadline {
            check: check.into(),
            limit,
        }
    }

    /// Create a not-found error for a cluster-scoped resource
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a not-found error for a namespaced resource
    pub fn not_found_in(kind: impl Into<String>, namespace: &str, name: &str) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: format!("{}/{}", namespace, name),
        }
    }

    /// Create a mismatch error naming the field and both values
    pub fn mismatch(
        field: impl Into<String>,
        expected: impl std::fmt::Display,
        observed: impl std::fmt::Display,
    ) -> Self {
        Self::Mismatch {
            field: field.into(),
            expected: expected.to_string(),
            observed: observed.to_string(),
        }
    }

    /// Create a teardown error with the given message
    pub fn teardown(msg: impl Into<String>) -> Self {
        Self::Teardown {
            message: msg.into(),
        }
    }

    /// Create a configuration error with the given message
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config {
            message: msg.into(),
        }
    }

    /// Create a cluster error for a terminal cluster state
    pub fn cluster(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Cluster {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a command error with the given message
    pub fn command(command: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Command {
            command: command.into(),
            message: msg.into(),
        }
    }

    /// Whether a polling loop may retry after this error
    ///
    /// Only absence is transient; everything else means the request itself
    /// is wrong or the system reached a terminal state.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // ==========================================================================
    // Story Tests: Failure Reporting in Verification Runs
    // ==========================================================================

    /// Story: a replica mismatch tells the operator exactly what diverged
    #[test]
    fn story_mismatch_names_field_and_both_values() {
        let err = Error::mismatch("replicas", 1, 2);
        assert_eq!(
            err.to_string(),
            "mismatch on replicas: expected 1, observed 2"
        );

        match err {
            Error::Mismatch {
                field,
                expected,
                observed,
            } => {
                assert_eq!(field, "replicas");
                assert_eq!(expected, "1");
                assert_eq!(observed, "2");
            }
            _ => panic!("Expected Mismatch variant"),
        }
    }

    /// Story: a poll timeout carries the last reason it saw
    #[test]
    fn story_timeout_keeps_last_reason() {
        let err = Error::timeout("pod count", 30, "expected 1 pods, found 0");
        let msg = err.to_string();
        assert!(msg.contains("pod count"));
        assert!(msg.contains("30 attempts"));
        assert!(msg.contains("found 0"));
    }

    /// Story: the run deadline names the interrupted check
    #[test]
    fn story_deadline_names_interrupted_check() {
        let err = Error::deadline("pod readiness", std::time::Duration::from_secs(45 * 60));
        assert_eq!(
            err.to_string(),
            "run deadline of 45m exceeded during pod readiness"
        );
        assert!(!err.is_retryable());
    }

    /// Story: provisioning failures identify the terraform stage
    #[test]
    fn story_provision_error_names_stage() {
        let err = Error::provision("apply", "Error: creating EKS Cluster: AccessDenied");
        assert!(err.to_string().starts_with("provision error [apply]"));
        assert!(err.to_string().contains("AccessDenied"));
    }

    /// Story: namespaced lookups report the qualified name
    #[test]
    fn story_not_found_qualifies_namespaced_names() {
        let err = Error::not_found_in("Service", "postgres-security", "postgres-security");
        assert_eq!(
            err.to_string(),
            "Service not found: postgres-security/postgres-security"
        );

        let err = Error::not_found("Namespace", "postgres-security");
        assert_eq!(err.to_string(), "Namespace not found: postgres-security");
    }

    /// Story: only absence is retryable
    #[test]
    fn story_only_not_found_is_retryable() {
        assert!(Error::not_found("Namespace", "ns").is_retryable());
        assert!(!Error::mismatch("replicas", 1, 2).is_retryable());
        assert!(!Error::provision("apply", "boom").is_retryable());
        assert!(!Error::cluster("eks", "status FAILED").is_retryable());
        assert!(!Error::config("bad").is_retryable());
        assert!(!Error::command("aws", "malformed request").is_retryable());
    }
}
