//! Expected vs observed resource verification
//!
//! Each check fetches one resource kind and compares the attributes that
//! matter with exact equality. A difference produces [`Error::Mismatch`]
//! naming the field and both values.
//!
//! Checks run in dependency order: namespace, stateful set, pod count
//! (polled), pod availability (polled), network policy, service.

use std::collections::BTreeMap;
use std::fmt::Display;

use tracing::{debug, info};

use crate::config::PollingSection;
use crate::poll::{poll_until_ready, PollFailure};
use crate::resources::{
    label_selector, ObservedNamespace, ObservedNetworkPolicy, ObservedPod, ObservedService,
    ObservedStatefulSet, ResourceReader, NAMESPACE_PHASE_TERMINATING,
};
use crate::{Error, Result};

/// The contract the live system must satisfy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ExpectedResourceState {
    /// Namespace name
    pub namespace: String,
    /// StatefulSet name
    pub stateful_set: String,
    /// StatefulSet replica count
    pub replicas: i32,
    /// Pod label selector
    pub pod_labels: BTreeMap<String, String>,
    /// Number of pods matching the selector
    pub pod_count: usize,
    /// NetworkPolicy name
    pub network_policy: String,
    /// Service name
    pub service: String,
    /// First service port
    pub service_port: i32,
}

/// Live counterpart of [`ExpectedResourceState`], assembled as checks pass.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObservedResourceState {
    /// Namespace name
    pub namespace: String,
    /// StatefulSet replica count
    pub replicas: i32,
    /// Pod labels, restricted to the selector's keys
    pub pod_labels: BTreeMap<String, String>,
    /// Number of pods matching the selector
    pub pod_count: usize,
    /// NetworkPolicy name
    pub network_policy: String,
    /// First service port
    pub service_port: i32,
}

/// Exact equality on one field
pub fn expect_eq<T>(field: &str, expected: &T, observed: &T) -> Result<()>
where
    T: PartialEq + Display + ?Sized,
{
    if expected == observed {
        Ok(())
    } else {
        Err(Error::mismatch(field, expected, observed))
    }
}

/// Labels rendered for mismatch messages
struct Labels<'a>(&'a BTreeMap<String, String>);

impl Display for Labels<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{{{}}}", label_selector(self.0))
    }
}

impl PartialEq for Labels<'_> {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

/// Compare every enumerated field, in check order.
///
/// Succeeds iff all fields are equal; otherwise names the first differing
/// field.
pub fn compare(expected: &ExpectedResourceState, observed: &ObservedResourceState) -> Result<()> {
    expect_eq("namespace", expected.namespace.as_str(), observed.namespace.as_str())?;
    expect_eq("replicas", &expected.replicas, &observed.replicas)?;
    expect_eq(
        "pod_labels",
        &Labels(&expected.pod_labels),
        &Labels(&observed.pod_labels),
    )?;
    expect_eq("pod_count", &expected.pod_count, &observed.pod_count)?;
    expect_eq(
        "network_policy",
        expected.network_policy.as_str(),
        observed.network_policy.as_str(),
    )?;
    expect_eq("service_port", &expected.service_port, &observed.service_port)?;
    Ok(())
}

/// Restrict `labels` to the keys of `selector`
pub(crate) fn project_labels(
    labels: &BTreeMap<String, String>,
    selector: &BTreeMap<String, String>,
) -> BTreeMap<String, String> {
    labels
        .iter()
        .filter(|(k, _)| selector.contains_key(*k))
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}

/// Runs the individual resource checks against a [`ResourceReader`]
pub struct ResourceVerifier<'a> {
    reader: &'a dyn ResourceReader,
    polling: PollingSection,
}

impl<'a> ResourceVerifier<'a> {
    /// Create a verifier with the given polling budgets
    pub fn new(reader: &'a dyn ResourceReader, polling: PollingSection) -> Self {
        Self { reader, polling }
    }

    // =========================================================================
    // Fetch: absence becomes NotFound
    // =========================================================================

    /// Fetch a Namespace
    pub async fn fetch_namespace(&self, name: &str) -> Result<ObservedNamespace> {
        self.reader
            .namespace(name)
            .await?
            .ok_or_else(|| Error::not_found("Namespace", name))
    }

    /// Fetch a StatefulSet
    pub async fn fetch_stateful_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ObservedStatefulSet> {
        self.reader
            .stateful_set(namespace, name)
            .await?
            .ok_or_else(|| Error::not_found_in("StatefulSet", namespace, name))
    }

    /// Fetch a Pod
    pub async fn fetch_pod(&self, namespace: &str, name: &str) -> Result<ObservedPod> {
        self.reader
            .pod(namespace, name)
            .await?
            .ok_or_else(|| Error::not_found_in("Pod", namespace, name))
    }

    /// Fetch a NetworkPolicy
    pub async fn fetch_network_policy(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<ObservedNetworkPolicy> {
        self.reader
            .network_policy(namespace, name)
            .await?
            .ok_or_else(|| Error::not_found_in("NetworkPolicy", namespace, name))
    }

    /// Fetch a Service
    pub async fn fetch_service(&self, namespace: &str, name: &str) -> Result<ObservedService> {
        self.reader
            .service(namespace, name)
            .await?
            .ok_or_else(|| Error::not_found_in("Service", namespace, name))
    }

    // =========================================================================
    // Checks
    // =========================================================================

    /// The namespace exists under the expected name
    pub async fn check_namespace(&self, expected: &ExpectedResourceState) -> Result<ObservedNamespace> {
        let ns = self.fetch_namespace(&expected.namespace).await?;
        expect_eq("namespace", expected.namespace.as_str(), ns.name.as_str())?;
        if ns.is_terminating() {
            return Err(Error::mismatch(
                "namespace_phase",
                "Active",
                NAMESPACE_PHASE_TERMINATING,
            ));
        }
        info!(namespace = %ns.name, phase = ?ns.phase, "Namespace exists");
        Ok(ns)
    }

    /// The stateful set exists with exactly the expected replica count
    pub async fn check_stateful_set(
        &self,
        expected: &ExpectedResourceState,
    ) -> Result<ObservedStatefulSet> {
        let sts = self
            .fetch_stateful_set(&expected.namespace, &expected.stateful_set)
            .await?;
        expect_eq("replicas", &expected.replicas, &sts.replicas)?;
        info!(
            stateful_set = %sts.name,
            replicas = sts.replicas,
            ready_replicas = sts.ready_replicas,
            "StatefulSet matches"
        );
        Ok(sts)
    }

    /// Poll until exactly the expected number of pods match the selector
    pub async fn wait_for_pod_count(
        &self,
        expected: &ExpectedResourceState,
    ) -> Result<Vec<ObservedPod>> {
        let selector = label_selector(&expected.pod_labels);

        let pods = poll_until_ready(&self.polling.pod_count, "pod count", || async {
            let pods = self
                .reader
                .pods(&expected.namespace, &expected.pod_labels)
                .await?;
            if pods.len() == expected.pod_count {
                Ok(pods)
            } else {
                Err(PollFailure::retry(format!(
                    "expected {} pods matching {}, found {}",
                    expected.pod_count,
                    selector,
                    pods.len()
                )))
            }
        })
        .await?;

        for pod in &pods {
            let observed = project_labels(&pod.labels, &expected.pod_labels);
            expect_eq(
                "pod_labels",
                &Labels(&expected.pod_labels),
                &Labels(&observed),
            )?;
        }
        expect_eq("pod_count", &expected.pod_count, &pods.len())?;

        info!(selector = %selector, count = pods.len(), "Pods created");
        Ok(pods)
    }

    /// Poll until the named pod is running with every container ready
    pub async fn wait_for_pod_available(&self, namespace: &str, name: &str) -> Result<ObservedPod> {
        let pod = poll_until_ready(&self.polling.pod_ready, "pod readiness", || async {
            let pod = self.fetch_pod(namespace, name).await?;
            if pod.is_available() {
                Ok(pod)
            } else {
                debug!(pod = %name, reason = %pod.unavailable_reason(), "Pod not available yet");
                Err(PollFailure::retry(pod.unavailable_reason()))
            }
        })
        .await?;

        info!(pod = %pod.name, "Pod available");
        Ok(pod)
    }

    /// The network policy exists
    pub async fn check_network_policy(
        &self,
        expected: &ExpectedResourceState,
    ) -> Result<ObservedNetworkPolicy> {
        let policy = self
            .fetch_network_policy(&expected.namespace, &expected.network_policy)
            .await?;
        expect_eq(
            "network_policy",
            expected.network_policy.as_str(),
            policy.name.as_str(),
        )?;
        info!(
            network_policy = %policy.name,
            policy_types = ?policy.policy_types,
            "NetworkPolicy exists"
        );
        Ok(policy)
    }

    /// The service exists and its first port is the expected one
    pub async fn check_service(&self, expected: &ExpectedResourceState) -> Result<ObservedService> {
        let svc = self
            .fetch_service(&expected.namespace, &expected.service)
            .await?;
        let port = svc.first_port().ok_or_else(|| {
            Error::mismatch("service_port", expected.service_port, "no ports declared")
        })?;
        expect_eq("service_port", &expected.service_port, &port)?;
        info!(service = %svc.name, port, "Service matches");
        Ok(svc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::poll::PollPolicy;
    use crate::resources::MockResourceReader;
    use rstest::rstest;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    fn expected() -> ExpectedResourceState {
        ExpectedResourceState {
            namespace: "postgres-security".to_string(),
            stateful_set: "postgres-security".to_string(),
            replicas: 1,
            pod_labels: BTreeMap::from([("app".to_string(), "postgres-security".to_string())]),
            pod_count: 1,
            network_policy: "postgres-security-network-policy".to_string(),
            service: "postgres-security".to_string(),
            service_port: 5432,
        }
    }

    fn observed() -> ObservedResourceState {
        ObservedResourceState {
            namespace: "postgres-security".to_string(),
            replicas: 1,
            pod_labels: BTreeMap::from([("app".to_string(), "postgres-security".to_string())]),
            pod_count: 1,
            network_policy: "postgres-security-network-policy".to_string(),
            service_port: 5432,
        }
    }

    fn polling() -> PollingSection {
        PollingSection {
            pod_count: PollPolicy::new(30, Duration::from_secs(10)),
            pod_ready: PollPolicy::new(10, Duration::from_secs(5)),
        }
    }

    fn pod(phase: &str, ready: bool) -> ObservedPod {
        ObservedPod {
            name: "postgres-security-0".to_string(),
            labels: BTreeMap::from([
                ("app".to_string(), "postgres-security".to_string()),
                ("controller-revision-hash".to_string(), "abc123".to_string()),
            ]),
            phase: Some(phase.to_string()),
            containers: 1,
            ready_containers: usize::from(ready),
        }
    }

    mod compare_fields {
        use super::*;

        #[test]
        fn matching_state_passes() {
            assert!(compare(&expected(), &observed()).is_ok());
        }

        #[rstest]
        #[case::namespace("namespace", |o: &mut ObservedResourceState| o.namespace = "default".to_string())]
        #[case::replicas("replicas", |o: &mut ObservedResourceState| o.replicas = 2)]
        #[case::pod_labels("pod_labels", |o: &mut ObservedResourceState| {
            o.pod_labels.insert("app".to_string(), "other".to_string());
        })]
        #[case::pod_count("pod_count", |o: &mut ObservedResourceState| o.pod_count = 0)]
        #[case::network_policy("network_policy", |o: &mut ObservedResourceState| {
            o.network_policy = "allow-all".to_string()
        })]
        #[case::service_port("service_port", |o: &mut ObservedResourceState| o.service_port = 5433)]
        fn single_field_change_names_that_field(
            #[case] field: &str,
            #[case] mutate: fn(&mut ObservedResourceState),
        ) {
            let mut obs = observed();
            mutate(&mut obs);

            match compare(&expected(), &obs) {
                Err(Error::Mismatch { field: got, .. }) => assert_eq!(got, field),
                other => panic!("Expected Mismatch on {field}, got {other:?}"),
            }
        }

        #[test]
        fn replica_mismatch_reports_both_values() {
            let mut obs = observed();
            obs.replicas = 2;
            let err = compare(&expected(), &obs).unwrap_err();
            assert_eq!(err.to_string(), "mismatch on replicas: expected 1, observed 2");
        }

        #[test]
        fn label_mismatch_renders_selectors() {
            let mut obs = observed();
            obs.pod_labels.insert("tier".to_string(), "db".to_string());
            let err = compare(&expected(), &obs).unwrap_err();
            assert_eq!(
                err.to_string(),
                "mismatch on pod_labels: expected {app=postgres-security}, observed {app=postgres-security,tier=db}"
            );
        }
    }

    mod checks {
        use super::*;

        #[tokio::test]
        async fn missing_namespace_is_not_found() {
            let mut reader = MockResourceReader::new();
            reader.expect_namespace().times(1).returning(|_| Ok(None));

            let verifier = ResourceVerifier::new(&reader, polling());
            let err = verifier.check_namespace(&expected()).await.unwrap_err();
            assert!(matches!(err, Error::NotFound { ref kind, .. } if kind == "Namespace"));
        }

        #[tokio::test]
        async fn terminating_namespace_fails() {
            let mut reader = MockResourceReader::new();
            reader.expect_namespace().times(1).returning(|name| {
                Ok(Some(ObservedNamespace {
                    name: name.to_string(),
                    phase: Some("Terminating".to_string()),
                }))
            });

            let verifier = ResourceVerifier::new(&reader, polling());
            let err = verifier.check_namespace(&expected()).await.unwrap_err();
            assert_eq!(
                err.to_string(),
                "mismatch on namespace_phase: expected Active, observed Terminating"
            );
        }

        #[tokio::test]
        async fn active_namespace_passes() {
            let mut reader = MockResourceReader::new();
            reader.expect_namespace().times(1).returning(|name| {
                Ok(Some(ObservedNamespace {
                    name: name.to_string(),
                    phase: Some("Active".to_string()),
                }))
            });

            let verifier = ResourceVerifier::new(&reader, polling());
            let ns = verifier.check_namespace(&expected()).await.unwrap();
            assert_eq!(ns.name, "postgres-security");
        }

        #[tokio::test]
        async fn stateful_set_replica_mismatch() {
            let mut reader = MockResourceReader::new();
            reader.expect_stateful_set().returning(|_, name| {
                Ok(Some(ObservedStatefulSet {
                    name: name.to_string(),
                    replicas: 2,
                    ready_replicas: 2,
                }))
            });

            let verifier = ResourceVerifier::new(&reader, polling());
            let err = verifier.check_stateful_set(&expected()).await.unwrap_err();
            assert!(matches!(err, Error::Mismatch { ref field, .. } if field == "replicas"));
        }

        #[tokio::test(start_paused = true)]
        async fn pod_count_is_polled_until_scheduled() {
            let calls = Arc::new(AtomicU32::new(0));
            let c = calls.clone();

            let mut reader = MockResourceReader::new();
            reader.expect_pods().returning(move |_, _| {
                if c.fetch_add(1, Ordering::SeqCst) < 4 {
                    Ok(vec![])
                } else {
                    Ok(vec![pod("Pending", false)])
                }
            });

            let verifier = ResourceVerifier::new(&reader, polling());
            let pods = verifier.wait_for_pod_count(&expected()).await.unwrap();
            assert_eq!(pods.len(), 1);
            assert_eq!(calls.load(Ordering::SeqCst), 5);
        }

        #[tokio::test(start_paused = true)]
        async fn pod_count_times_out_with_last_count() {
            let mut reader = MockResourceReader::new();
            reader.expect_pods().times(30).returning(|_, _| Ok(vec![]));

            let verifier = ResourceVerifier::new(&reader, polling());
            let err = verifier.wait_for_pod_count(&expected()).await.unwrap_err();
            match err {
                Error::Timeout {
                    check, last_reason, ..
                } => {
                    assert_eq!(check, "pod count");
                    assert!(last_reason.contains("found 0"));
                }
                other => panic!("Expected Timeout, got {other:?}"),
            }
        }

        #[tokio::test(start_paused = true)]
        async fn pod_lookup_failure_is_fatal_during_polling() {
            let mut reader = MockResourceReader::new();
            reader
                .expect_pods()
                .times(1)
                .returning(|_, _| Err(Error::command("list pods", "invalid label selector")));

            let verifier = ResourceVerifier::new(&reader, polling());
            let err = verifier.wait_for_pod_count(&expected()).await.unwrap_err();
            assert!(matches!(err, Error::Command { .. }));
        }

        #[tokio::test(start_paused = true)]
        async fn pod_readiness_retries_absent_and_pending_pods() {
            let calls = Arc::new(AtomicU32::new(0));
            let c = calls.clone();

            let mut reader = MockResourceReader::new();
            reader.expect_pod().returning(move |_, _| {
                match c.fetch_add(1, Ordering::SeqCst) {
                    0 => Ok(None),
                    1 => Ok(Some(pod("Pending", false))),
                    _ => Ok(Some(pod("Running", true))),
                }
            });

            let verifier = ResourceVerifier::new(&reader, polling());
            let pod = verifier
                .wait_for_pod_available("postgres-security", "postgres-security-0")
                .await
                .unwrap();
            assert!(pod.is_available());
            assert_eq!(calls.load(Ordering::SeqCst), 3);
        }

        #[tokio::test(start_paused = true)]
        async fn pod_never_ready_reports_state() {
            let mut reader = MockResourceReader::new();
            reader
                .expect_pod()
                .times(10)
                .returning(|_, _| Ok(Some(pod("Running", false))));

            let verifier = ResourceVerifier::new(&reader, polling());
            let err = verifier
                .wait_for_pod_available("postgres-security", "postgres-security-0")
                .await
                .unwrap_err();
            assert!(err.to_string().contains("0/1 containers ready"));
        }

        #[tokio::test]
        async fn service_port_compares_first_port() {
            let mut reader = MockResourceReader::new();
            reader.expect_service().returning(|_, name| {
                Ok(Some(ObservedService {
                    name: name.to_string(),
                    ports: vec![5433, 5432],
                }))
            });

            let verifier = ResourceVerifier::new(&reader, polling());
            let err = verifier.check_service(&expected()).await.unwrap_err();
            assert_eq!(
                err.to_string(),
                "mismatch on service_port: expected 5432, observed 5433"
            );
        }

        #[tokio::test]
        async fn service_without_ports_is_a_mismatch() {
            let mut reader = MockResourceReader::new();
            reader.expect_service().returning(|_, name| {
                Ok(Some(ObservedService {
                    name: name.to_string(),
                    ports: vec![],
                }))
            });

            let verifier = ResourceVerifier::new(&reader, polling());
            let err = verifier.check_service(&expected()).await.unwrap_err();
            assert!(err.to_string().contains("no ports declared"));
        }

        #[tokio::test]
        async fn network_policy_must_exist() {
            let mut reader = MockResourceReader::new();
            reader.expect_network_policy().returning(|_, _| Ok(None));

            let verifier = ResourceVerifier::new(&reader, polling());
            let err = verifier.check_network_policy(&expected()).await.unwrap_err();
            assert_eq!(
                err.to_string(),
                "NetworkPolicy not found: postgres-security/postgres-security-network-policy"
            );
        }
    }
}
