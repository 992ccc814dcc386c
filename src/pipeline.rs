//! Run orchestration
//!
//! A run moves through a fixed sequence of states:
//!
//! ```text
//! Init -> Provisioned -> ClusterReady -> Verifying -> Passed | Failed -> Teardown -> Done
//! ```
//!
//! Any failure before `Passed` jumps straight to `Failed`. Whatever happens
//! between apply and the verdict (errors, the run deadline, a panic in a
//! collaborator), destroy is invoked exactly once afterwards. A teardown
//! failure is reported next to the verdict and never replaces it.

use std::fmt;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::cluster::{wait_for_cluster, ClusterReadiness, EksCluster};
use crate::config::HarnessConfig;
use crate::provisioner::{Provisioner, StackConfig, StackOutputs, TerraformProvisioner};
use crate::resources::{KubeResourceReader, ResourceReader};
use crate::verify::{project_labels, ObservedResourceState, ResourceVerifier};
use crate::{Error, Result};

/// The individual checks of a run, in execution order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Check {
    /// Applying the stack
    Provision,
    /// Resolving names from stack outputs
    Outputs,
    /// Waiting for the compute cluster
    ClusterReady,
    /// Namespace existence
    Namespace,
    /// StatefulSet replicas
    StatefulSet,
    /// Number of pods matching the selector
    PodCount,
    /// Every selected pod available
    PodReady,
    /// NetworkPolicy existence
    NetworkPolicy,
    /// Service first port
    Service,
}

impl fmt::Display for Check {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Check::Provision => "provision",
            Check::Outputs => "output resolution",
            Check::ClusterReady => "cluster readiness",
            Check::Namespace => "namespace",
            Check::StatefulSet => "stateful set",
            Check::PodCount => "pod count",
            Check::PodReady => "pod readiness",
            Check::NetworkPolicy => "network policy",
            Check::Service => "service",
        };
        f.write_str(name)
    }
}

/// Lifecycle state of a run
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RunState {
    /// Nothing done yet
    Init,
    /// Stack applied, outputs available
    Provisioned,
    /// Compute cluster active
    ClusterReady,
    /// Resource checks in progress
    Verifying,
    /// Every check passed
    Passed,
    /// A check failed
    Failed,
    /// Destroying the stack
    Teardown,
    /// Terminal
    Done,
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// Result of the checks, independent of teardown
#[derive(Debug)]
pub enum Verdict {
    /// Every check passed; carries what was observed
    Passed(ObservedResourceState),
    /// The first check that failed and why
    Failed {
        /// Failed check
        check: Check,
        /// Cause
        error: Error,
    },
}

/// Whether destroy completed
#[derive(Debug)]
pub enum TeardownStatus {
    /// Stack destroyed
    Completed,
    /// Destroy failed; resources may be left behind
    Failed(Error),
}

impl TeardownStatus {
    /// Destroy completed
    pub fn is_completed(&self) -> bool {
        matches!(self, TeardownStatus::Completed)
    }
}

/// Outcome of one run
#[derive(Debug)]
pub struct RunOutcome {
    /// Run name
    pub run: String,
    /// Verdict of the checks
    pub verdict: Verdict,
    /// Teardown result
    pub teardown: TeardownStatus,
    /// States visited, in order
    pub states: Vec<RunState>,
}

impl RunOutcome {
    /// Every check passed
    pub fn passed(&self) -> bool {
        matches!(self.verdict, Verdict::Passed(_))
    }

    /// The first violated expectation, if any
    pub fn failed_check(&self) -> Option<(Check, &Error)> {
        match &self.verdict {
            Verdict::Passed(_) => None,
            Verdict::Failed { check, error } => Some((*check, error)),
        }
    }

    /// Process exit code.
    ///
    /// `0` passed, `1` failed, `2` passed but teardown failed, `3` failed and
    /// teardown failed.
    pub fn exit_code(&self) -> u8 {
        match (self.passed(), self.teardown.is_completed()) {
            (true, true) => 0,
            (false, true) => 1,
            (true, false) => 2,
            (false, false) => 3,
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.verdict {
            Verdict::Passed(_) => write!(f, "{}: PASSED", self.run)?,
            Verdict::Failed { check, error } => {
                write!(f, "{}: FAILED at {}: {}", self.run, check, error)?
            }
        }
        match &self.teardown {
            TeardownStatus::Completed => write!(f, " (teardown completed)"),
            TeardownStatus::Failed(e) => write!(f, " (teardown FAILED: {})", e),
        }
    }
}

/// A failed check with its cause
struct Failure {
    check: Check,
    error: Error,
}

impl Failure {
    fn at(check: Check) -> impl FnOnce(Error) -> Failure {
        move |error| Failure { check, error }
    }

    fn deadline(check: Check, limit: Duration) -> Failure {
        Failure {
            check,
            error: Error::deadline(check.to_string(), limit),
        }
    }
}

/// Mutable run bookkeeping shared between verification and teardown
struct Progress {
    run: String,
    states: Vec<RunState>,
    current: Check,
}

impl Progress {
    fn new(run: &str) -> Self {
        Self {
            run: run.to_string(),
            states: vec![RunState::Init],
            current: Check::Provision,
        }
    }

    fn enter(&mut self, state: RunState) {
        info!(run = %self.run, state = %state, "Run state changed");
        self.states.push(state);
    }

    fn begin(&mut self, check: Check) {
        debug!(run = %self.run, check = %check, "Starting check");
        self.current = check;
    }
}

/// Drives one harness through apply, readiness, verification and teardown
pub struct Pipeline {
    provisioner: Arc<dyn Provisioner>,
    cluster: Arc<dyn ClusterReadiness>,
    reader: Arc<dyn ResourceReader>,
}

impl Pipeline {
    /// Create a pipeline over explicit collaborators
    pub fn new(
        provisioner: Arc<dyn Provisioner>,
        cluster: Arc<dyn ClusterReadiness>,
        reader: Arc<dyn ResourceReader>,
    ) -> Self {
        Self {
            provisioner,
            cluster,
            reader,
        }
    }

    /// Production collaborators for a harness: terraform, EKS and a lazily
    /// connected kube client
    pub fn for_harness(config: &HarnessConfig) -> Result<Self> {
        let provisioner = TerraformProvisioner::from_section(&config.stack)?;
        let reader = KubeResourceReader::lazy(
            config.kubernetes.kubeconfig.clone(),
            config.kubernetes.context.clone(),
        );
        Ok(Self::new(
            Arc::new(provisioner),
            Arc::new(EksCluster::default()),
            Arc::new(reader),
        ))
    }

    /// Execute one run to completion.
    ///
    /// Never returns early without tearing down. A panic raised by a
    /// collaborator is re-raised after teardown.
    pub async fn run(&self, config: &HarnessConfig) -> RunOutcome {
        match self.run_guarded(config).await {
            Ok(outcome) => outcome,
            Err(payload) => std::panic::resume_unwind(payload),
        }
    }

    /// Execute one run, handing back a collaborator panic instead of raising
    /// it. Teardown has finished by the time this returns either way.
    async fn run_guarded(&self, config: &HarnessConfig) -> std::thread::Result<RunOutcome> {
        let stack = config.stack_config();
        let mut progress = Progress::new(&config.name);

        info!(
            run = %config.name,
            dir = %stack.dir().display(),
            timeout = ?config.timeout,
            "Starting verification run"
        );

        let verdict = AssertUnwindSafe(self.check(config, &stack, &mut progress))
            .catch_unwind()
            .await
            .map(|checked| match checked {
                Ok(observed) => Verdict::Passed(observed),
                Err(failure) => Verdict::Failed {
                    check: failure.check,
                    error: failure.error,
                },
            });

        match &verdict {
            Ok(Verdict::Passed(_)) => {
                info!(run = %config.name, "All checks passed");
                progress.enter(RunState::Passed);
            }
            Ok(Verdict::Failed { check, error }) => {
                error!(run = %config.name, check = %check, error = %error, "Verification failed");
                progress.enter(RunState::Failed);
            }
            Err(_) => {
                error!(run = %config.name, check = %progress.current, "Run panicked, tearing down before re-raising");
                progress.enter(RunState::Failed);
            }
        }

        progress.enter(RunState::Teardown);
        let teardown = AssertUnwindSafe(self.teardown(&config.name, &stack))
            .catch_unwind()
            .await;
        progress.enter(RunState::Done);

        let verdict = verdict?;
        Ok(RunOutcome {
            run: config.name.clone(),
            verdict,
            teardown: teardown?,
            states: progress.states,
        })
    }

    /// Apply, then verify within whatever is left of the run deadline.
    ///
    /// Apply itself is never interrupted: a killed provisioner can leave
    /// unrecorded resources or a held state lock behind, which destroy cannot
    /// clean up. It stays bounded by the provisioner's command timeout, and a
    /// deadline that passes during apply fails the run once apply returns.
    async fn check(
        &self,
        config: &HarnessConfig,
        stack: &StackConfig,
        progress: &mut Progress,
    ) -> std::result::Result<ObservedResourceState, Failure> {
        let started = Instant::now();

        progress.begin(Check::Provision);
        let outputs = self
            .provisioner
            .apply(stack)
            .await
            .map_err(Failure::at(Check::Provision))?;

        let remaining = match config.timeout {
            Some(limit) => match limit.checked_sub(started.elapsed()) {
                Some(remaining) if !remaining.is_zero() => Some((limit, remaining)),
                _ => {
                    warn!(run = %config.name, "Run deadline passed while the stack was applying");
                    return Err(Failure::deadline(Check::Provision, limit));
                }
            },
            None => None,
        };
        info!(run = %config.name, outputs = outputs.len(), "Stack applied");
        progress.enter(RunState::Provisioned);

        match remaining {
            Some((limit, remaining)) => {
                let verified =
                    tokio::time::timeout(remaining, self.verify(config, &outputs, &mut *progress))
                        .await;
                verified.unwrap_or_else(|_| Err(Failure::deadline(progress.current, limit)))
            }
            None => self.verify(config, &outputs, progress).await,
        }
    }

    async fn verify(
        &self,
        config: &HarnessConfig,
        outputs: &StackOutputs,
        progress: &mut Progress,
    ) -> std::result::Result<ObservedResourceState, Failure> {
        progress.begin(Check::Outputs);
        let cluster = config
            .cluster
            .name
            .resolve(outputs)
            .map_err(Failure::at(Check::Outputs))?;
        let expected = config
            .expect
            .resolve(outputs)
            .map_err(Failure::at(Check::Outputs))?;

        progress.begin(Check::ClusterReady);
        wait_for_cluster(
            self.cluster.as_ref(),
            &cluster,
            &config.cluster.region,
            &config.cluster.poll,
        )
        .await
        .map_err(Failure::at(Check::ClusterReady))?;
        progress.enter(RunState::ClusterReady);

        progress.enter(RunState::Verifying);
        let verifier = ResourceVerifier::new(self.reader.as_ref(), config.polling);

        progress.begin(Check::Namespace);
        let namespace = verifier
            .check_namespace(&expected)
            .await
            .map_err(Failure::at(Check::Namespace))?;

        progress.begin(Check::StatefulSet);
        let stateful_set = verifier
            .check_stateful_set(&expected)
            .await
            .map_err(Failure::at(Check::StatefulSet))?;

        progress.begin(Check::PodCount);
        let pods = verifier
            .wait_for_pod_count(&expected)
            .await
            .map_err(Failure::at(Check::PodCount))?;

        progress.begin(Check::PodReady);
        for pod in &pods {
            verifier
                .wait_for_pod_available(&expected.namespace, &pod.name)
                .await
                .map_err(Failure::at(Check::PodReady))?;
        }

        progress.begin(Check::NetworkPolicy);
        let policy = verifier
            .check_network_policy(&expected)
            .await
            .map_err(Failure::at(Check::NetworkPolicy))?;

        progress.begin(Check::Service);
        let service = verifier
            .check_service(&expected)
            .await
            .map_err(Failure::at(Check::Service))?;

        Ok(ObservedResourceState {
            namespace: namespace.name,
            replicas: stateful_set.replicas,
            pod_labels: pods
                .first()
                .map(|pod| project_labels(&pod.labels, &expected.pod_labels))
                .unwrap_or_default(),
            pod_count: pods.len(),
            network_policy: policy.name,
            service_port: service.first_port().unwrap_or_default(),
        })
    }

    async fn teardown(&self, run: &str, stack: &StackConfig) -> TeardownStatus {
        info!(run = %run, dir = %stack.dir().display(), "Destroying stack");
        match self.provisioner.destroy(stack).await {
            Ok(()) => {
                info!(run = %run, "Stack destroyed");
                TeardownStatus::Completed
            }
            Err(e) => {
                let e = match e {
                    Error::Teardown { .. } => e,
                    other => Error::teardown(other.to_string()),
                };
                error!(
                    run = %run,
                    dir = %stack.dir().display(),
                    error = %e,
                    "Teardown failed, stack resources may be orphaned"
                );
                TeardownStatus::Failed(e)
            }
        }
    }
}

/// Execute several runs concurrently.
///
/// Runs are independent; two runs expecting the same literal namespace are
/// allowed but logged since their checks can observe each other. A panic in
/// one run is re-raised only after every run has been torn down.
pub async fn run_all(runs: &[(HarnessConfig, Pipeline)]) -> Vec<RunOutcome> {
    let mut seen: Vec<(&str, &str)> = Vec::new();
    for (config, _) in runs {
        if let Some(ns) = config.literal_namespace() {
            if let Some((other, _)) = seen.iter().find(|(_, n)| *n == ns) {
                warn!(
                    namespace = %ns,
                    first = %other,
                    second = %config.name,
                    "Runs share a namespace and may interfere"
                );
            }
            seen.push((&config.name, ns));
        }
    }

    let results =
        futures::future::join_all(runs.iter().map(|(config, pipeline)| pipeline.run_guarded(config)))
            .await;

    let mut outcomes = Vec::with_capacity(results.len());
    let mut panic = None;
    for result in results {
        match result {
            Ok(outcome) => outcomes.push(outcome),
            Err(payload) => {
                panic.get_or_insert(payload);
            }
        }
    }
    if let Some(payload) = panic {
        std::panic::resume_unwind(payload);
    }
    outcomes
}
