//! kube-rs backed resource reader

use std::collections::BTreeMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::StatefulSet;
use k8s_openapi::api::core::v1::{Namespace, Pod, Service};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use kube::api::{Api, ListParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::{Client, Config};
use serde::de::DeserializeOwned;
use tokio::sync::OnceCell;
use tracing::{debug, trace};

use super::{
    label_selector, ObservedNamespace, ObservedNetworkPolicy, ObservedPod, ObservedService,
    ObservedStatefulSet, ResourceReader,
};
use crate::{Error, Result};

/// Default connection timeout for kube clients
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default read timeout for kube clients
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);

/// Reads resources through a kube-rs [`Client`]
///
/// The client is created on first use: for stacks that create the cluster
/// itself, the kubeconfig only becomes usable after apply.
pub struct KubeResourceReader {
    kubeconfig: Option<PathBuf>,
    context: Option<String>,
    client: OnceCell<Client>,
}

impl KubeResourceReader {
    /// Wrap an existing client
    pub fn new(client: Client) -> Self {
        Self {
            kubeconfig: None,
            context: None,
            client: OnceCell::new_with(Some(client)),
        }
    }

    /// Connect lazily using an optional kubeconfig path and context.
    ///
    /// With neither set, configuration is inferred the usual way
    /// (`KUBECONFIG`, `~/.kube/config`, in-cluster).
    pub fn lazy(kubeconfig: Option<PathBuf>, context: Option<String>) -> Self {
        Self {
            kubeconfig,
            context,
            client: OnceCell::new(),
        }
    }

    async fn client(&self) -> Result<Client> {
        self.client
            .get_or_try_init(|| connect(self.kubeconfig.as_deref(), self.context.as_deref()))
            .await
            .cloned()
    }
}

/// Build a client from an optional kubeconfig path and context
async fn connect(kubeconfig: Option<&Path>, context: Option<&str>) -> Result<Client> {
    let options = KubeConfigOptions {
        context: context.map(str::to_string),
        ..Default::default()
    };

    let mut config = match (kubeconfig, context) {
        (Some(path), _) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::config(format!(
                    "failed to read kubeconfig {}: {}",
                    path.display(),
                    e
                ))
            })?;
            Config::from_custom_kubeconfig(kubeconfig, &options)
                .await
                .map_err(|e| Error::config(format!("failed to load kubeconfig: {}", e)))?
        }
        (None, Some(_)) => Config::from_kubeconfig(&options)
            .await
            .map_err(|e| Error::config(format!("failed to load kubeconfig: {}", e)))?,
        (None, None) => Config::infer()
            .await
            .map_err(|e| Error::config(format!("failed to infer kube config: {}", e)))?,
    };
    config.connect_timeout = Some(DEFAULT_CONNECT_TIMEOUT);
    config.read_timeout = Some(DEFAULT_READ_TIMEOUT);

    debug!(context = ?context, "Kubernetes client configured");
    Ok(Client::try_from(config)?)
}

/// Get an object, mapping 404 to `None`
async fn get_optional<K>(api: &Api<K>, name: &str) -> Result<Option<K>>
where
    K: Clone + DeserializeOwned + Debug,
{
    match api.get(name).await {
        Ok(obj) => Ok(Some(obj)),
        Err(kube::Error::Api(e)) if e.code == 404 => {
            trace!("{} not found", name);
            Ok(None)
        }
        Err(e) => Err(e.into()),
    }
}

fn observe_namespace(ns: &Namespace) -> ObservedNamespace {
    ObservedNamespace {
        name: ns.metadata.name.clone().unwrap_or_default(),
        phase: ns.status.as_ref().and_then(|s| s.phase.clone()),
    }
}

fn observe_stateful_set(sts: &StatefulSet) -> ObservedStatefulSet {
    ObservedStatefulSet {
        name: sts.metadata.name.clone().unwrap_or_default(),
        // Kubernetes defaults an unset replica count to 1
        replicas: sts.spec.as_ref().and_then(|s| s.replicas).unwrap_or(1),
        ready_replicas: sts
            .status
            .as_ref()
            .and_then(|s| s.ready_replicas)
            .unwrap_or(0),
    }
}

fn observe_pod(pod: &Pod) -> ObservedPod {
    let status = pod.status.as_ref();
    let container_statuses = status
        .and_then(|s| s.container_statuses.as_deref())
        .unwrap_or_default();

    ObservedPod {
        name: pod.metadata.name.clone().unwrap_or_default(),
        labels: pod.metadata.labels.clone().unwrap_or_default(),
        phase: status.and_then(|s| s.phase.clone()),
        containers: container_statuses.len(),
        ready_containers: container_statuses
            .iter()
            .filter(|c| c.ready && c.started.unwrap_or(true))
            .count(),
    }
}

fn observe_network_policy(policy: &NetworkPolicy) -> ObservedNetworkPolicy {
    ObservedNetworkPolicy {
        name: policy.metadata.name.clone().unwrap_or_default(),
        policy_types: policy
            .spec
            .as_ref()
            .and_then(|s| s.policy_types.clone())
            .unwrap_or_default(),
    }
}

fn observe_service(svc: &Service) -> ObservedService {
    ObservedService {
        name: svc.metadata.name.clone().unwrap_or_default(),
        ports: svc
            .spec
            .as_ref()
            .and_then(|s| s.ports.as_ref())
            .map(|ports| ports.iter().map(|p| p.port).collect())
            .unwrap_or_default(),
    }
}

#[async_trait]
impl ResourceReader for KubeResourceReader {
    async fn namespace(&self, name: &str) -> Result<Option<ObservedNamespace>> {
        let api: Api<Namespace> = Api::all(self.client().await?);
        Ok(get_optional(&api, name).await?.as_ref().map(observe_namespace))
    }

    async fn stateful_set(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ObservedStatefulSet>> {
        let api: Api<StatefulSet> = Api::namespaced(self.client().await?, namespace);
        Ok(get_optional(&api, name)
            .await?
            .as_ref()
            .map(observe_stateful_set))
    }

    async fn pods(
        &self,
        namespace: &str,
        labels: &BTreeMap<String, String>,
    ) -> Result<Vec<ObservedPod>> {
        let api: Api<Pod> = Api::namespaced(self.client().await?, namespace);
        let params = ListParams::default().labels(&label_selector(labels));
        let list = api.list(&params).await?;
        Ok(list.items.iter().map(observe_pod).collect())
    }

    async fn pod(&self, namespace: &str, name: &str) -> Result<Option<ObservedPod>> {
        let api: Api<Pod> = Api::namespaced(self.client().await?, namespace);
        Ok(get_optional(&api, name).await?.as_ref().map(observe_pod))
    }

    async fn network_policy(
        &self,
        namespace: &str,
        name: &str,
    ) -> Result<Option<ObservedNetworkPolicy>> {
        let api: Api<NetworkPolicy> = Api::namespaced(self.client().await?, namespace);
        Ok(get_optional(&api, name)
            .await?
            .as_ref()
            .map(observe_network_policy))
    }

    async fn service(&self, namespace: &str, name: &str) -> Result<Option<ObservedService>> {
        let api: Api<Service> = Api::namespaced(self.client().await?, namespace);
        Ok(get_optional(&api, name).await?.as_ref().map(observe_service))
    }
}
