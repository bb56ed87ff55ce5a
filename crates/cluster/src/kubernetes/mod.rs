//! Kubernetes driver: transcribers emitting manifests through a `ClusterApi`.

use std::sync::Arc;

use paas_core::{CompiledDeployment, PaasError, PaasResult};
use tracing::info;

use crate::api::{ClusterApi, KubeClusterApi};
use crate::directory::{DriverConfig, DriverFactory};
use crate::driver::{ClusterReport, Driver};
use crate::transcriber::{Phase, TranscribeContext, TranscriberCollection};

mod config;
mod exposure;
mod workloads;

pub use config::{ConfigMapsTranscriber, NamespaceTranscriber, PersistentVolumesTranscriber, SecretsTranscriber};
pub use exposure::{IngressesTranscriber, ServicesTranscriber};
pub use workloads::WorkloadsTranscriber;

pub const CLUSTER_TYPE: &str = "kubernetes";
pub const DEFAULT_NAMESPACE: &str = "default";

/// Standard transcribers, in the order they must run.
pub fn default_transcribers() -> TranscriberCollection {
    let mut c = TranscriberCollection::new();
    c.add(Arc::new(NamespaceTranscriber))
        .add(Arc::new(SecretsTranscriber))
        .add(Arc::new(ConfigMapsTranscriber))
        .add(Arc::new(PersistentVolumesTranscriber))
        .add(Arc::new(WorkloadsTranscriber))
        .add(Arc::new(ServicesTranscriber))
        .add(Arc::new(IngressesTranscriber));
    c
}

pub(crate) fn labels(cd: &CompiledDeployment, app: &str) -> serde_json::Value {
    cd.with_job_settings(|_, _, project| {
        let mut l = serde_json::json!({ "app.kubernetes.io/name": app, "app.kubernetes.io/managed-by": "paas" });
        if let Some(p) = project {
            l["paas.io/project"] = serde_json::json!(p);
        }
        l
    })
}

pub struct KubernetesDriver {
    config: DriverConfig,
    api: Arc<dyn ClusterApi>,
    transcribers: TranscriberCollection,
}

impl KubernetesDriver {
    pub fn new(config: DriverConfig, api: Arc<dyn ClusterApi>, transcribers: TranscriberCollection) -> Self {
        Self { config, api, transcribers }
    }

    /// Workloads namespace; with hierarchical namespaces, a child of the
    /// configured one named after the deployment prefix.
    fn namespaces(&self, cd: &CompiledDeployment) -> (String, Option<String>) {
        let base = self.config.namespace.clone().unwrap_or_else(|| DEFAULT_NAMESPACE.to_string());
        let prefix = cd.with_job_settings(|_, prefix, _| prefix.map(str::to_string));
        match (self.config.use_hierarchical_namespaces, prefix) {
            (true, Some(p)) => (format!("{}-{}", base, p), Some(base)),
            _ => (base, None),
        }
    }

    async fn run(&self, phase: Phase, cd: &CompiledDeployment) -> PaasResult<ClusterReport> {
        let (namespace, parent) = self.namespaces(cd);
        let ctx = TranscribeContext {
            cluster_name: &self.config.cluster_name,
            namespace: &namespace,
            parent_namespace: parent.as_deref(),
            defaults: cd.defaults().get_bag_for(&self.config.cluster_name),
            api: self.api.as_ref(),
        };
        let transcribed = self.transcribers.run_phase(phase, cd, &ctx).await?;
        info!(cluster = %self.config.cluster_name, namespace = %namespace, phase = ?phase, steps = transcribed.len(), "phase done");
        Ok(ClusterReport { cluster: self.config.cluster_name.clone(), transcribed })
    }
}

#[async_trait::async_trait]
impl Driver for KubernetesDriver {
    fn cluster_name(&self) -> &str { &self.config.cluster_name }

    async fn deploy(&self, cd: &CompiledDeployment) -> PaasResult<ClusterReport> { self.run(Phase::Deploy, cd).await }

    async fn expose(&self, cd: &CompiledDeployment) -> PaasResult<ClusterReport> { self.run(Phase::Expose, cd).await }
}

/// Builds a driver whose API client connects lazily on first use.
#[derive(Clone, Default)]
pub struct KubernetesFactory {
    transcribers: Option<TranscriberCollection>,
}

impl KubernetesFactory {
    pub fn new() -> Self { Self::default() }

    pub fn with_transcribers(transcribers: TranscriberCollection) -> Self {
        Self { transcribers: Some(transcribers) }
    }
}

impl DriverFactory for KubernetesFactory {
    fn new_driver(&self, config: DriverConfig) -> PaasResult<Box<dyn Driver>> {
        if config.url.trim().is_empty() {
            return Err(PaasError::domain(format!("cluster `{}` has no address", config.cluster_name), 400));
        }
        let api = Arc::new(LazyKubeApi { config: config.clone(), inner: tokio::sync::OnceCell::new() });
        let transcribers = self.transcribers.clone().unwrap_or_else(default_transcribers);
        Ok(Box::new(KubernetesDriver::new(config, api, transcribers)))
    }
}

/// Defers the kube client until the first call, so requiring a driver never
/// touches the network.
struct LazyKubeApi {
    config: DriverConfig,
    inner: tokio::sync::OnceCell<KubeClusterApi>,
}

impl LazyKubeApi {
    async fn get(&self) -> PaasResult<&KubeClusterApi> {
        self.inner
            .get_or_try_init(|| KubeClusterApi::connect(&self.config))
            .await
            .map_err(|e| PaasError::execution(format!("{:#}", e), 502))
    }
}

#[async_trait::async_trait]
impl ClusterApi for LazyKubeApi {
    async fn apply(&self, manifest: &serde_json::Value) -> PaasResult<()> {
        self.get().await?.apply(manifest).await
    }

    async fn delete(&self, api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> PaasResult<()> {
        self.get().await?.delete(api_version, kind, namespace, name).await
    }
}
