//! Cluster API seam: server-side apply and delete of JSON manifests.

use std::sync::{Mutex, PoisonError};

use anyhow::{anyhow, Context, Result};
use kube::api::{Api, DeleteParams, Patch, PatchParams};
use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::core::{ApiResource, DynamicObject, GroupVersionKind};
use kube::discovery::{Discovery, Scope};
use kube::{Client, Config};
use metrics::counter;
use paas_core::{PaasError, PaasResult};
use serde_json::{json, Value as Json};
use tokio::sync::OnceCell;
use tracing::{debug, warn};

use crate::directory::DriverConfig;

pub const FIELD_MANAGER: &str = "paas";

#[async_trait::async_trait]
pub trait ClusterApi: Send + Sync {
    /// Create or update the object described by `manifest`.
    async fn apply(&self, manifest: &Json) -> PaasResult<()>;
    /// Delete an object; a missing one is not an error.
    async fn delete(&self, api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> PaasResult<()>;
}

/// `Kind/name` label of a manifest, for reports and logs.
pub fn object_label(manifest: &Json) -> String {
    let kind = manifest.get("kind").and_then(Json::as_str).unwrap_or("?");
    let name = manifest.pointer("/metadata/name").and_then(Json::as_str).unwrap_or("?");
    format!("{}/{}", kind, name)
}

fn gvk_of(api_version: &str, kind: &str) -> GroupVersionKind {
    let (group, version) = match api_version.split_once('/') {
        Some((g, v)) => (g.to_string(), v.to_string()),
        None => (String::new(), api_version.to_string()),
    };
    GroupVersionKind { group, version, kind: kind.to_string() }
}

/// kube-rs client built from the job's cluster address and identity.
pub struct KubeClusterApi {
    client: Client,
    discovery: OnceCell<Discovery>,
}

impl KubeClusterApi {
    pub fn new(client: Client) -> Self { Self { client, discovery: OnceCell::new() } }

    /// Kubeconfig with a single context for `config`. Certificates and keys
    /// are expected base64 encoded, as in a kubeconfig file.
    pub fn kubeconfig(config: &DriverConfig) -> Result<Kubeconfig> {
        let mut cluster = json!({ "server": config.url });
        let mut user = json!({});
        if let Some(id) = &config.identity {
            if let Some(ca) = &id.ca_certificate {
                cluster["certificate-authority-data"] = json!(ca);
            }
            if let Some(token) = &id.token {
                user["token"] = json!(token);
            } else if !id.user.is_empty() {
                user["username"] = json!(id.user);
                user["password"] = json!(id.password);
            }
            if let (Some(cert), Some(key)) = (&id.client_certificate, &id.client_key) {
                user["client-certificate-data"] = json!(cert);
                user["client-key-data"] = json!(key);
            }
        }
        let doc = json!({
            "apiVersion": "v1",
            "kind": "Config",
            "clusters": [{ "name": config.cluster_name, "cluster": cluster }],
            "users": [{ "name": config.cluster_name, "user": user }],
            "contexts": [{ "name": config.cluster_name, "context": { "cluster": config.cluster_name, "user": config.cluster_name } }],
            "current-context": config.cluster_name,
        });
        let yaml = serde_yaml::to_string(&doc).context("rendering kubeconfig")?;
        Kubeconfig::from_yaml(&yaml).context("parsing kubeconfig")
    }

    pub async fn connect(config: &DriverConfig) -> Result<Self> {
        let kubeconfig = Self::kubeconfig(config)?;
        let cfg = Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
            .await
            .with_context(|| format!("configuring cluster `{}`", config.cluster_name))?;
        let client = Client::try_from(cfg).context("building kube client")?;
        Ok(Self::new(client))
    }

    async fn api_for(&self, api_version: &str, kind: &str, namespace: Option<&str>) -> Result<Api<DynamicObject>> {
        let gvk = gvk_of(api_version, kind);
        let discovery = self
            .discovery
            .get_or_try_init(|| Discovery::new(self.client.clone()).run())
            .await
            .context("running discovery")?;
        let (ar, namespaced): (ApiResource, bool) = discovery
            .groups()
            .flat_map(|g| g.recommended_resources())
            .find(|(ar, _)| ar.group == gvk.group && ar.version == gvk.version && ar.kind == gvk.kind)
            .map(|(ar, caps)| (ar, matches!(caps.scope, Scope::Namespaced)))
            .ok_or_else(|| anyhow!("GVK not found: {}/{}/{}", gvk.group, gvk.version, gvk.kind))?;
        Ok(match (namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(self.client.clone(), ns, &ar),
            (true, None) => return Err(anyhow!("namespace required for {}", kind)),
            (false, _) => Api::all_with(self.client.clone(), &ar),
        })
    }

    async fn apply_inner(&self, manifest: &Json) -> Result<()> {
        let api_version = manifest.get("apiVersion").and_then(Json::as_str).ok_or_else(|| anyhow!("manifest missing apiVersion"))?;
        let kind = manifest.get("kind").and_then(Json::as_str).ok_or_else(|| anyhow!("manifest missing kind"))?;
        let name = manifest.pointer("/metadata/name").and_then(Json::as_str).ok_or_else(|| anyhow!("manifest missing metadata.name"))?;
        let ns = manifest.pointer("/metadata/namespace").and_then(Json::as_str);
        let api = self.api_for(api_version, kind, ns).await?;
        let pp = PatchParams::apply(FIELD_MANAGER).force();
        api.patch(name, &pp, &Patch::Apply(manifest))
            .await
            .map_err(|e| anyhow!("server-side apply of {}/{} failed: {}", kind, name, e))?;
        Ok(())
    }
}

fn rejected(e: anyhow::Error) -> PaasError {
    PaasError::execution(format!("{:#}", e), 500)
}

#[async_trait::async_trait]
impl ClusterApi for KubeClusterApi {
    async fn apply(&self, manifest: &Json) -> PaasResult<()> {
        match self.apply_inner(manifest).await {
            Ok(()) => {
                counter!("cluster_apply_ok", 1u64);
                debug!(object = %object_label(manifest), "applied");
                Ok(())
            }
            Err(e) => {
                counter!("cluster_apply_err", 1u64);
                Err(rejected(e))
            }
        }
    }

    async fn delete(&self, api_version: &str, kind: &str, namespace: Option<&str>, name: &str) -> PaasResult<()> {
        let api = self.api_for(api_version, kind, namespace).await.map_err(rejected)?;
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => {
                warn!(kind, name, error = %e, "delete failed");
                Err(PaasError::execution(format!("delete of {}/{} failed: {}", kind, name, e), 500))
            }
        }
    }
}

/// Keeps applied manifests in memory instead of sending them anywhere.
/// Backs dry runs and tests.
#[derive(Default)]
pub struct RecordingClusterApi {
    applied: Mutex<Vec<Json>>,
    deleted: Mutex<Vec<String>>,
    fail_on: Option<String>,
}

impl RecordingClusterApi {
    pub fn new() -> Self { Self::default() }

    /// Reject any manifest whose `Kind/name` label contains `pattern`.
    pub fn failing_on(pattern: impl Into<String>) -> Self {
        Self { fail_on: Some(pattern.into()), ..Self::default() }
    }

    pub fn applied(&self) -> Vec<Json> { self.applied.lock().unwrap_or_else(PoisonError::into_inner).clone() }
    pub fn applied_labels(&self) -> Vec<String> { self.applied().iter().map(object_label).collect() }
    pub fn deleted(&self) -> Vec<String> { self.deleted.lock().unwrap_or_else(PoisonError::into_inner).clone() }
}

#[async_trait::async_trait]
impl ClusterApi for RecordingClusterApi {
    async fn apply(&self, manifest: &Json) -> PaasResult<()> {
        let label = object_label(manifest);
        if self.fail_on.as_deref().is_some_and(|p| label.contains(p)) {
            return Err(PaasError::execution(format!("{} rejected", label), 422));
        }
        self.applied.lock().unwrap_or_else(PoisonError::into_inner).push(manifest.clone());
        Ok(())
    }

    async fn delete(&self, _api_version: &str, kind: &str, _namespace: Option<&str>, name: &str) -> PaasResult<()> {
        self.deleted.lock().unwrap_or_else(PoisonError::into_inner).push(format!("{}/{}", kind, name));
        Ok(())
    }
}
