use k8s_openapi::api::core::v1::{ConfigMap, Namespace, Secret};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use paas_core::model::VolumeKind;
use paas_core::{CompiledDeployment, PaasError, PaasResult};
use serde_json::{json, Value as Json};
use tracing::debug;

use super::labels;
use crate::api::object_label;
use crate::transcriber::{Phase, TranscribeContext, Transcriber};

fn typed<T: serde::Serialize>(kind: &str, api_version: &str, obj: &T) -> PaasResult<Json> {
    let mut v = serde_json::to_value(obj)?;
    v["apiVersion"] = json!(api_version);
    v["kind"] = json!(kind);
    Ok(v)
}

fn meta(name: String, namespace: Option<&str>, labels: Json) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: namespace.map(str::to_string),
        labels: serde_json::from_value(labels).ok(),
        ..ObjectMeta::default()
    }
}

async fn apply_all(ctx: &TranscribeContext<'_>, manifests: Vec<Json>) -> PaasResult<Vec<String>> {
    let mut done = Vec::with_capacity(manifests.len());
    for m in manifests {
        ctx.api.apply(&m).await?;
        done.push(object_label(&m));
    }
    Ok(done)
}

pub struct NamespaceTranscriber;

#[async_trait::async_trait]
impl Transcriber for NamespaceTranscriber {
    fn name(&self) -> &'static str { "namespace" }
    fn phases(&self) -> &'static [Phase] { &[Phase::Deploy] }

    async fn transcribe(&self, cd: &CompiledDeployment, ctx: &TranscribeContext<'_>) -> PaasResult<Vec<String>> {
        let manifest = match ctx.parent_namespace {
            Some(parent) => {
                let child = ctx.namespace.strip_prefix(&format!("{}-", parent)).unwrap_or(ctx.namespace);
                json!({
                    "apiVersion": "hnc.x-k8s.io/v1alpha2",
                    "kind": "SubnamespaceAnchor",
                    "metadata": { "name": format!("{}-{}", parent, child), "namespace": parent },
                })
            }
            None => {
                let ns = Namespace { metadata: meta(ctx.namespace.to_string(), None, labels(cd, ctx.namespace)), ..Namespace::default() };
                typed("Namespace", "v1", &ns)?
            }
        };
        apply_all(ctx, vec![manifest]).await
    }
}

pub struct SecretsTranscriber;

fn secret_type(raw: &str) -> &str {
    match raw {
        "default" | "opaque" => "Opaque",
        "tls" => "kubernetes.io/tls",
        "docker" | "registry" => "kubernetes.io/dockerconfigjson",
        other => other,
    }
}

#[async_trait::async_trait]
impl Transcriber for SecretsTranscriber {
    fn name(&self) -> &'static str { "secrets" }
    fn phases(&self) -> &'static [Phase] { &[Phase::Deploy] }

    async fn transcribe(&self, cd: &CompiledDeployment, ctx: &TranscribeContext<'_>) -> PaasResult<Vec<String>> {
        let mut manifests = Vec::new();
        let mut failure = None;
        cd.for_each_secret(|s| {
            if s.provider != "map" {
                debug!(secret = %s.name, provider = %s.provider, "secret managed by its provider, skipped");
                return;
            }
            let name = ctx.object_name(cd, &s.name);
            let secret = Secret {
                metadata: meta(name.clone(), Some(ctx.namespace), labels(cd, &s.name)),
                string_data: Some(s.options.clone()),
                type_: Some(secret_type(&s.secret_type).to_string()),
                ..Secret::default()
            };
            match typed("Secret", "v1", &secret) {
                Ok(m) => manifests.push(m),
                Err(e) => { failure.get_or_insert(e); }
            }
        });
        if let Some(e) = failure {
            return Err(e);
        }
        apply_all(ctx, manifests).await
    }
}

pub struct ConfigMapsTranscriber;

#[async_trait::async_trait]
impl Transcriber for ConfigMapsTranscriber {
    fn name(&self) -> &'static str { "configmaps" }
    fn phases(&self) -> &'static [Phase] { &[Phase::Deploy] }

    async fn transcribe(&self, cd: &CompiledDeployment, ctx: &TranscribeContext<'_>) -> PaasResult<Vec<String>> {
        let mut maps = Vec::new();
        cd.for_each_map(|m| maps.push(m.clone()));
        let mut manifests = Vec::with_capacity(maps.len());
        for m in maps {
            let cm = ConfigMap {
                metadata: meta(ctx.object_name(cd, &m.name), Some(ctx.namespace), labels(cd, &m.name)),
                data: Some(m.data.clone()),
                ..ConfigMap::default()
            };
            manifests.push(typed("ConfigMap", "v1", &cm)?);
        }
        apply_all(ctx, manifests).await
    }
}

/// One claim per persistent volume. Storage class and size may be cluster
/// defaults; a missing size is an error.
pub struct PersistentVolumesTranscriber;

#[async_trait::async_trait]
impl Transcriber for PersistentVolumesTranscriber {
    fn name(&self) -> &'static str { "persistent-volumes" }
    fn phases(&self) -> &'static [Phase] { &[Phase::Deploy] }

    async fn transcribe(&self, cd: &CompiledDeployment, ctx: &TranscribeContext<'_>) -> PaasResult<Vec<String>> {
        let mut volumes = Vec::new();
        cd.for_each_volume(|v| {
            if v.is_persistent() {
                volumes.push(v.clone());
            }
        });
        let mut done = Vec::new();
        for v in volumes {
            let VolumeKind::Persistent { storage_identifier, storage_size, reset_on_deployment, write_many } = &v.kind else {
                continue;
            };
            let size = storage_size
                .resolve(&ctx.defaults)?
                .ok_or_else(|| PaasError::domain(format!("volume `{}` has no storage size", v.name), 400))?;
            let name = ctx.object_name(cd, &v.name);
            if *reset_on_deployment {
                ctx.api.delete("v1", "PersistentVolumeClaim", Some(ctx.namespace), &name).await?;
            }
            let mut spec = json!({
                "accessModes": [if *write_many { "ReadWriteMany" } else { "ReadWriteOnce" }],
                "resources": { "requests": { "storage": size } },
            });
            if let Some(class) = storage_identifier.resolve(&ctx.defaults)? {
                spec["storageClassName"] = json!(class);
            }
            let manifest = json!({
                "apiVersion": "v1",
                "kind": "PersistentVolumeClaim",
                "metadata": { "name": name, "namespace": ctx.namespace, "labels": labels(cd, &v.name) },
                "spec": spec,
            });
            ctx.api.apply(&manifest).await?;
            done.push(object_label(&manifest));
        }
        Ok(done)
    }
}
