use std::sync::Arc;

use paas_core::model::{Buildable, Container, HealthCheck, Pod, Probe, UpgradeStrategy, Volume, VolumeKind};
use paas_core::{CompiledDeployment, DefaultsBag, PaasError, PaasResult};
use rustc_hash::FxHashMap;
use serde_json::{json, Value as Json};

use super::labels;
use crate::api::object_label;
use crate::transcriber::{Phase, TranscribeContext, Transcriber};

const VOLUME_STAGING: &str = "/paas-volume";

/// Deployments, or StatefulSets for pods mounting persistent volumes.
pub struct WorkloadsTranscriber;

fn image_ref(c: &Container, images: &FxHashMap<String, Arc<Buildable>>) -> String {
    match images.get(&c.image) {
        Some(b) => format!("{}:{}", b.url(), b.tag().unwrap_or("latest")),
        None => format!("{}:{}", c.image, c.version.as_deref().unwrap_or("latest")),
    }
}

fn probe(h: &HealthCheck) -> Json {
    let mut p = match &h.probe {
        Probe::Command { command } => json!({ "exec": { "command": command } }),
        Probe::Http { port, path, is_secure } => json!({
            "httpGet": { "port": port, "path": path, "scheme": if *is_secure { "HTTPS" } else { "HTTP" } }
        }),
        Probe::Tcp { port } => json!({ "tcpSocket": { "port": port } }),
    };
    p["initialDelaySeconds"] = json!(h.initial_delay);
    p["periodSeconds"] = json!(h.period);
    p["successThreshold"] = json!(h.success_threshold);
    p["failureThreshold"] = json!(h.failure_threshold);
    p
}

struct Template {
    containers: Vec<Json>,
    init_containers: Vec<Json>,
    volumes: Vec<Json>,
    stateful: bool,
}

fn template(
    cd: &CompiledDeployment,
    ctx: &TranscribeContext<'_>,
    pod: &Pod,
    images: &FxHashMap<String, Arc<Buildable>>,
    volumes: &FxHashMap<String, Arc<Volume>>,
) -> PaasResult<Template> {
    let mut t = Template { containers: Vec::new(), init_containers: Vec::new(), volumes: Vec::new(), stateful: false };
    let mut declared: Vec<String> = Vec::new();
    for c in &pod.containers {
        let mut mounts = Vec::new();
        for m in &c.volumes {
            let v = volumes
                .get(&m.name)
                .ok_or_else(|| PaasError::not_found(format!("volume `{}` of pod `{}` is not available", m.name, pod.name)))?;
            let vol_name = format!("{}-{}", c.name, m.name);
            mounts.push(json!({ "name": vol_name, "mountPath": m.mount_path }));
            if declared.contains(&vol_name) {
                continue;
            }
            declared.push(vol_name.clone());
            let source = match &v.kind {
                VolumeKind::Embedded { local_path, .. } => {
                    let url = v.url().ok_or_else(|| {
                        PaasError::domain(format!("volume `{}` has not been built", v.name), 500)
                    })?;
                    t.init_containers.push(json!({
                        "name": format!("{}-init", vol_name),
                        "image": format!("{}:latest", url),
                        "command": ["sh", "-c", format!("cp -a {}/. {}/", local_path.trim_end_matches('/'), VOLUME_STAGING)],
                        "volumeMounts": [{ "name": vol_name, "mountPath": VOLUME_STAGING }],
                    }));
                    json!({ "emptyDir": {} })
                }
                VolumeKind::Persistent { .. } => {
                    t.stateful = true;
                    json!({ "persistentVolumeClaim": { "claimName": ctx.object_name(cd, &v.name) } })
                }
                VolumeKind::Secret { secret_identifier } => {
                    json!({ "secret": { "secretName": ctx.object_name(cd, secret_identifier) } })
                }
                VolumeKind::Map { map_identifier } => {
                    json!({ "configMap": { "name": ctx.object_name(cd, map_identifier) } })
                }
            };
            let mut volume = json!({ "name": vol_name });
            if let (Some(obj), Some(src)) = (volume.as_object_mut(), source.as_object()) {
                obj.extend(src.clone());
            }
            t.volumes.push(volume);
        }

        let mut env: Vec<Json> = c.env.values.iter().map(|(k, v)| json!({ "name": k, "value": v })).collect();
        for (var, (map, key)) in &c.env.from_maps {
            env.push(json!({ "name": var, "valueFrom": { "configMapKeyRef": { "name": ctx.object_name(cd, map), "key": key } } }));
        }
        for (var, (secret, key)) in &c.env.from_secrets {
            env.push(json!({ "name": var, "valueFrom": { "secretKeyRef": { "name": ctx.object_name(cd, secret), "key": key } } }));
        }
        let env_from: Vec<Json> = c
            .env
            .import_maps
            .iter()
            .map(|m| json!({ "configMapRef": { "name": ctx.object_name(cd, m) } }))
            .chain(c.env.import_secrets.iter().map(|s| json!({ "secretRef": { "name": ctx.object_name(cd, s) } })))
            .collect();

        let mut requests = serde_json::Map::new();
        let mut limits = serde_json::Map::new();
        for r in c.resources.iter() {
            requests.insert(r.resource_type.clone(), json!(r.require));
            limits.insert(r.resource_type.clone(), json!(r.limit));
        }

        let mut container = json!({
            "name": c.name,
            "image": image_ref(c, images),
            "imagePullPolicy": "Always",
            "ports": c.listen.iter().map(|p| json!({ "containerPort": p })).collect::<Vec<_>>(),
            "env": env,
            "envFrom": env_from,
            "volumeMounts": mounts,
            "resources": { "requests": requests, "limits": limits },
        });
        if let Some(h) = &c.healthcheck {
            container["livenessProbe"] = probe(h);
            container["readinessProbe"] = probe(h);
        }
        t.containers.push(container);
    }
    Ok(t)
}

fn pull_secret(pod: &Pod, defaults: &DefaultsBag) -> PaasResult<Option<String>> {
    match &pod.oci_registry_config_name {
        Some(r) => r.resolve(defaults),
        None => Ok(None),
    }
}

fn workload(cd: &CompiledDeployment, ctx: &TranscribeContext<'_>, pod: &Pod, t: Template) -> PaasResult<Json> {
    let name = ctx.object_name(cd, &pod.name);
    let selector = json!({ "app.kubernetes.io/name": name });
    let mut pod_labels = labels(cd, &name);
    pod_labels["paas.io/pod"] = json!(pod.name);

    let mut spec = json!({
        "containers": t.containers,
        "initContainers": t.init_containers,
        "volumes": t.volumes,
        "securityContext": { "runAsNonRoot": !pod.security.allow_root },
    });
    if let Some(g) = pod.security.fs_group {
        spec["securityContext"]["fsGroup"] = json!(g);
    }
    if let Some(secret) = pull_secret(pod, &ctx.defaults)? {
        spec["imagePullSecrets"] = json!([{ "name": secret }]);
    }

    let upgrade = &pod.upgrade;
    let (api_version, kind, strategy_key, strategy) = if t.stateful {
        let s = match upgrade.strategy {
            UpgradeStrategy::OnDelete => json!({ "type": "OnDelete" }),
            _ => json!({ "type": "RollingUpdate", "rollingUpdate": { "maxUnavailable": upgrade.max_unavailable_pods.max(1) } }),
        };
        ("apps/v1", "StatefulSet", "updateStrategy", s)
    } else {
        let s = match upgrade.strategy {
            UpgradeStrategy::RollingUpgrade => json!({
                "type": "RollingUpdate",
                "rollingUpdate": { "maxSurge": upgrade.max_upgrading_pods, "maxUnavailable": upgrade.max_unavailable_pods },
            }),
            UpgradeStrategy::Recreate | UpgradeStrategy::OnDelete => json!({ "type": "Recreate" }),
        };
        ("apps/v1", "Deployment", "strategy", s)
    };

    let mut workload_spec = json!({
        "replicas": pod.replicas,
        "selector": { "matchLabels": selector },
        "template": { "metadata": { "labels": pod_labels }, "spec": spec },
    });
    workload_spec[strategy_key] = strategy;
    if t.stateful {
        workload_spec["serviceName"] = json!(name);
    }
    Ok(json!({
        "apiVersion": api_version,
        "kind": kind,
        "metadata": { "name": name, "namespace": ctx.namespace, "labels": labels(cd, &name) },
        "spec": workload_spec,
    }))
}

#[async_trait::async_trait]
impl Transcriber for WorkloadsTranscriber {
    fn name(&self) -> &'static str { "workloads" }
    fn phases(&self) -> &'static [Phase] { &[Phase::Deploy] }

    async fn transcribe(&self, cd: &CompiledDeployment, ctx: &TranscribeContext<'_>) -> PaasResult<Vec<String>> {
        let mut manifests = Vec::new();
        let mut failure = None;
        cd.for_each_pod(|pod, images, volumes| {
            if failure.is_some() {
                return;
            }
            match template(cd, ctx, pod, images, volumes).and_then(|t| workload(cd, ctx, pod, t)) {
                Ok(m) => manifests.push(m),
                Err(e) => failure = Some(e),
            }
        });
        if let Some(e) = failure {
            return Err(e);
        }
        let mut done = Vec::with_capacity(manifests.len());
        for m in manifests {
            ctx.api.apply(&m).await?;
            done.push(object_label(&m));
        }
        Ok(done)
    }
}
