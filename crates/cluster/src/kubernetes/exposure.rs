use paas_core::model::Protocol;
use paas_core::{CompiledDeployment, PaasResult};
use serde_json::{json, Value as Json};

use super::labels;
use crate::api::object_label;
use crate::transcriber::{Phase, TranscribeContext, Transcriber};

pub struct ServicesTranscriber;

#[async_trait::async_trait]
impl Transcriber for ServicesTranscriber {
    fn name(&self) -> &'static str { "services" }
    fn phases(&self) -> &'static [Phase] { &[Phase::Expose] }

    async fn transcribe(&self, cd: &CompiledDeployment, ctx: &TranscribeContext<'_>) -> PaasResult<Vec<String>> {
        let mut manifests = Vec::new();
        cd.for_each_service(|s| {
            let ports: Vec<Json> = s
                .ports
                .iter()
                .map(|p| {
                    json!({
                        "name": format!("{}-{}", match p.protocol { Protocol::Tcp => "tcp", Protocol::Udp => "udp" }, p.listen),
                        "port": p.listen,
                        "targetPort": p.target,
                        "protocol": match p.protocol { Protocol::Tcp => "TCP", Protocol::Udp => "UDP" },
                    })
                })
                .collect();
            let name = ctx.object_name(cd, &s.name);
            manifests.push(json!({
                "apiVersion": "v1",
                "kind": "Service",
                "metadata": { "name": name, "namespace": ctx.namespace, "labels": labels(cd, &name) },
                "spec": {
                    "type": if s.internal { "ClusterIP" } else { "LoadBalancer" },
                    "selector": { "app.kubernetes.io/name": ctx.object_name(cd, &s.pod_name) },
                    "ports": ports,
                },
            }));
        });
        let mut done = Vec::with_capacity(manifests.len());
        for m in manifests {
            ctx.api.apply(&m).await?;
            done.push(object_label(&m));
        }
        Ok(done)
    }
}

pub struct IngressesTranscriber;

pub const HTTPS_BACKEND_ANNOTATION: &str = "nginx.ingress.kubernetes.io/backend-protocol";

fn backend(cd: &CompiledDeployment, ctx: &TranscribeContext<'_>, service: &str, port: u16) -> Json {
    json!({ "service": { "name": ctx.object_name(cd, service), "port": { "number": port } } })
}

#[async_trait::async_trait]
impl Transcriber for IngressesTranscriber {
    fn name(&self) -> &'static str { "ingresses" }
    fn phases(&self) -> &'static [Phase] { &[Phase::Expose] }

    async fn transcribe(&self, cd: &CompiledDeployment, ctx: &TranscribeContext<'_>) -> PaasResult<Vec<String>> {
        let mut ingresses = Vec::new();
        cd.for_each_ingress(|i| ingresses.push(i.clone()));
        let mut done = Vec::with_capacity(ingresses.len());
        for i in ingresses {
            let name = ctx.object_name(cd, &i.name);
            let mut annotations = serde_json::Map::new();
            for (k, v) in &i.meta {
                annotations.insert(k.clone(), json!(v));
            }
            if i.https_backend {
                annotations.insert(HTTPS_BACKEND_ANNOTATION.to_string(), json!("HTTPS"));
            }
            let mut paths: Vec<Json> = i
                .paths
                .iter()
                .map(|p| json!({ "path": p.path, "pathType": "Prefix", "backend": backend(cd, ctx, &p.service, p.port) }))
                .collect();
            if let (Some(service), Some(port)) = (&i.default_service, i.default_port) {
                paths.push(json!({ "path": "/", "pathType": "Prefix", "backend": backend(cd, ctx, service, port) }));
            }
            let mut spec = json!({ "rules": [{ "host": i.host, "http": { "paths": paths } }] });
            if let (Some(service), Some(port)) = (&i.default_service, i.default_port) {
                spec["defaultBackend"] = backend(cd, ctx, service, port);
            }
            if let Some(secret) = &i.tls_secret {
                spec["tls"] = json!([{ "hosts": [i.host], "secretName": ctx.object_name(cd, secret) }]);
            }
            if let Some(provider) = &i.provider {
                if let Some(class) = provider.resolve(&ctx.defaults)? {
                    spec["ingressClassName"] = json!(class);
                }
            }
            let manifest = json!({
                "apiVersion": "networking.k8s.io/v1",
                "kind": "Ingress",
                "metadata": { "name": name, "namespace": ctx.namespace, "labels": labels(cd, &name), "annotations": annotations },
                "spec": spec,
            });
            ctx.api.apply(&manifest).await?;
            done.push(object_label(&manifest));
        }
        Ok(done)
    }
}
