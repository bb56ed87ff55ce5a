use paas_core::keys::INGRESS_PROVIDER;
use paas_core::model::{Ingress, IngressPath, Protocol, Service, Transport};
use paas_core::{PaasResult, Resolvable};
use serde_json::Value as Json;

use super::{entries, invalid, opt_bool, opt_port, opt_str, req_str, string_map, CompileContext, SectionCompiler};

pub struct ServicesCompiler;

impl SectionCompiler for ServicesCompiler {
    fn section(&self) -> &'static str { "services" }

    fn compile(&self, definitions: &Json, ctx: &mut CompileContext<'_>) -> PaasResult<()> {
        for (name, def) in entries(definitions, "services")? {
            let what = format!("service `{}`", name);
            let protocol = match opt_str(def, "protocol").as_deref() {
                None | Some("tcp") | Some("TCP") => Protocol::Tcp,
                Some("udp") | Some("UDP") => Protocol::Udp,
                Some(other) => return Err(invalid(&what, &format!("has an unknown protocol `{}`", other))),
            };
            let mut ports = Vec::new();
            match def.get("ports") {
                Some(Json::Array(items)) => {
                    for p in items {
                        let listen = opt_port(p, "listen", &what)?.ok_or_else(|| invalid(&what, "port requires `listen`"))?;
                        let target = opt_port(p, "target", &what)?.unwrap_or(listen);
                        ports.push(Transport { listen, target, protocol });
                    }
                }
                None => {}
                Some(_) => return Err(invalid(&what, "`ports` must be a list")),
            }
            if ports.is_empty() {
                return Err(invalid(&what, "requires at least one port"));
            }
            ctx.deployment.add_service(Service {
                name: name.clone(),
                pod_name: opt_str(def, "pod-name").unwrap_or_else(|| name.clone()),
                ports,
                internal: opt_bool(def, "internal"),
            })?;
        }
        Ok(())
    }
}

pub struct IngressesCompiler;

fn backend(def: &Json, what: &str) -> PaasResult<(String, u16)> {
    let service = def.get("service").ok_or_else(|| invalid(what, "requires `service`"))?;
    Ok((
        req_str(service, "name", what)?,
        opt_port(service, "port", what)?.ok_or_else(|| invalid(what, "requires `service.port`"))?,
    ))
}

impl SectionCompiler for IngressesCompiler {
    fn section(&self) -> &'static str { "ingresses" }

    fn compile(&self, definitions: &Json, ctx: &mut CompileContext<'_>) -> PaasResult<()> {
        for (name, def) in entries(definitions, "ingresses")? {
            let what = format!("ingress `{}`", name);
            let (default_service, default_port) = match def.get("service") {
                Some(_) => {
                    let (s, p) = backend(def, &what)?;
                    (Some(s), Some(p))
                }
                None => (None, None),
            };
            let mut paths = Vec::new();
            if let Some(items) = def.get("paths") {
                let Json::Array(items) = items else {
                    return Err(invalid(&what, "`paths` must be a list"));
                };
                for p in items {
                    let (service, port) = backend(p, &what)?;
                    paths.push(IngressPath { path: req_str(p, "path", &what)?, service, port });
                }
            }
            if default_service.is_none() && paths.is_empty() {
                return Err(invalid(&what, "requires a `service` or `paths`"));
            }
            ctx.deployment.add_ingress(Ingress {
                name: name.clone(),
                host: req_str(def, "host", &what)?,
                provider: Some(Resolvable::or_default(
                    opt_str(def, "provider").as_deref(),
                    ctx.deployment.defaults(),
                    INGRESS_PROVIDER,
                )?),
                default_service,
                default_port,
                paths,
                tls_secret: def.get("tls").and_then(|t| opt_str(t, "secret")),
                https_backend: opt_bool(def, "https-backend"),
                meta: string_map(def.get("meta"), &what)?,
            })?;
        }
        Ok(())
    }
}
