use paas_core::model::{ConfigMap, Secret};
use paas_core::{DefaultsBag, PaasResult};
use serde_json::Value as Json;

use super::{entries, invalid, opt_str, scalar, string_map, CompileContext, SectionCompiler};

/// `defaults:` root values plus `clusters: {name: {...}}` overrides.
pub struct DefaultsCompiler;

fn fill(bag: &DefaultsBag, values: &Json, what: &str) -> PaasResult<()> {
    for (k, v) in entries(values, what)? {
        if k == "clusters" { continue; }
        match v {
            Json::Null => { bag.set(k, None); }
            other => {
                let s = scalar(other).ok_or_else(|| invalid(what, &format!("value of `{}` must be a scalar", k)))?;
                bag.set(k, Some(&s));
            }
        }
    }
    Ok(())
}

impl SectionCompiler for DefaultsCompiler {
    fn section(&self) -> &'static str { "defaults" }

    fn compile(&self, definitions: &Json, ctx: &mut CompileContext<'_>) -> PaasResult<()> {
        let root = ctx.deployment.defaults();
        fill(root, definitions, "defaults")?;
        if let Some(clusters) = definitions.get("clusters") {
            for (name, values) in entries(clusters, "defaults.clusters")? {
                fill(&root.for_cluster(name), values, &format!("defaults.clusters.{}", name))?;
            }
        }
        Ok(())
    }
}

pub struct SecretsCompiler;

impl SectionCompiler for SecretsCompiler {
    fn section(&self) -> &'static str { "secrets" }

    fn compile(&self, definitions: &Json, ctx: &mut CompileContext<'_>) -> PaasResult<()> {
        for (name, def) in entries(definitions, "secrets")? {
            let what = format!("secret `{}`", name);
            ctx.deployment.add_secret(Secret {
                name: name.clone(),
                provider: opt_str(def, "provider").unwrap_or_else(|| "map".to_string()),
                secret_type: opt_str(def, "type").unwrap_or_else(|| "default".to_string()),
                options: string_map(def.get("options"), &what)?,
            })?;
        }
        Ok(())
    }
}

pub struct MapsCompiler;

impl SectionCompiler for MapsCompiler {
    fn section(&self) -> &'static str { "maps" }

    fn compile(&self, definitions: &Json, ctx: &mut CompileContext<'_>) -> PaasResult<()> {
        for (name, def) in entries(definitions, "maps")? {
            ctx.deployment.add_map(ConfigMap { name: name.clone(), data: string_map(Some(def), &format!("map `{}`", name))? })?;
        }
        Ok(())
    }
}
