//! One compiler per manifest section. Each reads its own subtree and feeds
//! the `CompiledDeployment`; a section missing from the manifest compiles to
//! nothing.

use std::collections::BTreeMap;
use std::sync::Arc;

use paas_core::{CompiledDeployment, JobUnit, PaasError, PaasResult, QuotaSet};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;

mod config;
mod images;
mod pods;
mod services;
mod volumes;

pub use config::{DefaultsCompiler, MapsCompiler, SecretsCompiler};
pub use images::{HooksCompiler, ImagesCompiler};
pub use pods::PodsCompiler;
pub use services::{IngressesCompiler, ServicesCompiler};
pub use volumes::VolumesCompiler;

/// Shared state while compiling one manifest.
pub struct CompileContext<'a> {
    pub deployment: &'a CompiledDeployment,
    pub job: &'a JobUnit,
    pub quotas: QuotaSet,
    pub hooks: &'a HookCatalog,
}

pub trait SectionCompiler: Send + Sync {
    /// Top-level manifest key this compiler consumes.
    fn section(&self) -> &'static str;
    fn compile(&self, definitions: &Json, ctx: &mut CompileContext<'_>) -> PaasResult<()>;
}

/// Compilers in the order sections must be processed: defaults first, then
/// anything volumes depend on, then volumes, images, hooks, pods, services.
pub fn default_compilers() -> Vec<Arc<dyn SectionCompiler>> {
    vec![
        Arc::new(DefaultsCompiler),
        Arc::new(SecretsCompiler),
        Arc::new(MapsCompiler),
        Arc::new(VolumesCompiler),
        Arc::new(ImagesCompiler),
        Arc::new(HooksCompiler),
        Arc::new(PodsCompiler),
        Arc::new(ServicesCompiler),
        Arc::new(IngressesCompiler),
    ]
}

/// Known hook tools: manifest key -> base command.
#[derive(Debug, Clone)]
pub struct HookCatalog {
    tools: FxHashMap<String, Vec<String>>,
}

impl Default for HookCatalog {
    fn default() -> Self {
        let mut c = Self { tools: FxHashMap::default() };
        for tool in ["composer", "npm", "yarn", "make", "pip", "symfony-console"] {
            let bin = if tool == "symfony-console" { vec!["bin/console".to_string()] } else { vec![tool.to_string()] };
            c.register(tool, bin);
        }
        c
    }
}

impl HookCatalog {
    pub fn empty() -> Self { Self { tools: FxHashMap::default() } }

    pub fn register(&mut self, key: &str, base: Vec<String>) -> &mut Self {
        self.tools.insert(key.to_string(), base);
        self
    }

    pub fn get(&self, key: &str) -> Option<&Vec<String>> { self.tools.get(key) }
}

// ---- manifest access helpers ----

pub(crate) fn entries<'v>(v: &'v Json, what: &str) -> PaasResult<impl Iterator<Item = (&'v String, &'v Json)>> {
    match v {
        Json::Object(map) => Ok(map.iter()),
        _ => Err(invalid(what, "must be a mapping")),
    }
}

pub(crate) fn invalid(what: &str, why: &str) -> PaasError {
    PaasError::domain(format!("{} {}", what, why), 400)
}

/// Scalar rendered as string (numbers and booleans included).
pub(crate) fn scalar(v: &Json) -> Option<String> {
    match v {
        Json::String(s) => Some(s.clone()),
        Json::Number(n) => Some(n.to_string()),
        Json::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

pub(crate) fn opt_str(v: &Json, key: &str) -> Option<String> {
    v.get(key).and_then(scalar)
}

pub(crate) fn req_str(v: &Json, key: &str, what: &str) -> PaasResult<String> {
    opt_str(v, key).ok_or_else(|| invalid(what, &format!("requires `{}`", key)))
}

pub(crate) fn opt_bool(v: &Json, key: &str) -> bool {
    match v.get(key) {
        Some(Json::Bool(b)) => *b,
        Some(Json::String(s)) => matches!(s.as_str(), "true" | "yes" | "1"),
        _ => false,
    }
}

pub(crate) fn opt_u64(v: &Json, key: &str, what: &str) -> PaasResult<Option<u64>> {
    match v.get(key) {
        None | Some(Json::Null) => Ok(None),
        Some(Json::Number(n)) => n.as_u64().map(Some).ok_or_else(|| invalid(what, &format!("`{}` must be a positive integer", key))),
        Some(Json::String(s)) => s.parse().map(Some).map_err(|_| invalid(what, &format!("`{}` must be a positive integer", key))),
        Some(_) => Err(invalid(what, &format!("`{}` must be a positive integer", key))),
    }
}

pub(crate) fn opt_port(v: &Json, key: &str, what: &str) -> PaasResult<Option<u16>> {
    match opt_u64(v, key, what)? {
        Some(p) => u16::try_from(p).map(Some).map_err(|_| invalid(what, &format!("`{}` is not a valid port", key))),
        None => Ok(None),
    }
}

pub(crate) fn string_map(v: Option<&Json>, what: &str) -> PaasResult<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    let Some(v) = v else { return Ok(out) };
    if v.is_null() { return Ok(out); }
    for (k, val) in entries(v, what)? {
        let s = scalar(val).ok_or_else(|| invalid(what, &format!("value of `{}` must be a scalar", k)))?;
        out.insert(k.clone(), s);
    }
    Ok(out)
}

pub(crate) fn string_list(v: Option<&Json>, what: &str) -> PaasResult<Vec<String>> {
    match v {
        None | Some(Json::Null) => Ok(Vec::new()),
        Some(Json::Array(items)) => items
            .iter()
            .map(|i| scalar(i).ok_or_else(|| invalid(what, "must only contain scalars")))
            .collect(),
        Some(Json::String(s)) => Ok(s.split_whitespace().map(str::to_string).collect()),
        Some(_) => Err(invalid(what, "must be a list")),
    }
}

/// Repository-relative path, refusing parent traversal.
pub(crate) fn repo_path(raw: &str, what: &str) -> PaasResult<String> {
    if raw.split('/').any(|seg| seg == "..") {
        return Err(invalid(what, "path must stay inside the repository"));
    }
    Ok(format!("/{}", raw.trim_start_matches('/')))
}
