//! Manifest parsing collaborator and job variable substitution.

use std::collections::BTreeMap;

use anyhow::{anyhow, Context};
use once_cell::sync::Lazy;
use paas_core::{PaasError, PaasResult};
use regex::{Captures, Regex};
use serde_json::Value as Json;

fn max_yaml_bytes() -> usize {
    std::env::var("PAAS_MAX_YAML_BYTES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(1_000_000) // 1 MiB default
}

fn max_yaml_nodes() -> usize {
    std::env::var("PAAS_MAX_YAML_NODES")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(100_000)
}

fn json_node_budget_exceeded(v: &Json, max: usize) -> bool {
    fn walk(v: &Json, cur: &mut usize, max: usize) {
        if *cur >= max { return; }
        *cur += 1;
        match v {
            Json::Object(map) => {
                for (_k, vv) in map.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            Json::Array(arr) => {
                for vv in arr.iter() {
                    if *cur >= max { break; }
                    walk(vv, cur, max);
                }
            }
            _ => {}
        }
    }
    let mut count = 0usize;
    walk(v, &mut count, max);
    count >= max
}

/// Turns manifest text into a tree. Fails on malformed input, never panics.
#[async_trait::async_trait]
pub trait ManifestParser: Send + Sync {
    async fn parse(&self, text: &str) -> PaasResult<Json>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct YamlManifestParser;

impl YamlManifestParser {
    fn parse_sync(text: &str) -> anyhow::Result<Json> {
        if text.len() > max_yaml_bytes() {
            return Err(anyhow!("YAML payload too large (>{} bytes)", max_yaml_bytes()));
        }
        let val: serde_yaml::Value = serde_yaml::from_str(text).context("parsing YAML")?;
        let json = serde_json::to_value(val).context("converting YAML to JSON")?;
        if json_node_budget_exceeded(&json, max_yaml_nodes()) {
            return Err(anyhow!("YAML document too complex (>{} nodes)", max_yaml_nodes()));
        }
        if !json.is_object() {
            return Err(anyhow!("manifest root must be a mapping"));
        }
        Ok(json)
    }
}

#[async_trait::async_trait]
impl ManifestParser for YamlManifestParser {
    async fn parse(&self, text: &str) -> PaasResult<Json> {
        Self::parse_sync(text).map_err(|e| PaasError::domain(format!("{:#}", e), 400))
    }
}

static VARIABLE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"\$\{([A-Za-z][A-Za-z0-9_\-\.]*)\}").expect("static regex")
});

/// Replace `${NAME}` with job variables. Unknown names are left as written.
pub fn substitute_variables(text: &str, variables: &BTreeMap<String, String>) -> String {
    VARIABLE
        .replace_all(text, |caps: &Captures<'_>| match variables.get(&caps[1]) {
            Some(v) => v.clone(),
            None => caps[0].to_string(),
        })
        .into_owned()
}
