//! Value types held by a `CompiledDeployment`.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::defaults::Resolvable;
use crate::quota::ResourceSet;

fn registry_url(registry: Option<&str>, name: &str) -> String {
    match registry {
        Some(r) => format!("{}/{}", r.trim().trim_end_matches('/'), name.trim()).trim_start_matches('/').to_string(),
        None => name.trim().to_string(),
    }
}

/// An OCI image built from a directory of the source repository.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Image {
    pub name: String,
    pub path: String,
    pub tag: Option<String>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub registry: Option<String>,
}

/// An image rebuilt from `original_name` with volumes copied into its filesystem,
/// so files can be shared without a sidecar pod.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EmbeddedVolumeImage {
    pub name: String,
    pub tag: Option<String>,
    pub original_name: String,
    pub volumes: Vec<Volume>,
    #[serde(default)]
    pub registry: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Buildable {
    Image(Image),
    Embedded(EmbeddedVolumeImage),
}

impl Buildable {
    pub fn name(&self) -> &str {
        match self {
            Buildable::Image(i) => &i.name,
            Buildable::Embedded(e) => &e.name,
        }
    }

    pub fn tag(&self) -> Option<&str> {
        match self {
            Buildable::Image(i) => i.tag.as_deref(),
            Buildable::Embedded(e) => e.tag.as_deref(),
        }
    }

    pub fn registry(&self) -> Option<&str> {
        match self {
            Buildable::Image(i) => i.registry.as_deref(),
            Buildable::Embedded(e) => e.registry.as_deref(),
        }
    }

    /// `registry/name`, trimmed.
    pub fn url(&self) -> String { registry_url(self.registry(), self.name()) }

    pub fn with_registry(&self, registry: &str) -> Buildable {
        let mut next = self.clone();
        match &mut next {
            Buildable::Image(i) => i.registry = Some(registry.to_string()),
            Buildable::Embedded(e) => e.registry = Some(registry.to_string()),
        }
        next
    }

    pub fn variables(&self) -> Option<&BTreeMap<String, String>> {
        match self {
            Buildable::Image(i) => Some(&i.variables),
            Buildable::Embedded(_) => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum VolumeKind {
    /// Files from the repository, shipped as an image.
    Embedded {
        local_path: String,
        paths: Vec<String>,
        #[serde(default)]
        registry: Option<String>,
        #[serde(default)]
        tag: Option<String>,
    },
    Persistent {
        storage_identifier: Resolvable,
        storage_size: Resolvable,
        #[serde(default)]
        reset_on_deployment: bool,
        #[serde(default)]
        write_many: bool,
    },
    Secret { secret_identifier: String },
    Map { map_identifier: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Volume {
    pub name: String,
    pub mount_path: String,
    #[serde(flatten)]
    pub kind: VolumeKind,
}

impl Volume {
    /// Same volume mounted elsewhere.
    pub fn import(&self, mount_path: &str) -> Volume {
        Volume { mount_path: mount_path.to_string(), ..self.clone() }
    }

    pub fn is_embedded(&self) -> bool { matches!(self.kind, VolumeKind::Embedded { .. }) }
    pub fn is_persistent(&self) -> bool { matches!(self.kind, VolumeKind::Persistent { .. }) }

    /// Image URL of an embedded volume, once its registry is known.
    pub fn url(&self) -> Option<String> {
        match &self.kind {
            VolumeKind::Embedded { registry: Some(r), .. } => Some(registry_url(Some(r), &self.name)),
            _ => None,
        }
    }
}

/// A command run inside the repository before images are built.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HookSpec {
    pub name: String,
    pub command: Vec<String>,
    /// Seconds; `None` or zero means unbounded.
    #[serde(default)]
    pub timeout: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum UpgradeStrategy {
    #[default]
    RollingUpgrade,
    Recreate,
    OnDelete,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Upgrade {
    pub strategy: UpgradeStrategy,
    pub max_upgrading_pods: u32,
    pub max_unavailable_pods: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct PodSecurity {
    pub allow_root: bool,
    pub fs_group: Option<i64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "probe", rename_all = "snake_case")]
pub enum Probe {
    Command { command: Vec<String> },
    Http { port: u16, path: String, is_secure: bool },
    Tcp { port: u16 },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthCheck {
    pub initial_delay: u32,
    pub period: u32,
    pub probe: Probe,
    pub success_threshold: u32,
    pub failure_threshold: u32,
}

/// A mounted volume, referenced by name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VolumeMount {
    pub name: String,
    pub mount_path: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ContainerEnv {
    pub values: BTreeMap<String, String>,
    /// `VAR -> (map, key)`
    pub from_maps: BTreeMap<String, (String, String)>,
    /// `VAR -> (secret, key)`
    pub from_secrets: BTreeMap<String, (String, String)>,
    pub import_maps: Vec<String>,
    pub import_secrets: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub name: String,
    /// Buildable name, or an external image reference.
    pub image: String,
    pub version: Option<String>,
    pub listen: SmallVec<[u16; 4]>,
    pub volumes: Vec<VolumeMount>,
    pub env: ContainerEnv,
    pub healthcheck: Option<HealthCheck>,
    pub resources: ResourceSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pod {
    pub name: String,
    pub replicas: u32,
    pub containers: Vec<Container>,
    pub oci_registry_config_name: Option<Resolvable>,
    pub upgrade: Upgrade,
    pub security: PodSecurity,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Secret {
    pub name: String,
    pub provider: String,
    #[serde(rename = "type")]
    pub secret_type: String,
    pub options: BTreeMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigMap {
    pub name: String,
    pub data: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "UPPERCASE")]
pub enum Protocol {
    #[default]
    Tcp,
    Udp,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transport {
    pub listen: u16,
    pub target: u16,
    pub protocol: Protocol,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub pod_name: String,
    pub ports: Vec<Transport>,
    pub internal: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IngressPath {
    pub path: String,
    pub service: String,
    pub port: u16,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ingress {
    pub name: String,
    pub host: String,
    pub provider: Option<Resolvable>,
    pub default_service: Option<String>,
    pub default_port: Option<u16>,
    pub paths: Vec<IngressPath>,
    pub tls_secret: Option<String>,
    pub https_backend: bool,
    pub meta: BTreeMap<String, String>,
}
