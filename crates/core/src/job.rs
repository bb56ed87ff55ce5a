//! The unit of work received by the engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::error::{PaasError, PaasResult};
use crate::quota::QuotaDeclaration;

/// Credentials for a registry, a repository or a cluster.
#[derive(Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Identity {
    pub user: String,
    pub password: String,
    pub token: Option<String>,
    pub ca_certificate: Option<String>,
    pub client_certificate: Option<String>,
    pub client_key: Option<String>,
}

impl std::fmt::Debug for Identity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Identity").field("user", &self.user).finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceRepository {
    pub url: String,
    #[serde(default)]
    pub branch: Option<String>,
    #[serde(default)]
    pub identity: Option<Identity>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageRegistry {
    pub url: String,
    #[serde(default)]
    pub identity: Option<Identity>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterDefinition {
    pub name: String,
    /// Driver type, e.g. `kubernetes`.
    #[serde(rename = "type")]
    pub cluster_type: String,
    pub address: String,
    #[serde(default)]
    pub namespace: Option<String>,
    #[serde(default)]
    pub use_hierarchical_namespaces: bool,
    #[serde(default)]
    pub identity: Option<Identity>,
    /// Defaults layered into this cluster's scope of the defaults bag.
    #[serde(default)]
    pub defaults: BTreeMap<String, Option<String>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectRef {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobUnit {
    pub id: String,
    pub project: ProjectRef,
    #[serde(default)]
    pub prefix: Option<String>,
    pub environment: String,
    pub source_repository: SourceRepository,
    pub images_registry: ImageRegistry,
    #[serde(default)]
    pub clusters: Vec<ClusterDefinition>,
    #[serde(default)]
    pub variables: BTreeMap<String, String>,
    #[serde(default)]
    pub quotas: Vec<QuotaDeclaration>,
    #[serde(default)]
    pub defaults: BTreeMap<String, Option<String>>,
    /// Seconds allotted to the whole job.
    #[serde(default)]
    pub timeout: Option<u64>,
}

impl JobUnit {
    pub fn from_json(raw: &[u8]) -> PaasResult<Self> {
        let job: JobUnit = serde_json::from_slice(raw)?;
        if job.id.trim().is_empty() {
            return Err(PaasError::domain("job id is missing", 400));
        }
        Ok(job)
    }
}
