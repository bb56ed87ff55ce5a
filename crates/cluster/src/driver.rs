use paas_core::{CompiledDeployment, PaasResult};
use serde::{Deserialize, Serialize};

/// What one transcriber sent to a cluster, as `Kind/name` entries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Transcribed {
    pub transcriber: String,
    pub objects: Vec<String>,
}

/// Per-cluster results of a deploy or expose.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterReport {
    pub cluster: String,
    pub transcribed: Vec<Transcribed>,
}

/// A configured connection to one cluster.
#[async_trait::async_trait]
pub trait Driver: Send + Sync {
    fn cluster_name(&self) -> &str;
    async fn deploy(&self, cd: &CompiledDeployment) -> PaasResult<ClusterReport>;
    async fn expose(&self, cd: &CompiledDeployment) -> PaasResult<ClusterReport>;
}
