//! PaaS core: the compiled deployment model, hierarchical defaults and the
//! quota engine. Pure data and bookkeeping; no I/O besides the job workspace.

#![forbid(unsafe_code)]

pub mod defaults;
pub mod deployment;
pub mod error;
pub mod job;
pub mod model;
pub mod quota;
pub mod workspace;

pub use defaults::{DefaultsBag, Reference, Resolvable};
pub use deployment::{CompiledDeployment, DeploymentSummary, RejectedPod};
pub use error::{PaasError, PaasResult};
pub use job::{ClusterDefinition, Identity, ImageRegistry, JobUnit, ProjectRef, SourceRepository};
pub use quota::{Availability, QuotaDeclaration, QuotaSet, Resource, ResourceSet, UnitFamily};
pub use workspace::{JobWorkspace, LocalWorkspace};

pub mod prelude {
    pub use super::model::*;
    pub use super::{CompiledDeployment, DefaultsBag, PaasError, PaasResult, Reference, Resolvable};
}

/// Well-known names in the defaults bag.
pub mod keys {
    pub const STORAGE_PROVIDER: &str = "storage-provider";
    pub const STORAGE_SIZE: &str = "storage-size";
    pub const OCI_REGISTRY_CONFIG_NAME: &str = "oci-registry-config-name";
    pub const INGRESS_PROVIDER: &str = "ingress-provider";
}
