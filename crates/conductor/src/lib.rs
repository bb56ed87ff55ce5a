//! PaaS conductor: turns a manifest into a `CompiledDeployment`.
//!
//! Lifecycle is `configure` (job + workspace), `prepare` (parse and check the
//! required sections), then `compile_deployment`. A conductor serves a single
//! job; build a new one for the next.

#![forbid(unsafe_code)]

pub mod features;
pub mod manifest;
pub mod sections;

use std::sync::Arc;

use metrics::{counter, histogram};
use paas_core::keys::{INGRESS_PROVIDER, OCI_REGISTRY_CONFIG_NAME, STORAGE_PROVIDER, STORAGE_SIZE};
use paas_core::{CompiledDeployment, DefaultsBag, JobUnit, JobWorkspace, PaasError, PaasResult, QuotaDeclaration, QuotaSet};
use serde_json::Value as Json;
use tracing::{debug, info, warn};

pub use features::{FeatureValidator, FeaturesRequirement, StaticFeatures};
pub use manifest::{substitute_variables, ManifestParser, YamlManifestParser};
pub use sections::{default_compilers, CompileContext, HookCatalog, SectionCompiler};

pub const SUPPORTED_VERSION: &str = "v1";

/// Collaborators and knobs shared by every conductor of a process.
#[derive(Clone)]
pub struct ConductorSettings {
    pub parser: Arc<dyn ManifestParser>,
    pub compilers: Vec<Arc<dyn SectionCompiler>>,
    pub hooks: HookCatalog,
    pub validators: Vec<Arc<dyn FeatureValidator>>,
    /// Sections every manifest must carry, on top of `paas.requires`.
    pub mandatory: Vec<String>,
}

impl Default for ConductorSettings {
    fn default() -> Self {
        Self {
            parser: Arc::new(YamlManifestParser),
            compilers: default_compilers(),
            hooks: HookCatalog::default(),
            validators: Vec::new(),
            mandatory: vec!["paas".to_string()],
        }
    }
}

enum State {
    Unconfigured,
    Configured { job: Arc<JobUnit>, workspace: Arc<dyn JobWorkspace> },
    Prepared { job: Arc<JobUnit>, workspace: Arc<dyn JobWorkspace>, manifest: Json },
    Failed,
}

impl State {
    fn label(&self) -> &'static str {
        match self {
            State::Unconfigured => "unconfigured",
            State::Configured { .. } => "configured",
            State::Prepared { .. } => "prepared",
            State::Failed => "failed",
        }
    }
}

pub struct Conductor {
    settings: ConductorSettings,
    state: State,
}

impl Conductor {
    pub fn new(settings: ConductorSettings) -> Self {
        Self { settings, state: State::Unconfigured }
    }

    pub fn is_prepared(&self) -> bool { matches!(self.state, State::Prepared { .. }) }

    pub fn workspace(&self) -> Option<&Arc<dyn JobWorkspace>> {
        match &self.state {
            State::Configured { workspace, .. } | State::Prepared { workspace, .. } => Some(workspace),
            _ => None,
        }
    }

    pub fn configure(&mut self, job: Arc<JobUnit>, workspace: Arc<dyn JobWorkspace>) -> PaasResult<()> {
        if !matches!(self.state, State::Unconfigured) {
            return Err(PaasError::AlreadyConfigured(format!("conductor is {}", self.state.label())));
        }
        debug!(job = %job.id, "conductor configured");
        self.state = State::Configured { job, workspace };
        Ok(())
    }

    /// Parse `text` and check every required section is consumed by a
    /// compiler or a validator. On failure the conductor is left `Failed`.
    pub async fn prepare(&mut self, text: &str) -> PaasResult<()> {
        let (job, workspace) = match &self.state {
            State::Configured { job, workspace } => (job.clone(), workspace.clone()),
            State::Unconfigured => return Err(PaasError::NotConfigured("conductor has no job".into())),
            other => return Err(PaasError::AlreadyConfigured(format!("conductor is {}", other.label()))),
        };
        match self.check(&job, text).await {
            Ok(manifest) => {
                self.state = State::Prepared { job, workspace, manifest };
                Ok(())
            }
            Err(e) => {
                counter!("conductor_prepare_failures", 1u64);
                self.state = State::Failed;
                Err(e)
            }
        }
    }

    async fn check(&self, job: &JobUnit, text: &str) -> PaasResult<Json> {
        let text = substitute_variables(text, &job.variables);
        let manifest = self.settings.parser.parse(&text).await?;

        let paas = manifest.get("paas").ok_or_else(|| PaasError::domain("manifest requires a `paas` section", 400))?;
        match paas.get("version").and_then(Json::as_str) {
            Some(SUPPORTED_VERSION) => {}
            Some(other) => return Err(PaasError::domain(format!("unsupported manifest version `{}`", other), 400)),
            None => return Err(PaasError::domain("manifest requires `paas.version`", 400)),
        }

        let mut requirements = FeaturesRequirement::new(self.settings.mandatory.iter().cloned());
        if let Some(requires) = paas.get("requires") {
            for r in sections::string_list(Some(requires), "`paas.requires`")? {
                requirements.require(r);
            }
        }
        requirements.validate("paas");
        for compiler in &self.settings.compilers {
            if manifest.get(compiler.section()).is_some() {
                requirements.validate(compiler.section());
            }
        }
        for validator in &self.settings.validators {
            validator.validate(&manifest, &mut requirements);
        }
        requirements.check_all_validated()?;
        Ok(manifest)
    }

    /// Compile the prepared manifest. The arguments seed the root defaults;
    /// they are always defined there, possibly as `None`.
    pub fn compile_deployment(
        &self,
        storage_identifier: Option<&str>,
        storage_size: Option<&str>,
        default_oci_registry_config: Option<&str>,
    ) -> PaasResult<Arc<CompiledDeployment>> {
        let (job, manifest) = match &self.state {
            State::Prepared { job, manifest, .. } => (job, manifest),
            State::Unconfigured | State::Configured { .. } => {
                return Err(PaasError::NotConfigured("manifest is not prepared".into()))
            }
            State::Failed => return Err(PaasError::domain("conductor failed to prepare the manifest", 400)),
        };
        let t0 = std::time::Instant::now();

        let deployment = CompiledDeployment::new(
            SUPPORTED_VERSION,
            job.prefix.clone(),
            Some(job.project.name.clone()),
        );
        let root = deployment.defaults();
        root.set(STORAGE_PROVIDER, storage_identifier)
            .set(STORAGE_SIZE, storage_size)
            .set(OCI_REGISTRY_CONFIG_NAME, default_oci_registry_config)
            .set(INGRESS_PROVIDER, None);
        seed(root, job);

        let mut quotas = QuotaSet::from_declarations(&job.quotas)?;
        if let Some(raw) = manifest.get("paas").and_then(|p| p.get("quotas")) {
            let decls: Vec<QuotaDeclaration> = serde_json::from_value(raw.clone())
                .map_err(|e| PaasError::domain(format!("invalid `paas.quotas`: {}", e), 400))?;
            quotas.merge(&decls)?;
        }

        let mut ctx = CompileContext { deployment: &deployment, job, quotas, hooks: &self.settings.hooks };
        for compiler in &self.settings.compilers {
            let Some(definitions) = manifest.get(compiler.section()) else { continue };
            if definitions.is_null() {
                continue;
            }
            compiler.compile(definitions, &mut ctx).map_err(|e| {
                warn!(job = %job.id, section = compiler.section(), error = %e, "compilation failed");
                e
            })?;
        }

        let ms = t0.elapsed().as_millis() as f64;
        histogram!("conductor_compile_ms", ms);
        counter!("conductor_compilations", 1u64);
        let summary = deployment.summary();
        info!(
            job = %job.id,
            pods = summary.pods.len(),
            buildables = summary.buildables.len(),
            services = summary.services.len(),
            rejected = summary.rejected.len(),
            took_ms = %ms,
            "deployment compiled"
        );
        Ok(Arc::new(deployment))
    }
}

/// Job-level defaults, then per-cluster defaults from the job's clusters.
fn seed(root: &DefaultsBag, job: &JobUnit) {
    for (k, v) in &job.defaults {
        root.set(k, v.as_deref());
    }
    for cluster in &job.clusters {
        let bag = root.for_cluster(&cluster.name);
        for (k, v) in &cluster.defaults {
            bag.set(k, v.as_deref());
        }
    }
}
