//! Collaborators shared by every step of a run.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use paas_build::{BuildOrchestrator, HookRunner, OciBuilder, ProcessSpawner};
use paas_cluster::Directory;
use paas_conductor::ConductorSettings;

use crate::cloning::{CloningAgent, GitCloningAgent};
use crate::sink::EventSink;
use crate::source::JobSource;
use crate::timer::JobTimer;

pub const DEFAULT_MANIFEST: &str = ".paas.yaml";

/// Knobs read from `PAAS_*` variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KitchenConfig {
    pub workspace_base: PathBuf,
    pub manifest_file: String,
    pub storage_provider: Option<String>,
    pub storage_size: Option<String>,
    pub oci_registry_config: Option<String>,
    pub build_binary: String,
    pub git_binary: String,
    /// Base image of generated volume images.
    pub volume_base_image: String,
    pub process_timeout: Duration,
    /// Wall clock of one build batch, plus `build_grace` before it is cancelled.
    pub build_deadline: Duration,
    pub build_grace: Duration,
    pub keep_workspace: bool,
}

impl Default for KitchenConfig {
    fn default() -> Self {
        Self {
            workspace_base: std::env::temp_dir(),
            manifest_file: DEFAULT_MANIFEST.to_string(),
            storage_provider: None,
            storage_size: None,
            oci_registry_config: None,
            build_binary: "buildah".to_string(),
            git_binary: "git".to_string(),
            volume_base_image: "alpine:3".to_string(),
            process_timeout: Duration::ZERO,
            build_deadline: Duration::from_secs(30 * 60),
            build_grace: Duration::from_secs(5),
            keep_workspace: false,
        }
    }
}

impl KitchenConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        let opt = |k: &str| std::env::var(k).ok().filter(|v| !v.trim().is_empty());
        let secs = |k: &str| opt(k).and_then(|s| s.parse().ok()).map(Duration::from_secs);
        Self {
            workspace_base: opt("PAAS_WORKSPACE_DIR").map(PathBuf::from).unwrap_or(d.workspace_base),
            manifest_file: opt("PAAS_MANIFEST_FILE").unwrap_or(d.manifest_file),
            storage_provider: opt("PAAS_STORAGE_PROVIDER"),
            storage_size: opt("PAAS_STORAGE_SIZE"),
            oci_registry_config: opt("PAAS_OCI_REGISTRY_CONFIG"),
            build_binary: opt("PAAS_BUILD_BINARY").unwrap_or(d.build_binary),
            git_binary: opt("PAAS_GIT_BINARY").unwrap_or(d.git_binary),
            volume_base_image: opt("PAAS_VOLUME_BASE_IMAGE").unwrap_or(d.volume_base_image),
            process_timeout: secs("PAAS_PROCESS_TIMEOUT_SECS").unwrap_or(d.process_timeout),
            build_deadline: secs("PAAS_BUILD_DEADLINE_SECS").unwrap_or(d.build_deadline),
            build_grace: secs("PAAS_BUILD_GRACE_SECS").unwrap_or(d.build_grace),
            keep_workspace: opt("PAAS_KEEP_WORKSPACE").map(|v| v == "1" || v == "true").unwrap_or(d.keep_workspace),
        }
    }
}

pub struct Kitchen {
    pub config: KitchenConfig,
    pub source: Arc<dyn JobSource>,
    pub sink: Arc<dyn EventSink>,
    pub cloning: Arc<dyn CloningAgent>,
    pub conductor: ConductorSettings,
    pub builder: OciBuilder,
    pub hooks: HookRunner,
    pub directory: Arc<Directory>,
    pub timer: JobTimer,
}

impl Kitchen {
    /// Git, builds and hooks all go through `spawner`.
    pub fn new(
        config: KitchenConfig,
        source: Arc<dyn JobSource>,
        sink: Arc<dyn EventSink>,
        spawner: Arc<dyn ProcessSpawner>,
        directory: Arc<Directory>,
    ) -> Self {
        let builder = OciBuilder::new(spawner.clone())
            .with_binary(config.build_binary.clone())
            .with_volume_base_image(config.volume_base_image.clone())
            .with_timeout(config.process_timeout)
            .with_orchestrator(BuildOrchestrator { deadline: config.build_deadline, grace: config.build_grace });
        let hooks = HookRunner::new(spawner.clone()).with_default_timeout(config.process_timeout);
        let cloning = GitCloningAgent::new(spawner).with_binary(config.git_binary.clone()).with_timeout(config.process_timeout);
        Self {
            cloning: Arc::new(cloning),
            config,
            source,
            sink,
            conductor: ConductorSettings::default(),
            builder,
            hooks,
            directory,
            timer: JobTimer::new(),
        }
    }

    pub fn with_cloning(mut self, cloning: Arc<dyn CloningAgent>) -> Self {
        self.cloning = cloning;
        self
    }

    pub fn with_conductor(mut self, settings: ConductorSettings) -> Self {
        self.conductor = settings;
        self
    }
}
