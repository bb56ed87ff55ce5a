//! The fixed steps of a job, in order.

use std::sync::Arc;
use std::time::Duration;

use paas_cluster::MultiClusterClient;
use paas_conductor::Conductor;
use paas_core::{JobUnit, JobWorkspace, LocalWorkspace, PaasError, PaasResult};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::kitchen::Kitchen;
use crate::plan::{keys, WorkPlan};
use crate::sink::HistoryEvent;
use crate::step::{Flow, Step};
use crate::timer::JobTimer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Ping,
    SetTimeout,
    ReceiveJob,
    Deserialize,
    PrepareWorkspace,
    ConfigureCloningAgent,
    CloneRepository,
    ConfigureConductor,
    ReadDeploymentConfig,
    CompileDeployment,
    PreBuildHook,
    ConnectRegistry,
    BuildImages,
    BuildVolumes,
    ConnectCluster,
    Deploy,
    Expose,
    Final,
    SendHistory,
    UnsetTimeout,
}

impl Stage {
    pub const ALL: [(u32, Stage); 20] = [
        (10, Stage::Ping),
        (20, Stage::SetTimeout),
        (30, Stage::ReceiveJob),
        (40, Stage::Deserialize),
        (50, Stage::PrepareWorkspace),
        (60, Stage::ConfigureCloningAgent),
        (70, Stage::CloneRepository),
        (80, Stage::ConfigureConductor),
        (90, Stage::ReadDeploymentConfig),
        (100, Stage::CompileDeployment),
        (110, Stage::PreBuildHook),
        (120, Stage::ConnectRegistry),
        (130, Stage::BuildImages),
        (140, Stage::BuildVolumes),
        (150, Stage::ConnectCluster),
        (160, Stage::Deploy),
        (170, Stage::Expose),
        (180, Stage::Final),
        (190, Stage::SendHistory),
        (200, Stage::UnsetTimeout),
    ];

    pub fn label(&self) -> &'static str {
        match self {
            Stage::Ping => "ping",
            Stage::SetTimeout => "set timeout",
            Stage::ReceiveJob => "receive job",
            Stage::Deserialize => "deserialize",
            Stage::PrepareWorkspace => "prepare workspace",
            Stage::ConfigureCloningAgent => "configure cloning agent",
            Stage::CloneRepository => "clone repository",
            Stage::ConfigureConductor => "configure conductor",
            Stage::ReadDeploymentConfig => "read deployment config",
            Stage::CompileDeployment => "compile deployment",
            Stage::PreBuildHook => "pre-build hook",
            Stage::ConnectRegistry => "connect registry",
            Stage::BuildImages => "build images",
            Stage::BuildVolumes => "build volumes",
            Stage::ConnectCluster => "connect cluster",
            Stage::Deploy => "deploy",
            Stage::Expose => "expose",
            Stage::Final => "final",
            Stage::SendHistory => "send history",
            Stage::UnsetTimeout => "unset timeout",
        }
    }
}

fn job(plan: &WorkPlan) -> PaasResult<Arc<JobUnit>> { plan.get(keys::JOB).cloned() }

fn workspace(plan: &WorkPlan) -> PaasResult<Arc<dyn JobWorkspace>> { plan.get(keys::WORKSPACE).cloned() }

/// Summary of what the job did so far; the payload of the final history.
pub fn result_of(plan: &WorkPlan) -> serde_json::Value {
    let names = |k| plan.get(k).cloned().unwrap_or_default();
    json!({
        "job": plan.get(keys::JOB).ok().map(|j| j.id.clone()),
        "deployment": plan.get(keys::DEPLOYMENT).ok().map(|cd| cd.summary()),
        "hooks": names(keys::HOOKS_RUN),
        "images": names(keys::IMAGES_BUILT),
        "volumes": names(keys::VOLUMES_BUILT),
        "deployed": plan.get(keys::DEPLOYED).ok(),
        "exposed": plan.get(keys::EXPOSED).ok(),
    })
}

#[async_trait::async_trait]
impl Step for Stage {
    fn name(&self) -> &str { self.label() }

    async fn run(&self, plan: &mut WorkPlan, k: &Kitchen) -> PaasResult<Flow> {
        match self {
            Stage::Ping => k.source.ping().await?,
            Stage::SetTimeout => k.timer.set(JobTimer::budget_from_env()),
            Stage::ReceiveJob => {
                let raw = k.source.receive().await?;
                debug!(bytes = raw.len(), "job received");
                plan.set(keys::RAW_JOB, raw);
            }
            Stage::Deserialize => {
                let raw = plan.take(keys::RAW_JOB)?;
                let unit = JobUnit::from_json(&raw)?;
                if let Some(secs) = unit.timeout.filter(|s| *s > 0) {
                    k.timer.rearm(Duration::from_secs(secs));
                }
                info!(job = %unit.id, project = %unit.project.name, environment = %unit.environment, "job accepted");
                plan.set(keys::JOB, Arc::new(unit));
            }
            Stage::PrepareWorkspace => {
                let unit = job(plan)?;
                let ws: Arc<dyn JobWorkspace> = Arc::new(LocalWorkspace::new(&k.config.workspace_base, &unit.id));
                ws.prepare()?;
                plan.set(keys::WORKSPACE, ws);
            }
            Stage::ConfigureCloningAgent => {
                let (unit, ws) = (job(plan)?, workspace(plan)?);
                let request = k.cloning.configure(&unit.source_repository, ws.repository_path())?;
                plan.set(keys::CLONE_REQUEST, request);
            }
            Stage::CloneRepository => {
                let request = plan.get(keys::CLONE_REQUEST)?;
                k.cloning.clone_repository(request).await?;
            }
            Stage::ConfigureConductor => {
                let mut conductor = Conductor::new(k.conductor.clone());
                conductor.configure(job(plan)?, workspace(plan)?)?;
                plan.set(keys::CONDUCTOR, conductor);
            }
            Stage::ReadDeploymentConfig => {
                let text = workspace(plan)?.read_file(&k.config.manifest_file)?;
                plan.set(keys::MANIFEST, text);
            }
            Stage::CompileDeployment => {
                let text = plan.take(keys::MANIFEST)?;
                let conductor = plan.get_mut(keys::CONDUCTOR)?;
                conductor.prepare(&text).await?;
                let cd = conductor.compile_deployment(
                    k.config.storage_provider.as_deref(),
                    k.config.storage_size.as_deref(),
                    k.config.oci_registry_config.as_deref(),
                )?;
                plan.set(keys::DEPLOYMENT, cd);
            }
            Stage::PreBuildHook => {
                let (unit, ws, cd) = (job(plan)?, workspace(plan)?, plan.get(keys::DEPLOYMENT)?.clone());
                let ran = k.hooks.run(&cd, &unit, ws.as_ref()).await?;
                plan.set(keys::HOOKS_RUN, ran);
            }
            Stage::ConnectRegistry => {
                let unit = job(plan)?;
                let registry = unit.images_registry.url.trim();
                if registry.is_empty() {
                    return Err(PaasError::domain("image registry has no url", 400));
                }
                if unit.images_registry.identity.is_none() {
                    warn!(job = %unit.id, registry, "registry without identity, pushes are anonymous");
                }
                debug!(registry, "registry configured");
            }
            Stage::BuildImages => {
                let (unit, ws, cd) = (job(plan)?, workspace(plan)?, plan.get(keys::DEPLOYMENT)?.clone());
                let built = k.builder.build_images(&cd, &unit, ws.as_ref()).await?;
                plan.set(keys::IMAGES_BUILT, built);
            }
            Stage::BuildVolumes => {
                let (unit, ws, cd) = (job(plan)?, workspace(plan)?, plan.get(keys::DEPLOYMENT)?.clone());
                let built = k.builder.build_volumes(&cd, &unit, ws.as_ref()).await?;
                plan.set(keys::VOLUMES_BUILT, built);
            }
            Stage::ConnectCluster => {
                let unit = job(plan)?;
                if unit.clusters.is_empty() {
                    warn!(job = %unit.id, "job targets no cluster");
                }
                let clients = k.directory.require_all(&unit.clusters)?;
                plan.set(keys::CLUSTERS, Arc::new(MultiClusterClient::new(clients)));
            }
            Stage::Deploy => {
                let (client, cd) = (plan.get(keys::CLUSTERS)?.clone(), plan.get(keys::DEPLOYMENT)?.clone());
                let reports = client.deploy(&cd).await?;
                plan.set(keys::DEPLOYED, reports);
            }
            Stage::Expose => {
                let (client, cd) = (plan.get(keys::CLUSTERS)?.clone(), plan.get(keys::DEPLOYMENT)?.clone());
                let reports = client.expose(&cd).await?;
                plan.set(keys::EXPOSED, reports);
            }
            Stage::Final => {
                let result = result_of(plan);
                if !k.config.keep_workspace {
                    workspace(plan)?.clean()?;
                }
                plan.set(keys::RESULT, result);
            }
            Stage::SendHistory => {
                let result = plan.get(keys::RESULT).cloned().unwrap_or_else(|_| result_of(plan));
                let event = HistoryEvent {
                    job_id: job(plan).ok().map(|j| j.id.clone()),
                    step: self.label().to_string(),
                    ts: chrono::Utc::now().timestamp_millis(),
                    is_final: true,
                    extra: result,
                };
                k.sink.send(&event).await;
                plan.set(keys::FINAL_SENT, true);
            }
            Stage::UnsetTimeout => k.timer.unset(),
        }
        Ok(Flow::Continue)
    }
}
