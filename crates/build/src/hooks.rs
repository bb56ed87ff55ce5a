use std::sync::Arc;
use std::time::{Duration, Instant};

use metrics::histogram;
use paas_core::{CompiledDeployment, JobUnit, JobWorkspace, PaasError, PaasResult};
use tracing::info;

use crate::env::build_env;
use crate::process::ProcessSpawner;

/// Runs the deployment's hooks one after the other inside the repository.
pub struct HookRunner {
    spawner: Arc<dyn ProcessSpawner>,
    default_timeout: Duration,
}

impl HookRunner {
    pub fn new(spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self { spawner, default_timeout: Duration::ZERO }
    }

    pub fn with_default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Returns the names of the hooks that ran. The first failure aborts.
    pub async fn run(&self, cd: &CompiledDeployment, job: &JobUnit, workspace: &dyn JobWorkspace) -> PaasResult<Vec<String>> {
        let mut hooks = Vec::new();
        cd.for_each_hook(|h| hooks.push(h.clone()));
        let env = build_env(&job.variables, &job.images_registry);
        let cwd = workspace.repository_path();
        let mut ran = Vec::with_capacity(hooks.len());
        for hook in hooks {
            let t0 = Instant::now();
            let mut handle = self.spawner.spawn(hook.command.clone(), &cwd);
            handle.set_env(env.clone());
            handle.set_timeout(hook.timeout.map(Duration::from_secs).unwrap_or(self.default_timeout));
            handle.start().await?;
            let out = handle.wait().await?;
            histogram!("hook_ms", t0.elapsed().as_millis() as f64);
            if !out.success {
                let detail = if out.stderr.trim().is_empty() { out.stdout.trim() } else { out.stderr.trim() };
                return Err(PaasError::execution(format!("hook `{}` failed: {}", hook.name, detail), 500));
            }
            info!(job = %job.id, hook = %hook.name, took_ms = t0.elapsed().as_millis() as u64, "hook done");
            ran.push(hook.name);
        }
        Ok(ran)
    }
}
