//! Ordered transcribers turning a compiled deployment into cluster objects.

use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use paas_core::{CompiledDeployment, DefaultsBag, PaasResult};
use tracing::debug;

use crate::api::ClusterApi;
use crate::driver::Transcribed;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Deploy,
    Expose,
}

/// Cluster-side context of one transcription run.
pub struct TranscribeContext<'a> {
    pub cluster_name: &'a str,
    /// Namespace workloads land in.
    pub namespace: &'a str,
    /// Parent namespace when hierarchical namespaces are used.
    pub parent_namespace: Option<&'a str>,
    /// Defaults scope of this cluster; deferred values resolve here.
    pub defaults: DefaultsBag,
    pub api: &'a dyn ClusterApi,
}

impl TranscribeContext<'_> {
    /// Object name carrying the deployment prefix.
    pub fn object_name(&self, cd: &CompiledDeployment, name: &str) -> String {
        cd.with_job_settings(|_, prefix, _| match prefix {
            Some(p) => format!("{}-{}", p, name),
            None => name.to_string(),
        })
    }
}

#[async_trait::async_trait]
pub trait Transcriber: Send + Sync {
    fn name(&self) -> &'static str;
    fn phases(&self) -> &'static [Phase];
    async fn transcribe(&self, cd: &CompiledDeployment, ctx: &TranscribeContext<'_>) -> PaasResult<Vec<String>>;
}

#[derive(Clone, Default)]
pub struct TranscriberCollection {
    items: Vec<Arc<dyn Transcriber>>,
}

impl TranscriberCollection {
    pub fn new() -> Self { Self::default() }

    pub fn add(&mut self, t: Arc<dyn Transcriber>) -> &mut Self {
        self.items.push(t);
        self
    }

    pub fn len(&self) -> usize { self.items.len() }
    pub fn is_empty(&self) -> bool { self.items.is_empty() }

    /// Run the transcribers of `phase` one by one, in registration order.
    /// The first failure is returned as is; later transcribers never run.
    pub async fn run_phase(&self, phase: Phase, cd: &CompiledDeployment, ctx: &TranscribeContext<'_>) -> PaasResult<Vec<Transcribed>> {
        let mut out = Vec::new();
        for t in self.items.iter().filter(|t| t.phases().contains(&phase)) {
            let t0 = Instant::now();
            let objects = t.transcribe(cd, ctx).await?;
            histogram!("transcribe_latency_ms", t0.elapsed().as_secs_f64() * 1000.0, "transcriber" => t.name());
            debug!(cluster = %ctx.cluster_name, transcriber = t.name(), objects = objects.len(), "transcribed");
            out.push(Transcribed { transcriber: t.name().to_string(), objects });
        }
        Ok(out)
    }
}
