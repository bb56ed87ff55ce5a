use paas_core::PaasResult;

use crate::kitchen::Kitchen;
use crate::plan::WorkPlan;

/// What the pipeline does after a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Stop here; the job is over without error.
    Finish,
}

/// One stage of the pipeline. An `Err` finishes the job with that error.
#[async_trait::async_trait]
pub trait Step: Send + Sync {
    fn name(&self) -> &str;
    async fn run(&self, plan: &mut WorkPlan, kitchen: &Kitchen) -> PaasResult<Flow>;
}
