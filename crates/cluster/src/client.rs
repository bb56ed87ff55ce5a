use std::time::Instant;

use futures::future::join_all;
use metrics::histogram;
use paas_core::{CompiledDeployment, PaasResult};
use tracing::{info, warn};

use crate::directory::ClusterClients;
use crate::driver::ClusterReport;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Action {
    Deploy,
    Expose,
}

/// Sends one compiled deployment to every cluster at once. Each cluster runs
/// sequentially; the call settles after all of them did.
pub struct MultiClusterClient {
    clients: ClusterClients,
}

impl MultiClusterClient {
    pub fn new(clients: ClusterClients) -> Self { Self { clients } }

    pub fn clients(&self) -> &ClusterClients { &self.clients }

    pub async fn deploy(&self, cd: &CompiledDeployment) -> PaasResult<Vec<ClusterReport>> {
        self.fan_out(Action::Deploy, cd).await
    }

    pub async fn expose(&self, cd: &CompiledDeployment) -> PaasResult<Vec<ClusterReport>> {
        self.fan_out(Action::Expose, cd).await
    }

    /// All clusters settle; the first failure in cluster order wins.
    async fn fan_out(&self, action: Action, cd: &CompiledDeployment) -> PaasResult<Vec<ClusterReport>> {
        let t0 = Instant::now();
        let calls = self.clients.iter().map(|driver| async move {
            let res = match action {
                Action::Deploy => driver.deploy(cd).await,
                Action::Expose => driver.expose(cd).await,
            };
            if let Err(e) = &res {
                warn!(cluster = %driver.cluster_name(), action = ?action, error = %e, "cluster call failed");
            }
            res
        });
        let settled = join_all(calls).await;
        histogram!("cluster_fan_out_ms", t0.elapsed().as_millis() as f64);
        let reports = settled.into_iter().collect::<PaasResult<Vec<_>>>()?;
        info!(action = ?action, clusters = reports.len(), "fan-out done");
        Ok(reports)
    }
}
