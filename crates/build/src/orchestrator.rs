//! Runs a batch of processes concurrently. The first failure cancels the
//! others and becomes the batch's only error.

use std::time::{Duration, Instant};

use futures::stream::{FuturesUnordered, StreamExt};
use metrics::{counter, histogram};
use paas_core::{PaasError, PaasResult};
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

use crate::process::{ProcessHandle, ProcessOutput};

pub struct BuildJob {
    pub name: String,
    pub handle: Box<dyn ProcessHandle>,
}

impl BuildJob {
    pub fn new(name: impl Into<String>, handle: Box<dyn ProcessHandle>) -> Self {
        Self { name: name.into(), handle }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BuildOrchestrator {
    /// Wall clock for the whole batch; zero means unbounded.
    pub deadline: Duration,
    /// Extra time granted past the deadline before the batch is cancelled.
    pub grace: Duration,
}

impl Default for BuildOrchestrator {
    fn default() -> Self {
        Self { deadline: Duration::ZERO, grace: Duration::from_secs(5) }
    }
}

struct Finished {
    name: String,
    outcome: PaasResult<ProcessOutput>,
}

async fn drive(name: String, mut handle: Box<dyn ProcessHandle>, mut cancel: oneshot::Receiver<()>) -> Finished {
    if let Err(e) = handle.start().await {
        return Finished { name, outcome: Err(e) };
    }
    let waited = tokio::select! {
        r = handle.wait() => Some(r),
        _ = &mut cancel => None,
    };
    let outcome = match waited {
        Some(r) => r,
        None => {
            handle.stop().await;
            Err(PaasError::execution(format!("`{}` cancelled", name), 499))
        }
    };
    Finished { name, outcome }
}

fn failure_of(name: &str, out: &ProcessOutput) -> PaasError {
    let detail = if out.stderr.trim().is_empty() { out.stdout.trim() } else { out.stderr.trim() };
    if detail.is_empty() {
        return PaasError::execution(format!("`{}` failed", name), 500);
    }
    PaasError::execution(detail.to_string(), 500)
}

impl BuildOrchestrator {
    /// Start every job and wait for all of them. `on_success` sees each
    /// success observed before the first failure, once.
    pub async fn run<F>(&self, jobs: Vec<BuildJob>, mut on_success: F) -> PaasResult<()>
    where
        F: FnMut(&str, &ProcessOutput) -> PaasResult<()>,
    {
        if jobs.is_empty() {
            return Ok(());
        }
        let t0 = Instant::now();
        let total = jobs.len();
        let mut cancels = Vec::with_capacity(total);
        let mut running = FuturesUnordered::new();
        for job in jobs {
            let (tx, rx) = oneshot::channel();
            cancels.push(tx);
            debug!(job = %job.name, "build job queued");
            running.push(tokio::spawn(drive(job.name, job.handle, rx)));
        }

        let cancel_all = |cancels: &mut Vec<oneshot::Sender<()>>| {
            for tx in cancels.drain(..) {
                let _ = tx.send(());
            }
        };

        let mut first_error: Option<PaasError> = None;
        let deadline = (!self.deadline.is_zero()).then(|| tokio::time::Instant::now() + self.deadline + self.grace);
        loop {
            let next = match deadline {
                Some(at) => match tokio::time::timeout_at(at, running.next()).await {
                    Ok(n) => n,
                    Err(_) => {
                        warn!(jobs = total, deadline_s = self.deadline.as_secs(), "build batch exceeded its deadline");
                        cancel_all(&mut cancels);
                        if first_error.is_none() {
                            first_error = Some(PaasError::execution(
                                format!("builds did not finish within {}s", self.deadline.as_secs()),
                                504,
                            ));
                        }
                        // Cancelled jobs settle promptly; drain them without a deadline.
                        while running.next().await.is_some() {}
                        break;
                    }
                },
                None => running.next().await,
            };
            let Some(joined) = next else { break };
            let finished = match joined {
                Ok(f) => f,
                Err(e) => Finished { name: "?".into(), outcome: Err(PaasError::from_infra(e)) },
            };
            if first_error.is_some() {
                continue;
            }
            let failed = match finished.outcome {
                Ok(out) if out.success => {
                    counter!("build_jobs_total", 1u64, "outcome" => "success");
                    on_success(&finished.name, &out).err()
                }
                Ok(out) => Some(failure_of(&finished.name, &out)),
                Err(e) => Some(e),
            };
            if let Some(e) = failed {
                counter!("build_jobs_total", 1u64, "outcome" => "failure");
                warn!(job = %finished.name, error = %e, "build job failed, cancelling the others");
                first_error = Some(e);
                cancel_all(&mut cancels);
            }
        }

        histogram!("build_batch_ms", t0.elapsed().as_millis() as f64);
        match first_error {
            Some(e) => Err(e),
            None => {
                info!(jobs = total, took_ms = t0.elapsed().as_millis() as u64, "build batch finished");
                Ok(())
            }
        }
    }
}
