//! Runs the steps of one job in priority order.

use std::sync::Arc;
use std::time::Instant;

use metrics::{counter, histogram};
use paas_core::PaasResult;
use serde_json::json;
use tracing::{debug, error, info, warn};

use crate::kitchen::Kitchen;
use crate::plan::{keys, WorkPlan};
use crate::sink::HistoryEvent;
use crate::stages::{result_of, Stage};
use crate::step::{Flow, Step};

struct Entry {
    priority: u32,
    fixed: bool,
    seq: usize,
    step: Arc<dyn Step>,
}

/// How a run ended without error.
pub struct Outcome {
    pub job_id: Option<String>,
    /// Steps that completed, in order.
    pub completed: Vec<String>,
    /// Step that asked to finish early, if any.
    pub finished_by: Option<String>,
    pub plan: WorkPlan,
}

impl std::fmt::Debug for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Outcome")
            .field("job_id", &self.job_id)
            .field("completed", &self.completed)
            .field("finished_by", &self.finished_by)
            .field("plan", &self.plan.names())
            .finish()
    }
}

pub struct Cookbook {
    kitchen: Kitchen,
    entries: Vec<Entry>,
}

impl Cookbook {
    pub fn new(kitchen: Kitchen) -> Self {
        let mut book = Self { kitchen, entries: Vec::new() };
        for (priority, stage) in Stage::ALL {
            book.insert(priority, true, Arc::new(stage));
        }
        book
    }

    pub fn kitchen(&self) -> &Kitchen { &self.kitchen }

    /// Extension point. A step sharing a priority with a fixed step runs right
    /// after it; steps sharing a priority run in registration order.
    pub fn add_step(&mut self, priority: u32, step: Arc<dyn Step>) -> &mut Self {
        self.insert(priority, false, step);
        self
    }

    fn insert(&mut self, priority: u32, fixed: bool, step: Arc<dyn Step>) {
        let seq = self.entries.len();
        self.entries.push(Entry { priority, fixed, seq, step });
        self.entries.sort_by_key(|e| (e.priority, !e.fixed, e.seq));
    }

    /// `(priority, name)` of every step, in run order.
    pub fn steps(&self) -> Vec<(u32, String)> {
        self.entries.iter().map(|e| (e.priority, e.step.name().to_string())).collect()
    }

    pub async fn run(&self) -> PaasResult<Outcome> { self.run_with(WorkPlan::new()).await }

    /// Run every step against `plan`. An error or an early finish skips the
    /// remaining steps; the final history is still sent and the timeout unset.
    pub async fn run_with(&self, mut plan: WorkPlan) -> PaasResult<Outcome> {
        let k = &self.kitchen;
        let t0 = Instant::now();
        let mut completed = Vec::with_capacity(self.entries.len());
        let mut finished_by = None;
        let mut failure = None;

        for entry in &self.entries {
            let name = entry.step.name().to_string();
            let started = Instant::now();
            let res = k.timer.guard(&name, entry.step.run(&mut plan, k)).await;
            histogram!("cookbook_step_ms", started.elapsed().as_secs_f64() * 1000.0, "step" => name.clone());
            match res {
                Ok(flow) => {
                    debug!(step = %name, priority = entry.priority, "step done");
                    if !plan.get(keys::FINAL_SENT).copied().unwrap_or(false) {
                        k.sink.send(&self.event(&plan, &name, false, json!({ "step": name }))).await;
                    }
                    completed.push(name.clone());
                    if flow == Flow::Finish {
                        finished_by = Some(name);
                        break;
                    }
                }
                Err(e) => {
                    error!(step = %name, code = e.code(), error = %e, "step failed");
                    failure = Some((name, e));
                    break;
                }
            }
        }

        let aborted = finished_by.is_some() || failure.is_some();
        if aborted {
            self.abort(&mut plan, failure.as_ref().map(|(s, e)| (s.as_str(), e))).await;
        }

        let job_id = plan.get(keys::JOB).ok().map(|j| j.id.clone());
        let took_ms = t0.elapsed().as_millis() as u64;
        match failure {
            Some((step, e)) => {
                counter!("cookbook_runs_total", 1u64, "outcome" => "failed");
                warn!(job = ?job_id, step = %step, took_ms, "job failed");
                Err(e)
            }
            None => {
                counter!("cookbook_runs_total", 1u64, "outcome" => "ok");
                info!(job = ?job_id, steps = completed.len(), finished_by = ?finished_by, took_ms, "job done");
                Ok(Outcome { job_id, completed, finished_by, plan })
            }
        }
    }

    async fn abort(&self, plan: &mut WorkPlan, failure: Option<(&str, &paas_core::PaasError)>) {
        let k = &self.kitchen;
        if !plan.get(keys::FINAL_SENT).copied().unwrap_or(false) {
            let mut extra = plan.get(keys::RESULT).cloned().unwrap_or_else(|_| result_of(plan));
            let step = match failure {
                Some((step, e)) => {
                    extra["error"] = json!({ "step": step, "message": e.to_string(), "code": e.code() });
                    step.to_string()
                }
                None => "finish".to_string(),
            };
            k.sink.send(&self.event(plan, &step, true, extra)).await;
            plan.set(keys::FINAL_SENT, true);
        }
        if !k.config.keep_workspace {
            if let Ok(ws) = plan.get(keys::WORKSPACE) {
                if let Err(e) = ws.clean() {
                    warn!(error = %e, "workspace cleanup failed");
                }
            }
        }
        k.timer.unset();
    }

    fn event(&self, plan: &WorkPlan, step: &str, is_final: bool, extra: serde_json::Value) -> HistoryEvent {
        HistoryEvent {
            job_id: plan.get(keys::JOB).ok().map(|j| j.id.clone()),
            step: step.to_string(),
            ts: chrono::Utc::now().timestamp_millis(),
            is_final,
            extra,
        }
    }
}
