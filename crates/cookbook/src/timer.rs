//! Job-wide deadline checked around every step.

use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use paas_core::{PaasError, PaasResult};

pub const TIMEOUT_ENV: &str = "PAAS_JOB_TIMEOUT_SECS";

#[derive(Debug, Default)]
pub struct JobTimer {
    state: Mutex<TimerState>,
}

#[derive(Debug, Default)]
struct TimerState {
    started: Option<Instant>,
    budget: Option<Duration>,
}

impl JobTimer {
    pub fn new() -> Self { Self::default() }

    /// Budget from `PAAS_JOB_TIMEOUT_SECS`; zero or unset means none.
    pub fn budget_from_env() -> Option<Duration> {
        std::env::var(TIMEOUT_ENV).ok().and_then(|s| s.parse::<u64>().ok()).filter(|s| *s > 0).map(Duration::from_secs)
    }

    /// Start the clock with an optional budget.
    pub fn set(&self, budget: Option<Duration>) {
        let mut s = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        s.started = Some(Instant::now());
        s.budget = budget;
    }

    /// Change the budget, still counted from `set`.
    pub fn rearm(&self, budget: Duration) {
        let mut s = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        s.started.get_or_insert_with(Instant::now);
        s.budget = Some(budget);
    }

    pub fn unset(&self) {
        let mut s = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        *s = TimerState::default();
    }

    pub fn is_set(&self) -> bool { self.state.lock().unwrap_or_else(PoisonError::into_inner).budget.is_some() }

    /// Time left, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        let s = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        match (s.started, s.budget) {
            (Some(t0), Some(b)) => Some(b.saturating_sub(t0.elapsed())),
            _ => None,
        }
    }

    pub fn expired(&self, step: &str) -> PaasError {
        let budget = self.state.lock().unwrap_or_else(PoisonError::into_inner).budget.unwrap_or_default();
        PaasError::execution(format!("job timed out after {}s during `{}`", budget.as_secs(), step), 504)
    }

    /// Runs `fut` within what is left of the budget.
    pub async fn guard<T>(&self, step: &str, fut: impl std::future::Future<Output = PaasResult<T>>) -> PaasResult<T> {
        match self.remaining() {
            None => fut.await,
            Some(left) if left.is_zero() => Err(self.expired(step)),
            Some(left) => tokio::time::timeout(left, fut).await.unwrap_or_else(|_| Err(self.expired(step))),
        }
    }
}
