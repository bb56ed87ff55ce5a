//! Where pipeline events go. Sending never fails from the pipeline's point
//! of view; sinks log their own trouble.

use std::sync::Arc;

use paas_persist::{HistoryEntry, HistoryStore};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use tracing::{info, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEvent {
    pub job_id: Option<String>,
    pub step: String,
    /// Milliseconds since the epoch.
    pub ts: i64,
    pub is_final: bool,
    pub extra: Json,
}

#[async_trait::async_trait]
pub trait EventSink: Send + Sync {
    async fn send(&self, event: &HistoryEvent);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

#[async_trait::async_trait]
impl EventSink for TracingSink {
    async fn send(&self, event: &HistoryEvent) {
        info!(
            job = event.job_id.as_deref().unwrap_or("-"),
            step = %event.step,
            ts = event.ts,
            is_final = event.is_final,
            extra = %event.extra,
            "history"
        );
    }
}

/// Journals events in a history store. Events without a job id are dropped.
pub struct HistorySink {
    store: Arc<dyn HistoryStore>,
}

impl HistorySink {
    pub fn new(store: Arc<dyn HistoryStore>) -> Self { Self { store } }
}

#[async_trait::async_trait]
impl EventSink for HistorySink {
    async fn send(&self, event: &HistoryEvent) {
        let Some(job_id) = event.job_id.clone() else { return };
        let entry = HistoryEntry {
            job_id,
            step: event.step.clone(),
            ts: event.ts,
            is_final: event.is_final,
            payload: event.extra.clone(),
        };
        let store = self.store.clone();
        match tokio::task::spawn_blocking(move || store.append(&entry)).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %format!("{:#}", e), step = %event.step, "history append failed"),
            Err(e) => warn!(error = %e, step = %event.step, "history task failed"),
        }
    }
}

/// Forwards each event to every sink, in order.
#[derive(Default, Clone)]
pub struct FanoutSink {
    sinks: Vec<Arc<dyn EventSink>>,
}

impl FanoutSink {
    pub fn new(sinks: Vec<Arc<dyn EventSink>>) -> Self { Self { sinks } }

    pub fn with(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sinks.push(sink);
        self
    }
}

#[async_trait::async_trait]
impl EventSink for FanoutSink {
    async fn send(&self, event: &HistoryEvent) {
        for sink in &self.sinks {
            sink.send(event).await;
        }
    }
}
