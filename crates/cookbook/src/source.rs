//! Where jobs come from.

use std::path::PathBuf;

use paas_core::{PaasError, PaasResult};

#[async_trait::async_trait]
pub trait JobSource: Send + Sync {
    /// Cheap reachability check before anything else runs.
    async fn ping(&self) -> PaasResult<()> { Ok(()) }
    /// Raw JSON of the next job.
    async fn receive(&self) -> PaasResult<Vec<u8>>;
}

/// A job description on disk.
pub struct FileJobSource {
    path: PathBuf,
}

impl FileJobSource {
    pub fn new(path: impl Into<PathBuf>) -> Self { Self { path: path.into() } }
}

#[async_trait::async_trait]
impl JobSource for FileJobSource {
    async fn ping(&self) -> PaasResult<()> {
        match tokio::fs::metadata(&self.path).await {
            Ok(m) if m.is_file() => Ok(()),
            _ => Err(PaasError::not_found(format!("job file {} not found", self.path.display()))),
        }
    }

    async fn receive(&self) -> PaasResult<Vec<u8>> { Ok(tokio::fs::read(&self.path).await?) }
}

/// A job already in memory.
#[derive(Debug, Clone)]
pub struct StaticJobSource(pub Vec<u8>);

#[async_trait::async_trait]
impl JobSource for StaticJobSource {
    async fn receive(&self) -> PaasResult<Vec<u8>> { Ok(self.0.clone()) }
}
