//! Fetching the job's source repository.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use paas_build::ProcessSpawner;
use paas_core::{PaasError, PaasResult, SourceRepository};
use tracing::info;

/// Everything needed to clone, settled before the clone itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneRequest {
    pub url: String,
    pub branch: Option<String>,
    pub destination: PathBuf,
}

#[async_trait::async_trait]
pub trait CloningAgent: Send + Sync {
    fn configure(&self, repository: &SourceRepository, destination: PathBuf) -> PaasResult<CloneRequest>;
    async fn clone_repository(&self, request: &CloneRequest) -> PaasResult<()>;
}

/// Shallow `git clone` of a single branch.
pub struct GitCloningAgent {
    spawner: Arc<dyn ProcessSpawner>,
    binary: String,
    timeout: Duration,
}

impl GitCloningAgent {
    pub fn new(spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self { spawner, binary: "git".into(), timeout: Duration::ZERO }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn command(&self, request: &CloneRequest) -> Vec<String> {
        let mut cmd = vec![self.binary.clone(), "clone".into(), "--depth".into(), "1".into()];
        if let Some(b) = &request.branch {
            cmd.push("--branch".into());
            cmd.push(b.clone());
        }
        cmd.push(request.url.clone());
        cmd.push(request.destination.to_string_lossy().to_string());
        cmd
    }
}

/// Credentials go into the URL userinfo; a token alone is sent as the password.
fn authenticated_url(repository: &SourceRepository) -> PaasResult<String> {
    let url = repository.url.trim();
    if url.is_empty() {
        return Err(PaasError::domain("source repository has no url", 400));
    }
    let Some(id) = &repository.identity else { return Ok(url.to_string()) };
    let secret = id.token.clone().unwrap_or_else(|| id.password.clone());
    if secret.is_empty() {
        return Ok(url.to_string());
    }
    let user = if id.user.is_empty() { "oauth2" } else { id.user.as_str() };
    match url.split_once("://") {
        Some((scheme, rest)) if scheme.starts_with("http") => Ok(format!("{}://{}:{}@{}", scheme, user, secret, rest)),
        _ => Ok(url.to_string()),
    }
}

#[async_trait::async_trait]
impl CloningAgent for GitCloningAgent {
    fn configure(&self, repository: &SourceRepository, destination: PathBuf) -> PaasResult<CloneRequest> {
        Ok(CloneRequest { url: authenticated_url(repository)?, branch: repository.branch.clone(), destination })
    }

    async fn clone_repository(&self, request: &CloneRequest) -> PaasResult<()> {
        let cwd = request.destination.parent().map(PathBuf::from).unwrap_or_else(std::env::temp_dir);
        let mut handle = self.spawner.spawn(self.command(request), &cwd);
        handle.set_env([("GIT_TERMINAL_PROMPT".to_string(), "0".to_string())].into_iter().collect());
        handle.set_timeout(self.timeout);
        handle.start().await?;
        let out = handle.wait().await?;
        if !out.success {
            return Err(PaasError::execution(format!("git clone failed: {}", out.stderr.trim()), 500));
        }
        info!(branch = ?request.branch, into = %request.destination.display(), "repository cloned");
        Ok(())
    }
}
