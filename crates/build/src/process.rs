//! External processes behind a small async seam so builds can be faked in tests.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use paas_core::{PaasError, PaasResult};
use tokio::process::{Child, Command};
use tracing::{debug, warn};

/// What a finished process left behind.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProcessOutput {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
}

pub trait ProcessSpawner: Send + Sync {
    fn spawn(&self, command: Vec<String>, cwd: &Path) -> Box<dyn ProcessHandle>;
}

#[async_trait::async_trait]
pub trait ProcessHandle: Send {
    fn set_env(&mut self, env: BTreeMap<String, String>);
    /// Zero means unbounded.
    fn set_timeout(&mut self, timeout: Duration);
    async fn start(&mut self) -> PaasResult<()>;
    /// Resolves once the process exited. A timeout kills it and fails with 504.
    async fn wait(&mut self) -> PaasResult<ProcessOutput>;
    async fn stop(&mut self);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct TokioProcessSpawner;

impl ProcessSpawner for TokioProcessSpawner {
    fn spawn(&self, command: Vec<String>, cwd: &Path) -> Box<dyn ProcessHandle> {
        Box::new(TokioProcess { command, cwd: cwd.to_path_buf(), env: BTreeMap::new(), timeout: Duration::ZERO, child: None })
    }
}

pub struct TokioProcess {
    command: Vec<String>,
    cwd: PathBuf,
    env: BTreeMap<String, String>,
    timeout: Duration,
    child: Option<Child>,
}

#[async_trait::async_trait]
impl ProcessHandle for TokioProcess {
    fn set_env(&mut self, env: BTreeMap<String, String>) { self.env = env; }

    fn set_timeout(&mut self, timeout: Duration) { self.timeout = timeout; }

    async fn start(&mut self) -> PaasResult<()> {
        let (program, args) = self
            .command
            .split_first()
            .ok_or_else(|| PaasError::domain("empty command", 400))?;
        let child = Command::new(program)
            .args(args)
            .current_dir(&self.cwd)
            .envs(&self.env)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| PaasError::execution(format!("cannot start `{}`: {}", program, e), 500))?;
        debug!(program = %program, pid = ?child.id(), "process started");
        self.child = Some(child);
        Ok(())
    }

    async fn wait(&mut self) -> PaasResult<ProcessOutput> {
        let child = self.child.take().ok_or_else(|| PaasError::NotConfigured("process was not started".into()))?;
        let output = child.wait_with_output();
        let output = if self.timeout.is_zero() {
            output.await?
        } else {
            match tokio::time::timeout(self.timeout, output).await {
                Ok(res) => res?,
                Err(_) => {
                    warn!(command = ?self.command.first(), timeout_s = self.timeout.as_secs(), "process timed out");
                    return Err(PaasError::execution(
                        format!("`{}` timed out after {}s", self.command.join(" "), self.timeout.as_secs()),
                        504,
                    ));
                }
            }
        };
        Ok(ProcessOutput {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_output_and_exit_status() {
        let mut ok = TokioProcessSpawner.spawn(vec!["sh".into(), "-c".into(), "echo $GREETING".into()], Path::new("."));
        ok.set_env(BTreeMap::from([("GREETING".to_string(), "hello".to_string())]));
        ok.start().await.unwrap();
        let out = ok.wait().await.unwrap();
        assert!(out.success);
        assert_eq!(out.stdout.trim(), "hello");

        let mut ko = TokioProcessSpawner.spawn(vec!["sh".into(), "-c".into(), "echo boom >&2; exit 3".into()], Path::new("."));
        ko.start().await.unwrap();
        let out = ko.wait().await.unwrap();
        assert!(!out.success);
        assert_eq!(out.stderr.trim(), "boom");
    }

    #[tokio::test]
    async fn timeout_kills_the_process() {
        let mut slow = TokioProcessSpawner.spawn(vec!["sleep".into(), "5".into()], Path::new("."));
        slow.set_timeout(Duration::from_millis(100));
        slow.start().await.unwrap();
        let err = slow.wait().await.unwrap_err();
        assert_eq!(err.code(), 504);
    }

    #[tokio::test]
    async fn empty_command_does_not_start() {
        let mut none = TokioProcessSpawner.spawn(Vec::new(), Path::new("."));
        assert_eq!(none.start().await.unwrap_err().code(), 400);
    }
}
