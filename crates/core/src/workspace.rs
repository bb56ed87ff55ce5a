//! Job workspace on the local filesystem.

use std::path::{Component, Path, PathBuf};

use tracing::debug;

use crate::error::{PaasError, PaasResult};

pub const REPOSITORY_DIR: &str = "repository";

pub trait JobWorkspace: Send + Sync {
    fn path(&self) -> &Path;
    /// Directory the source repository is cloned into.
    fn repository_path(&self) -> PathBuf { self.path().join(REPOSITORY_DIR) }
    fn prepare(&self) -> PaasResult<()>;
    /// Read a file relative to the repository root.
    fn read_file(&self, relative: &str) -> PaasResult<String>;
    /// Write a file relative to the workspace root, returns its absolute path.
    fn write_file(&self, relative: &str, content: &str) -> PaasResult<PathBuf>;
    fn clean(&self) -> PaasResult<()>;
}

fn checked(relative: &str) -> PaasResult<&Path> {
    let p = Path::new(relative);
    if p.components().any(|c| matches!(c, Component::ParentDir | Component::RootDir | Component::Prefix(_))) {
        return Err(PaasError::domain(format!("path `{}` escapes the workspace", relative), 400));
    }
    Ok(p)
}

pub struct LocalWorkspace {
    root: PathBuf,
}

impl LocalWorkspace {
    pub fn new(base: &Path, job_id: &str) -> Self {
        Self { root: base.join(format!("paas-{}", job_id)) }
    }
}

impl JobWorkspace for LocalWorkspace {
    fn path(&self) -> &Path { &self.root }

    fn prepare(&self) -> PaasResult<()> {
        std::fs::create_dir_all(self.root.join(REPOSITORY_DIR))?;
        debug!(path = %self.root.display(), "workspace prepared");
        Ok(())
    }

    fn read_file(&self, relative: &str) -> PaasResult<String> {
        let path = self.repository_path().join(checked(relative)?);
        std::fs::read_to_string(&path)
            .map_err(|e| PaasError::not_found(format!("cannot read `{}`: {}", relative, e)))
    }

    fn write_file(&self, relative: &str, content: &str) -> PaasResult<PathBuf> {
        let path = self.root.join(checked(relative)?);
        if let Some(parent) = path.parent() { std::fs::create_dir_all(parent)?; }
        std::fs::write(&path, content)?;
        Ok(path)
    }

    fn clean(&self) -> PaasResult<()> {
        if self.root.exists() { std::fs::remove_dir_all(&self.root)?; }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_escaping_paths_and_roundtrips_files() {
        let base = std::env::temp_dir();
        let id = format!("{}", std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos());
        let ws = LocalWorkspace::new(&base, &id);
        ws.prepare().unwrap();
        assert!(ws.write_file("../evil", "x").is_err());
        std::fs::write(ws.repository_path().join(".paas.yaml"), "paas: {}").unwrap();
        assert_eq!(ws.read_file(".paas.yaml").unwrap(), "paas: {}");
        assert_eq!(ws.read_file("missing.yaml").unwrap_err().code(), 404);
        ws.clean().unwrap();
        assert!(!ws.path().exists());
    }
}
