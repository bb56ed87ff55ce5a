//! Image and volume builds with a buildah compatible CLI.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use paas_core::model::{Buildable, EmbeddedVolumeImage, Image, Volume, VolumeKind};
use paas_core::{CompiledDeployment, JobUnit, JobWorkspace, PaasError, PaasResult};
use rustc_hash::FxHashSet;
use tracing::info;

use crate::env::build_env;
use crate::orchestrator::{BuildJob, BuildOrchestrator};
use crate::process::ProcessSpawner;

pub const DEFAULT_TAG: &str = "latest";

fn quote(raw: &str) -> String {
    format!("'{}'", raw.replace('\'', r"'\''"))
}

pub struct OciBuilder {
    spawner: Arc<dyn ProcessSpawner>,
    binary: String,
    volume_base_image: String,
    timeout: Duration,
    orchestrator: BuildOrchestrator,
}

impl OciBuilder {
    pub fn new(spawner: Arc<dyn ProcessSpawner>) -> Self {
        Self {
            spawner,
            binary: "buildah".into(),
            volume_base_image: "alpine:3".into(),
            timeout: Duration::ZERO,
            orchestrator: BuildOrchestrator::default(),
        }
    }

    pub fn with_binary(mut self, binary: impl Into<String>) -> Self {
        self.binary = binary.into();
        self
    }

    pub fn with_volume_base_image(mut self, image: impl Into<String>) -> Self {
        self.volume_base_image = image.into();
        self
    }

    /// Per-process timeout; zero means unbounded.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_orchestrator(mut self, orchestrator: BuildOrchestrator) -> Self {
        self.orchestrator = orchestrator;
        self
    }

    /// Build and push a tagged image, optionally from a generated Containerfile.
    pub fn script(&self, target: &str, context: &str, containerfile: Option<&str>, args: &BTreeMap<String, String>) -> String {
        let mut bud = vec![self.binary.clone(), "bud".into(), "--layers".into()];
        if let Some(file) = containerfile {
            bud.push("-f".into());
            bud.push(quote(file));
        }
        for (k, v) in args {
            bud.push("--build-arg".into());
            bud.push(quote(&format!("{}={}", k, v)));
        }
        bud.push("-t".into());
        bud.push(quote(target));
        bud.push(quote(context));
        format!(
            "set -e\n{}\n{} push --creds \"$PAAS_REGISTRY_USER:$PAAS_REGISTRY_PASSWORD\" {}\n",
            bud.join(" "),
            self.binary,
            quote(target)
        )
    }

    fn job(&self, name: &str, script: String, job: &JobUnit, workspace: &dyn JobWorkspace) -> BuildJob {
        let mut handle = self.spawner.spawn(vec!["sh".into(), "-c".into(), script], &workspace.repository_path());
        handle.set_env(build_env(&job.variables, &job.images_registry));
        handle.set_timeout(self.timeout);
        BuildJob::new(name, handle)
    }

    /// Build repository images, then the images that embed volumes into them.
    /// Built images get the job registry through `update_buildable`.
    pub async fn build_images(&self, cd: &CompiledDeployment, job: &JobUnit, workspace: &dyn JobWorkspace) -> PaasResult<Vec<String>> {
        let registry = job.images_registry.url.as_str();
        let mut images: Vec<Image> = Vec::new();
        let mut embedded: Vec<EmbeddedVolumeImage> = Vec::new();
        cd.for_each_buildable(|b| match b {
            Buildable::Image(i) => images.push(i.clone()),
            Buildable::Embedded(e) => embedded.push(e.clone()),
        });
        let repo = workspace.repository_path();
        let mut built = Vec::new();

        let mut jobs = Vec::with_capacity(images.len());
        let mut pending = BTreeMap::new();
        for image in images {
            let b = Buildable::Image(image.clone()).with_registry(registry);
            let target = format!("{}:{}", b.url(), image.tag.as_deref().unwrap_or(DEFAULT_TAG));
            let context = repo.join(image.path.trim_start_matches('/'));
            let script = self.script(&target, &context.to_string_lossy(), None, &image.variables);
            jobs.push(self.job(&image.name, script, job, workspace));
            pending.insert(image.name.clone(), b);
        }
        self.orchestrator
            .run(jobs, |name, _| {
                let b = pending.remove(name).ok_or_else(|| PaasError::not_found(format!("image `{}` is unknown", name)))?;
                cd.update_buildable(name, b)?;
                built.push(name.to_string());
                Ok(())
            })
            .await?;

        let mut urls = BTreeMap::new();
        cd.for_each_buildable(|b| {
            urls.insert(b.name().to_string(), (b.url(), b.tag().unwrap_or(DEFAULT_TAG).to_string()));
        });
        let mut jobs = Vec::with_capacity(embedded.len());
        let mut pending = BTreeMap::new();
        for e in embedded {
            let (base, tag) = urls
                .get(&e.original_name)
                .cloned()
                .ok_or_else(|| PaasError::not_found(format!("image `{}` is not available", e.original_name)))?;
            let mut containerfile = format!("FROM {}:{}\n", base, tag);
            for v in &e.volumes {
                if let VolumeKind::Embedded { paths, .. } = &v.kind {
                    for p in paths {
                        containerfile.push_str(&format!("COPY .{} {}{}\n", p, v.mount_path.trim_end_matches('/'), p));
                    }
                }
            }
            let file = workspace.write_file(&format!("{}.Containerfile", e.name), &containerfile)?;
            let b = Buildable::Embedded(e.clone()).with_registry(registry);
            let target = format!("{}:{}", b.url(), e.tag.as_deref().unwrap_or(DEFAULT_TAG));
            let script = self.script(&target, &repo.to_string_lossy(), Some(&file.to_string_lossy()), &BTreeMap::new());
            jobs.push(self.job(&e.name, script, job, workspace));
            pending.insert(e.name.clone(), b);
        }
        self.orchestrator
            .run(jobs, |name, _| {
                let b = pending.remove(name).ok_or_else(|| PaasError::not_found(format!("image `{}` is unknown", name)))?;
                cd.update_buildable(name, b)?;
                built.push(name.to_string());
                Ok(())
            })
            .await?;

        info!(job = %job.id, images = built.len(), "images built");
        Ok(built)
    }

    /// Ship embedded volumes mounted by pods as standalone images.
    pub async fn build_volumes(&self, cd: &CompiledDeployment, job: &JobUnit, workspace: &dyn JobWorkspace) -> PaasResult<Vec<String>> {
        let registry = job.images_registry.url.as_str();
        let mut mounted = FxHashSet::default();
        cd.for_each_pod(|pod, _, _| {
            for c in &pod.containers {
                mounted.extend(c.volumes.iter().map(|m| m.name.clone()));
            }
        });
        let mut volumes: Vec<Volume> = Vec::new();
        cd.for_each_volume(|v| {
            if v.is_embedded() && mounted.contains(&v.name) {
                volumes.push(v.clone());
            }
        });

        let repo = workspace.repository_path();
        let mut jobs = Vec::with_capacity(volumes.len());
        let mut pending = BTreeMap::new();
        for v in volumes {
            let VolumeKind::Embedded { local_path, paths, .. } = &v.kind else { continue };
            let mut containerfile = format!("FROM {}\n", self.volume_base_image);
            for p in paths {
                containerfile.push_str(&format!("COPY .{} {}{}\n", p, local_path.trim_end_matches('/'), p));
            }
            let file = workspace.write_file(&format!("volume-{}.Containerfile", v.name), &containerfile)?;
            let mut next = v.clone();
            if let VolumeKind::Embedded { registry: r, tag, .. } = &mut next.kind {
                *r = Some(registry.to_string());
                *tag = Some(DEFAULT_TAG.to_string());
            }
            let target = format!("{}:{}", next.url().unwrap_or_default(), DEFAULT_TAG);
            let script = self.script(&target, &repo.to_string_lossy(), Some(&file.to_string_lossy()), &BTreeMap::new());
            jobs.push(self.job(&v.name, script, job, workspace));
            pending.insert(v.name.clone(), next);
        }
        let mut built = Vec::new();
        self.orchestrator
            .run(jobs, |name, _| {
                let v = pending.remove(name).ok_or_else(|| PaasError::not_found(format!("volume `{}` is unknown", name)))?;
                cd.update_volume(name, v)?;
                built.push(name.to_string());
                Ok(())
            })
            .await?;
        info!(job = %job.id, volumes = built.len(), "volumes built");
        Ok(built)
    }
}
