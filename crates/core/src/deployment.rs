//! `CompiledDeployment`: the cluster-agnostic result of compiling one job.
//!
//! Collections are append-only and individually locked. Enumerators iterate a
//! snapshot, so a callback may add to any collection, including the one being
//! enumerated, without deadlocking; insertion order is the only order.

use std::sync::{Arc, PoisonError, RwLock};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::defaults::DefaultsBag;
use crate::error::{PaasError, PaasResult};
use crate::model::{Buildable, ConfigMap, HookSpec, Ingress, Pod, Secret, Service, Volume};

pub trait Named {
    fn name(&self) -> &str;
}

macro_rules! named {
    ($($t:ty),*) => { $(impl Named for $t { fn name(&self) -> &str { &self.name } })* };
}
named!(Volume, HookSpec, Pod, Secret, ConfigMap, Service, Ingress);

impl Named for Buildable {
    fn name(&self) -> &str { Buildable::name(self) }
}

struct Collection<T> {
    kind: &'static str,
    items: RwLock<Vec<Arc<T>>>,
}

impl<T: Named> Collection<T> {
    fn new(kind: &'static str) -> Self { Self { kind, items: RwLock::new(Vec::new()) } }

    fn add(&self, item: T) -> PaasResult<()> {
        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        if items.iter().any(|i| i.name() == item.name()) {
            return Err(PaasError::domain(format!("{} `{}` is already defined", self.kind, item.name()), 409));
        }
        items.push(Arc::new(item));
        Ok(())
    }

    fn replace(&self, name: &str, item: T) -> PaasResult<()> {
        let mut items = self.items.write().unwrap_or_else(PoisonError::into_inner);
        match items.iter().position(|i| i.name() == name) {
            Some(idx) => {
                items[idx] = Arc::new(item);
                Ok(())
            }
            None => Err(PaasError::not_found(format!("{} `{}` is not available", self.kind, name))),
        }
    }

    fn find(&self, name: &str) -> Option<Arc<T>> {
        let items = self.items.read().unwrap_or_else(PoisonError::into_inner);
        items.iter().find(|i| i.name() == name).cloned()
    }

    fn snapshot(&self) -> Vec<Arc<T>> {
        self.items.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    fn index(&self) -> FxHashMap<String, Arc<T>> {
        self.snapshot().into_iter().map(|i| (i.name().to_string(), i)).collect()
    }

    fn names(&self) -> Vec<String> {
        self.snapshot().iter().map(|i| i.name().to_string()).collect()
    }
}

/// A pod left out of the deployment because it broke a hard quota.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedPod {
    pub name: String,
    pub reason: String,
}

/// Names per collection, in insertion order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploymentSummary {
    pub version: String,
    pub prefix: Option<String>,
    pub project_name: Option<String>,
    pub buildables: Vec<String>,
    pub volumes: Vec<String>,
    pub hooks: Vec<String>,
    pub pods: Vec<String>,
    pub secrets: Vec<String>,
    pub maps: Vec<String>,
    pub services: Vec<String>,
    pub ingresses: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rejected: Vec<RejectedPod>,
}

pub struct CompiledDeployment {
    version: String,
    prefix: Option<String>,
    project_name: Option<String>,
    defaults: DefaultsBag,
    buildables: Collection<Buildable>,
    volumes: Collection<Volume>,
    hooks: Collection<HookSpec>,
    pods: Collection<Pod>,
    secrets: Collection<Secret>,
    maps: Collection<ConfigMap>,
    services: Collection<Service>,
    ingresses: Collection<Ingress>,
    rejected: RwLock<Vec<RejectedPod>>,
}

impl std::fmt::Debug for CompiledDeployment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledDeployment").field("summary", &self.summary()).finish()
    }
}

impl CompiledDeployment {
    pub fn new(version: impl Into<String>, prefix: Option<String>, project_name: Option<String>) -> Self {
        Self {
            version: version.into(),
            prefix: prefix.filter(|p| !p.is_empty()),
            project_name,
            defaults: DefaultsBag::new(),
            buildables: Collection::new("buildable"),
            volumes: Collection::new("volume"),
            hooks: Collection::new("hook"),
            pods: Collection::new("pod"),
            secrets: Collection::new("secret"),
            maps: Collection::new("map"),
            services: Collection::new("service"),
            ingresses: Collection::new("ingress"),
            rejected: RwLock::new(Vec::new()),
        }
    }

    pub fn version(&self) -> &str { &self.version }
    pub fn defaults(&self) -> &DefaultsBag { &self.defaults }

    pub fn add_buildable(&self, b: Buildable) -> PaasResult<()> { self.buildables.add(b) }

    /// Replace the buildable named `old` in place, keeping its position.
    pub fn update_buildable(&self, old: &str, new: Buildable) -> PaasResult<()> { self.buildables.replace(old, new) }

    pub fn add_volume(&self, v: Volume) -> PaasResult<()> { self.volumes.add(v) }

    pub fn update_volume(&self, old: &str, new: Volume) -> PaasResult<()> { self.volumes.replace(old, new) }

    /// Clone a declared volume with another mount path.
    pub fn import_volume(&self, from: &str, mount_path: &str) -> PaasResult<Volume> {
        match self.volumes.find(from) {
            Some(v) => Ok(v.import(mount_path)),
            None => Err(PaasError::not_found(format!("volume `{}` is not available", from))),
        }
    }

    pub fn add_hook(&self, h: HookSpec) -> PaasResult<()> { self.hooks.add(h) }
    pub fn add_pod(&self, p: Pod) -> PaasResult<()> { self.pods.add(p) }
    pub fn add_secret(&self, s: Secret) -> PaasResult<()> { self.secrets.add(s) }
    pub fn add_map(&self, m: ConfigMap) -> PaasResult<()> { self.maps.add(m) }
    pub fn add_service(&self, s: Service) -> PaasResult<()> { self.services.add(s) }
    pub fn add_ingress(&self, i: Ingress) -> PaasResult<()> { self.ingresses.add(i) }

    /// Record a pod that was compiled out; it never reaches a cluster.
    pub fn reject_pod(&self, name: impl Into<String>, reason: impl Into<String>) {
        let mut rejected = self.rejected.write().unwrap_or_else(PoisonError::into_inner);
        rejected.push(RejectedPod { name: name.into(), reason: reason.into() });
    }

    pub fn rejected_pods(&self) -> Vec<RejectedPod> {
        self.rejected.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn has_buildable(&self, name: &str) -> bool { self.buildables.find(name).is_some() }

    pub fn for_each_buildable(&self, mut f: impl FnMut(&Buildable)) {
        for b in self.buildables.snapshot() { f(&*b); }
    }

    pub fn for_each_volume(&self, mut f: impl FnMut(&Volume)) {
        for v in self.volumes.snapshot() { f(&*v); }
    }

    pub fn for_each_hook(&self, mut f: impl FnMut(&HookSpec)) {
        for h in self.hooks.snapshot() { f(&*h); }
    }

    /// Pods with the buildables and volumes they may reference, indexed by name.
    pub fn for_each_pod(
        &self,
        mut f: impl FnMut(&Pod, &FxHashMap<String, Arc<Buildable>>, &FxHashMap<String, Arc<Volume>>),
    ) {
        let images = self.buildables.index();
        let volumes = self.volumes.index();
        for p in self.pods.snapshot() { f(&*p, &images, &volumes); }
    }

    pub fn for_each_secret(&self, mut f: impl FnMut(&Secret)) {
        for s in self.secrets.snapshot() { f(&*s); }
    }

    pub fn for_each_map(&self, mut f: impl FnMut(&ConfigMap)) {
        for m in self.maps.snapshot() { f(&*m); }
    }

    pub fn for_each_service(&self, mut f: impl FnMut(&Service)) {
        for s in self.services.snapshot() { f(&*s); }
    }

    pub fn for_each_ingress(&self, mut f: impl FnMut(&Ingress)) {
        for i in self.ingresses.snapshot() { f(&*i); }
    }

    pub fn with_job_settings<R>(&self, f: impl FnOnce(&str, Option<&str>, Option<&str>) -> R) -> R {
        f(&self.version, self.prefix.as_deref(), self.project_name.as_deref())
    }

    /// Hand the defaults scope of one cluster to late-bound configuration.
    pub fn compile_defaults_bags<R>(&self, name: &str, f: impl FnOnce(&DefaultsBag) -> R) -> R {
        f(&self.defaults.for_cluster(name))
    }

    pub fn summary(&self) -> DeploymentSummary {
        DeploymentSummary {
            version: self.version.clone(),
            prefix: self.prefix.clone(),
            project_name: self.project_name.clone(),
            buildables: self.buildables.names(),
            volumes: self.volumes.names(),
            hooks: self.hooks.names(),
            pods: self.pods.names(),
            secrets: self.secrets.names(),
            maps: self.maps.names(),
            services: self.services.names(),
            ingresses: self.ingresses.names(),
            rejected: self.rejected_pods(),
        }
    }
}
