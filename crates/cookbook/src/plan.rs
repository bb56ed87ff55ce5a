//! The work plan: values earlier steps leave for later ones.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use paas_cluster::{ClusterReport, MultiClusterClient};
use paas_conductor::Conductor;
use paas_core::{CompiledDeployment, JobUnit, JobWorkspace, PaasError, PaasResult};
use rustc_hash::FxHashMap;

use crate::cloning::CloneRequest;

/// A typed name in the plan.
pub struct Key<T> {
    name: &'static str,
    _t: PhantomData<fn() -> T>,
}

impl<T> Key<T> {
    pub const fn new(name: &'static str) -> Self { Self { name, _t: PhantomData } }
    pub fn name(&self) -> &'static str { self.name }
}

impl<T> Clone for Key<T> {
    fn clone(&self) -> Self { *self }
}

impl<T> Copy for Key<T> {}

pub mod keys {
    use super::*;

    pub const RAW_JOB: Key<Vec<u8>> = Key::new("raw-job");
    pub const JOB: Key<Arc<JobUnit>> = Key::new("job");
    pub const WORKSPACE: Key<Arc<dyn JobWorkspace>> = Key::new("workspace");
    pub const CLONE_REQUEST: Key<CloneRequest> = Key::new("clone-request");
    pub const CONDUCTOR: Key<Conductor> = Key::new("conductor");
    pub const MANIFEST: Key<String> = Key::new("manifest");
    pub const DEPLOYMENT: Key<Arc<CompiledDeployment>> = Key::new("deployment");
    pub const HOOKS_RUN: Key<Vec<String>> = Key::new("hooks-run");
    pub const IMAGES_BUILT: Key<Vec<String>> = Key::new("images-built");
    pub const VOLUMES_BUILT: Key<Vec<String>> = Key::new("volumes-built");
    pub const CLUSTERS: Key<Arc<MultiClusterClient>> = Key::new("clusters");
    pub const DEPLOYED: Key<Vec<ClusterReport>> = Key::new("deployed");
    pub const EXPOSED: Key<Vec<ClusterReport>> = Key::new("exposed");
    pub const RESULT: Key<serde_json::Value> = Key::new("result");
    pub const FINAL_SENT: Key<bool> = Key::new("final-sent");
}

#[derive(Default)]
pub struct WorkPlan {
    values: FxHashMap<&'static str, Box<dyn Any + Send + Sync>>,
}

impl WorkPlan {
    pub fn new() -> Self { Self::default() }

    pub fn set<T: Send + Sync + 'static>(&mut self, key: Key<T>, value: T) {
        self.values.insert(key.name, Box::new(value));
    }

    pub fn contains<T: 'static>(&self, key: Key<T>) -> bool {
        self.values.get(key.name).is_some_and(|v| v.is::<T>())
    }

    /// Missing values mean a step ran out of order.
    pub fn get<T: 'static>(&self, key: Key<T>) -> PaasResult<&T> {
        self.values.get(key.name).and_then(|v| v.downcast_ref::<T>()).ok_or_else(|| missing(key.name))
    }

    pub fn get_mut<T: 'static>(&mut self, key: Key<T>) -> PaasResult<&mut T> {
        self.values.get_mut(key.name).and_then(|v| v.downcast_mut::<T>()).ok_or_else(|| missing(key.name))
    }

    pub fn take<T: 'static>(&mut self, key: Key<T>) -> PaasResult<T> {
        match self.values.remove(key.name) {
            Some(v) => v.downcast::<T>().map(|b| *b).map_err(|_| missing(key.name)),
            None => Err(missing(key.name)),
        }
    }

    pub fn names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.values.keys().copied().collect();
        names.sort_unstable();
        names
    }
}

fn missing(name: &str) -> PaasError {
    PaasError::NotConfigured(format!("work plan has no `{}`", name))
}
