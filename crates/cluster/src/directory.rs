//! Driver factories keyed by cluster type.

use std::sync::{Arc, PoisonError, RwLock};

use paas_core::{ClusterDefinition, Identity, PaasError, PaasResult};
use rustc_hash::FxHashMap;
use tracing::debug;

use crate::driver::Driver;

/// Everything a factory needs to reach one cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DriverConfig {
    pub cluster_name: String,
    pub url: String,
    pub namespace: Option<String>,
    pub identity: Option<Identity>,
    pub use_hierarchical_namespaces: bool,
}

pub trait DriverFactory: Send + Sync {
    fn new_driver(&self, config: DriverConfig) -> PaasResult<Box<dyn Driver>>;
}

/// A cluster description able to configure a driver from a factory.
pub trait ConfigurableCluster {
    fn cluster_type(&self) -> &str;
    fn configure_cluster(&self, factory: &dyn DriverFactory) -> PaasResult<Box<dyn Driver>>;
}

impl ConfigurableCluster for ClusterDefinition {
    fn cluster_type(&self) -> &str { &self.cluster_type }

    fn configure_cluster(&self, factory: &dyn DriverFactory) -> PaasResult<Box<dyn Driver>> {
        factory.new_driver(DriverConfig {
            cluster_name: self.name.clone(),
            url: self.address.clone(),
            namespace: self.namespace.clone(),
            identity: self.identity.clone(),
            use_hierarchical_namespaces: self.use_hierarchical_namespaces,
        })
    }
}

#[derive(Default)]
pub struct Directory {
    factories: RwLock<FxHashMap<String, Arc<dyn DriverFactory>>>,
}

impl Directory {
    pub fn new() -> Self { Self::default() }

    /// Register a factory for `cluster_type`; a later registration replaces it.
    pub fn register(&self, cluster_type: &str, factory: Arc<dyn DriverFactory>) -> &Self {
        self.factories
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(cluster_type.to_string(), factory);
        self
    }

    /// Configure a driver for `cluster`. A missing type fails before the
    /// cluster is touched.
    pub fn require(&self, cluster_type: &str, cluster: &dyn ConfigurableCluster) -> PaasResult<Box<dyn Driver>> {
        let factory = self
            .factories
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(cluster_type)
            .cloned()
            .ok_or_else(|| PaasError::domain(format!("no available client for {}", cluster_type), 500))?;
        debug!(cluster_type, "driver factory found");
        cluster.configure_cluster(factory.as_ref())
    }

    pub fn require_all<'c, I>(&self, clusters: I) -> PaasResult<ClusterClients>
    where
        I: IntoIterator<Item = &'c ClusterDefinition>,
    {
        let mut drivers = Vec::new();
        for cluster in clusters {
            drivers.push(self.require(cluster.cluster_type(), cluster)?);
        }
        Ok(ClusterClients { drivers })
    }
}

/// Drivers for every cluster of a job, in declaration order. Read only.
pub struct ClusterClients {
    drivers: Vec<Box<dyn Driver>>,
}

impl ClusterClients {
    pub fn from_drivers(drivers: Vec<Box<dyn Driver>>) -> Self { Self { drivers } }
    pub fn iter(&self) -> impl Iterator<Item = &dyn Driver> { self.drivers.iter().map(|d| d.as_ref()) }
    pub fn len(&self) -> usize { self.drivers.len() }
    pub fn is_empty(&self) -> bool { self.drivers.is_empty() }
}
