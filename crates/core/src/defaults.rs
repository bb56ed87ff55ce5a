//! Hierarchical default values: a root scope plus one child scope per cluster.
//!
//! Values are looked up from a scope up through its ancestors, the nearest
//! definition wins. `None` is a defined value, distinct from an undefined name.

use std::sync::{Arc, PoisonError, RwLock, Weak};

use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};

use crate::error::{PaasError, PaasResult};

/// Opaque token naming a default value; resolved later against a scope.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Reference(String);

impl Reference {
    pub fn name(&self) -> &str { &self.0 }
}

/// A value known now, or a default to resolve per cluster at deploy/expose time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolvable {
    Literal(String),
    Deferred(Reference),
}

impl Resolvable {
    pub fn resolve(&self, bag: &DefaultsBag) -> PaasResult<Option<String>> {
        match self {
            Resolvable::Literal(v) => Ok(Some(v.clone())),
            Resolvable::Deferred(r) => bag.resolve(r),
        }
    }

    /// Literal when the manifest gave a value, else a reference into the bag.
    pub fn or_default(value: Option<&str>, bag: &DefaultsBag, name: &str) -> PaasResult<Self> {
        match value {
            Some(v) => Ok(Resolvable::Literal(v.to_string())),
            None => Ok(Resolvable::Deferred(bag.get_reference(name)?)),
        }
    }
}

struct Scope {
    name: Option<String>,
    values: RwLock<FxHashMap<String, Option<String>>>,
    parent: Weak<Scope>,
    children: RwLock<FxHashMap<String, Arc<Scope>>>,
}

impl Scope {
    fn new(name: Option<String>, parent: Weak<Scope>) -> Self {
        Self { name, values: RwLock::default(), parent, children: RwLock::default() }
    }

    fn lookup(&self, name: &str) -> Option<Option<String>> {
        let values = self.values.read().unwrap_or_else(PoisonError::into_inner);
        values.get(name).cloned()
    }
}

/// Handle on one scope of the tree. Cloning shares the scope.
#[derive(Clone)]
pub struct DefaultsBag {
    scope: Arc<Scope>,
}

impl Default for DefaultsBag {
    fn default() -> Self { Self::new() }
}

impl std::fmt::Debug for DefaultsBag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DefaultsBag").field("scope", &self.scope.name).finish()
    }
}

impl DefaultsBag {
    /// A new root scope.
    pub fn new() -> Self {
        Self { scope: Arc::new(Scope::new(None, Weak::new())) }
    }

    /// Cluster name of this scope, `None` for the root.
    pub fn scope_name(&self) -> Option<&str> { self.scope.name.as_deref() }

    pub fn set(&self, name: &str, value: Option<&str>) -> &Self {
        let mut values = self.scope.values.write().unwrap_or_else(PoisonError::into_inner);
        values.insert(name.to_string(), value.map(|v| v.to_string()));
        self
    }

    /// Child scope for a cluster, created on first use.
    pub fn for_cluster(&self, name: &str) -> DefaultsBag {
        let mut children = self.scope.children.write().unwrap_or_else(PoisonError::into_inner);
        let child = children
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Scope::new(Some(name.to_string()), Arc::downgrade(&self.scope))));
        DefaultsBag { scope: Arc::clone(child) }
    }

    /// The named child if it exists, otherwise this scope.
    pub fn get_bag_for(&self, name: &str) -> DefaultsBag {
        let children = self.scope.children.read().unwrap_or_else(PoisonError::into_inner);
        match children.get(name) {
            Some(child) => DefaultsBag { scope: Arc::clone(child) },
            None => self.clone(),
        }
    }

    pub fn get_reference(&self, name: &str) -> PaasResult<Reference> {
        self.walk(name)?;
        Ok(Reference(name.to_string()))
    }

    pub fn resolve(&self, reference: &Reference) -> PaasResult<Option<String>> {
        self.walk(reference.name())
    }

    fn walk(&self, name: &str) -> PaasResult<Option<String>> {
        let mut current = Some(Arc::clone(&self.scope));
        while let Some(scope) = current {
            if let Some(value) = scope.lookup(name) {
                return Ok(value);
            }
            current = scope.parent.upgrade();
        }
        Err(PaasError::not_found(format!("{} is not available into the default bag", name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn child_shadows_parent_and_falls_back() {
        let root = DefaultsBag::new();
        root.set("storage-provider", Some("nfs")).set("storage-size", Some("1Gi"));
        let eu = root.for_cluster("eu");
        eu.set("storage-provider", Some("ceph"));

        let r = eu.get_reference("storage-provider").unwrap();
        assert_eq!(eu.resolve(&r).unwrap().as_deref(), Some("ceph"));
        assert_eq!(root.resolve(&r).unwrap().as_deref(), Some("nfs"));
        let size = eu.get_reference("storage-size").unwrap();
        assert_eq!(eu.resolve(&size).unwrap().as_deref(), Some("1Gi"));
    }

    #[test]
    fn none_is_defined_but_missing_is_an_error() {
        let root = DefaultsBag::new();
        root.set("oci-registry-config-name", None);
        let child = root.for_cluster("a");
        let r = child.get_reference("oci-registry-config-name").unwrap();
        assert_eq!(child.resolve(&r).unwrap(), None);

        let err = child.get_reference("nope").unwrap_err();
        assert_eq!(err.code(), 404);
        assert!(child.resolve(&Reference("nope".into())).is_err());
    }

    #[test]
    fn for_cluster_is_idempotent_and_get_bag_for_falls_back() {
        let root = DefaultsBag::new();
        root.set("k", Some("root"));
        root.for_cluster("x").set("k", Some("x"));
        let again = root.for_cluster("x");
        assert_eq!(again.resolve(&Reference("k".into())).unwrap().as_deref(), Some("x"));

        let unknown = root.get_bag_for("y");
        assert_eq!(unknown.scope_name(), None);
        assert_eq!(root.get_bag_for("x").scope_name(), Some("x"));
    }

    #[test]
    fn reference_resolves_values_layered_after_capture() {
        let root = DefaultsBag::new();
        root.set("storage-provider", Some("nfs"));
        let r = root.get_reference("storage-provider").unwrap();
        root.for_cluster("late").set("storage-provider", Some("local"));
        let late = Resolvable::Deferred(r);
        assert_eq!(late.resolve(&root.get_bag_for("late")).unwrap().as_deref(), Some("local"));
        assert_eq!(Resolvable::Literal("x".into()).resolve(&root).unwrap().as_deref(), Some("x"));
    }
}
