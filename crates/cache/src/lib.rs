//! Vista caches: the per-kind view store and the object-cache collaborator
//! trait the controller fetches base objects through.

#![forbid(unsafe_code)]

use std::sync::Arc;

use rustc_hash::FxHashMap;
use serde_json::Value;
use tokio::sync::RwLock;
use tracing::trace;

use vista_core::{object, Kind, ObjectKey};

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    Identity(#[from] vista_core::Error),
    #[error("cache: {0}")]
    Internal(String),
}

/// Per-kind document store keyed by `(namespace, name)`. Single-writer:
/// the controller worker owns it, so no interior locking.
#[derive(Debug, Default)]
pub struct ViewStore {
    kinds: FxHashMap<Kind, FxHashMap<ObjectKey, Value>>,
}

impl ViewStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace-or-insert by identity key. Idempotent.
    pub fn upsert(&mut self, kind: &Kind, obj: Value) -> Result<ObjectKey, Error> {
        let key = object::key(&obj)?;
        trace!(kind = %kind, key = %key, "cache upsert");
        self.kinds.entry(kind.clone()).or_default().insert(key.clone(), obj);
        Ok(key)
    }

    /// Remove by key; a no-op when absent.
    pub fn delete(&mut self, kind: &Kind, key: &ObjectKey) -> Option<Value> {
        self.kinds.get_mut(kind).and_then(|m| m.remove(key))
    }

    pub fn get(&self, kind: &Kind, key: &ObjectKey) -> Option<&Value> {
        self.kinds.get(kind).and_then(|m| m.get(key))
    }

    /// Enumerate a kind's objects. Order is unspecified.
    pub fn list<'a>(&'a self, kind: &Kind) -> impl Iterator<Item = &'a Value> + 'a {
        self.kinds.get(kind).into_iter().flat_map(|m| m.values())
    }

    pub fn len(&self, kind: &Kind) -> usize {
        self.kinds.get(kind).map_or(0, |m| m.len())
    }

    pub fn is_empty(&self, kind: &Kind) -> bool {
        self.len(kind) == 0
    }
}

/// Read access to live base objects, backed by the cluster client in
/// production and by [`FakeObjectCache`] in tests.
#[async_trait::async_trait]
pub trait ObjectCache: Send + Sync {
    async fn get(&self, kind: &Kind, key: &ObjectKey) -> Result<Option<Value>, Error>;
    async fn list(&self, kind: &Kind) -> Result<Vec<Value>, Error>;
}

/// In-memory `ObjectCache` test double.
#[derive(Default)]
pub struct FakeObjectCache {
    store: Arc<RwLock<ViewStore>>,
}

impl FakeObjectCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn upsert(&self, kind: &Kind, obj: Value) -> Result<ObjectKey, Error> {
        self.store.write().await.upsert(kind, obj)
    }

    pub async fn delete(&self, kind: &Kind, key: &ObjectKey) {
        self.store.write().await.delete(kind, key);
    }
}

#[async_trait::async_trait]
impl ObjectCache for FakeObjectCache {
    async fn get(&self, kind: &Kind, key: &ObjectKey) -> Result<Option<Value>, Error> {
        Ok(self.store.read().await.get(kind, key).cloned())
    }

    async fn list(&self, kind: &Kind) -> Result<Vec<Value>, Error> {
        Ok(self.store.read().await.list(kind).cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn pod(name: &str, ns: &str, phase: &str) -> Value {
        json!({"metadata": {"name": name, "namespace": ns}, "status": {"phase": phase}})
    }

    #[test]
    fn upsert_is_idempotent() {
        let kind = Kind::core("v1", "Pod");
        let mut store = ViewStore::new();
        let key = store.upsert(&kind, pod("p", "d", "Running")).unwrap();
        store.upsert(&kind, pod("p", "d", "Running")).unwrap();
        assert_eq!(store.len(&kind), 1);
        assert_eq!(store.get(&kind, &key).unwrap()["status"]["phase"], "Running");
    }

    #[test]
    fn upsert_replaces_by_identity() {
        let kind = Kind::core("v1", "Pod");
        let mut store = ViewStore::new();
        let key = store.upsert(&kind, pod("p", "d", "Pending")).unwrap();
        store.upsert(&kind, pod("p", "d", "Running")).unwrap();
        assert_eq!(store.get(&kind, &key).unwrap()["status"]["phase"], "Running");
    }

    #[test]
    fn delete_absent_is_noop() {
        let kind = Kind::core("v1", "Pod");
        let mut store = ViewStore::new();
        assert!(store.delete(&kind, &ObjectKey::new(Some("d"), "nope")).is_none());

        let key = store.upsert(&kind, pod("p", "d", "Running")).unwrap();
        assert!(store.delete(&kind, &key).is_some());
        assert!(store.is_empty(&kind));
    }

    #[test]
    fn kinds_are_disjoint() {
        let pods = Kind::core("v1", "Pod");
        let maps = Kind::core("v1", "ConfigMap");
        let mut store = ViewStore::new();
        store.upsert(&pods, pod("a", "d", "Running")).unwrap();
        store.upsert(&maps, json!({"metadata": {"name": "a", "namespace": "d"}})).unwrap();
        assert_eq!(store.len(&pods), 1);
        assert_eq!(store.len(&maps), 1);
        store.delete(&pods, &ObjectKey::new(Some("d"), "a"));
        assert_eq!(store.len(&maps), 1);
    }

    #[test]
    fn upsert_requires_name() {
        let kind = Kind::core("v1", "Pod");
        let mut store = ViewStore::new();
        assert!(store.upsert(&kind, json!({"metadata": {}})).is_err());
    }
}
