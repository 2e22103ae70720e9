//! Vista core types: kinds, object identity, deltas.

#![forbid(unsafe_code)]

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Group reserved for in-process view kinds. Views never reach the cluster.
pub const VIEW_GROUP: &str = "view.vista.dev";
pub const VIEW_VERSION: &str = "v1alpha1";

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("object has no metadata.name")]
    MissingName,
    #[error("invalid kind key: {0} (expect v1/Kind or group/v1/Kind)")]
    InvalidKindKey(String),
}

/// A `(group, version, kind)` resource identifier. Views are kinds in the
/// reserved [`VIEW_GROUP`] group.
#[derive(Debug, Clone, Hash, PartialEq, Eq, Serialize, Deserialize)]
pub struct Kind {
    #[serde(default)]
    pub group: String,
    #[serde(default)]
    pub version: String,
    pub kind: String,
}

impl Kind {
    pub fn new(group: &str, version: &str, kind: &str) -> Self {
        Self { group: group.to_string(), version: version.to_string(), kind: kind.to_string() }
    }

    pub fn core(version: &str, kind: &str) -> Self {
        Self::new("", version, kind)
    }

    /// A named view kind local to the runtime.
    pub fn view(name: &str) -> Self {
        Self::new(VIEW_GROUP, VIEW_VERSION, name)
    }

    pub fn is_view(&self) -> bool {
        self.group == VIEW_GROUP
    }

    /// Render the `v1/Kind` / `group/v1/Kind` key format.
    pub fn key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.kind)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.kind)
        }
    }

    pub fn parse_key(key: &str) -> Result<Self, Error> {
        let parts: Vec<_> = key.split('/').collect();
        match parts.as_slice() {
            [version, kind] => Ok(Self::core(version, kind)),
            [group, version, kind] => Ok(Self::new(group, version, kind)),
            _ => Err(Error::InvalidKindKey(key.to_string())),
        }
    }

    /// The `apiVersion` field value for objects of this kind.
    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }
}

impl std::fmt::Display for Kind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.key())
    }
}

/// Identity of an object within a kind: `(namespace, name)`.
#[derive(Debug, Clone, Hash, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ObjectKey {
    pub namespace: Option<String>,
    pub name: String,
}

impl ObjectKey {
    pub fn new(namespace: Option<&str>, name: &str) -> Self {
        Self { namespace: namespace.map(|s| s.to_string()), name: name.to_string() }
    }
}

impl std::fmt::Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{}/{}", ns, self.name),
            None => f.write_str(&self.name),
        }
    }
}

/// Watch event classes. `Replaced` and `Sync` are upsert-class: `Sync` is
/// emitted on an initial list, `Replaced` on a full-state refresh.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeltaKind {
    Added,
    Updated,
    Replaced,
    Deleted,
    Sync,
}

impl DeltaKind {
    pub fn is_delete(&self) -> bool {
        matches!(self, DeltaKind::Deleted)
    }
}

/// A typed event-plus-object pair. A `Deleted` delta carries at least the
/// object identity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Delta {
    pub kind: DeltaKind,
    pub object: Value,
}

impl Delta {
    pub fn new(kind: DeltaKind, object: Value) -> Self {
        Self { kind, object }
    }
}

/// Unstructured-object metadata accessors.
pub mod object {
    use super::{Error, Kind, ObjectKey};
    use serde_json::{json, Map, Value};

    pub fn name(obj: &Value) -> Option<&str> {
        obj.get("metadata").and_then(|m| m.get("name")).and_then(|v| v.as_str())
    }

    pub fn namespace(obj: &Value) -> Option<&str> {
        obj.get("metadata").and_then(|m| m.get("namespace")).and_then(|v| v.as_str())
    }

    pub fn labels(obj: &Value) -> Option<&Map<String, Value>> {
        obj.get("metadata").and_then(|m| m.get("labels")).and_then(|v| v.as_object())
    }

    pub fn annotations(obj: &Value) -> Option<&Map<String, Value>> {
        obj.get("metadata").and_then(|m| m.get("annotations")).and_then(|v| v.as_object())
    }

    /// Identity key of an object; `metadata.name` is required.
    pub fn key(obj: &Value) -> Result<ObjectKey, Error> {
        let name = name(obj).filter(|n| !n.is_empty()).ok_or(Error::MissingName)?;
        Ok(ObjectKey::new(namespace(obj), name))
    }

    /// Minimal object carrying identity only. Used for delete events where
    /// the full object is gone.
    pub fn tombstone(kind: &Kind, key: &ObjectKey) -> Value {
        let mut meta = Map::new();
        meta.insert("name".into(), Value::String(key.name.clone()));
        if let Some(ns) = &key.namespace {
            meta.insert("namespace".into(), Value::String(ns.clone()));
        }
        json!({
            "apiVersion": kind.api_version(),
            "kind": kind.kind,
            "metadata": Value::Object(meta),
        })
    }
}
