//! Engine state: the base-view caches consulted by joins and the
//! emitted-view cache used to turn recomputed fan-outs into deltas.

use rustc_hash::{FxHashMap, FxHashSet};
use serde_json::Value;
use tracing::trace;

use vista_cache::ViewStore;
use vista_core::{object, Delta, DeltaKind, Kind, ObjectKey};

use crate::Error;

/// Stateful evaluation engine owned by one controller. Holds the per-source
/// base caches, the emitted-view cache keyed by projected identity, and an
/// origin index mapping each input object to the projected identities its
/// last evaluation produced.
pub struct Engine {
    target: Kind,
    sources: Vec<Kind>,
    pub(crate) base: ViewStore,
    emitted: FxHashMap<ObjectKey, Value>,
    origin: FxHashMap<(Kind, ObjectKey), FxHashSet<ObjectKey>>,
}

impl Engine {
    pub fn new(target: Kind, sources: Vec<Kind>) -> Self {
        Self {
            target,
            sources,
            base: ViewStore::new(),
            emitted: FxHashMap::default(),
            origin: FxHashMap::default(),
        }
    }

    pub fn target(&self) -> &Kind {
        &self.target
    }

    pub fn sources(&self) -> &[Kind] {
        &self.sources
    }

    /// Number of target objects currently materialised.
    pub fn view_len(&self) -> usize {
        self.emitted.len()
    }

    /// Diff an input's recomputed fan-out against what it produced last
    /// time. Identities gone from the fan-out become `Deleted` deltas,
    /// fresh ones `Added`, surviving ones inherit the input delta kind.
    /// Deletes are emitted before upserts.
    pub(crate) fn diff(
        &mut self,
        source: &Kind,
        input: ObjectKey,
        outputs: Vec<Value>,
        input_kind: DeltaKind,
    ) -> Result<Vec<Delta>, Error> {
        // dedup by projected identity, last wins, first-seen order kept
        let mut ids: Vec<ObjectKey> = Vec::with_capacity(outputs.len());
        let mut by_id: FxHashMap<ObjectKey, Value> = FxHashMap::default();
        for out in outputs {
            let id = object::key(&out).map_err(|_| Error::ProjectionIdentity)?;
            if by_id.insert(id.clone(), out).is_none() {
                ids.push(id);
            }
        }

        let origin_key = (source.clone(), input);
        let old: FxHashSet<ObjectKey> = self.origin.remove(&origin_key).unwrap_or_default();

        let mut deltas = Vec::new();
        for id in &old {
            if !by_id.contains_key(id) {
                let last = self
                    .emitted
                    .remove(id)
                    .unwrap_or_else(|| object::tombstone(&self.target, id));
                trace!(target = %self.target, id = %id, "retracting from view");
                deltas.push(Delta::new(DeltaKind::Deleted, last));
            }
        }

        let mut fresh = FxHashSet::default();
        for id in ids {
            let Some(out) = by_id.remove(&id) else { continue };
            let kind = if old.contains(&id) || self.emitted.contains_key(&id) {
                input_kind
            } else {
                DeltaKind::Added
            };
            self.emitted.insert(id.clone(), out.clone());
            fresh.insert(id);
            deltas.push(Delta::new(kind, out));
        }
        if !fresh.is_empty() {
            self.origin.insert(origin_key, fresh);
        }

        Ok(deltas)
    }
}
