//! Target writing: view deltas become cluster operations.

use std::sync::Arc;
use std::time::Instant;

use metrics::histogram;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use vista_core::{Delta, DeltaKind, Kind};

use crate::Error;

/// How a delta is pushed onto the cluster. Implementations must be
/// idempotent under retry: `Replace` is create-else-replace, `Patch` is
/// merge-patch-else-create, `Delete` tolerates an already-absent object.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteMode {
    Replace,
    Patch,
    Delete,
}

/// Cluster write collaborator. Stateless; each call is a standalone RPC.
#[async_trait::async_trait]
pub trait Writer: Send + Sync {
    async fn apply(&self, kind: &Kind, object: &Value, mode: WriteMode) -> anyhow::Result<()>;
}

/// Updaters replace the whole target object; patchers merge only the
/// projected fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TargetType {
    #[default]
    Updater,
    Patcher,
}

/// Translates output deltas into writes on the target kind.
pub struct TargetWriter {
    kind: Kind,
    target_type: TargetType,
    writer: Arc<dyn Writer>,
}

impl TargetWriter {
    pub fn new(kind: Kind, target_type: TargetType, writer: Arc<dyn Writer>) -> Self {
        Self { kind, target_type, writer }
    }

    pub fn kind(&self) -> &Kind {
        &self.kind
    }

    pub async fn write(&self, delta: &Delta) -> Result<(), Error> {
        let mode = match (delta.kind, self.target_type) {
            (DeltaKind::Deleted, _) => WriteMode::Delete,
            (_, TargetType::Updater) => WriteMode::Replace,
            (_, TargetType::Patcher) => WriteMode::Patch,
        };
        debug!(target = %self.kind, mode = ?mode, "writing delta to target");
        let t0 = Instant::now();
        self.writer
            .apply(&self.kind, &delta.object, mode)
            .await
            .map_err(|e| Error::Target { kind: self.kind.key(), reason: e.to_string() })?;
        histogram!("target_write_ms", t0.elapsed().as_secs_f64() * 1000.0);
        Ok(())
    }
}
