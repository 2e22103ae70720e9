//! Vista controller: materialises a declarative controller config as a
//! live worker that multiplexes source watch events through the pipeline
//! and applies the resulting deltas onto a target.

#![forbid(unsafe_code)]

use std::sync::Arc;

use metrics::counter;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use vista_cache::ObjectCache;
use vista_core::{object, Delta, DeltaKind, Kind, ObjectKey};
use vista_pipeline::{Engine, Pipeline};

mod reporter;
mod runtime;
mod target;

pub use reporter::{ErrorReporter, Health, ERROR_STACK_SIZE};
pub use runtime::{ControllerSpec, OperatorSpec, Runtime, RuntimeHandle};
pub use target::{TargetType, TargetWriter, WriteMode, Writer};

/// Default request-channel capacity; producers block when it fills up.
pub const DEFAULT_QUEUE_CAP: usize = 1024;

fn queue_cap() -> usize {
    std::env::var("VISTA_QUEUE_CAP")
        .ok()
        .and_then(|s| s.parse::<usize>().ok())
        .unwrap_or(DEFAULT_QUEUE_CAP)
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid controller configuration; fatal at construction.
    #[error("config: {0}")]
    Config(String),
    /// Pipeline or expression failure; the current delta is skipped.
    #[error(transparent)]
    Pipeline(#[from] vista_pipeline::Error),
    /// Base-object fetch failed for a reason other than a plain miss.
    #[error("cache: {0}")]
    Cache(String),
    /// Target write failed; the cluster re-sync re-emits eventually.
    #[error("target {kind}: {reason}")]
    Target { kind: String, reason: String },
    /// Unrecoverable fault; the controller goes unhealthy.
    #[error("critical: {0}")]
    Critical(String),
}

/// A watched base resource.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    #[serde(default, rename = "apiGroup")]
    pub api_group: String,
    #[serde(default)]
    pub version: String,
    pub kind: String,
}

impl Source {
    pub fn kind(&self) -> Kind {
        let version = if self.version.is_empty() { "v1" } else { &self.version };
        Kind::new(&self.api_group, version, &self.kind)
    }
}

/// The destination resource and write mode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TargetSpec {
    #[serde(default, rename = "apiGroup")]
    pub api_group: String,
    #[serde(default)]
    pub version: String,
    pub kind: String,
    #[serde(default, rename = "type")]
    pub target_type: TargetType,
}

impl TargetSpec {
    pub fn kind(&self) -> Kind {
        let version = if self.version.is_empty() { "v1" } else { &self.version };
        Kind::new(&self.api_group, version, &self.kind)
    }
}

/// Declarative controller definition: sources, pipeline, target.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub sources: Vec<Source>,
    #[serde(default)]
    pub pipeline: Pipeline,
    pub target: TargetSpec,
}

impl Config {
    fn validate(&self) -> Result<(), Error> {
        if self.sources.is_empty() {
            return Err(Error::Config("no source".into()));
        }
        if self.sources.iter().any(|s| s.kind.is_empty()) {
            return Err(Error::Config("source kind must not be empty".into()));
        }
        if self.target.kind.is_empty() {
            return Err(Error::Config("no target".into()));
        }
        if self.sources.len() > 1 && self.pipeline.join.is_none() {
            return Err(Error::Config(
                "controllers with multiple sources must specify a @join in the pipeline".into(),
            ));
        }
        Ok(())
    }
}

/// One multiplexed watch event. Carries identity only; the object is
/// fetched when the request is processed.
#[derive(Debug, Clone)]
pub struct Request {
    pub kind: Kind,
    pub namespace: Option<String>,
    pub name: String,
    pub event: DeltaKind,
}

/// A single controller: one worker draining one bounded request channel.
pub struct Controller {
    name: String,
    pipeline: Pipeline,
    engine: Engine,
    target: TargetWriter,
    cache: Arc<dyn ObjectCache>,
    rx: mpsc::Receiver<Request>,
    reporter: ErrorReporter,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller").field("name", &self.name).finish_non_exhaustive()
    }
}

impl Controller {
    /// Validate the config and assemble the controller. Returns the
    /// request sender that watch producers feed; sends block while the
    /// channel is full.
    pub fn new(
        name: &str,
        config: Config,
        cache: Arc<dyn ObjectCache>,
        writer: Arc<dyn Writer>,
        status_tx: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<(Self, mpsc::Sender<Request>), Error> {
        config.validate()?;

        let sources: Vec<Kind> = config.sources.iter().map(Source::kind).collect();
        let target_kind = config.target.kind();
        info!(
            name,
            sources = %sources.iter().map(Kind::key).collect::<Vec<_>>().join(","),
            target = %target_kind,
            "creating controller"
        );

        let (tx, rx) = mpsc::channel(queue_cap());
        let controller = Self {
            name: name.to_string(),
            pipeline: config.pipeline,
            engine: Engine::new(target_kind.clone(), sources),
            target: TargetWriter::new(target_kind, config.target.target_type, writer),
            cache,
            rx,
            reporter: ErrorReporter::new(status_tx),
        };
        Ok((controller, tx))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared health view; goes false once a critical error is reported.
    pub fn health(&self) -> Health {
        self.reporter.health()
    }

    /// Latch a critical fault from the outside (e.g. a watch that cannot
    /// be established).
    pub fn report_critical(&mut self, reason: &str) {
        self.reporter.push_critical(Error::Critical(reason.to_string()));
    }

    /// Drain requests until shutdown fires or every producer is gone. The
    /// in-flight request is finished before returning.
    pub async fn run(mut self, mut shutdown: oneshot::Receiver<()>) {
        info!(name = %self.name, "starting");
        loop {
            tokio::select! {
                maybe = self.rx.recv() => match maybe {
                    Some(req) => {
                        counter!("controller_requests_total", 1u64);
                        if let Err(err) = self.process(req).await {
                            self.reporter.push(err);
                        }
                    }
                    None => {
                        debug!(name = %self.name, "request channel closed");
                        break;
                    }
                },
                _ = &mut shutdown => {
                    debug!(name = %self.name, "terminating");
                    break;
                }
            }
        }
        info!(name = %self.name, "stopped");
    }

    async fn process(&mut self, req: Request) -> Result<(), Error> {
        let key = ObjectKey::new(req.namespace.as_deref(), &req.name);
        debug!(name = %self.name, kind = %req.kind, key = %key, event = ?req.event, "processing request");

        let delta = if req.event.is_delete() {
            // the engine holds last-known state; identity is enough here
            Delta::new(DeltaKind::Deleted, object::tombstone(&req.kind, &key))
        } else {
            match self.cache.get(&req.kind, &key).await {
                Ok(Some(obj)) => Delta::new(req.event, obj),
                Ok(None) => {
                    // transient: the object vanished between event and fetch
                    warn!(kind = %req.kind, key = %key, "object disappeared before fetch; dropping request");
                    counter!("controller_requests_dropped_total", 1u64);
                    return Ok(());
                }
                Err(e) => return Err(Error::Cache(e.to_string())),
            }
        };

        let deltas = self.pipeline.evaluate(&mut self.engine, &req.kind, &delta)?;

        for delta in &deltas {
            // a failed write must not starve the rest of the fan-out
            if let Err(err) = self.target.write(delta).await {
                self.reporter.push(err);
            }
        }
        Ok(())
    }
}
