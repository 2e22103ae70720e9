//! Operator-spec loading and multi-controller assembly.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, oneshot};
use tracing::info;

use vista_cache::ObjectCache;

use crate::{Config, Controller, Error, Health, Request, Writer};

/// One controller entry of the declarative operator document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerSpec {
    pub name: String,
    pub sources: Vec<crate::Source>,
    #[serde(default)]
    pub pipeline: vista_pipeline::Pipeline,
    pub target: crate::TargetSpec,
}

impl ControllerSpec {
    pub fn config(&self) -> Config {
        Config {
            sources: self.sources.clone(),
            pipeline: self.pipeline.clone(),
            target: self.target.clone(),
        }
    }
}

/// The declarative operator document: a list of controllers.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperatorSpec {
    pub controllers: Vec<ControllerSpec>,
}

impl OperatorSpec {
    pub fn from_yaml(raw: &str) -> Result<Self, Error> {
        serde_yaml::from_str(raw).map_err(|e| Error::Config(e.to_string()))
    }
}

/// Builds and runs the controllers of one operator spec over a shared
/// object cache and writer. Each controller owns disjoint state; they run
/// in parallel within the process.
pub struct Runtime {
    controllers: Vec<Controller>,
    senders: Vec<(String, mpsc::Sender<Request>)>,
    healths: Vec<(String, Health)>,
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime").field("controllers", &self.controllers.len()).finish_non_exhaustive()
    }
}

impl Runtime {
    /// Construct every controller in the spec. Any config error aborts the
    /// whole build: a partially started operator is worse than none.
    pub fn build(
        spec: &OperatorSpec,
        cache: Arc<dyn ObjectCache>,
        writer: Arc<dyn Writer>,
        status_tx: Option<mpsc::UnboundedSender<String>>,
    ) -> Result<Self, Error> {
        let mut controllers = Vec::with_capacity(spec.controllers.len());
        let mut senders = Vec::with_capacity(spec.controllers.len());
        let mut healths = Vec::with_capacity(spec.controllers.len());
        for entry in &spec.controllers {
            let (controller, tx) = Controller::new(
                &entry.name,
                entry.config(),
                Arc::clone(&cache),
                Arc::clone(&writer),
                status_tx.clone(),
            )?;
            healths.push((entry.name.clone(), controller.health()));
            senders.push((entry.name.clone(), tx));
            controllers.push(controller);
        }
        info!(controllers = controllers.len(), "operator assembled");
        Ok(Self { controllers, senders, healths })
    }

    /// Request sender for a controller, for wiring watch producers.
    pub fn sender(&self, name: &str) -> Option<mpsc::Sender<Request>> {
        self.senders.iter().find(|(n, _)| n == name).map(|(_, tx)| tx.clone())
    }

    /// Spawn every controller worker onto the runtime.
    pub fn spawn(self) -> RuntimeHandle {
        let mut tasks = Vec::with_capacity(self.controllers.len());
        let mut shutdowns = Vec::with_capacity(self.controllers.len());
        for controller in self.controllers {
            let (stop_tx, stop_rx) = oneshot::channel();
            shutdowns.push(stop_tx);
            tasks.push(tokio::spawn(controller.run(stop_rx)));
        }
        RuntimeHandle { tasks, shutdowns, senders: self.senders, healths: self.healths }
    }
}

/// Handle over the running workers.
pub struct RuntimeHandle {
    tasks: Vec<tokio::task::JoinHandle<()>>,
    shutdowns: Vec<oneshot::Sender<()>>,
    senders: Vec<(String, mpsc::Sender<Request>)>,
    healths: Vec<(String, Health)>,
}

impl RuntimeHandle {
    pub fn sender(&self, name: &str) -> Option<mpsc::Sender<Request>> {
        self.senders.iter().find(|(n, _)| n == name).map(|(_, tx)| tx.clone())
    }

    /// True while no controller has latched a critical error.
    pub fn is_healthy(&self) -> bool {
        self.healths.iter().all(|(_, h)| h.is_healthy())
    }

    /// Signal every worker and wait for the in-flight requests to finish.
    pub async fn shutdown(self) {
        drop(self.senders);
        for stop in self.shutdowns {
            let _ = stop.send(());
        }
        for task in self.tasks {
            let _ = task.await;
        }
        info!("operator stopped");
    }
}
