#![forbid(unsafe_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio::sync::oneshot;

use vista_cache::FakeObjectCache;
use vista_controller::{
    Config, Controller, OperatorSpec, Request, Runtime, Source, TargetSpec, TargetType,
    WriteMode, Writer,
};
use vista_core::{DeltaKind, Kind, ObjectKey};

#[derive(Default)]
struct RecordingWriter {
    records: Mutex<Vec<(String, Value, WriteMode)>>,
}

impl RecordingWriter {
    fn records(&self) -> Vec<(String, Value, WriteMode)> {
        self.records.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl Writer for RecordingWriter {
    async fn apply(&self, kind: &Kind, object: &Value, mode: WriteMode) -> anyhow::Result<()> {
        self.records.lock().unwrap().push((kind.key(), object.clone(), mode));
        Ok(())
    }
}

struct FailingWriter {
    calls: AtomicUsize,
}

#[async_trait::async_trait]
impl Writer for FailingWriter {
    async fn apply(&self, _kind: &Kind, _object: &Value, _mode: WriteMode) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        anyhow::bail!("target unavailable")
    }
}

fn source(kind: &str) -> Source {
    Source { api_group: String::new(), version: "v1".into(), kind: kind.into() }
}

fn view_target(kind: &str) -> TargetSpec {
    TargetSpec {
        api_group: vista_core::VIEW_GROUP.into(),
        version: vista_core::VIEW_VERSION.into(),
        kind: kind.into(),
        target_type: TargetType::Updater,
    }
}

fn phase_config() -> Config {
    Config {
        sources: vec![source("Pod")],
        pipeline: serde_json::from_str(
            r#"{"@aggregate": [
                {"@project": {
                    "metadata": {"name": "$.metadata.name", "namespace": "$.metadata.namespace"},
                    "data": {"phase": "$.status.phase"}
                }}
            ]}"#,
        )
        .unwrap(),
        target: view_target("PodPhase"),
    }
}

fn pod(name: &str, ns: &str, phase: &str) -> Value {
    json!({"metadata": {"name": name, "namespace": ns}, "status": {"phase": phase}})
}

fn request(kind: &Kind, ns: &str, name: &str, event: DeltaKind) -> Request {
    Request { kind: kind.clone(), namespace: Some(ns.into()), name: name.into(), event }
}

// §8 scenario: construction faults are config errors, the controller never starts
#[test]
fn invalid_configs_are_rejected() {
    let cache: Arc<FakeObjectCache> = Arc::new(FakeObjectCache::new());
    let writer = Arc::new(RecordingWriter::default());

    let no_sources = Config { sources: vec![], ..phase_config() };
    let err = Controller::new("t", no_sources, cache.clone(), writer.clone(), None).unwrap_err();
    assert!(err.to_string().contains("no source"));

    let no_target = Config {
        target: TargetSpec {
            api_group: String::new(),
            version: String::new(),
            kind: String::new(),
            target_type: TargetType::Updater,
        },
        ..phase_config()
    };
    let err = Controller::new("t", no_target, cache.clone(), writer.clone(), None).unwrap_err();
    assert!(err.to_string().contains("no target"));

    // two sources without a @join
    let unjoined = Config {
        sources: vec![source("ConfigMap"), source("Deployment")],
        ..phase_config()
    };
    let err = Controller::new("t", unjoined, cache, writer, None).unwrap_err();
    assert!(err.to_string().contains("@join"));
}

#[tokio::test]
async fn end_to_end_projection() {
    let pods = Kind::core("v1", "Pod");
    let cache = Arc::new(FakeObjectCache::new());
    cache.upsert(&pods, pod("p", "d", "Running")).await.unwrap();

    let writer = Arc::new(RecordingWriter::default());
    let (controller, tx) =
        Controller::new("phase", phase_config(), cache.clone(), writer.clone(), None).unwrap();
    let (_stop_tx, stop_rx) = oneshot::channel();
    let worker = tokio::spawn(controller.run(stop_rx));

    tx.send(request(&pods, "d", "p", DeltaKind::Added)).await.unwrap();
    drop(tx); // close the channel so the worker drains and exits
    worker.await.unwrap();

    let records = writer.records();
    assert_eq!(records.len(), 1);
    let (kind, object, mode) = &records[0];
    assert_eq!(kind, "view.vista.dev/v1alpha1/PodPhase");
    assert_eq!(*mode, WriteMode::Replace);
    assert_eq!(
        *object,
        json!({"metadata": {"name": "p", "namespace": "d"}, "data": {"phase": "Running"}})
    );
}

#[tokio::test]
async fn delete_reaches_the_target() {
    let pods = Kind::core("v1", "Pod");
    let cache = Arc::new(FakeObjectCache::new());
    cache.upsert(&pods, pod("p", "d", "Running")).await.unwrap();

    let writer = Arc::new(RecordingWriter::default());
    let (controller, tx) =
        Controller::new("phase", phase_config(), cache.clone(), writer.clone(), None).unwrap();
    let (_stop_tx, stop_rx) = oneshot::channel();
    let worker = tokio::spawn(controller.run(stop_rx));

    tx.send(request(&pods, "d", "p", DeltaKind::Added)).await.unwrap();
    // the object vanishes from the cluster, then the delete event lands
    cache.delete(&pods, &ObjectKey::new(Some("d"), "p")).await;
    tx.send(request(&pods, "d", "p", DeltaKind::Deleted)).await.unwrap();
    drop(tx);
    worker.await.unwrap();

    let records = writer.records();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].2, WriteMode::Replace);
    assert_eq!(records[1].2, WriteMode::Delete);
    assert_eq!(records[1].1["metadata"]["name"], "p");
}

#[tokio::test]
async fn cache_miss_drops_the_request() {
    let pods = Kind::core("v1", "Pod");
    let cache = Arc::new(FakeObjectCache::new());
    let writer = Arc::new(RecordingWriter::default());
    let (controller, tx) =
        Controller::new("phase", phase_config(), cache, writer.clone(), None).unwrap();
    let health = controller.health();
    let (_stop_tx, stop_rx) = oneshot::channel();
    let worker = tokio::spawn(controller.run(stop_rx));

    tx.send(request(&Kind::core("v1", "Pod"), "d", "ghost", DeltaKind::Added)).await.unwrap();
    drop(tx);
    worker.await.unwrap();

    assert!(writer.records().is_empty());
    assert!(health.is_healthy());
}

#[tokio::test]
async fn failed_writes_do_not_starve_the_fanout() {
    let svcs = Kind::core("v1", "Service");
    let cache = Arc::new(FakeObjectCache::new());
    cache
        .upsert(
            &svcs,
            json!({"metadata": {"name": "web", "namespace": "d"},
                   "spec": {"ports": [{"name": "http", "port": 80},
                                       {"name": "https", "port": 443}]}}),
        )
        .await
        .unwrap();

    let config = Config {
        sources: vec![source("Service")],
        pipeline: serde_json::from_str(
            r#"{"@aggregate": [
                {"@unwind": "$.spec.ports"},
                {"@project": {
                    "metadata": {"name": {"@concat": ["$.metadata.name", "-", "$.spec.ports.name"]},
                                 "namespace": "$.metadata.namespace"}
                }}
            ]}"#,
        )
        .unwrap(),
        target: view_target("ServicePort"),
    };

    let writer = Arc::new(FailingWriter { calls: AtomicUsize::new(0) });
    let (tx_status, mut rx_status) = tokio::sync::mpsc::unbounded_channel();
    let (controller, tx) =
        Controller::new("ports", config, cache, writer.clone(), Some(tx_status)).unwrap();
    let (_stop_tx, stop_rx) = oneshot::channel();
    let worker = tokio::spawn(controller.run(stop_rx));

    tx.send(request(&svcs, "d", "web", DeltaKind::Added)).await.unwrap();
    drop(tx);
    worker.await.unwrap();

    // both fan-out writes were attempted despite the first failure
    assert_eq!(writer.calls.load(Ordering::SeqCst), 2);
    let note = rx_status.recv().await.expect("status notification");
    assert!(note.contains("target unavailable"));
}

#[tokio::test]
async fn shutdown_stops_the_worker() {
    let cache = Arc::new(FakeObjectCache::new());
    let writer = Arc::new(RecordingWriter::default());
    let (controller, tx) =
        Controller::new("phase", phase_config(), cache, writer, None).unwrap();
    let (stop_tx, stop_rx) = oneshot::channel();
    let worker = tokio::spawn(controller.run(stop_rx));

    stop_tx.send(()).unwrap();
    worker.await.unwrap();
    drop(tx);
}

const OPERATOR_YAML: &str = r#"
controllers:
  - name: deployment-stamp
    sources:
      - kind: ConfigMap
      - apiGroup: apps
        kind: Deployment
    pipeline:
      "@join":
        "@eq":
          - "$.ConfigMap.metadata.name"
          - "$.Deployment.metadata.annotations[\"related-cm\"]"
      "@aggregate":
        - "@project":
            metadata:
              name: "$.Deployment.metadata.name"
              namespace: "$.Deployment.metadata.namespace"
            spec:
              template:
                metadata:
                  annotations:
                    cm-version: "$.ConfigMap.metadata.resourceVersion"
    target:
      apiGroup: apps
      kind: Deployment
      type: Patcher
"#;

#[tokio::test]
async fn operator_spec_assembles_and_runs() {
    let spec = OperatorSpec::from_yaml(OPERATOR_YAML).unwrap();
    assert_eq!(spec.controllers.len(), 1);

    let cms = Kind::core("v1", "ConfigMap");
    let deps = Kind::new("apps", "v1", "Deployment");
    let cache = Arc::new(FakeObjectCache::new());
    cache
        .upsert(
            &deps,
            json!({"metadata": {"name": "d1", "namespace": "x",
                                 "annotations": {"related-cm": "c1"}}}),
        )
        .await
        .unwrap();
    cache
        .upsert(&cms, json!({"metadata": {"name": "c1", "namespace": "x", "resourceVersion": "7"}}))
        .await
        .unwrap();

    let writer = Arc::new(RecordingWriter::default());
    let runtime = Runtime::build(&spec, cache, writer.clone(), None).unwrap();
    let handle = runtime.spawn();
    assert!(handle.is_healthy());

    let tx = handle.sender("deployment-stamp").unwrap();
    tx.send(request(&deps, "x", "d1", DeltaKind::Added)).await.unwrap();
    tx.send(request(&cms, "x", "c1", DeltaKind::Added)).await.unwrap();
    drop(tx);

    // wait for the fan-out before signalling shutdown; queued requests are
    // dropped on cancellation by design
    let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
    while writer.records().is_empty() && std::time::Instant::now() < deadline {
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    handle.shutdown().await;

    let records = writer.records();
    assert_eq!(records.len(), 1);
    let (kind, object, mode) = &records[0];
    assert_eq!(kind, "apps/v1/Deployment");
    assert_eq!(*mode, WriteMode::Patch);
    assert_eq!(object["spec"]["template"]["metadata"]["annotations"]["cm-version"], "7");
}

#[test]
fn operator_spec_validation_propagates() {
    let broken = r#"
controllers:
  - name: broken
    sources:
      - kind: ConfigMap
      - kind: Secret
    pipeline: {}
    target:
      kind: ConfigMap
"#;
    let spec = OperatorSpec::from_yaml(broken).unwrap();
    let cache: Arc<FakeObjectCache> = Arc::new(FakeObjectCache::new());
    let writer = Arc::new(RecordingWriter::default());
    let err = Runtime::build(&spec, cache, writer, None).unwrap_err();
    assert!(err.to_string().contains("@join"));
}
