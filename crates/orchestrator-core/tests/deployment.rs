use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use async_trait::async_trait;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use common::error::{Error, Result};
use common::models::{Component, DeploymentState, InstanceUpdate, ModelInstance};
use common::types::InstanceKey;
use inference_engine::InferenceServer;
use model_manager::{InstanceStore, MemoryInstanceStore};
use orchestrator_core::DeploymentController;

/// Inference server double recording every call
#[derive(Default)]
struct FakeServer {
    calls: Mutex<Vec<String>>,
    failing: Mutex<HashSet<String>>,
    loaded: Mutex<HashSet<String>>,
    load_error: Mutex<Option<String>>,
    /// When set, `load` waits for a notification before answering
    gate: Option<Arc<Notify>>,
    started: Arc<Notify>,
}

impl FakeServer {
    fn gated(gate: Arc<Notify>) -> Self {
        Self { gate: Some(gate), ..Default::default() }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn fail_on(&self, name: &str) {
        self.failing.lock().unwrap().insert(name.to_string());
    }
}

#[async_trait]
impl InferenceServer for FakeServer {
    async fn load(&self, name: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("load {}", name));
        self.started.notify_one();
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        let load_error = self.load_error.lock().unwrap().clone();
        if let Some(message) = load_error {
            return Err(Error::ExternalService(message));
        }
        self.loaded.lock().unwrap().insert(name.to_string());
        Ok(())
    }

    async fn unload(&self, name: &str) -> Result<()> {
        self.calls.lock().unwrap().push(format!("unload {}", name));
        if self.failing.lock().unwrap().contains(name) {
            return Err(Error::ExternalService(format!("Failed to unload {}: HTTP 500", name)));
        }
        self.loaded.lock().unwrap().remove(name);
        Ok(())
    }

    async fn is_ready(&self, name: &str) -> Result<bool> {
        self.calls.lock().unwrap().push(format!("ready {}", name));
        Ok(self.loaded.lock().unwrap().contains(name))
    }
}

fn component(name: &str) -> Component {
    Component {
        original_name: name.to_string(),
        canonical_name: format!("acme#cat#{}#v1", name),
        version_number: 1,
        platform: None,
        status: DeploymentState::Offline,
    }
}

async fn setup(
    server: FakeServer,
    components: &[&str],
    ensemble: Option<&str>,
) -> (Arc<FakeServer>, Arc<MemoryInstanceStore>, DeploymentController, InstanceKey) {
    let server = Arc::new(server);
    let store = Arc::new(MemoryInstanceStore::new());
    let key = InstanceKey::new("acme", "cat", "v1").unwrap();

    let instance = ModelInstance::new(
        key.clone(),
        InstanceUpdate {
            components: components.iter().map(|c| component(c)).collect(),
            ensemble: ensemble.map(|e| format!("acme#cat#{}#v1", e)),
            readme_path: None,
        },
    );
    store.insert(instance).await.unwrap();

    let controller = DeploymentController::new(store.clone(), server.clone());
    (server, store, controller, key)
}

#[tokio::test]
async fn deploy_loads_ensemble_and_goes_online() {
    let (server, store, controller, key) = setup(FakeServer::default(), &["pre", "infer", "ens"], Some("ens")).await;

    let instance = controller.deploy(&key, &CancellationToken::new()).await.unwrap();

    assert_eq!(instance.state, DeploymentState::Online);
    assert!(instance.components.iter().all(|c| c.status == DeploymentState::Online));
    assert_eq!(server.calls(), vec!["load acme#cat#ens#v1"]);
    assert_eq!(store.get(&key).await.unwrap().state, DeploymentState::Online);
}

#[tokio::test]
async fn deploy_requires_offline_or_error_and_has_no_side_effects() {
    let (server, store, controller, key) = setup(FakeServer::default(), &["only"], None).await;
    store.update_state(&key, DeploymentState::Online, None).await.unwrap();

    let err = controller.deploy(&key, &CancellationToken::new()).await.unwrap_err();

    assert!(err.is_failed_precondition());
    assert!(server.calls().is_empty());
    assert_eq!(store.get(&key).await.unwrap().state, DeploymentState::Online);
}

#[tokio::test]
async fn deploy_without_target_is_rejected() {
    let (server, store, controller, key) = setup(FakeServer::default(), &["pre", "infer"], None).await;

    let err = controller.deploy(&key, &CancellationToken::new()).await.unwrap_err();

    assert!(err.is_failed_precondition());
    assert!(server.calls().is_empty());
    assert_eq!(store.get(&key).await.unwrap().state, DeploymentState::Offline);
}

#[tokio::test]
async fn second_deploy_observing_transitioning_is_rejected() {
    let gate = Arc::new(Notify::new());
    let (server, store, controller, key) = setup(FakeServer::gated(gate.clone()), &["only"], None).await;
    let controller = Arc::new(controller);

    let first = {
        let controller = controller.clone();
        let key = key.clone();
        tokio::spawn(async move { controller.deploy(&key, &CancellationToken::new()).await })
    };

    server.started.notified().await;
    assert_eq!(store.get(&key).await.unwrap().state, DeploymentState::Transitioning);

    let err = controller.deploy(&key, &CancellationToken::new()).await.unwrap_err();
    assert!(err.is_failed_precondition());

    gate.notify_one();
    let instance = first.await.unwrap().unwrap();
    assert_eq!(instance.state, DeploymentState::Online);
    assert_eq!(server.calls(), vec!["load acme#cat#only#v1"]);
}

#[tokio::test]
async fn allocation_failure_is_resource_exhausted() {
    let server = FakeServer::default();
    *server.load_error.lock().unwrap() = Some("HTTP 400: Failed to allocate memory for model".to_string());
    let (_, store, controller, key) = setup(server, &["only"], None).await;

    let err = controller.deploy(&key, &CancellationToken::new()).await.unwrap_err();

    assert!(err.is_resource_exhausted());
    let instance = store.get(&key).await.unwrap();
    assert_eq!(instance.state, DeploymentState::Error);
    assert!(instance.last_error.unwrap().contains("Failed to allocate memory"));
}

#[tokio::test]
async fn cancelled_deploy_returns_to_offline() {
    let gate = Arc::new(Notify::new());
    let (server, store, controller, key) = setup(FakeServer::gated(gate), &["only"], None).await;
    let controller = Arc::new(controller);
    let cancel = CancellationToken::new();

    let task = {
        let controller = controller.clone();
        let key = key.clone();
        let cancel = cancel.clone();
        tokio::spawn(async move { controller.deploy(&key, &cancel).await })
    };

    server.started.notified().await;
    cancel.cancel();

    let err = task.await.unwrap().unwrap_err();
    assert!(err.is_cancelled());
    assert_eq!(store.get(&key).await.unwrap().state, DeploymentState::Offline);
}

#[tokio::test]
async fn dropped_deploy_is_restored() {
    let gate = Arc::new(Notify::new());
    let (server, store, controller, key) = setup(FakeServer::gated(gate), &["only"], None).await;
    let controller = Arc::new(controller);

    let task = {
        let controller = controller.clone();
        let key = key.clone();
        tokio::spawn(async move { controller.deploy(&key, &CancellationToken::new()).await })
    };

    server.started.notified().await;
    task.abort();
    assert!(task.await.unwrap_err().is_cancelled());

    let mut state = DeploymentState::Transitioning;
    for _ in 0..100 {
        state = store.get(&key).await.unwrap().state;
        if state != DeploymentState::Transitioning {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(state, DeploymentState::Offline);
}

#[tokio::test]
async fn undeploy_stops_at_first_failure() {
    let (server, store, controller, key) = setup(FakeServer::default(), &["a", "b", "c"], None).await;
    store.update_state(&key, DeploymentState::Online, None).await.unwrap();
    server.fail_on("acme#cat#b#v1");

    let err = controller.undeploy(&key, &CancellationToken::new()).await.unwrap_err();

    assert!(matches!(err, Error::ExternalService(_)));
    assert_eq!(server.calls(), vec!["unload acme#cat#a#v1", "unload acme#cat#b#v1"]);
    let instance = store.get(&key).await.unwrap();
    assert_eq!(instance.state, DeploymentState::Error);
    assert!(instance.last_error.is_some());
}

#[tokio::test]
async fn undeploy_unloads_ensemble_first() {
    let (server, store, controller, key) = setup(FakeServer::default(), &["pre", "ens"], Some("ens")).await;
    store.update_state(&key, DeploymentState::Online, None).await.unwrap();

    let instance = controller.undeploy(&key, &CancellationToken::new()).await.unwrap();

    assert_eq!(instance.state, DeploymentState::Offline);
    assert_eq!(server.calls(), vec!["unload acme#cat#ens#v1", "unload acme#cat#pre#v1"]);
}

#[tokio::test]
async fn undeploy_from_error_skips_unloaded_components() {
    let (server, store, controller, key) = setup(FakeServer::default(), &["a", "b"], None).await;
    store
        .update_state(&key, DeploymentState::Error, Some("partial".to_string()))
        .await
        .unwrap();
    server.loaded.lock().unwrap().insert("acme#cat#b#v1".to_string());

    let instance = controller.undeploy(&key, &CancellationToken::new()).await.unwrap();

    assert_eq!(instance.state, DeploymentState::Offline);
    assert_eq!(instance.last_error, None);
    assert_eq!(
        server.calls(),
        vec!["ready acme#cat#a#v1", "ready acme#cat#b#v1", "unload acme#cat#b#v1"]
    );
}

#[tokio::test]
async fn undeploy_requires_online_or_error() {
    let (server, _, controller, key) = setup(FakeServer::default(), &["a"], None).await;

    let err = controller.undeploy(&key, &CancellationToken::new()).await.unwrap_err();

    assert!(err.is_failed_precondition());
    assert!(server.calls().is_empty());
}

#[tokio::test]
async fn reconcile_resolves_transitioning() {
    let (server, store, controller, key) = setup(FakeServer::default(), &["only"], None).await;

    store.update_state(&key, DeploymentState::Transitioning, None).await.unwrap();
    assert_eq!(controller.reconcile(&key).await.unwrap().state, DeploymentState::Offline);

    store.update_state(&key, DeploymentState::Transitioning, None).await.unwrap();
    server.loaded.lock().unwrap().insert("acme#cat#only#v1".to_string());
    assert_eq!(controller.reconcile(&key).await.unwrap().state, DeploymentState::Online);

    // Stable states are left alone
    assert_eq!(controller.reconcile(&key).await.unwrap().state, DeploymentState::Online);
}

#[tokio::test]
async fn error_is_left_by_a_new_deploy() {
    let server = FakeServer::default();
    *server.load_error.lock().unwrap() = Some("model config invalid".to_string());
    let (server, store, controller, key) = setup(server, &["only"], None).await;

    assert!(controller.deploy(&key, &CancellationToken::new()).await.is_err());
    assert_eq!(store.get(&key).await.unwrap().state, DeploymentState::Error);

    *server.load_error.lock().unwrap() = None;
    let instance = controller.deploy(&key, &CancellationToken::new()).await.unwrap();
    assert_eq!(instance.state, DeploymentState::Online);
    assert_eq!(instance.last_error, None);
}
