#![forbid(unsafe_code)]

use std::sync::{Arc, Mutex};

use anyhow::Result;
use async_trait::async_trait;
use korral_api::{InProcApi, KorralApi, KorralError, NodeKind, ReorderOp, Settings};
use korral_core::{ActionKind, DeployAction, NodeId};
use korral_deploy::{DeployStatus, TaskState};
use korral_kubehub::{ApiKind, ClusterAccess};
use tempfile::TempDir;

#[derive(Default)]
struct FakeCluster {
    calls: Mutex<Vec<(String, ActionKind)>>,
}

impl FakeCluster {
    fn calls(&self) -> Vec<(String, ActionKind)> { self.calls.lock().unwrap().clone() }
}

#[async_trait]
impl ClusterAccess for FakeCluster {
    fn identity(&self) -> &str { "fake" }

    async fn deploy(&self, action: &DeployAction, target_namespace: Option<&str>) -> Result<String> {
        self.calls.lock().unwrap().push((action.name.clone(), action.kind));
        Ok(target_namespace.unwrap_or("default").to_string())
    }

    async fn fetch_all_api_kinds(&self, _force_refresh: bool) -> Result<Vec<ApiKind>> {
        Ok(vec![ApiKind { group: String::new(), version: "v1".into(), kind: "ConfigMap".into(), plural: "configmaps".into(), namespaced: true }])
    }
}

struct Fixture {
    repo_dir: TempDir,
    state_dir: TempDir,
    cluster: Arc<FakeCluster>,
    api: InProcApi,
}

impl Fixture {
    fn settings(&self) -> Settings { Settings::default().with_repo(self.repo_dir.path()).with_state_dir(self.state_dir.path()) }

    fn reopen(&self) -> InProcApi { InProcApi::open(self.settings(), self.cluster.clone()).unwrap() }

    fn root(&self) -> NodeId { self.api.roots().unwrap()[0].id.clone() }

    async fn settle(&self, task: u64) -> TaskState {
        for _ in 0..100 {
            if let Some(ev) = self.api.tasks().into_iter().find(|e| e.task == task) {
                if ev.state != TaskState::Running { return ev.state; }
            }
            tokio::task::yield_now().await;
        }
        TaskState::Running
    }
}

fn fixture() -> Fixture {
    let repo_dir = TempDir::new().unwrap();
    let state_dir = TempDir::new().unwrap();
    let cluster = Arc::new(FakeCluster::default());
    let settings = Settings::default().with_repo(repo_dir.path()).with_state_dir(state_dir.path());
    let api = InProcApi::open(settings, cluster.clone()).unwrap();
    Fixture { repo_dir, state_dir, cluster, api }
}

#[tokio::test]
async fn rejects_bad_names_and_unknown_templates() {
    let f = fixture();
    let root = f.root();
    assert!(matches!(f.api.add_collection(&root, ".hidden"), Err(KorralError::Validation(_))));
    assert!(matches!(f.api.add_resource(&root, "x y", "v1/configmaps", None), Err(KorralError::Validation(_))));
    assert!(matches!(f.api.add_resource(&root, "w", "nope", None), Err(KorralError::Validation(_))));
    let err = f.api.add_resource(&root, "w", "example.io/v1/widgets", None).unwrap_err();
    assert!(matches!(err, KorralError::Validation(ref m) if m.contains("example.io/v1/widgets")));
    assert!(matches!(f.api.node(&NodeId::from("missing")), Err(KorralError::NotFound(_))));
}

#[tokio::test]
async fn skeleton_documents_pick_up_the_collection_namespace() {
    let f = fixture();
    let apps = f.api.add_collection(&f.root(), "apps").unwrap();
    f.api.set_property(&apps, "namespace", "team").unwrap();
    let web = f.api.add_resource(&apps, "web", "v1/configmaps", None).unwrap();

    let node = f.api.node(&web).unwrap();
    assert_eq!(node.kind, NodeKind::Resource);
    assert_eq!(node.api_ver.as_deref(), Some("v1/configmaps"));
    let text = std::fs::read_to_string(&node.path).unwrap();
    assert!(text.contains("kind: ConfigMap"));
    assert!(text.contains("namespace: team"));
    assert_eq!(f.api.node(&apps).unwrap().resources, vec![web]);
}

#[tokio::test]
async fn reorder_is_visible_through_summaries() {
    let f = fixture();
    let root = f.root();
    let a = f.api.add_resource(&root, "a", "v1/configmaps", None).unwrap();
    let b = f.api.add_resource(&root, "b", "v1/configmaps", None).unwrap();
    assert!(f.api.reorder(&root, ReorderOp::Up(b.clone())).unwrap());
    assert_eq!(f.api.node(&root).unwrap().resources, vec![b.clone(), a.clone()]);
    assert_eq!(f.api.node(&a).unwrap().order, Some(1));
}

#[tokio::test]
async fn deploy_runs_in_background_and_is_recorded() {
    let f = fixture();
    let root = f.root();
    f.api.add_resource(&root, "ns", "v1/namespaces", None).unwrap();
    f.api.add_resource(&root, "cfg", "v1/configmaps", None).unwrap();

    let task = f.api.deploy(&root).unwrap();
    let outcome = f.api.wait(task).await.unwrap();
    assert_eq!(outcome.applied, 2);
    assert_eq!(f.settle(task).await, TaskState::Succeeded);
    assert_eq!(f.cluster.calls(), vec![("ns".to_string(), ActionKind::Create), ("cfg".to_string(), ActionKind::Create)]);
    assert!(matches!(f.api.wait(task).await, Err(KorralError::NotFound(_))));

    let deploys = f.reopen().deploys().unwrap();
    assert_eq!(deploys.len(), 1);
    assert_eq!(deploys[0].id, root);
    assert_eq!(deploys[0].status, DeployStatus::Deployed);
    assert_eq!(deploys[0].tracked, 2);
    assert!(!deploys[0].orphaned);
}

#[tokio::test]
async fn unawaited_tasks_do_not_pile_up() {
    let f = fixture();
    let root = f.root();
    f.api.add_resource(&root, "cfg", "v1/configmaps", None).unwrap();
    let mut last = 0;
    for _ in 0..40 {
        last = f.api.deploy(&root).unwrap();
        assert_eq!(f.settle(last).await, TaskState::Succeeded);
    }
    assert!(f.api.tracked_tasks() <= 32);
    assert_eq!(f.api.wait(last).await.unwrap().applied, 0);
    assert_eq!(f.cluster.calls().len(), 1);
}

#[tokio::test]
async fn removed_roots_stay_undeployable() {
    let f = fixture();
    let apps = f.api.add_collection(&f.root(), "apps").unwrap();
    f.api.add_resource(&apps, "a", "v1/configmaps", None).unwrap();
    f.api.add_resource(&apps, "b", "v1/configmaps", None).unwrap();
    let task = f.api.deploy(&apps).unwrap();
    f.api.wait(task).await.unwrap();

    f.api.remove(&apps).unwrap();
    let deploys = f.api.deploys().unwrap();
    assert!(deploys[0].orphaned);

    let task = f.api.undeploy(&apps).unwrap();
    let outcome = f.api.wait(task).await.unwrap();
    assert_eq!(outcome.applied, 2);
    let deletes: Vec<_> = f.cluster.calls().into_iter().filter(|c| c.1 == ActionKind::Delete).map(|c| c.0).collect();
    assert_eq!(deletes, vec!["b", "a"]);
    assert!(f.api.deploys().unwrap().is_empty());
    assert!(f.reopen().deploys().unwrap().is_empty());
}

#[tokio::test]
async fn undeploy_without_a_record_is_not_found() {
    let f = fixture();
    assert!(matches!(f.api.undeploy(&f.root()), Err(KorralError::NotFound(_))));
}

#[tokio::test]
async fn kinds_come_from_the_cluster() {
    let f = fixture();
    let kinds = f.api.kinds(false).await.unwrap();
    assert_eq!(kinds[0].api_ver(), "v1/configmaps");
}

#[tokio::test]
async fn offline_mode_edits_but_cannot_reach_a_cluster() {
    let repo_dir = TempDir::new().unwrap();
    let state_dir = TempDir::new().unwrap();
    let api = InProcApi::offline(Settings::default().with_repo(repo_dir.path()).with_state_dir(state_dir.path())).unwrap();
    let root = api.roots().unwrap()[0].id.clone();
    api.add_resource(&root, "cfg", "v1/configmaps", None).unwrap();
    assert!(matches!(api.kinds(false).await, Err(KorralError::Deploy(_))));

    let task = api.deploy(&root).unwrap();
    assert!(matches!(api.wait(task).await, Err(KorralError::Deploy(_))));
    assert!(api.deploys().unwrap().is_empty());
}
