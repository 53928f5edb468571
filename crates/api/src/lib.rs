//! Korral public API façade (in-process).
//!
//! Front-ends (the CLI today) talk to the repository tree and the deploy engine
//! only through [`KorralApi`]. Deploys run as background tasks whose progress
//! is polled through [`KorralApi::tasks`].

#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Instant;

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use korral_core::{ApiRef, Configuration, NodeId, ResourceInstance};
use korral_deploy::{
    DeployEngine, DeployError, DeployOutcome, DeployRegistry, DeployResult, DeployStatus, TaskEvent, TaskState,
};
use korral_kubehub::{ApiKind, ClusterAccess, KubeCluster};
use korral_persist::{ClusterIndex, ClusterInfo, YamlStore};
use korral_repo::{NodeRef, RepoError, Repository};

mod settings;
mod tasks;

pub use korral_repo::ReorderOp;
pub use settings::Settings;
pub use tasks::TaskQueue;

/// API errors suitable for transport to a front-end.
#[derive(Debug, thiserror::Error, Serialize, Deserialize)]
pub enum KorralError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("conflict: {0}")]
    Conflict(String),
    #[error("persistence: {0}")]
    Persistence(String),
    #[error("deploy: {0}")]
    Deploy(String),
    #[error("internal: {0}")]
    Internal(String),
}

pub type KorralResult<T> = Result<T, KorralError>;

impl From<RepoError> for KorralError {
    fn from(e: RepoError) -> Self {
        match e {
            RepoError::Validation(m) => KorralError::Validation(m),
            RepoError::NotFound(m) => KorralError::NotFound(m),
            RepoError::Invariant(m) => KorralError::Internal(m),
            other @ (RepoError::Io { .. } | RepoError::Yaml { .. }) => KorralError::Persistence(other.to_string()),
        }
    }
}

impl From<DeployError> for KorralError {
    fn from(e: DeployError) -> Self {
        match e {
            DeployError::Invariant(m) => KorralError::Internal(m),
            DeployError::NotFound(m) => KorralError::NotFound(m),
            DeployError::Busy(id) => KorralError::Conflict(format!("a deploy task for {} is already running", id)),
            e @ DeployError::Cluster { .. } => KorralError::Deploy(e.to_string()),
            DeployError::Persist(m) => KorralError::Persistence(m),
            DeployError::Repo(r) => r.into(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeKind {
    Collection,
    Resource,
}

/// Flat view of one tree node for display.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSummary {
    pub id: NodeId,
    pub kind: NodeKind,
    pub name: String,
    pub path: PathBuf,
    pub parent: Option<NodeId>,
    /// Resource only.
    pub api_ver: Option<String>,
    /// Resource only.
    pub order: Option<usize>,
    pub children: Vec<NodeId>,
    pub resources: Vec<NodeId>,
    pub description: String,
}

impl NodeSummary {
    fn of(node: NodeRef<'_>) -> Self {
        match node {
            NodeRef::Collection(c) => Self {
                id: c.id.clone(),
                kind: NodeKind::Collection,
                name: c.name.clone(),
                path: c.path.clone(),
                parent: c.parent_id.clone(),
                api_ver: None,
                order: None,
                children: c.children.clone(),
                resources: c.bag.ids(),
                description: c.configuration.description.clone(),
            },
            NodeRef::Resource(r) => Self {
                id: r.id().clone(),
                kind: NodeKind::Resource,
                name: r.name.clone(),
                path: r.path.clone(),
                parent: Some(r.owner.clone()),
                api_ver: Some(r.instance().spec.api_ver.clone()),
                order: Some(r.order()),
                children: Vec::new(),
                resources: Vec::new(),
                description: r.instance().label.clone(),
            },
        }
    }
}

/// One deploy record as shown to a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeploySummary {
    pub id: NodeId,
    pub name: String,
    pub namespace: String,
    pub status: DeployStatus,
    pub creation: DateTime<Utc>,
    pub tracked: usize,
    pub orphaned: bool,
}

static NAME_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap());

/// Names become file and directory names on disk.
pub fn validate_name(kind: &str, name: &str) -> KorralResult<()> {
    if name.is_empty() {
        return Err(KorralError::Validation(format!("{} name is empty", kind)));
    }
    if !NAME_RE.is_match(name) {
        return Err(KorralError::Validation(format!(
            "{} name '{}' must start with a letter or digit and use only letters, digits, '.', '_' or '-'",
            kind, name
        )));
    }
    Ok(())
}

/// Declarative Korral API surface.
#[async_trait::async_trait]
pub trait KorralApi: Send + Sync {
    /// Root collections of the open repository.
    fn roots(&self) -> KorralResult<Vec<NodeSummary>>;
    fn node(&self, id: &NodeId) -> KorralResult<NodeSummary>;
    /// Open a directory as a new repository root.
    fn add_root(&self, dir: &Path) -> KorralResult<NodeId>;
    fn add_collection(&self, parent: &NodeId, name: &str) -> KorralResult<NodeId>;
    /// Add a resource document. Without `cr` a skeleton for a built-in kind is generated.
    fn add_resource(&self, collection: &NodeId, name: &str, api_ver: &str, cr: Option<String>) -> KorralResult<NodeId>;
    fn update_resource(&self, id: &NodeId, cr: String) -> KorralResult<()>;
    fn set_property(&self, collection: &NodeId, key: &str, value: &str) -> KorralResult<()>;
    fn remove(&self, id: &NodeId) -> KorralResult<()>;
    fn reload(&self, id: &NodeId) -> KorralResult<NodeId>;
    fn reorder(&self, collection: &NodeId, op: ReorderOp) -> KorralResult<bool>;

    /// Start a background deploy of `root`; returns the task id.
    fn deploy(&self, root: &NodeId) -> KorralResult<u64>;
    /// Start a background undeploy of `root`; returns the task id.
    fn undeploy(&self, root: &NodeId) -> KorralResult<u64>;
    /// Wait for a task started by `deploy`/`undeploy`.
    async fn wait(&self, task: u64) -> KorralResult<DeployOutcome>;
    fn deploys(&self) -> KorralResult<Vec<DeploySummary>>;
    fn tasks(&self) -> Vec<TaskEvent>;

    async fn kinds(&self, force_refresh: bool) -> KorralResult<Vec<ApiKind>>;
}

// ----------------- In-process implementation -----------------

/// In-process implementation that calls internal crates directly.
pub struct InProcApi {
    settings: Settings,
    repo: Arc<RwLock<Repository>>,
    engine: Arc<DeployEngine>,
    tasks: TaskQueue,
    running: Mutex<FxHashMap<u64, JoinHandle<DeployResult<DeployOutcome>>>>,
}

const KEPT_HANDLES: usize = 32;

fn internal(e: impl std::fmt::Display) -> KorralError { KorralError::Internal(e.to_string()) }

/// Stand-in used when only the repository is edited; every cluster call fails.
struct Offline;

#[async_trait::async_trait]
impl ClusterAccess for Offline {
    fn identity(&self) -> &str { "offline" }

    async fn deploy(&self, action: &korral_core::DeployAction, _target_namespace: Option<&str>) -> anyhow::Result<String> {
        Err(anyhow::anyhow!("no cluster connection; cannot {} {}", action.kind, action.name))
    }

    async fn fetch_all_api_kinds(&self, _force_refresh: bool) -> anyhow::Result<Vec<ApiKind>> {
        Err(anyhow::anyhow!("no cluster connection"))
    }
}

impl InProcApi {
    /// Connect to the cluster from the ambient kubeconfig and open everything.
    pub async fn connect(settings: Settings) -> KorralResult<Self> {
        let cluster = KubeCluster::connect().await.map_err(|e| KorralError::Deploy(format!("{:#}", e)))?;
        let index = ClusterIndex::open(&settings.state_dir).map_err(|e| KorralError::Persistence(format!("{:#}", e)))?;
        let info = ClusterInfo {
            identity: cluster.identity().to_string(),
            name: cluster.server().to_string(),
            server: cluster.server().to_string(),
            namespace: cluster.default_namespace().to_string(),
        };
        index.upsert(&info).map_err(|e| KorralError::Persistence(format!("{:#}", e)))?;
        Self::open(settings, Arc::new(cluster))
    }

    /// Open the repository without a cluster. Deploy calls fail with [`KorralError::Deploy`].
    pub fn offline(settings: Settings) -> KorralResult<Self> { Self::open(settings, Arc::new(Offline)) }

    /// Open the repository and the deploy registry for `cluster`.
    /// Must be called inside a tokio runtime.
    pub fn open(settings: Settings, cluster: Arc<dyn ClusterAccess>) -> KorralResult<Self> {
        let t0 = Instant::now();
        let repo = match &settings.repo {
            Some(dir) => Repository::open([dir])?,
            None => Repository::new(),
        };
        let index = ClusterIndex::open(&settings.state_dir).map_err(|e| KorralError::Persistence(format!("{:#}", e)))?;
        let store = YamlStore::open(index.registry_path(cluster.identity())).map_err(|e| KorralError::Persistence(format!("{:#}", e)))?;
        let mut registry = DeployRegistry::load(Box::new(store))?;
        registry.mark_orphans(|id| repo.index().contains(id));

        let (tx, rx) = mpsc::channel(settings.task_cap);
        let tasks = TaskQueue::new();
        tasks.collect(rx);
        let engine = DeployEngine::new(cluster, Arc::new(Mutex::new(registry)), tx, settings.default_namespace.clone());
        info!(roots = repo.roots().len(), took_ms = %t0.elapsed().as_millis(), "api: opened");
        Ok(Self { settings, repo: Arc::new(RwLock::new(repo)), engine: Arc::new(engine), tasks, running: Mutex::new(FxHashMap::default()) })
    }

    pub fn settings(&self) -> &Settings { &self.settings }

    fn read(&self) -> KorralResult<RwLockReadGuard<'_, Repository>> { self.repo.read().map_err(|_| internal("repository lock poisoned")) }
    fn write(&self) -> KorralResult<RwLockWriteGuard<'_, Repository>> { self.repo.write().map_err(|_| internal("repository lock poisoned")) }

    /// Finished handles nobody waited for are dropped once more than
    /// [`KEPT_HANDLES`] are held; their final event stays in [`tasks`](KorralApi::tasks).
    fn track(&self, task: u64, name: &str, handle: JoinHandle<DeployResult<DeployOutcome>>) -> KorralResult<()> {
        self.tasks.apply(TaskEvent { task, name: name.to_string(), progress: 0.0, status: "queued".into(), state: TaskState::Running });
        let mut running = self.running.lock().map_err(internal)?;
        if running.len() >= KEPT_HANDLES {
            running.retain(|_, h| !h.is_finished());
            debug!(held = running.len(), "api: pruned finished task handles");
        }
        running.insert(task, handle);
        Ok(())
    }

    /// Task handles currently held for [`wait`](KorralApi::wait).
    pub fn tracked_tasks(&self) -> usize { self.running.lock().map(|r| r.len()).unwrap_or(0) }
}

#[async_trait::async_trait]
impl KorralApi for InProcApi {
    fn roots(&self) -> KorralResult<Vec<NodeSummary>> {
        let repo = self.read()?;
        Ok(repo.roots().iter().filter_map(|id| repo.lookup(id)).map(NodeSummary::of).collect())
    }

    fn node(&self, id: &NodeId) -> KorralResult<NodeSummary> {
        let repo = self.read()?;
        repo.lookup(id).map(NodeSummary::of).ok_or_else(|| KorralError::NotFound(format!("node {}", id)))
    }

    fn add_root(&self, dir: &Path) -> KorralResult<NodeId> {
        let id = self.write()?.add_root(dir)?;
        info!(id = %id, dir = %dir.display(), "api: root added");
        Ok(id)
    }

    fn add_collection(&self, parent: &NodeId, name: &str) -> KorralResult<NodeId> {
        validate_name("collection", name)?;
        Ok(self.write()?.add_collection(parent, name)?)
    }

    fn add_resource(&self, collection: &NodeId, name: &str, api_ver: &str, cr: Option<String>) -> KorralResult<NodeId> {
        validate_name("resource", name)?;
        ApiRef::parse(api_ver).map_err(|e| KorralError::Validation(e.to_string()))?;
        let mut repo = self.write()?;
        let cr = match cr {
            Some(cr) => cr,
            None => {
                let ns = repo.namespace_for(collection)?;
                korral_schema::skeleton(api_ver, name, ns.as_deref())
                    .ok_or_else(|| KorralError::Validation(format!("no template for {}; supply a document", api_ver)))?
            }
        };
        let id = repo.add_resource(collection, name, ResourceInstance::new(api_ver, cr))?;
        debug!(id = %id, api = api_ver, "api: resource added");
        Ok(id)
    }

    fn update_resource(&self, id: &NodeId, cr: String) -> KorralResult<()> { Ok(self.write()?.update_resource(id, cr)?) }

    fn set_property(&self, collection: &NodeId, key: &str, value: &str) -> KorralResult<()> {
        if key.trim().is_empty() {
            return Err(KorralError::Validation("property key is empty".into()));
        }
        let mut repo = self.write()?;
        let mut cfg: Configuration = repo.collection(collection)?.configuration.clone();
        cfg.set(key, value);
        Ok(repo.update_configuration(collection, cfg)?)
    }

    fn remove(&self, id: &NodeId) -> KorralResult<()> {
        let mut repo = self.write()?;
        repo.remove(id)?;
        if let Ok(mut reg) = self.engine.registry().lock() {
            reg.mark_orphans(|r| repo.index().contains(r));
        }
        info!(id = %id, "api: node removed");
        Ok(())
    }

    fn reload(&self, id: &NodeId) -> KorralResult<NodeId> {
        let res = self.write()?.reload(id);
        res.map_err(|e| {
            warn!(id = %id, error = %e, "api: reload failed");
            e.into()
        })
    }

    fn reorder(&self, collection: &NodeId, op: ReorderOp) -> KorralResult<bool> { Ok(self.write()?.reorder(collection, &op)?) }

    fn deploy(&self, root: &NodeId) -> KorralResult<u64> {
        let plan = {
            let repo = self.read()?;
            self.engine.prepare(&repo, root)?
        };
        let task = self.engine.next_task_id();
        let name = plan.name.clone();
        info!(task, root = %root, actions = plan.actions.len(), "api: deploy queued");
        let engine = self.engine.clone();
        let handle = tokio::spawn(async move { engine.deploy(plan, task).await });
        self.track(task, &name, handle)?;
        Ok(task)
    }

    fn undeploy(&self, root: &NodeId) -> KorralResult<u64> {
        let plan = self.engine.prepare_undeploy(root)?;
        let task = self.engine.next_task_id();
        let name = plan.name.clone();
        info!(task, root = %root, actions = plan.actions.len(), "api: undeploy queued");
        let engine = self.engine.clone();
        let handle = tokio::spawn(async move { engine.undeploy(plan, task).await });
        self.track(task, &name, handle)?;
        Ok(task)
    }

    async fn wait(&self, task: u64) -> KorralResult<DeployOutcome> {
        let handle = self
            .running
            .lock()
            .map_err(internal)?
            .remove(&task)
            .ok_or_else(|| KorralError::NotFound(format!("task {}", task)))?;
        let outcome = handle.await.map_err(internal)??;
        Ok(outcome)
    }

    fn deploys(&self) -> KorralResult<Vec<DeploySummary>> {
        let repo = self.read()?;
        let mut reg = self.engine.registry().lock().map_err(internal)?;
        reg.mark_orphans(|id| repo.index().contains(id));
        Ok(reg
            .list()
            .into_iter()
            .map(|d| DeploySummary {
                id: d.id.clone(),
                name: d.name.clone(),
                namespace: d.namespace.clone(),
                status: d.status,
                creation: d.creation,
                tracked: d.original_crs.len(),
                orphaned: d.orphaned,
            })
            .collect())
    }

    fn tasks(&self) -> Vec<TaskEvent> { self.tasks.snapshot() }

    async fn kinds(&self, force_refresh: bool) -> KorralResult<Vec<ApiKind>> {
        let t0 = Instant::now();
        let kinds = self.engine.cluster().fetch_all_api_kinds(force_refresh).await.map_err(|e| KorralError::Deploy(format!("{:#}", e)))?;
        info!(count = kinds.len(), took_ms = %t0.elapsed().as_millis(), "api: kinds ok");
        Ok(kinds)
    }
}
