use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Instant;

use korral_core::{DeployAction, NodeId};
use korral_kubehub::ClusterAccess;
use korral_repo::Repository;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::detail::{DeployDetail, DeployStatus};
use crate::order::{process_deploy_order, undeploy_order};
use crate::registry::DeployRegistry;
use crate::{DeployError, DeployResult};

/// Registry shared between the editing session and background deploy tasks.
/// The lock is never held across an await point.
pub type SharedRegistry = Arc<Mutex<DeployRegistry>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    Running,
    Succeeded,
    Failed,
}

/// Progress report from a deploy or undeploy task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskEvent {
    pub task: u64,
    pub name: String,
    /// 0.0..=1.0
    pub progress: f32,
    pub status: String,
    pub state: TaskState,
}

/// Ordered work for one root, computed while the repository is borrowed.
#[derive(Debug, Clone)]
pub struct DeployPlan {
    pub root: NodeId,
    pub name: String,
    pub actions: Vec<DeployAction>,
    /// No record of this root has been stored yet.
    pub first_deploy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployOutcome {
    pub applied: usize,
    pub failed: usize,
}

pub struct DeployEngine {
    cluster: Arc<dyn ClusterAccess>,
    registry: SharedRegistry,
    events: mpsc::Sender<TaskEvent>,
    default_namespace: String,
    next_task: AtomicU64,
}

impl DeployEngine {
    pub fn new(
        cluster: Arc<dyn ClusterAccess>,
        registry: SharedRegistry,
        events: mpsc::Sender<TaskEvent>,
        default_namespace: impl Into<String>,
    ) -> Self {
        Self { cluster, registry, events, default_namespace: default_namespace.into(), next_task: AtomicU64::new(1) }
    }

    pub fn registry(&self) -> &SharedRegistry { &self.registry }
    pub fn cluster(&self) -> &Arc<dyn ClusterAccess> { &self.cluster }
    pub fn next_task_id(&self) -> u64 { self.next_task.fetch_add(1, Ordering::Relaxed) }

    fn lock(&self) -> DeployResult<MutexGuard<'_, DeployRegistry>> {
        self.registry.lock().map_err(|_| DeployError::Invariant("deploy registry lock poisoned".into()))
    }

    /// Diff `root` against its record (creating one on first deploy) and order the actions.
    /// The record moves to `InDeploy` until [`deploy`](Self::deploy) finishes.
    pub fn prepare(&self, repo: &Repository, root: &NodeId) -> DeployResult<DeployPlan> {
        let node = repo.lookup(root).ok_or_else(|| DeployError::NotFound(format!("node {}", root)))?;
        let name = node.name().to_string();
        let mut reg = self.lock()?;
        let mut detail = match reg.get(root) {
            Some(d) if d.status == DeployStatus::InDeploy => return Err(DeployError::Busy(root.clone())),
            Some(d) => d.clone(),
            None => {
                let ns = repo.namespace_for(root)?.unwrap_or_else(|| self.default_namespace.clone());
                DeployDetail::new(root.clone(), name.clone(), ns)
            }
        };
        detail.name = name.clone();
        detail.orphaned = false;
        detail.parse_resources(repo)?;
        let actions: Vec<DeployAction> = process_deploy_order(&detail.all_instances)
            .into_iter()
            .filter_map(|id| detail.all_instances.get(&id).cloned())
            .collect();
        detail.status = DeployStatus::InDeploy;
        let first_deploy = !reg.is_stored(root);
        reg.insert(detail);
        debug!(root = %root, actions = actions.len(), first_deploy, "deploy: plan ready");
        Ok(DeployPlan { root: root.clone(), name, actions, first_deploy })
    }

    /// Apply a plan action by action, stopping at the first failure.
    ///
    /// A failed first deploy discards the record. A failed redeploy keeps the
    /// actions that did apply and stores the record as deployed. Every error
    /// ends the task with a `Failed` event.
    pub async fn deploy(&self, plan: DeployPlan, task: u64) -> DeployResult<DeployOutcome> {
        let t0 = Instant::now();
        let total = plan.actions.len();
        info!(task, root = %plan.root, actions = total, "deploy: started");
        self.emit(task, &plan.name, 0.0, format!("deploying {} actions", total), TaskState::Running).await;
        for (i, action) in plan.actions.iter().enumerate() {
            counter!("deploy_actions_attempted", 1u64);
            let reached = i as f32 / total as f32;
            match self.apply(action).await {
                Ok(ns) => {
                    counter!("deploy_actions_ok", 1u64);
                    let recorded = self.lock().map(|mut reg| {
                        if let Some(d) = reg.get_mut(&plan.root) { d.record_applied(action, &ns); }
                    });
                    if let Err(e) = recorded {
                        return Err(self.fail(task, &plan.name, reached, format!("failed at {}", action.name), e).await);
                    }
                    let progress = (i + 1) as f32 / total as f32;
                    self.emit(task, &plan.name, progress, format!("{} {}", action.kind, action.name), TaskState::Running).await;
                }
                Err(e) => {
                    counter!("deploy_actions_failed", 1u64);
                    let message = format!("{:#}", e);
                    error!(task, root = %plan.root, resource = %action.id, error = %message, "deploy: action failed");
                    let mut status = format!("failed at {}: {}", action.name, message);
                    if let Err(e) = self.settle_failed(&plan) {
                        error!(task, root = %plan.root, error = %e, "deploy: record not saved after failure");
                        status = format!("{}; {}", status, e);
                    }
                    self.emit(task, &plan.name, reached, status, TaskState::Failed).await;
                    return Err(DeployError::Cluster { id: action.id.clone(), message });
                }
            }
        }
        if let Err(e) = self.settle_deployed(&plan.root) {
            return Err(self.fail(task, &plan.name, 1.0, format!("applied {} actions", total), e).await);
        }
        histogram!("deploy_task_ms", t0.elapsed().as_secs_f64() * 1000.0);
        info!(task, root = %plan.root, applied = total, took_ms = %t0.elapsed().as_millis(), "deploy: finished");
        self.emit(task, &plan.name, 1.0, format!("deployed {} actions", total), TaskState::Succeeded).await;
        Ok(DeployOutcome { applied: total, failed: 0 })
    }

    /// Send one action; a resource that changed namespace is first deleted where it was.
    async fn apply(&self, action: &DeployAction) -> anyhow::Result<String> {
        if let Some(stale) = action.stale.as_deref() {
            self.cluster.deploy(stale, stale.namespace.as_deref()).await?;
            debug!(resource = %action.id, from = ?stale.namespace, to = ?action.namespace, "deploy: removed copy from previous namespace");
        }
        self.cluster.deploy(action, action.namespace.as_deref()).await
    }

    fn settle_failed(&self, plan: &DeployPlan) -> DeployResult<()> {
        let mut reg = self.lock()?;
        if plan.first_deploy {
            reg.discard(&plan.root)?;
            return Ok(());
        }
        if let Some(d) = reg.get_mut(&plan.root) { d.status = DeployStatus::Deployed; }
        reg.persist(&plan.root)
    }

    /// An unsaved record stays in memory as deployed; the next deploy stores it again.
    fn settle_deployed(&self, root: &NodeId) -> DeployResult<()> {
        let mut reg = self.lock()?;
        if let Some(d) = reg.get_mut(root) {
            d.status = DeployStatus::Deployed;
            d.all_instances.clear();
        }
        reg.persist(root)
    }

    /// Delete actions for every tracked resource, namespaces last.
    pub fn prepare_undeploy(&self, root: &NodeId) -> DeployResult<DeployPlan> {
        let mut reg = self.lock()?;
        let d = reg.get_mut(root).ok_or_else(|| DeployError::NotFound(format!("deploy record {}", root)))?;
        if d.status == DeployStatus::InDeploy {
            return Err(DeployError::Busy(root.clone()));
        }
        let deletes = d.delete_actions();
        let actions = undeploy_order(&deletes).into_iter().filter_map(|id| deletes.get(&id).cloned()).collect();
        d.status = DeployStatus::InDeploy;
        Ok(DeployPlan { root: root.clone(), name: d.name.clone(), actions, first_deploy: false })
    }

    /// Send every delete, carrying on past failures. The record is removed either way;
    /// the first failure is returned.
    pub async fn undeploy(&self, plan: DeployPlan, task: u64) -> DeployResult<DeployOutcome> {
        let total = plan.actions.len();
        info!(task, root = %plan.root, actions = total, "undeploy: started");
        self.emit(task, &plan.name, 0.0, format!("deleting {} resources", total), TaskState::Running).await;
        let mut first_err: Option<DeployError> = None;
        let mut failed = 0;
        for (i, action) in plan.actions.iter().enumerate() {
            counter!("deploy_actions_attempted", 1u64);
            if let Err(e) = self.cluster.deploy(action, action.namespace.as_deref()).await {
                counter!("deploy_actions_failed", 1u64);
                failed += 1;
                let message = format!("{:#}", e);
                warn!(task, resource = %action.id, error = %message, "undeploy: delete failed; continuing");
                first_err.get_or_insert(DeployError::Cluster { id: action.id.clone(), message });
            } else {
                counter!("deploy_actions_ok", 1u64);
            }
            let progress = (i + 1) as f32 / total as f32;
            self.emit(task, &plan.name, progress, format!("delete {}", action.name), TaskState::Running).await;
        }
        if let Err(e) = self.lock().and_then(|mut reg| reg.discard(&plan.root)) {
            return Err(self.fail(task, &plan.name, 1.0, format!("deleted {} of {}", total - failed, total), e).await);
        }
        match first_err {
            Some(e) => {
                self.emit(task, &plan.name, 1.0, format!("{} of {} deletes failed: {}", failed, total, e), TaskState::Failed).await;
                Err(e)
            }
            None => {
                info!(task, root = %plan.root, "undeploy: finished");
                self.emit(task, &plan.name, 1.0, format!("removed {} resources", total), TaskState::Succeeded).await;
                Ok(DeployOutcome { applied: total, failed })
            }
        }
    }

    async fn fail(&self, task: u64, name: &str, progress: f32, context: String, e: DeployError) -> DeployError {
        error!(task, error = %e, "deploy: task failed");
        self.emit(task, name, progress, format!("{}: {}", context, e), TaskState::Failed).await;
        e
    }

    async fn emit(&self, task: u64, name: &str, progress: f32, status: String, state: TaskState) {
        let ev = TaskEvent { task, name: name.to_string(), progress: progress.clamp(0.0, 1.0), status, state };
        if self.events.send(ev).await.is_err() {
            debug!(task, "deploy: progress receiver gone");
        }
    }
}
