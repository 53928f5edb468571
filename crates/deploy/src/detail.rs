use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use korral_core::{ActionKind, ContentHash, DeployAction, NodeId};
use korral_persist::Record;
use korral_repo::{NodeRef, Repository};
use rustc_hash::FxHashSet;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{DeployError, DeployResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeployStatus {
    New,
    InDeploy,
    Deployed,
}

/// Last-applied snapshot of one resource. Carries the document so the
/// resource can still be deleted after it disappears from the tree.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OriginalCr {
    pub hash: ContentHash,
    /// Namespace the cluster reported; empty for cluster-scoped kinds.
    #[serde(default)]
    pub namespace: String,
    #[serde(rename = "apiVer")]
    pub api_ver: String,
    pub name: String,
    pub cr: String,
    #[serde(default)]
    pub seq: usize,
}

/// Deployment record of one repository root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeployDetail {
    /// Id of the deployed root node.
    pub id: NodeId,
    pub name: String,
    #[serde(default)]
    pub namespace: String,
    pub status: DeployStatus,
    pub creation: DateTime<Utc>,
    #[serde(default, rename = "originalCrs")]
    pub original_crs: BTreeMap<NodeId, OriginalCr>,
    /// Actions from the latest diff; not persisted.
    #[serde(skip)]
    pub all_instances: BTreeMap<NodeId, DeployAction>,
    /// Root no longer present in the open repository.
    #[serde(skip)]
    pub orphaned: bool,
}

impl Record for DeployDetail {
    fn record_id(&self) -> &str { self.id.as_str() }
}

impl DeployDetail {
    pub fn new(id: NodeId, name: impl Into<String>, namespace: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            namespace: namespace.into(),
            status: DeployStatus::New,
            creation: Utc::now(),
            original_crs: BTreeMap::new(),
            all_instances: BTreeMap::new(),
            orphaned: false,
        }
    }

    /// Flatten the root's current subtree and classify against the last-applied snapshot.
    /// The result replaces `all_instances`.
    pub fn parse_resources(&mut self, repo: &Repository) -> DeployResult<()> {
        let fallback = Some(self.namespace.as_str()).filter(|s| !s.is_empty());
        let current = flatten(repo, &self.id, fallback)?;
        self.all_instances = diff(&self.original_crs, current);
        debug!(root = %self.id, actions = self.all_instances.len(), tracked = self.original_crs.len(), "deploy: diff computed");
        Ok(())
    }

    /// Fold one successfully applied action into the snapshot.
    pub fn record_applied(&mut self, action: &DeployAction, namespace: &str) {
        match action.kind {
            ActionKind::Create | ActionKind::Update => {
                self.original_crs.insert(
                    action.id.clone(),
                    OriginalCr {
                        hash: action.hash.clone(),
                        namespace: namespace.to_string(),
                        api_ver: action.api_ver.clone(),
                        name: action.name.clone(),
                        cr: action.cr.clone(),
                        seq: action.seq,
                    },
                );
            }
            ActionKind::Delete => {
                self.original_crs.remove(&action.id);
            }
        }
    }

    /// One `Delete` per tracked resource.
    pub fn delete_actions(&self) -> BTreeMap<NodeId, DeployAction> {
        self.original_crs.iter().map(|(id, o)| (id.clone(), delete_action(id, o))).collect()
    }
}

fn delete_action(id: &NodeId, o: &OriginalCr) -> DeployAction {
    DeployAction {
        id: id.clone(),
        api_ver: o.api_ver.clone(),
        name: o.name.clone(),
        cr: o.cr.clone(),
        hash: o.hash.clone(),
        namespace: Some(o.namespace.clone()).filter(|s| !s.is_empty()),
        kind: ActionKind::Delete,
        seq: o.seq,
        stale: None,
    }
}

/// Every resource under `root` as a `Create` action, in depth-first tree order.
///
/// A resource's requested namespace is the nearest collection `namespace`
/// property, then the document's own `metadata.namespace`, then `fallback`.
pub fn flatten(repo: &Repository, root: &NodeId, fallback: Option<&str>) -> DeployResult<Vec<DeployAction>> {
    let ids = match repo.lookup(root) {
        Some(NodeRef::Collection(_)) => repo.index().subtree_ids(root)?,
        Some(NodeRef::Resource(_)) => vec![root.clone()],
        None if repo.index().contains(root) => {
            return Err(DeployError::Invariant(format!("{} is neither a resource nor a collection", root)));
        }
        None => return Err(DeployError::NotFound(format!("node {}", root))),
    };
    let mut out = Vec::new();
    for id in ids {
        let Some(node) = repo.lookup(&id).and_then(|n| n.as_resource()) else { continue };
        let inst = node.instance();
        let namespace = match repo.namespace_for(&id)? {
            Some(ns) => Some(ns),
            None => inst.metadata_namespace().or_else(|| fallback.map(str::to_string)),
        };
        out.push(DeployAction {
            id: id.clone(),
            api_ver: inst.spec.api_ver.clone(),
            name: node.name.clone(),
            cr: inst.cr.clone(),
            hash: inst.content_hash(),
            namespace,
            kind: ActionKind::Create,
            seq: out.len(),
            stale: None,
        });
    }
    Ok(out)
}

/// Classify `current` against the last-applied snapshot: unchanged resources are
/// dropped, changed ones become `Update`, new ones `Create`, and tracked resources
/// missing from `current` become `Delete`. A resource whose requested namespace
/// differs from the one it was applied in becomes a `Create` carrying the old
/// copy as `stale`.
pub fn diff(original: &BTreeMap<NodeId, OriginalCr>, current: Vec<DeployAction>) -> BTreeMap<NodeId, DeployAction> {
    let mut out = BTreeMap::new();
    let mut seen = FxHashSet::default();
    for mut action in current {
        seen.insert(action.id.clone());
        match original.get(&action.id) {
            Some(o) if moved(o, &action) => {
                action.kind = ActionKind::Create;
                action.stale = Some(Box::new(delete_action(&action.id, o)));
            }
            Some(o) if o.hash == action.hash => continue,
            Some(_) => action.kind = ActionKind::Update,
            None => action.kind = ActionKind::Create,
        }
        out.insert(action.id.clone(), action);
    }
    for (id, o) in original.iter() {
        if !seen.contains(id) {
            out.insert(id.clone(), delete_action(id, o));
        }
    }
    out
}

/// Cluster-scoped records carry no namespace and never move.
fn moved(o: &OriginalCr, action: &DeployAction) -> bool {
    match action.namespace.as_deref() {
        Some(ns) => !o.namespace.is_empty() && ns != o.namespace,
        None => false,
    }
}
