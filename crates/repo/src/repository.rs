use std::fs;
use std::path::Path;
use std::time::Instant;

use korral_core::{ApiRef, Configuration, NodeId, ResourceInstance};
use metrics::counter;
use rustc_hash::FxHashSet;
use tracing::{debug, info, warn};

use crate::bag::ReorderOp;
use crate::index::{NodeIndex, NodeRef, Slot};
use crate::node::{Collection, ResourceNode};
use crate::{RepoError, RepoResult};

/// One or more root collections and the index that owns every node below them.
#[derive(Debug, Clone, Default)]
pub struct Repository {
    index: NodeIndex,
    roots: Vec<NodeId>,
}

fn check_name(kind: &str, name: &str) -> RepoResult<()> {
    if name.trim().is_empty() {
        return Err(RepoError::Validation(format!("{} name is empty", kind)));
    }
    if name == "." || name == ".." || name.starts_with('.') || name.contains(['/', '\\']) {
        return Err(RepoError::Validation(format!("{} name '{}' is not a plain file name", kind, name)));
    }
    Ok(())
}

impl Repository {
    pub fn new() -> Self { Self::default() }

    /// Open every directory as a root, in the given order.
    pub fn open<I, P>(dirs: I) -> RepoResult<Self>
    where
        I: IntoIterator<Item = P>,
        P: AsRef<Path>,
    {
        let mut repo = Self::new();
        for dir in dirs { repo.add_root(dir.as_ref())?; }
        Ok(repo)
    }

    pub fn index(&self) -> &NodeIndex { &self.index }
    pub fn roots(&self) -> &[NodeId] { &self.roots }
    pub fn lookup(&self, id: &NodeId) -> Option<NodeRef<'_>> { self.index.lookup(id) }
    pub fn collection(&self, id: &NodeId) -> RepoResult<&Collection> { self.index.collection(id) }
    pub fn resource(&self, id: &NodeId) -> RepoResult<&ResourceNode> { self.index.resource(id) }
    /// In-memory access without persisting; edits reach disk on the next `save`.
    pub fn resource_mut(&mut self, id: &NodeId) -> RepoResult<&mut ResourceNode> { self.index.resource_mut(id) }

    /// Load `dir` as a new root collection. A missing directory is created.
    pub fn add_root(&mut self, dir: &Path) -> RepoResult<NodeId> {
        if dir.as_os_str().is_empty() {
            return Err(RepoError::Validation("missing path selection".into()));
        }
        if self.roots.iter().any(|r| self.index.collection(r).map(|c| c.path == dir).unwrap_or(false)) {
            return Err(RepoError::Validation(format!("{} is already open", dir.display())));
        }
        fs::create_dir_all(dir).map_err(|e| RepoError::io(dir, e))?;
        let before: FxHashSet<NodeId> = self.index.ids().cloned().collect();
        let name = dir.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default();
        let id = self.index.register_collection(Collection::new(None, None, name, dir));
        match self.index.load(&id, dir) {
            Ok(id) => {
                info!(id = %id, dir = %dir.display(), nodes = self.index.len() - before.len(), "repo: root opened");
                self.roots.push(id.clone());
                Ok(id)
            }
            Err(e) => {
                let fresh: Vec<NodeId> = self.index.ids().filter(|i| !before.contains(*i)).cloned().collect();
                for i in fresh { self.index.unregister(&i); }
                warn!(dir = %dir.display(), error = %e, "repo: root failed to load");
                Err(e)
            }
        }
    }

    /// Forget a root and its subtree without touching disk.
    pub fn close_root(&mut self, id: &NodeId) -> RepoResult<()> {
        if !self.roots.contains(id) {
            return Err(RepoError::NotFound(format!("root {}", id)));
        }
        for sid in self.index.subtree_ids(id)? { self.index.unregister(&sid); }
        self.roots.retain(|r| r != id);
        Ok(())
    }

    /// Create an empty child collection and write its description file.
    pub fn add_collection(&mut self, parent: &NodeId, name: &str) -> RepoResult<NodeId> {
        check_name("collection", name)?;
        let p = self.index.collection(parent)?;
        let taken = p.children.iter().any(|c| self.index.lookup(c).map(|n| n.name() == name).unwrap_or(false));
        if taken {
            return Err(RepoError::Validation(format!("collection '{}' already exists in {}", name, p.name)));
        }
        let path = p.path.join(name);
        let id = self.index.register_collection(Collection::new(None, Some(parent.clone()), name, path));
        self.index.collection_mut(parent)?.children.push(id.clone());
        if let Err(e) = self.index.save(&id, None, false) {
            self.index.collection_mut(parent)?.children.retain(|c| c != &id);
            self.index.unregister(&id);
            return Err(e);
        }
        counter!("repo_mutations_total", 1u64);
        debug!(id = %id, parent = %parent, name, "repo: collection added");
        Ok(id)
    }

    /// Append a resource at the end of a collection's bag and write its file.
    pub fn add_resource(&mut self, collection: &NodeId, name: &str, mut instance: ResourceInstance) -> RepoResult<NodeId> {
        check_name("resource", name)?;
        ApiRef::parse(&instance.spec.api_ver).map_err(|e| RepoError::Validation(e.to_string()))?;
        if instance.id.is_empty() { instance.id = NodeId::generate(); }
        if self.index.contains(&instance.id) {
            return Err(RepoError::Validation(format!("id {} is already in use", instance.id)));
        }
        let c = self.index.collection(collection)?;
        if c.bag.find_by_name(name).is_some() {
            return Err(RepoError::Validation(format!("resource '{}' already exists in {}", name, c.name)));
        }
        korral_schema::resolve(&mut instance.spec);
        let id = instance.id.clone();
        let node = ResourceNode::new(name, collection.clone(), &c.path, instance);
        self.index.collection_mut(collection)?.bag.add(node);
        self.index.register(id.clone(), Slot::Resource { owner: collection.clone() });
        if let Err(e) = self.index.save(&id, None, false) {
            self.index.collection_mut(collection)?.bag.remove_reorder(&id);
            self.index.unregister(&id);
            return Err(e);
        }
        counter!("repo_mutations_total", 1u64);
        debug!(id = %id, collection = %collection, name, "repo: resource added");
        Ok(id)
    }

    /// Replace a resource's document text and persist it.
    pub fn update_resource(&mut self, id: &NodeId, cr: impl Into<String>) -> RepoResult<()> {
        self.index.resource_mut(id)?.instance_mut().set_cr(cr);
        self.index.save(id, None, false)
    }

    /// Replace a collection's configuration and rewrite only its description file.
    pub fn update_configuration(&mut self, id: &NodeId, configuration: Configuration) -> RepoResult<()> {
        let c = self.index.collection_mut(id)?;
        c.configuration = configuration;
        c.dirty = true;
        self.index.save(id, None, false)
    }

    /// Delete a node from disk and the tree. Removing a root closes it too.
    pub fn remove(&mut self, id: &NodeId) -> RepoResult<()> {
        self.index.remove(id)?;
        self.roots.retain(|r| r != id);
        counter!("repo_mutations_total", 1u64);
        Ok(())
    }

    /// Re-read a node from disk. On failure the node is dropped from the tree
    /// and the error is returned.
    pub fn reload(&mut self, id: &NodeId) -> RepoResult<NodeId> {
        let t0 = Instant::now();
        let node = self.index.lookup(id).ok_or_else(|| RepoError::NotFound(format!("node {}", id)))?;
        let (is_collection, parent) = match node {
            NodeRef::Collection(c) => (true, c.parent_id.clone()),
            NodeRef::Resource(r) => (false, Some(r.owner.clone())),
        };
        let siblings = match (&parent, is_collection) {
            (Some(p), true) => Some(self.index.collection(p)?.children.clone()),
            _ => None,
        };
        match self.index.reload(id) {
            Ok(new_id) => {
                if &new_id != id {
                    for r in self.roots.iter_mut() {
                        if r == id { *r = new_id.clone(); }
                    }
                }
                debug!(id = %new_id, took_ms = %t0.elapsed().as_millis(), "repo: reloaded");
                Ok(new_id)
            }
            Err(e) => {
                warn!(id = %id, error = %e, "repo: reload failed; discarding node");
                if is_collection {
                    self.roots.retain(|r| r != id);
                    if let (Some(p), Some(mut kept)) = (parent, siblings) {
                        kept.retain(|c| c != id);
                        self.index.collection_mut(&p)?.children = kept;
                    }
                } else if let Some(owner) = parent {
                    self.index.collection_mut(&owner)?.bag.remove_reorder(id);
                    self.index.unregister(id);
                }
                self.prune_unreachable();
                Err(e)
            }
        }
    }

    /// Apply a bulk reorder to a collection's bag. Returns whether the stored
    /// order changed, in which case the collection has been persisted.
    ///
    /// The first change after a load records the pre-edit order in the description
    /// file so that `RestoreOriginal` still works after the repository is reopened.
    pub fn reorder(&mut self, collection: &NodeId, op: &ReorderOp) -> RepoResult<bool> {
        let c = self.index.collection_mut(collection)?;
        let plan = c.bag.plan(op)?;
        c.bag.arrange(&plan)?;
        let changed = c.bag.has_order_changed();
        let was_pinned = c.bag.is_pinned();
        if changed { c.bag.commit_positions()?; }
        let restoring = matches!(op, ReorderOp::RestoreOriginal);
        if restoring {
            c.bag.mark_original();
        } else if changed {
            c.bag.set_pinned(true);
        }
        if !changed && !(restoring && was_pinned) {
            return Ok(false);
        }
        self.index.persist_collection(collection)?;
        counter!("repo_mutations_total", 1u64);
        debug!(collection = %collection, op = ?op, changed, "repo: bag reordered");
        Ok(changed)
    }

    pub fn save(&mut self, id: &NodeId, target: Option<&Path>, recursive: bool) -> RepoResult<()> {
        self.index.save(id, target, recursive)
    }

    /// Collection ids from the node's own collection up to its root.
    pub fn ancestors(&self, id: &NodeId) -> RepoResult<Vec<NodeId>> {
        let mut out = Vec::new();
        let mut cur = Some(self.index.owner_of(id)?);
        while let Some(c) = cur {
            let coll = self.index.collection(&c)?;
            cur = coll.parent_id.clone();
            if out.contains(&c) {
                return Err(RepoError::Invariant(format!("parent cycle at {}", c)));
            }
            out.push(c);
        }
        Ok(out)
    }

    pub fn root_of(&self, id: &NodeId) -> RepoResult<NodeId> {
        self.ancestors(id)?
            .pop()
            .ok_or_else(|| RepoError::Invariant(format!("{} has no root", id)))
    }

    /// Namespace property of the nearest collection at or above `id` that sets one.
    pub fn namespace_for(&self, id: &NodeId) -> RepoResult<Option<String>> {
        for c in self.ancestors(id)? {
            if let Some(ns) = self.index.collection(&c)?.configuration.default_namespace() {
                return Ok(Some(ns.to_string()));
            }
        }
        Ok(None)
    }

    /// Copy the subtree under `id` into a detached repository with its own index.
    ///
    /// Resource documents are shared with the live tree until either side edits
    /// one; edits copy the document first, so nothing leaks across.
    pub fn clone_for_input(&self, id: &NodeId) -> RepoResult<Repository> {
        self.index.collection(id)?;
        let mut index = NodeIndex::new();
        self.index.clone_subtree_into(id, &mut index)?;
        index.collection_mut(id)?.parent_id = None;
        Ok(Repository { index, roots: vec![id.clone()] })
    }

    /// Every id reachable from a root.
    pub fn reachable_ids(&self) -> Vec<NodeId> {
        self.roots.iter().filter_map(|r| self.index.subtree_ids(r).ok()).flatten().collect()
    }

    fn prune_unreachable(&mut self) {
        let reachable: FxHashSet<NodeId> = self.reachable_ids().into_iter().collect();
        let stale: Vec<NodeId> = self.index.ids().filter(|i| !reachable.contains(*i)).cloned().collect();
        for i in stale.iter() { self.index.unregister(i); }
        if !stale.is_empty() { debug!(dropped = stale.len(), "repo: pruned unreachable nodes"); }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn names_are_checked() {
        assert!(check_name("resource", "web").is_ok());
        assert!(check_name("resource", "").is_err());
        assert!(check_name("resource", "..").is_err());
        assert!(check_name("resource", ".hidden").is_err());
        assert!(check_name("collection", "a/b").is_err());
    }

    #[test]
    fn add_root_requires_a_path() {
        let mut repo = Repository::new();
        let err = repo.add_root(Path::new("")).unwrap_err();
        assert!(matches!(err, RepoError::Validation(ref m) if m.contains("missing path selection")));
    }
}
