use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Instant;

use korral_core::{Configuration, NodeId, Property, ResourceInstance};
use metrics::{counter, histogram};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::index::{NodeIndex, Slot};
use crate::node::{file_name, Collection, ResourceNode};
use crate::{RepoError, RepoResult, DESCRIPTION_FILE, RESERVED_DIRS, RESOURCE_SUFFIX};

/// On-disk description file of a collection.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Description {
    id: NodeId,
    #[serde(default)]
    name: String,
    #[serde(default)]
    attributes: BTreeMap<String, String>,
    #[serde(default)]
    description: String,
    #[serde(default)]
    properties: Vec<Property>,
    /// Order to restore to, kept while the bag has been reordered.
    #[serde(default, rename = "originalOrder", skip_serializing_if = "Vec::is_empty")]
    original_order: Vec<NodeId>,
}

impl Description {
    fn of(c: &Collection) -> Self {
        Self {
            id: c.id.clone(),
            name: c.name.clone(),
            attributes: c.configuration.attributes.clone(),
            description: c.configuration.description.clone(),
            properties: c.configuration.properties.clone(),
            original_order: if c.bag.is_pinned() { c.bag.original_order().to_vec() } else { Vec::new() },
        }
    }

    fn configuration(&self) -> Configuration {
        Configuration {
            description: self.description.clone(),
            attributes: self.attributes.clone(),
            properties: self.properties.clone(),
        }
    }
}

fn read_yaml<T: DeserializeOwned>(path: &Path) -> RepoResult<T> {
    let text = fs::read_to_string(path).map_err(|e| RepoError::io(path, e))?;
    serde_yaml::from_str(&text).map_err(|e| RepoError::yaml(path, e))
}

fn write_yaml<T: Serialize>(path: &Path, value: &T) -> RepoResult<()> {
    let text = serde_yaml::to_string(value).map_err(|e| RepoError::yaml(path, e))?;
    fs::write(path, text).map_err(|e| RepoError::io(path, e))
}

fn dir_name(dir: &Path) -> String {
    dir.file_name().map(|s| s.to_string_lossy().into_owned()).unwrap_or_default()
}

fn read_resource(path: &Path) -> RepoResult<ResourceInstance> {
    let mut inst: ResourceInstance = read_yaml(path)?;
    if inst.id.is_empty() {
        return Err(RepoError::Validation(format!("resource file {} has an empty id", path.display())));
    }
    korral_schema::resolve(&mut inst.spec);
    inst.dirty = false;
    Ok(inst)
}

impl NodeIndex {
    /// Rebuild collection `id` and its whole subtree from `dir`.
    ///
    /// The description file's id is canonical: when it differs from `id` the
    /// index entry moves to the canonical id, which is returned. A directory
    /// without a description file gets one written. On error the partially
    /// loaded node is left as is; callers discard it.
    pub fn load(&mut self, id: &NodeId, dir: &Path) -> RepoResult<NodeId> {
        let t0 = Instant::now();
        let id = self.load_dir(id, dir)?;
        histogram!("repo_load_ms", t0.elapsed().as_secs_f64() * 1000.0);
        debug!(id = %id, dir = %dir.display(), took_ms = %t0.elapsed().as_millis(), "repo: collection loaded");
        Ok(id)
    }

    fn load_dir(&mut self, id: &NodeId, dir: &Path) -> RepoResult<NodeId> {
        let mut id = id.clone();
        {
            // stale members must not be carried over by a rekey
            let c = self.collection_mut(&id)?;
            c.path = dir.to_path_buf();
            c.children.clear();
            c.bag.clear();
        }
        let desc_path = dir.join(DESCRIPTION_FILE);
        let found_desc = desc_path.is_file();
        let mut pinned_order = Vec::new();
        if found_desc {
            let desc: Description = read_yaml(&desc_path)?;
            if !desc.id.is_empty() && desc.id != id {
                debug!(old = %id, new = %desc.id, "repo: adopting canonical collection id");
                self.rekey_collection(&id, &desc.id)?;
                id = desc.id.clone();
            }
            let c = self.collection_mut(&id)?;
            c.name = if desc.name.is_empty() { dir_name(dir) } else { desc.name.clone() };
            c.configuration = desc.configuration();
            pinned_order = desc.original_order;
        }
        {
            let c = self.collection_mut(&id)?;
            if c.name.is_empty() { c.name = dir_name(dir); }
        }

        let mut entries = fs::read_dir(dir)
            .map_err(|e| RepoError::io(dir, e))?
            .collect::<Result<Vec<_>, io::Error>>()
            .map_err(|e| RepoError::io(dir, e))?;
        entries.sort_by_key(|e| e.file_name());

        let mut resources = Vec::new();
        for entry in entries {
            let path = entry.path();
            let fname = entry.file_name().to_string_lossy().into_owned();
            let ft = entry.file_type().map_err(|e| RepoError::io(&path, e))?;
            if ft.is_dir() {
                if RESERVED_DIRS.contains(&fname.as_str()) { continue; }
                let child = Collection::new(None, Some(id.clone()), fname.clone(), path.clone());
                let child_id = self.register_collection(child);
                self.collection_mut(&id)?.children.push(child_id.clone());
                self.load_dir(&child_id, &path)?;
            } else if ft.is_file() && fname != DESCRIPTION_FILE {
                let Some(name) = fname.strip_suffix(RESOURCE_SUFFIX) else { continue };
                let inst = read_resource(&path)?;
                resources.push(ResourceNode::new(name, id.clone(), dir, inst));
            }
        }

        let rids: Vec<NodeId> = resources.iter().map(|r| r.id().clone()).collect();
        let c = self.collection_mut(&id)?;
        for r in resources { c.bag.push_loaded(r); }
        c.bag.sort();
        if c.bag.renumber() {
            debug!(id = %id, "repo: stored orders had gaps; renumbered");
        }
        if pinned_order.is_empty() {
            c.bag.mark_original();
        } else {
            c.bag.pin_original(pinned_order);
        }
        c.dirty = false;
        for rid in rids { self.register(rid, Slot::Resource { owner: id.clone() }); }

        if !found_desc {
            let c = self.collection_mut(&id)?;
            c.configuration = Configuration::with_description(format!("Collection {}", c.name));
            let desc = Description::of(c);
            write_yaml(&desc_path, &desc)?;
            info!(id = %id, dir = %dir.display(), "repo: synthesized missing description file");
        }
        Ok(id)
    }

    /// Persist a node.
    ///
    /// For a collection this writes its description file into `target` (or its own
    /// path), and when `recursive` also every resource document in its bag and every
    /// child collection. Children go to `target/<dir>` when a target is given,
    /// otherwise to their own paths.
    pub fn save(&mut self, id: &NodeId, target: Option<&Path>, recursive: bool) -> RepoResult<()> {
        match self.lookup(id).map(|n| n.as_collection().is_some()) {
            Some(true) => self.save_collection(id, target, recursive),
            Some(false) => self.save_resource(id, target),
            None => Err(RepoError::NotFound(format!("node {}", id))),
        }
    }

    fn save_collection(&mut self, id: &NodeId, target: Option<&Path>, recursive: bool) -> RepoResult<()> {
        let t0 = Instant::now();
        let (dir, children) = {
            let c = self.collection(id)?;
            let dir = target.map(Path::to_path_buf).unwrap_or_else(|| c.path.clone());
            fs::create_dir_all(&dir).map_err(|e| RepoError::io(&dir, e))?;
            write_yaml(&dir.join(DESCRIPTION_FILE), &Description::of(c))?;
            if recursive {
                for node in c.bag.iter() {
                    write_yaml(&dir.join(file_name(&node.name)), node.instance())?;
                }
            }
            (dir, c.children.clone())
        };
        if target.is_none() {
            let c = self.collection_mut(id)?;
            c.dirty = false;
            if recursive {
                for node in c.bag.iter_mut() { node.clear_dirty(); }
            }
        }
        counter!("repo_save_total", 1u64);
        histogram!("repo_save_ms", t0.elapsed().as_secs_f64() * 1000.0);
        if recursive {
            for child in children {
                let child_target: Option<PathBuf> = match target {
                    Some(_) => Some(dir.join(self.collection(&child)?.dir_name())),
                    None => None,
                };
                self.save_collection(&child, child_target.as_deref(), true)?;
            }
        }
        Ok(())
    }

    fn save_resource(&mut self, id: &NodeId, target: Option<&Path>) -> RepoResult<()> {
        let node = self.resource(id)?;
        let path = match target {
            Some(t) => t.join(file_name(&node.name)),
            None => node.path.clone(),
        };
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).map_err(|e| RepoError::io(parent, e))?;
        }
        write_yaml(&path, node.instance())?;
        if target.is_none() { self.resource_mut(id)?.clear_dirty(); }
        counter!("repo_save_total", 1u64);
        Ok(())
    }

    /// Description file plus every resource in the bag, without descending into children.
    pub(crate) fn persist_collection(&mut self, id: &NodeId) -> RepoResult<()> {
        let c = self.collection(id)?;
        let dir = c.path.clone();
        fs::create_dir_all(&dir).map_err(|e| RepoError::io(&dir, e))?;
        write_yaml(&dir.join(DESCRIPTION_FILE), &Description::of(c))?;
        for node in c.bag.iter() { write_yaml(&node.path, node.instance())?; }
        let c = self.collection_mut(id)?;
        c.dirty = false;
        for node in c.bag.iter_mut() { node.clear_dirty(); }
        Ok(())
    }

    /// Re-read a node from disk. Returns the node's id afterwards, which for a
    /// collection may be the description file's canonical id.
    pub fn reload(&mut self, id: &NodeId) -> RepoResult<NodeId> {
        match self.lookup(id).map(|n| n.as_collection().is_some()) {
            Some(true) => {
                let dir = self.collection(id)?.path.clone();
                for sid in self.subtree_ids(id)?.into_iter().skip(1) {
                    self.unregister(&sid);
                }
                self.load(id, &dir)
            }
            Some(false) => self.reload_resource(id),
            None => Err(RepoError::NotFound(format!("node {}", id))),
        }
    }

    fn reload_resource(&mut self, id: &NodeId) -> RepoResult<NodeId> {
        let owner = self.owner_of(id)?;
        let path = self.resource(id)?.path.clone();
        let inst = read_resource(&path)?;
        let new_id = inst.id.clone();
        let c = self.collection_mut(&owner)?;
        if let Some(node) = c.bag.get_mut(id) { node.replace_instance(inst); }
        c.bag.sort();
        c.bag.renumber();
        if &new_id != id {
            self.unregister(id);
            self.register(new_id.clone(), Slot::Resource { owner });
        }
        Ok(new_id)
    }

    /// Delete a node from disk and from the tree.
    ///
    /// A collection takes its whole directory with it. A resource closes the
    /// order gap in its bag and the owning collection is persisted again.
    pub fn remove(&mut self, id: &NodeId) -> RepoResult<()> {
        match self.lookup(id).map(|n| n.as_collection().is_some()) {
            Some(true) => self.remove_collection(id),
            Some(false) => self.remove_resource(id),
            None => Err(RepoError::NotFound(format!("node {}", id))),
        }
    }

    fn remove_collection(&mut self, id: &NodeId) -> RepoResult<()> {
        let (path, parent) = {
            let c = self.collection(id)?;
            (c.path.clone(), c.parent_id.clone())
        };
        let subtree = self.subtree_ids(id)?;
        match fs::remove_dir_all(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(RepoError::io(&path, e)),
        }
        if let Some(parent) = parent {
            if let Ok(p) = self.collection_mut(&parent) { p.children.retain(|c| c != id); }
        }
        for sid in subtree.iter() { self.unregister(sid); }
        info!(id = %id, removed = subtree.len(), "repo: collection removed");
        Ok(())
    }

    fn remove_resource(&mut self, id: &NodeId) -> RepoResult<()> {
        let owner = self.owner_of(id)?;
        let path = self.resource(id)?.path.clone();
        match fs::remove_file(&path) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(RepoError::io(&path, e)),
        }
        self.collection_mut(&owner)?.bag.remove_reorder(id);
        self.unregister(id);
        self.persist_collection(&owner)?;
        debug!(id = %id, owner = %owner, "repo: resource removed");
        Ok(())
    }
}
