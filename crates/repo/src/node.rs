use std::path::{Path, PathBuf};
use std::sync::Arc;

use korral_core::{Configuration, NodeId, ResourceInstance};

use crate::bag::ResourceBag;
use crate::RESOURCE_SUFFIX;

/// Directory-shaped tree node.
#[derive(Debug, Clone)]
pub struct Collection {
    pub id: NodeId,
    /// `None` for a repository root.
    pub parent_id: Option<NodeId>,
    pub name: String,
    pub configuration: Configuration,
    pub children: Vec<NodeId>,
    pub bag: ResourceBag,
    pub path: PathBuf,
    pub dirty: bool,
}

impl Collection {
    /// Fresh collection; a new id is generated unless one is supplied.
    pub fn new(id: Option<NodeId>, parent_id: Option<NodeId>, name: impl Into<String>, path: impl Into<PathBuf>) -> Self {
        let id = id.unwrap_or_else(NodeId::generate);
        let name = name.into();
        Self {
            bag: ResourceBag::new(id.clone()),
            configuration: Configuration::with_description(format!("Collection {}", name)),
            id,
            parent_id,
            name,
            children: Vec::new(),
            path: path.into(),
            dirty: true,
        }
    }

    pub fn is_root(&self) -> bool { self.parent_id.is_none() }

    /// Directory name used when the subtree is exported somewhere else.
    pub fn dir_name(&self) -> String {
        self.path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| self.name.clone())
    }

    pub(crate) fn set_id(&mut self, id: NodeId) {
        self.bag.set_owner(id.clone());
        self.id = id;
    }
}

/// A resource instance placed in a collection.
///
/// The instance sits behind an `Arc` so that clones of the tree share the
/// document text. Mutation goes through [`ResourceNode::instance_mut`], which
/// copies the instance first when it is shared.
#[derive(Debug, Clone)]
pub struct ResourceNode {
    pub name: String,
    pub path: PathBuf,
    pub owner: NodeId,
    instance: Arc<ResourceInstance>,
}

impl ResourceNode {
    pub fn new(name: impl Into<String>, owner: NodeId, dir: &Path, mut instance: ResourceInstance) -> Self {
        let name = name.into();
        if instance.label.is_empty() {
            instance.label = instance.metadata_name().unwrap_or_else(|| name.clone());
        }
        Self { path: dir.join(file_name(&name)), name, owner, instance: Arc::new(instance) }
    }

    pub fn id(&self) -> &NodeId { &self.instance.id }
    pub fn order(&self) -> usize { self.instance.order }
    pub fn instance(&self) -> &ResourceInstance { &self.instance }

    pub fn instance_mut(&mut self) -> &mut ResourceInstance { Arc::make_mut(&mut self.instance) }

    pub(crate) fn replace_instance(&mut self, mut instance: ResourceInstance) {
        if instance.label.is_empty() {
            instance.label = instance.metadata_name().unwrap_or_else(|| self.name.clone());
        }
        self.instance = Arc::new(instance);
    }

    /// True when both nodes point at the very same instance allocation.
    pub fn shares_instance_with(&self, other: &ResourceNode) -> bool { Arc::ptr_eq(&self.instance, &other.instance) }

    pub(crate) fn set_order(&mut self, order: usize) {
        if self.instance.order != order {
            let inst = self.instance_mut();
            inst.order = order;
            inst.dirty = true;
        }
    }

    pub(crate) fn clear_dirty(&mut self) {
        if self.instance.dirty { self.instance_mut().dirty = false; }
    }
}

pub(crate) fn file_name(resource_name: &str) -> String { format!("{}{}", resource_name, RESOURCE_SUFFIX) }
