use korral_core::NodeId;
use rustc_hash::FxHashMap;

use crate::node::{Collection, ResourceNode};
use crate::{RepoError, RepoResult};

/// What the index holds for an id. Collections are owned here; resources are
/// owned by their collection's bag and the slot only names that collection.
#[derive(Debug, Clone)]
pub enum Slot {
    Collection(Box<Collection>),
    Resource { owner: NodeId },
}

/// Borrowed view of a node, whichever variant it is.
#[derive(Debug, Clone, Copy)]
pub enum NodeRef<'a> {
    Collection(&'a Collection),
    Resource(&'a ResourceNode),
}

impl<'a> NodeRef<'a> {
    pub fn id(&self) -> &'a NodeId {
        match self {
            NodeRef::Collection(c) => &c.id,
            NodeRef::Resource(r) => r.id(),
        }
    }

    pub fn name(&self) -> &'a str {
        match self {
            NodeRef::Collection(c) => &c.name,
            NodeRef::Resource(r) => &r.name,
        }
    }

    pub fn path(&self) -> &'a std::path::Path {
        match self {
            NodeRef::Collection(c) => &c.path,
            NodeRef::Resource(r) => &r.path,
        }
    }

    /// Owning collection; a collection owns itself.
    pub fn owner(&self) -> &'a NodeId {
        match self {
            NodeRef::Collection(c) => &c.id,
            NodeRef::Resource(r) => &r.owner,
        }
    }

    pub fn as_collection(&self) -> Option<&'a Collection> {
        match self { NodeRef::Collection(c) => Some(c), _ => None }
    }

    pub fn as_resource(&self) -> Option<&'a ResourceNode> {
        match self { NodeRef::Resource(r) => Some(r), _ => None }
    }
}

/// Node identity index: id -> node for one repository tree.
///
/// `register` performs no uniqueness check; the last write wins.
#[derive(Debug, Clone, Default)]
pub struct NodeIndex {
    slots: FxHashMap<NodeId, Slot>,
}

impl NodeIndex {
    pub fn new() -> Self { Self::default() }

    pub fn register(&mut self, id: NodeId, slot: Slot) { self.slots.insert(id, slot); }

    pub fn register_collection(&mut self, collection: Collection) -> NodeId {
        let id = collection.id.clone();
        self.register(id.clone(), Slot::Collection(Box::new(collection)));
        id
    }

    pub fn unregister(&mut self, id: &NodeId) -> Option<Slot> { self.slots.remove(id) }

    pub fn contains(&self, id: &NodeId) -> bool { self.slots.contains_key(id) }
    pub fn len(&self) -> usize { self.slots.len() }
    pub fn is_empty(&self) -> bool { self.slots.is_empty() }
    pub fn ids(&self) -> impl Iterator<Item = &NodeId> { self.slots.keys() }

    pub fn lookup(&self, id: &NodeId) -> Option<NodeRef<'_>> {
        match self.slots.get(id)? {
            Slot::Collection(c) => Some(NodeRef::Collection(c)),
            Slot::Resource { owner } => match self.slots.get(owner)? {
                Slot::Collection(c) => c.bag.get(id).map(NodeRef::Resource),
                Slot::Resource { .. } => None,
            },
        }
    }

    pub fn collection(&self, id: &NodeId) -> RepoResult<&Collection> {
        match self.slots.get(id) {
            Some(Slot::Collection(c)) => Ok(c),
            Some(Slot::Resource { .. }) => Err(RepoError::Validation(format!("{} is a resource, not a collection", id))),
            None => Err(RepoError::NotFound(format!("collection {}", id))),
        }
    }

    pub fn collection_mut(&mut self, id: &NodeId) -> RepoResult<&mut Collection> {
        match self.slots.get_mut(id) {
            Some(Slot::Collection(c)) => Ok(c),
            Some(Slot::Resource { .. }) => Err(RepoError::Validation(format!("{} is a resource, not a collection", id))),
            None => Err(RepoError::NotFound(format!("collection {}", id))),
        }
    }

    /// Owning collection id of a resource.
    pub fn owner_of(&self, id: &NodeId) -> RepoResult<NodeId> {
        match self.slots.get(id) {
            Some(Slot::Resource { owner }) => Ok(owner.clone()),
            Some(Slot::Collection(c)) => Ok(c.id.clone()),
            None => Err(RepoError::NotFound(format!("node {}", id))),
        }
    }

    pub fn resource(&self, id: &NodeId) -> RepoResult<&ResourceNode> {
        match self.lookup(id) {
            Some(NodeRef::Resource(r)) => Ok(r),
            Some(NodeRef::Collection(_)) => Err(RepoError::Validation(format!("{} is a collection, not a resource", id))),
            None => Err(RepoError::NotFound(format!("resource {}", id))),
        }
    }

    pub fn resource_mut(&mut self, id: &NodeId) -> RepoResult<&mut ResourceNode> {
        let owner = match self.slots.get(id) {
            Some(Slot::Resource { owner }) => owner.clone(),
            Some(Slot::Collection(_)) => return Err(RepoError::Validation(format!("{} is a collection, not a resource", id))),
            None => return Err(RepoError::NotFound(format!("resource {}", id))),
        };
        self.collection_mut(&owner)?
            .bag
            .get_mut(id)
            .ok_or_else(|| RepoError::Invariant(format!("resource {} indexed under {} but missing from its bag", id, owner)))
    }

    /// Ids of the collection and everything below it, collections before their contents.
    pub fn subtree_ids(&self, id: &NodeId) -> RepoResult<Vec<NodeId>> {
        let mut out = Vec::new();
        let mut stack = vec![id.clone()];
        while let Some(cur) = stack.pop() {
            let c = self.collection(&cur)?;
            out.push(cur.clone());
            out.extend(c.bag.ids());
            for child in c.children.iter().rev() { stack.push(child.clone()); }
        }
        Ok(out)
    }

    /// Move a collection from `old` to `new`, fixing its parent's child list and its resources' slots.
    pub(crate) fn rekey_collection(&mut self, old: &NodeId, new: &NodeId) -> RepoResult<()> {
        if old == new { return Ok(()); }
        let mut c = match self.slots.remove(old) {
            Some(Slot::Collection(c)) => c,
            Some(other) => {
                self.slots.insert(old.clone(), other);
                return Err(RepoError::Validation(format!("{} is a resource, not a collection", old)));
            }
            None => return Err(RepoError::NotFound(format!("collection {}", old))),
        };
        c.set_id(new.clone());
        for rid in c.bag.ids() { self.slots.insert(rid, Slot::Resource { owner: new.clone() }); }
        for child in c.children.clone() {
            if let Ok(cc) = self.collection_mut(&child) { cc.parent_id = Some(new.clone()); }
        }
        if let Some(parent) = c.parent_id.clone() {
            if let Ok(p) = self.collection_mut(&parent) {
                for slot in p.children.iter_mut() {
                    if slot == old { *slot = new.clone(); }
                }
            }
        }
        self.slots.insert(new.clone(), Slot::Collection(c));
        Ok(())
    }

    /// Copy the subtree rooted at `id` into `target`. Resource documents are shared, not duplicated.
    pub fn clone_subtree_into(&self, id: &NodeId, target: &mut NodeIndex) -> RepoResult<()> {
        for cid in self.subtree_ids(id)? {
            match self.slots.get(&cid) {
                Some(slot) => target.register(cid, slot.clone()),
                None => return Err(RepoError::Invariant(format!("subtree id {} not indexed", cid))),
            }
        }
        Ok(())
    }
}
