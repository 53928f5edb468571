use korral_core::NodeId;
use serde::{Deserialize, Serialize};

use crate::node::ResourceNode;
use crate::{RepoError, RepoResult};

/// Bulk reorder requests computed against the live member positions.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReorderOp {
    ToTop(NodeId),
    ToBottom(NodeId),
    Up(NodeId),
    Down(NodeId),
    /// Back to the order captured when the bag was last read from disk.
    RestoreOriginal,
}

/// Ordered resource nodes of one collection.
///
/// After every successful mutation the members' `order` values are `0..n`
/// and match their positions.
#[derive(Debug, Clone)]
pub struct ResourceBag {
    owner: NodeId,
    members: Vec<ResourceNode>,
    original: Vec<NodeId>,
    /// The restore order predates the order on disk and must be persisted.
    pinned: bool,
}

impl ResourceBag {
    pub fn new(owner: NodeId) -> Self { Self { owner, members: Vec::new(), original: Vec::new(), pinned: false } }

    pub fn owner(&self) -> &NodeId { &self.owner }
    pub fn len(&self) -> usize { self.members.len() }
    pub fn is_empty(&self) -> bool { self.members.is_empty() }
    pub fn iter(&self) -> impl Iterator<Item = &ResourceNode> { self.members.iter() }
    pub(crate) fn iter_mut(&mut self) -> impl Iterator<Item = &mut ResourceNode> { self.members.iter_mut() }
    pub fn ids(&self) -> Vec<NodeId> { self.members.iter().map(|m| m.id().clone()).collect() }
    pub fn position(&self, id: &NodeId) -> Option<usize> { self.members.iter().position(|m| m.id() == id) }
    pub fn get(&self, id: &NodeId) -> Option<&ResourceNode> { self.members.iter().find(|m| m.id() == id) }
    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut ResourceNode> { self.members.iter_mut().find(|m| m.id() == id) }
    pub fn find_by_name(&self, name: &str) -> Option<&ResourceNode> { self.members.iter().find(|m| m.name == name) }
    pub fn original_order(&self) -> &[NodeId] { &self.original }
    pub fn is_pinned(&self) -> bool { self.pinned }

    pub(crate) fn set_owner(&mut self, owner: NodeId) {
        for m in self.members.iter_mut() { m.owner = owner.clone(); }
        self.owner = owner;
    }

    /// Append at the end; the node's order becomes its position.
    pub fn add(&mut self, mut node: ResourceNode) {
        node.owner = self.owner.clone();
        node.set_order(self.members.len());
        self.members.push(node);
    }

    /// Append as read from disk, keeping the stored order untouched.
    pub(crate) fn push_loaded(&mut self, mut node: ResourceNode) {
        node.owner = self.owner.clone();
        self.members.push(node);
    }

    /// Stable sort on stored `order`.
    pub fn sort(&mut self) { self.members.sort_by_key(|m| m.order()); }

    /// Rewrite `order` to match positions. Returns whether anything changed.
    pub fn renumber(&mut self) -> bool {
        let changed = self.has_order_changed();
        for (pos, m) in self.members.iter_mut().enumerate() { m.set_order(pos); }
        changed
    }

    /// Whether any member's stored `order` differs from its live position.
    pub fn has_order_changed(&self) -> bool { self.members.iter().enumerate().any(|(pos, m)| m.order() != pos) }

    /// Remember the current membership order as the one to restore to.
    pub fn mark_original(&mut self) {
        self.original = self.ids();
        self.pinned = false;
    }

    /// Restore to `ids` instead of the loaded order, as recorded by an earlier reorder.
    pub(crate) fn pin_original(&mut self, ids: Vec<NodeId>) {
        self.original = ids;
        self.pinned = true;
    }

    pub(crate) fn set_pinned(&mut self, pinned: bool) { self.pinned = pinned; }

    pub(crate) fn clear(&mut self) {
        self.members.clear();
        self.original.clear();
        self.pinned = false;
    }

    /// Remove a member and close the gap: every sibling ordered after it moves up by one.
    pub fn remove_reorder(&mut self, id: &NodeId) -> Option<ResourceNode> {
        let pos = self.position(id)?;
        let removed = self.members.remove(pos);
        let removed_order = removed.order();
        for m in self.members.iter_mut() {
            if m.order() > removed_order { m.set_order(m.order() - 1); }
        }
        self.original.retain(|o| o != id);
        Some(removed)
    }

    /// Place `node` at `pos` (replacing whatever sat there) and stamp its order.
    pub fn set_instance_at(&mut self, pos: usize, mut node: ResourceNode) -> RepoResult<()> {
        if pos > self.members.len() {
            return Err(RepoError::Invariant(format!("position {} beyond bag of {}", pos, self.members.len())));
        }
        node.owner = self.owner.clone();
        node.set_order(pos);
        if pos == self.members.len() {
            self.members.push(node);
        } else {
            self.members[pos] = node;
        }
        Ok(())
    }

    /// Compute the full id ordering `op` asks for, without touching the bag.
    pub fn plan(&self, op: &ReorderOp) -> RepoResult<Vec<NodeId>> {
        let mut ids = self.ids();
        let locate = |ids: &[NodeId], id: &NodeId| {
            ids.iter().position(|x| x == id).ok_or_else(|| RepoError::NotFound(format!("resource {} in collection {}", id, self.owner)))
        };
        match op {
            ReorderOp::ToTop(id) => {
                let pos = locate(&ids, id)?;
                let moved = ids.remove(pos);
                ids.insert(0, moved);
            }
            ReorderOp::ToBottom(id) => {
                let pos = locate(&ids, id)?;
                let moved = ids.remove(pos);
                ids.push(moved);
            }
            ReorderOp::Up(id) => {
                let pos = locate(&ids, id)?;
                if pos > 0 { ids.swap(pos, pos - 1); }
            }
            ReorderOp::Down(id) => {
                let pos = locate(&ids, id)?;
                if pos + 1 < ids.len() { ids.swap(pos, pos + 1); }
            }
            ReorderOp::RestoreOriginal => {
                let mut restored: Vec<NodeId> = self.original.iter().filter(|o| ids.contains(o)).cloned().collect();
                for id in ids.iter() {
                    if !restored.contains(id) { restored.push(id.clone()); }
                }
                ids = restored;
            }
        }
        Ok(ids)
    }

    /// Move members into the given id order. Stored `order` values are left alone so
    /// that [`has_order_changed`](Self::has_order_changed) can tell whether the move matters.
    pub fn arrange(&mut self, ids: &[NodeId]) -> RepoResult<()> {
        if ids.len() != self.members.len() {
            return Err(RepoError::Invariant(format!("ordering has {} ids, bag has {}", ids.len(), self.members.len())));
        }
        let mut pool: Vec<Option<ResourceNode>> = std::mem::take(&mut self.members).into_iter().map(Some).collect();
        let mut next = Vec::with_capacity(pool.len());
        for id in ids {
            let slot = pool.iter_mut().find(|n| n.as_ref().map(|n| n.id() == id).unwrap_or(false));
            match slot.and_then(|s| s.take()) {
                Some(node) => next.push(node),
                None => {
                    // put back what we took so the bag stays intact
                    next.extend(pool.into_iter().flatten());
                    self.members = next;
                    return Err(RepoError::NotFound(format!("resource {} in collection {}", id, self.owner)));
                }
            }
        }
        self.members = next;
        Ok(())
    }

    /// Write back the live positions one by one through [`set_instance_at`](Self::set_instance_at).
    pub fn commit_positions(&mut self) -> RepoResult<()> {
        let members = std::mem::take(&mut self.members);
        for (pos, node) in members.into_iter().enumerate() {
            self.set_instance_at(pos, node)?;
        }
        Ok(())
    }
}
