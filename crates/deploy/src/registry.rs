use korral_core::NodeId;
use korral_persist::Store;
use metrics::counter;
use rustc_hash::{FxHashMap, FxHashSet};
use tracing::{info, warn};

use crate::detail::{DeployDetail, DeployStatus};
use crate::{DeployError, DeployResult};

/// Deploy records for one cluster, indexed by root id and mirrored to a store.
pub struct DeployRegistry {
    records: FxHashMap<NodeId, DeployDetail>,
    /// Ids already written to the store; decides append vs update.
    stored: FxHashSet<NodeId>,
    store: Box<dyn Store<DeployDetail>>,
}

impl DeployRegistry {
    /// Read every record from `store`.
    pub fn load(store: Box<dyn Store<DeployDetail>>) -> DeployResult<Self> {
        let mut records = FxHashMap::default();
        let mut stored = FxHashSet::default();
        for mut d in store.load_all().map_err(DeployError::persist)? {
            if d.status == DeployStatus::InDeploy {
                warn!(root = %d.id, "deploy: record was left mid-deploy; treating as deployed");
                d.status = DeployStatus::Deployed;
            }
            stored.insert(d.id.clone());
            records.insert(d.id.clone(), d);
        }
        info!(records = records.len(), "deploy: registry loaded");
        Ok(Self { records, stored, store })
    }

    /// Flag records whose root is not live; returns how many are orphaned.
    pub fn mark_orphans(&mut self, is_live: impl Fn(&NodeId) -> bool) -> usize {
        let mut n = 0;
        for d in self.records.values_mut() {
            d.orphaned = !is_live(&d.id);
            if d.orphaned { n += 1; }
        }
        if n > 0 { warn!(orphans = n, "deploy: records without a live root"); }
        n
    }

    pub fn len(&self) -> usize { self.records.len() }
    pub fn is_empty(&self) -> bool { self.records.is_empty() }
    pub fn get(&self, id: &NodeId) -> Option<&DeployDetail> { self.records.get(id) }
    pub fn get_mut(&mut self, id: &NodeId) -> Option<&mut DeployDetail> { self.records.get_mut(id) }
    pub fn is_stored(&self, id: &NodeId) -> bool { self.stored.contains(id) }

    /// Records ordered by creation time, then id.
    pub fn list(&self) -> Vec<&DeployDetail> {
        let mut out: Vec<&DeployDetail> = self.records.values().collect();
        out.sort_by(|a, b| a.creation.cmp(&b.creation).then_with(|| a.id.cmp(&b.id)));
        out
    }

    /// Keep in memory only; [`persist`](Self::persist) writes it.
    pub fn insert(&mut self, detail: DeployDetail) { self.records.insert(detail.id.clone(), detail); }

    /// Write one record: append the first time, update in place afterwards.
    pub fn persist(&mut self, id: &NodeId) -> DeployResult<()> {
        let d = self.records.get(id).ok_or_else(|| DeployError::NotFound(format!("deploy record {}", id)))?;
        if self.stored.contains(id) {
            if !self.store.update(d).map_err(DeployError::persist)? {
                self.store.append(d).map_err(DeployError::persist)?;
            }
        } else {
            self.store.append(d).map_err(DeployError::persist)?;
            self.stored.insert(id.clone());
        }
        counter!("deploy_registry_persist_total", 1u64);
        Ok(())
    }

    /// Drop a record from memory and from the store.
    pub fn discard(&mut self, id: &NodeId) -> DeployResult<Option<DeployDetail>> {
        let removed = self.records.remove(id);
        if self.stored.remove(id) {
            self.store.remove(id.as_str()).map_err(DeployError::persist)?;
        }
        Ok(removed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use korral_persist::YamlStore;

    fn open(path: &std::path::Path) -> DeployRegistry {
        DeployRegistry::load(Box::new(YamlStore::open(path).unwrap())).unwrap()
    }

    #[test]
    fn persist_appends_then_updates() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("deploys.yaml");
        let mut reg = open(&path);
        let id = NodeId::from("root");
        reg.insert(DeployDetail::new(id.clone(), "root", "team"));
        assert!(!reg.is_stored(&id));
        reg.persist(&id).unwrap();
        reg.get_mut(&id).unwrap().status = DeployStatus::Deployed;
        reg.persist(&id).unwrap();

        let reg = open(&path);
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get(&id).unwrap().status, DeployStatus::Deployed);
        assert!(reg.is_stored(&id));
    }

    #[test]
    fn discard_removes_from_store() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("deploys.yaml");
        let mut reg = open(&path);
        let (a, b) = (NodeId::from("a"), NodeId::from("b"));
        reg.insert(DeployDetail::new(a.clone(), "a", ""));
        reg.insert(DeployDetail::new(b.clone(), "b", ""));
        reg.persist(&a).unwrap();
        reg.persist(&b).unwrap();
        assert!(reg.discard(&a).unwrap().is_some());
        assert!(reg.discard(&a).unwrap().is_none());

        let reg = open(&path);
        assert!(reg.get(&a).is_none());
        assert!(reg.get(&b).is_some());
    }

    #[test]
    fn orphans_are_flagged_not_dropped() {
        let tmp = tempfile::TempDir::new().unwrap();
        let mut reg = open(&tmp.path().join("deploys.yaml"));
        reg.insert(DeployDetail::new(NodeId::from("live"), "live", ""));
        reg.insert(DeployDetail::new(NodeId::from("gone"), "gone", ""));
        assert_eq!(reg.mark_orphans(|id| id.as_str() == "live"), 1);
        assert_eq!(reg.len(), 2);
        assert!(reg.get(&NodeId::from("gone")).unwrap().orphaned);
        assert!(!reg.get(&NodeId::from("live")).unwrap().orphaned);
    }

    #[test]
    fn mid_deploy_records_load_as_deployed() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("deploys.yaml");
        let mut reg = open(&path);
        let id = NodeId::from("root");
        let mut d = DeployDetail::new(id.clone(), "root", "");
        d.status = DeployStatus::InDeploy;
        reg.insert(d);
        reg.persist(&id).unwrap();
        assert_eq!(open(&path).get(&id).unwrap().status, DeployStatus::Deployed);
    }
}
