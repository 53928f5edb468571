//! Korral persistence: YAML record lists for deploy state, plus the per-install cluster index.
//! Whole-file rewrite on every change; the lists are small.

#![forbid(unsafe_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use metrics::{counter, histogram};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::debug;

/// Anything stored in a [`YamlStore`]: serializable and addressable by id.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync {
    fn record_id(&self) -> &str;
}

/// Ordered list of records supporting append, in-place update and removal by id.
pub trait Store<T: Record>: Send + Sync {
    fn load_all(&self) -> Result<Vec<T>>;
    fn append(&self, record: &T) -> Result<()>;
    /// Replace the record with the same id. Returns false when none matched.
    fn update(&self, record: &T) -> Result<bool>;
    /// Drop the record with this id. Returns false when none matched.
    fn remove(&self, id: &str) -> Result<bool>;
}

/// YAML file holding a sequence of records.
pub struct YamlStore {
    path: PathBuf,
    lock: Mutex<()>,
}

impl YamlStore {
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).with_context(|| format!("creating state dir {}", dir.display()))?;
        }
        Ok(Self { path, lock: Mutex::new(()) })
    }

    pub fn path(&self) -> &Path { &self.path }

    fn read<T: Record>(&self) -> Result<Vec<T>> {
        if !self.path.exists() {
            return Ok(Vec::new());
        }
        let text = fs::read_to_string(&self.path).with_context(|| format!("reading {}", self.path.display()))?;
        if text.trim().is_empty() {
            return Ok(Vec::new());
        }
        serde_yaml::from_str(&text).with_context(|| format!("parsing {}", self.path.display()))
    }

    fn write<T: Record>(&self, records: &[T]) -> Result<()> {
        let started = std::time::Instant::now();
        let text = serde_yaml::to_string(records).context("serializing records")?;
        let tmp = self.path.with_extension("yaml.tmp");
        fs::write(&tmp, text).with_context(|| format!("writing {}", tmp.display()))?;
        fs::rename(&tmp, &self.path).with_context(|| format!("replacing {}", self.path.display()))?;
        histogram!("persist_write_ms", started.elapsed().as_secs_f64() * 1000.0);
        counter!("persist_write_total", 1u64);
        Ok(())
    }

    fn modify<T: Record, R>(&self, f: impl FnOnce(&mut Vec<T>) -> R) -> Result<R> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("store lock poisoned: {}", self.path.display()))?;
        let mut records = self.read()?;
        let out = f(&mut records);
        self.write(&records)?;
        Ok(out)
    }
}

impl<T: Record> Store<T> for YamlStore {
    fn load_all(&self) -> Result<Vec<T>> {
        let _guard = self.lock.lock().map_err(|_| anyhow!("store lock poisoned: {}", self.path.display()))?;
        let out: Vec<T> = self.read()?;
        debug!(path = %self.path.display(), records = out.len(), "persist: loaded");
        Ok(out)
    }

    fn append(&self, record: &T) -> Result<()> {
        self.modify(|rs: &mut Vec<T>| rs.push(record.clone()))
    }

    fn update(&self, record: &T) -> Result<bool> {
        self.modify(|rs: &mut Vec<T>| match rs.iter_mut().find(|r| r.record_id() == record.record_id()) {
            Some(slot) => {
                *slot = record.clone();
                true
            }
            None => false,
        })
    }

    fn remove(&self, id: &str) -> Result<bool> {
        self.modify(|rs: &mut Vec<T>| {
            let before = rs.len();
            rs.retain(|r| r.record_id() != id);
            rs.len() != before
        })
    }
}

/// Human-readable info about one cluster the install has talked to.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterInfo {
    pub identity: String,
    pub name: String,
    pub server: String,
    #[serde(default)]
    pub namespace: String,
}

impl Record for ClusterInfo {
    fn record_id(&self) -> &str { &self.identity }
}

pub const CLUSTER_INDEX_FILE: &str = "clusters.yaml";

/// `clusters.yaml` under the state dir; each cluster's deploy records live beside it.
pub struct ClusterIndex {
    dir: PathBuf,
    store: YamlStore,
}

impl ClusterIndex {
    pub fn open(state_dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = state_dir.into();
        let store = YamlStore::open(dir.join(CLUSTER_INDEX_FILE))?;
        Ok(Self { dir, store })
    }

    pub fn all(&self) -> Result<Vec<ClusterInfo>> { self.store.load_all() }

    pub fn get(&self, identity: &str) -> Result<Option<ClusterInfo>> {
        Ok(self.all()?.into_iter().find(|c| c.identity == identity))
    }

    /// Insert or refresh the entry for `info.identity`.
    pub fn upsert(&self, info: &ClusterInfo) -> Result<()> {
        if !Store::<ClusterInfo>::update(&self.store, info)? {
            self.store.append(info)?;
        }
        Ok(())
    }

    /// Path of the deploy record list for one cluster.
    pub fn registry_path(&self, identity: &str) -> PathBuf { self.dir.join(format!("deploys-{}.yaml", identity)) }
}

/// `$HOME/.korral`, or `./.korral` when no home is set.
pub fn default_state_dir() -> PathBuf {
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".korral"),
        None => PathBuf::from(".korral"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Rec {
        id: String,
        n: u32,
    }

    impl Record for Rec {
        fn record_id(&self) -> &str { &self.id }
    }

    fn rec(id: &str, n: u32) -> Rec { Rec { id: id.into(), n } }

    #[test]
    fn append_update_remove_keep_order() {
        let tmp = tempfile::TempDir::new().unwrap();
        let s = YamlStore::open(tmp.path().join("nested/records.yaml")).unwrap();
        assert!(Store::<Rec>::load_all(&s).unwrap().is_empty());
        s.append(&rec("a", 1)).unwrap();
        s.append(&rec("b", 2)).unwrap();
        s.append(&rec("c", 3)).unwrap();
        assert!(s.update(&rec("b", 20)).unwrap());
        assert!(!s.update(&rec("zz", 0)).unwrap());
        assert!(Store::<Rec>::remove(&s, "a").unwrap());
        assert!(!Store::<Rec>::remove(&s, "a").unwrap());
        let all: Vec<Rec> = s.load_all().unwrap();
        assert_eq!(all, vec![rec("b", 20), rec("c", 3)]);
    }

    #[test]
    fn reopen_reads_what_was_written() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("records.yaml");
        YamlStore::open(&path).unwrap().append(&rec("x", 9)).unwrap();
        let all: Vec<Rec> = YamlStore::open(&path).unwrap().load_all().unwrap();
        assert_eq!(all, vec![rec("x", 9)]);
    }

    #[test]
    fn malformed_file_is_an_error() {
        let tmp = tempfile::TempDir::new().unwrap();
        let path = tmp.path().join("records.yaml");
        fs::write(&path, "@@@ [[[").unwrap();
        let s = YamlStore::open(&path).unwrap();
        assert!(Store::<Rec>::load_all(&s).is_err());
    }

    #[test]
    fn cluster_index_upserts() {
        let tmp = tempfile::TempDir::new().unwrap();
        let idx = ClusterIndex::open(tmp.path()).unwrap();
        let mut info = ClusterInfo { identity: "abc".into(), name: "kind".into(), server: "https://x".into(), namespace: String::new() };
        idx.upsert(&info).unwrap();
        info.name = "kind-renamed".into();
        idx.upsert(&info).unwrap();
        assert_eq!(idx.all().unwrap().len(), 1);
        assert_eq!(idx.get("abc").unwrap().unwrap().name, "kind-renamed");
        assert_eq!(idx.registry_path("abc"), tmp.path().join("deploys-abc.yaml"));
    }
}
