use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Runtime settings gathered from `KORRAL_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    pub repo: Option<PathBuf>,
    pub state_dir: PathBuf,
    pub default_namespace: String,
    pub task_cap: usize,
    pub metrics_addr: Option<String>,
}

impl Default for Settings {
    fn default() -> Self { Self::from_lookup(|_| None) }
}

impl Settings {
    pub fn from_env() -> Self { Self::from_lookup(|k| std::env::var(k).ok()) }

    pub fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Self {
        let non_empty = |k: &str| get(k).filter(|s| !s.trim().is_empty());
        Self {
            repo: non_empty("KORRAL_REPO").map(PathBuf::from),
            state_dir: non_empty("KORRAL_STATE_DIR").map(PathBuf::from).unwrap_or_else(korral_persist::default_state_dir),
            default_namespace: non_empty("KORRAL_DEFAULT_NAMESPACE").unwrap_or_else(|| "default".to_string()),
            task_cap: non_empty("KORRAL_TASK_CAP").and_then(|s| s.parse().ok()).filter(|n| *n > 0).unwrap_or(256),
            metrics_addr: non_empty("KORRAL_METRICS_ADDR"),
        }
    }

    pub fn with_repo(mut self, repo: impl Into<PathBuf>) -> Self {
        self.repo = Some(repo.into());
        self
    }

    pub fn with_state_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.state_dir = dir.into();
        self
    }
}
