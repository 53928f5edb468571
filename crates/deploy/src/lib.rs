//! Korral deploy reconciliation.
//!
//! A [`DeployDetail`] tracks what was last applied for one repository root.
//! Deploying flattens the root's current subtree, diffs it against that
//! snapshot, orders the resulting actions (namespaces first) and hands them one
//! at a time to a [`korral_kubehub::ClusterAccess`]. Records live in a
//! [`DeployRegistry`] backed by a YAML store per cluster.

#![forbid(unsafe_code)]

mod detail;
mod engine;
mod order;
mod registry;

pub use detail::{diff, flatten, DeployDetail, DeployStatus, OriginalCr};
pub use engine::{DeployEngine, DeployOutcome, DeployPlan, SharedRegistry, TaskEvent, TaskState};
pub use order::{process_deploy_order, undeploy_order};
pub use registry::DeployRegistry;

use korral_core::NodeId;
use korral_repo::RepoError;

#[derive(Debug, thiserror::Error)]
pub enum DeployError {
    #[error("invariant: {0}")]
    Invariant(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("a deploy task for {0} is already running")]
    Busy(NodeId),
    #[error("cluster rejected {id}: {message}")]
    Cluster { id: NodeId, message: String },
    #[error("persist: {0}")]
    Persist(String),
    #[error(transparent)]
    Repo(#[from] RepoError),
}

pub type DeployResult<T> = Result<T, DeployError>;

impl DeployError {
    pub(crate) fn persist(e: anyhow::Error) -> Self { DeployError::Persist(format!("{:#}", e)) }
}
