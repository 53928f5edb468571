//! Korral repository tree: ID-indexed collections and resource documents backed by directories.
//!
//! Nodes live in a [`NodeIndex`] owned by the [`Repository`]. Parent and owner
//! links are ids, never references, so the index is the single owner of every
//! node. Resource nodes are stored inside their collection's [`ResourceBag`];
//! the index records only which collection owns them.

#![forbid(unsafe_code)]

use std::path::PathBuf;

mod bag;
mod disk;
mod index;
mod node;
mod repository;

pub use bag::{ReorderOp, ResourceBag};
pub use index::{NodeIndex, NodeRef, Slot};
pub use node::{Collection, ResourceNode};
pub use repository::Repository;

/// Fixed name of the per-directory description file.
pub const DESCRIPTION_FILE: &str = ".collection.yaml";
/// Suffix of resource document files.
pub const RESOURCE_SUFFIX: &str = ".yaml";
/// Sub-directories never treated as collections.
pub const RESERVED_DIRS: &[&str] = &[".git"];

#[derive(Debug, thiserror::Error)]
pub enum RepoError {
    #[error("validation: {0}")]
    Validation(String),
    #[error("not_found: {0}")]
    NotFound(String),
    #[error("io at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed yaml in {}: {source}", path.display())]
    Yaml {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },
    #[error("invariant: {0}")]
    Invariant(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

impl RepoError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self { RepoError::Io { path: path.into(), source } }
    pub(crate) fn yaml(path: impl Into<PathBuf>, source: serde_yaml::Error) -> Self { RepoError::Yaml { path: path.into(), source } }
}
