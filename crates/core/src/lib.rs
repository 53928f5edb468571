//! Korral core types: resource documents, collection configuration and deploy actions.

#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod prelude {
    pub use super::{
        ActionKind, ApiRef, Configuration, ContentHash, CoreError, DeployAction, NodeId, Property, ResourceInstance,
        ResourceSpec,
    };
}

/// Property key holding a collection's default namespace.
pub const NAMESPACE_PROPERTY: &str = "namespace";

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum CoreError {
    #[error("unsupported API kind: {0} (expect version/resource or group/version/resource)")]
    UnsupportedApiVersion(String),
}

/// Opaque node identifier shared by collections and resource instances.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct NodeId(String);

impl NodeId {
    /// Fresh random identifier.
    pub fn generate() -> Self { Self(uuid::Uuid::new_v4().to_string()) }
    pub fn as_str(&self) -> &str { &self.0 }
    pub fn is_empty(&self) -> bool { self.0.is_empty() }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

impl From<&str> for NodeId {
    fn from(s: &str) -> Self { Self(s.to_string()) }
}

impl From<String> for NodeId {
    fn from(s: String) -> Self { Self(s) }
}

/// Parsed `apiVer` string: `v1/pods` or `apps/v1/deployments`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ApiRef {
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl ApiRef {
    pub fn parse(api_ver: &str) -> Result<Self, CoreError> {
        let parts: Vec<&str> = api_ver.split('/').collect();
        let bad = || CoreError::UnsupportedApiVersion(api_ver.to_string());
        let (group, version, resource) = match parts.as_slice() {
            [version, resource] => ("", *version, *resource),
            [group, version, resource] => (*group, *version, *resource),
            _ => return Err(bad()),
        };
        if version.is_empty() || resource.is_empty() { return Err(bad()); }
        Ok(Self { group: group.to_string(), version: version.to_string(), resource: resource.to_string() })
    }

    pub fn key(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.resource)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.resource)
        }
    }

    /// `apiVersion` as written inside a document (`v1`, `apps/v1`).
    pub fn api_version(&self) -> String {
        if self.group.is_empty() { self.version.clone() } else { format!("{}/{}", self.group, self.version) }
    }

    pub fn is_namespace(&self) -> bool { self.group.is_empty() && self.resource == "namespaces" }
}

/// True when `api_ver` names the core namespace resource.
pub fn is_namespace_api(api_ver: &str) -> bool {
    ApiRef::parse(api_ver).map(|r| r.is_namespace()).unwrap_or(false)
}

/// API kind reference plus the schema text cached alongside the document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceSpec {
    #[serde(rename = "apiVer")]
    pub api_ver: String,
    #[serde(default)]
    pub schema: String,
    #[serde(default)]
    pub loaded: bool,
}

impl ResourceSpec {
    pub fn new(api_ver: impl Into<String>) -> Self {
        Self { api_ver: api_ver.into(), schema: String::new(), loaded: false }
    }
}

/// One editable configuration document. The serialized form is the on-disk resource file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceInstance {
    pub id: NodeId,
    pub spec: ResourceSpec,
    #[serde(default)]
    pub cr: String,
    #[serde(default)]
    pub order: usize,
    #[serde(skip)]
    pub label: String,
    #[serde(skip)]
    pub dirty: bool,
}

impl ResourceInstance {
    /// Newly authored document with a fresh id.
    pub fn new(api_ver: impl Into<String>, cr: impl Into<String>) -> Self {
        Self {
            id: NodeId::generate(),
            spec: ResourceSpec::new(api_ver),
            cr: cr.into(),
            order: 0,
            label: String::new(),
            dirty: true,
        }
    }

    pub fn api_ref(&self) -> Result<ApiRef, CoreError> { ApiRef::parse(&self.spec.api_ver) }

    pub fn is_namespace(&self) -> bool { is_namespace_api(&self.spec.api_ver) }

    pub fn content_hash(&self) -> ContentHash { ContentHash::of(&self.spec.api_ver, &self.cr) }

    pub fn set_cr(&mut self, cr: impl Into<String>) {
        self.cr = cr.into();
        self.dirty = true;
    }

    /// `metadata.name` of the document, when it parses and carries one.
    pub fn metadata_name(&self) -> Option<String> {
        let v: serde_yaml::Value = serde_yaml::from_str(&self.cr).ok()?;
        v.get("metadata")?.get("name")?.as_str().map(|s| s.to_string())
    }

    /// `metadata.namespace` of the document, if any.
    pub fn metadata_namespace(&self) -> Option<String> {
        let v: serde_yaml::Value = serde_yaml::from_str(&self.cr).ok()?;
        v.get("metadata")?.get("namespace")?.as_str().map(|s| s.to_string())
    }
}

/// SHA-256 over api version and document text, hex encoded.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(transparent)]
pub struct ContentHash(pub String);

impl ContentHash {
    pub fn of(api_ver: &str, cr: &str) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(api_ver.as_bytes());
        hasher.update(b"\n");
        hasher.update(cr.as_bytes());
        Self(hex::encode(hasher.finalize()))
    }
}

impl fmt::Display for ContentHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result { f.write_str(&self.0) }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Property {
    pub key: String,
    pub value: String,
}

/// Collection metadata: description, free-form attributes and ordered properties.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Configuration {
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
    #[serde(default)]
    pub properties: Vec<Property>,
}

impl Configuration {
    pub fn with_description(description: impl Into<String>) -> Self {
        Self { description: description.into(), ..Default::default() }
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.properties.iter().find(|p| p.key == key).map(|p| p.value.as_str())
    }

    /// Insert or overwrite; new keys keep insertion order.
    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.properties.iter_mut().find(|p| p.key == key) {
            Some(p) => p.value = value,
            None => self.properties.push(Property { key, value }),
        }
    }

    pub fn default_namespace(&self) -> Option<&str> {
        self.get(NAMESPACE_PROPERTY).filter(|s| !s.is_empty())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ActionKind {
    Create,
    Update,
    Delete,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self { ActionKind::Create => "create", ActionKind::Update => "update", ActionKind::Delete => "delete" };
        f.write_str(s)
    }
}

/// A classified resource ready to be handed to the cluster collaborator.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeployAction {
    pub id: NodeId,
    pub api_ver: String,
    /// Resource name in the repository (file stem).
    pub name: String,
    pub cr: String,
    pub hash: ContentHash,
    /// Namespace requested by the repository; the cluster may resolve a different one.
    pub namespace: Option<String>,
    pub kind: ActionKind,
    /// Depth-first position in the flattened tree; secondary ordering key.
    pub seq: usize,
    /// Copy left in the namespace the resource was last applied in; deleted first.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stale: Option<Box<DeployAction>>,
}

impl DeployAction {
    pub fn is_namespace(&self) -> bool { is_namespace_api(&self.api_ver) }
}
