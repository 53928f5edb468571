//! Korral kubehub: the cluster-access collaborator. Applies and deletes single
//! documents via server-side apply and lists served API kinds via discovery.

#![forbid(unsafe_code)]

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use metrics::{counter, histogram};
use serde::{Deserialize, Serialize};
use serde_json::Value as Json;
use sha2::{Digest, Sha256};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use korral_core::{ActionKind, ApiRef, DeployAction};
use kube::{
    api::{Api, DeleteParams, Patch, PatchParams},
    core::{ApiResource, DynamicObject},
    discovery::{Discovery, Scope},
    Client,
};

/// Field manager used for server-side apply.
pub const FIELD_MANAGER: &str = "korral";
const FALLBACK_NAMESPACE: &str = "default";

/// One served API kind.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiKind {
    pub group: String,
    pub version: String,
    pub kind: String,
    pub plural: String,
    pub namespaced: bool,
}

impl ApiKind {
    /// Key in the repository's `apiVer` form: `v1/pods` or `apps/v1/deployments`.
    pub fn api_ver(&self) -> String {
        if self.group.is_empty() {
            format!("{}/{}", self.version, self.plural)
        } else {
            format!("{}/{}/{}", self.group, self.version, self.plural)
        }
    }
}

/// What the deploy engine needs from a cluster.
#[async_trait]
pub trait ClusterAccess: Send + Sync {
    /// Stable short identity of the cluster; keys the per-cluster deploy registry.
    fn identity(&self) -> &str;
    /// Apply or delete one document. Returns the namespace actually used
    /// (empty for cluster-scoped kinds).
    async fn deploy(&self, action: &DeployAction, target_namespace: Option<&str>) -> Result<String>;
    async fn fetch_all_api_kinds(&self, force_refresh: bool) -> Result<Vec<ApiKind>>;
}

/// Short identity derived from the API server URL.
pub fn cluster_identity(server: &str) -> String {
    let digest = Sha256::digest(server.trim_end_matches('/').as_bytes());
    hex::encode(&digest[..6])
}

/// Cluster reached through the ambient kubeconfig.
pub struct KubeCluster {
    client: Client,
    server: String,
    identity: String,
    default_namespace: String,
    discovered: Mutex<Option<Vec<(ApiResource, bool)>>>,
}

impl KubeCluster {
    pub async fn connect() -> Result<Self> {
        let config = kube::Config::infer().await.context("loading kubeconfig")?;
        let server = config.cluster_url.to_string();
        let default_namespace = config.default_namespace.clone();
        let client = Client::try_from(config).context("building kube client")?;
        let identity = cluster_identity(&server);
        info!(server = %server, identity = %identity, "kube: connected");
        Ok(Self { client, server, identity, default_namespace, discovered: Mutex::new(None) })
    }

    pub fn server(&self) -> &str { &self.server }
    pub fn default_namespace(&self) -> &str { &self.default_namespace }

    async fn resources(&self, force_refresh: bool) -> Result<Vec<(ApiResource, bool)>> {
        let mut guard = self.discovered.lock().await;
        if force_refresh || guard.is_none() {
            let t0 = std::time::Instant::now();
            let discovery = Discovery::new(self.client.clone()).run().await.context("running discovery")?;
            let mut out = Vec::new();
            for group in discovery.groups() {
                for (ar, caps) in group.recommended_resources() {
                    out.push((ar.clone(), matches!(caps.scope, Scope::Namespaced)));
                }
            }
            histogram!("kube_discovery_ms", t0.elapsed().as_secs_f64() * 1000.0);
            debug!(kinds = out.len(), took_ms = %t0.elapsed().as_millis(), "kube: discovery refreshed");
            *guard = Some(out);
        }
        Ok(guard.clone().unwrap_or_default())
    }

    async fn find_api_resource(&self, api: &ApiRef) -> Result<(ApiResource, bool)> {
        let found = |list: &[(ApiResource, bool)]| {
            list.iter()
                .find(|(ar, _)| ar.group == api.group && ar.version == api.version && ar.plural == api.resource)
                .cloned()
        };
        if let Some(hit) = found(&self.resources(false).await?) {
            return Ok(hit);
        }
        // CRDs installed since the last discovery run
        found(&self.resources(true).await?).ok_or_else(|| anyhow!("API kind not served: {}", api.key()))
    }

    async fn apply(&self, api: &Api<DynamicObject>, name: &str, doc: &Json) -> Result<()> {
        let pp = PatchParams::apply(FIELD_MANAGER);
        match api.patch(name, &pp, &Patch::Apply(doc)).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 409 => {
                warn!(name, reason = %ae.reason, "kube: apply conflict; retrying with force");
                counter!("kube_apply_conflict_retry", 1u64);
                let pp = PatchParams::apply(FIELD_MANAGER).force();
                api.patch(name, &pp, &Patch::Apply(doc)).await.map(|_| ()).map_err(|e| anyhow!("server-side apply failed: {}", e))
            }
            Err(e) => Err(anyhow!("server-side apply failed: {}", e)),
        }
    }
}

#[async_trait]
impl ClusterAccess for KubeCluster {
    fn identity(&self) -> &str { &self.identity }

    async fn deploy(&self, action: &DeployAction, target_namespace: Option<&str>) -> Result<String> {
        let t0 = std::time::Instant::now();
        let api_ref = ApiRef::parse(&action.api_ver)?;
        let (ar, namespaced) = self.find_api_resource(&api_ref).await?;
        let target = Target::prepare(action, &ar, namespaced, target_namespace, &self.default_namespace)?;
        let api: Api<DynamicObject> = if namespaced {
            Api::namespaced_with(self.client.clone(), &target.namespace, &ar)
        } else {
            Api::all_with(self.client.clone(), &ar)
        };
        let res = match action.kind {
            ActionKind::Create | ActionKind::Update => self.apply(&api, &target.name, &target.doc).await,
            ActionKind::Delete => match api.delete(&target.name, &DeleteParams::default()).await {
                Ok(_) => Ok(()),
                Err(kube::Error::Api(ae)) if ae.code == 404 => {
                    debug!(name = %target.name, "kube: already gone");
                    Ok(())
                }
                Err(e) => Err(anyhow!("delete failed: {}", e)),
            },
        };
        histogram!("kube_deploy_ms", t0.elapsed().as_secs_f64() * 1000.0);
        match res {
            Ok(()) => {
                counter!("kube_deploy_ok", 1u64);
                info!(kind = %action.kind, api = %action.api_ver, name = %target.name, ns = %target.namespace, "kube: action applied");
                Ok(target.namespace)
            }
            Err(e) => {
                counter!("kube_deploy_err", 1u64);
                Err(e.context(format!("{} {} {}", action.kind, action.api_ver, target.name)))
            }
        }
    }

    async fn fetch_all_api_kinds(&self, force_refresh: bool) -> Result<Vec<ApiKind>> {
        let mut out: Vec<ApiKind> = self
            .resources(force_refresh)
            .await?
            .into_iter()
            .map(|(ar, namespaced)| ApiKind { group: ar.group, version: ar.version, kind: ar.kind, plural: ar.plural, namespaced })
            .collect();
        out.sort_by(|a, b| a.group.cmp(&b.group).then(a.version.cmp(&b.version)).then(a.kind.cmp(&b.kind)));
        Ok(out)
    }
}

/// Document ready to send, with its resolved name and namespace.
#[derive(Debug, Clone)]
struct Target {
    doc: Json,
    name: String,
    namespace: String,
}

impl Target {
    /// Namespaced kinds use the target namespace, then the document's own, then `fallback`.
    /// Cluster-scoped kinds resolve to an empty namespace and lose any `metadata.namespace`.
    fn prepare(action: &DeployAction, ar: &ApiResource, namespaced: bool, target_namespace: Option<&str>, fallback: &str) -> Result<Self> {
        let val: serde_yaml::Value = serde_yaml::from_str(&action.cr).context("parsing document YAML")?;
        let mut doc = serde_json::to_value(val).context("converting YAML to JSON")?;
        let obj = doc.as_object_mut().ok_or_else(|| anyhow!("document is not a mapping"))?;
        obj.entry("apiVersion").or_insert_with(|| Json::String(ar.api_version.clone()));
        obj.entry("kind").or_insert_with(|| Json::String(ar.kind.clone()));
        let meta = obj
            .entry("metadata")
            .or_insert_with(|| Json::Object(serde_json::Map::new()))
            .as_object_mut()
            .ok_or_else(|| anyhow!("metadata is not a mapping"))?;
        meta.remove("managedFields");
        meta.remove("resourceVersion");
        let name = meta
            .get("name")
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .filter(|s| !s.is_empty())
            .unwrap_or_else(|| action.name.clone());
        if name.is_empty() {
            return Err(anyhow!("document has no metadata.name"));
        }
        meta.insert("name".into(), Json::String(name.clone()));
        let namespace = if namespaced {
            let doc_ns = meta.get("namespace").and_then(|v| v.as_str()).filter(|s| !s.is_empty()).map(str::to_string);
            let ns = target_namespace
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .or(doc_ns)
                .unwrap_or_else(|| if fallback.is_empty() { FALLBACK_NAMESPACE } else { fallback }.to_string());
            meta.insert("namespace".into(), Json::String(ns.clone()));
            ns
        } else {
            meta.remove("namespace");
            String::new()
        };
        Ok(Self { doc, name, namespace })
    }
}
