//! Korral schema: built-in fallback schemas keyed by API version.
//!
//! Resource files cache the schema text next to the document. On load the
//! cached text is refreshed from this table so that older files pick up the
//! current built-in definition; unknown API versions keep whatever they carry.

#![forbid(unsafe_code)]

use korral_core::{ApiRef, ResourceSpec};
use once_cell::sync::Lazy;
use rustc_hash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;

/// One built-in API kind.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct KindInfo {
    /// `apiVer` key, e.g. `apps/v1/deployments`.
    pub api_ver: String,
    pub kind: String,
    pub namespaced: bool,
    pub schema: String,
}

// (apiVer, Kind, namespaced, top-level fields besides metadata)
const BUILTIN: &[(&str, &str, bool, &[&str])] = &[
    ("v1/namespaces", "Namespace", false, &["spec"]),
    ("v1/configmaps", "ConfigMap", true, &["data", "binaryData", "immutable"]),
    ("v1/secrets", "Secret", true, &["data", "stringData", "type", "immutable"]),
    ("v1/pods", "Pod", true, &["spec"]),
    ("v1/services", "Service", true, &["spec"]),
    ("v1/serviceaccounts", "ServiceAccount", true, &["secrets", "imagePullSecrets", "automountServiceAccountToken"]),
    ("v1/persistentvolumeclaims", "PersistentVolumeClaim", true, &["spec"]),
    ("v1/persistentvolumes", "PersistentVolume", false, &["spec"]),
    ("apps/v1/deployments", "Deployment", true, &["spec"]),
    ("apps/v1/statefulsets", "StatefulSet", true, &["spec"]),
    ("apps/v1/daemonsets", "DaemonSet", true, &["spec"]),
    ("batch/v1/jobs", "Job", true, &["spec"]),
    ("batch/v1/cronjobs", "CronJob", true, &["spec"]),
    ("networking.k8s.io/v1/ingresses", "Ingress", true, &["spec"]),
    ("rbac.authorization.k8s.io/v1/roles", "Role", true, &["rules"]),
    ("rbac.authorization.k8s.io/v1/rolebindings", "RoleBinding", true, &["roleRef", "subjects"]),
    ("rbac.authorization.k8s.io/v1/clusterroles", "ClusterRole", false, &["rules", "aggregationRule"]),
    ("rbac.authorization.k8s.io/v1/clusterrolebindings", "ClusterRoleBinding", false, &["roleRef", "subjects"]),
];

fn schema_text(api_ver: &str, kind: &str, fields: &[&str]) -> String {
    let api_version = ApiRef::parse(api_ver).map(|r| r.api_version()).unwrap_or_default();
    let mut props = serde_json::Map::new();
    props.insert("apiVersion".into(), json!({ "type": "string", "enum": [api_version] }));
    props.insert("kind".into(), json!({ "type": "string", "enum": [kind] }));
    props.insert(
        "metadata".into(),
        json!({
            "type": "object",
            "required": ["name"],
            "properties": {
                "name": { "type": "string" },
                "namespace": { "type": "string" },
                "labels": { "type": "object", "additionalProperties": { "type": "string" } },
                "annotations": { "type": "object", "additionalProperties": { "type": "string" } }
            }
        }),
    );
    for f in fields {
        props.insert((*f).to_string(), json!({ "x-kubernetes-preserve-unknown-fields": true }));
    }
    let schema = json!({
        "type": "object",
        "required": ["apiVersion", "kind", "metadata"],
        "properties": props,
    });
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

static FALLBACK: Lazy<FxHashMap<&'static str, KindInfo>> = Lazy::new(|| {
    let mut m = FxHashMap::default();
    for (api_ver, kind, namespaced, fields) in BUILTIN {
        m.insert(
            *api_ver,
            KindInfo {
                api_ver: (*api_ver).to_string(),
                kind: (*kind).to_string(),
                namespaced: *namespaced,
                schema: schema_text(api_ver, kind, fields),
            },
        );
    }
    m
});

pub fn kind_info(api_ver: &str) -> Option<&'static KindInfo> { FALLBACK.get(api_ver) }

pub fn fallback_schema(api_ver: &str) -> Option<&'static str> { kind_info(api_ver).map(|k| k.schema.as_str()) }

/// All built-in kinds, sorted by `apiVer`.
pub fn builtin_kinds() -> Vec<&'static KindInfo> {
    let mut out: Vec<_> = FALLBACK.values().collect();
    out.sort_by(|a, b| a.api_ver.cmp(&b.api_ver));
    out
}

/// Refresh `schema`/`loaded` from the fallback table. Returns whether a schema was found.
pub fn resolve(spec: &mut ResourceSpec) -> bool {
    match fallback_schema(&spec.api_ver) {
        Some(s) => {
            spec.schema = s.to_string();
            spec.loaded = true;
            true
        }
        None => {
            spec.loaded = !spec.schema.is_empty();
            false
        }
    }
}

/// Minimal document for a new resource of a built-in kind.
pub fn skeleton(api_ver: &str, name: &str, namespace: Option<&str>) -> Option<String> {
    let info = kind_info(api_ver)?;
    let api_version = ApiRef::parse(api_ver).ok()?.api_version();
    let mut out = format!("apiVersion: {}\nkind: {}\nmetadata:\n  name: {}\n", api_version, info.kind, name);
    if info.namespaced {
        if let Some(ns) = namespace { out.push_str(&format!("  namespace: {}\n", ns)); }
    }
    Some(out)
}
