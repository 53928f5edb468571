use std::collections::BTreeMap;

use korral_core::{DeployAction, NodeId};

/// Apply order for a classified action set.
///
/// Namespace resources fill the result from the front and everything else from
/// the back, so every namespace precedes every non-namespace resource. Inside
/// each group actions keep their flatten sequence, then id.
pub fn process_deploy_order(actions: &BTreeMap<NodeId, DeployAction>) -> Vec<NodeId> {
    let mut namespaces: Vec<&DeployAction> = Vec::new();
    let mut rest: Vec<&DeployAction> = Vec::new();
    for a in actions.values() {
        if a.is_namespace() { namespaces.push(a) } else { rest.push(a) }
    }
    let key = |a: &&DeployAction| (a.seq, a.id.clone());
    namespaces.sort_by_key(key);
    rest.sort_by_key(key);

    let n = actions.len();
    let mut out: Vec<Option<NodeId>> = vec![None; n];
    for (front, a) in namespaces.iter().enumerate() { out[front] = Some(a.id.clone()); }
    for (back, a) in rest.iter().rev().enumerate() { out[n - 1 - back] = Some(a.id.clone()); }
    out.into_iter().flatten().collect()
}

/// Reverse of the apply order: namespaces are deleted last.
pub fn undeploy_order(actions: &BTreeMap<NodeId, DeployAction>) -> Vec<NodeId> {
    let mut order = process_deploy_order(actions);
    order.reverse();
    order
}

#[cfg(test)]
mod tests {
    use super::*;
    use korral_core::{ActionKind, ContentHash};

    fn action(id: &str, api_ver: &str, seq: usize) -> (NodeId, DeployAction) {
        let a = DeployAction {
            id: NodeId::from(id),
            api_ver: api_ver.into(),
            name: id.into(),
            cr: String::new(),
            hash: ContentHash::of(api_ver, ""),
            namespace: None,
            kind: ActionKind::Create,
            seq,
            stale: None,
        };
        (a.id.clone(), a)
    }

    #[test]
    fn namespace_goes_first() {
        let actions: BTreeMap<_, _> =
            [action("r1", "v1/pods", 0), action("r2", "v1/secrets", 1), action("ns1", "v1/namespaces", 2)].into_iter().collect();
        let order = process_deploy_order(&actions);
        assert_eq!(order.len(), 3);
        assert_eq!(order[0], NodeId::from("ns1"));
        let tail: Vec<&str> = order[1..].iter().map(|i| i.as_str()).collect();
        assert!(tail.contains(&"r1") && tail.contains(&"r2"));
    }

    #[test]
    fn order_is_deterministic_by_sequence() {
        let actions: BTreeMap<_, _> = [
            action("z", "apps/v1/deployments", 0),
            action("a", "v1/configmaps", 3),
            action("ns-b", "v1/namespaces", 5),
            action("ns-a", "v1/namespaces", 4),
            action("m", "v1/services", 1),
        ]
        .into_iter()
        .collect();
        let ids: Vec<String> = process_deploy_order(&actions).into_iter().map(|i| i.to_string()).collect();
        assert_eq!(ids, vec!["ns-a", "ns-b", "z", "m", "a"]);
        let rev: Vec<String> = undeploy_order(&actions).into_iter().map(|i| i.to_string()).collect();
        assert_eq!(rev, vec!["a", "m", "z", "ns-b", "ns-a"]);
    }

    #[test]
    fn grouped_namespaces_are_not_cluster_namespaces() {
        let actions: BTreeMap<_, _> = [action("x", "example.io/v1/namespaces", 0), action("p", "v1/pods", 1)].into_iter().collect();
        let ids: Vec<String> = process_deploy_order(&actions).into_iter().map(|i| i.to_string()).collect();
        assert_eq!(ids, vec!["x", "p"]);
        assert!(process_deploy_order(&BTreeMap::new()).is_empty());
    }
}
