#![forbid(unsafe_code)]

use std::collections::BTreeSet;
use std::fs;
use std::path::Path;

use korral_core::{NodeId, ResourceInstance};
use korral_repo::{RepoError, ReorderOp, Repository, DESCRIPTION_FILE};
use proptest::prelude::*;
use tempfile::TempDir;

fn cm(name: &str) -> ResourceInstance {
    ResourceInstance::new("v1/configmaps", format!("apiVersion: v1\nkind: ConfigMap\nmetadata:\n  name: {}\n", name))
}

fn bag_names(repo: &Repository, coll: &NodeId) -> Vec<String> {
    repo.collection(coll).unwrap().bag.iter().map(|r| r.name.clone()).collect()
}

fn bag_orders(repo: &Repository, coll: &NodeId) -> Vec<usize> {
    repo.collection(coll).unwrap().bag.iter().map(|r| r.order()).collect()
}

fn assert_reachable_matches_index(repo: &Repository) {
    let reachable: Vec<NodeId> = repo.reachable_ids();
    let unique: BTreeSet<NodeId> = reachable.iter().cloned().collect();
    assert_eq!(unique.len(), reachable.len(), "an id is reachable from more than one place");
    let indexed: BTreeSet<NodeId> = repo.index().ids().cloned().collect();
    assert_eq!(unique, indexed);
}

fn populated(dir: &Path) -> (Repository, NodeId, NodeId) {
    let mut repo = Repository::open([dir]).unwrap();
    let root = repo.roots()[0].clone();
    let apps = repo.add_collection(&root, "apps").unwrap();
    repo.add_resource(&apps, "a", cm("a")).unwrap();
    repo.add_resource(&apps, "b", cm("b")).unwrap();
    repo.add_resource(&apps, "c", cm("c")).unwrap();
    (repo, root, apps)
}

#[test]
fn index_tracks_reachable_nodes_through_adds_and_removes() {
    let tmp = TempDir::new().unwrap();
    let (mut repo, root, apps) = populated(tmp.path());
    let tools = repo.add_collection(&root, "tools").unwrap();
    let nested = repo.add_collection(&tools, "nested").unwrap();
    repo.add_resource(&nested, "deep", cm("deep")).unwrap();
    assert_reachable_matches_index(&repo);

    let b = repo.collection(&apps).unwrap().bag.find_by_name("b").unwrap().id().clone();
    repo.remove(&b).unwrap();
    assert!(repo.lookup(&b).is_none());
    assert_reachable_matches_index(&repo);

    repo.remove(&tools).unwrap();
    assert!(repo.lookup(&nested).is_none());
    assert!(!tmp.path().join("tools").exists());
    assert_reachable_matches_index(&repo);
}

#[test]
fn removing_a_resource_closes_the_gap_on_disk() {
    let tmp = TempDir::new().unwrap();
    let (mut repo, _root, apps) = populated(tmp.path());
    let a = repo.collection(&apps).unwrap().bag.find_by_name("a").unwrap().id().clone();
    repo.remove(&a).unwrap();
    assert!(!tmp.path().join("apps/a.yaml").exists());
    assert_eq!(bag_names(&repo, &apps), vec!["b", "c"]);
    assert_eq!(bag_orders(&repo, &apps), vec![0, 1]);

    let reopened = Repository::open([tmp.path()]).unwrap();
    assert_eq!(bag_orders(&reopened, &apps), vec![0, 1]);
    assert_eq!(bag_names(&reopened, &apps), vec!["b", "c"]);
}

#[test]
fn duplicate_names_and_bad_kinds_are_rejected() {
    let tmp = TempDir::new().unwrap();
    let (mut repo, root, apps) = populated(tmp.path());
    assert!(matches!(repo.add_collection(&root, "apps"), Err(RepoError::Validation(_))));
    assert!(matches!(repo.add_resource(&apps, "a", cm("again")), Err(RepoError::Validation(_))));
    let bad = ResourceInstance::new("pods", "kind: Pod\n");
    let err = repo.add_resource(&apps, "bad", bad).unwrap_err();
    assert!(err.to_string().contains("unsupported API kind"));
    assert_eq!(repo.collection(&apps).unwrap().bag.len(), 3);
}

#[test]
fn export_and_reload_round_trip() {
    let tmp = TempDir::new().unwrap();
    let out = TempDir::new().unwrap();
    let (mut repo, root, apps) = populated(tmp.path().join("src").as_path());
    repo.add_collection(&apps, "child").unwrap();

    let export = out.path().join("copy");
    repo.save(&root, Some(&export), true).unwrap();
    let copy = Repository::open([&export]).unwrap();

    let ids = |r: &Repository| r.index().ids().cloned().collect::<BTreeSet<_>>();
    assert_eq!(ids(&repo), ids(&copy));
    for id in repo.index().ids() {
        let (a, b) = (repo.lookup(id).unwrap(), copy.lookup(id).unwrap());
        assert_eq!(a.name(), b.name());
        if let (Some(ra), Some(rb)) = (a.as_resource(), b.as_resource()) {
            assert_eq!(ra.instance().cr, rb.instance().cr);
            assert_eq!(ra.order(), rb.order());
        }
    }
    assert!(copy.collection(&apps).unwrap().path.starts_with(&export));
}

#[test]
fn description_id_is_canonical() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join(DESCRIPTION_FILE), "id: canonical-root\nname: fixed\ndescription: pinned\n").unwrap();
    let repo = Repository::open([tmp.path()]).unwrap();
    assert_eq!(repo.roots(), &[NodeId::from("canonical-root")]);
    let root = repo.collection(&NodeId::from("canonical-root")).unwrap();
    assert_eq!(root.name, "fixed");
    assert_eq!(root.configuration.description, "pinned");
}

#[test]
fn missing_description_is_synthesized_on_load() {
    let tmp = TempDir::new().unwrap();
    let dir = tmp.path().join("loose");
    fs::create_dir_all(&dir).unwrap();
    fs::write(
        dir.join("settings.yaml"),
        "id: res-1\nspec:\n  apiVer: v1/configmaps\ncr: |\n  apiVersion: v1\n  kind: ConfigMap\n  metadata:\n    name: settings\norder: 0\n",
    )
    .unwrap();
    assert!(!dir.join(DESCRIPTION_FILE).exists());

    let repo = Repository::open([&dir]).unwrap();
    assert!(dir.join(DESCRIPTION_FILE).exists());
    let node = repo.resource(&NodeId::from("res-1")).unwrap();
    assert_eq!(node.name, "settings");
    assert!(node.instance().spec.loaded);
    assert!(!node.instance().spec.schema.is_empty());

    // a second open keeps the id that was written the first time
    let again = Repository::open([&dir]).unwrap();
    assert_eq!(again.roots(), repo.roots());
}

#[test]
fn corrupt_description_fails_reload_and_drops_the_node() {
    let tmp = TempDir::new().unwrap();
    let (mut repo, root, apps) = populated(tmp.path());
    let desc = tmp.path().join("apps").join(DESCRIPTION_FILE);
    let mut text = fs::read_to_string(&desc).unwrap();
    text.push_str("\n@@@ [[[ not yaml\n");
    fs::write(&desc, text).unwrap();

    let err = repo.reload(&apps).unwrap_err();
    assert!(matches!(err, RepoError::Yaml { .. }));
    assert!(repo.lookup(&apps).is_none());
    assert!(repo.collection(&root).unwrap().children.is_empty());
    assert_reachable_matches_index(&repo);
}

#[test]
fn malformed_resource_file_aborts_the_load() {
    let tmp = TempDir::new().unwrap();
    let (mut repo, _root, apps) = populated(tmp.path());
    let path = tmp.path().join("apps/a.yaml");
    let mut text = fs::read_to_string(&path).unwrap();
    text.push_str("\n@@@ [[[ not yaml\n");
    fs::write(&path, text).unwrap();

    let err = Repository::open([tmp.path()]).unwrap_err();
    assert!(matches!(err, RepoError::Yaml { ref path, .. } if path.ends_with("a.yaml")));

    let err = repo.reload(&apps).unwrap_err();
    assert!(matches!(err, RepoError::Yaml { .. }));
    assert!(repo.lookup(&apps).is_none());
    assert_reachable_matches_index(&repo);
}

#[test]
fn reload_under_a_new_description_id_forgets_deleted_files() {
    let tmp = TempDir::new().unwrap();
    let (mut repo, root, apps) = populated(tmp.path());
    let a = repo.collection(&apps).unwrap().bag.find_by_name("a").unwrap().id().clone();
    let b = repo.collection(&apps).unwrap().bag.find_by_name("b").unwrap().id().clone();
    let desc = tmp.path().join("apps").join(DESCRIPTION_FILE);
    let text = fs::read_to_string(&desc).unwrap().replace(apps.as_str(), "renamed-apps");
    fs::write(&desc, text).unwrap();
    fs::remove_file(tmp.path().join("apps/a.yaml")).unwrap();

    let renamed = repo.reload(&apps).unwrap();
    assert_eq!(renamed, NodeId::from("renamed-apps"));
    assert!(repo.lookup(&apps).is_none());
    assert!(!repo.index().contains(&a));
    assert_eq!(repo.resource(&b).unwrap().owner, renamed);
    assert_eq!(bag_names(&repo, &renamed), vec!["b", "c"]);
    assert_eq!(bag_orders(&repo, &renamed), vec![0, 1]);
    assert_eq!(repo.collection(&root).unwrap().children, vec![renamed.clone()]);
    assert_reachable_matches_index(&repo);
}

#[test]
fn reload_picks_up_external_edits() {
    let tmp = TempDir::new().unwrap();
    let (mut repo, _root, apps) = populated(tmp.path());
    let c = repo.collection(&apps).unwrap().bag.find_by_name("c").unwrap().id().clone();
    let path = tmp.path().join("apps/c.yaml");
    let edited = fs::read_to_string(&path).unwrap().replace("name: c", "name: c-edited");
    fs::write(&path, edited).unwrap();
    repo.reload(&c).unwrap();
    assert!(repo.resource(&c).unwrap().instance().cr.contains("c-edited"));

    fs::write(tmp.path().join("apps/d.yaml"), "id: dropped-in\nspec:\n  apiVer: v1/secrets\ncr: \"kind: Secret\"\norder: 7\n").unwrap();
    repo.reload(&apps).unwrap();
    assert_eq!(bag_names(&repo, &apps), vec!["a", "b", "c", "d"]);
    assert_eq!(bag_orders(&repo, &apps), vec![0, 1, 2, 3]);
    assert_reachable_matches_index(&repo);
}

#[test]
fn reorder_persists_and_restores_the_loaded_order() {
    let tmp = TempDir::new().unwrap();
    let (mut repo, _root, apps) = populated(tmp.path());
    repo.reload(&apps).unwrap();
    let ids = repo.collection(&apps).unwrap().bag.ids();

    assert!(repo.reorder(&apps, &ReorderOp::ToTop(ids[2].clone())).unwrap());
    assert_eq!(bag_names(&repo, &apps), vec!["c", "a", "b"]);
    let orders: Vec<usize> = ids.iter().map(|id| repo.resource(id).unwrap().order()).collect();
    assert_eq!(orders, vec![1, 2, 0]);

    let reopened = Repository::open([tmp.path()]).unwrap();
    assert_eq!(bag_names(&reopened, &apps), vec!["c", "a", "b"]);

    assert!(repo.reorder(&apps, &ReorderOp::RestoreOriginal).unwrap());
    assert_eq!(bag_names(&repo, &apps), vec!["a", "b", "c"]);
    assert!(!repo.reorder(&apps, &ReorderOp::Up(ids[0].clone())).unwrap());

    let reopened = Repository::open([tmp.path()]).unwrap();
    assert_eq!(bag_names(&reopened, &apps), vec!["a", "b", "c"]);
    assert_eq!(bag_orders(&reopened, &apps), vec![0, 1, 2]);
}

#[test]
fn restore_original_survives_reopening_the_repository() {
    let tmp = TempDir::new().unwrap();
    let (repo, _root, apps) = populated(tmp.path());
    drop(repo);

    let mut first = Repository::open([tmp.path()]).unwrap();
    let ids = first.collection(&apps).unwrap().bag.ids();
    assert!(first.reorder(&apps, &ReorderOp::ToBottom(ids[0].clone())).unwrap());
    assert_eq!(bag_names(&first, &apps), vec!["b", "c", "a"]);

    let mut second = Repository::open([tmp.path()]).unwrap();
    assert!(second.collection(&apps).unwrap().bag.is_pinned());
    assert!(second.reorder(&apps, &ReorderOp::Up(ids[2].clone())).unwrap());
    assert_eq!(bag_names(&second, &apps), vec!["c", "b", "a"]);

    let mut third = Repository::open([tmp.path()]).unwrap();
    assert!(third.reorder(&apps, &ReorderOp::RestoreOriginal).unwrap());
    assert_eq!(bag_names(&third, &apps), vec!["a", "b", "c"]);
    let desc = fs::read_to_string(tmp.path().join("apps").join(DESCRIPTION_FILE)).unwrap();
    assert!(!desc.contains("originalOrder"));

    let fourth = Repository::open([tmp.path()]).unwrap();
    assert_eq!(bag_names(&fourth, &apps), vec!["a", "b", "c"]);
    assert!(!fourth.collection(&apps).unwrap().bag.is_pinned());
}

#[test]
fn clone_for_input_is_isolated_from_the_live_tree() {
    let tmp = TempDir::new().unwrap();
    let (mut repo, root, apps) = populated(tmp.path());
    let a = repo.collection(&apps).unwrap().bag.find_by_name("a").unwrap().id().clone();

    let mut clone = repo.clone_for_input(&apps).unwrap();
    assert_eq!(clone.roots(), &[apps.clone()]);
    assert!(clone.collection(&apps).unwrap().parent_id.is_none());
    assert!(clone.lookup(&root).is_none());
    assert!(clone.resource(&a).unwrap().shares_instance_with(repo.resource(&a).unwrap()));

    clone.resource_mut(&a).unwrap().instance_mut().set_cr("kind: ConfigMap\nmetadata:\n  name: scratch\n");
    assert!(!clone.resource(&a).unwrap().shares_instance_with(repo.resource(&a).unwrap()));
    assert!(repo.resource(&a).unwrap().instance().cr.contains("name: a"));

    repo.add_resource(&apps, "late", cm("late")).unwrap();
    assert_eq!(clone.collection(&apps).unwrap().bag.len(), 3);
}

#[test]
fn namespace_comes_from_the_nearest_collection() {
    let tmp = TempDir::new().unwrap();
    let (mut repo, root, apps) = populated(tmp.path());
    let a = repo.collection(&apps).unwrap().bag.find_by_name("a").unwrap().id().clone();
    assert_eq!(repo.namespace_for(&a).unwrap(), None);

    let mut cfg = repo.collection(&root).unwrap().configuration.clone();
    cfg.set("namespace", "outer");
    repo.update_configuration(&root, cfg).unwrap();
    assert_eq!(repo.namespace_for(&a).unwrap().as_deref(), Some("outer"));

    let mut cfg = repo.collection(&apps).unwrap().configuration.clone();
    cfg.set("namespace", "inner");
    repo.update_configuration(&apps, cfg).unwrap();
    assert_eq!(repo.namespace_for(&a).unwrap().as_deref(), Some("inner"));
    assert_eq!(repo.root_of(&a).unwrap(), root);
}

#[derive(Debug, Clone)]
enum Edit {
    Add,
    Remove(usize),
    Move(u8, usize),
    Restore,
    Reload,
}

fn edit() -> impl Strategy<Value = Edit> {
    prop_oneof![
        Just(Edit::Add),
        any::<usize>().prop_map(Edit::Remove),
        (0u8..4, any::<usize>()).prop_map(|(k, i)| Edit::Move(k, i)),
        Just(Edit::Restore),
        Just(Edit::Reload),
    ]
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn orders_stay_contiguous_under_any_edit_sequence(edits in prop::collection::vec(edit(), 1..20)) {
        let tmp = TempDir::new().unwrap();
        let (mut repo, _root, apps) = populated(tmp.path());
        let mut next = 0;
        for e in edits {
            let ids = repo.collection(&apps).unwrap().bag.ids();
            match e {
                Edit::Add => {
                    let name = format!("r{}", next);
                    next += 1;
                    repo.add_resource(&apps, &name, cm(&name)).unwrap();
                }
                Edit::Remove(i) if !ids.is_empty() => repo.remove(&ids[i % ids.len()]).unwrap(),
                Edit::Move(kind, i) if !ids.is_empty() => {
                    let id = ids[i % ids.len()].clone();
                    let op = match kind {
                        0 => ReorderOp::ToTop(id),
                        1 => ReorderOp::ToBottom(id),
                        2 => ReorderOp::Up(id),
                        _ => ReorderOp::Down(id),
                    };
                    repo.reorder(&apps, &op).unwrap();
                }
                Edit::Restore => { repo.reorder(&apps, &ReorderOp::RestoreOriginal).unwrap(); }
                Edit::Reload => { repo.reload(&apps).unwrap(); }
                _ => {}
            }
            let n = repo.collection(&apps).unwrap().bag.len();
            prop_assert_eq!(bag_orders(&repo, &apps), (0..n).collect::<Vec<_>>());
            assert_reachable_matches_index(&repo);
            let reopened = Repository::open([tmp.path()]).unwrap();
            prop_assert_eq!(bag_names(&reopened, &apps), bag_names(&repo, &apps));
        }
    }
}
