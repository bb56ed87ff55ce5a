#![forbid(unsafe_code)]

use std::collections::BTreeMap;

use paas_core::model::{Buildable, HookSpec, Image, Volume, VolumeKind};
use paas_core::CompiledDeployment;

fn image(name: &str) -> Buildable {
    Buildable::Image(Image { name: name.into(), path: format!("/{}", name), tag: Some("1".into()), variables: BTreeMap::new(), registry: None })
}

fn names(cd: &CompiledDeployment) -> Vec<String> {
    let mut out = Vec::new();
    cd.for_each_buildable(|b| out.push(b.url()));
    out
}

#[test]
fn update_buildable_keeps_position() {
    for size in 2..6 {
        let cd = CompiledDeployment::new("v1", None, None);
        for i in 0..size { cd.add_buildable(image(&format!("img{}", i))).unwrap(); }
        let pushed = image("img1").with_registry("reg.local");
        cd.update_buildable("img1", pushed).unwrap();
        let got = names(&cd);
        assert_eq!(got.len(), size);
        assert_eq!(got[0], "img0");
        assert_eq!(got[1], "reg.local/img1");
        for (i, n) in got.iter().enumerate().skip(2) { assert_eq!(n, &format!("img{}", i)); }
    }
}

#[test]
fn update_unknown_buildable_is_not_found() {
    let cd = CompiledDeployment::new("v1", None, None);
    let err = cd.update_buildable("nope", image("x")).unwrap_err();
    assert_eq!(err.code(), 404);
}

#[test]
fn enumerating_while_adding_to_another_collection() {
    let cd = CompiledDeployment::new("v1", Some("demo".into()), Some("project".into()));
    cd.add_buildable(image("a")).unwrap();
    cd.add_buildable(image("b")).unwrap();
    cd.for_each_buildable(|b| {
        cd.add_hook(HookSpec { name: format!("hook-{}", b.name()), command: vec!["make".into()], timeout: None }).unwrap();
    });
    let mut hooks = Vec::new();
    cd.for_each_hook(|h| hooks.push(h.name.clone()));
    assert_eq!(hooks, vec!["hook-a", "hook-b"]);
    cd.with_job_settings(|version, prefix, project| {
        assert_eq!((version, prefix, project), ("v1", Some("demo"), Some("project")));
    });
}

#[test]
fn import_volume_clones_with_new_mount_path() {
    let cd = CompiledDeployment::new("v1", None, None);
    cd.add_volume(Volume { name: "extra".into(), mount_path: "/opt/extra".into(), kind: VolumeKind::Embedded { local_path: "/volumes/extra".into(), paths: vec!["vendor".into()], registry: None, tag: None } }).unwrap();
    let v = cd.import_volume("extra", "/srv/extra").unwrap();
    assert_eq!(v.mount_path, "/srv/extra");
    assert!(v.is_embedded());
    assert!(cd.import_volume("missing", "/x").is_err());
    let mut mounts = Vec::new();
    cd.for_each_volume(|v| mounts.push(v.mount_path.clone()));
    assert_eq!(mounts, vec!["/opt/extra"]);
}

#[test]
fn compile_defaults_bags_targets_cluster_scope() {
    let cd = CompiledDeployment::new("v1", None, None);
    cd.defaults().set("storage-provider", Some("nfs"));
    cd.compile_defaults_bags("eu", |bag| { bag.set("storage-provider", Some("ceph")); });
    let r = cd.defaults().get_reference("storage-provider").unwrap();
    assert_eq!(cd.defaults().get_bag_for("eu").resolve(&r).unwrap().as_deref(), Some("ceph"));
    assert_eq!(cd.defaults().get_bag_for("us").resolve(&r).unwrap().as_deref(), Some("nfs"));
}

#[test]
fn rejected_pods_show_in_the_summary() {
    let cd = CompiledDeployment::new("v1", None, None);
    assert!(cd.summary().rejected.is_empty());
    cd.reject_pod("big", "`cpu` requires 3 but only 2 remains");
    let summary = cd.summary();
    assert!(summary.pods.is_empty());
    assert_eq!(summary.rejected.len(), 1);
    assert_eq!(summary.rejected[0].name, "big");
    let json = serde_json::to_value(&summary).unwrap();
    assert_eq!(json["rejected"][0]["name"], "big");
}
