#![forbid(unsafe_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;

use paas_conductor::{Conductor, ConductorSettings, StaticFeatures};
use paas_core::model::{Buildable, VolumeKind};
use paas_core::{JobUnit, JobWorkspace, PaasError, PaasResult, Resolvable};

struct NoWorkspace;

impl JobWorkspace for NoWorkspace {
    fn path(&self) -> &Path { Path::new("/nowhere") }
    fn prepare(&self) -> PaasResult<()> { Ok(()) }
    fn read_file(&self, relative: &str) -> PaasResult<String> {
        Err(PaasError::not_found(format!("{} is not readable", relative)))
    }
    fn write_file(&self, relative: &str, _content: &str) -> PaasResult<PathBuf> { Ok(PathBuf::from(relative)) }
    fn clean(&self) -> PaasResult<()> { Ok(()) }
}

fn job(quotas: &str) -> Arc<JobUnit> {
    let raw = format!(
        r#"{{
            "id": "job-1",
            "project": {{"id": "p1", "name": "demo"}},
            "environment": "prod",
            "prefix": "demo",
            "source_repository": {{"url": "https://git.example/demo.git"}},
            "images_registry": {{"url": "registry.example"}},
            "clusters": [{{"name": "main", "type": "kubernetes", "address": "https://k8s.example",
                          "defaults": {{"ingress-provider": "nginx"}}}}],
            "variables": {{"SERVER": "demo.example"}},
            "quotas": {}
        }}"#,
        quotas
    );
    Arc::new(JobUnit::from_json(raw.as_bytes()).unwrap())
}

const MANIFEST: &str = r#"
paas:
  version: v1
  requires: [pods]
images:
  api:
    path: /api
volumes:
  static:
    mount-path: /srv/static
    add: [public]
pods:
  web:
    replicas: 2
    containers:
      api:
        image: api
        listen: [8080]
        resources:
          cpu: {require: 500m, limit: "1"}
        volumes:
          assets:
            from: static
            mount-path: /opt/static
  worker:
    containers:
      job:
        image: registry.example/worker
        version: "3.1"
        volumes:
          data:
            persistent: true
            mount-path: /data
services:
  web:
    ports:
      - listen: 80
        target: 8080
ingresses:
  public:
    host: ${SERVER}
    service: {name: web, port: 80}
"#;

async fn prepared(quotas: &str, manifest: &str) -> PaasResult<Conductor> {
    let mut conductor = Conductor::new(ConductorSettings::default());
    conductor.configure(job(quotas), Arc::new(NoWorkspace))?;
    conductor.prepare(manifest).await?;
    Ok(conductor)
}

#[tokio::test]
async fn compiles_a_full_manifest() {
    let conductor = prepared(r#"[{"type": "cpu", "capacity": "2"}]"#, MANIFEST).await.unwrap();
    let cd = conductor.compile_deployment(Some("nfs"), Some("1Gi"), None).unwrap();

    let summary = cd.summary();
    assert_eq!(summary.pods, vec!["web", "worker"]);
    assert_eq!(summary.buildables, vec!["api", "api-web-api"]);
    assert_eq!(summary.volumes, vec!["static", "data"]);
    assert_eq!(summary.prefix.as_deref(), Some("demo"));

    let mut embedded = None;
    cd.for_each_buildable(|b| {
        if let Buildable::Embedded(e) = b {
            embedded = Some(e.clone());
        }
    });
    let embedded = embedded.unwrap();
    assert_eq!(embedded.original_name, "api");
    assert_eq!(embedded.volumes[0].mount_path, "/opt/static");

    let mut seen = Vec::new();
    cd.for_each_pod(|pod, images, volumes| {
        let c = &pod.containers[0];
        let cpu = c.resources.get("cpu").unwrap();
        seen.push((pod.name.clone(), c.image.clone(), cpu.require.clone(), cpu.limit.clone()));
        if pod.name == "worker" {
            assert_eq!(c.volumes[0].name, "data");
            assert!(volumes["data"].is_persistent());
        } else {
            assert!(images.contains_key("api-web-api"));
            assert!(c.volumes.is_empty());
        }
    });
    // web reserves 2 x 500m, worker takes the remaining core.
    assert_eq!(
        seen,
        vec![
            ("web".to_string(), "api-web-api".to_string(), "500m".to_string(), "1".to_string()),
            ("worker".to_string(), "registry.example/worker".to_string(), "1".to_string(), "1".to_string()),
        ]
    );

    cd.for_each_volume(|v| {
        if let VolumeKind::Persistent { storage_identifier, .. } = &v.kind {
            assert_eq!(storage_identifier.resolve(cd.defaults()).unwrap().as_deref(), Some("nfs"));
        }
    });
    cd.for_each_ingress(|i| {
        assert_eq!(i.host, "demo.example");
        let provider = i.provider.as_ref().unwrap();
        assert!(matches!(provider, Resolvable::Deferred(_)));
        assert_eq!(provider.resolve(&cd.defaults().get_bag_for("main")).unwrap().as_deref(), Some("nginx"));
        assert_eq!(provider.resolve(cd.defaults()).unwrap(), None);
    });
}

#[tokio::test]
async fn unvalidated_requirements_are_listed() {
    let manifest = "paas:\n  version: v1\n  requires: [pods, gpu]\n";
    let err = prepared("[]", manifest).await.err().unwrap();
    assert_eq!(err.code(), 404);
    assert_eq!(err.to_string(), "`pods`,`gpu` not validated");
}

#[tokio::test]
async fn validators_can_honour_extra_features() {
    let mut settings = ConductorSettings::default();
    settings.validators.push(Arc::new(StaticFeatures(vec!["gpu".into()])));
    let mut conductor = Conductor::new(settings);
    conductor.configure(job("[]"), Arc::new(NoWorkspace)).unwrap();
    conductor.prepare("paas:\n  version: v1\n  requires: [gpu]\n").await.unwrap();
    let cd = conductor.compile_deployment(None, None, None).unwrap();
    assert!(cd.summary().pods.is_empty());
}

#[tokio::test]
async fn a_conductor_is_configured_once() {
    let mut conductor = Conductor::new(ConductorSettings::default());
    conductor.configure(job("[]"), Arc::new(NoWorkspace)).unwrap();
    let err = conductor.configure(job("[]"), Arc::new(NoWorkspace)).unwrap_err();
    assert!(matches!(err, PaasError::AlreadyConfigured(_)));
}

#[tokio::test]
async fn compiling_before_prepare_fails() {
    let mut conductor = Conductor::new(ConductorSettings::default());
    assert!(matches!(conductor.compile_deployment(None, None, None), Err(PaasError::NotConfigured(_))));
    conductor.configure(job("[]"), Arc::new(NoWorkspace)).unwrap();
    assert!(matches!(conductor.compile_deployment(None, None, None), Err(PaasError::NotConfigured(_))));
}

#[tokio::test]
async fn unsupported_version_is_rejected() {
    let err = prepared("[]", "paas:\n  version: v2\n").await.err().unwrap();
    assert_eq!(err.code(), 400);
}

#[tokio::test]
async fn over_quota_pod_is_left_out_and_others_still_compile() {
    let manifest = r#"
paas:
  version: v1
pods:
  big:
    containers:
      main:
        image: busybox
        resources:
          cpu: {require: "3"}
  small:
    containers:
      main:
        image: busybox
        resources:
          cpu: {require: 500m}
"#;
    let conductor = prepared(r#"[{"type": "cpu", "capacity": "2"}]"#, manifest).await.unwrap();
    let cd = conductor.compile_deployment(None, None, None).unwrap();

    let summary = cd.summary();
    assert_eq!(summary.pods, vec!["small"]);
    assert_eq!(summary.rejected.len(), 1);
    assert_eq!(summary.rejected[0].name, "big");
    assert!(summary.rejected[0].reason.contains("`cpu`"), "reason={}", summary.rejected[0].reason);

    cd.for_each_pod(|pod, _, _| {
        let cpu = pod.containers[0].resources.get("cpu").unwrap();
        assert_eq!(cpu.require, "500m");
    });
}

#[tokio::test]
async fn rejected_pod_leaves_no_volumes_or_images_behind() {
    let manifest = r#"
paas:
  version: v1
images:
  api:
    path: /api
volumes:
  static:
    mount-path: /srv/static
    add: [public]
pods:
  big:
    containers:
      api:
        image: api
        resources:
          cpu: {require: "3"}
        volumes:
          assets:
            from: static
            mount-path: /opt/static
          scratch:
            persistent: true
            mount-path: /scratch
  small:
    containers:
      main:
        image: busybox
        volumes:
          data:
            persistent: true
            mount-path: /data
"#;
    let conductor = prepared(r#"[{"type": "cpu", "capacity": "2"}]"#, manifest).await.unwrap();
    let cd = conductor.compile_deployment(Some("nfs"), Some("1Gi"), None).unwrap();

    let summary = cd.summary();
    assert_eq!(summary.pods, vec!["small"]);
    assert_eq!(summary.buildables, vec!["api"]);
    assert_eq!(summary.volumes, vec!["static", "data"]);
    assert_eq!(summary.rejected.iter().map(|r| r.name.as_str()).collect::<Vec<_>>(), vec!["big"]);
}

#[tokio::test]
async fn auto_sizing_over_a_hard_quota_rejects_the_pod() {
    let manifest = r#"
paas:
  version: v1
pods:
  greedy:
    containers:
      main:
        image: busybox
        resources:
          cpu: {require: "2"}
  idle:
    containers:
      main:
        image: busybox
"#;
    let conductor = prepared(r#"[{"type": "cpu", "capacity": "2"}]"#, manifest).await.unwrap();
    let cd = conductor.compile_deployment(None, None, None).unwrap();
    let summary = cd.summary();
    assert_eq!(summary.pods, vec!["greedy"]);
    assert_eq!(summary.rejected[0].name, "idle");
}

#[tokio::test]
async fn enumerators_follow_declaration_order() {
    let manifest = r#"
paas:
  version: v1
images:
  zeta:
    path: /zeta
  alpha:
    path: /alpha
volumes:
  v2:
    persistent: true
    mount-path: /v2
  v1:
    persistent: true
    mount-path: /v1
hooks:
  warmup:
    make: [warmup]
  assets:
    npm: [run, build]
pods:
  zz:
    containers:
      main:
        image: zeta
  aa:
    containers:
      main:
        image: alpha
services:
  s2:
    ports:
      - listen: 80
        target: 8080
  s1:
    ports:
      - listen: 81
        target: 8081
"#;
    let conductor = prepared("[]", manifest).await.unwrap();
    let cd = conductor.compile_deployment(Some("nfs"), Some("1Gi"), None).unwrap();

    let mut images = Vec::new();
    cd.for_each_buildable(|b| images.push(b.name().to_string()));
    assert_eq!(images, vec!["zeta", "alpha"]);

    let mut volumes = Vec::new();
    cd.for_each_volume(|v| volumes.push(v.name.clone()));
    assert_eq!(volumes, vec!["v2", "v1"]);

    let mut hooks = Vec::new();
    cd.for_each_hook(|h| hooks.push((h.name.clone(), h.command.join(" "))));
    assert_eq!(
        hooks,
        vec![("warmup".to_string(), "make warmup".to_string()), ("assets".to_string(), "npm run build".to_string())]
    );

    let mut pods = Vec::new();
    cd.for_each_pod(|pod, _, _| pods.push(pod.name.clone()));
    assert_eq!(pods, vec!["zz", "aa"]);

    let mut services = Vec::new();
    cd.for_each_service(|s| services.push(s.name.clone()));
    assert_eq!(services, vec!["s2", "s1"]);
}

#[tokio::test]
async fn soft_quota_degrades_instead_of_failing() {
    let manifest = r#"
paas:
  version: v1
pods:
  big:
    containers:
      main:
        image: busybox
        resources:
          cpu: {require: "3"}
"#;
    let conductor = prepared(r#"[{"type": "cpu", "capacity": "2", "is-soft": true}]"#, manifest).await.unwrap();
    let cd = conductor.compile_deployment(None, None, None).unwrap();
    assert_eq!(cd.summary().pods, vec!["big"]);
}

#[tokio::test]
async fn manifest_quotas_narrow_job_quotas() {
    let manifest = r#"
paas:
  version: v1
  quotas:
    - type: cpu
      capacity: "1"
pods:
  app:
    replicas: 3
    containers:
      main:
        image: busybox
"#;
    let conductor = prepared(r#"[{"type": "cpu", "capacity": "4"}]"#, manifest).await.unwrap();
    let cd = conductor.compile_deployment(None, None, None).unwrap();
    cd.for_each_pod(|pod, _, _| {
        let cpu = pod.containers[0].resources.get("cpu").unwrap();
        assert_eq!(cpu.require, "333m");
    });

    let widen = "paas:\n  version: v1\n  quotas:\n    - type: cpu\n      capacity: \"8\"\n";
    let conductor = prepared(r#"[{"type": "cpu", "capacity": "4"}]"#, widen).await.unwrap();
    assert!(matches!(conductor.compile_deployment(None, None, None), Err(PaasError::QuotasNotCompliant(_))));
}

#[tokio::test]
async fn unknown_imported_volume_is_not_found() {
    let manifest = r#"
paas:
  version: v1
pods:
  app:
    containers:
      main:
        image: busybox
        volumes:
          v:
            from: missing
            mount-path: /x
"#;
    let conductor = prepared("[]", manifest).await.unwrap();
    assert_eq!(conductor.compile_deployment(None, None, None).unwrap_err().code(), 404);
}
