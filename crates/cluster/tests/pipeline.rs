#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use paas_cluster::kubernetes::{default_transcribers, KubernetesDriver, KubernetesFactory};
use paas_cluster::{
    ClusterClients, ClusterReport, ConfigurableCluster, Directory, Driver, DriverConfig, DriverFactory, MultiClusterClient,
    Phase, RecordingClusterApi, TranscribeContext, Transcriber, TranscriberCollection,
};
use paas_core::model::{Container, ContainerEnv, Ingress, Pod, Service, Transport, VolumeMount, Volume, VolumeKind};
use paas_core::{ClusterDefinition, CompiledDeployment, PaasError, PaasResult, Resolvable};

struct Step {
    name: &'static str,
    fails: bool,
    calls: Arc<Mutex<Vec<&'static str>>>,
}

#[async_trait::async_trait]
impl Transcriber for Step {
    fn name(&self) -> &'static str { self.name }
    fn phases(&self) -> &'static [Phase] { &[Phase::Deploy] }
    async fn transcribe(&self, _cd: &CompiledDeployment, _ctx: &TranscribeContext<'_>) -> PaasResult<Vec<String>> {
        self.calls.lock().unwrap().push(self.name);
        if self.fails {
            return Err(PaasError::execution(format!("{} failed", self.name), 500));
        }
        Ok(vec![format!("Thing/{}", self.name)])
    }
}

fn ctx<'a>(api: &'a RecordingClusterApi, cd: &CompiledDeployment) -> TranscribeContext<'a> {
    TranscribeContext {
        cluster_name: "main",
        namespace: "demo",
        parent_namespace: None,
        defaults: cd.defaults().get_bag_for("main"),
        api,
    }
}

#[tokio::test]
async fn failing_transcriber_stops_the_phase() {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let mut c = TranscriberCollection::new();
    for (name, fails) in [("a", false), ("b", true), ("c", false)] {
        c.add(Arc::new(Step { name, fails, calls: calls.clone() }));
    }
    let cd = CompiledDeployment::new("v1", None, None);
    let api = RecordingClusterApi::new();
    let err = c.run_phase(Phase::Deploy, &cd, &ctx(&api, &cd)).await.unwrap_err();
    assert_eq!(err.to_string(), "b failed");
    assert_eq!(*calls.lock().unwrap(), vec!["a", "b"]);

    assert!(c.run_phase(Phase::Expose, &cd, &ctx(&api, &cd)).await.unwrap().is_empty());
}

struct CountingFactory(AtomicUsize);

impl DriverFactory for CountingFactory {
    fn new_driver(&self, config: DriverConfig) -> PaasResult<Box<dyn Driver>> {
        self.0.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeDriver { name: config.cluster_name, delay_ms: 1, fails: false }))
    }
}

struct Untouchable;

impl ConfigurableCluster for Untouchable {
    fn cluster_type(&self) -> &str { "nomad" }
    fn configure_cluster(&self, _factory: &dyn DriverFactory) -> PaasResult<Box<dyn Driver>> {
        panic!("must not be configured")
    }
}

fn cluster(name: &str, kind: &str) -> ClusterDefinition {
    ClusterDefinition {
        name: name.into(),
        cluster_type: kind.into(),
        address: "https://k8s.example".into(),
        namespace: Some("demo".into()),
        use_hierarchical_namespaces: false,
        identity: None,
        defaults: BTreeMap::new(),
    }
}

#[test]
fn directory_miss_never_touches_the_cluster() {
    let dir = Directory::new();
    let err = dir.require("nomad", &Untouchable).err().unwrap();
    assert_eq!(err.code(), 500);
    assert_eq!(err.to_string(), "no available client for nomad");
}

#[test]
fn last_registration_wins() {
    let dir = Directory::new();
    let first = Arc::new(CountingFactory(AtomicUsize::new(0)));
    let second = Arc::new(CountingFactory(AtomicUsize::new(0)));
    dir.register("kubernetes", first.clone()).register("kubernetes", second.clone());
    let clients = dir.require_all(&[cluster("a", "kubernetes"), cluster("b", "kubernetes")]).unwrap();
    assert_eq!(clients.len(), 2);
    assert_eq!(first.0.load(Ordering::SeqCst), 0);
    assert_eq!(second.0.load(Ordering::SeqCst), 2);
}

struct FakeDriver {
    name: String,
    delay_ms: u64,
    fails: bool,
}

#[async_trait::async_trait]
impl Driver for FakeDriver {
    fn cluster_name(&self) -> &str { &self.name }
    async fn deploy(&self, _cd: &CompiledDeployment) -> PaasResult<ClusterReport> {
        tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        if self.fails {
            return Err(PaasError::execution(format!("{} is down", self.name), 503));
        }
        Ok(ClusterReport { cluster: self.name.clone(), transcribed: Vec::new() })
    }
    async fn expose(&self, cd: &CompiledDeployment) -> PaasResult<ClusterReport> { self.deploy(cd).await }
}

#[tokio::test]
async fn fan_out_reports_in_cluster_order() {
    let drivers: Vec<Box<dyn Driver>> = vec![
        Box::new(FakeDriver { name: "slow".into(), delay_ms: 60, fails: false }),
        Box::new(FakeDriver { name: "fast".into(), delay_ms: 1, fails: false }),
    ];
    let client = MultiClusterClient::new(ClusterClients::from_drivers(drivers));
    let cd = CompiledDeployment::new("v1", None, None);
    let reports = client.deploy(&cd).await.unwrap();
    let names: Vec<_> = reports.iter().map(|r| r.cluster.as_str()).collect();
    assert_eq!(names, vec!["slow", "fast"]);
}

#[tokio::test]
async fn fan_out_returns_first_failure_in_cluster_order() {
    let drivers: Vec<Box<dyn Driver>> = vec![
        Box::new(FakeDriver { name: "ok".into(), delay_ms: 1, fails: false }),
        Box::new(FakeDriver { name: "late".into(), delay_ms: 50, fails: true }),
        Box::new(FakeDriver { name: "early".into(), delay_ms: 1, fails: true }),
    ];
    let client = MultiClusterClient::new(ClusterClients::from_drivers(drivers));
    let cd = CompiledDeployment::new("v1", None, None);
    let err = client.expose(&cd).await.unwrap_err();
    assert_eq!(err.to_string(), "late is down");
}

#[test]
fn kubernetes_factory_requires_an_address() {
    let mut c = cluster("main", "kubernetes");
    c.address = String::new();
    assert_eq!(c.configure_cluster(&KubernetesFactory::new()).err().unwrap().code(), 400);
    assert!(cluster("main", "kubernetes").configure_cluster(&KubernetesFactory::new()).is_ok());
}

fn container(name: &str, image: &str, volumes: Vec<VolumeMount>) -> Container {
    Container {
        name: name.into(),
        image: image.into(),
        version: Some("1.25".into()),
        listen: [8080].into_iter().collect(),
        volumes,
        env: ContainerEnv::default(),
        healthcheck: None,
        resources: Default::default(),
    }
}

fn deployment() -> CompiledDeployment {
    let cd = CompiledDeployment::new("v1", Some("demo".into()), Some("shop".into()));
    cd.defaults()
        .set("storage-provider", Some("fast-ssd"))
        .set("storage-size", None)
        .set("oci-registry-config-name", None)
        .set("ingress-provider", None);
    cd.defaults().for_cluster("main").set("storage-size", Some("2Gi")).set("ingress-provider", Some("nginx"));
    let bag = cd.defaults();
    cd.add_volume(Volume {
        name: "data".into(),
        mount_path: "/data".into(),
        kind: VolumeKind::Persistent {
            storage_identifier: Resolvable::or_default(None, bag, "storage-provider").unwrap(),
            storage_size: Resolvable::or_default(None, bag, "storage-size").unwrap(),
            reset_on_deployment: false,
            write_many: false,
        },
    })
    .unwrap();
    cd.add_pod(Pod {
        name: "db".into(),
        replicas: 1,
        containers: vec![container("postgres", "postgres", vec![VolumeMount { name: "data".into(), mount_path: "/var/lib/pg".into() }])],
        oci_registry_config_name: Some(Resolvable::or_default(None, bag, "oci-registry-config-name").unwrap()),
        upgrade: Default::default(),
        security: Default::default(),
    })
    .unwrap();
    cd.add_pod(Pod {
        name: "web".into(),
        replicas: 2,
        containers: vec![container("nginx", "nginx", Vec::new())],
        oci_registry_config_name: None,
        upgrade: Default::default(),
        security: Default::default(),
    })
    .unwrap();
    cd.add_service(Service {
        name: "web".into(),
        pod_name: "web".into(),
        ports: vec![Transport { listen: 80, target: 8080, protocol: Default::default() }],
        internal: false,
    })
    .unwrap();
    cd.add_ingress(Ingress {
        name: "public".into(),
        host: "shop.example".into(),
        provider: Some(Resolvable::or_default(None, bag, "ingress-provider").unwrap()),
        default_service: Some("web".into()),
        default_port: Some(80),
        paths: Vec::new(),
        tls_secret: None,
        https_backend: true,
        meta: BTreeMap::new(),
    })
    .unwrap();
    cd
}

#[tokio::test]
async fn kubernetes_driver_deploys_then_exposes() {
    let cd = deployment();
    let api = Arc::new(RecordingClusterApi::new());
    let config = DriverConfig { cluster_name: "main".into(), url: "https://k8s.example".into(), namespace: Some("shop".into()), ..DriverConfig::default() };
    let driver = KubernetesDriver::new(config, api.clone(), default_transcribers());

    let report = driver.deploy(&cd).await.unwrap();
    assert_eq!(report.cluster, "main");
    assert_eq!(
        api.applied_labels(),
        vec!["Namespace/shop", "PersistentVolumeClaim/demo-data", "StatefulSet/demo-db", "Deployment/demo-web"]
    );
    let applied = api.applied();
    assert_eq!(applied[1]["spec"]["resources"]["requests"]["storage"], "2Gi");
    assert_eq!(applied[1]["spec"]["storageClassName"], "fast-ssd");
    assert_eq!(applied[3]["spec"]["replicas"], 2);
    assert_eq!(applied[3]["spec"]["template"]["spec"]["containers"][0]["image"], "nginx:1.25");
    assert!(applied[2]["spec"]["template"]["spec"].get("imagePullSecrets").is_none());

    driver.expose(&cd).await.unwrap();
    let applied = api.applied();
    let ingress = applied.last().unwrap();
    assert_eq!(ingress["spec"]["ingressClassName"], "nginx");
    assert_eq!(ingress["metadata"]["annotations"]["nginx.ingress.kubernetes.io/backend-protocol"], "HTTPS");
    assert_eq!(applied[applied.len() - 2]["spec"]["selector"]["app.kubernetes.io/name"], "demo-web");
}

#[tokio::test]
async fn missing_storage_size_fails_the_deploy() {
    let cd = deployment();
    let api = Arc::new(RecordingClusterApi::new());
    let config = DriverConfig { cluster_name: "other".into(), url: "https://k8s.example".into(), ..DriverConfig::default() };
    let driver = KubernetesDriver::new(config, api.clone(), default_transcribers());
    let err = driver.deploy(&cd).await.unwrap_err();
    assert_eq!(err.code(), 400);
    assert_eq!(api.applied_labels(), vec!["Namespace/default"]);
}
