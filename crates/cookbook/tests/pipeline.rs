#![forbid(unsafe_code)]

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use paas_build::{ProcessHandle, ProcessOutput, ProcessSpawner};
use paas_cluster::kubernetes::{default_transcribers, KubernetesDriver};
use paas_cluster::{Directory, Driver, DriverConfig, DriverFactory, RecordingClusterApi};
use paas_cookbook::{
    keys, CloneRequest, CloningAgent, Cookbook, EventSink, Flow, HistoryEvent, Kitchen, KitchenConfig, Stage,
    StaticJobSource, Step, WorkPlan,
};
use paas_core::{PaasResult, SourceRepository};

const MANIFEST: &str = r#"
paas:
  version: v1
images:
  api:
    path: /api
hooks:
  migrate:
    make: [migrate]
pods:
  web:
    containers:
      api:
        image: api
        listen: [8080]
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

const QUOTA_MANIFEST: &str = r#"
paas:
  version: v1
pods:
  big:
    containers:
      main:
        image: busybox
        resources:
          cpu: {require: "3"}
  web:
    containers:
      main:
        image: nginx
        resources:
          cpu: {require: 500m}
"#;

fn job_json(id: &str, timeout: Option<u64>, quotas: &serde_json::Value) -> Vec<u8> {
    serde_json::json!({
        "id": id,
        "project": {"id": "p1", "name": "demo"},
        "prefix": "demo",
        "environment": "prod",
        "source_repository": {"url": "https://git.example/demo.git", "branch": "main"},
        "images_registry": {"url": "registry.example", "identity": {"user": "ci", "password": "pw"}},
        "clusters": [{"name": "main", "type": "kubernetes", "address": "https://k8s.example", "namespace": "apps"}],
        "variables": {"SERVER": "demo.example"},
        "timeout": timeout,
        "quotas": quotas,
    })
    .to_string()
    .into_bytes()
}

struct FakeProcess {
    argv: Vec<String>,
    log: Arc<Mutex<Vec<String>>>,
    fails: bool,
    hangs: bool,
}

#[async_trait::async_trait]
impl ProcessHandle for FakeProcess {
    fn set_env(&mut self, _env: BTreeMap<String, String>) {}
    fn set_timeout(&mut self, _timeout: Duration) {}
    async fn start(&mut self) -> PaasResult<()> {
        self.log.lock().unwrap().push(self.argv.join(" "));
        Ok(())
    }
    async fn wait(&mut self) -> PaasResult<ProcessOutput> {
        if self.hangs {
            std::future::pending::<()>().await;
        }
        Ok(ProcessOutput { success: !self.fails, stdout: String::new(), stderr: if self.fails { "boom".into() } else { String::new() } })
    }
    async fn stop(&mut self) {}
}

#[derive(Default)]
struct FakeSpawner {
    log: Arc<Mutex<Vec<String>>>,
    fail_on: Option<&'static str>,
    hang_on: Option<&'static str>,
}

impl ProcessSpawner for FakeSpawner {
    fn spawn(&self, command: Vec<String>, _cwd: &Path) -> Box<dyn ProcessHandle> {
        let first_is = |p: Option<&str>| p.is_some_and(|p| command.first().is_some_and(|c| c == p));
        let (fails, hangs) = (first_is(self.fail_on), first_is(self.hang_on));
        Box::new(FakeProcess { argv: command, log: self.log.clone(), fails, hangs })
    }
}

/// Writes the manifest where the repository would land.
struct FakeCloner(&'static str);

#[async_trait::async_trait]
impl CloningAgent for FakeCloner {
    fn configure(&self, repository: &SourceRepository, destination: PathBuf) -> PaasResult<CloneRequest> {
        Ok(CloneRequest { url: repository.url.clone(), branch: repository.branch.clone(), destination })
    }
    async fn clone_repository(&self, request: &CloneRequest) -> PaasResult<()> {
        std::fs::create_dir_all(&request.destination)?;
        std::fs::write(request.destination.join(".paas.yaml"), self.0)?;
        Ok(())
    }
}

#[derive(Default)]
struct RecordingSink(Mutex<Vec<HistoryEvent>>);

impl RecordingSink {
    fn events(&self) -> Vec<HistoryEvent> { self.0.lock().unwrap().clone() }
}

#[async_trait::async_trait]
impl EventSink for RecordingSink {
    async fn send(&self, event: &HistoryEvent) { self.0.lock().unwrap().push(event.clone()); }
}

struct RecordingFactory(Arc<RecordingClusterApi>);

impl DriverFactory for RecordingFactory {
    fn new_driver(&self, config: DriverConfig) -> PaasResult<Box<dyn Driver>> {
        Ok(Box::new(KubernetesDriver::new(config, self.0.clone(), default_transcribers())))
    }
}

struct Rig {
    book: Cookbook,
    sink: Arc<RecordingSink>,
    api: Arc<RecordingClusterApi>,
    processes: Arc<Mutex<Vec<String>>>,
    base: PathBuf,
}

struct Setup {
    timeout: Option<u64>,
    fail_on: Option<&'static str>,
    hang_on: Option<&'static str>,
    manifest: &'static str,
    quotas: serde_json::Value,
    build_deadline: Duration,
}

impl Default for Setup {
    fn default() -> Self {
        Self {
            timeout: None,
            fail_on: None,
            hang_on: None,
            manifest: MANIFEST,
            quotas: serde_json::json!([]),
            build_deadline: KitchenConfig::default().build_deadline,
        }
    }
}

fn rig(id: &str, timeout: Option<u64>, fail_on: Option<&'static str>) -> Rig {
    rig_with(id, Setup { timeout, fail_on, ..Setup::default() })
}

fn rig_with(id: &str, setup: Setup) -> Rig {
    let base = std::env::temp_dir().join(format!(
        "paas-cookbook-{}",
        std::time::SystemTime::now().duration_since(std::time::UNIX_EPOCH).unwrap().as_nanos()
    ));
    let config = KitchenConfig {
        workspace_base: base.clone(),
        storage_provider: Some("standard".into()),
        storage_size: Some("1Gi".into()),
        build_deadline: setup.build_deadline,
        build_grace: Duration::from_millis(100),
        ..KitchenConfig::default()
    };
    let sink = Arc::new(RecordingSink::default());
    let api = Arc::new(RecordingClusterApi::new());
    let spawner = FakeSpawner { fail_on: setup.fail_on, hang_on: setup.hang_on, ..FakeSpawner::default() };
    let processes = spawner.log.clone();
    let directory = Arc::new(Directory::new());
    directory.register("kubernetes", Arc::new(RecordingFactory(api.clone())));
    let source = StaticJobSource(job_json(id, setup.timeout, &setup.quotas));
    let kitchen = Kitchen::new(config, Arc::new(source), sink.clone(), Arc::new(spawner), directory)
        .with_cloning(Arc::new(FakeCloner(setup.manifest)));
    Rig { book: Cookbook::new(kitchen), sink, api, processes, base }
}

#[tokio::test]
async fn a_job_goes_from_description_to_exposed_workloads() {
    let r = rig("job-7", None, None);
    let outcome = r.book.run().await.unwrap();

    let expected: Vec<String> = Stage::ALL.iter().map(|(_, s)| s.label().to_string()).collect();
    assert_eq!(outcome.completed, expected);
    assert_eq!(outcome.job_id.as_deref(), Some("job-7"));
    assert_eq!(outcome.finished_by, None);
    assert_eq!(outcome.plan.get(keys::HOOKS_RUN).unwrap(), &vec!["migrate".to_string()]);
    assert_eq!(outcome.plan.get(keys::IMAGES_BUILT).unwrap(), &vec!["api".to_string()]);

    let processes = r.processes.lock().unwrap().clone();
    assert_eq!(processes[0], "make migrate");
    assert!(processes[1].starts_with("sh -c set -e\nbuildah bud"));
    assert!(processes[1].contains("'registry.example/api:latest'"));

    assert_eq!(
        r.api.applied_labels(),
        vec!["Namespace/apps", "Deployment/demo-web", "Service/demo-web", "Ingress/demo-public"]
    );
    let applied = r.api.applied();
    assert_eq!(applied[1]["spec"]["template"]["spec"]["containers"][0]["image"], "registry.example/api:latest");
    assert_eq!(applied[3]["spec"]["rules"][0]["host"], "demo.example");

    let events = r.sink.events();
    let finals: Vec<_> = events.iter().filter(|e| e.is_final).collect();
    assert_eq!(finals.len(), 1);
    assert_eq!(finals[0].step, "send history");
    assert_eq!(finals[0].job_id.as_deref(), Some("job-7"));
    assert_eq!(finals[0].extra["images"][0], "api");
    assert_eq!(events.last().unwrap().step, "send history");
    assert!(!events.iter().any(|e| e.step == "unset timeout"));

    assert!(!r.book.kitchen().timer.is_set());
    assert!(!r.base.join("paas-job-7").exists());
}

#[tokio::test]
async fn failing_hook_skips_the_rest_and_reports_it() {
    let r = rig("job-8", Some(600), Some("make"));
    let err = r.book.run().await.unwrap_err();
    assert_eq!(err.code(), 500);
    assert_eq!(err.to_string(), "hook `migrate` failed: boom");

    assert_eq!(r.processes.lock().unwrap().len(), 1);
    assert!(r.api.applied().is_empty());

    let events = r.sink.events();
    let last = events.last().unwrap();
    assert!(last.is_final);
    assert_eq!(last.step, "pre-build hook");
    assert_eq!(last.extra["error"]["code"], 500);
    assert_eq!(last.extra["job"], "job-8");
    assert_eq!(events.iter().filter(|e| e.is_final).count(), 1);

    assert!(!r.book.kitchen().timer.is_set());
    assert!(!r.base.join("paas-job-8").exists());
}

struct Named(&'static str, Flow);

#[async_trait::async_trait]
impl Step for Named {
    fn name(&self) -> &str { self.0 }
    async fn run(&self, _plan: &mut WorkPlan, _kitchen: &Kitchen) -> PaasResult<Flow> { Ok(self.1) }
}

#[tokio::test]
async fn extensions_run_after_fixed_steps_and_may_finish_early() {
    let mut r = rig("job-9", None, None);
    r.book
        .add_step(100, Arc::new(Named("after compile", Flow::Continue)))
        .add_step(5, Arc::new(Named("first", Flow::Continue)))
        .add_step(105, Arc::new(Named("stop", Flow::Finish)));

    let steps = r.book.steps();
    assert_eq!(steps[0], (5, "first".to_string()));
    let compile = steps.iter().position(|(_, n)| n == "compile deployment").unwrap();
    assert_eq!(steps[compile + 1], (100, "after compile".to_string()));
    assert_eq!(steps[compile + 2], (105, "stop".to_string()));
    assert_eq!(steps.len(), 23);

    let outcome = r.book.run().await.unwrap();
    assert_eq!(outcome.finished_by.as_deref(), Some("stop"));
    assert_eq!(outcome.completed.last().map(String::as_str), Some("stop"));
    assert!(outcome.plan.contains(keys::DEPLOYMENT));
    assert!(r.processes.lock().unwrap().is_empty());
    assert!(r.api.applied().is_empty());

    let last = r.sink.events().pop().unwrap();
    assert!(last.is_final);
    assert_eq!(last.step, "finish");
    assert!(last.extra.get("error").is_none());
}

struct Slow;

#[async_trait::async_trait]
impl Step for Slow {
    fn name(&self) -> &str { "slow" }
    async fn run(&self, _plan: &mut WorkPlan, _kitchen: &Kitchen) -> PaasResult<Flow> {
        tokio::time::sleep(Duration::from_secs(5)).await;
        Ok(Flow::Continue)
    }
}

#[tokio::test]
async fn job_timeout_aborts_the_running_step() {
    let mut r = rig("job-10", Some(1), None);
    r.book.add_step(45, Arc::new(Slow));
    let err = r.book.run().await.unwrap_err();
    assert_eq!(err.code(), 504);
    let last = r.sink.events().pop().unwrap();
    assert_eq!(last.step, "slow");
    assert!(last.is_final);
    assert!(!r.book.kitchen().timer.is_set());
}

#[tokio::test]
async fn a_build_that_never_ends_is_stopped_by_the_batch_deadline() {
    let r = rig_with("job-11", Setup { hang_on: Some("sh"), build_deadline: Duration::from_secs(1), ..Setup::default() });
    let err = r.book.run().await.unwrap_err();
    assert_eq!(err.code(), 504);
    assert_eq!(err.to_string(), "builds did not finish within 1s");

    let last = r.sink.events().pop().unwrap();
    assert!(last.is_final);
    assert_eq!(last.step, "build images");
    assert!(r.api.applied().is_empty());
    assert!(!r.book.kitchen().timer.is_set());
}

#[tokio::test]
async fn pods_over_quota_are_reported_and_the_rest_deployed() {
    let r = rig_with(
        "job-12",
        Setup {
            manifest: QUOTA_MANIFEST,
            quotas: serde_json::json!([{"type": "cpu", "capacity": "2"}]),
            ..Setup::default()
        },
    );
    let outcome = r.book.run().await.unwrap();
    assert_eq!(outcome.finished_by, None);
    assert_eq!(r.api.applied_labels(), vec!["Namespace/apps", "Deployment/demo-web"]);

    let events = r.sink.events();
    let last = events.last().unwrap();
    assert!(last.is_final);
    let rejected = &last.extra["deployment"]["rejected"];
    assert_eq!(rejected[0]["name"], "big");
    assert!(rejected[0]["reason"].as_str().unwrap().contains("`cpu`"));
    assert_eq!(last.extra["deployment"]["pods"], serde_json::json!(["web"]));
}
