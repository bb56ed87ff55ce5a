use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{ArgAction, Parser, Subcommand, ValueEnum};
use paas_build::TokioProcessSpawner;
use paas_cluster::kubernetes::{default_transcribers, KubernetesDriver, KubernetesFactory, CLUSTER_TYPE};
use paas_cluster::{Directory, Driver, DriverConfig, RecordingClusterApi};
use paas_conductor::{Conductor, ConductorSettings};
use paas_cookbook::{Cookbook, EventSink, FanoutSink, FileJobSource, HistorySink, Kitchen, KitchenConfig, TracingSink};
use paas_core::{ClusterDefinition, CompiledDeployment, ImageRegistry, JobUnit, LocalWorkspace, ProjectRef, SourceRepository};
use paas_persist::{HistoryStore, SqliteHistory};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(name = "paasctl", version, about = "PaaS deployment engine CLI")]
struct Cli {
    /// Output format
    #[arg(short = 'o', long = "output", value_enum, global = true, default_value_t = Output::Human)]
    output: Output,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Copy, Clone, Debug, Eq, PartialEq, ValueEnum)]
enum Output { Human, Json }

#[derive(Subcommand, Debug)]
enum Commands {
    /// Compile a manifest and print what it deploys
    Compile {
        /// Manifest file, e.g. .paas.yaml
        manifest: PathBuf,
        /// Job description (JSON); a local job is used when absent
        #[arg(long = "job")]
        job: Option<PathBuf>,
        #[arg(long = "storage-provider", env = "PAAS_STORAGE_PROVIDER")]
        storage_provider: Option<String>,
        #[arg(long = "storage-size", env = "PAAS_STORAGE_SIZE")]
        storage_size: Option<String>,
        #[arg(long = "oci-config", env = "PAAS_OCI_REGISTRY_CONFIG")]
        oci_config: Option<String>,
        /// Also transcribe for every cluster of the job and print the manifests
        #[arg(long = "dry-run", action = ArgAction::SetTrue)]
        dry_run: bool,
    },
    /// Run a job end to end: clone, compile, build, deploy, expose
    Run {
        /// Job description (JSON)
        job: PathBuf,
        /// Do not journal history in the local database
        #[arg(long = "no-history", action = ArgAction::SetTrue)]
        no_history: bool,
    },
    /// Show journaled jobs, or the events of one job
    History {
        job: Option<String>,
        #[arg(long = "limit", default_value_t = 20)]
        limit: usize,
    },
}

fn init_tracing() {
    let env = std::env::var("PAAS_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).with_writer(std::io::stderr).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("PAAS_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => tracing::info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => tracing::warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            tracing::warn!(addr = %addr, "invalid PAAS_METRICS_ADDR; expected host:port");
        }
    }
}

fn load_job(path: &PathBuf) -> Result<JobUnit> {
    let raw = std::fs::read(path).with_context(|| format!("reading job {}", path.display()))?;
    Ok(JobUnit::from_json(&raw)?)
}

/// Job for compiling outside of a pipeline: no registry, no cluster.
fn local_job() -> JobUnit {
    JobUnit {
        id: format!("local-{}", uuid::Uuid::new_v4()),
        project: ProjectRef { id: "local".into(), name: "local".into() },
        prefix: None,
        environment: "local".into(),
        source_repository: SourceRepository { url: ".".into(), branch: None, identity: None },
        images_registry: ImageRegistry { url: String::new(), identity: None },
        clusters: Vec::new(),
        variables: std::env::vars().filter(|(k, _)| k.starts_with("PAAS_VAR_")).map(|(k, v)| (k["PAAS_VAR_".len()..].to_string(), v)).collect(),
        quotas: Vec::new(),
        defaults: Default::default(),
        timeout: None,
    }
}

async fn dry_run(job: &JobUnit, cd: &CompiledDeployment) -> Result<Vec<(String, Vec<serde_json::Value>)>> {
    let mut clusters = job.clusters.clone();
    if clusters.is_empty() {
        clusters.push(ClusterDefinition {
            name: "local".into(),
            cluster_type: CLUSTER_TYPE.into(),
            address: "https://localhost:6443".into(),
            namespace: None,
            use_hierarchical_namespaces: false,
            identity: None,
            defaults: Default::default(),
        });
    }
    let mut out = Vec::with_capacity(clusters.len());
    for c in clusters {
        let api = Arc::new(RecordingClusterApi::new());
        let config = DriverConfig {
            cluster_name: c.name.clone(),
            url: c.address.clone(),
            namespace: c.namespace.clone(),
            identity: None,
            use_hierarchical_namespaces: c.use_hierarchical_namespaces,
        };
        let driver = KubernetesDriver::new(config, api.clone(), default_transcribers());
        driver.deploy(cd).await?;
        driver.expose(cd).await?;
        out.push((c.name, api.applied()));
    }
    Ok(out)
}

fn history_store() -> Result<Arc<dyn HistoryStore>> { Ok(Arc::new(SqliteHistory::open_default()?)) }

fn ts(ms: i64) -> String {
    chrono::DateTime::from_timestamp_millis(ms).map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string()).unwrap_or_else(|| ms.to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();

    match cli.command {
        Commands::Compile { manifest, job, storage_provider, storage_size, oci_config, dry_run: transcribe } => {
            let job = Arc::new(match &job {
                Some(p) => load_job(p)?,
                None => local_job(),
            });
            let text = std::fs::read_to_string(&manifest).with_context(|| format!("reading manifest {}", manifest.display()))?;
            info!(job = %job.id, manifest = %manifest.display(), "compile invoked");
            let mut conductor = Conductor::new(ConductorSettings::default());
            conductor.configure(job.clone(), Arc::new(LocalWorkspace::new(&std::env::temp_dir(), &job.id)))?;
            conductor.prepare(&text).await?;
            let cd = conductor.compile_deployment(storage_provider.as_deref(), storage_size.as_deref(), oci_config.as_deref())?;
            let summary = cd.summary();
            let rendered = if transcribe { dry_run(&job, &cd).await? } else { Vec::new() };
            match cli.output {
                Output::Human => {
                    println!("version  {}", summary.version);
                    println!("prefix   {}", summary.prefix.as_deref().unwrap_or("-"));
                    for (label, names) in [
                        ("images", &summary.buildables),
                        ("volumes", &summary.volumes),
                        ("hooks", &summary.hooks),
                        ("pods", &summary.pods),
                        ("secrets", &summary.secrets),
                        ("maps", &summary.maps),
                        ("services", &summary.services),
                        ("ingresses", &summary.ingresses),
                    ] {
                        if !names.is_empty() {
                            println!("{:<8} {}", label, names.join(", "));
                        }
                    }
                    for r in &summary.rejected {
                        println!("rejected {}: {}", r.name, r.reason);
                    }
                    for (cluster, manifests) in &rendered {
                        println!("# cluster {}", cluster);
                        for m in manifests {
                            println!("---\n{}", serde_yaml::to_string(m)?.trim_end());
                        }
                    }
                }
                Output::Json => {
                    let clusters: serde_json::Map<String, serde_json::Value> =
                        rendered.into_iter().map(|(c, m)| (c, serde_json::Value::Array(m))).collect();
                    println!("{}", serde_json::to_string_pretty(&serde_json::json!({ "summary": summary, "clusters": clusters }))?);
                }
            }
        }
        Commands::Run { job, no_history } => {
            let mut sinks: Vec<Arc<dyn EventSink>> = vec![Arc::new(TracingSink)];
            if !no_history {
                sinks.push(Arc::new(HistorySink::new(history_store()?)));
            }
            let directory = Arc::new(Directory::new());
            directory.register(CLUSTER_TYPE, Arc::new(KubernetesFactory::new()));
            let kitchen = Kitchen::new(
                KitchenConfig::from_env(),
                Arc::new(FileJobSource::new(job)),
                Arc::new(FanoutSink::new(sinks)),
                Arc::new(TokioProcessSpawner),
                directory,
            );
            let book = Cookbook::new(kitchen);
            let run = tokio::select! {
                res = book.run() => res,
                _ = tokio::signal::ctrl_c() => {
                    error!("interrupted");
                    anyhow::bail!("interrupted");
                }
            };
            match run {
                Ok(outcome) => match cli.output {
                    Output::Human => {
                        println!("job {} done ({} steps)", outcome.job_id.as_deref().unwrap_or("-"), outcome.completed.len());
                        if let Some(step) = &outcome.finished_by {
                            println!("finished early by `{}`", step);
                        }
                    }
                    Output::Json => println!(
                        "{}",
                        serde_json::to_string_pretty(&serde_json::json!({
                            "job": outcome.job_id,
                            "completed": outcome.completed,
                            "finished_by": outcome.finished_by,
                        }))?
                    ),
                },
                Err(e) => {
                    error!(code = e.code(), error = %e, "job failed");
                    eprintln!("job failed ({}): {}", e.code(), e);
                    std::process::exit(1);
                }
            }
        }
        Commands::History { job, limit } => {
            let store = history_store()?;
            match job {
                Some(id) => {
                    let entries = store.for_job(&id)?;
                    match cli.output {
                        Output::Human => {
                            for e in entries.iter().rev().take(limit).rev() {
                                let mark = if e.is_final { "*" } else { " " };
                                println!("{} {} {}", ts(e.ts), mark, e.step);
                                if let Some(err) = e.payload.get("error") {
                                    println!("    error: {}", err);
                                }
                            }
                        }
                        Output::Json => println!("{}", serde_json::to_string_pretty(&entries)?),
                    }
                }
                None => {
                    let jobs = store.recent_jobs(limit)?;
                    match cli.output {
                        Output::Human => {
                            for j in jobs {
                                let state = if j.is_final { "done" } else { "running" };
                                println!("{} • {} • {} • {}", ts(j.ts), j.job_id, j.last_step, state);
                            }
                        }
                        Output::Json => println!("{}", serde_json::to_string_pretty(&jobs)?),
                    }
                }
            }
        }
    }
    Ok(())
}
