use paas_core::keys::OCI_REGISTRY_CONFIG_NAME;
use paas_core::model::{
    Buildable, Container, ContainerEnv, EmbeddedVolumeImage, HealthCheck, Pod, PodSecurity, Probe, Upgrade,
    UpgradeStrategy, Volume, VolumeMount,
};
use metrics::counter;
use paas_core::{CompiledDeployment, PaasError, PaasResult, Resolvable, Resource, ResourceSet};
use rustc_hash::FxHashMap;
use serde_json::Value as Json;
use smallvec::SmallVec;
use tracing::{debug, warn};

use super::volumes::volume_from;
use super::{entries, invalid, opt_bool, opt_port, opt_str, opt_u64, req_str, scalar, string_list, CompileContext, SectionCompiler};

/// Pods and their containers. Explicit resource requirements are reserved
/// while containers are built; containers that declared nothing for a quota
/// type are auto-sized afterwards, from what the explicit ones left.
///
/// A pod that breaks a hard quota is left out: its reservations roll back,
/// nothing it declared reaches the deployment and the other pods compile.
pub struct PodsCompiler;

/// A compiled pod with the volumes and embedded images it declared inline.
/// Those are committed together once the pod has cleared its quotas.
#[derive(Default)]
struct Staging {
    volumes: Vec<Volume>,
    buildables: Vec<Buildable>,
}

struct StagedPod {
    pod: Pod,
    staging: Staging,
}

impl StagedPod {
    fn commit(self, deployment: &CompiledDeployment) -> PaasResult<()> {
        for v in self.staging.volumes {
            deployment.add_volume(v)?;
        }
        for b in self.staging.buildables {
            deployment.add_buildable(b)?;
        }
        debug!(pod = %self.pod.name, replicas = self.pod.replicas, containers = self.pod.containers.len(), "pod compiled");
        deployment.add_pod(self.pod)
    }
}

fn in_pod(pod: &str, e: PaasError) -> PaasError {
    match e {
        PaasError::Domain { message, code } => PaasError::Domain { message: format!("pod `{}`: {}", pod, message), code },
        other => other,
    }
}

fn is_quota_error(e: &PaasError) -> bool {
    matches!(e, PaasError::CapacityExceeded(_) | PaasError::QuotasNotCompliant(_))
}

fn reject(ctx: &CompileContext<'_>, pod: &str, e: &PaasError) {
    warn!(job = %ctx.job.id, pod = %pod, error = %e, "pod rejected by quotas");
    counter!("conductor_rejected_pods", 1u64);
    ctx.deployment.reject_pod(pod, e.to_string());
}

impl SectionCompiler for PodsCompiler {
    fn section(&self) -> &'static str { "pods" }

    fn compile(&self, definitions: &Json, ctx: &mut CompileContext<'_>) -> PaasResult<()> {
        let mut built = Vec::new();
        for (name, def) in entries(definitions, "pods")? {
            let checkpoint = ctx.quotas.clone();
            match self.pod(name, def, ctx) {
                Ok(staged) => built.push(staged),
                Err(e) if is_quota_error(&e) => {
                    ctx.quotas = checkpoint;
                    reject(ctx, name, &e);
                }
                Err(e) => return Err(in_pod(name, e)),
            }
        }

        let types: Vec<String> = ctx.quotas.types().map(str::to_string).collect();
        let mut slots: FxHashMap<&str, u32> = FxHashMap::default();
        for staged in &built {
            for c in &staged.pod.containers {
                for t in types.iter().filter(|t| c.resources.get(t).is_none()) {
                    *slots.entry(t.as_str()).or_default() += staged.pod.replicas.max(1);
                }
            }
        }
        for mut staged in built {
            let replicas = staged.pod.replicas.max(1);
            let checkpoint = ctx.quotas.clone();
            let mut outcome = Ok(());
            for c in &mut staged.pod.containers {
                let missing: Vec<&String> = types.iter().filter(|t| c.resources.get(t).is_none()).collect();
                for t in missing {
                    let left = slots.entry(t.as_str()).or_default();
                    if outcome.is_ok() {
                        if let Some(av) = ctx.quotas.get_mut(t) {
                            outcome = av.update_resource(&mut c.resources, *left, replicas);
                        }
                    }
                    *left = left.saturating_sub(replicas);
                }
            }
            match outcome {
                Ok(()) => {
                    let name = staged.pod.name.clone();
                    staged.commit(ctx.deployment).map_err(|e| in_pod(&name, e))?;
                }
                Err(e) => {
                    ctx.quotas = checkpoint;
                    reject(ctx, &staged.pod.name, &e);
                }
            }
        }
        Ok(())
    }
}

impl PodsCompiler {
    fn pod(&self, name: &str, def: &Json, ctx: &mut CompileContext<'_>) -> PaasResult<StagedPod> {
        let what = format!("pod `{}`", name);
        let replicas = u32::try_from(opt_u64(def, "replicas", &what)?.unwrap_or(1)).map_err(|_| invalid(&what, "has too many replicas"))?;
        let upgrade = match def.get("upgrade") {
            Some(u) => Upgrade {
                strategy: match opt_str(u, "strategy") {
                    Some(s) => serde_json::from_value::<UpgradeStrategy>(Json::String(s.clone()))
                        .map_err(|_| invalid(&what, &format!("has an unknown upgrade strategy `{}`", s)))?,
                    None => UpgradeStrategy::default(),
                },
                max_upgrading_pods: opt_u64(u, "max-upgrading-pods", &what)?.unwrap_or(1) as u32,
                max_unavailable_pods: opt_u64(u, "max-unavailable-pods", &what)?.unwrap_or(0) as u32,
            },
            None => Upgrade { max_upgrading_pods: 1, ..Upgrade::default() },
        };
        let security = match def.get("security") {
            Some(s) => PodSecurity {
                allow_root: opt_bool(s, "allow-root"),
                fs_group: opt_u64(s, "fs-group", &what)?.map(|g| g as i64),
            },
            None => PodSecurity::default(),
        };
        let oci = Resolvable::or_default(
            opt_str(def, "oci-registry-config-name").as_deref(),
            ctx.deployment.defaults(),
            OCI_REGISTRY_CONFIG_NAME,
        )?;

        let containers_def = def.get("containers").ok_or_else(|| invalid(&what, "requires `containers`"))?;
        let mut staging = Staging::default();
        let mut containers = Vec::new();
        for (cname, cdef) in entries(containers_def, &format!("{}.containers", what))? {
            containers.push(self.container(name, cname, cdef, replicas, ctx, &mut staging)?);
        }
        if containers.is_empty() {
            return Err(invalid(&what, "requires at least one container"));
        }
        let pod = Pod { name: name.to_string(), replicas, containers, oci_registry_config_name: Some(oci), upgrade, security };
        Ok(StagedPod { pod, staging })
    }

    fn container(
        &self,
        pod: &str,
        name: &str,
        def: &Json,
        replicas: u32,
        ctx: &mut CompileContext<'_>,
        staging: &mut Staging,
    ) -> PaasResult<Container> {
        let what = format!("container `{}` of pod `{}`", name, pod);
        let mut image = req_str(def, "image", &what)?;
        let mut version = opt_str(def, "version");
        let is_buildable = ctx.deployment.has_buildable(&image);

        let mut listen: SmallVec<[u16; 4]> = SmallVec::new();
        for p in string_list(def.get("listen"), &what)? {
            listen.push(p.parse().map_err(|_| invalid(&what, &format!("listens on an invalid port `{}`", p)))?);
        }

        let mut mounts = Vec::new();
        let mut embedded: Vec<Volume> = Vec::new();
        if let Some(vols) = def.get("volumes") {
            for (vname, vdef) in entries(vols, &format!("{}.volumes", what))? {
                let volume = match opt_str(vdef, "from") {
                    Some(from) => ctx.deployment.import_volume(&from, &req_str(vdef, "mount-path", &what)?)?,
                    None => volume_from(vname, vdef, ctx.deployment.defaults())?,
                };
                if volume.is_embedded() && is_buildable {
                    embedded.push(volume);
                    continue;
                }
                if opt_str(vdef, "from").is_none() {
                    staging.volumes.push(volume.clone());
                }
                mounts.push(VolumeMount { name: volume.name.clone(), mount_path: volume.mount_path.clone() });
            }
        }

        if !embedded.is_empty() {
            let mut tag = None;
            ctx.deployment.for_each_buildable(|b| {
                if b.name() == image { tag = b.tag().map(str::to_string); }
            });
            let embedded_name = format!("{}-{}-{}", image, pod, name);
            staging.buildables.push(Buildable::Embedded(EmbeddedVolumeImage {
                name: embedded_name.clone(),
                tag: tag.clone(),
                original_name: image.clone(),
                volumes: embedded,
                registry: None,
            }));
            image = embedded_name;
            version = tag.or(version);
        }

        let mut resources = ResourceSet::default();
        if let Some(res) = def.get("resources") {
            for (rtype, rdef) in entries(res, &format!("{}.resources", what))? {
                let require = req_str(rdef, "require", &what)?;
                let limit = opt_str(rdef, "limit").unwrap_or_else(|| require.clone());
                match ctx.quotas.get_mut(rtype) {
                    Some(av) => av.reserve(&require, &limit, replicas, &mut resources)?,
                    None => resources.push(Resource { resource_type: rtype.clone(), require, limit }),
                }
            }
        }

        Ok(Container {
            name: name.to_string(),
            image,
            version,
            listen,
            volumes: mounts,
            env: env_from(def.get("variables"), &what)?,
            healthcheck: match def.get("healthcheck") {
                Some(h) => Some(healthcheck(h, &what)?),
                None => None,
            },
            resources,
        })
    }
}

fn split_ref(raw: &str, what: &str) -> PaasResult<(String, String)> {
    raw.split_once('.')
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .ok_or_else(|| invalid(what, &format!("reference `{}` must be `name.key`", raw)))
}

fn env_from(v: Option<&Json>, what: &str) -> PaasResult<ContainerEnv> {
    let mut env = ContainerEnv::default();
    let Some(v) = v else { return Ok(env) };
    for (k, val) in entries(v, &format!("{}.variables", what))? {
        match k.as_str() {
            "from-maps" | "from-secrets" => {
                for (var, r) in entries(val, what)? {
                    let r = scalar(r).ok_or_else(|| invalid(what, &format!("`{}` must be a scalar", var)))?;
                    let target = if k == "from-maps" { &mut env.from_maps } else { &mut env.from_secrets };
                    target.insert(var.clone(), split_ref(&r, what)?);
                }
            }
            "import-maps" => env.import_maps = string_list(Some(val), what)?,
            "import-secrets" => env.import_secrets = string_list(Some(val), what)?,
            _ => {
                let s = scalar(val).ok_or_else(|| invalid(what, &format!("variable `{}` must be a scalar", k)))?;
                env.values.insert(k.clone(), s);
            }
        }
    }
    Ok(env)
}

fn healthcheck(h: &Json, what: &str) -> PaasResult<HealthCheck> {
    let probe_def = h.get("probe").ok_or_else(|| invalid(what, "healthcheck requires `probe`"))?;
    let probe = if let Some(cmd) = probe_def.get("command") {
        Probe::Command { command: string_list(Some(cmd), what)? }
    } else if let Some(tcp) = probe_def.get("tcp") {
        Probe::Tcp { port: opt_port(tcp, "port", what)?.ok_or_else(|| invalid(what, "tcp probe requires `port`"))? }
    } else if let Some(http) = probe_def.get("http") {
        Probe::Http {
            port: opt_port(http, "port", what)?.ok_or_else(|| invalid(what, "http probe requires `port`"))?,
            path: opt_str(http, "path").unwrap_or_else(|| "/".to_string()),
            is_secure: opt_bool(http, "is-secure"),
        }
    } else {
        return Err(invalid(what, "healthcheck probe must be `command`, `tcp` or `http`"));
    };
    let threshold = h.get("threshold").cloned().unwrap_or(Json::Null);
    Ok(HealthCheck {
        initial_delay: opt_u64(h, "initial-delay-seconds", what)?.unwrap_or(0) as u32,
        period: opt_u64(h, "period-seconds", what)?.unwrap_or(10) as u32,
        probe,
        success_threshold: opt_u64(&threshold, "success", what)?.unwrap_or(1) as u32,
        failure_threshold: opt_u64(&threshold, "failure", what)?.unwrap_or(3) as u32,
    })
}
