use paas_core::keys::{STORAGE_PROVIDER, STORAGE_SIZE};
use paas_core::model::{Volume, VolumeKind};
use paas_core::{DefaultsBag, PaasResult, Resolvable};
use serde_json::Value as Json;

use super::{entries, opt_bool, opt_str, repo_path, req_str, string_list, CompileContext, SectionCompiler};

/// Build one volume from its definition. Shared with inline pod volumes.
pub(crate) fn volume_from(name: &str, def: &Json, defaults: &DefaultsBag) -> PaasResult<Volume> {
    let what = format!("volume `{}`", name);
    let mount_path = req_str(def, "mount-path", &what)?;
    let kind = if opt_bool(def, "persistent") {
        VolumeKind::Persistent {
            storage_identifier: Resolvable::or_default(opt_str(def, "storage-provider").as_deref(), defaults, STORAGE_PROVIDER)?,
            storage_size: Resolvable::or_default(opt_str(def, "storage-size").as_deref(), defaults, STORAGE_SIZE)?,
            reset_on_deployment: opt_bool(def, "reset-on-deployment"),
            write_many: opt_bool(def, "write-many"),
        }
    } else if let Some(secret) = opt_str(def, "from-secret") {
        VolumeKind::Secret { secret_identifier: secret }
    } else if let Some(map) = opt_str(def, "from-map") {
        VolumeKind::Map { map_identifier: map }
    } else {
        let local = opt_str(def, "local-path").unwrap_or_else(|| format!("/volumes/{}", name));
        let paths = string_list(def.get("add"), &what)?
            .iter()
            .map(|p| repo_path(p, &what))
            .collect::<PaasResult<Vec<_>>>()?;
        VolumeKind::Embedded { local_path: local, paths, registry: None, tag: None }
    };
    Ok(Volume { name: name.to_string(), mount_path, kind })
}

pub struct VolumesCompiler;

impl SectionCompiler for VolumesCompiler {
    fn section(&self) -> &'static str { "volumes" }

    fn compile(&self, definitions: &Json, ctx: &mut CompileContext<'_>) -> PaasResult<()> {
        for (name, def) in entries(definitions, "volumes")? {
            let volume = volume_from(name, def, ctx.deployment.defaults())?;
            ctx.deployment.add_volume(volume)?;
        }
        Ok(())
    }
}
