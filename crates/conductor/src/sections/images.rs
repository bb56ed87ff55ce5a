use paas_core::model::{Buildable, HookSpec, Image};
use paas_core::PaasResult;
use serde_json::Value as Json;
use tracing::debug;

use super::{entries, invalid, opt_str, opt_u64, repo_path, req_str, string_list, string_map, CompileContext, SectionCompiler};

pub struct ImagesCompiler;

impl SectionCompiler for ImagesCompiler {
    fn section(&self) -> &'static str { "images" }

    fn compile(&self, definitions: &Json, ctx: &mut CompileContext<'_>) -> PaasResult<()> {
        for (name, def) in entries(definitions, "images")? {
            let what = format!("image `{}`", name);
            let image = Image {
                name: name.clone(),
                path: repo_path(&req_str(def, "path", &what)?, &what)?,
                tag: Some(opt_str(def, "tag").unwrap_or_else(|| "latest".to_string())),
                variables: string_map(def.get("variables"), &what)?,
                registry: None,
            };
            debug!(image = %image.name, path = %image.path, "image compiled");
            ctx.deployment.add_buildable(Buildable::Image(image))?;
        }
        Ok(())
    }
}

/// `hooks: {name: {<tool>: args, timeout: secs}}`, tools come from the catalog.
pub struct HooksCompiler;

impl SectionCompiler for HooksCompiler {
    fn section(&self) -> &'static str { "hooks" }

    fn compile(&self, definitions: &Json, ctx: &mut CompileContext<'_>) -> PaasResult<()> {
        for (name, def) in entries(definitions, "hooks")? {
            let what = format!("hook `{}`", name);
            let timeout = opt_u64(def, "timeout", &what)?;
            let mut command = None;
            for (tool, args) in entries(def, &what)? {
                if tool == "timeout" { continue; }
                let base = ctx
                    .hooks
                    .get(tool)
                    .ok_or_else(|| invalid(&what, &format!("uses unknown tool `{}`", tool)))?;
                let mut argv = base.clone();
                argv.extend(string_list(Some(args), &what)?);
                if command.replace(argv).is_some() {
                    return Err(invalid(&what, "must declare exactly one tool"));
                }
            }
            let command = command.ok_or_else(|| invalid(&what, "must declare exactly one tool"))?;
            ctx.deployment.add_hook(HookSpec { name: name.clone(), command, timeout })?;
        }
        Ok(())
    }
}
