use std::fs;
use std::path::{Path, PathBuf};

use tera::{Context, Tera};
use walkdir::WalkDir;

use super::component::Component;
use super::config::{self, Settings};
use super::Result;

/// Provenance header rendered files start with
///
/// Files carrying the header for their expected template are regenerated;
/// anything else is treated as manually authored and left alone.
pub fn header(source: &Path) -> String {
    format!("# Generated from {} - do not edit directly\n", source.display())
}

/// The two flavours of env specific files a component template can produce
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum TemplateKind {
    Merge,
    Override,
}

impl TemplateKind {
    pub const ALL: [TemplateKind; 2] = [TemplateKind::Merge, TemplateKind::Override];

    /// Template source directory under <component>/kube/
    pub fn template_dir(self) -> &'static str {
        match self {
            TemplateKind::Merge => "merge-templates",
            TemplateKind::Override => "override-templates",
        }
    }

    /// Output directory under envs/<env>/
    pub fn output_dir(self) -> &'static str {
        match self {
            TemplateKind::Merge => "merges",
            TemplateKind::Override => "overrides",
        }
    }
}

/// Regenerate every env's merge and override files from component templates
///
/// Previously generated files are removed first, so outputs whose template
/// (or component) has gone away do not linger.
pub fn update_from_templates() -> Result<Vec<PathBuf>> {
    let mut generated = vec![];
    for env in config::list_envs()? {
        let settings = Settings::load(&env)?;
        remove_generated_files(&env)?;
        for path in &settings.components {
            let component = Component::new(path)?;
            generated.extend(component.render_templates(&env, &settings)?);
        }
    }
    Ok(generated)
}

/// Render one component's templates for an environment
pub fn render_component(
    component: &Component,
    env: &str,
    settings: &Settings,
) -> Result<Vec<PathBuf>> {
    let mut written = vec![];
    for (kind, templates) in &component.kube_templates {
        for (name, tpl_path) in templates {
            let body = fs::read_to_string(tpl_path)?;
            let mut context = Context::new();
            for (k, v) in &settings.templateVariables {
                context.add(k, v);
            }
            // strict rendering: an unknown variable fails the run
            let rendered = Tera::one_off(&body, &context, false)?;

            let out_dir = Path::new("envs")
                .join(env)
                .join(kind.output_dir())
                .join(&component.orig_path)
                .join("kube");
            fs::create_dir_all(&out_dir)?;
            let out_path = out_dir.join(name);
            info!("Rendering {} to {}", tpl_path.display(), out_path.display());
            fs::write(&out_path, format!("{}{}", header(tpl_path), rendered))?;
            written.push(out_path);
        }
    }
    Ok(written)
}

// Delete rendered files that carry the provenance header for their expected
// template source; hand written overrides never match and are kept.
fn remove_generated_files(env: &str) -> Result<()> {
    for kind in TemplateKind::ALL.iter() {
        let root = Path::new("envs").join(env).join(kind.output_dir());
        if !root.is_dir() {
            continue;
        }
        for entry in WalkDir::new(&root).into_iter().filter_map(|e| e.ok()) {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path();
            if path.extension().map(|e| e != "yaml").unwrap_or(true) {
                continue;
            }
            if path.parent().and_then(|p| p.file_name()).map(|n| n != "kube").unwrap_or(true) {
                continue;
            }
            // envs/<env>/<kind>s/<component...>/kube/<name>.yaml
            let component = match path.strip_prefix(&root) {
                Ok(rel) => match rel.parent().and_then(Path::parent) {
                    Some(c) => c.to_path_buf(),
                    None => continue,
                },
                Err(_) => continue,
            };
            let expected = component
                .join("kube")
                .join(kind.template_dir())
                .join(path.file_name().unwrap());
            let content = fs::read_to_string(path)?;
            if content.starts_with(&header(&expected)) {
                info!("Removing generated file {}", path.display());
                fs::remove_file(path)?;
            }
        }
    }
    Ok(())
}
