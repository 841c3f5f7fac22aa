use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use minijinja::{Environment, path_loader};
use serde::Serialize;

/// Renders Jinja-style page templates from one directory.
pub struct TemplateRenderer {
    env: Environment<'static>,
    templates_dir: PathBuf,
}

impl TemplateRenderer {
    pub fn new(templates_dir: &Path) -> Self {
        let mut env = Environment::new();
        env.set_loader(path_loader(templates_dir));
        Self {
            env,
            templates_dir: templates_dir.to_path_buf(),
        }
    }

    /// `reference` may be a path; only its file name is looked up.
    pub fn render<S: Serialize>(&self, reference: &str, context: &S) -> Result<String> {
        let name = template_name(reference)?;
        let template = self.env.get_template(&name).with_context(|| {
            format!(
                "template `{name}` not found in {}",
                self.templates_dir.display()
            )
        })?;
        template
            .render(context)
            .with_context(|| format!("failed to render template `{name}`"))
    }
}

pub fn template_name(reference: &str) -> Result<String> {
    let name = Path::new(reference.trim())
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or_default();
    if name.is_empty() {
        bail!("invalid template reference: {reference:?}");
    }
    Ok(name.to_string())
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;
    use serde_json::json;
    use tempfile::tempdir;

    #[test]
    fn template_name_uses_final_component() {
        assert_eq!(
            template_name("templates/proxmox-nodes.md.j2").expect("name"),
            "proxmox-nodes.md.j2"
        );
        assert_eq!(template_name("vms.md").expect("name"), "vms.md");
        assert!(template_name("  ").is_err());
    }

    #[test]
    fn renders_context_values_and_loops() {
        let temp = tempdir().expect("tempdir");
        fs::write(
            temp.path().join("nodes.md.j2"),
            "# Nodes ({{ updated_at }})\n{% for node in nodes %}- {{ node.name }}: {{ node.status }}\n{% endfor %}",
        )
        .expect("write template");

        let renderer = TemplateRenderer::new(temp.path());
        let output = renderer
            .render(
                "templates/nodes.md.j2",
                &json!({
                    "updated_at": "2026-01-01 00:00:00",
                    "nodes": [{"name": "pve1", "status": "online"}],
                }),
            )
            .expect("render");
        assert_eq!(output, "# Nodes (2026-01-01 00:00:00)\n- pve1: online\n");
    }

    #[test]
    fn missing_template_is_a_lookup_error() {
        let temp = tempdir().expect("tempdir");
        let renderer = TemplateRenderer::new(temp.path());
        let error = renderer
            .render("absent.md.j2", &json!({}))
            .expect_err("must fail");
        assert!(error.to_string().contains("template `absent.md.j2` not found"));
    }
}
