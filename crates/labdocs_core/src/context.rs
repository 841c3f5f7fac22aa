use std::collections::BTreeMap;

use anyhow::Result;
use chrono::Local;
use serde::Serialize;
use tracing::debug;

use crate::audit::{
    AuditReader, ClusterNode, Deployment, Ingress, Namespace, ProxmoxNode, Service,
    VirtualMachine, group_vms_by_node,
};

pub const K3S_VERSION: &str = "v1.33.3+k3s1";
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

/// Everything a page template can reference.
#[derive(Debug, Clone, Serialize)]
pub struct DocsContext {
    pub updated_at: String,
    pub nodes: Vec<ProxmoxNode>,
    pub vms: Vec<VirtualMachine>,
    pub vms_by_node: BTreeMap<String, Vec<VirtualMachine>>,
    pub k3s_version: String,
    pub k3s_nodes: Vec<ClusterNode>,
    pub namespaces: Vec<Namespace>,
    pub deployments: Vec<Deployment>,
    pub services: Vec<Service>,
    pub ingresses: Vec<Ingress>,
}

pub fn build_context(reader: &AuditReader) -> Result<DocsContext> {
    let updated_at = Local::now().format(TIMESTAMP_FORMAT).to_string();
    build_context_with_timestamp(reader, updated_at)
}

pub fn build_context_with_timestamp(reader: &AuditReader, updated_at: String) -> Result<DocsContext> {
    let vms = reader.vms()?;
    let vms_by_node = group_vms_by_node(&vms);
    let context = DocsContext {
        updated_at,
        nodes: reader.proxmox_nodes()?,
        vms,
        vms_by_node,
        k3s_version: K3S_VERSION.to_string(),
        k3s_nodes: reader.k3s_nodes()?,
        namespaces: reader.k3s_namespaces()?,
        deployments: reader.k3s_deployments()?,
        services: reader.k3s_services()?,
        ingresses: reader.k3s_ingresses()?,
    };
    debug!(
        results_dir = %reader.results_dir().display(),
        nodes = context.nodes.len(),
        vms = context.vms.len(),
        k3s_nodes = context.k3s_nodes.len(),
        deployments = context.deployments.len(),
        "built docs context"
    );
    Ok(context)
}

#[cfg(test)]
mod tests {
    use std::fs;
    use std::path::Path;

    use super::*;
    use crate::audit::{
        K3S_NAMESPACES_FILE, PROXMOX_NODES_FILE, PROXMOX_VMS_FILE, TableStrictness,
    };
    use crate::render::TemplateRenderer;
    use tempfile::tempdir;

    #[test]
    fn context_combines_every_parser() {
        let temp = tempdir().expect("tempdir");
        fs::write(
            temp.path().join(PROXMOX_NODES_FILE),
            r#"[{"node":"pve1","status":"online"}]"#,
        )
        .expect("write nodes");
        fs::write(
            temp.path().join(PROXMOX_VMS_FILE),
            r#"[{"name":"b","node":"pve1"},{"name":"a","node":"pve2"}]"#,
        )
        .expect("write vms");
        fs::write(
            temp.path().join(K3S_NAMESPACES_FILE),
            "NAME STATUS AGE\ndefault Active 3d\n",
        )
        .expect("write namespaces");

        let reader = AuditReader::new(temp.path(), TableStrictness::Lenient);
        let context =
            build_context_with_timestamp(&reader, "2026-01-01 00:00:00".to_string()).expect("context");
        assert_eq!(context.updated_at, "2026-01-01 00:00:00");
        assert_eq!(context.k3s_version, K3S_VERSION);
        assert_eq!(context.nodes.len(), 1);
        assert_eq!(context.vms[0].name, "a");
        assert_eq!(context.vms_by_node.keys().collect::<Vec<_>>(), vec!["pve1", "pve2"]);
        assert_eq!(context.namespaces.len(), 1);
        assert!(context.services.is_empty());

        let json = serde_json::to_value(&context).expect("serialize");
        assert_eq!(json["vms_by_node"]["pve1"][0]["name"], "b");
    }

    #[test]
    fn bundled_templates_render_against_context() {
        let temp = tempdir().expect("tempdir");
        fs::write(
            temp.path().join(PROXMOX_VMS_FILE),
            r#"[{"name":"k3s-server","vmid":101,"node":"pve1","cpus":4,"maxmem":8589934592}]"#,
        )
        .expect("write vms");
        let reader = AuditReader::new(temp.path(), TableStrictness::Lenient);
        let context =
            build_context_with_timestamp(&reader, "2026-01-01 00:00:00".to_string()).expect("context");

        let templates = Path::new(env!("CARGO_MANIFEST_DIR")).join("../../templates");
        let renderer = TemplateRenderer::new(&templates);
        for name in [
            "proxmox-nodes.md.j2",
            "vm-inventory.md.j2",
            "k3s-cluster.md.j2",
            "k3s-services.md.j2",
        ] {
            let output = renderer.render(name, &context).expect(name);
            assert!(output.contains("2026-01-01 00:00:00"), "{name}");
        }
        let inventory = renderer
            .render("templates/vm-inventory.md.j2", &context)
            .expect("inventory");
        assert!(inventory.contains("| k3s-server | 101 |"));
        assert!(inventory.contains("8.0GB"));
    }

    #[test]
    fn parser_failures_propagate() {
        let temp = tempdir().expect("tempdir");
        fs::write(temp.path().join(PROXMOX_VMS_FILE), "[oops").expect("write vms");
        let reader = AuditReader::new(temp.path(), TableStrictness::Lenient);
        assert!(build_context(&reader).is_err());
    }
}
