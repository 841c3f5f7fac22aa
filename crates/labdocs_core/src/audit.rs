use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

pub const PROXMOX_NODES_FILE: &str = "proxmox-nodes.json";
pub const PROXMOX_VMS_FILE: &str = "proxmox-vms.json";
pub const K3S_NODES_FILE: &str = "k3s-nodes.txt";
pub const K3S_NAMESPACES_FILE: &str = "k3s-namespaces.txt";
pub const K3S_DEPLOYMENTS_FILE: &str = "k3s-deployments.txt";
pub const K3S_SERVICES_FILE: &str = "k3s-services.txt";
pub const K3S_INGRESSES_FILE: &str = "k3s-ingresses.txt";

const BYTE_UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];

/// How to treat a table line with fewer fields than a record needs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum TableStrictness {
    #[default]
    Lenient,
    Strict,
}

impl TableStrictness {
    pub fn from_strict_flag(strict: bool) -> Self {
        if strict { Self::Strict } else { Self::Lenient }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ProxmoxNode {
    pub name: String,
    pub ip: String,
    pub status: String,
    pub cpu_usage: f64,
    pub mem_used: String,
    pub mem_total: String,
    pub disk_used: String,
    pub disk_total: String,
    pub uptime: String,
    pub cpu_cores: String,
    pub storage_pools: Vec<String>,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct VirtualMachine {
    pub name: String,
    pub vmid: String,
    pub status: String,
    pub ip: String,
    pub cpu: u64,
    pub memory: String,
    pub node: String,
    pub purpose: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ClusterNode {
    pub name: String,
    pub status: String,
    pub role: String,
    pub version: String,
    pub ip: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Namespace {
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Deployment {
    pub namespace: String,
    pub name: String,
    pub ready: String,
    pub image: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Service {
    pub namespace: String,
    pub name: String,
    #[serde(rename = "type")]
    pub service_type: String,
    pub cluster_ip: String,
    pub external_ip: String,
    pub ports: String,
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct Ingress {
    pub namespace: String,
    pub name: String,
    pub host: String,
    pub address: String,
}

#[derive(Debug, Deserialize, Default)]
struct RawProxmoxNode {
    node: Option<String>,
    ip: Option<String>,
    status: Option<String>,
    cpu: Option<f64>,
    mem: Option<f64>,
    maxmem: Option<f64>,
    disk: Option<f64>,
    maxdisk: Option<f64>,
    uptime: Option<f64>,
    maxcpu: Option<Value>,
}

#[derive(Debug, Deserialize, Default)]
struct RawVirtualMachine {
    name: Option<String>,
    vmid: Option<Value>,
    status: Option<String>,
    ip: Option<String>,
    cpus: Option<f64>,
    maxmem: Option<f64>,
    node: Option<String>,
    description: Option<String>,
}

/// Reads audit files from one results directory.
#[derive(Debug, Clone)]
pub struct AuditReader {
    results_dir: PathBuf,
    strictness: TableStrictness,
}

impl AuditReader {
    pub fn new(results_dir: impl Into<PathBuf>, strictness: TableStrictness) -> Self {
        Self {
            results_dir: results_dir.into(),
            strictness,
        }
    }

    pub fn results_dir(&self) -> &Path {
        &self.results_dir
    }

    pub fn proxmox_nodes(&self) -> Result<Vec<ProxmoxNode>> {
        match self.read_text(PROXMOX_NODES_FILE)? {
            Some(text) => parse_proxmox_nodes(&text)
                .with_context(|| format!("failed to parse {}", self.path(PROXMOX_NODES_FILE))),
            None => Ok(Vec::new()),
        }
    }

    pub fn vms(&self) -> Result<Vec<VirtualMachine>> {
        match self.read_text(PROXMOX_VMS_FILE)? {
            Some(text) => parse_vms(&text)
                .with_context(|| format!("failed to parse {}", self.path(PROXMOX_VMS_FILE))),
            None => Ok(Vec::new()),
        }
    }

    pub fn k3s_nodes(&self) -> Result<Vec<ClusterNode>> {
        self.parse_table_file(K3S_NODES_FILE, parse_k3s_nodes)
    }

    pub fn k3s_namespaces(&self) -> Result<Vec<Namespace>> {
        self.parse_table_file(K3S_NAMESPACES_FILE, parse_k3s_namespaces)
    }

    pub fn k3s_deployments(&self) -> Result<Vec<Deployment>> {
        self.parse_table_file(K3S_DEPLOYMENTS_FILE, parse_k3s_deployments)
    }

    pub fn k3s_services(&self) -> Result<Vec<Service>> {
        self.parse_table_file(K3S_SERVICES_FILE, parse_k3s_services)
    }

    pub fn k3s_ingresses(&self) -> Result<Vec<Ingress>> {
        self.parse_table_file(K3S_INGRESSES_FILE, parse_k3s_ingresses)
    }

    fn parse_table_file<T>(
        &self,
        filename: &str,
        parse: fn(&str, TableStrictness) -> Result<Vec<T>>,
    ) -> Result<Vec<T>> {
        match self.read_text(filename)? {
            Some(text) => parse(&text, self.strictness)
                .with_context(|| format!("failed to parse {}", self.path(filename))),
            None => Ok(Vec::new()),
        }
    }

    fn read_text(&self, filename: &str) -> Result<Option<String>> {
        let path = self.results_dir.join(filename);
        if !path.exists() {
            debug!(path = %path.display(), "audit file absent");
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        Ok(Some(text))
    }

    fn path(&self, filename: &str) -> String {
        self.results_dir.join(filename).display().to_string()
    }
}

pub fn parse_proxmox_nodes(json: &str) -> Result<Vec<ProxmoxNode>> {
    let raw: Vec<RawProxmoxNode> = parse_json_array(json)?;
    Ok(raw
        .into_iter()
        .map(|node| ProxmoxNode {
            name: node.node.unwrap_or_else(|| "unknown".to_string()),
            ip: node.ip.unwrap_or_else(|| "N/A".to_string()),
            status: node.status.unwrap_or_else(|| "unknown".to_string()),
            cpu_usage: round_one_decimal(node.cpu.unwrap_or(0.0) * 100.0),
            mem_used: format_bytes(whole(node.mem, 0)),
            mem_total: format_bytes(whole(node.maxmem, 0)),
            disk_used: format_bytes(whole(node.disk, 0)),
            disk_total: format_bytes(whole(node.maxdisk, 0)),
            uptime: format_uptime(whole(node.uptime, 0)),
            cpu_cores: scalar_to_string(node.maxcpu.as_ref(), "N/A"),
            storage_pools: Vec::new(),
        })
        .collect())
}

/// VMs come back sorted by name.
pub fn parse_vms(json: &str) -> Result<Vec<VirtualMachine>> {
    let raw: Vec<RawVirtualMachine> = parse_json_array(json)?;
    let mut vms = raw
        .into_iter()
        .map(|vm| VirtualMachine {
            name: vm.name.unwrap_or_else(|| "unknown".to_string()),
            vmid: scalar_to_string(vm.vmid.as_ref(), "N/A"),
            status: vm.status.unwrap_or_else(|| "unknown".to_string()),
            ip: vm.ip.unwrap_or_default(),
            cpu: whole(vm.cpus, 1),
            memory: format_bytes(whole(vm.maxmem, 0)),
            node: vm.node.unwrap_or_else(|| "unknown".to_string()),
            purpose: vm.description.unwrap_or_default(),
        })
        .collect::<Vec<_>>();
    vms.sort_by(|left, right| left.name.cmp(&right.name));
    Ok(vms)
}

pub fn group_vms_by_node(vms: &[VirtualMachine]) -> BTreeMap<String, Vec<VirtualMachine>> {
    let mut by_node: BTreeMap<String, Vec<VirtualMachine>> = BTreeMap::new();
    for vm in vms {
        by_node.entry(vm.node.clone()).or_default().push(vm.clone());
    }
    by_node
}

pub fn parse_k3s_nodes(text: &str, strictness: TableStrictness) -> Result<Vec<ClusterNode>> {
    parse_table(text, 5, strictness, |fields| ClusterNode {
        name: fields[0].to_string(),
        status: fields[1].to_string(),
        role: if fields[2] == "<none>" {
            "worker".to_string()
        } else {
            fields[2].to_string()
        },
        version: fields[4].to_string(),
        ip: field_or(fields, 5, "N/A"),
    })
}

pub fn parse_k3s_namespaces(text: &str, strictness: TableStrictness) -> Result<Vec<Namespace>> {
    parse_table(text, 2, strictness, |fields| Namespace {
        name: fields[0].to_string(),
        status: fields[1].to_string(),
    })
}

pub fn parse_k3s_deployments(text: &str, strictness: TableStrictness) -> Result<Vec<Deployment>> {
    parse_table(text, 4, strictness, |fields| Deployment {
        namespace: fields[0].to_string(),
        name: fields[1].to_string(),
        ready: fields[2].to_string(),
        image: fields[3].to_string(),
    })
}

pub fn parse_k3s_services(text: &str, strictness: TableStrictness) -> Result<Vec<Service>> {
    parse_table(text, 5, strictness, |fields| Service {
        namespace: fields[0].to_string(),
        name: fields[1].to_string(),
        service_type: fields[2].to_string(),
        cluster_ip: fields[3].to_string(),
        external_ip: if fields[4] == "<none>" {
            String::new()
        } else {
            fields[4].to_string()
        },
        ports: field_or(fields, 5, ""),
    })
}

pub fn parse_k3s_ingresses(text: &str, strictness: TableStrictness) -> Result<Vec<Ingress>> {
    parse_table(text, 4, strictness, |fields| Ingress {
        namespace: fields[0].to_string(),
        name: fields[1].to_string(),
        host: fields[3].to_string(),
        address: field_or(fields, 4, ""),
    })
}

/// Human-readable byte count, dividing by 1024 until the shown value is below
/// 1024 (capped at PB).
pub fn format_bytes(bytes: u64) -> String {
    let mut value = bytes as f64;
    for unit in BYTE_UNITS {
        // Compare what gets printed so 1048575 reads 1.0MB, not 1024.0KB.
        let shown = round_one_decimal(value);
        if shown < 1024.0 {
            return format!("{shown:.1}{unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.1}PB")
}

/// Whole days and hours; minutes and seconds are dropped.
pub fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86_400;
    let hours = (seconds % 86_400) / 3_600;
    format!("{days}d {hours}h")
}

// The first non-blank line is the header. Blank lines carry no record in either
// mode; line numbers count from the top of the file.
fn parse_table<T, F>(
    text: &str,
    min_fields: usize,
    strictness: TableStrictness,
    build: F,
) -> Result<Vec<T>>
where
    F: Fn(&[&str]) -> T,
{
    let mut records = Vec::new();
    let mut lines = text
        .lines()
        .enumerate()
        .skip_while(|(_, line)| line.trim().is_empty());
    lines.next();
    for (index, line) in lines {
        let fields = line.split_whitespace().collect::<Vec<_>>();
        if fields.is_empty() {
            continue;
        }
        if fields.len() < min_fields {
            let line_number = index + 1;
            match strictness {
                TableStrictness::Strict => bail!(
                    "line {line_number} has {} fields, expected at least {min_fields}: {line:?}",
                    fields.len()
                ),
                TableStrictness::Lenient => {
                    debug!(line_number, fields = fields.len(), min_fields, "skipping short table line");
                    continue;
                }
            }
        }
        records.push(build(&fields));
    }
    Ok(records)
}

// JSON numbers may arrive as floats (`2147483648.0`); counts are whole.
fn whole(value: Option<f64>, default: u64) -> u64 {
    match value {
        Some(value) if value.is_finite() && value >= 0.0 => value.round() as u64,
        Some(_) => 0,
        None => default,
    }
}

fn parse_json_array<T: DeserializeOwned>(json: &str) -> Result<Vec<T>> {
    if json.trim().is_empty() {
        return Ok(Vec::new());
    }
    let parsed: Option<Vec<T>> =
        serde_json::from_str(json).context("malformed audit JSON")?;
    Ok(parsed.unwrap_or_default())
}

fn field_or(fields: &[&str], index: usize, default: &str) -> String {
    fields.get(index).copied().unwrap_or(default).to_string()
}

fn scalar_to_string(value: Option<&Value>, default: &str) -> String {
    match value {
        None | Some(Value::Null) => default.to_string(),
        Some(Value::String(text)) => text.clone(),
        Some(other) => other.to_string(),
    }
}

fn round_one_decimal(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}
