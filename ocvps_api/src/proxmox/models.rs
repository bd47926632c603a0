//! Serde models for the Proxmox REST surface.
//!
//! Read models deserialize the `{"data": ...}` envelopes; write models
//! serialize to form-encoded bodies, which is why boolean-ish fields are
//! `u8` (Proxmox wants `0`/`1`, not `true`/`false`).

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fmt::{Display, Formatter};

#[derive(Deserialize)]
pub struct ResponseBase<T> {
    pub data: T,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeInfo {
    #[serde(rename = "node")]
    pub name: String,
    pub status: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NodeStorage {
    pub storage: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub content: Option<String>,
    /// Mount point; present for directory-family storages
    pub path: Option<String>,
    /// Backing pool for ZFS storages
    pub pool: Option<String>,
    pub total: Option<u64>,
    pub used: Option<u64>,
    pub avail: Option<u64>,
}

impl NodeStorage {
    pub fn contents(&self) -> Vec<&str> {
        self.content
            .as_deref()
            .unwrap_or("")
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .collect()
    }

    pub fn has_content(&self, kind: &str) -> bool {
        self.contents().iter().any(|c| *c == kind)
    }
}

/// Row from `GET /nodes/{n}/qemu`.
#[derive(Debug, Clone, Deserialize)]
pub struct VmSummary {
    #[serde(rename = "vmid")]
    pub vm_id: u64,
    pub name: Option<String>,
    pub status: String,
    #[serde(default, deserialize_with = "int_flag")]
    pub template: bool,
    pub cpus: Option<u16>,
    #[serde(rename = "maxmem")]
    pub max_mem: Option<u64>,
    #[serde(rename = "maxdisk")]
    pub max_disk: Option<u64>,
    pub uptime: Option<u64>,
}

/// `GET /nodes/{n}/qemu/{v}/status/current`.
#[derive(Debug, Clone, Deserialize)]
pub struct VmStatus {
    pub status: String,
    #[serde(rename = "vmid")]
    pub vm_id: Option<u64>,
    pub uptime: Option<u64>,
}

impl VmStatus {
    pub fn is_running(&self) -> bool {
        self.status == "running"
    }

    pub fn is_stopped(&self) -> bool {
        self.status == "stopped"
    }
}

/// A VM config as Proxmox reports it: an open-ended key/value map.
///
/// Disk keys (`scsi0`, `virtio0`, ...), `unusedN` entries and cloud-init
/// fields all live here; typed accessors cover the keys the orchestrator
/// reads back.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(transparent)]
pub struct VmConfig(pub HashMap<String, Value>);

impl VmConfig {
    pub fn get_str(&self, key: &str) -> Option<String> {
        match self.0.get(key)? {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            Value::Bool(b) => Some(b.to_string()),
            _ => None,
        }
    }

    pub fn get_u64(&self, key: &str) -> Option<u64> {
        match self.0.get(key)? {
            Value::Number(n) => n.as_u64(),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn name(&self) -> Option<String> {
        self.get_str("name")
    }

    pub fn description(&self) -> Option<String> {
        self.get_str("description")
    }

    pub fn digest(&self) -> Option<String> {
        self.get_str("digest")
    }

    pub fn ssh_keys(&self) -> Option<String> {
        self.get_str("sshkeys")
    }

    pub fn net0(&self) -> Option<String> {
        self.get_str("net0")
    }

    pub fn cores(&self) -> Option<u64> {
        self.get_u64("cores")
    }

    /// Memory in MiB; Proxmox reports either a number or a string.
    pub fn memory_mb(&self) -> Option<u64> {
        self.get_u64("memory")
    }

    /// All `unusedN` entries as `(key, volume)` pairs.
    pub fn unused_disks(&self) -> Vec<(String, String)> {
        let mut out: Vec<(String, String)> = self
            .0
            .iter()
            .filter(|(k, _)| k.starts_with("unused") && k[6..].chars().all(|c| c.is_ascii_digit()))
            .filter_map(|(k, v)| Some((k.clone(), v.as_str()?.to_string())))
            .collect();
        out.sort();
        out
    }
}

/// Extract the MAC address from a `net0` device string such as
/// `virtio=BC:24:11:AA:BB:CC,bridge=vmbr0,firewall=1`.
pub fn mac_from_net_device(net: &str) -> Option<String> {
    net.split(',').find_map(|part| {
        let (_, value) = part.split_once('=')?;
        let is_mac = value.len() == 17
            && value.split(':').count() == 6
            && value
                .split(':')
                .all(|o| o.len() == 2 && o.chars().all(|c| c.is_ascii_hexdigit()));
        if is_mac { Some(value.to_string()) } else { None }
    })
}

/// Extract the `size=` token from a disk device string such as
/// `local:100/vm-100-disk-0.qcow2,size=32G`.
pub fn size_token_from_disk(disk: &str) -> Option<String> {
    disk.split(',')
        .find_map(|part| part.strip_prefix("size="))
        .map(String::from)
}

/// The bare volume reference of a disk device string (everything before
/// the first comma).
pub fn volume_from_disk(disk: &str) -> &str {
    disk.split(',').next().unwrap_or(disk)
}

/// Write-side VM configuration; only set fields are submitted.
#[derive(Debug, Clone, Serialize, Default)]
pub struct VmConfigUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cores: Option<u16>,
    /// Memory in MiB
    #[serde(skip_serializing_if = "Option::is_none")]
    pub memory: Option<u64>,
    #[serde(rename = "ostype")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub os_type: Option<String>,
    #[serde(rename = "onboot")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on_boot: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub agent: Option<u8>,
    #[serde(rename = "net0")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub net: Option<String>,
    #[serde(rename = "serial0")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub serial_0: Option<String>,
    #[serde(rename = "ide2")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ide_2: Option<String>,
    #[serde(rename = "ipconfig0")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_config: Option<String>,
    #[serde(rename = "ciuser")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_user: Option<String>,
    #[serde(rename = "ciupgrade")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_upgrade: Option<u8>,
    #[serde(rename = "cicustom")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ci_custom: Option<String>,
    #[serde(rename = "sshkeys")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ssh_keys: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot: Option<String>,
    #[serde(rename = "bootdisk")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub boot_disk: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "scsi0")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scsi_0: Option<String>,
    #[serde(rename = "scsihw")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub scsi_hw: Option<String>,
    /// Comma-separated config keys to remove
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delete: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StorageContentEntry {
    #[serde(rename = "volid")]
    pub vol_id: String,
    pub format: Option<String>,
    pub size: Option<u64>,
    #[serde(rename = "vmid")]
    pub vm_id: Option<u64>,
}

/// A running Proxmox task, identified by UPID.
#[derive(Debug, Clone)]
pub struct TaskId {
    pub id: String,
    pub node: String,
}

impl Display for TaskId {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.id)
    }
}

#[derive(Debug, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Running,
    Stopped,
}

#[derive(Debug, Deserialize)]
pub struct TaskStatus {
    pub status: TaskState,
    #[serde(rename = "exitstatus")]
    pub exit_status: Option<String>,
}

impl TaskStatus {
    pub fn is_finished(&self) -> bool {
        self.status == TaskState::Stopped
    }

    pub fn is_success(&self) -> bool {
        self.is_finished() && self.exit_status.as_deref() == Some("OK")
    }
}

/// `POST /nodes/{n}/qemu/{v}/{vncproxy|termproxy}`.
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyTicket {
    pub ticket: String,
    #[serde(deserialize_with = "int_or_string")]
    pub port: u32,
    pub upid: Option<String>,
    pub user: Option<String>,
}

/// Firewall options for `PUT /nodes/{n}/qemu/{v}/firewall/options`.
#[derive(Debug, Clone, Serialize, Default)]
pub struct FirewallOptions {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dhcp: Option<u8>,
    #[serde(rename = "ipfilter")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_filter: Option<u8>,
    #[serde(rename = "macfilter")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub mac_filter: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ndp: Option<u8>,
    #[serde(rename = "policy_in")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_in: Option<String>,
    #[serde(rename = "policy_out")]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub policy_out: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FirewallRule {
    pub action: String,
    #[serde(rename = "type")]
    pub rule_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub enable: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub proto: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dport: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sport: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dest: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pos: Option<u32>,
}

/// One interface from the guest agent's `network-get-interfaces`.
#[derive(Debug, Clone, Deserialize)]
pub struct AgentInterface {
    pub name: String,
    #[serde(rename = "ip-addresses", default)]
    pub ip_addresses: Vec<AgentIpAddress>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentIpAddress {
    #[serde(rename = "ip-address")]
    pub ip_address: String,
    #[serde(rename = "ip-address-type")]
    pub kind: String,
    pub prefix: Option<u8>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgentInterfaceList {
    #[serde(default)]
    pub result: Vec<AgentInterface>,
}

fn int_flag<'de, D: Deserializer<'de>>(d: D) -> Result<bool, D::Error> {
    let v = Value::deserialize(d)?;
    Ok(match v {
        Value::Bool(b) => b,
        Value::Number(n) => n.as_i64().unwrap_or(0) != 0,
        Value::String(s) => s == "1" || s == "true",
        _ => false,
    })
}

fn int_or_string<'de, D: Deserializer<'de>>(d: D) -> Result<u32, D::Error> {
    let v = Value::deserialize(d)?;
    match v {
        Value::Number(n) => n
            .as_u64()
            .map(|n| n as u32)
            .ok_or_else(|| serde::de::Error::custom("invalid port number")),
        Value::String(s) => s
            .parse()
            .map_err(|_| serde::de::Error::custom("invalid port string")),
        _ => Err(serde::de::Error::custom("unexpected port value")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn template_flag_accepts_int_and_bool() {
        let j = r#"{"vmid": 9000, "name": "ubuntu-22.04-standard", "status": "stopped", "template": 1}"#;
        let vm: VmSummary = serde_json::from_str(j).unwrap();
        assert!(vm.template);

        let j = r#"{"vmid": 100, "name": "web-1", "status": "running"}"#;
        let vm: VmSummary = serde_json::from_str(j).unwrap();
        assert!(!vm.template);
    }

    #[test]
    fn vm_config_accessors() {
        let j = r#"{
            "name": "vps-a1b2",
            "cores": 2,
            "memory": "2048",
            "net0": "virtio=BC:24:11:4E:8F:D1,bridge=OCvpsnet,firewall=1",
            "scsi0": "local:100/vm-100-disk-0.qcow2,size=20G",
            "unused0": "local:100/vm-100-disk-1.qcow2",
            "digest": "abc123"
        }"#;
        let cfg: VmConfig = serde_json::from_str(j).unwrap();
        assert_eq!(cfg.name().as_deref(), Some("vps-a1b2"));
        assert_eq!(cfg.cores(), Some(2));
        assert_eq!(cfg.memory_mb(), Some(2048));
        assert_eq!(
            mac_from_net_device(&cfg.net0().unwrap()).as_deref(),
            Some("BC:24:11:4E:8F:D1")
        );
        assert_eq!(
            cfg.unused_disks(),
            vec![("unused0".to_string(), "local:100/vm-100-disk-1.qcow2".to_string())]
        );
        assert_eq!(
            size_token_from_disk(&cfg.get_str("scsi0").unwrap()).as_deref(),
            Some("20G")
        );
        assert_eq!(
            volume_from_disk(&cfg.get_str("scsi0").unwrap()),
            "local:100/vm-100-disk-0.qcow2"
        );
    }

    #[test]
    fn mac_extraction_ignores_non_mac_values() {
        assert_eq!(
            mac_from_net_device("virtio=00:16:3E:AA:BB:CC,bridge=vmbr0,tag=20"),
            Some("00:16:3E:AA:BB:CC".to_string())
        );
        assert_eq!(mac_from_net_device("bridge=vmbr0,firewall=1"), None);
    }

    #[test]
    fn proxy_port_accepts_string_and_number() {
        let j = r#"{"ticket": "T", "port": "5900"}"#;
        let p: ProxyTicket = serde_json::from_str(j).unwrap();
        assert_eq!(p.port, 5900);

        let j = r#"{"ticket": "T", "port": 5901}"#;
        let p: ProxyTicket = serde_json::from_str(j).unwrap();
        assert_eq!(p.port, 5901);
    }

    #[test]
    fn config_update_serializes_only_set_fields() {
        let upd = VmConfigUpdate {
            ci_user: Some("root".to_string()),
            ip_config: Some("ip=dhcp".to_string()),
            ..Default::default()
        };
        let s = serde_urlencoded::to_string(&upd).unwrap();
        assert!(s.contains("ciuser=root"));
        assert!(s.contains("ipconfig0=ip%3Ddhcp"));
        assert!(!s.contains("name="));
    }
}
