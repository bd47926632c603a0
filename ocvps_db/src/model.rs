use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use sqlx::types::Json;
use std::fmt::{Display, Formatter};

/// Lifecycle state of a VPS row.
///
/// Stored numerically; the values are part of the catalog contract and
/// must not be reordered.
#[derive(Clone, Copy, Debug, sqlx::Type, Serialize, Deserialize, Default, PartialEq, Eq)]
#[repr(u16)]
pub enum VpsStatus {
    #[default]
    Creating = 1,
    Starting = 2,
    Running = 3,
    Stopping = 4,
    Stopped = 5,
    Rebooting = 6,
    Failed = 7,
    Deleting = 8,
    Deleted = 9,
}

impl VpsStatus {
    /// Map a Proxmox `status/current` string onto the catalog enum.
    ///
    /// Anything Proxmox reports outside the known set is treated as a VM
    /// still materializing.
    pub fn from_proxmox(status: &str) -> Self {
        match status {
            "running" => VpsStatus::Running,
            "stopped" | "paused" | "suspended" => VpsStatus::Stopped,
            _ => VpsStatus::Creating,
        }
    }
}

impl Display for VpsStatus {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            VpsStatus::Creating => write!(f, "creating"),
            VpsStatus::Starting => write!(f, "starting"),
            VpsStatus::Running => write!(f, "running"),
            VpsStatus::Stopping => write!(f, "stopping"),
            VpsStatus::Stopped => write!(f, "stopped"),
            VpsStatus::Rebooting => write!(f, "rebooting"),
            VpsStatus::Failed => write!(f, "failed"),
            VpsStatus::Deleting => write!(f, "deleting"),
            VpsStatus::Deleted => write!(f, "deleted"),
        }
    }
}

/// OS image catalog.
#[derive(Clone, Copy, Debug, sqlx::Type, Serialize, Deserialize, Default, PartialEq, Eq)]
#[repr(u16)]
pub enum ImageKind {
    #[default]
    Ubuntu2204 = 1,
    Ubuntu2404 = 2,
    Debian12 = 3,
    Debian13 = 4,
    Rocky9 = 5,
    Alma9 = 6,
    Custom = 99,
}

impl ImageKind {
    /// Name substring used to locate the OS template VM on a node.
    pub fn template_name(&self) -> Option<&'static str> {
        match self {
            ImageKind::Ubuntu2204 => Some("ubuntu-22.04-standard"),
            ImageKind::Ubuntu2404 => Some("ubuntu-24.04-standard"),
            ImageKind::Debian12 => Some("debian-12-standard"),
            ImageKind::Debian13 => Some("debian-13-standard"),
            ImageKind::Rocky9 => Some("rocky-9-standard"),
            ImageKind::Alma9 => Some("alma-9-standard"),
            ImageKind::Custom => None,
        }
    }

    /// Best-effort reverse mapping from a template or VM name, used when
    /// importing VMs that exist only in Proxmox.
    pub fn from_name_hint(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        if name.contains("ubuntu-22") {
            ImageKind::Ubuntu2204
        } else if name.contains("ubuntu-24") {
            ImageKind::Ubuntu2404
        } else if name.contains("debian-12") {
            ImageKind::Debian12
        } else if name.contains("debian-13") {
            ImageKind::Debian13
        } else if name.contains("rocky") {
            ImageKind::Rocky9
        } else if name.contains("alma") {
            ImageKind::Alma9
        } else {
            ImageKind::Custom
        }
    }

    /// Whether the guest installs packages with the apt family.
    pub fn is_apt_family(&self) -> bool {
        matches!(
            self,
            ImageKind::Ubuntu2204 | ImageKind::Ubuntu2404 | ImageKind::Debian12 | ImageKind::Debian13
        )
    }

    /// Whether the guest installs packages with dnf/yum.
    pub fn is_dnf_family(&self) -> bool {
        matches!(self, ImageKind::Rocky9 | ImageKind::Alma9)
    }
}

impl Display for ImageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ImageKind::Ubuntu2204 => write!(f, "ubuntu-22.04"),
            ImageKind::Ubuntu2404 => write!(f, "ubuntu-24.04"),
            ImageKind::Debian12 => write!(f, "debian-12"),
            ImageKind::Debian13 => write!(f, "debian-13"),
            ImageKind::Rocky9 => write!(f, "rocky-9"),
            ImageKind::Alma9 => write!(f, "alma-9"),
            ImageKind::Custom => write!(f, "custom"),
        }
    }
}

/// A tenant-owned virtual machine as recorded in the catalog.
///
/// `vps_id` is the orchestrator-chosen opaque id; `instance_id` is the
/// Proxmox VMID as a string, absent before creation and cleared again on
/// DELETED (VMIDs are reused by Proxmox).
#[derive(FromRow, Clone, Debug, Default)]
pub struct VpsInstance {
    /// Database id
    pub id: u64,
    /// Orchestrator-chosen opaque id, also the Proxmox VM `name`
    pub vps_id: String,
    /// Owning organization
    pub organization_id: String,
    /// User who requested the VPS
    pub created_by: String,
    /// Human-facing name carried in the ownership marker
    pub display_name: String,
    /// Deployment region requested by the tenant
    pub region: String,
    /// Node the VM lives on; absent until placed or discovered
    pub node_id: Option<String>,
    /// Proxmox VMID as a string
    pub instance_id: Option<String>,
    pub cpu_cores: u16,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub image: ImageKind,
    /// Custom image reference when [ImageKind::Custom]
    pub image_id: Option<String>,
    /// Free-form tier label ("s-2vcpu-4gb" etc)
    pub size: String,
    /// Default tenant key injected at creation
    pub ssh_key_id: Option<u64>,
    pub status: VpsStatus,
    /// Cached addresses; authoritative source is gateway, then guest agent
    pub ipv4_addresses: Json<Vec<String>>,
    pub ipv6_addresses: Json<Vec<String>>,
    pub created: DateTime<Utc>,
    pub updated: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl VpsInstance {
    /// Parse the Proxmox VMID out of `instance_id`.
    pub fn vmid(&self) -> Option<u64> {
        self.instance_id.as_deref().and_then(|s| s.parse().ok())
    }

    /// Clear the Proxmox identity after the VM is gone; the row itself
    /// is kept (soft delete).
    pub fn mark_deleted(&mut self) {
        self.status = VpsStatus::Deleted;
        self.instance_id = None;
        self.ipv4_addresses = Json(Vec::new());
        self.ipv6_addresses = Json(Vec::new());
    }
}

/// A DHCP lease registered with a per-node gateway.
///
/// The gateway is authoritative; these rows are the catalog's cache. At
/// most one non-public lease exists per VPS, public leases may coexist.
#[derive(FromRow, Clone, Debug, Default)]
pub struct DhcpLease {
    pub id: u64,
    pub vps_id: String,
    pub organization_id: String,
    /// Unique; generated in the locally-administered KVM range
    pub mac_address: String,
    pub ip_address: String,
    pub is_public: bool,
    pub expires_at: DateTime<Utc>,
    /// Node whose gateway issued the lease
    pub gateway_node: String,
}

/// A tenant SSH public key, scoped org-wide (`vps_id` absent) or to a
/// single VPS. Deduplicated by fingerprint; VPS scope wins on collision.
#[derive(FromRow, Clone, Debug, Default)]
pub struct SshKey {
    pub id: u64,
    pub name: String,
    pub organization_id: String,
    pub vps_id: Option<String>,
    pub fingerprint: String,
    pub public_key: String,
    pub created: DateTime<Utc>,
}

/// Orchestrator-generated keypair for the out-of-band SSH proxy.
/// Required on every VPS.
#[derive(FromRow, Clone, Debug, Default)]
pub struct VpsBastionKey {
    pub id: u64,
    pub vps_id: String,
    pub fingerprint: String,
    pub public_key: String,
    pub private_key: String,
    pub created: DateTime<Utc>,
}

/// Orchestrator-generated keypair for the in-browser terminal.
/// Optional; absence disables the web terminal.
#[derive(FromRow, Clone, Debug, Default)]
pub struct VpsTerminalKey {
    pub id: u64,
    pub vps_id: String,
    pub fingerprint: String,
    pub public_key: String,
    pub private_key: String,
    pub created: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proxmox_status_mapping() {
        assert_eq!(VpsStatus::from_proxmox("running"), VpsStatus::Running);
        assert_eq!(VpsStatus::from_proxmox("stopped"), VpsStatus::Stopped);
        assert_eq!(VpsStatus::from_proxmox("paused"), VpsStatus::Stopped);
        assert_eq!(VpsStatus::from_proxmox("suspended"), VpsStatus::Stopped);
        assert_eq!(VpsStatus::from_proxmox("prelaunch"), VpsStatus::Creating);
    }

    #[test]
    fn image_template_names() {
        assert_eq!(
            ImageKind::Ubuntu2204.template_name(),
            Some("ubuntu-22.04-standard")
        );
        assert_eq!(ImageKind::Custom.template_name(), None);
    }

    #[test]
    fn image_reverse_mapping_from_names() {
        assert_eq!(
            ImageKind::from_name_hint("ubuntu-22.04-standard"),
            ImageKind::Ubuntu2204
        );
        assert_eq!(
            ImageKind::from_name_hint("vps-debian-12-web"),
            ImageKind::Debian12
        );
        assert_eq!(ImageKind::from_name_hint("freebsd-14"), ImageKind::Custom);
    }

    #[test]
    fn mark_deleted_clears_proxmox_identity() {
        let mut vps = VpsInstance {
            instance_id: Some("105".to_string()),
            ipv4_addresses: Json(vec!["10.15.3.20".to_string()]),
            status: VpsStatus::Running,
            ..Default::default()
        };
        vps.mark_deleted();
        assert_eq!(vps.status, VpsStatus::Deleted);
        assert!(vps.instance_id.is_none());
        assert!(vps.ipv4_addresses.0.is_empty());
        assert!(vps.ipv6_addresses.0.is_empty());
    }
}
