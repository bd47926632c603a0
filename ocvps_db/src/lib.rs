mod model;
#[cfg(feature = "mysql")]
mod mysql;

pub use async_trait::async_trait;
pub use model::*;
pub use sqlx::types::Json;
#[cfg(feature = "mysql")]
pub use mysql::*;

use anyhow::Result;

/// The catalog surface consumed by the orchestrator.
///
/// The durable store behind this trait is external to the core; rows are
/// soft-deleted (`deleted_at`) and `(organization_id, vps_id)` is unique,
/// as is `instance_id` over non-deleted rows.
#[async_trait]
pub trait VpsDb: Send + Sync {
    /// Insert a new VPS row, returns the database id
    async fn insert_vps(&self, vps: &VpsInstance) -> Result<u64>;

    /// Fetch a VPS by its orchestrator-chosen id, regardless of status
    async fn get_vps(&self, vps_id: &str) -> Result<Option<VpsInstance>>;

    /// Fetch the non-deleted VPS owning a Proxmox VMID, if any
    async fn get_vps_by_instance_id(&self, instance_id: &str) -> Result<Option<VpsInstance>>;

    /// List all VPS rows not in DELETED state
    async fn list_active_vps(&self) -> Result<Vec<VpsInstance>>;

    /// Update a VPS row
    async fn update_vps(&self, vps: &VpsInstance) -> Result<()>;

    /// Insert or replace a DHCP lease (unique by mac_address)
    async fn upsert_dhcp_lease(&self, lease: &DhcpLease) -> Result<u64>;

    /// Fetch the single non-public lease of a VPS, if present
    async fn get_private_lease(&self, vps_id: &str) -> Result<Option<DhcpLease>>;

    /// List all leases of a VPS
    async fn list_leases(&self, vps_id: &str) -> Result<Vec<DhcpLease>>;

    /// Remove all leases of a VPS
    async fn delete_leases(&self, vps_id: &str) -> Result<()>;

    /// Insert a tenant SSH key, returns the database id
    async fn insert_ssh_key(&self, key: &SshKey) -> Result<u64>;

    /// Get a tenant SSH key by id
    async fn get_ssh_key(&self, id: u64) -> Result<SshKey>;

    /// List org-wide keys (rows with no vps_id)
    async fn list_org_ssh_keys(&self, organization_id: &str) -> Result<Vec<SshKey>>;

    /// List keys scoped to one VPS
    async fn list_vps_ssh_keys(&self, vps_id: &str) -> Result<Vec<SshKey>>;

    /// Delete a tenant SSH key by id
    async fn delete_ssh_key(&self, id: u64) -> Result<()>;

    /// Store the bastion keypair of a VPS
    async fn insert_bastion_key(&self, key: &VpsBastionKey) -> Result<u64>;

    /// Fetch the bastion keypair of a VPS
    async fn get_bastion_key(&self, vps_id: &str) -> Result<Option<VpsBastionKey>>;

    /// Delete the bastion keypair of a VPS
    async fn delete_bastion_key(&self, vps_id: &str) -> Result<()>;

    /// Store the terminal keypair of a VPS
    async fn insert_terminal_key(&self, key: &VpsTerminalKey) -> Result<u64>;

    /// Fetch the terminal keypair of a VPS (absence disables the web terminal)
    async fn get_terminal_key(&self, vps_id: &str) -> Result<Option<VpsTerminalKey>>;

    /// Delete the terminal keypair of a VPS
    async fn delete_terminal_key(&self, vps_id: &str) -> Result<()>;
}
