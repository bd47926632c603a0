//! In-memory catalog used by tests.

use anyhow::Result;
use ocvps_db::{
    DhcpLease, SshKey, VpsBastionKey, VpsDb, VpsInstance, VpsStatus, VpsTerminalKey, async_trait,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::Mutex;

#[derive(Default)]
struct Inner {
    vps: HashMap<String, VpsInstance>,
    leases: Vec<DhcpLease>,
    ssh_keys: Vec<SshKey>,
    bastion_keys: HashMap<String, VpsBastionKey>,
    terminal_keys: HashMap<String, VpsTerminalKey>,
}

#[derive(Default)]
pub struct MockVpsDb {
    inner: Mutex<Inner>,
    next_id: AtomicU64,
}

impl MockVpsDb {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            next_id: AtomicU64::new(1),
        }
    }

    fn id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    pub async fn put_vps(&self, vps: VpsInstance) {
        self.inner.lock().await.vps.insert(vps.vps_id.clone(), vps);
    }
}

#[async_trait]
impl VpsDb for MockVpsDb {
    async fn insert_vps(&self, vps: &VpsInstance) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut vps = vps.clone();
        vps.id = self.id();
        let id = vps.id;
        inner.vps.insert(vps.vps_id.clone(), vps);
        Ok(id)
    }

    async fn get_vps(&self, vps_id: &str) -> Result<Option<VpsInstance>> {
        Ok(self.inner.lock().await.vps.get(vps_id).cloned())
    }

    async fn get_vps_by_instance_id(&self, instance_id: &str) -> Result<Option<VpsInstance>> {
        Ok(self
            .inner
            .lock()
            .await
            .vps
            .values()
            .find(|v| {
                v.status != VpsStatus::Deleted && v.instance_id.as_deref() == Some(instance_id)
            })
            .cloned())
    }

    async fn list_active_vps(&self) -> Result<Vec<VpsInstance>> {
        Ok(self
            .inner
            .lock()
            .await
            .vps
            .values()
            .filter(|v| v.status != VpsStatus::Deleted)
            .cloned()
            .collect())
    }

    async fn update_vps(&self, vps: &VpsInstance) -> Result<()> {
        self.inner
            .lock()
            .await
            .vps
            .insert(vps.vps_id.clone(), vps.clone());
        Ok(())
    }

    async fn upsert_dhcp_lease(&self, lease: &DhcpLease) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        inner.leases.retain(|l| l.mac_address != lease.mac_address);
        let mut lease = lease.clone();
        lease.id = self.id();
        let id = lease.id;
        inner.leases.push(lease);
        Ok(id)
    }

    async fn get_private_lease(&self, vps_id: &str) -> Result<Option<DhcpLease>> {
        Ok(self
            .inner
            .lock()
            .await
            .leases
            .iter()
            .find(|l| l.vps_id == vps_id && !l.is_public)
            .cloned())
    }

    async fn list_leases(&self, vps_id: &str) -> Result<Vec<DhcpLease>> {
        Ok(self
            .inner
            .lock()
            .await
            .leases
            .iter()
            .filter(|l| l.vps_id == vps_id)
            .cloned()
            .collect())
    }

    async fn delete_leases(&self, vps_id: &str) -> Result<()> {
        self.inner.lock().await.leases.retain(|l| l.vps_id != vps_id);
        Ok(())
    }

    async fn insert_ssh_key(&self, key: &SshKey) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut key = key.clone();
        key.id = self.id();
        let id = key.id;
        inner.ssh_keys.push(key);
        Ok(id)
    }

    async fn get_ssh_key(&self, id: u64) -> Result<SshKey> {
        self.inner
            .lock()
            .await
            .ssh_keys
            .iter()
            .find(|k| k.id == id)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("ssh key {} not found", id))
    }

    async fn list_org_ssh_keys(&self, organization_id: &str) -> Result<Vec<SshKey>> {
        Ok(self
            .inner
            .lock()
            .await
            .ssh_keys
            .iter()
            .filter(|k| k.organization_id == organization_id && k.vps_id.is_none())
            .cloned()
            .collect())
    }

    async fn list_vps_ssh_keys(&self, vps_id: &str) -> Result<Vec<SshKey>> {
        Ok(self
            .inner
            .lock()
            .await
            .ssh_keys
            .iter()
            .filter(|k| k.vps_id.as_deref() == Some(vps_id))
            .cloned()
            .collect())
    }

    async fn delete_ssh_key(&self, id: u64) -> Result<()> {
        self.inner.lock().await.ssh_keys.retain(|k| k.id != id);
        Ok(())
    }

    async fn insert_bastion_key(&self, key: &VpsBastionKey) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut key = key.clone();
        key.id = self.id();
        let id = key.id;
        inner.bastion_keys.insert(key.vps_id.clone(), key);
        Ok(id)
    }

    async fn get_bastion_key(&self, vps_id: &str) -> Result<Option<VpsBastionKey>> {
        Ok(self.inner.lock().await.bastion_keys.get(vps_id).cloned())
    }

    async fn delete_bastion_key(&self, vps_id: &str) -> Result<()> {
        self.inner.lock().await.bastion_keys.remove(vps_id);
        Ok(())
    }

    async fn insert_terminal_key(&self, key: &VpsTerminalKey) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let mut key = key.clone();
        key.id = self.id();
        let id = key.id;
        inner.terminal_keys.insert(key.vps_id.clone(), key);
        Ok(id)
    }

    async fn get_terminal_key(&self, vps_id: &str) -> Result<Option<VpsTerminalKey>> {
        Ok(self.inner.lock().await.terminal_keys.get(vps_id).cloned())
    }

    async fn delete_terminal_key(&self, vps_id: &str) -> Result<()> {
        self.inner.lock().await.terminal_keys.remove(vps_id);
        Ok(())
    }
}
