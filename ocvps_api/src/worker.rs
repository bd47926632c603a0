//! Reconciliation loops.
//!
//! Three independent sweepers keep the catalog converging on what
//! Proxmox actually reports: status sync (status, node discovery,
//! IP caches, out-of-band deletions), import (adopt VMs carrying the
//! ownership marker that the catalog has never seen), and the lease
//! reconciler (re-register DHCP leases the gateway lost). Per-VPS
//! errors are logged and swallowed; the loops only exit when the root
//! shutdown signal fires.

use crate::clients::NodeClients;
use crate::disks::BOOT_DISK_KEYS;
use crate::provisioner::{VpsProvisioner, parse_vps_description};
use crate::proxmox::{
    FirewallOptions, FirewallRule, ProxmoxClient, mac_from_net_device, size_token_from_disk,
};
use anyhow::Result;
use chrono::{Duration as ChronoDuration, Utc};
use log::{info, warn};
use ocvps_common::{MB, parse_size_bytes};
use ocvps_db::{DhcpLease, ImageKind, VpsDb, VpsInstance, VpsStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

const STATUS_SYNC_INTERVAL: Duration = Duration::from_secs(120);
const IMPORT_INTERVAL: Duration = Duration::from_secs(300);
const LEASE_INTERVAL: Duration = Duration::from_secs(300);

/// Default firewall posture for tenant VMs: firewall on, DHCP and NDP
/// allowed, accept policy, plus one explicit inbound accept rule
/// (added idempotently).
pub async fn apply_default_firewall(client: &Arc<ProxmoxClient>, vmid: u64) -> Result<()> {
    client
        .set_firewall_options(
            vmid,
            &FirewallOptions {
                enable: Some(1),
                dhcp: Some(1),
                ndp: Some(1),
                policy_in: Some("ACCEPT".to_string()),
                policy_out: Some("ACCEPT".to_string()),
                ..Default::default()
            },
        )
        .await
        .map_err(|e| e.into_inner())?;

    let rules = client
        .list_firewall_rules(vmid)
        .await
        .map_err(|e| e.into_inner())?;
    let exists = rules
        .iter()
        .any(|r| r.action == "ACCEPT" && r.rule_type == "in" && r.proto.is_none());
    if !exists {
        client
            .add_firewall_rule(
                vmid,
                &FirewallRule {
                    action: "ACCEPT".to_string(),
                    rule_type: "in".to_string(),
                    enable: Some(1),
                    comment: Some("default inbound accept".to_string()),
                    ..Default::default()
                },
            )
            .await
            .map_err(|e| e.into_inner())?;
    }
    Ok(())
}

pub struct Reconciler {
    db: Arc<dyn VpsDb>,
    provisioner: Arc<VpsProvisioner>,
    clients: Arc<NodeClients>,
}

impl Reconciler {
    pub fn new(
        db: Arc<dyn VpsDb>,
        provisioner: Arc<VpsProvisioner>,
        clients: Arc<NodeClients>,
    ) -> Self {
        Self {
            db,
            provisioner,
            clients,
        }
    }

    /// Spawn all three loops; they stop when `shutdown` flips.
    pub fn spawn_all(self: &Arc<Self>, shutdown: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        vec![
            self.clone().spawn_status_sync(shutdown.clone()),
            self.clone().spawn_import(shutdown.clone()),
            self.clone().spawn_lease_reconciler(shutdown),
        ]
    }

    fn spawn_status_sync(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(STATUS_SYNC_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.status_sync_tick().await {
                            warn!("status sync tick failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("status sync loop stopping");
                        return;
                    }
                }
            }
        })
    }

    fn spawn_import(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(IMPORT_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.import_tick().await {
                            warn!("import tick failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("import loop stopping");
                        return;
                    }
                }
            }
        })
    }

    fn spawn_lease_reconciler(
        self: Arc<Self>,
        mut shutdown: watch::Receiver<bool>,
    ) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(LEASE_INTERVAL);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        if let Err(e) = self.lease_tick().await {
                            warn!("lease reconciler tick failed: {}", e);
                        }
                    }
                    _ = shutdown.changed() => {
                        info!("lease reconciler loop stopping");
                        return;
                    }
                }
            }
        })
    }

    /// One pass of status synchronization over every live row.
    pub async fn status_sync_tick(&self) -> Result<()> {
        let rows = self.db.list_active_vps().await?;
        for mut vps in rows {
            if vps.vmid().is_none() {
                continue;
            }
            if let Err(e) = self.provisioner.sync_vps_status(&mut vps).await {
                warn!("vps {}: status sync failed: {}", vps.vps_id, e);
            }
        }
        Ok(())
    }

    /// One pass of the importer over every node.
    pub async fn import_tick(&self) -> Result<()> {
        for node in self.clients.settings().nodes() {
            let client = match self.clients.proxmox(&node).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("import: cannot reach node {}: {}", node, e);
                    continue;
                }
            };
            let vms = match client.list_vms().await {
                Ok(v) => v,
                Err(e) => {
                    warn!("import: listing VMs on {} failed: {}", node, e);
                    continue;
                }
            };

            for vm in vms.into_iter().filter(|vm| !vm.template) {
                if let Err(e) = self.try_import(&client, &node, vm.vm_id, vm.status.clone()).await
                {
                    warn!("import: VM {} on {} skipped: {}", vm.vm_id, node, e);
                }
            }
        }
        Ok(())
    }

    async fn try_import(
        &self,
        client: &Arc<ProxmoxClient>,
        node: &str,
        vmid: u64,
        proxmox_status: String,
    ) -> Result<()> {
        let config = client
            .get_vm_config(vmid)
            .await
            .map_err(|e| e.into_inner())?;

        // only VMs carrying our ownership marker are ever considered
        let Some(marker) = config.description().as_deref().and_then(parse_vps_description)
        else {
            return Ok(());
        };
        // a marker with a disagreeing VM name is foreign too
        if config.name().as_deref() != Some(marker.vps_id.as_str()) {
            return Ok(());
        }

        if self.db.get_vps(&marker.vps_id).await?.is_some() {
            return Ok(());
        }
        if let Some(other) = self.db.get_vps_by_instance_id(&vmid.to_string()).await? {
            warn!(
                "import: VMID {} already claimed by VPS '{}', skipping '{}'",
                vmid, other.vps_id, marker.vps_id
            );
            return Ok(());
        }

        let disk_bytes = BOOT_DISK_KEYS
            .iter()
            .filter_map(|k| config.get_str(k))
            .filter(|v| !v.contains("cloudinit"))
            .filter_map(|v| size_token_from_disk(&v))
            .filter_map(|s| parse_size_bytes(&s).ok())
            .next()
            .unwrap_or(0);

        let name_hint = config.name().unwrap_or_default();
        let now = Utc::now();
        let vps = VpsInstance {
            vps_id: marker.vps_id.clone(),
            organization_id: marker.organization_id,
            created_by: marker.creator_id,
            display_name: marker.display_name,
            region: self
                .clients
                .settings()
                .region_of(node)
                .unwrap_or_default(),
            node_id: Some(node.to_string()),
            instance_id: Some(vmid.to_string()),
            cpu_cores: config.cores().unwrap_or(1) as u16,
            memory_bytes: config.memory_mb().unwrap_or(0) * MB,
            disk_bytes,
            image: ImageKind::from_name_hint(&name_hint),
            size: String::new(),
            status: VpsStatus::from_proxmox(&proxmox_status),
            created: now,
            updated: now,
            ..Default::default()
        };
        self.db.insert_vps(&vps).await?;
        info!(
            "import: adopted VM {} on {} as VPS '{}' (org {})",
            vmid, node, vps.vps_id, vps.organization_id
        );

        // first observation of this VM: Proxmox is the key authority
        if let Err(e) = crate::ssh_keys::seed_keys_from_proxmox(client, &self.db, &vps).await {
            warn!("vps {}: ssh key seeding failed: {}", vps.vps_id, e);
        }
        Ok(())
    }

    /// One pass of the lease reconciler: every live row with a VM but
    /// no private lease gets re-registered with its node's gateway.
    pub async fn lease_tick(&self) -> Result<()> {
        let rows = self.db.list_active_vps().await?;
        for mut vps in rows {
            if vps.vmid().is_none() {
                continue;
            }
            if let Err(e) = self.reconcile_lease(&mut vps).await {
                warn!("vps {}: lease reconciliation failed: {}", vps.vps_id, e);
            }
        }
        Ok(())
    }

    async fn reconcile_lease(&self, vps: &mut VpsInstance) -> Result<()> {
        if self.db.get_private_lease(&vps.vps_id).await?.is_some() {
            return Ok(());
        }

        if vps.node_id.is_none() {
            let Some(vmid) = vps.vmid() else { return Ok(()) };
            match self.provisioner.find_vm_node(vmid).await? {
                Some(node) => {
                    vps.node_id = Some(node);
                    self.db.update_vps(vps).await?;
                }
                None => return Ok(()),
            }
        }
        let node = vps.node_id.clone().unwrap_or_default();

        let Some(gateway) = self.clients.gateway(&node).await? else {
            return Ok(());
        };
        let client = self.clients.proxmox(&node).await?;
        let vmid = vps.vmid().unwrap_or_default();

        let config = client
            .get_vm_config(vmid)
            .await
            .map_err(|e| e.into_inner())?;
        let Some(mac) = config.net0().as_deref().and_then(mac_from_net_device) else {
            warn!("vps {}: net0 carries no MAC, cannot re-register lease", vps.vps_id);
            return Ok(());
        };

        let alloc = match gateway
            .allocate_ip(&vps.vps_id, &vps.organization_id, &mac)
            .await
        {
            Ok(a) => a,
            Err(e) => {
                warn!("vps {}: gateway re-registration failed: {}", vps.vps_id, e);
                return Ok(());
            }
        };

        self.db
            .upsert_dhcp_lease(&DhcpLease {
                vps_id: vps.vps_id.clone(),
                organization_id: vps.organization_id.clone(),
                mac_address: mac.clone(),
                ip_address: alloc.ip_address.clone(),
                is_public: false,
                expires_at: alloc
                    .lease_expires
                    .unwrap_or_else(|| Utc::now() + ChronoDuration::hours(24)),
                gateway_node: node,
                ..Default::default()
            })
            .await?;
        info!(
            "vps {}: re-registered lease {} for {}",
            vps.vps_id, alloc.ip_address, mac
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockVpsDb;
    use crate::provisioner::{VpsDescription, build_vps_description};
    use crate::settings::{RawSettings, Settings};
    use ocvps_common::GB;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup(server: &MockServer) -> (Arc<MockVpsDb>, Reconciler) {
        let settings = Settings::from_raw(RawSettings {
            proxmox_node_endpoints: Some("pve-1:127.0.0.1".to_string()),
            proxmox_node_api_endpoints: Some(format!("pve-1:{}", server.uri())),
            proxmox_token_id: Some("orchestrator@pve!provision".to_string()),
            proxmox_token_secret: Some("s3cret".to_string()),
            proxmox_region_nodes: Some("eu:pve-1".to_string()),
            vps_node_gateway_endpoints: Some(format!("pve-1:{}", server.uri())),
            vps_gateway_api_secret: Some("sekrit".to_string()),
            ..Default::default()
        })
        .unwrap();
        let db = Arc::new(MockVpsDb::new());
        let clients = Arc::new(NodeClients::new(Arc::new(settings)));
        let provisioner = Arc::new(VpsProvisioner::new(db.clone(), clients.clone()));
        let reconciler = Reconciler::new(db.clone(), provisioner, clients);
        (db, reconciler)
    }

    fn marker(vps_id: &str) -> String {
        build_vps_description(&VpsDescription {
            vps_id: vps_id.to_string(),
            organization_id: "org-9".to_string(),
            creator_id: "user-3".to_string(),
            display_name: "imported web".to_string(),
        })
    }

    #[tokio::test]
    async fn import_adopts_marked_vms_and_skips_foreign_ones() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve-1/qemu"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"vmid": 105, "name": "vps-i1", "status": "running"},
                    {"vmid": 200, "name": "someones-vm", "status": "running"},
                    {"vmid": 9000, "name": "ubuntu-22.04-standard", "status": "stopped", "template": 1}
                ]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve-1/qemu/105/config"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {
                    "name": "vps-i1",
                    "description": marker("vps-i1"),
                    "cores": 2,
                    "memory": "2048",
                    "scsi0": "local:105/vm-105-disk-0.qcow2,size=20G",
                    "net0": "virtio=00:16:3E:AA:BB:CC,bridge=OCvpsnet,firewall=1"
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve-1/qemu/200/config"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"name": "someones-vm", "description": "hands off"}
            })))
            .mount(&server)
            .await;

        let (db, reconciler) = setup(&server).await;
        reconciler.import_tick().await.unwrap();

        let imported = db.get_vps("vps-i1").await.unwrap().unwrap();
        assert_eq!(imported.organization_id, "org-9");
        assert_eq!(imported.created_by, "user-3");
        assert_eq!(imported.instance_id.as_deref(), Some("105"));
        assert_eq!(imported.node_id.as_deref(), Some("pve-1"));
        assert_eq!(imported.cpu_cores, 2);
        assert_eq!(imported.memory_bytes, 2048 * MB);
        assert_eq!(imported.disk_bytes, 20 * GB);
        assert_eq!(imported.region, "eu");
        assert_eq!(imported.status, VpsStatus::Running);

        // the unmarked VM was not adopted
        assert_eq!(db.list_active_vps().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn import_skips_existing_rows_and_vmid_collisions() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve-1/qemu"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [{"vmid": 105, "name": "vps-i1", "status": "running"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve-1/qemu/105/config"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"name": "vps-i1", "description": marker("vps-i1"), "cores": 1}
            })))
            .mount(&server)
            .await;

        let (db, reconciler) = setup(&server).await;
        // a different VPS already claims VMID 105
        db.put_vps(VpsInstance {
            vps_id: "vps-other".to_string(),
            organization_id: "org-9".to_string(),
            instance_id: Some("105".to_string()),
            status: VpsStatus::Running,
            ..Default::default()
        })
        .await;

        reconciler.import_tick().await.unwrap();
        assert!(db.get_vps("vps-i1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn lease_reconciler_reregisters_missing_lease() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve-1/qemu/105/config"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {
                    "name": "vps-l1",
                    "net0": "virtio=00:16:3E:AA:BB:CC,bridge=OCvpsnet,firewall=1"
                }
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/api/v1/allocate"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ip_address": "10.15.3.42",
                "mac_address": "00:16:3E:AA:BB:CC",
                "is_public": false,
                "lease_expires": "2026-08-02T00:00:00Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let (db, reconciler) = setup(&server).await;
        db.put_vps(VpsInstance {
            vps_id: "vps-l1".to_string(),
            organization_id: "org-9".to_string(),
            node_id: Some("pve-1".to_string()),
            instance_id: Some("105".to_string()),
            status: VpsStatus::Running,
            ..Default::default()
        })
        .await;

        reconciler.lease_tick().await.unwrap();

        let lease = db.get_private_lease("vps-l1").await.unwrap().unwrap();
        assert_eq!(lease.mac_address, "00:16:3E:AA:BB:CC");
        assert_eq!(lease.ip_address, "10.15.3.42");
        assert_eq!(lease.gateway_node, "pve-1");

        // a second tick is a no-op: the lease exists now
        reconciler.lease_tick().await.unwrap();
        assert_eq!(db.list_leases("vps-l1").await.unwrap().len(), 1);
    }
}
