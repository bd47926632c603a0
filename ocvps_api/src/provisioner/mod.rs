//! The provisioning pipeline and the VPS lifecycle surface.
//!
//! `create_vps` drives the multi-stage creation state machine: place,
//! validate storage, locate the template, clone (or synthesize a disk),
//! adapt the disk to the target storage, assemble cloud-init, configure
//! the VM, and start it. Every stage boundary logs; failures before the
//! catalog commit flip the pre-inserted row to FAILED and release the
//! lease. The other operations (start/stop/reboot/delete/reinitialize/
//! resize) all re-verify identity against Proxmox before acting.

mod description;

pub use description::{VpsDescription, build_vps_description, parse_vps_description};

use crate::clients::NodeClients;
use crate::cloudinit::{CloudInitConfig, SystemKeys, build_user_data};
use crate::disks::{CloneStrategy, DiskAdapter, plan_clone};
use crate::gateway::generate_mac;
use crate::proxmox::{
    NodeStorage, ProxmoxClient, VmConfigUpdate, is_missing_vm_error,
};
use crate::settings::Settings;
use crate::snippets;
use crate::ssh_keys;
use anyhow::{Context, Result, anyhow, bail};
use chrono::{Duration as ChronoDuration, Utc};
use log::{info, warn};
use ocvps_common::retry::Pipeline;
use ocvps_common::{GB, MB, ceil_to_gib};
use ocvps_db::{
    DhcpLease, ImageKind, VpsBastionKey, VpsDb, VpsInstance, VpsStatus, VpsTerminalKey,
};
use rand::Rng;
use rand::distr::Alphanumeric;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

/// Operation deadlines. Long-running Proxmox work detaches from the
/// caller's context and runs under these on a background task, so a
/// caller timeout cannot orphan a half-finished clone.
const CREATE_TIMEOUT: Duration = Duration::from_secs(300);
const FIREWALL_TIMEOUT: Duration = Duration::from_secs(15);
const START_TIMEOUT: Duration = Duration::from_secs(30);
const MOVE_TIMEOUT: Duration = Duration::from_secs(120);
const RESIZE_TIMEOUT: Duration = Duration::from_secs(30);
const STOP_POLL_TIMEOUT: Duration = Duration::from_secs(30);

const DELETED_VM_ERROR: &str = "VM has been deleted from Proxmox";

/// Run a future on a detached task with its own deadline. The work
/// survives cancellation of the caller.
async fn detached<T, F>(name: &'static str, deadline: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let handle = tokio::spawn(tokio::time::timeout(deadline, fut));
    match handle.await {
        Ok(Ok(result)) => result,
        Ok(Err(_)) => Err(anyhow!("{} timed out after {:?}", name, deadline)),
        Err(e) => Err(anyhow!("{} task failed: {}", name, e)),
    }
}

fn generate_vps_id() -> String {
    format!("vps-{}", hex::encode(rand::random::<[u8; 4]>()))
}

fn generate_root_password() -> String {
    rand::rng()
        .sample_iter(&Alphanumeric)
        .take(24)
        .map(char::from)
        .collect()
}

/// Everything needed to materialize a VM.
#[derive(Debug, Clone, Default)]
pub struct VpsConfig {
    /// Orchestrator-chosen id; generated when absent
    pub vps_id: Option<String>,
    pub organization_id: String,
    pub created_by: String,
    pub display_name: String,
    pub region: String,
    pub cpu_cores: u16,
    pub memory_bytes: u64,
    pub disk_bytes: u64,
    pub image: ImageKind,
    pub image_id: Option<String>,
    /// Free-form tier label
    pub size: String,
    pub ssh_key_id: Option<u64>,
    /// Storage override; defaults to the configured pool
    pub storage_pool: Option<String>,
    pub cloud_init: CloudInitConfig,
    /// Returned once and never persisted; generated when absent
    pub root_password: Option<String>,
}

pub struct VpsProvisioner {
    db: Arc<dyn VpsDb>,
    clients: Arc<NodeClients>,
}

struct CreateCtx {
    db: Arc<dyn VpsDb>,
    clients: Arc<NodeClients>,
    settings: Arc<Settings>,
    cfg: VpsConfig,
    vps: VpsInstance,
    root_password: String,
    // populated as the pipeline advances
    client: Option<Arc<ProxmoxClient>>,
    node: Option<String>,
    vmid: u64,
    template_vmid: Option<u64>,
    target_storage: Option<NodeStorage>,
    /// Storage the disk lands on first (the `via` for mediated
    /// converts, the target otherwise)
    clone_storage: Option<NodeStorage>,
    strategy: CloneStrategy,
    mac: String,
    lease_allocated: bool,
    system_keys: SystemKeys,
    disk_key: Option<String>,
    ci_custom: Option<String>,
}

impl CreateCtx {
    fn client(&self) -> Result<Arc<ProxmoxClient>> {
        self.client.clone().context("no node selected yet")
    }

    fn node(&self) -> Result<&str> {
        self.node.as_deref().context("no node selected yet")
    }

    fn target_storage(&self) -> Result<&NodeStorage> {
        self.target_storage.as_ref().context("no storage resolved")
    }

    /// Stage 1-3: placement, storage validation and template lookup,
    /// walked per candidate node until one fits.
    async fn resolve_placement(&mut self) -> Result<()> {
        let candidates = self.settings.candidate_nodes(&self.cfg.region)?;
        let storage_name = self
            .cfg
            .storage_pool
            .clone()
            .unwrap_or_else(|| self.settings.storage_pool.clone());

        let mut last_err = anyhow!("no nodes configured");
        for node in candidates {
            match self.try_node(&node, &storage_name).await {
                Ok(()) => {
                    info!(
                        "vps {}: placed on node {} (storage {}, template {:?})",
                        self.vps.vps_id, node, storage_name, self.template_vmid
                    );
                    self.node = Some(node.clone());
                    self.vps.node_id = Some(node);
                    return Ok(());
                }
                Err(e) => {
                    warn!("vps {}: node {} rejected: {}", self.vps.vps_id, node, e);
                    last_err = e;
                }
            }
        }
        Err(last_err.context(format!(
            "no node can host region '{}' with storage '{}'",
            self.cfg.region, storage_name
        )))
    }

    async fn try_node(&mut self, node: &str, storage_name: &str) -> Result<()> {
        let client = self.clients.proxmox(node).await?;

        let target = client
            .get_storage(storage_name)
            .await
            .map_err(|e| e.into_inner())?;

        // snippet storage must be valid before anything is cloned
        snippets::resolve_snippet_storage(&client, self.settings.snippet_storage())
            .await
            .map_err(|e| e.into_inner())?;

        let template_name = match self.cfg.image {
            ImageKind::Custom => self.cfg.image_id.clone(),
            other => other.template_name().map(String::from),
        };
        let template_vmid = match &template_name {
            Some(name) => {
                let found = client
                    .find_template_vmid(name)
                    .await
                    .map_err(|e| e.into_inner())?;
                match found {
                    Some(id) => Some(id),
                    None => bail!("template '{}' not found on node {}", name, node),
                }
            }
            None => {
                warn!(
                    "vps {}: no template for image {}, creating from an empty disk",
                    self.vps.vps_id, self.cfg.image
                );
                None
            }
        };

        // strategy needs to know where the template's own disk lives
        let storages = client.list_storage().await.map_err(|e| e.into_inner())?;
        let dir_fallback = storages
            .iter()
            .find(|s| {
                crate::disks::StorageKind::from_type(&s.kind).is_dir_like()
                    && s.has_content("images")
            })
            .map(|s| s.storage.clone());

        let (strategy, clone_storage) = if let Some(template_vmid) = template_vmid {
            let template_config = client
                .get_vm_config(template_vmid)
                .await
                .map_err(|e| e.into_inner())?;
            let template_storage_name = crate::disks::BOOT_DISK_KEYS
                .iter()
                .filter_map(|k| template_config.get_str(k))
                .filter(|v| !v.contains("cloudinit"))
                .filter_map(|v| v.split(':').next().map(String::from))
                .next();
            let template_storage = match template_storage_name {
                Some(name) => storages
                    .iter()
                    .find(|s| s.storage == name)
                    .cloned()
                    .context(format!("template storage '{}' not visible on {}", name, node))?,
                // cloud-init-only template: treat the target as the source
                None => target.clone(),
            };

            let strategy = plan_clone(&template_storage, &target, dir_fallback.as_deref());
            let clone_storage = match &strategy {
                CloneStrategy::Mediated { via, .. } => storages
                    .iter()
                    .find(|s| &s.storage == via)
                    .cloned()
                    .context(format!("intermediate storage '{}' not visible on {}", via, node))?,
                _ => target.clone(),
            };
            (strategy, clone_storage)
        } else {
            (
                CloneStrategy::Full {
                    storage: target.storage.clone(),
                },
                target.clone(),
            )
        };

        self.client = Some(client);
        self.template_vmid = template_vmid;
        self.target_storage = Some(target);
        self.clone_storage = Some(clone_storage);
        self.strategy = strategy;
        Ok(())
    }

    async fn allocate_vmid(&mut self) -> Result<()> {
        let client = self.client()?;
        let vmid = client
            .next_vmid(self.settings.vm_id_start)
            .await
            .map_err(|e| e.into_inner())?;
        info!("vps {}: assigned VMID {}", self.vps.vps_id, vmid);
        self.vmid = vmid;
        self.vps.instance_id = Some(vmid.to_string());
        Ok(())
    }

    /// Lease allocation is best-effort: a missing or unreachable
    /// gateway downgrades the VM to plain DHCP.
    async fn allocate_lease(&mut self) -> Result<()> {
        if let Some(existing) = self.db.get_private_lease(&self.vps.vps_id).await? {
            info!(
                "vps {}: reusing existing lease {} ({})",
                self.vps.vps_id, existing.ip_address, existing.mac_address
            );
            self.mac = existing.mac_address;
            return Ok(());
        }

        self.mac = generate_mac();
        let node = self.node()?.to_string();
        let Some(gateway) = self.clients.gateway(&node).await? else {
            info!(
                "vps {}: no gateway configured for {}, plain DHCP",
                self.vps.vps_id, node
            );
            return Ok(());
        };

        match gateway
            .allocate_ip(&self.vps.vps_id, &self.vps.organization_id, &self.mac)
            .await
        {
            Ok(alloc) => {
                self.db
                    .upsert_dhcp_lease(&DhcpLease {
                        vps_id: self.vps.vps_id.clone(),
                        organization_id: self.vps.organization_id.clone(),
                        mac_address: self.mac.clone(),
                        ip_address: alloc.ip_address.clone(),
                        is_public: false,
                        expires_at: alloc
                            .lease_expires
                            .unwrap_or_else(|| Utc::now() + ChronoDuration::hours(24)),
                        gateway_node: node,
                        ..Default::default()
                    })
                    .await?;
                self.lease_allocated = true;
                info!("vps {}: leased {}", self.vps.vps_id, alloc.ip_address);
            }
            Err(e) => {
                warn!(
                    "vps {}: lease allocation failed, falling back to DHCP: {}",
                    self.vps.vps_id, e
                );
            }
        }
        Ok(())
    }

    async fn release_lease(&mut self) -> Result<()> {
        if !self.lease_allocated {
            return Ok(());
        }
        if let Ok(node) = self.node() {
            if let Ok(Some(gateway)) = self.clients.gateway(node).await {
                if let Err(e) = gateway.release_ip(&self.vps.vps_id).await {
                    warn!("vps {}: lease release failed: {}", self.vps.vps_id, e);
                }
            }
        }
        self.db.delete_leases(&self.vps.vps_id).await?;
        Ok(())
    }

    /// Bastion key is mandatory, terminal key enables the web
    /// terminal. Reinitialize reuses whatever already exists.
    async fn ensure_keys(&mut self) -> Result<()> {
        let bastion = match self.db.get_bastion_key(&self.vps.vps_id).await? {
            Some(k) => k,
            None => {
                let pair =
                    ssh_keys::generate_keypair(&format!("{}-bastion", self.vps.vps_id))?;
                let key = VpsBastionKey {
                    vps_id: self.vps.vps_id.clone(),
                    fingerprint: pair.fingerprint,
                    public_key: pair.public_key,
                    private_key: pair.private_key,
                    ..Default::default()
                };
                self.db.insert_bastion_key(&key).await?;
                key
            }
        };
        let terminal = match self.db.get_terminal_key(&self.vps.vps_id).await? {
            Some(k) => k,
            None => {
                let pair =
                    ssh_keys::generate_keypair(&format!("{}-terminal", self.vps.vps_id))?;
                let key = VpsTerminalKey {
                    vps_id: self.vps.vps_id.clone(),
                    fingerprint: pair.fingerprint,
                    public_key: pair.public_key,
                    private_key: pair.private_key,
                    ..Default::default()
                };
                self.db.insert_terminal_key(&key).await?;
                key
            }
        };

        let org_keys = self
            .db
            .list_org_ssh_keys(&self.vps.organization_id)
            .await?;
        let vps_keys = self.db.list_vps_ssh_keys(&self.vps.vps_id).await?;
        let tenant_keys = ssh_keys::effective_keys(org_keys, vps_keys, None)
            .into_iter()
            .map(|k| k.public_key)
            .collect();

        self.system_keys = SystemKeys {
            bastion: Some(bastion.public_key),
            terminal: Some(terminal.public_key),
            tenant_keys,
        };
        Ok(())
    }

    async fn clone_or_create(&mut self) -> Result<()> {
        let client = self.client()?;
        let vmid = self.vmid;
        let name = self.vps.vps_id.clone();

        if let Some(template_vmid) = self.template_vmid {
            let (full, storage) = match &self.strategy {
                CloneStrategy::Linked => (false, None),
                CloneStrategy::Full { storage } => (true, Some(storage.clone())),
                CloneStrategy::Mediated { via, .. } => (true, Some(via.clone())),
            };
            info!(
                "vps {}: cloning template {} -> {} (full={}, storage={:?})",
                name, template_vmid, vmid, full, storage
            );
            detached("clone_vm", CREATE_TIMEOUT, async move {
                let task = client
                    .clone_vm(template_vmid, vmid, &name, full, storage.as_deref())
                    .await
                    .map_err(|e| e.into_inner())?;
                client
                    .wait_for_task(&task, CREATE_TIMEOUT)
                    .await
                    .map_err(|e| e.into_inner())?;
                Ok(())
            })
            .await?;
        } else {
            info!("vps {}: creating empty VM shell {}", name, vmid);
            let shell = VmConfigUpdate {
                name: Some(name.clone()),
                cores: Some(self.cfg.cpu_cores),
                memory: Some(self.cfg.memory_bytes / MB),
                os_type: Some("l26".to_string()),
                scsi_hw: Some("virtio-scsi-pci".to_string()),
                ..Default::default()
            };
            detached("create_vm", CREATE_TIMEOUT, async move {
                let task = client.create_vm(vmid, shell).await.map_err(|e| e.into_inner())?;
                if let Some(task) = task {
                    client
                        .wait_for_task(&task, CREATE_TIMEOUT)
                        .await
                        .map_err(|e| e.into_inner())?;
                }
                Ok(())
            })
            .await?;
        }
        Ok(())
    }

    async fn ensure_boot_disk(&mut self) -> Result<()> {
        let client = self.client()?;
        let storage = self
            .clone_storage
            .clone()
            .context("no clone storage resolved")?;
        let size_gb = ceil_to_gib(self.cfg.disk_bytes.max(GB));
        let adapter = DiskAdapter::new(&client);
        let key = adapter.ensure_boot_disk(self.vmid, &storage, size_gb).await?;
        info!("vps {}: boot disk at {}", self.vps.vps_id, key);
        self.disk_key = Some(key);
        Ok(())
    }

    async fn adapt_disk(&mut self) -> Result<()> {
        let CloneStrategy::Mediated { .. } = &self.strategy else {
            return Ok(());
        };
        let client = self.client()?;
        let vmid = self.vmid;
        let key = self.disk_key.clone().context("boot disk not resolved")?;
        let via = self
            .clone_storage
            .clone()
            .context("no intermediate storage")?;
        let target = self.target_storage()?.clone();

        info!(
            "vps {}: converting disk {} from {} to thin storage {}",
            self.vps.vps_id, key, via.storage, target.storage
        );
        detached("convert_disk", MOVE_TIMEOUT, async move {
            let adapter = DiskAdapter::new(&client);
            adapter
                .convert_to_thin(vmid, &key, &via, &target)
                .await
                .map_err(|e| e.into_inner())?;
            Ok(())
        })
        .await
    }

    async fn write_cloud_init(&mut self) -> Result<()> {
        let client = self.client()?;
        let user_data = build_user_data(
            self.cfg.image,
            &self.cfg.cloud_init,
            &self.system_keys,
            Some(&self.root_password),
        );
        let storage =
            snippets::resolve_snippet_storage(&client, self.settings.snippet_storage())
                .await
                .map_err(|e| e.into_inner())?;
        let reference = snippets::write_snippet(&client, &storage, self.vmid, &user_data)
            .await
            .map_err(|e| e.into_inner())?;
        info!("vps {}: cloud-init snippet at {}", self.vps.vps_id, reference);
        self.ci_custom = Some(reference);
        Ok(())
    }

    fn build_config_update(&self, trimmed: bool) -> Result<VmConfigUpdate> {
        let disk_key = self.disk_key.clone().context("boot disk not resolved")?;
        let mut net = format!("virtio={},bridge={}", self.mac, self.settings.gateway_bridge);
        if let Some(vlan) = self.settings.vlan_id {
            net.push_str(&format!(",tag={}", vlan));
        }
        net.push_str(",firewall=1");

        let mut update = VmConfigUpdate {
            name: Some(self.vps.vps_id.clone()),
            cores: Some(self.cfg.cpu_cores),
            memory: Some(self.cfg.memory_bytes / MB),
            os_type: Some("l26".to_string()),
            on_boot: Some(1),
            agent: Some(1),
            net: Some(net),
            serial_0: Some("socket".to_string()),
            ide_2: Some(format!("{}:cloudinit", self.target_storage()?.storage)),
            ip_config: Some("ip=dhcp".to_string()),
            ci_user: Some("root".to_string()),
            ci_upgrade: Some(0),
            ci_custom: self.ci_custom.clone(),
            boot: Some(format!("order={}", disk_key)),
            boot_disk: Some(disk_key),
            description: Some(build_vps_description(&VpsDescription {
                vps_id: self.vps.vps_id.clone(),
                organization_id: self.vps.organization_id.clone(),
                creator_id: self.vps.created_by.clone(),
                display_name: self.vps.display_name.clone(),
            })),
            ..Default::default()
        };
        if trimmed {
            update.serial_0 = None;
            update.ci_upgrade = None;
            update.os_type = None;
            update.on_boot = None;
        }
        Ok(update)
    }

    async fn apply_config(&mut self) -> Result<()> {
        let client = self.client()?;
        let update = self.build_config_update(false)?;
        if let Err(e) = client.update_vm_config(self.vmid, &update).await {
            warn!(
                "vps {}: config update failed ({}), retrying with trimmed payload",
                self.vps.vps_id,
                e.inner()
            );
            let trimmed = self.build_config_update(true)?;
            client
                .update_vm_config(self.vmid, &trimmed)
                .await
                .map_err(|e| e.into_inner())?;
        }

        // cloud-init already injects root's keys; the sshkeys field
        // additionally covers the cloud-init user mechanism. An empty
        // value is never submitted (Proxmox 8.4 mis-parses it).
        if !self.system_keys.tenant_keys.is_empty() {
            if let Err(e) =
                ssh_keys::update_vm_ssh_keys(&client, &self.db, &self.vps, None).await
            {
                warn!("vps {}: sshkeys sync failed: {}", self.vps.vps_id, e);
            }
        }
        Ok(())
    }

    async fn resize_disk(&mut self) -> Result<()> {
        let client = self.client()?;
        let vmid = self.vmid;
        let key = self.disk_key.clone().context("boot disk not resolved")?;
        let target_bytes = self.cfg.disk_bytes;
        detached("resize_disk", RESIZE_TIMEOUT, async move {
            let adapter = DiskAdapter::new(&client);
            adapter.resize_to(vmid, &key, target_bytes).await
        })
        .await
    }

    /// Firewall configuration is auxiliary: failures log and creation
    /// continues, the VM stays recoverable.
    async fn apply_firewall(&mut self) -> Result<()> {
        let client = self.client()?;
        let vmid = self.vmid;
        let result = detached("configure_firewall", FIREWALL_TIMEOUT, async move {
            crate::worker::apply_default_firewall(&client, vmid).await
        })
        .await;
        if let Err(e) = result {
            warn!("vps {}: firewall configuration failed: {}", self.vps.vps_id, e);
        }
        Ok(())
    }

    /// Initial start is auxiliary too; a VM that fails to boot is left
    /// in place for recovery.
    async fn start_vm(&mut self) -> Result<()> {
        let client = self.client()?;
        let vmid = self.vmid;
        let result = detached("start_vm", START_TIMEOUT, async move {
            let task = client.start_vm(vmid).await.map_err(|e| e.into_inner())?;
            client
                .wait_for_task(&task, START_TIMEOUT)
                .await
                .map_err(|e| e.into_inner())?;
            Ok(())
        })
        .await;
        if let Err(e) = result {
            warn!("vps {}: initial start failed: {}", self.vps.vps_id, e);
            return Ok(());
        }

        // post-boot probe, best effort: the agent only answers once
        // cloud-init has installed and started it
        let client = self.client()?;
        for _ in 0..3 {
            match client.agent_ping(vmid).await {
                Ok(()) => {
                    info!("vps {}: guest agent is up", self.vps.vps_id);
                    return Ok(());
                }
                Err(_) => tokio::time::sleep(Duration::from_secs(2)).await,
            }
        }
        info!(
            "vps {}: guest agent not responding yet (cloud-init may still be running)",
            self.vps.vps_id
        );
        Ok(())
    }

    async fn finalize_status(&mut self) -> Result<()> {
        let client = self.client()?;
        match client.get_vm_status(self.vmid).await {
            Ok(status) if status.is_running() => {
                self.vps.status = VpsStatus::Running;
            }
            Ok(_) | Err(_) => {
                // stays CREATING until the status sync observes it
                self.vps.status = VpsStatus::Creating;
            }
        }
        Ok(())
    }
}

impl VpsProvisioner {
    pub fn new(db: Arc<dyn VpsDb>, clients: Arc<NodeClients>) -> Self {
        Self { db, clients }
    }

    pub fn db(&self) -> &Arc<dyn VpsDb> {
        &self.db
    }

    pub fn clients(&self) -> &Arc<NodeClients> {
        &self.clients
    }

    fn settings(&self) -> Arc<Settings> {
        self.clients.settings().clone()
    }

    async fn require_vps(&self, vps_id: &str) -> Result<VpsInstance> {
        self.db
            .get_vps(vps_id)
            .await?
            .ok_or_else(|| anyhow!("VPS '{}' not found", vps_id))
    }

    /// Create a new VPS. Returns the catalog row and the root password,
    /// which is never persisted.
    pub async fn create_vps(&self, mut cfg: VpsConfig) -> Result<(VpsInstance, String)> {
        let vps_id = cfg.vps_id.take().unwrap_or_else(generate_vps_id);
        let root_password = cfg.root_password.take().unwrap_or_else(generate_root_password);

        let now = Utc::now();
        let mut vps = VpsInstance {
            vps_id: vps_id.clone(),
            organization_id: cfg.organization_id.clone(),
            created_by: cfg.created_by.clone(),
            display_name: if cfg.display_name.is_empty() {
                vps_id.clone()
            } else {
                cfg.display_name.clone()
            },
            region: cfg.region.clone(),
            cpu_cores: cfg.cpu_cores,
            memory_bytes: cfg.memory_bytes,
            disk_bytes: cfg.disk_bytes,
            image: cfg.image,
            image_id: cfg.image_id.clone(),
            size: cfg.size.clone(),
            ssh_key_id: cfg.ssh_key_id,
            status: VpsStatus::Creating,
            created: now,
            updated: now,
            ..Default::default()
        };
        vps.id = self.db.insert_vps(&vps).await?;

        self.run_create(vps, cfg, root_password).await
    }

    async fn run_create(
        &self,
        vps: VpsInstance,
        cfg: VpsConfig,
        root_password: String,
    ) -> Result<(VpsInstance, String)> {
        let vps_id = vps.vps_id.clone();
        let ctx = CreateCtx {
            db: self.db.clone(),
            clients: self.clients.clone(),
            settings: self.settings(),
            cfg,
            vps,
            root_password,
            client: None,
            node: None,
            vmid: 0,
            template_vmid: None,
            target_storage: None,
            clone_storage: None,
            strategy: CloneStrategy::Linked,
            mac: String::new(),
            lease_allocated: false,
            system_keys: SystemKeys::default(),
            disk_key: None,
            ci_custom: None,
        };

        let result = Pipeline::<CreateCtx, anyhow::Error>::new(ctx)
            .step("resolve_placement", |c| {
                Box::pin(async move { c.resolve_placement().await })
            })
            .step("allocate_vmid", |c| {
                Box::pin(async move { c.allocate_vmid().await })
            })
            .step_with_rollback(
                "allocate_lease",
                |c| Box::pin(async move { c.allocate_lease().await }),
                |c| Box::pin(async move { c.release_lease().await }),
            )
            .step("ensure_keys", |c| {
                Box::pin(async move { c.ensure_keys().await })
            })
            .step("clone_vm", |c| {
                Box::pin(async move { c.clone_or_create().await })
            })
            .step("ensure_boot_disk", |c| {
                Box::pin(async move { c.ensure_boot_disk().await })
            })
            .step("adapt_disk", |c| {
                Box::pin(async move { c.adapt_disk().await })
            })
            .step("write_cloud_init", |c| {
                Box::pin(async move { c.write_cloud_init().await })
            })
            .step("apply_config", |c| {
                Box::pin(async move { c.apply_config().await })
            })
            .step("resize_disk", |c| {
                Box::pin(async move { c.resize_disk().await })
            })
            .step("configure_firewall", |c| {
                Box::pin(async move { c.apply_firewall().await })
            })
            .step("start_vm", |c| Box::pin(async move { c.start_vm().await }))
            .step("finalize_status", |c| {
                Box::pin(async move { c.finalize_status().await })
            })
            .execute()
            .await;

        match result {
            Ok(ctx) => {
                let mut vps = ctx.vps;
                vps.updated = Utc::now();
                self.db.update_vps(&vps).await?;
                Ok((vps, ctx.root_password))
            }
            Err(e) => {
                warn!("vps {}: creation failed: {:#}", vps_id, e);
                if let Ok(Some(mut row)) = self.db.get_vps(&vps_id).await {
                    row.status = VpsStatus::Failed;
                    row.updated = Utc::now();
                    if let Err(ue) = self.db.update_vps(&row).await {
                        warn!("vps {}: failed to record FAILED status: {}", vps_id, ue);
                    }
                }
                Err(e)
            }
        }
    }

    /// Resolve the Proxmox client and VMID for a row, discovering the
    /// node by probing when the catalog does not know it yet.
    async fn client_for(&self, vps: &mut VpsInstance) -> Result<(Arc<ProxmoxClient>, u64)> {
        let vmid = vps
            .vmid()
            .ok_or_else(|| anyhow!("VPS '{}' has no Proxmox instance", vps.vps_id))?;

        if vps.node_id.is_none() {
            match self.find_vm_node(vmid).await? {
                Some(node) => {
                    info!("vps {}: discovered on node {}", vps.vps_id, node);
                    vps.node_id = Some(node);
                    self.db.update_vps(vps).await?;
                }
                None => bail!("VM {} not found on any node", vmid),
            }
        }

        let node = vps.node_id.clone().context("node resolution failed")?;
        Ok((self.clients.proxmox(&node).await?, vmid))
    }

    /// Probe every configured node for a VMID.
    pub async fn find_vm_node(&self, vmid: u64) -> Result<Option<String>> {
        for node in self.settings().nodes() {
            let client = match self.clients.proxmox(&node).await {
                Ok(c) => c,
                Err(e) => {
                    warn!("cannot build client for node {}: {}", node, e);
                    continue;
                }
            };
            match client.list_vms().await {
                Ok(vms) => {
                    if vms.iter().any(|vm| vm.vm_id == vmid) {
                        return Ok(Some(node));
                    }
                }
                Err(e) => warn!("node {} probe failed: {}", node, e),
            }
        }
        Ok(None)
    }

    fn guard_not_deleted(vps: &VpsInstance) -> Result<()> {
        if vps.status == VpsStatus::Deleted {
            bail!(DELETED_VM_ERROR);
        }
        Ok(())
    }

    /// Turn an API failure into the DELETED transition when Proxmox
    /// reports the VM gone out-of-band.
    async fn handle_missing(&self, vps: &mut VpsInstance, e: anyhow::Error) -> anyhow::Error {
        if is_missing_vm_error(&e) {
            warn!("vps {}: VM vanished from Proxmox: {}", vps.vps_id, e);
            vps.mark_deleted();
            vps.updated = Utc::now();
            if let Err(ue) = self.db.update_vps(vps).await {
                warn!("vps {}: failed to record deletion: {}", vps.vps_id, ue);
            }
            return anyhow!(DELETED_VM_ERROR);
        }
        e
    }

    pub async fn start_vps(&self, vps_id: &str) -> Result<()> {
        let mut vps = self.require_vps(vps_id).await?;
        Self::guard_not_deleted(&vps)?;
        let (client, vmid) = self.client_for(&mut vps).await?;

        vps.status = VpsStatus::Starting;
        self.db.update_vps(&vps).await?;

        let c = client.clone();
        let result = detached("start_vm", START_TIMEOUT, async move {
            let task = c.start_vm(vmid).await.map_err(|e| e.into_inner())?;
            c.wait_for_task(&task, START_TIMEOUT)
                .await
                .map_err(|e| e.into_inner())?;
            Ok(())
        })
        .await;
        if let Err(e) = result {
            return Err(self.handle_missing(&mut vps, e).await);
        }

        vps.status = VpsStatus::Running;
        vps.updated = Utc::now();
        self.db.update_vps(&vps).await?;
        Ok(())
    }

    pub async fn stop_vps(&self, vps_id: &str, force: bool) -> Result<()> {
        let mut vps = self.require_vps(vps_id).await?;
        Self::guard_not_deleted(&vps)?;
        let (client, vmid) = self.client_for(&mut vps).await?;

        vps.status = VpsStatus::Stopping;
        self.db.update_vps(&vps).await?;

        let result = async {
            let task = client.stop_vm(vmid).await.map_err(|e| e.into_inner())?;
            client
                .wait_for_task(&task, STOP_POLL_TIMEOUT)
                .await
                .map_err(|e| e.into_inner())?;
            if !force {
                client
                    .wait_for_vm_stopped(vmid, STOP_POLL_TIMEOUT)
                    .await
                    .map_err(|e| e.into_inner())?;
            }
            Ok::<_, anyhow::Error>(())
        }
        .await;
        if let Err(e) = result {
            return Err(self.handle_missing(&mut vps, e).await);
        }

        vps.status = VpsStatus::Stopped;
        vps.updated = Utc::now();
        self.db.update_vps(&vps).await?;
        Ok(())
    }

    /// Reboot; the row reports REBOOTING even while Proxmox still says
    /// `running`.
    pub async fn reboot_vps(&self, vps_id: &str) -> Result<()> {
        let mut vps = self.require_vps(vps_id).await?;
        Self::guard_not_deleted(&vps)?;
        let (client, vmid) = self.client_for(&mut vps).await?;

        match client.reboot_vm(vmid).await {
            Ok(_) => {}
            Err(e) => return Err(self.handle_missing(&mut vps, e.into_inner()).await),
        }

        vps.status = VpsStatus::Rebooting;
        vps.updated = Utc::now();
        self.db.update_vps(&vps).await?;
        Ok(())
    }

    /// Delete a VPS. Idempotent: a missing or already-deleted row is a
    /// no-op success. A VM whose `name` disagrees with the VPS id is
    /// refused outright.
    pub async fn delete_vps(&self, vps_id: &str) -> Result<()> {
        let Some(mut vps) = self.db.get_vps(vps_id).await? else {
            return Ok(());
        };
        if vps.status == VpsStatus::Deleted {
            return Ok(());
        }

        vps.status = VpsStatus::Deleting;
        self.db.update_vps(&vps).await?;

        if vps.vmid().is_some() {
            match self.client_for(&mut vps).await {
                Ok((client, vmid)) => {
                    self.delete_vm_checked(&client, &vps, vmid).await?;

                    // snippet cleanup; absence is fine
                    if let Ok(storage) = snippets::resolve_snippet_storage(
                        &client,
                        self.settings().snippet_storage(),
                    )
                    .await
                    {
                        if let Err(e) = snippets::delete_snippet(&client, &storage, vmid).await {
                            warn!("vps {}: snippet cleanup failed: {}", vps.vps_id, e);
                        }
                    }
                }
                Err(e) if e.to_string().contains("not found on any node") => {
                    info!("vps {}: VM already gone from the cluster", vps.vps_id);
                }
                Err(e) => return Err(e),
            }
        }

        // release the lease and drop the generated keys
        if let Some(node) = vps.node_id.clone() {
            if let Ok(Some(gateway)) = self.clients.gateway(&node).await {
                if let Err(e) = gateway.release_ip(&vps.vps_id).await {
                    warn!("vps {}: lease release failed: {}", vps.vps_id, e);
                }
            }
        }
        self.db.delete_leases(&vps.vps_id).await?;
        self.db.delete_bastion_key(&vps.vps_id).await?;
        self.db.delete_terminal_key(&vps.vps_id).await?;

        vps.mark_deleted();
        vps.updated = Utc::now();
        self.db.update_vps(&vps).await?;
        info!("vps {} deleted", vps.vps_id);
        Ok(())
    }

    /// The destructive half of delete/reinitialize: verify identity,
    /// force-stop, then remove the VM. "Already gone" is success.
    async fn delete_vm_checked(
        &self,
        client: &Arc<ProxmoxClient>,
        vps: &VpsInstance,
        vmid: u64,
    ) -> Result<()> {
        let config = match client.get_vm_config(vmid).await {
            Ok(c) => c,
            Err(e) => {
                let e = e.into_inner();
                if is_missing_vm_error(&e) {
                    return Ok(());
                }
                return Err(e);
            }
        };

        let name = config.name().unwrap_or_default();
        if name != vps.vps_id {
            bail!(
                "refusing to delete VM {}: VM name '{}' does not match VPS ID '{}'",
                vmid,
                name,
                vps.vps_id
            );
        }

        if let Ok(status) = client.get_vm_status(vmid).await {
            if !status.is_stopped() {
                if let Err(e) = client.stop_vm(vmid).await {
                    warn!("vps {}: force-stop failed: {}", vps.vps_id, e);
                }
                if let Err(e) = client.wait_for_vm_stopped(vmid, STOP_POLL_TIMEOUT).await {
                    warn!(
                        "vps {}: VM did not stop within {:?}, deleting anyway: {}",
                        vps.vps_id, STOP_POLL_TIMEOUT, e
                    );
                }
            }
        }

        match client.delete_vm(vmid).await {
            Ok(Some(task)) => {
                client
                    .wait_for_task(&task, MOVE_TIMEOUT)
                    .await
                    .map_err(|e| e.into_inner())?;
                Ok(())
            }
            Ok(None) => Ok(()),
            Err(e) => {
                let e = e.into_inner();
                if is_missing_vm_error(&e) {
                    Ok(())
                } else {
                    Err(e)
                }
            }
        }
    }

    /// Reinitialize: tear the VM down and rebuild it, keeping the
    /// catalog row and reusing the bastion/terminal keys.
    pub async fn reinitialize_vps(
        &self,
        vps_id: &str,
        cfg: VpsConfig,
    ) -> Result<(VpsInstance, String)> {
        let mut vps = self.require_vps(vps_id).await?;
        Self::guard_not_deleted(&vps)?;

        if vps.vmid().is_some() {
            let (client, vmid) = self.client_for(&mut vps).await?;

            vps.status = VpsStatus::Stopping;
            self.db.update_vps(&vps).await?;
            self.delete_vm_checked(&client, &vps, vmid).await?;
            vps.status = VpsStatus::Stopped;
            self.db.update_vps(&vps).await?;

            if let Ok(storage) =
                snippets::resolve_snippet_storage(&client, self.settings().snippet_storage())
                    .await
            {
                if let Err(e) = snippets::delete_snippet(&client, &storage, vmid).await {
                    warn!("vps {}: snippet cleanup failed: {}", vps.vps_id, e);
                }
            }
        }

        vps.instance_id = None;
        vps.status = VpsStatus::Creating;
        vps.updated = Utc::now();
        self.db.update_vps(&vps).await?;

        let root_password = cfg
            .root_password
            .clone()
            .unwrap_or_else(generate_root_password);
        let mut cfg = cfg;
        cfg.vps_id = None;
        cfg.root_password = None;
        self.run_create(vps, cfg, root_password).await
    }

    pub async fn get_status(&self, vps_id: &str) -> Result<VpsStatus> {
        let mut vps = self.require_vps(vps_id).await?;
        self.sync_vps_status(&mut vps).await?;
        Ok(vps.status)
    }

    /// Synchronize one row from Proxmox: status, node discovery, and
    /// (for running VMs) the IP caches. Marks the row DELETED when
    /// Proxmox no longer knows the VM.
    pub async fn sync_vps_status(&self, vps: &mut VpsInstance) -> Result<()> {
        if vps.status == VpsStatus::Deleted || vps.vmid().is_none() {
            return Ok(());
        }

        let (client, vmid) = self.client_for(vps).await?;
        let status = match client.get_vm_status(vmid).await {
            Ok(s) => s,
            Err(e) => {
                let e = e.into_inner();
                if is_missing_vm_error(&e) {
                    warn!("vps {}: VM {} gone, marking DELETED", vps.vps_id, vmid);
                    vps.mark_deleted();
                    vps.updated = Utc::now();
                    self.db.update_vps(vps).await?;
                    return Ok(());
                }
                return Err(e);
            }
        };

        let mapped = VpsStatus::from_proxmox(&status.status);
        // REBOOTING holds while Proxmox still reports running
        let next = if vps.status == VpsStatus::Rebooting && mapped == VpsStatus::Running {
            VpsStatus::Rebooting
        } else {
            mapped
        };
        if next != vps.status {
            vps.status = next;
            vps.updated = Utc::now();
            self.db.update_vps(vps).await?;
        }

        if vps.status == VpsStatus::Running {
            if let Err(e) = self.refresh_ip_caches(vps, &client, vmid).await {
                warn!("vps {}: IP refresh failed: {}", vps.vps_id, e);
            }
        }
        Ok(())
    }

    /// Addresses in priority order: gateway, guest agent, cache. The
    /// cache is rewritten only when the chosen source disagrees.
    pub async fn get_ip_addresses(&self, vps_id: &str) -> Result<(Vec<String>, Vec<String>)> {
        let mut vps = self.require_vps(vps_id).await?;
        Self::guard_not_deleted(&vps)?;
        let (client, vmid) = self.client_for(&mut vps).await?;
        self.refresh_ip_caches(&mut vps, &client, vmid).await?;
        Ok((vps.ipv4_addresses.0.clone(), vps.ipv6_addresses.0.clone()))
    }

    async fn refresh_ip_caches(
        &self,
        vps: &mut VpsInstance,
        client: &Arc<ProxmoxClient>,
        vmid: u64,
    ) -> Result<()> {
        let mut found: Option<(Vec<String>, Vec<String>)> = None;

        if let Some(node) = vps.node_id.clone() {
            if let Ok(Some(gateway)) = self.clients.gateway(&node).await {
                match gateway
                    .list_ips(&vps.organization_id, Some(&vps.vps_id))
                    .await
                {
                    Ok(allocs) if !allocs.is_empty() => {
                        let mut v4 = Vec::new();
                        let mut v6 = Vec::new();
                        for a in allocs {
                            match a.ip_address.parse::<std::net::IpAddr>() {
                                Ok(std::net::IpAddr::V4(_)) => v4.push(a.ip_address),
                                Ok(std::net::IpAddr::V6(_)) => v6.push(a.ip_address),
                                Err(_) => warn!(
                                    "gateway returned malformed address '{}'",
                                    a.ip_address
                                ),
                            }
                        }
                        found = Some((v4, v6));
                    }
                    Ok(_) => {}
                    Err(e) => warn!("vps {}: gateway IP lookup failed: {}", vps.vps_id, e),
                }
            }
        }

        if found.is_none() {
            match client.agent_network_interfaces(vmid).await {
                Ok(interfaces) => {
                    let mut v4 = Vec::new();
                    let mut v6 = Vec::new();
                    for iface in interfaces {
                        if iface.name == "lo" {
                            continue;
                        }
                        for addr in iface.ip_addresses {
                            match addr.ip_address.parse::<std::net::IpAddr>() {
                                Ok(ip) if ip.is_loopback() => {}
                                Ok(std::net::IpAddr::V4(_)) => v4.push(addr.ip_address),
                                Ok(std::net::IpAddr::V6(_)) => v6.push(addr.ip_address),
                                Err(_) => {}
                            }
                        }
                    }
                    if !v4.is_empty() || !v6.is_empty() {
                        found = Some((v4, v6));
                    }
                }
                Err(e) => warn!("vps {}: guest agent IP lookup failed: {}", vps.vps_id, e),
            }
        }

        // cache is the last resort and is only rewritten on change
        if let Some((v4, v6)) = found {
            if vps.ipv4_addresses.0 != v4 || vps.ipv6_addresses.0 != v6 {
                vps.ipv4_addresses.0 = v4;
                vps.ipv6_addresses.0 = v6;
                vps.updated = Utc::now();
                self.db.update_vps(vps).await?;
            }
        }
        Ok(())
    }

    /// Grow the boot disk. Shrinking is not supported by Proxmox.
    pub async fn resize_vps(&self, vps_id: &str, disk_bytes: u64) -> Result<()> {
        let mut vps = self.require_vps(vps_id).await?;
        Self::guard_not_deleted(&vps)?;
        let (client, vmid) = self.client_for(&mut vps).await?;

        let key = {
            let adapter = DiskAdapter::new(&client);
            adapter
                .find_boot_disk(vmid)
                .await?
                .map(|(k, _)| k)
                .ok_or_else(|| anyhow!("VM {} has no boot disk", vmid))?
        };

        let c = client.clone();
        let k = key.clone();
        let result = detached("resize_disk", RESIZE_TIMEOUT, async move {
            let adapter = DiskAdapter::new(&c);
            adapter.resize_to(vmid, &k, disk_bytes).await
        })
        .await;
        if let Err(e) = result {
            return Err(self.handle_missing(&mut vps, e).await);
        }

        vps.disk_bytes = disk_bytes;
        vps.updated = Utc::now();
        self.db.update_vps(&vps).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mocks::MockVpsDb;
    use crate::settings::RawSettings;
    use ocvps_db::{Json, VpsStatus};
    use wiremock::matchers::{method, path, path_regex};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn setup(server: &MockServer) -> (Arc<MockVpsDb>, VpsProvisioner) {
        let settings = Settings::from_raw(RawSettings {
            proxmox_node_endpoints: Some("pve-1:127.0.0.1".to_string()),
            proxmox_node_api_endpoints: Some(format!("pve-1:{}", server.uri())),
            proxmox_token_id: Some("orchestrator@pve!provision".to_string()),
            proxmox_token_secret: Some("s3cret".to_string()),
            ..Default::default()
        })
        .unwrap();
        let db = Arc::new(MockVpsDb::new());
        let clients = Arc::new(NodeClients::new(Arc::new(settings)));
        let provisioner = VpsProvisioner::new(db.clone(), clients);
        (db, provisioner)
    }

    fn row(vps_id: &str, vmid: u64) -> VpsInstance {
        VpsInstance {
            vps_id: vps_id.to_string(),
            organization_id: "org-1".to_string(),
            created_by: "user-1".to_string(),
            display_name: vps_id.to_string(),
            region: "eu".to_string(),
            node_id: Some("pve-1".to_string()),
            instance_id: Some(vmid.to_string()),
            status: VpsStatus::Running,
            ipv4_addresses: Json(vec!["10.15.3.20".to_string()]),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn delete_refuses_on_name_mismatch() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve-1/qemu/105/config"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"data": {"name": "vps-other", "cores": 2}}),
            ))
            .mount(&server)
            .await;

        let (db, provisioner) = setup(&server).await;
        db.put_vps(row("vps-x", 105)).await;

        let err = provisioner.delete_vps("vps-x").await.unwrap_err();
        assert_eq!(
            err.to_string(),
            "refusing to delete VM 105: VM name 'vps-other' does not match VPS ID 'vps-x'"
        );

        // no destructive call was issued
        let reqs = server.received_requests().await.unwrap();
        assert!(reqs.iter().all(|r| r.method != wiremock::http::Method::DELETE));
        // the row is not DELETED
        let vps = db.get_vps("vps-x").await.unwrap().unwrap();
        assert_ne!(vps.status, VpsStatus::Deleted);
    }

    #[tokio::test]
    async fn delete_missing_row_is_noop_success() {
        let server = MockServer::start().await;
        let (_db, provisioner) = setup(&server).await;
        provisioner.delete_vps("vps-nope").await.unwrap();
    }

    #[tokio::test]
    async fn delete_is_idempotent() {
        let server = MockServer::start().await;
        let (db, provisioner) = setup(&server).await;
        let mut vps = row("vps-x", 105);
        vps.mark_deleted();
        db.put_vps(vps).await;

        provisioner.delete_vps("vps-x").await.unwrap();
        provisioner.delete_vps("vps-x").await.unwrap();
    }

    #[tokio::test]
    async fn delete_succeeds_when_vm_already_gone() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve-1/qemu/105/config"))
            .respond_with(
                ResponseTemplate::new(500).set_body_string(
                    "Configuration file 'qemu-server/105.conf' does not exist",
                ),
            )
            .mount(&server)
            .await;
        // snippet storage resolution probes node storage
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve-1/storage"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": []
            })))
            .mount(&server)
            .await;

        let (db, provisioner) = setup(&server).await;
        db.put_vps(row("vps-x", 105)).await;

        provisioner.delete_vps("vps-x").await.unwrap();
        let vps = db.get_vps("vps-x").await.unwrap().unwrap();
        assert_eq!(vps.status, VpsStatus::Deleted);
        assert!(vps.instance_id.is_none());
        assert!(vps.ipv4_addresses.0.is_empty());
    }

    #[tokio::test]
    async fn sync_marks_out_of_band_deletion() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path_regex(r".*/status/current$"))
            .respond_with(
                ResponseTemplate::new(500).set_body_string(
                    "Configuration file 'qemu-server/105.conf' does not exist",
                ),
            )
            .mount(&server)
            .await;

        let (db, provisioner) = setup(&server).await;
        db.put_vps(row("vps-x", 105)).await;

        let mut vps = db.get_vps("vps-x").await.unwrap().unwrap();
        provisioner.sync_vps_status(&mut vps).await.unwrap();

        assert_eq!(vps.status, VpsStatus::Deleted);
        assert!(vps.instance_id.is_none());
        assert!(vps.ipv4_addresses.0.is_empty());
        let stored = db.get_vps("vps-x").await.unwrap().unwrap();
        assert_eq!(stored.status, VpsStatus::Deleted);
    }

    #[tokio::test]
    async fn start_on_deleted_row_reports_deleted() {
        let server = MockServer::start().await;
        let (db, provisioner) = setup(&server).await;
        let mut vps = row("vps-x", 105);
        vps.mark_deleted();
        db.put_vps(vps).await;

        let err = provisioner.start_vps("vps-x").await.unwrap_err();
        assert_eq!(err.to_string(), DELETED_VM_ERROR);
    }

    #[tokio::test]
    async fn create_failure_marks_row_failed() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve-1/storage"))
            .respond_with(ResponseTemplate::new(400).set_body_string("no such node"))
            .mount(&server)
            .await;

        let (db, provisioner) = setup(&server).await;
        let err = provisioner
            .create_vps(VpsConfig {
                organization_id: "org-1".to_string(),
                created_by: "user-1".to_string(),
                display_name: "web".to_string(),
                region: "eu".to_string(),
                cpu_cores: 2,
                memory_bytes: 2 * GB,
                disk_bytes: 20 * GB,
                image: ImageKind::Ubuntu2204,
                size: "s-2vcpu-2gb".to_string(),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert!(!err.to_string().is_empty());

        let rows = db.list_active_vps().await.unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].status, VpsStatus::Failed);
    }

    #[tokio::test]
    async fn reboot_sets_rebooting_and_sync_preserves_it() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api2/json/nodes/pve-1/qemu/105/status/reboot"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"data": "UPID:pve-1:reboot"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r".*/status/current$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"data": {"vmid": 105, "status": "running"}}),
            ))
            .mount(&server)
            .await;

        let (db, provisioner) = setup(&server).await;
        db.put_vps(row("vps-x", 105)).await;

        provisioner.reboot_vps("vps-x").await.unwrap();
        let mut vps = db.get_vps("vps-x").await.unwrap().unwrap();
        assert_eq!(vps.status, VpsStatus::Rebooting);

        // proxmox still reports running: REBOOTING is preserved
        provisioner.sync_vps_status(&mut vps).await.unwrap();
        assert_eq!(vps.status, VpsStatus::Rebooting);
    }
}
