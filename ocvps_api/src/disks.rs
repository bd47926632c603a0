//! Storage and disk strategy.
//!
//! Proxmox's native clone and move operations misbehave across storage
//! type boundaries: linked clones only work on directory-family
//! sources, and `move_disk` onto thin-provisioned LVM does not reliably
//! preserve partition tables when the source is a file-format image.
//! This module decides, per (template storage, target storage) pair,
//! whether to linked-clone, full-clone, or run the mediated convert
//! (full clone to a directory storage, `qemu-img convert -O raw` over
//! SSH, attach on the thin volume).

use crate::proxmox::{
    NodeStorage, ProxmoxClient, VmConfig, size_token_from_disk, volume_from_disk,
};
use anyhow::{Result, anyhow};
use log::{info, warn};
use ocvps_common::retry::{OpError, OpResult, RetryPolicy, retry_async};
use ocvps_common::{ceil_to_gib, op_fatal, parse_size_bytes};
use serde::Deserialize;
use std::time::Duration;

/// Disk keys probed, in order, when locating the boot disk after a
/// clone.
pub const BOOT_DISK_KEYS: [&str; 4] = ["scsi0", "virtio0", "sata0", "ide0"];

/// Closed sum over Proxmox storage type strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageKind {
    DirLike,
    LvmThin,
    Lvm,
    Zfs,
    Other,
}

impl StorageKind {
    pub fn from_type(kind: &str) -> Self {
        match kind.to_ascii_lowercase().as_str() {
            "dir" | "directory" | "nfs" | "cifs" | "glusterfs" => StorageKind::DirLike,
            "lvmthin" | "lvm-thin" => StorageKind::LvmThin,
            "lvm" => StorageKind::Lvm,
            "zfs" | "zfspool" => StorageKind::Zfs,
            _ => StorageKind::Other,
        }
    }

    pub fn is_dir_like(&self) -> bool {
        matches!(self, StorageKind::DirLike)
    }

    pub fn is_block(&self) -> bool {
        matches!(self, StorageKind::LvmThin | StorageKind::Lvm | StorageKind::Zfs)
    }
}

impl From<&NodeStorage> for StorageKind {
    fn from(s: &NodeStorage) -> Self {
        StorageKind::from_type(&s.kind)
    }
}

/// How to get a template's disk onto the target storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloneStrategy {
    /// `full=0`, no storage parameter; target storage is the template's
    Linked,
    /// Full clone straight onto the named storage
    Full { storage: String },
    /// Full clone onto `via` (a directory storage), then convert the
    /// disk onto `target` with partition tables preserved
    Mediated { via: String, target: String },
}

/// Pick the clone strategy for a (template, target) storage pair.
///
/// `dir_fallback` is used when a thin target needs a directory-family
/// intermediate but the template itself is on block storage; detection
/// failure falls back to `local`.
pub fn plan_clone(
    template_storage: &NodeStorage,
    target_storage: &NodeStorage,
    dir_fallback: Option<&str>,
) -> CloneStrategy {
    let template_kind = StorageKind::from(template_storage);
    let target_kind = StorageKind::from(target_storage);

    if target_kind == StorageKind::LvmThin {
        let via = if template_kind.is_dir_like() {
            template_storage.storage.clone()
        } else {
            match dir_fallback {
                Some(s) => s.to_string(),
                None => {
                    warn!(
                        "no directory storage detected for mediated convert, falling back to 'local'"
                    );
                    "local".to_string()
                }
            }
        };
        return CloneStrategy::Mediated {
            via,
            target: target_storage.storage.clone(),
        };
    }

    if template_kind.is_dir_like() {
        if template_storage.storage == target_storage.storage {
            return CloneStrategy::Linked;
        }
        return CloneStrategy::Full {
            storage: target_storage.storage.clone(),
        };
    }

    // block source: linked clones unsupported regardless of target
    CloneStrategy::Full {
        storage: target_storage.storage.clone(),
    }
}

/// Infer the disk key for an orphaned volume from its name; defaults to
/// `scsi0` when the name carries no bus hint.
pub fn infer_disk_key(volume_name: &str) -> &'static str {
    for key in ["scsi", "virtio", "sata", "ide"] {
        if volume_name.contains(key) {
            return match key {
                "scsi" => "scsi0",
                "virtio" => "virtio0",
                "sata" => "sata0",
                _ => "ide0",
            };
        }
    }
    "scsi0"
}

/// Local path of a volume on its node, by storage kind.
pub fn source_disk_path(storage: &NodeStorage, volid: &str) -> Result<String> {
    let vol = volid
        .split_once(':')
        .map(|(_, v)| v)
        .ok_or_else(|| anyhow!("volume id '{}' has no storage prefix", volid))?;

    Ok(match StorageKind::from(storage) {
        StorageKind::Lvm | StorageKind::LvmThin => format!("/dev/pve/{}", vol),
        StorageKind::DirLike => {
            let base = storage.path.as_deref().unwrap_or("/var/lib/vz");
            format!("{}/images/{}", base, vol)
        }
        StorageKind::Zfs => {
            let pool = storage.pool.as_deref().unwrap_or(&storage.storage);
            format!("/dev/zvol/{}/{}", pool, vol)
        }
        StorageKind::Other => {
            return Err(anyhow!(
                "cannot derive a local path for storage type '{}'",
                storage.kind
            ));
        }
    })
}

/// Whether a disk needs an explicit resize to reach `target_bytes`.
/// A disk whose `size=` attribute already matches is left alone.
pub fn needs_resize(disk_value: &str, target_bytes: u64) -> bool {
    match size_token_from_disk(disk_value).and_then(|s| parse_size_bytes(&s).ok()) {
        Some(current) => current < target_bytes,
        None => true,
    }
}

#[derive(Debug, Deserialize)]
struct QemuImgInfo {
    #[serde(rename = "virtual-size")]
    virtual_size: u64,
    format: String,
}

pub struct DiskAdapter<'a> {
    client: &'a ProxmoxClient,
}

impl<'a> DiskAdapter<'a> {
    pub fn new(client: &'a ProxmoxClient) -> Self {
        Self { client }
    }

    /// Read the VM config, tolerating the transient "does not exist"
    /// Proxmox reports for several seconds after a clone.
    pub async fn get_config_post_clone(&self, vmid: u64) -> Result<VmConfig> {
        retry_async(RetryPolicy::post_clone(), || async {
            match self.client.get_vm_config(vmid).await {
                Ok(c) => Ok(c),
                Err(OpError::Fatal(e)) if crate::proxmox::is_missing_vm_error(&e) => {
                    Err(OpError::Transient(e))
                }
                Err(e) => Err(e),
            }
        })
        .await
    }

    /// Find the attached boot disk as `(key, value)`, probing the known
    /// keys in order.
    pub async fn find_boot_disk(&self, vmid: u64) -> Result<Option<(String, String)>> {
        let config = self.get_config_post_clone(vmid).await?;
        Ok(find_boot_disk_in(&config))
    }

    /// Make sure the VM has a boot disk, returning its key.
    ///
    /// Recovery paths, in order: an already-attached disk; an orphaned
    /// volume for this VMID sitting in storage content (left by a
    /// half-completed clone); a freshly synthesized empty disk for
    /// templates that only carry a cloud-init drive.
    pub async fn ensure_boot_disk(
        &self,
        vmid: u64,
        storage: &NodeStorage,
        size_gb: u64,
    ) -> Result<String> {
        if let Some((key, value)) = self.find_boot_disk(vmid).await? {
            info!("VM {} boot disk already attached: {}={}", vmid, key, value);
            return Ok(key);
        }

        // orphaned volume?
        let content = self
            .client
            .list_storage_content(&storage.storage)
            .await
            .map_err(OpError::into_inner)?;
        let marker = format!("vm-{}-disk", vmid);
        if let Some(entry) = content.iter().find(|e| e.vol_id.contains(&marker)) {
            let key = infer_disk_key(&entry.vol_id);
            info!(
                "VM {} has unattached volume {}, attaching as {}",
                vmid, entry.vol_id, key
            );
            self.client
                .update_vm_config_raw(
                    vmid,
                    &[(key.to_string(), entry.vol_id.clone())],
                )
                .await
                .map_err(OpError::into_inner)?;
            return Ok(key.to_string());
        }

        info!(
            "VM {} has no boot disk, synthesizing an empty {}G disk on {}",
            vmid, size_gb, storage.storage
        );
        self.synthesize_boot_disk(vmid, storage, size_gb).await?;
        Ok("scsi0".to_string())
    }

    async fn synthesize_boot_disk(
        &self,
        vmid: u64,
        storage: &NodeStorage,
        size_gb: u64,
    ) -> Result<()> {
        let kind = StorageKind::from(storage);
        if kind.is_dir_like() {
            // materialize the qcow2 file first, then attach it
            let filename = format!("vm-{}-disk-0.qcow2", vmid);
            let created = self
                .client
                .create_volume(
                    &storage.storage,
                    vmid,
                    &filename,
                    &format!("{}G", size_gb),
                    Some("qcow2"),
                )
                .await;
            if let Err(e) = created {
                // alternate format attempt: some releases reject the
                // explicit format parameter
                warn!(
                    "volume create with format=qcow2 failed ({}), retrying without",
                    e
                );
                self.client
                    .create_volume(
                        &storage.storage,
                        vmid,
                        &filename,
                        &format!("{}G", size_gb),
                        None,
                    )
                    .await
                    .map_err(OpError::into_inner)?;
            }
            let value = format!(
                "{}:{}/vm-{}-disk-0.qcow2,size={}G",
                storage.storage, vmid, vmid, size_gb
            );
            self.client
                .update_vm_config_raw(vmid, &[("scsi0".to_string(), value)])
                .await
                .map_err(OpError::into_inner)?;
        } else {
            // block storage: a single config PUT allocates and attaches
            let value = format!(
                "{}:vm-{}-disk-0,size={}G,format=raw",
                storage.storage, vmid, size_gb
            );
            let first = self
                .client
                .update_vm_config_raw(vmid, &[("scsi0".to_string(), value)])
                .await;
            if let Err(e) = first {
                warn!(
                    "disk attach with format= failed ({}), retrying without",
                    e
                );
                let value = format!("{}:vm-{}-disk-0,size={}G", storage.storage, vmid, size_gb);
                self.client
                    .update_vm_config_raw(vmid, &[("scsi0".to_string(), value)])
                    .await
                    .map_err(OpError::into_inner)?;
            }
        }
        Ok(())
    }

    /// Resize the disk to the requested size, skipping when the config
    /// already reports it. Resize must always run *after* any
    /// cross-storage move; LVM-thin create ignores the size parameter.
    pub async fn resize_to(&self, vmid: u64, key: &str, target_bytes: u64) -> Result<()> {
        let config = self.get_config_post_clone(vmid).await?;
        if let Some(value) = config.get_str(key) {
            if !needs_resize(&value, target_bytes) {
                info!("VM {} disk {} already at target size, skipping resize", vmid, key);
                return Ok(());
            }
        }

        let size = format!("{}G", ceil_to_gib(target_bytes));
        let task = self
            .client
            .resize_disk(vmid, key, &size)
            .await
            .map_err(OpError::into_inner)?;
        if let Some(task) = task {
            self.client
                .wait_for_task(&task, Duration::from_secs(30))
                .await
                .map_err(OpError::into_inner)?;
        }
        Ok(())
    }

    /// Mediated convert of a VM's boot disk onto LVM-thin storage.
    ///
    /// The native `move_disk` loses partition tables for file-format
    /// sources on thin targets, so the copy runs through `qemu-img
    /// convert -O raw` on the node itself. Returns the new disk value.
    pub async fn convert_to_thin(
        &self,
        vmid: u64,
        disk_key: &str,
        source_storage: &NodeStorage,
        target_storage: &NodeStorage,
    ) -> OpResult<String> {
        let client = self.client;

        // the VM must not have the disk open during the copy
        let status = client.get_vm_status(vmid).await?;
        let was_running = status.is_running();
        if was_running {
            info!("stopping VM {} for disk conversion", vmid);
            let t = client.stop_vm(vmid).await?;
            client.wait_for_task(&t, Duration::from_secs(120)).await?;
            client
                .wait_for_vm_stopped(vmid, Duration::from_secs(120))
                .await?;
        }

        let config = client.get_vm_config(vmid).await?;
        let disk_value = match config.get_str(disk_key) {
            Some(v) => v,
            None => op_fatal!("VM {} has no disk at {}", vmid, disk_key),
        };
        let source_volid = volume_from_disk(&disk_value).to_string();
        let source_path =
            source_disk_path(source_storage, &source_volid).map_err(OpError::Fatal)?;

        // source geometry, straight from qemu-img on the node
        let mut ssh = client.open_ssh().await?;
        let info_out = ssh
            .execute_checked(&format!(
                "qemu-img info --output=json \"{}\"",
                source_path
            ))
            .await
            .map_err(OpError::Transient)?;
        let img: QemuImgInfo = serde_json::from_str(&info_out)
            .map_err(|e| OpError::Fatal(anyhow!("unparseable qemu-img info: {}", e)))?;

        let size_gib = ceil_to_gib(img.virtual_size);
        let target_volname = format!("vm-{}-disk-0", vmid);
        let target_volid = format!("{}:{}", target_storage.storage, target_volname);

        // sweep leftovers from earlier failed attempts
        let existing = client.list_storage_content(&target_storage.storage).await?;
        if existing.iter().any(|e| e.vol_id == target_volid) {
            warn!("deleting stale volume {} from a previous attempt", target_volid);
            client
                .delete_volume(&target_storage.storage, &target_volid)
                .await?;
        }

        client
            .create_volume(
                &target_storage.storage,
                vmid,
                &target_volname,
                &format!("{}G", size_gib),
                Some("raw"),
            )
            .await?;

        let target_path =
            source_disk_path(target_storage, &target_volid).map_err(OpError::Fatal)?;

        // the thin volume must be able to hold the whole image
        let size_out = ssh
            .execute_checked(&format!("blockdev --getsize64 \"{}\"", target_path))
            .await
            .map_err(OpError::Transient)?;
        let target_bytes: u64 = size_out.trim().parse().unwrap_or(0);
        if target_bytes < img.virtual_size {
            client
                .delete_volume(&target_storage.storage, &target_volid)
                .await
                .ok();
            op_fatal!(
                "target volume {} is {} bytes, smaller than source {} bytes",
                target_path,
                target_bytes,
                img.virtual_size
            );
        }

        let convert_cmd = format!(
            "qemu-img convert -f {} -O raw \"{}\" \"{}\"",
            img.format, source_path, target_path
        );
        let (code, out) = ssh
            .execute(&convert_cmd)
            .await
            .map_err(OpError::Transient)?;
        if code != 0 {
            client
                .delete_volume(&target_storage.storage, &target_volid)
                .await
                .ok();
            op_fatal!(
                "qemu-img convert failed (exit {}): source={} ({}), target={}: {}",
                code,
                source_path,
                img.format,
                target_path,
                out
            );
        }

        // point the VM at the new volume
        let new_value = format!("{}:{},size={}G", target_storage.storage, target_volname, size_gib);
        client
            .update_vm_config_raw(vmid, &[(disk_key.to_string(), new_value.clone())])
            .await?;

        // drop the source volume, then clear the unused entry Proxmox
        // records for it; the active key is never touched
        if let Err(e) = client
            .delete_volume(&source_storage.storage, &source_volid)
            .await
        {
            warn!("failed to delete source volume {}: {}", source_volid, e);
        }
        let config = client.get_vm_config(vmid).await?;
        for (unused_key, unused_value) in config.unused_disks() {
            if unused_value.contains(&source_volid) && unused_key != disk_key {
                info!("removing stale config entry {}={}", unused_key, unused_value);
                client
                    .update_vm_config_raw(vmid, &[("delete".to_string(), unused_key)])
                    .await?;
            }
        }

        if was_running {
            info!("restarting VM {} after disk conversion", vmid);
            let t = client.start_vm(vmid).await?;
            client.wait_for_task(&t, Duration::from_secs(30)).await?;
        }

        Ok(new_value)
    }
}

fn find_boot_disk_in(config: &VmConfig) -> Option<(String, String)> {
    for key in BOOT_DISK_KEYS {
        if let Some(value) = config.get_str(key) {
            // the cloud-init drive also lives on a disk key; skip it
            if value.contains("cloudinit") {
                continue;
            }
            return Some((key.to_string(), value));
        }
    }
    None
}
