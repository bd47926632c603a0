//! Cloud-init snippet I/O.
//!
//! Proxmox has no REST endpoint for snippet files, so user-data is
//! written straight into `<storage.path>/snippets/` over SSH. The
//! storage must be directory-backed and must list `snippets` among its
//! content types, otherwise the `cicustom` reference would point at
//! nothing.

use crate::proxmox::{NodeStorage, ProxmoxClient};
use anyhow::{Result, bail};
use log::warn;
use ocvps_common::op_fatal;
use ocvps_common::retry::{OpError, OpResult};

/// Storage types that are directory-backed and can hold snippets.
pub const DIR_FAMILY: [&str; 5] = ["dir", "directory", "nfs", "cifs", "glusterfs"];

/// Default directory storage mount point when the API omits `path`.
const DEFAULT_DIR_PATH: &str = "/var/lib/vz";

pub fn snippet_filename(vmid: u64) -> String {
    format!("vm-{}-user-data", vmid)
}

/// Validate that a storage pool can hold cloud-init snippets.
pub fn check_snippet_storage(storage: &NodeStorage) -> Result<()> {
    if !DIR_FAMILY.contains(&storage.kind.as_str()) {
        bail!(
            "storage '{}' has type '{}' which cannot hold snippets (need a directory-family storage)",
            storage.storage,
            storage.kind
        );
    }
    if !storage.has_content("snippets") {
        bail!(
            "storage '{}' does not list 'snippets' in its content types ({})",
            storage.storage,
            storage.content.as_deref().unwrap_or("")
        );
    }
    Ok(())
}

fn snippet_path(storage: &NodeStorage, vmid: u64) -> String {
    let base = match storage.path.as_deref() {
        Some(p) => p.to_string(),
        None => {
            warn!(
                "storage '{}' reports no path, assuming {}",
                storage.storage, DEFAULT_DIR_PATH
            );
            DEFAULT_DIR_PATH.to_string()
        }
    };
    format!("{}/snippets/{}", base, snippet_filename(vmid))
}

/// Fetch and validate the snippet storage on a node.
pub async fn resolve_snippet_storage(
    client: &ProxmoxClient,
    storage_name: &str,
) -> OpResult<NodeStorage> {
    let storage = client.get_storage(storage_name).await?;
    check_snippet_storage(&storage).map_err(OpError::Fatal)?;
    Ok(storage)
}

/// Write a user-data document, verify it landed, and return the
/// `cicustom` reference (`user=<storage>:snippets/<file>`).
pub async fn write_snippet(
    client: &ProxmoxClient,
    storage: &NodeStorage,
    vmid: u64,
    content: &str,
) -> OpResult<String> {
    let path = snippet_path(storage, vmid);
    let mut ssh = client.open_ssh().await?;

    let (code, out) = ssh
        .execute_with_stdin(&format!("dd of=\"{}\" bs=8192", path), content.as_bytes())
        .await
        .map_err(OpError::Transient)?;
    if code != 0 {
        op_fatal!("failed to write snippet {}: exit-code {}: {}", path, code, out);
    }

    let (code, _) = ssh
        .execute(&format!("test -f \"{}\"", path))
        .await
        .map_err(OpError::Transient)?;
    if code != 0 {
        op_fatal!("snippet {} missing after write", path);
    }

    // best-effort; cloud-init only needs the file readable by root
    if let Err(e) = ssh.execute(&format!("chmod 644 \"{}\"", path)).await {
        warn!("chmod on snippet {} failed: {}", path, e);
    }

    Ok(format!(
        "user={}:snippets/{}",
        storage.storage,
        snippet_filename(vmid)
    ))
}

/// Read a snippet back (round-trips the exact bytes written).
pub async fn read_snippet(
    client: &ProxmoxClient,
    storage: &NodeStorage,
    vmid: u64,
) -> OpResult<String> {
    let path = snippet_path(storage, vmid);
    let mut ssh = client.open_ssh().await?;
    let (code, out) = ssh
        .execute(&format!("cat \"{}\"", path))
        .await
        .map_err(OpError::Transient)?;
    if code != 0 {
        op_fatal!("failed to read snippet {}: exit-code {}: {}", path, code, out);
    }
    Ok(out)
}

/// Delete a snippet; a file that is already gone counts as success.
pub async fn delete_snippet(
    client: &ProxmoxClient,
    storage: &NodeStorage,
    vmid: u64,
) -> OpResult<()> {
    let path = snippet_path(storage, vmid);
    let mut ssh = client.open_ssh().await?;
    let (code, out) = ssh
        .execute(&format!("rm -f \"{}\"", path))
        .await
        .map_err(OpError::Transient)?;
    if code != 0 {
        op_fatal!("failed to delete snippet {}: exit-code {}: {}", path, code, out);
    }
    Ok(())
}
