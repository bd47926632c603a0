//! SSH key synchronization between the catalog and Proxmox.
//!
//! Proxmox's `sshkeys` VM config field has an undocumented
//! double-URL-encoding requirement: the newline-joined key list must be
//! URL-encoded twice, with `+` rewritten to `%20` after each pass, or
//! the API rejects the value. Reading the field back yields it with one
//! layer of encoding removed.

use crate::proxmox::ProxmoxClient;
use anyhow::{Context, Result, anyhow, bail};
use log::{info, warn};
use ocvps_db::{SshKey, VpsDb, VpsInstance};
use ssh_key::{Algorithm, HashAlg, LineEnding, PrivateKey, PublicKey};
use std::collections::HashSet;
use std::sync::Arc;

/// A freshly generated keypair (bastion or terminal key).
#[derive(Debug, Clone)]
pub struct GeneratedKeypair {
    pub public_key: String,
    pub private_key: String,
    pub fingerprint: String,
}

/// Generate an Ed25519 keypair with the given comment.
pub fn generate_keypair(comment: &str) -> Result<GeneratedKeypair> {
    let mut private = PrivateKey::random(&mut ssh_key::rand_core::OsRng, Algorithm::Ed25519)?;
    private.set_comment(comment);
    let public = private.public_key();
    Ok(GeneratedKeypair {
        fingerprint: public.fingerprint(HashAlg::Sha256).to_string(),
        public_key: public.to_openssh()?,
        private_key: private.to_openssh(LineEnding::LF)?.to_string(),
    })
}

/// SHA-256 fingerprint of an authorized-keys line.
pub fn fingerprint(line: &str) -> Result<String> {
    let key = PublicKey::from_openssh(line.trim())
        .with_context(|| format!("unparseable public key: {}", line))?;
    Ok(key.fingerprint(HashAlg::Sha256).to_string())
}

/// Normalize one key for submission: strip CR/LF/tabs, trim, and make
/// sure a comment field is present (the key's name, spaces to dashes).
pub fn normalize_key(key_data: &str, name: &str) -> String {
    let cleaned: String = key_data
        .chars()
        .filter(|c| *c != '\r' && *c != '\n' && *c != '\t')
        .collect();
    let cleaned = cleaned.trim().to_string();

    let fields: Vec<&str> = cleaned.split_whitespace().collect();
    if fields.len() >= 3 {
        fields.join(" ")
    } else {
        format!("{} {}", fields.join(" "), name.replace(' ', "-"))
    }
}

/// The catalog's effective key set for a VPS: org-wide and VPS-scoped
/// rows, deduplicated by fingerprint with VPS scope winning, minus an
/// optional excluded id (used at key-deletion time, before the row is
/// actually removed).
pub fn effective_keys(
    org_keys: Vec<SshKey>,
    vps_keys: Vec<SshKey>,
    exclude_id: Option<u64>,
) -> Vec<SshKey> {
    let mut out: Vec<SshKey> = Vec::new();
    let mut seen: HashSet<String> = HashSet::new();

    // VPS scope first so it wins fingerprint collisions
    for key in vps_keys.into_iter().chain(org_keys) {
        if Some(key.id) == exclude_id {
            continue;
        }
        if seen.insert(key.fingerprint.clone()) {
            out.push(key);
        }
    }
    out
}

fn encode_pass(s: &str) -> String {
    urlencoding::encode(s).replace('+', "%20")
}

/// Join normalized keys and apply the double encoding.
pub fn encode_sshkeys(keys: &[String]) -> String {
    let mut joined = keys.join("\n");
    // strip every trailing newline; Proxmox 8.4 chokes on them
    while joined.ends_with('\n') {
        joined.pop();
    }
    encode_pass(&encode_pass(&joined))
}

/// Undo both encoding passes and split into lines.
pub fn decode_sshkeys(value: &str) -> Result<Vec<String>> {
    let once = urlencoding::decode(value)?.into_owned();
    let twice = urlencoding::decode(&once)?.into_owned();
    Ok(twice
        .split('\n')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect())
}

/// Parse the `sshkeys` value as read back from VM config. Proxmox
/// strips one encoding layer on ingest, so read-back values carry one
/// layer, but stale configs have been observed with two; decode until
/// the value stops changing.
pub fn decode_config_sshkeys(value: &str) -> Vec<String> {
    let mut current = value.to_string();
    for _ in 0..2 {
        match urlencoding::decode(&current) {
            Ok(decoded) if decoded != current => current = decoded.into_owned(),
            _ => break,
        }
    }
    current
        .split('\n')
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(String::from)
        .collect()
}

/// Push the catalog's effective key set for a VPS into its VM config
/// and verify the write by fingerprint comparison.
pub async fn update_vm_ssh_keys(
    client: &ProxmoxClient,
    db: &Arc<dyn VpsDb>,
    vps: &VpsInstance,
    exclude_id: Option<u64>,
) -> Result<()> {
    let vmid = vps
        .vmid()
        .ok_or_else(|| anyhow!("VPS {} has no instance id", vps.vps_id))?;

    let org_keys = db.list_org_ssh_keys(&vps.organization_id).await?;
    let vps_keys = db.list_vps_ssh_keys(&vps.vps_id).await?;
    let keys = effective_keys(org_keys, vps_keys, exclude_id);

    let expected: HashSet<String> = keys.iter().map(|k| k.fingerprint.clone()).collect();
    let normalized: Vec<String> = keys
        .iter()
        .map(|k| normalize_key(&k.public_key, &k.name))
        .collect();

    let encoded = encode_sshkeys(&normalized);
    client
        .update_vm_config_raw(vmid, &[("sshkeys".to_string(), encoded)])
        .await
        .map_err(|e| e.into_inner())?;

    // read back and compare fingerprint sets
    let config = client
        .get_vm_config(vmid)
        .await
        .map_err(|e| e.into_inner())?;
    let actual: HashSet<String> = config
        .ssh_keys()
        .map(|v| decode_config_sshkeys(&v))
        .unwrap_or_default()
        .iter()
        .filter_map(|l| fingerprint(l).ok())
        .collect();

    if actual != expected {
        if expected.is_empty() && !actual.is_empty() {
            bail!(
                "VM {} still reports {} ssh keys after a clear; Proxmox 8.4 is known to ignore empty sshkeys values",
                vmid,
                actual.len()
            );
        }
        bail!(
            "ssh key verification failed for VM {}: expected {} keys, Proxmox reports {}",
            vmid,
            expected.len(),
            actual.len()
        );
    }
    Ok(())
}

/// First-observation seeding: Proxmox is the source of truth. Keys on
/// the VM that the catalog lacks are imported; catalog keys absent from
/// the VM are deleted.
pub async fn seed_keys_from_proxmox(
    client: &ProxmoxClient,
    db: &Arc<dyn VpsDb>,
    vps: &VpsInstance,
) -> Result<()> {
    let vmid = vps
        .vmid()
        .ok_or_else(|| anyhow!("VPS {} has no instance id", vps.vps_id))?;

    let config = client
        .get_vm_config(vmid)
        .await
        .map_err(|e| e.into_inner())?;
    // only seed from VMs that actually carry the field; a VM without it
    // says nothing about the catalog's keys
    let Some(raw) = config.ssh_keys() else {
        return Ok(());
    };
    let lines = decode_config_sshkeys(&raw);

    let mut proxmox_fps: HashSet<String> = HashSet::new();
    let org_keys = db.list_org_ssh_keys(&vps.organization_id).await?;
    let vps_keys = db.list_vps_ssh_keys(&vps.vps_id).await?;
    let known: HashSet<String> = org_keys
        .iter()
        .chain(vps_keys.iter())
        .map(|k| k.fingerprint.clone())
        .collect();

    for line in &lines {
        let (fp, comment) = match PublicKey::from_openssh(line) {
            Ok(k) => (
                k.fingerprint(HashAlg::Sha256).to_string(),
                k.comment().to_string(),
            ),
            Err(e) => {
                warn!("skipping unparseable key on VM {}: {}", vmid, e);
                continue;
            }
        };
        proxmox_fps.insert(fp.clone());

        if !known.contains(&fp) {
            let name = if comment.is_empty() {
                "Imported from Proxmox".to_string()
            } else {
                comment
            };
            info!("importing ssh key '{}' from VM {}", name, vmid);
            db.insert_ssh_key(&SshKey {
                name,
                organization_id: vps.organization_id.clone(),
                vps_id: Some(vps.vps_id.clone()),
                fingerprint: fp,
                public_key: line.clone(),
                ..Default::default()
            })
            .await?;
        }
    }

    for key in org_keys.iter().chain(vps_keys.iter()) {
        if !proxmox_fps.contains(&key.fingerprint) {
            info!(
                "deleting catalog ssh key '{}' ({}) absent from VM {}",
                key.name, key.fingerprint, vmid
            );
            db.delete_ssh_key(key.id).await?;
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(id: u64, fp: &str, vps: Option<&str>) -> SshKey {
        SshKey {
            id,
            name: format!("key {}", id),
            organization_id: "org-1".to_string(),
            vps_id: vps.map(String::from),
            fingerprint: fp.to_string(),
            public_key: format!("ssh-ed25519 AAAA{}", id),
            ..Default::default()
        }
    }

    #[test]
    fn normalize_strips_control_chars_and_adds_comment() {
        let normalized = normalize_key("ssh-ed25519\tAAAAC3Nza\r\n", "my laptop key");
        assert_eq!(normalized, "ssh-ed25519 AAAAC3Nza my-laptop-key");

        // an existing comment is kept
        let normalized = normalize_key("ssh-ed25519 AAAAC3Nza user@host", "ignored");
        assert_eq!(normalized, "ssh-ed25519 AAAAC3Nza user@host");
    }

    #[test]
    fn double_encode_round_trips() {
        let keys = vec![
            "ssh-ed25519 AAAAC3Nza alice".to_string(),
            "ssh-rsa AAAAB3Nza bob".to_string(),
        ];
        let encoded = encode_sshkeys(&keys);
        // a doubly-encoded space reads %2520
        assert!(encoded.contains("%2520"));
        assert!(!encoded.contains('+'));
        assert_eq!(decode_sshkeys(&encoded).unwrap(), keys);
    }

    #[test]
    fn trailing_newlines_all_stripped() {
        let keys = vec!["ssh-ed25519 AAAA x\n\n\n".to_string()];
        let mut joined = keys.join("\n");
        while joined.ends_with('\n') {
            joined.pop();
        }
        assert!(!joined.ends_with('\n'));
        let decoded = decode_sshkeys(&encode_sshkeys(&keys)).unwrap();
        assert_eq!(decoded, vec!["ssh-ed25519 AAAA x".to_string()]);
    }

    #[test]
    fn effective_set_vps_scope_wins_and_exclusion_applies() {
        let org = vec![key(1, "fp-a", None), key(2, "fp-b", None)];
        let vps = vec![key(3, "fp-a", Some("vps-1"))];

        let eff = effective_keys(org.clone(), vps.clone(), None);
        assert_eq!(eff.len(), 2);
        // fp-a resolved to the VPS-scoped row
        assert_eq!(eff.iter().find(|k| k.fingerprint == "fp-a").unwrap().id, 3);

        let eff = effective_keys(org, vps, Some(2));
        assert_eq!(eff.len(), 1);
        assert!(eff.iter().all(|k| k.fingerprint != "fp-b"));
    }

    #[test]
    fn generated_keypairs_parse_and_fingerprint() {
        let pair = generate_keypair("vps-a1b2-bastion").unwrap();
        assert!(pair.public_key.starts_with("ssh-ed25519 "));
        assert!(pair.private_key.contains("BEGIN OPENSSH PRIVATE KEY"));
        assert_eq!(fingerprint(&pair.public_key).unwrap(), pair.fingerprint);
        assert!(pair.fingerprint.starts_with("SHA256:"));
    }

    #[test]
    fn config_readback_decodes_single_layer() {
        let raw = "ssh-ed25519%20AAAAC3Nza%20alice%0Assh-rsa%20AAAAB3Nza%20bob";
        let lines = decode_config_sshkeys(raw);
        assert_eq!(
            lines,
            vec![
                "ssh-ed25519 AAAAC3Nza alice".to_string(),
                "ssh-rsa AAAAB3Nza bob".to_string()
            ]
        );
    }
}
