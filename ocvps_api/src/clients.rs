//! Per-node client cache.
//!
//! One Proxmox client and one gateway client exist per node, built
//! lazily on first use and shared across concurrent requests. The maps
//! are read-mostly; insertion is double-checked under the write lock.
//! Building a client is cheap (no network round-trip happens until the
//! first request), so a lost race costs nothing.

use crate::gateway::GatewayClient;
use crate::json_api::JsonApi;
use crate::proxmox::ProxmoxClient;
use crate::settings::Settings;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

pub struct NodeClients {
    settings: Arc<Settings>,
    proxmox: RwLock<HashMap<String, Arc<ProxmoxClient>>>,
    gateways: RwLock<HashMap<String, Arc<GatewayClient>>>,
}

impl NodeClients {
    pub fn new(settings: Arc<Settings>) -> Self {
        Self {
            settings,
            proxmox: RwLock::new(HashMap::new()),
            gateways: RwLock::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &Arc<Settings> {
        &self.settings
    }

    /// Proxmox API client for a node.
    pub async fn proxmox(&self, node: &str) -> Result<Arc<ProxmoxClient>> {
        {
            let cache = self.proxmox.read().await;
            if let Some(c) = cache.get(node) {
                return Ok(c.clone());
            }
        }

        let api = JsonApi::new(&self.settings.api_url(node)?, self.settings.auth.clone())?;
        let ssh_addr = self.settings.ssh_addr(node).ok();
        let client = Arc::new(ProxmoxClient::new(
            api,
            node,
            self.settings.ssh.clone(),
            ssh_addr,
        ));

        let mut cache = self.proxmox.write().await;
        // another task may have won the race; keep the first insert
        Ok(cache.entry(node.to_string()).or_insert(client).clone())
    }

    /// Gateway RPC client for a node, if one is configured.
    pub async fn gateway(&self, node: &str) -> Result<Option<Arc<GatewayClient>>> {
        {
            let cache = self.gateways.read().await;
            if let Some(c) = cache.get(node) {
                return Ok(Some(c.clone()));
            }
        }

        let Some(url) = self.settings.gateway_url(node) else {
            return Ok(None);
        };
        let client = Arc::new(GatewayClient::new(
            url,
            node,
            self.settings.gateway_api_secret.as_deref(),
        )?);

        let mut cache = self.gateways.write().await;
        Ok(Some(
            cache.entry(node.to_string()).or_insert(client).clone(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::RawSettings;

    fn settings() -> Arc<Settings> {
        Arc::new(
            Settings::from_raw(RawSettings {
                proxmox_node_endpoints: Some("pve-1:10.0.0.1,pve-2:10.0.0.2".to_string()),
                proxmox_password: Some("hunter2".to_string()),
                vps_node_gateway_endpoints: Some("pve-1:http://10.0.0.1:9999".to_string()),
                ..Default::default()
            })
            .unwrap(),
        )
    }

    #[tokio::test]
    async fn clients_are_memoized_per_node() {
        let clients = NodeClients::new(settings());
        let a = clients.proxmox("pve-1").await.unwrap();
        let b = clients.proxmox("pve-1").await.unwrap();
        assert!(Arc::ptr_eq(&a, &b));

        let c = clients.proxmox("pve-2").await.unwrap();
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[tokio::test]
    async fn gateway_absent_when_not_configured() {
        let clients = NodeClients::new(settings());
        assert!(clients.gateway("pve-1").await.unwrap().is_some());
        assert!(clients.gateway("pve-2").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn unknown_node_is_an_error() {
        let clients = NodeClients::new(settings());
        assert!(clients.proxmox("pve-9").await.is_err());
    }
}
