//! RPC client for the per-node gateway service (the DHCP allocator).
//!
//! The gateway owns address truth; the catalog lease rows are a cache
//! of what it reports. Allocation is keyed by the VM's MAC, which the
//! orchestrator generates in the locally-administered KVM range.

use anyhow::Result;
use chrono::{DateTime, Utc};
use log::debug;
use ocvps_common::retry::OpResult;
use ocvps_common::{op_fatal, op_transient};
use reqwest::header::{ACCEPT, AUTHORIZATION, HeaderMap, USER_AGENT};
use reqwest::{Client, Url};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Prefix of the locally-administered KVM MAC range.
pub const KVM_MAC_PREFIX: &str = "00:16:3e";

/// Generate a MAC in the KVM range; the last three octets come from the
/// process CSPRNG.
pub fn generate_mac() -> String {
    format!(
        "{}:{}:{}:{}",
        KVM_MAC_PREFIX,
        hex::encode([rand::random::<u8>()]),
        hex::encode([rand::random::<u8>()]),
        hex::encode([rand::random::<u8>()])
    )
}

#[derive(Debug, Clone, Serialize)]
struct AllocateRequest<'a> {
    vps_id: &'a str,
    organization_id: &'a str,
    mac_address: &'a str,
}

#[derive(Debug, Clone, Serialize)]
struct ReleaseRequest<'a> {
    vps_id: &'a str,
}

/// One address the gateway has handed out.
#[derive(Debug, Clone, Deserialize)]
pub struct Allocation {
    pub ip_address: String,
    pub mac_address: Option<String>,
    #[serde(default)]
    pub is_public: bool,
    pub lease_expires: Option<DateTime<Utc>>,
}

pub struct GatewayClient {
    client: Client,
    base: Url,
    node: String,
}

impl GatewayClient {
    pub fn new(base: &str, node: &str, api_secret: Option<&str>) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, "ocvps/1.0".parse()?);
        headers.insert(ACCEPT, "application/json".parse()?);
        if let Some(secret) = api_secret {
            headers.insert(AUTHORIZATION, format!("Bearer {}", secret).parse()?);
        }
        let client = Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(10))
            .connect_timeout(Duration::from_secs(5))
            .build()?;
        Ok(Self {
            client,
            base: base.parse()?,
            node: node.to_string(),
        })
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    /// Register a lease for a VPS's MAC; returns the assigned address.
    pub async fn allocate_ip(
        &self,
        vps_id: &str,
        organization_id: &str,
        mac_address: &str,
    ) -> OpResult<Allocation> {
        debug!(
            "gateway {}: allocate {} for {}",
            self.node, mac_address, vps_id
        );
        self.post(
            "/api/v1/allocate",
            &AllocateRequest {
                vps_id,
                organization_id,
                mac_address,
            },
        )
        .await
    }

    /// Drop all leases of a VPS. Absence is success.
    pub async fn release_ip(&self, vps_id: &str) -> OpResult<()> {
        debug!("gateway {}: release {}", self.node, vps_id);
        let _: serde_json::Value = self.post("/api/v1/release", &ReleaseRequest { vps_id }).await?;
        Ok(())
    }

    /// Current allocations for an org, optionally narrowed to one VPS.
    pub async fn list_ips(
        &self,
        organization_id: &str,
        vps_id: Option<&str>,
    ) -> OpResult<Vec<Allocation>> {
        let mut path = format!(
            "/api/v1/ips?organization_id={}",
            urlencoding::encode(organization_id)
        );
        if let Some(v) = vps_id {
            path.push_str(&format!("&vps_id={}", urlencoding::encode(v)));
        }
        let url = self.base.join(&path).map_err(|e| {
            ocvps_common::retry::OpError::Fatal(anyhow::anyhow!(e))
        })?;
        let rsp = match self.client.get(url).send().await {
            Ok(r) => r,
            Err(e) => op_transient!("gateway {} unreachable: {}", self.node, e),
        };
        let status = rsp.status();
        let text = rsp
            .text()
            .await
            .map_err(|e| ocvps_common::retry::OpError::Transient(anyhow::anyhow!(e)))?;
        if !status.is_success() {
            op_fatal!("gateway {}: GET {}: {}", self.node, status, text);
        }
        match serde_json::from_str(&text) {
            Ok(v) => Ok(v),
            Err(e) => op_fatal!("gateway {}: invalid response: {} {}", self.node, text, e),
        }
    }

    async fn post<T: serde::de::DeserializeOwned, B: Serialize>(
        &self,
        path: &str,
        body: &B,
    ) -> OpResult<T> {
        let url = self.base.join(path).map_err(|e| {
            ocvps_common::retry::OpError::Fatal(anyhow::anyhow!(e))
        })?;
        let rsp = match self.client.post(url).json(body).send().await {
            Ok(r) => r,
            Err(e) => op_transient!("gateway {} unreachable: {}", self.node, e),
        };
        let status = rsp.status();
        let text = rsp
            .text()
            .await
            .map_err(|e| ocvps_common::retry::OpError::Transient(anyhow::anyhow!(e)))?;
        if !status.is_success() {
            op_fatal!("gateway {}: POST {}: {}: {}", self.node, path, status, text);
        }
        match serde_json::from_str(&text) {
            Ok(v) => Ok(v),
            Err(e) => op_fatal!("gateway {}: invalid response: {} {}", self.node, text, e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    #[test]
    fn generated_macs_use_kvm_prefix() {
        for _ in 0..32 {
            let mac = generate_mac();
            assert!(mac.starts_with("00:16:3e:"), "{}", mac);
            assert_eq!(mac.len(), 17);
            assert_eq!(mac.split(':').count(), 6);
        }
    }

    #[tokio::test]
    async fn allocate_posts_mac_and_parses_allocation() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api/v1/allocate"))
            .and(header("authorization", "Bearer sekrit"))
            .and(body_json(serde_json::json!({
                "vps_id": "vps-a1b2",
                "organization_id": "org-1",
                "mac_address": "00:16:3e:aa:bb:cc"
            })))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "ip_address": "10.15.3.20",
                "mac_address": "00:16:3e:aa:bb:cc",
                "is_public": false,
                "lease_expires": "2026-08-01T00:00:00Z"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let gw = GatewayClient::new(&server.uri(), "pve-1", Some("sekrit")).unwrap();
        let alloc = gw
            .allocate_ip("vps-a1b2", "org-1", "00:16:3e:aa:bb:cc")
            .await
            .unwrap();
        assert_eq!(alloc.ip_address, "10.15.3.20");
        assert!(!alloc.is_public);
    }

    #[tokio::test]
    async fn list_ips_narrows_by_vps() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api/v1/ips"))
            .and(query_param("organization_id", "org-1"))
            .and(query_param("vps_id", "vps-a1b2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!([
                {"ip_address": "10.15.3.20", "mac_address": "00:16:3e:aa:bb:cc"}
            ])))
            .expect(1)
            .mount(&server)
            .await;

        let gw = GatewayClient::new(&server.uri(), "pve-1", None).unwrap();
        let ips = gw.list_ips("org-1", Some("vps-a1b2")).await.unwrap();
        assert_eq!(ips.len(), 1);
        assert_eq!(ips[0].ip_address, "10.15.3.20");
    }
}
