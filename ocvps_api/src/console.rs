//! VNC/serial console proxying.
//!
//! Proxmox hands out a one-shot proxy ticket and a port; the actual
//! console is a WebSocket on the node's API endpoint. The derived URL
//! is validated strictly before anything connects to it: the ticket is
//! attacker-visible material and the URL ends up in a browser.

use crate::proxmox::ProxmoxClient;
use anyhow::{Result, bail};
use reqwest::Url;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::COOKIE;
use tokio_tungstenite::{
    Connector, MaybeTlsStream, WebSocketStream, connect_async_tls_with_config,
};

pub type ConsoleStream = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

/// VNC websocket ports Proxmox allocates.
const VNC_PORT_MIN: u32 = 5900;
const VNC_PORT_MAX: u32 = 5999;
const VMID_MIN: u64 = 100;
const VMID_MAX: u64 = 999_999_999;

/// Derive the `vncwebsocket` URL for a proxy ticket.
pub fn console_websocket_url(
    api_url: &str,
    node: &str,
    vmid: u64,
    port: u32,
    ticket: &str,
) -> Result<String> {
    if node.is_empty() {
        bail!("console URL requires a node name");
    }
    if ticket.is_empty() {
        bail!("console URL requires a non-empty ticket");
    }
    if !(VNC_PORT_MIN..=VNC_PORT_MAX).contains(&port) {
        bail!(
            "console port {} outside the VNC range {}-{}",
            port,
            VNC_PORT_MIN,
            VNC_PORT_MAX
        );
    }
    if !(VMID_MIN..=VMID_MAX).contains(&vmid) {
        bail!("VMID {} outside the valid range {}-{}", vmid, VMID_MIN, VMID_MAX);
    }

    let base: Url = api_url.parse()?;
    let host = base
        .host_str()
        .ok_or_else(|| anyhow::anyhow!("API URL '{}' has no host", api_url))?;
    let api_port = base.port().unwrap_or(8006);

    Ok(format!(
        "wss://{}:{}/api2/json/nodes/{}/qemu/{}/vncwebsocket?port={}&vncticket={}",
        host,
        api_port,
        node,
        vmid,
        port,
        urlencoding::encode(ticket)
    ))
}

/// Open the console WebSocket. Cluster nodes use self-signed
/// certificates, so TLS verification is off, matching the API client.
/// Password-authenticated deployments pass the access ticket as the
/// `PVEAuthCookie`; token deployments rely on the vncticket alone.
pub async fn connect_console(url: &str, auth_cookie: Option<&str>) -> Result<ConsoleStream> {
    let mut request = url.into_client_request()?;
    if let Some(cookie) = auth_cookie {
        request
            .headers_mut()
            .insert(COOKIE, format!("PVEAuthCookie={}", cookie).parse()?);
    }

    let tls = native_tls::TlsConnector::builder()
        .danger_accept_invalid_certs(true)
        .build()?;
    let (stream, _) =
        connect_async_tls_with_config(request, None, false, Some(Connector::NativeTls(tls)))
            .await?;
    Ok(stream)
}

/// Request a VNC proxy ticket and connect to the resulting socket.
pub async fn open_vnc_console(client: &ProxmoxClient, vmid: u64) -> Result<ConsoleStream> {
    let proxy = client.vnc_proxy(vmid).await.map_err(|e| e.into_inner())?;
    let url = console_websocket_url(
        client.api().base().as_str(),
        client.node(),
        vmid,
        proxy.port,
        &proxy.ticket,
    )?;
    let cookie = match client.api().ticket().await {
        Ok(t) => Some(t.ticket),
        Err(_) => None,
    };
    connect_console(&url, cookie.as_deref()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    const API: &str = "https://10.0.0.1:8006";

    #[test]
    fn builds_wss_url_with_encoded_ticket() {
        let url =
            console_websocket_url(API, "pve-1", 105, 5900, "PVEVNC:ticket+with/special=chars")
                .unwrap();
        assert!(url.starts_with(
            "wss://10.0.0.1:8006/api2/json/nodes/pve-1/qemu/105/vncwebsocket?port=5900&vncticket="
        ));
        assert!(url.contains("PVEVNC%3Aticket%2Bwith%2Fspecial%3Dchars"));
    }

    #[test]
    fn rejects_ports_outside_vnc_range() {
        assert!(console_websocket_url(API, "pve-1", 105, 5899, "t").is_err());
        assert!(console_websocket_url(API, "pve-1", 105, 6000, "t").is_err());
        assert!(console_websocket_url(API, "pve-1", 105, 5999, "t").is_ok());
    }

    #[test]
    fn rejects_invalid_vmid_ticket_and_node() {
        assert!(console_websocket_url(API, "pve-1", 99, 5900, "t").is_err());
        assert!(console_websocket_url(API, "pve-1", 1_000_000_000, 5900, "t").is_err());
        assert!(console_websocket_url(API, "pve-1", 105, 5900, "").is_err());
        assert!(console_websocket_url(API, "", 105, 5900, "t").is_err());
    }
}
