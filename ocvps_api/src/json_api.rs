//! HTTP layer for the Proxmox REST API.
//!
//! Proxmox accepts form-encoded request bodies and answers JSON wrapped
//! in `{"data": ...}`. Authentication is either a password-derived
//! ticket (cookie + CSRF header, 2 hour lifetime, refreshed when within
//! 5 minutes of expiry) or a static API token header. TLS verification
//! is disabled: cluster nodes ship self-signed certificates.

use crate::settings::ProxmoxAuth;
use anyhow::{Result, anyhow};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use log::debug;
use ocvps_common::retry::{OpError, OpResult};
use ocvps_common::{op_fatal, op_transient};
use reqwest::header::{ACCEPT, AUTHORIZATION, COOKIE, HeaderMap, USER_AGENT};
use reqwest::{Client, Method, RequestBuilder, StatusCode, Url};
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::error::Error;
use std::time::Duration;
use tokio::sync::RwLock;

/// Ticket material from `POST /access/ticket`.
#[derive(Debug, Clone)]
pub struct ProxmoxTicket {
    pub ticket: String,
    pub csrf_token: String,
    pub expires: DateTime<Utc>,
}

impl ProxmoxTicket {
    /// Tickets live 2 hours; treat anything within 5 minutes of expiry
    /// as stale so in-flight requests never race the cutoff.
    pub fn needs_refresh(&self) -> bool {
        self.expires - Utc::now() < ChronoDuration::minutes(5)
    }
}

#[derive(serde::Deserialize)]
struct TicketData {
    ticket: String,
    #[serde(rename = "CSRFPreventionToken")]
    csrf_token: String,
}

#[derive(serde::Deserialize)]
struct TicketResponse {
    data: TicketData,
}

pub struct JsonApi {
    client: Client,
    base: Url,
    auth: ProxmoxAuth,
    ticket: RwLock<Option<ProxmoxTicket>>,
}

impl JsonApi {
    pub fn new(base: &str, auth: ProxmoxAuth) -> Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(USER_AGENT, "ocvps/1.0".parse()?);
        headers.insert(ACCEPT, "application/json; charset=utf-8".parse()?);
        if let ProxmoxAuth::Token { token_id, secret } = &auth {
            headers.insert(
                AUTHORIZATION,
                format!("PVEAPIToken={}={}", token_id, secret).parse()?,
            );
        }

        let client = Client::builder()
            .danger_accept_invalid_certs(true)
            .default_headers(headers)
            .timeout(Duration::from_secs(30))
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base: base.parse()?,
            auth,
            ticket: RwLock::new(None),
        })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> OpResult<T> {
        self.req::<T, ()>(Method::GET, path, None).await
    }

    pub async fn post<T: DeserializeOwned, R: Serialize>(
        &self,
        path: &str,
        body: R,
    ) -> OpResult<T> {
        self.req(Method::POST, path, Some(body)).await
    }

    /// POST with an empty body (start/stop/reboot style endpoints)
    pub async fn post_empty<T: DeserializeOwned>(&self, path: &str) -> OpResult<T> {
        self.req::<T, ()>(Method::POST, path, None).await
    }

    pub async fn put<T: DeserializeOwned, R: Serialize>(&self, path: &str, body: R) -> OpResult<T> {
        self.req(Method::PUT, path, Some(body)).await
    }

    pub async fn delete<T: DeserializeOwned>(&self, path: &str) -> OpResult<T> {
        self.req::<T, ()>(Method::DELETE, path, None).await
    }

    /// The current ticket, fetching one if needed. Password mode only:
    /// WebSocket bootstrap requires the cookie form even when regular
    /// API calls use a token.
    pub async fn ticket(&self) -> Result<ProxmoxTicket> {
        match &self.auth {
            ProxmoxAuth::Password { .. } => self.ensure_ticket().await,
            ProxmoxAuth::Token { .. } => Err(anyhow!(
                "cannot fetch an access ticket with API-token authentication"
            )),
        }
    }

    async fn ensure_ticket(&self) -> Result<ProxmoxTicket> {
        {
            let cached = self.ticket.read().await;
            if let Some(t) = cached.as_ref().filter(|t| !t.needs_refresh()) {
                return Ok(t.clone());
            }
        }

        // Double-checked: another request may have refreshed while we
        // waited for the write lock. A benign double-refresh is fine.
        let mut slot = self.ticket.write().await;
        if let Some(t) = slot.as_ref().filter(|t| !t.needs_refresh()) {
            return Ok(t.clone());
        }
        let fresh = self.fetch_ticket().await?;
        *slot = Some(fresh.clone());
        Ok(fresh)
    }

    async fn fetch_ticket(&self) -> Result<ProxmoxTicket> {
        let (username, password) = match &self.auth {
            ProxmoxAuth::Password { username, password } => (username, password),
            ProxmoxAuth::Token { .. } => {
                return Err(anyhow!("ticket fetch requires password authentication"));
            }
        };

        let url = self.base.join("/api2/json/access/ticket")?;
        debug!(">> POST /api2/json/access/ticket");
        let rsp = self
            .client
            .post(url)
            .form(&[("username", username.as_str()), ("password", password.as_str())])
            .send()
            .await?;
        let status = rsp.status();
        let text = rsp.text().await?;
        if !status.is_success() {
            return Err(anyhow!("ticket request failed: {}: {}", status, text));
        }
        let parsed: TicketResponse = serde_json::from_str(&text)?;
        Ok(ProxmoxTicket {
            ticket: parsed.data.ticket,
            csrf_token: parsed.data.csrf_token,
            expires: Utc::now() + ChronoDuration::hours(2),
        })
    }

    async fn attach_auth(&self, method: &Method, req: RequestBuilder) -> Result<RequestBuilder> {
        match &self.auth {
            // Token header is a default header on the client
            ProxmoxAuth::Token { .. } => Ok(req),
            ProxmoxAuth::Password { .. } => {
                let ticket = self.ensure_ticket().await?;
                let req = req.header(COOKIE, format!("PVEAuthCookie={}", ticket.ticket));
                if method == Method::GET {
                    Ok(req)
                } else {
                    Ok(req.header("CSRFPreventionToken", ticket.csrf_token))
                }
            }
        }
    }

    pub async fn req<T: DeserializeOwned, R: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<R>,
    ) -> OpResult<T> {
        let url = self
            .base
            .join(path)
            .map_err(|e| OpError::Fatal(anyhow!(e)))?;

        // A 401 on a password client means the ticket died early
        // (node restart); drop it and retry once with a fresh one.
        let mut attempt = 0;
        loop {
            attempt += 1;

            let mut req = self.client.request(method.clone(), url.clone());
            if let Some(body) = &body {
                req = req.form(body);
            }
            let req = self
                .attach_auth(&method, req)
                .await
                .map_err(|e| OpError::Fatal(e))?;

            debug!(">> {} {}", method, path);
            let rsp = match req.send().await {
                Ok(rsp) => rsp,
                Err(e) => {
                    op_transient!(
                        "Failed to send request: {} source={}",
                        e,
                        e.source()
                            .map(|x| x.to_string())
                            .unwrap_or_else(|| "None".to_owned())
                    );
                }
            };

            let status = rsp.status();
            let text = rsp.text().await.map_err(|e| OpError::Fatal(anyhow!(e)))?;
            #[cfg(debug_assertions)]
            debug!("<< {}", text);

            if status.is_success() {
                return match serde_json::from_str(&text) {
                    Ok(t) => Ok(t),
                    Err(e) => {
                        op_fatal!("Failed to parse JSON from {}: {} {}", path, text, e);
                    }
                };
            }

            match status {
                StatusCode::UNAUTHORIZED
                    if attempt == 1 && matches!(self.auth, ProxmoxAuth::Password { .. }) =>
                {
                    self.ticket.write().await.take();
                    continue;
                }
                StatusCode::UNAUTHORIZED => {
                    op_fatal!("{} {}: unauthorized: {}", method, path, text);
                }
                StatusCode::FORBIDDEN => {
                    // Proxmox names the missing privilege in the body
                    op_fatal!("{} {}: permission denied: {}", method, path, text);
                }
                s if s.is_server_error() => {
                    op_transient!("{} {}: {}: {}", method, path, status, text);
                }
                _ => {
                    op_fatal!("{} {}: {}: {}", method, path, status, text);
                }
            }
        }
    }

    /// Make a request and only return the status code.
    pub async fn req_status<R: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<R>,
    ) -> OpResult<u16> {
        let url = self
            .base
            .join(path)
            .map_err(|e| OpError::Fatal(anyhow!(e)))?;
        let mut req = self.client.request(method.clone(), url);
        if let Some(body) = &body {
            req = req.form(body);
        }
        let req = self
            .attach_auth(&method, req)
            .await
            .map_err(OpError::Fatal)?;
        let rsp = req
            .send()
            .await
            .map_err(|e| OpError::Transient(anyhow!(e)))?;

        let status = rsp.status();
        let text = rsp
            .text()
            .await
            .map_err(|e| OpError::Transient(anyhow!(e)))?;
        #[cfg(debug_assertions)]
        debug!("<< {}", text);
        if status.is_success() {
            Ok(status.as_u16())
        } else if status.is_server_error() {
            op_transient!("{} {}: {}: {}", method, path, status, text);
        } else {
            op_fatal!("{} {}: {}: {}", method, path, status, text);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn password_auth() -> ProxmoxAuth {
        ProxmoxAuth::Password {
            username: "root@pam".to_string(),
            password: "hunter2".to_string(),
        }
    }

    fn ticket_mock() -> wiremock::Mock {
        Mock::given(method("POST"))
            .and(path("/api2/json/access/ticket"))
            .and(body_string_contains("username=root%40pam"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": {"ticket": "PVE:root@pam:AAAA", "CSRFPreventionToken": "tok:csrf"}
            })))
    }

    #[tokio::test]
    async fn password_auth_fetches_ticket_and_sends_cookie() {
        let server = MockServer::start().await;
        ticket_mock().expect(1).mount(&server).await;

        Mock::given(method("GET"))
            .and(path("/api2/json/nodes"))
            .and(header("cookie", "PVEAuthCookie=PVE:root@pam:AAAA"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"data": [{"node": "pve-1"}]})),
            )
            .expect(2)
            .mount(&server)
            .await;

        let api = JsonApi::new(&server.uri(), password_auth()).unwrap();
        let _: serde_json::Value = api.get("/api2/json/nodes").await.unwrap();
        // second call reuses the cached ticket (ticket mock expects 1 call)
        let _: serde_json::Value = api.get("/api2/json/nodes").await.unwrap();
    }

    #[tokio::test]
    async fn csrf_header_only_on_mutating_requests() {
        let server = MockServer::start().await;
        ticket_mock().mount(&server).await;

        Mock::given(method("PUT"))
            .and(path("/api2/json/nodes/pve-1/qemu/100/config"))
            .and(header("CSRFPreventionToken", "tok:csrf"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": null})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let api = JsonApi::new(&server.uri(), password_auth()).unwrap();
        let _: serde_json::Value = api
            .put(
                "/api2/json/nodes/pve-1/qemu/100/config",
                [("cores", "2")],
            )
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn token_auth_sends_authorization_header() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path("/api2/json/nodes"))
            .and(header(
                "authorization",
                "PVEAPIToken=orchestrator@pve!provision=s3cret",
            ))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
            .expect(1)
            .mount(&server)
            .await;

        let api = JsonApi::new(
            &server.uri(),
            ProxmoxAuth::Token {
                token_id: "orchestrator@pve!provision".to_string(),
                secret: "s3cret".to_string(),
            },
        )
        .unwrap();
        let _: serde_json::Value = api.get("/api2/json/nodes").await.unwrap();
    }

    #[tokio::test]
    async fn unauthorized_triggers_one_ticket_refresh() {
        let server = MockServer::start().await;
        ticket_mock().expect(2).mount(&server).await;

        Mock::given(method("GET"))
            .and(path("/api2/json/nodes"))
            .respond_with(ResponseTemplate::new(401).set_body_string("401 Unauthorized"))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": []})))
            .mount(&server)
            .await;

        let api = JsonApi::new(&server.uri(), password_auth()).unwrap();
        let _: serde_json::Value = api.get("/api2/json/nodes").await.unwrap();
    }

    #[tokio::test]
    async fn error_body_is_preserved_for_missing_vm_detection() {
        let server = MockServer::start().await;
        ticket_mock().mount(&server).await;

        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve-1/qemu/123/config"))
            .respond_with(
                ResponseTemplate::new(500)
                    .set_body_string("Configuration file 'qemu-server/123.conf' does not exist"),
            )
            .mount(&server)
            .await;

        let api = JsonApi::new(&server.uri(), password_auth()).unwrap();
        let err = api
            .get::<serde_json::Value>("/api2/json/nodes/pve-1/qemu/123/config")
            .await
            .unwrap_err();
        assert!(err.inner().to_string().contains("does not exist"));
    }
}
