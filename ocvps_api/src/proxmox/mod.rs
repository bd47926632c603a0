//! Typed operations over the Proxmox REST surface, one client per node.

mod models;

pub use models::*;

use crate::json_api::JsonApi;
use crate::settings::{SshSettings, VM_ID_LIMIT};
use crate::ssh_client::SshClient;
use log::warn;
use ocvps_common::retry::{OpError, OpResult};
use ocvps_common::op_fatal;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::sleep;

/// Substring check for Proxmox's many spellings of "that VM is gone".
///
/// Callers use this to turn an API failure into the DELETED transition
/// instead of an error; the match is deliberately on the message text
/// because Proxmox reports the condition as a 500 as often as a 404.
pub fn is_missing_vm_error(e: &anyhow::Error) -> bool {
    let s = e.to_string().to_lowercase();
    s.contains("does not exist")
        || s.contains("configuration file") && s.contains("not found")
        || s.contains("not found on any node")
        || s.contains("404 not found")
}

#[derive(Debug, Serialize)]
struct CreateVm {
    #[serde(rename = "vmid")]
    vm_id: u64,
    #[serde(flatten)]
    config: VmConfigUpdate,
}

#[derive(Debug, Serialize)]
struct CloneVm {
    #[serde(rename = "newid")]
    new_id: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    full: u8,
    #[serde(skip_serializing_if = "Option::is_none")]
    storage: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct VolumeInfo {
    pub path: Option<String>,
    pub size: Option<u64>,
    pub format: Option<String>,
}

pub struct ProxmoxClient {
    api: JsonApi,
    node: String,
    ssh: Option<SshSettings>,
    ssh_addr: Option<(String, u16)>,
}

impl ProxmoxClient {
    pub fn new(
        api: JsonApi,
        node: &str,
        ssh: Option<SshSettings>,
        ssh_addr: Option<(String, u16)>,
    ) -> Self {
        Self {
            api,
            node: node.to_string(),
            ssh,
            ssh_addr,
        }
    }

    pub fn node(&self) -> &str {
        &self.node
    }

    pub fn api(&self) -> &JsonApi {
        &self.api
    }

    /// Open an authenticated SSH session to this node.
    pub async fn open_ssh(&self) -> OpResult<SshClient> {
        let (ssh, addr) = match (&self.ssh, &self.ssh_addr) {
            (Some(s), Some(a)) => (s, a),
            _ => op_fatal!(
                "SSH is not configured for node {}, set PROXMOX_SSH_KEY_PATH or PROXMOX_SSH_KEY_DATA",
                self.node
            ),
        };
        let mut client = SshClient::new().map_err(OpError::Fatal)?;
        client
            .connect((addr.0.as_str(), addr.1), ssh)
            .await
            .map_err(OpError::Transient)?;
        Ok(client)
    }

    /// List cluster nodes
    pub async fn list_nodes(&self) -> OpResult<Vec<NodeInfo>> {
        let rsp: ResponseBase<Vec<NodeInfo>> = self.api.get("/api2/json/nodes").await?;
        Ok(rsp.data)
    }

    /// List storage pools visible on this node
    pub async fn list_storage(&self) -> OpResult<Vec<NodeStorage>> {
        let rsp: ResponseBase<Vec<NodeStorage>> = self
            .api
            .get(&format!("/api2/json/nodes/{}/storage", self.node))
            .await?;
        Ok(rsp.data)
    }

    /// Look up one storage pool by name
    pub async fn get_storage(&self, storage: &str) -> OpResult<NodeStorage> {
        let storages = self.list_storage().await?;
        match storages.into_iter().find(|s| s.storage == storage) {
            Some(s) => Ok(s),
            None => op_fatal!("storage '{}' does not exist on node {}", storage, self.node),
        }
    }

    /// List all VMs on this node
    pub async fn list_vms(&self) -> OpResult<Vec<VmSummary>> {
        let rsp: ResponseBase<Vec<VmSummary>> = self
            .api
            .get(&format!("/api2/json/nodes/{}/qemu", self.node))
            .await?;
        Ok(rsp.data)
    }

    /// Locate an OS template VM by name substring. Only VMs carrying
    /// the template flag qualify.
    pub async fn find_template_vmid(&self, name: &str) -> OpResult<Option<u64>> {
        let vms = self.list_vms().await?;
        Ok(vms
            .into_iter()
            .filter(|vm| vm.template)
            .find(|vm| {
                vm.name
                    .as_deref()
                    .map(|n| n.contains(name))
                    .unwrap_or(false)
            })
            .map(|vm| vm.vm_id))
    }

    pub async fn get_vm_status(&self, vmid: u64) -> OpResult<VmStatus> {
        let rsp: ResponseBase<VmStatus> = self
            .api
            .get(&format!(
                "/api2/json/nodes/{}/qemu/{}/status/current",
                self.node, vmid
            ))
            .await?;
        Ok(rsp.data)
    }

    pub async fn get_vm_config(&self, vmid: u64) -> OpResult<VmConfig> {
        let rsp: ResponseBase<VmConfig> = self
            .api
            .get(&format!(
                "/api2/json/nodes/{}/qemu/{}/config",
                self.node, vmid
            ))
            .await?;
        Ok(rsp.data)
    }

    /// Create a fresh VM shell
    pub async fn create_vm(&self, vmid: u64, config: VmConfigUpdate) -> OpResult<Option<TaskId>> {
        let rsp: ResponseBase<Option<String>> = self
            .api
            .post(
                &format!("/api2/json/nodes/{}/qemu", self.node),
                CreateVm { vm_id: vmid, config },
            )
            .await?;
        Ok(rsp.data.map(|id| self.task(id)))
    }

    /// Clone a VM. `full = false` requests a linked clone and must not
    /// carry a storage parameter; Proxmox rejects the combination.
    pub async fn clone_vm(
        &self,
        template_vmid: u64,
        new_vmid: u64,
        name: &str,
        full: bool,
        target_storage: Option<&str>,
    ) -> OpResult<TaskId> {
        let rsp: ResponseBase<String> = self
            .api
            .post(
                &format!(
                    "/api2/json/nodes/{}/qemu/{}/clone",
                    self.node, template_vmid
                ),
                CloneVm {
                    new_id: new_vmid,
                    name: Some(name.to_string()),
                    full: if full { 1 } else { 0 },
                    storage: if full {
                        target_storage.map(String::from)
                    } else {
                        None
                    },
                },
            )
            .await?;
        Ok(self.task(rsp.data))
    }

    /// Apply a typed config update (form-encoded PUT)
    pub async fn update_vm_config(&self, vmid: u64, config: &VmConfigUpdate) -> OpResult<()> {
        self.api
            .req_status(
                Method::PUT,
                &format!("/api2/json/nodes/{}/qemu/{}/config", self.node, vmid),
                Some(config),
            )
            .await?;
        Ok(())
    }

    /// Apply raw config parameters; used where the key itself is
    /// dynamic (disk attach under `scsi0`/`virtio0`/... or `delete=`)
    pub async fn update_vm_config_raw(&self, vmid: u64, params: &[(String, String)]) -> OpResult<()> {
        self.api
            .req_status(
                Method::PUT,
                &format!("/api2/json/nodes/{}/qemu/{}/config", self.node, vmid),
                Some(params),
            )
            .await?;
        Ok(())
    }

    pub async fn delete_vm(&self, vmid: u64) -> OpResult<Option<TaskId>> {
        let rsp: ResponseBase<Option<String>> = self
            .api
            .delete(&format!("/api2/json/nodes/{}/qemu/{}", self.node, vmid))
            .await?;
        Ok(rsp.data.map(|id| self.task(id)))
    }

    pub async fn start_vm(&self, vmid: u64) -> OpResult<TaskId> {
        self.status_change(vmid, "start").await
    }

    pub async fn stop_vm(&self, vmid: u64) -> OpResult<TaskId> {
        self.status_change(vmid, "stop").await
    }

    pub async fn reboot_vm(&self, vmid: u64) -> OpResult<TaskId> {
        self.status_change(vmid, "reboot").await
    }

    async fn status_change(&self, vmid: u64, verb: &str) -> OpResult<TaskId> {
        let rsp: ResponseBase<String> = self
            .api
            .post_empty(&format!(
                "/api2/json/nodes/{}/qemu/{}/status/{}",
                self.node, vmid, verb
            ))
            .await?;
        Ok(self.task(rsp.data))
    }

    /// `PUT /resize` with `disk=<key>&size=<N>G`
    pub async fn resize_disk(&self, vmid: u64, disk: &str, size: &str) -> OpResult<Option<TaskId>> {
        let rsp: ResponseBase<Option<String>> = self
            .api
            .put(
                &format!("/api2/json/nodes/{}/qemu/{}/resize", self.node, vmid),
                [("disk", disk), ("size", size)],
            )
            .await?;
        Ok(rsp.data.map(|id| self.task(id)))
    }

    /// Move a disk to another storage via the native API. Works for
    /// non-thin targets; thin targets go through the mediated convert.
    pub async fn move_disk(
        &self,
        vmid: u64,
        disk: &str,
        target_storage: &str,
        delete_source: bool,
    ) -> OpResult<TaskId> {
        let rsp: ResponseBase<String> = self
            .api
            .post(
                &format!("/api2/json/nodes/{}/qemu/{}/move_disk", self.node, vmid),
                [
                    ("disk", disk.to_string()),
                    ("storage", target_storage.to_string()),
                    ("delete", if delete_source { "1" } else { "0" }.to_string()),
                ],
            )
            .await?;
        Ok(self.task(rsp.data))
    }

    /// List volumes in a storage pool
    pub async fn list_storage_content(&self, storage: &str) -> OpResult<Vec<StorageContentEntry>> {
        let rsp: ResponseBase<Vec<StorageContentEntry>> = self
            .api
            .get(&format!(
                "/api2/json/nodes/{}/storage/{}/content",
                self.node, storage
            ))
            .await?;
        Ok(rsp.data)
    }

    /// Allocate a volume in a storage pool, returns the volid
    pub async fn create_volume(
        &self,
        storage: &str,
        vmid: u64,
        filename: &str,
        size: &str,
        format: Option<&str>,
    ) -> OpResult<String> {
        let mut params = vec![
            ("filename".to_string(), filename.to_string()),
            ("size".to_string(), size.to_string()),
            ("vmid".to_string(), vmid.to_string()),
        ];
        if let Some(f) = format {
            params.push(("format".to_string(), f.to_string()));
        }
        let rsp: ResponseBase<String> = self
            .api
            .post(
                &format!(
                    "/api2/json/nodes/{}/storage/{}/content",
                    self.node, storage
                ),
                params,
            )
            .await?;
        Ok(rsp.data)
    }

    pub async fn get_volume(&self, storage: &str, volid: &str) -> OpResult<VolumeInfo> {
        let rsp: ResponseBase<VolumeInfo> = self
            .api
            .get(&format!(
                "/api2/json/nodes/{}/storage/{}/content/{}",
                self.node,
                storage,
                urlencoding::encode(volid)
            ))
            .await?;
        Ok(rsp.data)
    }

    pub async fn delete_volume(&self, storage: &str, volid: &str) -> OpResult<()> {
        let _: ResponseBase<Option<String>> = self
            .api
            .delete(&format!(
                "/api2/json/nodes/{}/storage/{}/content/{}",
                self.node,
                storage,
                urlencoding::encode(volid)
            ))
            .await?;
        Ok(())
    }

    /// Next free VMID. With a configured floor, scans upward from it
    /// and refuses to pass the safety limit.
    pub async fn next_vmid(&self, start: Option<u64>) -> OpResult<u64> {
        let Some(start) = start else {
            let rsp: ResponseBase<String> = self.api.get("/api2/json/cluster/nextid").await?;
            return match rsp.data.parse() {
                Ok(id) => Ok(id),
                Err(_) => op_fatal!("cluster/nextid returned non-numeric id: {}", rsp.data),
            };
        };

        let mut id = start;
        while id <= VM_ID_LIMIT {
            match self
                .api
                .get::<ResponseBase<String>>(&format!("/api2/json/cluster/nextid?vmid={}", id))
                .await
            {
                Ok(_) => return Ok(id),
                Err(OpError::Fatal(_)) => {
                    // taken, keep scanning
                    id += 1;
                }
                Err(e) => return Err(e),
            }
        }
        op_fatal!("no free VMID at or above {} (limit {})", start, VM_ID_LIMIT)
    }

    pub async fn set_firewall_options(&self, vmid: u64, opts: &FirewallOptions) -> OpResult<()> {
        self.api
            .req_status(
                Method::PUT,
                &format!(
                    "/api2/json/nodes/{}/qemu/{}/firewall/options",
                    self.node, vmid
                ),
                Some(opts),
            )
            .await?;
        Ok(())
    }

    pub async fn list_firewall_rules(&self, vmid: u64) -> OpResult<Vec<FirewallRule>> {
        let rsp: ResponseBase<Vec<FirewallRule>> = self
            .api
            .get(&format!(
                "/api2/json/nodes/{}/qemu/{}/firewall/rules",
                self.node, vmid
            ))
            .await?;
        Ok(rsp.data)
    }

    pub async fn add_firewall_rule(&self, vmid: u64, rule: &FirewallRule) -> OpResult<()> {
        self.api
            .req_status(
                Method::POST,
                &format!(
                    "/api2/json/nodes/{}/qemu/{}/firewall/rules",
                    self.node, vmid
                ),
                Some(rule),
            )
            .await?;
        Ok(())
    }

    pub async fn update_firewall_rule(
        &self,
        vmid: u64,
        pos: u32,
        rule: &FirewallRule,
    ) -> OpResult<()> {
        self.api
            .req_status(
                Method::PUT,
                &format!(
                    "/api2/json/nodes/{}/qemu/{}/firewall/rules/{}",
                    self.node, vmid, pos
                ),
                Some(rule),
            )
            .await?;
        Ok(())
    }

    pub async fn delete_firewall_rule(&self, vmid: u64, pos: u32) -> OpResult<()> {
        self.api
            .req_status::<()>(
                Method::DELETE,
                &format!(
                    "/api2/json/nodes/{}/qemu/{}/firewall/rules/{}",
                    self.node, vmid, pos
                ),
                None,
            )
            .await?;
        Ok(())
    }

    /// Guest agent liveness probe
    pub async fn agent_ping(&self, vmid: u64) -> OpResult<()> {
        let _: serde_json::Value = self
            .api
            .get(&format!(
                "/api2/json/nodes/{}/qemu/{}/agent/ping",
                self.node, vmid
            ))
            .await?;
        Ok(())
    }

    pub async fn agent_info(&self, vmid: u64) -> OpResult<serde_json::Value> {
        let rsp: ResponseBase<serde_json::Value> = self
            .api
            .get(&format!(
                "/api2/json/nodes/{}/qemu/{}/agent/info",
                self.node, vmid
            ))
            .await?;
        Ok(rsp.data)
    }

    /// Run a command inside the guest via the agent
    pub async fn agent_exec(&self, vmid: u64, command: &str) -> OpResult<serde_json::Value> {
        let rsp: ResponseBase<serde_json::Value> = self
            .api
            .post(
                &format!("/api2/json/nodes/{}/qemu/{}/agent/exec", self.node, vmid),
                [("command", command)],
            )
            .await?;
        Ok(rsp.data)
    }

    pub async fn agent_network_interfaces(&self, vmid: u64) -> OpResult<Vec<AgentInterface>> {
        let rsp: ResponseBase<AgentInterfaceList> = self
            .api
            .get(&format!(
                "/api2/json/nodes/{}/qemu/{}/agent/network-get-interfaces",
                self.node, vmid
            ))
            .await?;
        Ok(rsp.data.result)
    }

    pub async fn vnc_proxy(&self, vmid: u64) -> OpResult<ProxyTicket> {
        let rsp: ResponseBase<ProxyTicket> = self
            .api
            .post(
                &format!("/api2/json/nodes/{}/qemu/{}/vncproxy", self.node, vmid),
                [("websocket", "1")],
            )
            .await?;
        Ok(rsp.data)
    }

    pub async fn term_proxy(&self, vmid: u64) -> OpResult<ProxyTicket> {
        let rsp: ResponseBase<ProxyTicket> = self
            .api
            .post_empty(&format!(
                "/api2/json/nodes/{}/qemu/{}/termproxy",
                self.node, vmid
            ))
            .await?;
        Ok(rsp.data)
    }

    pub async fn get_task_status(&self, task: &TaskId) -> OpResult<TaskStatus> {
        let rsp: ResponseBase<TaskStatus> = self
            .api
            .get(&format!(
                "/api2/json/nodes/{}/tasks/{}/status",
                task.node, task.id
            ))
            .await?;
        Ok(rsp.data)
    }

    /// Poll a task to completion, 1 second interval.
    pub async fn wait_for_task(&self, task: &TaskId, max_wait: Duration) -> OpResult<TaskStatus> {
        let start_time = std::time::Instant::now();

        loop {
            if start_time.elapsed() > max_wait {
                op_fatal!("Task {} timed out after {:?}", task.id, max_wait);
            }

            let s = self.get_task_status(task).await?;
            if s.is_finished() {
                if s.is_success() {
                    return Ok(s);
                } else {
                    op_fatal!(
                        "Task finished with error: {}",
                        s.exit_status.unwrap_or_else(|| "no error message".to_string())
                    );
                }
            }
            sleep(Duration::from_secs(1)).await;
        }
    }

    /// Poll VM status until it reports `stopped` or the timeout expires.
    ///
    /// Proxmox marks the stop *task* complete before the VM process has
    /// fully terminated; disk and delete operations must not proceed
    /// until the status endpoint agrees.
    pub async fn wait_for_vm_stopped(&self, vmid: u64, max_wait: Duration) -> OpResult<()> {
        self.wait_for_vm_stopped_with_interval(vmid, max_wait, Duration::from_secs(1))
            .await
    }

    async fn wait_for_vm_stopped_with_interval(
        &self,
        vmid: u64,
        max_wait: Duration,
        poll_interval: Duration,
    ) -> OpResult<()> {
        let start_time = std::time::Instant::now();

        loop {
            if start_time.elapsed() > max_wait {
                op_fatal!("VM {} did not reach stopped state within {:?}", vmid, max_wait);
            }

            match self.get_vm_status(vmid).await {
                Ok(info) if info.is_stopped() => return Ok(()),
                Ok(_) => {}
                Err(e) => {
                    warn!(
                        "Error polling VM {} status while waiting for stop: {}",
                        vmid, e
                    );
                }
            }
            sleep(poll_interval).await;
        }
    }

    fn task(&self, id: String) -> TaskId {
        TaskId {
            id,
            node: self.node.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ProxmoxAuth;
    use wiremock::matchers::{body_string_contains, method, path, path_regex, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> ProxmoxClient {
        let api = JsonApi::new(
            &server.uri(),
            ProxmoxAuth::Token {
                token_id: "orchestrator@pve!provision".to_string(),
                secret: "s3cret".to_string(),
            },
        )
        .unwrap();
        ProxmoxClient::new(api, "pve-1", None, None)
    }

    #[test]
    fn missing_vm_error_predicate() {
        for msg in [
            "Configuration file 'qemu-server/105.conf' does not exist",
            "VM 105 not found on any node",
            "GET /x: 404 Not Found: nothing here",
        ] {
            assert!(is_missing_vm_error(&anyhow::anyhow!("{}", msg)), "{}", msg);
        }
        assert!(!is_missing_vm_error(&anyhow::anyhow!("connection refused")));
    }

    #[tokio::test]
    async fn find_template_requires_template_flag_and_substring() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/api2/json/nodes/pve-1/qemu"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "data": [
                    {"vmid": 100, "name": "ubuntu-22.04-standard-copy", "status": "running"},
                    {"vmid": 9000, "name": "ubuntu-22.04-standard", "status": "stopped", "template": 1},
                    {"vmid": 9001, "name": "debian-12-standard", "status": "stopped", "template": 1}
                ]
            })))
            .mount(&server)
            .await;

        let c = client(&server);
        assert_eq!(
            c.find_template_vmid("ubuntu-22.04-standard").await.unwrap(),
            Some(9000)
        );
        assert_eq!(c.find_template_vmid("rocky-9-standard").await.unwrap(), None);
    }

    #[tokio::test]
    async fn linked_clone_sends_no_storage_param() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/api2/json/nodes/pve-1/qemu/9000/clone"))
            .and(body_string_contains("full=0"))
            .and(body_string_contains("newid=105"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"data": "UPID:pve-1:clone"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let c = client(&server);
        let task = c
            .clone_vm(9000, 105, "vps-a1b2", false, Some("ignored"))
            .await
            .unwrap();
        assert_eq!(task.id, "UPID:pve-1:clone");

        // verify the recorded request had no storage= pair
        let reqs = server.received_requests().await.unwrap();
        let body = String::from_utf8(reqs[0].body.clone()).unwrap();
        assert!(!body.contains("storage="), "body was: {}", body);
    }

    #[tokio::test]
    async fn next_vmid_scans_from_floor() {
        let server = MockServer::start().await;
        // 500 and 501 taken, 502 free
        for taken in [500, 501] {
            Mock::given(method("GET"))
                .and(path("/api2/json/cluster/nextid"))
                .and(query_param("vmid", taken.to_string()))
                .respond_with(
                    ResponseTemplate::new(400).set_body_string("VM already exists"),
                )
                .mount(&server)
                .await;
        }
        Mock::given(method("GET"))
            .and(path("/api2/json/cluster/nextid"))
            .and(query_param("vmid", "502"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"data": "502"})),
            )
            .mount(&server)
            .await;

        let c = client(&server);
        assert_eq!(c.next_vmid(Some(500)).await.unwrap(), 502);
    }

    #[tokio::test]
    async fn wait_for_vm_stopped_polls_until_stopped() {
        let server = MockServer::start().await;

        Mock::given(method("GET"))
            .and(path_regex(r".*/status/current$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"data": {"vmid": 100, "status": "running"}}),
            ))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path_regex(r".*/status/current$"))
            .respond_with(ResponseTemplate::new(200).set_body_json(
                serde_json::json!({"data": {"vmid": 100, "status": "stopped"}}),
            ))
            .expect(1)
            .mount(&server)
            .await;

        let c = client(&server);
        c.wait_for_vm_stopped_with_interval(
            100,
            Duration::from_secs(30),
            Duration::from_millis(10),
        )
        .await
        .expect("should succeed once status is stopped");
    }
}
