//! Static tool catalog. Populated once at startup; the same declarations
//! back the executor's handler lookup (`tools/registry.rs`) and the
//! provider-facing `ToolInfo` descriptions, so tiers and schemas can never
//! drift apart.

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{json, Value};

use crate::{
    infra::{proxmox::ProxmoxClient, ssh::exec_with_timeout, SshPool},
    security::Tier,
    tools::traits::{Tool, ToolResult},
};

fn arg_str<'a>(args: &'a Value, key: &str) -> Result<&'a str, String> {
    args.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| format!("missing required string argument '{key}'"))
}

fn arg_u64(args: &Value, key: &str) -> Result<u64, String> {
    args.get(key)
        .and_then(Value::as_u64)
        .ok_or_else(|| format!("missing required integer argument '{key}'"))
}

pub struct GetClusterStatusTool {
    pub proxmox: Arc<ProxmoxClient>,
}

#[async_trait]
impl Tool for GetClusterStatusTool {
    fn name(&self) -> &str {
        "get_cluster_status"
    }
    fn description(&self) -> &str {
        "Fetch the Proxmox cluster quorum and node status summary."
    }
    fn parameters_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }
    fn tier(&self) -> Tier {
        Tier::Green
    }
    async fn execute(&self, _args: Value) -> Result<ToolResult, String> {
        let status = self
            .proxmox
            .cluster_status()
            .await
            .map_err(|e| e.to_string())?;
        Ok(ToolResult::ok(status.to_string()).with_metadata(status))
    }
}

pub struct GetVmStatusTool {
    pub proxmox: Arc<ProxmoxClient>,
}

#[async_trait]
impl Tool for GetVmStatusTool {
    fn name(&self) -> &str {
        "get_vm_status"
    }
    fn description(&self) -> &str {
        "Fetch the current status of a VM by node and vmid."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "node": {"type": "string"},
                "vmid": {"type": "integer"},
            },
            "required": ["node", "vmid"],
        })
    }
    fn tier(&self) -> Tier {
        Tier::Green
    }
    async fn execute(&self, args: Value) -> Result<ToolResult, String> {
        let node = arg_str(&args, "node")?;
        let vmid = arg_u64(&args, "vmid")?;
        let status = self
            .proxmox
            .vm_status(node, vmid)
            .await
            .map_err(|e| e.to_string())?;
        Ok(ToolResult::ok(status.to_string()).with_metadata(status))
    }
}

/// Shared by `start_vm`/`stop_vm`/`reboot_vm` — only the action string and
/// declared tier differ.
pub struct VmActionTool {
    pub proxmox: Arc<ProxmoxClient>,
    pub name: &'static str,
    pub action: &'static str,
    pub tier: Tier,
}

#[async_trait]
impl Tool for VmActionTool {
    fn name(&self) -> &str {
        self.name
    }
    fn description(&self) -> &str {
        "Change a VM's power state on a given node."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "node": {"type": "string"},
                "vmid": {"type": "integer"},
            },
            "required": ["node", "vmid"],
        })
    }
    fn tier(&self) -> Tier {
        self.tier
    }
    async fn execute(&self, args: Value) -> Result<ToolResult, String> {
        let node = arg_str(&args, "node")?;
        let vmid = arg_u64(&args, "vmid")?;
        let result = self
            .proxmox
            .vm_action(node, vmid, self.action)
            .await
            .map_err(|e| e.to_string())?;
        Ok(ToolResult::ok(format!("{} vmid {vmid} on {node}: {result}", self.action)))
    }
}

pub struct SshExecTool {
    pub pool: Arc<SshPool>,
    pub nodes: Vec<crate::config::schema::ProxmoxNodeConfig>,
    pub deadline_ms: u64,
}

#[async_trait]
impl Tool for SshExecTool {
    fn name(&self) -> &str {
        "ssh_exec"
    }
    fn description(&self) -> &str {
        "Run a single non-interactive shell command on a cluster node over SSH."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "node": {"type": "string"},
                "command": {"type": "string"},
            },
            "required": ["node", "command"],
        })
    }
    fn tier(&self) -> Tier {
        Tier::Yellow
    }
    async fn execute(&self, args: Value) -> Result<ToolResult, String> {
        let node_name = arg_str(&args, "node")?;
        let command = arg_str(&args, "command")?.to_owned();

        let host = self
            .nodes
            .iter()
            .find(|n| n.name.eq_ignore_ascii_case(node_name))
            .map(|n| n.host.clone())
            .ok_or_else(|| format!("unknown node '{node_name}'"))?;

        let result = exec_with_timeout(self.pool.clone(), host, command, self.deadline_ms)
            .await
            .map_err(|e| e.to_string())?;

        Ok(ToolResult::ok(result.stdout.clone()).with_metadata(json!({
            "stdout": result.stdout,
            "stderr": result.stderr,
            "code": result.code,
        })))
    }
}

pub struct RestartServiceTool {
    pub pool: Arc<SshPool>,
    pub nodes: Vec<crate::config::schema::ProxmoxNodeConfig>,
    pub deadline_ms: u64,
}

#[async_trait]
impl Tool for RestartServiceTool {
    fn name(&self) -> &str {
        "restart_service"
    }
    fn description(&self) -> &str {
        "Restart a systemd service on a cluster node."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "node": {"type": "string"},
                "service": {"type": "string"},
            },
            "required": ["node", "service"],
        })
    }
    fn tier(&self) -> Tier {
        Tier::Red
    }
    async fn execute(&self, args: Value) -> Result<ToolResult, String> {
        let node_name = arg_str(&args, "node")?;
        let service = arg_str(&args, "service")?;

        let host = self
            .nodes
            .iter()
            .find(|n| n.name.eq_ignore_ascii_case(node_name))
            .map(|n| n.host.clone())
            .ok_or_else(|| format!("unknown node '{node_name}'"))?;

        let cmd = format!("systemctl restart {service}");
        let result = exec_with_timeout(self.pool.clone(), host, cmd, self.deadline_ms)
            .await
            .map_err(|e| e.to_string())?;

        if result.code != 0 {
            return Err(format!("systemctl exited {}: {}", result.code, result.stderr));
        }
        Ok(ToolResult::ok(format!("restarted {service} on {node_name}")))
    }
}

pub struct RebootNodeTool {
    pub pool: Arc<SshPool>,
    pub nodes: Vec<crate::config::schema::ProxmoxNodeConfig>,
    pub deadline_ms: u64,
}

#[async_trait]
impl Tool for RebootNodeTool {
    fn name(&self) -> &str {
        "reboot_node"
    }
    fn description(&self) -> &str {
        "Reboot an entire cluster node. Destructive — requires the approval keyword."
    }
    fn parameters_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {"node": {"type": "string"}},
            "required": ["node"],
        })
    }
    fn tier(&self) -> Tier {
        Tier::Orange
    }
    async fn execute(&self, args: Value) -> Result<ToolResult, String> {
        let node_name = arg_str(&args, "node")?;
        let host = self
            .nodes
            .iter()
            .find(|n| n.name.eq_ignore_ascii_case(node_name))
            .map(|n| n.host.clone())
            .ok_or_else(|| format!("unknown node '{node_name}'"))?;

        let result = exec_with_timeout(
            self.pool.clone(),
            host,
            "systemctl reboot".to_owned(),
            self.deadline_ms,
        )
        .await
        .map_err(|e| e.to_string())?;

        Ok(ToolResult::ok(format!(
            "reboot issued for {node_name} (exit {})",
            result.code
        )))
    }
}

/// Construct and register every builtin tool against the live infra clients.
/// Called once at startup (see `jarvis-daemon::main`).
pub fn register_all(
    registry: &mut crate::tools::registry::ToolRegistry,
    proxmox: Arc<ProxmoxClient>,
    ssh: Arc<SshPool>,
    nodes: Vec<crate::config::schema::ProxmoxNodeConfig>,
    ssh_deadline_ms: u64,
) {
    registry.register(Arc::new(GetClusterStatusTool {
        proxmox: proxmox.clone(),
    }));
    registry.register(Arc::new(GetVmStatusTool {
        proxmox: proxmox.clone(),
    }));
    registry.register(Arc::new(VmActionTool {
        proxmox: proxmox.clone(),
        name: "start_vm",
        action: "start",
        tier: Tier::Yellow,
    }));
    registry.register(Arc::new(VmActionTool {
        proxmox: proxmox.clone(),
        name: "stop_vm",
        action: "stop",
        tier: Tier::Red,
    }));
    registry.register(Arc::new(VmActionTool {
        proxmox,
        name: "reboot_vm",
        action: "reboot",
        tier: Tier::Red,
    }));
    registry.register(Arc::new(SshExecTool {
        pool: ssh.clone(),
        nodes: nodes.clone(),
        deadline_ms: ssh_deadline_ms,
    }));
    registry.register(Arc::new(RestartServiceTool {
        pool: ssh.clone(),
        nodes: nodes.clone(),
        deadline_ms: ssh_deadline_ms,
    }));
    registry.register(Arc::new(RebootNodeTool {
        pool: ssh,
        nodes,
        deadline_ms: ssh_deadline_ms,
    }));
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn arg_str_missing_errors() {
        let args = json!({});
        assert!(arg_str(&args, "node").is_err());
    }

    #[test]
    fn arg_u64_present() {
        let args = json!({"vmid": 105});
        assert_eq!(arg_u64(&args, "vmid").unwrap(), 105);
    }
}
