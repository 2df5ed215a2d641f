//! Safety policy: tier enforcement, protected-resource filtering, input
//! sanitization, and the override-key / approval-keyword handshake.
//!
//! `SecurityPolicy` composes three independent checks in order for every
//! tool invocation: sanitization, the protected-resource filter, then tier
//! enforcement. All three must pass for a call to be auto-allowed; RED and
//! ORANGE tiers additionally gate on an explicit `confirmed` flag that never
//! originates from model output.

use std::{
    collections::VecDeque,
    sync::Mutex,
    time::{Duration, Instant},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::config::schema::ProtectedResources;

// ─── Public types ──────────────────────────────────────────────────────────

/// Effect tier of a tool. Unknown tool names are treated as `Black`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Tier {
    /// Read-only; always auto-allowed.
    Green,
    /// Mutating but low-risk; logged and auto-allowed.
    Yellow,
    /// Requires an explicit `confirmed=true` side-channel flag.
    Red,
    /// Requires `confirmed=true` *and* a human-typed approval keyword in
    /// the originating user turn.
    Orange,
    /// Always denied, regardless of confirmation or override key.
    Black,
}

impl Tier {
    pub fn requires_confirmation(self) -> bool {
        matches!(self, Tier::Red | Tier::Orange)
    }
}

/// Where a tool invocation originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolSource {
    Llm,
    User,
    Monitor,
    Api,
}

/// Result of `SecurityPolicy::evaluate`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SafetyDecision {
    pub allowed: bool,
    pub reason: Option<String>,
    pub tier: Tier,
    pub requires_confirmation: bool,
}

impl SafetyDecision {
    fn allow(tier: Tier) -> Self {
        Self {
            allowed: true,
            reason: None,
            tier,
            requires_confirmation: false,
        }
    }

    fn deny(tier: Tier, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            reason: Some(reason.into()),
            tier,
            requires_confirmation: false,
        }
    }

    fn needs_confirmation(tier: Tier) -> Self {
        Self {
            allowed: false,
            reason: None,
            tier,
            requires_confirmation: true,
        }
    }
}

/// Everything the policy needs to evaluate a single invocation.
pub struct CheckInput<'a> {
    pub tool_name: &'a str,
    pub tier: Tier,
    pub args: &'a Value,
    /// Explicit operator confirmation; must never be sourced from LLM output.
    pub confirmed: bool,
    /// The user turn that produced this invocation, used for the approval
    /// keyword and override-key checks.
    pub user_turn: &'a str,
    pub source: ToolSource,
}

// ─── Sliding-window rate limiter ───────────────────────────────────────────

struct SlidingWindow {
    window: Duration,
    max_actions: usize,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl SlidingWindow {
    fn new(window_secs: u64, max_actions: usize) -> Self {
        Self {
            window: Duration::from_secs(window_secs),
            max_actions,
            timestamps: Mutex::new(VecDeque::new()),
        }
    }

    fn try_record(&self) -> bool {
        let mut ts = self.timestamps.lock().expect("rate-limiter lock poisoned");
        let now = Instant::now();
        ts.retain(|&t| now.duration_since(t) < self.window);
        if ts.len() >= self.max_actions {
            return false;
        }
        ts.push_back(now);
        true
    }

    #[cfg(test)]
    fn count(&self) -> usize {
        let mut ts = self.timestamps.lock().expect("lock");
        let now = Instant::now();
        ts.retain(|&t| now.duration_since(t) < self.window);
        ts.len()
    }
}

// ─── SecurityPolicy ────────────────────────────────────────────────────────

/// Stateless-per-call policy, shared across the process via `Arc`.
///
/// Interior mutability (rate limiter) is the only mutable state; everything
/// else is read-only configuration loaded at startup.
pub struct SecurityPolicy {
    pub protected: ProtectedResources,
    /// Commands blocked regardless of tier (`rm`, `sudo`, `dd`, ...).
    pub blocked_commands: Vec<String>,
    /// Allowlisted commands for SSH-like / shell-like tools. Empty means
    /// "no allowlist configured" (every non-blocked command passes).
    pub command_allowlist: Vec<String>,
    pub override_key: String,
    pub approval_keyword: String,
    per_minute: SlidingWindow,
    per_hour: SlidingWindow,
}

const MAX_ARG_STRING_LEN: usize = 10 * 1024;
const SHELL_METACHARACTERS: &[char] = &[';', '&', '`', '$'];

/// Tool names treated as "SSH-like" for allowlist enforcement — they accept
/// a free-form command string that would otherwise bypass per-argument
/// schema validation.
const COMMAND_BEARING_TOOLS: &[&str] = &["shell", "ssh_exec", "run_command"];

impl SecurityPolicy {
    pub fn new(
        protected: ProtectedResources,
        blocked_commands: Vec<String>,
        command_allowlist: Vec<String>,
        override_key: String,
        approval_keyword: String,
        rate_limit_per_minute: u32,
        rate_limit_per_hour: u32,
    ) -> Self {
        Self {
            protected,
            blocked_commands,
            command_allowlist,
            override_key,
            approval_keyword,
            per_minute: SlidingWindow::new(60, rate_limit_per_minute as usize),
            per_hour: SlidingWindow::new(3600, rate_limit_per_hour as usize),
        }
    }

    /// Build a policy from the loaded application configuration.
    pub fn from_config(cfg: &crate::config::schema::SecurityConfig) -> Self {
        Self::new(
            cfg.protected.clone(),
            cfg.blocked_commands.clone(),
            Vec::new(),
            cfg.override_key.clone(),
            cfg.approval_keyword.clone(),
            cfg.rate_limit_per_minute,
            cfg.rate_limit_per_hour,
        )
    }

    /// Run the full three-check pipeline for one invocation.
    pub fn evaluate(&self, input: &CheckInput<'_>) -> SafetyDecision {
        if let Err(reason) = self.sanitize(input.tool_name, input.args) {
            return SafetyDecision::deny(input.tier, reason);
        }

        if let Some(reason) = self.check_protected(input.args) {
            return SafetyDecision::deny(input.tier, reason);
        }

        let override_active = !self.override_key.is_empty()
            && input.user_turn.contains(self.override_key.as_str());

        let tier_result = match input.tier {
            Tier::Black => SafetyDecision::deny(
                Tier::Black,
                "tool tier is BLACK; this action is never permitted",
            ),
            Tier::Green | Tier::Yellow => SafetyDecision::allow(input.tier),
            Tier::Red => {
                if override_active || input.confirmed {
                    SafetyDecision::allow(Tier::Red)
                } else {
                    SafetyDecision::needs_confirmation(Tier::Red)
                }
            }
            Tier::Orange => {
                let keyword_present = !self.approval_keyword.is_empty()
                    && input
                        .user_turn
                        .to_lowercase()
                        .contains(&self.approval_keyword.to_lowercase());
                if override_active {
                    SafetyDecision::allow(Tier::Orange)
                } else if input.confirmed && keyword_present {
                    SafetyDecision::allow(Tier::Orange)
                } else if input.confirmed && !keyword_present {
                    SafetyDecision::deny(
                        Tier::Orange,
                        "ORANGE tools require the approval keyword in the originating turn",
                    )
                } else {
                    SafetyDecision::needs_confirmation(Tier::Orange)
                }
            }
        };

        if !tier_result.allowed {
            return tier_result;
        }

        if !self.per_minute.try_record() || !self.per_hour.try_record() {
            return SafetyDecision::deny(input.tier, "rate limit exceeded");
        }

        tier_result
    }

    // ── Sanitization ─────────────────────────────────────────────────────

    fn sanitize(&self, tool_name: &str, args: &Value) -> Result<(), String> {
        self.sanitize_value(args)?;

        if COMMAND_BEARING_TOOLS.contains(&tool_name) {
            if let Some(command) = extract_command(args) {
                let executable = command
                    .trim()
                    .split_whitespace()
                    .next()
                    .unwrap_or("")
                    .to_string();

                if self.blocked_commands.iter().any(|b| b == &executable) {
                    return Err(format!("executable '{executable}' is blocked"));
                }
                if !self.command_allowlist.is_empty()
                    && !self.command_allowlist.iter().any(|a| a == &executable)
                {
                    return Err(format!(
                        "executable '{executable}' is not on the allowlist"
                    ));
                }
                for ch in SHELL_METACHARACTERS {
                    if command.contains(*ch) {
                        return Err(format!(
                            "command contains disallowed shell metacharacter '{ch}'"
                        ));
                    }
                }
            }
        }

        Ok(())
    }

    fn sanitize_value(&self, value: &Value) -> Result<(), String> {
        match value {
            Value::String(s) => {
                if s.contains('\0') {
                    return Err("argument contains a null byte".to_owned());
                }
                if s.chars().any(|c| c.is_control() && c != '\n' && c != '\t') {
                    return Err("argument contains a disallowed control character".to_owned());
                }
                if s.len() > MAX_ARG_STRING_LEN {
                    return Err(format!(
                        "argument exceeds the {MAX_ARG_STRING_LEN}-byte limit"
                    ));
                }
                Ok(())
            }
            Value::Array(items) => {
                for item in items {
                    self.sanitize_value(item)?;
                }
                Ok(())
            }
            Value::Object(map) => {
                for v in map.values() {
                    self.sanitize_value(v)?;
                }
                Ok(())
            }
            _ => Ok(()),
        }
    }

    // ── Protected-resource filter ────────────────────────────────────────

    fn check_protected(&self, args: &Value) -> Option<String> {
        let Value::Object(map) = args else {
            return None;
        };

        for (key, value) in map {
            let key_lower = key.to_lowercase();
            if key_lower.contains("node") {
                if let Some(s) = value.as_str() {
                    if self.protected.nodes.iter().any(|n| n == s) {
                        return Some(format!("node '{s}' is protected"));
                    }
                }
            }
            if key_lower.contains("vmid") || key_lower.contains("vm_id") {
                if let Some(n) = value.as_u64() {
                    if self.protected.vmids.contains(&n) {
                        return Some(format!("VMID {n} is protected"));
                    }
                }
            }
            if key_lower.contains("service") {
                if let Some(s) = value.as_str() {
                    if self.protected.services.iter().any(|svc| svc == s) {
                        return Some(format!("service '{s}' is protected"));
                    }
                }
            }
            if key_lower.contains("ip") {
                if let Some(s) = value.as_str() {
                    if self.protected.ips.iter().any(|ip| ip == s) {
                        return Some(format!("IP '{s}' is protected"));
                    }
                }
            }
        }
        None
    }
}

fn extract_command(args: &Value) -> Option<String> {
    args.get("command")
        .or_else(|| args.get("cmd"))
        .and_then(Value::as_str)
        .map(str::to_owned)
}

// ─── Tests ──────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy() -> SecurityPolicy {
        SecurityPolicy::new(
            ProtectedResources {
                nodes: vec!["pve".to_owned()],
                vmids: vec![103],
                services: vec!["pve-cluster".to_owned()],
                ips: vec!["10.0.0.1".to_owned()],
            },
            vec!["rm".to_owned(), "sudo".to_owned()],
            Vec::new(),
            "jarvis-unlock".to_owned(),
            "confirmed".to_owned(),
            60,
            600,
        )
    }

    fn input<'a>(
        tool_name: &'a str,
        tier: Tier,
        args: &'a Value,
        confirmed: bool,
        user_turn: &'a str,
    ) -> CheckInput<'a> {
        CheckInput {
            tool_name,
            tier,
            args,
            confirmed,
            user_turn,
            source: ToolSource::Llm,
        }
    }

    #[test]
    fn green_auto_allows() {
        let p = policy();
        let args = json!({});
        let d = p.evaluate(&input("get_cluster_status", Tier::Green, &args, false, "status"));
        assert!(d.allowed);
    }

    #[test]
    fn black_always_denied() {
        let p = policy();
        let args = json!({});
        let d = p.evaluate(&input("unknown_tool", Tier::Black, &args, true, "do it jarvis-unlock"));
        assert!(!d.allowed);
        assert!(!d.requires_confirmation);
    }

    #[test]
    fn red_needs_confirmation_without_flag() {
        let p = policy();
        let args = json!({"node": "pve2", "vmid": 105});
        let d = p.evaluate(&input("stop_vm", Tier::Red, &args, false, "stop vm 105"));
        assert!(!d.allowed);
        assert!(d.requires_confirmation);
    }

    #[test]
    fn red_allowed_once_confirmed() {
        let p = policy();
        let args = json!({"node": "pve2", "vmid": 105});
        let d = p.evaluate(&input("stop_vm", Tier::Red, &args, true, "stop vm 105"));
        assert!(d.allowed);
    }

    #[test]
    fn orange_requires_confirmed_and_keyword() {
        let p = policy();
        let args = json!({"node": "pve2"});
        let denied = p.evaluate(&input("reboot_node", Tier::Orange, &args, true, "reboot pve2"));
        assert!(!denied.allowed);
        assert!(!denied.requires_confirmation);

        let allowed = p.evaluate(&input(
            "reboot_node",
            Tier::Orange,
            &args,
            true,
            "reboot pve2, confirmed",
        ));
        assert!(allowed.allowed);
    }

    #[test]
    fn override_key_unlocks_red_and_orange_but_not_black() {
        let p = policy();
        let args = json!({"node": "pve2"});
        let turn = "reboot pve2 jarvis-unlock";

        let red = p.evaluate(&input("reboot_node", Tier::Red, &args, false, turn));
        assert!(red.allowed);

        let orange = p.evaluate(&input("reboot_node", Tier::Orange, &args, false, turn));
        assert!(orange.allowed);

        let black = p.evaluate(&input("wipe_node", Tier::Black, &args, false, turn));
        assert!(!black.allowed, "override key must never unlock BLACK");
    }

    #[test]
    fn protected_node_denied_regardless_of_tier() {
        let p = policy();
        let args = json!({"node": "pve"});
        let d = p.evaluate(&input("get_node_status", Tier::Green, &args, false, "status"));
        assert!(!d.allowed);
        assert!(d.reason.unwrap().contains("pve"));
    }

    #[test]
    fn protected_vmid_denied() {
        let p = policy();
        let args = json!({"node": "pve2", "vmid": 103});
        let d = p.evaluate(&input("stop_vm", Tier::Red, &args, true, "stop vm 103"));
        assert!(!d.allowed);
        assert!(d.reason.unwrap().contains("103"));
    }

    #[test]
    fn protected_service_denied() {
        let p = policy();
        let args = json!({"service": "pve-cluster"});
        let d = p.evaluate(&input("restart_service", Tier::Red, &args, true, "restart it"));
        assert!(!d.allowed);
    }

    #[test]
    fn protected_ip_denied() {
        let p = policy();
        let args = json!({"target_ip": "10.0.0.1"});
        let d = p.evaluate(&input("ping", Tier::Green, &args, false, "ping it"));
        assert!(!d.allowed);
    }

    #[test]
    fn null_byte_denied() {
        let p = policy();
        let args = json!({"note": "abc\0def"});
        let d = p.evaluate(&input("get_cluster_status", Tier::Green, &args, false, "x"));
        assert!(!d.allowed);
    }

    #[test]
    fn oversized_argument_denied() {
        let p = policy();
        let big = "x".repeat(MAX_ARG_STRING_LEN + 1);
        let args = json!({"note": big});
        let d = p.evaluate(&input("get_cluster_status", Tier::Green, &args, false, "x"));
        assert!(!d.allowed);
    }

    #[test]
    fn shell_metacharacter_in_command_denied() {
        let p = policy();
        let args = json!({"command": "ls; rm -rf /"});
        let d = p.evaluate(&input("shell", Tier::Yellow, &args, false, "list files"));
        assert!(!d.allowed);
    }

    #[test]
    fn blocked_executable_denied() {
        let p = policy();
        let args = json!({"command": "sudo reboot"});
        let d = p.evaluate(&input("shell", Tier::Yellow, &args, false, "do it"));
        assert!(!d.allowed);
    }

    #[test]
    fn allowlist_rejects_unlisted_command() {
        let mut p = policy();
        p.command_allowlist = vec!["uptime".to_owned()];
        let args = json!({"command": "uptime"});
        let allowed = p.evaluate(&input("shell", Tier::Yellow, &args, false, "uptime"));
        assert!(allowed.allowed);

        let args2 = json!({"command": "whoami"});
        let denied = p.evaluate(&input("shell", Tier::Yellow, &args2, false, "whoami"));
        assert!(!denied.allowed);
    }

    #[test]
    fn rate_limit_enforced() {
        let p = SecurityPolicy::new(
            ProtectedResources::default(),
            vec![],
            vec![],
            String::new(),
            "confirmed".to_owned(),
            2,
            600,
        );
        let args = json!({});
        assert!(p.evaluate(&input("get_cluster_status", Tier::Green, &args, false, "x")).allowed);
        assert!(p.evaluate(&input("get_cluster_status", Tier::Green, &args, false, "x")).allowed);
        assert!(!p.evaluate(&input("get_cluster_status", Tier::Green, &args, false, "x")).allowed);
    }

    #[test]
    fn rate_limiter_count_tracks() {
        let p = policy();
        p.per_minute.try_record();
        p.per_minute.try_record();
        assert_eq!(p.per_minute.count(), 2);
    }
}
