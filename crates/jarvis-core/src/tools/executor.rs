//! Single execution entry point for the tool pipeline.
//!
//! `ToolExecutor::execute` is the only way any caller — the agentic loop,
//! the `/api/tools/execute` handler, or the voice path — invokes a tool.
//! Handlers never log or persist themselves; this is where the safety gate,
//! the deadline, and the audit-event persistence all live, so behavior
//! cannot drift between call sites.

use std::{sync::Arc, time::Instant};

use serde_json::Value;
use uuid::Uuid;

use crate::{
    error::{JarvisError, JarvisResult},
    event_bus::{AppEvent, EventBus},
    persistence::Persistence,
    security::{CheckInput, SecurityPolicy, Tier, ToolSource},
    tools::{registry::ToolRegistry, traits::ToolResult},
};

/// Everything needed to evaluate and run one tool call.
pub struct ExecuteRequest<'a> {
    pub name: &'a str,
    pub args: Value,
    pub source: ToolSource,
    /// Explicit operator confirmation; never sourced from LLM output.
    pub confirmed: bool,
    /// The user turn that produced this invocation — used for the
    /// override-key and approval-keyword checks.
    pub user_turn: &'a str,
    pub deadline_secs: u64,
}

pub struct ToolExecutor {
    registry: Arc<ToolRegistry>,
    policy: Arc<SecurityPolicy>,
    persistence: Arc<dyn Persistence>,
    bus: Arc<dyn EventBus>,
}

impl ToolExecutor {
    pub fn new(
        registry: Arc<ToolRegistry>,
        policy: Arc<SecurityPolicy>,
        persistence: Arc<dyn Persistence>,
        bus: Arc<dyn EventBus>,
    ) -> Self {
        Self {
            registry,
            policy,
            persistence,
            bus,
        }
    }

    /// `execute(name, args, source) → ToolResult`.
    ///
    /// Contract: (1) look up tier, unknown name defaults to BLACK; (2-3)
    /// sanitize and run the safety check, denying without invoking the
    /// handler; (4) wrap the handler in a deadline; (5) persist an audit
    /// event either way; (6) return the result.
    pub async fn execute(&self, req: ExecuteRequest<'_>) -> JarvisResult<ToolResult> {
        let tool = self.registry.get(req.name);
        let tier = tool.as_ref().map(|t| t.tier()).unwrap_or(Tier::Black);

        let decision = self.policy.evaluate(&CheckInput {
            tool_name: req.name,
            tier,
            args: &req.args,
            confirmed: req.confirmed,
            user_turn: req.user_turn,
            source: req.source,
        });

        if !decision.allowed {
            let reason = decision
                .reason
                .clone()
                .unwrap_or_else(|| "confirmation required".to_owned());

            self.persist_blocked(req.name, tier, &reason).await;

            if decision.requires_confirmation {
                return Err(JarvisError::Conflict(reason));
            }
            return Err(JarvisError::SafetyDenied { reason });
        }

        let Some(tool) = tool else {
            // Tier lookup above already defaulted unknown tools to BLACK,
            // so evaluate() would have denied them before this point.
            return Err(JarvisError::NotFound(format!("unknown tool '{}'", req.name)));
        };

        let started = Instant::now();
        let outcome = tokio::time::timeout(
            std::time::Duration::from_secs(req.deadline_secs),
            tool.execute(req.args),
        )
        .await;

        let (result, ok) = match outcome {
            Ok(Ok(result)) => {
                let ok = result.success;
                (result, ok)
            }
            Ok(Err(detail)) => (ToolResult::err(detail), false),
            Err(_) => {
                let secs = req.deadline_secs;
                return Err(self
                    .persist_timeout(req.name, tier, started.elapsed().as_millis() as u64, secs)
                    .await);
            }
        };

        self.persist_executed(req.name, tier, ok, started.elapsed().as_millis() as u64)
            .await;

        Ok(result)
    }

    async fn persist_blocked(&self, tool_name: &str, tier: Tier, reason: &str) {
        let payload = serde_json::json!({
            "tool_name": tool_name,
            "tier": tier,
            "reason": reason,
        });
        let _ = self.persistence.save_event("action_blocked", payload).await;
        let _ = self.bus.publish(AppEvent::SafetyDenied {
            tool_name: tool_name.to_owned(),
            reason: reason.to_owned(),
        });
    }

    async fn persist_executed(&self, tool_name: &str, tier: Tier, ok: bool, duration_ms: u64) {
        let id = Uuid::new_v4().to_string();
        let payload = serde_json::json!({
            "id": id,
            "tool_name": tool_name,
            "tier": tier,
            "ok": ok,
            "duration_ms": duration_ms,
        });
        let _ = self
            .persistence
            .save_event("action_executed", payload)
            .await;
        let _ = self.bus.publish(AppEvent::ToolInvocation {
            id,
            tool_name: tool_name.to_owned(),
            tier: format!("{tier:?}"),
            decision: "executed".to_owned(),
            ok,
            duration_ms,
        });
    }

    async fn persist_timeout(
        &self,
        tool_name: &str,
        tier: Tier,
        duration_ms: u64,
        secs: u64,
    ) -> JarvisError {
        let payload = serde_json::json!({
            "tool_name": tool_name,
            "tier": tier,
            "ok": false,
            "duration_ms": duration_ms,
        });
        let _ = self
            .persistence
            .save_event("action_executed", payload)
            .await;
        JarvisError::Timeout {
            what: tool_name.to_owned(),
            secs,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ProtectedResources;
    use crate::event_bus::TokioBroadcastBus;
    use crate::persistence::sqlite::SqlitePersistence;
    use crate::tools::traits::Tool;
    use async_trait::async_trait;
    use serde_json::json;

    struct EchoTool;

    #[async_trait]
    impl Tool for EchoTool {
        fn name(&self) -> &str {
            "echo"
        }
        fn description(&self) -> &str {
            "echoes its input"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn tier(&self) -> Tier {
            Tier::Green
        }
        async fn execute(&self, args: Value) -> Result<ToolResult, String> {
            Ok(ToolResult::ok(args.to_string()))
        }
    }

    struct HangingTool;

    #[async_trait]
    impl Tool for HangingTool {
        fn name(&self) -> &str {
            "hang"
        }
        fn description(&self) -> &str {
            "never returns"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn tier(&self) -> Tier {
            Tier::Green
        }
        async fn execute(&self, _args: Value) -> Result<ToolResult, String> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    struct RedTool;

    #[async_trait]
    impl Tool for RedTool {
        fn name(&self) -> &str {
            "stop_vm"
        }
        fn description(&self) -> &str {
            "stops a vm"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn tier(&self) -> Tier {
            Tier::Red
        }
        async fn execute(&self, _args: Value) -> Result<ToolResult, String> {
            Ok(ToolResult::ok("stopped"))
        }
    }

    fn make_executor(tool: Arc<dyn Tool>) -> ToolExecutor {
        let mut registry = ToolRegistry::new();
        registry.register(tool);
        let policy = SecurityPolicy::new(
            ProtectedResources::default(),
            vec![],
            vec![],
            String::new(),
            "confirmed".to_owned(),
            600,
            6000,
        );
        ToolExecutor::new(
            Arc::new(registry),
            Arc::new(policy),
            Arc::new(SqlitePersistence::in_memory().unwrap()),
            Arc::new(TokioBroadcastBus::new()),
        )
    }

    #[tokio::test]
    async fn green_tool_executes_and_returns_result() {
        let exec = make_executor(Arc::new(EchoTool));
        let result = exec
            .execute(ExecuteRequest {
                name: "echo",
                args: json!({"a": 1}),
                source: ToolSource::Llm,
                confirmed: false,
                user_turn: "echo this",
                deadline_secs: 5,
            })
            .await
            .unwrap();
        assert!(result.success);
    }

    #[tokio::test]
    async fn unknown_tool_is_safety_denied() {
        let exec = make_executor(Arc::new(EchoTool));
        let err = exec
            .execute(ExecuteRequest {
                name: "nonexistent",
                args: json!({}),
                source: ToolSource::Llm,
                confirmed: true,
                user_turn: "do it",
                deadline_secs: 5,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "SafetyDenied");
    }

    #[tokio::test]
    async fn red_tool_without_confirmation_returns_conflict() {
        let exec = make_executor(Arc::new(RedTool));
        let err = exec
            .execute(ExecuteRequest {
                name: "stop_vm",
                args: json!({"vmid": 105}),
                source: ToolSource::Llm,
                confirmed: false,
                user_turn: "stop vm 105",
                deadline_secs: 5,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Conflict");
    }

    #[tokio::test]
    async fn deadline_trips_on_hanging_handler() {
        let exec = make_executor(Arc::new(HangingTool));
        let err = exec
            .execute(ExecuteRequest {
                name: "hang",
                args: json!({}),
                source: ToolSource::Llm,
                confirmed: false,
                user_turn: "hang",
                deadline_secs: 0,
            })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Timeout");
    }
}
