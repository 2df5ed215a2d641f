//! Agentic loop: the core reasoning loop for tool-capable turns.
//!
//! ```text
//! build request (system + history [+ tools unless final iteration])
//!       │
//!       ▼
//! provider.chat()  ──► no tool calls? ──► onDone, return
//!       │
//!       ▼ tool calls present (collected via an internal ProviderSink adapter)
//! for each call, in order:
//!   tier = registry.get(name).tier (unknown ⇒ Black)
//!   BLACK        → onBlocked, append error tool_result, continue
//!   RED/ORANGE    → package PendingConfirmation, onConfirmationNeeded, RETURN
//!   otherwise     → execute via the tool executor, onToolUse + onToolResult, append tool_result
//!       │
//!       ▼
//! iteration += 1; iteration == K-1 ⇒ withhold tools on the next call
//! ```
//!
//! The exit on a RED/ORANGE call does not block waiting for the operator:
//! it returns a [`PendingConfirmation`] continuation that the caller (the
//! chat channel) stores against a `tool_use_id` and later resolves through
//! [`AgentLoop::resume_after_confirmation`]. Blocking the task on a 30 s
//! event-bus wait instead would not scale to a multiplexer juggling many
//! concurrent chat sockets, so `resumeAfterConfirmation` is explicitly
//! continuation-based rather than a blocking wait.

use std::sync::{atomic::AtomicUsize, Arc};

use async_trait::async_trait;
use tokio::sync::Mutex as AsyncMutex;

use crate::{
    ai::{
        is_cancelled, CancelFlag, ChatRequest, LLMProvider, Message, ProviderSink, TokenUsage,
        ToolCall, ToolDefinition,
    },
    error::{JarvisError, JarvisResult},
    security::Tier,
    tools::{ExecuteRequest, ToolExecutor, ToolRegistry},
};

#[async_trait]
pub trait StreamSink: Send + Sync {
    async fn on_text_delta(&self, text: &str);
    async fn on_tool_use(&self, name: &str, args: &serde_json::Value, id: &str, tier: Tier);
    async fn on_tool_result(&self, id: &str, result: &str, is_error: bool);
    async fn on_confirmation_needed(&self, name: &str, args: &serde_json::Value, id: &str, tier: Tier);
    async fn on_blocked(&self, name: &str, reason: &str, tier: Tier);
    async fn on_done(&self, usage: TokenUsage);
    async fn on_error(&self, err: &JarvisError);
}

/// State frozen at the moment a RED/ORANGE tool call needs operator
/// confirmation. Stored by the caller, keyed by `pending_call.id`, and fed
/// back into [`AgentLoop::resume_after_confirmation`].
#[derive(Clone)]
pub struct PendingConfirmation {
    pub messages: Vec<Message>,
    pub pending_call: ToolCall,
    pub tier: Tier,
    pub provider_name: String,
    pub iteration: usize,
    pub user_turn: String,
}

#[derive(Debug, Clone)]
pub struct AgentLoopConfig {
    pub model: String,
    pub system_prompt: String,
    pub temperature: f32,
    pub max_tokens: u32,
    pub max_iterations: usize,
    pub tool_deadline_secs: u64,
}

impl Default for AgentLoopConfig {
    fn default() -> Self {
        Self {
            model: String::new(),
            system_prompt: String::new(),
            temperature: 0.7,
            max_tokens: 2048,
            max_iterations: 10,
            tool_deadline_secs: 30,
        }
    }
}

pub struct AgentLoop {
    provider: Arc<dyn LLMProvider>,
    registry: Arc<ToolRegistry>,
    executor: Arc<ToolExecutor>,
    config: AgentLoopConfig,
}

impl AgentLoop {
    pub fn new(
        provider: Arc<dyn LLMProvider>,
        registry: Arc<ToolRegistry>,
        executor: Arc<ToolExecutor>,
        config: AgentLoopConfig,
    ) -> Self {
        Self {
            provider,
            registry,
            executor,
            config,
        }
    }

    /// Start a fresh turn. `messages` is the already-built context (the
    /// context manager's output), not yet including the system prompt.
    pub async fn run(
        &self,
        messages: Vec<Message>,
        user_turn: String,
        sink: Arc<dyn StreamSink>,
        cancel: CancelFlag,
    ) -> JarvisResult<Option<PendingConfirmation>> {
        self.run_loop(messages, 0, user_turn, sink, cancel).await
    }

    /// Reconstitute state after an operator's confirm/deny decision and
    /// re-enter the loop with a synthetic tool_result reflecting it. The
    /// originating user turn travels with the pending confirmation so a
    /// security policy evaluated on resume still sees the text that
    /// justified the call.
    pub async fn resume_after_confirmation(
        &self,
        pending: PendingConfirmation,
        confirmed: bool,
        sink: Arc<dyn StreamSink>,
        cancel: CancelFlag,
    ) -> JarvisResult<Option<PendingConfirmation>> {
        let call = pending.pending_call;
        let mut messages = pending.messages;
        let user_turn = pending.user_turn;

        if confirmed {
            let outcome = self
                .executor
                .execute(ExecuteRequest {
                    name: &call.name,
                    args: call.args.clone(),
                    source: crate::security::ToolSource::Llm,
                    confirmed: true,
                    user_turn: &user_turn,
                    deadline_secs: self.config.tool_deadline_secs,
                })
                .await;

            let (output, is_error) = match outcome {
                Ok(result) => (result.output, !result.success),
                Err(err) => (err.to_string(), true),
            };
            sink.on_tool_result(&call.id, &output, is_error).await;
            messages.push(Message::tool_result(&call.id, output));
        } else {
            let msg = "Declined by operator.";
            sink.on_tool_result(&call.id, msg, true).await;
            messages.push(Message::tool_result(&call.id, msg));
        }

        self.run_loop(messages, pending.iteration + 1, user_turn, sink, cancel)
            .await
    }

    async fn run_loop(
        &self,
        mut messages: Vec<Message>,
        mut iteration: usize,
        user_turn: String,
        sink: Arc<dyn StreamSink>,
        cancel: CancelFlag,
    ) -> JarvisResult<Option<PendingConfirmation>> {
        loop {
            if is_cancelled(&cancel) {
                sink.on_done(TokenUsage::default()).await;
                return Ok(None);
            }

            let withhold_tools = iteration + 1 >= self.config.max_iterations;
            let tools = if withhold_tools {
                Vec::new()
            } else {
                self.tool_definitions()
            };

            let request = ChatRequest {
                model: self.config.model.clone(),
                system_prompt: self.config.system_prompt.clone(),
                messages: messages.clone(),
                tools,
                temperature: self.config.temperature,
                max_tokens: self.config.max_tokens,
            };

            let adapter = Arc::new(CollectingSink::default());
            let outcome = self
                .provider
                .chat(request, adapter.clone() as Arc<dyn ProviderSink>, cancel.clone())
                .await;

            let text = adapter.text.lock().await.clone();
            if !text.is_empty() {
                sink.on_text_delta(&text).await;
            }
            let tool_calls = adapter.tool_calls.lock().await.clone();
            let usage = adapter.usage.lock().await.clone();

            if let Err(err) = outcome {
                if !text.is_empty() {
                    messages.push(Message::assistant(text));
                }
                sink.on_error(&err).await;
                return Err(err);
            }

            messages.push(Message::assistant(text));

            if is_cancelled(&cancel) {
                sink.on_done(usage).await;
                return Ok(None);
            }

            if tool_calls.is_empty() || withhold_tools {
                sink.on_done(usage).await;
                return Ok(None);
            }

            for call in tool_calls {
                let tier = self
                    .registry
                    .get(&call.name)
                    .map(|t| t.tier())
                    .unwrap_or(Tier::Black);

                if tier == Tier::Black {
                    let reason = format!("'{}' is not permitted", call.name);
                    sink.on_blocked(&call.name, &reason, tier).await;
                    messages.push(Message::tool_result(&call.id, format!("BLOCKED: {reason}")));
                    continue;
                }

                if tier.requires_confirmation() {
                    sink.on_confirmation_needed(&call.name, &call.args, &call.id, tier)
                        .await;
                    return Ok(Some(PendingConfirmation {
                        messages,
                        pending_call: call,
                        tier,
                        provider_name: self.provider.provider_name().to_owned(),
                        iteration,
                        user_turn: user_turn.clone(),
                    }));
                }

                sink.on_tool_use(&call.name, &call.args, &call.id, tier).await;
                let outcome = self
                    .executor
                    .execute(ExecuteRequest {
                        name: &call.name,
                        args: call.args.clone(),
                        source: crate::security::ToolSource::Llm,
                        confirmed: false,
                        user_turn: &user_turn,
                        deadline_secs: self.config.tool_deadline_secs,
                    })
                    .await;

                let (output, is_error) = match outcome {
                    Ok(result) => (result.output, !result.success),
                    Err(err) => (err.to_string(), true),
                };
                sink.on_tool_result(&call.id, &output, is_error).await;
                messages.push(Message::tool_result(&call.id, output));
            }

            iteration += 1;
        }
    }

    pub fn provider(&self) -> Arc<dyn LLMProvider> {
        self.provider.clone()
    }

    pub fn model(&self) -> &str {
        &self.config.model
    }

    fn tool_definitions(&self) -> Vec<ToolDefinition> {
        self.registry
            .list()
            .into_iter()
            .map(|info| ToolDefinition {
                name: info.name,
                description: info.description,
                schema: info.schema,
            })
            .collect()
    }
}

/// Bridges a raw provider stream into the fields a loop iteration needs:
/// accumulated text, the tool calls the model requested, and final usage.
#[derive(Default)]
struct CollectingSink {
    text: AsyncMutex<String>,
    tool_calls: AsyncMutex<Vec<ToolCall>>,
    usage: AsyncMutex<TokenUsage>,
    error_count: AtomicUsize,
}

#[async_trait]
impl ProviderSink for CollectingSink {
    async fn on_text_delta(&self, text: &str) {
        self.text.lock().await.push_str(text);
    }

    async fn on_tool_call(&self, call: ToolCall) {
        self.tool_calls.lock().await.push(call);
    }

    async fn on_done(&self, usage: TokenUsage) {
        *self.usage.lock().await = usage;
    }

    async fn on_error(&self, _err: &JarvisError) {
        self.error_count.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ProtectedResources;
    use crate::event_bus::TokioBroadcastBus;
    use crate::persistence::SqlitePersistence;
    use crate::security::SecurityPolicy;
    use crate::tools::{Tool, ToolResult};
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicBool, AtomicUsize as StdAtomicUsize, Ordering};

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

    struct StopVmTool;

    #[async_trait]
    impl Tool for StopVmTool {
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

    struct RebootNodeTool;

    #[async_trait]
    impl Tool for RebootNodeTool {
        fn name(&self) -> &str {
            "reboot_node"
        }
        fn description(&self) -> &str {
            "reboots a proxmox node"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn tier(&self) -> Tier {
            Tier::Orange
        }
        async fn execute(&self, _args: Value) -> Result<ToolResult, String> {
            Ok(ToolResult::ok("rebooting"))
        }
    }

    /// Scripted provider: returns one canned "turn" per call, cycling
    /// through a fixed list of (text, tool_calls) pairs.
    struct ScriptedProvider {
        turns: Vec<(String, Vec<ToolCall>)>,
        index: StdAtomicUsize,
    }

    #[async_trait]
    impl LLMProvider for ScriptedProvider {
        async fn chat(
            &self,
            _request: ChatRequest,
            sink: Arc<dyn ProviderSink>,
            _cancel: CancelFlag,
        ) -> JarvisResult<()> {
            let i = self.index.fetch_add(1, Ordering::SeqCst);
            let (text, calls) = self
                .turns
                .get(i)
                .cloned()
                .unwrap_or_else(|| ("no more turns".to_owned(), vec![]));
            if !text.is_empty() {
                sink.on_text_delta(&text).await;
            }
            for call in calls {
                sink.on_tool_call(call).await;
            }
            sink.on_done(TokenUsage::default()).await;
            Ok(())
        }
        fn context_limit(&self) -> usize {
            128_000
        }
        fn supports_tools(&self) -> bool {
            true
        }
        fn provider_name(&self) -> &str {
            "scripted"
        }
    }

    #[derive(Default)]
    struct RecordingSink {
        texts: AsyncMutex<Vec<String>>,
        confirmations: AsyncMutex<Vec<String>>,
        blocked: AsyncMutex<Vec<String>>,
        tool_results: AsyncMutex<Vec<(String, bool)>>,
        done: AsyncMutex<bool>,
    }

    #[async_trait]
    impl StreamSink for RecordingSink {
        async fn on_text_delta(&self, text: &str) {
            self.texts.lock().await.push(text.to_owned());
        }
        async fn on_tool_use(&self, _name: &str, _args: &Value, _id: &str, _tier: Tier) {}
        async fn on_tool_result(&self, id: &str, result: &str, is_error: bool) {
            self.tool_results.lock().await.push((result.to_owned(), is_error));
            let _ = id;
        }
        async fn on_confirmation_needed(&self, name: &str, _args: &Value, _id: &str, _tier: Tier) {
            self.confirmations.lock().await.push(name.to_owned());
        }
        async fn on_blocked(&self, name: &str, _reason: &str, _tier: Tier) {
            self.blocked.lock().await.push(name.to_owned());
        }
        async fn on_done(&self, _usage: TokenUsage) {
            *self.done.lock().await = true;
        }
        async fn on_error(&self, _err: &JarvisError) {}
    }

    fn make_executor() -> Arc<ToolExecutor> {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(StopVmTool));
        registry.register(Arc::new(RebootNodeTool));
        let policy = SecurityPolicy::new(
            ProtectedResources::default(),
            vec![],
            vec![],
            String::new(),
            "confirmed".to_owned(),
            600,
            6000,
        );
        Arc::new(ToolExecutor::new(
            Arc::new(registry),
            Arc::new(policy),
            Arc::new(SqlitePersistence::in_memory().unwrap()),
            Arc::new(TokioBroadcastBus::new()),
        ))
    }

    fn make_registry() -> Arc<ToolRegistry> {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(EchoTool));
        registry.register(Arc::new(StopVmTool));
        registry.register(Arc::new(RebootNodeTool));
        Arc::new(registry)
    }

    #[tokio::test]
    async fn no_tool_calls_completes_immediately() {
        let provider: Arc<dyn LLMProvider> = Arc::new(ScriptedProvider {
            turns: vec![("all clear".to_owned(), vec![])],
            index: StdAtomicUsize::new(0),
        });
        let loop_ = AgentLoop::new(provider, make_registry(), make_executor(), AgentLoopConfig::default());
        let sink = Arc::new(RecordingSink::default());
        let pending = loop_
            .run(vec![], "go ahead".to_owned(), sink.clone(), Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        assert!(pending.is_none());
        assert!(*sink.done.lock().await);
        assert_eq!(sink.texts.lock().await.as_slice(), ["all clear"]);
    }

    #[tokio::test]
    async fn green_tool_executes_without_pausing() {
        let provider: Arc<dyn LLMProvider> = Arc::new(ScriptedProvider {
            turns: vec![
                (
                    String::new(),
                    vec![ToolCall {
                        id: "call-1".to_owned(),
                        name: "echo".to_owned(),
                        args: json!({"message": "hi"}),
                    }],
                ),
                ("echoed successfully".to_owned(), vec![]),
            ],
            index: StdAtomicUsize::new(0),
        });
        let loop_ = AgentLoop::new(provider, make_registry(), make_executor(), AgentLoopConfig::default());
        let sink = Arc::new(RecordingSink::default());
        let pending = loop_
            .run(vec![], "go ahead".to_owned(), sink.clone(), Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        assert!(pending.is_none());
        assert!(sink.confirmations.lock().await.is_empty());
        assert_eq!(sink.tool_results.lock().await.len(), 1);
    }

    #[tokio::test]
    async fn red_tool_pauses_for_confirmation() {
        let provider: Arc<dyn LLMProvider> = Arc::new(ScriptedProvider {
            turns: vec![(
                String::new(),
                vec![ToolCall {
                    id: "call-1".to_owned(),
                    name: "stop_vm".to_owned(),
                    args: json!({"vmid": 105}),
                }],
            )],
            index: StdAtomicUsize::new(0),
        });
        let loop_ = AgentLoop::new(provider, make_registry(), make_executor(), AgentLoopConfig::default());
        let sink = Arc::new(RecordingSink::default());
        let pending = loop_
            .run(vec![], "go ahead".to_owned(), sink.clone(), Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        let pending = pending.expect("red tool must pause for confirmation");
        assert_eq!(pending.pending_call.name, "stop_vm");
        assert_eq!(pending.user_turn, "go ahead");
        assert_eq!(sink.confirmations.lock().await.as_slice(), ["stop_vm"]);
        assert!(!*sink.done.lock().await);
    }

    #[tokio::test]
    async fn resume_after_confirmation_executes_and_continues() {
        let provider: Arc<dyn LLMProvider> = Arc::new(ScriptedProvider {
            turns: vec![
                (
                    String::new(),
                    vec![ToolCall {
                        id: "call-1".to_owned(),
                        name: "stop_vm".to_owned(),
                        args: json!({"vmid": 105}),
                    }],
                ),
                ("vm stopped as requested".to_owned(), vec![]),
            ],
            index: StdAtomicUsize::new(0),
        });
        let loop_ = AgentLoop::new(provider, make_registry(), make_executor(), AgentLoopConfig::default());
        let sink = Arc::new(RecordingSink::default());
        let pending = loop_
            .run(vec![], "go ahead".to_owned(), sink.clone(), Arc::new(AtomicBool::new(false)))
            .await
            .unwrap()
            .expect("pauses for confirmation");

        let result = loop_
            .resume_after_confirmation(pending, true, sink.clone(), Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        assert!(result.is_none());
        assert!(*sink.done.lock().await);
        assert_eq!(sink.tool_results.lock().await[0].1, false);
    }

    #[tokio::test]
    async fn orange_tool_resume_denied_without_approval_keyword_in_user_turn() {
        let provider: Arc<dyn LLMProvider> = Arc::new(ScriptedProvider {
            turns: vec![(
                String::new(),
                vec![ToolCall {
                    id: "call-1".to_owned(),
                    name: "reboot_node".to_owned(),
                    args: json!({"node": "pve1"}),
                }],
            )],
            index: StdAtomicUsize::new(0),
        });
        let loop_ = AgentLoop::new(provider, make_registry(), make_executor(), AgentLoopConfig::default());
        let sink = Arc::new(RecordingSink::default());
        let pending = loop_
            .run(vec![], "please reboot pve1".to_owned(), sink.clone(), Arc::new(AtomicBool::new(false)))
            .await
            .unwrap()
            .expect("orange tool pauses for confirmation");

        let result = loop_
            .resume_after_confirmation(pending, true, sink.clone(), Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(sink.tool_results.lock().await[0].1, true);
    }

    #[tokio::test]
    async fn orange_tool_resume_allowed_when_user_turn_carries_approval_keyword() {
        let provider: Arc<dyn LLMProvider> = Arc::new(ScriptedProvider {
            turns: vec![(
                String::new(),
                vec![ToolCall {
                    id: "call-1".to_owned(),
                    name: "reboot_node".to_owned(),
                    args: json!({"node": "pve1"}),
                }],
            )],
            index: StdAtomicUsize::new(0),
        });
        let loop_ = AgentLoop::new(provider, make_registry(), make_executor(), AgentLoopConfig::default());
        let sink = Arc::new(RecordingSink::default());
        let pending = loop_
            .run(
                vec![],
                "yes, confirmed, reboot pve1".to_owned(),
                sink.clone(),
                Arc::new(AtomicBool::new(false)),
            )
            .await
            .unwrap()
            .expect("orange tool pauses for confirmation");

        let result = loop_
            .resume_after_confirmation(pending, true, sink.clone(), Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        assert!(result.is_none());
        assert_eq!(sink.tool_results.lock().await[0].1, false);
    }

    #[tokio::test]
    async fn black_tool_is_blocked_not_paused() {
        let provider: Arc<dyn LLMProvider> = Arc::new(ScriptedProvider {
            turns: vec![
                (
                    String::new(),
                    vec![ToolCall {
                        id: "call-1".to_owned(),
                        name: "format_disk".to_owned(),
                        args: json!({}),
                    }],
                ),
                ("I can't do that.".to_owned(), vec![]),
            ],
            index: StdAtomicUsize::new(0),
        });
        let loop_ = AgentLoop::new(provider, make_registry(), make_executor(), AgentLoopConfig::default());
        let sink = Arc::new(RecordingSink::default());
        let pending = loop_
            .run(vec![], "go ahead".to_owned(), sink.clone(), Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        assert!(pending.is_none());
        assert_eq!(sink.blocked.lock().await.as_slice(), ["format_disk"]);
    }

    #[tokio::test]
    async fn max_iterations_withholds_tools_on_final_call() {
        let turns: Vec<(String, Vec<ToolCall>)> = (0..5)
            .map(|i| {
                (
                    String::new(),
                    vec![ToolCall {
                        id: format!("call-{i}"),
                        name: "echo".to_owned(),
                        args: json!({"message": "loop"}),
                    }],
                )
            })
            .collect();
        let provider: Arc<dyn LLMProvider> = Arc::new(ScriptedProvider {
            turns,
            index: StdAtomicUsize::new(0),
        });
        let config = AgentLoopConfig {
            max_iterations: 3,
            ..Default::default()
        };
        let loop_ = AgentLoop::new(provider, make_registry(), make_executor(), config);
        let sink = Arc::new(RecordingSink::default());
        let pending = loop_
            .run(vec![], "go ahead".to_owned(), sink.clone(), Arc::new(AtomicBool::new(false)))
            .await
            .unwrap();
        assert!(pending.is_none());
        assert!(*sink.done.lock().await);
    }
}
