//! LLM provider abstraction: a uniform streaming interface over both
//! provider kinds — an agentic provider (supports tool calls) and a
//! conversational provider (tool-less, short system prompt,
//! brevity-first).
//!
//! A provider streams raw tokens and tool-call blocks into a
//! [`ProviderSink`] it is handed, rather than returning an owned stream the
//! caller must poll. The richer seven-callback contract (`onToolResult`,
//! `onConfirmationNeeded`, `onBlocked`) belongs to the agentic loop, which
//! sits between a provider and its eventual caller and adds the safety
//! pipeline those callbacks require.

use std::sync::{atomic::AtomicBool, Arc};

use async_trait::async_trait;

use crate::error::{JarvisError, JarvisResult};

use super::types::{ChatRequest, TokenUsage, ToolCall};

/// Cooperative cancellation: checked between provider reads and before
/// dispatching each tool call. A single flag rather than a channel, since
/// that's all any reader needs to observe.
pub type CancelFlag = Arc<AtomicBool>;

pub fn is_cancelled(flag: &CancelFlag) -> bool {
    flag.load(std::sync::atomic::Ordering::Relaxed)
}

/// What a provider's own output stream can report — strictly what the
/// model itself produced, before any safety check runs. The agentic loop
/// is the one `ProviderSink` implementation in this codebase; it receives
/// these callbacks and decides what to do next.
#[async_trait]
pub trait ProviderSink: Send + Sync {
    async fn on_text_delta(&self, text: &str);
    async fn on_tool_call(&self, call: ToolCall);
    async fn on_done(&self, usage: TokenUsage);
    async fn on_error(&self, err: &JarvisError);
}

#[async_trait]
pub trait LLMProvider: Send + Sync {
    /// Stream one turn. Returns once the model's output stream ends or is
    /// cancelled — it never waits on tool execution or confirmation; that
    /// orchestration lives entirely in the agentic loop.
    async fn chat(
        &self,
        request: ChatRequest,
        sink: Arc<dyn ProviderSink>,
        cancel: CancelFlag,
    ) -> JarvisResult<()>;

    /// Maximum input context this provider accepts, in tokens.
    fn context_limit(&self) -> usize;

    /// Whether this provider kind accepts tool definitions at all —
    /// `false` for conversational providers.
    fn supports_tools(&self) -> bool;

    fn provider_name(&self) -> &str;

    /// Optional startup probe; default no-op since not every provider
    /// needs one.
    async fn warmup(&self) -> JarvisResult<()> {
        Ok(())
    }
}
