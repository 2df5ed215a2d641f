//! Context manager: a per-session sliding window of recent turns,
//! budgeted against a token target, with non-blocking background
//! summarization of the oldest half once a session grows past a threshold.
//!
//! Token counting uses a `len / 4` heuristic rather than a real
//! tokenizer — exact token accounting is a provider-caller concern for
//! cost, not a hard constraint here.

use std::sync::Arc;

use tokio::sync::Mutex;

use crate::ai::{ChatRequest, LLMProvider, Message, MessageRole};

const CHARS_PER_TOKEN: usize = 4;

pub fn estimate_tokens(text: &str) -> u32 {
    ((text.chars().count() + CHARS_PER_TOKEN - 1) / CHARS_PER_TOKEN).max(1) as u32
}

fn estimate_message_tokens(message: &Message) -> u32 {
    estimate_tokens(&message.content) + 4
}

/// Per-session sliding window plus background summarization state.
pub struct ContextManager {
    window_turns: usize,
    token_budget: u32,
    summarize_threshold: u32,
    history: Mutex<Vec<Message>>,
    summary: Mutex<Option<String>>,
}

impl ContextManager {
    pub fn new(window_turns: usize, token_budget: u32, summarize_threshold: u32) -> Self {
        Self {
            window_turns,
            token_budget,
            summarize_threshold,
            history: Mutex::new(Vec::new()),
            summary: Mutex::new(None),
        }
    }

    pub async fn push(&self, message: Message) {
        self.history.lock().await.push(message);
    }

    /// Build the messages to send for the next turn: an optional synthetic
    /// summary message, followed by the most recent `window_turns` messages,
    /// trimmed further to fit `token_budget` minus `system_and_memory_tokens`.
    pub async fn build_context(&self, system_and_memory_tokens: u32) -> Vec<Message> {
        let history = self.history.lock().await;
        let recent: Vec<Message> = history
            .iter()
            .rev()
            .take(self.window_turns)
            .rev()
            .cloned()
            .collect();
        drop(history);

        let mut out = Vec::new();
        if let Some(summary) = self.summary.lock().await.clone() {
            out.push(Message::system(format!("Earlier conversation summary: {summary}")));
        }
        out.extend(recent);

        let budget = self.token_budget.saturating_sub(system_and_memory_tokens);
        truncate_to_fit(out, budget)
    }

    /// Token count across the full un-summarized session history.
    async fn session_tokens(&self) -> u32 {
        self.history
            .lock()
            .await
            .iter()
            .map(estimate_message_tokens)
            .sum()
    }

    /// Launches a background summarization if the session has grown past
    /// `summarize_threshold`. Non-blocking: the caller does not await the
    /// summarization result, and the next `build_context` may still use the
    /// un-summarized window if the task hasn't finished yet.
    pub fn maybe_summarize_in_background(self: &Arc<Self>, provider: Arc<dyn LLMProvider>, model: String) {
        let this = Arc::clone(self);
        tokio::spawn(async move {
            if this.session_tokens().await <= this.summarize_threshold {
                return;
            }
            this.summarize_oldest_half(provider, model).await;
        });
    }

    async fn summarize_oldest_half(&self, provider: Arc<dyn LLMProvider>, model: String) {
        let mut history = self.history.lock().await;
        if history.len() < 4 {
            return;
        }
        let split = history.len() / 2;
        let oldest: Vec<Message> = history.drain(..split).collect();
        drop(history);

        let excerpt: String = oldest
            .iter()
            .map(|m| format!("{:?}: {}", m.role, m.content))
            .collect::<Vec<_>>()
            .join("\n");

        let prompt = format!(
            "Summarize the following conversation excerpt in 3-5 concise sentences, \
             focusing on what was accomplished and any important context:\n\n{excerpt}"
        );

        let request = ChatRequest::new(model, "", vec![Message::user(prompt)]);
        let collector = Arc::new(SummaryCollector::default());
        let cancel = Arc::new(std::sync::atomic::AtomicBool::new(false));

        if provider
            .chat(request, collector.clone() as Arc<dyn crate::ai::ProviderSink>, cancel)
            .await
            .is_ok()
        {
            let text = collector.text.lock().await.clone();
            if !text.is_empty() {
                *self.summary.lock().await = Some(text);
                return;
            }
        }

        *self.summary.lock().await = Some(format!("[{} messages compacted]", oldest.len()));
    }
}

#[derive(Default)]
struct SummaryCollector {
    text: Mutex<String>,
}

#[async_trait::async_trait]
impl crate::ai::ProviderSink for SummaryCollector {
    async fn on_text_delta(&self, text: &str) {
        self.text.lock().await.push_str(text);
    }
    async fn on_tool_call(&self, _call: crate::ai::ToolCall) {}
    async fn on_done(&self, _usage: crate::ai::TokenUsage) {}
    async fn on_error(&self, _err: &crate::error::JarvisError) {}
}

/// Drops oldest non-system messages first until `messages` fits `budget`
/// tokens. System messages are always kept.
fn truncate_to_fit(mut messages: Vec<Message>, budget: u32) -> Vec<Message> {
    loop {
        let total: u32 = messages.iter().map(estimate_message_tokens).sum();
        if total <= budget {
            return messages;
        }
        let drop_at = messages.iter().position(|m| m.role != MessageRole::System);
        match drop_at {
            Some(idx) => {
                messages.remove(idx);
            }
            None => return messages,
        }
    }
}
