//! Retry + fallback wrapper around any [`LLMProvider`].
//!
//! The streaming callback contract means a retry is only safe before any
//! output has reached the sink — once `chat()` starts forwarding deltas, a
//! connection drop is surfaced as-is rather than replayed, since replaying
//! would duplicate text the caller already emitted.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;

use crate::error::JarvisResult;

use super::super::{
    provider::{CancelFlag, LLMProvider, ProviderSink},
    types::ChatRequest,
};

pub struct ReliableProvider {
    primary: Arc<dyn LLMProvider>,
    fallbacks: Vec<Arc<dyn LLMProvider>>,
    max_retries: u32,
    base_delay: Duration,
}

impl ReliableProvider {
    pub fn new(primary: Arc<dyn LLMProvider>) -> Self {
        Self {
            primary,
            fallbacks: Vec::new(),
            max_retries: 2,
            base_delay: Duration::from_millis(500),
        }
    }

    pub fn with_retries(mut self, max_retries: u32, base_delay: Duration) -> Self {
        self.max_retries = max_retries;
        self.base_delay = base_delay;
        self
    }

    pub fn with_fallback(mut self, provider: Arc<dyn LLMProvider>) -> Self {
        self.fallbacks.push(provider);
        self
    }
}

#[async_trait]
impl LLMProvider for ReliableProvider {
    async fn chat(
        &self,
        request: ChatRequest,
        sink: Arc<dyn ProviderSink>,
        cancel: CancelFlag,
    ) -> JarvisResult<()> {
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                let delay = self.base_delay * 2u32.saturating_pow(attempt - 1);
                tokio::time::sleep(delay).await;
            }
            match self.primary.chat(request.clone(), sink.clone(), cancel.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }

        for fallback in &self.fallbacks {
            match fallback.chat(request.clone(), sink.clone(), cancel.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => last_err = Some(e),
            }
        }

        let err = last_err.expect("loop runs at least once");
        sink.on_error(&err).await;
        Err(err)
    }

    fn context_limit(&self) -> usize {
        self.fallbacks
            .iter()
            .map(|f| f.context_limit())
            .fold(self.primary.context_limit(), |min, limit| min.min(limit))
    }

    fn supports_tools(&self) -> bool {
        self.primary.supports_tools() && self.fallbacks.iter().all(|f| f.supports_tools())
    }

    fn provider_name(&self) -> &str {
        self.primary.provider_name()
    }

    async fn warmup(&self) -> JarvisResult<()> {
        if let Err(e) = self.primary.warmup().await {
            tracing::warn!(
                "ReliableProvider warmup failed for {}: {e}",
                self.primary.provider_name()
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ai::types::{Message, TokenUsage, ToolCall};
    use crate::error::JarvisError;
    use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

    struct AlwaysFailProvider {
        name: &'static str,
        calls: Arc<AtomicU32>,
    }

    #[async_trait]
    impl LLMProvider for AlwaysFailProvider {
        async fn chat(&self, _: ChatRequest, _: Arc<dyn ProviderSink>, _: CancelFlag) -> JarvisResult<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(JarvisError::Upstream {
                host: self.name.to_owned(),
                path: "chat".to_owned(),
                detail: "stub failure".to_owned(),
            })
        }
        fn context_limit(&self) -> usize {
            4096
        }
        fn supports_tools(&self) -> bool {
            false
        }
        fn provider_name(&self) -> &str {
            self.name
        }
    }

    struct AlwaysOkProvider;

    #[async_trait]
    impl LLMProvider for AlwaysOkProvider {
        async fn chat(&self, _: ChatRequest, sink: Arc<dyn ProviderSink>, _: CancelFlag) -> JarvisResult<()> {
            sink.on_text_delta("ok").await;
            sink.on_done(TokenUsage::default()).await;
            Ok(())
        }
        fn context_limit(&self) -> usize {
            4096
        }
        fn supports_tools(&self) -> bool {
            false
        }
        fn provider_name(&self) -> &str {
            "always-ok"
        }
    }

    struct NullSink;
    #[async_trait]
    impl ProviderSink for NullSink {
        async fn on_text_delta(&self, _text: &str) {}
        async fn on_tool_call(&self, _call: ToolCall) {}
        async fn on_done(&self, _usage: TokenUsage) {}
        async fn on_error(&self, _err: &JarvisError) {}
    }

    fn dummy_request() -> ChatRequest {
        ChatRequest::new("test-model", "", vec![Message::user("hi")])
    }

    #[tokio::test]
    async fn retries_on_primary_failure() {
        let calls = Arc::new(AtomicU32::new(0));
        let reliable = ReliableProvider::new(Arc::new(AlwaysFailProvider {
            name: "primary",
            calls: calls.clone(),
        }))
        .with_retries(2, Duration::from_millis(1));

        let result = reliable
            .chat(dummy_request(), Arc::new(NullSink), Arc::new(AtomicBool::new(false)))
            .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn fallback_chain_activated() {
        let reliable = ReliableProvider::new(Arc::new(AlwaysFailProvider {
            name: "primary",
            calls: Arc::new(AtomicU32::new(0)),
        }))
        .with_retries(0, Duration::from_millis(1))
        .with_fallback(Arc::new(AlwaysOkProvider));

        let result = reliable
            .chat(dummy_request(), Arc::new(NullSink), Arc::new(AtomicBool::new(false)))
            .await;
        assert!(result.is_ok());
    }
}
