//! Generic streaming HTTP provider. Speaks to whatever HTTPS endpoint is
//! configured for the agentic or conversational role — the concrete
//! upstream (llama.cpp, Claude, etc.) is treated as an external
//! collaborator reached through a narrow interface, so this client only
//! assumes an SSE stream of `{"delta": ...}` / `{"tool_call": {...}}` /
//! `{"usage": {...}}` frames, using the `eventsource-stream` crate already
//! in the dependency stack for SSE framing.

use std::sync::Arc;

use async_trait::async_trait;
use eventsource_stream::Eventsource;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;

use crate::error::{JarvisError, JarvisResult};

use super::super::{
    provider::{is_cancelled, CancelFlag, LLMProvider, ProviderSink},
    types::{ChatRequest, TokenUsage, ToolCall},
};

#[derive(Deserialize)]
#[serde(untagged)]
enum Frame {
    Delta { delta: String },
    ToolCall { tool_call: ToolCall },
    Usage { usage: TokenUsage },
}

pub struct HttpProvider {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    name: &'static str,
    context_limit: usize,
    supports_tools: bool,
}

impl HttpProvider {
    pub fn new(
        endpoint: impl Into<String>,
        api_key: Option<String>,
        name: &'static str,
        context_limit: usize,
        supports_tools: bool,
        timeout_secs: u64,
    ) -> JarvisResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| JarvisError::Internal(format!("failed to build provider client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            api_key,
            name,
            context_limit,
            supports_tools,
        })
    }
}

#[async_trait]
impl LLMProvider for HttpProvider {
    async fn chat(
        &self,
        request: ChatRequest,
        sink: Arc<dyn ProviderSink>,
        cancel: CancelFlag,
    ) -> JarvisResult<()> {
        let mut builder = self.client.post(&self.endpoint).json(&json!({
            "model": request.model,
            "system": request.system_prompt,
            "messages": request.messages,
            "tools": request.tools,
            "temperature": request.temperature,
            "max_tokens": request.max_tokens,
            "stream": true,
        }));
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }

        let resp = builder.send().await.map_err(|e| {
            let err = JarvisError::Upstream {
                host: self.endpoint.clone(),
                path: "chat".to_owned(),
                detail: e.to_string(),
            };
            err
        })?;

        if !resp.status().is_success() {
            let err = JarvisError::Upstream {
                host: self.endpoint.clone(),
                path: "chat".to_owned(),
                detail: format!("status {}", resp.status()),
            };
            return Err(err);
        }

        let mut stream = resp.bytes_stream().eventsource();
        let mut usage = TokenUsage::default();

        while let Some(event) = stream.next().await {
            if is_cancelled(&cancel) {
                return Ok(());
            }

            let event = event.map_err(|e| JarvisError::Upstream {
                host: self.endpoint.clone(),
                path: "chat:stream".to_owned(),
                detail: e.to_string(),
            })?;

            let Ok(frame) = serde_json::from_str::<Frame>(&event.data) else {
                continue;
            };

            match frame {
                Frame::Delta { delta } => sink.on_text_delta(&delta).await,
                Frame::ToolCall { tool_call } => sink.on_tool_call(tool_call).await,
                Frame::Usage { usage: u } => usage = u,
            }
        }

        sink.on_done(usage).await;
        Ok(())
    }

    fn context_limit(&self) -> usize {
        self.context_limit
    }

    fn supports_tools(&self) -> bool {
        self.supports_tools
    }

    fn provider_name(&self) -> &str {
        self.name
    }

    async fn warmup(&self) -> JarvisResult<()> {
        let mut builder = self.client.get(&self.endpoint);
        if let Some(key) = &self.api_key {
            builder = builder.bearer_auth(key);
        }
        builder
            .send()
            .await
            .map(|_| ())
            .map_err(|e| JarvisError::Upstream {
                host: self.endpoint.clone(),
                path: "warmup".to_owned(),
                detail: e.to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{atomic::AtomicBool, Mutex};

    use wiremock::{
        matchers::{method, path},
        Mock, MockServer, ResponseTemplate,
    };

    use super::*;
    use crate::ai::types::Message;

    #[test]
    fn provider_name_and_capabilities() {
        let provider =
            HttpProvider::new("http://localhost:1/chat", None, "agentic", 128_000, true, 60).unwrap();
        assert_eq!(provider.provider_name(), "agentic");
        assert!(provider.supports_tools());
        assert_eq!(provider.context_limit(), 128_000);
    }

    #[derive(Default)]
    struct CapturingSink {
        deltas: Mutex<Vec<String>>,
        usage: Mutex<Option<TokenUsage>>,
    }

    #[async_trait]
    impl ProviderSink for CapturingSink {
        async fn on_text_delta(&self, text: &str) {
            self.deltas.lock().unwrap().push(text.to_owned());
        }
        async fn on_tool_call(&self, _call: ToolCall) {}
        async fn on_done(&self, usage: TokenUsage) {
            *self.usage.lock().unwrap() = Some(usage);
        }
        async fn on_error(&self, _err: &JarvisError) {}
    }

    #[tokio::test]
    async fn chat_streams_deltas_from_an_sse_response() {
        let server = MockServer::start().await;
        let body = concat!(
            "data: {\"delta\": \"Hel\"}\n\n",
            "data: {\"delta\": \"lo.\"}\n\n",
            "data: {\"usage\": {\"input_tokens\": 3, \"output_tokens\": 2}}\n\n",
        );
        Mock::given(method("POST"))
            .and(path("/chat"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("content-type", "text/event-stream")
                    .set_body_string(body),
            )
            .mount(&server)
            .await;

        let provider = HttpProvider::new(
            format!("{}/chat", server.uri()),
            None,
            "conversational",
            8_000,
            false,
            5,
        )
        .unwrap();

        let request = ChatRequest::new("conversational", "be brief", vec![Message::user("hi")]);
        let sink = Arc::new(CapturingSink::default());
        let cancel: CancelFlag = Arc::new(AtomicBool::new(false));

        provider.chat(request, sink.clone(), cancel).await.unwrap();

        assert_eq!(sink.deltas.lock().unwrap().as_slice(), ["Hel", "lo."]);
        assert!(sink.usage.lock().unwrap().is_some());
    }
}
