//! STT port: a single blocking transcription call over an audio buffer.
//! A minimal trait shape — one method, `Result`-returning, no internal
//! state.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;

use crate::error::{JarvisError, JarvisResult};

pub struct TranscribeOptions {
    pub language: Option<String>,
}

pub struct Transcript {
    pub text: String,
    pub processing_time_seconds: f64,
}

/// Called by the voice path only. Failures are surfaced as an error event,
/// never as a silently empty transcript.
#[async_trait]
pub trait SttPort: Send + Sync {
    async fn transcribe(&self, audio: &[u8], opts: TranscribeOptions) -> JarvisResult<Transcript>;
}

#[derive(Deserialize)]
struct SttResponse {
    text: String,
}

pub struct HttpSttClient {
    client: Client,
    endpoint: String,
}

impl HttpSttClient {
    pub fn new(endpoint: impl Into<String>, timeout_secs: u64) -> JarvisResult<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()
            .map_err(|e| JarvisError::Internal(format!("failed to build stt client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
        })
    }
}

#[async_trait]
impl SttPort for HttpSttClient {
    async fn transcribe(&self, audio: &[u8], opts: TranscribeOptions) -> JarvisResult<Transcript> {
        let started = Instant::now();

        let mut request = self
            .client
            .post(&self.endpoint)
            .header("Content-Type", "application/octet-stream")
            .body(audio.to_vec());
        if let Some(lang) = &opts.language {
            request = request.query(&[("language", lang.as_str())]);
        }

        let resp = request.send().await.map_err(|e| JarvisError::Upstream {
            host: self.endpoint.clone(),
            path: "transcribe".to_owned(),
            detail: e.to_string(),
        })?;

        if !resp.status().is_success() {
            return Err(JarvisError::Upstream {
                host: self.endpoint.clone(),
                path: "transcribe".to_owned(),
                detail: format!("status {}", resp.status()),
            });
        }

        let parsed: SttResponse = resp.json().await.map_err(|e| JarvisError::Upstream {
            host: self.endpoint.clone(),
            path: "transcribe".to_owned(),
            detail: format!("failed to parse response: {e}"),
        })?;

        Ok(Transcript {
            text: parsed.text,
            processing_time_seconds: started.elapsed().as_secs_f64(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn unreachable_endpoint_surfaces_as_upstream_error() {
        let client = HttpSttClient::new("http://127.0.0.1:0/transcribe", 1).unwrap();
        let err = client
            .transcribe(&[0u8; 16], TranscribeOptions { language: None })
            .await
            .unwrap_err();
        assert_eq!(err.kind(), "Upstream");
    }
}
