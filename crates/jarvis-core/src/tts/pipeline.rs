//! Bounded-parallel streaming TTS pipeline — the hardest subsystem.
//!
//! Ties together the two-tier cache, the engine lock, and the primary/
//! fallback ladder into `TtsPipeline::synthesize_response`, which drains a
//! per-response sentence queue with up to `P` concurrent workers. Sentence
//! index is assigned by the caller at enqueue time, so emission order
//! is independent of worker completion order.
//!
//! A `TtsBackend` trait puts a pluggable backend behind a trait object, and
//! a primary-then-fallback wrapper idiom is generalized here into an
//! explicit four-step fallback ladder.

use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{stream, StreamExt};
use reqwest::Client;

use crate::error::{JarvisError, JarvisResult};

use super::{
    cache::{cache_key, TwoTierCache},
    engine_lock::{Engine, EngineLock},
};

/// A synthesized sentence's audio, carrying the index the sentence
/// streamer assigned at detection time — never at synthesis completion
/// time.
#[derive(Debug, Clone)]
pub struct AudioChunk {
    pub index: usize,
    pub bytes: Vec<u8>,
    pub produced_by: Engine,
}

/// A pluggable synthesis backend. Implementations call out to the primary
/// or fallback HTTP endpoint; the pipeline itself never knows the wire
/// format beyond "bytes out".
#[async_trait]
pub trait TtsBackend: Send + Sync {
    async fn synthesize(&self, text: &str) -> JarvisResult<Vec<u8>>;
    fn name(&self) -> &str;
}

/// Synthesizes against a bare HTTP endpoint that accepts `{"text": ...}`
/// and returns raw audio bytes. Covers both the primary (expressive, slow)
/// and fallback (fast, less expressive) engines — both are out-of-scope
/// external collaborators reached over HTTP.
pub struct HttpTtsBackend {
    client: Client,
    endpoint: String,
    name: &'static str,
}

impl HttpTtsBackend {
    pub fn new(endpoint: impl Into<String>, name: &'static str, timeout: Duration) -> JarvisResult<Self> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| JarvisError::Internal(format!("failed to build tts http client: {e}")))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            name,
        })
    }
}

#[async_trait]
impl TtsBackend for HttpTtsBackend {
    async fn synthesize(&self, text: &str) -> JarvisResult<Vec<u8>> {
        let resp = self
            .client
            .post(&self.endpoint)
            .json(&serde_json::json!({"text": text}))
            .send()
            .await
            .map_err(|e| JarvisError::Upstream {
                host: self.endpoint.clone(),
                path: "synthesize".to_owned(),
                detail: e.to_string(),
            })?;

        if !resp.status().is_success() {
            return Err(JarvisError::Upstream {
                host: self.endpoint.clone(),
                path: "synthesize".to_owned(),
                detail: format!("status {}", resp.status()),
            });
        }

        resp.bytes()
            .await
            .map(|b| b.to_vec())
            .map_err(|e| JarvisError::Upstream {
                host: self.endpoint.clone(),
                path: "synthesize".to_owned(),
                detail: e.to_string(),
            })
    }

    fn name(&self) -> &str {
        self.name
    }
}

/// An external one-shot encoder invoked between synthesis and emission.
/// Failures here are never fatal — the uncompressed audio is emitted
/// instead.
#[async_trait]
pub trait Transcoder: Send + Sync {
    async fn encode(&self, pcm_or_wav: &[u8]) -> JarvisResult<Vec<u8>>;
}

pub struct TtsPipeline {
    primary: Arc<dyn TtsBackend>,
    fallback: Arc<dyn TtsBackend>,
    cache: Arc<TwoTierCache>,
    transcoder: Option<Arc<dyn Transcoder>>,
    max_parallel: usize,
    synth_deadline: Duration,
    primary_healthy: Arc<std::sync::atomic::AtomicBool>,
}

impl TtsPipeline {
    pub fn new(
        primary: Arc<dyn TtsBackend>,
        fallback: Arc<dyn TtsBackend>,
        cache: Arc<TwoTierCache>,
        transcoder: Option<Arc<dyn Transcoder>>,
        max_parallel: usize,
        synth_deadline: Duration,
        primary_healthy: Arc<std::sync::atomic::AtomicBool>,
    ) -> Self {
        Self {
            primary,
            fallback,
            cache,
            transcoder,
            max_parallel,
            synth_deadline,
            primary_healthy,
        }
    }

    /// The four-step fallback ladder for one sentence:
    /// 1. try primary with a deadline; 2. if primary is unhealthy/timed out
    /// and a cached primary audio exists, return that; 3. otherwise
    /// synthesize via fallback; 4. record which engine produced the audio.
    async fn synthesize_one(&self, text: &str, lock: &EngineLock) -> JarvisResult<(Vec<u8>, Engine)> {
        let primary_key = cache_key("primary", text);
        let fallback_key = cache_key("fallback", text);
        let locked_to_fallback = matches!(lock.current(), Some(Engine::Fallback));

        if !locked_to_fallback {
            if let Some(cached) = self.cache.get("primary", &primary_key) {
                lock.record(Engine::Primary);
                return Ok((cached, Engine::Primary));
            }
        }

        if !locked_to_fallback && self.primary_healthy.load(std::sync::atomic::Ordering::Relaxed) {
            let attempt = tokio::time::timeout(self.synth_deadline, self.primary.synthesize(text)).await;
            if let Ok(Ok(bytes)) = attempt {
                self.cache.put("primary", &primary_key, bytes.clone());
                lock.record(Engine::Primary);
                return Ok((bytes, Engine::Primary));
            }
            // Primary unhealthy or deadline exceeded: fall through.
        }

        if let Some(cached) = self.cache.get("primary", &primary_key) {
            lock.record(Engine::Primary);
            return Ok((cached, Engine::Primary));
        }

        if let Some(cached) = self.cache.get("fallback", &fallback_key) {
            lock.record(Engine::Fallback);
            return Ok((cached, Engine::Fallback));
        }

        let bytes = self.fallback.synthesize(text).await?;
        self.cache.put("fallback", &fallback_key, bytes.clone());
        lock.record(Engine::Fallback);
        Ok((bytes, Engine::Fallback))
    }

    async fn maybe_transcode(&self, bytes: Vec<u8>) -> Vec<u8> {
        let Some(transcoder) = &self.transcoder else {
            return bytes;
        };
        match transcoder.encode(&bytes).await {
            Ok(encoded) => encoded,
            Err(e) => {
                tracing::warn!("tts transcoding failed, emitting original audio: {e}");
                bytes
            }
        }
    }

    /// Drain a per-response sentence queue with up to `max_parallel`
    /// concurrent workers. The engine lock is shared across every worker
    /// for this one response and must be created fresh per response.
    pub async fn synthesize_response(
        &self,
        sentences: Vec<(usize, String)>,
        lock: Arc<EngineLock>,
    ) -> Vec<JarvisResult<AudioChunk>> {
        let results = stream::iter(sentences.into_iter().map(|(index, text)| {
            let lock = lock.clone();
            async move {
                let synthesized = self.synthesize_one(&text, &lock).await;
                match synthesized {
                    Ok((bytes, produced_by)) => {
                        let bytes = self.maybe_transcode(bytes).await;
                        Ok(AudioChunk {
                            index,
                            bytes,
                            produced_by,
                        })
                    }
                    Err(e) => Err(e),
                }
            }
        }))
        .buffer_unordered(self.max_parallel.max(1));

        results.collect().await
    }

    /// Synthesize a fixed list of common phrases serially at startup, after
    /// a grace period, writing to both cache tiers.
    pub async fn prewarm(&self, phrases: &[String]) {
        let lock = EngineLock::new();
        for phrase in phrases {
            if let Err(e) = self.synthesize_one(phrase, &lock).await {
                tracing::warn!("tts prewarm failed for {phrase:?}: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;

    struct StubBackend {
        name: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl TtsBackend for StubBackend {
        async fn synthesize(&self, text: &str) -> JarvisResult<Vec<u8>> {
            if self.fail {
                Err(JarvisError::Upstream {
                    host: self.name.to_owned(),
                    path: "synth".to_owned(),
                    detail: "stub failure".to_owned(),
                })
            } else {
                Ok(text.as_bytes().to_vec())
            }
        }
        fn name(&self) -> &str {
            self.name
        }
    }

    fn pipeline(primary_fails: bool) -> (TtsPipeline, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let cache = Arc::new(TwoTierCache::new(dir.path(), 50, 50));
        let pipeline = TtsPipeline::new(
            Arc::new(StubBackend {
                name: "primary",
                fail: primary_fails,
            }),
            Arc::new(StubBackend {
                name: "fallback",
                fail: false,
            }),
            cache,
            None,
            2,
            Duration::from_millis(200),
            Arc::new(AtomicBool::new(true)),
        );
        (pipeline, dir)
    }

    #[tokio::test]
    async fn healthy_primary_produces_primary_audio() {
        let (pipeline, _dir) = pipeline(false);
        let lock = EngineLock::new();
        let (_, engine) = pipeline.synthesize_one("hello", &lock).await.unwrap();
        assert_eq!(engine, Engine::Primary);
    }

    #[tokio::test]
    async fn failing_primary_falls_back() {
        let (pipeline, _dir) = pipeline(true);
        let lock = EngineLock::new();
        let (_, engine) = pipeline.synthesize_one("hello", &lock).await.unwrap();
        assert_eq!(engine, Engine::Fallback);
        assert_eq!(lock.current(), Some(Engine::Fallback));
    }

    #[tokio::test]
    async fn once_locked_to_fallback_stays_fallback_even_if_primary_recovers() {
        let (pipeline, _dir) = pipeline(false);
        let lock = EngineLock::new();
        lock.record(Engine::Fallback);
        let (_, engine) = pipeline.synthesize_one("hello again", &lock).await.unwrap();
        assert_eq!(engine, Engine::Fallback);
    }

    #[tokio::test]
    async fn response_audio_indices_preserved_under_parallelism() {
        let (pipeline, _dir) = pipeline(false);
        let lock = Arc::new(EngineLock::new());
        let sentences: Vec<(usize, String)> = (0..5).map(|i| (i, format!("sentence {i}"))).collect();
        let results = pipeline.synthesize_response(sentences, lock).await;
        let mut indices: Vec<usize> = results.into_iter().filter_map(|r| r.ok()).map(|c| c.index).collect();
        indices.sort_unstable();
        assert_eq!(indices, vec![0, 1, 2, 3, 4]);
    }
}
