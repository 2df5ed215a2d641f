//! Primary-engine health probe and restart-storm prevention.
//!
//! A failed probe requests a restart via the host orchestrator's control
//! socket, but only if the configured cooldown has elapsed since the last
//! restart attempt — this is the only thing standing between a flaky
//! engine and a restart loop.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    sync::Arc,
    time::{Duration, Instant},
};

use tokio::sync::Mutex;

use super::pipeline::TtsBackend;

/// Minimal abstraction over "ask the container to restart". In production
/// this is a Unix socket call to the host orchestrator; tests substitute a
/// counting stub.
#[async_trait::async_trait]
pub trait RestartController: Send + Sync {
    async fn restart(&self, engine: &str) -> Result<(), String>;
}

pub struct EngineHealth {
    backend: Arc<dyn TtsBackend>,
    controller: Arc<dyn RestartController>,
    cooldown: Duration,
    last_restart: Mutex<Option<Instant>>,
    healthy: Arc<AtomicBool>,
}

impl EngineHealth {
    pub fn new(
        backend: Arc<dyn TtsBackend>,
        controller: Arc<dyn RestartController>,
        cooldown: Duration,
        healthy: Arc<AtomicBool>,
    ) -> Self {
        Self {
            backend,
            controller,
            cooldown,
            last_restart: Mutex::new(None),
            healthy,
        }
    }

    /// Probe the primary engine with a short, fixed synthesis request.
    /// Updates the shared `healthy` flag the pipeline's fallback ladder
    /// reads, and requests a restart if the cooldown has elapsed.
    pub async fn check(&self) {
        let probe = tokio::time::timeout(Duration::from_secs(3), self.backend.synthesize("ok")).await;
        let ok = matches!(probe, Ok(Ok(_)));
        self.healthy.store(ok, Ordering::Relaxed);

        if ok {
            return;
        }

        let mut last = self.last_restart.lock().await;
        let should_restart = match *last {
            None => true,
            Some(t) => t.elapsed() >= self.cooldown,
        };
        if !should_restart {
            return;
        }

        *last = Some(Instant::now());
        drop(last);

        if let Err(e) = self.controller.restart(self.backend.name()).await {
            tracing::warn!("tts engine restart request failed: {e}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::JarvisResult;
    use async_trait::async_trait;
    use std::sync::atomic::AtomicU32;

    struct AlwaysFail;
    #[async_trait]
    impl TtsBackend for AlwaysFail {
        async fn synthesize(&self, _text: &str) -> JarvisResult<Vec<u8>> {
            Err(crate::error::JarvisError::Internal("probe failed".into()))
        }
        fn name(&self) -> &str {
            "primary"
        }
    }

    struct CountingController(Arc<AtomicU32>);
    #[async_trait]
    impl RestartController for CountingController {
        async fn restart(&self, _engine: &str) -> Result<(), String> {
            self.0.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test]
    async fn first_failure_triggers_restart() {
        let count = Arc::new(AtomicU32::new(0));
        let health = EngineHealth::new(
            Arc::new(AlwaysFail),
            Arc::new(CountingController(count.clone())),
            Duration::from_secs(300),
            Arc::new(AtomicBool::new(true)),
        );
        health.check().await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn second_failure_within_cooldown_is_suppressed() {
        let count = Arc::new(AtomicU32::new(0));
        let health = EngineHealth::new(
            Arc::new(AlwaysFail),
            Arc::new(CountingController(count.clone())),
            Duration::from_secs(300),
            Arc::new(AtomicBool::new(true)),
        );
        health.check().await;
        health.check().await;
        assert_eq!(count.load(Ordering::SeqCst), 1, "cooldown should suppress the second restart");
    }

    #[tokio::test]
    async fn failure_marks_engine_unhealthy() {
        let healthy = Arc::new(AtomicBool::new(true));
        let health = EngineHealth::new(
            Arc::new(AlwaysFail),
            Arc::new(CountingController(Arc::new(AtomicU32::new(0)))),
            Duration::from_secs(300),
            healthy.clone(),
        );
        health.check().await;
        assert!(!healthy.load(Ordering::Relaxed));
    }
}
