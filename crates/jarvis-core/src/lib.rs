pub mod agent;
pub mod ai;
pub mod config;
pub mod error;
pub mod event_bus;
#[cfg(feature = "gateway")]
pub mod gateway;
pub mod infra;
pub mod persistence;
pub mod security;
pub mod stt;
pub mod telemetry;
pub mod timing;
pub mod tools;
pub mod tts;

/// Convenience re-exports for the most commonly used traits and types across
/// the crate.
///
/// ```rust
/// use jarvis_core::prelude::*;
/// ```
pub mod prelude {
    pub use crate::ai::{ChatRequest, LLMProvider, Message, MessageRole, ProviderSink};

    pub use crate::tools::{Tool, ToolExecutor, ToolRegistry, ToolResult};

    pub use crate::security::{SafetyDecision, SecurityPolicy, Tier};

    pub use crate::event_bus::{AppEvent, EventBus, TokioBroadcastBus};

    pub use crate::persistence::{Persistence, SqlitePersistence};

    pub use crate::config::{load_default_config, AppConfig};

    pub use crate::error::{JarvisError, JarvisResult};
}

/// Installs the `ring` crypto provider for rustls before any network I/O.
/// `reqwest`, `tokio-tungstenite`, and the gateway's TLS listener all pull in
/// rustls; without an explicit default it panics the first time a TLS
/// connection is attempted.
pub fn install_crypto_provider() {
    let _ = rustls::crypto::ring::default_provider().install_default();
}
