//! TTS pipeline and sentence streamer.

pub mod cache;
pub mod engine_lock;
pub mod health;
pub mod pipeline;
pub mod sentence;

pub use cache::{cache_key, normalize, TwoTierCache};
pub use engine_lock::{Engine, EngineLock};
pub use health::{EngineHealth, RestartController};
pub use pipeline::{AudioChunk, HttpTtsBackend, Transcoder, TtsBackend, TtsPipeline};
pub use sentence::SentenceStreamer;
