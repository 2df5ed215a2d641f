pub mod context;
pub mod loop_;
pub mod router;

pub use context::ContextManager;
pub use loop_::{AgentLoop, AgentLoopConfig, PendingConfirmation, StreamSink};
pub use router::{IntentRouter, ProviderKind, RoutingDecision};

pub use crate::ai::Message;
