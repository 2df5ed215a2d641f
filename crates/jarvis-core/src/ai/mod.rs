pub mod provider;
pub mod providers;
pub mod types;

pub use provider::{is_cancelled, CancelFlag, LLMProvider, ProviderSink};
pub use providers::{HttpProvider, ReliableProvider};
pub use types::{ChatRequest, Message, MessageRole, TokenUsage, ToolCall, ToolDefinition};
