use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::security::Tier;

/// The result of executing a [`Tool`] handler.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolResult {
    pub output: String,
    pub success: bool,
    pub metadata: Option<Value>,
}

impl ToolResult {
    pub fn ok(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: true,
            metadata: None,
        }
    }

    pub fn err(output: impl Into<String>) -> Self {
        Self {
            output: output.into(),
            success: false,
            metadata: None,
        }
    }

    pub fn with_metadata(mut self, metadata: Value) -> Self {
        self.metadata = Some(metadata);
        self
    }
}

/// A capability the agentic loop can invoke.
///
/// Handlers are pure with respect to the executor: they do not log or
/// persist anything themselves. `Tool` implementations must be
/// `Send + Sync` so they can be held in a shared `Arc<dyn Tool>` registry.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Stable machine identifier (snake_case), e.g. `"stop_vm"`.
    fn name(&self) -> &str;

    /// Human-readable description used in LLM `tool_use` payloads.
    fn description(&self) -> &str;

    /// JSON Schema object describing the tool's accepted parameters.
    fn parameters_schema(&self) -> Value;

    /// Effect tier. Declared alongside the handler so the registry can
    /// derive provider-facing descriptions and safety tiers from the same
    /// static declaration — they can never drift apart.
    fn tier(&self) -> Tier;

    /// Execute the tool with arguments already validated by the caller.
    async fn execute(&self, args: Value) -> Result<ToolResult, String>;
}

/// Summary of a registered tool, suitable for inclusion in LLM API requests
/// or the `GET /api/tools` response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
    pub schema: Value,
    pub tier: Tier,
}
