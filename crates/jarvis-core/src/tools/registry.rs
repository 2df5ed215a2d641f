use std::{collections::HashMap, sync::Arc};

use super::traits::{Tool, ToolInfo};

/// Central, immutable-after-startup catalog of available tools.
///
/// Populated once at startup from a static declaration (see `builtin.rs`);
/// the same declaration backs both the executor's handler lookup and the
/// provider-facing tool descriptions, so they cannot drift apart.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Register a tool. Overwrites any previous tool with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        self.tools.insert(tool.name().to_string(), tool);
    }

    /// Look up a tool by name. Returns `None` for an unknown tool — callers
    /// must treat that as tier BLACK, never as "no tool selected".
    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    /// List all registered tools, for `GET /api/tools` and provider payloads.
    pub fn list(&self) -> Vec<ToolInfo> {
        let mut infos: Vec<ToolInfo> = self
            .tools
            .values()
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
                schema: t.parameters_schema(),
                tier: t.tier(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

impl Default for ToolRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::security::Tier;
    use async_trait::async_trait;
    use serde_json::{Value, json};

    use crate::tools::traits::ToolResult;

    struct DummyTool(&'static str, Tier);

    #[async_trait]
    impl Tool for DummyTool {
        fn name(&self) -> &str {
            self.0
        }
        fn description(&self) -> &str {
            "a test tool"
        }
        fn parameters_schema(&self) -> Value {
            json!({"type": "object"})
        }
        fn tier(&self) -> Tier {
            self.1
        }
        async fn execute(&self, _args: Value) -> Result<ToolResult, String> {
            Ok(ToolResult::ok("done"))
        }
    }

    #[test]
    fn register_and_get() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(DummyTool("dummy", Tier::Green)));
        assert!(reg.get("dummy").is_some());
        assert!(reg.get("nonexistent").is_none());
    }

    #[test]
    fn list_returns_all_sorted() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(DummyTool("zeta", Tier::Green)));
        reg.register(Arc::new(DummyTool("alpha", Tier::Red)));
        let list = reg.list();
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].name, "alpha");
        assert_eq!(list[1].tier, Tier::Green);
    }

    #[test]
    fn overwrite_same_name() {
        let mut reg = ToolRegistry::new();
        reg.register(Arc::new(DummyTool("dummy", Tier::Green)));
        reg.register(Arc::new(DummyTool("dummy", Tier::Red)));
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.get("dummy").unwrap().tier(), Tier::Red);
    }
}
