//! Tool interface and registry.
//!
//! A tool is a named, side-effecting capability the conversation driver can
//! dispatch to. Lookup is strictly by name through the typed registry; there
//! is no shape guessing.

mod builtin;

pub use builtin::{CurrentTime, Echo, FetchUrl, SendNotification};

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use uuid::Uuid;

use crate::events::EventBus;

/// Identity of the run a tool call belongs to.
#[derive(Debug, Clone, Copy)]
pub struct ToolContext {
    pub agent_id: Uuid,
    pub user_id: Uuid,
}

/// A named capability invocable by the conversation driver.
#[async_trait]
pub trait Tool: Send + Sync {
    /// Unique tool name, as exposed to the model.
    fn name(&self) -> &str;

    /// Human-readable description used when prompting.
    fn description(&self) -> &str;

    /// JSON schema of the expected arguments.
    fn parameters_schema(&self) -> Value;

    /// Execute the tool.
    async fn execute(&self, args: Value, ctx: &ToolContext) -> anyhow::Result<Value>;
}

/// Listing entry for prompt building.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    pub name: String,
    pub description: String,
}

/// Registry of available tools.
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn Tool>>,
}

impl ToolRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            tools: HashMap::new(),
        }
    }

    /// Registry with the builtin tool set.
    pub fn with_builtins(events: Arc<dyn EventBus>) -> Self {
        let mut registry = Self::new();
        registry.register(Arc::new(Echo));
        registry.register(Arc::new(CurrentTime));
        registry.register(Arc::new(FetchUrl::new()));
        registry.register(Arc::new(SendNotification::new(events)));
        registry
    }

    /// Register a tool, replacing any previous one with the same name.
    pub fn register(&mut self, tool: Arc<dyn Tool>) {
        let name = tool.name().to_string();
        tracing::debug!("Registered tool: {}", name);
        self.tools.insert(name, tool);
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn Tool>> {
        self.tools.get(name).cloned()
    }

    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Names and descriptions, restricted to an agent's allowed set.
    /// An empty filter means all tools.
    pub fn list_allowed(&self, allowed: &[String]) -> Vec<ToolInfo> {
        let mut infos: Vec<ToolInfo> = self
            .tools
            .values()
            .filter(|t| {
                allowed.is_empty() || allowed.iter().any(|a| a == "*" || a == t.name())
            })
            .map(|t| ToolInfo {
                name: t.name().to_string(),
                description: t.description().to_string(),
            })
            .collect();
        infos.sort_by(|a, b| a.name.cmp(&b.name));
        infos
    }

    /// Execute a tool by name.
    ///
    /// Unknown names and tool failures both come back as `Err`; the driver
    /// feeds them into the conversation rather than aborting the run.
    pub async fn execute(
        &self,
        name: &str,
        args: Value,
        ctx: &ToolContext,
    ) -> anyhow::Result<Value> {
        let tool = self
            .tools
            .get(name)
            .ok_or_else(|| anyhow::anyhow!("Unknown tool: {}", name))?;
        tool.execute(args, ctx).await
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
    use serde_json::json;

    fn ctx() -> ToolContext {
        ToolContext {
            agent_id: Uuid::new_v4(),
            user_id: Uuid::new_v4(),
        }
    }

    #[tokio::test]
    async fn register_and_execute() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));

        assert!(registry.has("echo"));
        let result = registry
            .execute("echo", json!({"text": "hi"}), &ctx())
            .await
            .expect("echo runs");
        assert_eq!(result, json!("hi"));
    }

    #[tokio::test]
    async fn unknown_tool_is_an_error() {
        let registry = ToolRegistry::new();
        let err = registry
            .execute("nope", json!({}), &ctx())
            .await
            .expect_err("unknown tool");
        assert!(err.to_string().contains("Unknown tool"));
    }

    #[test]
    fn list_allowed_filters() {
        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(Echo));
        registry.register(Arc::new(CurrentTime));

        let all = registry.list_allowed(&[]);
        assert_eq!(all.len(), 2);

        let some = registry.list_allowed(&["echo".to_string()]);
        assert_eq!(some.len(), 1);
        assert_eq!(some[0].name, "echo");

        let wildcard = registry.list_allowed(&["*".to_string()]);
        assert_eq!(wildcard.len(), 2);
    }
}
