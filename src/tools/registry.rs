//! Tool sources and the registry that resolves names across them.

use std::collections::HashMap;
use std::sync::Arc;

use crate::error::{ConfigError, ToolError};
use crate::llm::ToolDefinition;
use crate::tools::tool::Tool;

/// A named bundle of tools, e.g. `builtin` or a future plugin.
pub struct ToolSource {
    name: String,
    tools: HashMap<String, Arc<dyn Tool>>,
    order: Vec<String>,
}

impl ToolSource {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            tools: HashMap::new(),
            order: Vec::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn register(&mut self, tool: Arc<dyn Tool>) -> Result<(), ConfigError> {
        let name = tool.name().to_string();
        if self.tools.contains_key(&name) {
            return Err(ConfigError::DuplicateRegistration {
                kind: "tool",
                name,
            });
        }
        self.order.push(name.clone());
        self.tools.insert(name, tool);
        Ok(())
    }
}

/// Resolves tool names across sources. Earlier sources shadow later
/// ones, so a deployment can override a builtin by registering a source
/// ahead of it.
#[derive(Default)]
pub struct ToolRegistry {
    sources: Vec<ToolSource>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_source(&mut self, source: ToolSource) {
        self.sources.push(source);
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn Tool>, ToolError> {
        self.sources
            .iter()
            .find_map(|source| source.tools.get(name))
            .cloned()
            .ok_or_else(|| ToolError::NotFound {
                name: name.to_string(),
            })
    }

    pub fn has(&self, name: &str) -> bool {
        self.sources.iter().any(|s| s.tools.contains_key(name))
    }

    /// Definitions for every registered tool, shadowed names resolved.
    pub fn definitions(&self) -> Vec<ToolDefinition> {
        let mut seen = std::collections::HashSet::new();
        let mut defs = Vec::new();
        for source in &self.sources {
            for name in &source.order {
                if seen.insert(name.as_str()) {
                    defs.push(source.tools[name].definition());
                }
            }
        }
        defs
    }

    /// Definitions for a profile's tool list, in the profile's order.
    pub fn definitions_for(&self, names: &[String]) -> Result<Vec<ToolDefinition>, ToolError> {
        names
            .iter()
            .map(|name| self.resolve(name).map(|tool| tool.definition()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tools::tool::{ToolContext, ToolOutput};
    use async_trait::async_trait;
    use serde_json::{json, Value};

    struct FixedTool {
        name: &'static str,
        reply: &'static str,
    }

    #[async_trait]
    impl Tool for FixedTool {
        fn name(&self) -> &str {
            self.name
        }

        fn description(&self) -> &str {
            "replies with a fixed string"
        }

        fn parameters_schema(&self) -> Value {
            json!({"type": "object", "properties": {}})
        }

        async fn execute(
            &self,
            _args: Value,
            _ctx: &ToolContext,
        ) -> Result<ToolOutput, crate::error::ToolError> {
            Ok(ToolOutput::text(self.reply))
        }
    }

    #[test]
    fn duplicate_names_within_a_source_are_rejected() {
        let mut source = ToolSource::new("builtin");
        source
            .register(Arc::new(FixedTool {
                name: "echo",
                reply: "a",
            }))
            .unwrap();
        assert!(matches!(
            source.register(Arc::new(FixedTool {
                name: "echo",
                reply: "b",
            })),
            Err(ConfigError::DuplicateRegistration { .. })
        ));
    }

    #[tokio::test]
    async fn earlier_sources_shadow_later_ones() {
        let mut first = ToolSource::new("override");
        first
            .register(Arc::new(FixedTool {
                name: "echo",
                reply: "first",
            }))
            .unwrap();
        let mut second = ToolSource::new("builtin");
        second
            .register(Arc::new(FixedTool {
                name: "echo",
                reply: "second",
            }))
            .unwrap();

        let mut registry = ToolRegistry::new();
        registry.add_source(first);
        registry.add_source(second);

        let ctx = ToolContext {
            conversation_id: "c1".into(),
            profile: "default".into(),
            trust: crate::agent::TrustLevel::Standard,
        };
        let out = registry
            .resolve("echo")
            .unwrap()
            .execute(json!({}), &ctx)
            .await
            .unwrap();
        assert_eq!(out.content, "first");
        assert_eq!(registry.definitions().len(), 1);
    }

    #[test]
    fn unknown_names_resolve_to_not_found() {
        let registry = ToolRegistry::new();
        assert!(matches!(
            registry.resolve("missing"),
            Err(ToolError::NotFound { .. })
        ));
        assert!(registry
            .definitions_for(&["missing".to_string()])
            .is_err());
    }
}
