//! Tool registry / function namespace.
//!
//! Merges three tool sources into one namespace keyed by qualified name:
//! hypervisor-discovered tools, statically compiled native skills, and
//! imported skill packages. On a name collision, locally trusted code wins:
//! native skills shadow imported skills, which shadow hypervisor tools.
//!
//! The merged map is rebuilt wholesale — never patched in place — whenever
//! any source changes, so concurrent readers always observe a complete
//! namespace.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::RwLock;
use tracing::debug;

use toolmesh_core::error::ToolError;
use toolmesh_core::provider::ToolDefinition;
use toolmesh_core::tool::{Callable, ToolResult};
use toolmesh_hypervisor::Hypervisor;

/// A hypervisor-discovered tool wrapped in the uniform `Callable` contract.
struct HypervisorTool {
    hypervisor: Arc<Hypervisor>,
    definition: ToolDefinition,
    timeout: Duration,
}

#[async_trait]
impl Callable for HypervisorTool {
    fn name(&self) -> &str {
        &self.definition.name
    }

    fn description(&self) -> &str {
        &self.definition.description
    }

    fn parameters_schema(&self) -> serde_json::Value {
        self.definition.parameters.clone()
    }

    async fn invoke(&self, arguments: serde_json::Value) -> Result<ToolResult, ToolError> {
        let value = self
            .hypervisor
            .call(&self.definition.name, arguments, self.timeout)
            .await?;
        let output = match &value {
            serde_json::Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        Ok(ToolResult::ok("", output).with_data(value))
    }
}

/// The unified tool namespace consulted by the execution loop and the
/// workflow interpreter.
pub struct ToolRegistry {
    hypervisor: Option<Arc<Hypervisor>>,
    native: Vec<Arc<dyn Callable>>,
    imported: Vec<Arc<dyn Callable>>,
    tool_timeout: Duration,
    merged: RwLock<Arc<HashMap<String, Arc<dyn Callable>>>>,
}

impl ToolRegistry {
    pub fn new(
        hypervisor: Option<Arc<Hypervisor>>,
        native: Vec<Arc<dyn Callable>>,
        imported: Vec<Arc<dyn Callable>>,
        tool_timeout: Duration,
    ) -> Self {
        Self {
            hypervisor,
            native,
            imported,
            tool_timeout,
            merged: RwLock::new(Arc::new(HashMap::new())),
        }
    }

    /// Rebuild the merged namespace from all three sources.
    ///
    /// Insertion order encodes precedence: later inserts overwrite earlier
    /// ones, so hypervisor tools go first and native skills last.
    pub async fn rebuild(&self) {
        let mut map: HashMap<String, Arc<dyn Callable>> = HashMap::new();

        if let Some(hypervisor) = &self.hypervisor {
            for definition in hypervisor.tools_snapshot().await {
                map.insert(
                    definition.name.clone(),
                    Arc::new(HypervisorTool {
                        hypervisor: hypervisor.clone(),
                        definition,
                        timeout: self.tool_timeout,
                    }),
                );
            }
        }
        for skill in &self.imported {
            map.insert(skill.name().to_string(), skill.clone());
        }
        for skill in &self.native {
            map.insert(skill.name().to_string(), skill.clone());
        }

        debug!(tools = map.len(), "Rebuilt tool namespace");
        *self.merged.write().await = Arc::new(map);
    }

    /// Look a tool up by qualified name.
    pub async fn resolve(&self, name: &str) -> Option<Arc<dyn Callable>> {
        self.merged.read().await.get(name).cloned()
    }

    /// All tool definitions for the model-facing tool list, sorted by name.
    pub async fn definitions(&self) -> Vec<ToolDefinition> {
        let merged = self.merged.read().await.clone();
        let mut defs: Vec<ToolDefinition> = merged.values().map(|c| c.to_definition()).collect();
        defs.sort_by(|a, b| a.name.cmp(&b.name));
        defs
    }

    /// Number of registered tools.
    pub async fn len(&self) -> usize {
        self.merged.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.merged.read().await.is_empty()
    }
}
