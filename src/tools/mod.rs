//! 工具层：注册表、外部命令工具、决策格式 Schema

pub mod command;
pub mod registry;
pub mod schema;

pub use command::CommandTool;
pub use registry::{Catalog, CatalogEntry, FnTool, Tool, ToolClass, ToolId, ToolRegistry};
pub use schema::{final_answer_schema_json, tool_call_schema_json};

use crate::config::ToolsSection;
use crate::core::WorkflowError;

/// 根据 [tools.commands] 配置注册全部外部命令工具；未知工具名视为配置错误
pub fn registry_from_config(tools: &ToolsSection) -> Result<ToolRegistry, WorkflowError> {
    let mut registry = ToolRegistry::new();
    for (name, spec) in &tools.commands {
        let id = ToolId::from_loose(name)
            .ok_or_else(|| WorkflowError::Config(format!("Unknown tool in [tools.commands]: {name}")))?;
        registry.register(CommandTool::new(id, spec.clone(), tools.timeout_secs))?;
    }
    Ok(registry)
}
