//! 决策 JSON Schema 生成（schemars）
//!
//! 将合法的 JSON 形式决策结构注入 system prompt，减少决策方输出格式错误。

use schemars::{schema_for, JsonSchema};
use std::collections::HashMap;

/// JSON 形式的工具调用：`{"tool": "...", "args": {...}}`（仅用于 Schema 生成）
#[allow(dead_code)]
#[derive(JsonSchema)]
struct ToolCallFormat {
    /// 工具名，必须来自可用工具列表，如 analyzeProject、migrationPlan、modUpgrade
    pub tool: String,
    /// 工具参数（project_path、recipe_id 等）
    pub args: HashMap<String, String>,
}

/// JSON 形式的最终回答：`{"final_answer": "...", "success": true}`
#[allow(dead_code)]
#[derive(JsonSchema)]
struct FinalAnswerFormat {
    pub final_answer: String,
    pub success: bool,
}

/// 返回工具调用的 JSON Schema 字符串，可拼入 system prompt
pub fn tool_call_schema_json() -> String {
    let schema = schema_for!(ToolCallFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}

pub fn final_answer_schema_json() -> String {
    let schema = schema_for!(FinalAnswerFormat);
    serde_json::to_string_pretty(&schema).unwrap_or_default()
}
