//! 工作流过程事件：用于 --verbose 或嵌入方展示决策、工具调用、观察与终态

use serde::Serialize;

/// 单步过程事件（可序列化为 JSON）
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkflowEvent {
    /// 迭代更新（当前第几轮）
    StepUpdate { iteration: usize, max_iterations: usize },
    /// 正在请求决策方
    Thinking,
    /// 决策方给出的决策摘要
    Decision { summary: String },
    ToolCall {
        tool: String,
        args: serde_json::Value,
    },
    /// 工具返回（预览，避免过长）
    Observation { tool: String, preview: String },
    ToolFailure { tool: String, reason: String },
    /// 错误恢复动作
    Recovery { action: String, detail: String },
    RecipeExtracted { recipe_id: String },
    /// 终态（status: succeeded / failed / exhausted）
    Finished { status: String, message: String },
}
