//! 工作流错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：可恢复错误写入历史并反馈给决策方（RetryWithPrompt），
//! 校验错误、注册表误用与不变量破坏则直接终止（Abort）。

use thiserror::Error;

/// 迁移工作流运行过程中可能出现的错误
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum WorkflowError {
    /// 初始输入非法（路径不存在、枚举值非法），在任何迭代之前报告
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Unknown tool: {0}")]
    UnknownTool(String),

    #[error("Duplicate tool: {0}")]
    DuplicateTool(String),

    /// 工具自身执行失败（进程启动失败、超时、返回错误等）
    #[error("Tool {tool_name} failed: {cause}")]
    ToolExecution { tool_name: String, cause: String },

    /// 决策方输出无法解析为 Decision
    #[error("Malformed decision: {0}")]
    MalformedDecision(String),

    /// 决策方（LLM）调用本身失败
    #[error("Oracle error: {0}")]
    Oracle(String),

    #[error("Recipe extraction failed: {0}")]
    RecipeExtraction(String),

    #[error("Workflow is already terminal")]
    AlreadyTerminal,

    #[error("Recipe already set to {current}, refusing {attempted}")]
    RecipeAlreadySet { current: String, attempted: String },

    #[error("Config error: {0}")]
    Config(String),
}

impl WorkflowError {
    /// 可恢复错误：在循环边界捕获、写入历史，并在下一轮决策时作为上下文反馈
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            WorkflowError::ToolExecution { .. }
                | WorkflowError::MalformedDecision(_)
                | WorkflowError::Oracle(_)
                | WorkflowError::RecipeExtraction(_)
        )
    }

    /// 简短的错误类别名（写入 StepRecord 与审计日志）
    pub fn kind(&self) -> &'static str {
        match self {
            WorkflowError::Validation(_) => "validation",
            WorkflowError::UnknownTool(_) => "unknown_tool",
            WorkflowError::DuplicateTool(_) => "duplicate_tool",
            WorkflowError::ToolExecution { .. } => "tool_execution",
            WorkflowError::MalformedDecision(_) => "malformed_decision",
            WorkflowError::Oracle(_) => "oracle",
            WorkflowError::RecipeExtraction(_) => "recipe_extraction",
            WorkflowError::AlreadyTerminal => "already_terminal",
            WorkflowError::RecipeAlreadySet { .. } => "recipe_already_set",
            WorkflowError::Config(_) => "config",
        }
    }
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 将提示写入历史，让决策方在下一轮重试
    RetryWithPrompt(String),
    /// 终止当前工作流（致命错误）
    Abort,
}
