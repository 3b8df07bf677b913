//! 错误恢复引擎
//!
//! 根据 WorkflowError 类型返回 RecoveryAction：可恢复错误给出写回历史的重试提示，其余终止。

use crate::core::{RecoveryAction, WorkflowError};

/// 语义化错误恢复：将错误映射为可执行动作（重试提示 / 终止）
#[derive(Debug, Default)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &WorkflowError) -> RecoveryAction {
        match err {
            WorkflowError::MalformedDecision(raw) => RecoveryAction::RetryWithPrompt(format!(
                "Your previous reply could not be parsed ({raw}). \
                Respond with EXACTLY ONE line: either \
                FUNCTION_CALL: toolName|param=value or FINAL_ANSWER: [message]. \
                Use only tool names from the available tools list."
            )),
            WorkflowError::Oracle(_) => RecoveryAction::RetryWithPrompt(
                "The previous planning request failed. Decide the next step again.".to_string(),
            ),
            WorkflowError::RecipeExtraction(_) => RecoveryAction::RetryWithPrompt(
                "No recipe_id could be derived from the migration plan. \
                Call migrationPlan again before running the upgrade."
                    .to_string(),
            ),
            WorkflowError::ToolExecution { tool_name, .. } => RecoveryAction::RetryWithPrompt(format!(
                "Tool {tool_name} failed. Retry it or choose a different action."
            )),
            _ => RecoveryAction::Abort,
        }
    }
}
