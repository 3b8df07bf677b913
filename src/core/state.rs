//! 工作流状态：WorkflowContext 不可变快照与纯状态转换
//!
//! 每次迭代都由 advance / with_recipe / with_terminal 生成新的 WorkflowContext，
//! 从不原地修改；history 只追加，StepRecord 创建后不再编辑。

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::core::WorkflowError;

/// 迁移类型
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MigrationType {
    Java,
    Python,
}

impl MigrationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MigrationType::Java => "java",
            MigrationType::Python => "python",
        }
    }
}

impl FromStr for MigrationType {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "java" => Ok(MigrationType::Java),
            "python" => Ok(MigrationType::Python),
            other => Err(WorkflowError::Validation(format!(
                "Invalid migration type: {other} (expected java or python)"
            ))),
        }
    }
}

impl fmt::Display for MigrationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 发布类型：稳定版 / 候选版
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReleaseType {
    #[serde(rename = "stable")]
    Stable,
    #[serde(rename = "rc")]
    ReleaseCandidate,
}

impl ReleaseType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReleaseType::Stable => "stable",
            ReleaseType::ReleaseCandidate => "rc",
        }
    }
}

impl FromStr for ReleaseType {
    type Err = WorkflowError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stable" => Ok(ReleaseType::Stable),
            "rc" => Ok(ReleaseType::ReleaseCandidate),
            other => Err(WorkflowError::Validation(format!(
                "Invalid release type: {other} (expected stable or rc)"
            ))),
        }
    }
}

impl fmt::Display for ReleaseType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 步骤来源：真实的工具调用，或决策阶段（解析失败、缺少 recipe 等）产生的记录
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepOrigin {
    Tool,
    Decision,
}

/// 单步记录（只追加，创建后不再编辑）
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct StepRecord {
    pub tool_name: String,
    pub arguments: Value,
    pub result: Value,
    pub succeeded: bool,
    pub timestamp: DateTime<Utc>,
    pub origin: StepOrigin,
    /// 失败原因（工具错误、解析错误、recipe 提取失败等）
    pub error: Option<String>,
}

impl StepRecord {
    /// 一次已完成的工具调用
    pub fn tool(tool_name: impl Into<String>, arguments: Value, result: Value, succeeded: bool) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments,
            result,
            succeeded,
            timestamp: Utc::now(),
            origin: StepOrigin::Tool,
            error: None,
        }
    }

    /// 工具调用失败（工具自身报错）
    pub fn tool_failure(tool_name: impl Into<String>, arguments: Value, error: &WorkflowError, hint: &str) -> Self {
        Self {
            tool_name: tool_name.into(),
            arguments,
            result: serde_json::json!({ "error": error.to_string(), "hint": hint }),
            succeeded: false,
            timestamp: Utc::now(),
            origin: StepOrigin::Tool,
            error: Some(error.to_string()),
        }
    }

    /// 决策阶段失败：没有工具被调用，只记录错误与给决策方的提示
    pub fn decision_failure(label: impl Into<String>, error: &WorkflowError, hint: &str) -> Self {
        Self {
            tool_name: label.into(),
            arguments: Value::Null,
            result: serde_json::json!({ "error": error.to_string(), "hint": hint }),
            succeeded: false,
            timestamp: Utc::now(),
            origin: StepOrigin::Decision,
            error: Some(error.to_string()),
        }
    }

    /// 附加错误说明（工具返回成功但后续处理失败，如 recipe 提取）
    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.succeeded = false;
        self.error = Some(error.into());
        self
    }
}

/// 终态标记
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Terminal {
    pub success: bool,
    pub message: String,
}

/// 工作流上下文：不可变快照
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct WorkflowContext {
    pub run_id: Uuid,
    pub project_path: PathBuf,
    pub migration_type: MigrationType,
    pub release_type: ReleaseType,
    pub recipe_id: Option<String>,
    pub iteration: usize,
    pub history: Vec<StepRecord>,
    pub terminal: Option<Terminal>,
}

impl WorkflowContext {
    /// 由已归一化的输入创建初始上下文；路径必须是已存在的目录
    pub fn initial(
        project_path: impl AsRef<Path>,
        migration_type: &str,
        release_type: &str,
    ) -> Result<Self, WorkflowError> {
        let migration_type = migration_type.parse::<MigrationType>()?;
        let release_type = release_type.parse::<ReleaseType>()?;
        let raw = project_path.as_ref();
        if !raw.is_dir() {
            return Err(WorkflowError::Validation(format!(
                "Project path {} does not exist or is not a directory",
                raw.display()
            )));
        }
        let project_path = raw.canonicalize().map_err(|e| {
            WorkflowError::Validation(format!("Cannot resolve {}: {e}", raw.display()))
        })?;

        Ok(Self {
            run_id: Uuid::new_v4(),
            project_path,
            migration_type,
            release_type,
            recipe_id: None,
            iteration: 0,
            history: Vec::new(),
            terminal: None,
        })
    }

    /// 追加一步并推进迭代计数
    pub fn advance(&self, step: StepRecord) -> Self {
        let mut next = self.clone();
        next.history.push(step);
        next.iteration += 1;
        next
    }

    /// 追加一步但不推进迭代计数（仅用于「工具报错不计迭代」策略，次数由循环另行限制）
    pub fn record(&self, step: StepRecord) -> Self {
        let mut next = self.clone();
        next.history.push(step);
        next
    }

    /// 设置 recipe_id：只能设置一次，重复设置相同值幂等
    pub fn with_recipe(&self, recipe_id: impl Into<String>) -> Result<Self, WorkflowError> {
        let recipe_id = recipe_id.into();
        match &self.recipe_id {
            Some(current) if *current == recipe_id => Ok(self.clone()),
            Some(current) => Err(WorkflowError::RecipeAlreadySet {
                current: current.clone(),
                attempted: recipe_id,
            }),
            None => {
                let mut next = self.clone();
                next.recipe_id = Some(recipe_id);
                Ok(next)
            }
        }
    }

    pub fn with_terminal(&self, success: bool, message: impl Into<String>) -> Result<Self, WorkflowError> {
        if self.terminal.is_some() {
            return Err(WorkflowError::AlreadyTerminal);
        }
        let mut next = self.clone();
        next.terminal = Some(Terminal {
            success,
            message: message.into(),
        });
        Ok(next)
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal.is_some()
    }

    pub fn last_step(&self) -> Option<&StepRecord> {
        self.history.last()
    }

    /// 已成功执行过的工具名（去重，保持首次出现顺序），用于向决策方提示阶段进度
    pub fn succeeded_tools(&self) -> Vec<&str> {
        let mut names: Vec<&str> = Vec::new();
        for step in &self.history {
            if step.origin == StepOrigin::Tool
                && step.succeeded
                && !names.contains(&step.tool_name.as_str())
            {
                names.push(step.tool_name.as_str());
            }
        }
        names
    }
}
