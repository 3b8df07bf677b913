//! DecisionEngine：把工作流上下文与工具目录交给决策方，解析其回复为 Decision
//!
//! 决策方回复协议（每次只给一个）：
//! - `FUNCTION_CALL: toolName|param=value|...` 或 JSON `{"tool": "...", "args": {...}}`
//! - `FINAL_ANSWER: [message]` 或 JSON `{"final_answer": "...", "success": true}`
//!
//! 分析 → 计划 → 执行 只是写进 prompt 的建议顺序，决策方可在任意迭代请求任意已注册工具。

use std::sync::Arc;

use serde_json::{Map, Value};

use crate::core::{StepOrigin, WorkflowContext, WorkflowError};
use crate::llm::{LlmClient, Message};
use crate::tools::{final_answer_schema_json, tool_call_schema_json, Catalog, ToolClass, ToolId};

/// 决策方输出预览最大字符数
const RAW_PREVIEW_CHARS: usize = 120;
/// 历史结果预览最大字符数
const RESULT_PREVIEW_CHARS: usize = 300;

/// 决策：调用工具或给出最终回答
#[derive(Debug, Clone, PartialEq)]
pub enum Decision {
    CallTool { tool: ToolId, arguments: Value },
    FinalAnswer { message: String, success: bool },
}

/// 决策方常用的别名（旧版「批量」工具名）
const TOOL_ALIASES: &[(&str, ToolId)] = &[
    ("modbuildall", ToolId::ModBuild),
    ("modupgradeall", ToolId::ModUpgrade),
    ("modapplyupgradeall", ToolId::ModApplyUpgrade),
];

fn resolve_tool(name: &str, catalog: Catalog<'_>) -> Result<ToolId, WorkflowError> {
    let name = name.trim();
    if name.is_empty() {
        return Err(WorkflowError::MalformedDecision("missing tool name".to_string()));
    }
    let normalized = crate::tools::registry::normalize_name(name);
    let id = ToolId::from_loose(name).or_else(|| {
        TOOL_ALIASES
            .iter()
            .find(|(alias, _)| *alias == normalized)
            .map(|(_, id)| *id)
    });
    match id {
        Some(id) if catalog.contains(id) => Ok(id),
        _ => Err(WorkflowError::MalformedDecision(format!("unknown tool name: {name}"))),
    }
}

/// 表示失败的开头（只看开头，正文里顺带提到 fail 不算）
const FAILURE_PREFIXES: &[&str] = &["error", "fail", "migration failed", "migration cancelled", "unable to"];

/// 无显式 success 标记时按开头的状态词判断最终回答是否表示成功
fn answer_indicates_success(message: &str) -> bool {
    let lower = message.trim_start().to_lowercase();
    !FAILURE_PREFIXES.iter().any(|prefix| lower.starts_with(prefix))
}

fn strip_brackets(s: &str) -> String {
    let s = s.trim();
    s.strip_prefix('[')
        .and_then(|rest| rest.strip_suffix(']'))
        .unwrap_or(s)
        .trim()
        .to_string()
}

fn preview(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        format!("{}...", s.chars().take(max).collect::<String>())
    } else {
        s.to_string()
    }
}

fn parse_function_call(rest: &str, catalog: Catalog<'_>) -> Result<Decision, WorkflowError> {
    let mut parts = rest.split('|');
    let name = parts.next().unwrap_or("");
    let tool = resolve_tool(name, catalog)?;

    let mut arguments = Map::new();
    for part in parts {
        let part = part.trim();
        if part.is_empty() {
            continue;
        }
        match part.split_once('=') {
            Some((key, value)) if !key.trim().is_empty() => {
                arguments.insert(key.trim().to_string(), Value::String(value.trim().to_string()));
            }
            _ => {
                return Err(WorkflowError::MalformedDecision(format!(
                    "parameter `{part}` is not in key=value form"
                )))
            }
        }
    }
    Ok(Decision::CallTool {
        tool,
        arguments: Value::Object(arguments),
    })
}

fn parse_json_decision(json_str: &str, catalog: Catalog<'_>) -> Result<Decision, WorkflowError> {
    let value: Value = serde_json::from_str(json_str)
        .map_err(|e| WorkflowError::MalformedDecision(format!("{}: {}", e, preview(json_str, RAW_PREVIEW_CHARS))))?;

    if let Some(message) = value.get("final_answer").and_then(Value::as_str) {
        let message = strip_brackets(message);
        let success = value
            .get("success")
            .and_then(Value::as_bool)
            .unwrap_or_else(|| answer_indicates_success(&message));
        return Ok(Decision::FinalAnswer { message, success });
    }

    let name = value
        .get("tool")
        .and_then(Value::as_str)
        .ok_or_else(|| WorkflowError::MalformedDecision("missing tool name".to_string()))?;
    let tool = resolve_tool(name, catalog)?;
    let arguments = match value.get("args").or_else(|| value.get("arguments")) {
        None | Some(Value::Null) => Value::Object(Map::new()),
        Some(Value::Object(map)) => Value::Object(map.clone()),
        Some(_) => {
            return Err(WorkflowError::MalformedDecision(
                "tool arguments must be a JSON object".to_string(),
            ))
        }
    };
    Ok(Decision::CallTool { tool, arguments })
}

/// 解析决策方输出
pub fn parse_decision(output: &str, catalog: Catalog<'_>) -> Result<Decision, WorkflowError> {
    let trimmed = output.trim();
    if trimmed.is_empty() {
        return Err(WorkflowError::MalformedDecision("empty response".to_string()));
    }

    // 行协议：取第一条带标记的行（容忍前后多余文字与 Markdown 强调符）
    for line in trimmed.lines() {
        let line = line
            .trim()
            .trim_start_matches(['*', '`', '-', ' '])
            .trim_end_matches(['*', '`', ' ']);
        if let Some(rest) = line.strip_prefix("FUNCTION_CALL:") {
            return parse_function_call(rest, catalog);
        }
        if let Some(rest) = line.strip_prefix("FINAL_ANSWER:") {
            let message = strip_brackets(rest);
            let success = answer_indicates_success(&message);
            return Ok(Decision::FinalAnswer { message, success });
        }
    }

    // JSON：```json ... ``` 代码块或裸 JSON
    let json_str = if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        rest.find("```").map(|end| rest[..end].trim()).unwrap_or(rest.trim())
    } else if let (Some(start), Some(end)) = (trimmed.find('{'), trimmed.rfind('}')) {
        if start < end {
            &trimmed[start..=end]
        } else {
            trimmed
        }
    } else {
        return Err(WorkflowError::MalformedDecision(format!(
            "expected FUNCTION_CALL or FINAL_ANSWER, got: {}",
            preview(trimmed, RAW_PREVIEW_CHARS)
        )));
    };

    parse_json_decision(json_str, catalog)
}

fn class_label(class: ToolClass) -> &'static str {
    match class {
        ToolClass::Analysis => "analysis",
        ToolClass::Planning => "planning",
        ToolClass::Build => "build",
        ToolClass::Execution => "execution",
        ToolClass::Apply => "apply",
    }
}

/// DecisionEngine：持有决策方客户端与 prompt 参数；本身无状态
pub struct DecisionEngine {
    llm: Arc<dyn LlmClient>,
    history_window: usize,
}

impl DecisionEngine {
    pub fn new(llm: Arc<dyn LlmClient>) -> Self {
        Self {
            llm,
            history_window: 8,
        }
    }

    pub fn with_history_window(mut self, window: usize) -> Self {
        self.history_window = window.max(1);
        self
    }

    /// 获取决策方累计 token 使用统计
    pub fn token_usage(&self) -> (u64, u64, u64) {
        self.llm.token_usage()
    }

    /// (上下文, 工具目录) → Decision；决策方调用失败为 Oracle 错误，输出无法解析为 MalformedDecision
    pub async fn decide(&self, context: &WorkflowContext, catalog: Catalog<'_>) -> Result<Decision, WorkflowError> {
        let messages = vec![
            Message::system(self.system_prompt(context, catalog)),
            Message::user(self.query(context)),
        ];
        let output = self
            .llm
            .complete(&messages)
            .await
            .map_err(WorkflowError::Oracle)?;
        tracing::debug!(output = %output, "oracle output");
        parse_decision(&output, catalog)
    }

    pub fn system_prompt(&self, context: &WorkflowContext, catalog: Catalog<'_>) -> String {
        let tools = catalog
            .iter()
            .enumerate()
            .map(|(i, entry)| {
                let params = entry
                    .parameters
                    .get("properties")
                    .and_then(Value::as_object)
                    .map(|p| p.keys().cloned().collect::<Vec<_>>().join(", "))
                    .filter(|p| !p.is_empty())
                    .unwrap_or_else(|| "no parameters".to_string());
                format!(
                    "{}. {}({}) [{}] - {}",
                    i + 1,
                    entry.name,
                    params,
                    class_label(entry.id.class()),
                    entry.description
                )
            })
            .collect::<Vec<_>>()
            .join("\n");

        format!(
            "You are a {migration} migration assistant that drives project analysis, migration planning and recipe execution.

Current User Preferences:
- Project Path: {path}
- Migration Type: {migration}
- Release Type: {release}

Available tools:
{tools}

Suggested order: analysis, then planning (migrationPlan yields the recipe), then build and execution.
project_path and recipe_id are filled in automatically; you do not need to pass them.
You may call any available tool at any iteration.

You must respond with EXACTLY ONE line in one of these formats:
1. For function calls:
   FUNCTION_CALL: function_name|param1=value1|param2=value2|...
2. For final answers:
   FINAL_ANSWER: [your response]

JSON is also accepted. Tool call schema:
{call_schema}
Final answer schema:
{answer_schema}

A final answer that reports a failure must start with \"Error - \".

Example responses:
FUNCTION_CALL: analyzeProject
FUNCTION_CALL: migrationPlan
FUNCTION_CALL: modUpgrade
FINAL_ANSWER: [Migration completed successfully]
FINAL_ANSWER: [Error - no compatible recipe found]",
            path = context.project_path.display(),
            migration = context.migration_type,
            release = context.release_type,
            tools = tools,
            call_schema = tool_call_schema_json(),
            answer_schema = final_answer_schema_json(),
        )
    }

    /// 当前查询：首轮为分析请求，之后附带进度与最近历史
    pub fn query(&self, context: &WorkflowContext) -> String {
        if context.history.is_empty() {
            return format!("Analyze project at {}.", context.project_path.display());
        }

        let succeeded = context.succeeded_tools();
        let mut lines = vec![format!(
            "Completed tools: {}",
            if succeeded.is_empty() {
                "none".to_string()
            } else {
                succeeded.join(", ")
            }
        )];
        if let Some(recipe) = &context.recipe_id {
            lines.push(format!("Known recipe_id: {recipe}"));
        }
        lines.push("Previous steps:".to_string());

        let skip = context.history.len().saturating_sub(self.history_window);
        for (i, step) in context.history.iter().enumerate().skip(skip) {
            let status = if step.succeeded { "ok" } else { "failed" };
            let label = match step.origin {
                StepOrigin::Tool => format!("FUNCTION_CALL: {}", step.tool_name),
                StepOrigin::Decision => "decision".to_string(),
            };
            let mut line = format!(
                "{}. {} -> {}: {}",
                i + 1,
                label,
                status,
                preview(&step.result.to_string(), RESULT_PREVIEW_CHARS)
            );
            if let Some(err) = &step.error {
                line.push_str(&format!(" (error: {err})"));
            }
            lines.push(line);
        }
        lines.push("What should I do next to continue the migration process?".to_string());
        lines.join("\n")
    }
}
