//! 迁移编排主循环
//!
//! 决策 -> 分发工具 -> 折叠结果 -> 判断终态，直到出现终态信号或迭代次数用尽。
//! 每轮都从不可变的 WorkflowContext 派生下一份上下文；取消只在迭代边界检查。
//! 可选 event_tx：推送 StepUpdate / ToolCall / Observation / Finished 等过程事件。

use serde_json::{Map, Value};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::config::{ToolErrorPolicy, WorkflowSection};
use crate::core::{RecoveryAction, RecoveryEngine, StepOrigin, StepRecord, WorkflowContext, WorkflowError};
use crate::react::{Decision, DecisionEngine, RecipeExtractor, WorkflowEvent};
use crate::tools::{ToolClass, ToolId, ToolRegistry};

/// Observation 预览最大字符数
const OBSERVATION_PREVIEW_CHARS: usize = 200;

pub const SUCCESS_MESSAGE: &str = "Migration completed successfully. All upgrades were applied.";
pub const INCOMPLETE_MESSAGE: &str =
    "Migration incomplete: maximum iterations reached. Please review the migration progress.";

/// 决策方传入的 recipe 占位符，视为缺省
const RECIPE_PLACEHOLDER: &str = "[from_migration_plan]";

/// 迭代次数用尽时按最后一步分类
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExhaustedKind {
    /// 最后一步是成功的工具调用
    SoftSuccess,
    /// 最后一步是失败的工具调用
    SoftFailure,
    /// 最后一步不是工具调用（决策失败）或没有任何步骤
    Incomplete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkflowStatus {
    Running,
    Succeeded,
    Failed,
    Exhausted(ExhaustedKind),
}

impl WorkflowStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkflowStatus::Running => "running",
            WorkflowStatus::Succeeded => "succeeded",
            WorkflowStatus::Failed => "failed",
            WorkflowStatus::Exhausted(_) => "exhausted",
        }
    }
}

/// 一次运行的结果：终态、对外消息与最终上下文（含完整历史）
#[derive(Debug, Clone)]
pub struct WorkflowOutcome {
    pub status: WorkflowStatus,
    pub message: String,
    pub context: WorkflowContext,
}

impl WorkflowOutcome {
    /// 对外唯一的一行终态输出
    pub fn final_answer(&self) -> String {
        final_answer_line(&self.message)
    }

    pub fn is_success(&self) -> bool {
        self.status == WorkflowStatus::Succeeded
    }
}

/// 把任意文本压成单行：空白（含换行）连续出现时合并为一个空格
pub fn single_line(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `FINAL_ANSWER: [..]`，消息中的换行不会拆出第二行
pub fn final_answer_line(message: &str) -> String {
    format!("FINAL_ANSWER: [{}]", single_line(message))
}

/// 循环参数
#[derive(Debug, Clone)]
pub struct LoopConfig {
    pub max_iterations: usize,
    pub tool_error_policy: ToolErrorPolicy,
    /// Retry 策略下不计迭代的重试次数上限
    pub max_free_retries: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self::from(&WorkflowSection::default())
    }
}

impl From<&WorkflowSection> for LoopConfig {
    fn from(section: &WorkflowSection) -> Self {
        Self {
            max_iterations: section.max_iterations,
            tool_error_policy: section.tool_error_policy,
            max_free_retries: section.max_free_retries,
        }
    }
}

/// 工具结果中的终态信号
#[derive(Debug, Clone, PartialEq, Eq)]
enum CompletionSignal {
    Success,
    Failure(String),
}

/// 结果可能是包在文本里的 JSON
fn as_object(result: &Value) -> Option<Map<String, Value>> {
    match result {
        Value::Object(map) => Some(map.clone()),
        Value::String(s) => match serde_json::from_str::<Value>(s) {
            Ok(Value::Object(map)) => Some(map),
            _ => None,
        },
        _ => None,
    }
}

/// 只有执行类工具的结果会产生终态信号：
/// success=true 且（无 successful_upgrades 或其值 > 0）为成功；success=false 为失败；其余不产生信号
fn completion_signal(tool: ToolId, result: &Value) -> Option<CompletionSignal> {
    if tool.class() != ToolClass::Execution {
        return None;
    }
    let map = as_object(result)?;

    if let Some(status) = map.get("final_migration_status").and_then(Value::as_str) {
        match status.to_lowercase().as_str() {
            "success" | "succeeded" => return Some(CompletionSignal::Success),
            "failed" | "failure" => return Some(CompletionSignal::Failure(failure_reason(&map))),
            _ => {}
        }
    }

    match map.get("success").and_then(Value::as_bool)? {
        true => match map.get("successful_upgrades").and_then(Value::as_u64) {
            Some(0) => None,
            _ => Some(CompletionSignal::Success),
        },
        false => Some(CompletionSignal::Failure(failure_reason(&map))),
    }
}

/// 优先 message（已是摘要），其次 error 的第一行非空文本（error 可能是整段 stderr）
fn failure_reason(map: &Map<String, Value>) -> String {
    ["message", "error"]
        .iter()
        .filter_map(|key| map.get(*key).and_then(Value::as_str))
        .find_map(|s| s.lines().map(str::trim).find(|l| !l.is_empty()))
        .map(|s| s.trim_end_matches('.').to_string())
        .unwrap_or_else(|| "upgrade reported failure".to_string())
}

/// 工具正常返回但结果自报失败（success=false）
fn result_reports_failure(result: &Value) -> bool {
    as_object(result)
        .and_then(|m| m.get("success").and_then(Value::as_bool))
        .map(|ok| !ok)
        .unwrap_or(false)
}

fn failure_message(reason: &str) -> String {
    format!("Migration failed: {reason}. Please check the logs for details.")
}

fn classify_exhausted(context: &WorkflowContext) -> ExhaustedKind {
    match context.last_step() {
        Some(step) if step.origin == StepOrigin::Tool && step.succeeded => ExhaustedKind::SoftSuccess,
        Some(step) if step.origin == StepOrigin::Tool => ExhaustedKind::SoftFailure,
        _ => ExhaustedKind::Incomplete,
    }
}

fn exhausted_message(kind: ExhaustedKind, context: &WorkflowContext) -> String {
    let last = context.last_step();
    match (kind, last) {
        (ExhaustedKind::SoftSuccess, Some(step)) => format!(
            "Maximum iterations reached. Last step {} succeeded; please review the migration progress.",
            step.tool_name
        ),
        (ExhaustedKind::SoftFailure, Some(step)) => format!(
            "Maximum iterations reached. Last step {} failed: {}. Please review the migration progress.",
            step.tool_name,
            step.error.as_deref().unwrap_or("tool reported failure")
        ),
        _ => INCOMPLETE_MESSAGE.to_string(),
    }
}

fn preview(value: &Value) -> String {
    let s = match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    };
    if s.chars().count() > OBSERVATION_PREVIEW_CHARS {
        format!("{}...", s.chars().take(OBSERVATION_PREVIEW_CHARS).collect::<String>())
    } else {
        s
    }
}

fn send_event(tx: &Option<&tokio::sync::mpsc::UnboundedSender<WorkflowEvent>>, ev: WorkflowEvent) {
    if let Some(t) = tx {
        let _ = t.send(ev);
    }
}

/// 单轮结果：继续下一轮，或已到终态
enum Flow {
    Continue(WorkflowContext),
    Done(WorkflowOutcome),
}

/// 编排循环：借用决策引擎与注册表，可在多个并发运行间共享
pub struct OrchestrationLoop<'a> {
    engine: &'a DecisionEngine,
    registry: &'a ToolRegistry,
    cancel_token: CancellationToken,
    extractor: RecipeExtractor,
    recovery: RecoveryEngine,
    config: LoopConfig,
    event_tx: Option<&'a tokio::sync::mpsc::UnboundedSender<WorkflowEvent>>,
}

impl<'a> OrchestrationLoop<'a> {
    pub fn new(engine: &'a DecisionEngine, registry: &'a ToolRegistry, cancel_token: CancellationToken) -> Self {
        Self {
            engine,
            registry,
            cancel_token,
            extractor: RecipeExtractor::default(),
            recovery: RecoveryEngine::new(),
            config: LoopConfig::default(),
            event_tx: None,
        }
    }

    pub fn with_config(mut self, config: LoopConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_extractor(mut self, extractor: RecipeExtractor) -> Self {
        self.extractor = extractor;
        self
    }

    /// 设置事件推送通道
    pub fn with_event_tx(mut self, tx: &'a tokio::sync::mpsc::UnboundedSender<WorkflowEvent>) -> Self {
        self.event_tx = Some(tx);
        self
    }

    /// 运行到终态。可恢复错误写入历史后继续；致命错误（注册表误用、不变量破坏）以 Err 返回
    pub async fn run(&self, context: WorkflowContext) -> Result<WorkflowOutcome, WorkflowError> {
        if self.config.max_iterations == 0 {
            return Err(WorkflowError::Config("max_iterations must be positive".to_string()));
        }
        if context.is_terminal() {
            return Err(WorkflowError::AlreadyTerminal);
        }

        tracing::info!(
            run_id = %context.run_id,
            project = %context.project_path.display(),
            migration_type = %context.migration_type,
            release_type = %context.release_type,
            max_iterations = self.config.max_iterations,
            "workflow started"
        );

        let mut ctx = context;
        let mut free_retries = 0usize;
        loop {
            if self.cancel_token.is_cancelled() {
                let message = format!(
                    "Migration cancelled: cancellation requested after {} iteration(s).",
                    ctx.iteration
                );
                return self.finish(ctx, WorkflowStatus::Failed, message);
            }

            if ctx.iteration >= self.config.max_iterations {
                let kind = classify_exhausted(&ctx);
                let message = exhausted_message(kind, &ctx);
                return self.finish(ctx, WorkflowStatus::Exhausted(kind), message);
            }

            let span = tracing::info_span!("iteration", run_id = %ctx.run_id, iteration = ctx.iteration + 1);
            match self.iterate(ctx, &mut free_retries).instrument(span).await? {
                Flow::Continue(next) => ctx = next,
                Flow::Done(outcome) => return Ok(outcome),
            }
        }
    }

    async fn iterate(&self, ctx: WorkflowContext, free_retries: &mut usize) -> Result<Flow, WorkflowError> {
        send_event(
            &self.event_tx,
            WorkflowEvent::StepUpdate {
                iteration: ctx.iteration + 1,
                max_iterations: self.config.max_iterations,
            },
        );
        send_event(&self.event_tx, WorkflowEvent::Thinking);

        let decision = match self.engine.decide(&ctx, self.registry.catalog()).await {
            Ok(d) => d,
            Err(e) => return self.recover_decision(ctx, "decision", e),
        };

        match decision {
            Decision::FinalAnswer { message, success } => {
                send_event(
                    &self.event_tx,
                    WorkflowEvent::Decision {
                        summary: format!("FINAL_ANSWER: [{message}]"),
                    },
                );
                let status = if success {
                    WorkflowStatus::Succeeded
                } else {
                    WorkflowStatus::Failed
                };
                Ok(Flow::Done(self.finish(ctx, status, message)?))
            }
            Decision::CallTool { tool, arguments } => {
                send_event(
                    &self.event_tx,
                    WorkflowEvent::Decision {
                        summary: format!("FUNCTION_CALL: {tool}"),
                    },
                );
                let args = match self.prepare_arguments(&ctx, tool, arguments) {
                    Ok(args) => args,
                    Err(e) => return self.recover_decision(ctx, tool.as_str(), e),
                };
                send_event(
                    &self.event_tx,
                    WorkflowEvent::ToolCall {
                        tool: tool.as_str().to_string(),
                        args: args.clone(),
                    },
                );
                tracing::info!(tool = %tool, "dispatching tool");

                match self.registry.dispatch_id(tool, args.clone()).await {
                    Ok(result) => self.fold_result(ctx, tool, args, result),
                    Err(e) if e.is_recoverable() => Ok(self.handle_tool_error(ctx, tool, args, e, free_retries)),
                    Err(e) => Err(e),
                }
            }
        }
    }

    /// 补全运行级参数；需要 recipe 的工具一律使用上下文中已提取的 recipe_id
    fn prepare_arguments(&self, ctx: &WorkflowContext, tool: ToolId, arguments: Value) -> Result<Value, WorkflowError> {
        let mut map = match arguments {
            Value::Object(map) => map,
            Value::Null => Map::new(),
            other => {
                return Err(WorkflowError::MalformedDecision(format!(
                    "arguments for {tool} must be an object, got {other}"
                )))
            }
        };

        map.entry("project_path")
            .or_insert_with(|| Value::String(ctx.project_path.display().to_string()));
        map.entry("migration_type")
            .or_insert_with(|| Value::String(ctx.migration_type.to_string()));
        map.entry("release_type")
            .or_insert_with(|| Value::String(ctx.release_type.to_string()));

        if tool.requires_recipe() {
            let recipe = ctx.recipe_id.as_ref().ok_or_else(|| {
                WorkflowError::RecipeExtraction(format!("{tool} requires a recipe_id but none is known yet"))
            })?;
            match map.get("recipe_id").and_then(Value::as_str) {
                Some(given) if given != recipe && given != RECIPE_PLACEHOLDER && !given.is_empty() => {
                    tracing::warn!(given = %given, recipe_id = %recipe, "ignoring recipe_id from decision");
                }
                _ => {}
            }
            map.insert("recipe_id".to_string(), Value::String(recipe.clone()));
        }

        Ok(Value::Object(map))
    }

    fn fold_result(&self, ctx: WorkflowContext, tool: ToolId, args: Value, result: Value) -> Result<Flow, WorkflowError> {
        let signal = completion_signal(tool, &result);
        let succeeded = !result_reports_failure(&result);
        send_event(
            &self.event_tx,
            WorkflowEvent::Observation {
                tool: tool.as_str().to_string(),
                preview: preview(&result),
            },
        );

        let mut step = StepRecord::tool(tool.as_str(), args, result, succeeded);
        let mut extracted = None;
        if tool.class() == ToolClass::Planning {
            match self.extractor.extract(&step.result) {
                Ok(id) => extracted = Some(id),
                Err(e) => {
                    if let RecoveryAction::RetryWithPrompt(hint) = self.recovery.handle(&e) {
                        send_event(
                            &self.event_tx,
                            WorkflowEvent::Recovery {
                                action: "RetryWithPrompt".to_string(),
                                detail: hint.clone(),
                            },
                        );
                        step = step.with_error(format!("{e}. {hint}"));
                    } else {
                        step = step.with_error(e.to_string());
                    }
                    tracing::warn!(error = %e, "recipe extraction failed");
                }
            }
        }

        let mut next = ctx.advance(step);
        if let Some(id) = extracted {
            match next.recipe_id.clone() {
                Some(current) if current != id => {
                    tracing::warn!(current = %current, extracted = %id, "keeping first extracted recipe_id");
                }
                Some(_) => {}
                None => {
                    next = next.with_recipe(id.clone())?;
                    tracing::info!(recipe_id = %id, "recipe extracted");
                    send_event(&self.event_tx, WorkflowEvent::RecipeExtracted { recipe_id: id });
                }
            }
        }

        match signal {
            Some(CompletionSignal::Success) => Ok(Flow::Done(self.finish(
                next,
                WorkflowStatus::Succeeded,
                SUCCESS_MESSAGE.to_string(),
            )?)),
            Some(CompletionSignal::Failure(reason)) => Ok(Flow::Done(self.finish(
                next,
                WorkflowStatus::Failed,
                failure_message(&reason),
            )?)),
            None => Ok(Flow::Continue(next)),
        }
    }

    fn handle_tool_error(
        &self,
        ctx: WorkflowContext,
        tool: ToolId,
        args: Value,
        err: WorkflowError,
        free_retries: &mut usize,
    ) -> Flow {
        let hint = match self.recovery.handle(&err) {
            RecoveryAction::RetryWithPrompt(hint) => hint,
            RecoveryAction::Abort => String::new(),
        };
        tracing::warn!(tool = %tool, kind = err.kind(), error = %err, "tool failed");
        send_event(
            &self.event_tx,
            WorkflowEvent::ToolFailure {
                tool: tool.as_str().to_string(),
                reason: err.to_string(),
            },
        );
        let step = StepRecord::tool_failure(tool.as_str(), args, &err, &hint);

        if self.config.tool_error_policy == ToolErrorPolicy::Retry && *free_retries < self.config.max_free_retries {
            *free_retries += 1;
            send_event(
                &self.event_tx,
                WorkflowEvent::Recovery {
                    action: "Retry".to_string(),
                    detail: format!("free retry {}/{}", free_retries, self.config.max_free_retries),
                },
            );
            Flow::Continue(ctx.record(step))
        } else {
            Flow::Continue(ctx.advance(step))
        }
    }

    /// 决策阶段的错误：可恢复则记一步失败并把提示留给下一轮，否则终止
    fn recover_decision(&self, ctx: WorkflowContext, label: &str, err: WorkflowError) -> Result<Flow, WorkflowError> {
        match self.recovery.handle(&err) {
            RecoveryAction::RetryWithPrompt(hint) => {
                tracing::warn!(kind = err.kind(), error = %err, "decision failed, retrying");
                send_event(
                    &self.event_tx,
                    WorkflowEvent::Recovery {
                        action: "RetryWithPrompt".to_string(),
                        detail: hint.clone(),
                    },
                );
                Ok(Flow::Continue(ctx.advance(StepRecord::decision_failure(label, &err, &hint))))
            }
            RecoveryAction::Abort => {
                send_event(
                    &self.event_tx,
                    WorkflowEvent::Recovery {
                        action: "Abort".to_string(),
                        detail: err.to_string(),
                    },
                );
                Err(err)
            }
        }
    }

    fn finish(&self, ctx: WorkflowContext, status: WorkflowStatus, message: String) -> Result<WorkflowOutcome, WorkflowError> {
        let message = single_line(&message);
        let success = matches!(
            status,
            WorkflowStatus::Succeeded | WorkflowStatus::Exhausted(ExhaustedKind::SoftSuccess)
        );
        let context = ctx.with_terminal(success, message.clone())?;
        tracing::info!(
            run_id = %context.run_id,
            status = status.as_str(),
            iterations = context.iteration,
            steps = context.history.len(),
            "workflow finished"
        );
        send_event(
            &self.event_tx,
            WorkflowEvent::Finished {
                status: status.as_str().to_string(),
                message: message.clone(),
            },
        );
        Ok(WorkflowOutcome {
            status,
            message,
            context,
        })
    }
}
