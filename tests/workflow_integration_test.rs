//! 迁移工作流集成测试：脚本回放决策方 + 闭包/外部命令工具

use std::sync::{Arc, Mutex};

use serde_json::{json, Value};
use tokio_util::sync::CancellationToken;

use migrator::config::{CommandSpec, OutputMode, ToolErrorPolicy, ToolsSection};
use migrator::core::{StepOrigin, WorkflowContext, WorkflowError};
use migrator::llm::ScriptedLlmClient;
use migrator::react::{
    DecisionEngine, ExhaustedKind, LoopConfig, OrchestrationLoop, WorkflowEvent, WorkflowStatus,
};
use migrator::tools::{registry_from_config, FnTool, ToolId, ToolRegistry};

const PLAN: &str = r#"{
    "migration_plan": "Upgrade Spring Boot 2.7 to 3.4",
    "moderne_recipes": "Recipe available in Moderne",
    "moderne_recipe_command": "mod run . --recipe UpgradeSpringBoot_3_4"
}"#;

type Calls = Arc<Mutex<Vec<(ToolId, Value)>>>;

/// 五个工具都注册；modUpgrade 的返回值由参数决定
fn registry(upgrade_result: Value) -> (ToolRegistry, Calls) {
    let calls: Calls = Arc::new(Mutex::new(Vec::new()));
    let mut registry = ToolRegistry::new();

    let results = [
        (ToolId::AnalyzeProject, json!({"is_eligible_for_java_upgrade": true, "jdk_version": "11"})),
        (ToolId::MigrationPlan, serde_json::from_str::<Value>(PLAN).unwrap()),
        (ToolId::ModBuild, json!({"success": true, "output": "built"})),
        (ToolId::ModUpgrade, upgrade_result),
        (ToolId::ModApplyUpgrade, json!({"success": true})),
    ];
    for (id, result) in results {
        let calls = calls.clone();
        registry
            .register(FnTool::new(id, format!("{id} stub"), move |args| {
                calls.lock().unwrap().push((id, args));
                Ok(result.clone())
            }))
            .unwrap();
    }
    (registry, calls)
}

fn context() -> (tempfile::TempDir, WorkflowContext) {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("pom.xml"), "<project/>").unwrap();
    let ctx = WorkflowContext::initial(dir.path(), "java", "stable").unwrap();
    (dir, ctx)
}

fn engine<I, S>(replies: I) -> (DecisionEngine, Arc<ScriptedLlmClient>)
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    let llm = Arc::new(ScriptedLlmClient::new(replies));
    (DecisionEngine::new(llm.clone()), llm)
}

fn config(max_iterations: usize) -> LoopConfig {
    LoopConfig {
        max_iterations,
        ..LoopConfig::default()
    }
}

#[tokio::test]
async fn test_plan_then_upgrade_succeeds() {
    let (_dir, ctx) = context();
    let (registry, calls) = registry(json!({"success": true}));
    let (engine, _) = engine([
        "FUNCTION_CALL: analyzeProject",
        "FUNCTION_CALL: migrationPlan",
        "FUNCTION_CALL: modUpgrade|recipe_id=[from_migration_plan]",
    ]);

    let outcome = OrchestrationLoop::new(&engine, &registry, CancellationToken::new())
        .with_config(config(4))
        .run(ctx)
        .await
        .unwrap();

    assert_eq!(outcome.status, WorkflowStatus::Succeeded);
    assert_eq!(outcome.context.iteration, 3);
    assert_eq!(outcome.context.recipe_id.as_deref(), Some("UpgradeSpringBoot_3_4"));
    assert_eq!(
        outcome.final_answer(),
        "FINAL_ANSWER: [Migration completed successfully. All upgrades were applied.]"
    );

    let calls = calls.lock().unwrap();
    let order: Vec<ToolId> = calls.iter().map(|(id, _)| *id).collect();
    assert_eq!(order, vec![ToolId::AnalyzeProject, ToolId::MigrationPlan, ToolId::ModUpgrade]);
    let upgrade_args = &calls[2].1;
    assert_eq!(upgrade_args["recipe_id"], "UpgradeSpringBoot_3_4");
    assert_eq!(upgrade_args["release_type"], "stable");
    assert!(upgrade_args["project_path"].as_str().unwrap().ends_with(
        outcome.context.project_path.file_name().unwrap().to_str().unwrap()
    ));
}

#[tokio::test]
async fn test_upgrade_failure_stops_loop() {
    let (_dir, ctx) = context();
    let (registry, calls) = registry(json!({"success": false, "error": "Recipe failed"}));
    let (engine, llm) = engine([
        "FUNCTION_CALL: analyzeProject",
        "FUNCTION_CALL: migrationPlan",
        "FUNCTION_CALL: modUpgrade",
        "FUNCTION_CALL: modApplyUpgrade",
    ]);

    let outcome = OrchestrationLoop::new(&engine, &registry, CancellationToken::new())
        .with_config(config(6))
        .run(ctx)
        .await
        .unwrap();

    assert_eq!(outcome.status, WorkflowStatus::Failed);
    assert_eq!(outcome.context.iteration, 3);
    assert_eq!(
        outcome.final_answer(),
        "FINAL_ANSWER: [Migration failed: Recipe failed. Please check the logs for details.]"
    );
    assert_eq!(llm.call_count(), 3);
    assert_eq!(calls.lock().unwrap().len(), 3);
}

#[tokio::test]
async fn test_unparseable_oracle_exhausts_as_incomplete() {
    let (_dir, ctx) = context();
    let (registry, calls) = registry(json!({"success": true}));
    let (engine, llm) = engine(["I would like to think about this some more."]);

    let outcome = OrchestrationLoop::new(&engine, &registry, CancellationToken::new())
        .with_config(config(4))
        .run(ctx)
        .await
        .unwrap();

    assert_eq!(outcome.status, WorkflowStatus::Exhausted(ExhaustedKind::Incomplete));
    assert_eq!(
        outcome.final_answer(),
        "FINAL_ANSWER: [Migration incomplete: maximum iterations reached. Please review the migration progress.]"
    );
    assert_eq!(outcome.context.history.len(), 4);
    assert!(outcome
        .context
        .history
        .iter()
        .all(|s| s.origin == StepOrigin::Decision && !s.succeeded));
    assert_eq!(llm.call_count(), 4);
    assert!(calls.lock().unwrap().is_empty());

    // 之后的决策请求带上了解析失败的提示
    let last = llm.last_request().unwrap();
    assert!(last[1].content.contains("Malformed decision"));
}

#[tokio::test]
async fn test_iteration_bound_holds() {
    let (_dir, ctx) = context();
    let (registry, calls) = registry(json!({"success": true}));
    let (engine, llm) = engine(["FUNCTION_CALL: analyzeProject"]);

    let outcome = OrchestrationLoop::new(&engine, &registry, CancellationToken::new())
        .with_config(config(3))
        .run(ctx)
        .await
        .unwrap();

    assert_eq!(outcome.status, WorkflowStatus::Exhausted(ExhaustedKind::SoftSuccess));
    assert_eq!(outcome.context.iteration, 3);
    assert_eq!(llm.call_count(), 3);
    assert_eq!(calls.lock().unwrap().len(), 3);
    assert!(outcome.context.terminal.is_some());
}

#[tokio::test]
async fn test_immediate_final_answer() {
    let (_dir, ctx) = context();
    let (registry, calls) = registry(json!({"success": true}));
    let (engine, _) = engine(["FINAL_ANSWER: [Project is already on Java 21]"]);

    let outcome = OrchestrationLoop::new(&engine, &registry, CancellationToken::new())
        .run(ctx)
        .await
        .unwrap();

    assert_eq!(outcome.status, WorkflowStatus::Succeeded);
    assert_eq!(outcome.context.iteration, 0);
    assert_eq!(outcome.final_answer(), "FINAL_ANSWER: [Project is already on Java 21]");
    assert!(calls.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_cancelled_before_first_iteration() {
    let (_dir, ctx) = context();
    let (registry, _) = registry(json!({"success": true}));
    let (engine, llm) = engine(["FUNCTION_CALL: analyzeProject"]);
    let token = CancellationToken::new();
    token.cancel();

    let outcome = OrchestrationLoop::new(&engine, &registry, token)
        .run(ctx)
        .await
        .unwrap();

    assert_eq!(outcome.status, WorkflowStatus::Failed);
    assert!(outcome.message.starts_with("Migration cancelled"));
    assert_eq!(llm.call_count(), 0);
}

#[tokio::test]
async fn test_cancelled_by_tool_stops_at_next_boundary() {
    let (_dir, ctx) = context();
    let token = CancellationToken::new();
    let tool_token = token.clone();
    let mut registry = ToolRegistry::new();
    registry
        .register(FnTool::new(ToolId::AnalyzeProject, "analyze", move |_| {
            tool_token.cancel();
            Ok(json!({"jdk_version": "11"}))
        }))
        .unwrap();
    registry
        .register(FnTool::new(ToolId::MigrationPlan, "plan", |_| {
            panic!("migrationPlan must not run after cancellation")
        }))
        .unwrap();
    let (engine, llm) = engine(["FUNCTION_CALL: analyzeProject", "FUNCTION_CALL: migrationPlan"]);

    let outcome = OrchestrationLoop::new(&engine, &registry, token)
        .with_config(config(4))
        .run(ctx)
        .await
        .unwrap();

    assert_eq!(outcome.status, WorkflowStatus::Failed);
    assert!(outcome.message.starts_with("Migration cancelled"));
    assert_eq!(outcome.context.iteration, 1);
    assert_eq!(outcome.context.history.len(), 1);
    assert!(outcome.context.history[0].succeeded);
    assert_eq!(llm.call_count(), 1);
}

#[tokio::test]
async fn test_execution_without_recipe_is_rejected() {
    let (_dir, ctx) = context();
    let (registry, calls) = registry(json!({"success": true}));
    let (engine, llm) = engine([
        "FUNCTION_CALL: modUpgrade",
        "FINAL_ANSWER: [Error - no recipe could be determined]",
    ]);

    let outcome = OrchestrationLoop::new(&engine, &registry, CancellationToken::new())
        .run(ctx)
        .await
        .unwrap();

    assert_eq!(outcome.status, WorkflowStatus::Failed);
    assert_eq!(outcome.context.iteration, 1);
    let step = &outcome.context.history[0];
    assert_eq!(step.origin, StepOrigin::Decision);
    assert!(step.error.as_deref().unwrap().contains("recipe_id"));
    assert!(calls.lock().unwrap().is_empty());
    assert!(llm.last_request().unwrap()[1].content.contains("migrationPlan"));
}

#[tokio::test]
async fn test_zero_upgrades_is_not_terminal() {
    let (_dir, ctx) = context();
    let (registry, _) = registry(json!({"success": true, "successful_upgrades": 0}));
    let (engine, _) = engine([
        "FUNCTION_CALL: migrationPlan",
        "FUNCTION_CALL: modUpgrade",
        "FINAL_ANSWER: [No changes were needed]",
    ]);

    let outcome = OrchestrationLoop::new(&engine, &registry, CancellationToken::new())
        .run(ctx)
        .await
        .unwrap();

    assert_eq!(outcome.status, WorkflowStatus::Succeeded);
    assert_eq!(outcome.context.iteration, 2);
    assert_eq!(outcome.message, "No changes were needed");
}

#[tokio::test]
async fn test_tool_error_policies() {
    let failing = || {
        let mut registry = ToolRegistry::new();
        registry
            .register(FnTool::new(ToolId::ModBuild, "build", |_| Err("moderne jar not found".into())))
            .unwrap();
        registry
    };

    // 默认：工具报错计入迭代
    let (_dir, ctx) = context();
    let registry = failing();
    let (engine, _) = engine(["FUNCTION_CALL: modBuild"]);
    let outcome = OrchestrationLoop::new(&engine, &registry, CancellationToken::new())
        .with_config(config(2))
        .run(ctx)
        .await
        .unwrap();
    assert_eq!(outcome.status, WorkflowStatus::Exhausted(ExhaustedKind::SoftFailure));
    assert_eq!(outcome.context.history.len(), 2);
    assert!(outcome.message.contains("moderne jar not found"));

    // Retry：前两次不计迭代
    let (_dir, ctx) = context();
    let registry = failing();
    let (engine, llm) = crate::engine(["FUNCTION_CALL: modBuild"]);
    let outcome = OrchestrationLoop::new(&engine, &registry, CancellationToken::new())
        .with_config(LoopConfig {
            max_iterations: 2,
            tool_error_policy: ToolErrorPolicy::Retry,
            max_free_retries: 2,
        })
        .run(ctx)
        .await
        .unwrap();
    assert_eq!(outcome.status, WorkflowStatus::Exhausted(ExhaustedKind::SoftFailure));
    assert_eq!(outcome.context.iteration, 2);
    assert_eq!(outcome.context.history.len(), 4);
    assert_eq!(llm.call_count(), 4);
}

#[tokio::test]
async fn test_second_plan_keeps_first_recipe() {
    let (_dir, ctx) = context();
    let mut registry = ToolRegistry::new();
    let plans = Arc::new(Mutex::new(vec![
        json!({"recipe_id": "UpgradeToJava17"}),
        json!({"recipe_id": "UpgradeToJava21"}),
    ]));
    registry
        .register(FnTool::new(ToolId::MigrationPlan, "plan", move |_| {
            Ok(plans.lock().unwrap().remove(0))
        }))
        .unwrap();
    let (engine, _) = engine(["FUNCTION_CALL: migrationPlan"]);

    let outcome = OrchestrationLoop::new(&engine, &registry, CancellationToken::new())
        .with_config(config(2))
        .run(ctx)
        .await
        .unwrap();
    assert_eq!(outcome.context.recipe_id.as_deref(), Some("UpgradeToJava17"));
    assert_eq!(outcome.status, WorkflowStatus::Exhausted(ExhaustedKind::SoftSuccess));
}

#[tokio::test]
async fn test_plan_without_recipe_marks_step_failed() {
    let (_dir, ctx) = context();
    let mut registry = ToolRegistry::new();
    registry
        .register(FnTool::new(ToolId::MigrationPlan, "plan", |_| {
            Ok(json!({"migration_plan": "No compatible recipe"}))
        }))
        .unwrap();
    let (engine, _) = engine(["FUNCTION_CALL: migrationPlan"]);

    let outcome = OrchestrationLoop::new(&engine, &registry, CancellationToken::new())
        .with_config(config(1))
        .run(ctx)
        .await
        .unwrap();
    assert_eq!(outcome.status, WorkflowStatus::Exhausted(ExhaustedKind::SoftFailure));
    assert!(outcome.context.recipe_id.is_none());
    let step = &outcome.context.history[0];
    assert_eq!(step.origin, StepOrigin::Tool);
    assert!(!step.succeeded);
    assert!(step.error.as_deref().unwrap().contains("Recipe extraction failed"));
}

#[tokio::test]
async fn test_events_stream() {
    let (_dir, ctx) = context();
    let (registry, _) = registry(json!({"success": true}));
    let (engine, _) = engine(["FUNCTION_CALL: migrationPlan", "FUNCTION_CALL: modUpgrade"]);
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();

    let outcome = OrchestrationLoop::new(&engine, &registry, CancellationToken::new())
        .with_event_tx(&tx)
        .run(ctx)
        .await
        .unwrap();
    drop(tx);
    assert!(outcome.is_success());

    let mut events = Vec::new();
    while let Some(ev) = rx.recv().await {
        events.push(ev);
    }
    assert!(events.iter().any(|e| matches!(
        e,
        WorkflowEvent::RecipeExtracted { recipe_id } if recipe_id == "UpgradeSpringBoot_3_4"
    )));
    assert!(matches!(
        events.last(),
        Some(WorkflowEvent::Finished { status, .. }) if status == "succeeded"
    ));
}

#[tokio::test]
async fn test_registry_misuse_is_fatal() {
    let mut registry = ToolRegistry::new();
    registry
        .register(FnTool::new(ToolId::ModBuild, "build", Ok))
        .unwrap();
    let err = registry
        .register(FnTool::new(ToolId::ModBuild, "build again", Ok))
        .unwrap_err();
    assert_eq!(err, WorkflowError::DuplicateTool("modBuild".into()));

    let (_dir, ctx) = context();
    let (engine, _) = engine(["FINAL_ANSWER: [done]"]);
    let done = ctx.with_terminal(true, "done").unwrap();
    let err = OrchestrationLoop::new(&engine, &registry, CancellationToken::new())
        .run(done)
        .await
        .unwrap_err();
    assert_eq!(err, WorkflowError::AlreadyTerminal);
}

#[cfg(unix)]
#[tokio::test]
async fn test_command_tools_end_to_end() {
    let command = |args: &[&str], output: OutputMode| CommandSpec {
        description: "shell stub".into(),
        program: "sh".into(),
        args: args.iter().map(|s| s.to_string()).collect(),
        output,
        timeout_secs: Some(10),
    };
    let mut tools = ToolsSection::default();
    tools.commands.insert(
        "analyzeProject".into(),
        command(&["-c", r#"echo '{"jdk_version": "11"}'"#], OutputMode::Json),
    );
    tools.commands.insert(
        "migrationPlan".into(),
        command(
            &["-c", r#"echo '{"moderne_recipe_command": "mod run . --recipe UpgradeToJava21"}'"#],
            OutputMode::Json,
        ),
    );
    tools.commands.insert(
        "modUpgrade".into(),
        command(&["-c", "echo \"ran $0 on $1\"", "{recipe_id}", "{project_path}"], OutputMode::Status),
    );
    let registry = registry_from_config(&tools).unwrap();
    assert_eq!(registry.tool_names(), vec!["analyzeProject", "migrationPlan", "modUpgrade"]);

    let (_dir, ctx) = context();
    let (engine, _) = engine([
        "FUNCTION_CALL: analyzeProject",
        "FUNCTION_CALL: migrationPlan",
        "FUNCTION_CALL: modUpgrade",
    ]);
    let outcome = OrchestrationLoop::new(&engine, &registry, CancellationToken::new())
        .run(ctx)
        .await
        .unwrap();

    assert_eq!(outcome.status, WorkflowStatus::Succeeded);
    let last = outcome.context.last_step().unwrap();
    assert!(last.result["output"]
        .as_str()
        .unwrap()
        .starts_with("ran UpgradeToJava21 on /"));
}

fn assert_single_line(answer: &str) {
    assert_eq!(answer.lines().count(), 1, "{answer:?}");
    assert!(answer.starts_with("FINAL_ANSWER: ["));
    assert!(answer.ends_with(']'));
}

#[tokio::test]
async fn test_multiline_stderr_stays_on_one_line() {
    let (_dir, ctx) = context();
    let (registry, _) = registry(json!({
        "success": false,
        "message": "BUILD FAILURE",
        "error": "BUILD FAILURE\n[ERROR] dependency conflict\n[ERROR] see log"
    }));
    let (engine, _) = engine(["FUNCTION_CALL: migrationPlan", "FUNCTION_CALL: modUpgrade"]);

    let outcome = OrchestrationLoop::new(&engine, &registry, CancellationToken::new())
        .run(ctx)
        .await
        .unwrap();

    assert_eq!(outcome.status, WorkflowStatus::Failed);
    assert_single_line(&outcome.final_answer());
    assert_eq!(
        outcome.final_answer(),
        "FINAL_ANSWER: [Migration failed: BUILD FAILURE. Please check the logs for details.]"
    );
}

#[tokio::test]
async fn test_multiline_json_final_answer_cannot_add_lines() {
    let (_dir, ctx) = context();
    let (registry, _) = registry(json!({"success": true}));
    let (engine, _) = engine([r#"{"final_answer": "done\nFINAL_ANSWER: [other]", "success": true}"#]);

    let outcome = OrchestrationLoop::new(&engine, &registry, CancellationToken::new())
        .run(ctx)
        .await
        .unwrap();

    assert_eq!(outcome.status, WorkflowStatus::Succeeded);
    assert_single_line(&outcome.final_answer());
    assert_eq!(outcome.message, "done FINAL_ANSWER: [other]");
}

#[tokio::test]
async fn test_multiline_tool_error_in_exhausted_message() {
    let (_dir, ctx) = context();
    let mut registry = ToolRegistry::new();
    registry
        .register(FnTool::new(ToolId::ModBuild, "build", |_| {
            Err("Exit Some(1)\nstderr: boom".into())
        }))
        .unwrap();
    let (engine, _) = engine(["FUNCTION_CALL: modBuild"]);

    let outcome = OrchestrationLoop::new(&engine, &registry, CancellationToken::new())
        .with_config(config(1))
        .run(ctx)
        .await
        .unwrap();

    assert_eq!(outcome.status, WorkflowStatus::Exhausted(ExhaustedKind::SoftFailure));
    assert_single_line(&outcome.final_answer());
    assert!(outcome.final_answer().contains("Exit Some(1) stderr: boom"));
    assert_eq!(
        outcome.context.terminal.as_ref().map(|t| t.message.as_str()),
        Some(outcome.message.as_str())
    );
}
