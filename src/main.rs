//! Migrator 命令行入口
//!
//! 加载配置、校验输入、注册外部命令工具并运行迁移循环；stdout 只输出一行 FINAL_ANSWER。
//!
//! Usage:
//!   migrator --project-path ./demo --migration-type java --release-type stable
//!   migrator --project-path ./demo --config migrator.toml -vv

use std::path::PathBuf;

use anyhow::Context;
use clap::{ArgAction, Parser};
use tokio_util::sync::CancellationToken;

use migrator::config::{load_config, AppConfig};
use migrator::core::{WorkflowContext, WorkflowError};
use migrator::llm::create_client;
use migrator::react::{final_answer_line, DecisionEngine, LoopConfig, OrchestrationLoop, WorkflowEvent, WorkflowStatus};
use migrator::tools::registry_from_config;

#[derive(Parser)]
#[command(name = "migrator")]
#[command(about = "Bounded-iteration migration orchestrator")]
struct Cli {
    /// Project directory to migrate
    #[arg(long, env = "MIGRATOR_PROJECT_PATH")]
    project_path: Option<PathBuf>,

    /// Migration type (java | python)
    #[arg(long, env = "MIGRATOR_MIGRATION_TYPE")]
    migration_type: Option<String>,

    /// Release type (stable | rc)
    #[arg(long, env = "MIGRATOR_RELEASE_TYPE")]
    release_type: Option<String>,

    /// Override workflow.max_iterations
    #[arg(long)]
    max_iterations: Option<usize>,

    /// Extra TOML config file layered over config/default.toml
    #[arg(long, short)]
    config: Option<PathBuf>,

    /// Print workflow events to stderr; repeat for debug (-vv) and trace (-vvv) logs
    #[arg(short, long, action = ArgAction::Count)]
    verbose: u8,
}

/// 命令行参数优先，其次配置文件，最后默认值
fn resolve_context(cli: &Cli, config: &AppConfig) -> Result<WorkflowContext, WorkflowError> {
    let project_path = cli
        .project_path
        .clone()
        .or_else(|| config.workflow.project_path.clone())
        .ok_or_else(|| WorkflowError::Validation("--project-path is required".to_string()))?;
    let migration_type = cli
        .migration_type
        .clone()
        .or_else(|| config.workflow.migration_type.clone())
        .unwrap_or_else(|| "java".to_string());
    let release_type = cli
        .release_type
        .clone()
        .or_else(|| config.workflow.release_type.clone())
        .unwrap_or_else(|| "stable".to_string());
    WorkflowContext::initial(project_path, &migration_type, &release_type)
}

async fn run(cli: Cli) -> anyhow::Result<WorkflowStatus> {
    let mut config = load_config(cli.config.clone()).context("Failed to load config")?;
    if let Some(max) = cli.max_iterations {
        config.workflow.max_iterations = max;
    }
    config.validate()?;

    let context = resolve_context(&cli, &config)?;
    let registry = registry_from_config(&config.tools)?;
    if registry.catalog().is_empty() {
        tracing::warn!("no tools configured under [tools.commands]");
    }
    let llm = create_client(&config.llm)?;
    let engine = DecisionEngine::new(llm).with_history_window(config.workflow.history_window);

    // Ctrl+C：在下一个迭代边界停止
    let cancel_token = CancellationToken::new();
    let ctrl_c_token = cancel_token.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("cancellation requested");
            ctrl_c_token.cancel();
        }
    });

    let (event_tx, mut event_rx) = tokio::sync::mpsc::unbounded_channel::<WorkflowEvent>();
    let verbose = cli.verbose > 0;
    let printer = tokio::spawn(async move {
        while let Some(ev) = event_rx.recv().await {
            if verbose {
                if let Ok(line) = serde_json::to_string(&ev) {
                    eprintln!("{line}");
                }
            }
        }
    });

    let outcome = OrchestrationLoop::new(&engine, &registry, cancel_token)
        .with_config(LoopConfig::from(&config.workflow))
        .with_event_tx(&event_tx)
        .run(context)
        .await;
    drop(event_tx);
    let _ = printer.await;
    let outcome = outcome?;

    let (prompt, completion, total) = engine.token_usage();
    tracing::info!(prompt, completion, total, "token usage");

    println!("{}", outcome.final_answer());
    Ok(outcome.status)
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    migrator::observability::init(cli.verbose);

    let code = match run(cli).await {
        Ok(WorkflowStatus::Succeeded) => 0,
        Ok(WorkflowStatus::Exhausted(_)) => 2,
        Ok(_) => 1,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "migration aborted");
            println!("{}", final_answer_line(&format!("Error - {e}")));
            1
        }
    };
    std::process::exit(code);
}
