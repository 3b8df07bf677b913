//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `MIGRATOR__*` 覆盖（双下划线表示嵌套，如 `MIGRATOR__WORKFLOW__MAX_ITERATIONS=6`）。

use std::collections::BTreeMap;
use std::path::PathBuf;

use serde::Deserialize;

use crate::core::WorkflowError;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    #[serde(default)]
    pub llm: LlmSection,
    #[serde(default)]
    pub workflow: WorkflowSection,
    #[serde(default)]
    pub tools: ToolsSection,
}

/// [llm] 段：决策方后端
#[derive(Debug, Clone, Deserialize)]
pub struct LlmSection {
    /// 后端：openai（任意 OpenAI 兼容端点）/ mock（回放 mock_responses）
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default = "default_model")]
    pub model: String,
    pub base_url: Option<String>,
    /// 读取 API Key 的环境变量名
    #[serde(default = "default_api_key_env")]
    pub api_key_env: String,
    /// 单次决策请求超时（秒）
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
    /// mock 后端按顺序回放的回复
    #[serde(default)]
    pub mock_responses: Vec<String>,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: default_model(),
            base_url: None,
            api_key_env: default_api_key_env(),
            request_timeout_secs: default_request_timeout(),
            mock_responses: Vec::new(),
        }
    }
}

fn default_provider() -> String {
    "openai".to_string()
}

fn default_model() -> String {
    "gpt-4o-mini".to_string()
}

fn default_api_key_env() -> String {
    "OPENAI_API_KEY".to_string()
}

fn default_request_timeout() -> u64 {
    60
}

/// 工具自身报错时是否消耗一次迭代
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ToolErrorPolicy {
    /// 与普通失败步骤一样计入迭代上限
    #[default]
    ConsumeIteration,
    /// 不计迭代直接重新决策，最多 max_free_retries 次，之后按 ConsumeIteration 处理
    Retry,
}

/// [workflow] 段：迭代上限、错误策略与默认输入
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowSection {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,
    #[serde(default)]
    pub tool_error_policy: ToolErrorPolicy,
    #[serde(default = "default_max_free_retries")]
    pub max_free_retries: usize,
    /// 拼入 prompt 的最近历史条数
    #[serde(default = "default_history_window")]
    pub history_window: usize,
    pub project_path: Option<PathBuf>,
    pub migration_type: Option<String>,
    pub release_type: Option<String>,
}

impl Default for WorkflowSection {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            tool_error_policy: ToolErrorPolicy::default(),
            max_free_retries: default_max_free_retries(),
            history_window: default_history_window(),
            project_path: None,
            migration_type: None,
            release_type: None,
        }
    }
}

fn default_max_iterations() -> usize {
    4
}

fn default_max_free_retries() -> usize {
    2
}

fn default_history_window() -> usize {
    8
}

/// 外部命令输出解读方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum OutputMode {
    /// stdout 为 JSON 对象，原样作为工具结果
    Json,
    /// 按退出码生成 {success, message, output, error}
    #[default]
    Status,
}

/// [tools.commands.<toolId>]：一个外部命令工具
#[derive(Debug, Clone, Deserialize)]
pub struct CommandSpec {
    #[serde(default)]
    pub description: String,
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub output: OutputMode,
    /// 覆盖 [tools].timeout_secs
    pub timeout_secs: Option<u64>,
}

/// [tools] 段：工具超时与命令表
#[derive(Debug, Clone, Deserialize)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    #[serde(default = "default_tool_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default)]
    pub commands: BTreeMap<String, CommandSpec>,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout_secs(),
            commands: BTreeMap::new(),
        }
    }
}

fn default_tool_timeout_secs() -> u64 {
    600
}

impl AppConfig {
    /// 加载后的语义校验
    pub fn validate(&self) -> Result<(), WorkflowError> {
        if self.workflow.max_iterations == 0 {
            return Err(WorkflowError::Config(
                "workflow.max_iterations must be a positive integer".to_string(),
            ));
        }
        match self.llm.provider.as_str() {
            "openai" | "mock" => {}
            other => {
                return Err(WorkflowError::Config(format!(
                    "Unknown llm.provider: {other} (expected openai or mock)"
                )))
            }
        }
        Ok(())
    }
}

/// 从 config 目录加载配置，环境变量 MIGRATOR__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 MIGRATOR__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    let default_names = ["config/default", "../config/default", "default"];
    for name in default_names {
        let path = format!("{}.toml", name);
        if std::path::Path::new(&path).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        builder = builder.add_source(config::File::from(path.clone()).required(true));
    }

    builder = builder.add_source(
        config::Environment::with_prefix("MIGRATOR")
            .separator("__")
            .try_parsing(true),
    );

    let c = builder.build()?;
    c.try_deserialize()
}
