//! 工具注册表
//!
//! 所有工具实现 Tool trait（id / description / execute），由 ToolRegistry 按 ToolId 注册；
//! 字符串工具名只在 dispatch 与 catalog 边界出现，内部一律使用 ToolId。
//! dispatch 不吞错误：工具返回 Err 统一转为 WorkflowError::ToolExecution，并输出 JSON 审计日志。

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use serde_json::Value;

use crate::core::WorkflowError;

/// 工具标识：迁移流程涉及的全部外部能力
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum ToolId {
    AnalyzeProject,
    MigrationPlan,
    ModBuild,
    ModUpgrade,
    ModApplyUpgrade,
}

/// 工具类别：决定结果如何被解读（recipe 提取、终态信号等）
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ToolClass {
    Analysis,
    Planning,
    Build,
    Execution,
    Apply,
}

impl ToolId {
    pub const ALL: [ToolId; 5] = [
        ToolId::AnalyzeProject,
        ToolId::MigrationPlan,
        ToolId::ModBuild,
        ToolId::ModUpgrade,
        ToolId::ModApplyUpgrade,
    ];

    /// 对外名称（catalog 与决策协议中使用）
    pub fn as_str(&self) -> &'static str {
        match self {
            ToolId::AnalyzeProject => "analyzeProject",
            ToolId::MigrationPlan => "migrationPlan",
            ToolId::ModBuild => "modBuild",
            ToolId::ModUpgrade => "modUpgrade",
            ToolId::ModApplyUpgrade => "modApplyUpgrade",
        }
    }

    pub fn class(&self) -> ToolClass {
        match self {
            ToolId::AnalyzeProject => ToolClass::Analysis,
            ToolId::MigrationPlan => ToolClass::Planning,
            ToolId::ModBuild => ToolClass::Build,
            ToolId::ModUpgrade => ToolClass::Execution,
            ToolId::ModApplyUpgrade => ToolClass::Apply,
        }
    }

    /// 宽松匹配：忽略大小写、下划线与连字符（配置键、决策方输出的别名）
    pub fn from_loose(s: &str) -> Option<ToolId> {
        let normalized = normalize_name(s);
        ToolId::ALL
            .into_iter()
            .find(|id| normalize_name(id.as_str()) == normalized)
    }

    /// 执行前必须已知 recipe_id 的工具
    pub fn requires_recipe(&self) -> bool {
        matches!(self.class(), ToolClass::Execution)
    }
}

impl FromStr for ToolId {
    type Err = WorkflowError;

    /// 精确匹配（区分大小写）
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ToolId::ALL
            .into_iter()
            .find(|id| id.as_str() == s)
            .ok_or_else(|| WorkflowError::UnknownTool(s.to_string()))
    }
}

impl fmt::Display for ToolId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 工具 trait：标识、描述（供决策方理解）、参数 schema、异步执行（args 为 JSON）
#[async_trait]
pub trait Tool: Send + Sync {
    fn id(&self) -> ToolId;

    fn description(&self) -> &str;

    /// 参数 JSON Schema，默认空对象
    fn parameters_schema(&self) -> Value {
        serde_json::json!({
            "type": "object",
            "properties": {},
            "required": []
        })
    }

    /// 执行工具，返回原始 JSON 结果
    async fn execute(&self, args: Value) -> Result<Value, String>;
}

type Capability = dyn Fn(Value) -> Result<Value, String> + Send + Sync;

/// 由闭包构成的工具（嵌入方或测试直接绑定能力）
pub struct FnTool {
    id: ToolId,
    description: String,
    invoke: Box<Capability>,
}

impl FnTool {
    pub fn new<F>(id: ToolId, description: impl Into<String>, invoke: F) -> Self
    where
        F: Fn(Value) -> Result<Value, String> + Send + Sync + 'static,
    {
        Self {
            id,
            description: description.into(),
            invoke: Box::new(invoke),
        }
    }
}

#[async_trait]
impl Tool for FnTool {
    fn id(&self) -> ToolId {
        self.id
    }

    fn description(&self) -> &str {
        &self.description
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        (self.invoke)(args)
    }
}

/// catalog 条目：不暴露调用能力本身
#[derive(Debug, Clone, PartialEq)]
pub struct CatalogEntry<'a> {
    pub id: ToolId,
    pub name: &'static str,
    pub description: &'a str,
    pub parameters: Value,
}

/// 工具目录视图：每次 iter() 重新开始，惰性生成条目
#[derive(Clone, Copy)]
pub struct Catalog<'a> {
    tools: &'a BTreeMap<ToolId, Arc<dyn Tool>>,
}

impl<'a> Catalog<'a> {
    pub fn iter(&self) -> impl Iterator<Item = CatalogEntry<'a>> + 'a {
        let tools: &'a BTreeMap<ToolId, Arc<dyn Tool>> = self.tools;
        tools.iter().map(|(id, tool)| CatalogEntry {
            id: *id,
            name: id.as_str(),
            description: tool.description(),
            parameters: tool.parameters_schema(),
        })
    }

    pub fn contains(&self, id: ToolId) -> bool {
        self.tools.contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }
}

/// 工具注册表：按 ToolId 存储 Arc<dyn Tool>，纯路由，无额外副作用
#[derive(Default)]
pub struct ToolRegistry {
    tools: BTreeMap<ToolId, Arc<dyn Tool>>,
}

impl ToolRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool: impl Tool + 'static) -> Result<(), WorkflowError> {
        self.register_arc(Arc::new(tool))
    }

    pub fn register_arc(&mut self, tool: Arc<dyn Tool>) -> Result<(), WorkflowError> {
        let id = tool.id();
        if self.tools.contains_key(&id) {
            return Err(WorkflowError::DuplicateTool(id.as_str().to_string()));
        }
        self.tools.insert(id, tool);
        Ok(())
    }

    pub fn catalog(&self) -> Catalog<'_> {
        Catalog { tools: &self.tools }
    }

    pub fn tool_names(&self) -> Vec<&'static str> {
        self.tools.keys().map(|id| id.as_str()).collect()
    }

    /// 按名称分发；未注册的名称在调用任何能力之前就返回 UnknownTool
    pub async fn dispatch(&self, name: &str, args: Value) -> Result<Value, WorkflowError> {
        let id = name.parse::<ToolId>()?;
        self.dispatch_id(id, args).await
    }

    pub async fn dispatch_id(&self, id: ToolId, args: Value) -> Result<Value, WorkflowError> {
        let tool = self
            .tools
            .get(&id)
            .ok_or_else(|| WorkflowError::UnknownTool(id.as_str().to_string()))?;

        let start = Instant::now();
        let args_preview = args_preview(&args);
        let result = tool.execute(args).await;

        let audit = serde_json::json!({
            "event": "tool_audit",
            "tool": id.as_str(),
            "ok": result.is_ok(),
            "duration_ms": start.elapsed().as_millis() as u64,
            "args_preview": args_preview,
        });
        tracing::info!(audit = %audit.to_string(), "tool");

        result.map_err(|cause| WorkflowError::ToolExecution {
            tool_name: id.as_str().to_string(),
            cause,
        })
    }
}

pub(crate) fn normalize_name(s: &str) -> String {
    s.trim()
        .chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

fn args_preview(args: &Value) -> String {
    let s = args.to_string();
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s
    }
}
