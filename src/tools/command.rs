//! 外部命令工具：把 Maven 分析器、Moderne CLI 等外部进程包装成 Tool
//!
//! 参数模板中的 `{name}` 占位符由调用参数替换（如 `{project_path}`、`{recipe_id}`）；
//! 直接以 argv 方式启动进程（不经过 shell），带超时与 tracing 审计。
//! 输出模式：json 解析 stdout 为 JSON；status 按退出码生成 `{success, message, output, error}`。

use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde_json::Value;
use tokio::process::Command;

use crate::config::{CommandSpec, OutputMode};
use crate::tools::{Tool, ToolId};

/// 外部命令工具
pub struct CommandTool {
    id: ToolId,
    spec: CommandSpec,
    timeout_secs: u64,
    placeholder: Regex,
}

impl CommandTool {
    pub fn new(id: ToolId, spec: CommandSpec, default_timeout_secs: u64) -> Self {
        let timeout_secs = spec.timeout_secs.unwrap_or(default_timeout_secs);
        Self {
            id,
            spec,
            timeout_secs,
            placeholder: Regex::new(r"\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("static placeholder regex"),
        }
    }

    /// 模板中出现的占位符名（去重，保持顺序）
    fn placeholders(&self) -> Vec<String> {
        let mut names = Vec::new();
        for template in std::iter::once(&self.spec.program).chain(self.spec.args.iter()) {
            for cap in self.placeholder.captures_iter(template) {
                let name = cap[1].to_string();
                if !names.contains(&name) {
                    names.push(name);
                }
            }
        }
        names
    }

    fn render(&self, template: &str, args: &Value) -> Result<String, String> {
        let mut missing = None;
        let rendered = self.placeholder.replace_all(template, |cap: &regex::Captures| {
            match args.get(&cap[1]) {
                Some(Value::String(s)) => s.clone(),
                Some(Value::Null) | None => {
                    missing.get_or_insert_with(|| cap[1].to_string());
                    String::new()
                }
                Some(other) => other.to_string(),
            }
        });
        match missing {
            Some(name) => Err(format!("Missing argument: {name}")),
            None => Ok(rendered.into_owned()),
        }
    }
}

#[async_trait]
impl Tool for CommandTool {
    fn id(&self) -> ToolId {
        self.id
    }

    fn description(&self) -> &str {
        &self.spec.description
    }

    fn parameters_schema(&self) -> Value {
        let names = self.placeholders();
        let properties: serde_json::Map<String, Value> = names
            .iter()
            .map(|n| (n.clone(), serde_json::json!({ "type": "string" })))
            .collect();
        serde_json::json!({
            "type": "object",
            "properties": properties,
            "required": names
        })
    }

    async fn execute(&self, args: Value) -> Result<Value, String> {
        let program = self.render(&self.spec.program, &args)?;
        let argv = self
            .spec
            .args
            .iter()
            .map(|a| self.render(a, &args))
            .collect::<Result<Vec<_>, _>>()?;

        tracing::info!(tool = %self.id, program = %program, args = ?argv, "command tool execute");

        let mut cmd = Command::new(&program);
        cmd.args(&argv).kill_on_drop(true);

        let output = tokio::time::timeout(Duration::from_secs(self.timeout_secs), cmd.output())
            .await
            .map_err(|_| format!("Command timed out after {}s", self.timeout_secs))?
            .map_err(|e| format!("Execution failed: {}", e))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        match self.spec.output {
            OutputMode::Json => match serde_json::from_str::<Value>(&stdout) {
                Ok(value) => Ok(value),
                Err(_) if !output.status.success() => {
                    Err(format!("Exit {:?}\nstderr: {}", output.status.code(), stderr))
                }
                Err(e) => Err(format!("Invalid JSON output: {e}")),
            },
            OutputMode::Status => {
                let success = output.status.success();
                let message = if success {
                    "Command completed successfully".to_string()
                } else {
                    stderr
                        .lines()
                        .find(|l| !l.trim().is_empty())
                        .map(|l| l.trim().to_string())
                        .unwrap_or_else(|| format!("Exit code {:?}", output.status.code()))
                };
                Ok(serde_json::json!({
                    "success": success,
                    "message": message,
                    "output": stdout,
                    "error": stderr,
                }))
            }
        }
    }
}
