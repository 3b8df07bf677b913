//! RecipeExtractor：从计划工具的原始结果中提取 recipe_id
//!
//! 提取策略是一张有序表（数据而非分支），依次尝试，第一个命中即返回；全部落空时返回 RecipeExtraction。

use regex::Regex;
use serde_json::Value;

use crate::core::WorkflowError;

/// 单条提取策略
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecipeStrategy {
    /// JSON Pointer 指向的字符串字段，如 `/recipe_id`、`/recipe/recipe_id`
    Pointer(String),
    /// 字段中的命令行，取 `--recipe <id>` 的值
    FlagInField(String),
    /// 字段为 recipe 列表：逗号分隔字符串，或字符串/对象（含 id / recipe_id）数组，取第一个
    ListField(String),
    /// 字段中 `<prefix><id>` 形式的文本，如 "Migrate to UpgradeSpringBoot_3_4"
    PrefixInField { field: String, prefix: String },
    /// 整个结果序列化后任意位置的 `--recipe <id>`
    FlagAnywhere,
}

impl RecipeStrategy {
    fn label(&self) -> String {
        match self {
            RecipeStrategy::Pointer(p) => format!("pointer:{p}"),
            RecipeStrategy::FlagInField(f) => format!("flag:{f}"),
            RecipeStrategy::ListField(f) => format!("list:{f}"),
            RecipeStrategy::PrefixInField { field, .. } => format!("prefix:{field}"),
            RecipeStrategy::FlagAnywhere => "flag:*".to_string(),
        }
    }
}

/// 默认策略顺序
pub fn default_strategies() -> Vec<RecipeStrategy> {
    vec![
        RecipeStrategy::Pointer("/recipe_id".into()),
        RecipeStrategy::Pointer("/recipe/recipe_id".into()),
        RecipeStrategy::FlagInField("moderne_recipe_command".into()),
        RecipeStrategy::ListField("moderne_recipes".into()),
        RecipeStrategy::PrefixInField {
            field: "moderne_recipe".into(),
            prefix: "Migrate to ".into(),
        },
        RecipeStrategy::FlagAnywhere,
    ]
}

pub struct RecipeExtractor {
    strategies: Vec<RecipeStrategy>,
    flag_re: Regex,
}

impl Default for RecipeExtractor {
    fn default() -> Self {
        Self::with_strategies(default_strategies())
    }
}

impl RecipeExtractor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strategies(strategies: Vec<RecipeStrategy>) -> Self {
        Self {
            strategies,
            flag_re: Regex::new(r#"--recipe(?:=|\s+)["']?([A-Za-z0-9_.:\-]+)"#)
                .expect("recipe flag pattern is valid"),
        }
    }

    /// 在表尾追加一条策略
    pub fn push(&mut self, strategy: RecipeStrategy) {
        self.strategies.push(strategy);
    }

    pub fn strategies(&self) -> &[RecipeStrategy] {
        &self.strategies
    }

    pub fn extract(&self, result: &Value) -> Result<String, WorkflowError> {
        // 工具可能把 JSON 包在文本里返回
        let parsed;
        let result = match result {
            Value::String(s) => match serde_json::from_str::<Value>(s) {
                Ok(v) if v.is_object() => {
                    parsed = v;
                    &parsed
                }
                _ => result,
            },
            _ => result,
        };

        for strategy in &self.strategies {
            if let Some(id) = self.apply(strategy, result) {
                tracing::debug!(strategy = %strategy.label(), recipe_id = %id, "recipe extracted");
                return Ok(id);
            }
        }

        Err(WorkflowError::RecipeExtraction(format!(
            "no strategy matched ({} tried)",
            self.strategies.len()
        )))
    }

    fn apply(&self, strategy: &RecipeStrategy, result: &Value) -> Option<String> {
        match strategy {
            RecipeStrategy::Pointer(pointer) => result
                .pointer(pointer)
                .and_then(Value::as_str)
                .and_then(clean_id),
            RecipeStrategy::FlagInField(field) => result
                .get(field)
                .and_then(Value::as_str)
                .and_then(|s| self.find_flag(s)),
            RecipeStrategy::ListField(field) => match result.get(field)? {
                Value::String(s) => {
                    let first = s.split(',').next()?;
                    clean_id(first)
                }
                Value::Array(items) => items.iter().find_map(|item| match item {
                    Value::String(s) => clean_id(s),
                    Value::Object(_) => item
                        .get("id")
                        .or_else(|| item.get("recipe_id"))
                        .and_then(Value::as_str)
                        .and_then(clean_id),
                    _ => None,
                }),
                _ => None,
            },
            RecipeStrategy::PrefixInField { field, prefix } => {
                let text = result.get(field).and_then(Value::as_str)?;
                let start = text.find(prefix.as_str())? + prefix.len();
                let token = text[start..].split_whitespace().next()?;
                clean_id(token.trim_end_matches(['.', ',', ';']))
            }
            RecipeStrategy::FlagAnywhere => match result {
                Value::String(s) => self.find_flag(s),
                other => self.find_flag(&other.to_string()),
            },
        }
    }

    fn find_flag(&self, text: &str) -> Option<String> {
        self.flag_re
            .captures(text)
            .and_then(|c| c.get(1))
            .and_then(|m| clean_id(m.as_str()))
    }
}

/// 合法 recipe id：非空、无空白、不是 `[...]` 占位符
fn clean_id(raw: &str) -> Option<String> {
    let id = raw.trim().trim_matches(|c| c == '"' || c == '\'');
    if id.is_empty() || id.starts_with('[') || id.chars().any(char::is_whitespace) {
        None
    } else {
        Some(id.to_string())
    }
}
