//! Migrator - 有界迭代的项目迁移编排器
//!
//! 模块划分：
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 工作流状态、错误类型与恢复
//! - **llm**: 决策方客户端抽象与实现（OpenAI 兼容 / 脚本回放）
//! - **react**: 决策引擎、recipe 提取、迁移主循环
//! - **tools**: 工具注册表与外部命令工具
//! - **observability**: 日志初始化

pub mod config;
pub mod core;
pub mod llm;
pub mod observability;
pub mod react;
pub mod tools;

pub use crate::core::{WorkflowContext, WorkflowError};
pub use react::{OrchestrationLoop, WorkflowOutcome, WorkflowStatus};
