//! 编排层：决策引擎、recipe 提取、迁移主循环与过程事件

pub mod events;
pub mod loop_;
pub mod planner;
pub mod recipe;

pub use events::WorkflowEvent;
pub use loop_::{
    final_answer_line, ExhaustedKind, LoopConfig, OrchestrationLoop, WorkflowOutcome, WorkflowStatus,
};
pub use planner::{parse_decision, Decision, DecisionEngine};
pub use recipe::{RecipeExtractor, RecipeStrategy};
