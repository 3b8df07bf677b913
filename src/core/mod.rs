//! 核心层：错误与恢复、工作流状态

pub mod error;
pub mod recovery;
pub mod state;

pub use error::{RecoveryAction, WorkflowError};
pub use recovery::RecoveryEngine;
pub use state::{
    MigrationType, ReleaseType, StepOrigin, StepRecord, Terminal, WorkflowContext,
};
