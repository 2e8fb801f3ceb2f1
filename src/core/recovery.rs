//! 错误恢复引擎
//!
//! 唯一的错误分类入口：各阶段遇到错误时询问 RecoveryEngine，决定回退、跳过还是失败。

use crate::core::{AgentError, RecoveryAction};

#[derive(Debug, Default, Clone, Copy)]
pub struct RecoveryEngine;

impl RecoveryEngine {
    pub fn new() -> Self {
        Self
    }

    pub fn handle(&self, err: &AgentError) -> RecoveryAction {
        let action = match err {
            AgentError::RoutingParse(_) => RecoveryAction::FallbackToResearcher,
            AgentError::ToolNotFound(_) => RecoveryAction::SkipTool,
            _ => RecoveryAction::FailTurn,
        };
        match action {
            RecoveryAction::FailTurn => tracing::error!(error = %err, "Unrecoverable error"),
            _ => tracing::warn!(error = %err, ?action, "Recovered from error"),
        }
        action
    }
}
