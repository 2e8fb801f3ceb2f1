//! 研究流程错误类型与恢复动作
//!
//! 与 RecoveryEngine 配合：根据 AgentError 决定回退到 researcher、跳过工具调用或终止本轮。

use thiserror::Error;

use crate::llm::LlmError;

/// 研究流程中可能出现的错误（路由解析、工具、生成调用、持久化等）
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AgentError {
    /// 路由决策无法解析或阶段名不在枚举内
    #[error("Routing parse failure: {0}")]
    RoutingParse(String),

    /// 模型请求了未注册的工具
    #[error("Tool not found: {0}")]
    ToolNotFound(String),

    #[error("Tool execution failed: {0}")]
    ToolExecutionFailed(String),

    #[error("Tool timeout: {0}")]
    ToolTimeout(String),

    /// 生成调用在重试耗尽后仍失败
    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Knowledge store error: {0}")]
    Knowledge(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Cancelled")]
    Cancelled,

    /// resume 时没有处于暂停状态的轮次
    #[error("Nothing to resume for thread {0}")]
    NothingToResume(String),
}

/// 恢复引擎根据错误类型给出的建议动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    /// 路由失败时默认交给 researcher
    FallbackToResearcher,
    /// 跳过这一次工具调用，继续本跳
    SkipTool,
    /// 终止本轮（记录 error）
    FailTurn,
}
