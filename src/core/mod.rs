//! 核心层：会话状态、错误与恢复

pub mod error;
pub mod recovery;
pub mod state;

pub use error::{AgentError, RecoveryAction};
pub use recovery::RecoveryEngine;
pub use state::{
    Assessment, HistoryUpdate, NextStage, ResearchArtifact, RoutingDecision, SessionState, Stage,
    StateDelta,
};
