//! 图运行上下文：进程启动时构造一次，显式传入每个阶段
//!
//! 持有 LLM 客户端、工具执行器、知识库、会话存储与图参数；不使用全局单例。

use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::RecoveryEngine;
use crate::llm::LlmClient;
use crate::memory::{KnowledgeStore, SessionStore};
use crate::tools::ToolExecutor;

/// 图参数（来自 [graph] / [llm] / [tools] / [knowledge] 段）
#[derive(Debug, Clone, PartialEq)]
pub struct GraphSettings {
    pub max_loop_count: u32,
    pub critic_max_loops: u32,
    pub context_window: usize,
    pub interrupt_before_synthesis: bool,
    pub temperature: Option<f32>,
    pub parallel_tool_calls: bool,
    pub critic_k: usize,
    pub citation_k: usize,
}

impl Default for GraphSettings {
    fn default() -> Self {
        Self::from(&AppConfig::default())
    }
}

impl From<&AppConfig> for GraphSettings {
    fn from(cfg: &AppConfig) -> Self {
        Self {
            max_loop_count: cfg.graph.max_loop_count,
            critic_max_loops: cfg.graph.critic_max_loops,
            context_window: cfg.graph.max_context_messages,
            interrupt_before_synthesis: cfg.graph.interrupt_before_synthesis,
            temperature: Some(cfg.llm.temperature),
            parallel_tool_calls: cfg.tools.parallel_tool_calls,
            critic_k: cfg.knowledge.critic_k,
            citation_k: cfg.knowledge.citation_k,
        }
    }
}

pub struct GraphContext {
    pub llm: Arc<dyn LlmClient>,
    pub tools: Arc<ToolExecutor>,
    pub knowledge: Arc<dyn KnowledgeStore>,
    pub sessions: Arc<dyn SessionStore>,
    pub settings: GraphSettings,
    pub recovery: RecoveryEngine,
}

impl GraphContext {
    pub fn new(
        llm: Arc<dyn LlmClient>,
        tools: Arc<ToolExecutor>,
        knowledge: Arc<dyn KnowledgeStore>,
        sessions: Arc<dyn SessionStore>,
        settings: GraphSettings,
    ) -> Self {
        Self {
            llm,
            tools,
            knowledge,
            sessions,
            settings,
            recovery: RecoveryEngine::new(),
        }
    }
}
