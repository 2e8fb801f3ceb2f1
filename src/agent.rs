//! 组件装配
//!
//! 进程启动时从 AppConfig 构建一次：LLM 客户端（带重试）、工具执行器、知识库、会话存储，
//! 组装为 GraphContext 交给调度器；之后不再重新初始化。

use std::sync::Arc;

use crate::config::AppConfig;
use crate::core::AgentError;
use crate::llm::{
    create_deepseek_client, LlmClient, MockLlmClient, OpenAiClient, RetryConfig,
    RetryingLlmClient,
};
use crate::memory::{
    InMemorySessionStore, KnowledgeIndex, KnowledgeStore, SessionStore, SqliteSessionStore,
};
use crate::tools::{
    RetrieveKnowledgeTool, StoreResearchTool, ToolExecutor, ToolRegistry, WebFetchTool,
    WebSearchTool,
};
use crate::workflow::{GraphContext, GraphSettings, Scheduler};

/// 预构建的组件：共享的图上下文与调度器
pub struct AgentComponents {
    pub context: Arc<GraphContext>,
    pub scheduler: Scheduler,
}

/// 按 [llm] 段选择后端，外层包一层指数退避重试
///
/// - provider = "mock"：离线 MockLlmClient
/// - provider = "deepseek"：有 DEEPSEEK_API_KEY 或 OPENAI_API_KEY 时走 DeepSeek 端点
/// - provider = "openai"：有 OPENAI_API_KEY 时走 OpenAI 兼容端点（可配 base_url）
/// - 其余情况（缺 Key / 未知 provider）告警并退回 Mock
pub fn create_llm_from_config(cfg: &AppConfig) -> Arc<dyn LlmClient> {
    let provider = cfg.llm.provider.to_lowercase();
    let has_deepseek_key = std::env::var("DEEPSEEK_API_KEY").is_ok();
    let openai_key = std::env::var("OPENAI_API_KEY").ok();

    let inner: Arc<dyn LlmClient> = match provider.as_str() {
        "mock" => {
            tracing::info!("Using Mock LLM");
            Arc::new(MockLlmClient)
        }
        "deepseek" if has_deepseek_key || openai_key.is_some() => {
            tracing::info!("Using DeepSeek LLM ({})", cfg.llm.model);
            Arc::new(
                create_deepseek_client(Some(&cfg.llm.model), cfg.llm.base_url.as_deref())
                    .with_request_timeout(cfg.llm.timeouts.request),
            )
        }
        "openai" if openai_key.is_some() => {
            tracing::info!("Using OpenAI LLM ({})", cfg.llm.model);
            Arc::new(
                OpenAiClient::new(
                    cfg.llm.base_url.as_deref(),
                    &cfg.llm.model,
                    openai_key.as_deref(),
                )
                .with_request_timeout(cfg.llm.timeouts.request),
            )
        }
        _ => {
            tracing::warn!(provider = %provider, "No API key set or provider unknown, using Mock LLM");
            Arc::new(MockLlmClient)
        }
    };

    Arc::new(RetryingLlmClient::new(inner, RetryConfig::from(&cfg.retry)))
}

/// 内置研究工具：web_search、web_fetch、store_research、retrieve_knowledge
pub fn build_tools(cfg: &AppConfig, knowledge: Arc<dyn KnowledgeStore>) -> ToolRegistry {
    let search = &cfg.tools.search;
    let mut tools = ToolRegistry::new();
    tools.register(WebSearchTool::new(search.timeout_secs));
    tools.register(WebFetchTool::new(
        search.allowed_domains.clone(),
        search.timeout_secs,
        search.max_result_chars,
    ));
    tools.register(StoreResearchTool::new(knowledge.clone()));
    tools.register(RetrieveKnowledgeTool::new(knowledge));
    tools
}

fn open_knowledge(cfg: &AppConfig) -> Result<Arc<dyn KnowledgeStore>, AgentError> {
    let section = &cfg.knowledge;
    if section.path.trim().is_empty() {
        return Ok(Arc::new(KnowledgeIndex::in_memory(
            section.chunk_size,
            section.chunk_overlap,
        )));
    }
    let index = KnowledgeIndex::open(&section.path, section.chunk_size, section.chunk_overlap)?;
    Ok(Arc::new(index))
}

fn open_sessions(cfg: &AppConfig) -> Result<Arc<dyn SessionStore>, AgentError> {
    let path = cfg.app.session_db.trim();
    if path.is_empty() {
        tracing::info!("Session checkpoints kept in memory only");
        return Ok(Arc::new(InMemorySessionStore::new()));
    }
    Ok(Arc::new(SqliteSessionStore::open(path)?))
}

/// 从配置构建全部组件
pub fn build_components(cfg: &AppConfig) -> Result<AgentComponents, AgentError> {
    let llm = create_llm_from_config(cfg);
    let knowledge = open_knowledge(cfg)?;
    let sessions = open_sessions(cfg)?;
    let executor = ToolExecutor::new(build_tools(cfg, knowledge.clone()), cfg.tools.tool_timeout_secs);

    tracing::info!(tools = ?executor.tool_names(), "Components ready");
    let context = Arc::new(GraphContext::new(
        llm,
        Arc::new(executor),
        knowledge,
        sessions,
        GraphSettings::from(cfg),
    ));
    Ok(AgentComponents {
        scheduler: Scheduler::new(context.clone()),
        context,
    })
}
