//! Bee Research - Rust 研究编排智能体
//!
//! 模块划分：
//! - **agent**: 从配置构建 LLM、工具、知识库与会话存储，组装 GraphContext
//! - **config**: 应用配置加载（TOML + 环境变量）
//! - **core**: 会话状态、状态增量、错误与恢复
//! - **llm**: LLM 客户端抽象与实现（OpenAI 兼容 / DeepSeek / Mock / Scripted）
//! - **memory**: 会话历史、知识库（分块 + 检索）、会话检查点
//! - **observability**: tracing 日志初始化
//! - **stages**: Router / Compaction / Researcher / Critic / Synthesizer
//! - **tools**: 工具注册表、执行器与内置研究工具
//! - **workflow**: 调度器（逐跳执行、合并、选边、暂停与恢复）

pub mod agent;
pub mod config;
pub mod core;
pub mod llm;
pub mod memory;
pub mod observability;
pub mod stages;
pub mod tools;
pub mod workflow;

pub use agent::{build_components, AgentComponents};
pub use workflow::{Scheduler, TurnOutcome};
