//! 应用配置：从 config/default.toml 与环境变量加载
//!
//! 加载顺序：先读 TOML 文件，再用环境变量 `BEE__*` 覆盖（双下划线表示嵌套，如 `BEE__GRAPH__MAX_LOOP_COUNT=20`）。
//! 任一段缺失时使用下方默认值。

use std::path::PathBuf;

use serde::Deserialize;

/// 应用配置根（对应 config/default.toml 的顶层）
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
pub struct AppConfig {
    pub app: AppSection,
    pub llm: LlmSection,
    pub graph: GraphSection,
    pub retry: RetrySection,
    pub tools: ToolsSection,
    pub knowledge: KnowledgeSection,
}

/// [app] 段：会话 thread、检查点数据库
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppSection {
    pub name: Option<String>,
    /// 行式交互默认使用的会话 thread id
    pub thread_id: String,
    /// SQLite 检查点文件；为空字符串时只用内存存储
    pub session_db: String,
}

impl Default for AppSection {
    fn default() -> Self {
        Self {
            name: None,
            thread_id: "default".to_string(),
            session_db: "data/sessions.db".to_string(),
        }
    }
}

/// [llm] 段：后端选择、温度与超时
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmSection {
    /// 后端：deepseek / openai / mock
    pub provider: String,
    pub model: String,
    pub base_url: Option<String>,
    pub temperature: f32,
    pub timeouts: LlmTimeoutsSection,
}

impl Default for LlmSection {
    fn default() -> Self {
        Self {
            provider: "deepseek".to_string(),
            model: "deepseek-chat".to_string(),
            base_url: None,
            temperature: 0.0,
            timeouts: LlmTimeoutsSection::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LlmTimeoutsSection {
    /// 单次生成调用超时（秒）
    pub request: u64,
}

impl Default for LlmTimeoutsSection {
    fn default() -> Self {
        Self { request: 60 }
    }
}

/// [graph] 段：两个循环上限、上下文窗口、终止阶段前是否暂停
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GraphSection {
    /// 全局跳数上限，超过后强制进入 synthesizer
    pub max_loop_count: u32,
    /// critic 强制收敛阈值
    pub critic_max_loops: u32,
    /// 上下文窗口（条目数），超过时触发 compaction
    pub max_context_messages: usize,
    pub interrupt_before_synthesis: bool,
}

impl Default for GraphSection {
    fn default() -> Self {
        Self {
            max_loop_count: 15,
            critic_max_loops: 3,
            max_context_messages: 6,
            interrupt_before_synthesis: false,
        }
    }
}

/// [retry] 段：生成调用的指数退避
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RetrySection {
    pub max_attempts: u32,
    pub base_wait_ms: u64,
    pub max_wait_ms: u64,
}

impl Default for RetrySection {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_wait_ms: 1000,
            max_wait_ms: 30_000,
        }
    }
}

/// [tools] 段：工具超时、是否并发执行、抓取设置
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ToolsSection {
    /// 单次工具调用超时（秒）
    pub tool_timeout_secs: u64,
    /// 同一跳内的多个工具调用是否并发执行
    pub parallel_tool_calls: bool,
    pub search: SearchSection,
}

impl Default for ToolsSection {
    fn default() -> Self {
        Self {
            tool_timeout_secs: 30,
            parallel_tool_calls: false,
            search: SearchSection::default(),
        }
    }
}

/// [tools.search] 段：抓取 URL 的超时、最大字符数、允许的域名白名单（空表示不限制）
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SearchSection {
    pub timeout_secs: u64,
    pub max_result_chars: usize,
    pub allowed_domains: Vec<String>,
}

impl Default for SearchSection {
    fn default() -> Self {
        Self {
            timeout_secs: 15,
            max_result_chars: 8000,
            allowed_domains: Vec::new(),
        }
    }
}

/// [knowledge] 段：知识库文件、分块与检索条数
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct KnowledgeSection {
    /// JSONL 文件；为空字符串时只用内存索引
    pub path: String,
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// critic 检索条数
    pub critic_k: usize,
    /// 报告引用检索条数
    pub citation_k: usize,
}

impl Default for KnowledgeSection {
    fn default() -> Self {
        Self {
            path: "data/knowledge.jsonl".to_string(),
            chunk_size: 1000,
            chunk_overlap: 200,
            critic_k: 4,
            citation_k: 6,
        }
    }
}

/// 从 config 目录加载配置，环境变量 BEE__* 可覆盖
///
/// 1. 按顺序查找 config/default.toml、../config/default.toml、default.toml，找到则作为第一源
/// 2. 若传入 config_path 且文件存在，则追加该文件（可覆盖前面的键）
/// 3. 最后叠加环境变量 BEE__*（双下划线表示嵌套键）
pub fn load_config(config_path: Option<PathBuf>) -> Result<AppConfig, config::ConfigError> {
    let mut builder = config::Config::builder();

    for name in ["config/default", "../config/default", "default"] {
        if std::path::Path::new(&format!("{}.toml", name)).exists() {
            builder = builder.add_source(config::File::with_name(name).required(false));
            break;
        }
    }

    if let Some(ref path) = config_path {
        if path.exists() {
            builder = builder.add_source(config::File::from(path.clone()).required(false));
        }
    }

    builder = builder.add_source(
        config::Environment::with_prefix("BEE")
            .separator("__")
            .try_parsing(true),
    );

    builder.build()?.try_deserialize()
}
