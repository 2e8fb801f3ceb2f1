//! 工具参数 JSON Schema（schemars 自动生成）
//!
//! 每个内置工具的参数结构体同时用于生成绑定给模型的 Schema 与解析模型给出的参数。

use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

/// web_search 参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct WebSearchArgs {
    /// 搜索关键词
    pub query: String,
    /// 最多返回条数（默认 5）
    #[serde(default)]
    pub max_results: Option<usize>,
}

/// web_fetch 参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct WebFetchArgs {
    /// 要抓取的完整 URL（http/https）
    pub url: String,
}

/// store_research 参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct StoreResearchArgs {
    /// 要存入知识库的文本
    pub text: String,
    /// 来源类别（默认 research）
    #[serde(default)]
    pub source: Option<String>,
    /// 来源 URL（默认 unknown）
    #[serde(default)]
    pub source_url: Option<String>,
}

/// retrieve_knowledge 参数
#[derive(Debug, Deserialize, JsonSchema)]
pub struct RetrieveKnowledgeArgs {
    /// 检索查询
    pub query: String,
    /// 返回条数（默认 3）
    #[serde(default)]
    pub k: Option<usize>,
}

/// 由参数类型生成 JSON Schema
pub fn parameters_for<T: JsonSchema>() -> Value {
    serde_json::to_value(schema_for!(T)).unwrap_or_else(|_| serde_json::json!({ "type": "object" }))
}

/// 将模型给出的参数解析为强类型
pub fn parse_args<T: DeserializeOwned>(args: Value) -> Result<T, String> {
    serde_json::from_value(args).map_err(|e| format!("Invalid arguments: {}", e))
}
