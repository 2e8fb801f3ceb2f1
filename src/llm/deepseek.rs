//! DeepSeek API 客户端（OpenAI 兼容格式）
//!
//! - Base URL: https://api.deepseek.com
//! - 模型: deepseek-chat（默认，支持工具调用与 JSON 输出）

use crate::llm::{OpenAiClient, ResponseFormat};

pub const DEEPSEEK_BASE_URL: &str = "https://api.deepseek.com";
pub const DEEPSEEK_CHAT: &str = "deepseek-chat";

/// 创建 DeepSeek 客户端
///
/// - API Key 优先取 `DEEPSEEK_API_KEY`，其次 `OPENAI_API_KEY`
/// - 模型优先取参数，其次 `DEEPSEEK_MODEL` 环境变量，默认 `deepseek-chat`
/// - base_url 为空时使用官方地址
/// - 结构化输出走 json_object（端点不支持 json_schema）
pub fn create_deepseek_client(model: Option<&str>, base_url: Option<&str>) -> OpenAiClient {
    let api_key = std::env::var("DEEPSEEK_API_KEY")
        .ok()
        .or_else(|| std::env::var("OPENAI_API_KEY").ok())
        .unwrap_or_else(|| "sk-placeholder".to_string());

    let model = model
        .filter(|m| !m.is_empty())
        .map(String::from)
        .or_else(|| std::env::var("DEEPSEEK_MODEL").ok())
        .unwrap_or_else(|| DEEPSEEK_CHAT.to_string());

    let base_url = base_url.filter(|u| !u.is_empty()).unwrap_or(DEEPSEEK_BASE_URL);
    OpenAiClient::new(Some(base_url), &model, Some(api_key.as_str()))
        .with_response_format(ResponseFormat::JsonObject)
}
