//! LLM 客户端抽象
//!
//! 所有后端（OpenAI 兼容 / DeepSeek / Mock / Scripted）实现 LlmClient::complete：
//! 请求携带消息历史、可选工具绑定与可选输出 Schema；返回自由文本、工具调用或结构化 JSON。
//! RetryingLlmClient 为任意后端加上有界指数退避重试。

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schemars::{schema_for, JsonSchema};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::config::RetrySection;
use crate::memory::Message;

/// 模型请求的一次工具调用：id 用于与工具输出配对
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

impl ToolCall {
    pub fn new(id: impl Into<String>, name: impl Into<String>, args: Value) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            args,
        }
    }
}

/// 绑定给模型的工具描述（name / description / 参数 JSON Schema）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ToolSpec {
    pub name: String,
    pub description: String,
    pub parameters: Value,
}

/// 结构化输出约束：名称 + JSON Schema
#[derive(Debug, Clone, PartialEq)]
pub struct OutputSchema {
    pub name: String,
    pub schema: Value,
}

impl OutputSchema {
    /// 由 schemars 从类型生成 Schema
    pub fn of<T: JsonSchema>(name: impl Into<String>) -> Self {
        let schema = serde_json::to_value(schema_for!(T))
            .unwrap_or_else(|_| serde_json::json!({ "type": "object" }));
        Self {
            name: name.into(),
            schema,
        }
    }
}

/// 单次生成请求
#[derive(Debug, Clone, Default)]
pub struct CompletionRequest {
    pub messages: Vec<Message>,
    pub temperature: Option<f32>,
    pub tools: Vec<ToolSpec>,
    pub output_schema: Option<OutputSchema>,
}

impl CompletionRequest {
    pub fn new(messages: Vec<Message>) -> Self {
        Self {
            messages,
            ..Default::default()
        }
    }

    pub fn with_temperature(mut self, temperature: Option<f32>) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn with_tools(mut self, tools: Vec<ToolSpec>) -> Self {
        self.tools = tools;
        self
    }

    pub fn with_output_schema(mut self, schema: OutputSchema) -> Self {
        self.output_schema = Some(schema);
        self
    }
}

/// 生成结果：文本、工具调用、结构化输出（仅请求了 output_schema 时才可能有）
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Completion {
    pub content: String,
    pub tool_calls: Vec<ToolCall>,
    pub structured: Option<Value>,
}

impl Completion {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            content: content.into(),
            ..Default::default()
        }
    }

    pub fn structured(value: Value) -> Self {
        Self {
            content: value.to_string(),
            tool_calls: Vec::new(),
            structured: Some(value),
        }
    }

    pub fn with_tool_calls(mut self, calls: Vec<ToolCall>) -> Self {
        self.tool_calls = calls;
        self
    }

    /// 解析结构化输出为强类型值。
    ///
    /// 主路径是 `structured` 字段；后端没有返回结构化负载时，退回到从自由文本中提取 JSON 对象
    /// （旧式字符串解析，仅作兼容回退）。
    pub fn structured_as<T: DeserializeOwned>(&self) -> Result<T, String> {
        if let Some(value) = &self.structured {
            return serde_json::from_value(value.clone()).map_err(|e| e.to_string());
        }
        let json = extract_json_object(&self.content)
            .ok_or_else(|| format!("no JSON object in output: {}", preview(&self.content)))?;
        serde_json::from_str(json).map_err(|e| format!("{}: {}", e, preview(json)))
    }
}

/// 从文本中提取 JSON 对象（```json 代码块或首个 `{` 到最后一个 `}`）
pub fn extract_json_object(text: &str) -> Option<&str> {
    let trimmed = text.trim();
    if let Some(start) = trimmed.find("```json") {
        let rest = &trimmed[start + 7..];
        let body = rest.find("```").map(|end| &rest[..end]).unwrap_or(rest);
        return Some(body.trim());
    }
    let start = trimmed.find('{')?;
    let end = trimmed.rfind('}')?;
    (end > start).then(|| &trimmed[start..=end])
}

fn preview(s: &str) -> String {
    if s.chars().count() > 200 {
        format!("{}...", s.chars().take(200).collect::<String>())
    } else {
        s.to_string()
    }
}

/// LLM 调用错误
#[derive(Debug, Clone, PartialEq, Error)]
pub enum LlmError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Request timed out")]
    Timeout,

    #[error("Rate limited (retry after {retry_after_ms} ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("API error: {0}")]
    ApiError(String),

    /// 请求本身不合法（如参数构造失败），重试无意义
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

impl LlmError {
    /// 是否属于可重试的瞬时错误
    pub fn is_transient(&self) -> bool {
        !matches!(self, LlmError::InvalidRequest(_))
    }
}

/// LLM 客户端 trait
#[async_trait]
pub trait LlmClient: Send + Sync {
    /// 单次生成（非流式）
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError>;
}

/// 重试策略：最多 max_attempts 次，第 n 次失败后等待 min(base * 2^(n-1), max)
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl From<&RetrySection> for RetryConfig {
    fn from(section: &RetrySection) -> Self {
        Self {
            max_attempts: section.max_attempts.max(1),
            base_delay: Duration::from_millis(section.base_wait_ms),
            max_delay: Duration::from_millis(section.max_wait_ms),
        }
    }
}

impl RetryConfig {
    /// 第 attempt 次（从 1 开始）失败后的等待时长
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

/// 带指数退避的重试包装；次数耗尽后原样返回最后一次错误
pub struct RetryingLlmClient {
    inner: Arc<dyn LlmClient>,
    config: RetryConfig,
}

impl RetryingLlmClient {
    pub fn new(inner: Arc<dyn LlmClient>, config: RetryConfig) -> Self {
        Self { inner, config }
    }
}

#[async_trait]
impl LlmClient for RetryingLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let max_attempts = self.config.max_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.inner.complete(request).await {
                Ok(completion) => return Ok(completion),
                Err(e) if attempt < max_attempts && e.is_transient() => {
                    let delay = match &e {
                        LlmError::RateLimited { retry_after_ms } => self
                            .config
                            .delay_for(attempt)
                            .max(Duration::from_millis(*retry_after_ms))
                            .min(self.config.max_delay),
                        _ => self.config.delay_for(attempt),
                    };
                    tracing::warn!(
                        attempt,
                        max_attempts,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Generation call failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    tracing::error!(attempt, error = %e, "Generation call failed");
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::ScriptedLlmClient;

    fn fast_retry(max_attempts: u32) -> RetryConfig {
        RetryConfig {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
        }
    }

    #[test]
    fn test_delay_doubles_and_caps() {
        let cfg = RetryConfig {
            max_attempts: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(cfg.delay_for(1), Duration::from_millis(100));
        assert_eq!(cfg.delay_for(2), Duration::from_millis(200));
        assert_eq!(cfg.delay_for(3), Duration::from_millis(350));
        assert_eq!(cfg.delay_for(40), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn test_retry_recovers_from_transient_failures() {
        let scripted = Arc::new(ScriptedLlmClient::new(vec![
            Err(LlmError::Timeout),
            Err(LlmError::Network("reset".into())),
            Ok(Completion::text("done")),
        ]));
        let client = RetryingLlmClient::new(scripted.clone(), fast_retry(3));
        let out = client.complete(&CompletionRequest::default()).await.unwrap();
        assert_eq!(out.content, "done");
        assert_eq!(scripted.call_count(), 3);
    }

    #[tokio::test]
    async fn test_retry_reraises_last_error_when_exhausted() {
        let scripted = Arc::new(ScriptedLlmClient::new(vec![
            Err(LlmError::Timeout),
            Err(LlmError::ApiError("boom".into())),
            Ok(Completion::text("too late")),
        ]));
        let client = RetryingLlmClient::new(scripted.clone(), fast_retry(2));
        let err = client
            .complete(&CompletionRequest::default())
            .await
            .unwrap_err();
        assert_eq!(err, LlmError::ApiError("boom".into()));
        assert_eq!(scripted.call_count(), 2);
    }

    #[tokio::test]
    async fn test_invalid_request_is_not_retried() {
        let scripted = Arc::new(ScriptedLlmClient::new(vec![
            Err(LlmError::InvalidRequest("bad".into())),
            Ok(Completion::text("unreachable")),
        ]));
        let client = RetryingLlmClient::new(scripted.clone(), fast_retry(3));
        assert!(client.complete(&CompletionRequest::default()).await.is_err());
        assert_eq!(scripted.call_count(), 1);
    }

    #[test]
    fn test_structured_prefers_payload_then_legacy_text() {
        #[derive(Deserialize)]
        struct Probe {
            value: u32,
        }
        let direct = Completion::structured(serde_json::json!({ "value": 7 }));
        assert_eq!(direct.structured_as::<Probe>().unwrap().value, 7);

        let legacy = Completion::text("Here you go:\n```json\n{\"value\": 9}\n```");
        assert_eq!(legacy.structured_as::<Probe>().unwrap().value, 9);

        let garbage = Completion::text("no json at all");
        assert!(garbage.structured_as::<Probe>().is_err());
    }
}
