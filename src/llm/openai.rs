//! OpenAI 兼容 API 客户端
//!
//! 通过 async_openai 调用任意 OpenAI 兼容端点（可配置 base_url）；支持 DeepSeek、OpenAI、自建代理等。
//! 工具绑定与结构化输出通过 BYOT（自带请求/响应类型）发送，避免受 SDK 类型变动影响。
//! 结构化输出默认走 json_schema；不支持的端点改用 json_object，Schema 写入系统提示。

use std::time::Duration;

use async_openai::config::OpenAIConfig;
use async_openai::error::OpenAIError;
use async_openai::Client;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::{json, Value};

use crate::llm::{
    extract_json_object, Completion, CompletionRequest, LlmClient, LlmError, OutputSchema, ToolCall,
};
use crate::memory::{Message, Role};

/// 结构化输出的请求方式
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResponseFormat {
    /// `response_format: json_schema`，端点按 Schema 约束输出
    #[default]
    JsonSchema,
    /// `response_format: json_object`，Schema 写进系统提示（DeepSeek 只接受 text / json_object）
    JsonObject,
}

/// OpenAI 兼容客户端：持有 Client、model 名与单次请求超时
pub struct OpenAiClient {
    client: Client<OpenAIConfig>,
    model: String,
    request_timeout: Duration,
    response_format: ResponseFormat,
}

impl OpenAiClient {
    pub fn new(base_url: Option<&str>, model: &str, api_key: Option<&str>) -> Self {
        let api_key = api_key
            .map(String::from)
            .or_else(|| std::env::var("OPENAI_API_KEY").ok())
            .unwrap_or_else(|| "sk-placeholder".to_string());

        let config = if let Some(url) = base_url {
            OpenAIConfig::new()
                .with_api_base(url)
                .with_api_key(api_key)
        } else {
            OpenAIConfig::new().with_api_key(api_key)
        };

        Self {
            client: Client::with_config(config),
            model: model.to_string(),
            request_timeout: Duration::from_secs(60),
            response_format: ResponseFormat::default(),
        }
    }

    pub fn with_request_timeout(mut self, secs: u64) -> Self {
        self.request_timeout = Duration::from_secs(secs.max(1));
        self
    }

    pub fn with_response_format(mut self, format: ResponseFormat) -> Self {
        self.response_format = format;
        self
    }

    fn build_body(&self, request: &CompletionRequest) -> Value {
        let mut messages: Vec<Value> = request.messages.iter().map(to_wire_message).collect();
        if let (Some(schema), ResponseFormat::JsonObject) =
            (&request.output_schema, self.response_format)
        {
            embed_schema(&mut messages, schema);
        }
        let mut body = json!({
            "model": self.model,
            "messages": messages,
        });
        if let Some(t) = request.temperature {
            body["temperature"] = json!(t);
        }
        if !request.tools.is_empty() {
            body["tools"] = request
                .tools
                .iter()
                .map(|t| {
                    json!({
                        "type": "function",
                        "function": {
                            "name": t.name,
                            "description": t.description,
                            "parameters": t.parameters,
                        }
                    })
                })
                .collect::<Vec<_>>()
                .into();
        }
        if let Some(schema) = &request.output_schema {
            body["response_format"] = match self.response_format {
                ResponseFormat::JsonSchema => json!({
                    "type": "json_schema",
                    "json_schema": { "name": schema.name, "schema": schema.schema },
                }),
                ResponseFormat::JsonObject => json!({ "type": "json_object" }),
            };
        }
        body
    }
}

/// json_object 模式：把 Schema 追加到首条 system 消息，没有则插入一条
fn embed_schema(messages: &mut Vec<Value>, schema: &OutputSchema) {
    let instruction = format!(
        "Respond with a single JSON object (\"{}\") matching this JSON schema:\n{}",
        schema.name, schema.schema
    );
    let has_system = messages.first().is_some_and(|m| m["role"] == "system");
    if has_system {
        let base = messages[0]["content"].as_str().unwrap_or_default().to_string();
        messages[0]["content"] = json!(format!("{}\n\n{}", base, instruction));
    } else {
        messages.insert(0, json!({ "role": "system", "content": instruction }));
    }
}

fn to_wire_message(m: &Message) -> Value {
    match m.role {
        Role::System => json!({ "role": "system", "content": m.content }),
        Role::User => json!({ "role": "user", "content": m.content }),
        Role::Tool => json!({
            "role": "tool",
            "tool_call_id": m.tool_call_id.clone().unwrap_or_default(),
            "content": m.content,
        }),
        Role::Assistant if m.tool_calls.is_empty() => {
            json!({ "role": "assistant", "content": m.content })
        }
        Role::Assistant => json!({
            "role": "assistant",
            "content": m.content,
            "tool_calls": m.tool_calls.iter().map(|c| json!({
                "id": c.id,
                "type": "function",
                "function": { "name": c.name, "arguments": c.args.to_string() },
            })).collect::<Vec<_>>(),
        }),
    }
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
    #[serde(default)]
    usage: Option<ChatUsage>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    id: String,
    function: WireFunction,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    name: String,
    #[serde(default)]
    arguments: String,
}

#[derive(Debug, Deserialize)]
struct ChatUsage {
    #[serde(default)]
    prompt_tokens: u64,
    #[serde(default)]
    completion_tokens: u64,
}

/// 将 SDK 错误映射为 LlmError
///
/// 带 type/code 的错误体来自 4xx：限流可重试，其余（参数、鉴权、额度）重试无意义；
/// 5xx 的错误体不是 JSON，没有 type，按瞬时 ApiError 处理。
fn map_openai_error(err: OpenAIError) -> LlmError {
    match err {
        OpenAIError::ApiError(api) => {
            let kind = format!(
                "{} {}",
                api.r#type.as_deref().unwrap_or_default(),
                api.code.as_deref().unwrap_or_default()
            )
            .to_lowercase();
            if kind.contains("insufficient_quota") {
                LlmError::InvalidRequest(api.to_string())
            } else if kind.contains("rate_limit") {
                LlmError::RateLimited { retry_after_ms: 0 }
            } else if api.r#type.is_some() || api.code.is_some() {
                LlmError::InvalidRequest(api.to_string())
            } else {
                LlmError::ApiError(api.to_string())
            }
        }
        OpenAIError::InvalidArgument(msg) => LlmError::InvalidRequest(msg),
        OpenAIError::JSONDeserialize(e, _) => LlmError::InvalidResponse(e.to_string()),
        other => {
            let msg = other.to_string();
            let lower = msg.to_lowercase();
            if lower.contains("timed out") || lower.contains("timeout") {
                LlmError::Timeout
            } else if lower.contains("error sending request") || lower.contains("connection") {
                LlmError::Network(msg)
            } else {
                LlmError::ApiError(msg)
            }
        }
    }
}

#[async_trait]
impl LlmClient for OpenAiClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let body = self.build_body(request);
        let response: ChatResponse =
            tokio::time::timeout(self.request_timeout, self.client.chat().create_byot(body))
                .await
                .map_err(|_| LlmError::Timeout)?
                .map_err(map_openai_error)?;

        if let Some(usage) = &response.usage {
            tracing::debug!(
                model = %self.model,
                prompt_tokens = usage.prompt_tokens,
                completion_tokens = usage.completion_tokens,
                "Token usage"
            );
        }

        let message = response
            .choices
            .into_iter()
            .next()
            .map(|c| c.message)
            .ok_or_else(|| LlmError::InvalidResponse("response has no choices".to_string()))?;

        let content = message.content.unwrap_or_default();
        let tool_calls = message
            .tool_calls
            .unwrap_or_default()
            .into_iter()
            .map(|c| {
                let args = if c.function.arguments.trim().is_empty() {
                    json!({})
                } else {
                    serde_json::from_str(&c.function.arguments)
                        .unwrap_or_else(|_| json!({ "raw": c.function.arguments }))
                };
                ToolCall::new(c.id, c.function.name, args)
            })
            .collect();

        let structured = request
            .output_schema
            .as_ref()
            .and_then(|_| extract_json_object(&content))
            .and_then(|json| serde_json::from_str::<Value>(json).ok());

        Ok(Completion {
            content,
            tool_calls,
            structured,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::RoutingDecision;
    use crate::llm::{OutputSchema, ToolSpec};

    #[test]
    fn test_body_carries_tools_schema_and_tool_messages() {
        let client = OpenAiClient::new(Some("http://localhost:1"), "test-model", Some("sk-test"));
        let call = ToolCall::new("call_1", "web_fetch", json!({ "url": "https://docs.rs" }));
        let request = CompletionRequest::new(vec![
            Message::system("sys"),
            Message::user("hi"),
            Message::assistant_tool_calls("", vec![call]),
            Message::tool("call_1", "page text"),
        ])
        .with_temperature(Some(0.0))
        .with_tools(vec![ToolSpec {
            name: "web_fetch".into(),
            description: "fetch".into(),
            parameters: json!({ "type": "object" }),
        }])
        .with_output_schema(OutputSchema::of::<RoutingDecision>("routing_decision"));

        let body = client.build_body(&request);
        assert_eq!(body["model"], "test-model");
        assert_eq!(body["tools"][0]["function"]["name"], "web_fetch");
        assert_eq!(body["response_format"]["json_schema"]["name"], "routing_decision");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[2]["tool_calls"][0]["id"], "call_1");
        assert_eq!(messages[3]["role"], "tool");
        assert_eq!(messages[3]["tool_call_id"], "call_1");
    }

    fn routing_request() -> CompletionRequest {
        CompletionRequest::new(vec![Message::system("route"), Message::user("compare A and B")])
            .with_output_schema(OutputSchema::of::<RoutingDecision>("routing_decision"))
    }

    #[test]
    fn test_openai_preset_sends_json_schema() {
        let client = OpenAiClient::new(Some("http://localhost:1"), "gpt-4o-mini", Some("sk-test"));
        let body = client.build_body(&routing_request());
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(body["messages"][0]["content"], "route");
    }

    #[test]
    fn test_deepseek_preset_sends_json_object_with_schema_in_system_prompt() {
        let client = crate::llm::create_deepseek_client(Some("deepseek-chat"), Some("http://localhost:1"));
        let body = client.build_body(&routing_request());
        assert_eq!(body["response_format"], json!({ "type": "json_object" }));
        let system = body["messages"][0]["content"].as_str().unwrap();
        assert!(system.starts_with("route\n\nRespond with a single JSON object"));
        assert!(system.contains("routing_decision"));
        assert!(system.contains("next_stage"));
        assert_eq!(body["messages"].as_array().unwrap().len(), 2);

        // 无 system 消息时插入一条；无 Schema 时不带 response_format
        let bare = CompletionRequest::new(vec![Message::user("hi")])
            .with_output_schema(OutputSchema::of::<RoutingDecision>("routing_decision"));
        let body = client.build_body(&bare);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "hi");
        let plain = client.build_body(&CompletionRequest::new(vec![Message::user("hi")]));
        assert!(plain.get("response_format").is_none());
    }

    fn api_error(kind: Option<&str>, code: Option<&str>) -> OpenAIError {
        OpenAIError::ApiError(async_openai::error::ApiError {
            message: "rejected".into(),
            r#type: kind.map(String::from),
            param: None,
            code: code.map(String::from),
        })
    }

    #[test]
    fn test_client_errors_are_not_transient() {
        let err = map_openai_error(api_error(Some("invalid_request_error"), None));
        assert!(matches!(err, LlmError::InvalidRequest(_)));
        assert!(!err.is_transient());

        let err = map_openai_error(api_error(Some("authentication_error"), Some("invalid_api_key")));
        assert!(!err.is_transient());
        let err = map_openai_error(api_error(Some("insufficient_quota"), None));
        assert!(!err.is_transient());
        let err = map_openai_error(OpenAIError::InvalidArgument("bad".into()));
        assert!(!err.is_transient());

        let err = map_openai_error(api_error(Some("requests"), Some("rate_limit_exceeded")));
        assert_eq!(err, LlmError::RateLimited { retry_after_ms: 0 });
        // 5xx：错误体不是 JSON，没有 type/code
        let err = map_openai_error(api_error(None, None));
        assert!(matches!(err, LlmError::ApiError(_)));
        assert!(err.is_transient());
    }
}
