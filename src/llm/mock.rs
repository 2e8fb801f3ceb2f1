//! Mock / Scripted LLM 客户端（无需 API）
//!
//! - MockLlmClient：按请求类型给出确定性回复，无 API Key 时也能离线跑通整个研究流程。
//! - ScriptedLlmClient：按顺序返回预设结果并记录收到的请求，供测试断言。

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::json;

use crate::llm::{Completion, CompletionRequest, LlmClient, LlmError};
use crate::memory::Role;

/// Mock 客户端：路由一律交给 researcher，critic 一次收敛，其余请求回显用户最后一条消息
#[derive(Debug, Default)]
pub struct MockLlmClient;

#[async_trait]
impl LlmClient for MockLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        let last_user = request
            .messages
            .iter()
            .rev()
            .find(|m| m.role == Role::User)
            .map(|m| m.content.as_str())
            .unwrap_or("(no input)");

        let completion = match request.output_schema.as_ref().map(|s| s.name.as_str()) {
            Some("routing_decision") => Completion::structured(json!({
                "next_stage": "researcher",
                "rationale": "Mock routing: gather evidence first",
            })),
            Some("assessment") => Completion::structured(json!({
                "needs_more_research": false,
                "gaps": [],
                "re_research_instructions": "",
                "synthesis": format!("Mock synthesis for: {}", last_user),
            })),
            _ if !request.tools.is_empty() => {
                Completion::text(format!("Mock research notes for: {}", last_user))
            }
            _ => Completion::text(format!("Mock summary of: {}", last_user)),
        };
        Ok(completion)
    }
}

/// 脚本化客户端：依次弹出预设结果；脚本耗尽后返回 InvalidResponse
#[derive(Debug, Default)]
pub struct ScriptedLlmClient {
    script: Mutex<VecDeque<Result<Completion, LlmError>>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlmClient {
    pub fn new(script: Vec<Result<Completion, LlmError>>) -> Self {
        Self {
            script: Mutex::new(script.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// 已收到的请求（按调用顺序）
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }

    pub fn call_count(&self) -> usize {
        self.requests.lock().map(|r| r.len()).unwrap_or(0)
    }

    /// 剩余未消费的脚本条数
    pub fn remaining(&self) -> usize {
        self.script.lock().map(|s| s.len()).unwrap_or(0)
    }
}

#[async_trait]
impl LlmClient for ScriptedLlmClient {
    async fn complete(&self, request: &CompletionRequest) -> Result<Completion, LlmError> {
        if let Ok(mut requests) = self.requests.lock() {
            requests.push(request.clone());
        }
        let next = self
            .script
            .lock()
            .map_err(|_| LlmError::InvalidResponse("script lock poisoned".to_string()))?
            .pop_front();
        next.unwrap_or_else(|| Err(LlmError::InvalidResponse("script exhausted".to_string())))
    }
}
