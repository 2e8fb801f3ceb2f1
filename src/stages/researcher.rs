//! Researcher：带工具绑定的证据收集
//!
//! 1. 绑定工具发起生成调用
//! 2. 每个工具调用恰好执行一次，原始输出与调用 id 配对（默认顺序执行，可配置并发）
//! 3. 有工具输出时再发起一次生成调用得到最终回复
//! 4. 每条非空工具输出按 `url` 参数（缺省 "unknown"）写入知识库并追加为研究产出
//!
//! 未注册的工具跳过；工具执行失败或超时使本跳失败，不做工具级重试。

use async_trait::async_trait;
use futures_util::future::join_all;

use crate::core::{AgentError, RecoveryAction, ResearchArtifact, SessionState, StateDelta};
use crate::llm::{CompletionRequest, ToolCall};
use crate::memory::{Message, UNKNOWN_SOURCE};
use crate::stages::prompts::{context_messages, with_summary, RESEARCHER_SYSTEM};
use crate::stages::StageNode;
use crate::workflow::GraphContext;

pub struct Researcher;

/// 工具调用的来源定位：`url` 参数，缺省为 "unknown"
pub fn source_locator(call: &ToolCall) -> String {
    call.args
        .get("url")
        .and_then(|v| v.as_str())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(UNKNOWN_SOURCE)
        .to_string()
}

/// 按 RecoveryEngine 处理单个调用结果：跳过的返回 None，致命错误向上传播
fn settle(
    ctx: &GraphContext,
    call: &ToolCall,
    result: Result<String, AgentError>,
) -> Result<Option<String>, AgentError> {
    match result {
        Ok(output) => Ok(Some(output)),
        Err(err) => match ctx.recovery.handle(&err) {
            RecoveryAction::SkipTool => {
                tracing::warn!(tool = %call.name, id = %call.id, "Skipping unknown tool call");
                Ok(None)
            }
            _ => Err(err),
        },
    }
}

async fn run_tool_calls(
    ctx: &GraphContext,
    calls: &[ToolCall],
) -> Result<Vec<(ToolCall, String)>, AgentError> {
    let mut executed = Vec::with_capacity(calls.len());
    if ctx.settings.parallel_tool_calls {
        let results = join_all(
            calls
                .iter()
                .map(|call| ctx.tools.execute(&call.name, call.args.clone())),
        )
        .await;
        for (call, result) in calls.iter().zip(results) {
            if let Some(output) = settle(ctx, call, result)? {
                executed.push((call.clone(), output));
            }
        }
    } else {
        for call in calls {
            let result = ctx.tools.execute(&call.name, call.args.clone()).await;
            if let Some(output) = settle(ctx, call, result)? {
                executed.push((call.clone(), output));
            }
        }
    }
    Ok(executed)
}

#[async_trait]
impl StageNode for Researcher {
    async fn run(&self, ctx: &GraphContext, state: &SessionState) -> Result<StateDelta, AgentError> {
        let messages = context_messages(
            with_summary(RESEARCHER_SYSTEM, &state.summary),
            state,
            ctx.settings.context_window,
        );
        let tools = ctx.tools.specs();
        let request = CompletionRequest::new(messages.clone())
            .with_temperature(ctx.settings.temperature)
            .with_tools(tools.clone());

        let first = ctx.llm.complete(&request).await?;
        let executed = run_tool_calls(ctx, &first.tool_calls).await?;

        let final_response = if executed.is_empty() {
            first
        } else {
            let mut follow_up = messages;
            follow_up.push(Message::assistant_tool_calls(
                first.content.clone(),
                executed.iter().map(|(call, _)| call.clone()).collect(),
            ));
            follow_up.extend(
                executed
                    .iter()
                    .map(|(call, output)| Message::tool(call.id.clone(), output.clone())),
            );
            let request = CompletionRequest::new(follow_up)
                .with_temperature(ctx.settings.temperature)
                .with_tools(tools);
            ctx.llm.complete(&request).await?
        };
        let content = final_response.content.trim().to_string();

        let mut artifacts = Vec::new();
        for (call, output) in executed.iter().filter(|(_, out)| !out.is_empty()) {
            let locator = source_locator(call);
            if let Err(e) = ctx.knowledge.store(output, &call.name, &locator) {
                tracing::warn!(tool = %call.name, source = %locator, error = %e, "Failed to store research");
            }
            artifacts.push(ResearchArtifact::new(output.clone(), locator));
        }
        if !content.is_empty() {
            artifacts.push(ResearchArtifact::new(content.clone(), UNKNOWN_SOURCE));
        }

        tracing::info!(
            tool_calls = executed.len(),
            artifacts = artifacts.len(),
            "Researcher finished"
        );
        Ok(StateDelta::default()
            .append(vec![Message::assistant(content)])
            .with_results(artifacts))
    }
}
