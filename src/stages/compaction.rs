//! Compaction：把超出窗口的历史压缩为 running summary
//!
//! 一次生成调用（剪枝后的历史 + 压缩指令，附带上一版 summary），结果替换 summary；
//! history 只保留最近一条用户请求，避免丢失当前任务。

use async_trait::async_trait;

use crate::core::{AgentError, SessionState, StateDelta};
use crate::llm::CompletionRequest;
use crate::memory::last_user_request;
use crate::stages::prompts::{context_messages, with_summary, COMPACTION_SYSTEM};
use crate::stages::StageNode;
use crate::workflow::GraphContext;

pub struct Compaction;

#[async_trait]
impl StageNode for Compaction {
    async fn run(&self, ctx: &GraphContext, state: &SessionState) -> Result<StateDelta, AgentError> {
        let request = CompletionRequest::new(context_messages(
            with_summary(COMPACTION_SYSTEM, &state.summary),
            state,
            ctx.settings.context_window,
        ))
        .with_temperature(ctx.settings.temperature);

        let completion = ctx.llm.complete(&request).await?;
        let summary = completion.content.trim().to_string();
        let kept: Vec<_> = last_user_request(&state.history).cloned().into_iter().collect();

        tracing::info!(
            dropped = state.history.len().saturating_sub(kept.len()),
            summary_chars = summary.chars().count(),
            "Compacted history into running summary"
        );
        Ok(StateDelta::default()
            .with_summary(summary)
            .replace_history(kept))
    }
}
