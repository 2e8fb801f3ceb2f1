//! Router：决定下一阶段
//!
//! 最后一条历史若是已收敛的 Assessment，直接交给 synthesizer，不再调用模型；
//! 否则发起一次 schema 约束的生成调用。决策无法解析时按 RecoveryEngine 回退到 researcher。
//! 决策以 JSON assistant 条目追加到 history。

use async_trait::async_trait;

use crate::core::{
    AgentError, Assessment, NextStage, RecoveryAction, RoutingDecision, SessionState, StateDelta,
};
use crate::llm::{CompletionRequest, OutputSchema};
use crate::memory::Message;
use crate::stages::prompts::{context_messages, with_summary, ROUTER_SYSTEM};
use crate::stages::StageNode;
use crate::workflow::GraphContext;

pub struct Router;

/// 最后一条历史已是收敛的 Assessment 时的强制决策
pub fn converged_override(state: &SessionState) -> Option<RoutingDecision> {
    let last = state.history.last()?;
    Assessment::parse_entry(last)
        .filter(Assessment::is_converged)
        .map(|_| RoutingDecision {
            next_stage: NextStage::Synthesizer,
            rationale: "Critic already converged on a synthesis; proceed to the final report."
                .to_string(),
        })
}

#[async_trait]
impl StageNode for Router {
    async fn run(&self, ctx: &GraphContext, state: &SessionState) -> Result<StateDelta, AgentError> {
        let decision = match converged_override(state) {
            Some(decision) => decision,
            None => {
                let request = CompletionRequest::new(context_messages(
                    with_summary(ROUTER_SYSTEM, &state.summary),
                    state,
                    ctx.settings.context_window,
                ))
                .with_temperature(ctx.settings.temperature)
                .with_output_schema(OutputSchema::of::<RoutingDecision>("routing_decision"));

                let completion = ctx.llm.complete(&request).await?;
                match completion.structured_as::<RoutingDecision>() {
                    Ok(decision) => decision,
                    Err(e) => {
                        let err = AgentError::RoutingParse(e);
                        match ctx.recovery.handle(&err) {
                            RecoveryAction::FallbackToResearcher => RoutingDecision {
                                next_stage: NextStage::Researcher,
                                rationale: "Routing output could not be parsed; defaulting to research."
                                    .to_string(),
                            },
                            _ => return Err(err),
                        }
                    }
                }
            }
        };

        tracing::info!(next = ?decision.next_stage, rationale = %decision.rationale, "Routing decision");
        let entry = serde_json::to_string(&decision).unwrap_or_default();
        Ok(StateDelta::default()
            .append(vec![Message::assistant(entry)])
            .with_route(decision.next_stage))
    }
}
