//! Critic：审查证据、给出结构化 Assessment
//!
//! 系统提示由四部分拼成：审查说明、running summary、已收集的研究结果、知识库检索到的相关事实。
//! loop_count 达到 critic_max_loops 且仍判定需要研究时，追加一次强制综合调用并改判为已收敛。

use async_trait::async_trait;

use crate::core::{AgentError, Assessment, SessionState, StateDelta};
use crate::llm::{extract_json_object, CompletionRequest, OutputSchema};
use crate::memory::{last_user_request, Message};
use crate::stages::prompts::{
    context_messages, CRITIC_SYSTEM, FORCED_SYNTHESIS_FALLBACK, FORCED_SYNTHESIS_INSTRUCTION,
};
use crate::stages::StageNode;
use crate::workflow::GraphContext;

pub struct Critic;

fn system_prompt(ctx: &GraphContext, state: &SessionState) -> String {
    let mut parts = vec![CRITIC_SYSTEM.to_string()];

    let summary = state.summary.trim();
    if !summary.is_empty() {
        parts.push(format!("Running summary:\n{}", summary));
    }

    if !state.research_results.is_empty() {
        let joined = state
            .research_results
            .iter()
            .map(|r| r.text.as_str())
            .collect::<Vec<_>>()
            .join("\n---\n");
        parts.push(format!("Research results:\n{}", joined));
    }

    let query = last_user_request(&state.history)
        .map(|m| m.content.as_str())
        .unwrap_or_default();
    match ctx.knowledge.retrieve(query, ctx.settings.critic_k) {
        Ok(hits) if !hits.is_empty() => {
            let facts = hits
                .iter()
                .map(|h| format!("[{}] {}", h.source_locator, h.text))
                .collect::<Vec<_>>()
                .join("\n");
            parts.push(format!("Knowledge store facts:\n{}", facts));
        }
        Ok(_) => {}
        Err(e) => tracing::warn!(error = %e, "Knowledge retrieval failed, reviewing without it"),
    }

    parts.join("\n\n")
}

/// 强制综合：structured.synthesis 优先，其次非 JSON 的自由文本，最后是固定兜底文案
async fn forced_synthesis(
    ctx: &GraphContext,
    messages: &[Message],
) -> Result<String, AgentError> {
    let mut messages = messages.to_vec();
    messages.push(Message::user(FORCED_SYNTHESIS_INSTRUCTION));
    let request = CompletionRequest::new(messages)
        .with_temperature(ctx.settings.temperature)
        .with_output_schema(OutputSchema::of::<Assessment>("assessment"));
    let completion = ctx.llm.complete(&request).await?;

    if let Ok(parsed) = completion.structured_as::<Assessment>() {
        if !parsed.synthesis.trim().is_empty() {
            return Ok(parsed.synthesis.trim().to_string());
        }
    }
    let text = completion.content.trim();
    if !text.is_empty() && extract_json_object(text).is_none() {
        return Ok(text.to_string());
    }
    Ok(FORCED_SYNTHESIS_FALLBACK.to_string())
}

#[async_trait]
impl StageNode for Critic {
    async fn run(&self, ctx: &GraphContext, state: &SessionState) -> Result<StateDelta, AgentError> {
        let messages = context_messages(
            system_prompt(ctx, state),
            state,
            ctx.settings.context_window,
        );
        let request = CompletionRequest::new(messages.clone())
            .with_temperature(ctx.settings.temperature)
            .with_output_schema(OutputSchema::of::<Assessment>("assessment"));
        let completion = ctx.llm.complete(&request).await?;

        let mut assessment = completion
            .structured_as::<Assessment>()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Assessment could not be parsed, requesting more research");
                Assessment {
                    needs_more_research: true,
                    gaps: vec![format!("Assessment could not be parsed: {}", e)],
                    ..Default::default()
                }
            });

        if assessment.needs_more_research && state.loop_count >= ctx.settings.critic_max_loops {
            tracing::warn!(
                loop_count = state.loop_count,
                limit = ctx.settings.critic_max_loops,
                "Critic loop limit reached, forcing synthesis"
            );
            assessment.synthesis = forced_synthesis(ctx, &messages).await?;
            assessment.needs_more_research = false;
            assessment.re_research_instructions.clear();
        }

        tracing::info!(
            needs_more_research = assessment.needs_more_research,
            gaps = assessment.gaps.len(),
            "Assessment"
        );

        let mut entries = vec![Message::assistant(
            serde_json::to_string(&assessment).unwrap_or_default(),
        )];
        let instructions = assessment.re_research_instructions.trim();
        if assessment.needs_more_research && !instructions.is_empty() {
            entries.push(Message::assistant(format!(
                "Re-research instructions:\n{}",
                instructions
            )));
        }

        Ok(StateDelta::default()
            .append(entries)
            .with_needs_more_research(assessment.needs_more_research))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use crate::core::ResearchArtifact;
    use crate::llm::{Completion, ScriptedLlmClient};
    use crate::memory::KnowledgeStore;
    use crate::workflow::context::testing;

    fn state(loop_count: u32) -> SessionState {
        let mut state = SessionState::default();
        state.begin_turn("compare sqlite and postgres");
        state.loop_count = loop_count;
        state.research_results = vec![
            ResearchArtifact::new("sqlite is embedded", "https://sqlite.org"),
            ResearchArtifact::new("postgres is a server", "unknown"),
        ];
        state
    }

    fn needs_more() -> Completion {
        Completion::structured(json!({
            "needs_more_research": true,
            "gaps": ["concurrency model"],
            "re_research_instructions": "Look up WAL mode",
            "synthesis": ""
        }))
    }

    #[tokio::test]
    async fn test_prompt_includes_results_and_knowledge_facts() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![Ok(Completion::structured(json!({
            "needs_more_research": false,
            "synthesis": "SQLite embeds, Postgres serves."
        })))]));
        let (ctx, knowledge) = testing::context(llm.clone());
        knowledge
            .store("sqlite and postgres differ in deployment", "web_fetch", "https://db.dev")
            .unwrap();

        let delta = Critic.run(&ctx, &state(1)).await.unwrap();
        assert_eq!(delta.needs_more_research, Some(false));
        assert_eq!(delta.appended().len(), 1);

        let system = &llm.requests()[0].messages[0].content;
        assert!(system.contains("raw tool outputs under \"Research results\""));
        assert!(!system.contains("in the history"));
        assert!(system.contains("Research results:\nsqlite is embedded\n---\npostgres is a server"));
        assert!(system.contains("Knowledge store facts:\n[https://db.dev] sqlite and postgres"));
        assert_eq!(llm.requests()[0].output_schema.as_ref().unwrap().name, "assessment");
    }

    #[tokio::test]
    async fn test_gaps_add_re_research_entry() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![Ok(needs_more())]));
        let (ctx, _) = testing::context(llm);
        let delta = Critic.run(&ctx, &state(1)).await.unwrap();
        assert_eq!(delta.needs_more_research, Some(true));
        let entries = delta.appended();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].content, "Re-research instructions:\nLook up WAL mode");
        let parsed = Assessment::parse_entry(&entries[0]).unwrap();
        assert_eq!(parsed.gaps, vec!["concurrency model"]);
    }

    #[tokio::test]
    async fn test_forced_convergence_at_loop_limit() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            Ok(needs_more()),
            Ok(Completion::structured(json!({
                "needs_more_research": true,
                "synthesis": "Best effort: SQLite for embedded use."
            }))),
        ]));
        let (ctx, _) = testing::context(llm.clone());
        let delta = Critic.run(&ctx, &state(3)).await.unwrap();

        assert_eq!(llm.call_count(), 2);
        assert_eq!(delta.needs_more_research, Some(false));
        let entries = delta.appended();
        assert_eq!(entries.len(), 1);
        let parsed = Assessment::parse_entry(&entries[0]).unwrap();
        assert!(parsed.is_converged());
        assert_eq!(parsed.synthesis, "Best effort: SQLite for embedded use.");
        assert_eq!(parsed.gaps, vec!["concurrency model"]);

        let forced = &llm.requests()[1].messages;
        assert_eq!(forced.last().unwrap().content, FORCED_SYNTHESIS_INSTRUCTION);
    }

    #[tokio::test]
    async fn test_forced_convergence_falls_back_to_fixed_text() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![
            Ok(needs_more()),
            Ok(Completion::text("")),
        ]));
        let (ctx, _) = testing::context(llm);
        let delta = Critic.run(&ctx, &state(5)).await.unwrap();
        let parsed = Assessment::parse_entry(&delta.appended()[0]).unwrap();
        assert_eq!(parsed.synthesis, FORCED_SYNTHESIS_FALLBACK);
    }

    #[tokio::test]
    async fn test_unparseable_assessment_requests_research() {
        let llm = Arc::new(ScriptedLlmClient::new(vec![Ok(Completion::text("looks fine to me"))]));
        let (ctx, _) = testing::context(llm);
        let delta = Critic.run(&ctx, &state(0)).await.unwrap();
        assert_eq!(delta.needs_more_research, Some(true));
        let parsed = Assessment::parse_entry(&delta.appended()[0]).unwrap();
        assert!(parsed.gaps[0].starts_with("Assessment could not be parsed"));
    }
}
