//! 调度器：驱动研究图逐跳执行
//!
//! 每跳：执行阶段 → 合并增量 → 选下一条边 → 写检查点 → 产出 Hop。
//! 跳与跳之间严格串行；取消只在跳边界生效，已持久化的检查点不受影响。
//!
//! 静态边：Researcher → Critic，Compaction → Router，Synthesizer → 结束。
//! 条件边：
//! - Router 之后：超过全局上限 → Synthesizer；history 超过窗口 → Compaction；否则按路由决定
//! - Critic 之后：超过全局上限 → Synthesizer；仍需研究 → Researcher；否则 → Synthesizer

use std::sync::Arc;

use futures_util::{pin_mut, stream, Stream, StreamExt};
use tokio_util::sync::CancellationToken;

use crate::core::{AgentError, SessionState, Stage, StateDelta};
use crate::memory::{Checkpoint, Message};
use crate::stages::node_for;
use crate::workflow::context::{GraphContext, GraphSettings};
use crate::workflow::types::{Hop, TurnOutcome};

/// 合并后的状态 + 本跳增量 → 下一阶段；None 表示本轮结束
pub fn next_stage(
    settings: &GraphSettings,
    stage: Stage,
    state: &SessionState,
    delta: &StateDelta,
) -> Option<Stage> {
    let over_cap = state.loop_count > settings.max_loop_count;
    match stage {
        Stage::Router => {
            if over_cap {
                tracing::warn!(loop_count = state.loop_count, "Max loops reached after router, forcing synthesis");
                Some(Stage::Synthesizer)
            } else if state.history.len() > settings.context_window {
                Some(Stage::Compaction)
            } else {
                Some(delta.route.map(Stage::from).unwrap_or(Stage::Researcher))
            }
        }
        Stage::Compaction => Some(Stage::Router),
        Stage::Researcher => Some(Stage::Critic),
        Stage::Critic => {
            if over_cap {
                tracing::warn!(loop_count = state.loop_count, "Max loops reached after critic, forcing synthesis");
                Some(Stage::Synthesizer)
            } else if state.needs_more_research {
                Some(Stage::Researcher)
            } else {
                Some(Stage::Synthesizer)
            }
        }
        Stage::Synthesizer => None,
    }
}

struct Run {
    ctx: Arc<GraphContext>,
    thread_id: String,
    state: SessionState,
    pending: Option<Stage>,
    cancel: CancellationToken,
}

impl Run {
    async fn persist(&self, next: Option<Stage>) -> Result<(), AgentError> {
        self.ctx
            .sessions
            .save(&self.thread_id, &Checkpoint::new(self.state.clone(), next))
            .await
    }

    /// 执行一跳；返回 None 表示流结束
    async fn step(mut self) -> Option<(Result<Hop, AgentError>, Option<Run>)> {
        let stage = self.pending.take()?;
        if self.cancel.is_cancelled() {
            tracing::info!(thread_id = %self.thread_id, stage = %stage, "Turn cancelled");
            return Some((Err(AgentError::Cancelled), None));
        }

        let node = node_for(stage);
        let result = tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(AgentError::Cancelled),
            result = node.run(&self.ctx, &self.state) => result,
        };

        let delta = match result {
            Ok(delta) => delta,
            Err(AgentError::Cancelled) => {
                tracing::info!(thread_id = %self.thread_id, stage = %stage, "Turn cancelled mid-hop");
                return Some((Err(AgentError::Cancelled), None));
            }
            Err(e) => {
                tracing::error!(thread_id = %self.thread_id, stage = %stage, error = %e, "Hop failed");
                self.state.error = Some(e.to_string());
                self.state.report = None;
                if let Err(save_err) = self.persist(None).await {
                    tracing::error!(error = %save_err, "Failed to persist failed turn");
                }
                return Some((Err(e), None));
            }
        };

        self.state.apply(&delta);
        let next = next_stage(&self.ctx.settings, stage, &self.state, &delta);
        let paused = next == Some(Stage::Synthesizer) && self.ctx.settings.interrupt_before_synthesis;

        tracing::info!(
            thread_id = %self.thread_id,
            stage = %stage,
            loop_count = self.state.loop_count,
            next = next.map(|s| s.as_str()).unwrap_or("end"),
            paused,
            "Hop completed"
        );

        if let Err(e) = self.persist(next).await {
            tracing::error!(thread_id = %self.thread_id, error = %e, "Failed to persist checkpoint");
            return Some((Err(e), None));
        }

        let hop = Hop {
            stage,
            delta,
            loop_count: self.state.loop_count,
            next,
        };
        if paused || next.is_none() {
            return Some((Ok(hop), None));
        }
        self.pending = next;
        Some((Ok(hop), Some(self)))
    }
}

/// 研究图调度器
pub struct Scheduler {
    ctx: Arc<GraphContext>,
}

impl Scheduler {
    pub fn new(ctx: Arc<GraphContext>) -> Self {
        Self { ctx }
    }

    pub fn context(&self) -> &Arc<GraphContext> {
        &self.ctx
    }

    /// 从 entry 阶段开始逐跳执行，每跳产出一个 Hop
    ///
    /// 流在以下情况结束：Synthesizer 完成；暂停在 Synthesizer 之前（最后一个 Hop 的 next 为 Some）；
    /// 某跳失败或被取消（产出 Err 后结束）。
    pub fn run(
        &self,
        thread_id: &str,
        state: SessionState,
        entry: Stage,
        cancel: CancellationToken,
    ) -> impl Stream<Item = Result<Hop, AgentError>> + Send + 'static {
        let run = Run {
            ctx: self.ctx.clone(),
            thread_id: thread_id.to_string(),
            state,
            pending: Some(entry),
            cancel,
        };
        stream::unfold(Some(run), |run| async move { run?.step().await })
    }

    /// 开始新一轮：载入检查点，重置本轮字段，从 Router 开始
    pub async fn run_turn(
        &self,
        thread_id: &str,
        input: &str,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let mut state = self
            .ctx
            .sessions
            .load(thread_id)
            .await?
            .map(|cp| cp.state)
            .unwrap_or_default();
        state.begin_turn(input);
        self.ctx
            .sessions
            .save(thread_id, &Checkpoint::new(state.clone(), Some(Stage::Router)))
            .await?;
        tracing::info!(thread_id, "Turn started");
        self.drive(thread_id, state, Stage::Router, cancel).await
    }

    /// 继续一个暂停的轮次：非空输入作为 user 条目追加，从待执行阶段进入
    pub async fn resume(
        &self,
        thread_id: &str,
        input: &str,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let checkpoint = self.ctx.sessions.load(thread_id).await?;
        let Some(Checkpoint {
            mut state,
            next_stage: Some(entry),
            ..
        }) = checkpoint
        else {
            return Err(AgentError::NothingToResume(thread_id.to_string()));
        };
        if !input.trim().is_empty() {
            state.history.push(Message::user(input.trim()));
        }
        tracing::info!(thread_id, entry = %entry, "Resuming turn");
        self.drive(thread_id, state, entry, cancel).await
    }

    /// 消费整条流，折叠为本轮结局
    pub async fn drive(
        &self,
        thread_id: &str,
        state: SessionState,
        entry: Stage,
        cancel: CancellationToken,
    ) -> Result<TurnOutcome, AgentError> {
        let hops = self.run(thread_id, state, entry, cancel);
        pin_mut!(hops);

        let mut last: Option<Hop> = None;
        while let Some(item) = hops.next().await {
            match item {
                Ok(hop) => last = Some(hop),
                Err(AgentError::Cancelled) => return Ok(TurnOutcome::Cancelled),
                Err(e) => return Ok(TurnOutcome::Failed { error: e.to_string() }),
            }
        }

        match last {
            Some(Hop {
                next: Some(next_stage),
                ..
            }) => Ok(TurnOutcome::Paused { next_stage }),
            Some(Hop { delta, .. }) => Ok(TurnOutcome::Completed {
                report: delta.report.unwrap_or_default(),
            }),
            None => Ok(TurnOutcome::Cancelled),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde_json::json;

    use crate::core::NextStage;
    use crate::llm::{Completion, LlmError, ScriptedLlmClient};
    use crate::tools::ToolRegistry;
    use crate::workflow::context::testing;

    fn route(stage: &str) -> Result<Completion, LlmError> {
        Ok(Completion::structured(json!({ "next_stage": stage, "rationale": "test" })))
    }

    fn assessment(needs: bool, synthesis: &str) -> Result<Completion, LlmError> {
        let (gaps, instructions) = if needs {
            (vec!["more detail"], "dig deeper")
        } else {
            (Vec::new(), "")
        };
        Ok(Completion::structured(json!({
            "needs_more_research": needs,
            "gaps": gaps,
            "re_research_instructions": instructions,
            "synthesis": synthesis
        })))
    }

    fn scheduler(
        script: Vec<Result<Completion, LlmError>>,
        settings: GraphSettings,
    ) -> (Scheduler, Arc<ScriptedLlmClient>) {
        let llm = Arc::new(ScriptedLlmClient::new(script));
        let (ctx, _) = testing::context_with(llm.clone(), ToolRegistry::new(), settings);
        (Scheduler::new(Arc::new(ctx)), llm)
    }

    #[test]
    fn test_router_edge_priority() {
        let settings = GraphSettings {
            max_loop_count: 15,
            context_window: 6,
            ..GraphSettings::default()
        };
        let delta = StateDelta::default().with_route(NextStage::Critic);
        let mut state = SessionState::default();
        state.history = vec![Message::user("q")];
        state.loop_count = 1;
        assert_eq!(next_stage(&settings, Stage::Router, &state, &delta), Some(Stage::Critic));
        assert_eq!(
            next_stage(&settings, Stage::Router, &state, &StateDelta::default()),
            Some(Stage::Researcher)
        );

        state.history = (0..7).map(|i| Message::user(format!("m{i}"))).collect();
        assert_eq!(next_stage(&settings, Stage::Router, &state, &delta), Some(Stage::Compaction));

        state.loop_count = 16;
        assert_eq!(next_stage(&settings, Stage::Router, &state, &delta), Some(Stage::Synthesizer));
    }

    #[test]
    fn test_static_and_critic_edges() {
        let settings = GraphSettings::default();
        let mut state = SessionState::default();
        let none = StateDelta::default();
        assert_eq!(next_stage(&settings, Stage::Compaction, &state, &none), Some(Stage::Router));
        assert_eq!(next_stage(&settings, Stage::Researcher, &state, &none), Some(Stage::Critic));
        assert_eq!(next_stage(&settings, Stage::Synthesizer, &state, &none), None);

        state.needs_more_research = true;
        assert_eq!(next_stage(&settings, Stage::Critic, &state, &none), Some(Stage::Researcher));
        state.loop_count = settings.max_loop_count + 1;
        assert_eq!(next_stage(&settings, Stage::Critic, &state, &none), Some(Stage::Synthesizer));
        state.loop_count = 0;
        state.needs_more_research = false;
        assert_eq!(next_stage(&settings, Stage::Critic, &state, &none), Some(Stage::Synthesizer));
    }

    #[tokio::test]
    async fn test_natural_convergence_completes_turn() {
        let (scheduler, llm) = scheduler(
            vec![
                route("researcher"),
                Ok(Completion::text("notes about both")),
                assessment(false, "A wins."),
            ],
            GraphSettings::default(),
        );
        let outcome = scheduler
            .run_turn("t1", "compare a and b", CancellationToken::new())
            .await
            .unwrap();
        let TurnOutcome::Completed { report } = outcome else {
            panic!("expected completion, got {:?}", outcome);
        };
        assert!(report.contains("A wins."));
        assert_eq!(llm.call_count(), 3);

        let cp = scheduler.context().sessions.load("t1").await.unwrap().unwrap();
        assert_eq!(cp.next_stage, None);
        assert_eq!(cp.state.loop_count, 4);
        assert_eq!(cp.state.report.as_deref(), Some(report.as_str()));
        assert!(cp.state.error.is_none());
    }

    #[tokio::test]
    async fn test_hops_stream_in_order_with_increasing_loop_count() {
        let (scheduler, _) = scheduler(
            vec![
                route("researcher"),
                Ok(Completion::text("notes")),
                assessment(false, "done"),
            ],
            GraphSettings::default(),
        );
        let mut state = SessionState::default();
        state.begin_turn("q");
        let hops: Vec<_> = scheduler
            .run("t", state, Stage::Router, CancellationToken::new())
            .collect()
            .await;
        let stages: Vec<_> = hops.iter().map(|h| h.as_ref().unwrap().stage).collect();
        assert_eq!(
            stages,
            vec![Stage::Router, Stage::Researcher, Stage::Critic, Stage::Synthesizer]
        );
        let counts: Vec<_> = hops.iter().map(|h| h.as_ref().unwrap().loop_count).collect();
        assert_eq!(counts, vec![1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_long_history_is_compacted_once_then_routed_again() {
        let settings = GraphSettings {
            context_window: 4,
            critic_max_loops: 10,
            ..GraphSettings::default()
        };
        let (scheduler, llm) = scheduler(
            vec![
                route("researcher"),
                Ok(Completion::text("Earlier the user compared X and Y.")),
                route("researcher"),
                Ok(Completion::text("notes one")),
                assessment(true, ""),
                Ok(Completion::text("notes two")),
                assessment(false, "Done."),
            ],
            settings,
        );
        let mut state = SessionState::default();
        state.history = vec![
            Message::user("compare X and Y"),
            Message::assistant("X is older"),
            Message::user("and performance?"),
            Message::assistant("Y is faster"),
            Message::assistant("more notes"),
            Message::user("now compare their licensing"),
        ];

        let hops: Vec<_> = scheduler
            .run("long", state, Stage::Router, CancellationToken::new())
            .collect()
            .await;
        let stages: Vec<_> = hops.iter().map(|h| h.as_ref().unwrap().stage).collect();
        assert_eq!(
            stages,
            vec![
                Stage::Router,
                Stage::Compaction,
                Stage::Router,
                Stage::Researcher,
                Stage::Critic,
                Stage::Researcher,
                Stage::Critic,
                Stage::Synthesizer,
            ]
        );
        let counts: Vec<_> = hops.iter().map(|h| h.as_ref().unwrap().loop_count).collect();
        assert_eq!(counts, (1..=8).collect::<Vec<u32>>());
        assert_eq!(llm.call_count(), 7);

        // 压缩后的 Router 请求带上 running summary，且历史只剩最近的用户请求
        let second_route = &llm.requests()[2];
        assert!(second_route.messages[0]
            .content
            .contains("Running summary:\nEarlier the user compared X and Y."));
        assert_eq!(second_route.messages[1].content, "now compare their licensing");
        assert!(!second_route.messages.iter().any(|m| m.content == "X is older"));

        let cp = scheduler.context().sessions.load("long").await.unwrap().unwrap();
        assert_eq!(cp.state.summary, "Earlier the user compared X and Y.");
        assert!(cp.state.history.len() > 4);
        assert_eq!(cp.next_stage, None);
    }

    #[tokio::test]
    async fn test_critic_cap_forces_termination() {
        let (scheduler, llm) = scheduler(
            vec![
                route("researcher"),
                Ok(Completion::text("round one")),
                assessment(true, ""),
                Ok(Completion::text("round two")),
                assessment(true, ""),
                Ok(Completion::structured(json!({
                    "needs_more_research": false,
                    "synthesis": "Forced answer."
                }))),
            ],
            GraphSettings::default(),
        );
        let outcome = scheduler
            .run_turn("t2", "endless question", CancellationToken::new())
            .await
            .unwrap();
        match outcome {
            TurnOutcome::Completed { report } => assert!(report.contains("Forced answer.")),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(llm.remaining(), 0);
    }

    #[tokio::test]
    async fn test_scheduler_cap_overrides_router_decision() {
        let settings = GraphSettings {
            max_loop_count: 0,
            ..GraphSettings::default()
        };
        let (scheduler, llm) = scheduler(vec![route("researcher")], settings);
        let outcome = scheduler
            .run_turn("t3", "q", CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::Completed { .. }));
        assert_eq!(llm.call_count(), 1);
    }

    #[tokio::test]
    async fn test_pause_before_synthesis_and_resume() {
        let settings = GraphSettings {
            interrupt_before_synthesis: true,
            ..GraphSettings::default()
        };
        let (scheduler, _) = scheduler(vec![route("synthesizer")], settings);
        let outcome = scheduler
            .run_turn("t4", "q", CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome, TurnOutcome::Paused { next_stage: Stage::Synthesizer });
        let cp = scheduler.context().sessions.load("t4").await.unwrap().unwrap();
        assert_eq!(cp.next_stage, Some(Stage::Synthesizer));
        assert!(cp.state.report.is_none());

        let outcome = scheduler
            .resume("t4", "approved", CancellationToken::new())
            .await
            .unwrap();
        assert!(matches!(outcome, TurnOutcome::Completed { .. }));
        let cp = scheduler.context().sessions.load("t4").await.unwrap().unwrap();
        assert_eq!(cp.next_stage, None);
        assert!(cp.state.history.iter().any(|m| m.content == "approved"));

        let err = scheduler
            .resume("t4", "again", CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err, AgentError::NothingToResume("t4".into()));
    }

    #[tokio::test]
    async fn test_failed_hop_records_error_without_report() {
        let (scheduler, _) = scheduler(
            vec![Err(LlmError::ApiError("upstream down".into()))],
            GraphSettings::default(),
        );
        let outcome = scheduler
            .run_turn("t5", "q", CancellationToken::new())
            .await
            .unwrap();
        let TurnOutcome::Failed { error } = outcome else {
            panic!("expected failure");
        };
        assert!(error.contains("upstream down"));
        let cp = scheduler.context().sessions.load("t5").await.unwrap().unwrap();
        assert!(cp.state.error.is_some());
        assert!(cp.state.report.is_none());
        assert_eq!(cp.next_stage, None);
    }

    #[tokio::test]
    async fn test_cancel_before_first_hop_keeps_checkpoint() {
        let (scheduler, llm) = scheduler(vec![route("researcher")], GraphSettings::default());
        let cancel = CancellationToken::new();
        cancel.cancel();
        let outcome = scheduler.run_turn("t6", "q", cancel).await.unwrap();
        assert_eq!(outcome, TurnOutcome::Cancelled);
        assert_eq!(llm.call_count(), 0);
        let cp = scheduler.context().sessions.load("t6").await.unwrap().unwrap();
        assert_eq!(cp.next_stage, Some(Stage::Router));
        assert_eq!(cp.state.loop_count, 0);
    }

    #[tokio::test]
    async fn test_new_turn_resets_but_keeps_summary() {
        let (scheduler, _) = scheduler(
            vec![route("synthesizer"), route("synthesizer")],
            GraphSettings::default(),
        );
        scheduler.run_turn("t7", "first", CancellationToken::new()).await.unwrap();
        let mut cp = scheduler.context().sessions.load("t7").await.unwrap().unwrap();
        cp.state.summary = "carried".into();
        scheduler.context().sessions.save("t7", &cp).await.unwrap();

        scheduler.run_turn("t7", "second", CancellationToken::new()).await.unwrap();
        let cp = scheduler.context().sessions.load("t7").await.unwrap().unwrap();
        assert_eq!(cp.state.summary, "carried");
        assert_eq!(cp.state.history[0], Message::user("second"));
        assert_eq!(cp.state.loop_count, 2);
    }
}
