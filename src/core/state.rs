//! 会话状态与每跳的状态增量
//!
//! 每个阶段（跳）只产出 StateDelta，由调度器在跳结束后通过 `SessionState::apply` 合并：
//! 标量字段按键覆盖，history / research_results 追加（Compaction 通过 Replace 整体替换 history）。
//! 合并时 loop_count 恰好 +1。

use std::fmt;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::memory::{Message, Role};

/// 图中的阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Router,
    Compaction,
    Researcher,
    Critic,
    Synthesizer,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Router => "router",
            Stage::Compaction => "compaction",
            Stage::Researcher => "researcher",
            Stage::Critic => "critic",
            Stage::Synthesizer => "synthesizer",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Router 可选择的下一阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum NextStage {
    Researcher,
    Critic,
    Synthesizer,
}

impl From<NextStage> for Stage {
    fn from(next: NextStage) -> Self {
        match next {
            NextStage::Researcher => Stage::Researcher,
            NextStage::Critic => Stage::Critic,
            NextStage::Synthesizer => Stage::Synthesizer,
        }
    }
}

/// Router 的结构化输出
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
pub struct RoutingDecision {
    /// 下一步交给哪个阶段
    pub next_stage: NextStage,
    /// 选择理由
    #[serde(default)]
    pub rationale: String,
}

/// Critic 的结构化输出
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
pub struct Assessment {
    /// 现有证据是否仍不足
    pub needs_more_research: bool,
    /// 尚未覆盖的方面
    #[serde(default)]
    pub gaps: Vec<String>,
    /// 给 researcher 的补充研究指令
    #[serde(default)]
    pub re_research_instructions: String,
    /// 基于已有证据的综合结论
    #[serde(default)]
    pub synthesis: String,
}

impl Assessment {
    /// 尝试把一条历史条目解析为 Assessment（仅 assistant 条目）
    pub fn parse_entry(entry: &Message) -> Option<Self> {
        if entry.role != Role::Assistant {
            return None;
        }
        let text = entry.content.trim();
        if !text.starts_with('{') {
            return None;
        }
        serde_json::from_str(text).ok()
    }

    /// 已收敛：不再需要研究且给出了非空综合结论
    pub fn is_converged(&self) -> bool {
        !self.needs_more_research && !self.synthesis.trim().is_empty()
    }
}

/// 一条研究产出及其来源定位（URL 或 "unknown"）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResearchArtifact {
    pub text: String,
    pub source_locator: String,
}

impl ResearchArtifact {
    pub fn new(text: impl Into<String>, source_locator: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            source_locator: source_locator.into(),
        }
    }
}

/// 每个 thread 一份的会话状态
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SessionState {
    pub history: Vec<Message>,
    #[serde(default)]
    pub summary: String,
    #[serde(default)]
    pub research_results: Vec<ResearchArtifact>,
    #[serde(default)]
    pub needs_more_research: bool,
    #[serde(default)]
    pub loop_count: u32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub report: Option<String>,
}

impl SessionState {
    /// 新一轮开始：history 只保留本次请求，清空研究结果与计数，summary 保留
    pub fn begin_turn(&mut self, user_input: &str) {
        self.history = vec![Message::user(user_input)];
        self.research_results.clear();
        self.needs_more_research = true;
        self.loop_count = 0;
        self.error = None;
        self.report = None;
    }

    /// 合并一跳的增量，loop_count +1
    pub fn apply(&mut self, delta: &StateDelta) {
        match &delta.history {
            Some(HistoryUpdate::Append(entries)) => self.history.extend(entries.iter().cloned()),
            Some(HistoryUpdate::Replace(entries)) => self.history = entries.clone(),
            None => {}
        }
        if let Some(summary) = &delta.summary {
            self.summary = summary.clone();
        }
        self.research_results
            .extend(delta.research_results.iter().cloned());
        if let Some(needs) = delta.needs_more_research {
            self.needs_more_research = needs;
        }
        if let Some(report) = &delta.report {
            self.report = Some(report.clone());
        }
        self.loop_count += 1;
    }

    /// 最近一条可解析的 Assessment
    pub fn latest_assessment(&self) -> Option<Assessment> {
        self.history.iter().rev().find_map(Assessment::parse_entry)
    }
}

/// history 的更新方式
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum HistoryUpdate {
    Append(Vec<Message>),
    Replace(Vec<Message>),
}

/// 一跳产出的部分状态
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct StateDelta {
    pub history: Option<HistoryUpdate>,
    pub summary: Option<String>,
    pub research_results: Vec<ResearchArtifact>,
    pub needs_more_research: Option<bool>,
    /// Router 的决定（不写入状态，只供调度器选边）
    pub route: Option<NextStage>,
    pub report: Option<String>,
}

impl StateDelta {
    pub fn append(mut self, entries: Vec<Message>) -> Self {
        self.history = Some(HistoryUpdate::Append(entries));
        self
    }

    pub fn replace_history(mut self, entries: Vec<Message>) -> Self {
        self.history = Some(HistoryUpdate::Replace(entries));
        self
    }

    pub fn with_summary(mut self, summary: impl Into<String>) -> Self {
        self.summary = Some(summary.into());
        self
    }

    pub fn with_results(mut self, results: Vec<ResearchArtifact>) -> Self {
        self.research_results = results;
        self
    }

    pub fn with_needs_more_research(mut self, needs: bool) -> Self {
        self.needs_more_research = Some(needs);
        self
    }

    pub fn with_route(mut self, route: NextStage) -> Self {
        self.route = Some(route);
        self
    }

    pub fn with_report(mut self, report: impl Into<String>) -> Self {
        self.report = Some(report.into());
        self
    }

    /// 本跳追加的 history 条目（Replace 时为空）
    pub fn appended(&self) -> &[Message] {
        match &self.history {
            Some(HistoryUpdate::Append(entries)) => entries,
            _ => &[],
        }
    }
}
