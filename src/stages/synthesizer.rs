//! Synthesizer：纯格式化，不调用模型
//!
//! 报告各节按固定顺序拼接（节之间空一行）：
//! 执行摘要 → 对比矩阵（可选）→ 详细分析 → 研究结果摘录 → 来源引用（可选）。

use std::sync::OnceLock;

use async_trait::async_trait;
use regex::Regex;

use crate::core::{AgentError, SessionState, StateDelta};
use crate::memory::{last_user_request, KnowledgeHit, Message, UNKNOWN_SOURCE};
use crate::stages::StageNode;
use crate::workflow::GraphContext;

const SNIPPET_MAX_CHARS: usize = 400;
const GENERIC_LEAD: &str = "Research completed. See details below for the gathered information.";
const NO_INFORMATION: &str = "No summary or research results available for the current query.";
const NO_RESULTS: &str = "No research results available.";

pub struct Synthesizer;

fn comparison_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?is)COMPARISON_DATA\s*:\s*(.+?)(?:\n\s*\n|\z)").expect("static regex")
    })
}

fn marker_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?i)COMPARISON_DATA\s*:").expect("static regex"))
}

/// 最近一次 Assessment 的综合结论（可能为空）
fn latest_synthesis(state: &SessionState) -> String {
    state
        .latest_assessment()
        .map(|a| a.synthesis.trim().to_string())
        .unwrap_or_default()
}

/// 报告开头文本：综合结论 > summary > 通用提示（有研究结果时）> 无信息提示
pub fn lead_text(state: &SessionState) -> String {
    let synthesis = latest_synthesis(state);
    if !synthesis.is_empty() {
        return synthesis;
    }
    let summary = state.summary.trim();
    if !summary.is_empty() {
        return summary.to_string();
    }
    if !state.research_results.is_empty() {
        return GENERIC_LEAD.to_string();
    }
    NO_INFORMATION.to_string()
}

/// 引用检索的查询：综合结论 > summary > 最近的用户请求
pub fn citation_query(state: &SessionState) -> String {
    let synthesis = latest_synthesis(state);
    if !synthesis.is_empty() {
        return synthesis;
    }
    let summary = state.summary.trim();
    if !summary.is_empty() {
        return summary.to_string();
    }
    last_user_request(&state.history)
        .map(|m| m.content.trim().to_string())
        .unwrap_or_default()
}

/// 解析 COMPARISON_DATA 块：按行、按 `|` 切分，去空白与空单元格，少于 2 个单元格的行丢弃
///
/// 第一行是表头。无标记时返回空列表。
pub fn parse_comparison(text: &str) -> Vec<Vec<String>> {
    let Some(caps) = comparison_re().captures(text) else {
        return Vec::new();
    };
    caps[1]
        .lines()
        .filter(|line| line.contains('|'))
        .map(|line| {
            line.split('|')
                .map(str::trim)
                .filter(|cell| !cell.is_empty())
                .map(str::to_string)
                .collect::<Vec<_>>()
        })
        .filter(|row| row.len() >= 2)
        .collect()
}

/// 从检索结果中提取引用 URL：去重、保持首次出现顺序，排除空值与 "unknown"
pub fn dedup_citations(hits: &[KnowledgeHit]) -> Vec<String> {
    let mut urls: Vec<String> = Vec::new();
    for hit in hits {
        let url = hit.source_locator.trim();
        if url.is_empty() || url.eq_ignore_ascii_case(UNKNOWN_SOURCE) {
            continue;
        }
        if !urls.iter().any(|u| u == url) {
            urls.push(url.to_string());
        }
    }
    urls
}

/// 执行摘要：去掉对比块后的第一段；对比块外没有正文时用通用提示
fn executive_summary(lead: &str) -> String {
    let without_block = comparison_re().replace(lead, "\n\n");
    let body = match marker_re().find(&without_block) {
        Some(m) => &without_block[..m.start()],
        None => &without_block[..],
    };
    body.split("\n\n")
        .map(str::trim)
        .find(|p| !p.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| GENERIC_LEAD.to_string())
}

fn render_table(rows: &[Vec<String>]) -> String {
    let header = &rows[0];
    let width = header.len();
    let mut lines = vec![
        format!("| {} |", header.join(" | ")),
        format!("| {} |", vec!["---"; width].join(" | ")),
    ];
    for row in &rows[1..] {
        let mut cells: Vec<&str> = row.iter().map(String::as_str).take(width).collect();
        cells.resize(width, "");
        lines.push(format!("| {} |", cells.join(" | ")));
    }
    lines.join("\n")
}

fn snippet(index: usize, text: &str) -> String {
    let flat = text.trim().replace(['\r', '\n'], " ");
    let body = if flat.chars().count() > SNIPPET_MAX_CHARS {
        let cut: String = flat.chars().take(SNIPPET_MAX_CHARS).collect();
        format!("{}...", cut.trim_end())
    } else {
        flat
    };
    format!("- **Source {}**: {}", index, body)
}

/// 渲染完整报告
pub fn render_report(state: &SessionState, citations: &[String]) -> String {
    let synthesis = latest_synthesis(state);
    let mut parts = vec![
        "# Executive Summary".to_string(),
        executive_summary(&lead_text(state)),
    ];

    let rows = parse_comparison(&synthesis);
    if rows.len() >= 2 {
        parts.push("## Comparison Matrix".to_string());
        parts.push(render_table(&rows));
    }

    if !synthesis.is_empty() {
        parts.push("## Detailed Analysis".to_string());
        parts.push("### Final Assessment".to_string());
        parts.push(synthesis);
    }

    parts.push("## Research Results".to_string());
    let snippets: Vec<String> = state
        .research_results
        .iter()
        .filter(|r| !r.text.trim().is_empty())
        .enumerate()
        .map(|(i, r)| snippet(i + 1, &r.text))
        .collect();
    if snippets.is_empty() {
        parts.push(NO_RESULTS.to_string());
    } else {
        parts.extend(snippets);
    }

    if !citations.is_empty() {
        parts.push("## Sources & References".to_string());
        parts.extend(citations.iter().map(|url| format!("- [{}]({})", url, url)));
    }

    parts.join("\n\n")
}

#[async_trait]
impl StageNode for Synthesizer {
    async fn run(&self, ctx: &GraphContext, state: &SessionState) -> Result<StateDelta, AgentError> {
        let query = citation_query(state);
        let hits = match ctx.knowledge.retrieve(&query, ctx.settings.citation_k) {
            Ok(hits) => hits,
            Err(e) => {
                tracing::warn!(error = %e, "Citation lookup failed, report has no sources section");
                Vec::new()
            }
        };
        let citations = dedup_citations(&hits);
        let report = render_report(state, &citations);
        tracing::info!(
            chars = report.chars().count(),
            citations = citations.len(),
            "Final report generated"
        );

        Ok(StateDelta::default()
            .append(vec![Message::assistant(report.clone())])
            .with_report(report)
            .with_needs_more_research(false))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use serde_json::json;

    use crate::core::ResearchArtifact;
    use crate::llm::ScriptedLlmClient;
    use crate::memory::KnowledgeStore;
    use crate::workflow::context::testing;

    fn hit(url: &str) -> KnowledgeHit {
        KnowledgeHit {
            id: String::new(),
            text: String::new(),
            source: "web_fetch".into(),
            source_locator: url.into(),
            score: 0.0,
        }
    }

    fn converged(synthesis: &str) -> Message {
        Message::assistant(
            json!({
                "needs_more_research": false,
                "gaps": [],
                "re_research_instructions": "",
                "synthesis": synthesis
            })
            .to_string(),
        )
    }

    #[test]
    fn test_parse_comparison_block() {
        let rows = parse_comparison("...\nCOMPARISON_DATA:\nA | B | C\n1 | 2 | 3\n");
        assert_eq!(rows, vec![vec!["A", "B", "C"], vec!["1", "2", "3"]]);
        assert!(parse_comparison("no table here\nA | B").is_empty());
    }

    #[test]
    fn test_parse_comparison_is_case_insensitive_and_stops_at_blank_line() {
        let text = "intro\ncomparison_data:\nX | Y\n| a |  | b |\nsingle\n\nA | B | trailing";
        assert_eq!(parse_comparison(text), vec![vec!["X", "Y"], vec!["a", "b"]]);
    }

    #[test]
    fn test_dedup_citations() {
        let hits = vec![hit("x"), hit("unknown"), hit("x"), hit("y"), hit("  ")];
        assert_eq!(dedup_citations(&hits), vec!["x", "y"]);
    }

    #[test]
    fn test_table_pads_and_truncates_rows() {
        let mut state = SessionState::default();
        state.begin_turn("compare");
        state.history.push(converged(
            "Both work.\n\nCOMPARISON_DATA:\nMetric | A | B\nSpeed | fast\nSize | 1 | 2 | 3",
        ));
        let report = render_report(&state, &[]);
        assert!(report.contains("| Metric | A | B |\n| --- | --- | --- |\n| Speed | fast |  |\n| Size | 1 | 2 |"));
        assert!(report.starts_with("# Executive Summary\n\nBoth work.\n\n## Comparison Matrix"));
    }

    #[test]
    fn test_summary_skips_leading_comparison_block() {
        assert_eq!(
            executive_summary("COMPARISON_DATA:\nMetric | A | B\nSpeed | 1 | 2\n\nA is faster.\n\nMore."),
            "A is faster."
        );
        assert_eq!(
            executive_summary("COMPARISON_DATA:\nMetric | A | B\nSpeed | 1 | 2"),
            GENERIC_LEAD
        );
        assert_eq!(executive_summary("Plain lead.\n\nSecond."), "Plain lead.");

        let mut state = SessionState::default();
        state.begin_turn("compare");
        state.history.push(converged("COMPARISON_DATA:\nMetric | A | B\nSpeed | 1 | 2"));
        let report = render_report(&state, &[]);
        assert!(report.starts_with(&format!("# Executive Summary\n\n{}\n\n## Comparison Matrix", GENERIC_LEAD)));
    }

    #[test]
    fn test_lead_priority_and_placeholders() {
        let mut state = SessionState::default();
        state.begin_turn("q");
        assert_eq!(lead_text(&state), NO_INFORMATION);
        state.research_results.push(ResearchArtifact::new("r", "unknown"));
        assert_eq!(lead_text(&state), GENERIC_LEAD);
        state.summary = "rolling".into();
        assert_eq!(lead_text(&state), "rolling");
        state.history.push(converged("final word"));
        assert_eq!(lead_text(&state), "final word");
        assert_eq!(citation_query(&state), "final word");

        let report = render_report(&SessionState::default(), &[]);
        assert!(report.contains("## Research Results\n\nNo research results available."));
        assert!(!report.contains("## Detailed Analysis"));
        assert!(!report.contains("## Sources & References"));
    }

    #[test]
    fn test_snippets_are_flattened_and_truncated() {
        let mut state = SessionState::default();
        state.research_results.push(ResearchArtifact::new("line one\nline two", "u"));
        state.research_results.push(ResearchArtifact::new("x".repeat(450), "u"));
        let report = render_report(&state, &[]);
        assert!(report.contains("- **Source 1**: line one line two"));
        assert!(report.contains(&format!("- **Source 2**: {}...", "x".repeat(400))));
    }

    #[tokio::test]
    async fn test_stage_writes_report_with_sources() {
        let (ctx, knowledge) = testing::context(Arc::new(ScriptedLlmClient::new(vec![])));
        knowledge.store("tokio runtime details", "web_fetch", "https://tokio.rs").unwrap();
        knowledge.store("tokio again", "web_fetch", "https://tokio.rs").unwrap();
        knowledge.store("no url", "web_search", "unknown").unwrap();

        let mut state = SessionState::default();
        state.begin_turn("tell me about tokio");
        state.history.push(converged("tokio is an async runtime"));
        let delta = Synthesizer.run(&ctx, &state).await.unwrap();

        let report = delta.report.clone().unwrap();
        assert!(report.ends_with("## Sources & References\n\n- [https://tokio.rs](https://tokio.rs)"));
        assert_eq!(delta.appended()[0].content, report);
        assert_eq!(delta.needs_more_research, Some(false));
    }
}
