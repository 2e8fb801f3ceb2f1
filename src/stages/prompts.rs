//! 各阶段的系统提示词与上下文拼装

use crate::core::SessionState;
use crate::memory::{prune, Message, Role};

pub const ROUTER_SYSTEM: &str = "\
You coordinate a research session and never call tools yourself.
Pick the next stage:
- \"researcher\" when evidence must be gathered (searching, reading pages). Only the researcher may use tools.
- \"critic\" when gathered evidence should be reviewed for gaps.
- \"synthesizer\" when a final synthesis already exists and the report can be written.
If tool output is missing or ambiguous, say that information is lacking instead of guessing.
Answer with the next stage and a short rationale.";

pub const RESEARCHER_SYSTEM: &str = "\
You gather evidence for the user's request using the available tools.
Use web_search to find relevant links, then web_fetch on the most promising official documentation or technical articles to read the details.
Pass the page URL as the `url` argument so sources can be cited.
If tool output is unclear, state that information is lacking.";

pub const CRITIC_SYSTEM: &str = "\
You review the gathered research for gaps.
If evidence is missing, request more research instead of guessing: set needs_more_research to true, list the missing details in gaps (a JSON array of plain strings) and give concrete re_research_instructions.
If the evidence is sufficient, set needs_more_research to false and write the synthesis.
Check the raw tool outputs under \"Research results\" for technical details, not only the researcher's summaries.
When the request compares technologies, end the synthesis with a block labelled COMPARISON_DATA: containing one pipe-separated row per line, the first row being the header with one column per technology. Example:
COMPARISON_DATA:
Metric | SQLite | PostgreSQL
Transport | in-process | network
Do not use Markdown bullet points inside JSON field values.";

pub const FORCED_SYNTHESIS_INSTRUCTION: &str = "\
The research budget is exhausted. Provide a final synthesis using only the information already gathered. Do not ask for more research.";

pub const FORCED_SYNTHESIS_FALLBACK: &str =
    "Evidence gathering reached its iteration limit; the findings above are the best available answer.";

pub const COMPACTION_SYSTEM: &str = "\
Condense the conversation into a concise running summary.
Keep key decisions, tool findings and open questions.";

/// 系统提示词 + 非空的 running summary
pub fn with_summary(base: &str, summary: &str) -> String {
    let summary = summary.trim();
    if summary.is_empty() {
        base.to_string()
    } else {
        format!("{}\n\nRunning summary:\n{}", base, summary)
    }
}

/// [system] + 剪枝后的 history（去掉 system 条目）
pub fn context_messages(system: String, state: &SessionState, window: usize) -> Vec<Message> {
    let mut messages = vec![Message::system(system)];
    messages.extend(
        prune(&state.history, window)
            .into_iter()
            .filter(|m| m.role != Role::System),
    );
    messages
}
