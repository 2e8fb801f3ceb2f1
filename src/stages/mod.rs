//! 研究图的各个阶段
//!
//! 每个阶段读取当前 SessionState，只返回本跳的 StateDelta；合并与选边由调度器负责。

pub mod compaction;
pub mod critic;
pub mod prompts;
pub mod researcher;
pub mod router;
pub mod synthesizer;

use async_trait::async_trait;

use crate::core::{AgentError, SessionState, Stage, StateDelta};
use crate::workflow::GraphContext;

pub use compaction::Compaction;
pub use critic::Critic;
pub use researcher::Researcher;
pub use router::Router;
pub use synthesizer::Synthesizer;

#[async_trait]
pub trait StageNode: Send + Sync {
    async fn run(&self, ctx: &GraphContext, state: &SessionState) -> Result<StateDelta, AgentError>;
}

/// 阶段 -> 实现
pub fn node_for(stage: Stage) -> &'static dyn StageNode {
    static ROUTER: Router = Router;
    static COMPACTION: Compaction = Compaction;
    static RESEARCHER: Researcher = Researcher;
    static CRITIC: Critic = Critic;
    static SYNTHESIZER: Synthesizer = Synthesizer;
    match stage {
        Stage::Router => &ROUTER,
        Stage::Compaction => &COMPACTION,
        Stage::Researcher => &RESEARCHER,
        Stage::Critic => &CRITIC,
        Stage::Synthesizer => &SYNTHESIZER,
    }
}
