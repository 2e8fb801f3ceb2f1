//! 研究图：运行上下文、调度器与输出类型

pub mod context;
pub mod engine;
pub mod types;

pub use context::{GraphContext, GraphSettings};
pub use engine::{next_stage, Scheduler};
pub use types::{Hop, TurnOutcome};
