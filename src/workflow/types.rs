//! 调度器输出类型

use serde::Serialize;

use crate::core::{Stage, StateDelta};

/// 一跳：执行的阶段、它产出的增量、合并后的 loop_count 与下一阶段（None 表示本轮结束或暂停前的终点）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Hop {
    pub stage: Stage,
    pub delta: StateDelta,
    pub loop_count: u32,
    pub next: Option<Stage>,
}

/// 一轮的结局
#[derive(Debug, Clone, PartialEq)]
pub enum TurnOutcome {
    /// 产出了报告
    Completed { report: String },
    /// 在 next_stage 前暂停，等待 resume
    Paused { next_stage: Stage },
    /// 某一跳失败，error 已写入会话状态
    Failed { error: String },
    /// 被外部取消，检查点停留在最后一次成功的跳
    Cancelled,
}
