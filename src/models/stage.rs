//! 流水线阶段定义
//!
//! 固定拓扑：`Ingest → Classify → Extract → Assess → [Review] → Summarize → Finalize`

use serde::{Deserialize, Serialize};
use std::fmt;

/// 流水线阶段
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    Ingest,
    Classify,
    Extract,
    Assess,
    /// 人工审核（挂起点）
    Review,
    Summarize,
    Finalize,
}

impl Stage {
    /// 按执行顺序排列的全部阶段
    pub const PIPELINE: [Stage; 7] = [
        Stage::Ingest,
        Stage::Classify,
        Stage::Extract,
        Stage::Assess,
        Stage::Review,
        Stage::Summarize,
        Stage::Finalize,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Ingest => "ingest",
            Stage::Classify => "classify",
            Stage::Extract => "extract",
            Stage::Assess => "assess",
            Stage::Review => "review",
            Stage::Summarize => "summarize",
            Stage::Finalize => "finalize",
        }
    }

    /// 是否由外部协作方执行（Review 由挂起桥接处理，不调用协作方）
    pub fn is_collaborator_stage(&self) -> bool {
        !matches!(self, Stage::Review)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
