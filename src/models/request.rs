//! 请求记录（Request Record）与执行轨迹（Execution Trace）

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::stage::Stage;

/// 请求状态
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RequestStatus {
    Queued,
    Admitted,
    Running,
    Suspended,
    Succeeded,
    Failed,
    Cancelled,
}

impl RequestStatus {
    pub const ALL: [RequestStatus; 7] = [
        RequestStatus::Queued,
        RequestStatus::Admitted,
        RequestStatus::Running,
        RequestStatus::Suspended,
        RequestStatus::Succeeded,
        RequestStatus::Failed,
        RequestStatus::Cancelled,
    ];

    /// 终态不再接受任何阶段调用或恢复调用
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            RequestStatus::Succeeded | RequestStatus::Failed | RequestStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RequestStatus::Queued => "Queued",
            RequestStatus::Admitted => "Admitted",
            RequestStatus::Running => "Running",
            RequestStatus::Suspended => "Suspended",
            RequestStatus::Succeeded => "Succeeded",
            RequestStatus::Failed => "Failed",
            RequestStatus::Cancelled => "Cancelled",
        }
    }
}

impl fmt::Display for RequestStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 失败原因（机器可读）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "code")]
pub enum FailureReason {
    /// 准入重试耗尽仍无法获取许可
    CapacityExhausted,
    /// 阶段瞬时失败次数超出预算
    StageRetriesExhausted { stage: Stage },
    /// 协作方报告永久失败
    StagePermanentFailure {
        stage: Stage,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        detail: Option<String>,
    },
    /// 人工审核等待超时
    ReviewTimedOut,
    /// 审核人驳回
    ReviewRejected,
    /// 队列消息投递次数超限（毒消息）
    DeliveryLimitExceeded,
}

impl FailureReason {
    pub fn code(&self) -> &'static str {
        match self {
            FailureReason::CapacityExhausted => "CapacityExhausted",
            FailureReason::StageRetriesExhausted { .. } => "StageRetriesExhausted",
            FailureReason::StagePermanentFailure { .. } => "StagePermanentFailure",
            FailureReason::ReviewTimedOut => "ReviewTimedOut",
            FailureReason::ReviewRejected => "ReviewRejected",
            FailureReason::DeliveryLimitExceeded => "DeliveryLimitExceeded",
        }
    }
}

impl fmt::Display for FailureReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureReason::StageRetriesExhausted { stage } => {
                write!(f, "{} ({})", self.code(), stage)
            }
            FailureReason::StagePermanentFailure { stage, detail } => match detail {
                Some(detail) => write!(f, "{} ({}): {}", self.code(), stage, detail),
                None => write!(f, "{} ({})", self.code(), stage),
            },
            _ => f.write_str(self.code()),
        }
    }
}

/// 人工审核结论
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReviewOutcome {
    Approved,
    Rejected,
}

/// 单条轨迹的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TraceOutcome {
    Success,
    TransientFailure,
    PermanentFailure,
    /// Assess 判定无需审核时为 Review 记录的占位
    Skipped,
    Approved,
    Rejected,
    /// 挂起期间被取消
    Cancelled,
}

impl TraceOutcome {
    /// 该结果是否意味着阶段已完成、可以进入下一阶段
    pub fn completes_stage(&self) -> bool {
        matches!(
            self,
            TraceOutcome::Success | TraceOutcome::Skipped | TraceOutcome::Approved
        )
    }
}

/// 执行轨迹条目（只追加）
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TraceEntry {
    pub stage: Stage,
    pub attempt: u32,
    pub started_at: DateTime<Utc>,
    pub ended_at: DateTime<Utc>,
    pub outcome: TraceOutcome,
    /// 错误详情或审核备注
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// 请求记录
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestRecord {
    pub request_id: String,
    pub status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_stage: Option<Stage>,
    /// 当前文档引用，每个阶段成功后更新
    pub document_ref: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    /// 准入重试次数
    pub retry_count: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumption_handle: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub suspended_at: Option<DateTime<Utc>>,
    pub permit_held: bool,
    pub cancel_requested: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<FailureReason>,
    #[serde(default)]
    pub trace: Vec<TraceEntry>,
}

impl RequestRecord {
    /// 创建处于 Queued 状态的新记录
    pub fn new(request_id: impl Into<String>, document_ref: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            request_id: request_id.into(),
            status: RequestStatus::Queued,
            current_stage: None,
            document_ref: document_ref.into(),
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            retry_count: 0,
            resumption_handle: None,
            suspended_at: None,
            permit_held: false,
            cancel_requested: false,
            failure: None,
            trace: Vec::new(),
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// 根据轨迹确定下一个待执行的阶段
    ///
    /// 返回第一个没有"完成"记录的阶段；全部完成时返回 `None`。
    pub fn next_stage(&self) -> Option<Stage> {
        Stage::PIPELINE.into_iter().find(|stage| {
            !self
                .trace
                .iter()
                .any(|entry| entry.stage == *stage && entry.outcome.completes_stage())
        })
    }

    /// 审核是否已被驳回
    pub fn review_rejected(&self) -> bool {
        self.trace
            .iter()
            .any(|entry| entry.stage == Stage::Review && entry.outcome == TraceOutcome::Rejected)
    }

    /// 某阶段已有的尝试次数
    pub fn attempts_for(&self, stage: Stage) -> u32 {
        self.trace.iter().filter(|e| e.stage == stage).count() as u32
    }

    /// 某阶段已发生的瞬时失败次数
    pub fn transient_failures_for(&self, stage: Stage) -> u32 {
        self.trace
            .iter()
            .filter(|e| e.stage == stage && e.outcome == TraceOutcome::TransientFailure)
            .count() as u32
    }

    pub fn touch(&mut self, now: DateTime<Utc>) {
        self.updated_at = now;
    }
}
