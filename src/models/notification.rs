//! 完成通知与最终结果记录

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::request::{FailureReason, RequestRecord, RequestStatus, TraceEntry};

/// 持久化的最终结果，供下游消费
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompletionNotification {
    pub request_id: String,
    pub final_status: RequestStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<FailureReason>,
    pub stage_trace: Vec<TraceEntry>,
    pub completed_at: DateTime<Utc>,
    /// 排队耗时（入队到准入）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_latency_ms: Option<i64>,
    /// 流水线耗时（准入到完成）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub workflow_latency_ms: Option<i64>,
}

impl CompletionNotification {
    /// 从终态记录构建通知
    pub fn from_record(record: &RequestRecord, now: DateTime<Utc>) -> Self {
        let completed_at = record.completed_at.unwrap_or(now);
        Self {
            request_id: record.request_id.clone(),
            final_status: record.status,
            reason: record.failure.clone(),
            stage_trace: record.trace.clone(),
            completed_at,
            queue_latency_ms: record
                .started_at
                .map(|started| (started - record.created_at).num_milliseconds()),
            workflow_latency_ms: record
                .started_at
                .map(|started| (completed_at - started).num_milliseconds()),
        }
    }
}

/// 请求进入人工审核时发给审核方的通知
///
/// 恢复句柄只通过这里交付，查询接口不会返回它。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReviewNotification {
    pub request_id: String,
    pub document_ref: String,
    pub resumption_handle: String,
    pub suspended_at: DateTime<Utc>,
    /// 超过此时间未恢复的请求会以 `ReviewTimedOut` 失败
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub review_deadline: Option<DateTime<Utc>>,
}

impl ReviewNotification {
    /// 从挂起中的记录构建通知；记录没有句柄时返回 `None`
    pub fn from_record(record: &RequestRecord, review_timeout: chrono::Duration) -> Option<Self> {
        let handle = record.resumption_handle.clone()?;
        let suspended_at = record.suspended_at.unwrap_or(record.updated_at);
        Some(Self {
            request_id: record.request_id.clone(),
            document_ref: record.document_ref.clone(),
            resumption_handle: handle,
            suspended_at,
            review_deadline: suspended_at.checked_add_signed(review_timeout),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_latencies_from_record_timestamps() {
        let created = Utc::now();
        let mut record = RequestRecord::new("r-1", "doc", created);
        record.status = RequestStatus::Succeeded;
        record.started_at = Some(created + Duration::milliseconds(250));
        record.completed_at = Some(created + Duration::milliseconds(1250));

        let notification = CompletionNotification::from_record(&record, Utc::now());
        assert_eq!(notification.queue_latency_ms, Some(250));
        assert_eq!(notification.workflow_latency_ms, Some(1000));
        assert_eq!(notification.final_status, RequestStatus::Succeeded);
    }

    #[test]
    fn test_never_admitted_request_has_no_latencies() {
        let mut record = RequestRecord::new("r-2", "doc", Utc::now());
        record.status = RequestStatus::Cancelled;

        let notification = CompletionNotification::from_record(&record, Utc::now());
        assert_eq!(notification.queue_latency_ms, None);
        assert_eq!(notification.workflow_latency_ms, None);
    }
}
