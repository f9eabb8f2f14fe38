//! 准入队列消息

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 准入消息负载
///
/// 投递次数与可见性延迟属于队列传输层属性，不在负载中
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AdmissionMessage {
    pub request_id: String,
    pub enqueued_at: DateTime<Utc>,
}

/// 队列中的消息（含传输层属性）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueMessage {
    pub payload: AdmissionMessage,
    pub delivery_count: u32,
    /// 在此时间之前消息对消费者不可见
    pub visible_at: DateTime<Utc>,
}

impl QueueMessage {
    pub fn new(request_id: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            payload: AdmissionMessage {
                request_id: request_id.into(),
                enqueued_at: now,
            },
            delivery_count: 0,
            visible_at: now,
        }
    }

    pub fn request_id(&self) -> &str {
        &self.payload.request_id
    }

    pub fn is_visible(&self, now: DateTime<Utc>) -> bool {
        self.visible_at <= now
    }
}
