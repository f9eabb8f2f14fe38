//! 完成通知服务 - 业务能力层
//!
//! 只负责"把最终结果发出去"，以及把审核请求（含恢复句柄）交给审核方。
//! 投递是尽力而为的：失败由调用方记录日志，不回滚许可释放和状态写入。

use async_trait::async_trait;
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::error::SinkError;
use crate::models::{CompletionNotification, RequestStatus, ReviewNotification};

/// 完成通知能力
#[async_trait]
pub trait CompletionSink: Send + Sync {
    async fn notify(&self, notification: &CompletionNotification) -> Result<(), SinkError>;

    /// 请求进入人工审核；默认不投递
    async fn notify_review(&self, _review: &ReviewNotification) -> Result<(), SinkError> {
        Ok(())
    }
}

/// 只写日志
#[derive(Debug, Default)]
pub struct LogSink;

#[async_trait]
impl CompletionSink for LogSink {
    async fn notify(&self, notification: &CompletionNotification) -> Result<(), SinkError> {
        let stages = notification.stage_trace.len();
        match (&notification.final_status, &notification.reason) {
            (RequestStatus::Succeeded, _) => info!(
                "[请求 {}] ✅ 处理完成 ({} 条轨迹, 流水线耗时 {} ms)",
                notification.request_id,
                stages,
                notification.workflow_latency_ms.unwrap_or_default()
            ),
            (status, Some(reason)) => warn!(
                "[请求 {}] ❌ 最终状态 {}: {} ({} 条轨迹)",
                notification.request_id, status, reason, stages
            ),
            (status, None) => info!(
                "[请求 {}] 最终状态 {} ({} 条轨迹)",
                notification.request_id, status, stages
            ),
        }
        Ok(())
    }

    async fn notify_review(&self, review: &ReviewNotification) -> Result<(), SinkError> {
        info!(
            "[请求 {}] 📝 等待人工审核: {} (恢复句柄 {})",
            review.request_id, review.document_ref, review.resumption_handle
        );
        Ok(())
    }
}

/// 以 JSON POST 到 webhook
///
/// 完成通知和审核通知发往同一地址，审核通知带有 `resumptionHandle` 字段。
pub struct WebhookSink {
    client: reqwest::Client,
    url: String,
}

impl WebhookSink {
    pub fn new(url: impl Into<String>, timeout: Duration) -> reqwest::Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }
}

#[async_trait]
impl CompletionSink for WebhookSink {
    async fn notify(&self, notification: &CompletionNotification) -> Result<(), SinkError> {
        self.post(notification).await
    }

    async fn notify_review(&self, review: &ReviewNotification) -> Result<(), SinkError> {
        self.post(review).await
    }
}

impl WebhookSink {
    async fn post(&self, body: &(impl serde::Serialize + Sync)) -> Result<(), SinkError> {
        let response = self.client.post(&self.url).json(body).send().await?;
        if !response.status().is_success() {
            return Err(SinkError::Status(response.status().as_u16()));
        }
        Ok(())
    }
}

/// 发送到进程内通道，供嵌入方消费
pub struct ChannelSink {
    sender: mpsc::UnboundedSender<CompletionNotification>,
    reviews: Option<mpsc::UnboundedSender<ReviewNotification>>,
}

impl ChannelSink {
    /// 只投递完成通知
    pub fn new() -> (Self, mpsc::UnboundedReceiver<CompletionNotification>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                reviews: None,
            },
            receiver,
        )
    }

    /// 同时投递完成通知和审核通知
    pub fn with_reviews() -> (
        Self,
        mpsc::UnboundedReceiver<CompletionNotification>,
        mpsc::UnboundedReceiver<ReviewNotification>,
    ) {
        let (sender, receiver) = mpsc::unbounded_channel();
        let (reviews, review_receiver) = mpsc::unbounded_channel();
        (
            Self {
                sender,
                reviews: Some(reviews),
            },
            receiver,
            review_receiver,
        )
    }
}

#[async_trait]
impl CompletionSink for ChannelSink {
    async fn notify(&self, notification: &CompletionNotification) -> Result<(), SinkError> {
        self.sender
            .send(notification.clone())
            .map_err(|_| SinkError::ChannelClosed)
    }

    async fn notify_review(&self, review: &ReviewNotification) -> Result<(), SinkError> {
        match &self.reviews {
            Some(reviews) => reviews
                .send(review.clone())
                .map_err(|_| SinkError::ChannelClosed),
            None => Ok(()),
        }
    }
}
