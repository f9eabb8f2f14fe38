//! 完成跟踪器（Completion Tracker）- 编排层
//!
//! 订阅终态事件，对每个事件：
//! 1. 释放许可（检查并清除 `permit_held`，重复事件不会重复释放）
//! 2. 写入完成记录（只写一次）
//! 3. 尽力发送完成通知，失败不回滚前两步
//!
//! 事件可能重复：启动恢复会为"许可未释放"或"缺少完成记录"的终态请求重新发出事件。

use chrono::Utc;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

use crate::error::AppResult;
use crate::infrastructure::{PermitStore, StateStore};
use crate::models::CompletionNotification;
use crate::services::CompletionSink;
use crate::workflow::RequestCtx;

/// 终态事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TerminalEvent {
    pub request_id: String,
}

/// 终态事件发送端
#[derive(Debug, Clone)]
pub struct TerminalEvents {
    sender: mpsc::UnboundedSender<TerminalEvent>,
}

impl TerminalEvents {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<TerminalEvent>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }

    /// 跟踪器已停止时只记录日志：启动恢复会补发
    pub fn emit(&self, request_id: &str) {
        let event = TerminalEvent {
            request_id: request_id.to_string(),
        };
        if self.sender.send(event).is_err() {
            warn!(
                "{} 完成跟踪器已停止，终态事件将在下次启动时补发",
                RequestCtx::new(request_id)
            );
        }
    }
}

/// 完成跟踪器
pub struct CompletionTracker {
    store: Arc<StateStore>,
    sink: Arc<dyn CompletionSink>,
    counter_id: String,
}

impl CompletionTracker {
    pub fn new(store: Arc<StateStore>, sink: Arc<dyn CompletionSink>, counter_id: String) -> Self {
        Self {
            store,
            sink,
            counter_id,
        }
    }

    /// 处理单个终态事件
    pub async fn handle(&self, event: &TerminalEvent) -> AppResult<()> {
        let ctx = RequestCtx::new(event.request_id.as_str());
        let record = self.store.get_request(ctx.id())?;
        if !record.is_terminal() {
            warn!("{} 收到终态事件但状态为 {}，忽略", ctx, record.status);
            return Ok(());
        }

        if self.store.release(&self.counter_id, ctx.id())? {
            debug!("{} 🎫 许可已释放", ctx);
        }

        let notification = CompletionNotification::from_record(&record, Utc::now());
        if !self.store.record_completion(notification.clone())? {
            debug!("{} 完成记录已存在，跳过通知", ctx);
            return Ok(());
        }

        if let Err(e) = self.sink.notify(&notification).await {
            warn!("{} ⚠️ 完成通知发送失败: {}", ctx, e);
        }
        Ok(())
    }

    /// 持续消费终态事件，直到所有发送端关闭
    pub async fn run(self: Arc<Self>, mut receiver: mpsc::UnboundedReceiver<TerminalEvent>) {
        while let Some(event) = receiver.recv().await {
            if let Err(e) = self.handle(&event).await {
                error!(
                    "{} ❌ 处理终态事件失败: {}",
                    RequestCtx::new(event.request_id.as_str()),
                    e
                );
            }
        }
        debug!("终态事件通道已关闭，完成跟踪器退出");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::apply_transition;
    use crate::models::{RequestRecord, RequestStatus};
    use crate::services::ChannelSink;

    const COUNTER: &str = "workflow_counter";

    fn terminal_with_permit(store: &StateStore, id: &str) {
        store.ensure_initialized(COUNTER, 2).unwrap();
        store
            .transact(|tx| {
                let now = Utc::now();
                let mut record = RequestRecord::new(id, "doc", now);
                apply_transition(&mut record, RequestStatus::Admitted, now)?;
                apply_transition(&mut record, RequestStatus::Running, now)?;
                apply_transition(&mut record, RequestStatus::Succeeded, now)?;
                tx.insert_request(record);
                Ok(())
            })
            .unwrap();
        store.acquire(COUNTER, id).unwrap();
    }

    #[tokio::test]
    async fn test_duplicate_events_release_and_notify_once() {
        let store = Arc::new(StateStore::in_memory());
        terminal_with_permit(&store, "r-1");
        let (sink, mut notifications) = ChannelSink::new();
        let tracker = CompletionTracker::new(store.clone(), Arc::new(sink), COUNTER.to_string());

        let event = TerminalEvent {
            request_id: "r-1".to_string(),
        };
        tracker.handle(&event).await.unwrap();
        tracker.handle(&event).await.unwrap();

        assert_eq!(store.counter(COUNTER).unwrap().available_permits, 2);
        assert!(!store.get_request("r-1").unwrap().permit_held);
        assert!(store.completion("r-1").is_some());
        assert_eq!(notifications.recv().await.unwrap().request_id, "r-1");
        assert!(notifications.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_non_terminal_event_is_ignored() {
        let store = Arc::new(StateStore::in_memory());
        store.ensure_initialized(COUNTER, 1).unwrap();
        store
            .transact(|tx| {
                tx.insert_request(RequestRecord::new("r-1", "doc", Utc::now()));
                Ok(())
            })
            .unwrap();
        store.acquire(COUNTER, "r-1").unwrap();

        let (sink, _notifications) = ChannelSink::new();
        let tracker = CompletionTracker::new(store.clone(), Arc::new(sink), COUNTER.to_string());
        tracker
            .handle(&TerminalEvent {
                request_id: "r-1".to_string(),
            })
            .await
            .unwrap();

        assert!(store.get_request("r-1").unwrap().permit_held);
        assert!(store.completion("r-1").is_none());
    }

    #[tokio::test]
    async fn test_sink_failure_does_not_roll_back() {
        let store = Arc::new(StateStore::in_memory());
        terminal_with_permit(&store, "r-1");
        let (sink, notifications) = ChannelSink::new();
        drop(notifications);
        let tracker = CompletionTracker::new(store.clone(), Arc::new(sink), COUNTER.to_string());

        tracker
            .handle(&TerminalEvent {
                request_id: "r-1".to_string(),
            })
            .await
            .unwrap();

        assert!(!store.get_request("r-1").unwrap().permit_held);
        assert!(store.completion("r-1").is_some());
    }
}
