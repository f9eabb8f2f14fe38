//! 准入队列（Admission Queue）- 基础设施层
//!
//! 消息保存在 `StateStore` 中，与请求记录共享同一份持久化快照，
//! 因此"写请求记录 + 入队"可以在同一个事务内完成。
//!
//! 语义与常见的托管队列一致：
//! - `receive`：取一条可见消息，投递次数 +1，并在可见性超时内对其他消费者隐藏
//! - `ack`：删除消息
//! - `release`：在指定延迟后重新可见（用于退避重试）
//!
//! 消费者崩溃时消息会在可见性超时后自动重新出现。

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::StoreResult;
use crate::infrastructure::state_store::{StateStore, StoreTxn};
use crate::models::QueueMessage;

/// 准入队列
pub struct AdmissionQueue {
    store: Arc<StateStore>,
    notify: Notify,
    visibility_timeout: Duration,
}

impl AdmissionQueue {
    pub fn new(store: Arc<StateStore>, visibility_timeout: Duration) -> Self {
        Self {
            store,
            notify: Notify::new(),
            visibility_timeout,
        }
    }

    /// 在已有事务中入队；调用方提交事务后应调用 [`AdmissionQueue::notify`]
    pub fn enqueue_in(tx: &mut StoreTxn<'_>, request_id: &str, now: DateTime<Utc>) {
        tx.insert_message(QueueMessage::new(request_id, now));
    }

    /// 在已有事务中删除消息，返回消息是否存在
    pub fn remove_in(tx: &mut StoreTxn<'_>, request_id: &str) -> bool {
        tx.remove_message(request_id).is_some()
    }

    /// 取出最早可见的一条消息
    pub fn receive(&self, now: DateTime<Utc>) -> StoreResult<Option<QueueMessage>> {
        let visibility_timeout = self.visibility_timeout;
        self.store.transact(|tx| {
            let next_id = tx
                .state()
                .queue
                .values()
                .filter(|m| m.is_visible(now))
                .min_by_key(|m| (m.visible_at, m.payload.enqueued_at))
                .map(|m| m.request_id().to_string());

            let Some(request_id) = next_id else {
                return Ok(None);
            };
            let Some(message) = tx.message_mut(&request_id) else {
                return Ok(None);
            };
            message.delivery_count += 1;
            message.visible_at = now.checked_add_signed(visibility_timeout).unwrap_or(now);
            debug!(
                "[请求 {}] 📨 收到准入消息 (第 {} 次投递)",
                request_id, message.delivery_count
            );
            Ok(Some(message.clone()))
        })
    }

    /// 确认消息已处理
    pub fn ack(&self, request_id: &str) -> StoreResult<bool> {
        self.store
            .transact(|tx| Ok(Self::remove_in(tx, request_id)))
    }

    /// 让消息在 `delay` 之后重新可见
    pub fn release(
        &self,
        request_id: &str,
        delay: std::time::Duration,
        now: DateTime<Utc>,
    ) -> StoreResult<bool> {
        let delay = Duration::from_std(delay).unwrap_or_else(|_| Duration::days(365));
        let released = self.store.transact(|tx| {
            Ok(match tx.message_mut(request_id) {
                Some(message) => {
                    message.visible_at = now.checked_add_signed(delay).unwrap_or(now);
                    true
                }
                None => false,
            })
        })?;
        if released {
            self.notify();
        }
        Ok(released)
    }

    pub fn len(&self) -> usize {
        self.store.read(|state| state.queue.len())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// 最早一条消息变为可见的时间
    pub fn next_visible_at(&self) -> Option<DateTime<Utc>> {
        self.store
            .read(|state| state.queue.values().map(|m| m.visible_at).min())
    }

    /// 等待新消息或超时
    pub async fn wait(&self, max: std::time::Duration) {
        let _ = tokio::time::timeout(max, self.notify.notified()).await;
    }

    /// 唤醒等待中的消费者
    pub fn notify(&self) {
        self.notify.notify_waiters();
    }
}
