//! 准入控制器（Admission Controller）- 编排层
//!
//! 对每条出队的准入消息：
//! 1. 请求已不是 Queued（重复投递、已取消）→ 确认并丢弃
//! 2. 获取许可失败 → 带指数退避放回队列；重试耗尽则 `Failed(CapacityExhausted)` 并丢弃消息
//! 3. 获取成功 → Admitted，启动编排器，确认消息；启动失败时先补偿（退回 Queued 并释放许可）再返回错误
//!
//! "仍为 Queued" 的检查、获取许可、迁移到 Admitted 在同一个事务中完成，
//! 与并发的取消互斥。出队 → 获取 → 启动 是每个请求唯一的串行临界区，不等待任何阶段执行。

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{AppError, AppResult, StoreError};
use crate::infrastructure::semaphore::acquire_in;
use crate::infrastructure::{apply_transition, AdmissionQueue, PermitStore, StateStore};
use crate::models::{AcquireOutcome, FailureReason, QueueMessage, RequestRecord, RequestStatus};
use crate::orchestrator::completion::TerminalEvents;
use crate::utils::Backoff;
use crate::workflow::{PipelineLauncher, RequestCtx};

/// 单条消息的处理结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmissionDecision {
    /// 已准入并启动
    Admitted,
    /// 无可用许可，稍后重试
    Deferred,
    /// 重试或投递次数耗尽，请求已失败
    Rejected,
    /// 重复投递或请求不存在，消息已丢弃
    Discarded,
}

/// 准入事务的结果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Gate {
    /// 请求已离开 Queued，未获取许可
    NotQueued(RequestStatus),
    /// 无可用许可
    Exhausted { retry_count: u32 },
    /// 已获取许可并迁移到 Admitted
    Admitted,
}

/// 准入控制器
pub struct AdmissionController {
    store: Arc<StateStore>,
    queue: Arc<AdmissionQueue>,
    launcher: Arc<dyn PipelineLauncher>,
    events: TerminalEvents,
    counter_id: String,
    max_retries: u32,
    max_delivery_count: u32,
    backoff: Backoff,
}

impl AdmissionController {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<StateStore>,
        queue: Arc<AdmissionQueue>,
        launcher: Arc<dyn PipelineLauncher>,
        events: TerminalEvents,
        counter_id: String,
        max_retries: u32,
        max_delivery_count: u32,
        backoff: Backoff,
    ) -> Self {
        Self {
            store,
            queue,
            launcher,
            events,
            counter_id,
            max_retries,
            max_delivery_count,
            backoff,
        }
    }

    /// 创建请求记录并入队（同一事务）
    ///
    /// 未提供 `request_id` 时自动生成。
    pub fn submit(
        &self,
        request_id: Option<String>,
        document_ref: String,
    ) -> AppResult<RequestRecord> {
        if document_ref.trim().is_empty() {
            return Err(AppError::InvalidInput("documentRef 不能为空".to_string()));
        }
        let request_id = request_id
            .map(|id| id.trim().to_string())
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let now = Utc::now();
        let record = self.store.transact(|tx| {
            if tx.contains_request(&request_id) {
                return Err(StoreError::DuplicateRequest {
                    request_id: request_id.clone(),
                });
            }
            let record = RequestRecord::new(request_id.as_str(), document_ref, now);
            tx.insert_request(record.clone());
            AdmissionQueue::enqueue_in(tx, &request_id, now);
            Ok(record)
        })?;

        info!("{} 📥 已入队: {}", RequestCtx::new(request_id), record.document_ref);
        self.queue.notify();
        Ok(record)
    }

    /// 处理一条出队消息
    pub fn handle_message(&self, message: &QueueMessage) -> AppResult<AdmissionDecision> {
        let ctx = RequestCtx::new(message.request_id());
        let record = match self.store.get_request(ctx.id()) {
            Ok(record) => record,
            Err(StoreError::RequestNotFound { .. }) => {
                warn!("{} 请求记录不存在，丢弃准入消息", ctx);
                self.queue.ack(ctx.id())?;
                return Ok(AdmissionDecision::Discarded);
            }
            Err(e) => return Err(e.into()),
        };

        if record.status != RequestStatus::Queued {
            debug!("{} 重复投递 (状态 {})，丢弃", ctx, record.status);
            self.queue.ack(ctx.id())?;
            return Ok(AdmissionDecision::Discarded);
        }

        if message.delivery_count > self.max_delivery_count {
            warn!(
                "{} ☠️ 投递次数 {} 超过上限 {}",
                ctx, message.delivery_count, self.max_delivery_count
            );
            if self.fail_queued(&ctx, FailureReason::DeliveryLimitExceeded)? {
                return Ok(AdmissionDecision::Rejected);
            }
            return self.discard(&ctx);
        }

        match self.try_admit(&ctx)? {
            Gate::NotQueued(status) => {
                debug!("{} 准入前状态已变为 {}，丢弃", ctx, status);
                self.discard(&ctx)
            }
            Gate::Exhausted { retry_count } => self.defer(&ctx, retry_count),
            Gate::Admitted => self.launch(&ctx),
        }
    }

    /// 取消仍在排队的请求；请求已不是 Queued 时返回 `false`
    pub fn cancel_queued(&self, ctx: &RequestCtx) -> AppResult<bool> {
        let cancelled = self.store.transact(|tx| {
            let record = tx.request_mut(ctx.id())?;
            if record.status != RequestStatus::Queued {
                return Ok(false);
            }
            record.cancel_requested = true;
            apply_transition(record, RequestStatus::Cancelled, Utc::now())?;
            AdmissionQueue::remove_in(tx, ctx.id());
            Ok(true)
        })?;

        if cancelled {
            info!("{} 🛑 排队期间被取消", ctx);
            // 崩溃恢复场景下排队中的请求可能已持有许可
            self.events.emit(ctx.id());
        }
        Ok(cancelled)
    }

    /// 准入消费者循环
    pub async fn run_worker(self: Arc<Self>, worker_id: usize, poll_interval: Duration) {
        debug!("准入消费者 #{} 启动", worker_id);
        loop {
            let message = match self.queue.receive(Utc::now()) {
                Ok(Some(message)) => message,
                Ok(None) => {
                    self.queue.wait(self.idle_wait(poll_interval)).await;
                    continue;
                }
                Err(e) => {
                    error!("准入消费者 #{} 读取队列失败: {}", worker_id, e);
                    tokio::time::sleep(poll_interval).await;
                    continue;
                }
            };

            if let Err(e) = self.handle_message(&message) {
                error!(
                    "{} ❌ 准入处理失败 (消费者 #{}): {}",
                    RequestCtx::new(message.request_id()),
                    worker_id,
                    e
                );
            }
        }
    }

    /// 队列空闲时的等待时间：最早的延迟消息即将可见时提前醒来
    fn idle_wait(&self, poll_interval: Duration) -> Duration {
        self.queue
            .next_visible_at()
            .and_then(|at| (at - Utc::now()).to_std().ok())
            .map_or(poll_interval, |until| until.min(poll_interval))
    }

    fn discard(&self, ctx: &RequestCtx) -> AppResult<AdmissionDecision> {
        self.queue.ack(ctx.id())?;
        Ok(AdmissionDecision::Discarded)
    }

    /// 仍为 Queued 时获取许可并迁移到 Admitted（同一事务）
    fn try_admit(&self, ctx: &RequestCtx) -> AppResult<Gate> {
        let now = Utc::now();
        let gate = self.store.transact(|tx| {
            let record = tx.request(ctx.id())?;
            if record.status != RequestStatus::Queued {
                return Ok(Gate::NotQueued(record.status));
            }
            let retry_count = record.retry_count;

            match acquire_in(tx, &self.counter_id, ctx.id())? {
                AcquireOutcome::Exhausted => Ok(Gate::Exhausted { retry_count }),
                AcquireOutcome::Granted | AcquireOutcome::AlreadyHeld => {
                    let record = tx.request_mut(ctx.id())?;
                    apply_transition(record, RequestStatus::Admitted, now)?;
                    record.started_at.get_or_insert(now);
                    Ok(Gate::Admitted)
                }
            }
        })?;
        Ok(gate)
    }

    fn defer(&self, ctx: &RequestCtx, retry_count: u32) -> AppResult<AdmissionDecision> {
        if retry_count >= self.max_retries {
            warn!("{} ❌ 准入重试 {} 次仍无可用许可", ctx, retry_count);
            if self.fail_queued(ctx, FailureReason::CapacityExhausted)? {
                return Ok(AdmissionDecision::Rejected);
            }
            return self.discard(ctx);
        }

        let retry_count = self.store.update_request(ctx.id(), |r| {
            if r.status != RequestStatus::Queued {
                return Ok(None);
            }
            r.retry_count += 1;
            r.touch(Utc::now());
            Ok(Some(r.retry_count))
        })?;
        let Some(retry_count) = retry_count else {
            return self.discard(ctx);
        };

        let delay = self.backoff.delay(retry_count - 1);
        self.queue.release(ctx.id(), delay, Utc::now())?;
        info!(
            "{} ⏳ 暂无可用许可，{:?} 后重试 ({}/{})",
            ctx, delay, retry_count, self.max_retries
        );
        Ok(AdmissionDecision::Deferred)
    }

    fn launch(&self, ctx: &RequestCtx) -> AppResult<AdmissionDecision> {
        if let Err(e) = self.launcher.launch(ctx.id()) {
            error!("{} ❌ 启动流水线失败，回滚准入: {}", ctx, e);
            self.compensate(ctx)?;
            return Err(e.into());
        }

        self.queue.ack(ctx.id())?;
        info!("{} ✓ 已准入", ctx);
        Ok(AdmissionDecision::Admitted)
    }

    /// 启动失败后的补偿：先退回 Queued，再释放许可，最后让消息延迟重新可见
    ///
    /// 两步之间崩溃时请求为 Queued 且仍持有许可，重新投递会得到 `AlreadyHeld`。
    /// 准入后已收到取消的请求直接进入 Cancelled，由完成跟踪器收尾。
    fn compensate(&self, ctx: &RequestCtx) -> AppResult<()> {
        let now = Utc::now();
        let (retry_count, cancelled) = self.store.transact(|tx| {
            let record = tx.request_mut(ctx.id())?;
            let retry_count = record.retry_count;
            if record.status != RequestStatus::Admitted {
                return Ok((retry_count, false));
            }
            if record.cancel_requested {
                apply_transition(record, RequestStatus::Cancelled, now)?;
                AdmissionQueue::remove_in(tx, ctx.id());
                return Ok((retry_count, true));
            }
            apply_transition(record, RequestStatus::Queued, now)?;
            record.started_at = None;
            Ok((retry_count, false))
        })?;

        if cancelled {
            info!("{} 🛑 启动失败时已收到取消", ctx);
            self.events.emit(ctx.id());
            return Ok(());
        }
        self.store.release(&self.counter_id, ctx.id())?;
        self.queue
            .release(ctx.id(), self.backoff.delay(retry_count), Utc::now())?;
        Ok(())
    }

    /// 将仍在排队的请求标记失败并删除消息；请求已不是 Queued 时返回 `false`
    fn fail_queued(&self, ctx: &RequestCtx, reason: FailureReason) -> AppResult<bool> {
        let failed = self.store.transact(|tx| {
            let record = tx.request_mut(ctx.id())?;
            if record.status != RequestStatus::Queued {
                return Ok(false);
            }
            record.failure = Some(reason);
            apply_transition(record, RequestStatus::Failed, Utc::now())?;
            AdmissionQueue::remove_in(tx, ctx.id());
            Ok(true)
        })?;
        if failed {
            self.events.emit(ctx.id());
        }
        Ok(failed)
    }
}
