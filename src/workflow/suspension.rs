//! 挂起桥接（Suspension Bridge）- 流程层
//!
//! 请求进入 Review 时铸造一个恢复句柄并写入请求记录，编排器随即停止驱动，
//! 不占用任何执行资源（许可仍然保留，直到请求进入终态）。
//! 句柄通过审核通知交给审核方，查询接口不返回句柄。
//!
//! 句柄只能使用一次：第一次恢复在同一事务中清除句柄，
//! 之后同一句柄的恢复调用返回 `false` 且没有任何副作用。

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::{AppResult, StoreResult};
use crate::infrastructure::{apply_transition, StateStore};
use crate::models::{
    FailureReason, RequestRecord, RequestStatus, ReviewNotification, ReviewOutcome, Stage,
    TraceEntry, TraceOutcome,
};
use crate::services::CompletionSink;
use crate::workflow::launcher::PipelineLauncher;
use crate::workflow::request_ctx::RequestCtx;

/// 挂起桥接
pub struct SuspensionBridge {
    store: Arc<StateStore>,
    launcher: Arc<dyn PipelineLauncher>,
    sink: Arc<dyn CompletionSink>,
    review_timeout: Duration,
}

impl SuspensionBridge {
    pub fn new(
        store: Arc<StateStore>,
        launcher: Arc<dyn PipelineLauncher>,
        sink: Arc<dyn CompletionSink>,
        review_timeout: Duration,
    ) -> Self {
        Self {
            store,
            launcher,
            sink,
            review_timeout,
        }
    }

    /// 挂起请求，返回新的恢复句柄
    ///
    /// 请求已被标记取消时不挂起，返回 `None`，由编排器继续处理取消。
    /// 挂起写入后尽力投递审核通知；投递失败只记录日志。
    pub async fn suspend(&self, ctx: &RequestCtx) -> AppResult<Option<String>> {
        let now = Utc::now();
        let handle = Uuid::new_v4().to_string();
        let suspended = self.store.update_request(ctx.id(), |record| {
            if record.cancel_requested {
                return Ok(None);
            }
            apply_transition(record, RequestStatus::Suspended, now)?;
            record.current_stage = Some(Stage::Review);
            record.resumption_handle = Some(handle.clone());
            record.suspended_at = Some(now);
            Ok(Some(record.clone()))
        })?;

        let Some(record) = suspended else {
            return Ok(None);
        };
        info!("{} ⏸ 进入人工审核，等待恢复", ctx);
        self.announce(&record).await;
        Ok(Some(handle))
    }

    /// 重新投递所有挂起中请求的审核通知，返回投递的数量
    ///
    /// 用于启动恢复：上次运行中投递失败的审核通知在这里补发。
    pub async fn announce_pending(&self) -> usize {
        let pending = self.store.list_requests(Some(RequestStatus::Suspended));
        let mut announced = 0;
        for record in &pending {
            if self.announce(record).await {
                announced += 1;
            }
        }
        announced
    }

    async fn announce(&self, record: &RequestRecord) -> bool {
        let Some(review) = ReviewNotification::from_record(record, self.review_timeout) else {
            return false;
        };
        match self.sink.notify_review(&review).await {
            Ok(()) => true,
            Err(e) => {
                warn!(
                    "{} ⚠️ 审核通知投递失败: {}",
                    RequestCtx::new(record.request_id.as_str()),
                    e
                );
                false
            }
        }
    }

    /// 使用句柄恢复挂起的请求
    ///
    /// 句柄未知、已使用或已过期时返回 `false`，不做任何修改。
    pub fn resume(
        &self,
        handle: &str,
        outcome: ReviewOutcome,
        reviewer_note: Option<String>,
    ) -> AppResult<bool> {
        let trace_outcome = match outcome {
            ReviewOutcome::Approved => TraceOutcome::Approved,
            ReviewOutcome::Rejected => TraceOutcome::Rejected,
        };
        let resumed = self.store.transact(|tx| {
            let Some(request_id) = tx
                .state()
                .requests
                .values()
                .find(|r| {
                    r.status == RequestStatus::Suspended
                        && r.resumption_handle.as_deref() == Some(handle)
                })
                .map(|r| r.request_id.clone())
            else {
                return Ok(None);
            };
            let record = tx.request_mut(&request_id)?;
            reenter_from_review(record, trace_outcome, reviewer_note, Utc::now())?;
            Ok(Some(request_id))
        })?;

        let Some(request_id) = resumed else {
            warn!("恢复句柄无效或已使用，忽略");
            return Ok(false);
        };

        let ctx = RequestCtx::new(request_id);
        info!("{} ▶ 审核结论 {:?}，恢复流水线", ctx, outcome);
        self.relaunch(&ctx);
        Ok(true)
    }

    /// 取消挂起中的请求：与一次恢复相同地作废句柄，并带上取消标记重新进入编排器
    pub fn cancel_suspended(&self, ctx: &RequestCtx) -> AppResult<bool> {
        let cancelled = self.store.update_request(ctx.id(), |record| {
            if record.status != RequestStatus::Suspended {
                return Ok(false);
            }
            record.cancel_requested = true;
            reenter_from_review(record, TraceOutcome::Cancelled, None, Utc::now())?;
            Ok(true)
        })?;

        if cancelled {
            info!("{} 🛑 挂起期间被取消", ctx);
            self.relaunch(ctx);
        }
        Ok(cancelled)
    }

    /// 将等待超时的挂起请求标记为失败，返回受影响的请求 ID
    ///
    /// 句柄在同一事务中作废，之后的恢复调用会被拒绝。
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> AppResult<Vec<String>> {
        let review_timeout = self.review_timeout;
        let expired = self.store.transact(|tx| {
            let expired: Vec<String> = tx
                .state()
                .requests
                .values()
                .filter(|r| {
                    r.status == RequestStatus::Suspended
                        && r.suspended_at.is_some_and(|at| {
                            at.checked_add_signed(review_timeout)
                                .is_some_and(|deadline| deadline <= now)
                        })
                })
                .map(|r| r.request_id.clone())
                .collect();

            for request_id in &expired {
                let record = tx.request_mut(request_id)?;
                record.resumption_handle = None;
                record.failure = Some(FailureReason::ReviewTimedOut);
                apply_transition(record, RequestStatus::Failed, now)?;
            }
            Ok(expired)
        })?;

        for request_id in &expired {
            warn!("{} ⌛ 人工审核超时", RequestCtx::new(request_id.as_str()));
        }
        Ok(expired)
    }

    /// 恢复后请求已是 Running；调度失败时由启动恢复重新驱动
    fn relaunch(&self, ctx: &RequestCtx) {
        if let Err(e) = self.launcher.launch(ctx.id()) {
            error!("{} ❌ 重新启动流水线失败，等待下次启动恢复: {}", ctx, e);
        }
    }
}

/// 作废句柄、追加 Review 轨迹，并回到 Running
fn reenter_from_review(
    record: &mut RequestRecord,
    outcome: TraceOutcome,
    detail: Option<String>,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let started_at = record.suspended_at.unwrap_or(now);
    let attempt = record.attempts_for(Stage::Review) + 1;
    record.resumption_handle = None;
    record.suspended_at = None;
    record.trace.push(TraceEntry {
        stage: Stage::Review,
        attempt,
        started_at,
        ended_at: now,
        outcome,
        detail,
    });
    apply_transition(record, RequestStatus::Running, now)
}
