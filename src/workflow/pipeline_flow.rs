//! 请求处理流程 - 流程层
//!
//! 核心职责：定义"一个请求"的阶段推进规则
//!
//! 阶段顺序：`Ingest → Classify → Extract → Assess → [Review] → Summarize → Finalize`
//!
//! - 下一阶段总是从执行轨迹推导，而不是从内存状态推导，因此重启后可以直接重新进入
//! - 瞬时失败原地重试（指数退避），超出预算后失败
//! - 永久失败立即失败
//! - Assess 成功后由审核策略决定是否进入 Review；跳过时记录一条 `Skipped` 轨迹

use chrono::Utc;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::config::{AssessConfig, StageConfigs};
use crate::error::{AppError, AppResult};
use crate::infrastructure::StateStore;
use crate::models::{FailureReason, RequestRecord, RequestStatus, Stage, TraceEntry, TraceOutcome};
use crate::services::{StageExecutor, StageResult, StageStatus};
use crate::utils::Backoff;
use crate::workflow::request_ctx::RequestCtx;
use crate::workflow::suspension::SuspensionBridge;

/// 一次驱动的结果
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlowOutcome {
    Succeeded,
    Failed(FailureReason),
    Cancelled,
    /// 已挂起等待人工审核
    Suspended,
    /// 请求不在 Running 状态（例如已被其他驱动推进），本次驱动直接结束
    NotRunnable,
}

/// 单个阶段执行后的去向
enum StepOutcome {
    Continue,
    Finished(FlowOutcome),
}

/// 请求处理流程
///
/// - 编排单个请求的阶段推进
/// - 决定何时重试、何时失败、何时挂起
/// - 不持有许可，也不负责终态写入（由编排器完成）
pub struct PipelineFlow {
    store: Arc<StateStore>,
    executor: Arc<dyn StageExecutor>,
    bridge: Arc<SuspensionBridge>,
    stages: StageConfigs,
    stage_max_retries: u32,
    stage_backoff: Backoff,
}

impl PipelineFlow {
    pub fn new(
        store: Arc<StateStore>,
        executor: Arc<dyn StageExecutor>,
        bridge: Arc<SuspensionBridge>,
        stages: StageConfigs,
        stage_max_retries: u32,
        stage_backoff: Backoff,
    ) -> Self {
        Self {
            store,
            executor,
            bridge,
            stages,
            stage_max_retries,
            stage_backoff,
        }
    }

    /// 从轨迹推导的下一阶段开始执行，直到终态或挂起
    pub async fn run(&self, ctx: &RequestCtx) -> AppResult<FlowOutcome> {
        loop {
            let record = self.store.get_request(ctx.id())?;
            if record.status != RequestStatus::Running {
                debug!("{} 状态为 {}，停止驱动", ctx, record.status);
                return Ok(FlowOutcome::NotRunnable);
            }
            if record.cancel_requested {
                return Ok(FlowOutcome::Cancelled);
            }
            if record.review_rejected() {
                return Ok(FlowOutcome::Failed(FailureReason::ReviewRejected));
            }

            let Some(stage) = record.next_stage() else {
                return Ok(FlowOutcome::Succeeded);
            };

            if !stage.is_collaborator_stage() {
                match self.bridge.suspend(ctx).await? {
                    Some(_) => return Ok(FlowOutcome::Suspended),
                    // 挂起前被取消，回到循环顶部处理
                    None => continue,
                }
            }

            if let StepOutcome::Finished(outcome) = self.run_stage(ctx, &record, stage).await? {
                return Ok(outcome);
            }
        }
    }

    /// 执行一次阶段调用并记录轨迹
    async fn run_stage(
        &self,
        ctx: &RequestCtx,
        record: &RequestRecord,
        stage: Stage,
    ) -> AppResult<StepOutcome> {
        let config = self
            .stages
            .for_stage(stage)
            .ok_or_else(|| AppError::InvalidInput(format!("阶段 {} 没有协作方配置", stage)))?;
        let attempt = record.attempts_for(stage) + 1;

        self.store.update_request(ctx.id(), |r| {
            r.current_stage = Some(stage);
            r.touch(Utc::now());
            Ok(())
        })?;

        info!("{} ▶ 阶段 {} (第 {} 次尝试)", ctx, stage, attempt);
        let started_at = Utc::now();
        let result = self
            .executor
            .execute(ctx.id(), stage, &record.document_ref, &config)
            .await;
        let ended_at = Utc::now();

        let entry = TraceEntry {
            stage,
            attempt,
            started_at,
            ended_at,
            outcome: TraceOutcome::Success,
            detail: result.error_detail.clone(),
        };

        match result.status {
            StageStatus::Success => {
                let review = stage == Stage::Assess && review_needed(&result, &self.stages.assess);
                self.store.update_request(ctx.id(), |r| {
                    r.trace.push(entry);
                    if let Some(document_ref) = result.document_ref.clone() {
                        r.document_ref = document_ref;
                    }
                    if stage == Stage::Assess && !review {
                        r.trace.push(TraceEntry {
                            stage: Stage::Review,
                            attempt: 1,
                            started_at: ended_at,
                            ended_at,
                            outcome: TraceOutcome::Skipped,
                            detail: None,
                        });
                    }
                    r.touch(ended_at);
                    Ok(())
                })?;
                info!("{} ✓ 阶段 {} 完成", ctx, stage);
                if stage == Stage::Assess {
                    info!(
                        "{} 审核策略: {} (置信度 {:?})",
                        ctx,
                        if review { "需要人工审核" } else { "跳过审核" },
                        result.confidence
                    );
                }
                Ok(StepOutcome::Continue)
            }
            StageStatus::TransientFailure => {
                let failures = self.store.update_request(ctx.id(), |r| {
                    r.trace.push(TraceEntry {
                        outcome: TraceOutcome::TransientFailure,
                        ..entry
                    });
                    r.touch(ended_at);
                    Ok(r.transient_failures_for(stage))
                })?;

                if failures > self.stage_max_retries {
                    warn!(
                        "{} ❌ 阶段 {} 瞬时失败 {} 次，重试耗尽",
                        ctx, stage, failures
                    );
                    return Ok(StepOutcome::Finished(FlowOutcome::Failed(
                        FailureReason::StageRetriesExhausted { stage },
                    )));
                }

                let delay = self.stage_backoff.delay(failures - 1);
                warn!(
                    "{} ⚠️ 阶段 {} 瞬时失败 ({}/{})，{:?} 后重试: {}",
                    ctx,
                    stage,
                    failures,
                    self.stage_max_retries,
                    delay,
                    result.error_detail.as_deref().unwrap_or("-")
                );
                tokio::time::sleep(delay).await;
                Ok(StepOutcome::Continue)
            }
            StageStatus::PermanentFailure => {
                self.store.update_request(ctx.id(), |r| {
                    r.trace.push(TraceEntry {
                        outcome: TraceOutcome::PermanentFailure,
                        ..entry
                    });
                    r.touch(ended_at);
                    Ok(())
                })?;
                warn!(
                    "{} ❌ 阶段 {} 永久失败: {}",
                    ctx,
                    stage,
                    result.error_detail.as_deref().unwrap_or("-")
                );
                Ok(StepOutcome::Finished(FlowOutcome::Failed(
                    FailureReason::StagePermanentFailure {
                        stage,
                        detail: result.error_detail,
                    },
                )))
            }
        }
    }
}

/// 审核策略：启用人工审核时，置信度低于阈值或协作方显式要求则进入 Review
pub fn review_needed(result: &StageResult, config: &AssessConfig) -> bool {
    if !config.hitl_enabled {
        return false;
    }
    result.review_required
        || result
            .confidence
            .is_some_and(|confidence| confidence < config.confidence_threshold)
}
