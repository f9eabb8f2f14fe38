//! 流水线编排器（Pipeline Orchestrator）- 编排层
//!
//! ## 职责
//!
//! - 接收启动请求（准入、恢复、启动恢复），为每个请求派生一个驱动任务
//! - 驱动任务：Admitted → Running，委托 `PipelineFlow` 推进阶段，
//!   最后写入终态并发出终态事件
//!
//! 同一请求同时最多只有一个驱动任务。驱动期间到达的启动请求只留下一个
//! "需要重新驱动" 标记，当前驱动结束后按最新的请求记录再驱动一次。
//!
//! 除了正在驱动的请求集合，编排器不在内存中保存任何请求状态，
//! 所有决策都基于请求记录和执行轨迹。

use chrono::Utc;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tracing::{debug, error, info};

use crate::error::{AppResult, LaunchError};
use crate::infrastructure::{apply_transition, StateStore};
use crate::models::{FailureReason, RequestStatus};
use crate::orchestrator::completion::TerminalEvents;
use crate::workflow::{FlowOutcome, PipelineFlow, PipelineLauncher, RequestCtx};

/// 通过通道把启动请求交给调度循环
pub struct ChannelLauncher {
    sender: mpsc::UnboundedSender<String>,
}

impl ChannelLauncher {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<String>) {
        let (sender, receiver) = mpsc::unbounded_channel();
        (Self { sender }, receiver)
    }
}

impl PipelineLauncher for ChannelLauncher {
    fn launch(&self, request_id: &str) -> Result<(), LaunchError> {
        self.sender
            .send(request_id.to_string())
            .map_err(|_| LaunchError::DispatcherClosed {
                request_id: request_id.to_string(),
            })
    }
}

/// 流水线编排器
pub struct PipelineOrchestrator {
    store: Arc<StateStore>,
    flow: PipelineFlow,
    events: TerminalEvents,
    /// 正在驱动的请求 → 是否需要重新驱动
    in_flight: Mutex<HashMap<String, bool>>,
}

/// 驱动任务持有的占用标记
///
/// 驱动任务异常退出（panic、被中止）时在 drop 中清除占用。
struct DriveClaim {
    orchestrator: Arc<PipelineOrchestrator>,
    request_id: String,
    settled: bool,
}

impl Drop for DriveClaim {
    fn drop(&mut self) {
        if !self.settled {
            self.orchestrator.in_flight.lock().remove(&self.request_id);
        }
    }
}

impl PipelineOrchestrator {
    pub fn new(store: Arc<StateStore>, flow: PipelineFlow, events: TerminalEvents) -> Self {
        Self {
            store,
            flow,
            events,
            in_flight: Mutex::new(HashMap::new()),
        }
    }

    /// 占用请求；已在驱动中时只标记需要重新驱动，返回 `false`
    fn claim(&self, request_id: &str) -> bool {
        let mut in_flight = self.in_flight.lock();
        match in_flight.get_mut(request_id) {
            Some(rerun) => {
                *rerun = true;
                false
            }
            None => {
                in_flight.insert(request_id.to_string(), false);
                true
            }
        }
    }

    /// 驱动结束：有重新驱动标记时清除标记并返回 `true`，否则释放占用
    fn settle(&self, request_id: &str) -> bool {
        let mut in_flight = self.in_flight.lock();
        match in_flight.get_mut(request_id) {
            Some(rerun) if *rerun => {
                *rerun = false;
                true
            }
            _ => {
                in_flight.remove(request_id);
                false
            }
        }
    }

    /// 驱动请求，直到没有新的启动请求
    async fn drive_claimed(self: Arc<Self>, request_id: String) {
        let mut claim = DriveClaim {
            orchestrator: self.clone(),
            request_id: request_id.clone(),
            settled: false,
        };
        let ctx = RequestCtx::new(request_id);
        loop {
            if let Err(e) = self.drive(&ctx).await {
                error!("{} ❌ 流水线驱动失败: {}", ctx, e);
            }
            if !self.settle(ctx.id()) {
                break;
            }
            debug!("{} 驱动期间收到新的启动请求，重新驱动", ctx);
        }
        claim.settled = true;
    }

    /// 调度循环：每个启动请求派生一个驱动任务
    ///
    /// 循环任务被中止时，`JoinSet` 中的驱动任务一并中止。
    pub async fn run_dispatcher(self: Arc<Self>, mut receiver: mpsc::UnboundedReceiver<String>) {
        let mut drivers = JoinSet::new();
        loop {
            tokio::select! {
                launched = receiver.recv() => {
                    let Some(request_id) = launched else { break };
                    if !self.claim(&request_id) {
                        debug!("{} 已在驱动中，合并启动请求", RequestCtx::new(request_id.as_str()));
                        continue;
                    }
                    drivers.spawn(self.clone().drive_claimed(request_id));
                }
                Some(joined) = drivers.join_next(), if !drivers.is_empty() => {
                    if let Err(e) = joined {
                        error!("流水线驱动任务异常退出: {}", e);
                    }
                }
            }
        }

        while let Some(joined) = drivers.join_next().await {
            if let Err(e) = joined {
                error!("流水线驱动任务异常退出: {}", e);
            }
        }
        debug!("启动通道已关闭，调度循环退出");
    }

    /// 驱动单个请求，直到终态或挂起
    pub async fn drive(&self, ctx: &RequestCtx) -> AppResult<()> {
        let record = self.store.get_request(ctx.id())?;
        match record.status {
            RequestStatus::Admitted => {
                self.store.update_request(ctx.id(), |r| {
                    apply_transition(r, RequestStatus::Running, Utc::now())
                })?;
                info!("{} 🚀 开始执行流水线", ctx);
            }
            RequestStatus::Running => {
                info!("{} 🔄 从执行轨迹重新进入流水线", ctx);
            }
            status => {
                debug!("{} 状态为 {}，无需驱动", ctx, status);
                return Ok(());
            }
        }

        match self.flow.run(ctx).await? {
            FlowOutcome::Succeeded => self.finish(ctx, RequestStatus::Succeeded, None),
            FlowOutcome::Failed(reason) => self.finish(ctx, RequestStatus::Failed, Some(reason)),
            FlowOutcome::Cancelled => self.finish(ctx, RequestStatus::Cancelled, None),
            FlowOutcome::Suspended | FlowOutcome::NotRunnable => Ok(()),
        }
    }

    /// 写入终态并发出终态事件
    ///
    /// 终态只写一次；事件总是发出，完成跟踪器对重复事件幂等。
    fn finish(
        &self,
        ctx: &RequestCtx,
        status: RequestStatus,
        reason: Option<FailureReason>,
    ) -> AppResult<()> {
        let transitioned = self.store.update_request(ctx.id(), |r| {
            if r.is_terminal() {
                return Ok(false);
            }
            r.failure = reason.clone();
            r.current_stage = None;
            apply_transition(r, status, Utc::now())?;
            Ok(true)
        })?;

        if transitioned {
            match &reason {
                Some(reason) => info!("{} 流水线结束: {} ({})", ctx, status, reason),
                None => info!("{} 流水线结束: {}", ctx, status),
            }
        }
        self.events.emit(ctx.id());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_launch_after_dispatcher_closed_fails() {
        let (launcher, receiver) = ChannelLauncher::new();
        launcher.launch("r-1").unwrap();
        drop(receiver);

        let err = launcher.launch("r-2").unwrap_err();
        assert!(matches!(err, LaunchError::DispatcherClosed { request_id } if request_id == "r-2"));
    }

    use crate::config::StageConfig;
    use crate::config::StageConfigs;
    use crate::models::{RequestRecord, Stage};
    use crate::services::{StageExecutor, StageResult};
    use crate::utils::Backoff;
    use crate::workflow::SuspensionBridge;
    use async_trait::async_trait;
    use std::time::Duration;

    #[derive(Default)]
    struct SlowExecutor {
        calls: Mutex<HashMap<Stage, usize>>,
    }

    #[async_trait]
    impl StageExecutor for SlowExecutor {
        async fn execute(
            &self,
            _request_id: &str,
            stage: Stage,
            document_ref: &str,
            _config: &StageConfig,
        ) -> StageResult {
            *self.calls.lock().entry(stage).or_default() += 1;
            tokio::time::sleep(Duration::from_millis(20)).await;
            StageResult::success(document_ref)
        }
    }

    struct NoopLauncher;

    impl PipelineLauncher for NoopLauncher {
        fn launch(&self, _request_id: &str) -> Result<(), LaunchError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_launch_of_live_request_does_not_start_second_driver() {
        let store = Arc::new(StateStore::in_memory());
        let now = Utc::now();
        store
            .transact(|tx| {
                let mut record = RequestRecord::new("r-1", "doc", now);
                apply_transition(&mut record, RequestStatus::Admitted, now)?;
                tx.insert_request(record);
                Ok(())
            })
            .unwrap();

        let executor = Arc::new(SlowExecutor::default());
        let mut stages = StageConfigs::default();
        stages.assess.hitl_enabled = false;
        let bridge = Arc::new(SuspensionBridge::new(
            store.clone(),
            Arc::new(NoopLauncher),
            Arc::new(crate::services::LogSink),
            chrono::Duration::hours(1),
        ));
        let flow = PipelineFlow::new(
            store.clone(),
            executor.clone(),
            bridge,
            stages,
            0,
            Backoff::new(Duration::ZERO, Duration::ZERO),
        );
        let (events, mut terminal) = TerminalEvents::channel();
        let orchestrator = Arc::new(PipelineOrchestrator::new(store.clone(), flow, events));

        let (launcher, receiver) = ChannelLauncher::new();
        let dispatcher = tokio::spawn(orchestrator.clone().run_dispatcher(receiver));
        launcher.launch("r-1").unwrap();
        launcher.launch("r-1").unwrap();
        launcher.launch("r-1").unwrap();

        assert_eq!(terminal.recv().await.unwrap().request_id, "r-1");
        drop(launcher);
        dispatcher.await.unwrap();

        assert_eq!(executor.calls.lock().get(&Stage::Ingest), Some(&1));
        assert_eq!(executor.calls.lock().get(&Stage::Finalize), Some(&1));
        assert!(terminal.try_recv().is_err());
        assert!(orchestrator.in_flight.lock().is_empty());
        assert_eq!(
            store.get_request("r-1").unwrap().status,
            RequestStatus::Succeeded
        );
    }

    #[test]
    fn test_claim_marks_rerun_until_settled() {
        let store = Arc::new(StateStore::in_memory());
        let bridge = Arc::new(SuspensionBridge::new(
            store.clone(),
            Arc::new(NoopLauncher),
            Arc::new(crate::services::LogSink),
            chrono::Duration::hours(1),
        ));
        let flow = PipelineFlow::new(
            store.clone(),
            Arc::new(SlowExecutor::default()),
            bridge,
            StageConfigs::default(),
            0,
            Backoff::new(Duration::ZERO, Duration::ZERO),
        );
        let (events, _terminal) = TerminalEvents::channel();
        let orchestrator = PipelineOrchestrator::new(store, flow, events);

        assert!(orchestrator.claim("r-1"));
        assert!(!orchestrator.claim("r-1"));
        assert!(orchestrator.settle("r-1"));
        assert!(!orchestrator.settle("r-1"));
        assert!(orchestrator.claim("r-1"));
    }
}
