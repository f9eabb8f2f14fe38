//! 应用装配与生命周期 - 编排层
//!
//! ## 职责
//!
//! 1. **显式装配**：通过构造函数把存储、队列、准入、编排、挂起、完成跟踪连接起来
//! 2. **启动协调**：初始化许可计数器，恢复进行中的请求，补发丢失的终态事件
//! 3. **后台任务**：完成跟踪、流水线调度、准入消费者、审核超时扫描与已收尾请求清理
//! 4. **对外操作**：提交、查询、取消、恢复、统计（供 HTTP 层调用）

use anyhow::Context;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::api;
use crate::config::Config;
use crate::error::{AppError, AppResult};
use crate::infrastructure::{AdmissionQueue, PermitStore, StateStore};
use crate::models::{
    CompletionNotification, PermitCounter, RequestRecord, RequestStatus, ReviewOutcome,
};
use crate::orchestrator::admission::AdmissionController;
use crate::orchestrator::completion::{CompletionTracker, TerminalEvent, TerminalEvents};
use crate::orchestrator::pipeline::{ChannelLauncher, PipelineOrchestrator};
use crate::services::{CompletionSink, HttpStageExecutor, LogSink, StageExecutor, WebhookSink};
use crate::utils::logging::{log_startup, log_stats};
use crate::utils::Backoff;
use crate::workflow::{PipelineFlow, PipelineLauncher, RequestCtx, SuspensionBridge};

const WEBHOOK_TIMEOUT: Duration = Duration::from_secs(10);

/// 状态统计
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Stats {
    pub statuses: BTreeMap<String, usize>,
    pub permits: PermitCounter,
    pub queued_messages: usize,
}

/// 启动恢复结果
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// 重新驱动的 Admitted / Running 请求
    pub relaunched: usize,
    /// 补发终态事件的请求
    pub replayed: usize,
    /// 继续等待审核的请求
    pub suspended: usize,
}

struct Receivers {
    launches: mpsc::UnboundedReceiver<String>,
    terminal: mpsc::UnboundedReceiver<TerminalEvent>,
}

/// 应用主结构
pub struct App {
    config: Config,
    store: Arc<StateStore>,
    queue: Arc<AdmissionQueue>,
    launcher: Arc<ChannelLauncher>,
    events: TerminalEvents,
    admission: Arc<AdmissionController>,
    orchestrator: Arc<PipelineOrchestrator>,
    bridge: Arc<SuspensionBridge>,
    tracker: Arc<CompletionTracker>,
    receivers: Mutex<Option<Receivers>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl App {
    /// 按配置创建应用：快照存储、HTTP 阶段协作方、webhook 或日志通知
    pub async fn initialize(config: Config) -> anyhow::Result<Self> {
        let store = match &config.state_file {
            Some(path) => StateStore::open(path)
                .with_context(|| format!("打开状态快照失败: {}", path))?,
            None => StateStore::in_memory(),
        };

        let executor = HttpStageExecutor::new(&config.stage_service_url, config.stage_timeout())
            .context("创建阶段协作方客户端失败")?;

        let sink: Arc<dyn CompletionSink> = match &config.completion_webhook_url {
            Some(url) => Arc::new(
                WebhookSink::new(url, WEBHOOK_TIMEOUT).context("创建 webhook 客户端失败")?,
            ),
            None => Arc::new(LogSink),
        };

        let app = Self::with_components(config, Arc::new(store), Arc::new(executor), sink)?;
        Ok(app)
    }

    /// 使用给定组件装配应用
    pub fn with_components(
        config: Config,
        store: Arc<StateStore>,
        executor: Arc<dyn StageExecutor>,
        sink: Arc<dyn CompletionSink>,
    ) -> AppResult<Self> {
        config.validate()?;

        let queue = Arc::new(AdmissionQueue::new(
            store.clone(),
            config.visibility_timeout(),
        ));
        let (launcher, launches) = ChannelLauncher::new();
        let launcher = Arc::new(launcher);
        let (events, terminal) = TerminalEvents::channel();

        let bridge = Arc::new(SuspensionBridge::new(
            store.clone(),
            launcher.clone(),
            sink.clone(),
            config.review_timeout(),
        ));
        let flow = PipelineFlow::new(
            store.clone(),
            executor,
            bridge.clone(),
            config.stages.clone(),
            config.stage_max_retries,
            Backoff::new(config.stage_backoff_base(), config.stage_backoff_max()),
        );
        let orchestrator = Arc::new(PipelineOrchestrator::new(
            store.clone(),
            flow,
            events.clone(),
        ));
        let admission = Arc::new(AdmissionController::new(
            store.clone(),
            queue.clone(),
            launcher.clone(),
            events.clone(),
            config.counter_id.clone(),
            config.admission_max_retries,
            config.max_delivery_count,
            Backoff::new(config.admission_backoff_base(), config.admission_backoff_max()),
        ));
        let tracker = Arc::new(CompletionTracker::new(
            store.clone(),
            sink,
            config.counter_id.clone(),
        ));

        Ok(Self {
            config,
            store,
            queue,
            launcher,
            events,
            admission,
            orchestrator,
            bridge,
            tracker,
            receivers: Mutex::new(Some(Receivers { launches, terminal })),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// 启动后台任务并执行启动恢复
    pub fn start(&self) -> AppResult<RecoveryReport> {
        let counter = self
            .store
            .ensure_initialized(&self.config.counter_id, self.config.max_permits)?;
        info!(
            "🎫 许可计数器 {}: 可用 {}/{}",
            self.config.counter_id, counter.available_permits, counter.max_permits
        );

        let receivers = self
            .receivers
            .lock()
            .take()
            .ok_or_else(|| AppError::InvalidInput("应用已经启动".to_string()))?;

        {
            let mut tasks = self.tasks.lock();
            tasks.push(tokio::spawn(self.tracker.clone().run(receivers.terminal)));
            tasks.push(tokio::spawn(
                self.orchestrator.clone().run_dispatcher(receivers.launches),
            ));
        }

        // 准入消费者启动前完成恢复，恢复只会看到上次运行留下的请求
        let report = self.recover()?;
        info!(
            "🔄 启动恢复完成: 重新驱动 {} 个, 补发终态事件 {} 个, 等待审核 {} 个, 排队消息 {} 条",
            report.relaunched,
            report.replayed,
            report.suspended,
            self.queue.len()
        );

        {
            let mut tasks = self.tasks.lock();
            if report.suspended > 0 {
                let bridge = self.bridge.clone();
                tasks.push(tokio::spawn(async move {
                    let announced = bridge.announce_pending().await;
                    info!("📝 已补发 {} 条审核通知", announced);
                }));
            }
            for worker_id in 1..=self.config.admission_workers {
                tasks.push(tokio::spawn(
                    self.admission
                        .clone()
                        .run_worker(worker_id, self.config.poll_interval()),
                ));
            }
            tasks.push(tokio::spawn(run_sweeper(
                self.bridge.clone(),
                self.events.clone(),
                self.store.clone(),
                self.config.sweep_interval(),
                self.config.retention(),
            )));
        }
        Ok(report)
    }

    /// 启动服务并阻塞，直到收到 Ctrl-C
    pub async fn run(self) -> anyhow::Result<()> {
        log_startup(&self.config);
        self.start().context("启动后台任务失败")?;

        let app = Arc::new(self);
        let listener = tokio::net::TcpListener::bind(&app.config.listen_addr)
            .await
            .with_context(|| format!("监听地址 {} 绑定失败", app.config.listen_addr))?;
        info!("🌐 HTTP 服务监听: {}", app.config.listen_addr);

        axum::serve(listener, api::router(app.clone()))
            .with_graceful_shutdown(shutdown_signal())
            .await
            .context("HTTP 服务异常退出")?;

        if let Ok(counter) = app.store.counter(&app.config.counter_id) {
            log_stats(&app.store.status_counts(), &counter);
        }
        app.shutdown().await;
        Ok(())
    }

    /// 中止所有后台任务（包括进行中的流水线驱动）
    pub async fn shutdown(&self) {
        let handles: Vec<_> = self.tasks.lock().drain(..).collect();
        for handle in &handles {
            handle.abort();
        }
        futures::future::join_all(handles).await;
        info!("后台任务已停止");
    }

    // ========== 对外操作 ==========

    pub fn submit(&self, request_id: Option<String>, document_ref: String) -> AppResult<RequestRecord> {
        self.admission.submit(request_id, document_ref)
    }

    pub fn get(&self, request_id: &str) -> AppResult<RequestRecord> {
        Ok(self.store.get_request(request_id)?)
    }

    pub fn list(&self, status: Option<RequestStatus>) -> Vec<RequestRecord> {
        self.store.list_requests(status)
    }

    pub fn completion(&self, request_id: &str) -> Option<CompletionNotification> {
        self.store.completion(request_id)
    }

    /// 恢复挂起的请求；句柄无效时返回 `false`
    pub fn resume(
        &self,
        handle: &str,
        outcome: ReviewOutcome,
        reviewer_note: Option<String>,
    ) -> AppResult<bool> {
        self.bridge.resume(handle, outcome, reviewer_note)
    }

    /// 取消请求
    ///
    /// - Queued：删除消息，直接进入 Cancelled
    /// - Suspended：作废句柄并带取消标记重新进入编排器
    /// - Admitted / Running：设置取消标记，在阶段之间生效
    /// - 终态：返回 `false`
    pub fn cancel(&self, request_id: &str) -> AppResult<bool> {
        let ctx = RequestCtx::new(request_id);
        // 读取与修改之间状态可能被其他组件推进，重新读取后再试
        for _ in 0..3 {
            let record = self.store.get_request(ctx.id())?;
            let done = match record.status {
                RequestStatus::Queued => self.admission.cancel_queued(&ctx)?,
                RequestStatus::Suspended => self.bridge.cancel_suspended(&ctx)?,
                RequestStatus::Admitted | RequestStatus::Running => {
                    self.store.update_request(ctx.id(), |r| {
                        if !matches!(r.status, RequestStatus::Admitted | RequestStatus::Running) {
                            return Ok(false);
                        }
                        r.cancel_requested = true;
                        r.touch(Utc::now());
                        Ok(true)
                    })?
                }
                _ => return Ok(false),
            };
            if done {
                info!("{} 已请求取消 (状态 {})", ctx, record.status);
                return Ok(true);
            }
        }
        warn!("{} 状态持续变化，取消未生效", ctx);
        Ok(false)
    }

    /// 立即执行一次审核超时扫描，返回超时的请求数
    pub fn sweep_expired(&self, now: DateTime<Utc>) -> AppResult<usize> {
        sweep_once(&self.bridge, &self.events, now)
    }

    /// 清理在 `now - retention` 之前已收尾的请求，返回清理的数量
    pub fn prune_finished(&self, now: DateTime<Utc>) -> AppResult<usize> {
        prune_once(&self.store, now, self.config.retention())
    }

    pub fn stats(&self) -> AppResult<Stats> {
        let statuses = self
            .store
            .status_counts()
            .into_iter()
            .map(|(status, count)| (status.as_str().to_string(), count))
            .collect();
        Ok(Stats {
            statuses,
            permits: self.store.counter(&self.config.counter_id)?,
            queued_messages: self.queue.len(),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    // ========== 启动恢复 ==========

    /// 从持久化状态恢复
    ///
    /// - Admitted / Running：重新驱动，编排器从执行轨迹推导下一阶段
    /// - 终态但许可未释放或缺少完成记录：补发终态事件
    /// - Suspended：继续等待；Queued：消息仍在队列中
    fn recover(&self) -> AppResult<RecoveryReport> {
        let mut report = RecoveryReport::default();
        for record in self.store.list_requests(None) {
            let ctx = RequestCtx::new(record.request_id.as_str());
            match record.status {
                RequestStatus::Admitted | RequestStatus::Running => {
                    self.launcher.launch(ctx.id())?;
                    report.relaunched += 1;
                }
                RequestStatus::Suspended => report.suspended += 1,
                status if status.is_terminal() => {
                    if record.permit_held || self.store.completion(ctx.id()).is_none() {
                        warn!("{} 终态 {} 尚未完成收尾，补发终态事件", ctx, status);
                        self.events.emit(ctx.id());
                        report.replayed += 1;
                    }
                }
                _ => {}
            }
        }
        Ok(report)
    }
}

fn sweep_once(
    bridge: &SuspensionBridge,
    events: &TerminalEvents,
    now: DateTime<Utc>,
) -> AppResult<usize> {
    let expired = bridge.sweep_expired(now)?;
    for request_id in &expired {
        events.emit(request_id);
    }
    Ok(expired.len())
}

fn prune_once(
    store: &StateStore,
    now: DateTime<Utc>,
    retention: chrono::Duration,
) -> AppResult<usize> {
    let Some(cutoff) = now.checked_sub_signed(retention) else {
        return Ok(0);
    };
    Ok(store.prune_finished(cutoff)?)
}

async fn run_sweeper(
    bridge: Arc<SuspensionBridge>,
    events: TerminalEvents,
    store: Arc<StateStore>,
    interval: Duration,
    retention: chrono::Duration,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let now = Utc::now();
        if let Err(e) = sweep_once(&bridge, &events, now) {
            error!("❌ 审核超时扫描失败: {}", e);
        }
        if let Err(e) = prune_once(&store, now, retention) {
            error!("❌ 清理已收尾请求失败: {}", e);
        }
    }
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("收到退出信号，正在停止..."),
        Err(e) => {
            error!("监听退出信号失败，服务将持续运行: {}", e);
            std::future::pending::<()>().await;
        }
    }
}
