//! 集成测试共用的脚本化协作方与等待工具

#![allow(dead_code)]

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use idp_orchestrator::services::ChannelSink;
use idp_orchestrator::{
    App, CompletionNotification, Config, RequestRecord, RequestStatus, ReviewNotification, Stage,
    StageConfig, StageExecutor, StageResult, StateStore,
};
use tokio::sync::mpsc::UnboundedReceiver;

pub const WAIT_LIMIT: Duration = Duration::from_secs(5);

/// 脚本化的阶段协作方
///
/// 每个 (请求, 阶段) 可以预置一组结果，按顺序消费；脚本用完后返回成功，
/// 文档引用为 `{输入}>{阶段}`，Assess 置信度为 0.95。
#[derive(Default)]
pub struct ScriptedExecutor {
    scripts: Mutex<HashMap<(String, Stage), VecDeque<StageResult>>>,
    calls: Mutex<Vec<(String, Stage)>>,
    hang_at: Option<Stage>,
    delay: Duration,
}

impl ScriptedExecutor {
    pub fn new() -> Self {
        Self::default()
    }

    /// 执行到指定阶段时永远不返回
    pub fn hanging_at(stage: Stage) -> Self {
        Self {
            hang_at: Some(stage),
            ..Self::default()
        }
    }

    /// 每次调用前等待一段时间
    pub fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    pub fn script(&self, request_id: &str, stage: Stage, results: Vec<StageResult>) {
        self.scripts
            .lock()
            .entry((request_id.to_string(), stage))
            .or_default()
            .extend(results);
    }

    /// Assess 返回低置信度，触发人工审核
    pub fn low_confidence(&self, request_id: &str) {
        self.script(
            request_id,
            Stage::Assess,
            vec![StageResult::success(format!("assessed:{}", request_id)).with_confidence(0.2)],
        );
    }

    pub fn calls_for(&self, request_id: &str, stage: Stage) -> usize {
        self.calls
            .lock()
            .iter()
            .filter(|(id, s)| id == request_id && *s == stage)
            .count()
    }
}

#[async_trait]
impl StageExecutor for ScriptedExecutor {
    async fn execute(
        &self,
        request_id: &str,
        stage: Stage,
        document_ref: &str,
        _config: &StageConfig,
    ) -> StageResult {
        self.calls.lock().push((request_id.to_string(), stage));
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        if self.hang_at == Some(stage) {
            std::future::pending::<()>().await;
        }

        let scripted = self
            .scripts
            .lock()
            .get_mut(&(request_id.to_string(), stage))
            .and_then(VecDeque::pop_front);
        scripted.unwrap_or_else(|| {
            let result = StageResult::success(format!("{}>{}", document_ref, stage));
            if stage == Stage::Assess {
                result.with_confidence(0.95)
            } else {
                result
            }
        })
    }
}

/// 测试用的小配置：快速退避、快速轮询
pub fn test_config() -> Config {
    Config {
        max_permits: 2,
        admission_max_retries: 50,
        admission_backoff_base_ms: 5,
        admission_backoff_max_ms: 20,
        stage_max_retries: 2,
        stage_backoff_base_ms: 1,
        stage_backoff_max_ms: 5,
        max_delivery_count: 100,
        poll_interval_ms: 5,
        review_timeout_secs: 3600,
        ..Config::default()
    }
}

pub struct TestApp {
    pub app: Arc<App>,
    pub executor: Arc<ScriptedExecutor>,
    pub notifications: UnboundedReceiver<CompletionNotification>,
    pub reviews: UnboundedReceiver<ReviewNotification>,
}

/// 装配应用，不启动后台任务
pub fn build(config: Config, store: StateStore, executor: ScriptedExecutor) -> TestApp {
    let executor = Arc::new(executor);
    let (sink, notifications, reviews) = ChannelSink::with_reviews();
    let app = App::with_components(config, Arc::new(store), executor.clone(), Arc::new(sink))
        .expect("装配应用失败");
    TestApp {
        app: Arc::new(app),
        executor,
        notifications,
        reviews,
    }
}

/// 装配并启动
pub fn start(config: Config, executor: ScriptedExecutor) -> TestApp {
    let test_app = build(config, StateStore::in_memory(), executor);
    test_app.app.start().expect("启动失败");
    test_app
}

/// 轮询直到记录满足条件
pub async fn wait_until(
    app: &App,
    request_id: &str,
    predicate: impl Fn(&RequestRecord) -> bool,
) -> RequestRecord {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    loop {
        let record = app.get(request_id).expect("请求应该存在");
        if predicate(&record) {
            return record;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("等待超时，当前记录: {:?}", record);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

pub async fn wait_for_status(app: &App, request_id: &str, status: RequestStatus) -> RequestRecord {
    wait_until(app, request_id, |r| r.status == status).await
}

/// 等待下一条完成通知
pub async fn next_notification(
    notifications: &mut UnboundedReceiver<CompletionNotification>,
) -> CompletionNotification {
    tokio::time::timeout(WAIT_LIMIT, notifications.recv())
        .await
        .expect("等待完成通知超时")
        .expect("通知通道已关闭")
}

/// 等待下一条审核通知
pub async fn next_review(reviews: &mut UnboundedReceiver<ReviewNotification>) -> ReviewNotification {
    tokio::time::timeout(WAIT_LIMIT, reviews.recv())
        .await
        .expect("等待审核通知超时")
        .expect("审核通道已关闭")
}

/// 轮询直到所有请求都已收尾（终态、已释放许可、已有完成记录）
pub async fn wait_all_settled(app: &App, request_ids: &[String]) {
    let deadline = tokio::time::Instant::now() + WAIT_LIMIT;
    loop {
        let pending = request_ids
            .iter()
            .filter(|id| {
                let settled = app
                    .get(id)
                    .map(|r| r.is_terminal() && !r.permit_held)
                    .unwrap_or(false);
                !settled || app.completion(id).is_none()
            })
            .count();
        if pending == 0 {
            return;
        }
        if tokio::time::Instant::now() > deadline {
            panic!("等待超时，仍有 {} 个请求未收尾", pending);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
