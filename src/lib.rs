//! # IDP Orchestrator
//!
//! 有界并发的文档处理编排服务
//!
//! ## 架构设计
//!
//! 本系统采用严格的分层架构：
//!
//! ### ① 基础设施层（Infrastructure）
//! - `infrastructure/` - 持有唯一的持久化状态，只暴露能力
//! - `StateStore` - 事务式状态存储（JSON 快照 + 追加变更日志，定期压缩）
//! - `PermitStore` - 许可计数器（条件扣减、按请求幂等释放）
//! - `AdmissionQueue` - 至少一次投递的准入队列（可见性超时 + 投递计数）
//!
//! ### ② 业务能力层（Services）
//! - `services/` - 描述"我能做什么"，只处理单个阶段或单条通知
//! - `StageExecutor` - 调用外部阶段协作方（`HttpStageExecutor`）
//! - `CompletionSink` - 发送完成通知（日志 / webhook / 进程内通道）
//!
//! ### ③ 流程层（Workflow）
//! - `workflow/` - 定义"一个请求"的完整处理流程
//! - `RequestCtx` - 上下文封装（request_id，日志前缀）
//! - `PipelineFlow` - 阶段推进（重试 → 审核策略 → 挂起）
//! - `SuspensionBridge` - 人工审核挂起与恢复（一次性句柄）
//!
//! ### ④ 编排层（Orchestration）
//! - `orchestrator/admission` - 准入控制，获取许可并启动流水线
//! - `orchestrator/pipeline` - 流水线调度与驱动，写入终态
//! - `orchestrator/completion` - 完成跟踪，释放许可并记录结果
//! - `orchestrator/app` - 显式装配、启动恢复、后台任务
//!
//! ### ⑤ 接口层（API）
//! - `api/` - axum HTTP 接口：提交、查询、取消、恢复、统计
//!
//! ## 模块结构

pub mod api;
pub mod config;
pub mod error;
pub mod infrastructure;
pub mod models;
pub mod orchestrator;
pub mod services;
pub mod utils;
pub mod workflow;

// 重新导出常用类型
pub use config::{Config, StageConfig, StageConfigs};
pub use error::{AppError, AppResult};
pub use infrastructure::{AdmissionQueue, PermitStore, StateStore};
pub use models::{
    CompletionNotification, FailureReason, RequestRecord, RequestStatus, ReviewNotification,
    ReviewOutcome, Stage,
};
pub use orchestrator::{App, RecoveryReport, Stats};
pub use services::{CompletionSink, StageExecutor, StageResult, StageStatus};
pub use workflow::{RequestCtx, SuspensionBridge};
