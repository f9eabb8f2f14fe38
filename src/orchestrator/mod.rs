//! 编排层（Orchestration Layer）
//!
//! ## 职责
//!
//! 本层负责请求的准入、流水线调度和收尾，是整个系统的"指挥中心"。
//!
//! ## 模块划分
//!
//! ### `admission` - 准入控制器
//! - 消费准入队列，获取许可，启动流水线
//! - 无可用许可时指数退避重试，重试耗尽标记 `CapacityExhausted`
//! - 启动失败时补偿（退回 Queued 并释放许可）
//!
//! ### `pipeline` - 流水线编排器
//! - 调度循环：为每个启动请求派生驱动任务
//! - 驱动：Admitted → Running → 委托 `PipelineFlow` → 终态
//!
//! ### `completion` - 完成跟踪器
//! - 消费终态事件，释放许可、写入完成记录、发送通知（均幂等）
//!
//! ### `app` - 应用装配
//! - 显式构造并连接所有组件，启动恢复，后台任务生命周期
//!
//! ## 层次关系
//!
//! ```text
//! app (装配 + 生命周期)
//!     ↓
//! admission / pipeline / completion
//!     ↓
//! workflow::PipelineFlow / SuspensionBridge (单个请求)
//!     ↓
//! services (能力层：stage executor / completion sink)
//!     ↓
//! infrastructure (基础设施：StateStore / PermitStore / AdmissionQueue)
//! ```
//!
//! ## 设计原则
//!
//! 1. **单一职责**：准入只管准入，完成跟踪只管收尾
//! 2. **许可隔离**：只有 admission 获取许可，只有 completion 释放许可（补偿除外）
//! 3. **向下依赖**：编排层 → workflow → services → infrastructure
//! 4. **无内存状态**：所有决策基于持久化的请求记录

pub mod admission;
pub mod app;
pub mod completion;
pub mod pipeline;

// 重新导出主要类型
pub use admission::{AdmissionController, AdmissionDecision};
pub use app::{App, RecoveryReport, Stats};
pub use completion::{CompletionTracker, TerminalEvent, TerminalEvents};
pub use pipeline::{ChannelLauncher, PipelineOrchestrator};
