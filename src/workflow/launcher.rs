//! 流水线启动能力
//!
//! 准入控制器和挂起桥接都需要"让编排器开始驱动某个请求"，
//! 但不应直接持有编排器。这里只定义能力，具体实现在编排层。

use crate::error::LaunchError;

/// 启动（或重新进入）某个请求的流水线驱动
///
/// 实现方只负责调度，不等待流水线执行；返回 `Ok` 表示驱动已被接受。
pub trait PipelineLauncher: Send + Sync {
    fn launch(&self, request_id: &str) -> Result<(), LaunchError>;
}
