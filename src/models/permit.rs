//! 许可计数器（Permit Counter）

use serde::{Deserialize, Serialize};

/// 许可计数器
///
/// 不变量：`0 ≤ available_permits ≤ max_permits`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PermitCounter {
    pub max_permits: u32,
    pub available_permits: u32,
}

impl PermitCounter {
    pub fn new(max_permits: u32) -> Self {
        Self {
            max_permits,
            available_permits: max_permits,
        }
    }

    /// 当前被占用的许可数
    pub fn in_use(&self) -> u32 {
        self.max_permits - self.available_permits
    }
}

/// `Acquire` 的结果
///
/// 容量不足不是错误，而是准入层的背压信号
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    Granted,
    Exhausted,
    /// 该请求已经持有许可，未重复扣减
    AlreadyHeld,
}

impl AcquireOutcome {
    pub fn is_ok(&self) -> bool {
        !matches!(self, AcquireOutcome::Exhausted)
    }
}
