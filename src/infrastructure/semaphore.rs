//! 许可存储（Semaphore Store）- 基础设施层
//!
//! 持久化的原子计数器，提供有界并发许可。
//!
//! - `acquire`：条件扣减（compare-and-decrement），扣减后不得小于 0
//! - `release`：按请求释放，与 `permit_held` 的检查和清除在同一事务中完成，
//!   重复释放是无操作，且永远不会超过 `max_permits`
//! - `ensure_initialized`：幂等初始化，不重置已存在的计数器

use tracing::{debug, warn};

use crate::error::{StoreError, StoreResult};
use crate::infrastructure::state_store::{StateStore, StoreTxn};
use crate::models::{AcquireOutcome, PermitCounter};

/// 许可存储能力
///
/// 准入控制器只需要 `acquire`，完成跟踪器只需要 `release`。
pub trait PermitStore: Send + Sync {
    /// 计数器不存在时以 `max_permits` 创建；已存在时原样返回
    fn ensure_initialized(&self, counter_id: &str, max_permits: u32) -> StoreResult<PermitCounter>;

    /// 为请求获取一个许可
    fn acquire(&self, counter_id: &str, request_id: &str) -> StoreResult<AcquireOutcome>;

    /// 释放请求持有的许可；请求未持有许可时返回 `false`
    fn release(&self, counter_id: &str, request_id: &str) -> StoreResult<bool>;

    fn counter(&self, counter_id: &str) -> StoreResult<PermitCounter>;
}

/// 在已有事务中获取许可
///
/// 调用方可以把获取许可和其他条件检查、状态迁移放进同一个事务。
pub fn acquire_in(
    tx: &mut StoreTxn<'_>,
    counter_id: &str,
    request_id: &str,
) -> StoreResult<AcquireOutcome> {
    if tx.request(request_id)?.permit_held {
        return Ok(AcquireOutcome::AlreadyHeld);
    }

    let counter = tx.counter_mut(counter_id)?;
    if counter.available_permits == 0 {
        return Ok(AcquireOutcome::Exhausted);
    }
    counter.available_permits -= 1;
    let available = counter.available_permits;

    tx.request_mut(request_id)?.permit_held = true;
    debug!("[请求 {}] 🎫 获取许可，剩余 {}", request_id, available);
    Ok(AcquireOutcome::Granted)
}

/// 在已有事务中释放许可
pub fn release_in(tx: &mut StoreTxn<'_>, counter_id: &str, request_id: &str) -> StoreResult<bool> {
    if !tx.request(request_id)?.permit_held {
        return Ok(false);
    }

    let counter = tx.counter_mut(counter_id)?;
    if counter.available_permits >= counter.max_permits {
        warn!(
            "[请求 {}] 许可计数器 {} 已满，仅清除持有标记",
            request_id, counter_id
        );
    } else {
        counter.available_permits += 1;
    }
    let available = counter.available_permits;

    tx.request_mut(request_id)?.permit_held = false;
    debug!("[请求 {}] 🎫 释放许可，剩余 {}", request_id, available);
    Ok(true)
}

impl PermitStore for StateStore {
    fn ensure_initialized(&self, counter_id: &str, max_permits: u32) -> StoreResult<PermitCounter> {
        self.transact(|tx| {
            if let Some(counter) = tx.counter(counter_id).copied() {
                if counter.max_permits != max_permits {
                    warn!(
                        "许可计数器 {} 已存在 (max={})，忽略新的上限 {}",
                        counter_id, counter.max_permits, max_permits
                    );
                }
                return Ok(counter);
            }
            let counter = PermitCounter::new(max_permits);
            tx.insert_counter(counter_id, counter);
            Ok(counter)
        })
    }

    fn acquire(&self, counter_id: &str, request_id: &str) -> StoreResult<AcquireOutcome> {
        self.transact(|tx| acquire_in(tx, counter_id, request_id))
    }

    fn release(&self, counter_id: &str, request_id: &str) -> StoreResult<bool> {
        self.transact(|tx| release_in(tx, counter_id, request_id))
    }

    fn counter(&self, counter_id: &str) -> StoreResult<PermitCounter> {
        self.read(|state| state.counters.get(counter_id).copied())
            .ok_or_else(|| StoreError::CounterNotFound {
                counter_id: counter_id.to_string(),
            })
    }
}
