//! 基础设施层（Infrastructure Layer）
//!
//! 持有唯一的持久化状态（`StateStore`），向上只暴露能力：
//!
//! - `StateStore` - 事务式状态存储，所有持久化状态的唯一所有者
//! - `wal` - 快照 + 追加变更日志
//! - `PermitStore` - 许可计数器的获取 / 释放能力
//! - `AdmissionQueue` - 带可见性超时的准入队列

pub mod queue;
pub mod semaphore;
pub mod state_store;
mod wal;

pub use queue::AdmissionQueue;
pub use semaphore::PermitStore;
pub use state_store::{apply_transition, StateStore, StoreState, StoreTxn};
