//! 持久化状态存储 - 基础设施层
//!
//! 许可计数器、请求记录（含执行轨迹）、准入队列消息、完成记录都保存在这里。
//!
//! 每个操作都是一次事务：闭包通过 [`StoreTxn`] 直接修改内存状态，
//! 事务记录每个被改动条目的旧值。闭包返回错误或变更写入日志失败时
//! 按旧值回滚，不会留下任何修改。成功时只把改动过的条目追加到变更日志
//! （见 [`super::wal`]），不复制、不重写整份状态。未配置路径时只保存在内存中。

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::infrastructure::wal::{WalLog, WalRecord};
use crate::models::{
    CompletionNotification, PermitCounter, QueueMessage, RequestRecord, RequestStatus,
};

/// 存储的全部状态
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreState {
    pub counters: BTreeMap<String, PermitCounter>,
    pub requests: BTreeMap<String, RequestRecord>,
    pub queue: BTreeMap<String, QueueMessage>,
    pub completions: BTreeMap<String, CompletionNotification>,
}

impl StoreState {
    pub fn request(&self, request_id: &str) -> StoreResult<&RequestRecord> {
        self.requests
            .get(request_id)
            .ok_or_else(|| StoreError::not_found(request_id))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Table {
    Counters,
    Requests,
    Queue,
    Completions,
}

/// 条目被第一次改动前的值
enum Undo {
    Counter(String, Option<PermitCounter>),
    Request(String, Option<RequestRecord>),
    Message(String, Option<QueueMessage>),
    Completion(String, Option<CompletionNotification>),
}

/// 事务句柄
///
/// 读操作直接访问状态；写操作必须经过这里的方法，以便记录旧值和改动的键。
pub struct StoreTxn<'a> {
    state: &'a mut StoreState,
    touched: BTreeSet<(Table, String)>,
    undo: Vec<Undo>,
}

impl<'a> StoreTxn<'a> {
    fn new(state: &'a mut StoreState) -> Self {
        Self {
            state,
            touched: BTreeSet::new(),
            undo: Vec::new(),
        }
    }

    /// 只读视图
    pub fn state(&self) -> &StoreState {
        self.state
    }

    fn touch(&mut self, table: Table, key: &str) {
        if !self.touched.insert((table, key.to_string())) {
            return;
        }
        let key = key.to_string();
        let undo = match table {
            Table::Counters => {
                let previous = self.state.counters.get(&key).copied();
                Undo::Counter(key, previous)
            }
            Table::Requests => {
                let previous = self.state.requests.get(&key).cloned();
                Undo::Request(key, previous)
            }
            Table::Queue => {
                let previous = self.state.queue.get(&key).cloned();
                Undo::Message(key, previous)
            }
            Table::Completions => {
                let previous = self.state.completions.get(&key).cloned();
                Undo::Completion(key, previous)
            }
        };
        self.undo.push(undo);
    }

    // ========== 请求记录 ==========

    pub fn request(&self, request_id: &str) -> StoreResult<&RequestRecord> {
        self.state.request(request_id)
    }

    pub fn contains_request(&self, request_id: &str) -> bool {
        self.state.requests.contains_key(request_id)
    }

    pub fn request_mut(&mut self, request_id: &str) -> StoreResult<&mut RequestRecord> {
        if !self.state.requests.contains_key(request_id) {
            return Err(StoreError::not_found(request_id));
        }
        self.touch(Table::Requests, request_id);
        self.state
            .requests
            .get_mut(request_id)
            .ok_or_else(|| StoreError::not_found(request_id))
    }

    pub fn insert_request(&mut self, record: RequestRecord) {
        self.touch(Table::Requests, &record.request_id);
        self.state
            .requests
            .insert(record.request_id.clone(), record);
    }

    pub fn remove_request(&mut self, request_id: &str) -> Option<RequestRecord> {
        self.touch(Table::Requests, request_id);
        self.state.requests.remove(request_id)
    }

    // ========== 许可计数器 ==========

    pub fn counter(&self, counter_id: &str) -> Option<&PermitCounter> {
        self.state.counters.get(counter_id)
    }

    pub fn counter_mut(&mut self, counter_id: &str) -> StoreResult<&mut PermitCounter> {
        if self.state.counters.contains_key(counter_id) {
            self.touch(Table::Counters, counter_id);
        }
        self.state
            .counters
            .get_mut(counter_id)
            .ok_or_else(|| StoreError::CounterNotFound {
                counter_id: counter_id.to_string(),
            })
    }

    pub fn insert_counter(&mut self, counter_id: &str, counter: PermitCounter) {
        self.touch(Table::Counters, counter_id);
        self.state.counters.insert(counter_id.to_string(), counter);
    }

    // ========== 队列消息 ==========

    pub fn message_mut(&mut self, request_id: &str) -> Option<&mut QueueMessage> {
        if !self.state.queue.contains_key(request_id) {
            return None;
        }
        self.touch(Table::Queue, request_id);
        self.state.queue.get_mut(request_id)
    }

    pub fn insert_message(&mut self, message: QueueMessage) {
        let request_id = message.request_id().to_string();
        self.touch(Table::Queue, &request_id);
        self.state.queue.insert(request_id, message);
    }

    pub fn remove_message(&mut self, request_id: &str) -> Option<QueueMessage> {
        if !self.state.queue.contains_key(request_id) {
            return None;
        }
        self.touch(Table::Queue, request_id);
        self.state.queue.remove(request_id)
    }

    // ========== 完成记录 ==========

    pub fn insert_completion(&mut self, notification: CompletionNotification) {
        self.touch(Table::Completions, &notification.request_id);
        self.state
            .completions
            .insert(notification.request_id.clone(), notification);
    }

    pub fn remove_completion(&mut self, request_id: &str) -> Option<CompletionNotification> {
        if !self.state.completions.contains_key(request_id) {
            return None;
        }
        self.touch(Table::Completions, request_id);
        self.state.completions.remove(request_id)
    }

    /// 改动过的条目的当前值
    fn changes(&self) -> WalRecord {
        let mut record = WalRecord::default();
        for (table, key) in &self.touched {
            match table {
                Table::Counters => {
                    record
                        .counters
                        .insert(key.clone(), self.state.counters.get(key).copied());
                }
                Table::Requests => {
                    record
                        .requests
                        .insert(key.clone(), self.state.requests.get(key).cloned());
                }
                Table::Queue => {
                    record
                        .queue
                        .insert(key.clone(), self.state.queue.get(key).cloned());
                }
                Table::Completions => {
                    record
                        .completions
                        .insert(key.clone(), self.state.completions.get(key).cloned());
                }
            }
        }
        record
    }

    fn rollback(self) {
        for undo in self.undo.into_iter().rev() {
            match undo {
                Undo::Counter(key, previous) => restore(&mut self.state.counters, key, previous),
                Undo::Request(key, previous) => restore(&mut self.state.requests, key, previous),
                Undo::Message(key, previous) => restore(&mut self.state.queue, key, previous),
                Undo::Completion(key, previous) => {
                    restore(&mut self.state.completions, key, previous)
                }
            }
        }
    }
}

fn restore<V>(map: &mut BTreeMap<String, V>, key: String, previous: Option<V>) {
    match previous {
        Some(value) => {
            map.insert(key, value);
        }
        None => {
            map.remove(&key);
        }
    }
}

struct Inner {
    state: StoreState,
    log: Option<WalLog>,
}

/// 持久化状态存储
pub struct StateStore {
    inner: Mutex<Inner>,
}

impl StateStore {
    /// 创建仅内存的存储
    pub fn in_memory() -> Self {
        Self {
            inner: Mutex::new(Inner {
                state: StoreState::default(),
                log: None,
            }),
        }
    }

    /// 打开快照文件和同目录下的变更日志；都不存在时从空状态开始
    pub fn open(path: impl Into<PathBuf>) -> StoreResult<Self> {
        let (log, state) = WalLog::open(path.into())?;
        Ok(Self {
            inner: Mutex::new(Inner {
                state,
                log: Some(log),
            }),
        })
    }

    /// 以事务方式修改状态
    pub fn transact<T>(
        &self,
        f: impl FnOnce(&mut StoreTxn<'_>) -> StoreResult<T>,
    ) -> StoreResult<T> {
        let mut guard = self.inner.lock();
        let Inner { state, log } = &mut *guard;

        let mut txn = StoreTxn::new(state);
        let output = match f(&mut txn) {
            Ok(output) => output,
            Err(e) => {
                txn.rollback();
                return Err(e);
            }
        };

        if let Some(log) = log {
            let changes = txn.changes();
            if !changes.is_empty() {
                if let Err(e) = log.append(&changes) {
                    txn.rollback();
                    return Err(e);
                }
                if log.should_compact() {
                    if let Err(e) = log.compact(state) {
                        // 变更已写入日志，压缩失败只影响启动时的重放长度
                        warn!("⚠️ 压缩变更日志失败: {}", e);
                    }
                }
            }
        }
        Ok(output)
    }

    /// 只读访问
    pub fn read<T>(&self, f: impl FnOnce(&StoreState) -> T) -> T {
        let guard = self.inner.lock();
        f(&guard.state)
    }

    // ========== 请求记录 ==========

    pub fn get_request(&self, request_id: &str) -> StoreResult<RequestRecord> {
        self.read(|state| state.request(request_id).cloned())
    }

    /// 对单个请求做有条件的修改
    pub fn update_request<T>(
        &self,
        request_id: &str,
        f: impl FnOnce(&mut RequestRecord) -> StoreResult<T>,
    ) -> StoreResult<T> {
        self.transact(|tx| f(tx.request_mut(request_id)?))
    }

    pub fn list_requests(&self, status: Option<RequestStatus>) -> Vec<RequestRecord> {
        self.read(|state| {
            state
                .requests
                .values()
                .filter(|r| status.map_or(true, |s| r.status == s))
                .cloned()
                .collect()
        })
    }

    /// 各状态的请求数量
    pub fn status_counts(&self) -> Vec<(RequestStatus, usize)> {
        self.read(|state| {
            RequestStatus::ALL
                .iter()
                .map(|status| {
                    let count = state
                        .requests
                        .values()
                        .filter(|r| r.status == *status)
                        .count();
                    (*status, count)
                })
                .collect()
        })
    }

    /// 清理已收尾的旧请求
    ///
    /// 只删除同时满足以下条件的请求及其完成记录：处于终态、
    /// 不再持有许可、已有完成记录、没有队列消息、完成时间不晚于 `cutoff`。
    pub fn prune_finished(&self, cutoff: DateTime<Utc>) -> StoreResult<usize> {
        let pruned = self.transact(|tx| {
            let state = tx.state();
            let finished: Vec<String> = state
                .requests
                .values()
                .filter(|r| {
                    r.status.is_terminal()
                        && !r.permit_held
                        && r.completed_at.is_some_and(|at| at <= cutoff)
                        && state.completions.contains_key(&r.request_id)
                        && !state.queue.contains_key(&r.request_id)
                })
                .map(|r| r.request_id.clone())
                .collect();

            for request_id in &finished {
                tx.remove_request(request_id);
                tx.remove_completion(request_id);
            }
            Ok(finished.len())
        })?;
        if pruned > 0 {
            info!("🧹 已清理 {} 个已收尾的请求", pruned);
        }
        Ok(pruned)
    }

    // ========== 完成记录 ==========

    pub fn completion(&self, request_id: &str) -> Option<CompletionNotification> {
        self.read(|state| state.completions.get(request_id).cloned())
    }

    /// 写入完成记录；已存在时不覆盖，返回 `false`
    pub fn record_completion(&self, notification: CompletionNotification) -> StoreResult<bool> {
        self.transact(|tx| {
            if tx.state().completions.contains_key(&notification.request_id) {
                return Ok(false);
            }
            tx.insert_completion(notification);
            Ok(true)
        })
    }
}

/// 校验并执行状态迁移
///
/// 终态不可离开；进入终态时记录完成时间。
pub fn apply_transition(
    record: &mut RequestRecord,
    to: RequestStatus,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    use RequestStatus::*;

    let allowed = match (record.status, to) {
        (Queued, Admitted | Failed | Cancelled) => true,
        // Admitted → Queued 仅用于启动失败后的补偿
        (Admitted, Running | Queued | Failed | Cancelled) => true,
        (Running, Suspended | Succeeded | Failed | Cancelled) => true,
        (Suspended, Running | Failed | Cancelled) => true,
        _ => false,
    };
    if !allowed {
        return Err(StoreError::InvalidTransition {
            request_id: record.request_id.clone(),
            from: record.status,
            to,
        });
    }

    debug!(
        "[请求 {}] 状态迁移: {} → {}",
        record.request_id, record.status, to
    );
    record.status = to;
    record.touch(now);
    if to.is_terminal() {
        record.completed_at = Some(now);
    }
    Ok(())
}
