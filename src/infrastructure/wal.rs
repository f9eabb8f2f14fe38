//! 追加式变更日志 - 基础设施层
//!
//! 每次事务只把改动过的条目追加为一行 JSON（值为 `null` 表示删除），
//! 日志累计到一定条数后压缩：整份状态写入快照（临时文件 + rename），
//! 再把日志截断为空。
//!
//! 启动时先读快照，再按顺序重放日志。最后一行不完整（写入中途崩溃）
//! 时丢弃该行；中间行损坏视为快照格式错误。

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::error::{StoreError, StoreResult};
use crate::infrastructure::state_store::StoreState;
use crate::models::{CompletionNotification, PermitCounter, QueueMessage, RequestRecord};

/// 日志累计多少条后压缩为快照
pub(crate) const COMPACT_EVERY: usize = 512;

/// 一次事务的变更集
#[derive(Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub(crate) struct WalRecord {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub counters: BTreeMap<String, Option<PermitCounter>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub requests: BTreeMap<String, Option<RequestRecord>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub queue: BTreeMap<String, Option<QueueMessage>>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub completions: BTreeMap<String, Option<CompletionNotification>>,
}

impl WalRecord {
    pub fn is_empty(&self) -> bool {
        self.counters.is_empty()
            && self.requests.is_empty()
            && self.queue.is_empty()
            && self.completions.is_empty()
    }

    /// 把变更应用到状态上；重复应用结果不变
    pub fn apply(self, state: &mut StoreState) {
        upsert_all(&mut state.counters, self.counters);
        upsert_all(&mut state.requests, self.requests);
        upsert_all(&mut state.queue, self.queue);
        upsert_all(&mut state.completions, self.completions);
    }
}

fn upsert_all<V>(map: &mut BTreeMap<String, V>, changes: BTreeMap<String, Option<V>>) {
    for (key, value) in changes {
        match value {
            Some(value) => {
                map.insert(key, value);
            }
            None => {
                map.remove(&key);
            }
        }
    }
}

/// 快照文件 + 追加日志
pub(crate) struct WalLog {
    snapshot_path: PathBuf,
    log_path: PathBuf,
    file: File,
    len: u64,
    entries: usize,
}

impl WalLog {
    /// 读取快照并重放日志，返回恢复出的状态
    pub fn open(snapshot_path: PathBuf) -> StoreResult<(Self, StoreState)> {
        let log_path = snapshot_path.with_extension("wal");
        let persist_err = |source| StoreError::PersistFailed {
            path: log_path.display().to_string(),
            source,
        };

        let mut state = load_snapshot(&snapshot_path)?;
        let replayed = replay(&log_path, &mut state)?;

        if let Some(parent) = log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(persist_err)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(persist_err)?;
        let len = file.metadata().map_err(persist_err)?.len();

        let mut log = Self {
            snapshot_path,
            log_path,
            file,
            len,
            entries: replayed,
        };
        if replayed > 0 || log.len > 0 {
            log.compact(&state)?;
        }
        Ok((log, state))
    }

    /// 追加一条变更；失败时把文件截回写入前的长度
    pub fn append(&mut self, record: &WalRecord) -> StoreResult<()> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        if let Err(source) = self.file.write_all(&line) {
            if let Err(e) = self.file.set_len(self.len) {
                warn!("截断变更日志失败 ({}): {}", self.log_path.display(), e);
            }
            return Err(StoreError::PersistFailed {
                path: self.log_path.display().to_string(),
                source,
            });
        }
        self.len += line.len() as u64;
        self.entries += 1;
        Ok(())
    }

    pub fn should_compact(&self) -> bool {
        self.entries >= COMPACT_EVERY
    }

    /// 写入完整快照并清空日志
    pub fn compact(&mut self, state: &StoreState) -> StoreResult<()> {
        persist_snapshot(&self.snapshot_path, state)?;
        self.file
            .set_len(0)
            .map_err(|source| StoreError::PersistFailed {
                path: self.log_path.display().to_string(),
                source,
            })?;
        debug!(
            "🗜️ 变更日志已压缩 ({} 条, {} 字节)",
            self.entries, self.len
        );
        self.len = 0;
        self.entries = 0;
        Ok(())
    }
}

fn load_snapshot(path: &Path) -> StoreResult<StoreState> {
    if !path.exists() {
        info!("状态快照不存在，从空状态开始: {}", path.display());
        return Ok(StoreState::default());
    }
    let content = fs::read(path).map_err(|source| StoreError::LoadFailed {
        path: path.display().to_string(),
        source,
    })?;
    let state: StoreState = serde_json::from_slice(&content)?;
    info!(
        "✓ 已加载状态快照: {} ({} 个请求, {} 条队列消息)",
        path.display(),
        state.requests.len(),
        state.queue.len()
    );
    Ok(state)
}

fn replay(log_path: &Path, state: &mut StoreState) -> StoreResult<usize> {
    if !log_path.exists() {
        return Ok(0);
    }
    let content = fs::read(log_path).map_err(|source| StoreError::LoadFailed {
        path: log_path.display().to_string(),
        source,
    })?;

    let lines: Vec<&[u8]> = content
        .split(|b| *b == b'\n')
        .filter(|line| !line.iter().all(u8::is_ascii_whitespace))
        .collect();
    let mut replayed = 0;
    for (index, line) in lines.iter().enumerate() {
        match serde_json::from_slice::<WalRecord>(line) {
            Ok(record) => {
                record.apply(state);
                replayed += 1;
            }
            Err(e) if index + 1 == lines.len() => {
                warn!("⚠️ 丢弃变更日志末尾不完整的一行: {}", e);
            }
            Err(e) => return Err(e.into()),
        }
    }
    if replayed > 0 {
        info!("✓ 已重放变更日志: {} 条", replayed);
    }
    Ok(replayed)
}

fn persist_snapshot(path: &Path, state: &StoreState) -> StoreResult<()> {
    let bytes = serde_json::to_vec(state)?;
    let persist_err = |source| StoreError::PersistFailed {
        path: path.display().to_string(),
        source,
    };

    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        fs::create_dir_all(parent).map_err(persist_err)?;
    }
    let tmp_path = path.with_extension("tmp");
    fs::write(&tmp_path, bytes).map_err(persist_err)?;
    fs::rename(&tmp_path, path).map_err(persist_err)?;
    Ok(())
}
