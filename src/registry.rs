//! 上传会话登记表：记录每个会话已收到的分片，并裁决由谁负责合并。

use std::collections::{BTreeSet, HashMap, HashSet, VecDeque};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

use crate::config::{COMPLETED_CAPACITY, COMPLETED_RETENTION_SECS};
use crate::naming::SessionId;

/// 一次登记的结果。
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Registration {
    /// 该分片此前未被记录。
    pub accepted_now: bool,
    /// 本次调用认领了合并；同一会话只有一个调用方能拿到 `true`。
    pub is_complete: bool,
    pub received: u64,
    pub expected_total: u64,
    /// 会话首个分片携带的原始文件名。
    pub file_name: String,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("total chunk count must be positive")]
    EmptyUpload,
    #[error("chunk index {index} is out of range for {total} chunks")]
    IndexOutOfRange { index: u64, total: u64 },
    #[error("total chunk count changed from {expected} to {got}")]
    TotalMismatch { expected: u64, got: u64 },
    #[error("upload already completed")]
    AlreadyCompleted,
    #[error("upload session expired, please restart the upload")]
    Expired,
}

#[derive(Debug)]
struct SessionEntry {
    expected_total: u64,
    received: BTreeSet<u64>,
    file_name: String,
    last_activity: Instant,
    claimed: bool,
}

/// 近期完成的会话标识，按完成时间排队，超出保留期或容量即淘汰。
#[derive(Debug, Default)]
struct CompletedIds {
    ids: HashSet<SessionId>,
    order: VecDeque<(Instant, SessionId)>,
}

impl CompletedIds {
    fn contains(&self, session_id: &SessionId) -> bool {
        self.ids.contains(session_id)
    }

    fn insert(&mut self, session_id: SessionId, now: Instant) {
        if self.ids.insert(session_id.clone()) {
            self.order.push_back((now, session_id));
        }
    }

    fn prune(&mut self, now: Instant, retention: Duration, capacity: usize) {
        while let Some((finished_at, _)) = self.order.front() {
            let expired = now.duration_since(*finished_at) > retention;
            if !expired && self.order.len() <= capacity {
                break;
            }
            if let Some((_, session_id)) = self.order.pop_front() {
                self.ids.remove(&session_id);
            }
        }
    }
}

#[derive(Debug, Default)]
struct RegistryState {
    sessions: HashMap<SessionId, SessionEntry>,
    completed: CompletedIds,
    /// 正在被清理的会话，清理期间拒绝新分片。
    reaping: HashSet<SessionId>,
}

impl RegistryState {
    fn check_open(&self, session_id: &SessionId) -> Result<(), RegistryError> {
        if self.completed.contains(session_id) {
            return Err(RegistryError::AlreadyCompleted);
        }
        if self.reaping.contains(session_id) {
            return Err(RegistryError::Expired);
        }
        Ok(())
    }
}

/// 并发安全的会话登记表。所有变更都在单个互斥区内完成，互斥区内不做 I/O。
#[derive(Debug)]
pub struct UploadRegistry {
    state: Mutex<RegistryState>,
    completed_retention: Duration,
    completed_capacity: usize,
}

impl UploadRegistry {
    pub fn new() -> Self {
        Self::with_completed_limits(
            Duration::from_secs(COMPLETED_RETENTION_SECS),
            COMPLETED_CAPACITY,
        )
    }

    /// 已完成标识最多保留 `retention`，且最多 `capacity` 个。
    pub fn with_completed_limits(retention: Duration, capacity: usize) -> Self {
        Self {
            state: Mutex::new(RegistryState::default()),
            completed_retention: retention,
            completed_capacity: capacity,
        }
    }

    /// 写分片前的只读检查，避免为注定失败的请求落盘。
    pub async fn precheck(
        &self,
        session_id: &SessionId,
        chunk_index: u64,
        expected_total: u64,
    ) -> Result<(), RegistryError> {
        check_shape(chunk_index, expected_total)?;
        let state = self.state.lock().await;
        state.check_open(session_id)?;
        if let Some(entry) = state.sessions.get(session_id)
            && entry.expected_total != expected_total
        {
            return Err(RegistryError::TotalMismatch {
                expected: entry.expected_total,
                got: expected_total,
            });
        }
        Ok(())
    }

    /// 记录一个已落盘的分片。
    ///
    /// 当已收到的不同分片数首次达到 `expected_total` 时，本次调用认领合并并返回
    /// `is_complete = true`；重复投递只会返回 `accepted_now = false`。
    pub async fn register(
        &self,
        session_id: &SessionId,
        chunk_index: u64,
        expected_total: u64,
        file_name: &str,
    ) -> Result<Registration, RegistryError> {
        check_shape(chunk_index, expected_total)?;
        let mut state = self.state.lock().await;
        state.check_open(session_id)?;
        let now = Instant::now();
        let entry = state
            .sessions
            .entry(session_id.clone())
            .or_insert_with(|| SessionEntry {
                expected_total,
                received: BTreeSet::new(),
                file_name: file_name.to_string(),
                last_activity: now,
                claimed: false,
            });
        if entry.expected_total != expected_total {
            return Err(RegistryError::TotalMismatch {
                expected: entry.expected_total,
                got: expected_total,
            });
        }

        entry.last_activity = now;
        let accepted_now = entry.received.insert(chunk_index);
        let received = entry.received.len() as u64;
        let is_complete = !entry.claimed && received == entry.expected_total;
        if is_complete {
            entry.claimed = true;
        }
        Ok(Registration {
            accepted_now,
            is_complete,
            received,
            expected_total: entry.expected_total,
            file_name: entry.file_name.clone(),
        })
    }

    /// 合并成功后由认领者调用：移除会话并记住该标识已完成。
    pub async fn finish(&self, session_id: &SessionId) {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        state.sessions.remove(session_id);
        state.completed.insert(session_id.clone(), now);
        state
            .completed
            .prune(now, self.completed_retention, self.completed_capacity);
    }

    /// 合并失败后释放认领，保留已收到的分片集合，以便重试投递再次触发合并。
    pub async fn release(&self, session_id: &SessionId) {
        let mut state = self.state.lock().await;
        if let Some(entry) = state.sessions.get_mut(session_id) {
            entry.claimed = false;
        }
    }

    /// 会话空闲超过 `ttl` 且未被认领时开始清理：移除登记并拒绝新分片，
    /// 直到 [`end_reap`](Self::end_reap)。返回 `false` 表示会话仍活跃或已在清理。
    pub async fn begin_reap(&self, session_id: &SessionId, ttl: Duration) -> bool {
        let mut state = self.state.lock().await;
        if state.reaping.contains(session_id) || state.completed.contains(session_id) {
            return false;
        }
        if let Some(entry) = state.sessions.get(session_id) {
            if entry.claimed || entry.last_activity.elapsed() < ttl {
                return false;
            }
            state.sessions.remove(session_id);
        }
        state.reaping.insert(session_id.clone());
        true
    }

    pub async fn end_reap(&self, session_id: &SessionId) {
        self.state.lock().await.reaping.remove(session_id);
    }

    /// 返回空闲超过 `ttl` 且未被认领的会话。
    pub async fn stale_sessions(&self, ttl: Duration) -> Vec<SessionId> {
        let state = self.state.lock().await;
        state
            .sessions
            .iter()
            .filter(|(_, entry)| !entry.claimed && entry.last_activity.elapsed() >= ttl)
            .map(|(id, _)| id.clone())
            .collect()
    }

    #[cfg(test)]
    async fn completed_len(&self) -> usize {
        let state = self.state.lock().await;
        debug_assert_eq!(state.completed.ids.len(), state.completed.order.len());
        state.completed.ids.len()
    }
}

impl Default for UploadRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn check_shape(chunk_index: u64, expected_total: u64) -> Result<(), RegistryError> {
    if expected_total == 0 {
        return Err(RegistryError::EmptyUpload);
    }
    if chunk_index >= expected_total {
        return Err(RegistryError::IndexOutOfRange {
            index: chunk_index,
            total: expected_total,
        });
    }
    Ok(())
}
