//! 抗冲突持久化服务 - 业务能力层
//!
//! 把"删除逻辑键下的旧行 + 插入新行 + 提交"作为一个工作单元，
//! 遇到锁冲突时回滚并按指数退避加抖动重试。
//!
//! ## 状态机
//!
//! ```text
//! Pending → Attempting → Committed
//!               ↓
//!           Retrying → Attempting ...
//!               ↓
//!             Failed
//! ```
//!
//! 每次尝试都从删除旧行开始，因此重复执行是安全的，提交成功后不会出现重复行。

use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::error::{PersistenceError, StoreError};
use crate::infrastructure::{RelationalStore, UnitOfWork};
use crate::models::{LogicalKey, PersistedRecord};
use crate::utils::retry::{retry_with_backoff_observed, RetryError, RetryEvent, RetryPolicy};

/// 单次逻辑写入的状态
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteState {
    Pending,
    Attempting { attempt: u32 },
    Retrying { attempt: u32 },
    Committed { attempts: u32 },
    Failed { attempts: u32 },
}

impl WriteState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, WriteState::Committed { .. } | WriteState::Failed { .. })
    }

    fn can_transition_to(&self, next: &WriteState) -> bool {
        use WriteState::*;
        matches!(
            (self, next),
            (Pending, Attempting { .. })
                | (Attempting { .. }, Committed { .. })
                | (Attempting { .. }, Retrying { .. })
                | (Attempting { .. }, Failed { .. })
                | (Retrying { .. }, Attempting { .. })
        )
    }
}

/// 记录状态迁移
struct WriteTracker {
    history: Vec<WriteState>,
}

impl WriteTracker {
    fn new() -> Self {
        Self {
            history: vec![WriteState::Pending],
        }
    }

    fn current(&self) -> WriteState {
        self.history.last().copied().unwrap_or(WriteState::Pending)
    }

    fn advance(&mut self, next: WriteState) {
        debug_assert!(
            self.current().can_transition_to(&next),
            "非法状态迁移: {:?} → {:?}",
            self.current(),
            next
        );
        self.history.push(next);
    }
}

/// 成功写入的报告
#[derive(Debug, Clone)]
pub struct WriteReport {
    pub key: LogicalKey,
    pub attempts: u32,
    /// 最后一次尝试删除的旧行数
    pub rows_deleted: usize,
    pub rows_written: usize,
    pub history: Vec<WriteState>,
}

/// 抗冲突持久化服务
///
/// 职责：
/// - 持有从交接到提交（或最终失败）之间的记录
/// - 同一逻辑键的每次尝试都是"先删后插"
/// - 重试耗尽后返回 `PersistenceError::Contention`，不吞掉失败
#[derive(Clone)]
pub struct ResilientStore {
    store: Arc<dyn RelationalStore>,
    policy: RetryPolicy,
}

impl ResilientStore {
    pub fn new(store: Arc<dyn RelationalStore>, policy: RetryPolicy) -> Self {
        Self { store, policy }
    }

    /// 以 `logical_key` 为单位整体替换记录
    pub async fn persist(
        &self,
        records: Vec<PersistedRecord>,
        logical_key: &LogicalKey,
    ) -> Result<WriteReport, PersistenceError> {
        self.write_with_retry(logical_key, records).await
    }

    /// 执行一次逻辑写入，锁冲突时退避重试
    pub async fn write_with_retry(
        &self,
        key: &LogicalKey,
        records: Vec<PersistedRecord>,
    ) -> Result<WriteReport, PersistenceError> {
        if let Some(bad) = records.iter().find(|r| r.kind() != key.kind) {
            return Err(PersistenceError::Store {
                key: key.clone(),
                source: StoreError::Other(format!(
                    "记录 {} 的类型 {} 与逻辑键不一致",
                    bad.row_id(),
                    bad.kind().as_str()
                )),
            });
        }

        let label = format!("写入 {}", key);
        let mut tracker = WriteTracker::new();
        let records_ref = &records;

        let result = retry_with_backoff_observed(
            &self.policy,
            &label,
            StoreError::is_transient,
            move |_| self.attempt_once(key, records_ref),
            |event| match event {
                RetryEvent::Attempting { attempt } => {
                    tracker.advance(WriteState::Attempting { attempt })
                }
                RetryEvent::Retrying { attempt, .. } => {
                    tracker.advance(WriteState::Retrying { attempt })
                }
            },
        )
        .await;

        match result {
            Ok(((rows_deleted, rows_written), attempts)) => {
                tracker.advance(WriteState::Committed { attempts });
                info!(
                    "[{}] ✓ 已提交 {} 行 (替换 {} 行, 尝试 {} 次)",
                    label, rows_written, rows_deleted, attempts
                );
                Ok(WriteReport {
                    key: key.clone(),
                    attempts,
                    rows_deleted,
                    rows_written,
                    history: tracker.history,
                })
            }
            Err(RetryError::Exhausted { attempts, last }) => {
                tracker.advance(WriteState::Failed { attempts });
                Err(PersistenceError::Contention {
                    key: key.clone(),
                    attempts,
                    history: tracker.history,
                    last,
                })
            }
            Err(RetryError::Permanent { attempt, error }) => {
                tracker.advance(WriteState::Failed { attempts: attempt });
                Err(PersistenceError::Store {
                    key: key.clone(),
                    source: error,
                })
            }
        }
    }

    /// 一次完整的尝试：开启工作单元 → 删除 → 插入 → 提交；任一步（含提交）出错都回滚
    async fn attempt_once(
        &self,
        key: &LogicalKey,
        records: &[PersistedRecord],
    ) -> Result<(usize, usize), StoreError> {
        let mut uow = self.store.begin_unit_of_work().await?;

        let result = match apply_replace(uow.as_mut(), key, records).await {
            Ok(deleted) => uow.commit().await.map(|_| (deleted, records.len())),
            Err(e) => Err(e),
        };

        if let Err(e) = &result {
            debug!("[写入 {}] 尝试失败, 回滚: {}", key, e);
            if let Err(rollback_err) = uow.rollback().await {
                warn!("[写入 {}] 回滚失败: {}", key, rollback_err);
            }
        }
        result
    }
}

async fn apply_replace(
    uow: &mut dyn UnitOfWork,
    key: &LogicalKey,
    records: &[PersistedRecord],
) -> Result<usize, StoreError> {
    let deleted = uow.delete(key).await?;
    for record in records {
        uow.insert(key, record.clone()).await?;
    }
    debug!("[写入 {}] 删除 {} 行, 插入 {} 行", key, deleted, records.len());
    Ok(deleted)
}
