//! 内存关系存储
//!
//! `RelationalStore` 的进程内实现：工作单元先缓冲操作，提交时在一把锁下整体应用。
//! 可以注入若干次提交冲突，用于演练重试路径。

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::StoreError;
use crate::infrastructure::relational::{RelationalStore, UnitOfWork};
use crate::models::{LogicalKey, PersistedRecord};

#[derive(Default)]
struct Inner {
    tables: Mutex<HashMap<LogicalKey, Vec<PersistedRecord>>>,
    /// 接下来需要以冲突失败的提交次数
    pending_conflicts: AtomicU32,
    commit_attempts: AtomicU64,
    commits: AtomicU64,
    rollbacks: AtomicU64,
}

/// 内存关系存储
#[derive(Clone, Default)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// 让接下来的 `count` 次提交返回锁冲突
    pub fn inject_contention(&self, count: u32) {
        self.inner.pending_conflicts.store(count, Ordering::SeqCst);
    }

    /// 读取某逻辑键下已提交的行
    pub async fn rows(&self, key: &LogicalKey) -> Vec<PersistedRecord> {
        self.inner
            .tables
            .lock()
            .await
            .get(key)
            .cloned()
            .unwrap_or_default()
    }

    /// 已提交的总行数
    pub async fn row_count(&self) -> usize {
        self.inner.tables.lock().await.values().map(Vec::len).sum()
    }

    /// 提交尝试次数（含失败）
    pub fn commit_attempts(&self) -> u64 {
        self.inner.commit_attempts.load(Ordering::SeqCst)
    }

    /// 成功提交次数
    pub fn commits(&self) -> u64 {
        self.inner.commits.load(Ordering::SeqCst)
    }

    /// 回滚次数
    pub fn rollbacks(&self) -> u64 {
        self.inner.rollbacks.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl RelationalStore for MemoryStore {
    async fn begin_unit_of_work(&self) -> Result<Box<dyn UnitOfWork>, StoreError> {
        Ok(Box::new(MemoryUnitOfWork {
            inner: self.inner.clone(),
            ops: Vec::new(),
        }))
    }
}

enum Op {
    Delete(LogicalKey),
    Insert(LogicalKey, PersistedRecord),
}

struct MemoryUnitOfWork {
    inner: Arc<Inner>,
    ops: Vec<Op>,
}

#[async_trait]
impl UnitOfWork for MemoryUnitOfWork {
    async fn delete(&mut self, criteria: &LogicalKey) -> Result<usize, StoreError> {
        let existing = self
            .inner
            .tables
            .lock()
            .await
            .get(criteria)
            .map(Vec::len)
            .unwrap_or(0);
        self.ops.push(Op::Delete(criteria.clone()));
        Ok(existing)
    }

    async fn insert(&mut self, key: &LogicalKey, record: PersistedRecord) -> Result<(), StoreError> {
        self.ops.push(Op::Insert(key.clone(), record));
        Ok(())
    }

    async fn commit(&mut self) -> Result<(), StoreError> {
        let inner = &self.inner;
        inner.commit_attempts.fetch_add(1, Ordering::SeqCst);

        let conflicted = inner
            .pending_conflicts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if conflicted {
            return Err(StoreError::Contention("database is locked".to_string()));
        }

        let mut tables = inner.tables.lock().await;
        for op in self.ops.drain(..) {
            match op {
                Op::Delete(key) => {
                    tables.remove(&key);
                }
                Op::Insert(key, record) => tables.entry(key).or_default().push(record),
            }
        }
        drop(tables);
        inner.commits.fetch_add(1, Ordering::SeqCst);
        debug!("内存存储提交成功");
        Ok(())
    }

    async fn rollback(&mut self) -> Result<(), StoreError> {
        debug!("内存存储回滚，丢弃 {} 个操作", self.ops.len());
        self.ops.clear();
        self.inner.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
