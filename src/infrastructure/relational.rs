//! 关系存储接口 - 基础设施层
//!
//! 只描述核心需要的操作：开启工作单元、按逻辑键删除、插入、提交、回滚。
//! 具体的 SQL 驱动不在本 crate 内实现。

use async_trait::async_trait;

use crate::error::StoreError;
use crate::models::{LogicalKey, PersistedRecord};

/// 关系存储
#[async_trait]
pub trait RelationalStore: Send + Sync {
    /// 开启一个工作单元（事务）
    async fn begin_unit_of_work(&self) -> Result<Box<dyn UnitOfWork>, StoreError>;
}

/// 一个工作单元内的操作，提交前对其他写者不可见
#[async_trait]
pub trait UnitOfWork: Send {
    /// 删除逻辑键下的所有行，返回删除行数
    async fn delete(&mut self, criteria: &LogicalKey) -> Result<usize, StoreError>;

    /// 在逻辑键下插入一行
    async fn insert(&mut self, key: &LogicalKey, record: PersistedRecord) -> Result<(), StoreError>;

    /// 提交；锁冲突时返回 `StoreError::Contention`，事务保持打开，需要调用方回滚
    async fn commit(&mut self) -> Result<(), StoreError>;

    /// 回滚，丢弃本单元内的所有修改
    async fn rollback(&mut self) -> Result<(), StoreError>;
}
