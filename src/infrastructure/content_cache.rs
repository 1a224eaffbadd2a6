//! 内容寻址缓存 - 基础设施层
//!
//! 以原始字节的哈希为键缓存识别结果。识别结果对同样的字节是确定的，
//! 因此有效期默认较长（7 天）。
//!
//! ## 淘汰策略
//! - 过期条目在 `get` 时惰性删除，写入触发容量淘汰前也会先清理一遍
//! - 达到容量时按访问顺序淘汰最旧的条目，降到 `capacity - headroom`，
//!   `headroom` 为容量的 20%（至少 1 条）
//!
//! ## 失败语义
//! 缓存只影响性能，不影响正确性：锁损坏、快照读写失败等错误只记日志，
//! 对调用方一律表现为未命中。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::error::CacheError;
use crate::infrastructure::content_hash::ContentHash;

/// 容量淘汰时预留的比例
const EVICTION_FRACTION: f64 = 0.2;
const SNAPSHOT_VERSION: u32 = 1;

/// 缓存配置
#[derive(Debug, Clone)]
pub struct CacheConfig {
    pub capacity: usize,
    pub ttl: Duration,
    pub snapshot_path: Option<PathBuf>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 1000,
            ttl: Duration::from_secs(7 * 24 * 60 * 60),
            snapshot_path: None,
        }
    }
}

impl CacheConfig {
    pub fn from_config(config: &Config) -> Self {
        Self {
            capacity: config.cache_capacity.max(1),
            ttl: config.cache_ttl(),
            snapshot_path: config.cache_snapshot_path.as_ref().map(PathBuf::from),
        }
    }
}

/// 缓存条目
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: ContentHash,
    pub value: String,
    pub created_at: DateTime<Utc>,
    /// 逻辑访问时钟，越大越新
    #[serde(default)]
    pub last_access: u64,
}

/// 缓存统计
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub expirations: u64,
    pub entries: usize,
}

#[derive(Serialize, Deserialize)]
struct Snapshot {
    version: u32,
    entries: Vec<CacheEntry>,
}

#[derive(Default)]
struct CacheState {
    entries: HashMap<ContentHash, CacheEntry>,
    clock: u64,
    stats: CacheStats,
}

impl CacheState {
    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn purge_expired(&mut self, ttl: Duration, now: DateTime<Utc>) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, entry| !is_expired(entry, ttl, now));
        let removed = before - self.entries.len();
        self.stats.expirations += removed as u64;
        removed
    }

    /// 按访问顺序删除最旧的条目，直到数量不超过 `target`
    fn evict_to(&mut self, target: usize) -> usize {
        let len = self.entries.len();
        if len <= target {
            return 0;
        }
        let excess = len - target;

        let mut by_age: Vec<(u64, ContentHash)> = self
            .entries
            .values()
            .map(|e| (e.last_access, e.key))
            .collect();
        by_age.sort_unstable();

        for (_, key) in by_age.into_iter().take(excess) {
            self.entries.remove(&key);
        }
        self.stats.evictions += excess as u64;
        excess
    }
}

fn is_expired(entry: &CacheEntry, ttl: Duration, now: DateTime<Utc>) -> bool {
    // 时间倒退（created_at 在未来）时视为未过期
    now.signed_duration_since(entry.created_at)
        .to_std()
        .map(|age| age > ttl)
        .unwrap_or(false)
}

/// 内容寻址缓存
///
/// 职责：
/// - 持有所有缓存条目，是淘汰状态的唯一写者
/// - 支持多个识别任务并发 get / put，同一键并发写入时后写者生效
/// - 不做任何网络调用
pub struct ContentCache {
    config: CacheConfig,
    state: Mutex<CacheState>,
}

impl ContentCache {
    /// 创建空缓存；容量至少为 1
    pub fn new(mut config: CacheConfig) -> Self {
        config.capacity = config.capacity.max(1);
        Self {
            config,
            state: Mutex::new(CacheState::default()),
        }
    }

    /// 创建缓存，若配置了快照文件则先加载
    ///
    /// 快照不存在或损坏时从空缓存开始
    pub fn open(config: CacheConfig) -> Self {
        let cache = Self::new(config);
        if let Some(path) = cache.config.snapshot_path.clone() {
            if path.exists() {
                match cache.load_snapshot(&path) {
                    Ok(loaded) => info!("✓ 已从 {} 恢复 {} 条缓存", path.display(), loaded),
                    Err(e) => warn!("⚠️ 缓存快照不可用，使用空缓存: {}", e),
                }
            }
        }
        cache
    }

    /// 查询缓存；过期条目视为未命中并被删除
    pub fn get(&self, hash: &ContentHash) -> Option<String> {
        match self.try_get(hash) {
            Ok(value) => value,
            Err(e) => {
                warn!("缓存读取失败，按未命中处理: {}", e);
                None
            }
        }
    }

    /// 写入缓存（以当前时间为创建时间）
    pub fn put(&self, hash: ContentHash, value: impl Into<String>) {
        self.put_with_timestamp(hash, value, Utc::now());
    }

    /// 以指定创建时间写入缓存
    pub fn put_with_timestamp(
        &self,
        hash: ContentHash,
        value: impl Into<String>,
        created_at: DateTime<Utc>,
    ) {
        if let Err(e) = self.try_put(hash, value.into(), created_at) {
            warn!("缓存写入失败，已忽略: {}", e);
        }
    }

    /// 容量超限时淘汰最旧的条目，返回淘汰数量
    pub fn evict(&self) -> usize {
        let target = self.eviction_target();
        match self.lock() {
            Ok(mut state) => {
                if state.entries.len() > self.config.capacity {
                    state.evict_to(target)
                } else {
                    0
                }
            }
            Err(e) => {
                warn!("缓存淘汰失败: {}", e);
                0
            }
        }
    }

    /// 物理删除所有过期条目，返回删除数量
    pub fn cleanup_expired(&self) -> usize {
        match self.lock() {
            Ok(mut state) => state.purge_expired(self.config.ttl, Utc::now()),
            Err(e) => {
                warn!("缓存清理失败: {}", e);
                0
            }
        }
    }

    /// 是否存在未过期的条目（不刷新访问顺序）
    pub fn contains(&self, hash: &ContentHash) -> bool {
        self.lock()
            .map(|state| {
                state
                    .entries
                    .get(hash)
                    .is_some_and(|e| !is_expired(e, self.config.ttl, Utc::now()))
            })
            .unwrap_or(false)
    }

    /// 当前物理条目数（可能包含尚未清理的过期条目）
    pub fn len(&self) -> usize {
        self.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.lock()
            .map(|s| CacheStats {
                entries: s.entries.len(),
                ..s.stats
            })
            .unwrap_or_default()
    }

    /// 将缓存写入快照文件；未配置快照或写入失败时返回 false
    pub fn flush(&self) -> bool {
        let Some(path) = self.config.snapshot_path.clone() else {
            return false;
        };
        match self.write_snapshot(&path) {
            Ok(count) => {
                debug!("缓存快照已写入 {} ({} 条)", path.display(), count);
                true
            }
            Err(e) => {
                warn!("⚠️ 缓存快照写入失败: {}", e);
                false
            }
        }
    }

    // ========== 内部实现 ==========

    fn lock(&self) -> Result<MutexGuard<'_, CacheState>, CacheError> {
        self.state.lock().map_err(|_| CacheError::Poisoned)
    }

    fn eviction_target(&self) -> usize {
        let headroom = ((self.config.capacity as f64 * EVICTION_FRACTION).ceil() as usize).max(1);
        self.config.capacity.saturating_sub(headroom)
    }

    fn try_get(&self, hash: &ContentHash) -> Result<Option<String>, CacheError> {
        let mut state = self.lock()?;
        let now = Utc::now();

        let expired = match state.entries.get(hash) {
            None => {
                state.stats.misses += 1;
                debug!("缓存未命中: {}", hash.short());
                return Ok(None);
            }
            Some(entry) => is_expired(entry, self.config.ttl, now),
        };

        if expired {
            state.entries.remove(hash);
            state.stats.expirations += 1;
            state.stats.misses += 1;
            debug!("缓存条目已过期: {}", hash.short());
            return Ok(None);
        }

        let stamp = state.tick();
        state.stats.hits += 1;
        debug!("缓存命中: {}", hash.short());
        Ok(state.entries.get_mut(hash).map(|entry| {
            entry.last_access = stamp;
            entry.value.clone()
        }))
    }

    fn try_put(
        &self,
        hash: ContentHash,
        value: String,
        created_at: DateTime<Utc>,
    ) -> Result<(), CacheError> {
        let target = self.eviction_target();
        let mut state = self.lock()?;

        if !state.entries.contains_key(&hash) && state.entries.len() >= self.config.capacity {
            state.purge_expired(self.config.ttl, Utc::now());
            if state.entries.len() >= self.config.capacity {
                let evicted = state.evict_to(target);
                debug!("缓存已满，淘汰 {} 条最旧条目", evicted);
            }
        }

        let stamp = state.tick();
        state.entries.insert(
            hash,
            CacheEntry {
                key: hash,
                value,
                created_at,
                last_access: stamp,
            },
        );
        Ok(())
    }

    fn load_snapshot(&self, path: &Path) -> Result<usize, CacheError> {
        let display = path.display().to_string();
        let raw = std::fs::read_to_string(path).map_err(|source| CacheError::Io {
            path: display.clone(),
            source,
        })?;
        let snapshot: Snapshot = serde_json::from_str(&raw).map_err(|source| CacheError::Corrupt {
            path: display.clone(),
            source,
        })?;
        if snapshot.version != SNAPSHOT_VERSION {
            warn!("缓存快照版本 {} 不受支持，已忽略", snapshot.version);
            return Ok(0);
        }

        let now = Utc::now();
        let mut state = self.lock()?;
        for entry in snapshot.entries {
            if is_expired(&entry, self.config.ttl, now) {
                continue;
            }
            state.clock = state.clock.max(entry.last_access);
            state.entries.insert(entry.key, entry);
        }
        if state.entries.len() > self.config.capacity {
            state.evict_to(self.config.capacity);
        }
        Ok(state.entries.len())
    }

    fn write_snapshot(&self, path: &Path) -> Result<usize, CacheError> {
        let display = path.display().to_string();
        let entries: Vec<CacheEntry> = {
            let state = self.lock()?;
            state.entries.values().cloned().collect()
        };
        let count = entries.len();
        let json = serde_json::to_string(&Snapshot {
            version: SNAPSHOT_VERSION,
            entries,
        })
        .map_err(|source| CacheError::Corrupt {
            path: display.clone(),
            source,
        })?;

        // 先写临时文件再改名，避免留下写了一半的快照
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, json)
            .and_then(|_| std::fs::rename(&tmp, path))
            .map_err(|source| CacheError::Io {
                path: display,
                source,
            })?;
        Ok(count)
    }
}
