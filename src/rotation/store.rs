//! # 轮换状态存储
//!
//! 每个会话键一份轮换状态。存储以 trait 形式注入各组件，便于测试隔离。

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// 单个会话的轮换状态
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationState {
    /// 是否启用轮换
    pub round_robin_enabled: bool,
    /// 当前模型下标，始终小于模型数量
    pub index: usize,
    /// 当前模型已使用的轮次
    pub turns_used: u32,
    /// 本进程最后一次写入会话存储文件的模型覆盖值
    pub last_applied_model: Option<String>,
}

impl Default for RotationState {
    fn default() -> Self {
        Self {
            round_robin_enabled: true,
            index: 0,
            turns_used: 0,
            last_applied_model: None,
        }
    }
}

/// 轮换状态存储抽象
pub trait RotationStore: Send + Sync {
    /// 读取状态
    fn get(&self, key: &str) -> Option<RotationState>;

    /// 写入状态（覆盖）
    fn set(&self, key: &str, state: RotationState);

    /// 原子地读改写状态，不存在时从默认状态开始；返回修改后的状态
    fn update(&self, key: &str, f: &mut dyn FnMut(&mut RotationState)) -> RotationState {
        let mut state = self.get(key).unwrap_or_default();
        f(&mut state);
        self.set(key, state.clone());
        state
    }

    /// 删除状态
    fn delete(&self, key: &str) -> Option<RotationState>;

    /// 所有已知会话键
    fn keys(&self) -> Vec<String>;

    /// 淘汰空闲条目，返回淘汰数量
    fn evict_idle(&self) -> usize {
        0
    }
}

#[derive(Debug, Clone)]
struct StoredState {
    state: RotationState,
    last_touched: Instant,
}

impl StoredState {
    fn is_idle(&self, ttl: Option<Duration>) -> bool {
        ttl.is_some_and(|ttl| self.last_touched.elapsed() > ttl)
    }
}

/// 内存实现，支持按空闲时间淘汰
#[derive(Debug)]
pub struct MemoryRotationStore {
    entries: DashMap<String, StoredState>,
    idle_ttl: Option<Duration>,
}

impl MemoryRotationStore {
    /// 不淘汰的存储
    #[must_use]
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            idle_ttl: None,
        }
    }

    /// 空闲超过 `idle_ttl` 的条目会被淘汰
    #[must_use]
    pub fn with_idle_ttl(idle_ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            idle_ttl: Some(idle_ttl),
        }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryRotationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RotationStore for MemoryRotationStore {
    fn get(&self, key: &str) -> Option<RotationState> {
        let mut entry = self.entries.get_mut(key)?;
        if entry.is_idle(self.idle_ttl) {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        entry.last_touched = Instant::now();
        Some(entry.state.clone())
    }

    fn set(&self, key: &str, state: RotationState) {
        self.entries.insert(
            key.to_string(),
            StoredState {
                state,
                last_touched: Instant::now(),
            },
        );
    }

    fn update(&self, key: &str, f: &mut dyn FnMut(&mut RotationState)) -> RotationState {
        let ttl = self.idle_ttl;
        let mut entry = self
            .entries
            .entry(key.to_string())
            .or_insert_with(|| StoredState {
                state: RotationState::default(),
                last_touched: Instant::now(),
            });
        if entry.is_idle(ttl) {
            entry.state = RotationState::default();
        }
        f(&mut entry.state);
        entry.last_touched = Instant::now();
        entry.state.clone()
    }

    fn delete(&self, key: &str) -> Option<RotationState> {
        self.entries.remove(key).map(|(_, stored)| stored.state)
    }

    fn keys(&self) -> Vec<String> {
        self.entries.iter().map(|e| e.key().clone()).collect()
    }

    fn evict_idle(&self) -> usize {
        let before = self.entries.len();
        let ttl = self.idle_ttl;
        self.entries.retain(|_, stored| !stored.is_idle(ttl));
        before.saturating_sub(self.entries.len())
    }
}
