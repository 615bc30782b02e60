//! # 后台任务
//!
//! 覆盖同步与轮换状态的空闲淘汰，随服务启动、随关闭中止。

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::logging::{LogComponent, LogStage};
use crate::rotation::RotationEngine;
use crate::sync::{OverrideSync, OverrideSyncWorker};
use crate::{ldebug, linfo};

/// 空闲淘汰的最短扫描间隔
const MIN_JANITOR_INTERVAL: Duration = Duration::from_secs(1);

/// 后台任务类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskType {
    /// 会话存储覆盖同步
    OverrideSync,
    /// 轮换状态空闲淘汰
    RotationJanitor,
}

impl TaskType {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::OverrideSync => "override_sync",
            Self::RotationJanitor => "rotation_janitor",
        }
    }
}

/// 已启动的后台任务集合
#[derive(Default)]
pub struct AppTasks {
    handles: Vec<(TaskType, JoinHandle<()>)>,
}

impl AppTasks {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// 启动覆盖同步任务
    pub fn spawn_override_sync(
        &mut self,
        sync: Arc<OverrideSync>,
        changes: mpsc::UnboundedReceiver<String>,
        debounce: Duration,
    ) {
        let worker = OverrideSyncWorker::new(sync, changes, debounce);
        self.push(TaskType::OverrideSync, tokio::spawn(worker.run()));
    }

    /// 启动空闲淘汰任务，扫描间隔为 TTL 的一半
    ///
    /// 同步器存在时一并清理已淘汰会话的最后所见记录。
    pub fn spawn_rotation_janitor(
        &mut self,
        engine: RotationEngine,
        sync: Option<Arc<OverrideSync>>,
        idle_ttl: Duration,
    ) {
        let period = (idle_ttl / 2).max(MIN_JANITOR_INTERVAL);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // 第一次 tick 立即返回
            interval.tick().await;
            loop {
                interval.tick().await;
                let evicted = engine.evict_idle();
                let pruned = sync.as_ref().map_or(0, |s| s.prune_forgotten());
                if evicted > 0 || pruned > 0 {
                    ldebug!(
                        "-",
                        LogStage::BackgroundTask,
                        LogComponent::Rotation,
                        "evict_idle",
                        "淘汰空闲会话的轮换状态",
                        evicted = evicted,
                        pruned = pruned
                    );
                }
            }
        });
        self.push(TaskType::RotationJanitor, handle);
    }

    fn push(&mut self, task_type: TaskType, handle: JoinHandle<()>) {
        linfo!(
            "system",
            LogStage::BackgroundTask,
            LogComponent::ServerSetup,
            "task_start",
            "后台任务已启动",
            task = task_type.as_str()
        );
        self.handles.push((task_type, handle));
    }

    /// 已启动的任务
    pub fn running(&self) -> impl Iterator<Item = TaskType> + '_ {
        self.handles.iter().map(|(task_type, _)| *task_type)
    }

    /// 逆序中止所有任务
    pub fn shutdown(self) {
        for (task_type, handle) in self.handles.into_iter().rev() {
            handle.abort();
            linfo!(
                "system",
                LogStage::Shutdown,
                LogComponent::ServerSetup,
                "task_stop",
                "后台任务已停止",
                task = task_type.as_str()
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rotation::MemoryRotationStore;
    use crate::sync::SessionStoreFile;

    #[tokio::test]
    async fn test_janitor_registers_and_shuts_down() {
        let store = Arc::new(MemoryRotationStore::with_idle_ttl(Duration::from_secs(60)));
        let engine = RotationEngine::new(vec!["a/m1".into()], store);

        let mut tasks = AppTasks::new();
        tasks.spawn_rotation_janitor(engine, None, Duration::from_secs(60));
        assert_eq!(tasks.running().collect::<Vec<_>>(), vec![TaskType::RotationJanitor]);
        tasks.shutdown();
    }

    #[tokio::test]
    async fn test_janitor_prunes_sync_bookkeeping() {
        let dir = tempfile::tempdir().unwrap();
        let ttl = Duration::from_millis(200);
        let store = Arc::new(MemoryRotationStore::with_idle_ttl(ttl));
        let engine = RotationEngine::new(vec!["a/m1".into()], store);
        let sync = Arc::new(OverrideSync::new(
            engine.clone(),
            Arc::new(SessionStoreFile::new(dir.path().join("sessions.json"))),
        ));
        engine.ensure_session("s1");
        sync.apply_override("s1").unwrap();
        assert_eq!(sync.tracked_sessions(), 1);

        let mut tasks = AppTasks::new();
        tasks.spawn_rotation_janitor(engine, Some(sync.clone()), ttl);
        for _ in 0..50 {
            tokio::time::sleep(Duration::from_millis(100)).await;
            if sync.tracked_sessions() == 0 {
                break;
            }
        }
        assert_eq!(sync.tracked_sessions(), 0);
        tasks.shutdown();
    }
}
