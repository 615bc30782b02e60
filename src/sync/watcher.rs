//! # 会话存储监控
//!
//! 文件事件只置脏标志，防抖计时器到期后才做一次重新扫描。
//! 轮换状态变更通过通道送达，逐个会话立即同步。

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;

use super::override_sync::OverrideSync;
use crate::error::{ProxyError, Result};
use crate::logging::{LogComponent, LogStage};
use crate::{ldebug, lerror, linfo, lwarn};

/// 监控会话存储所在目录，目标文件的变更以 `()` 通知
///
/// 存储文件通过重命名替换，因此监控父目录而不是文件本身。
pub fn watch_store_file(path: &Path) -> Result<(RecommendedWatcher, mpsc::UnboundedReceiver<()>)> {
    let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map_or_else(|| PathBuf::from("."), Path::to_path_buf);
    std::fs::create_dir_all(&dir)?;

    let (tx, rx) = mpsc::unbounded_channel();
    let file_name = path.file_name().map(std::ffi::OsStr::to_os_string);

    let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
        Ok(event) => {
            let relevant = matches!(
                event.kind,
                EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_)
            ) && event
                .paths
                .iter()
                .any(|p| p.file_name().map(std::ffi::OsStr::to_os_string) == file_name);
            if relevant {
                let _ = tx.send(());
            }
        }
        Err(e) => {
            lerror!(
                "-",
                LogStage::BackgroundTask,
                LogComponent::OverrideSync,
                "watch_error",
                "文件监控错误",
                error = e
            );
        }
    })
    .map_err(|e| ProxyError::config_with_source("创建文件监控器失败", e))?;

    watcher
        .watch(&dir, RecursiveMode::NonRecursive)
        .map_err(|e| ProxyError::config_with_source("启动文件监控失败", e))?;

    Ok((watcher, rx))
}

/// 覆盖同步后台任务
pub struct OverrideSyncWorker {
    sync: Arc<OverrideSync>,
    changes: mpsc::UnboundedReceiver<String>,
    debounce: Duration,
}

impl OverrideSyncWorker {
    #[must_use]
    pub fn new(
        sync: Arc<OverrideSync>,
        changes: mpsc::UnboundedReceiver<String>,
        debounce: Duration,
    ) -> Self {
        Self {
            sync,
            changes,
            debounce,
        }
    }

    /// 运行直到轮换引擎的通知通道关闭
    pub async fn run(mut self) {
        let path = self.sync.store().path().to_path_buf();
        let (_watcher, mut fs_events) = match watch_store_file(&path) {
            Ok((watcher, rx)) => (Some(watcher), rx),
            Err(e) => {
                lwarn!(
                    "-",
                    LogStage::Startup,
                    LogComponent::OverrideSync,
                    "watch_failed",
                    "无法监控会话存储，仅在轮换变更时同步",
                    path = path.display(),
                    error = e
                );
                let (_tx, rx) = mpsc::unbounded_channel();
                (None, rx)
            }
        };

        linfo!(
            "-",
            LogStage::Startup,
            LogComponent::OverrideSync,
            "started",
            "覆盖同步任务已启动",
            path = path.display(),
            debounce_ms = self.debounce.as_millis()
        );

        let timer = tokio::time::sleep(self.debounce);
        tokio::pin!(timer);
        let mut armed = false;
        let mut dirty = false;

        loop {
            tokio::select! {
                key = self.changes.recv() => {
                    let Some(key) = key else { break };
                    self.apply(&key);
                }
                Some(()) = fs_events.recv() => {
                    dirty = true;
                    armed = true;
                    timer.as_mut().reset(Instant::now() + self.debounce);
                }
                () = &mut timer, if armed => {
                    armed = false;
                    if std::mem::take(&mut dirty) {
                        self.rescan();
                    }
                }
            }
        }

        linfo!(
            "-",
            LogStage::Shutdown,
            LogComponent::OverrideSync,
            "stopped",
            "覆盖同步任务已停止"
        );
    }

    fn apply(&self, key: &str) {
        if let Err(e) = self.sync.apply_override(key) {
            lwarn!(
                key,
                LogStage::BackgroundTask,
                LogComponent::OverrideSync,
                "apply_failed",
                "同步模型覆盖失败，跳过",
                error = e
            );
        }
    }

    fn rescan(&self) {
        match self.sync.rescan() {
            Ok(count) => ldebug!(
                "-",
                LogStage::BackgroundTask,
                LogComponent::OverrideSync,
                "rescan_done",
                "会话存储重新扫描完成",
                reapplied = count
            ),
            Err(e) => lwarn!(
                "-",
                LogStage::BackgroundTask,
                LogComponent::OverrideSync,
                "rescan_failed",
                "会话存储无法读取，跳过本次扫描",
                error = e
            ),
        }
    }
}
