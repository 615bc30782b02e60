//! # 应用装配
//!
//! 从配置构建轮换引擎、覆盖同步与代理状态，启动后台任务和 Pingora 服务器，
//! 并在 Ctrl+C 或服务器退出时关闭。

pub mod tasks;

use std::sync::Arc;

use tokio::sync::mpsc;

use crate::config::{ModelSource, ProxyConfig, resolve_gateway_token, resolve_models};
use crate::error::{Context, Result};
use crate::logging::{LogComponent, LogStage};
use crate::proxy::{PingoraProxyServer, ProxyState};
use crate::rotation::{MemoryRotationStore, RotationEngine, RotationStore};
use crate::sync::{OverrideSync, SessionStoreFile};
use crate::{lerror, linfo, lwarn};

pub use tasks::{AppTasks, TaskType};

/// 启动前构建好的组件
pub struct AppComponents {
    pub config: Arc<ProxyConfig>,
    pub state: ProxyState,
    pub override_sync: Option<Arc<OverrideSync>>,
    changes: Option<mpsc::UnboundedReceiver<String>>,
}

impl AppComponents {
    /// 按配置构建所有组件，不启动任何任务
    pub fn build(config: ProxyConfig) -> Result<Self> {
        let config = Arc::new(config);

        let resolved = resolve_models(
            config.round_robin_models.as_deref(),
            &config.resolved_round_robin_config_path(),
        );
        linfo!(
            "system",
            LogStage::Configuration,
            LogComponent::Rotation,
            "models_resolved",
            "轮换模型列表已确定",
            source = resolved.source.as_str(),
            count = resolved.models.len(),
            models = resolved.models.join(",")
        );
        if resolved.source == ModelSource::Disabled {
            lwarn!(
                "system",
                LogStage::Configuration,
                LogComponent::Rotation,
                "rotation_disabled",
                "轮换已关闭，聊天请求原样转发"
            );
        }

        let gateway_token = resolve_gateway_token(
            config.gateway_token.as_deref(),
            &config.resolved_openclaw_config_path(),
        );

        let store: Arc<dyn RotationStore> = if config.round_robin_idle_ttl_secs > 0 {
            Arc::new(MemoryRotationStore::with_idle_ttl(config.round_robin_idle_ttl()))
        } else {
            Arc::new(MemoryRotationStore::new())
        };
        let mut engine = RotationEngine::new(resolved.models, store);

        let mut changes = None;
        let mut override_sync = None;
        if config.override_sync_enabled && engine.is_active() {
            let (tx, rx) = mpsc::unbounded_channel();
            engine = engine.with_change_notifier(tx);
            let store_file = Arc::new(SessionStoreFile::new(config.resolved_session_store_path()));
            override_sync = Some(Arc::new(OverrideSync::new(engine.clone(), store_file)));
            changes = Some(rx);
        }

        let state = ProxyState::new(Arc::clone(&config), engine, gateway_token)
            .context("Failed to build proxy state")?;

        Ok(Self {
            config,
            state,
            override_sync,
            changes,
        })
    }

    /// 启动后台任务，需要在 tokio 运行时中调用
    pub fn start_tasks(&mut self) -> AppTasks {
        let mut tasks = AppTasks::new();
        if let (Some(sync), Some(changes)) = (self.override_sync.clone(), self.changes.take()) {
            tasks.spawn_override_sync(sync, changes, self.config.override_sync_debounce());
        }
        if self.config.round_robin_idle_ttl_secs > 0 && self.state.engine().is_active() {
            tasks.spawn_rotation_janitor(
                self.state.engine().clone(),
                self.override_sync.clone(),
                self.config.round_robin_idle_ttl(),
            );
        }
        tasks
    }
}

/// 运行代理直到收到 Ctrl+C 或服务器退出
pub async fn run(config: ProxyConfig) -> Result<()> {
    let mut components = AppComponents::build(config)?;
    let tasks = components.start_tasks();

    let server = PingoraProxyServer::new(components.state.clone());
    let mut proxy_task = tokio::spawn(server.start());

    let reason = tokio::select! {
        signal = tokio::signal::ctrl_c() => match signal {
            Ok(()) => "Ctrl+C signal".to_string(),
            Err(e) => {
                lerror!(
                    "system",
                    LogStage::Shutdown,
                    LogComponent::ServerSetup,
                    "ctrl_c_error",
                    "监听 Ctrl+C 失败",
                    error = e
                );
                "Ctrl+C handler error".to_string()
            }
        },
        result = &mut proxy_task => match result {
            Ok(Ok(())) => "Proxy server exit".to_string(),
            Ok(Err(e)) => {
                lerror!(
                    "system",
                    LogStage::Shutdown,
                    LogComponent::ServerSetup,
                    "proxy_server_error",
                    "代理服务器异常退出",
                    error = e
                );
                "Proxy server error".to_string()
            }
            Err(e) => {
                lerror!(
                    "system",
                    LogStage::Shutdown,
                    LogComponent::ServerSetup,
                    "proxy_server_panic",
                    "代理服务器任务崩溃",
                    error = e
                );
                "Proxy server panic".to_string()
            }
        },
    };

    linfo!(
        "system",
        LogStage::Shutdown,
        LogComponent::ServerSetup,
        "shutdown_initiated",
        "开始关闭",
        reason = reason
    );
    tasks.shutdown();
    proxy_task.abort();
    Ok(())
}
