//! # Pingora 代理服务器
//!
//! 单端口监听，所有流量转发到同一个网关

use crate::error::{ProxyError, Result};
use crate::linfo;
use crate::logging::{LogComponent, LogStage};
use crate::proxy::service::ProxyService;
use crate::proxy::state::ProxyState;
use pingora_core::server::{Server, configuration::Opt};
use pingora_proxy::http_proxy_service;

/// Pingora 代理服务器
pub struct PingoraProxyServer {
    state: ProxyState,
}

impl PingoraProxyServer {
    /// 创建新的代理服务器
    #[must_use]
    pub const fn new(state: ProxyState) -> Self {
        Self { state }
    }

    /// 创建Pingora服务器选项（基本配置）
    fn create_pingora_options() -> Opt {
        Opt {
            daemon: false,   // 在前台运行
            upgrade: false,  // 不支持在线升级
            nocapture: true, // 不捕获标准输出/错误
            ..Opt::default()
        }
    }

    /// 代理服务器监听地址
    #[must_use]
    pub fn get_server_address(&self) -> String {
        self.state.config().listen_address()
    }

    /// 启动服务器，阻塞直到 Pingora 退出
    pub async fn start(self) -> Result<()> {
        let mut server = Server::new(Some(Self::create_pingora_options())).map_err(|err| {
            ProxyError::server_init(format!("Failed to create Pingora server: {err}"))
        })?;

        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::ServerSetup,
            "bootstrapping_server",
            "启动Pingora服务器引导"
        );
        server.bootstrap();

        let server_address = self.get_server_address();
        let gateway = self.state.gateway().url_for("/");
        let mut http_service =
            http_proxy_service(&server.configuration, ProxyService::new(self.state));
        http_service.add_tcp(&server_address);
        server.add_service(http_service);

        linfo!(
            "system",
            LogStage::Startup,
            LogComponent::ServerSetup,
            "starting_server",
            "启动Pingora代理服务器",
            address = server_address,
            gateway = gateway
        );

        let handle = tokio::task::spawn_blocking(move || {
            server.run_forever();
        });

        handle.await.map_err(|err| {
            ProxyError::server_start_with_source("Pingora server task failed", err)
        })
    }
}
