use std::sync::Arc;

use crate::config::ProxyConfig;
use crate::error::Result;
use crate::gate::{ReqwestChatBackend, ToolGate, ToolGateConfig};
use crate::observe::DecisionLog;
use crate::proxy::upstream::GatewayTarget;
use crate::rotation::RotationEngine;
use crate::session::SessionResolver;

/// 代理服务的共享状态
///
/// 持有所有代理请求处理所需的依赖项，启动时构建一次。
#[derive(Debug, Clone)]
pub struct ProxyState {
    config: Arc<ProxyConfig>,
    gateway: GatewayTarget,
    gateway_token: Option<String>,
    resolver: SessionResolver,
    engine: RotationEngine,
    gate: ToolGate,
    decision_log: DecisionLog,
    http_client: reqwest::Client,
}

impl ProxyState {
    pub fn new(
        config: Arc<ProxyConfig>,
        engine: RotationEngine,
        gateway_token: Option<String>,
    ) -> Result<Self> {
        let gateway = GatewayTarget::parse(&config.gateway_url)?;
        let http_client = ReqwestChatBackend::build_client(config.upstream_timeout())?;
        let gate = ToolGate::new(ToolGateConfig {
            enabled: config.tool_gate_enabled,
            max_retries: config.tool_gate_max_retries,
            escalate_model: config
                .tool_gate_escalate_model
                .clone()
                .filter(|m| !m.trim().is_empty()),
        });
        let decision_log = DecisionLog::new(
            config.resolved_router_log_dir(),
            config.router_log_enabled,
        );
        let resolver = SessionResolver::new(&config.session_prefix, &config.session_cookie);

        Ok(Self {
            config,
            gateway,
            gateway_token,
            resolver,
            engine,
            gate,
            decision_log,
            http_client,
        })
    }

    #[must_use]
    pub fn config(&self) -> &ProxyConfig {
        &self.config
    }

    #[must_use]
    pub const fn gateway(&self) -> &GatewayTarget {
        &self.gateway
    }

    #[must_use]
    pub fn gateway_token(&self) -> Option<&str> {
        self.gateway_token.as_deref()
    }

    #[must_use]
    pub const fn resolver(&self) -> &SessionResolver {
        &self.resolver
    }

    #[must_use]
    pub const fn engine(&self) -> &RotationEngine {
        &self.engine
    }

    #[must_use]
    pub const fn gate(&self) -> &ToolGate {
        &self.gate
    }

    #[must_use]
    pub const fn decision_log(&self) -> &DecisionLog {
        &self.decision_log
    }

    /// 指向网关某个路径的聊天后端
    #[must_use]
    pub fn chat_backend(&self, path_and_query: &str) -> ReqwestChatBackend {
        ReqwestChatBackend::new(self.http_client.clone(), self.gateway.url_for(path_and_query))
    }
}
