//! # 应用配置结构定义
//!
//! 所有进程配置均来自环境变量（同时可用命令行参数覆盖）

use clap::{ArgAction, Parser};
use std::env;
use std::path::PathBuf;
use std::time::Duration;

/// 默认会话键前缀，必须与网关自身的会话键格式一致
pub const DEFAULT_SESSION_PREFIX: &str = "proxy:";
/// 默认注入的会话头
pub const DEFAULT_SESSION_HEADER: &str = "x-openclaw-session-key";
/// 默认会话 cookie 名称
pub const DEFAULT_SESSION_COOKIE: &str = "openclaw_session";
/// 控制台页面中待替换的基础路径占位符
pub const DEFAULT_BASE_PATH_PLACEHOLDER: &str = "__OPENCLAW_CONTROL_UI_BASE_PATH__";

/// 代理主配置
#[derive(Debug, Clone, Parser)]
#[command(
    name = "session-proxy",
    version,
    about = "Session-scoping reverse proxy with model rotation for a chat gateway"
)]
pub struct ProxyConfig {
    /// 后端网关地址
    #[arg(long, env = "GATEWAY_URL", default_value = "http://127.0.0.1:18789")]
    pub gateway_url: String,

    /// 监听主机
    #[arg(long, env = "PROXY_HOST", default_value = "127.0.0.1")]
    pub host: String,

    /// 监听端口
    #[arg(long, env = "PROXY_PORT", default_value_t = 3010)]
    pub port: u16,

    /// 新会话键前缀
    #[arg(long, env = "SESSION_PREFIX", default_value = DEFAULT_SESSION_PREFIX)]
    pub session_prefix: String,

    /// 注入到上游请求的会话头名称
    #[arg(long, env = "SESSION_HEADER", default_value = DEFAULT_SESSION_HEADER)]
    pub session_header: String,

    /// 会话 cookie 名称
    #[arg(long, env = "SESSION_COOKIE", default_value = DEFAULT_SESSION_COOKIE)]
    pub session_cookie: String,

    /// HTML 基础路径占位符
    #[arg(long, env = "BASE_PATH_PLACEHOLDER", default_value = DEFAULT_BASE_PATH_PLACEHOLDER)]
    pub base_path_placeholder: String,

    /// 网关访问令牌（为空时从 openclaw.json 读取）
    #[arg(long, env = "OPENCLAW_GATEWAY_TOKEN", hide_env_values = true)]
    pub gateway_token: Option<String>,

    /// openclaw.json 路径
    #[arg(long, env = "OPENCLAW_CONFIG_PATH")]
    pub openclaw_config_path: Option<PathBuf>,

    /// 轮换模型列表（逗号分隔，`off` 表示关闭轮换）
    #[arg(long, env = "ROUND_ROBIN_MODELS")]
    pub round_robin_models: Option<String>,

    /// 轮换模型列表 JSON 文件路径
    #[arg(long, env = "ROUND_ROBIN_CONFIG_PATH")]
    pub round_robin_config_path: Option<PathBuf>,

    /// 轮换状态空闲淘汰时间（秒）
    #[arg(long, env = "ROUND_ROBIN_IDLE_TTL_SECS", default_value_t = 86_400)]
    pub round_robin_idle_ttl_secs: u64,

    /// 网关会话存储文件路径
    #[arg(long, env = "SESSION_STORE_PATH")]
    pub session_store_path: Option<PathBuf>,

    /// 是否把轮换结果同步到会话存储文件
    #[arg(long, env = "OVERRIDE_SYNC_ENABLED", default_value_t = true, action = ArgAction::Set)]
    pub override_sync_enabled: bool,

    /// 会话存储文件变更的去抖窗口（毫秒）
    #[arg(long, env = "OVERRIDE_SYNC_DEBOUNCE_MS", default_value_t = 250)]
    pub override_sync_debounce_ms: u64,

    /// 是否启用工具调用门控
    #[arg(long, env = "TOOL_GATE_ENABLED", default_value_t = true, action = ArgAction::Set)]
    pub tool_gate_enabled: bool,

    /// 工具调用门控最大重试次数
    #[arg(long, env = "TOOL_GATE_MAX_RETRIES", default_value_t = 1)]
    pub tool_gate_max_retries: u32,

    /// 重试仍失败时升级使用的模型
    #[arg(long, env = "TOOL_GATE_ESCALATE_MODEL")]
    pub tool_gate_escalate_model: Option<String>,

    /// 是否写入路由决策日志
    #[arg(long, env = "ROUTER_LOG_ENABLED", default_value_t = true, action = ArgAction::Set)]
    pub router_log_enabled: bool,

    /// 路由决策日志目录
    #[arg(long, env = "ROUTER_LOG_DIR")]
    pub router_log_dir: Option<PathBuf>,

    /// 上游 HTTP 客户端超时（秒）
    #[arg(long, env = "UPSTREAM_TIMEOUT_SECS", default_value_t = 600)]
    pub upstream_timeout_secs: u64,

    /// 日志级别
    #[arg(long, env = "LOG_LEVEL")]
    pub log_level: Option<String>,
}

impl ProxyConfig {
    /// 从进程参数与环境变量加载
    #[must_use]
    pub fn from_env() -> Self {
        Self::parse()
    }

    /// 监听地址
    #[must_use]
    pub fn listen_address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// `~/.openclaw` 目录
    #[must_use]
    pub fn openclaw_dir() -> PathBuf {
        let home = env::var("HOME")
            .or_else(|_| env::var("USERPROFILE"))
            .unwrap_or_default();
        PathBuf::from(home).join(".openclaw")
    }

    /// 轮换模型 JSON 文件路径
    #[must_use]
    pub fn resolved_round_robin_config_path(&self) -> PathBuf {
        self.round_robin_config_path
            .clone()
            .unwrap_or_else(|| Self::openclaw_dir().join("round-robin-models.json"))
    }

    /// 网关会话存储文件路径
    #[must_use]
    pub fn resolved_session_store_path(&self) -> PathBuf {
        self.session_store_path.clone().unwrap_or_else(|| {
            Self::openclaw_dir()
                .join("agents")
                .join("main")
                .join("sessions")
                .join("sessions.json")
        })
    }

    /// 路由决策日志目录
    #[must_use]
    pub fn resolved_router_log_dir(&self) -> PathBuf {
        self.router_log_dir
            .clone()
            .unwrap_or_else(|| Self::openclaw_dir().join("logs").join("router-decisions"))
    }

    /// openclaw.json 路径
    #[must_use]
    pub fn resolved_openclaw_config_path(&self) -> PathBuf {
        self.openclaw_config_path
            .clone()
            .unwrap_or_else(|| Self::openclaw_dir().join("openclaw.json"))
    }

    /// 轮换状态空闲淘汰时间
    #[must_use]
    pub const fn round_robin_idle_ttl(&self) -> Duration {
        Duration::from_secs(self.round_robin_idle_ttl_secs)
    }

    /// 去抖窗口
    #[must_use]
    pub const fn override_sync_debounce(&self) -> Duration {
        Duration::from_millis(self.override_sync_debounce_ms)
    }

    /// 上游超时
    #[must_use]
    pub const fn upstream_timeout(&self) -> Duration {
        Duration::from_secs(self.upstream_timeout_secs)
    }
}
