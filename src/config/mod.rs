//! # 配置管理模块
//!
//! 处理进程配置加载与验证

mod app_config;
mod gateway;
mod models;

pub use app_config::{
    DEFAULT_BASE_PATH_PLACEHOLDER, DEFAULT_SESSION_COOKIE, DEFAULT_SESSION_HEADER,
    DEFAULT_SESSION_PREFIX, ProxyConfig,
};
pub use gateway::{load_gateway_token_from_file, resolve_gateway_token};
pub use models::{
    DEFAULT_MODELS, ModelSource, ResolvedModels, load_models_from_file, parse_models_env,
    resolve_models,
};

use crate::ensure_config;

/// 加载并验证配置
pub fn load_config() -> crate::error::Result<ProxyConfig> {
    let config = ProxyConfig::from_env();
    validate_config(&config)?;
    Ok(config)
}

/// 验证配置有效性
pub fn validate_config(config: &ProxyConfig) -> crate::error::Result<()> {
    let gateway = url::Url::parse(&config.gateway_url).map_err(|e| {
        crate::error::ProxyError::config_with_source(
            format!("无效的网关地址: {}", config.gateway_url),
            e,
        )
    })?;

    ensure_config!(
        matches!(gateway.scheme(), "http" | "https"),
        "网关地址必须是 http 或 https: {}",
        config.gateway_url
    );
    ensure_config!(
        gateway.host_str().is_some_and(|h| !h.is_empty()),
        "网关地址缺少主机名: {}",
        config.gateway_url
    );
    ensure_config!(config.port != 0, "无效的监听端口: {}", config.port);
    ensure_config!(!config.session_prefix.is_empty(), "会话键前缀不能为空");
    ensure_config!(
        !config.session_header.is_empty()
            && config
                .session_header
                .bytes()
                .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_'),
        "无效的会话头名称: {}",
        config.session_header
    );
    ensure_config!(
        !config.session_cookie.is_empty()
            && !config
                .session_cookie
                .contains(|c: char| c == ';' || c == '=' || c.is_whitespace()),
        "无效的会话 cookie 名称: {}",
        config.session_cookie
    );
    ensure_config!(!config.base_path_placeholder.is_empty(), "基础路径占位符不能为空");
    ensure_config!(
        config.override_sync_debounce_ms > 0,
        "去抖窗口必须大于0毫秒"
    );

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;

    fn parse(args: &[&str]) -> ProxyConfig {
        let mut full = vec!["session-proxy"];
        full.extend_from_slice(args);
        ProxyConfig::try_parse_from(full).unwrap()
    }

    #[test]
    fn test_defaults_are_valid() {
        let config = parse(&[]);
        assert_eq!(config.session_prefix, DEFAULT_SESSION_PREFIX);
        assert_eq!(config.session_header, DEFAULT_SESSION_HEADER);
        assert!(config.tool_gate_enabled);
        assert!(validate_config(&config).is_ok());
    }

    #[test]
    fn test_boolean_flags_take_explicit_values() {
        let config = parse(&["--tool-gate-enabled", "false", "--tool-gate-max-retries", "3"]);
        assert_eq!(config.tool_gate_max_retries, 3);
        assert!(!config.tool_gate_enabled);
    }

    #[test]
    fn test_rejects_bad_gateway_url() {
        let config = parse(&["--gateway-url", "ftp://example.com"]);
        assert!(validate_config(&config).is_err());

        let config = parse(&["--gateway-url", "not a url"]);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_rejects_bad_cookie_name() {
        let config = parse(&["--session-cookie", "bad name"]);
        assert!(validate_config(&config).is_err());
    }

    #[test]
    fn test_resolved_paths_follow_overrides() {
        let config = parse(&["--session-store-path", "/tmp/sessions.json"]);
        assert_eq!(
            config.resolved_session_store_path(),
            std::path::PathBuf::from("/tmp/sessions.json")
        );
        assert!(
            config
                .resolved_router_log_dir()
                .ends_with(".openclaw/logs/router-decisions")
        );
    }
}
