//! # 网关上游
//!
//! 所有流量都转发到同一个网关，URL 在启动时解析，主机名在每次连接前解析。

use pingora_core::upstreams::peer::HttpPeer;
use std::net::ToSocketAddrs;
use url::Url;

use crate::error::{ProxyError, Result};

/// 网关地址
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayTarget {
    host: String,
    port: u16,
    use_tls: bool,
    /// 不带结尾 `/` 的基础 URL，如 `http://127.0.0.1:18789`
    base_url: String,
}

impl GatewayTarget {
    /// 解析网关地址，只接受 http/https
    pub fn parse(raw: &str) -> Result<Self> {
        let url = Url::parse(raw)
            .map_err(|e| ProxyError::config_with_source(format!("无效的网关地址: {raw}"), e))?;
        let use_tls = match url.scheme() {
            "http" => false,
            "https" => true,
            other => {
                return Err(ProxyError::config(format!(
                    "不支持的网关协议: {other}"
                )));
            }
        };
        let host = url
            .host_str()
            .ok_or_else(|| ProxyError::config(format!("网关地址缺少主机名: {raw}")))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| ProxyError::config(format!("网关地址缺少端口: {raw}")))?;

        Ok(Self {
            base_url: format!("{}://{}", url.scheme(), authority(&host, port, url.port().is_some())),
            host,
            port,
            use_tls,
        })
    }

    #[must_use]
    pub fn host(&self) -> &str {
        &self.host
    }

    #[must_use]
    pub const fn port(&self) -> u16 {
        self.port
    }

    #[must_use]
    pub const fn use_tls(&self) -> bool {
        self.use_tls
    }

    /// 连接地址 `host:port`
    #[must_use]
    pub fn address(&self) -> String {
        authority(&self.host, self.port, true)
    }

    /// 转发时使用的 `Host` 头
    #[must_use]
    pub fn host_header(&self) -> String {
        let default_port = if self.use_tls { 443 } else { 80 };
        authority(&self.host, self.port, self.port != default_port)
    }

    /// 拼接网关上的完整 URL
    #[must_use]
    pub fn url_for(&self, path_and_query: &str) -> String {
        if path_and_query.starts_with('/') {
            format!("{}{path_and_query}", self.base_url)
        } else {
            format!("{}/{path_and_query}", self.base_url)
        }
    }

    /// 解析网关地址并创建 Pingora 上游对等体
    ///
    /// 每次请求都重新解析，网关主机名的 DNS 变化无需重启。
    pub fn create_peer(&self) -> Result<HttpPeer> {
        let address = self.address();
        let socket = address
            .to_socket_addrs()
            .map_err(|e| ProxyError::network_with_source(format!("解析网关地址失败: {address}"), e))?
            .next()
            .ok_or_else(|| ProxyError::network(format!("网关地址没有可用的解析结果: {address}")))?;
        Ok(HttpPeer::new(socket, self.use_tls, self.host.clone()))
    }
}

fn authority(host: &str, port: u16, with_port: bool) -> String {
    // IPv6 字面量需要方括号
    let host = if host.contains(':') && !host.starts_with('[') {
        format!("[{host}]")
    } else {
        host.to_string()
    };
    if with_port {
        format!("{host}:{port}")
    } else {
        host
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_http_gateway() {
        let target = GatewayTarget::parse("http://127.0.0.1:18789").unwrap();
        assert_eq!(target.host(), "127.0.0.1");
        assert_eq!(target.port(), 18789);
        assert!(!target.use_tls());
        assert_eq!(target.address(), "127.0.0.1:18789");
        assert_eq!(target.host_header(), "127.0.0.1:18789");
        assert_eq!(
            target.url_for("/v1/chat/completions?x=1"),
            "http://127.0.0.1:18789/v1/chat/completions?x=1"
        );
    }

    #[test]
    fn test_parse_https_default_port() {
        let target = GatewayTarget::parse("https://gateway.example.com/").unwrap();
        assert_eq!(target.port(), 443);
        assert!(target.use_tls());
        assert_eq!(target.host_header(), "gateway.example.com");
        assert_eq!(target.url_for("/"), "https://gateway.example.com/");
    }

    #[test]
    fn test_create_peer_resolves_literal_address() {
        let target = GatewayTarget::parse("http://127.0.0.1:18789").unwrap();
        let peer = target.create_peer().unwrap();
        assert_eq!(peer.sni, "127.0.0.1");
    }

    #[test]
    fn test_rejects_other_schemes() {
        assert!(GatewayTarget::parse("ftp://host").is_err());
        assert!(GatewayTarget::parse("not a url").is_err());
    }
}
