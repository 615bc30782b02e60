//! # 聊天补全后端
//!
//! 工具调用闸门与聊天转发共用的后端抽象，测试中可替换为 mock。

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use serde_json::Value;
use std::time::Duration;

use crate::error::{ProxyError, Result};

/// 后端回复
#[derive(Debug, Clone)]
pub struct BackendReply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl BackendReply {
    #[must_use]
    pub const fn is_success(&self) -> bool {
        self.status >= 200 && self.status < 300
    }

    /// 回复体解析为 JSON
    #[must_use]
    pub fn json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }

    /// 按名称取响应头（不区分大小写）
    #[must_use]
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// 聊天补全后端
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// 发送一次非流式请求并读取完整回复
    async fn send(&self, body: Bytes) -> Result<BackendReply>;
}

/// 转发到网关时不携带的请求头
const SKIPPED_REQUEST_HEADERS: [&str; 6] = [
    "host",
    "content-length",
    "connection",
    "transfer-encoding",
    "accept-encoding",
    "upgrade",
];

/// 基于 reqwest 的后端
#[derive(Debug, Clone)]
pub struct ReqwestChatBackend {
    client: reqwest::Client,
    url: String,
    headers: HeaderMap,
}

impl ReqwestChatBackend {
    /// 构建共享 HTTP 客户端
    pub fn build_client(timeout: Duration) -> Result<reqwest::Client> {
        reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| ProxyError::config_with_source("创建 HTTP 客户端失败", e))
    }

    #[must_use]
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            headers: HeaderMap::new(),
        }
    }

    /// 复制入站请求头，跳过逐跳头与 `Host`
    #[must_use]
    pub fn with_headers<'a>(mut self, headers: impl IntoIterator<Item = (&'a str, &'a [u8])>) -> Self {
        for (name, value) in headers {
            if SKIPPED_REQUEST_HEADERS
                .iter()
                .any(|skip| skip.eq_ignore_ascii_case(name))
            {
                continue;
            }
            if let (Ok(name), Ok(value)) = (
                HeaderName::from_bytes(name.as_bytes()),
                HeaderValue::from_bytes(value),
            ) {
                self.headers.append(name, value);
            }
        }
        self
    }

    /// 设置（覆盖）单个请求头
    #[must_use]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            self.headers.insert(name, value);
        }
        self
    }

    #[must_use]
    pub fn url(&self) -> &str {
        &self.url
    }

    /// 发送请求，返回尚未读取的响应（流式转发使用）
    pub async fn send_streaming(&self, body: Bytes) -> Result<reqwest::Response> {
        self.client
            .post(&self.url)
            .headers(self.headers.clone())
            .body(body)
            .send()
            .await
            .map_err(|e| ProxyError::bad_gateway_with_source(format!("连接网关失败: {e}"), e))
    }
}

#[async_trait]
impl ChatBackend for ReqwestChatBackend {
    async fn send(&self, body: Bytes) -> Result<BackendReply> {
        let resp = self.send_streaming(body).await?;
        let status = resp.status().as_u16();
        let headers = collect_headers(resp.headers());
        let body = resp
            .bytes()
            .await
            .map_err(|e| ProxyError::bad_gateway_with_source(format!("读取网关响应失败: {e}"), e))?;
        Ok(BackendReply {
            status,
            headers,
            body,
        })
    }
}

/// 响应头转为列表
#[must_use]
pub fn collect_headers(headers: &HeaderMap) -> Vec<(String, String)> {
    headers
        .iter()
        .filter_map(|(k, v)| v.to_str().ok().map(|v| (k.as_str().to_string(), v.to_string())))
        .collect()
}
