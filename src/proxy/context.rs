//! # 代理上下文模块
//!
//! 单个请求在各个 Pingora 阶段之间传递的状态

use std::time::Instant;

use crate::session::{HtmlRewriter, ResolvedSession};
use crate::ws::WsObserver;

/// 请求上下文
#[derive(Debug)]
pub struct ProxyContext {
    /// 请求ID
    pub request_id: String,
    /// 开始时间
    pub start_time: Instant,
    /// 会话解析结果
    pub session: Option<ResolvedSession>,
    /// 是否为 WebSocket 升级请求
    pub is_upgrade: bool,
    /// 升级后连接的帧观察器
    pub ws_observer: Option<WsObserver>,
    /// HTML 改写缓冲
    pub html_rewriter: Option<HtmlRewriter>,
    /// 上游响应状态码
    pub response_status: Option<u16>,
}

impl Default for ProxyContext {
    fn default() -> Self {
        Self {
            request_id: String::new(),
            start_time: Instant::now(),
            session: None,
            is_upgrade: false,
            ws_observer: None,
            html_rewriter: None,
            response_status: None,
        }
    }
}

impl ProxyContext {
    /// 已解析出的会话键
    #[must_use]
    pub fn session_key(&self) -> Option<&str> {
        self.session.as_ref().and_then(|s| s.session_key.as_deref())
    }

    /// 路径作用域会话的基础路径
    #[must_use]
    pub fn base_path(&self) -> Option<&str> {
        self.session.as_ref().and_then(|s| s.base_path.as_deref())
    }

    /// 需要回写给浏览器的 cookie
    #[must_use]
    pub fn set_cookie(&self) -> Option<&str> {
        self.session.as_ref().and_then(|s| s.set_cookie.as_deref())
    }

    /// 请求耗时（毫秒）
    #[must_use]
    pub fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.start_time.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}
