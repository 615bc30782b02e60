//! # Pingora 会话代理服务
//!
//! 所有请求都转发到同一个网关：解析会话身份、注入会话头、去掉 `/s/<key>` 前缀。
//! `/new` 与聊天补全在 `request_filter` 中直接响应，其余流量走 Pingora 转发，
//! WebSocket 升级后的双向字节在 body filter 中旁路观察。

use async_trait::async_trait;
use bytes::Bytes;
use pingora_core::{ErrorType, prelude::*, upstreams::peer::HttpPeer};
use pingora_http::{RequestHeader, ResponseHeader};
use pingora_proxy::{FailToProxy, ProxyHttp, Session};
use std::time::Duration;
use uuid::Uuid;

use crate::logging::{LogComponent, LogStage};
use crate::proxy::chat::{handle_chat_completion, is_chat_completion};
use crate::proxy::context::ProxyContext;
use crate::proxy::response::{write_redirect, write_text};
use crate::proxy::state::ProxyState;
use crate::session::{
    HtmlRewriter, NewSessionRedirect, ResolvedSession, SessionResolver, is_html,
};
use crate::ws::{Direction, WsObserver};
use crate::{ldebug, lerror, linfo};

/// 会话代理服务
pub struct ProxyService {
    state: ProxyState,
}

impl ProxyService {
    #[must_use]
    pub const fn new(state: ProxyState) -> Self {
        Self { state }
    }

    #[must_use]
    pub const fn state(&self) -> &ProxyState {
        &self.state
    }

    fn is_websocket_upgrade(req: &RequestHeader) -> bool {
        req.headers
            .get("upgrade")
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v.eq_ignore_ascii_case("websocket"))
    }

    /// `GET|POST /new`（含 `/new/`）时创建新会话
    #[must_use]
    pub fn new_session_redirect(&self, method: &str, path: &str) -> Option<NewSessionRedirect> {
        (SessionResolver::is_new_session_path(path) && matches!(method, "GET" | "POST"))
            .then(|| {
                self.state
                    .resolver()
                    .new_session_redirect(self.state.gateway_token())
            })
    }

    /// 改写发往网关的请求头：`Host`、去掉 `/s/<key>` 前缀、注入会话头
    pub fn rewrite_upstream_request(
        &self,
        upstream_request: &mut RequestHeader,
        resolved: Option<&ResolvedSession>,
    ) -> Result<()> {
        upstream_request
            .insert_header("host", self.state.gateway().host_header())
            .map_err(Self::map_header_error)?;

        let Some(resolved) = resolved else {
            return Ok(());
        };

        if resolved.is_path_scoped() {
            upstream_request.set_uri(
                resolved
                    .forward_path
                    .parse()
                    .map_err(Self::map_header_error)?,
            );
            // HTML 需要以明文到达才能改写
            upstream_request.remove_header("accept-encoding");
        }

        if let Some(key) = &resolved.session_key {
            upstream_request
                .insert_header(self.state.config().session_header.clone(), key)
                .map_err(Self::map_header_error)?;
        }
        Ok(())
    }

    fn map_header_error(err: impl std::fmt::Display) -> Box<Error> {
        Error::explain(
            ErrorType::InternalError,
            format!("Failed to rewrite upstream request: {err}"),
        )
    }
}

#[async_trait]
impl ProxyHttp for ProxyService {
    type CTX = ProxyContext;

    fn new_ctx(&self) -> Self::CTX {
        ProxyContext {
            request_id: Uuid::new_v4().to_string(),
            ..Default::default()
        }
    }

    async fn request_filter(&self, session: &mut Session, ctx: &mut Self::CTX) -> Result<bool> {
        let req = session.req_header();
        let method = req.method.as_str().to_string();
        let path = req.uri.path().to_string();
        let query = req.uri.query().map(ToString::to_string);
        let cookie = req
            .headers
            .get("cookie")
            .and_then(|v| v.to_str().ok())
            .map(ToString::to_string);
        ctx.is_upgrade = Self::is_websocket_upgrade(req);

        if let Some(redirect) = self.new_session_redirect(&method, &path) {
            linfo!(
                ctx.request_id,
                LogStage::RequestStart,
                LogComponent::Session,
                "new_session",
                "创建新会话",
                session_key = redirect.session_key
            );
            write_redirect(session, &redirect.location, &redirect.set_cookie).await?;
            ctx.response_status = Some(302);
            return Ok(true);
        }

        let resolved = self
            .state
            .resolver()
            .resolve(&path, query.as_deref(), cookie.as_deref());
        ldebug!(
            ctx.request_id,
            LogStage::RequestStart,
            LogComponent::Session,
            "resolve",
            "会话解析完成",
            method = method,
            path = path,
            source = resolved.source.as_str(),
            session_key = resolved.session_key.as_deref().unwrap_or("-"),
            upgrade = ctx.is_upgrade
        );
        ctx.session = Some(resolved);

        if ctx.is_upgrade {
            let rotation_key = ctx.session_key().map(ToString::to_string);
            ctx.ws_observer = Some(WsObserver::new(
                ctx.request_id.clone(),
                rotation_key,
                Some(self.state.engine().clone()),
            ));
        } else if is_chat_completion(&method, &path) {
            handle_chat_completion(&self.state, session, ctx).await?;
            return Ok(true);
        }

        Ok(false)
    }

    async fn upstream_peer(
        &self,
        _session: &mut Session,
        _ctx: &mut Self::CTX,
    ) -> Result<Box<HttpPeer>> {
        let peer = self.state.gateway().create_peer().map_err(|e| {
            Error::explain(
                ErrorType::ConnectError,
                format!("Failed to resolve gateway: {e}"),
            )
        })?;
        Ok(Box::new(peer))
    }

    async fn upstream_request_filter(
        &self,
        _session: &mut Session,
        upstream_request: &mut RequestHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        self.rewrite_upstream_request(upstream_request, ctx.session.as_ref())
    }

    async fn request_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        _end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        if let (Some(observer), Some(chunk)) = (ctx.ws_observer.as_mut(), body.as_ref()) {
            observer.observe(Direction::ClientToServer, chunk);
        }
        Ok(())
    }

    async fn response_filter(
        &self,
        _session: &mut Session,
        upstream_response: &mut ResponseHeader,
        ctx: &mut Self::CTX,
    ) -> Result<()> {
        let status = upstream_response.status.as_u16();
        ctx.response_status = Some(status);

        if let Some(cookie) = ctx.set_cookie() {
            upstream_response
                .append_header("set-cookie", cookie)
                .map_err(Self::map_header_error)?;
        }

        let content_type = upstream_response
            .headers
            .get("content-type")
            .and_then(|v| v.to_str().ok());
        if let Some(base_path) = ctx.base_path() {
            if !ctx.is_upgrade && is_html(content_type) {
                upstream_response.remove_header("content-length");
                upstream_response
                    .insert_header("transfer-encoding", "chunked")
                    .map_err(Self::map_header_error)?;
                ctx.html_rewriter = Some(HtmlRewriter::new(
                    self.state.config().base_path_placeholder.clone(),
                    base_path,
                ));
            }
        }

        if ctx.is_upgrade && status != 101 {
            ctx.ws_observer = None;
        }
        Ok(())
    }

    fn response_body_filter(
        &self,
        _session: &mut Session,
        body: &mut Option<Bytes>,
        end_of_stream: bool,
        ctx: &mut Self::CTX,
    ) -> Result<Option<Duration>> {
        if let Some(observer) = ctx.ws_observer.as_mut() {
            if let Some(chunk) = body.as_ref() {
                observer.observe(Direction::ServerToClient, chunk);
            }
            return Ok(None);
        }

        if let Some(rewriter) = ctx.html_rewriter.as_mut() {
            if let Some(chunk) = body.take() {
                rewriter.push(&chunk);
            }
            if end_of_stream {
                *body = Some(rewriter.finish());
            }
        }
        Ok(None)
    }

    async fn fail_to_proxy(
        &self,
        session: &mut Session,
        e: &Error,
        ctx: &mut Self::CTX,
    ) -> FailToProxy {
        lerror!(
            ctx.request_id,
            LogStage::ResponseFailure,
            LogComponent::Upstream,
            "proxy_failed",
            "转发到网关失败",
            error = e
        );

        let code = match e.etype() {
            ErrorType::HTTPStatus(code) => *code,
            _ => 502,
        };
        if code > 0 && !ctx.is_upgrade {
            let body = if code == 502 {
                format!("Proxy error: {e}")
            } else {
                e.to_string()
            };
            if let Err(write_err) = write_text(session, code, body).await {
                lerror!(
                    ctx.request_id,
                    LogStage::ResponseFailure,
                    LogComponent::Proxy,
                    "error_response_failed",
                    "写回错误响应失败",
                    error = write_err
                );
            }
        }
        ctx.response_status = Some(code);

        FailToProxy {
            error_code: code,
            can_reuse_downstream: false,
        }
    }

    async fn logging(&self, _session: &mut Session, e: Option<&Error>, ctx: &mut Self::CTX) {
        let status = ctx.response_status.unwrap_or(0);
        if let Some(error) = e {
            lerror!(
                ctx.request_id,
                LogStage::Error,
                LogComponent::Proxy,
                "request_failed",
                "请求处理失败",
                status = status,
                duration_ms = ctx.elapsed_ms(),
                error = error
            );
            return;
        }

        if let Some(observer) = ctx.ws_observer.as_ref() {
            linfo!(
                ctx.request_id,
                LogStage::Response,
                LogComponent::WebSocket,
                "ws_closed",
                "WebSocket 连接结束",
                frames = observer.frames_seen(),
                bytes = observer.bytes_seen(),
                observing = !observer.is_disabled(),
                duration_ms = ctx.elapsed_ms()
            );
        } else {
            ldebug!(
                ctx.request_id,
                LogStage::Response,
                LogComponent::Proxy,
                "request_completed",
                "请求完成",
                status = status,
                session_key = ctx.session_key().unwrap_or("-"),
                duration_ms = ctx.elapsed_ms()
            );
        }
    }
}
