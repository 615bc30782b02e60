//! # 聊天补全转发
//!
//! 聊天补全请求在 `request_filter` 中整体接管：读完请求体，经轮换引擎改写，
//! 非流式请求再交给工具调用闸门，最后把回复写回客户端并追加决策日志。

use bytes::{Bytes, BytesMut};
use pingora_proxy::Session;

use crate::error::{ProxyError, Result};
use crate::gate::{BackendReply, ChatBackend, ReqwestChatBackend, ToolGate, collect_headers};
use crate::logging::{LogComponent, LogStage};
use crate::observe::DecisionRecord;
use crate::proxy::context::ProxyContext;
use crate::proxy::response::{proxy_error_body, reply_header, write_reply, write_text};
use crate::proxy::state::ProxyState;
use crate::rotation::{ChatTransform, DEFAULT_ROTATION_KEY, RotationEngine};
use crate::{ldebug, lerror, linfo};

/// 聊天补全路径特征
pub const CHAT_COMPLETIONS_SEGMENT: &str = "/chat/completions";

/// 是否是需要接管的聊天补全请求
#[must_use]
pub fn is_chat_completion(method: &str, path: &str) -> bool {
    method.eq_ignore_ascii_case("POST") && path.contains(CHAT_COMPLETIONS_SEGMENT)
}

/// 读取完整请求体
async fn read_body(session: &mut Session) -> pingora_core::Result<Bytes> {
    let mut body = BytesMut::new();
    while let Some(chunk) = session.read_request_body().await? {
        body.extend_from_slice(&chunk);
    }
    Ok(body.freeze())
}

/// 构造指向网关的后端，复制入站请求头并注入会话头
fn build_backend(state: &ProxyState, session: &Session, ctx: &ProxyContext) -> ReqwestChatBackend {
    let forward_path = ctx
        .session
        .as_ref()
        .map_or("/", |s| s.forward_path.as_str());
    let headers = session
        .req_header()
        .headers
        .iter()
        .map(|(name, value)| (name.as_str(), value.as_bytes()));

    let backend = state.chat_backend(forward_path).with_headers(headers);
    match ctx.session_key() {
        Some(key) => backend.with_header(&state.config().session_header, key),
        None => backend,
    }
}

/// 一次聊天补全的转发计划：轮换变换后的请求体与对应的决策记录
#[derive(Debug, Clone)]
pub struct ChatPlan {
    pub transform: ChatTransform,
    pub record: DecisionRecord,
}

impl ChatPlan {
    /// 按会话键轮换请求体；没有会话键时使用共用键
    #[must_use]
    pub fn prepare(engine: &RotationEngine, session_key: Option<&str>, raw: &[u8]) -> Self {
        let rotation_key = session_key.unwrap_or(DEFAULT_ROTATION_KEY);
        let transform = engine.transform_chat_body(rotation_key, raw);
        let record = DecisionRecord::from_transform(session_key, &transform);
        Self { transform, record }
    }

    /// 流式请求或非 JSON 请求体走逐块转发，不经过闸门
    #[must_use]
    pub fn is_streaming(&self) -> bool {
        self.record.stream || self.transform.json.is_none()
    }

    /// 经工具调用闸门发送，并把闸门结果与用量记入决策记录
    pub async fn forward(
        &mut self,
        gate: &ToolGate,
        request_id: &str,
        backend: &dyn ChatBackend,
    ) -> Result<BackendReply> {
        let result = gate
            .execute(request_id, backend, self.transform.body.clone())
            .await?;
        self.record.with_gate(&result.outcome, result.final_model);
        if let Some(json) = result.reply.json() {
            self.record.with_usage(&json);
        }
        Ok(result.reply)
    }
}

/// 处理一个聊天补全请求，响应已写回客户端
pub async fn handle_chat_completion(
    state: &ProxyState,
    session: &mut Session,
    ctx: &mut ProxyContext,
) -> pingora_core::Result<()> {
    let raw = read_body(session).await?;
    let mut plan = ChatPlan::prepare(state.engine(), ctx.session_key(), &raw);

    linfo!(
        ctx.request_id,
        LogStage::RequestModify,
        LogComponent::Proxy,
        "chat_completion",
        "转发聊天补全",
        session_key = ctx.session_key().unwrap_or("-"),
        requested_model = plan.transform.requested_model.as_deref().unwrap_or("-"),
        model = plan.transform.effective_model().unwrap_or("-")
    );

    let backend = build_backend(state, session, ctx);
    let set_cookie = ctx.set_cookie().map(ToString::to_string);

    let status = if plan.is_streaming() {
        let body = plan.transform.body.clone();
        relay_streaming(&backend, body, session, ctx, set_cookie.as_deref()).await?
    } else {
        match plan.forward(state.gate(), &ctx.request_id, &backend).await {
            Ok(reply) => {
                let status = reply.status;
                write_reply(session, reply, set_cookie.as_deref()).await?;
                status
            }
            Err(e) => write_failure(session, ctx, "chat_failed", &e).await?,
        }
    };

    ctx.response_status = Some(status);
    plan.record.finish(status, ctx.elapsed_ms());
    state.decision_log().record(&ctx.request_id, &plan.record).await;
    Ok(())
}

/// 转发失败：按错误类型选状态码，写回纯文本错误
async fn write_failure(
    session: &mut Session,
    ctx: &ProxyContext,
    operation: &str,
    err: &ProxyError,
) -> pingora_core::Result<u16> {
    let (status, code) = err.to_http_response_parts();
    lerror!(
        ctx.request_id,
        LogStage::ResponseFailure,
        LogComponent::Upstream,
        operation,
        "聊天补全转发失败",
        status = status,
        code = code,
        error = err
    );
    write_text(session, status, proxy_error_body(err)).await?;
    Ok(status)
}

/// 流式转发：逐块把网关回复写回客户端，返回状态码
async fn relay_streaming(
    backend: &ReqwestChatBackend,
    body: Bytes,
    session: &mut Session,
    ctx: &ProxyContext,
    set_cookie: Option<&str>,
) -> pingora_core::Result<u16> {
    let mut resp = match backend.send_streaming(body).await {
        Ok(resp) => resp,
        Err(e) => return write_failure(session, ctx, "chat_stream_failed", &e).await,
    };

    let status = resp.status().as_u16();
    let headers = collect_headers(resp.headers());
    let header = reply_header(status, &headers, set_cookie, None)?;
    session.write_response_header(Box::new(header), false).await?;

    let mut chunks = 0usize;
    loop {
        match resp.chunk().await {
            Ok(Some(chunk)) => {
                chunks += 1;
                session.write_response_body(Some(chunk), false).await?;
            }
            Ok(None) => break,
            Err(e) => {
                // 头部已发出，只能截断
                lerror!(
                    ctx.request_id,
                    LogStage::ResponseFailure,
                    LogComponent::Upstream,
                    "chat_stream_interrupted",
                    "网关流式回复中断",
                    error = e
                );
                break;
            }
        }
    }
    session.write_response_body(None, true).await?;

    ldebug!(
        ctx.request_id,
        LogStage::Response,
        LogComponent::Proxy,
        "chat_stream_done",
        "流式回复转发完成",
        chunks = chunks
    );
    Ok(status)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_completion_detection() {
        assert!(is_chat_completion("POST", "/v1/chat/completions"));
        assert!(is_chat_completion("post", "/api/openai/chat/completions"));
        assert!(!is_chat_completion("GET", "/v1/chat/completions"));
        assert!(!is_chat_completion("POST", "/v1/completions"));
    }

    #[test]
    fn test_plan_routes_streaming_and_raw_bodies_around_gate() {
        let engine = RotationEngine::new(
            vec!["a/m1".to_string()],
            std::sync::Arc::new(crate::rotation::MemoryRotationStore::new()),
        );
        let streaming = ChatPlan::prepare(
            &engine,
            Some("proxy:s"),
            br#"{"stream": true, "messages": [{"role": "user", "content": "hi"}]}"#,
        );
        assert!(streaming.is_streaming());
        assert!(streaming.record.stream);

        let raw = ChatPlan::prepare(&engine, None, b"not json");
        assert!(raw.is_streaming());
        assert_eq!(raw.record.session_key, None);

        let buffered = ChatPlan::prepare(
            &engine,
            Some("proxy:s"),
            br#"{"messages": [{"role": "user", "content": "hi"}]}"#,
        );
        assert!(!buffered.is_streaming());
    }
}
