//! # 直接写回客户端的响应
//!
//! `/new` 重定向、网关不可达时的 502，以及聊天转发的回复。

use bytes::Bytes;
use pingora_core::{Error as PingoraError, ErrorType, Result as PingoraResult};
use pingora_http::ResponseHeader;
use pingora_proxy::Session;

use crate::gate::BackendReply;

/// 不从网关回复中复制的响应头
const SKIPPED_RESPONSE_HEADERS: [&str; 4] =
    ["content-length", "transfer-encoding", "connection", "keep-alive"];

/// 502 响应体
#[must_use]
pub fn proxy_error_body(err: &dyn std::error::Error) -> String {
    let mut message = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        message.push_str(": ");
        message.push_str(&cause.to_string());
        source = cause.source();
    }
    format!("Proxy error: {message}")
}

fn build_header(status: u16, capacity: usize) -> PingoraResult<ResponseHeader> {
    ResponseHeader::build(status, Some(capacity)).map_err(|err| {
        PingoraError::explain(
            ErrorType::InternalError,
            format!("Failed to build response header: {err}"),
        )
    })
}

fn insert(resp: &mut ResponseHeader, name: &'static str, value: &str) -> PingoraResult<()> {
    resp.insert_header(name, value).map_err(|err| {
        PingoraError::explain(
            ErrorType::InternalError,
            format!("Failed to set {name} header: {err}"),
        )
    })
}

fn append(resp: &mut ResponseHeader, name: String, value: &str) -> PingoraResult<()> {
    resp.append_header(name, value).map_err(|err| {
        PingoraError::explain(
            ErrorType::InternalError,
            format!("Failed to append response header: {err}"),
        )
    })?;
    Ok(())
}

/// 302 重定向响应头
pub fn redirect_header(location: &str, set_cookie: &str) -> PingoraResult<ResponseHeader> {
    let mut resp = build_header(302, 4)?;
    insert(&mut resp, "location", location)?;
    insert(&mut resp, "set-cookie", set_cookie)?;
    insert(&mut resp, "cache-control", "no-store")?;
    insert(&mut resp, "content-length", "0")?;
    Ok(resp)
}

/// 302 重定向并设置 cookie
pub async fn write_redirect(
    session: &mut Session,
    location: &str,
    set_cookie: &str,
) -> PingoraResult<()> {
    let resp = redirect_header(location, set_cookie)?;
    session.write_response_header(Box::new(resp), true).await?;
    Ok(())
}

/// 纯文本响应
pub async fn write_text(session: &mut Session, status: u16, body: String) -> PingoraResult<()> {
    let mut resp = build_header(status, 2)?;
    insert(&mut resp, "content-type", "text/plain; charset=utf-8")?;
    insert(&mut resp, "content-length", &body.len().to_string())?;
    session.write_response_header(Box::new(resp), false).await?;
    session
        .write_response_body(Some(Bytes::from(body)), true)
        .await?;
    Ok(())
}

/// 从网关回复构造响应头；`chunked` 为真时用分块编码（流式转发）
pub fn reply_header(
    status: u16,
    headers: &[(String, String)],
    set_cookie: Option<&str>,
    content_length: Option<usize>,
) -> PingoraResult<ResponseHeader> {
    let mut resp = build_header(status, headers.len() + 2)?;
    for (name, value) in headers {
        if SKIPPED_RESPONSE_HEADERS
            .iter()
            .any(|skip| skip.eq_ignore_ascii_case(name))
        {
            continue;
        }
        append(&mut resp, name.clone(), value)?;
    }
    if let Some(cookie) = set_cookie {
        append(&mut resp, "set-cookie".to_string(), cookie)?;
    }
    match content_length {
        Some(len) => insert(&mut resp, "content-length", &len.to_string())?,
        None => insert(&mut resp, "transfer-encoding", "chunked")?,
    }
    Ok(resp)
}

/// 写回完整的网关回复
pub async fn write_reply(
    session: &mut Session,
    reply: BackendReply,
    set_cookie: Option<&str>,
) -> PingoraResult<()> {
    let resp = reply_header(reply.status, &reply.headers, set_cookie, Some(reply.body.len()))?;
    session.write_response_header(Box::new(resp), false).await?;
    session.write_response_body(Some(reply.body), true).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ProxyError;

    #[test]
    fn test_proxy_error_body_includes_cause() {
        let err = ProxyError::network_with_source(
            "连接网关失败",
            std::io::Error::new(std::io::ErrorKind::ConnectionRefused, "connection refused"),
        );
        let body = proxy_error_body(&err);
        assert!(body.starts_with("Proxy error: "));
        assert!(body.ends_with("connection refused"));
    }

    #[test]
    fn test_reply_header_drops_framing_headers() {
        let headers = vec![
            ("content-type".to_string(), "application/json".to_string()),
            ("content-length".to_string(), "999".to_string()),
            ("transfer-encoding".to_string(), "chunked".to_string()),
        ];
        let resp = reply_header(200, &headers, Some("a=b; Path=/"), Some(12)).unwrap();
        assert_eq!(resp.status.as_u16(), 200);
        assert_eq!(resp.headers.get("content-length").unwrap(), "12");
        assert!(resp.headers.get("transfer-encoding").is_none());
        assert_eq!(resp.headers.get("set-cookie").unwrap(), "a=b; Path=/");
    }

    #[test]
    fn test_streaming_reply_header_is_chunked() {
        let resp = reply_header(200, &[], None, None).unwrap();
        assert_eq!(resp.headers.get("transfer-encoding").unwrap(), "chunked");
        assert!(resp.headers.get("content-length").is_none());
    }
}
