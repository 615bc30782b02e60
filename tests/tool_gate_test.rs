//! 测试：工具调用闸门对真实 HTTP 后端的重试与升级

use bytes::Bytes;
use pretty_assertions::assert_eq;
use serde_json::{Value, json};
use session_proxy::gate::{ReqwestChatBackend, ToolGate, ToolGateConfig};
use std::time::Duration;
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

const CHAT_PATH: &str = "/v1/chat/completions";

fn request_body(model: &str) -> Bytes {
    let body = json!({
        "model": model,
        "messages": [{"role": "user", "content": "list the files"}],
        "tools": [{"type": "function", "function": {"name": "list_files", "parameters": {}}}]
    });
    Bytes::from(serde_json::to_vec(&body).unwrap())
}

fn text_reply() -> Value {
    json!({"choices": [{"message": {"role": "assistant", "content": "I would list them."}}]})
}

fn tool_reply() -> Value {
    json!({"choices": [{"message": {
        "role": "assistant",
        "tool_calls": [{"id": "c1", "type": "function", "function": {"name": "list_files", "arguments": "{}"}}]
    }}]})
}

fn backend(server: &MockServer) -> ReqwestChatBackend {
    let client = ReqwestChatBackend::build_client(Duration::from_secs(5)).unwrap();
    ReqwestChatBackend::new(client, format!("{}{CHAT_PATH}", server.uri()))
        .with_header("content-type", "application/json")
        .with_header("x-openclaw-session-key", "proxy:tab")
}

#[tokio::test]
async fn retries_exactly_once_then_forwards_last_reply() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .and(header("x-openclaw-session-key", "proxy:tab"))
        .respond_with(ResponseTemplate::new(200).set_body_json(text_reply()))
        .expect(2)
        .mount(&server)
        .await;

    let gate = ToolGate::new(ToolGateConfig {
        enabled: true,
        max_retries: 1,
        escalate_model: None,
    });
    let result = gate
        .execute("req-1", &backend(&server), request_body("a/m1"))
        .await
        .unwrap();

    assert_eq!(result.reply.status, 200);
    assert_eq!(result.reply.json(), Some(text_reply()));
    assert!(result.outcome.active);
    assert_eq!(result.outcome.retry_count, 1);
    assert!(!result.outcome.escalated);
    assert_eq!(result.outcome.had_valid_tool_calls, Some(false));
    assert_eq!(result.final_model.as_deref(), Some("a/m1"));

    // 重试请求带上了纠正提示
    let requests = server.received_requests().await.unwrap();
    let retry: Value = serde_json::from_slice(&requests[1].body).unwrap();
    let messages = retry["messages"].as_array().unwrap();
    assert_eq!(messages.len(), 2);
    assert_eq!(messages[1]["role"], "system");
    assert!(messages[1]["content"].as_str().unwrap().contains("list_files"));
}

#[tokio::test]
async fn escalates_after_retries_fail() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .and(body_partial_json(json!({"model": "big/escalate"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(tool_reply()))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(text_reply()))
        .expect(2)
        .mount(&server)
        .await;

    let gate = ToolGate::new(ToolGateConfig {
        enabled: true,
        max_retries: 1,
        escalate_model: Some("big/escalate".to_string()),
    });
    let result = gate
        .execute("req-2", &backend(&server), request_body("a/m1"))
        .await
        .unwrap();

    assert!(result.outcome.escalated);
    assert_eq!(result.outcome.had_valid_tool_calls, Some(true));
    assert_eq!(result.outcome.escalate_model.as_deref(), Some("big/escalate"));
    assert_eq!(result.final_model.as_deref(), Some("big/escalate"));
    assert_eq!(result.reply.json(), Some(tool_reply()));
}

#[tokio::test]
async fn upstream_error_status_is_not_retried() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(ResponseTemplate::new(429).set_body_string("slow down"))
        .expect(1)
        .mount(&server)
        .await;

    let gate = ToolGate::new(ToolGateConfig::default());
    let result = gate
        .execute("req-3", &backend(&server), request_body("a/m1"))
        .await
        .unwrap();

    assert_eq!(result.reply.status, 429);
    assert_eq!(&result.reply.body[..], b"slow down");
    assert_eq!(result.outcome.retry_count, 0);
}

#[tokio::test]
async fn requests_without_tools_pass_straight_through() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path(CHAT_PATH))
        .respond_with(ResponseTemplate::new(200).set_body_json(text_reply()))
        .expect(1)
        .mount(&server)
        .await;

    let gate = ToolGate::new(ToolGateConfig::default());
    let body = Bytes::from_static(br#"{"model": "a/m1", "messages": [{"role": "user", "content": "hi"}]}"#);
    let result = gate.execute("req-4", &backend(&server), body.clone()).await.unwrap();

    assert!(!result.outcome.active);
    assert_eq!(result.outcome.had_valid_tool_calls, None);
    let requests = server.received_requests().await.unwrap();
    assert_eq!(requests[0].body, body.to_vec());
    assert_eq!(result.outcome.retry_count, 0);
}

#[tokio::test]
async fn unreachable_gateway_is_an_error() {
    let client = ReqwestChatBackend::build_client(Duration::from_secs(2)).unwrap();
    // 端口 9 (discard) 上通常没有服务监听
    let backend = ReqwestChatBackend::new(client, "http://127.0.0.1:9/v1/chat/completions");
    let gate = ToolGate::new(ToolGateConfig::default());
    assert!(gate.execute("req-5", &backend, request_body("a/m1")).await.is_err());
}
