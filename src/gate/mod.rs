//! # 工具调用闸门
//!
//! 对要求工具调用的非流式聊天补全，检查回复中是否真的有合法的工具调用；
//! 没有则追加纠正指令重试，仍然失败时可升级到指定模型再试一次。
//! 闸门从不向客户端报错：总是转发最后拿到的回复。

pub mod backend;

pub use backend::{BackendReply, ChatBackend, ReqwestChatBackend, collect_headers};

use bytes::Bytes;
use serde::Serialize;
use serde_json::{Value, json};

use crate::error::Result;
use crate::logging::{LogComponent, LogStage};
use crate::{linfo, lwarn};

/// 重试时追加的系统消息前缀
pub const CORRECTIVE_INSTRUCTION: &str = "Your previous reply did not include a valid tool call. \
Reply ONLY with a tool call that matches one of the provided tool schemas. Do not answer in plain text.";

/// 闸门配置
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolGateConfig {
    pub enabled: bool,
    pub max_retries: u32,
    pub escalate_model: Option<String>,
}

impl Default for ToolGateConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 1,
            escalate_model: None,
        }
    }
}

/// 单次请求的闸门结果
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolGateOutcome {
    pub active: bool,
    pub retry_count: u32,
    pub escalated: bool,
    pub escalate_model: Option<String>,
    /// 闸门未生效时为 `None`
    pub had_valid_tool_calls: Option<bool>,
}

/// 闸门执行结果
#[derive(Debug, Clone)]
pub struct GateResult {
    /// 转发给客户端的回复
    pub reply: BackendReply,
    pub outcome: ToolGateOutcome,
    /// 产生该回复的模型
    pub final_model: Option<String>,
}

/// 请求是否受闸门约束：非流式、`tools` 非空、`tool_choice` 不是 `"none"`
#[must_use]
pub fn gate_applies(body: &Value) -> bool {
    let streaming = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let has_tools = body
        .get("tools")
        .and_then(Value::as_array)
        .is_some_and(|tools| !tools.is_empty());
    let choice_none = body.get("tool_choice").and_then(Value::as_str) == Some("none");
    !streaming && has_tools && !choice_none
}

/// 请求中声明的函数名
#[must_use]
pub fn advertised_tool_names(body: &Value) -> Vec<String> {
    body.get("tools")
        .and_then(Value::as_array)
        .map(|tools| {
            tools
                .iter()
                .filter_map(|t| t.pointer("/function/name").and_then(Value::as_str))
                .map(ToString::to_string)
                .collect()
        })
        .unwrap_or_default()
}

/// 回复中是否有合法的工具调用
///
/// `choices[0].message.tool_calls` 非空，且每个调用都指定了函数名；
/// 请求声明了函数名时，调用的函数必须在其中。
#[must_use]
pub fn has_valid_tool_calls(reply: &Value, advertised: &[String]) -> bool {
    let Some(calls) = reply
        .pointer("/choices/0/message/tool_calls")
        .and_then(Value::as_array)
    else {
        return false;
    };
    !calls.is_empty()
        && calls.iter().all(|call| {
            call.pointer("/function/name")
                .and_then(Value::as_str)
                .is_some_and(|name| {
                    !name.is_empty()
                        && (advertised.is_empty() || advertised.iter().any(|a| a == name))
                })
        })
}

fn reply_is_valid(reply: &BackendReply, advertised: &[String]) -> bool {
    reply
        .json()
        .is_some_and(|json| has_valid_tool_calls(&json, advertised))
}

fn corrective_message(advertised: &[String]) -> Value {
    let content = if advertised.is_empty() {
        CORRECTIVE_INSTRUCTION.to_string()
    } else {
        format!(
            "{CORRECTIVE_INSTRUCTION} Available tools: {}.",
            advertised.join(", ")
        )
    };
    json!({"role": "system", "content": content})
}

fn encode(body: &Value) -> Result<Bytes> {
    Ok(Bytes::from(serde_json::to_vec(body)?))
}

/// 工具调用闸门
#[derive(Debug, Clone, Default)]
pub struct ToolGate {
    config: ToolGateConfig,
}

impl ToolGate {
    #[must_use]
    pub const fn new(config: ToolGateConfig) -> Self {
        Self { config }
    }

    #[must_use]
    pub const fn config(&self) -> &ToolGateConfig {
        &self.config
    }

    /// 发送请求并按闸门策略重试/升级
    ///
    /// 第一次请求原样发送 `body`，只有重试与升级才重新编码。
    /// 只有第一次请求的传输错误会返回 `Err`；之后的失败都转发上一次的回复。
    pub async fn execute(
        &self,
        request_id: &str,
        backend: &dyn ChatBackend,
        body: Bytes,
    ) -> Result<GateResult> {
        let parsed: Option<Value> = serde_json::from_slice(&body).ok();
        let current_model = parsed
            .as_ref()
            .and_then(|b| b.get("model"))
            .and_then(Value::as_str)
            .map(ToString::to_string);

        let gated = parsed.filter(|b| self.config.enabled && gate_applies(b));
        let Some(body_json) = gated else {
            let reply = backend.send(body).await?;
            return Ok(GateResult {
                reply,
                outcome: ToolGateOutcome::default(),
                final_model: current_model,
            });
        };

        let advertised = advertised_tool_names(&body_json);
        let mut outcome = ToolGateOutcome {
            active: true,
            ..ToolGateOutcome::default()
        };
        let mut reply = backend.send(body).await?;
        let mut final_model = current_model.clone();
        let mut valid = reply_is_valid(&reply, &advertised);
        let mut attempt_body = body_json;
        let mut transport_failed = false;

        while !valid && reply.is_success() && outcome.retry_count < self.config.max_retries {
            // 纠正提示只追加一次，后续重试沿用同一请求体
            if outcome.retry_count == 0 {
                if let Some(messages) = attempt_body
                    .get_mut("messages")
                    .and_then(Value::as_array_mut)
                {
                    messages.push(corrective_message(&advertised));
                }
            }
            outcome.retry_count += 1;
            linfo!(
                request_id,
                LogStage::UpstreamRequest,
                LogComponent::ToolGate,
                "retry",
                "回复缺少合法工具调用，重试",
                attempt = outcome.retry_count
            );
            match backend.send(encode(&attempt_body)?).await {
                Ok(next) => {
                    reply = next;
                    valid = reply_is_valid(&reply, &advertised);
                }
                Err(e) => {
                    lwarn!(
                        request_id,
                        LogStage::ResponseFailure,
                        LogComponent::ToolGate,
                        "retry_failed",
                        "重试请求失败，转发上一次回复",
                        error = e
                    );
                    transport_failed = true;
                    break;
                }
            }
        }

        let escalate_to = self
            .config
            .escalate_model
            .as_ref()
            .filter(|m| current_model.as_ref() != Some(*m));
        if let Some(escalate_model) = escalate_to {
            if !valid && !transport_failed && reply.is_success() {
                outcome.escalated = true;
                outcome.escalate_model = Some(escalate_model.clone());
                if let Some(obj) = attempt_body.as_object_mut() {
                    obj.insert("model".to_string(), Value::String(escalate_model.clone()));
                }
                linfo!(
                    request_id,
                    LogStage::UpstreamRequest,
                    LogComponent::ToolGate,
                    "escalate",
                    "升级到备用模型",
                    model = escalate_model
                );
                match backend.send(encode(&attempt_body)?).await {
                    Ok(next) => {
                        reply = next;
                        valid = reply_is_valid(&reply, &advertised);
                        final_model = Some(escalate_model.clone());
                    }
                    Err(e) => lwarn!(
                        request_id,
                        LogStage::ResponseFailure,
                        LogComponent::ToolGate,
                        "escalate_failed",
                        "升级请求失败，转发上一次回复",
                        error = e
                    ),
                }
            }
        }

        outcome.had_valid_tool_calls = Some(valid);
        Ok(GateResult {
            reply,
            outcome,
            final_model,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;

    /// 按顺序返回预设回复并记录请求体
    struct ScriptedBackend {
        replies: Mutex<Vec<Result<BackendReply>>>,
        seen: Mutex<Vec<Bytes>>,
    }

    impl ScriptedBackend {
        fn new(replies: Vec<Result<BackendReply>>) -> Self {
            Self {
                replies: Mutex::new(replies),
                seen: Mutex::new(Vec::new()),
            }
        }

        fn sent(&self, idx: usize) -> Value {
            serde_json::from_slice(&self.seen.lock().unwrap()[idx]).unwrap()
        }
    }

    #[async_trait]
    impl ChatBackend for ScriptedBackend {
        async fn send(&self, body: Bytes) -> Result<BackendReply> {
            self.seen.lock().unwrap().push(body);
            self.replies.lock().unwrap().remove(0)
        }
    }

    fn reply(json: Value) -> Result<BackendReply> {
        Ok(BackendReply {
            status: 200,
            headers: vec![("content-type".to_string(), "application/json".to_string())],
            body: Bytes::from(json.to_string()),
        })
    }

    fn text_reply() -> Result<BackendReply> {
        reply(json!({"choices": [{"message": {"role": "assistant", "content": "sure"}}]}))
    }

    fn tool_reply(name: &str) -> Result<BackendReply> {
        reply(json!({"choices": [{"message": {"tool_calls": [
            {"id": "c1", "type": "function", "function": {"name": name, "arguments": "{}"}}
        ]}}]}))
    }

    fn tool_request() -> Value {
        json!({
            "model": "a/b/c",
            "messages": [{"role": "user", "content": "weather?"}],
            "tools": [{"type": "function", "function": {"name": "get_weather", "parameters": {}}}]
        })
    }

    fn tool_request_bytes() -> Bytes {
        encode(&tool_request()).unwrap()
    }

    #[test]
    fn test_gate_applies() {
        assert!(gate_applies(&tool_request()));

        let mut streaming = tool_request();
        streaming["stream"] = json!(true);
        assert!(!gate_applies(&streaming));

        let mut none = tool_request();
        none["tool_choice"] = json!("none");
        assert!(!gate_applies(&none));

        let mut required = tool_request();
        required["tool_choice"] = json!("required");
        assert!(gate_applies(&required));

        assert!(!gate_applies(&json!({"tools": []})));
    }

    #[test]
    fn test_tool_call_validation() {
        let names = vec!["get_weather".to_string()];
        let valid = tool_reply("get_weather").unwrap().json().unwrap();
        let unknown = tool_reply("rm_rf").unwrap().json().unwrap();
        assert!(has_valid_tool_calls(&valid, &names));
        assert!(!has_valid_tool_calls(&unknown, &names));
        assert!(has_valid_tool_calls(&unknown, &[]));
        assert!(!has_valid_tool_calls(&json!({"choices": []}), &names));
    }

    #[tokio::test]
    async fn test_valid_first_reply_is_not_retried() {
        let backend = ScriptedBackend::new(vec![tool_reply("get_weather")]);
        let result = ToolGate::default()
            .execute("t", &backend, tool_request_bytes())
            .await
            .unwrap();
        assert!(result.outcome.active);
        assert_eq!(result.outcome.had_valid_tool_calls, Some(true));
        assert_eq!(result.outcome.retry_count, 0);
        assert_eq!(backend.seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_retry_appends_corrective_message() {
        let backend = ScriptedBackend::new(vec![text_reply(), tool_reply("get_weather")]);
        let result = ToolGate::default()
            .execute("t", &backend, tool_request_bytes())
            .await
            .unwrap();
        assert_eq!(result.outcome.retry_count, 1);
        assert_eq!(result.outcome.had_valid_tool_calls, Some(true));

        let retry = backend.sent(1);
        let retry_messages = retry["messages"].as_array().unwrap();
        assert_eq!(retry_messages.len(), 2);
        assert_eq!(retry_messages[1]["role"], "system");
    }

    #[tokio::test]
    async fn test_corrective_message_appended_once() {
        let backend = ScriptedBackend::new(vec![text_reply(), text_reply(), text_reply()]);
        let gate = ToolGate::new(ToolGateConfig {
            max_retries: 2,
            ..ToolGateConfig::default()
        });
        let result = gate.execute("t", &backend, tool_request_bytes()).await.unwrap();
        assert_eq!(result.outcome.retry_count, 2);
        assert_eq!(result.outcome.had_valid_tool_calls, Some(false));
        assert_eq!(backend.sent(2)["messages"].as_array().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_first_attempt_bytes_sent_verbatim() {
        let raw = Bytes::from_static(
            br#"{ "zeta": 1, "model": "m", "messages": [], "tools": [{"function": {"name": "f"}}] }"#,
        );
        let backend = ScriptedBackend::new(vec![tool_reply("f")]);
        ToolGate::default().execute("t", &backend, raw.clone()).await.unwrap();
        assert_eq!(backend.seen.lock().unwrap()[0], raw);

        let plain = Bytes::from_static(br#"{ "zeta": 1, "model": "m" }"#);
        let backend = ScriptedBackend::new(vec![text_reply()]);
        let result = ToolGate::default().execute("t", &backend, plain.clone()).await.unwrap();
        assert_eq!(backend.seen.lock().unwrap()[0], plain);
        assert_eq!(result.outcome.had_valid_tool_calls, None);
    }

    #[tokio::test]
    async fn test_escalation_after_retries() {
        let backend = ScriptedBackend::new(vec![text_reply(), text_reply(), tool_reply("get_weather")]);
        let gate = ToolGate::new(ToolGateConfig {
            escalate_model: Some("big/model".to_string()),
            ..ToolGateConfig::default()
        });
        let result = gate.execute("t", &backend, tool_request_bytes()).await.unwrap();
        assert!(result.outcome.escalated);
        assert_eq!(result.outcome.escalate_model.as_deref(), Some("big/model"));
        assert_eq!(result.final_model.as_deref(), Some("big/model"));
        assert_eq!(result.outcome.had_valid_tool_calls, Some(true));
        assert_eq!(backend.sent(2)["model"], "big/model");
    }

    #[tokio::test]
    async fn test_no_escalation_to_same_model() {
        let backend = ScriptedBackend::new(vec![text_reply(), text_reply()]);
        let gate = ToolGate::new(ToolGateConfig {
            escalate_model: Some("a/b/c".to_string()),
            ..ToolGateConfig::default()
        });
        let result = gate.execute("t", &backend, tool_request_bytes()).await.unwrap();
        assert!(!result.outcome.escalated);
        assert_eq!(result.outcome.had_valid_tool_calls, Some(false));
    }

    #[tokio::test]
    async fn test_transport_failure_on_retry_forwards_previous() {
        let backend = ScriptedBackend::new(vec![
            text_reply(),
            Err(crate::error::ProxyError::network("boom")),
        ]);
        let result = ToolGate::default()
            .execute("t", &backend, tool_request_bytes())
            .await
            .unwrap();
        assert_eq!(result.reply.json().unwrap()["choices"][0]["message"]["content"], "sure");
        assert_eq!(result.outcome.had_valid_tool_calls, Some(false));
    }

    #[tokio::test]
    async fn test_first_transport_failure_is_an_error() {
        let backend = ScriptedBackend::new(vec![Err(crate::error::ProxyError::network("down"))]);
        assert!(ToolGate::default()
            .execute("t", &backend, tool_request_bytes())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_disabled_gate_sends_once() {
        let backend = ScriptedBackend::new(vec![text_reply()]);
        let gate = ToolGate::new(ToolGateConfig {
            enabled: false,
            ..ToolGateConfig::default()
        });
        let result = gate.execute("t", &backend, tool_request_bytes()).await.unwrap();
        assert!(!result.outcome.active);
        assert_eq!(backend.seen.lock().unwrap().len(), 1);
    }
}
