//! # 网关 WebSocket 消息
//!
//! 网关的 WebSocket 协议是 `{type, ...}` 形式的 JSON 文本帧：
//! `req`（客户端发起的方法调用）、`res`（调用结果）与 `event`（服务端推送）。

use serde::Deserialize;
use serde_json::Value;

/// 客户端发送聊天消息的方法名
pub const CHAT_SEND_METHOD: &str = "chat.send";
/// 服务端聊天事件名
pub const CHAT_EVENT: &str = "chat";

/// 网关消息
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum GatewayMessage {
    Req {
        #[serde(default)]
        id: Option<Value>,
        method: String,
        #[serde(default)]
        params: Value,
    },
    Res {
        #[serde(default)]
        id: Option<Value>,
        #[serde(default)]
        ok: Option<bool>,
        #[serde(default)]
        payload: Value,
    },
    Event {
        event: String,
        #[serde(default)]
        payload: Value,
    },
}

/// 客户端的一次聊天发送
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatSend {
    pub session_key: Option<String>,
    pub message: String,
}

/// 服务端聊天事件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChatEvent {
    pub session_key: Option<String>,
    pub state: Option<String>,
}

impl ChatEvent {
    #[must_use]
    pub fn is_final(&self) -> bool {
        self.state.as_deref() == Some("final")
    }
}

impl GatewayMessage {
    /// 解析文本帧；不是合法消息时返回 `None`
    #[must_use]
    pub fn parse(text: &str) -> Option<Self> {
        serde_json::from_str(text).ok()
    }

    /// 提取 `chat.send` 请求
    #[must_use]
    pub fn as_chat_send(&self) -> Option<ChatSend> {
        match self {
            Self::Req { method, params, .. } if method == CHAT_SEND_METHOD => {
                let message = match params.get("message") {
                    Some(Value::String(text)) => text.clone(),
                    Some(Value::Array(parts)) => parts
                        .iter()
                        .filter(|p| p.get("type").and_then(Value::as_str) == Some("text"))
                        .filter_map(|p| p.get("text").and_then(Value::as_str))
                        .collect(),
                    _ => String::new(),
                };
                Some(ChatSend {
                    session_key: string_field(params, "sessionKey"),
                    message,
                })
            }
            _ => None,
        }
    }

    /// 提取聊天事件
    #[must_use]
    pub fn as_chat_event(&self) -> Option<ChatEvent> {
        match self {
            Self::Event { event, payload } if event == CHAT_EVENT => Some(ChatEvent {
                session_key: string_field(payload, "sessionKey"),
                state: string_field(payload, "state"),
            }),
            _ => None,
        }
    }
}

fn string_field(value: &Value, key: &str) -> Option<String> {
    value.get(key).and_then(Value::as_str).map(ToString::to_string)
}
